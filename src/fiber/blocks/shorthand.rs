//! Shorthand block: a named, reusable block body called with an argument.

use async_trait::async_trait;
use rhai::Dynamic;
use std::sync::Arc;

use crate::devices::claim::ClaimSymbol;
use crate::error::{AppResult, EngineError};
use crate::fiber::diagnostic::Diagnostic;
use crate::fiber::eval::{EvalEnv, EvalStack, EvalSymbol, Evaluable, ARG};
use crate::fiber::program::{
    Block, BlockDuration, BoxProgram, ExecutionEvent, Program, ProgramHandle, ProgramLocation,
    ProgramMessage, ProgramPoint,
};

/// Call of a shorthand definition.
///
/// The argument is evaluated when the call starts and bound as `arg` under the
/// definition's symbol, where expressions of the definition body read it.
#[derive(Debug)]
pub struct ShorthandBlock {
    name: String,
    argument: Evaluable,
    child: Arc<dyn Block>,
    symbol: EvalSymbol,
}

impl ShorthandBlock {
    /// Create a call of shorthand `name`, identified by `symbol`, wrapping its
    /// prepared body.
    pub fn new(name: impl Into<String>, symbol: EvalSymbol, argument: Evaluable, child: Arc<dyn Block>) -> Self {
        Self {
            name: name.into(),
            argument,
            child,
            symbol,
        }
    }

    /// Shorthand name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Block for ShorthandBlock {
    fn create_program(self: Arc<Self>, handle: ProgramHandle) -> BoxProgram {
        Box::new(ShorthandProgram {
            block: self,
            handle,
            child: None,
            errors: Vec::new(),
        })
    }

    fn duration(&self) -> BlockDuration {
        self.child.duration()
    }

    fn import_point(&self, value: &serde_json::Value) -> AppResult<ProgramPoint> {
        let child = match value.get("child") {
            None | Some(serde_json::Value::Null) => None,
            Some(child) => Some(Box::new(self.child.import_point(child)?)),
        };

        Ok(ProgramPoint::Shorthand { child })
    }

    fn export(&self) -> serde_json::Value {
        serde_json::json!({
            "namespace": "shorthands",
            "name": self.name,
            "argument": self.argument.export(),
            "child": self.child.export(),
            "duration": self.duration(),
        })
    }
}

struct ShorthandProgram {
    block: Arc<ShorthandBlock>,
    handle: ProgramHandle,
    child: Option<BoxProgram>,
    errors: Vec<Diagnostic>,
}

impl ShorthandProgram {
    fn child(&mut self) -> AppResult<&mut BoxProgram> {
        self.child.as_mut().ok_or(EngineError::NotStarted)
    }
}

#[async_trait]
impl Program for ShorthandProgram {
    fn busy(&self) -> bool {
        self.child.as_ref().is_some_and(|child| child.busy())
    }

    fn halt(&mut self) -> AppResult<()> {
        self.child()?.halt()
    }

    fn pause(&mut self) -> AppResult<()> {
        self.child()?.pause()
    }

    fn resume(&mut self) -> AppResult<()> {
        self.child()?.resume()
    }

    fn jump(&mut self, point: ProgramPoint) -> AppResult<()> {
        match point {
            ProgramPoint::Shorthand { child: Some(child) } => self.child()?.jump(*child),
            other => Err(EngineError::InvalidPoint(format!("{other:?} is not a shorthand point"))),
        }
    }

    fn import_message(&mut self, message: ProgramMessage) -> AppResult<()> {
        match message {
            ProgramMessage::Jump { point } => {
                let point = self.block.import_point(&point)?;
                self.jump(point)
            }
            other => self.child()?.import_message(other),
        }
    }

    fn child_mut(&mut self, _block_key: usize, _exec_key: usize) -> Option<&mut BoxProgram> {
        self.child.as_mut()
    }

    fn run(&mut self, point: Option<ProgramPoint>, stack: EvalStack, symbol: ClaimSymbol) -> AppResult<()> {
        if self.child.is_some() {
            return Err(EngineError::AlreadyStarted);
        }

        let child_point = match point {
            Some(ProgramPoint::Shorthand { child }) => ProgramPoint::into_child(child),
            Some(other) => {
                return Err(EngineError::InvalidPoint(format!("{other:?} is not a shorthand point")));
            }
            None => None,
        };

        let engine = &self.handle.context().engine;

        let argument = match self.block.argument.evaluate(engine, &stack) {
            Ok(value) => value,
            Err(message) => {
                self.errors.push(Diagnostic::error(format!(
                    "Argument of shorthand '{}': {message}",
                    self.block.name
                )));
                Dynamic::UNIT
            }
        };

        let stack = stack.with(self.block.symbol, EvalEnv::from([(ARG.to_string(), argument)]));

        let mut child = self.block.child.clone().create_program(self.handle.child(0));
        child.run(child_point, stack, symbol.child())?;
        self.child = Some(child);

        Ok(())
    }

    async fn next_event(&mut self) -> AppResult<Option<ExecutionEvent>> {
        let Some(child_event) = self.child()?.next_event().await? else {
            return Ok(None);
        };

        let mut errors = std::mem::take(&mut self.errors);
        errors.extend(child_event.errors);

        Ok(Some(ExecutionEvent {
            location: Some(ProgramLocation::Shorthand {
                child: child_event.location.map(Box::new),
            }),
            errors,
            ..child_event
        }))
    }
}
