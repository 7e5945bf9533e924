//! State publisher block: holds device values while its child runs.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use crate::devices::claim::ClaimSymbol;
use crate::devices::tree::{path_key, NodePath};
use crate::devices::value::NodeValue;
use crate::error::{AppResult, EngineError};
use crate::fiber::diagnostic::Diagnostic;
use crate::fiber::eval::{EvalStack, Evaluable};
use crate::fiber::program::{
    Block, BlockDuration, BoxProgram, ExecutionEvent, Program, ProgramHandle, ProgramLocation,
    ProgramMessage, ProgramPoint,
};
use crate::runner::DeclarationId;

/// Publishes node assignments for the lifetime of its child.
#[derive(Debug)]
pub struct StatePublisherBlock {
    assignments: Vec<(NodePath, Evaluable)>,
    child: Arc<dyn Block>,
}

impl StatePublisherBlock {
    /// Create a publisher of `assignments` around `child`.
    pub fn new(assignments: Vec<(NodePath, Evaluable)>, child: Arc<dyn Block>) -> Self {
        Self { assignments, child }
    }
}

impl Block for StatePublisherBlock {
    fn create_program(self: Arc<Self>, handle: ProgramHandle) -> BoxProgram {
        Box::new(StatePublisherProgram {
            block: self,
            handle,
            child: None,
            declaration: None,
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

        Ok(ProgramPoint::State { child })
    }

    fn export(&self) -> serde_json::Value {
        let values: Vec<serde_json::Value> = self
            .assignments
            .iter()
            .map(|(path, value)| serde_json::json!([path, value.export()]))
            .collect();

        serde_json::json!({
            "namespace": "devices",
            "values": values,
            "child": self.child.export(),
            "duration": self.duration(),
        })
    }
}

struct StatePublisherProgram {
    block: Arc<StatePublisherBlock>,
    handle: ProgramHandle,
    child: Option<BoxProgram>,
    declaration: Option<DeclarationId>,
    errors: Vec<Diagnostic>,
}

impl StatePublisherProgram {
    fn child(&mut self) -> AppResult<&mut BoxProgram> {
        self.child.as_mut().ok_or(EngineError::NotStarted)
    }

    fn evaluate(&mut self, stack: &EvalStack) -> Vec<(NodePath, NodeValue)> {
        let context = self.handle.context();
        let mut values = Vec::with_capacity(self.block.assignments.len());

        for (path, value) in &self.block.assignments {
            let key = path_key(path);

            match context.devices.tree().find(path) {
                Some(node) if node.is_writable() => {}
                Some(_) => {
                    self.errors
                        .push(Diagnostic::error(format!("Node '{key}' is not writable")));
                    continue;
                }
                None => {
                    self.errors
                        .push(Diagnostic::error(format!("Node '{key}' was not found")));
                    continue;
                }
            }

            let evaluated = value
                .evaluate(&context.engine, stack)
                .and_then(|value| {
                    NodeValue::from_dynamic(&value)
                        .ok_or_else(|| format!("Value {value} cannot be written to a node"))
                });

            match evaluated {
                Ok(value) => values.push((path.clone(), value)),
                Err(message) => self
                    .errors
                    .push(Diagnostic::error(format!("Value of '{key}': {message}"))),
            }
        }

        values
    }
}

#[async_trait]
impl Program for StatePublisherProgram {
    fn busy(&self) -> bool {
        self.child.as_ref().is_some_and(|child| child.busy())
    }

    fn halt(&mut self) -> AppResult<()> {
        self.child()?.halt()?;

        if let Some(declaration) = self.declaration {
            let runner = &self.handle.context().devices;
            runner.set_active(declaration, false);
            runner.update();
        }

        Ok(())
    }

    fn pause(&mut self) -> AppResult<()> {
        self.child()?.pause()
    }

    fn resume(&mut self) -> AppResult<()> {
        self.child()?.resume()
    }

    fn jump(&mut self, point: ProgramPoint) -> AppResult<()> {
        match point {
            ProgramPoint::State { child: Some(child) } => self.child()?.jump(*child),
            other => Err(EngineError::InvalidPoint(format!("{other:?} is not a state point"))),
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
            Some(ProgramPoint::State { child }) => ProgramPoint::into_child(child),
            Some(other) => {
                return Err(EngineError::InvalidPoint(format!("{other:?} is not a state point")));
            }
            None => None,
        };

        let values = self.evaluate(&stack);
        let declaration = self.handle.context().devices.add(symbol.clone(), values);
        self.declaration = Some(declaration);

        debug!(path = ?self.handle.path(), ?declaration, "State published");

        let mut child = self.block.child.clone().create_program(self.handle.child(0));
        child.run(child_point, stack, symbol.child())?;
        self.child = Some(child);

        Ok(())
    }

    async fn next_event(&mut self) -> AppResult<Option<ExecutionEvent>> {
        let Some(child_event) = self.child()?.next_event().await? else {
            return Ok(None);
        };

        let mut state_terminated = child_event.state_terminated;

        if child_event.terminated {
            if let Some(declaration) = self.declaration.take() {
                self.handle.context().devices.remove(declaration);
                debug!(path = ?self.handle.path(), ?declaration, "State released");
            }

            state_terminated = true;
        }

        let mut errors = std::mem::take(&mut self.errors);
        errors.extend(child_event.errors);

        Ok(Some(ExecutionEvent {
            location: Some(ProgramLocation::State {
                child: child_event.location.map(Box::new),
            }),
            errors,
            state_terminated,
            ..child_event
        }))
    }
}

impl Drop for StatePublisherProgram {
    fn drop(&mut self) {
        if let Some(declaration) = self.declaration.take() {
            self.handle.context().devices.remove(declaration);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::tree::parse_path;
    use crate::fiber::blocks::testing::{drain, handle_with_pump, seconds};
    use crate::fiber::blocks::timer::TimerBlock;

    fn speed(value: f64) -> Vec<(NodePath, Evaluable)> {
        vec![(parse_path("pump.speed"), seconds(value))]
    }

    #[tokio::test(start_paused = true)]
    async fn test_declaration_lifecycle() {
        let handle = handle_with_pump().await;
        let runner = handle.context().devices.clone();

        let block = Arc::new(StatePublisherBlock::new(speed(5.0), Arc::new(TimerBlock::new(seconds(1.0)))));
        let mut program = block.create_program(handle);
        program.run(None, EvalStack::new(), ClaimSymbol::root()).unwrap();

        let declarations = runner.declarations();
        assert_eq!(declarations.len(), 1);
        assert_eq!(declarations[0].assignments()[0].1, NodeValue::Number(5.0));
        assert!(!declarations[0].applied());

        let events = drain(program.as_mut()).await;
        assert!(!events[0].state_terminated);
        assert!(events.last().unwrap().state_terminated);
        assert!(runner.declarations().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_halt_deactivates_declaration() {
        let handle = handle_with_pump().await;
        let runner = handle.context().devices.clone();

        let block = Arc::new(StatePublisherBlock::new(speed(5.0), Arc::new(TimerBlock::new(seconds(10.0)))));
        let mut program = block.create_program(handle);
        program.run(None, EvalStack::new(), ClaimSymbol::root()).unwrap();
        program.next_event().await.unwrap();

        program.halt().unwrap();
        assert!(!runner.declarations()[0].active());
    }

    #[tokio::test]
    async fn test_unknown_node_is_diagnosed() {
        let handle = handle_with_pump().await;
        let runner = handle.context().devices.clone();

        let assignments = vec![
            (parse_path("pump.missing"), seconds(1.0)),
            (parse_path("pump.speed"), seconds(2.0)),
        ];
        let block = Arc::new(StatePublisherBlock::new(assignments, Arc::new(TimerBlock::new(seconds(0.0)))));
        let mut program = block.create_program(handle);
        program.run(None, EvalStack::new(), ClaimSymbol::root()).unwrap();

        assert_eq!(runner.declarations()[0].assignments().len(), 1);

        let events = drain(program.as_mut()).await;
        assert_eq!(events[0].errors.len(), 1);
        assert!(events[0].errors[0].message.contains("pump.missing"));
    }
}
