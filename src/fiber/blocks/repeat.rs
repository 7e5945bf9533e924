//! Repeat block: runs its child a number of times, binding `index`.

use async_trait::async_trait;
use rhai::Dynamic;
use std::sync::Arc;
use tracing::debug;

use crate::devices::claim::ClaimSymbol;
use crate::error::{AppResult, EngineError};
use crate::fiber::diagnostic::Diagnostic;
use crate::fiber::eval::{dynamic_as_f64, EvalEnv, EvalStack, EvalSymbol, Evaluable};
use crate::fiber::program::{
    Block, BlockDuration, BoxProgram, ContainerMode, ExecutionEvent, Program, ProgramHandle,
    ProgramLocation, ProgramMessage, ProgramPoint,
};

/// Repeat `child` `count` times.
#[derive(Debug)]
pub struct RepeatBlock {
    count: Evaluable,
    child: Arc<dyn Block>,
    symbol: EvalSymbol,
}

impl RepeatBlock {
    /// Create a repeat block.
    pub fn new(count: Evaluable, child: Arc<dyn Block>) -> Self {
        Self {
            count,
            child,
            symbol: EvalSymbol::new(),
        }
    }

    fn constant_count(&self) -> Option<usize> {
        self.count
            .constant()
            .and_then(dynamic_as_f64)
            .filter(|count| count.is_finite() && *count >= 0.0)
            .map(|count| count as usize)
    }
}

impl Block for RepeatBlock {
    fn create_program(self: Arc<Self>, handle: ProgramHandle) -> BoxProgram {
        Box::new(RepeatProgram {
            block: self,
            handle,
            started: false,
            stack: EvalStack::new(),
            symbol: None,
            count: 0,
            iteration: 0,
            child: None,
            last_child_event: None,
            mode: ContainerMode::Normal,
            point: None,
            retrigger: false,
            errors: Vec::new(),
            finished: false,
        })
    }

    fn duration(&self) -> BlockDuration {
        match self.constant_count() {
            Some(count) => self.child.duration().times(count),
            None => BlockDuration::Unknown,
        }
    }

    fn import_point(&self, value: &serde_json::Value) -> AppResult<ProgramPoint> {
        let iteration = value
            .get("iteration")
            .and_then(serde_json::Value::as_u64)
            .ok_or_else(|| EngineError::InvalidPoint("repeat point requires an iteration".to_string()))?
            as usize;

        if self.constant_count().is_some_and(|count| iteration >= count) {
            return Err(EngineError::InvalidPoint(format!(
                "repeat iteration {iteration} is out of range"
            )));
        }

        let child = match value.get("child") {
            None | Some(serde_json::Value::Null) => None,
            Some(child) => Some(Box::new(self.child.import_point(child)?)),
        };

        Ok(ProgramPoint::Repeat { iteration, child })
    }

    fn export(&self) -> serde_json::Value {
        serde_json::json!({
            "namespace": "repeat",
            "count": self.count.export(),
            "child": self.child.export(),
            "duration": self.duration(),
        })
    }
}

struct RepeatProgram {
    block: Arc<RepeatBlock>,
    handle: ProgramHandle,
    started: bool,
    stack: EvalStack,
    symbol: Option<ClaimSymbol>,
    count: usize,
    iteration: usize,
    child: Option<BoxProgram>,
    last_child_event: Option<ExecutionEvent>,
    mode: ContainerMode,
    point: Option<(usize, Option<ProgramPoint>)>,
    retrigger: bool,
    errors: Vec<Diagnostic>,
    finished: bool,
}

impl RepeatProgram {
    fn location(&self, child: Option<&ExecutionEvent>) -> ProgramLocation {
        ProgramLocation::Repeat {
            iteration: self.iteration,
            count: Some(self.count),
            mode: self.mode,
            child: child.and_then(|event| event.location.clone()).map(Box::new),
        }
    }

    fn wrap(&mut self, child_event: &ExecutionEvent, terminated: bool) -> ExecutionEvent {
        let mut errors = std::mem::take(&mut self.errors);
        errors.extend(child_event.errors.iter().cloned());

        ExecutionEvent {
            location: Some(self.location(Some(child_event))),
            errors,
            stopped: child_event.stopped,
            terminated,
            state_terminated: child_event.state_terminated,
        }
    }

    fn start_child(&mut self, iteration: usize, point: Option<ProgramPoint>) -> AppResult<()> {
        let symbol = self.symbol.as_ref().ok_or(EngineError::NotStarted)?.child();
        let env = EvalEnv::from([("index".to_string(), Dynamic::from_int(iteration as i64))]);
        let stack = self.stack.with(self.block.symbol, env);

        debug!(path = ?self.handle.path(), iteration, count = self.count, "Starting repeat iteration");

        let mut child = self.block.child.clone().create_program(self.handle.child(0));
        child.run(point, stack, symbol)?;

        self.iteration = iteration;
        self.child = Some(child);
        self.last_child_event = None;
        Ok(())
    }

    fn finish(&mut self) -> ExecutionEvent {
        self.finished = true;

        ExecutionEvent {
            location: Some(self.location(None)),
            errors: std::mem::take(&mut self.errors),
            stopped: true,
            terminated: true,
            state_terminated: false,
        }
    }
}

#[async_trait]
impl Program for RepeatProgram {
    fn busy(&self) -> bool {
        self.mode == ContainerMode::Halting || self.child.as_ref().is_some_and(|child| child.busy())
    }

    fn halt(&mut self) -> AppResult<()> {
        if self.busy() || self.mode != ContainerMode::Normal {
            return Err(EngineError::transition(format!(
                "cannot halt repeat (mode {:?}, busy {})",
                self.mode,
                self.busy()
            )));
        }

        match &mut self.child {
            Some(child) => {
                child.halt()?;
                self.mode = ContainerMode::Halting;
            }
            None => self.mode = ContainerMode::Halted,
        }

        self.point = None;
        Ok(())
    }

    fn pause(&mut self) -> AppResult<()> {
        let child_stopped = self
            .last_child_event
            .as_ref()
            .map_or(true, |event| event.stopped);

        match &mut self.child {
            Some(child) if !child_stopped => child.pause(),
            _ => {
                self.retrigger = true;
                Ok(())
            }
        }
    }

    fn resume(&mut self) -> AppResult<()> {
        match &mut self.child {
            Some(child) => child.resume(),
            None => Ok(()),
        }
    }

    fn jump(&mut self, point: ProgramPoint) -> AppResult<()> {
        let (iteration, child_point) = match point {
            ProgramPoint::Repeat { iteration, child } => (iteration, ProgramPoint::into_child(child)),
            other => {
                return Err(EngineError::InvalidPoint(format!("{other:?} is not a repeat point")));
            }
        };

        if self.child.is_none() {
            self.point = Some((iteration, child_point));
            return Ok(());
        }

        // A jump whose halt is still in progress is retargeted.
        if self.mode == ContainerMode::Halting && self.point.is_some() {
            self.point = Some((iteration, child_point));
            return Ok(());
        }

        if iteration == self.iteration && self.mode == ContainerMode::Normal {
            return match (self.child.as_mut(), child_point) {
                (Some(child), Some(child_point)) => child.jump(child_point),
                _ => Ok(()),
            };
        }

        if self.busy() || self.mode != ContainerMode::Normal {
            return Err(EngineError::transition(format!(
                "cannot jump in repeat (mode {:?}, busy {})",
                self.mode,
                self.busy()
            )));
        }

        if let Some(child) = self.child.as_mut() {
            child.halt()?;
        }

        self.mode = ContainerMode::Halting;
        self.point = Some((iteration, child_point));
        Ok(())
    }

    fn import_message(&mut self, message: ProgramMessage) -> AppResult<()> {
        match message {
            ProgramMessage::Halt => self.halt(),
            ProgramMessage::Pause => self.pause(),
            ProgramMessage::Resume => self.resume(),
            ProgramMessage::Jump { point } => {
                let point = self.block.import_point(&point)?;
                self.jump(point)
            }
            ProgramMessage::SetInterrupt { .. } => {
                Err(EngineError::Unsupported("setInterrupt".to_string()))
            }
        }
    }

    fn child_mut(&mut self, _block_key: usize, exec_key: usize) -> Option<&mut BoxProgram> {
        if exec_key == self.iteration {
            self.child.as_mut()
        } else {
            None
        }
    }

    fn run(&mut self, point: Option<ProgramPoint>, stack: EvalStack, symbol: ClaimSymbol) -> AppResult<()> {
        if self.started {
            return Err(EngineError::AlreadyStarted);
        }

        self.started = true;
        self.symbol = Some(symbol);

        let engine = &self.handle.context().engine;

        self.count = match self.block.count.evaluate(engine, &stack) {
            Ok(value) => match dynamic_as_f64(&value) {
                Some(count) if count.is_finite() && count >= 0.0 => count as usize,
                _ => {
                    self.errors
                        .push(Diagnostic::error(format!("Invalid repeat count: {value}")));
                    0
                }
            },
            Err(message) => {
                self.errors.push(Diagnostic::error(message));
                0
            }
        };

        self.stack = stack;
        self.point = match point {
            Some(ProgramPoint::Repeat { iteration, child }) => {
                Some((iteration, ProgramPoint::into_child(child)))
            }
            Some(other) => {
                return Err(EngineError::InvalidPoint(format!("{other:?} is not a repeat point")));
            }
            None => Some((0, None)),
        };

        Ok(())
    }

    async fn next_event(&mut self) -> AppResult<Option<ExecutionEvent>> {
        if !self.started {
            return Err(EngineError::NotStarted);
        }

        loop {
            if self.finished {
                return Ok(None);
            }

            if std::mem::take(&mut self.retrigger) {
                if let Some(last) = self.last_child_event.clone() {
                    return Ok(Some(self.wrap(&last, false)));
                }
            }

            if self.child.is_none() {
                if self.mode == ContainerMode::Halted && self.point.is_none() {
                    return Ok(Some(self.finish()));
                }

                let (iteration, child_point) = self.point.take().unwrap_or((self.iteration + 1, None));

                if iteration >= self.count {
                    return Ok(Some(self.finish()));
                }

                self.mode = ContainerMode::Normal;
                self.start_child(iteration, child_point)?;
            }

            let Some(child) = self.child.as_mut() else {
                continue;
            };

            match child.next_event().await? {
                Some(child_event) => {
                    let terminated = child_event.terminated
                        && match &self.point {
                            Some((iteration, _)) => *iteration >= self.count,
                            None => {
                                self.mode != ContainerMode::Normal || self.iteration + 1 >= self.count
                            }
                        };

                    if child_event.terminated && self.mode == ContainerMode::Halting {
                        self.mode = ContainerMode::Halted;
                    }

                    let event = self.wrap(&child_event, terminated);
                    self.last_child_event = Some(child_event);
                    self.finished = terminated;

                    return Ok(Some(event));
                }
                None => {
                    self.child = None;
                    self.last_child_event = None;
                }
            }
        }
    }
}
