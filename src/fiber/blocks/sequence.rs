//! Sequence block: runs its children one after the other.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use crate::devices::claim::ClaimSymbol;
use crate::error::{AppResult, EngineError};
use crate::fiber::eval::EvalStack;
use crate::fiber::program::{
    Block, BlockDuration, BoxProgram, ContainerMode, ExecutionEvent, Program, ProgramHandle,
    ProgramLocation, ProgramMessage, ProgramPoint,
};

/// Ordered list of child blocks.
#[derive(Debug)]
pub struct SequenceBlock {
    children: Vec<Arc<dyn Block>>,
}

impl SequenceBlock {
    /// Create a sequence of `children`.
    pub fn new(children: Vec<Arc<dyn Block>>) -> Self {
        Self { children }
    }

    /// Child blocks.
    pub fn children(&self) -> &[Arc<dyn Block>] {
        &self.children
    }
}

impl Block for SequenceBlock {
    fn create_program(self: Arc<Self>, handle: ProgramHandle) -> BoxProgram {
        Box::new(SequenceProgram {
            block: self,
            handle,
            started: false,
            stack: EvalStack::new(),
            symbol: None,
            index: 0,
            child: None,
            last_child_event: None,
            mode: ContainerMode::Normal,
            interrupting: false,
            point: None,
            retrigger: false,
            finished: false,
        })
    }

    fn duration(&self) -> BlockDuration {
        self.children
            .iter()
            .fold(BlockDuration::ZERO, |total, child| total.then(child.duration()))
    }

    fn import_point(&self, value: &serde_json::Value) -> AppResult<ProgramPoint> {
        let index = value
            .get("index")
            .and_then(serde_json::Value::as_u64)
            .ok_or_else(|| EngineError::InvalidPoint("sequence point requires an index".to_string()))?
            as usize;

        let child_block = self.children.get(index).ok_or_else(|| {
            EngineError::InvalidPoint(format!("sequence index {index} is out of range"))
        })?;

        let child = match value.get("child") {
            None | Some(serde_json::Value::Null) => None,
            Some(child) => Some(Box::new(child_block.import_point(child)?)),
        };

        Ok(ProgramPoint::Sequence { index, child })
    }

    fn export(&self) -> serde_json::Value {
        serde_json::json!({
            "namespace": "sequence",
            "children": self.children.iter().map(|child| child.export()).collect::<Vec<_>>(),
            "duration": self.duration(),
        })
    }
}

struct SequenceProgram {
    block: Arc<SequenceBlock>,
    handle: ProgramHandle,
    started: bool,
    stack: EvalStack,
    symbol: Option<ClaimSymbol>,
    index: usize,
    child: Option<BoxProgram>,
    last_child_event: Option<ExecutionEvent>,
    mode: ContainerMode,
    interrupting: bool,
    point: Option<(usize, Option<ProgramPoint>)>,
    retrigger: bool,
    finished: bool,
}

impl SequenceProgram {
    fn len(&self) -> usize {
        self.block.children.len()
    }

    fn location(&self, child: Option<&ExecutionEvent>) -> ProgramLocation {
        ProgramLocation::Sequence {
            index: self.index,
            interrupting: self.interrupting,
            mode: self.mode,
            child: child
                .and_then(|event| event.location.clone())
                .map(Box::new),
        }
    }

    /// Re-wrap a child event with this sequence's location.
    fn wrap(&self, child_event: &ExecutionEvent, terminated: bool) -> ExecutionEvent {
        ExecutionEvent {
            location: Some(self.location(Some(child_event))),
            errors: child_event.errors.clone(),
            stopped: child_event.stopped,
            terminated,
            state_terminated: child_event.state_terminated,
        }
    }

    fn start_child(&mut self, index: usize, point: Option<ProgramPoint>) -> AppResult<()> {
        let symbol = self.symbol.as_ref().ok_or(EngineError::NotStarted)?.child();
        let block = self.block.children[index].clone();
        let mut child = block.create_program(self.handle.child(index));

        debug!(path = ?self.handle.path(), index, "Starting sequence child");

        child.run(point, self.stack.clone(), symbol)?;

        self.index = index;
        self.child = Some(child);
        self.last_child_event = None;
        Ok(())
    }

    fn finish(&mut self) -> ExecutionEvent {
        self.finished = true;

        ExecutionEvent {
            location: Some(self.location(None)),
            stopped: true,
            terminated: true,
            ..ExecutionEvent::default()
        }
    }
}

#[async_trait]
impl Program for SequenceProgram {
    fn busy(&self) -> bool {
        self.mode == ContainerMode::Halting || self.child.as_ref().is_some_and(|child| child.busy())
    }

    fn halt(&mut self) -> AppResult<()> {
        if self.busy() || self.mode != ContainerMode::Normal {
            return Err(EngineError::transition(format!(
                "cannot halt sequence (mode {:?}, busy {})",
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
        let (index, child_point) = match point {
            ProgramPoint::Sequence { index, child } => (index, child),
            other => {
                return Err(EngineError::InvalidPoint(format!("{other:?} is not a sequence point")));
            }
        };

        if index >= self.len() {
            return Err(EngineError::InvalidPoint(format!(
                "sequence index {index} is out of range"
            )));
        }

        let child_point = ProgramPoint::into_child(child_point);

        if self.child.is_none() {
            self.point = Some((index, child_point));
            self.retrigger = false;
            return Ok(());
        }

        // A jump whose halt is still in progress is retargeted.
        if self.mode == ContainerMode::Halting && self.point.is_some() {
            self.point = Some((index, child_point));
            return Ok(());
        }

        if index == self.index && self.mode == ContainerMode::Normal {
            return match (self.child.as_mut(), child_point) {
                (Some(child), Some(child_point)) => child.jump(child_point),
                _ => Ok(()),
            };
        }

        if self.busy() || self.mode != ContainerMode::Normal {
            return Err(EngineError::transition(format!(
                "cannot jump in sequence (mode {:?}, busy {})",
                self.mode,
                self.busy()
            )));
        }

        if let Some(child) = self.child.as_mut() {
            child.halt()?;
        }

        self.mode = ContainerMode::Halting;
        self.point = Some((index, child_point));
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
            ProgramMessage::SetInterrupt { value } => {
                self.interrupting = value;
                self.retrigger = true;
                Ok(())
            }
        }
    }

    fn child_mut(&mut self, block_key: usize, _exec_key: usize) -> Option<&mut BoxProgram> {
        if block_key == self.index {
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
        self.stack = stack;
        self.symbol = Some(symbol);

        match point {
            Some(ProgramPoint::Sequence { index, child }) => {
                if index > self.len() {
                    return Err(EngineError::InvalidPoint(format!(
                        "sequence index {index} is out of range"
                    )));
                }

                self.point = Some((index, ProgramPoint::into_child(child)));
            }
            Some(other) => {
                return Err(EngineError::InvalidPoint(format!("{other:?} is not a sequence point")));
            }
            None => self.point = Some((0, None)),
        }

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
                if let Some(last) = &self.last_child_event {
                    return Ok(Some(self.wrap(last, false)));
                }
            }

            if self.child.is_none() {
                if self.mode == ContainerMode::Halted && self.point.is_none() {
                    return Ok(Some(self.finish()));
                }

                let (index, child_point) = self.point.take().unwrap_or((self.index + 1, None));

                if index >= self.len() {
                    self.index = index.min(self.len().saturating_sub(1));
                    return Ok(Some(self.finish()));
                }

                self.mode = ContainerMode::Normal;
                self.start_child(index, child_point)?;
            }

            let Some(child) = self.child.as_mut() else {
                continue;
            };

            match child.next_event().await? {
                Some(child_event) => {
                    let terminated = child_event.terminated
                        && match &self.point {
                            Some((index, _)) => *index >= self.len(),
                            None => {
                                self.mode == ContainerMode::Halting
                                    || self.mode == ContainerMode::Halted
                                    || self.index + 1 >= self.len()
                            }
                        };

                    if child_event.terminated && self.mode == ContainerMode::Halting {
                        self.mode = ContainerMode::Halted;
                    }

                    let event = self.wrap(&child_event, terminated);
                    self.last_child_event = Some(child_event);

                    if terminated {
                        self.finished = true;
                    }

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
