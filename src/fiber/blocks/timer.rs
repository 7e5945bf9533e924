//! Timer block: waits for a duration, pausable.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::devices::claim::ClaimSymbol;
use crate::error::{AppResult, EngineError};
use crate::fiber::diagnostic::Diagnostic;
use crate::fiber::eval::{dynamic_as_f64, EvalStack, Evaluable};
use crate::fiber::program::{
    Block, BlockDuration, BoxProgram, ExecutionEvent, Program, ProgramHandle, ProgramLocation,
    ProgramMessage, ProgramPoint,
};

/// Wait for a number of seconds.
#[derive(Debug)]
pub struct TimerBlock {
    seconds: Evaluable,
}

impl TimerBlock {
    /// Create a timer waiting `seconds` (a number or an expression).
    pub fn new(seconds: Evaluable) -> Self {
        Self { seconds }
    }
}

impl Block for TimerBlock {
    fn create_program(self: Arc<Self>, handle: ProgramHandle) -> BoxProgram {
        Box::new(TimerProgram {
            block: self,
            handle,
            started: false,
            total: None,
            elapsed: Duration::ZERO,
            resumed_at: None,
            paused: false,
            halted: false,
            emit: None,
            errors: Vec::new(),
            finished: false,
        })
    }

    fn duration(&self) -> BlockDuration {
        match self.seconds.constant().and_then(dynamic_as_f64) {
            Some(seconds) => BlockDuration::Known { seconds },
            None => BlockDuration::Unknown,
        }
    }

    fn import_point(&self, value: &serde_json::Value) -> AppResult<ProgramPoint> {
        let progress = value
            .get("progress")
            .and_then(serde_json::Value::as_f64)
            .ok_or_else(|| EngineError::InvalidPoint("timer point requires a progress".to_string()))?;

        if !(0.0..=1.0).contains(&progress) {
            return Err(EngineError::InvalidPoint(format!(
                "timer progress {progress} is out of range"
            )));
        }

        Ok(ProgramPoint::Timer { progress })
    }

    fn export(&self) -> serde_json::Value {
        serde_json::json!({
            "namespace": "timer",
            "seconds": self.seconds.export(),
            "duration": self.duration(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Emit {
    Progress,
    Terminal,
}

struct TimerProgram {
    block: Arc<TimerBlock>,
    handle: ProgramHandle,
    started: bool,
    total: Option<Duration>,
    elapsed: Duration,
    resumed_at: Option<Instant>,
    paused: bool,
    halted: bool,
    emit: Option<Emit>,
    errors: Vec<Diagnostic>,
    finished: bool,
}

impl TimerProgram {
    fn elapsed(&self) -> Duration {
        self.elapsed + self.resumed_at.map_or(Duration::ZERO, |at| at.elapsed())
    }

    fn progress(&self) -> f64 {
        match self.total {
            Some(total) if !total.is_zero() => {
                (self.elapsed().as_secs_f64() / total.as_secs_f64()).min(1.0)
            }
            _ => 1.0,
        }
    }

    fn event(&mut self, stopped: bool, terminated: bool) -> ExecutionEvent {
        ExecutionEvent {
            location: Some(ProgramLocation::Timer {
                progress: self.progress(),
                paused: self.paused,
                seconds: self.total.map(|total| total.as_secs_f64()),
            }),
            errors: std::mem::take(&mut self.errors),
            stopped,
            terminated,
            state_terminated: false,
        }
    }

    fn terminal_event(&mut self) -> ExecutionEvent {
        self.finished = true;

        if let Some(at) = self.resumed_at.take() {
            self.elapsed += at.elapsed();
        }

        self.event(true, true)
    }
}

#[async_trait]
impl Program for TimerProgram {
    fn busy(&self) -> bool {
        false
    }

    fn halt(&mut self) -> AppResult<()> {
        if self.halted || self.finished {
            return Err(EngineError::transition("timer is already halted"));
        }

        debug!(path = ?self.handle.path(), "Halting timer");
        self.halted = true;
        self.emit = Some(Emit::Terminal);
        Ok(())
    }

    fn pause(&mut self) -> AppResult<()> {
        if self.halted || self.finished {
            return Err(EngineError::transition("cannot pause a halted timer"));
        }

        if !self.paused {
            if let Some(at) = self.resumed_at.take() {
                self.elapsed += at.elapsed();
            }

            self.paused = true;
        }

        // Paused timers re-report their stopped state.
        self.emit.get_or_insert(Emit::Progress);
        Ok(())
    }

    fn resume(&mut self) -> AppResult<()> {
        if self.paused && !self.halted {
            self.paused = false;
            self.resumed_at = Some(Instant::now());
            self.emit.get_or_insert(Emit::Progress);
        }

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

    fn jump(&mut self, point: ProgramPoint) -> AppResult<()> {
        let progress = match point {
            ProgramPoint::Timer { progress } => progress,
            other => {
                return Err(EngineError::InvalidPoint(format!("{other:?} is not a timer point")));
            }
        };

        if let Some(total) = self.total {
            self.elapsed = total.mul_f64(progress.clamp(0.0, 1.0));

            if self.resumed_at.is_some() {
                self.resumed_at = Some(Instant::now());
            }
        }

        self.emit.get_or_insert(Emit::Progress);
        Ok(())
    }

    fn run(&mut self, point: Option<ProgramPoint>, stack: EvalStack, _symbol: ClaimSymbol) -> AppResult<()> {
        if self.started {
            return Err(EngineError::AlreadyStarted);
        }

        self.started = true;

        let engine = &self.handle.context().engine;

        self.total = match self.block.seconds.evaluate(engine, &stack) {
            Ok(value) => match dynamic_as_f64(&value) {
                Some(seconds) if seconds.is_finite() && seconds >= 0.0 => {
                    Some(Duration::from_secs_f64(seconds))
                }
                _ => {
                    self.errors
                        .push(Diagnostic::error(format!("Invalid timer duration: {value}")));
                    None
                }
            },
            Err(message) => {
                self.errors.push(Diagnostic::error(message));
                None
            }
        };

        if let (Some(ProgramPoint::Timer { progress }), Some(total)) = (point, self.total) {
            self.elapsed = total.mul_f64(progress.clamp(0.0, 1.0));
        }

        self.resumed_at = Some(Instant::now());
        self.emit = Some(Emit::Progress);
        Ok(())
    }

    async fn next_event(&mut self) -> AppResult<Option<ExecutionEvent>> {
        if !self.started {
            return Err(EngineError::NotStarted);
        }

        if self.finished {
            return Ok(None);
        }

        if let Some(emit) = self.emit.take() {
            if emit == Emit::Terminal || self.total.is_none() {
                return Ok(Some(self.terminal_event()));
            }

            let stopped = self.paused;
            return Ok(Some(self.event(stopped, false)));
        }

        if self.paused {
            return std::future::pending().await;
        }

        let Some(total) = self.total else {
            return Ok(Some(self.terminal_event()));
        };

        let segment_start = self.resumed_at.unwrap_or_else(Instant::now);
        let deadline = segment_start + total.saturating_sub(self.elapsed);

        tokio::time::sleep_until(deadline).await;
        Ok(Some(self.terminal_event()))
    }
}
