//! Blocks and programs.
//!
//! A [`Block`] is an immutable blueprint produced by the parser. Running a block
//! creates a [`Program`]: a live, resumable, cancelable instance which emits a
//! finite sequence of [`ExecutionEvent`]s.
//!
//! Programs are explicit state machines rather than generators: [`Program::run`]
//! prepares the instance and [`Program::next_event`] advances it to its next
//! event. `next_event` is cancel-safe, so an owner can race it against control
//! requests (`pause`, `halt`, `jump`) in a `tokio::select!` loop and apply those
//! requests between events.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use super::diagnostic::Diagnostic;
use super::eval::{EvalStack, ExpressionEngine};
use crate::config::EngineConfig;
use crate::devices::claim::ClaimSymbol;
use crate::error::{AppResult, EngineError};
use crate::runner::DevicesRunner;

/// Estimated duration of a block.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum BlockDuration {
    /// Known duration in seconds
    Known {
        /// Seconds
        seconds: f64,
    },
    /// Depends on run-time values or on user interaction
    Unknown,
}

impl BlockDuration {
    /// Zero duration.
    pub const ZERO: Self = BlockDuration::Known { seconds: 0.0 };

    /// Sum of two durations; unknown if either is unknown.
    pub fn then(self, other: Self) -> Self {
        match (self, other) {
            (BlockDuration::Known { seconds: a }, BlockDuration::Known { seconds: b }) => {
                BlockDuration::Known { seconds: a + b }
            }
            _ => BlockDuration::Unknown,
        }
    }

    /// Duration repeated `count` times.
    pub fn times(self, count: usize) -> Self {
        match self {
            BlockDuration::Known { seconds } => BlockDuration::Known {
                seconds: seconds * count as f64,
            },
            BlockDuration::Unknown => BlockDuration::Unknown,
        }
    }
}

/// Mode of a container program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ContainerMode {
    /// Running children
    Normal,
    /// Waiting for the active child to acknowledge a halt
    Halting,
    /// Halted; no further child will be started
    Halted,
}

/// Serializable resumption coordinate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ProgramPoint {
    /// Position in a sequence
    Sequence {
        /// Child index
        index: usize,
        /// Position within the child; `None` starts it from its beginning
        child: Option<Box<ProgramPoint>>,
    },
    /// Position in a repeat loop
    Repeat {
        /// Iteration index
        iteration: usize,
        /// Position within the child
        child: Option<Box<ProgramPoint>>,
    },
    /// Position in a timer
    Timer {
        /// Elapsed fraction, between 0 and 1
        progress: f64,
    },
    /// Position below a shorthand
    Shorthand {
        /// Position within the child
        child: Option<Box<ProgramPoint>>,
    },
    /// Position below a state publisher
    State {
        /// Position within the child
        child: Option<Box<ProgramPoint>>,
    },
}

impl ProgramPoint {
    /// Unboxed child point.
    pub fn into_child(child: Option<Box<ProgramPoint>>) -> Option<ProgramPoint> {
        child.map(|point| *point)
    }
}

/// Snapshot of where a program is.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ProgramLocation {
    /// See [`ProgramPoint::Sequence`]
    Sequence {
        /// Active child index
        index: usize,
        /// Whether the sequence is interrupting
        interrupting: bool,
        /// Container mode
        mode: ContainerMode,
        /// Location of the active child
        child: Option<Box<ProgramLocation>>,
    },
    /// See [`ProgramPoint::Repeat`]
    Repeat {
        /// Active iteration
        iteration: usize,
        /// Iteration count, when known
        count: Option<usize>,
        /// Container mode
        mode: ContainerMode,
        /// Location of the active child
        child: Option<Box<ProgramLocation>>,
    },
    /// See [`ProgramPoint::Timer`]
    Timer {
        /// Elapsed fraction, between 0 and 1
        progress: f64,
        /// Whether the timer is paused
        paused: bool,
        /// Total duration in seconds, when known
        seconds: Option<f64>,
    },
    /// See [`ProgramPoint::Shorthand`]
    Shorthand {
        /// Location of the child
        child: Option<Box<ProgramLocation>>,
    },
    /// See [`ProgramPoint::State`]
    State {
        /// Location of the child
        child: Option<Box<ProgramLocation>>,
    },
}

impl ProgramLocation {
    /// Resumption point matching this location.
    pub fn point(&self) -> ProgramPoint {
        fn child_point(child: &Option<Box<ProgramLocation>>) -> Option<Box<ProgramPoint>> {
            child.as_ref().map(|child| Box::new(child.point()))
        }

        match self {
            ProgramLocation::Sequence { index, child, .. } => ProgramPoint::Sequence {
                index: *index,
                child: child_point(child),
            },
            ProgramLocation::Repeat { iteration, child, .. } => ProgramPoint::Repeat {
                iteration: *iteration,
                child: child_point(child),
            },
            ProgramLocation::Timer { progress, .. } => ProgramPoint::Timer { progress: *progress },
            ProgramLocation::Shorthand { child } => ProgramPoint::Shorthand {
                child: child_point(child),
            },
            ProgramLocation::State { child } => ProgramPoint::State {
                child: child_point(child),
            },
        }
    }
}

/// Event emitted by a running program.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionEvent {
    /// Location after this event
    pub location: Option<ProgramLocation>,
    /// Diagnostics raised since the previous event
    pub errors: Vec<Diagnostic>,
    /// The program is currently not advancing
    pub stopped: bool,
    /// The program is finished; no further event follows
    pub terminated: bool,
    /// The state instance below released its device intent
    pub state_terminated: bool,
}

/// Control message addressed to a program by an external sender.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ProgramMessage {
    /// Halt the program
    Halt,
    /// Jump to a point, in the target block's JSON point format
    Jump {
        /// Encoded point
        point: serde_json::Value,
    },
    /// Toggle the interrupting flag of a sequence
    SetInterrupt {
        /// New flag value
        value: bool,
    },
    /// Pause the program
    Pause,
    /// Resume the program
    Resume,
}

/// Shared services available to every program of one master.
pub struct MasterContext {
    /// Chip the master runs on
    pub chip_id: String,
    /// Expression engine, with the device environment
    pub engine: Arc<ExpressionEngine>,
    /// Device state runner of the chip
    pub devices: Arc<DevicesRunner>,
    /// Engine settings
    pub settings: EngineConfig,
}

impl fmt::Debug for MasterContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MasterContext")
            .field("chip_id", &self.chip_id)
            .finish()
    }
}

/// Handle given to a program at creation: the master's services and the
/// program's path in the tree.
#[derive(Debug, Clone)]
pub struct ProgramHandle {
    context: Arc<MasterContext>,
    path: Vec<usize>,
}

impl ProgramHandle {
    /// Handle of the root program.
    pub fn root(context: Arc<MasterContext>) -> Self {
        Self {
            context,
            path: Vec::new(),
        }
    }

    /// Handle of the child at `key`.
    pub fn child(&self, key: usize) -> Self {
        let mut path = self.path.clone();
        path.push(key);

        Self {
            context: self.context.clone(),
            path,
        }
    }

    /// Master services.
    pub fn context(&self) -> &MasterContext {
        &self.context
    }

    /// Block keys from the root to this program.
    pub fn path(&self) -> &[usize] {
        &self.path
    }
}

/// Owned program instance.
pub type BoxProgram = Box<dyn Program>;

/// Immutable blueprint of a protocol fragment.
pub trait Block: Send + Sync + fmt::Debug {
    /// Create a live instance of this block.
    fn create_program(self: Arc<Self>, handle: ProgramHandle) -> BoxProgram;

    /// Estimated duration.
    fn duration(&self) -> BlockDuration;

    /// Decode a point in this block's JSON point format, validating it against
    /// the block's structure.
    fn import_point(&self, value: &serde_json::Value) -> AppResult<ProgramPoint>;

    /// JSON description for clients.
    fn export(&self) -> serde_json::Value;
}

/// Live, resumable instance of a [`Block`].
#[async_trait]
pub trait Program: Send {
    /// Whether the program is in the middle of a transition and must not be halted.
    fn busy(&self) -> bool;

    /// Request a halt.
    ///
    /// Fails with [`EngineError::InvalidTransition`] when the program is busy or
    /// already halting.
    fn halt(&mut self) -> AppResult<()>;

    /// Request a pause. The next event reports `stopped`.
    fn pause(&mut self) -> AppResult<()>;

    /// Resume after a pause.
    fn resume(&mut self) -> AppResult<()>;

    /// Move to `point`.
    fn jump(&mut self, _point: ProgramPoint) -> AppResult<()> {
        Err(EngineError::Unsupported("jump".to_string()))
    }

    /// Dispatch a control message.
    fn import_message(&mut self, message: ProgramMessage) -> AppResult<()> {
        match message {
            ProgramMessage::Halt => self.halt(),
            ProgramMessage::Pause => self.pause(),
            ProgramMessage::Resume => self.resume(),
            ProgramMessage::Jump { .. } => Err(EngineError::Unsupported("jump".to_string())),
            ProgramMessage::SetInterrupt { .. } => {
                Err(EngineError::Unsupported("setInterrupt".to_string()))
            }
        }
    }

    /// Child program for `send_message` routing.
    fn child_mut(&mut self, _block_key: usize, _exec_key: usize) -> Option<&mut BoxProgram> {
        None
    }

    /// Start the program at `point` (or its beginning).
    ///
    /// A program runs once; calling `run` again fails with
    /// [`EngineError::AlreadyStarted`].
    fn run(&mut self, point: Option<ProgramPoint>, stack: EvalStack, symbol: ClaimSymbol) -> AppResult<()>;

    /// Advance to the next event, or `None` once the program is finished.
    ///
    /// Cancel-safe: dropping the future before completion loses no event.
    async fn next_event(&mut self) -> AppResult<Option<ExecutionEvent>>;
}

/// Route `message` down `path` of `(block_key, exec_key)` pairs.
pub fn deliver_message(
    program: &mut dyn Program,
    path: &[(usize, usize)],
    message: ProgramMessage,
) -> AppResult<()> {
    match path.split_first() {
        None => program.import_message(message),
        Some((&(block_key, exec_key), rest)) => {
            let child = program
                .child_mut(block_key, exec_key)
                .ok_or(EngineError::ChildNotFound { block_key, exec_key })?;

            deliver_message(child.as_mut(), rest, message)
        }
    }
}
