//! Protocol execution engine.
//!
//! A protocol source is parsed ([`parser`]) into an immutable tree of
//! [`program::Block`]s. Running a protocol on a chip creates a
//! [`master::Master`], which instantiates the root block into a tree of live
//! [`program::Program`]s and drives it event by event.
//!
//! ```text
//! YAML ──parser──▶ Block tree ──Master::start──▶ Program tree ──events──▶ MasterHandle
//!                                                    │
//!                                                    └──declarations──▶ DevicesRunner
//! ```

pub mod blocks;
pub mod diagnostic;
pub mod eval;
pub mod master;
pub mod parser;
pub mod program;

pub use diagnostic::{Diagnostic, DiagnosticKind};
pub use master::{Master, MasterHandle};
pub use parser::{Draft, Protocol, ProtocolParser};
pub use program::{Block, ExecutionEvent, Program, ProgramLocation, ProgramMessage, ProgramPoint};
