//! Custom error types for the engine.
//!
//! This module defines the primary error type, `EngineError`, used across the
//! program tree, the device layer and the host request surface. Using the
//! `thiserror` crate, it provides a centralized and consistent way to handle the
//! different kinds of failures that can occur.
//!
//! ## Error Hierarchy
//!
//! - **`InvalidTransition`**: a control request (halt, pause, jump) issued to a
//!   program whose current mode does not allow it. These are programming errors
//!   on the caller's side and are never silently ignored.
//! - **`Claim*`**: claim misuse, such as writing a node without holding its
//!   active claim.
//! - **`Node`**: wraps [`NodeError`] raised by device drivers.
//! - **`Config`**: configuration loading or validation failures.
//!
//! By using `#[from]`, `EngineError` can be created from the underlying error
//! types, so the `?` operator works throughout the crate.

use thiserror::Error;

/// Convenience alias for results using the engine error type.
pub type AppResult<T> = std::result::Result<T, EngineError>;

/// Errors raised by node drivers.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum NodeError {
    /// The node is temporarily unavailable on the underlying device, e.g. because
    /// of a disconnection. Absorbed at the configure/poll boundary.
    #[error("Node is unavailable")]
    Unavailable,

    /// The driver failed to communicate with the device.
    #[error("Device I/O error: {0}")]
    Io(String),
}

/// Primary error type for the engine, devices and host.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Invalid program transition: {0}")]
    InvalidTransition(String),

    #[error("Program was already started")]
    AlreadyStarted,

    #[error("Program was not started")]
    NotStarted,

    #[error("No child program at block key {block_key} and exec key {exec_key}")]
    ChildNotFound { block_key: usize, exec_key: usize },

    #[error("Invalid program point: {0}")]
    InvalidPoint(String),

    #[error("Invalid program message: {0}")]
    InvalidMessage(String),

    #[error("Operation not supported by this program: {0}")]
    Unsupported(String),

    #[error("Node '{0}' is not claimed by the writer")]
    ClaimNotActive(String),

    #[error("Node '{0}' is read-only")]
    ReadOnlyNode(String),

    #[error("Node '{0}' was not found")]
    NodeNotFound(String),

    #[error("Node error: {0}")]
    Node(#[from] NodeError),

    #[error("Chip '{0}' was not found")]
    ChipNotFound(String),

    #[error("Chip '{0}' is already running a protocol")]
    ChipRunning(String),

    #[error("Chip '{0}' is not running a protocol")]
    ChipIdle(String),

    #[error("Protocol is invalid: {0}")]
    InvalidProtocol(String),

    #[error("Master is no longer running")]
    MasterGone,

    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Shorthand for an invalid transition with a formatted reason.
    pub fn transition(reason: impl Into<String>) -> Self {
        Self::InvalidTransition(reason.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = EngineError::ClaimNotActive("valve".to_string());
        assert_eq!(err.to_string(), "Node 'valve' is not claimed by the writer");
    }

    #[test]
    fn test_node_error_conversion() {
        let err: EngineError = NodeError::Unavailable.into();
        assert!(matches!(err, EngineError::Node(NodeError::Unavailable)));
        assert!(err.to_string().contains("unavailable"));
    }
}
