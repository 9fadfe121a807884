//! Custom error types for the acquisition pipeline.
//!
//! This module defines the primary error type, `DaqError`, for the whole crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to
//! distinguish the kinds of failure the pipeline can produce, from protocol
//! readiness problems to raw-file corruption.
//!
//! ## Error Hierarchy
//!
//! - **`NotReady`**: A board refused a `configure`/`initialize` precondition.
//!   The connection should be treated as unusable until reconnected.
//! - **`StructureMismatch`**: A configuration deep-merge found a nested value
//!   on one side and a scalar on the other. The merge is aborted untouched.
//! - **`Decode`**: The raw record file is malformed or its cardinality
//!   metadata disagrees with its buffers.
//! - **`Timeout`** / **`Interrupted`**: A polling loop gave up, either because
//!   its maximum wait elapsed or because the caller raised the interrupt flag.
//! - **`Transport`** / **`Io`**: Socket and file failures. These are not
//!   categorized further and propagate as-is.
//!
//! No retries happen anywhere in this crate; every error surfaces to the caller.

use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Primary error type for the acquisition pipeline.
#[derive(Error, Debug)]
pub enum DaqError {
    /// A readiness check (`configure`, `initialize`) got an unexpected reply.
    #[error("{command}: board not ready (reply: {reply:?})")]
    NotReady {
        /// Request that was sent
        command: String,
        /// Reply received from the board
        reply: String,
    },

    /// Deep-merge found a nested/scalar conflict.
    #[error("configuration structure mismatch at '{path}'")]
    StructureMismatch {
        /// Dotted path of the conflicting key
        path: String,
    },

    /// Raw record file could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),

    /// A polling loop exceeded its maximum wait.
    #[error("timed out after {waited:?} waiting for {operation}")]
    Timeout {
        /// What was being waited for
        operation: String,
        /// Time spent waiting
        waited: Duration,
    },

    /// A polling loop observed the interrupt flag.
    #[error("interrupted while waiting for {0}")]
    Interrupted(String),

    /// A request was issued on a client without a live connection.
    #[error("client is not connected")]
    NotConnected,

    /// Unknown remote procedure or wrong number of arguments.
    #[error("invalid command: {0}")]
    InvalidCommand(String),

    /// A reply could not be interpreted as the expected type.
    #[error("invalid reply to '{command}': {reply:?}")]
    InvalidReply {
        /// Request that was sent
        command: String,
        /// Reply received from the board
        reply: String,
    },

    /// ZeroMQ socket failure.
    #[error("transport error: {0}")]
    Transport(#[from] zmq::Error),

    /// File or process I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration document could not be parsed or serialized.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Decoded table persistence failure.
    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    /// Application configuration could not be loaded.
    #[error("configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Semantic validation of the application configuration failed.
    #[error("configuration validation error: {0}")]
    Configuration(String),

    /// A remote shell command failed.
    #[error("remote command '{command}' failed: {stderr}")]
    Remote {
        /// Command line that was executed
        command: String,
        /// Captured standard error
        stderr: String,
    },
}

impl From<figment::Error> for DaqError {
    fn from(value: figment::Error) -> Self {
        DaqError::Config(Box::new(value))
    }
}

impl DaqError {
    /// Whether the connection that produced this error should be re-established
    /// before further use.
    pub fn requires_reconnect(&self) -> bool {
        matches!(
            self,
            DaqError::NotReady { .. } | DaqError::Transport(_) | DaqError::NotConnected
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_ready_message_names_command() {
        let err = DaqError::NotReady {
            command: "configure".into(),
            reply: "busy".into(),
        };
        let text = err.to_string();
        assert!(text.contains("configure"));
        assert!(text.contains("busy"));
        assert!(err.requires_reconnect());
    }

    #[test]
    fn structure_mismatch_carries_path() {
        let err = DaqError::StructureMismatch {
            path: "daq.l1a_enables".into(),
        };
        assert_eq!(
            err.to_string(),
            "configuration structure mismatch at 'daq.l1a_enables'"
        );
        assert!(!err.requires_reconnect());
    }

    #[test]
    fn io_errors_convert_with_question_mark() {
        fn open_missing() -> AppResult<std::fs::File> {
            Ok(std::fs::File::open("/definitely/not/here.raw")?)
        }
        match open_missing() {
            Err(DaqError::Io(_)) => {}
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
