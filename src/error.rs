//! Error types for forkpool.

use crate::failure::ParallelFailure;
use crate::process::RunnableId;
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for forkpool operations.
#[derive(Error, Debug)]
pub enum ForkpoolError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Failed to spawn child process: {0}")]
    Spawn(String),

    #[error("Process error: {0}")]
    Process(String),

    #[error("Unknown task '{0}'")]
    UnknownTask(String),

    #[error("Invalid task payload: {0}")]
    InvalidPayload(String),

    #[error("Spilled task payload unavailable at {}: {source}", path.display())]
    SpilloverMissing {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Synchronous execution requires a task registry")]
    MissingRegistry,

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Task {id} failed: {failure}")]
    TaskFailed {
        id: RunnableId,
        failure: ParallelFailure,
    },
}

impl ForkpoolError {
    /// The task failure carried by this error, if it came out of a runnable.
    pub fn failure(&self) -> Option<&ParallelFailure> {
        match self {
            Self::TaskFailed { failure, .. } => Some(failure),
            _ => None,
        }
    }
}

/// Result type alias for forkpool operations.
pub type Result<T> = std::result::Result<T, ForkpoolError>;
