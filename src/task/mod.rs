//! Tasks: the unit of work a pool runs.
//!
//! A task is the name of a function registered in a [`TaskRegistry`] plus
//! its serialized arguments. The parent only ever handles the name and the
//! arguments; the function itself is resolved inside the child process (or
//! inline, for synchronous execution).

mod blob;
mod encoder;
mod registry;

pub use blob::{BlobStore, TempFileStore};
pub use encoder::{DEFAULT_MAX_INLINE_BYTES, TaskEncoder, TaskEnvelope};
pub use registry::{TaskFailure, TaskFn, TaskRegistry};

use crate::error::{ForkpoolError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A named task with its captured arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Name the task function is registered under.
    pub name: String,
    /// Arguments passed to the task function.
    #[serde(default)]
    pub args: Value,
}

impl Task {
    /// Create a task, serializing `args` as its captured state.
    pub fn new<A: Serialize>(name: impl Into<String>, args: &A) -> Result<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(ForkpoolError::InvalidPayload(
                "task name must not be empty".into(),
            ));
        }
        Ok(Self {
            name,
            args: serde_json::to_value(args)?,
        })
    }

    /// Create a task that takes no arguments.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Value::Null,
        }
    }
}
