//! Registry of task functions, shared by the parent and the child runtime.

use super::Task;
use crate::error::{ForkpoolError, Result};
use crate::failure::DynError;
use crate::runtime::protocol::SerializedError;
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use std::collections::BTreeMap;
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

/// Error produced by a task invocation.
///
/// Carries the serializable record that crosses the process boundary and,
/// when the failure happened in this process, the original error value.
#[derive(Debug, Clone)]
pub struct TaskFailure {
    pub record: SerializedError,
    pub source: Option<DynError>,
}

impl TaskFailure {
    /// Capture an error returned by a task.
    pub fn from_error<E>(err: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        let record = SerializedError::new(
            std::any::type_name::<E>(),
            err.to_string(),
            render_trace(&err),
        );
        Self {
            record,
            source: Some(Arc::new(err)),
        }
    }

    /// Failure without an underlying error value (e.g. a panic).
    pub fn from_record(record: SerializedError) -> Self {
        Self {
            record,
            source: None,
        }
    }
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.record.type_name, self.record.message)
    }
}

/// Render the source chain of an error followed by a backtrace when
/// `RUST_BACKTRACE` enables one.
fn render_trace(err: &(dyn StdError + 'static)) -> String {
    let mut trace = String::new();
    let mut source = err.source();
    while let Some(cause) = source {
        trace.push_str("caused by: ");
        trace.push_str(&cause.to_string());
        trace.push('\n');
        source = cause.source();
    }

    let backtrace = std::backtrace::Backtrace::capture();
    if backtrace.status() == std::backtrace::BacktraceStatus::Captured {
        trace.push_str(&backtrace.to_string());
    }
    trace
}

/// Type-erased task function.
pub type TaskFn = dyn Fn(Value) -> std::result::Result<Value, TaskFailure> + Send + Sync;

/// Named task functions.
#[derive(Clone, Default)]
pub struct TaskRegistry {
    tasks: BTreeMap<String, Arc<TaskFn>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a typed task function under `name`.
    ///
    /// Arguments are deserialized from the task's JSON args and the return
    /// value is serialized back to JSON. Argument or result (de)serialization
    /// errors are reported as task failures.
    pub fn register<A, R, E, F>(&mut self, name: impl Into<String>, func: F) -> &mut Self
    where
        A: DeserializeOwned,
        R: Serialize,
        E: StdError + Send + Sync + 'static,
        F: Fn(A) -> std::result::Result<R, E> + Send + Sync + 'static,
    {
        let erased = move |args: Value| -> std::result::Result<Value, TaskFailure> {
            let args: A = serde_json::from_value(args).map_err(TaskFailure::from_error)?;
            let output = func(args).map_err(TaskFailure::from_error)?;
            serde_json::to_value(output).map_err(TaskFailure::from_error)
        };
        self.tasks.insert(name.into(), Arc::new(erased));
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tasks.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<Arc<TaskFn>> {
        self.tasks.get(name).cloned()
    }

    /// Registered task names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tasks.keys().map(String::as_str)
    }

    /// Look up and invoke a task.
    ///
    /// The outer `Result` reports an unknown task; the inner one is the
    /// task's own outcome.
    pub fn invoke(&self, task: &Task) -> Result<std::result::Result<Value, TaskFailure>> {
        let func = self
            .get(&task.name)
            .ok_or_else(|| ForkpoolError::UnknownTask(task.name.clone()))?;
        Ok(func(task.args.clone()))
    }
}

impl fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("tasks", &self.tasks.keys().collect::<Vec<_>>())
            .finish()
    }
}
