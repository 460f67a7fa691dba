//! Failure taxonomy for runnables.
//!
//! Whatever a child process leaves behind on failure is normalized into a
//! [`ParallelFailure`]. Typed reconstruction of task errors only happens
//! through an explicit [`ErrorRegistry`]; unknown type names fall back to
//! [`ParallelFailure::Unreconstructable`].

use crate::runtime::protocol::SerializedError;
use std::collections::HashMap;
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Shared, type-erased error as produced by a task.
pub type DynError = Arc<dyn StdError + Send + Sync + 'static>;

/// Resolved outcome of a runnable that did not succeed.
#[derive(Debug, Clone, Error)]
pub enum ParallelFailure {
    /// The task itself failed and its error was reconstructed.
    #[error("{0}")]
    Task(TaskError),

    /// The task failed with an error type the parent cannot rebuild.
    #[error("{}: {}", .0.type_name, .0.message)]
    Unreconstructable(SerializedError),

    /// The child produced unstructured output (free text on stderr,
    /// startup failure, crash by signal).
    #[error("{0}")]
    Parallel(String),

    /// The encoded result exceeded the configured cap.
    #[error(
        "The output returned by this child process is too large. The serialized output may only be {limit} bytes long."
    )]
    OutputTooLarge { limit: usize, size: usize },

    /// The runnable exceeded its wall-clock budget.
    #[error("Task exceeded its timeout of {:.3}s", .0.as_secs_f64())]
    Timeout(Duration),
}

impl ParallelFailure {
    /// Short kind label used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Task(_) => "task",
            Self::Unreconstructable(_) => "unreconstructable",
            Self::Parallel(_) => "parallel",
            Self::OutputTooLarge { .. } => "output_too_large",
            Self::Timeout(_) => "timeout",
        }
    }

    /// Type name of the original task error, when there was one.
    pub fn original_type(&self) -> Option<&str> {
        match self {
            Self::Task(err) => Some(&err.type_name),
            Self::Unreconstructable(err) => Some(&err.type_name),
            _ => None,
        }
    }

    /// Message of the original task error, or the failure rendering.
    pub fn message(&self) -> String {
        match self {
            Self::Task(err) => err.message.clone(),
            Self::Unreconstructable(err) => err.message.clone(),
            other => other.to_string(),
        }
    }

    /// Trace captured in the child, if any.
    pub fn trace(&self) -> Option<&str> {
        match self {
            Self::Task(err) => Some(&err.trace),
            Self::Unreconstructable(err) => Some(&err.trace),
            _ => None,
        }
    }

    /// Downcast the reconstructed task error to a concrete type.
    pub fn downcast_ref<E: StdError + 'static>(&self) -> Option<&E> {
        match self {
            Self::Task(err) => err.downcast_ref::<E>(),
            _ => None,
        }
    }
}

/// A task error rebuilt in the parent.
#[derive(Clone)]
pub struct TaskError {
    pub type_name: String,
    pub message: String,
    pub trace: String,
    error: DynError,
}

impl TaskError {
    pub fn new(record: SerializedError, error: DynError) -> Self {
        Self {
            type_name: record.type_name,
            message: record.message,
            trace: record.trace,
            error,
        }
    }

    /// The reconstructed error value.
    pub fn error(&self) -> &(dyn StdError + Send + Sync + 'static) {
        self.error.as_ref()
    }

    pub fn downcast_ref<E: StdError + 'static>(&self) -> Option<&E> {
        self.error.downcast_ref::<E>()
    }
}

impl fmt::Debug for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskError")
            .field("type_name", &self.type_name)
            .field("message", &self.message)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.type_name, self.message)
    }
}

type Constructor = Arc<dyn Fn(&SerializedError) -> Option<DynError> + Send + Sync>;

/// Bounded set of error shapes the parent knows how to rebuild.
///
/// Entries are keyed by the type name the child reports, which for errors
/// returned by registered tasks is `std::any::type_name::<E>()`.
#[derive(Clone, Default)]
pub struct ErrorRegistry {
    constructors: HashMap<String, Constructor>,
}

impl ErrorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a constructor for error type `E`.
    ///
    /// The constructor receives the message reported by the child and may
    /// decline by returning `None`, in which case the failure is reported as
    /// [`ParallelFailure::Unreconstructable`].
    pub fn register<E, F>(&mut self, build: F) -> &mut Self
    where
        E: StdError + Send + Sync + 'static,
        F: Fn(&str) -> Option<E> + Send + Sync + 'static,
    {
        let name = std::any::type_name::<E>().to_string();
        self.register_named(name, move |record: &SerializedError| {
            build(&record.message).map(|err| Arc::new(err) as DynError)
        })
    }

    /// Register a constructor under an explicit type name.
    pub fn register_named<F>(&mut self, type_name: impl Into<String>, build: F) -> &mut Self
    where
        F: Fn(&SerializedError) -> Option<DynError> + Send + Sync + 'static,
    {
        self.constructors.insert(type_name.into(), Arc::new(build));
        self
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.constructors.contains_key(type_name)
    }

    /// Resolve a serialized task error into a failure.
    pub fn reconstruct(&self, record: SerializedError) -> ParallelFailure {
        let rebuilt = self
            .constructors
            .get(&record.type_name)
            .and_then(|build| build(&record));

        match rebuilt {
            Some(error) => ParallelFailure::Task(TaskError::new(record, error)),
            None => ParallelFailure::Unreconstructable(record),
        }
    }
}

impl fmt::Debug for ErrorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.constructors.keys().collect();
        names.sort();
        f.debug_struct("ErrorRegistry")
            .field("types", &names)
            .finish()
    }
}
