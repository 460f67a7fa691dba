//! Runnables: tasks executing somewhere.
//!
//! A [`Runnable`] is either a [`ParallelProcess`] (a child process running
//! the child runtime) or a [`SynchronousProcess`] (the task run inline,
//! for hosts without process forking). Both expose the same lifecycle
//! queries and callback registration so the pool treats them alike.

mod callbacks;
mod parallel;
mod proc;
mod signals;
mod spawn;
mod synchronous;

pub use callbacks::ProcessCallbacks;
pub use parallel::ParallelProcess;
pub use proc::ChildProc;
pub use signals::{TerminationReason, analyze_wait_status};
pub use spawn::{ChildCommand, resolve_binary};
pub use synchronous::SynchronousProcess;

use crate::error::{ForkpoolError, Result};
use crate::failure::{ErrorRegistry, ParallelFailure};
use crate::runtime::protocol::ChildFailure;
use serde_json::Value;
use std::error::Error as StdError;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Source of runnable ids, unique for the lifetime of the process.
static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a runnable within the parent process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RunnableId(u64);

impl RunnableId {
    /// Allocate the next id.
    pub fn next() -> Self {
        Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RunnableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a runnable left behind on its error channel.
#[derive(Debug, Clone)]
pub enum ErrorOutput {
    /// A decoded failure envelope from the child.
    Structured(ChildFailure),
    /// Text that is not a failure envelope, kept verbatim.
    Raw(String),
    /// An already-resolved failure (in-process execution).
    Resolved(ParallelFailure),
}

/// A schedulable unit of work with its lifecycle and callbacks.
pub trait Runnable {
    fn id(&self) -> RunnableId;

    /// OS process id while running; synchronous runnables report their id.
    fn pid(&self) -> Option<u32>;

    /// Name of the task being run.
    fn task_name(&self) -> &str;

    /// Begin execution.
    fn start(&mut self) -> Result<()>;

    /// Forcefully stop execution.
    fn stop(&mut self) -> Result<()>;

    /// Non-blocking check for termination.
    fn poll_exit(&mut self) -> Result<Option<TerminationReason>>;

    fn is_running(&self) -> bool;
    fn is_successful(&self) -> bool;
    fn is_terminated(&self) -> bool;

    /// Runs inline; already complete after `start`.
    fn is_synchronous(&self) -> bool {
        false
    }

    /// Decoded task result, if any.
    fn output(&mut self) -> Option<&Value>;

    /// Anything the task printed to stdout, kept apart from the result.
    fn other_output(&mut self) -> Option<&str>;

    /// Error channel contents, if any.
    fn error_output(&mut self) -> Option<&ErrorOutput>;

    /// Wall-clock time since `start`.
    fn current_execution_time(&self) -> Duration;

    fn callbacks(&mut self) -> &mut ProcessCallbacks;

    /// Failure resolved by the last `trigger_error` or `trigger_timeout`.
    fn failure(&self) -> Option<&ParallelFailure>;

    /// Turn the error channel into a failure and remember it.
    fn resolve_error_output(&mut self, errors: &ErrorRegistry) -> ParallelFailure;

    /// Record a failure for later introspection.
    fn record_failure(&mut self, failure: ParallelFailure);

    /// Fire success callbacks with the decoded output and return it.
    ///
    /// A runnable that left anything on its error channel is routed to
    /// [`trigger_error`](Self::trigger_error) instead; `Ok(None)` is
    /// returned when that error was handled.
    fn trigger_success(&mut self, errors: &ErrorRegistry) -> Result<Option<Value>> {
        // Decoding stdout may demote it to error output.
        let output = self.output().cloned();
        if self.error_output().is_some() {
            self.trigger_error(errors)?;
            return Ok(None);
        }

        let output = output.unwrap_or(Value::Null);
        self.callbacks().fire_success(&output);
        Ok(Some(output))
    }

    /// Fire error callbacks with the resolved failure.
    ///
    /// Fails with [`ForkpoolError::TaskFailed`] when no callback accepted
    /// the failure.
    fn trigger_error(&mut self, errors: &ErrorRegistry) -> Result<()> {
        let failure = self.resolve_error_output(errors);
        if self.callbacks().fire_error(&failure) {
            Ok(())
        } else {
            Err(ForkpoolError::TaskFailed {
                id: self.id(),
                failure,
            })
        }
    }

    /// Fire timeout callbacks.
    fn trigger_timeout(&mut self, timeout: Duration) {
        self.record_failure(ParallelFailure::Timeout(timeout));
        self.callbacks().fire_timeout();
    }
}

/// Chainable callback registration on a runnable owned by a pool.
pub struct RunnableHandle<'a> {
    runnable: &'a mut dyn Runnable,
}

impl std::fmt::Debug for RunnableHandle<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunnableHandle")
            .field("id", &self.runnable.id())
            .finish()
    }
}

impl<'a> RunnableHandle<'a> {
    pub fn new(runnable: &'a mut dyn Runnable) -> Self {
        Self { runnable }
    }

    pub fn id(&self) -> RunnableId {
        self.runnable.id()
    }

    pub fn pid(&self) -> Option<u32> {
        self.runnable.pid()
    }

    /// Register a success callback.
    pub fn then(self, callback: impl FnMut(&Value) + 'static) -> Self {
        self.runnable.callbacks().on_success(callback);
        self
    }

    /// Register a callback receiving every failure.
    pub fn catch(self, callback: impl FnMut(&ParallelFailure) + 'static) -> Self {
        self.runnable.callbacks().on_error(callback);
        self
    }

    /// Register a callback for reconstructed task errors of type `E`.
    pub fn catch_typed<E: StdError + 'static>(self, callback: impl FnMut(&E) + 'static) -> Self {
        self.runnable.callbacks().on_typed_error(callback);
        self
    }

    /// Register a timeout callback.
    pub fn on_timeout(self, callback: impl FnMut() + 'static) -> Self {
        self.runnable.callbacks().on_timeout(callback);
        self
    }
}

/// Resolve error-channel contents into a failure.
///
/// `termination` describes the exit when the error channel was empty.
pub(crate) fn resolve_failure(
    error_output: Option<ErrorOutput>,
    termination: Option<TerminationReason>,
    errors: &ErrorRegistry,
) -> ParallelFailure {
    match error_output {
        Some(ErrorOutput::Structured(ChildFailure::Task(record))) => errors.reconstruct(record),
        Some(ErrorOutput::Structured(ChildFailure::OutputTooLarge { limit, size })) => {
            ParallelFailure::OutputTooLarge { limit, size }
        }
        Some(ErrorOutput::Raw(text)) => ParallelFailure::Parallel(text),
        Some(ErrorOutput::Resolved(failure)) => failure,
        None => ParallelFailure::Parallel(match termination {
            Some(reason) => format!("Child process {} without reporting an error", reason),
            None => "Child process failed without reporting an error".to_string(),
        }),
    }
}
