//! Runnable that executes its task inline, for hosts without process forking.

use super::callbacks::ProcessCallbacks;
use super::signals::TerminationReason;
use super::{ErrorOutput, Runnable, RunnableId, resolve_failure};
use crate::error::Result;
use crate::failure::{ErrorRegistry, ParallelFailure, TaskError};
use crate::task::{Task, TaskFailure, TaskRegistry};
use serde_json::Value;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A task executed in the calling process.
pub struct SynchronousProcess {
    id: RunnableId,
    task: Task,
    registry: Arc<TaskRegistry>,
    output: Option<Value>,
    error_output: Option<ErrorOutput>,
    execution_time: Option<Duration>,
    failure: Option<ParallelFailure>,
    callbacks: ProcessCallbacks,
}

impl SynchronousProcess {
    pub fn new(id: RunnableId, task: Task, registry: Arc<TaskRegistry>) -> Self {
        Self {
            id,
            task,
            registry,
            output: None,
            error_output: None,
            execution_time: None,
            failure: None,
            callbacks: ProcessCallbacks::default(),
        }
    }

    fn record_task_failure(&mut self, failure: TaskFailure) {
        // Same process: keep the original error instead of rebuilding it.
        let resolved = match failure.source {
            Some(source) => ParallelFailure::Task(TaskError::new(failure.record, source)),
            None => ParallelFailure::Unreconstructable(failure.record),
        };
        self.error_output = Some(ErrorOutput::Resolved(resolved));
    }
}

impl Runnable for SynchronousProcess {
    fn id(&self) -> RunnableId {
        self.id
    }

    fn pid(&self) -> Option<u32> {
        Some(self.id.as_u64() as u32)
    }

    fn task_name(&self) -> &str {
        &self.task.name
    }

    fn is_synchronous(&self) -> bool {
        true
    }

    fn start(&mut self) -> Result<()> {
        let started = Instant::now();
        let outcome = catch_unwind(AssertUnwindSafe(|| self.registry.invoke(&self.task)));
        self.execution_time = Some(started.elapsed());

        match outcome {
            Ok(Ok(Ok(value))) => self.output = Some(value),
            Ok(Ok(Err(failure))) => self.record_task_failure(failure),
            Ok(Err(err)) => return Err(err),
            Err(payload) => {
                let record = crate::runtime::panic_record(payload.as_ref(), String::new());
                self.record_task_failure(TaskFailure::from_record(record));
            }
        }

        tracing::debug!(
            id = %self.id,
            task = %self.task.name,
            elapsed_ms = self.current_execution_time().as_millis(),
            ok = self.error_output.is_none(),
            "Ran task synchronously"
        );
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        Ok(())
    }

    fn poll_exit(&mut self) -> Result<Option<TerminationReason>> {
        Ok(self.execution_time.map(|_| {
            if self.error_output.is_none() {
                TerminationReason::Exited(0)
            } else {
                TerminationReason::Exited(1)
            }
        }))
    }

    fn is_running(&self) -> bool {
        false
    }

    fn is_successful(&self) -> bool {
        self.execution_time.is_some() && self.error_output.is_none()
    }

    fn is_terminated(&self) -> bool {
        self.execution_time.is_some()
    }

    fn output(&mut self) -> Option<&Value> {
        self.output.as_ref()
    }

    fn other_output(&mut self) -> Option<&str> {
        None
    }

    fn error_output(&mut self) -> Option<&ErrorOutput> {
        self.error_output.as_ref()
    }

    fn current_execution_time(&self) -> Duration {
        self.execution_time.unwrap_or_default()
    }

    fn callbacks(&mut self) -> &mut ProcessCallbacks {
        &mut self.callbacks
    }

    fn failure(&self) -> Option<&ParallelFailure> {
        self.failure.as_ref()
    }

    fn resolve_error_output(&mut self, errors: &ErrorRegistry) -> ParallelFailure {
        let failure = resolve_failure(
            self.error_output.clone(),
            Some(TerminationReason::Exited(1)),
            errors,
        );
        self.failure = Some(failure.clone());
        failure
    }

    fn record_failure(&mut self, failure: ParallelFailure) {
        self.failure = Some(failure);
    }
}

impl std::fmt::Debug for SynchronousProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SynchronousProcess")
            .field("id", &self.id)
            .field("task", &self.task.name)
            .field("execution_time", &self.execution_time)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::convert::Infallible;
    use thiserror::Error;

    #[derive(Debug, Error)]
    #[error("bad input")]
    struct BadInput;

    fn registry() -> Arc<TaskRegistry> {
        let mut registry = TaskRegistry::new();
        registry
            .register("two", |_: Value| Ok::<_, Infallible>(2))
            .register("bad", |_: Value| Err::<i32, _>(BadInput))
            .register("explode", |_: Value| -> std::result::Result<i32, Infallible> {
                panic!("exploded")
            });
        Arc::new(registry)
    }

    #[test]
    fn test_success_runs_inline() {
        let mut process = SynchronousProcess::new(RunnableId::next(), Task::named("two"), registry());
        process.start().unwrap();

        assert!(process.is_terminated());
        assert!(process.is_successful());
        assert_eq!(process.pid(), Some(process.id().as_u64() as u32));
        assert_eq!(
            process.trigger_success(&ErrorRegistry::new()).unwrap(),
            Some(json!(2))
        );
    }

    #[test]
    fn test_error_keeps_original_type() {
        let mut process = SynchronousProcess::new(RunnableId::next(), Task::named("bad"), registry());
        process.start().unwrap();
        assert!(!process.is_successful());

        let failure = process.resolve_error_output(&ErrorRegistry::new());
        assert!(failure.downcast_ref::<BadInput>().is_some());
        assert!(process.failure().is_some());
    }

    #[test]
    fn test_unhandled_error_propagates_from_trigger() {
        let mut process = SynchronousProcess::new(RunnableId::next(), Task::named("bad"), registry());
        process.start().unwrap();
        let err = process.trigger_error(&ErrorRegistry::new()).unwrap_err();
        assert!(err.failure().is_some());
    }

    #[test]
    fn test_panic_is_captured() {
        let mut process =
            SynchronousProcess::new(RunnableId::next(), Task::named("explode"), registry());
        process.start().unwrap();

        let failure = process.resolve_error_output(&ErrorRegistry::new());
        assert_eq!(failure.original_type(), Some("panic"));
        assert_eq!(failure.message(), "exploded");
    }

    #[test]
    fn test_unknown_task_fails_start() {
        let mut process =
            SynchronousProcess::new(RunnableId::next(), Task::named("missing"), registry());
        assert!(process.start().is_err());
    }
}
