//! Runnable backed by a child process.

use super::callbacks::ProcessCallbacks;
use super::proc::ChildProc;
use super::signals::TerminationReason;
use super::spawn::ChildCommand;
use super::{ErrorOutput, Runnable, RunnableId, resolve_failure};
use crate::error::{ForkpoolError, Result};
use crate::failure::{ErrorRegistry, ParallelFailure};
use crate::runtime::protocol::{ChildFailure, ChildSuccess, decode_message};
use crate::task::TaskEnvelope;
use serde_json::Value;
use std::path::PathBuf;
use std::time::{Duration, Instant};

/// Decoded contents of both output streams, read once after exit.
#[derive(Debug, Default)]
struct Streams {
    output: Option<Value>,
    other_output: Option<String>,
    error_output: Option<ErrorOutput>,
}

impl Streams {
    /// Classify raw stdout/stderr text.
    fn decode(stdout: &str, stderr: &str, termination: Option<TerminationReason>) -> Self {
        let mut streams = Self::default();

        if !stdout.trim().is_empty() {
            match decode_message::<ChildSuccess>(stdout) {
                Some(success) => {
                    streams.output = Some(success.output);
                    if !success.other_output.is_empty() {
                        streams.other_output = Some(success.other_output);
                    }
                }
                // Undecodable stdout is kept verbatim as an error.
                None => streams.error_output = Some(ErrorOutput::Raw(stdout.to_string())),
            }
        }

        if !stderr.trim().is_empty() {
            streams.error_output = Some(match decode_message::<ChildFailure>(stderr) {
                Some(failure) => ErrorOutput::Structured(failure),
                None => ErrorOutput::Raw(stderr.to_string()),
            });
        }

        if streams.output.is_none()
            && streams.error_output.is_none()
            && termination.is_some_and(|reason| reason.is_success())
        {
            streams.error_output = Some(ErrorOutput::Raw(
                "Child process exited without producing a result".to_string(),
            ));
        }

        streams
    }
}

/// A task running in a child process.
pub struct ParallelProcess {
    id: RunnableId,
    task_name: String,
    command: ChildCommand,
    /// Spilled payload, removed on drop if the child has not consumed it.
    spilled: Option<PathBuf>,
    proc: Option<ChildProc>,
    started_at: Option<Instant>,
    streams: Option<Streams>,
    failure: Option<ParallelFailure>,
    callbacks: ProcessCallbacks,
}

impl ParallelProcess {
    pub fn new(id: RunnableId, task_name: impl Into<String>, command: ChildCommand) -> Self {
        let spilled = TaskEnvelope::spilled_path(&command.encoded_task);
        Self {
            id,
            task_name: task_name.into(),
            command,
            spilled,
            proc: None,
            started_at: None,
            streams: None,
            failure: None,
            callbacks: ProcessCallbacks::default(),
        }
    }

    pub fn command(&self) -> &ChildCommand {
        &self.command
    }

    pub fn termination(&self) -> Option<TerminationReason> {
        self.proc.as_ref().and_then(ChildProc::termination)
    }

    /// Read and decode both streams once the child has been reaped. This
    /// closes the output files.
    fn collect_streams(&mut self) {
        if self.streams.is_some() {
            return;
        }
        let Some(termination) = self.termination() else {
            return;
        };
        if let Some(proc) = self.proc.as_mut() {
            let streams = match proc.take_output() {
                Ok((stdout, stderr)) => Streams::decode(&stdout, &stderr, Some(termination)),
                Err(e) => Streams {
                    error_output: Some(ErrorOutput::Raw(format!(
                        "Failed to read child process output: {}",
                        e
                    ))),
                    ..Streams::default()
                },
            };
            self.streams = Some(streams);
        }
    }

    fn streams(&mut self) -> Option<&Streams> {
        self.collect_streams();
        self.streams.as_ref()
    }
}

impl Runnable for ParallelProcess {
    fn id(&self) -> RunnableId {
        self.id
    }

    fn pid(&self) -> Option<u32> {
        self.proc.as_ref().map(ChildProc::pid)
    }

    fn task_name(&self) -> &str {
        &self.task_name
    }

    fn start(&mut self) -> Result<()> {
        if self.proc.is_some() {
            return Err(ForkpoolError::Process(format!(
                "Runnable {} was already started",
                self.id
            )));
        }
        let proc = self.command.spawn()?;
        tracing::debug!(
            id = %self.id,
            pid = proc.pid(),
            task = %self.task_name,
            "Started child process"
        );
        self.started_at = Some(Instant::now());
        self.proc = Some(proc);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        if let Some(proc) = self.proc.as_mut() {
            proc.kill()?;
            self.collect_streams();
        }
        Ok(())
    }

    fn poll_exit(&mut self) -> Result<Option<TerminationReason>> {
        let reason = match self.proc.as_mut() {
            Some(proc) => proc.try_wait()?,
            None => None,
        };
        if reason.is_some() {
            self.collect_streams();
        }
        Ok(reason)
    }

    fn is_running(&self) -> bool {
        self.proc.is_some() && self.termination().is_none()
    }

    fn is_successful(&self) -> bool {
        self.termination().is_some_and(|reason| reason.is_success())
    }

    fn is_terminated(&self) -> bool {
        self.termination().is_some()
    }

    fn output(&mut self) -> Option<&Value> {
        self.streams()?.output.as_ref()
    }

    fn other_output(&mut self) -> Option<&str> {
        self.streams()?.other_output.as_deref()
    }

    fn error_output(&mut self) -> Option<&ErrorOutput> {
        self.streams()?.error_output.as_ref()
    }

    fn current_execution_time(&self) -> Duration {
        self.started_at
            .map(|started| started.elapsed())
            .unwrap_or_default()
    }

    fn callbacks(&mut self) -> &mut ProcessCallbacks {
        &mut self.callbacks
    }

    fn failure(&self) -> Option<&ParallelFailure> {
        self.failure.as_ref()
    }

    fn resolve_error_output(&mut self, errors: &ErrorRegistry) -> ParallelFailure {
        let error_output = self.error_output().cloned();
        let failure = resolve_failure(error_output, self.termination(), errors);
        self.failure = Some(failure.clone());
        failure
    }

    fn record_failure(&mut self, failure: ParallelFailure) {
        self.failure = Some(failure);
    }
}

impl Drop for ParallelProcess {
    fn drop(&mut self) {
        if let Some(path) = &self.spilled {
            match std::fs::remove_file(path) {
                Ok(()) => tracing::debug!(
                    id = %self.id,
                    path = %path.display(),
                    "Removed unconsumed task payload"
                ),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!(
                    id = %self.id,
                    path = %path.display(),
                    error = %e,
                    "Failed to remove task payload"
                ),
            }
        }
    }
}

impl std::fmt::Debug for ParallelProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParallelProcess")
            .field("id", &self.id)
            .field("task", &self.task_name)
            .field("proc", &self.proc)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::protocol::{SerializedError, encode_message};
    use crate::task::{Task, TaskEncoder, TempFileStore};
    use serde_json::json;

    fn success_line(output: Value, other: &str) -> String {
        encode_message(&ChildSuccess {
            output,
            other_output: other.to_string(),
        })
        .unwrap()
    }

    #[test]
    fn test_decode_success() {
        let streams = Streams::decode(
            &success_line(json!(2), "hello\n"),
            "",
            Some(TerminationReason::Exited(0)),
        );
        assert_eq!(streams.output, Some(json!(2)));
        assert_eq!(streams.other_output.as_deref(), Some("hello\n"));
        assert!(streams.error_output.is_none());
    }

    #[test]
    fn test_decode_stderr_next_to_success_is_an_error() {
        let streams = Streams::decode(
            &success_line(json!(2), ""),
            "deprecated flag\n",
            Some(TerminationReason::Exited(0)),
        );
        assert_eq!(streams.output, Some(json!(2)));
        assert!(matches!(
            streams.error_output,
            Some(ErrorOutput::Raw(ref text)) if text == "deprecated flag\n"
        ));
    }

    #[test]
    fn test_decode_garbage_stdout_is_kept_verbatim() {
        let streams = Streams::decode("not base64 {", "", Some(TerminationReason::Exited(0)));
        assert!(streams.output.is_none());
        assert!(matches!(
            streams.error_output,
            Some(ErrorOutput::Raw(ref text)) if text == "not base64 {"
        ));
    }

    #[test]
    fn test_decode_structured_failure() {
        let failure = ChildFailure::Task(SerializedError::new("panic", "oops", ""));
        let streams = Streams::decode(
            "",
            &encode_message(&failure).unwrap(),
            Some(TerminationReason::Exited(1)),
        );
        assert!(matches!(
            streams.error_output,
            Some(ErrorOutput::Structured(ChildFailure::Task(_)))
        ));
    }

    #[test]
    fn test_decode_clean_exit_without_result() {
        let streams = Streams::decode("", "", Some(TerminationReason::Exited(0)));
        assert!(matches!(streams.error_output, Some(ErrorOutput::Raw(_))));

        let killed = Streams::decode("", "", Some(TerminationReason::Killed));
        assert!(killed.error_output.is_none());
    }

    #[test]
    fn test_shell_child_writing_to_stderr() {
        let command = ChildCommand {
            binary: PathBuf::from("sh"),
            bootstrap_dir: PathBuf::from("/"),
            encoded_task: String::new(),
            max_output_bytes: 1024,
        };
        // `sh --forkpool-child ...` fails with a usage error on stderr,
        // which is exactly the unstructured output case.
        let mut process = ParallelProcess::new(RunnableId::next(), "sh", command);
        process.start().unwrap();
        assert!(process.pid().is_some());
        while process.poll_exit().unwrap().is_none() {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(process.is_terminated());
        assert!(!process.is_successful());
        assert!(matches!(
            process.resolve_error_output(&ErrorRegistry::new()),
            ParallelFailure::Parallel(_)
        ));
    }

    #[test]
    fn test_unstarted_process_removes_spilled_payload() {
        let dir = tempfile::tempdir().unwrap();
        let encoder = TaskEncoder::with_store(TempFileStore::in_dir(dir.path()), 16);
        let task = Task::new("echo", &json!({"text": "x".repeat(128)})).unwrap();
        let command = ChildCommand {
            binary: PathBuf::from("/nonexistent/forkpool-host"),
            bootstrap_dir: PathBuf::from("/"),
            encoded_task: encoder.encode(&task).unwrap(),
            max_output_bytes: 1024,
        };
        let spilled = TaskEnvelope::spilled_path(&command.encoded_task).unwrap();
        assert!(spilled.exists());

        let mut process = ParallelProcess::new(RunnableId::next(), "echo", command);
        assert!(process.start().is_err());
        drop(process);
        assert!(!spilled.exists());
    }

    #[test]
    fn test_output_files_close_after_exit() {
        let command = ChildCommand {
            binary: PathBuf::from("true"),
            bootstrap_dir: PathBuf::from("/"),
            encoded_task: String::new(),
            max_output_bytes: 1024,
        };
        let mut process = ParallelProcess::new(RunnableId::next(), "true", command);
        process.start().unwrap();
        while process.poll_exit().unwrap().is_none() {
            std::thread::sleep(Duration::from_millis(5));
        }
        // Streams were read at exit, so the files are gone but the
        // decoded outcome is still available.
        assert!(process.proc.as_mut().unwrap().take_output().is_err());
        assert!(matches!(process.error_output(), Some(ErrorOutput::Raw(_))));
    }
}
