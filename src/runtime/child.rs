//! Child process main entry point.
//!
//! Runs when a binary is invoked as
//! `<binary> --forkpool-child <bootstrap-dir> <encoded-task> <output-cap>`.
//! It decodes one task, runs it and reports the outcome on stdout (success)
//! or stderr (failure) in the format of [`protocol`](super::protocol).

use super::protocol::{ChildFailure, ChildSuccess, SerializedError, encode_message};
use crate::task::{Task, TaskEncoder, TaskFailure, TaskRegistry};
use nix::unistd::{dup, dup2_stdout};
use serde_json::Value;
use std::any::Any;
use std::cell::RefCell;
use std::ffi::OsString;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::fd::OwnedFd;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::PathBuf;

/// Task completed and its result was written to stdout.
pub const EXIT_SUCCESS: i32 = 0;
/// Task failed, or its result was too large; details are on stderr.
pub const EXIT_FAILURE: i32 = 1;
/// The child could not start the task; plain text is on stderr.
pub const EXIT_STARTUP_ERROR: i32 = 2;

thread_local! {
    /// Location and backtrace of the last panic on this thread.
    static PANIC_TRACE: RefCell<Option<String>> = const { RefCell::new(None) };
}

/// Validated child arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildArgs {
    pub bootstrap_dir: PathBuf,
    pub encoded_task: String,
    pub max_output_bytes: usize,
}

impl ChildArgs {
    /// Parse the arguments following the child-runtime flag.
    pub fn parse(args: &[OsString]) -> Result<Self, String> {
        let bootstrap = args
            .first()
            .ok_or_else(|| "missing bootstrap directory argument".to_string())?;
        let bootstrap_dir = PathBuf::from(bootstrap);
        if !bootstrap_dir.is_dir() {
            return Err(format!(
                "bootstrap directory {} does not exist or is not a directory",
                bootstrap_dir.display()
            ));
        }

        let encoded_task = args
            .get(1)
            .and_then(|arg| arg.to_str())
            .map(str::to_string)
            .filter(|token| !token.trim().is_empty())
            .ok_or_else(|| "missing or empty task argument".to_string())?;

        let cap = args
            .get(2)
            .and_then(|arg| arg.to_str())
            .ok_or_else(|| "missing output cap argument".to_string())?;
        let max_output_bytes = cap
            .trim()
            .parse()
            .map_err(|_| format!("invalid output cap: {cap:?}"))?;

        Ok(Self {
            bootstrap_dir,
            encoded_task,
            max_output_bytes,
        })
    }
}

/// What the child writes before exiting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Report {
    Stdout(String),
    Stderr(String),
}

impl Report {
    fn exit_code(&self) -> i32 {
        match self {
            Report::Stdout(_) => EXIT_SUCCESS,
            Report::Stderr(_) => EXIT_FAILURE,
        }
    }

    fn write(&self) -> io::Result<()> {
        match self {
            Report::Stdout(text) => {
                let mut out = io::stdout().lock();
                out.write_all(text.as_bytes())?;
                out.flush()
            }
            Report::Stderr(text) => {
                let mut err = io::stderr().lock();
                err.write_all(text.as_bytes())?;
                err.flush()
            }
        }
    }
}

/// Encode a successful result, enforcing the output cap.
pub(crate) fn report_success(
    output: Value,
    other_output: String,
    limit: usize,
) -> serde_json::Result<Report> {
    let encoded = encode_message(&ChildSuccess {
        output,
        other_output,
    })?;
    if encoded.len() > limit {
        return report_failure(ChildFailure::OutputTooLarge {
            limit,
            size: encoded.len(),
        });
    }
    Ok(Report::Stdout(encoded))
}

pub(crate) fn report_failure(failure: ChildFailure) -> serde_json::Result<Report> {
    Ok(Report::Stderr(encode_message(&failure)?))
}

/// Build the record of a caught panic.
pub(crate) fn panic_record(payload: &(dyn Any + Send), trace: String) -> SerializedError {
    let message = if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "Box<dyn Any>".to_string()
    };
    SerializedError::new("panic", message, trace)
}

/// Route fd 1 into a temp file while a task runs.
struct StdoutCapture {
    file: File,
    /// Duplicate of the original stdout, closed on drop.
    saved: OwnedFd,
}

impl StdoutCapture {
    fn begin() -> io::Result<Self> {
        io::stdout().flush()?;
        let file = tempfile::tempfile()?;
        let saved = dup(io::stdout())?;
        dup2_stdout(&file)?;
        Ok(Self { file, saved })
    }

    /// Restore the original stdout and return what was captured.
    fn finish(mut self) -> io::Result<String> {
        io::stdout().flush()?;
        dup2_stdout(&self.saved)?;

        self.file.seek(SeekFrom::Start(0))?;
        let mut bytes = Vec::new();
        self.file.read_to_end(&mut bytes)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

/// Runs a single task inside a child process.
pub struct ChildRuntime<'a> {
    registry: &'a TaskRegistry,
}

impl<'a> ChildRuntime<'a> {
    pub fn new(registry: &'a TaskRegistry) -> Self {
        Self { registry }
    }

    /// Run the child and return its exit code.
    pub fn run(&self, args: &[OsString]) -> i32 {
        match self.execute(args) {
            Ok(report) => match report.write() {
                Ok(()) => report.exit_code(),
                Err(e) => {
                    eprintln!("forkpool child: failed to write result: {}", e);
                    EXIT_FAILURE
                }
            },
            Err(msg) => {
                eprintln!("forkpool child: {}", msg);
                EXIT_STARTUP_ERROR
            }
        }
    }

    /// Everything up to (not including) writing the report.
    ///
    /// `Err` is a startup error that prevented the task from running.
    fn execute(&self, args: &[OsString]) -> Result<Report, String> {
        let args = ChildArgs::parse(args)?;
        std::env::set_current_dir(&args.bootstrap_dir).map_err(|e| {
            format!(
                "cannot enter bootstrap directory {}: {}",
                args.bootstrap_dir.display(),
                e
            )
        })?;

        let task = TaskEncoder::default()
            .decode(&args.encoded_task)
            .map_err(|e| format!("cannot decode task: {}", e))?;
        if !self.registry.contains(&task.name) {
            return Err(format!("unknown task: {}", task.name));
        }

        let (outcome, other_output) = self.invoke_captured(&task)?;
        let report = match outcome {
            Ok(value) => report_success(value, other_output, args.max_output_bytes),
            Err(failure) => report_failure(ChildFailure::Task(failure.record)),
        };
        report.map_err(|e| format!("cannot encode result: {}", e))
    }

    /// Invoke the task with stdout captured and panics caught.
    fn invoke_captured(
        &self,
        task: &Task,
    ) -> Result<(Result<Value, TaskFailure>, String), String> {
        install_silent_panic_hook();
        let capture =
            StdoutCapture::begin().map_err(|e| format!("cannot capture stdout: {}", e))?;

        let outcome = catch_unwind(AssertUnwindSafe(|| self.registry.invoke(task)));

        let other_output = capture
            .finish()
            .map_err(|e| format!("cannot restore stdout: {}", e))?;

        let outcome = match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => return Err(e.to_string()),
            Err(payload) => {
                let trace = PANIC_TRACE.with(|slot| slot.borrow_mut().take());
                Err(TaskFailure::from_record(panic_record(
                    payload.as_ref(),
                    trace.unwrap_or_default(),
                )))
            }
        };
        Ok((outcome, other_output))
    }
}

/// Replace the default hook so panics are reported only through the
/// failure envelope.
fn install_silent_panic_hook() {
    std::panic::set_hook(Box::new(|info| {
        let mut trace = String::new();
        if let Some(location) = info.location() {
            trace.push_str(&format!("panicked at {}\n", location));
        }
        trace.push_str(&std::backtrace::Backtrace::force_capture().to_string());
        PANIC_TRACE.with(|slot| *slot.borrow_mut() = Some(trace));
    }));
}
