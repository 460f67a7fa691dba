//! Process handle for child runtimes.
//!
//! Wraps a spawned child whose stdout and stderr are redirected to
//! anonymous temp files, so a child can write any amount of output without
//! blocking on a full pipe while the parent is busy elsewhere.

use super::signals::{TerminationReason, analyze_wait_status};
use crate::error::{ForkpoolError, Result};
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::time::Duration;

/// Handle to a child process and its captured output streams.
pub struct ChildProc {
    /// Process ID
    pid: Pid,
    /// Files receiving the child's stdout and stderr, until read
    output: Option<(File, File)>,
    /// How the process terminated, once reaped
    reason: Option<TerminationReason>,
}

impl ChildProc {
    /// Create from a spawned `std::process::Child` and the parent's handles
    /// to the files its stdout and stderr were redirected to.
    pub fn from_child(child: std::process::Child, stdout: File, stderr: File) -> Self {
        // Reaping goes through waitpid on the raw pid; the Child handle is
        // not used again.
        let pid = Pid::from_raw(child.id() as i32);
        Self {
            pid,
            output: Some((stdout, stderr)),
            reason: None,
        }
    }

    /// Get the process ID.
    pub fn pid(&self) -> u32 {
        self.pid.as_raw() as u32
    }

    /// Termination reason, if the process has been reaped.
    pub fn termination(&self) -> Option<TerminationReason> {
        self.reason
    }

    /// Try to wait for the process (non-blocking).
    ///
    /// Returns `None` if the process is still running. Once reaped, the
    /// recorded reason is returned on every call.
    pub fn try_wait(&mut self) -> Result<Option<TerminationReason>> {
        if let Some(reason) = self.reason {
            return Ok(Some(reason));
        }
        match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => Ok(None),
            Ok(status) => {
                let reason = analyze_wait_status(status);
                self.reason = Some(reason);
                Ok(Some(reason))
            }
            Err(e) => Err(ForkpoolError::Process(format!(
                "waitpid({}) failed: {}",
                self.pid, e
            ))),
        }
    }

    /// Wait for the process to exit (blocking).
    pub fn wait(&mut self) -> Result<TerminationReason> {
        if let Some(reason) = self.reason {
            return Ok(reason);
        }
        match waitpid(self.pid, None) {
            Ok(status) => {
                let reason = analyze_wait_status(status);
                self.reason = Some(reason);
                Ok(reason)
            }
            Err(e) => Err(ForkpoolError::Process(format!(
                "waitpid({}) failed: {}",
                self.pid, e
            ))),
        }
    }

    /// Send SIGTERM to the process.
    pub fn terminate(&self) -> Result<()> {
        if self.reason.is_some() {
            return Ok(());
        }
        signal::kill(self.pid, Signal::SIGTERM)
            .map_err(|e| ForkpoolError::Process(format!("Failed to send SIGTERM: {}", e)))
    }

    /// Send SIGKILL to the process and wait for it to exit.
    pub fn kill(&mut self) -> Result<TerminationReason> {
        if let Some(reason) = self.reason {
            return Ok(reason);
        }
        signal::kill(self.pid, Signal::SIGKILL)
            .map_err(|e| ForkpoolError::Process(format!("Failed to send SIGKILL: {}", e)))?;
        self.wait()
    }

    /// Read everything the child wrote to stdout and stderr, then close
    /// both files.
    ///
    /// The files can be read once; later calls fail.
    pub fn take_output(&mut self) -> Result<(String, String)> {
        let (mut stdout, mut stderr) = self.output.take().ok_or_else(|| {
            ForkpoolError::Process(format!("Output of process {} was already read", self.pid))
        })?;
        Ok((read_all(&mut stdout)?, read_all(&mut stderr)?))
    }
}

fn read_all(file: &mut File) -> Result<String> {
    file.seek(SeekFrom::Start(0))?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

impl Drop for ChildProc {
    fn drop(&mut self) {
        if self.reason.is_none() {
            // Try graceful termination
            let _ = self.terminate();
            std::thread::sleep(Duration::from_millis(10));

            if let Ok(Some(_)) = self.try_wait() {
                return;
            }

            // Force kill
            let _ = signal::kill(self.pid, Signal::SIGKILL);
            let _ = waitpid(self.pid, None);
            self.reason = Some(TerminationReason::Killed);
        }
    }
}

impl std::fmt::Debug for ChildProc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChildProc")
            .field("pid", &self.pid)
            .field("reason", &self.reason)
            .field("output_open", &self.output.is_some())
            .finish()
    }
}
