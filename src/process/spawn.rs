//! Child runtime spawning.
//!
//! Children are started with `std::process::Command` (posix_spawn/fork+exec
//! under the hood) re-invoking a binary in child-runtime mode.

use super::proc::ChildProc;
use crate::error::{ForkpoolError, Result};
use crate::runtime::CHILD_RUNTIME_FLAG;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

/// Everything needed to launch one child runtime.
#[derive(Debug, Clone)]
pub struct ChildCommand {
    /// Executable hosting the child runtime.
    pub binary: PathBuf,
    /// Working directory the child runtime switches to.
    pub bootstrap_dir: PathBuf,
    /// Encoded task token.
    pub encoded_task: String,
    /// Cap on the encoded result, in bytes.
    pub max_output_bytes: usize,
}

impl ChildCommand {
    /// Arguments after the binary:
    /// `[--forkpool-child, bootstrap-dir, encoded-task, output-cap]`.
    pub fn args(&self) -> Vec<OsString> {
        vec![
            OsString::from(CHILD_RUNTIME_FLAG),
            self.bootstrap_dir.clone().into_os_string(),
            OsString::from(&self.encoded_task),
            OsString::from(self.max_output_bytes.to_string()),
        ]
    }

    /// Spawn the child with its output streams redirected to temp files.
    pub fn spawn(&self) -> Result<ChildProc> {
        let stdout = tempfile::tempfile()
            .map_err(|e| ForkpoolError::Spawn(format!("Failed to create stdout file: {}", e)))?;
        let stderr = tempfile::tempfile()
            .map_err(|e| ForkpoolError::Spawn(format!("Failed to create stderr file: {}", e)))?;

        let mut cmd = Command::new(&self.binary);
        cmd.args(self.args());
        cmd.stdin(Stdio::null());
        cmd.stdout(stdout.try_clone()?);
        cmd.stderr(stderr.try_clone()?);

        let child = cmd.spawn().map_err(|e| {
            ForkpoolError::Spawn(format!("{}: {}", self.binary.display(), e))
        })?;

        Ok(ChildProc::from_child(child, stdout, stderr))
    }
}

/// Resolve the binary used for child runtimes: an explicit path, or the
/// currently running executable.
pub fn resolve_binary(explicit: Option<&Path>) -> Result<PathBuf> {
    match explicit {
        Some(path) => Ok(path.to_path_buf()),
        None => std::env::current_exe().map_err(|e| {
            ForkpoolError::Spawn(format!("Failed to get current executable: {}", e))
        }),
    }
}
