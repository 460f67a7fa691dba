//! Termination analysis for child processes.

use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;
use std::fmt;

/// Why a child process stopped running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    /// Normal exit with status code.
    Exited(i32),
    /// Killed by signal.
    Signaled(Signal),
    /// Killed by SIGKILL (forced stop, or the OOM killer).
    Killed,
    /// Segmentation fault (SIGSEGV), commonly a stack overflow.
    SegmentationFault,
    /// Bus error (SIGBUS), a stack overflow on macOS.
    BusError,
    /// Unknown termination reason.
    Unknown,
}

impl TerminationReason {
    /// Check if this is a successful exit.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Exited(0))
    }

    /// Exit code, if the process exited normally.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::Exited(code) => Some(*code),
            _ => None,
        }
    }

    /// Get a human-readable description.
    pub fn description(&self) -> String {
        match self {
            Self::Exited(code) => format!("exited with code {}", code),
            Self::Signaled(sig) => format!("killed by signal {:?}", sig),
            Self::Killed => "killed by SIGKILL".to_string(),
            Self::SegmentationFault => "crashed with a segmentation fault (SIGSEGV)".to_string(),
            Self::BusError => "crashed with a bus error (SIGBUS)".to_string(),
            Self::Unknown => "terminated for an unknown reason".to_string(),
        }
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Analyze a `WaitStatus` to determine the termination reason.
pub fn analyze_wait_status(status: WaitStatus) -> TerminationReason {
    match status {
        WaitStatus::Exited(_, code) => TerminationReason::Exited(code),

        WaitStatus::Signaled(_, signal, _) => match signal {
            Signal::SIGKILL => TerminationReason::Killed,
            Signal::SIGSEGV => TerminationReason::SegmentationFault,
            Signal::SIGBUS => TerminationReason::BusError,
            _ => TerminationReason::Signaled(signal),
        },

        _ => TerminationReason::Unknown,
    }
}
