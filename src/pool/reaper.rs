//! Wake-up source between scheduler sweeps.
//!
//! In signal mode a SIGCHLD handler raises a flag so the scheduler can
//! stop pausing as soon as a child exits. Reaping itself always happens on
//! the scheduler thread.

use super::config::Reaping;
use signal_hook::SigId;
use signal_hook::consts::SIGCHLD;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Granularity of the pause while waiting for SIGCHLD.
const SIGNAL_SLICE: Duration = Duration::from_millis(1);

pub(crate) struct Reaper {
    /// Set by the SIGCHLD handler. Starts raised so the first sweep checks.
    child_exited: Arc<AtomicBool>,
    sig_id: Option<SigId>,
}

impl Reaper {
    pub(crate) fn new(mode: Reaping) -> Self {
        let child_exited = Arc::new(AtomicBool::new(true));
        let sig_id = match mode {
            Reaping::Poll => None,
            Reaping::Signal => {
                match signal_hook::flag::register(SIGCHLD, Arc::clone(&child_exited)) {
                    Ok(id) => Some(id),
                    Err(e) => {
                        tracing::warn!(
                            error = %e,
                            "Failed to register SIGCHLD handler, falling back to polling"
                        );
                        None
                    }
                }
            }
        };
        Self {
            child_exited,
            sig_id,
        }
    }

    /// Whether a SIGCHLD handler is installed.
    pub(crate) fn is_signal_driven(&self) -> bool {
        self.sig_id.is_some()
    }

    /// Consume a pending SIGCHLD notification.
    pub(crate) fn take_notification(&self) -> bool {
        self.child_exited.swap(false, Ordering::AcqRel)
    }

    /// Pause between sweeps.
    ///
    /// Returns early when a child exits in signal mode.
    pub(crate) fn pause(&self, interval: Duration) {
        if !self.is_signal_driven() {
            std::thread::sleep(interval);
            return;
        }

        let deadline = Instant::now() + interval;
        while !self.child_exited.load(Ordering::Acquire) {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            std::thread::sleep(SIGNAL_SLICE.min(deadline - now));
        }
    }
}

impl Drop for Reaper {
    fn drop(&mut self) {
        if let Some(id) = self.sig_id.take() {
            signal_hook::low_level::unregister(id);
        }
    }
}

impl std::fmt::Debug for Reaper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reaper")
            .field("signal_driven", &self.is_signal_driven())
            .field("pending", &self.child_exited.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;

    #[test]
    fn test_poll_mode_sleeps_full_interval() {
        let reaper = Reaper::new(Reaping::Poll);
        assert!(!reaper.is_signal_driven());
        assert!(reaper.take_notification());
        assert!(!reaper.take_notification());

        let started = Instant::now();
        reaper.pause(Duration::from_millis(20));
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_signal_mode_notices_child_exit() {
        let reaper = Reaper::new(Reaping::Signal);
        assert!(reaper.is_signal_driven());
        reaper.take_notification();

        let status = Command::new("true").status().unwrap();
        assert!(status.success());

        // Delivery is asynchronous; the pause returns once the flag is up.
        reaper.pause(Duration::from_secs(5));
        assert!(reaper.take_notification());
    }
}
