//! Read-only snapshot of a pool.

use crate::process::RunnableId;
use std::fmt;

/// Counts per table plus one rendered line per failed runnable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStatus {
    pub queued: usize,
    pub in_progress: usize,
    pub finished: usize,
    pub failed: usize,
    pub timeouts: usize,
    /// Failed runnables and their failure rendering, in id order.
    pub failures: Vec<(RunnableId, String)>,
}

impl PoolStatus {
    /// Summary line without the failure details.
    pub fn summary(&self) -> String {
        format!(
            "queue: {} - in progress: {} - finished: {} - failed: {} - timeout: {}",
            self.queued, self.in_progress, self.finished, self.failed, self.timeouts
        )
    }
}

impl fmt::Display for PoolStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.summary())?;
        for (id, rendering) in &self.failures {
            write!(f, "\n{} failed with {}", id, rendering)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_line() {
        let status = PoolStatus {
            queued: 3,
            in_progress: 2,
            finished: 10,
            failed: 0,
            timeouts: 1,
            failures: Vec::new(),
        };
        assert_eq!(
            status.to_string(),
            "queue: 3 - in progress: 2 - finished: 10 - failed: 0 - timeout: 1"
        );
    }

    #[test]
    fn test_failure_lines() {
        let status = PoolStatus {
            queued: 0,
            in_progress: 0,
            finished: 0,
            failed: 2,
            timeouts: 0,
            failures: vec![
                (RunnableId::from_raw(4), "demo::DemoError: nope".into()),
                (RunnableId::from_raw(9), "deprecated flag".into()),
            ],
        };
        let rendered = status.to_string();
        let lines: Vec<_> = rendered.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[1], "4 failed with demo::DemoError: nope");
        assert_eq!(lines[2], "9 failed with deprecated flag");
    }
}
