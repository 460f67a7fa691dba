//! Pool configuration.

use crate::error::{ForkpoolError, Result};
use crate::task::DEFAULT_MAX_INLINE_BYTES;
use std::path::PathBuf;
use std::time::Duration;

/// Default number of concurrently running children.
pub const DEFAULT_CONCURRENCY: usize = 20;
/// Default per-task timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);
/// Default pause between sweeps when nothing changed.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);
/// Default cap on a child's encoded result (10 KiB).
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 10 * 1024;

/// How terminated children are noticed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reaping {
    /// Check every in-progress child on each sweep after `poll_interval`.
    Poll,
    /// Wake up early when SIGCHLD arrives.
    Signal,
}

impl Default for Reaping {
    fn default() -> Self {
        if cfg!(unix) { Reaping::Signal } else { Reaping::Poll }
    }
}

/// Configuration for a [`Pool`](super::Pool).
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of runnables in progress at once.
    pub concurrency: usize,
    /// Wall-clock budget per runnable.
    pub timeout: Duration,
    /// Pause between sweeps when nothing changed.
    pub poll_interval: Duration,
    /// Binary hosting the child runtime (default: current executable).
    pub binary: Option<PathBuf>,
    /// Working directory for children (default: current directory).
    pub bootstrap_dir: Option<PathBuf>,
    /// Encoded task size above which the payload is spilled to a file.
    pub max_task_payload_bytes: usize,
    /// Cap on the encoded result of a child.
    pub max_output_bytes: usize,
    /// Run tasks inline instead of in child processes.
    pub force_synchronous: bool,
    pub reaping: Reaping,
    /// Do not keep results of finished runnables.
    pub memory_efficient: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            timeout: DEFAULT_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            binary: None,
            bootstrap_dir: None,
            max_task_payload_bytes: DEFAULT_MAX_INLINE_BYTES,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            force_synchronous: false,
            reaping: Reaping::default(),
            memory_efficient: false,
        }
    }
}

impl PoolConfig {
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.binary = Some(binary.into());
        self
    }

    pub fn bootstrap_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.bootstrap_dir = Some(dir.into());
        self
    }

    pub fn max_task_payload(mut self, bytes: usize) -> Self {
        self.max_task_payload_bytes = bytes;
        self
    }

    pub fn max_output(mut self, bytes: usize) -> Self {
        self.max_output_bytes = bytes;
        self
    }

    pub fn force_synchronous(mut self, force: bool) -> Self {
        self.force_synchronous = force;
        self
    }

    pub fn reaping(mut self, reaping: Reaping) -> Self {
        self.reaping = reaping;
        self
    }

    pub fn memory_efficient(mut self, enabled: bool) -> Self {
        self.memory_efficient = enabled;
        self
    }

    /// Apply overrides from `FORKPOOL_*` environment variables.
    ///
    /// Recognized: `FORKPOOL_CONCURRENCY`, `FORKPOOL_TIMEOUT_SECS`,
    /// `FORKPOOL_POLL_INTERVAL_MS`, `FORKPOOL_BINARY`,
    /// `FORKPOOL_MAX_TASK_PAYLOAD`, `FORKPOOL_MAX_OUTPUT` and
    /// `FORKPOOL_FORCE_SYNC`.
    pub fn with_env_overrides(self) -> Result<Self> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(n) = parse_var(&lookup, "FORKPOOL_CONCURRENCY")? {
            self.concurrency = n;
        }
        if let Some(secs) = parse_var(&lookup, "FORKPOOL_TIMEOUT_SECS")? {
            self.timeout = Duration::from_secs(secs);
        }
        if let Some(ms) = parse_var(&lookup, "FORKPOOL_POLL_INTERVAL_MS")? {
            self.poll_interval = Duration::from_millis(ms);
        }
        if let Some(binary) = lookup("FORKPOOL_BINARY").filter(|v| !v.is_empty()) {
            self.binary = Some(PathBuf::from(binary));
        }
        if let Some(n) = parse_var(&lookup, "FORKPOOL_MAX_TASK_PAYLOAD")? {
            self.max_task_payload_bytes = n;
        }
        if let Some(n) = parse_var(&lookup, "FORKPOOL_MAX_OUTPUT")? {
            self.max_output_bytes = n;
        }
        if let Some(value) = lookup("FORKPOOL_FORCE_SYNC") {
            self.force_synchronous = parse_bool("FORKPOOL_FORCE_SYNC", &value)?;
        }
        self.validate()?;
        Ok(self)
    }

    /// Check invariants the scheduler relies on.
    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(ForkpoolError::Config(
                "concurrency must be at least 1".into(),
            ));
        }
        if self.timeout.is_zero() {
            return Err(ForkpoolError::Config("timeout must be positive".into()));
        }
        Ok(())
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>> {
    match lookup(key) {
        None => Ok(None),
        Some(value) if value.trim().is_empty() => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ForkpoolError::Config(format!("invalid {}: {:?}", key, value))),
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "" | "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ForkpoolError::Config(format!(
            "invalid {}: {:?}",
            key, value
        ))),
    }
}
