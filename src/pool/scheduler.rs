//! The pool scheduler.

use super::config::{PoolConfig, Reaping};
use super::reaper::Reaper;
use super::status::PoolStatus;
use crate::error::{ForkpoolError, Result};
use crate::failure::ErrorRegistry;
use crate::process::{
    ChildCommand, ParallelProcess, Runnable, RunnableHandle, RunnableId, SynchronousProcess,
    TerminationReason, resolve_binary,
};
use crate::task::{Task, TaskEncoder, TaskRegistry};
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, instrument, trace, warn};

type Table = BTreeMap<RunnableId, Box<dyn Runnable>>;

/// Runs tasks in child processes, at most `concurrency` at a time.
///
/// Runnables move from the queue to the in-progress table and from there
/// to exactly one of the finished, failed or timeout tables.
pub struct Pool {
    config: PoolConfig,
    registry: Option<Arc<TaskRegistry>>,
    errors: ErrorRegistry,
    queue: VecDeque<Box<dyn Runnable>>,
    in_progress: Table,
    finished: Table,
    failed: Table,
    timeouts: Table,
    results: Vec<Value>,
    finished_count: usize,
    failed_count: usize,
    timeout_count: usize,
    stopped: bool,
    /// Installed on the first `wait`.
    reaper: Option<Reaper>,
}

impl Pool {
    /// Pool with the default configuration.
    pub fn create() -> Self {
        Self::new(PoolConfig::default())
    }

    /// Pool running with `config`. A concurrency of zero is raised to one.
    pub fn new(mut config: PoolConfig) -> Self {
        config.concurrency = config.concurrency.max(1);
        Self {
            config,
            registry: None,
            errors: ErrorRegistry::new(),
            queue: VecDeque::new(),
            in_progress: BTreeMap::new(),
            finished: BTreeMap::new(),
            failed: BTreeMap::new(),
            timeouts: BTreeMap::new(),
            results: Vec::new(),
            finished_count: 0,
            failed_count: 0,
            timeout_count: 0,
            stopped: false,
            reaper: None,
        }
    }

    /// Whether this platform can run tasks in child processes.
    pub fn is_supported() -> bool {
        cfg!(unix)
    }

    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.config.concurrency = concurrency.max(1);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = interval;
        self
    }

    pub fn binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.config.binary = Some(binary.into());
        self
    }

    pub fn bootstrap_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.bootstrap_dir = Some(dir.into());
        self
    }

    pub fn max_task_payload(mut self, bytes: usize) -> Self {
        self.config.max_task_payload_bytes = bytes;
        self
    }

    pub fn max_output(mut self, bytes: usize) -> Self {
        self.config.max_output_bytes = bytes;
        self
    }

    pub fn force_synchronous(mut self, force: bool) -> Self {
        self.config.force_synchronous = force;
        self
    }

    pub fn reaping(mut self, reaping: Reaping) -> Self {
        self.config.reaping = reaping;
        self
    }

    pub fn memory_efficient(mut self, enabled: bool) -> Self {
        self.config.memory_efficient = enabled;
        self
    }

    /// Attach the task registry.
    ///
    /// Task names are validated against it on `add`, and synchronous
    /// execution runs its functions.
    pub fn with_registry(mut self, registry: Arc<TaskRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Attach the registry used to rebuild typed task errors.
    pub fn with_error_registry(mut self, errors: ErrorRegistry) -> Self {
        self.errors = errors;
        self
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Whether tasks run inline instead of in child processes.
    pub fn is_synchronous(&self) -> bool {
        self.config.force_synchronous || !Self::is_supported()
    }

    /// Queue a task and start it if a slot is free.
    pub fn add(&mut self, task: Task) -> Result<RunnableHandle<'_>> {
        let limit = self.config.max_output_bytes;
        self.add_with_output_limit(task, limit)
    }

    /// Queue a task with its own cap on the encoded result.
    ///
    /// If the new runnable cannot be started it is withdrawn from the pool
    /// before the error is returned.
    pub fn add_with_output_limit(
        &mut self,
        task: Task,
        max_output_bytes: usize,
    ) -> Result<RunnableHandle<'_>> {
        let runnable = self.build_runnable(task, max_output_bytes)?;
        let id = runnable.id();
        self.queue.push_back(runnable);
        if let Err(e) = self.notify() {
            if let Some(index) = self.queue.iter().position(|queued| queued.id() == id) {
                self.queue.remove(index);
            }
            return Err(e);
        }

        self.runnable_mut(id)
            .map(RunnableHandle::new)
            .ok_or_else(|| ForkpoolError::Process(format!("Runnable {} left the pool", id)))
    }

    fn build_runnable(&self, task: Task, max_output_bytes: usize) -> Result<Box<dyn Runnable>> {
        if let Some(registry) = &self.registry {
            if !registry.contains(&task.name) {
                return Err(ForkpoolError::UnknownTask(task.name));
            }
        }

        let id = RunnableId::next();
        if self.is_synchronous() {
            let registry = self.registry.clone().ok_or(ForkpoolError::MissingRegistry)?;
            return Ok(Box::new(SynchronousProcess::new(id, task, registry)));
        }

        let encoder = TaskEncoder::new(self.config.max_task_payload_bytes);
        let bootstrap_dir = match &self.config.bootstrap_dir {
            Some(dir) => dir.clone(),
            None => std::env::current_dir()?,
        };
        let command = ChildCommand {
            binary: resolve_binary(self.config.binary.as_deref())?,
            bootstrap_dir,
            encoded_task: encoder.encode(&task)?,
            max_output_bytes,
        };
        Ok(Box::new(ParallelProcess::new(id, task.name, command)))
    }

    fn runnable_mut(&mut self, id: RunnableId) -> Option<&mut dyn Runnable> {
        if let Some(runnable) = self.in_progress.get_mut(&id) {
            return Some(runnable.as_mut());
        }
        for runnable in self.queue.iter_mut() {
            if runnable.id() == id {
                return Some(runnable.as_mut());
            }
        }
        None
    }

    /// Promote queued runnables while slots are free.
    ///
    /// A runnable that fails to start goes back to the head of the queue.
    pub fn notify(&mut self) -> Result<()> {
        while !self.stopped && self.in_progress.len() < self.config.concurrency {
            let Some(mut runnable) = self.queue.pop_front() else {
                break;
            };
            if let Err(e) = runnable.start() {
                warn!(id = %runnable.id(), task = runnable.task_name(), error = %e, "Failed to start runnable");
                self.queue.push_front(runnable);
                return Err(e);
            }
            debug!(
                id = %runnable.id(),
                pid = ?runnable.pid(),
                task = runnable.task_name(),
                in_progress = self.in_progress.len() + 1,
                queued = self.queue.len(),
                "Admitted runnable"
            );
            self.in_progress.insert(runnable.id(), runnable);
        }
        Ok(())
    }

    /// Wait until every runnable has reached a terminal state.
    pub fn wait(&mut self) -> Result<Vec<Value>> {
        self.wait_with(|_| false)
    }

    /// Wait, calling `on_tick` after every sweep.
    ///
    /// Returning `true` from `on_tick` stops waiting; runnables still in
    /// progress are left running.
    #[instrument(level = "debug", skip_all, fields(queued = self.queue.len(), in_progress = self.in_progress.len()))]
    pub fn wait_with(&mut self, mut on_tick: impl FnMut(&Pool) -> bool) -> Result<Vec<Value>> {
        if self.reaper.is_none() {
            let mode = if self.is_synchronous() {
                Reaping::Poll
            } else {
                self.config.reaping
            };
            self.reaper = Some(Reaper::new(mode));
        }
        self.notify()?;

        while !self.in_progress.is_empty() {
            let changed = self.sweep()?;
            if on_tick(&*self) {
                debug!(
                    in_progress = self.in_progress.len(),
                    queued = self.queue.len(),
                    "Wait cancelled by tick callback"
                );
                break;
            }
            if !changed && !self.in_progress.is_empty() {
                self.pause();
            }
        }

        Ok(self.results.clone())
    }

    fn pause(&self) {
        match &self.reaper {
            Some(reaper) => reaper.pause(self.config.poll_interval),
            None => std::thread::sleep(self.config.poll_interval),
        }
    }

    /// Check every in-progress runnable once. Returns whether any of them
    /// reached a terminal state.
    fn sweep(&mut self) -> Result<bool> {
        let started = Instant::now();
        if let Some(reaper) = &self.reaper {
            reaper.take_notification();
        }

        let ids: Vec<RunnableId> = self.in_progress.keys().copied().collect();
        let mut changed = false;
        for id in ids {
            let Some(runnable) = self.in_progress.get_mut(&id) else {
                continue;
            };

            if runnable.current_execution_time() > self.config.timeout {
                self.mark_as_timed_out(id)?;
                changed = true;
                continue;
            }

            // Synchronous runnables report their exit right after start.
            if let Some(reason) = runnable.poll_exit()? {
                changed = true;
                self.reap(id, reason)?;
            }
        }

        trace!(
            elapsed_us = started.elapsed().as_micros(),
            in_progress = self.in_progress.len(),
            changed,
            "Sweep complete"
        );
        Ok(changed)
    }

    /// Classify a terminated runnable.
    fn reap(&mut self, id: RunnableId, reason: TerminationReason) -> Result<()> {
        let Some(runnable) = self.in_progress.get_mut(&id) else {
            return Ok(());
        };

        if reason.is_success() && runnable.error_output().is_none() {
            return self.mark_as_finished(id);
        }
        if !reason.is_success() && !runnable.is_synchronous() && reason.exit_code() != Some(1) {
            warn!(
                id = %id,
                pid = ?runnable.pid(),
                task = runnable.task_name(),
                reason = %reason,
                "Child process terminated abnormally"
            );
        }
        self.mark_as_failed(id)
    }

    /// Move a runnable to the finished table and fire its success callbacks.
    pub fn mark_as_finished(&mut self, id: RunnableId) -> Result<()> {
        let Some(runnable) = self.in_progress.remove(&id) else {
            return Ok(());
        };
        debug!(
            id = %id,
            task = runnable.task_name(),
            elapsed_ms = runnable.current_execution_time().as_millis(),
            "Runnable finished"
        );
        self.finished_count += 1;
        self.finished.insert(id, runnable);
        let admitted = self.notify();

        let outcome = match self.finished.get_mut(&id) {
            Some(runnable) => runnable.trigger_success(&self.errors),
            None => Ok(None),
        };
        if self.config.memory_efficient {
            self.finished.remove(&id);
        } else if let Ok(Some(value)) = &outcome {
            self.results.push(value.clone());
        }

        admitted?;
        outcome.map(|_| ())
    }

    /// Move a runnable to the failed table and fire its error callbacks.
    pub fn mark_as_failed(&mut self, id: RunnableId) -> Result<()> {
        let Some(runnable) = self.in_progress.remove(&id) else {
            return Ok(());
        };
        self.failed_count += 1;
        self.failed.insert(id, runnable);
        let admitted = self.notify();

        let outcome = match self.failed.get_mut(&id) {
            Some(runnable) => {
                let outcome = runnable.trigger_error(&self.errors);
                debug!(
                    id = %id,
                    task = runnable.task_name(),
                    failure = ?runnable.failure().map(|f| f.kind()),
                    handled = outcome.is_ok(),
                    "Runnable failed"
                );
                outcome
            }
            None => Ok(()),
        };

        admitted?;
        outcome
    }

    /// Kill a runnable that ran past the timeout and fire its timeout
    /// callbacks.
    pub fn mark_as_timed_out(&mut self, id: RunnableId) -> Result<()> {
        let Some(mut runnable) = self.in_progress.remove(&id) else {
            return Ok(());
        };
        warn!(
            id = %id,
            pid = ?runnable.pid(),
            task = runnable.task_name(),
            timeout_secs = self.config.timeout.as_secs_f64(),
            "Runnable timed out, stopping it"
        );
        if let Err(e) = runnable.stop() {
            warn!(id = %id, error = %e, "Failed to stop timed out runnable");
        }

        self.timeout_count += 1;
        self.timeouts.insert(id, runnable);
        if let Some(runnable) = self.timeouts.get_mut(&id) {
            runnable.trigger_timeout(self.config.timeout);
        }

        self.notify()
    }

    /// Stop admitting queued runnables. Work in progress still drains.
    pub fn stop(&mut self) {
        debug!(queued = self.queue.len(), "Pool stopped");
        self.stopped = true;
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    pub fn status(&self) -> PoolStatus {
        PoolStatus {
            queued: self.queue.len(),
            in_progress: self.in_progress.len(),
            finished: self.finished_count,
            failed: self.failed_count,
            timeouts: self.timeout_count,
            failures: self
                .failed
                .iter()
                .map(|(id, runnable)| {
                    let rendering = runnable
                        .failure()
                        .map(|failure| failure.to_string())
                        .unwrap_or_else(|| "an unknown error".to_string());
                    (*id, rendering)
                })
                .collect(),
        }
    }

    pub fn queue(&self) -> &VecDeque<Box<dyn Runnable>> {
        &self.queue
    }

    pub fn in_progress(&self) -> &BTreeMap<RunnableId, Box<dyn Runnable>> {
        &self.in_progress
    }

    pub fn finished(&self) -> &BTreeMap<RunnableId, Box<dyn Runnable>> {
        &self.finished
    }

    pub fn failed(&self) -> &BTreeMap<RunnableId, Box<dyn Runnable>> {
        &self.failed
    }

    pub fn timeouts(&self) -> &BTreeMap<RunnableId, Box<dyn Runnable>> {
        &self.timeouts
    }

    /// Outputs of finished runnables in completion order.
    pub fn results(&self) -> &[Value] {
        &self.results
    }

    pub fn clear_results(&mut self) {
        self.results.clear();
    }

    pub fn clear_finished(&mut self) {
        self.finished.clear();
        self.finished_count = 0;
    }

    pub fn clear_failed(&mut self) {
        self.failed.clear();
        self.failed_count = 0;
    }

    pub fn clear_timeouts(&mut self) {
        self.timeouts.clear();
        self.timeout_count = 0;
    }
}

impl Default for Pool {
    fn default() -> Self {
        Self::create()
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("config", &self.config)
            .field("status", &self.status().summary())
            .field("stopped", &self.stopped)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::failure::ParallelFailure;
    use std::cell::{Cell, RefCell};
    use std::convert::Infallible;
    use std::rc::Rc;
    use thiserror::Error;

    #[derive(Debug, Error)]
    #[error("rejected {0}")]
    struct Rejected(i64);

    fn registry() -> Arc<TaskRegistry> {
        let mut registry = TaskRegistry::new();
        registry
            .register("two", |_: Value| Ok::<_, Infallible>(2))
            .register("double", |n: i64| Ok::<_, Infallible>(n * 2))
            .register("reject", |n: i64| Err::<i64, _>(Rejected(n)))
            .register("nap", |ms: u64| {
                std::thread::sleep(Duration::from_millis(ms));
                Ok::<_, Infallible>(ms)
            });
        Arc::new(registry)
    }

    fn sync_pool() -> Pool {
        Pool::create()
            .force_synchronous(true)
            .with_registry(registry())
    }

    #[test]
    fn test_sum_of_results() {
        let mut pool = sync_pool();
        let total = Rc::new(Cell::new(0));
        for _ in 0..5 {
            let total = total.clone();
            pool.add(Task::named("two"))
                .unwrap()
                .then(move |value| total.set(total.get() + value.as_i64().unwrap()));
        }
        let results = pool.wait().unwrap();
        assert_eq!(total.get(), 10);
        assert_eq!(results.len(), 5);
        assert_eq!(pool.status().finished, 5);
    }

    #[test]
    fn test_concurrency_bounds_in_progress() {
        let mut pool = sync_pool().concurrency(2);
        for n in 0..6 {
            pool.add(Task::new("double", &n).unwrap()).unwrap();
        }
        assert_eq!(pool.in_progress().len(), 2);
        assert_eq!(pool.queue().len(), 4);

        let mut max_seen = 0;
        pool.wait_with(|pool| {
            max_seen = max_seen.max(pool.in_progress().len());
            false
        })
        .unwrap();
        assert!(max_seen <= 2);
        assert_eq!(pool.status().finished, 6);
    }

    #[test]
    fn test_typed_error_callback() {
        let mut pool = sync_pool();
        let seen = Rc::new(RefCell::new(None));
        let s = seen.clone();
        pool.add(Task::new("reject", &7).unwrap())
            .unwrap()
            .then(|_| panic!("success must not fire"))
            .catch_typed(move |err: &Rejected| *s.borrow_mut() = Some(err.0));

        pool.wait().unwrap();
        assert_eq!(*seen.borrow(), Some(7));
        assert_eq!(pool.status().failed, 1);
    }

    #[test]
    fn test_unhandled_error_fails_wait_after_recording() {
        let mut pool = sync_pool();
        pool.add(Task::new("reject", &1).unwrap()).unwrap();
        let err = pool.wait().unwrap_err();
        assert!(matches!(
            err.failure(),
            Some(ParallelFailure::Task(task)) if task.message == "rejected 1"
        ));
        assert_eq!(pool.failed().len(), 1);
        assert!(pool.status().to_string().contains("failed with"));
    }

    #[test]
    fn test_timeout_fires_once() {
        let mut pool = sync_pool().timeout(Duration::from_millis(5));
        let timeouts = Rc::new(Cell::new(0));
        let t = timeouts.clone();
        pool.add(Task::new("nap", &50).unwrap())
            .unwrap()
            .then(|_| panic!("success must not fire"))
            .catch(|_| panic!("error must not fire"))
            .on_timeout(move || t.set(t.get() + 1));

        pool.wait().unwrap();
        assert_eq!(timeouts.get(), 1);
        assert_eq!(pool.status().timeouts, 1);
        let (_, runnable) = pool.timeouts().iter().next().unwrap();
        assert!(matches!(runnable.failure(), Some(ParallelFailure::Timeout(_))));
    }

    #[test]
    fn test_stop_prevents_admission() {
        let mut pool = sync_pool().concurrency(1);
        for _ in 0..3 {
            pool.add(Task::named("two")).unwrap();
        }
        pool.stop();
        pool.wait().unwrap();

        let status = pool.status();
        assert!(pool.is_stopped());
        assert_eq!(status.finished, 1);
        assert_eq!(status.queued, 2);
    }

    #[test]
    fn test_tick_callback_can_cancel() {
        let mut pool = sync_pool().concurrency(1);
        for _ in 0..3 {
            pool.add(Task::named("two")).unwrap();
        }
        let mut ticks = 0;
        pool.wait_with(|_| {
            ticks += 1;
            true
        })
        .unwrap();
        assert_eq!(ticks, 1);
        assert!(pool.status().finished < 3);
    }

    #[test]
    fn test_memory_efficient_keeps_counts_only() {
        let mut pool = sync_pool().memory_efficient(true);
        for _ in 0..4 {
            pool.add(Task::named("two")).unwrap();
        }
        let results = pool.wait().unwrap();
        assert!(results.is_empty());
        assert!(pool.finished().is_empty());
        assert_eq!(pool.status().finished, 4);
    }

    #[test]
    fn test_clear_tables() {
        let mut pool = sync_pool();
        pool.add(Task::named("two")).unwrap();
        pool.add(Task::new("reject", &2).unwrap())
            .unwrap()
            .catch(|_| {});
        pool.wait().unwrap();
        assert_eq!(pool.results().len(), 1);

        pool.clear_results();
        pool.clear_finished();
        pool.clear_failed();
        pool.clear_timeouts();
        assert!(pool.results().is_empty());
        assert_eq!(
            pool.status().to_string(),
            "queue: 0 - in progress: 0 - finished: 0 - failed: 0 - timeout: 0"
        );
    }

    #[test]
    fn test_add_validates_task_names() {
        let mut pool = sync_pool();
        let err = pool.add(Task::named("missing")).unwrap_err();
        assert!(matches!(err, ForkpoolError::UnknownTask(name) if name == "missing"));
    }

    #[test]
    fn test_synchronous_mode_requires_registry() {
        let mut pool = Pool::create().force_synchronous(true);
        let err = pool.add(Task::named("two")).unwrap_err();
        assert!(matches!(err, ForkpoolError::MissingRegistry));
    }

    #[test]
    fn test_spawn_failure_withdraws_new_runnable() {
        let mut pool = Pool::create().binary("/nonexistent/forkpool-host");
        let err = pool.add(Task::named("two")).unwrap_err();
        assert!(matches!(err, ForkpoolError::Spawn(_)));
        assert!(pool.queue().is_empty());
        assert!(pool.in_progress().is_empty());

        // Nothing is left behind to fail later.
        assert!(pool.wait().unwrap().is_empty());
        assert_eq!(pool.status().failed, 0);
    }

    #[test]
    fn test_spawn_failure_on_wait_requeues() {
        let mut pool = Pool::create()
            .binary("/nonexistent/forkpool-host")
            .concurrency(1);
        pool.stop();
        pool.add(Task::named("two")).unwrap();
        assert_eq!(pool.queue().len(), 1);

        pool.stopped = false;
        let err = pool.wait().unwrap_err();
        assert!(matches!(err, ForkpoolError::Spawn(_)));
        assert_eq!(pool.queue().len(), 1);
    }

    #[test]
    fn test_zero_concurrency_is_raised_to_one() {
        let mut pool = Pool::new(PoolConfig::default().concurrency(0))
            .force_synchronous(true)
            .with_registry(registry());
        assert_eq!(pool.config().concurrency, 1);
        pool.add(Task::named("two")).unwrap();
        pool.add(Task::named("two")).unwrap();

        assert_eq!(pool.wait().unwrap().len(), 2);
        assert_eq!(pool.status().queued, 0);
        assert_eq!(pool.status().finished, 2);
    }

    #[test]
    fn test_admission_is_fifo() {
        let mut pool = sync_pool().concurrency(1);
        let order = Rc::new(RefCell::new(Vec::new()));
        for n in [5, 1, 4, 2, 3] {
            let order = order.clone();
            pool.add(Task::new("double", &n).unwrap())
                .unwrap()
                .then(move |value| order.borrow_mut().push(value.as_i64().unwrap() / 2));
        }
        pool.wait().unwrap();
        assert_eq!(*order.borrow(), vec![5, 1, 4, 2, 3]);
    }

    #[test]
    fn test_panicking_success_callback_keeps_status() {
        let mut pool = sync_pool();
        pool.add(Task::named("two"))
            .unwrap()
            .then(|_| panic!("success callback"));

        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| pool.wait()));
        assert!(outcome.is_err());
        let status = pool.status();
        assert_eq!(status.finished, 1);
        assert_eq!(status.in_progress, 0);
        assert_eq!(pool.finished().len(), 1);
    }

    #[test]
    fn test_panicking_error_callback_keeps_status() {
        let mut pool = sync_pool();
        pool.add(Task::new("reject", &3).unwrap())
            .unwrap()
            .catch(|_| panic!("error callback"));

        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| pool.wait()));
        assert!(outcome.is_err());
        let status = pool.status();
        assert_eq!(status.failed, 1);
        assert_eq!(status.in_progress, 0);
        assert_eq!(status.failures.len(), 1);
    }

    #[test]
    fn test_is_supported_on_unix() {
        assert_eq!(Pool::is_supported(), cfg!(unix));
    }
}
