//! Process pool for running tasks in parallel.
//!
//! The pool spawns one child process per task, running the child runtime
//! of the configured binary, and keeps at most `concurrency` of them alive.
//! All bookkeeping happens on the thread calling [`Pool::wait`].
//!
//! # Architecture
//!
//! ```text
//!                     ┌─────────────────┐
//!                     │   Parent: Pool  │
//!                     │ queue → running │
//!                     └────────┬────────┘
//!                              │ spawn / waitpid / SIGCHLD
//!               ┌──────────────┼──────────────┐
//!               │              │              │
//!         ┌─────▼─────┐  ┌─────▼─────┐  ┌─────▼─────┐
//!         │  Child 1  │  │  Child 2  │  │  Child N  │
//!         │ (process) │  │ (process) │  │ (process) │
//!         │ one task  │  │ one task  │  │ one task  │
//!         └───────────┘  └───────────┘  └───────────┘
//!          stdout: result   stderr: failure envelope
//! ```
//!
//! # Features
//!
//! - **Bounded concurrency**: FIFO admission, never more than N children
//! - **Timeouts**: children running past the timeout are killed
//! - **Typed errors**: task errors are rebuilt through an [`ErrorRegistry`](crate::ErrorRegistry)
//! - **Synchronous fallback**: tasks run inline where forking is unavailable

mod config;
mod reaper;
mod scheduler;
mod status;

pub use config::{
    DEFAULT_CONCURRENCY, DEFAULT_MAX_OUTPUT_BYTES, DEFAULT_POLL_INTERVAL, DEFAULT_TIMEOUT,
    PoolConfig, Reaping,
};
pub use scheduler::Pool;
pub use status::PoolStatus;
