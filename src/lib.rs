//! forkpool - run tasks in parallel child processes.
//!
//! A [`Pool`] spawns one child process per [`Task`], at most `concurrency`
//! at a time. A task is the name of a function registered in a
//! [`TaskRegistry`] plus its serialized arguments; the child is the host
//! binary re-invoked in child-runtime mode, which looks the function up in
//! the same registry, runs it and reports the result back.
//!
//! ```no_run
//! use forkpool::{Pool, Task, TaskRegistry, runtime};
//! use std::convert::Infallible;
//! use std::sync::Arc;
//!
//! fn registry() -> TaskRegistry {
//!     let mut registry = TaskRegistry::new();
//!     registry.register("square", |n: i64| Ok::<_, Infallible>(n * n));
//!     registry
//! }
//!
//! fn main() -> forkpool::Result<()> {
//!     runtime::run_child_if_requested(&registry());
//!
//!     let mut pool = Pool::create().concurrency(4).with_registry(Arc::new(registry()));
//!     for n in 0..10 {
//!         pool.add(Task::new("square", &n)?)?
//!             .then(|value| println!("{value}"))
//!             .catch(|failure| eprintln!("{failure}"));
//!     }
//!     pool.wait()?;
//!     println!("{}", pool.status());
//!     Ok(())
//! }
//! ```

pub mod demo;
pub mod error;
pub mod failure;
pub mod logging;
pub mod pool;
pub mod process;
pub mod runtime;
pub mod task;

pub use error::{ForkpoolError, Result};
pub use failure::{ErrorRegistry, ParallelFailure, TaskError};
pub use pool::{Pool, PoolConfig, PoolStatus, Reaping};
pub use process::{Runnable, RunnableHandle, RunnableId};
pub use task::{Task, TaskEncoder, TaskRegistry};
