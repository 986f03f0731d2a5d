//! taskcore
//!
//! The core of an async task runtime: fixed-layout jobs and reference
//! counted tasks, trailing child/group/future fragments, a lock-free future
//! wait queue, status records with cancellation, and continuation-passing
//! context frames that resume on a chosen executor.
//!
//! # Example
//!
//! ```no_run
//! use taskcore::runtime::{ManualExecutor, TaskBuilder};
//!
//! fn main() -> taskcore::Result<()> {
//!     let executor = ManualExecutor::new();
//!     let task = TaskBuilder::new().spawn_closure(|_| Ok(6u64 * 7))?;
//!     executor.executor_ref().enqueue(task.clone().into_job());
//!     executor.run_until_idle();
//!     assert!(matches!(task.future_outcome::<u64>(), Some(Ok(&42))));
//!     Ok(())
//! }
//! ```

#![warn(rust_2018_idioms)]

pub mod runtime;
pub mod util;

// Re-exports
pub use anyhow::{Context, Result};
pub use thiserror::Error;

pub use runtime::{
    AsyncContext, AsyncTask, ContextRef, Executor, ExecutorRef, FutureStatus, Job, JobFlags,
    JobPriority, JobRef, ManualExecutor, SpawnError, TaskBuilder, TaskGroup, TaskGroupQueue,
    TaskRef, WorkerPool,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = "taskcore";
