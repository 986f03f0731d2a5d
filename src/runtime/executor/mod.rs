//! Executors: where jobs run.
//!
//! The task core only needs an opaque executor identity and the ability to
//! enqueue a job on it. [`ExecutorRef`] is that identity: either *generic*
//! (run anywhere, which means the process-wide global executor) or a
//! specific [`Executor`].

pub mod manual;
pub mod pool;
pub mod queue;

pub use manual::ManualExecutor;
pub use pool::{PoolStats, WorkerPool};
pub use queue::{JobQueue, PriorityJobQueue};

use std::fmt;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use tracing::{debug, warn};

use crate::runtime::job::JobRef;
use crate::util::config::RuntimeConfig;

/// Something that can run jobs.
pub trait Executor: Send + Sync {
    /// Schedule `job` to run later. Must not run it inline.
    fn enqueue(
        &self,
        job: JobRef,
    );

    /// Name used in logs.
    fn name(&self) -> &str {
        "executor"
    }
}

/// Identity of an executor.
#[derive(Clone, Default)]
pub struct ExecutorRef(Option<Arc<dyn Executor>>);

impl ExecutorRef {
    /// The generic executor: run anywhere.
    #[inline]
    pub const fn generic() -> Self {
        Self(None)
    }

    /// A specific executor.
    pub fn new(executor: Arc<dyn Executor>) -> Self {
        Self(Some(executor))
    }

    #[inline]
    pub fn is_generic(&self) -> bool {
        self.0.is_none()
    }

    /// The specific executor, if any.
    pub fn executor(&self) -> Option<&Arc<dyn Executor>> {
        self.0.as_ref()
    }

    /// Enqueue `job`; generic refs go to the global executor.
    pub fn enqueue(
        &self,
        job: JobRef,
    ) {
        match &self.0 {
            Some(executor) => executor.enqueue(job),
            None => global_executor().enqueue(job),
        }
    }

    fn identity(&self) -> *const () {
        self.0
            .as_ref()
            .map_or(std::ptr::null(), |e| Arc::as_ptr(e) as *const ())
    }
}

impl PartialEq for ExecutorRef {
    fn eq(
        &self,
        other: &Self,
    ) -> bool {
        self.identity() == other.identity()
    }
}

impl Eq for ExecutorRef {}

impl fmt::Debug for ExecutorRef {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        match &self.0 {
            Some(executor) => f
                .debug_tuple("ExecutorRef")
                .field(&executor.name())
                .field(&self.identity())
                .finish(),
            None => f.write_str("ExecutorRef(generic)"),
        }
    }
}

/// Executor errors.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("the global executor is already installed")]
    GlobalAlreadySet,
}

enum GlobalExecutor {
    Pool(WorkerPool),
    Custom(Arc<dyn Executor>),
}

static GLOBAL: OnceCell<GlobalExecutor> = OnceCell::new();

/// Install the executor generic jobs run on. Must happen before anything
/// enqueues on the generic executor.
pub fn set_global_executor(executor: Arc<dyn Executor>) -> Result<(), ExecutorError> {
    GLOBAL
        .set(GlobalExecutor::Custom(executor))
        .map_err(|_| ExecutorError::GlobalAlreadySet)
}

/// The global executor, starting a worker pool on first use if none was
/// installed.
pub fn global_executor() -> &'static dyn Executor {
    let global = GLOBAL.get_or_init(|| {
        let config = RuntimeConfig::from_env().unwrap_or_else(|err| {
            warn!("ignoring invalid runtime config: {}", err);
            RuntimeConfig::default()
        });
        debug!(
            workers = config.scheduler.workers,
            "starting global worker pool"
        );
        GlobalExecutor::Pool(WorkerPool::new(config.scheduler))
    });
    match global {
        GlobalExecutor::Pool(pool) => pool.shared(),
        GlobalExecutor::Custom(executor) => executor.as_ref(),
    }
}

#[cfg(test)]
mod tests;
