//! A deterministic executor driven by the caller.

use std::sync::Arc;

use crossbeam::queue::SegQueue;
use tracing::trace;

use super::{Executor, ExecutorRef};
use crate::runtime::job::JobRef;

/// Queues jobs until the owner runs them on the calling thread.
///
/// Useful for tests and for embedding the runtime in an existing event
/// loop.
#[derive(Debug, Default)]
pub struct ManualExecutor {
    queue: SegQueue<JobRef>,
}

impl ManualExecutor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// This executor's identity.
    pub fn executor_ref(self: &Arc<Self>) -> ExecutorRef {
        ExecutorRef::new(self.clone())
    }

    /// Run the oldest queued job. Returns `false` if there was none.
    pub fn run_next(self: &Arc<Self>) -> bool {
        match self.queue.pop() {
            Some(job) => {
                trace!(?job, "running job on manual executor");
                job.run(self.executor_ref());
                true
            }
            None => false,
        }
    }

    /// Run jobs until the queue is empty, including jobs enqueued while
    /// running. Returns how many ran.
    pub fn run_until_idle(self: &Arc<Self>) -> usize {
        let mut ran = 0;
        while self.run_next() {
            ran += 1;
        }
        ran
    }

    /// Take every queued job without running it.
    pub fn drain(&self) -> Vec<JobRef> {
        std::iter::from_fn(|| self.queue.pop()).collect()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

impl Executor for ManualExecutor {
    fn enqueue(
        &self,
        job: JobRef,
    ) {
        self.queue.push(job);
    }

    fn name(&self) -> &str {
        "manual"
    }
}
