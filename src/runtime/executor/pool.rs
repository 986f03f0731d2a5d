//! Worker pool executor
//!
//! A fixed set of worker threads, each with its own priority job queue.
//! Submissions are spread round-robin; idle workers steal from a random
//! sibling before parking.

use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};
use std::thread;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};
use rand::Rng;
use tracing::{debug, warn};

use super::queue::PriorityJobQueue;
use super::{Executor, ExecutorRef};
use crate::runtime::job::JobRef;
use crate::util::config::SchedulerConfig;

/// Pool statistics.
#[derive(Debug, Default)]
pub struct PoolStats {
    /// Total jobs enqueued.
    pub jobs_scheduled: AtomicUsize,
    /// Total jobs run.
    pub jobs_completed: AtomicUsize,
    /// Total jobs taken from another worker.
    pub jobs_stolen: AtomicUsize,
    /// Total steal attempts.
    pub steal_attempts: AtomicUsize,
    /// Total successful steals.
    pub steal_success: AtomicUsize,
    /// Total execution time in microseconds.
    pub total_exec_time_us: AtomicUsize,
}

impl PoolStats {
    /// Record a scheduled job.
    #[inline]
    pub fn record_scheduled(&self) {
        self.jobs_scheduled.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a completed job.
    #[inline]
    pub fn record_completed(
        &self,
        duration_us: usize,
    ) {
        self.jobs_completed.fetch_add(1, Ordering::Relaxed);
        self.total_exec_time_us
            .fetch_add(duration_us, Ordering::Relaxed);
    }

    /// Record a steal attempt that took `count` jobs.
    #[inline]
    pub fn record_steal(
        &self,
        count: usize,
    ) {
        self.steal_attempts.fetch_add(1, Ordering::Relaxed);
        if count > 0 {
            self.steal_success.fetch_add(1, Ordering::Relaxed);
            self.jobs_stolen.fetch_add(count, Ordering::Relaxed);
        }
    }

    /// Get steal success rate.
    pub fn steal_success_rate(&self) -> f64 {
        let attempts = self.steal_attempts.load(Ordering::Relaxed);
        if attempts == 0 {
            return 1.0;
        }
        self.steal_success.load(Ordering::Relaxed) as f64 / attempts as f64
    }
}

/// State shared between the pool handle and its workers. This is the
/// executor jobs see.
pub(crate) struct Shared {
    config: SchedulerConfig,
    queues: Vec<PriorityJobQueue>,
    running: AtomicBool,
    next_queue: AtomicUsize,
    idle: Mutex<()>,
    wake: Condvar,
    stats: PoolStats,
}

impl Shared {
    fn has_pending(&self) -> bool {
        self.queues.iter().any(|q| !q.is_empty())
    }

    fn run_job(
        &self,
        job: JobRef,
        executor: &ExecutorRef,
    ) {
        let start = Instant::now();
        job.run(executor.clone());
        self.stats
            .record_completed(start.elapsed().as_micros() as usize);
    }

    /// Move up to `steal_batch` jobs from a random victim into `thief`'s
    /// queue and return one of them.
    fn steal(
        &self,
        thief: usize,
    ) -> Option<JobRef> {
        let workers = self.queues.len();
        if workers < 2 {
            return None;
        }
        let offset = rand::rng().random_range(1..workers);
        let victim = (thief + offset) % workers;

        let mut first = None;
        let mut count = 0;
        for _ in 0..self.config.steal_batch.max(1) {
            let Some(job) = self.queues[victim].pop_back() else {
                break;
            };
            count += 1;
            match first {
                None => first = Some(job),
                Some(_) => self.queues[thief].push(job),
            }
        }
        self.stats.record_steal(count);
        first
    }
}

impl Executor for Shared {
    fn enqueue(
        &self,
        job: JobRef,
    ) {
        if !self.running.load(Ordering::Acquire) {
            warn!(?job, "worker pool is shut down; dropping job");
            return;
        }
        self.stats.record_scheduled();
        let worker = self.next_queue.fetch_add(1, Ordering::Relaxed) % self.queues.len();
        self.queues[worker].push(job);

        // A shutdown that drained this queue before the push has stopped
        // the workers; nobody else will take the job.
        if !self.running.load(Ordering::Acquire) {
            let dropped = self.queues[worker].drain().len();
            warn!(dropped, "worker pool shut down during enqueue; dropping jobs");
            return;
        }

        let _idle = self.idle.lock();
        self.wake.notify_one();
    }

    fn name(&self) -> &str {
        "worker-pool"
    }
}

/// A work-stealing pool of worker threads.
///
/// Dropping the pool stops the workers and drops jobs still queued.
pub struct WorkerPool {
    shared: Arc<Shared>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl WorkerPool {
    /// Start a pool configured by `config`.
    pub fn new(config: SchedulerConfig) -> Self {
        let workers = config.workers.max(1);
        let shared = Arc::new(Shared {
            queues: (0..workers).map(|_| PriorityJobQueue::new()).collect(),
            running: AtomicBool::new(true),
            next_queue: AtomicUsize::new(0),
            idle: Mutex::new(()),
            wake: Condvar::new(),
            stats: PoolStats::default(),
            config,
        });

        let handles = Self::spawn_workers(workers, &shared);

        Self {
            shared,
            workers: Mutex::new(handles),
        }
    }

    /// Spawn worker threads.
    fn spawn_workers(
        num_workers: usize,
        shared: &Arc<Shared>,
    ) -> Vec<thread::JoinHandle<()>> {
        let mut workers = Vec::with_capacity(num_workers);

        for worker_id in 0..num_workers {
            let shared = shared.clone();
            let spawned = thread::Builder::new()
                .name(format!("taskcore-worker-{}", worker_id))
                .spawn(move || Self::worker_loop(worker_id, &shared));
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(err) => warn!(worker_id, "failed to spawn worker thread: {}", err),
            }
        }

        workers
    }

    /// Worker thread main loop.
    fn worker_loop(
        worker_id: usize,
        shared: &Arc<Shared>,
    ) {
        debug!(worker_id, "worker started");
        let executor = ExecutorRef::new(shared.clone());

        while shared.running.load(Ordering::Acquire) {
            // 1. Local queue
            if let Some(job) = shared.queues[worker_id].pop() {
                shared.run_job(job, &executor);
                continue;
            }

            // 2. Work stealing
            if shared.config.use_work_stealing {
                if let Some(job) = shared.steal(worker_id) {
                    shared.run_job(job, &executor);
                    continue;
                }
            }

            // 3. Park until woken or the idle timeout passes
            let mut idle = shared.idle.lock();
            if shared.running.load(Ordering::Acquire) && !shared.has_pending() {
                shared
                    .wake
                    .wait_for(&mut idle, shared.config.idle_timeout());
            }
        }

        debug!(worker_id, "worker stopped");
    }

    /// Identity of this pool as an executor.
    pub fn executor_ref(&self) -> ExecutorRef {
        ExecutorRef::new(self.shared.clone())
    }

    pub(crate) fn shared(&self) -> &dyn Executor {
        self.shared.as_ref()
    }

    /// Get statistics.
    #[inline]
    pub fn stats(&self) -> &PoolStats {
        &self.shared.stats
    }

    /// Get the number of workers.
    #[inline]
    pub fn num_workers(&self) -> usize {
        self.shared.queues.len()
    }

    /// Jobs waiting in the queues.
    pub fn pending(&self) -> usize {
        self.shared.queues.iter().map(PriorityJobQueue::len).sum()
    }

    /// Check if the pool is running.
    #[inline]
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Stop the workers and wait for them to exit. Queued jobs are dropped.
    pub fn shutdown(&self) {
        self.shared.running.store(false, Ordering::Release);
        {
            let _idle = self.shared.idle.lock();
            self.shared.wake.notify_all();
        }

        let handles: Vec<_> = self.workers.lock().drain(..).collect();
        let current = thread::current().id();
        for handle in handles {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                warn!("worker thread panicked");
            }
        }

        let dropped: usize = self
            .shared
            .queues
            .iter()
            .map(|q| q.drain().len())
            .sum();
        if dropped > 0 {
            debug!(dropped, "dropped queued jobs at shutdown");
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if self.is_running() {
            self.shutdown();
        }
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.num_workers())
            .field("pending", &self.pending())
            .field("running", &self.is_running())
            .finish()
    }
}
