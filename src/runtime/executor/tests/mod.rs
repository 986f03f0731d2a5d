//! Executor 单元测试

use super::*;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crossbeam::channel;

use crate::runtime::job::JobPriority;
use crate::util::config::SchedulerConfig;

fn counting_job(
    priority: JobPriority,
    counter: &Arc<AtomicUsize>,
) -> JobRef {
    let counter = counter.clone();
    JobRef::from_closure(priority, move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    })
}

fn tagged_job(
    priority: JobPriority,
    tag: &'static str,
    log: &Arc<parking_lot::Mutex<Vec<&'static str>>>,
) -> JobRef {
    let log = log.clone();
    JobRef::from_closure(priority, move |_| log.lock().push(tag))
}

#[cfg(test)]
mod executor_ref_tests {
    use super::*;

    #[test]
    fn test_identity() {
        let a = ManualExecutor::new();
        let b = ManualExecutor::new();
        assert!(ExecutorRef::generic().is_generic());
        assert_eq!(ExecutorRef::generic(), ExecutorRef::default());
        assert_eq!(a.executor_ref(), a.executor_ref());
        assert_ne!(a.executor_ref(), b.executor_ref());
        assert_ne!(a.executor_ref(), ExecutorRef::generic());
        assert_eq!(
            a.executor_ref().executor().map(|e| e.name().to_string()),
            Some("manual".to_string())
        );
    }

    #[test]
    fn test_generic_routes_to_global_executor() {
        let (done, finished) = channel::bounded(1);
        ExecutorRef::generic().enqueue(JobRef::from_closure(
            JobPriority::Default,
            move |executor| {
                let _ = done.send(executor.is_generic());
            },
        ));
        let generic = finished
            .recv_timeout(Duration::from_secs(5))
            .expect("global executor ran the job");
        // Pool workers run jobs as their own specific executor.
        assert!(!generic);

        let manual: Arc<dyn Executor> = ManualExecutor::new();
        assert!(matches!(
            set_global_executor(manual),
            Err(ExecutorError::GlobalAlreadySet)
        ));
    }
}

#[cfg(test)]
mod manual_tests {
    use super::*;

    #[test]
    fn test_runs_in_submission_order() {
        let executor = ManualExecutor::new();
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let handle = executor.executor_ref();
        handle.enqueue(tagged_job(JobPriority::Background, "a", &log));
        handle.enqueue(tagged_job(JobPriority::UserInteractive, "b", &log));
        assert_eq!(executor.len(), 2);

        assert!(executor.run_next());
        assert_eq!(*log.lock(), vec!["a"]);
        assert_eq!(executor.run_until_idle(), 1);
        assert_eq!(*log.lock(), vec!["a", "b"]);
        assert!(!executor.run_next());
    }

    #[test]
    fn test_jobs_enqueued_while_running_also_run() {
        let executor = ManualExecutor::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let inner = counting_job(JobPriority::Default, &counter);
        let outer = JobRef::from_closure(JobPriority::Default, move |executor| {
            executor.enqueue(inner);
        });
        executor.executor_ref().enqueue(outer);
        assert_eq!(executor.run_until_idle(), 2);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_drain_returns_unrun_jobs() {
        let executor = ManualExecutor::new();
        let counter = Arc::new(AtomicUsize::new(0));
        executor
            .executor_ref()
            .enqueue(counting_job(JobPriority::Default, &counter));
        let drained = executor.drain();
        assert_eq!(drained.len(), 1);
        assert!(executor.is_empty());
        drop(drained);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }
}

#[cfg(test)]
mod queue_tests {
    use super::*;

    fn run_all(jobs: impl IntoIterator<Item = JobRef>) {
        for job in jobs {
            job.run(ExecutorRef::generic());
        }
    }

    #[test]
    fn test_priority_bands() {
        let queue = PriorityJobQueue::new();
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        queue.push(tagged_job(JobPriority::Background, "background", &log));
        queue.push(tagged_job(JobPriority::Default, "default", &log));
        queue.push(tagged_job(JobPriority::UserInteractive, "interactive", &log));
        queue.push(tagged_job(JobPriority::Utility, "utility", &log));
        assert_eq!(queue.len(), 4);

        run_all(std::iter::from_fn(|| queue.pop()));
        assert_eq!(
            *log.lock(),
            vec!["interactive", "default", "background", "utility"]
        );
        assert!(queue.is_empty());
    }

    #[test]
    fn test_steal_side_takes_least_urgent() {
        let queue = PriorityJobQueue::new();
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        queue.push(tagged_job(JobPriority::UserInitiated, "high", &log));
        queue.push(tagged_job(JobPriority::Background, "low-1", &log));
        queue.push(tagged_job(JobPriority::Background, "low-2", &log));

        run_all(queue.pop_back());
        assert_eq!(*log.lock(), vec!["low-2"]);
        run_all(queue.drain());
        assert_eq!(*log.lock(), vec!["low-2", "high", "low-1"]);
    }

    #[test]
    fn test_fifo_queue() {
        let queue = JobQueue::new();
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        queue.push(tagged_job(JobPriority::Default, "first", &log));
        queue.push(tagged_job(JobPriority::Default, "second", &log));
        run_all(queue.pop_front());
        run_all(queue.pop_back());
        assert_eq!(*log.lock(), vec!["first", "second"]);
        assert!(queue.is_empty());
    }
}

#[cfg(test)]
mod pool_tests {
    use super::*;

    fn wait_for(
        counter: &AtomicUsize,
        expected: usize,
    ) -> bool {
        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        while std::time::Instant::now() < deadline {
            if counter.load(Ordering::SeqCst) >= expected {
                return true;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        false
    }

    #[test]
    fn test_pool_runs_jobs() {
        let pool = WorkerPool::new(SchedulerConfig {
            workers: 4,
            ..SchedulerConfig::default()
        });
        assert!(pool.is_running());
        assert_eq!(pool.num_workers(), 4);

        let counter = Arc::new(AtomicUsize::new(0));
        let executor = pool.executor_ref();
        for i in 0..1000 {
            let priority = if i % 2 == 0 {
                JobPriority::Utility
            } else {
                JobPriority::UserInitiated
            };
            executor.enqueue(counting_job(priority, &counter));
        }
        assert!(wait_for(&counter, 1000));
        assert_eq!(pool.stats().jobs_scheduled.load(Ordering::Relaxed), 1000);

        pool.shutdown();
        assert!(!pool.is_running());
    }

    #[test]
    fn test_jobs_see_pool_as_executor() {
        let pool = WorkerPool::new(SchedulerConfig {
            workers: 2,
            ..SchedulerConfig::default()
        });
        let (done, seen) = channel::bounded(1);
        let expected = pool.executor_ref();
        pool.executor_ref()
            .enqueue(JobRef::from_closure(JobPriority::Default, move |executor| {
                let current = crate::runtime::current::executor();
                let _ = done.send(executor == expected && current == expected);
            }));
        assert_eq!(seen.recv_timeout(Duration::from_secs(5)), Ok(true));
    }

    #[test]
    fn test_single_worker_without_stealing() {
        let pool = WorkerPool::new(SchedulerConfig {
            workers: 1,
            use_work_stealing: false,
            idle_timeout_ms: 1,
            ..SchedulerConfig::default()
        });
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..50 {
            pool.executor_ref()
                .enqueue(counting_job(JobPriority::Default, &counter));
        }
        assert!(wait_for(&counter, 50));
        assert_eq!(pool.stats().steal_attempts.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_enqueue_after_shutdown_drops_job() {
        let pool = WorkerPool::new(SchedulerConfig {
            workers: 1,
            ..SchedulerConfig::default()
        });
        let executor = pool.executor_ref();
        pool.shutdown();

        let counter = Arc::new(AtomicUsize::new(0));
        executor.enqueue(counting_job(JobPriority::Default, &counter));
        assert_eq!(pool.pending(), 0);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_enqueue_racing_shutdown_strands_nothing() {
        /// Counts itself once, whether its job runs or is dropped.
        struct Tally(Arc<AtomicUsize>);

        impl Drop for Tally {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        const PER_THREAD: usize = 500;

        let pool = WorkerPool::new(SchedulerConfig {
            workers: 2,
            ..SchedulerConfig::default()
        });
        let executor = pool.executor_ref();
        let settled = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(std::sync::Barrier::new(5));

        let producers: Vec<_> = (0..4)
            .map(|_| {
                let executor = executor.clone();
                let settled = settled.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    for _ in 0..PER_THREAD {
                        let tally = Tally(settled.clone());
                        executor.enqueue(JobRef::from_closure(JobPriority::Default, move |_| {
                            drop(tally);
                        }));
                    }
                })
            })
            .collect();
        barrier.wait();
        pool.shutdown();
        for producer in producers {
            producer.join().unwrap();
        }

        assert_eq!(pool.pending(), 0);
        assert_eq!(settled.load(Ordering::SeqCst), 4 * PER_THREAD);
        drop(executor);
    }

    #[test]
    fn test_steal_success_rate_defaults_to_one() {
        let stats = PoolStats::default();
        assert_eq!(stats.steal_success_rate(), 1.0);
        stats.record_steal(0);
        stats.record_steal(3);
        assert_eq!(stats.steal_success_rate(), 0.5);
        assert_eq!(stats.jobs_stolen.load(Ordering::Relaxed), 3);
    }
}
