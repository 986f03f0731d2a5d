//! Shared helpers for the integration tests.

use std::time::{Duration, Instant};

use taskcore::runtime::{FutureStatus, WorkerPool};
use taskcore::util::config::SchedulerConfig;
use taskcore::TaskRef;

pub fn pool(workers: usize) -> WorkerPool {
    WorkerPool::new(SchedulerConfig {
        workers,
        ..SchedulerConfig::default()
    })
}

/// Wait until `condition` holds or ten seconds pass.
pub fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    condition()
}

pub fn wait_for_completion(task: &TaskRef) -> FutureStatus {
    wait_until(|| task.future_status() != FutureStatus::Executing);
    task.future_status()
}
