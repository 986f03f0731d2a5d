//! Runtime configured from a RON file.

use taskcore::runtime::FutureStatus;
use taskcore::util::config::{load_config, save_config, RuntimeConfig};
use taskcore::{TaskBuilder, WorkerPool};

use crate::common::wait_for_completion;

#[test]
fn test_runtime_from_config_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("taskcore.ron");
    std::fs::write(
        &path,
        "(scheduler: (workers: 2, steal_batch: 1), allocator: (slab_size: 512))",
    )
    .unwrap();

    let config = load_config(&path).unwrap();
    assert_eq!(config.scheduler.workers, 2);
    assert_eq!(config.allocator.slab_size, 512);

    let pool = WorkerPool::new(config.scheduler.clone());
    assert_eq!(pool.num_workers(), 2);

    let builder = TaskBuilder::from_config(&config.allocator);
    let tasks: Vec<_> = (0..16u32)
        .map(|i| builder.spawn_closure(move |_| Ok(i + 1)).unwrap())
        .collect();
    for task in &tasks {
        pool.executor_ref().enqueue(task.clone().into_job());
    }
    for (i, task) in tasks.iter().enumerate() {
        assert_eq!(wait_for_completion(task), FutureStatus::Success);
        assert!(matches!(task.future_outcome::<u32>(), Some(Ok(v)) if *v == i as u32 + 1));
    }
    pool.shutdown();
}

#[test]
fn test_written_config_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("written.ron");

    let mut config = RuntimeConfig::default();
    config.scheduler.use_work_stealing = false;
    config.log.level = "trace".to_string();
    save_config(&path, &config).unwrap();

    let text = std::fs::read_to_string(&path).unwrap();
    assert!(text.contains("use_work_stealing: false"));
    assert_eq!(RuntimeConfig::from_ron_str(&text).unwrap(), config);
}
