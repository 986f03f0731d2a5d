//! Task groups collecting children run on a worker pool.

use std::collections::BTreeSet;
use std::sync::Arc;

use taskcore::runtime::FutureStatus;
use taskcore::{SpawnError, TaskBuilder, TaskGroup, TaskGroupQueue};

use crate::common::{pool, wait_until};

#[test]
fn test_group_collects_every_child() {
    const CHILDREN: u64 = 100;

    let pool = pool(4);
    let queue = TaskGroupQueue::new();
    let group: Arc<dyn TaskGroup> = queue.as_group();
    let owner = TaskBuilder::new().spawn_closure(|_| Ok(())).unwrap();

    let builder = TaskBuilder::new().parent(&owner).group(&group);
    for i in 0..CHILDREN {
        let child = builder.spawn_closure(move |_| Ok(i)).unwrap();
        pool.executor_ref().enqueue(child.into_job());
    }

    assert!(wait_until(|| queue.offered() == CHILDREN as usize));
    let mut seen = BTreeSet::new();
    while let Some(child) = queue.poll_next() {
        assert_eq!(child.future_status(), FutureStatus::Success);
        match child.future_outcome::<u64>() {
            Some(Ok(value)) => assert!(seen.insert(*value)),
            _ => panic!("group child without a result"),
        }
    }
    assert_eq!(seen, (0..CHILDREN).collect());

    owner.cancel();
    pool.executor_ref().enqueue(owner.clone().into_job());
    assert!(wait_until(|| owner.future_status() != FutureStatus::Executing));
    pool.shutdown();
}

#[test]
fn test_failed_children_are_offered() {
    let pool = pool(2);
    let queue = TaskGroupQueue::new();
    let group: Arc<dyn TaskGroup> = queue.as_group();

    for i in 0..10u32 {
        let child = TaskBuilder::new()
            .group(&group)
            .spawn_closure(move |_| {
                if i % 2 == 1 {
                    anyhow::bail!("odd child {}", i);
                }
                Ok(i)
            })
            .unwrap();
        pool.executor_ref().enqueue(child.into_job());
    }

    assert!(wait_until(|| queue.offered() == 10));
    let failed = std::iter::from_fn(|| queue.poll_next())
        .filter(|child| child.future_status() == FutureStatus::Error)
        .count();
    assert_eq!(failed, 5);
    pool.shutdown();
}

#[test]
fn test_plain_task_cannot_join_group() {
    fn entry(
        _task: taskcore::TaskRef,
        _executor: taskcore::ExecutorRef,
        _context: Option<taskcore::ContextRef>,
    ) {
    }

    let group: Arc<dyn TaskGroup> = TaskGroupQueue::new().as_group();
    let err = TaskBuilder::new().group(&group).spawn(entry).unwrap_err();
    assert!(matches!(err, SpawnError::GroupChildWithoutResult));
    assert!(!err.to_string().is_empty());
}
