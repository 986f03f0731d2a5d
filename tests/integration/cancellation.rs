//! Cancellation across a task tree.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam::channel;
use taskcore::runtime::{FutureStatus, TaskStatusRecord};
use taskcore::{ManualExecutor, TaskBuilder, TaskRef};

use crate::common::{pool, wait_for_completion, wait_until};

/// A task that fails once it sees itself cancelled.
fn cancellable(builder: TaskBuilder) -> TaskRef {
    builder
        .spawn_closure(|task| {
            if task.is_cancelled() {
                anyhow::bail!("cancelled");
            }
            Ok(())
        })
        .unwrap()
}

#[test]
fn test_cancelled_tree_observes_cancellation() {
    let executor = ManualExecutor::new();
    let root = cancellable(TaskBuilder::new());
    let children: Vec<_> = (0..4)
        .map(|_| cancellable(TaskBuilder::new().parent(&root)))
        .collect();
    let leaves: Vec<_> = children
        .iter()
        .map(|child| cancellable(TaskBuilder::new().parent(child)))
        .collect();

    root.cancel();

    for task in leaves.iter().chain(&children).chain([&root]) {
        assert!(task.is_cancelled());
        executor.executor_ref().enqueue(task.clone().into_job());
    }
    executor.run_until_idle();

    for task in leaves.iter().chain(&children).chain([&root]) {
        assert_eq!(task.future_status(), FutureStatus::Error);
        match task.future_outcome::<()>() {
            Some(Err(err)) => assert_eq!(err.to_string(), "cancelled"),
            _ => panic!("cancelled task did not fail"),
        }
    }
}

#[test]
fn test_cancellation_from_another_thread() {
    let pool = pool(2);
    let (started, started_rx) = channel::bounded::<()>(1);
    let (release, release_rx) = channel::bounded::<()>(1);
    let notified = Arc::new(AtomicUsize::new(0));

    let blocked = TaskBuilder::new()
        .spawn_closure(move |task| {
            let _ = started.send(());
            let _ = release_rx.recv();
            Ok(task.is_cancelled())
        })
        .unwrap();
    let record = {
        let notified = notified.clone();
        TaskStatusRecord::cancellation_notification(move || {
            notified.fetch_add(1, Ordering::SeqCst);
        })
    };
    assert!(blocked.add_status_record(record));

    pool.executor_ref().enqueue(blocked.clone().into_job());
    started_rx.recv().unwrap();

    let canceller = {
        let blocked = blocked.clone();
        std::thread::spawn(move || blocked.cancel())
    };
    canceller.join().unwrap();
    assert!(wait_until(|| notified.load(Ordering::SeqCst) == 1));
    release.send(()).unwrap();

    assert_eq!(wait_for_completion(&blocked), FutureStatus::Success);
    assert!(matches!(blocked.future_outcome::<bool>(), Some(Ok(&true))));
    assert_eq!(notified.load(Ordering::SeqCst), 1);
    pool.shutdown();
}

#[test]
fn test_child_of_cancelled_parent_starts_cancelled() {
    let parent = cancellable(TaskBuilder::new());
    parent.cancel();
    let child = cancellable(TaskBuilder::new().parent(&parent));
    assert!(child.is_cancelled());

    let sibling_parent = cancellable(TaskBuilder::new());
    let sibling = cancellable(TaskBuilder::new().parent(&sibling_parent));
    assert!(!sibling.is_cancelled());

    let executor = ManualExecutor::new();
    for task in [&parent, &child, &sibling_parent, &sibling] {
        executor.executor_ref().enqueue(task.clone().into_job());
    }
    executor.run_until_idle();
}
