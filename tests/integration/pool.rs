//! Futures awaited across worker pool threads.

use std::any::Any;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use taskcore::runtime::FutureStatus;
use taskcore::{AsyncContext, ContextRef, ExecutorRef, ManualExecutor, TaskBuilder, TaskRef};

use crate::common::{pool, wait_for_completion};

/// Awaits each input future in turn and returns the sum of their results.
struct Summer {
    inputs: Vec<TaskRef>,
    next: AtomicUsize,
    total: AtomicU64,
}

fn sum_step(
    task: TaskRef,
    executor: ExecutorRef,
    context: Option<ContextRef>,
) {
    let context = context.expect("summer frame");
    let frame = unsafe { context.as_future_closure() }.expect("closure frame");
    let state = frame
        .closure_context()
        .downcast_ref::<Summer>()
        .expect("summer state");

    let done = state.next.load(Ordering::Acquire);
    if done > 0 {
        match state.inputs[done - 1].future_outcome::<u64>() {
            Some(Ok(value)) => {
                state.total.fetch_add(*value, Ordering::AcqRel);
            }
            other => panic!("input {} not ready: {:?}", done - 1, other.is_some()),
        }
    }

    if let Some(input) = state.inputs.get(done).cloned() {
        state.next.store(done + 1, Ordering::Release);
        task.await_future(&input, sum_step, Some(context), executor);
        return;
    }

    frame
        .future()
        .return_value(state.total.load(Ordering::Acquire));
    unsafe { AsyncContext::resume_parent_of(context, task, executor) };
}

fn spawn_summer(inputs: Vec<TaskRef>) -> TaskRef {
    let state: Arc<dyn Any + Send + Sync> = Arc::new(Summer {
        inputs,
        next: AtomicUsize::new(0),
        total: AtomicU64::new(0),
    });
    TaskBuilder::new()
        .spawn_future_with_context::<u64>(sum_step, state)
        .unwrap()
}

#[test]
fn test_sum_of_futures_on_pool() {
    let pool = pool(4);
    let executor = pool.executor_ref();

    let inputs: Vec<_> = (0..64u64)
        .map(|i| {
            TaskBuilder::new()
                .spawn_closure(move |_| Ok(i * i))
                .unwrap()
        })
        .collect();
    let summer = spawn_summer(inputs.clone());

    // The summer starts first so most awaits suspend.
    executor.enqueue(summer.clone().into_job());
    for input in &inputs {
        executor.enqueue(input.clone().into_job());
    }

    assert_eq!(wait_for_completion(&summer), FutureStatus::Success);
    let expected: u64 = (0..64u64).map(|i| i * i).sum();
    assert!(matches!(summer.future_outcome::<u64>(), Some(Ok(v)) if *v == expected));
    pool.shutdown();
}

#[test]
fn test_sum_of_completed_futures_runs_without_suspending() {
    let executor = ManualExecutor::new();
    let inputs: Vec<_> = (1..=3u64)
        .map(|i| TaskBuilder::new().spawn_closure(move |_| Ok(i)).unwrap())
        .collect();
    for input in &inputs {
        executor.executor_ref().enqueue(input.clone().into_job());
    }
    executor.run_until_idle();

    let summer = spawn_summer(inputs);
    executor.executor_ref().enqueue(summer.clone().into_job());
    // One run to start, then one enqueue per already-completed input.
    assert_eq!(executor.run_until_idle(), 4);
    assert!(matches!(summer.future_outcome::<u64>(), Some(Ok(&6))));
}

#[test]
fn test_failed_input_is_visible_to_awaiter() {
    let pool = pool(2);
    let failing = TaskBuilder::new()
        .spawn_closure::<u64, _>(|_| anyhow::bail!("input rejected"))
        .unwrap();
    pool.executor_ref().enqueue(failing.clone().into_job());

    assert_eq!(wait_for_completion(&failing), FutureStatus::Error);
    match failing.future_outcome::<u64>() {
        Some(Err(err)) => assert_eq!(err.to_string(), "input rejected"),
        _ => panic!("expected the failure to be recorded"),
    }
}

#[test]
fn test_many_tasks_complete_once() {
    let pool = pool(4);
    let ran = Arc::new(AtomicUsize::new(0));
    let tasks: Vec<_> = (0..500)
        .map(|_| {
            let ran = ran.clone();
            TaskBuilder::new()
                .spawn_closure(move |_| {
                    ran.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .unwrap()
        })
        .collect();
    for task in &tasks {
        pool.executor_ref().enqueue(task.clone().into_job());
    }
    for task in &tasks {
        assert_eq!(wait_for_completion(task), FutureStatus::Success);
    }
    assert_eq!(ran.load(Ordering::SeqCst), 500);
    pool.shutdown();
    assert!(tasks.iter().all(|t| t.ref_count() == 1));
}
