//! AsyncTask 单元测试

use super::*;

use std::any::Any;

use parking_lot::Mutex;

use crate::runtime::context::{AsyncContext, FutureAsyncContext};
use crate::runtime::executor::ManualExecutor;


/// Order in which waiters observed their future.
type WakeLog = Arc<Mutex<Vec<(usize, Option<u64>)>>>;

struct WaitState {
    id: usize,
    future: TaskRef,
    log: WakeLog,
}

fn wait_state(context: Option<ContextRef>) -> (ContextRef, usize, TaskRef, WakeLog) {
    let context = context.expect("waiter frame");
    let state = unsafe { context.as_future_closure() }
        .and_then(|frame| frame.closure_context().downcast_ref::<WaitState>())
        .expect("wait state");
    (
        context,
        state.id,
        state.future.clone(),
        state.log.clone(),
    )
}

fn waiter_entry(
    task: TaskRef,
    executor: ExecutorRef,
    context: Option<ContextRef>,
) {
    let (context, _, future, _) = wait_state(context);
    task.await_future(&future, waiter_resumed, Some(context), executor);
}

fn waiter_resumed(
    task: TaskRef,
    executor: ExecutorRef,
    context: Option<ContextRef>,
) {
    let (context, id, future, log) = wait_state(context);
    let value = match future.future_outcome::<u64>() {
        Some(Ok(value)) => Some(*value),
        _ => None,
    };
    log.lock().push((id, value));
    unsafe { context.as_future() }
        .expect("future frame")
        .return_value(());
    unsafe { AsyncContext::resume_parent_of(context, task, executor) };
}

/// A task that waits on `future` and logs `id` when woken.
fn spawn_waiter(
    future: &TaskRef,
    id: usize,
    log: &WakeLog,
) -> TaskRef {
    let state: Arc<dyn Any + Send + Sync> = Arc::new(WaitState {
        id,
        future: future.clone(),
        log: log.clone(),
    });
    TaskBuilder::new()
        .spawn_future_with_context::<()>(waiter_entry, state)
        .unwrap()
}

fn enqueue(
    executor: &Arc<ManualExecutor>,
    task: &TaskRef,
) {
    executor.executor_ref().enqueue(task.clone().into_job());
}
