//! The task and executor running on the current thread.

use std::cell::RefCell;
use std::marker::PhantomData;
use std::mem;

use crate::runtime::executor::ExecutorRef;
use crate::runtime::task::TaskRef;

#[derive(Default)]
struct Current {
    task: Option<TaskRef>,
    executor: ExecutorRef,
}

thread_local! {
    static CURRENT: RefCell<Current> = RefCell::new(Current::default());
}

/// Restores the previous current task and executor when dropped.
pub struct CurrentGuard {
    previous: Option<Current>,
    _not_send: PhantomData<*const ()>,
}

/// Make `task` and `executor` current until the guard is dropped.
pub fn enter(
    task: Option<TaskRef>,
    executor: ExecutorRef,
) -> CurrentGuard {
    let previous = CURRENT.with(|c| mem::replace(&mut *c.borrow_mut(), Current { task, executor }));
    CurrentGuard {
        previous: Some(previous),
        _not_send: PhantomData,
    }
}

impl Drop for CurrentGuard {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            // Drop the replaced value outside the borrow: releasing a task
            // may destroy it.
            let replaced = CURRENT.with(|c| mem::replace(&mut *c.borrow_mut(), previous));
            drop(replaced);
        }
    }
}

/// The task running on this thread, if any.
pub fn task() -> Option<TaskRef> {
    CURRENT.with(|c| c.borrow().task.clone())
}

/// The executor this thread is running jobs for. Generic outside of a job.
pub fn executor() -> ExecutorRef {
    CURRENT.with(|c| c.borrow().executor.clone())
}
