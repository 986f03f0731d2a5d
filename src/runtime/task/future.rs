//! Future fragment: completion state, wait queue and result storage.
//!
//! The wait queue is one atomic word holding the completion status in its
//! two low bits and, while the future is still executing, a pointer to the
//! most recent waiting task. Earlier waiters hang off each waiter's
//! `NextWaitingTask` scheduler-private slot.
//!
//! ```text
//!  wait_queue: [ task ptr ........................ | status:2 ]
//!                   |
//!                   v
//!              waiter C --next--> waiter B --next--> waiter A --> null
//! ```
//!
//! Completion swaps the word to `{terminal, null}` in one step. Any waiter
//! linked before the swap is in the chain it returns; any waiter that loads
//! the word after it sees the terminal status and does not link in.

use std::alloc::Layout;
use std::any::{self, TypeId};
use std::cell::UnsafeCell;
use std::fmt;
use std::marker::PhantomData;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use smallvec::SmallVec;
use tracing::{trace, warn};

use super::{AsyncTask, TaskRef};
use crate::runtime::context::FutureAsyncContext;
use crate::runtime::executor::ExecutorRef;
use crate::util::bit::Pack;

const STATUS: Pack = Pack::least_significant(2);

/// Completion state of a future.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FutureStatus {
    /// Still running; waiters are queued.
    Executing = 0,
    /// Completed with a value in the result storage.
    Success = 1,
    /// Completed with a failure in the error slot.
    Error = 2,
}

impl FutureStatus {
    /// Convert from the packed representation.
    ///
    /// # Panics
    ///
    /// Panics on the unused encoding `3`, which can only come from a
    /// corrupted wait queue word.
    #[inline]
    pub fn from_u8(val: u8) -> Self {
        match val {
            0 => FutureStatus::Executing,
            1 => FutureStatus::Success,
            2 => FutureStatus::Error,
            other => panic!("corrupt future status {}", other),
        }
    }

    #[inline]
    pub fn as_u8(&self) -> u8 {
        *self as u8
    }

    #[inline]
    pub fn is_terminal(&self) -> bool {
        *self != FutureStatus::Executing
    }
}

/// Decoded wait queue word.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct WaitQueueItem(usize);

impl WaitQueueItem {
    pub fn new(
        status: FutureStatus,
        task: Option<NonNull<AsyncTask>>,
    ) -> Self {
        let ptr = task.map_or(0, |t| t.as_ptr() as usize);
        debug_assert_eq!(ptr & STATUS.mask(), 0, "misaligned waiting task");
        Self(STATUS.pack(status.as_u8() as usize, ptr))
    }

    #[inline]
    pub fn from_bits(bits: usize) -> Self {
        Self(bits)
    }

    #[inline]
    pub fn bits(&self) -> usize {
        self.0
    }

    #[inline]
    pub fn status(&self) -> FutureStatus {
        FutureStatus::from_u8(STATUS.unpack(self.0) as u8)
    }

    /// Most recently queued waiter.
    #[inline]
    pub fn task(&self) -> Option<NonNull<AsyncTask>> {
        NonNull::new((self.0 & !STATUS.mask()) as *mut AsyncTask)
    }
}

impl fmt::Debug for WaitQueueItem {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("WaitQueueItem")
            .field("status", &self.status())
            .field("task", &self.task())
            .finish()
    }
}

/// Type-erased description of a future's result type.
pub struct ResultType {
    layout: fn() -> Layout,
    type_id: fn() -> TypeId,
    type_name: fn() -> &'static str,
    drop_in_place: unsafe fn(*mut u8),
}

fn layout_of<T>() -> Layout {
    Layout::new::<T>()
}

unsafe fn drop_result<T>(value: *mut u8) {
    unsafe { ptr::drop_in_place(value.cast::<T>()) };
}

struct Descriptor<T>(PhantomData<T>);

impl<T: Send + Sync + 'static> Descriptor<T> {
    const RESULT_TYPE: ResultType = ResultType {
        layout: layout_of::<T>,
        type_id: TypeId::of::<T>,
        type_name: any::type_name::<T>,
        drop_in_place: drop_result::<T>,
    };
}

impl ResultType {
    /// Descriptor for `T`.
    pub fn of<T: Send + Sync + 'static>() -> &'static ResultType {
        &Descriptor::<T>::RESULT_TYPE
    }

    #[inline]
    pub fn layout(&self) -> Layout {
        (self.layout)()
    }

    #[inline]
    pub fn type_id(&self) -> TypeId {
        (self.type_id)()
    }

    #[inline]
    pub fn type_name(&self) -> &'static str {
        (self.type_name)()
    }

    #[inline]
    pub fn is<T: 'static>(&self) -> bool {
        self.type_id() == TypeId::of::<T>()
    }

    /// Run the result type's destructor on `value`.
    ///
    /// # Safety
    ///
    /// `value` must point to an initialised value of this type.
    pub unsafe fn drop_in_place(
        &self,
        value: NonNull<u8>,
    ) {
        unsafe { (self.drop_in_place)(value.as_ptr()) };
    }
}

impl fmt::Debug for ResultType {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("ResultType")
            .field("type", &self.type_name())
            .field("layout", &self.layout())
            .finish()
    }
}

/// Present on tasks that produce a result.
#[repr(C)]
pub struct FutureFragment {
    wait_queue: AtomicUsize,
    result_type: &'static ResultType,
    /// Taken by the one call allowed to complete the future, before it
    /// touches the error slot.
    claimed: AtomicBool,
    /// Written once by the claiming thread before the completion swap.
    error: UnsafeCell<Option<anyhow::Error>>,
}

impl FutureFragment {
    pub(crate) fn new(result_type: &'static ResultType) -> Self {
        Self {
            wait_queue: AtomicUsize::new(WaitQueueItem::new(FutureStatus::Executing, None).bits()),
            result_type,
            claimed: AtomicBool::new(false),
            error: UnsafeCell::new(None),
        }
    }

    #[inline]
    pub fn wait_queue(&self) -> WaitQueueItem {
        WaitQueueItem(self.wait_queue.load(Ordering::Acquire))
    }

    #[inline]
    pub fn status(&self) -> FutureStatus {
        self.wait_queue().status()
    }

    #[inline]
    pub fn result_type(&self) -> &'static ResultType {
        self.result_type
    }

    /// The failure value, once the future has completed with an error.
    pub fn error(&self) -> Option<&anyhow::Error> {
        if self.status() != FutureStatus::Error {
            return None;
        }
        // Safety: the slot is never written again after the terminal status
        // became visible.
        unsafe { (*self.error.get()).as_ref() }
    }
}

impl fmt::Debug for FutureFragment {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("FutureFragment")
            .field("wait_queue", &self.wait_queue())
            .field("result_type", &self.result_type.type_name())
            .finish()
    }
}

impl AsyncTask {
    fn expect_future(&self) -> &FutureFragment {
        match self.future_fragment() {
            Some(fragment) => fragment,
            None => panic!("task {:p} is not a future", self),
        }
    }

    /// Completion status of this future.
    pub fn future_status(&self) -> FutureStatus {
        self.expect_future().status()
    }

    /// Queue `waiting` on this future.
    ///
    /// Returns the terminal status straight away if the future has already
    /// completed; `waiting` is then not queued. Otherwise `waiting` is linked
    /// into the wait queue, `Executing` is returned, and the task will be
    /// enqueued exactly once when the future completes.
    ///
    /// A task may wait on at most one future at a time.
    pub fn wait_future(
        &self,
        waiting: &TaskRef,
    ) -> FutureStatus {
        let fragment = self.expect_future();
        let raw = waiting.clone().into_raw();

        let mut current = fragment.wait_queue();
        loop {
            let status = current.status();
            if status.is_terminal() {
                // Safety: reclaim the reference taken for the queue.
                drop(unsafe { TaskRef::from_raw(raw) });
                return status;
            }

            let next = current.task().map_or(ptr::null_mut(), |t| t.as_ptr().cast());
            waiting.job().set_next_waiting_task(next);

            let new = WaitQueueItem::new(FutureStatus::Executing, Some(raw));
            match fragment.wait_queue.compare_exchange_weak(
                current.bits(),
                new.bits(),
                Ordering::Release,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    trace!(future = ?NonNull::from(self), waiter = ?raw, "linked future waiter");
                    return FutureStatus::Executing;
                }
                Err(actual) => current = WaitQueueItem(actual),
            }
        }
    }

    /// Complete this future from its initial context and release every
    /// queued waiter onto `executor`.
    ///
    /// The outcome is taken from `context`: the failure value if one was
    /// set, otherwise the result the task wrote through the context's
    /// indirect result pointer. Waiters are enqueued in the order they
    /// started waiting. A group child is offered to its group after the
    /// status change is visible and before waiters are released.
    ///
    /// # Panics
    ///
    /// Panics if the future has already completed, if `context` does not
    /// write into this task, or if the task finished without a value or a
    /// failure.
    pub fn complete_future(
        &self,
        context: &FutureAsyncContext,
        executor: ExecutorRef,
    ) {
        let fragment = self.expect_future();
        assert!(
            !fragment.claimed.swap(true, Ordering::AcqRel),
            "future {:p} already completed",
            self
        );
        assert!(
            Some(context.indirect_result()) == self.future_storage(),
            "future context does not belong to task {:p}",
            self
        );

        let status = match context.take_error() {
            Some(error) => {
                // Safety: the claim makes this the only writer, and nobody
                // reads the slot before the terminal status is published.
                unsafe { *fragment.error.get() = Some(error) };
                FutureStatus::Error
            }
            None => {
                assert!(
                    context.has_result(),
                    "future task {:p} finished without a result",
                    self
                );
                FutureStatus::Success
            }
        };

        let previous = WaitQueueItem(
            fragment
                .wait_queue
                .swap(WaitQueueItem::new(status, None).bits(), Ordering::AcqRel),
        );
        debug_assert_eq!(previous.status(), FutureStatus::Executing);
        trace!(future = ?NonNull::from(self), ?status, "future completed");

        if let Some(group_child) = self.group_child_fragment() {
            match group_child.group() {
                Some(group) => group.offer(self.retain()),
                None => warn!("task group of {:p} is gone; dropping its completion", self),
            }
        }

        let mut waiters: SmallVec<[TaskRef; 4]> = SmallVec::new();
        let mut next = previous.task();
        while let Some(raw) = next {
            // Safety: each queued waiter was retained by wait_future.
            let waiter = unsafe { TaskRef::from_raw(raw) };
            next = NonNull::new(waiter.job().next_waiting_task().cast::<AsyncTask>());
            waiter.job().set_next_waiting_task(ptr::null_mut());
            waiters.push(waiter);
        }
        waiters.reverse();

        trace!(count = waiters.len(), "releasing future waiters");
        for waiter in waiters {
            executor.enqueue(waiter.into_job());
        }
    }

    /// The outcome of this future once it has completed.
    ///
    /// Returns `None` while the future is still executing.
    ///
    /// # Panics
    ///
    /// Panics if the task is not a future or `T` is not its result type.
    pub fn future_outcome<T: 'static>(&self) -> Option<Result<&T, &anyhow::Error>> {
        let fragment = self.expect_future();
        match fragment.status() {
            FutureStatus::Executing => None,
            FutureStatus::Success => {
                let result_type = fragment.result_type();
                assert!(
                    result_type.is::<T>(),
                    "future result is {}, not {}",
                    result_type.type_name(),
                    any::type_name::<T>()
                );
                let storage = self.future_storage()?;
                // Safety: the value was written before the terminal status
                // was published and is never written again.
                Some(Ok(unsafe { &*storage.as_ptr().cast::<T>() }))
            }
            FutureStatus::Error => fragment.error().map(Err),
        }
    }

    /// Release waiters still queued on a future that is being destroyed
    /// without completing.
    pub(crate) fn abandon_waiters(&self) {
        let Some(fragment) = self.future_fragment() else {
            return;
        };
        let current = fragment.wait_queue();
        if current.status().is_terminal() {
            return;
        }
        let mut next = current.task();
        if next.is_some() {
            warn!("future {:p} destroyed with tasks still waiting on it", self);
        }
        while let Some(raw) = next {
            let waiter = unsafe { TaskRef::from_raw(raw) };
            next = NonNull::new(waiter.job().next_waiting_task().cast::<AsyncTask>());
            waiter.job().set_next_waiting_task(ptr::null_mut());
        }
    }
}
