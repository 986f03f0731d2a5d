//! Async tasks.
//!
//! An [`AsyncTask`] is the persistent identity of one asynchronous
//! computation. It is a reference-counted heap object whose header embeds a
//! [`Job`], so a task can be handed to any executor. Optional fragments
//! (child, group child, future) follow the header in the same allocation;
//! see [`layout`].

pub mod alloc;
pub mod builder;
pub mod fragment;
pub mod future;
pub mod layout;
pub mod local;

pub use alloc::{AllocError, StackAllocator};
pub use builder::{SpawnError, TaskBuilder};
pub use fragment::{ChildFragment, GroupChildFragment};
pub use future::{FutureFragment, FutureStatus, ResultType, WaitQueueItem};
pub use layout::{FragmentLayout, FragmentOffsets};
pub use local::{TaskLocalInheritance, TaskLocalStorage};

use std::alloc::{dealloc, Layout};
use std::cell::UnsafeCell;
use std::fmt;
use std::mem::{self, offset_of};
use std::ops::Deref;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Arc;

use tracing::{debug, error, trace, warn};

use crate::runtime::context::{ContextFrame, ContextRef};
use crate::runtime::executor::ExecutorRef;
use crate::runtime::heap::{HeapMetadata, HeapObject};
use crate::runtime::job::{Job, JobFlags, JobPriority, JobRef, TaskContinuationFunction};
use crate::runtime::status::{
    ActiveTaskStatus, AtomicTaskStatus, StatusLockGuard, StatusRecordIter, TaskStatusRecord,
    TaskStatusRecordKind,
};

/// An asynchronous task.
#[repr(C)]
pub struct AsyncTask {
    heap: HeapObject,
    job: Job,
    /// Context passed to the resume function when the job next runs.
    resume_context: AtomicPtr<crate::runtime::context::AsyncContext>,
    status: AtomicTaskStatus,
    allocator: UnsafeCell<StackAllocator>,
    local: TaskLocalStorage,
}

const WORD: usize = mem::size_of::<usize>();
const _: () = assert!(mem::size_of::<AsyncTask>() == 14 * WORD, "AsyncTask must be fourteen words");
const _: () = assert!(mem::align_of::<AsyncTask>() == 2 * WORD);
const _: () = assert!(offset_of!(AsyncTask, heap) == 0);

// The allocator and job function are only touched by the thread running the
// task; everything else is atomic or locked.
unsafe impl Send for AsyncTask {}
unsafe impl Sync for AsyncTask {}

static TASK_METADATA: HeapMetadata = HeapMetadata {
    name: "AsyncTask",
    destroy: destroy_task,
};

impl AsyncTask {
    /// Recover the task a task job is embedded in.
    ///
    /// # Safety
    ///
    /// `job` must be the job of a live `AsyncTask`.
    #[inline]
    pub(crate) unsafe fn from_job(job: NonNull<Job>) -> NonNull<AsyncTask> {
        unsafe {
            NonNull::new_unchecked(
                job.as_ptr()
                    .cast::<u8>()
                    .sub(offset_of!(AsyncTask, job))
                    .cast::<AsyncTask>(),
            )
        }
    }

    #[inline]
    pub fn job(&self) -> &Job {
        &self.job
    }

    #[inline]
    pub fn flags(&self) -> JobFlags {
        self.job.flags()
    }

    #[inline]
    pub fn priority(&self) -> JobPriority {
        self.job.priority()
    }

    /// Take a new owning reference.
    pub fn retain(&self) -> TaskRef {
        self.heap.retain();
        TaskRef(NonNull::from(self))
    }

    /// Current reference count. Only meaningful as a snapshot.
    #[inline]
    pub fn ref_count(&self) -> usize {
        self.heap.ref_count()
    }

    fn fragment_at<F>(
        &self,
        offset: Option<usize>,
    ) -> Option<&F> {
        // Safety: offsets come from the task's own flags, and spawning wrote
        // a fragment at each of them.
        offset.map(|offset| unsafe {
            &*(self as *const AsyncTask)
                .cast::<u8>()
                .add(offset)
                .cast::<F>()
        })
    }

    fn offsets(&self) -> FragmentOffsets {
        FragmentOffsets::for_flags(self.flags())
    }

    pub fn child_fragment(&self) -> Option<&ChildFragment> {
        self.fragment_at(self.offsets().child)
    }

    pub fn group_child_fragment(&self) -> Option<&GroupChildFragment> {
        self.fragment_at(self.offsets().group_child)
    }

    pub fn future_fragment(&self) -> Option<&FutureFragment> {
        self.fragment_at(self.offsets().future)
    }

    /// The parent of a child task.
    pub fn parent(&self) -> Option<&TaskRef> {
        self.child_fragment().map(ChildFragment::parent)
    }

    fn layout(&self) -> Result<FragmentLayout, SpawnError> {
        let result = self
            .future_fragment()
            .map_or(Layout::new::<()>(), |f| f.result_type().layout());
        FragmentLayout::compute(self.flags(), result)
    }

    /// Start of the result value of a future.
    pub(crate) fn future_storage(&self) -> Option<NonNull<u8>> {
        let offset = self.layout().ok()?.storage_offset()?;
        // Safety: the storage lies inside this task's allocation.
        Some(unsafe {
            NonNull::new_unchecked(
                (self as *const AsyncTask)
                    .cast::<u8>()
                    .add(offset)
                    .cast_mut(),
            )
        })
    }

    /// Context the next resumption will receive.
    #[inline]
    pub fn resume_context(&self) -> Option<ContextRef> {
        NonNull::new(self.resume_context.load(Ordering::Acquire))
            .map(|ctx| unsafe { ContextRef::from_raw(ctx) })
    }

    /// Set where the task continues when its job next runs.
    ///
    /// # Safety
    ///
    /// Only the thread currently running the task (or its spawner, before
    /// the task is first scheduled) may call this, and the task must not be
    /// published to another thread until it returns.
    pub unsafe fn set_resume_point(
        &self,
        resume: TaskContinuationFunction,
        context: Option<ContextRef>,
    ) {
        unsafe { self.job.set_resume_task_function(resume) };
        let context = context.map_or(ptr::null_mut(), |c| c.as_ptr().as_ptr());
        self.resume_context.store(context, Ordering::Release);
    }

    // ---- task stack allocator -------------------------------------------

    /// # Safety
    ///
    /// Only the thread currently running the task may use its allocator.
    #[allow(clippy::mut_from_ref)]
    unsafe fn allocator(&self) -> &mut StackAllocator {
        unsafe { &mut *self.allocator.get() }
    }

    /// Allocate a context frame on the task's stack.
    ///
    /// # Safety
    ///
    /// Only the thread currently running the task (or its spawner, before
    /// the task is first scheduled) may allocate frames.
    pub unsafe fn alloc_frame<C: ContextFrame>(
        &self,
        frame: C,
    ) -> Result<ContextRef, AllocError> {
        let frame = unsafe { self.allocator() }.alloc_value(frame)?;
        Ok(ContextRef::from_frame(frame))
    }

    /// Free the most recent context frame, dropping it.
    ///
    /// # Safety
    ///
    /// As for [`alloc_frame`](Self::alloc_frame). Panics if `context` is not
    /// the most recent frame.
    pub unsafe fn dealloc_frame(
        &self,
        context: ContextRef,
    ) {
        unsafe { self.allocator() }.dealloc(context.as_ptr().cast());
    }

    /// The frame the task was spawned with.
    ///
    /// # Safety
    ///
    /// As for [`alloc_frame`](Self::alloc_frame).
    pub unsafe fn initial_context(&self) -> Option<ContextRef> {
        unsafe { self.allocator() }
            .outermost()
            .map(|p| unsafe { ContextRef::from_raw(p.cast()) })
    }

    // ---- status and cancellation ----------------------------------------

    /// Snapshot of the status word.
    #[inline]
    pub fn status(&self) -> ActiveTaskStatus {
        self.status.load(Ordering::Acquire)
    }

    /// Whether the task has been cancelled. A relaxed read: a concurrent
    /// cancellation may not be visible yet.
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.status.load(Ordering::Relaxed).is_cancelled()
    }

    /// Take the status record lock.
    pub fn lock_status(&self) -> StatusLockGuard<'_> {
        self.status.lock()
    }

    /// Push `record` as the innermost status record.
    ///
    /// Returns `false` if the task was already cancelled; the record is
    /// added either way and the caller should react to the cancellation.
    pub fn add_status_record(
        &self,
        record: Arc<TaskStatusRecord>,
    ) -> bool {
        let mut guard = self.lock_status();
        guard.push(record);
        !guard.is_cancelled()
    }

    /// Pop `record`, which must be the innermost record.
    ///
    /// Returns `false` if the task was cancelled.
    ///
    /// # Panics
    ///
    /// Panics if `record` is not the innermost status record.
    pub fn pop_status_record(
        &self,
        record: &Arc<TaskStatusRecord>,
    ) -> bool {
        let (popped, cancelled) = {
            let mut guard = self.lock_status();
            let popped = guard.pop(record);
            (popped, guard.is_cancelled())
        };
        drop(popped);
        !cancelled
    }

    /// Unlink `record` from anywhere in the chain. Returns whether it was
    /// linked into this task.
    pub fn remove_status_record(
        &self,
        record: &TaskStatusRecord,
    ) -> bool {
        let removed = self.lock_status().remove(record);
        removed.is_some()
    }

    /// Walk the status records, innermost first, under the lock.
    pub fn with_status_records<R>(
        &self,
        f: impl FnOnce(StatusRecordIter<'_>) -> R,
    ) -> R {
        let guard = self.lock_status();
        f(guard.records())
    }

    /// Cancel the task.
    ///
    /// Sets the cancelled flag. The call that actually flips the flag then
    /// walks the status records under the lock, cancelling listed child
    /// tasks and running cancellation handlers. Later calls do nothing.
    /// Cancellation is advisory: running work is not interrupted.
    pub fn cancel(&self) {
        if !self.status.set_cancelled() {
            return;
        }
        debug!(task = ?NonNull::from(self), "task cancelled");

        let guard = self.lock_status();
        for record in guard.records() {
            match record.kind() {
                TaskStatusRecordKind::ChildTask(children)
                | TaskStatusRecordKind::TaskGroup { children, .. } => {
                    for child in children.iter() {
                        child.cancel();
                    }
                }
                TaskStatusRecordKind::CancellationNotification(handler) => handler(),
                TaskStatusRecordKind::Private => {}
            }
        }
    }

    /// Remove this child from its parent's child lists. A child-task record
    /// left empty is unlinked as well.
    fn detach_from_parent(&self) {
        let Some(parent) = self.parent() else {
            return;
        };
        let mut guard = parent.lock_status();
        let emptied = guard
            .records()
            .find(|record| record.children().is_some_and(|c| c.detach(self)))
            .filter(|record| {
                matches!(record.kind(), TaskStatusRecordKind::ChildTask(c) if c.is_empty())
            })
            .map(NonNull::from);
        // Safety: the record is linked into the parent, whose lock is held.
        let removed = emptied.and_then(|record| guard.remove(unsafe { record.as_ref() }));
        drop(guard);
        drop(removed);
    }

    // ---- task-local values ----------------------------------------------

    /// Bind `value` under key `K` for this task and its children.
    pub fn local_value_push<K: 'static, V: Send + Sync + 'static>(
        &self,
        value: V,
    ) {
        self.local.push::<K, V>(value);
    }

    /// Look up key `K`, falling back to ancestors unless told not to.
    pub fn local_value_get<K: 'static, V: Send + Sync + 'static>(
        &self,
        inheritance: TaskLocalInheritance,
    ) -> Option<Arc<V>> {
        let mut task = self;
        loop {
            if let Some(value) = task.local.get::<K, V>() {
                return Some(value);
            }
            if inheritance == TaskLocalInheritance::DoNotInherit {
                return None;
            }
            task = task.parent()?;
        }
    }

    /// Remove this task's innermost binding.
    ///
    /// # Panics
    ///
    /// Panics if the task has no bindings.
    pub fn local_value_pop(&self) {
        self.local.pop();
    }
}

impl fmt::Debug for AsyncTask {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("AsyncTask")
            .field("ptr", &(self as *const AsyncTask))
            .field("flags", &self.flags())
            .field("ref_count", &self.ref_count())
            .field("status", &self.status())
            .finish()
    }
}

unsafe fn destroy_task(object: NonNull<HeapObject>) {
    let task = object.cast::<AsyncTask>();
    let (layout, live_frames) = {
        let this = unsafe { task.as_ref() };
        debug!(task = ?task, flags = ?this.flags(), "destroying task");
        this.detach_from_parent();
        this.abandon_waiters();
        (this.layout(), unsafe { this.allocator() }.live_allocations())
    };
    if live_frames > 1 {
        warn!(task = ?task, live_frames, "task destroyed with live stack frames");
    }
    let layout = match layout {
        Ok(layout) => layout,
        Err(err) => {
            error!(task = ?task, "leaking task with unrecoverable layout: {}", err);
            return;
        }
    };

    let base = task.as_ptr().cast::<u8>();
    unsafe {
        if let Some(offset) = layout.future_offset() {
            let fragment = base.add(offset).cast::<FutureFragment>();
            if (*fragment).status() == FutureStatus::Success {
                if let Some(storage) = layout.storage_offset() {
                    (*fragment)
                        .result_type()
                        .drop_in_place(NonNull::new_unchecked(base.add(storage)));
                }
            }
            ptr::drop_in_place(fragment);
        }
        if let Some(offset) = layout.group_child_offset() {
            ptr::drop_in_place(base.add(offset).cast::<GroupChildFragment>());
        }
        // The child fragment goes last: it may hold the last reference to
        // the parent.
        ptr::drop_in_place(task.as_ptr());
        if let Some(offset) = layout.child_offset() {
            ptr::drop_in_place(base.add(offset).cast::<ChildFragment>());
        }
        dealloc(base, layout.layout());
    }
}

/// Resume function of every task's initial frame: finishes the task.
pub(crate) fn complete_task(
    task: TaskRef,
    executor: ExecutorRef,
    _context: Option<ContextRef>,
) {
    let Some(initial) = (unsafe { task.initial_context() }) else {
        panic!("task {:p} completed without an initial frame", task.as_ptr());
    };

    if task.flags().task_is_future() {
        match unsafe { initial.as_future() } {
            Some(frame) => task.complete_future(frame, executor),
            None => panic!("future task {:p} has no future frame", task.as_ptr()),
        }
    }

    let records = task.lock_status().take_all();
    drop(records);

    unsafe {
        task.dealloc_frame(initial);
        task.set_resume_point(complete_task, None);
    }
    trace!(task = ?task.as_ptr(), "task finished");
}

/// Owning handle to an [`AsyncTask`]. Cloning retains, dropping releases.
pub struct TaskRef(NonNull<AsyncTask>);

unsafe impl Send for TaskRef {}
unsafe impl Sync for TaskRef {}

impl TaskRef {
    /// Wrap a raw task pointer, taking over one reference.
    ///
    /// # Safety
    ///
    /// `task` must point to a live task and the caller must own the
    /// reference being transferred.
    #[inline]
    pub unsafe fn from_raw(task: NonNull<AsyncTask>) -> Self {
        Self(task)
    }

    /// Give up the handle without releasing its reference.
    #[inline]
    pub fn into_raw(self) -> NonNull<AsyncTask> {
        let task = self.0;
        mem::forget(self);
        task
    }

    #[inline]
    pub fn as_ptr(&self) -> NonNull<AsyncTask> {
        self.0
    }

    #[inline]
    pub fn ptr_eq(
        a: &TaskRef,
        b: &TaskRef,
    ) -> bool {
        a.0 == b.0
    }

    /// Turn the handle into a job for an executor queue.
    pub fn into_job(self) -> JobRef {
        let task = self.into_raw();
        // Safety: the job is a field of the task, and the reference moves
        // into the JobRef.
        unsafe { JobRef::from_raw(NonNull::from(&(*task.as_ptr()).job)) }
    }

    /// Run the task's resume function with its resume context.
    pub fn resume(
        self,
        executor: ExecutorRef,
    ) {
        let resume = self.job.resume_task_function();
        let context = self.resume_context();
        resume(self, executor, context);
    }

    /// Continue at `resume` with `context` on `executor`.
    ///
    /// Must be called by the thread running the task, as its last action
    /// before returning to the scheduler.
    pub fn enqueue_continuation(
        self,
        resume: TaskContinuationFunction,
        context: Option<ContextRef>,
        executor: ExecutorRef,
    ) {
        // Safety: the caller is running the task, and the enqueue publishes it.
        unsafe { self.set_resume_point(resume, context) };
        executor.enqueue(self.into_job());
    }

    /// Suspend until `future` completes, then continue at `resume` with
    /// `context` on `executor`.
    ///
    /// If the future has already completed the task is enqueued right away
    /// rather than resumed recursively. Must be the running thread's last
    /// action before returning to the scheduler.
    pub fn await_future(
        self,
        future: &TaskRef,
        resume: TaskContinuationFunction,
        context: Option<ContextRef>,
        executor: ExecutorRef,
    ) {
        // Safety: the caller is running the task; the wait queue CAS or the
        // enqueue publishes it.
        unsafe { self.set_resume_point(resume, context) };
        match future.wait_future(&self) {
            FutureStatus::Executing => {}
            FutureStatus::Success | FutureStatus::Error => executor.enqueue(self.into_job()),
        }
    }
}

impl Clone for TaskRef {
    fn clone(&self) -> Self {
        self.retain()
    }
}

impl Drop for TaskRef {
    fn drop(&mut self) {
        // Safety: the handle owns one reference; the heap header is at
        // offset zero.
        unsafe { HeapObject::release_and_destroy(self.0.cast()) };
    }
}

impl Deref for TaskRef {
    type Target = AsyncTask;

    fn deref(&self) -> &AsyncTask {
        // Safety: a TaskRef keeps its task alive.
        unsafe { self.0.as_ref() }
    }
}

impl fmt::Debug for TaskRef {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

#[cfg(test)]
mod tests;
