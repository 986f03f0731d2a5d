//! Async context frames: the continuation chain of a running task.
//!
//! Every logical call inside a task has a frame allocated from the task's
//! stack allocator. A frame records who to resume when it returns: the
//! parent frame, the parent's continuation function, and the executor the
//! parent must run on. Suspending is just storing state in the frame and
//! returning to the scheduler; resuming is calling a function pointer.
//!
//! All frame types are `#[repr(C)]` with an [`AsyncContext`] as their first
//! field, so a [`ContextRef`] can point at any of them and be narrowed by
//! checking the frame kind.

use std::any::Any;
use std::cell::Cell;
use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

use tracing::trace;

use crate::runtime::executor::ExecutorRef;
use crate::runtime::job::TaskContinuationFunction;
use crate::runtime::task::{ResultType, TaskRef};
use crate::util::bit::Pack;

const KIND: Pack = Pack::least_significant(8);

/// Which frame type a context is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum AsyncContextKind {
    Ordinary = 0,
    Yielding = 1,
    Future = 2,
    FutureClosure = 3,
}

impl AsyncContextKind {
    #[inline]
    pub fn from_u8(val: u8) -> Self {
        match val {
            1 => AsyncContextKind::Yielding,
            2 => AsyncContextKind::Future,
            3 => AsyncContextKind::FutureClosure,
            _ => AsyncContextKind::Ordinary,
        }
    }
}

/// Flags word of a context frame.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct AsyncContextFlags(u32);

impl AsyncContextFlags {
    pub fn new(kind: AsyncContextKind) -> Self {
        Self(KIND.pack(kind as usize, 0) as u32)
    }

    #[inline]
    pub fn kind(&self) -> AsyncContextKind {
        AsyncContextKind::from_u8(KIND.unpack(self.0 as usize) as u8)
    }

    #[inline]
    pub fn bits(&self) -> u32 {
        self.0
    }
}

impl fmt::Debug for AsyncContextFlags {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("AsyncContextFlags")
            .field("kind", &self.kind())
            .finish()
    }
}

/// Pointer to a live context frame of any kind.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextRef(NonNull<AsyncContext>);

// Frames belong to a task and move between threads with it.
unsafe impl Send for ContextRef {}
unsafe impl Sync for ContextRef {}

impl ContextRef {
    /// Wrap a raw frame pointer.
    ///
    /// # Safety
    ///
    /// `frame` must point to a frame type whose first field is an
    /// `AsyncContext` with a matching kind.
    #[inline]
    pub unsafe fn from_raw(frame: NonNull<AsyncContext>) -> Self {
        Self(frame)
    }

    /// Point at a frame.
    #[inline]
    pub fn from_frame<C: ContextFrame>(frame: NonNull<C>) -> Self {
        Self(frame.cast())
    }

    #[inline]
    pub fn as_ptr(&self) -> NonNull<AsyncContext> {
        self.0
    }

    /// # Safety
    ///
    /// The frame must still be live for `'a`.
    #[inline]
    pub unsafe fn as_ref<'a>(self) -> &'a AsyncContext {
        unsafe { &*self.0.as_ptr() }
    }

    /// # Safety
    ///
    /// The frame must still be live for `'a`.
    pub unsafe fn as_yielding<'a>(self) -> Option<&'a YieldingAsyncContext> {
        let base = unsafe { self.as_ref() };
        (base.kind() == AsyncContextKind::Yielding)
            .then(|| unsafe { &*self.0.as_ptr().cast::<YieldingAsyncContext>() })
    }

    /// The future part of a future or future-closure frame.
    ///
    /// # Safety
    ///
    /// The frame must still be live for `'a`.
    pub unsafe fn as_future<'a>(self) -> Option<&'a FutureAsyncContext> {
        let base = unsafe { self.as_ref() };
        matches!(
            base.kind(),
            AsyncContextKind::Future | AsyncContextKind::FutureClosure
        )
        .then(|| unsafe { &*self.0.as_ptr().cast::<FutureAsyncContext>() })
    }

    /// # Safety
    ///
    /// The frame must still be live for `'a`.
    pub unsafe fn as_future_closure<'a>(self) -> Option<&'a FutureClosureAsyncContext> {
        let base = unsafe { self.as_ref() };
        (base.kind() == AsyncContextKind::FutureClosure)
            .then(|| unsafe { &*self.0.as_ptr().cast::<FutureClosureAsyncContext>() })
    }
}

impl fmt::Debug for ContextRef {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_tuple("ContextRef").field(&self.0).finish()
    }
}

/// A frame type usable as a context.
///
/// # Safety
///
/// Implementors must be `#[repr(C)]` with an `AsyncContext` (directly or
/// through another `ContextFrame`) at offset zero whose kind matches the
/// implementing type.
pub unsafe trait ContextFrame: Send {
    fn base(&self) -> &AsyncContext;
}

/// The common header of every frame.
#[repr(C, align(16))]
pub struct AsyncContext {
    parent: Option<ContextRef>,
    resume_parent: TaskContinuationFunction,
    resume_parent_executor: ExecutorRef,
    flags: AsyncContextFlags,
}

unsafe impl ContextFrame for AsyncContext {
    fn base(&self) -> &AsyncContext {
        self
    }
}

impl AsyncContext {
    /// An ordinary frame that resumes `parent` through `resume_parent` on
    /// `resume_parent_executor`.
    pub fn new(
        parent: Option<ContextRef>,
        resume_parent: TaskContinuationFunction,
        resume_parent_executor: ExecutorRef,
    ) -> Self {
        Self::with_kind(
            AsyncContextKind::Ordinary,
            parent,
            resume_parent,
            resume_parent_executor,
        )
    }

    fn with_kind(
        kind: AsyncContextKind,
        parent: Option<ContextRef>,
        resume_parent: TaskContinuationFunction,
        resume_parent_executor: ExecutorRef,
    ) -> Self {
        Self {
            parent,
            resume_parent,
            resume_parent_executor,
            flags: AsyncContextFlags::new(kind),
        }
    }

    #[inline]
    pub fn parent(&self) -> Option<ContextRef> {
        self.parent
    }

    #[inline]
    pub fn resume_parent_function(&self) -> TaskContinuationFunction {
        self.resume_parent
    }

    #[inline]
    pub fn resume_parent_executor(&self) -> &ExecutorRef {
        &self.resume_parent_executor
    }

    #[inline]
    pub fn flags(&self) -> AsyncContextFlags {
        self.flags
    }

    #[inline]
    pub fn kind(&self) -> AsyncContextKind {
        self.flags.kind()
    }

    /// Resume the parent frame. Must be the last thing the caller does
    /// before returning to the scheduler.
    ///
    /// Runs the continuation in place unless the parent asked for a
    /// specific executor other than `executor`, in which case the task is
    /// enqueued there instead.
    pub fn resume_parent(
        &self,
        task: TaskRef,
        executor: ExecutorRef,
    ) {
        continue_on(
            self.resume_parent,
            self.parent,
            self.resume_parent_executor.clone(),
            task,
            executor,
        );
    }

    /// Resume the parent of `context` without holding a borrow of the frame.
    ///
    /// Use this when the continuation may free the frame, as the task
    /// completion routine does with the initial frame.
    ///
    /// # Safety
    ///
    /// `context` must be live when this is called.
    pub unsafe fn resume_parent_of(
        context: ContextRef,
        task: TaskRef,
        executor: ExecutorRef,
    ) {
        let (resume, parent, target) = {
            let frame = unsafe { context.as_ref() };
            (
                frame.resume_parent,
                frame.parent,
                frame.resume_parent_executor.clone(),
            )
        };
        continue_on(resume, parent, target, task, executor);
    }

    /// Free `context` from the task's allocator, then resume its parent.
    ///
    /// # Safety
    ///
    /// `context` must be the task's most recent frame and must be called
    /// from the thread running `task`.
    pub unsafe fn return_to_parent(
        context: ContextRef,
        task: TaskRef,
        executor: ExecutorRef,
    ) {
        let frame = unsafe { context.as_ref() };
        let resume = frame.resume_parent;
        let parent = frame.parent;
        let target = frame.resume_parent_executor.clone();
        unsafe { task.dealloc_frame(context) };
        continue_on(resume, parent, target, task, executor);
    }
}

fn continue_on(
    resume: TaskContinuationFunction,
    parent: Option<ContextRef>,
    target: ExecutorRef,
    task: TaskRef,
    executor: ExecutorRef,
) {
    if target.is_generic() || target == executor {
        resume(task, executor, parent);
    } else {
        trace!(task = ?task.as_ptr(), "switching executor to resume parent frame");
        task.enqueue_continuation(resume, parent, target);
    }
}

impl fmt::Debug for AsyncContext {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("AsyncContext")
            .field("kind", &self.kind())
            .field("parent", &self.parent)
            .field("resume_parent_executor", &self.resume_parent_executor)
            .finish()
    }
}

/// A frame that can hand control back to its parent without returning.
#[repr(C)]
pub struct YieldingAsyncContext {
    base: AsyncContext,
    yield_to_parent: TaskContinuationFunction,
    yield_to_parent_executor: ExecutorRef,
}

unsafe impl ContextFrame for YieldingAsyncContext {
    fn base(&self) -> &AsyncContext {
        &self.base
    }
}

impl YieldingAsyncContext {
    pub fn new(
        parent: Option<ContextRef>,
        resume_parent: TaskContinuationFunction,
        resume_parent_executor: ExecutorRef,
        yield_to_parent: TaskContinuationFunction,
        yield_to_parent_executor: ExecutorRef,
    ) -> Self {
        Self {
            base: AsyncContext::with_kind(
                AsyncContextKind::Yielding,
                parent,
                resume_parent,
                resume_parent_executor,
            ),
            yield_to_parent,
            yield_to_parent_executor,
        }
    }

    #[inline]
    pub fn yield_to_parent_executor(&self) -> &ExecutorRef {
        &self.yield_to_parent_executor
    }

    /// Suspend this frame and run the parent's yield continuation. The frame
    /// stays allocated and can be resumed later.
    pub fn yield_to_parent(
        &self,
        task: TaskRef,
        executor: ExecutorRef,
    ) {
        continue_on(
            self.yield_to_parent,
            self.base.parent,
            self.yield_to_parent_executor.clone(),
            task,
            executor,
        );
    }
}

/// Initial frame of a future task: where its result goes.
#[repr(C)]
pub struct FutureAsyncContext {
    base: AsyncContext,
    error_result: Cell<Option<anyhow::Error>>,
    indirect_result: NonNull<u8>,
    result_type: &'static ResultType,
    result_written: Cell<bool>,
}

// The result pointer targets the owning task's storage, which moves with the
// task.
unsafe impl Send for FutureAsyncContext {}

unsafe impl ContextFrame for FutureAsyncContext {
    fn base(&self) -> &AsyncContext {
        &self.base
    }
}

impl FutureAsyncContext {
    /// A frame that writes its result to `indirect_result`.
    ///
    /// # Safety
    ///
    /// `indirect_result` must be valid for writes of a value laid out as
    /// `result_type` for as long as the frame can store an outcome.
    ///
    /// Building a frame over arbitrary storage needs an `unsafe` block:
    ///
    /// ```compile_fail,E0133
    /// use std::ptr::NonNull;
    /// use taskcore::runtime::{ExecutorRef, FutureAsyncContext, ResultType};
    ///
    /// let mut byte = 0u8;
    /// let frame = FutureAsyncContext::new(
    ///     None,
    ///     |_, _, _| {},
    ///     ExecutorRef::generic(),
    ///     NonNull::from(&mut byte),
    ///     ResultType::of::<u64>(),
    /// );
    /// frame.return_value(u64::MAX);
    /// ```
    pub unsafe fn new(
        parent: Option<ContextRef>,
        resume_parent: TaskContinuationFunction,
        resume_parent_executor: ExecutorRef,
        indirect_result: NonNull<u8>,
        result_type: &'static ResultType,
    ) -> Self {
        Self::with_kind(
            AsyncContextKind::Future,
            parent,
            resume_parent,
            resume_parent_executor,
            indirect_result,
            result_type,
        )
    }

    fn with_kind(
        kind: AsyncContextKind,
        parent: Option<ContextRef>,
        resume_parent: TaskContinuationFunction,
        resume_parent_executor: ExecutorRef,
        indirect_result: NonNull<u8>,
        result_type: &'static ResultType,
    ) -> Self {
        Self {
            base: AsyncContext::with_kind(kind, parent, resume_parent, resume_parent_executor),
            error_result: Cell::new(None),
            indirect_result,
            result_type,
            result_written: Cell::new(false),
        }
    }

    #[inline]
    pub fn indirect_result(&self) -> NonNull<u8> {
        self.indirect_result
    }

    #[inline]
    pub fn result_type(&self) -> &'static ResultType {
        self.result_type
    }

    /// Whether the frame holds a value.
    #[inline]
    pub fn has_result(&self) -> bool {
        self.result_written.get()
    }

    fn assert_no_outcome(&self) {
        let error = self.error_result.take();
        let has_error = error.is_some();
        self.error_result.set(error);
        assert!(
            !self.has_result() && !has_error,
            "future frame already holds an outcome"
        );
    }

    /// Store the task's result.
    ///
    /// # Panics
    ///
    /// Panics if `T` is not the future's result type or an outcome was
    /// already stored.
    pub fn return_value<T: 'static>(
        &self,
        value: T,
    ) {
        assert!(
            self.result_type.is::<T>(),
            "future result is {}, not {}",
            self.result_type.type_name(),
            std::any::type_name::<T>()
        );
        self.assert_no_outcome();
        // Safety: the constructor's caller vouched for the storage fitting
        // the result type, which was just checked to be T.
        unsafe { self.indirect_result.cast::<T>().as_ptr().write(value) };
        self.result_written.set(true);
    }

    /// Store a failure instead of a result.
    ///
    /// # Panics
    ///
    /// Panics if an outcome was already stored.
    pub fn fail(
        &self,
        error: anyhow::Error,
    ) {
        self.assert_no_outcome();
        self.error_result.set(Some(error));
    }

    /// Take the stored failure, if any.
    pub fn take_error(&self) -> Option<anyhow::Error> {
        self.error_result.take()
    }
}

impl fmt::Debug for FutureAsyncContext {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("FutureAsyncContext")
            .field("base", &self.base)
            .field("result_type", &self.result_type.type_name())
            .field("has_result", &self.has_result())
            .finish()
    }
}

/// Initial frame of a future task that owns captured closure state.
#[repr(C)]
pub struct FutureClosureAsyncContext {
    future: FutureAsyncContext,
    closure_context: Arc<dyn Any + Send + Sync>,
}

unsafe impl ContextFrame for FutureClosureAsyncContext {
    fn base(&self) -> &AsyncContext {
        &self.future.base
    }
}

impl FutureClosureAsyncContext {
    /// # Safety
    ///
    /// As for [`FutureAsyncContext::new`].
    pub unsafe fn new(
        parent: Option<ContextRef>,
        resume_parent: TaskContinuationFunction,
        resume_parent_executor: ExecutorRef,
        indirect_result: NonNull<u8>,
        result_type: &'static ResultType,
        closure_context: Arc<dyn Any + Send + Sync>,
    ) -> Self {
        Self {
            future: FutureAsyncContext::with_kind(
                AsyncContextKind::FutureClosure,
                parent,
                resume_parent,
                resume_parent_executor,
                indirect_result,
                result_type,
            ),
            closure_context,
        }
    }

    #[inline]
    pub fn future(&self) -> &FutureAsyncContext {
        &self.future
    }

    #[inline]
    pub fn closure_context(&self) -> &Arc<dyn Any + Send + Sync> {
        &self.closure_context
    }
}

impl fmt::Debug for FutureClosureAsyncContext {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("FutureClosureAsyncContext")
            .field("future", &self.future)
            .finish_non_exhaustive()
    }
}
