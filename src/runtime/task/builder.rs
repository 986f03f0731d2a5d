//! Spawning tasks.
//!
//! Spawning lays out the header and the fragments the task needs in one
//! allocation, initialises them, and places the initial frame on the task's
//! own stack. The initial frame resumes [`complete_task`] when the entry
//! function finishes, so the entry ends by resuming its frame's parent:
//!
//! ```ignore
//! fn entry(task: TaskRef, executor: ExecutorRef, context: Option<ContextRef>) {
//!     let context = context.unwrap();
//!     unsafe { context.as_future() }.unwrap().return_value(42u64);
//!     unsafe { AsyncContext::resume_parent_of(context, task, executor) };
//! }
//! ```
//!
//! The returned [`TaskRef`] is not yet scheduled; hand
//! [`TaskRef::into_job`] to an executor to start it.

use std::alloc::{alloc, Layout, LayoutError};
use std::any::Any;
use std::cell::UnsafeCell;
use std::fmt;
use std::ptr::{self, NonNull};
use std::sync::atomic::AtomicPtr;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::debug;

use super::{
    complete_task, AllocError, AsyncTask, ChildFragment, FragmentLayout, FutureFragment,
    GroupChildFragment, ResultType, StackAllocator, TaskLocalStorage, TaskRef, TASK_METADATA,
};
use crate::runtime::context::{
    AsyncContext, ContextRef, FutureAsyncContext, FutureClosureAsyncContext,
};
use crate::runtime::executor::ExecutorRef;
use crate::runtime::group::TaskGroup;
use crate::runtime::heap::HeapObject;
use crate::runtime::job::{Job, JobFlags, JobPriority, TaskContinuationFunction};
use crate::runtime::status::{AtomicTaskStatus, TaskStatusRecord, TaskStatusRecordKind};
use crate::util::config::{AllocatorConfig, DEFAULT_SLAB_SIZE};

/// Errors returned when spawning a task.
#[derive(Debug, Error)]
pub enum SpawnError {
    /// Fragment offsets overflowed the address space
    #[error("task layout overflows the address space")]
    LayoutOverflow,
    /// Size and alignment do not form a valid layout
    #[error("invalid task layout: {0}")]
    Layout(#[from] LayoutError),
    /// The task allocation failed
    #[error("out of memory allocating a {size} byte task")]
    OutOfMemory { size: usize },
    /// The initial frame could not be placed on the task's stack
    #[error("failed to allocate the initial frame: {0}")]
    InitialFrame(#[from] AllocError),
    /// Group children report a result, so they must be futures
    #[error("a task group child must be spawned as a future")]
    GroupChildWithoutResult,
}

/// Configures and spawns tasks.
#[derive(Clone)]
pub struct TaskBuilder {
    priority: JobPriority,
    parent: Option<TaskRef>,
    group: Option<Arc<dyn TaskGroup>>,
    slab_size: usize,
}

impl Default for TaskBuilder {
    fn default() -> Self {
        Self {
            priority: JobPriority::Unspecified,
            parent: None,
            group: None,
            slab_size: DEFAULT_SLAB_SIZE,
        }
    }
}

impl TaskBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &AllocatorConfig) -> Self {
        Self::default().slab_size(config.slab_size)
    }

    /// Priority of the new task. `Unspecified` inherits the parent's.
    pub fn priority(
        mut self,
        priority: JobPriority,
    ) -> Self {
        self.priority = priority;
        self
    }

    /// Spawn as a child of `parent`.
    ///
    /// The child is registered in the parent's status records, so cancelling
    /// the parent cancels it. Only the parent's own thread of control may
    /// spawn its children.
    pub fn parent(
        mut self,
        parent: &TaskRef,
    ) -> Self {
        self.parent = Some(parent.clone());
        self
    }

    /// Spawn into `group`, which is offered the task once it completes.
    pub fn group(
        mut self,
        group: &Arc<dyn TaskGroup>,
    ) -> Self {
        self.group = Some(group.clone());
        self
    }

    /// Bytes per slab of the task's frame allocator.
    pub fn slab_size(
        mut self,
        slab_size: usize,
    ) -> Self {
        self.slab_size = slab_size;
        self
    }

    /// Spawn a task that produces no result. `entry` runs with an ordinary
    /// initial frame.
    pub fn spawn(
        &self,
        entry: TaskContinuationFunction,
    ) -> Result<TaskRef, SpawnError> {
        self.spawn_raw(entry, None, |task, _| {
            // Safety: the task is not yet published.
            unsafe {
                task.alloc_frame(AsyncContext::new(
                    None,
                    complete_task,
                    ExecutorRef::generic(),
                ))
            }
        })
    }

    /// Spawn a future producing a `T`. `entry` runs with a
    /// [`FutureAsyncContext`] whose result points into the task.
    pub fn spawn_future<T: Send + Sync + 'static>(
        &self,
        entry: TaskContinuationFunction,
    ) -> Result<TaskRef, SpawnError> {
        let result_type = ResultType::of::<T>();
        self.spawn_raw(entry, Some(result_type), |task, storage| {
            // Safety: the storage is the task's own result slot, laid out
            // for `result_type`, and the frame lives on the task's stack.
            let frame = unsafe {
                FutureAsyncContext::new(
                    None,
                    complete_task,
                    ExecutorRef::generic(),
                    future_storage_of(task, storage),
                    result_type,
                )
            };
            // Safety: the task is not yet published.
            unsafe { task.alloc_frame(frame) }
        })
    }

    /// Spawn a future whose initial frame also owns `closure_context`.
    pub fn spawn_future_with_context<T: Send + Sync + 'static>(
        &self,
        entry: TaskContinuationFunction,
        closure_context: Arc<dyn Any + Send + Sync>,
    ) -> Result<TaskRef, SpawnError> {
        let result_type = ResultType::of::<T>();
        self.spawn_raw(entry, Some(result_type), move |task, storage| {
            // Safety: as above.
            let frame = unsafe {
                FutureClosureAsyncContext::new(
                    None,
                    complete_task,
                    ExecutorRef::generic(),
                    future_storage_of(task, storage),
                    result_type,
                    closure_context,
                )
            };
            // Safety: the task is not yet published.
            unsafe { task.alloc_frame(frame) }
        })
    }

    /// Spawn a future that runs `body` once and completes with its outcome.
    pub fn spawn_closure<T, F>(
        &self,
        body: F,
    ) -> Result<TaskRef, SpawnError>
    where
        T: Send + Sync + 'static,
        F: FnOnce(&TaskRef) -> anyhow::Result<T> + Send + 'static,
    {
        let slot: Arc<dyn Any + Send + Sync> = Arc::new(Mutex::new(Some(body)));
        self.spawn_future_with_context::<T>(closure_entry::<T, F>, slot)
    }

    fn spawn_raw<I>(
        &self,
        entry: TaskContinuationFunction,
        result_type: Option<&'static ResultType>,
        initial_frame: I,
    ) -> Result<TaskRef, SpawnError>
    where
        I: FnOnce(&AsyncTask, Option<NonNull<u8>>) -> Result<ContextRef, AllocError>,
    {
        if self.group.is_some() && result_type.is_none() {
            return Err(SpawnError::GroupChildWithoutResult);
        }

        let priority = match (&self.parent, self.priority) {
            (Some(parent), JobPriority::Unspecified) => parent.priority(),
            (_, priority) => priority,
        };
        let flags = JobFlags::task(priority)
            .with_child_task(self.parent.is_some())
            .with_group_child_task(self.group.is_some())
            .with_future(result_type.is_some());
        let layout = FragmentLayout::compute(
            flags,
            result_type.map_or(Layout::new::<()>(), ResultType::layout),
        )?;

        // Safety: the layout has a non-zero size since it holds the header.
        let base = unsafe { alloc(layout.layout()) };
        let Some(base) = NonNull::new(base) else {
            return Err(SpawnError::OutOfMemory {
                size: layout.size(),
            });
        };

        // Safety: the allocation is sized and aligned by `layout`, and every
        // fragment offset lies inside it.
        let task = unsafe {
            base.cast::<AsyncTask>().as_ptr().write(AsyncTask {
                heap: HeapObject::new(&TASK_METADATA),
                job: Job::new_task(flags, entry),
                resume_context: AtomicPtr::new(ptr::null_mut()),
                status: AtomicTaskStatus::new(),
                allocator: UnsafeCell::new(StackAllocator::new(self.slab_size)),
                local: TaskLocalStorage::new(),
            });
            if let (Some(offset), Some(parent)) = (layout.child_offset(), &self.parent) {
                let fragment = base.as_ptr().add(offset).cast::<ChildFragment>();
                fragment.write(ChildFragment::new(parent.clone()));
            }
            if let (Some(offset), Some(group)) = (layout.group_child_offset(), &self.group) {
                let fragment = base.as_ptr().add(offset).cast::<GroupChildFragment>();
                fragment.write(GroupChildFragment::new(group));
            }
            if let (Some(offset), Some(result_type)) = (layout.future_offset(), result_type) {
                let fragment = base.as_ptr().add(offset).cast::<FutureFragment>();
                fragment.write(FutureFragment::new(result_type));
            }
            TaskRef::from_raw(base.cast())
        };

        // Dropping the task on failure frees everything initialised so far.
        let context = initial_frame(&task, task.future_storage())?;
        // Safety: the task is not yet published.
        unsafe { task.set_resume_point(entry, Some(context)) };

        if let Some(parent) = &self.parent {
            register_child(parent, &task, self.group.as_ref());
        }

        debug!(task = ?task.as_ptr(), ?flags, size = layout.size(), "spawned task");
        Ok(task)
    }
}

impl fmt::Debug for TaskBuilder {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("TaskBuilder")
            .field("priority", &self.priority)
            .field("parent", &self.parent.as_ref().map(TaskRef::as_ptr))
            .field("group", &self.group.is_some())
            .field("slab_size", &self.slab_size)
            .finish()
    }
}

fn future_storage_of(
    task: &AsyncTask,
    storage: Option<NonNull<u8>>,
) -> NonNull<u8> {
    match storage {
        Some(storage) => storage,
        None => panic!("future task {:p} has no result storage", task),
    }
}

/// List `child` in its parent's status records.
///
/// Plain children get a child-task record of their own; group children join
/// the record of their group, which is created on first use. The records do
/// not keep the child alive. A child of an already cancelled parent is
/// cancelled straight away.
fn register_child(
    parent: &TaskRef,
    child: &TaskRef,
    group: Option<&Arc<dyn TaskGroup>>,
) {
    let cancelled = {
        let mut guard = parent.lock_status();
        match group {
            Some(group) => {
                let joined = match guard.records().find(|record| {
                    matches!(
                        record.kind(),
                        TaskStatusRecordKind::TaskGroup { group: existing, .. }
                            if ptr::addr_eq(Arc::as_ptr(existing), Arc::as_ptr(group))
                    )
                }) {
                    Some(record) => {
                        if let Some(children) = record.children() {
                            children.attach(child);
                        }
                        true
                    }
                    None => false,
                };
                if !joined {
                    let record = TaskStatusRecord::task_group(group.clone());
                    if let Some(children) = record.children() {
                        children.attach(child);
                    }
                    guard.push(record);
                }
            }
            None => guard.push(TaskStatusRecord::child_task(child)),
        }
        guard.is_cancelled()
    };
    if cancelled {
        child.cancel();
    }
}

fn closure_entry<T, F>(
    task: TaskRef,
    executor: ExecutorRef,
    context: Option<ContextRef>,
) where
    T: Send + Sync + 'static,
    F: FnOnce(&TaskRef) -> anyhow::Result<T> + Send + 'static,
{
    let Some(context) = context else {
        panic!("closure task {:p} resumed without a frame", task.as_ptr());
    };
    // Safety: the initial frame lives until the completion routine frees it.
    let Some(frame) = (unsafe { context.as_future_closure() }) else {
        panic!("closure task {:p} resumed with the wrong frame", task.as_ptr());
    };

    let body = frame
        .closure_context()
        .downcast_ref::<Mutex<Option<F>>>()
        .and_then(|slot| slot.lock().take());
    match body.map(|body| body(&task)) {
        Some(Ok(value)) => frame.future().return_value(value),
        Some(Err(error)) => frame.future().fail(error),
        None => frame
            .future()
            .fail(anyhow::anyhow!("closure task body already ran")),
    }

    // Safety: the frame is live; nothing borrows it past this point.
    unsafe { AsyncContext::resume_parent_of(context, task, executor) };
}
