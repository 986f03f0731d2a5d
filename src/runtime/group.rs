//! Task groups: collectors of child task completions.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use crate::runtime::task::TaskRef;

/// Receives each group child exactly once, after the child's future has
/// completed.
pub trait TaskGroup: Send + Sync {
    fn offer(
        &self,
        completed: TaskRef,
    );
}

/// A task group that queues completed children in completion order.
#[derive(Default)]
pub struct TaskGroupQueue {
    completed: Mutex<VecDeque<TaskRef>>,
    offered: AtomicUsize,
}

impl TaskGroupQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// This group as the trait object children are spawned into.
    pub fn as_group(self: &Arc<Self>) -> Arc<dyn TaskGroup> {
        self.clone()
    }

    /// The next completed child, if any. Its result is readable.
    pub fn poll_next(&self) -> Option<TaskRef> {
        self.completed.lock().pop_front()
    }

    /// Completed children not yet taken.
    pub fn len(&self) -> usize {
        self.completed.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.completed.lock().is_empty()
    }

    /// Total children ever offered.
    pub fn offered(&self) -> usize {
        self.offered.load(Ordering::Acquire)
    }
}

impl TaskGroup for TaskGroupQueue {
    fn offer(
        &self,
        completed: TaskRef,
    ) {
        trace!(task = ?completed.as_ptr(), "group child offered");
        self.completed.lock().push_back(completed);
        self.offered.fetch_add(1, Ordering::AcqRel);
    }
}

impl fmt::Debug for TaskGroupQueue {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("TaskGroupQueue")
            .field("pending", &self.len())
            .field("offered", &self.offered())
            .finish()
    }
}
