//! Child and task-group fragments.

use std::fmt;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::{Arc, Weak};

use super::{AsyncTask, TaskRef};
use crate::runtime::group::TaskGroup;

/// Present on tasks spawned as children of another task.
///
/// The child owns a reference to its parent. The parent only lists its
/// children by address: a child unlinks itself from the parent's status
/// records before it is destroyed.
#[repr(C)]
pub struct ChildFragment {
    parent: TaskRef,
    /// Next sibling in the parent's child list. Written only under the
    /// parent's status lock.
    next_child: AtomicPtr<AsyncTask>,
}

impl ChildFragment {
    pub(crate) fn new(parent: TaskRef) -> Self {
        Self {
            parent,
            next_child: AtomicPtr::new(ptr::null_mut()),
        }
    }

    #[inline]
    pub fn parent(&self) -> &TaskRef {
        &self.parent
    }

    /// The next sibling in the parent's child list. Only dereferenceable
    /// while the parent's status lock is held.
    #[inline]
    pub fn next_child(&self) -> Option<NonNull<AsyncTask>> {
        NonNull::new(self.next_child.load(Ordering::Acquire))
    }

    /// Link `child` as the next sibling.
    ///
    /// Must only be called with the parent's status lock held. The release
    /// store publishes the fully initialised sibling to readers.
    pub(crate) fn set_next_child(
        &self,
        child: Option<NonNull<AsyncTask>>,
    ) {
        let child = child.map_or(ptr::null_mut(), NonNull::as_ptr);
        self.next_child.store(child, Ordering::Release);
    }
}

impl fmt::Debug for ChildFragment {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("ChildFragment")
            .field("parent", &self.parent.as_ptr())
            .field("next_child", &self.next_child.load(Ordering::Relaxed))
            .finish()
    }
}

/// Present on tasks spawned into a task group.
#[repr(C)]
pub struct GroupChildFragment {
    group: Weak<dyn TaskGroup>,
}

impl GroupChildFragment {
    pub(crate) fn new(group: &Arc<dyn TaskGroup>) -> Self {
        Self {
            group: Arc::downgrade(group),
        }
    }

    /// The owning group, if it is still alive.
    pub fn group(&self) -> Option<Arc<dyn TaskGroup>> {
        self.group.upgrade()
    }
}

impl fmt::Debug for GroupChildFragment {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("GroupChildFragment")
            .field("alive", &(self.group.strong_count() > 0))
            .finish()
    }
}
