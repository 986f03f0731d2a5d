//! Status records linked into a task's status word.

use std::fmt;
use std::iter::FusedIterator;
use std::marker::PhantomData;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
use std::sync::Arc;

use crate::runtime::group::TaskGroup;
use crate::runtime::task::{AsyncTask, ChildFragment};

/// What a status record is for.
pub enum TaskStatusRecordKind {
    /// Child tasks the owning task must cancel along with itself.
    ChildTask(ChildList),
    /// A task group and the children spawned into it.
    TaskGroup {
        group: Arc<dyn TaskGroup>,
        children: ChildList,
    },
    /// Runs the handler once when the task is cancelled.
    CancellationNotification(Box<dyn Fn() + Send + Sync>),
    /// Opaque record the runtime does not interpret.
    Private,
}

impl fmt::Debug for TaskStatusRecordKind {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        match self {
            TaskStatusRecordKind::ChildTask(children) => {
                f.debug_tuple("ChildTask").field(&children.len()).finish()
            }
            TaskStatusRecordKind::TaskGroup { children, .. } => f
                .debug_struct("TaskGroup")
                .field("children", &children.len())
                .finish_non_exhaustive(),
            TaskStatusRecordKind::CancellationNotification(_) => {
                f.write_str("CancellationNotification")
            }
            TaskStatusRecordKind::Private => f.write_str("Private"),
        }
    }
}

/// A node in a task's status record chain.
///
/// Aligned so that the two low bits of its address are free for the status
/// word's flags.
#[repr(align(8))]
pub struct TaskStatusRecord {
    kind: TaskStatusRecordKind,
    parent: AtomicPtr<TaskStatusRecord>,
    linked: AtomicBool,
}

impl TaskStatusRecord {
    pub fn new(kind: TaskStatusRecordKind) -> Arc<Self> {
        Arc::new(Self {
            kind,
            parent: AtomicPtr::new(ptr::null_mut()),
            linked: AtomicBool::new(false),
        })
    }

    /// A child-task record listing `first`.
    pub(crate) fn child_task(first: &AsyncTask) -> Arc<Self> {
        let children = ChildList::new();
        children.attach(first);
        Self::new(TaskStatusRecordKind::ChildTask(children))
    }

    /// A task-group record with no children yet.
    pub fn task_group(group: Arc<dyn TaskGroup>) -> Arc<Self> {
        Self::new(TaskStatusRecordKind::TaskGroup {
            group,
            children: ChildList::new(),
        })
    }

    pub fn cancellation_notification<F>(handler: F) -> Arc<Self>
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self::new(TaskStatusRecordKind::CancellationNotification(Box::new(
            handler,
        )))
    }

    pub fn private() -> Arc<Self> {
        Self::new(TaskStatusRecordKind::Private)
    }

    #[inline]
    pub fn kind(&self) -> &TaskStatusRecordKind {
        &self.kind
    }

    /// The child list of a child-task or task-group record.
    pub fn children(&self) -> Option<&ChildList> {
        match &self.kind {
            TaskStatusRecordKind::ChildTask(children) => Some(children),
            TaskStatusRecordKind::TaskGroup { children, .. } => Some(children),
            _ => None,
        }
    }

    /// The next outer record. Only stable while the owning task's status
    /// lock is held.
    #[inline]
    pub fn parent_ptr(&self) -> Option<NonNull<TaskStatusRecord>> {
        NonNull::new(self.parent.load(Ordering::Acquire))
    }

    /// Whether the record is currently linked into a task.
    #[inline]
    pub fn is_linked(&self) -> bool {
        self.linked.load(Ordering::Acquire)
    }

    pub(crate) fn mark_linked(&self) {
        let was_linked = self.linked.swap(true, Ordering::AcqRel);
        assert!(!was_linked, "status record is already linked into a task");
    }

    /// Called under the owning task's status lock. Listed children can no
    /// longer find the record to unlink themselves, so the list is cleared.
    pub(crate) fn mark_unlinked(&self) {
        if let Some(children) = self.children() {
            children.clear();
        }
        self.linked.store(false, Ordering::Release);
    }

    /// Replace the parent link. The link owns the record it names.
    pub(crate) fn set_parent(
        &self,
        parent: Option<NonNull<TaskStatusRecord>>,
    ) {
        let parent = parent.map_or(ptr::null_mut(), NonNull::as_ptr);
        self.parent.store(parent, Ordering::Release);
    }

    /// Detach the parent link, handing its count to the caller.
    pub(crate) fn take_parent(&self) -> Option<NonNull<TaskStatusRecord>> {
        NonNull::new(self.parent.swap(ptr::null_mut(), Ordering::AcqRel))
    }
}

impl Drop for TaskStatusRecord {
    fn drop(&mut self) {
        let parent = *self.parent.get_mut();
        if !parent.is_null() {
            // Safety: the parent link owns one count.
            drop(unsafe { Arc::from_raw(parent) });
        }
    }
}

impl fmt::Debug for TaskStatusRecord {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("TaskStatusRecord")
            .field("kind", &self.kind)
            .field("linked", &self.is_linked())
            .finish()
    }
}

/// Iterator over a record chain, innermost first.
pub struct StatusRecordIter<'a> {
    next: Option<NonNull<TaskStatusRecord>>,
    _marker: PhantomData<&'a TaskStatusRecord>,
}

impl StatusRecordIter<'_> {
    pub(crate) fn new(innermost: Option<NonNull<TaskStatusRecord>>) -> Self {
        Self {
            next: innermost,
            _marker: PhantomData,
        }
    }
}

impl<'a> Iterator for StatusRecordIter<'a> {
    type Item = &'a TaskStatusRecord;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next?;
        // Safety: the iterator's creator guarantees the chain is stable.
        let record = unsafe { &*current.as_ptr() };
        self.next = record.parent_ptr();
        Some(record)
    }
}

impl FusedIterator for StatusRecordIter<'_> {}

/// Children of one task, linked through their child fragments.
///
/// The list does not own its children. Each child keeps its parent alive and
/// detaches itself under the parent's status lock before it is destroyed, so
/// a listed child is live for as long as that lock is held. Every mutation
/// and every walk happens under the lock.
pub struct ChildList {
    head: AtomicPtr<AsyncTask>,
}

fn link_of(task: &AsyncTask) -> &ChildFragment {
    match task.child_fragment() {
        Some(fragment) => fragment,
        None => panic!("listed task {:p} has no child fragment", task),
    }
}

impl ChildList {
    pub const fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Append `child`.
    ///
    /// # Panics
    ///
    /// Panics if `child` was not spawned as a child task.
    pub(crate) fn attach(
        &self,
        child: &AsyncTask,
    ) {
        assert!(
            link_of(child).next_child().is_none(),
            "child task {:p} is already listed",
            child
        );
        let child = NonNull::from(child);
        match self.iter().last() {
            None => self.head.store(child.as_ptr(), Ordering::Release),
            Some(last) => link_of(last).set_next_child(Some(child)),
        }
    }

    /// Unlink `child`. Returns whether it was listed.
    pub(crate) fn detach(
        &self,
        child: &AsyncTask,
    ) -> bool {
        let target = NonNull::from(child);
        let after = link_of(child).next_child();
        if NonNull::new(self.head.load(Ordering::Acquire)) == Some(target) {
            self.head
                .store(after.map_or(ptr::null_mut(), NonNull::as_ptr), Ordering::Release);
            link_of(child).set_next_child(None);
            return true;
        }
        match self.iter().find(|task| link_of(task).next_child() == Some(target)) {
            Some(previous) => {
                link_of(previous).set_next_child(after);
                link_of(child).set_next_child(None);
                true
            }
            None => false,
        }
    }

    /// Forget every child, clearing their sibling links.
    pub(crate) fn clear(&self) {
        let mut next = NonNull::new(self.head.swap(ptr::null_mut(), Ordering::AcqRel));
        while let Some(current) = next {
            // Safety: listed children are live while the owner's lock is held.
            let fragment = link_of(unsafe { current.as_ref() });
            next = fragment.next_child();
            fragment.set_next_child(None);
        }
    }

    pub fn iter(&self) -> ChildIter<'_> {
        ChildIter {
            next: NonNull::new(self.head.load(Ordering::Acquire)),
            _marker: PhantomData,
        }
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire).is_null()
    }
}

impl Default for ChildList {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ChildList {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_list().entries(self.iter().map(|t| t as *const AsyncTask)).finish()
    }
}

/// Iterator over a [`ChildList`].
pub struct ChildIter<'a> {
    next: Option<NonNull<AsyncTask>>,
    _marker: PhantomData<&'a AsyncTask>,
}

impl<'a> Iterator for ChildIter<'a> {
    type Item = &'a AsyncTask;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next?;
        // Safety: the list is only reachable through its owner's locked
        // record chain, and children detach under that lock.
        let task = unsafe { &*current.as_ptr() };
        self.next = link_of(task).next_child();
        Some(task)
    }
}

impl FusedIterator for ChildIter<'_> {}
