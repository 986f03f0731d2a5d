//! Active task status: cancellation flag, record-list lock and the innermost
//! status record, all in one atomic word.
//!
//! ```text
//!  bit 0      cancelled
//!  bit 1      record list locked
//!  bits 2..   pointer to the innermost TaskStatusRecord (or null)
//! ```
//!
//! Both flags and the pointer are protected together: every update is a CAS
//! over the whole word. Setting the cancelled bit never takes the lock;
//! changing the record pointer always does.

pub mod record;

pub use record::{ChildIter, ChildList, StatusRecordIter, TaskStatusRecord, TaskStatusRecordKind};

use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam::utils::Backoff;
use smallvec::SmallVec;

use crate::util::bit::Pack;

const CANCELLED: Pack = Pack::least_significant(1);
const LOCKED: Pack = CANCELLED.then(1);
const RECORD_MASK: usize = !(CANCELLED.mask() | LOCKED.mask());

/// Snapshot of a task's status word.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ActiveTaskStatus(usize);

impl ActiveTaskStatus {
    pub fn new(
        cancelled: bool,
        locked: bool,
        innermost: Option<NonNull<TaskStatusRecord>>,
    ) -> Self {
        let record = innermost.map_or(0, |r| r.as_ptr() as usize);
        debug_assert_eq!(record & !RECORD_MASK, 0, "misaligned status record");
        let bits = CANCELLED.set(record, cancelled);
        Self(LOCKED.set(bits, locked))
    }

    #[inline]
    pub fn bits(&self) -> usize {
        self.0
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        CANCELLED.is_set(self.0)
    }

    #[inline]
    pub fn is_locked(&self) -> bool {
        LOCKED.is_set(self.0)
    }

    #[inline]
    pub fn innermost_record(&self) -> Option<NonNull<TaskStatusRecord>> {
        NonNull::new((self.0 & RECORD_MASK) as *mut TaskStatusRecord)
    }

    #[inline]
    pub fn with_cancelled(self) -> Self {
        Self(CANCELLED.set(self.0, true))
    }

    #[inline]
    pub fn with_locked(
        self,
        locked: bool,
    ) -> Self {
        Self(LOCKED.set(self.0, locked))
    }

    #[inline]
    pub fn with_innermost_record(
        self,
        record: Option<NonNull<TaskStatusRecord>>,
    ) -> Self {
        Self::new(self.is_cancelled(), self.is_locked(), record)
    }

    /// Walk the record chain from innermost to outermost.
    ///
    /// # Safety
    ///
    /// The chain must not be mutated while the iterator is alive, which in
    /// practice means holding the status lock.
    pub unsafe fn records<'a>(&self) -> StatusRecordIter<'a> {
        StatusRecordIter::new(self.innermost_record())
    }
}

impl Default for ActiveTaskStatus {
    fn default() -> Self {
        Self::new(false, false, None)
    }
}

impl fmt::Debug for ActiveTaskStatus {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("ActiveTaskStatus")
            .field("cancelled", &self.is_cancelled())
            .field("locked", &self.is_locked())
            .field("innermost", &self.innermost_record())
            .finish()
    }
}

/// The atomic cell holding an [`ActiveTaskStatus`].
///
/// While linked, the chain owns one `Arc` count on every record: the word
/// owns the innermost, each record's parent link owns the next.
#[repr(transparent)]
pub struct AtomicTaskStatus(AtomicUsize);

impl AtomicTaskStatus {
    pub const fn new() -> Self {
        Self(AtomicUsize::new(0))
    }

    #[inline]
    pub fn load(
        &self,
        order: Ordering,
    ) -> ActiveTaskStatus {
        ActiveTaskStatus(self.0.load(order))
    }

    #[inline]
    fn compare_exchange_weak(
        &self,
        current: ActiveTaskStatus,
        new: ActiveTaskStatus,
        success: Ordering,
        failure: Ordering,
    ) -> Result<ActiveTaskStatus, ActiveTaskStatus> {
        self.0
            .compare_exchange_weak(current.0, new.0, success, failure)
            .map(ActiveTaskStatus)
            .map_err(ActiveTaskStatus)
    }

    /// Set the cancelled bit.
    ///
    /// Returns `true` only for the call that flipped the bit, so one logical
    /// cancellation has exactly one caller responsible for its side effects.
    pub fn set_cancelled(&self) -> bool {
        let mut current = self.load(Ordering::Relaxed);
        loop {
            if current.is_cancelled() {
                return false;
            }
            match self.compare_exchange_weak(
                current,
                current.with_cancelled(),
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Take the record-list lock, spinning while somebody else holds it.
    pub fn lock(&self) -> StatusLockGuard<'_> {
        let backoff = Backoff::new();
        let mut current = self.load(Ordering::Relaxed);
        loop {
            if current.is_locked() {
                backoff.snooze();
                current = self.load(Ordering::Relaxed);
                continue;
            }
            match self.compare_exchange_weak(
                current,
                current.with_locked(true),
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return StatusLockGuard { status: self },
                Err(actual) => current = actual,
            }
        }
    }

    /// Swap the innermost record while holding the lock, keeping whatever
    /// cancelled bit a concurrent cancel may have set.
    fn replace_innermost(
        &self,
        record: Option<NonNull<TaskStatusRecord>>,
    ) {
        let mut current = self.load(Ordering::Relaxed);
        loop {
            debug_assert!(current.is_locked(), "status record list changed without the lock");
            match self.compare_exchange_weak(
                current,
                current.with_innermost_record(record),
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    fn unlock(&self) {
        let mut current = self.load(Ordering::Relaxed);
        loop {
            match self.compare_exchange_weak(
                current,
                current.with_locked(false),
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }
}

impl Default for AtomicTaskStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for AtomicTaskStatus {
    fn drop(&mut self) {
        let status = ActiveTaskStatus(*self.0.get_mut());
        if let Some(innermost) = status.innermost_record() {
            // Safety: the word owns one count on the innermost record.
            drop(unsafe { Arc::from_raw(innermost.as_ptr()) });
        }
    }
}

impl fmt::Debug for AtomicTaskStatus {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        self.load(Ordering::Relaxed).fmt(f)
    }
}

/// Holds the record-list lock of one task. Unlocks on drop.
pub struct StatusLockGuard<'a> {
    status: &'a AtomicTaskStatus,
}

impl<'a> StatusLockGuard<'a> {
    /// Current status, including any cancellation that raced with the lock.
    #[inline]
    pub fn status(&self) -> ActiveTaskStatus {
        self.status.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.status().is_cancelled()
    }

    /// The innermost record, if any.
    pub fn innermost(&self) -> Option<&TaskStatusRecord> {
        // Safety: linked records stay alive while the lock is held.
        self.status()
            .innermost_record()
            .map(|r| unsafe { &*r.as_ptr() })
    }

    /// Records from innermost to outermost.
    pub fn records(&self) -> StatusRecordIter<'_> {
        // Safety: the chain cannot change while the lock is held.
        unsafe { self.status().records() }
    }

    /// Link `record` as the new innermost record.
    pub fn push(
        &mut self,
        record: Arc<TaskStatusRecord>,
    ) {
        record.mark_linked();
        let previous = self.status().innermost_record();
        record.set_parent(previous);
        // Safety: Arc::into_raw never returns null.
        let raw = unsafe { NonNull::new_unchecked(Arc::into_raw(record).cast_mut()) };
        self.status.replace_innermost(Some(raw));
    }

    /// Unlink `record`, which must be the innermost record.
    ///
    /// # Panics
    ///
    /// Panics if `record` is not the innermost record: the list discipline
    /// was violated.
    pub fn pop(
        &mut self,
        record: &Arc<TaskStatusRecord>,
    ) -> Arc<TaskStatusRecord> {
        let innermost = self.status().innermost_record();
        let expected = NonNull::from(&**record);
        assert!(
            innermost == Some(expected),
            "status record {:p} is not the innermost record",
            expected
        );
        let parent = record.take_parent();
        self.status.replace_innermost(parent);
        record.mark_unlinked();
        // Safety: the word owned one count on the innermost record.
        unsafe { Arc::from_raw(expected.as_ptr()) }
    }

    /// Unlink `record` wherever it sits in the chain.
    ///
    /// Returns the chain's reference, or `None` when the record is not linked
    /// into this task.
    pub fn remove(
        &mut self,
        record: &TaskStatusRecord,
    ) -> Option<Arc<TaskStatusRecord>> {
        let target = NonNull::from(record);
        let innermost = self.status().innermost_record()?;
        if innermost == target {
            let parent = record.take_parent();
            self.status.replace_innermost(parent);
            record.mark_unlinked();
            // Safety: the word owned one count on the innermost record.
            return Some(unsafe { Arc::from_raw(target.as_ptr()) });
        }

        let mut child = self.records().next()?;
        for candidate in self.records().skip(1) {
            if NonNull::from(candidate) == target {
                child.set_parent(record.take_parent());
                record.mark_unlinked();
                // Safety: the child's parent link owned one count on target.
                return Some(unsafe { Arc::from_raw(target.as_ptr()) });
            }
            child = candidate;
        }
        None
    }

    /// Unlink every record, returning them innermost first.
    pub fn take_all(&mut self) -> SmallVec<[Arc<TaskStatusRecord>; 4]> {
        let mut taken = SmallVec::new();
        let mut next = self.status().innermost_record();
        self.status.replace_innermost(None);
        while let Some(raw) = next {
            // Safety: each link owned one count on the record it names.
            let record = unsafe { Arc::from_raw(raw.as_ptr()) };
            next = record.take_parent();
            record.mark_unlinked();
            taken.push(record);
        }
        taken
    }
}

impl Drop for StatusLockGuard<'_> {
    fn drop(&mut self) {
        self.status.unlock();
    }
}

impl fmt::Debug for StatusLockGuard<'_> {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("StatusLockGuard")
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests;
