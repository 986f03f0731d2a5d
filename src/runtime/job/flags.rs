//! Job flags word.
//!
//! Packed 32-bit layout:
//!
//! ```text
//!  bits 0..8    job kind
//!  bits 8..16   priority
//!  bits 16..24  reserved
//!  bit  24      task is a child task          (ChildFragment present)
//!  bit  25      task is a future              (FutureFragment present)
//!  bit  26      task is a task-group child    (GroupChildFragment present)
//! ```

use std::fmt;

use crate::util::bit::Pack;

const KIND: Pack = Pack::least_significant(8);
const PRIORITY: Pack = KIND.then(8);
const RESERVED: Pack = PRIORITY.then(8);
const IS_CHILD_TASK: Pack = RESERVED.then(1);
const IS_FUTURE: Pack = IS_CHILD_TASK.then(1);
const IS_GROUP_CHILD_TASK: Pack = IS_FUTURE.then(1);

/// Kind of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum JobKind {
    /// The job is an `AsyncTask`; its function is a task resume function.
    Task = 0,
    /// A plain job with an invoke function.
    Simple = 1,
    /// A plain job created by [`JobRef::from_closure`](super::JobRef::from_closure).
    Closure = 2,
}

impl JobKind {
    /// Convert from the packed representation. Unknown kinds are plain jobs.
    #[inline]
    pub fn from_u8(val: u8) -> Self {
        match val {
            0 => JobKind::Task,
            2 => JobKind::Closure,
            _ => JobKind::Simple,
        }
    }

    /// Convert to the packed representation.
    #[inline]
    pub fn as_u8(&self) -> u8 {
        *self as u8
    }
}

/// Job priority levels.
///
/// Ordered from least to most urgent; the numeric values are the packed
/// representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Ord, PartialOrd, Hash, Default)]
#[repr(u8)]
pub enum JobPriority {
    /// No priority was requested.
    Unspecified = 0x00,
    /// Work the user is not waiting on.
    Background = 0x09,
    /// Long-running work with visible progress.
    Utility = 0x11,
    /// Normal priority (default).
    #[default]
    Default = 0x15,
    /// Work the user started and is waiting for.
    UserInitiated = 0x19,
    /// Work that must finish immediately.
    UserInteractive = 0x21,
}

impl JobPriority {
    /// Convert from u8. Unknown values map to `Unspecified`.
    #[inline]
    pub fn from_u8(val: u8) -> Self {
        match val {
            0x09 => JobPriority::Background,
            0x11 => JobPriority::Utility,
            0x15 => JobPriority::Default,
            0x19 => JobPriority::UserInitiated,
            0x21 => JobPriority::UserInteractive,
            _ => JobPriority::Unspecified,
        }
    }

    /// Convert to u8.
    #[inline]
    pub fn as_u8(&self) -> u8 {
        *self as u8
    }
}

/// Flags stored in every [`Job`](super::Job).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct JobFlags(u32);

impl JobFlags {
    /// Flags for a job of `kind` at `priority`, with no task fragments.
    pub fn new(
        kind: JobKind,
        priority: JobPriority,
    ) -> Self {
        let bits = KIND.pack(kind.as_u8() as usize, 0);
        let bits = PRIORITY.pack(priority.as_u8() as usize, bits);
        Self(bits as u32)
    }

    /// Flags for an async task at `priority`.
    pub fn task(priority: JobPriority) -> Self {
        Self::new(JobKind::Task, priority)
    }

    /// Raw packed bits.
    #[inline]
    pub fn bits(&self) -> u32 {
        self.0
    }

    /// Rebuild flags from raw packed bits.
    #[inline]
    pub fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    #[inline]
    pub fn kind(&self) -> JobKind {
        JobKind::from_u8(KIND.unpack(self.0 as usize) as u8)
    }

    #[inline]
    pub fn priority(&self) -> JobPriority {
        JobPriority::from_u8(PRIORITY.unpack(self.0 as usize) as u8)
    }

    /// Whether the job's function is a task resume function.
    #[inline]
    pub fn is_async_task(&self) -> bool {
        self.kind() == JobKind::Task
    }

    #[inline]
    pub fn task_is_child_task(&self) -> bool {
        IS_CHILD_TASK.is_set(self.0 as usize)
    }

    #[inline]
    pub fn task_is_future(&self) -> bool {
        IS_FUTURE.is_set(self.0 as usize)
    }

    #[inline]
    pub fn task_is_group_child_task(&self) -> bool {
        IS_GROUP_CHILD_TASK.is_set(self.0 as usize)
    }

    pub fn with_child_task(
        self,
        on: bool,
    ) -> Self {
        Self(IS_CHILD_TASK.set(self.0 as usize, on) as u32)
    }

    pub fn with_future(
        self,
        on: bool,
    ) -> Self {
        Self(IS_FUTURE.set(self.0 as usize, on) as u32)
    }

    pub fn with_group_child_task(
        self,
        on: bool,
    ) -> Self {
        Self(IS_GROUP_CHILD_TASK.set(self.0 as usize, on) as u32)
    }
}

impl Default for JobFlags {
    fn default() -> Self {
        Self::new(JobKind::Simple, JobPriority::Default)
    }
}

impl fmt::Debug for JobFlags {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("JobFlags")
            .field("kind", &self.kind())
            .field("priority", &self.priority())
            .field("child", &self.task_is_child_task())
            .field("future", &self.task_is_future())
            .field("group_child", &self.task_is_group_child_task())
            .finish()
    }
}
