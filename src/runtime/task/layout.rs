//! Placement of the optional trailing fragments after the task header.
//!
//! Fragments always appear in the same order, each only when its flag is
//! set:
//!
//! ```text
//! +-----------+---------------+--------------------+----------------+---------+
//! | AsyncTask | ChildFragment | GroupChildFragment | FutureFragment | result  |
//! +-----------+---------------+--------------------+----------------+---------+
//! ```
//!
//! Fragment headers are word aligned, so a fragment's offset is the header
//! size plus the sizes of the present fragments before it. The result
//! storage is rounded up to the result type's alignment, measured from the
//! start of the allocation, and the allocation itself is aligned to the
//! larger of the task header's and the result's alignment.

use std::alloc::Layout;
use std::cmp;
use std::mem::{align_of, size_of};

use serde::Serialize;

use super::builder::SpawnError;
use super::fragment::{ChildFragment, GroupChildFragment};
use super::future::FutureFragment;
use super::AsyncTask;
use crate::runtime::job::JobFlags;

const _: () = assert!(align_of::<ChildFragment>() <= align_of::<AsyncTask>());
const _: () = assert!(align_of::<GroupChildFragment>() <= align_of::<AsyncTask>());
const _: () = assert!(align_of::<FutureFragment>() <= align_of::<AsyncTask>());

/// Offsets of the fragment headers present for a set of flags.
///
/// These never depend on the result type, so a task can find its own
/// fragments from its flags alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct FragmentOffsets {
    pub child: Option<usize>,
    pub group_child: Option<usize>,
    pub future: Option<usize>,
    /// First byte after the last fragment header.
    pub end: usize,
}

impl FragmentOffsets {
    pub fn for_flags(flags: JobFlags) -> Self {
        let mut end = size_of::<AsyncTask>();
        let child = place(
            flags.task_is_child_task(),
            &mut end,
            size_of::<ChildFragment>(),
            align_of::<ChildFragment>(),
        );
        let group_child = place(
            flags.task_is_group_child_task(),
            &mut end,
            size_of::<GroupChildFragment>(),
            align_of::<GroupChildFragment>(),
        );
        let future = place(
            flags.task_is_future(),
            &mut end,
            size_of::<FutureFragment>(),
            align_of::<FutureFragment>(),
        );
        Self {
            child,
            group_child,
            future,
            end,
        }
    }
}

fn place(
    present: bool,
    end: &mut usize,
    size: usize,
    align: usize,
) -> Option<usize> {
    if !present {
        return None;
    }
    let at = align_up(*end, align);
    *end = at + size;
    Some(at)
}

#[inline]
pub(crate) const fn align_up(
    offset: usize,
    align: usize,
) -> usize {
    (offset + align - 1) & !(align - 1)
}

/// Complete layout of one task allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FragmentLayout {
    offsets: FragmentOffsets,
    storage: Option<usize>,
    size: usize,
    align: usize,
}

impl FragmentLayout {
    /// Lay out a task with `flags`. `result` is only used when the future
    /// flag is set.
    pub fn compute(
        flags: JobFlags,
        result: Layout,
    ) -> Result<Self, SpawnError> {
        let offsets = FragmentOffsets::for_flags(flags);
        let (storage, end, align) = match offsets.future {
            Some(_) => {
                let at = offsets
                    .end
                    .checked_add(result.align() - 1)
                    .ok_or(SpawnError::LayoutOverflow)?
                    & !(result.align() - 1);
                let end = at
                    .checked_add(result.size())
                    .ok_or(SpawnError::LayoutOverflow)?;
                (Some(at), end, cmp::max(align_of::<AsyncTask>(), result.align()))
            }
            None => (None, offsets.end, align_of::<AsyncTask>()),
        };
        let layout = Layout::from_size_align(end, align)?.pad_to_align();

        Ok(Self {
            offsets,
            storage,
            size: layout.size(),
            align: layout.align(),
        })
    }

    #[inline]
    pub fn offsets(&self) -> FragmentOffsets {
        self.offsets
    }

    #[inline]
    pub fn child_offset(&self) -> Option<usize> {
        self.offsets.child
    }

    #[inline]
    pub fn group_child_offset(&self) -> Option<usize> {
        self.offsets.group_child
    }

    #[inline]
    pub fn future_offset(&self) -> Option<usize> {
        self.offsets.future
    }

    /// Offset of the result value inside the allocation.
    #[inline]
    pub fn storage_offset(&self) -> Option<usize> {
        self.storage
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn align(&self) -> usize {
        self.align
    }

    /// The allocation layout.
    pub fn layout(&self) -> Layout {
        // Safety: size and align were validated by Layout::from_size_align in
        // compute.
        unsafe { Layout::from_size_align_unchecked(self.size, self.align) }
    }
}
