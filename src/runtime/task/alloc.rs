//! Task stack allocator
//!
//! Each task reserves four words for a slab-backed bump allocator used for
//! its context frames. Frames are strictly last-in first-out: a frame is
//! allocated when a logical call starts and freed when it returns, so the
//! allocator only ever moves its top pointer.
//!
//! ```text
//! slab: [ Slab | Allocation | frame | Allocation | frame | ...free... ]
//!                   ^ previous <------------- ^ last
//! ```

use std::alloc::{self, Layout, LayoutError};
use std::cmp;
use std::fmt;
use std::mem::{align_of, size_of};
use std::ptr::{self, NonNull};

use super::layout::align_up;

/// Errors returned by the task stack allocator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AllocError {
    /// Not enough memory to satisfy the allocation
    #[error("out of memory allocating a {size} byte slab")]
    OutOfMemory { size: usize },
    /// Size and alignment do not form a valid layout
    #[error("invalid allocation layout: {0}")]
    InvalidLayout(#[from] LayoutError),
}

const SLAB_ALIGN: usize = 16;
const SLAB_HEADER: usize = align_up(size_of::<Slab>(), SLAB_ALIGN);

#[repr(C)]
struct Slab {
    next: Option<NonNull<Slab>>,
    capacity: usize,
    used: usize,
}

#[repr(C)]
struct Allocation {
    previous: Option<NonNull<Allocation>>,
    slab: NonNull<Slab>,
    /// Slab fill level before this allocation.
    used_before: usize,
    data: NonNull<u8>,
    drop_fn: Option<unsafe fn(*mut u8)>,
}

unsafe fn drop_value<T>(data: *mut u8) {
    unsafe { ptr::drop_in_place(data.cast::<T>()) };
}

/// Slab-backed LIFO allocator owned by one task.
pub struct StackAllocator {
    first_slab: Option<NonNull<Slab>>,
    current_slab: Option<NonNull<Slab>>,
    last: Option<NonNull<Allocation>>,
    slab_size: usize,
}

const _: () = assert!(size_of::<StackAllocator>() == 4 * size_of::<usize>());

// Only the thread running the owning task touches the allocator.
unsafe impl Send for StackAllocator {}

impl StackAllocator {
    /// An allocator that requests `slab_size` bytes per slab. No memory is
    /// taken until the first allocation.
    pub const fn new(slab_size: usize) -> Self {
        Self {
            first_slab: None,
            current_slab: None,
            last: None,
            slab_size,
        }
    }

    #[inline]
    pub fn slab_size(&self) -> usize {
        self.slab_size
    }

    /// Allocate raw memory for `layout`.
    pub fn alloc(
        &mut self,
        layout: Layout,
    ) -> Result<NonNull<u8>, AllocError> {
        self.alloc_with_drop(layout, None)
    }

    /// Move `value` into the allocator. Its destructor runs when the
    /// allocation is freed or the allocator is dropped.
    pub fn alloc_value<T: Send>(
        &mut self,
        value: T,
    ) -> Result<NonNull<T>, AllocError> {
        let data = self
            .alloc_with_drop(Layout::new::<T>(), Some(drop_value::<T>))?
            .cast::<T>();
        // Safety: freshly allocated with T's layout.
        unsafe { data.as_ptr().write(value) };
        Ok(data)
    }

    fn alloc_with_drop(
        &mut self,
        layout: Layout,
        drop_fn: Option<unsafe fn(*mut u8)>,
    ) -> Result<NonNull<u8>, AllocError> {
        let placed = match self.current_slab {
            Some(slab) => unsafe { Self::try_place(slab, layout) }.map(|p| (slab, p)),
            None => None,
        };
        let placed = match placed {
            Some(placed) => placed,
            None => self.next_slab(layout)?,
        };
        let (slab, (header_offset, data_offset, end)) = placed;

        // Safety: try_place checked that both offsets lie inside the slab.
        unsafe {
            let base = slab.as_ptr().cast::<u8>().add(SLAB_HEADER);
            let data = NonNull::new_unchecked(base.add(data_offset));
            let header = base.add(header_offset).cast::<Allocation>();
            header.write(Allocation {
                previous: self.last,
                slab,
                used_before: (*slab.as_ptr()).used,
                data,
                drop_fn,
            });
            (*slab.as_ptr()).used = end;
            self.last = Some(NonNull::new_unchecked(header));
            self.current_slab = Some(slab);
            Ok(data)
        }
    }

    /// Find room for `layout` in `slab`, returning the header offset, data
    /// offset and new fill level.
    unsafe fn try_place(
        slab: NonNull<Slab>,
        layout: Layout,
    ) -> Option<(usize, usize, usize)> {
        let (capacity, used) = unsafe { ((*slab.as_ptr()).capacity, (*slab.as_ptr()).used) };
        let base = slab.as_ptr().cast::<u8>().wrapping_add(SLAB_HEADER);

        let mut offset = used;
        offset += base.wrapping_add(offset).align_offset(align_of::<Allocation>());
        let header_offset = offset;
        offset += size_of::<Allocation>();
        offset += base.wrapping_add(offset).align_offset(layout.align());
        let data_offset = offset;
        let end = data_offset.checked_add(layout.size())?;

        (end <= capacity).then_some((header_offset, data_offset, end))
    }

    /// Move to the slab after the current one, creating it if needed.
    fn next_slab(
        &mut self,
        layout: Layout,
    ) -> Result<(NonNull<Slab>, (usize, usize, usize)), AllocError> {
        if let Some(next) = self.current_slab.and_then(|s| unsafe { (*s.as_ptr()).next }) {
            if let Some(placed) = unsafe { Self::try_place(next, layout) } {
                return Ok((next, placed));
            }
        }

        let needed = size_of::<Allocation>() + align_of::<Allocation>() + layout.align() + layout.size();
        let slab = Self::new_slab(cmp::max(self.slab_size, needed))?;
        match self.current_slab {
            Some(current) => unsafe {
                (*slab.as_ptr()).next = (*current.as_ptr()).next;
                (*current.as_ptr()).next = Some(slab);
            },
            None => self.first_slab = Some(slab),
        }
        match unsafe { Self::try_place(slab, layout) } {
            Some(placed) => Ok((slab, placed)),
            None => Err(AllocError::OutOfMemory { size: needed }),
        }
    }

    fn slab_layout(capacity: usize) -> Result<Layout, AllocError> {
        let size = SLAB_HEADER
            .checked_add(capacity)
            .ok_or(AllocError::OutOfMemory { size: capacity })?;
        Ok(Layout::from_size_align(size, SLAB_ALIGN)?)
    }

    fn new_slab(capacity: usize) -> Result<NonNull<Slab>, AllocError> {
        let layout = Self::slab_layout(capacity)?;
        // Safety: the layout has a non-zero size.
        let raw = unsafe { alloc::alloc(layout) }.cast::<Slab>();
        let slab = NonNull::new(raw).ok_or(AllocError::OutOfMemory {
            size: layout.size(),
        })?;
        unsafe {
            slab.as_ptr().write(Slab {
                next: None,
                capacity,
                used: 0,
            })
        };
        Ok(slab)
    }

    /// Free the most recent allocation, running its destructor if it was
    /// made with [`alloc_value`](Self::alloc_value).
    ///
    /// # Panics
    ///
    /// Panics if `data` is not the most recent live allocation.
    pub fn dealloc(
        &mut self,
        data: NonNull<u8>,
    ) {
        let Some(last) = self.last else {
            panic!("task allocator has no live allocation to free");
        };
        // Safety: `last` is a live header written by alloc_with_drop.
        let header = unsafe { last.as_ptr().read() };
        assert!(
            header.data == data,
            "task allocator frees must be last-in first-out"
        );

        self.last = header.previous;
        unsafe { (*header.slab.as_ptr()).used = header.used_before };
        self.current_slab = Some(header.slab);

        if let Some(drop_fn) = header.drop_fn {
            unsafe { drop_fn(header.data.as_ptr()) };
        }
    }

    /// The oldest live allocation: a task's initial frame.
    pub fn outermost(&self) -> Option<NonNull<u8>> {
        let mut cursor = self.last?;
        // Safety: every header in the chain is live.
        while let Some(previous) = unsafe { cursor.as_ref().previous } {
            cursor = previous;
        }
        Some(unsafe { cursor.as_ref().data })
    }

    /// Number of live allocations.
    pub fn live_allocations(&self) -> usize {
        let mut count = 0;
        let mut cursor = self.last;
        while let Some(header) = cursor {
            count += 1;
            cursor = unsafe { header.as_ref().previous };
        }
        count
    }

    /// Whether any slab has been taken from the global allocator.
    pub fn has_slabs(&self) -> bool {
        self.first_slab.is_some()
    }
}

impl Drop for StackAllocator {
    fn drop(&mut self) {
        while let Some(last) = self.last {
            let header = unsafe { last.as_ptr().read() };
            self.last = header.previous;
            if let Some(drop_fn) = header.drop_fn {
                unsafe { drop_fn(header.data.as_ptr()) };
            }
        }

        let mut slab = self.first_slab.take();
        while let Some(current) = slab {
            let (next, capacity) = unsafe { ((*current.as_ptr()).next, (*current.as_ptr()).capacity) };
            if let Ok(layout) = Self::slab_layout(capacity) {
                unsafe { alloc::dealloc(current.as_ptr().cast(), layout) };
            }
            slab = next;
        }
    }
}

impl fmt::Debug for StackAllocator {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("StackAllocator")
            .field("slab_size", &self.slab_size)
            .field("live_allocations", &self.live_allocations())
            .finish()
    }
}
