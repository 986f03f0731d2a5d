//! Reference-counted heap object header
//!
//! Every task begins with a `HeapObject`: a pointer to static metadata that
//! knows how to destroy the object, and an atomic liveness count. Handles
//! (`TaskRef`, task-owning `JobRef`s, wait-queue links, child links) each own
//! one count.

use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{fence, AtomicUsize, Ordering};

/// Static description of a heap object kind.
pub struct HeapMetadata {
    /// Human readable kind, used in logs.
    pub name: &'static str,
    /// Tear down and free the object once its count has reached zero.
    pub destroy: unsafe fn(NonNull<HeapObject>),
}

impl fmt::Debug for HeapMetadata {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("HeapMetadata")
            .field("name", &self.name)
            .finish()
    }
}

/// Counts above this are treated as a leak-induced overflow.
const MAX_REF_COUNT: usize = isize::MAX as usize;

/// Header shared by every reference-counted runtime object.
#[repr(C)]
pub struct HeapObject {
    metadata: &'static HeapMetadata,
    ref_count: AtomicUsize,
}

impl HeapObject {
    /// A header holding a single reference.
    pub const fn new(metadata: &'static HeapMetadata) -> Self {
        Self {
            metadata,
            ref_count: AtomicUsize::new(1),
        }
    }

    /// The object's metadata.
    #[inline]
    pub fn metadata(&self) -> &'static HeapMetadata {
        self.metadata
    }

    /// Current count. Only meaningful as a snapshot.
    #[inline]
    pub fn ref_count(&self) -> usize {
        self.ref_count.load(Ordering::Acquire)
    }

    /// Add a reference.
    #[inline]
    pub fn retain(&self) {
        let prev = self.ref_count.fetch_add(1, Ordering::Relaxed);
        if prev > MAX_REF_COUNT {
            std::process::abort();
        }
    }

    /// Drop a reference, returning `true` when it was the last one.
    ///
    /// The caller that receives `true` must run the metadata's destroy
    /// function; see [`HeapObject::release_and_destroy`].
    #[inline]
    pub fn release(&self) -> bool {
        if self.ref_count.fetch_sub(1, Ordering::Release) != 1 {
            return false;
        }
        fence(Ordering::Acquire);
        true
    }

    /// Drop a reference and destroy the object if it was the last one.
    ///
    /// # Safety
    ///
    /// `object` must point to a live heap object and the caller must own the
    /// reference being released.
    pub unsafe fn release_and_destroy(object: NonNull<HeapObject>) {
        let header = unsafe { object.as_ref() };
        if header.release() {
            let destroy = header.metadata.destroy;
            unsafe { destroy(object) };
        }
    }
}

impl fmt::Debug for HeapObject {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("HeapObject")
            .field("kind", &self.metadata.name)
            .field("ref_count", &self.ref_count())
            .finish()
    }
}
