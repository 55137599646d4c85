//! A multithreaded, fail-fast memory allocator.

use crate::allocators::RawHeap;
use crate::fault::{fail_fast, HeapFault};
use crate::region::Region;
use crate::util::raw_ptr;

use core::alloc::{GlobalAlloc, Layout};
use core::ptr::{copy_nonoverlapping, NonNull};
use std::fmt::Debug;
use std::io;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// A multithreaded memory allocator.
///
/// This allocator is a `Mutex` wrapper over [`RawHeap`]. Every operation runs
/// as one critical section, and any [`HeapFault`] reported by the heap ends
/// the process through [`fail_fast`] after the lock has been let go.
#[repr(C)]
pub struct SentinelMalloc<R: Region> {
    inner: Mutex<RawHeap<R>>,
}

impl<R: Region> SentinelMalloc<R> {
    /// # Safety
    /// Callers must make sure that the provided region will be the only object
    /// managing it's underlying buffer for the lifetime of the returned allocator.
    pub const unsafe fn with_region(region: R) -> Self {
        SentinelMalloc {
            inner: Mutex::new(RawHeap::with_region(region)),
        }
    }

    // The heap is re-verified on every call, a panic that poisoned the lock
    // can't hide a broken chain from the next caller.
    fn lock(&self) -> MutexGuard<'_, RawHeap<R>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns a pointer to at least `size` usable bytes,
    /// or `None` if the heap could not grow.
    pub fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
        let result = self.lock().allocate(size);
        result.unwrap_or_else(|fault| fail_fast(fault))
    }

    /// Returns an `align`-aligned pointer to at least `size` usable bytes,
    /// or `None` if the heap could not grow.
    ///
    /// # Panics
    /// Panics if `align` is not a power-of-two.
    pub fn allocate_aligned(&self, size: usize, align: usize) -> Option<NonNull<u8>> {
        let result = self.lock().allocate_aligned(size, align);
        result.unwrap_or_else(|fault| fail_fast(fault))
    }

    /// Releases a pointer previously returned by [`allocate`](Self::allocate)
    /// or [`allocate_aligned`](Self::allocate_aligned).
    /// Releasing null does nothing; releasing anything else that isn't a live
    /// allocation terminates the process.
    ///
    /// # Safety
    /// Callers must not access the released memory afterwards.
    pub unsafe fn release(&self, ptr: *mut u8) {
        let result = self.lock().release(ptr);
        if let Err(fault) = result {
            fail_fast(fault)
        }
    }

    /// Prints the heap boundaries and every chunk header to standard error.
    pub fn print_statistics(&self, title: Option<&str>) {
        let heap = self.lock();
        // Diagnostics only, a failed write to stderr is not worth reporting.
        let _ = heap.dump(&mut io::stderr().lock(), title);
    }

    /// Runs `f` with the heap locked. Mostly useful for inspecting it.
    pub fn with_heap<T>(&self, f: impl FnOnce(&RawHeap<R>) -> T) -> T {
        f(&self.lock())
    }

    unsafe fn usable_size(&self, ptr: *mut u8) -> usize {
        let result = self.lock().usable_size(ptr);
        result.unwrap_or_else(|fault: HeapFault| fail_fast(fault))
    }
}

impl<R: Region> Debug for SentinelMalloc<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SentinelMalloc")
            .field("inner", &self.inner)
            .finish()
    }
}

unsafe impl<R: Region> Sync for SentinelMalloc<R> {}

//---------------impl GlobalAlloc for SentinelMalloc---------------//

unsafe impl<R: Region> GlobalAlloc for SentinelMalloc<R> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        raw_ptr(self.allocate_aligned(layout.size(), layout.align()))
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        self.release(ptr)
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if new_size <= self.usable_size(ptr) {
            return ptr;
        }

        let new_layout = Layout::from_size_align_unchecked(new_size, layout.align());
        let new_ptr = self.alloc(new_layout);
        if !new_ptr.is_null() {
            copy_nonoverlapping(ptr, new_ptr, layout.size());
            self.release(ptr);
        }
        new_ptr
    }
}
