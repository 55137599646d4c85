//! [`Region`] trait and structures that implement it.
//!
//! A region is the contiguous, movable-end buffer the heap lives in.
//! [`BrkRegion`] drives the real program break, [`ArenaRegion`] simulates one
//! over a caller-provided buffer so the heap can be exercised without touching
//! the process break.

use crate::header::{CHUNK_ALIGN, HEADER_SIZE};
use crate::util::{checked_add, find_aligned};

use core::fmt;
use core::ptr::NonNull;

use libc::{brk, c_void, sbrk};
use tracing::debug;

/// Why a region could not move its end.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RegionError {
    /// There is no more memory to extend into.
    Exhausted,
    /// Asked to give back more than was ever handed out.
    Underflow,
    /// The end of the region is not where the region left it.
    ForeignBreak { expected: usize, found: usize },
}

impl fmt::Display for RegionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            RegionError::Exhausted => f.write_str("region exhausted"),
            RegionError::Underflow => f.write_str("retraction below the region base"),
            RegionError::ForeignBreak { expected, found } => {
                write!(f, "break moved from {expected:#x} to {found:#x}")
            }
        }
    }
}

/// A trait for types that act as a contiguous buffer whose end can move
/// in both directions.
///
/// # Safety
/// * `extend` must hand out memory that starts exactly at the previous end,
///   is readable and writable, and is [`CHUNK_ALIGN`]-aligned.
/// * `page_size` must be a nonzero multiple of [`CHUNK_ALIGN`] larger than
///   [`HEADER_SIZE`] and must not change over the lifetime of the region.
/// * copying, cloning, or moving the region must not invalidate any pointers
///   into the buffer it manages.
pub unsafe trait Region {
    /// The growth quantum of the heap.
    fn page_size(&self) -> usize;

    /// The current end of the region,
    /// or `None` if the region has not been touched yet.
    fn brk(&self) -> Option<NonNull<u8>>;

    /// Moves the end of the region forward by exactly `size` bytes.
    /// Returns the old end, which is where the new memory starts.
    ///
    /// # Safety
    /// Callers must be the only ones managing the memory of the region.
    unsafe fn extend(&mut self, size: usize) -> Result<NonNull<u8>, RegionError>;

    /// Moves the end of the region back by exactly `size` bytes.
    ///
    /// # Safety
    /// Callers must not access the retracted memory afterwards.
    unsafe fn retract(&mut self, size: usize) -> Result<(), RegionError>;
}

/// Returns the page size reported by the operating system.
pub fn system_page_size() -> usize {
    match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
        size if size > 0 => size as usize,
        _ => 4096,
    }
}

/// A region that internally uses [`libc::brk`] to operate
/// on the end of the process's data segment.
#[derive(Debug)]
pub struct BrkRegion {
    brk: Option<NonNull<u8>>,
    page_size: usize,
}

impl BrkRegion {
    /// Creates a region that grows in system pages.
    #[inline(always)]
    pub const fn new() -> Self {
        BrkRegion {
            brk: None,
            page_size: 0,
        }
    }

    /// Creates a region that grows in multiples of `page_size` bytes.
    #[inline(always)]
    pub const fn with_page_size(page_size: usize) -> Self {
        BrkRegion {
            brk: None,
            page_size,
        }
    }

    /// Takes ownership of the program break: reads it, aligns it to
    /// [`CHUNK_ALIGN`], and keeps the C allocator from growing through it.
    ///
    /// # Safety
    /// This function is unsafe since it assumes that the region
    /// wasn't previously initialized.
    unsafe fn try_init(&mut self) -> Result<NonNull<u8>, RegionError> {
        debug_assert!(self.brk.is_none());
        keep_libc_off_the_break();

        let current = unsafe { sbrk(0) };
        if current as isize == -1 {
            return Err(RegionError::Exhausted);
        }
        let aligned = find_aligned(current.cast::<u8>(), CHUNK_ALIGN).ok_or(RegionError::Exhausted)?;
        if aligned != current as *const u8 && unsafe { brk(aligned as *mut c_void) } == -1 {
            return Err(RegionError::Exhausted);
        }
        let aligned = NonNull::new(aligned as *mut u8).ok_or(RegionError::Exhausted)?;
        debug!(brk = ?aligned, "Claimed the program break.");
        self.brk = Some(aligned);
        Ok(aligned)
    }

    /// Returns the tracked break after making sure nobody else moved it.
    unsafe fn current(&mut self) -> Result<NonNull<u8>, RegionError> {
        let expected = match self.brk {
            Some(brk) => brk,
            None => return unsafe { self.try_init() },
        };
        let found = unsafe { sbrk(0) } as usize;
        if found != expected.as_ptr() as usize {
            return Err(RegionError::ForeignBreak {
                expected: expected.as_ptr() as usize,
                found,
            });
        }
        Ok(expected)
    }

    unsafe fn set(&mut self, new_brk: *mut u8) -> Result<(), RegionError> {
        if unsafe { brk(new_brk.cast()) } == -1 {
            return Err(RegionError::Exhausted);
        }
        self.brk = NonNull::new(new_brk);
        Ok(())
    }
}

impl Default for BrkRegion {
    fn default() -> Self {
        BrkRegion::new()
    }
}

unsafe impl Region for BrkRegion {
    fn page_size(&self) -> usize {
        match self.page_size {
            0 => system_page_size(),
            size => size,
        }
    }

    fn brk(&self) -> Option<NonNull<u8>> {
        self.brk
    }

    unsafe fn extend(&mut self, size: usize) -> Result<NonNull<u8>, RegionError> {
        let old_brk = unsafe { self.current()? };
        if size == 0 {
            return Ok(old_brk);
        }
        // brk(2) takes a pointer but sbrk(2) an isize, keep both happy.
        if size > isize::MAX as usize {
            return Err(RegionError::Exhausted);
        }
        let new_brk = checked_add(old_brk.as_ptr(), size).ok_or(RegionError::Exhausted)?;
        unsafe { self.set(new_brk as *mut u8)? };
        Ok(old_brk)
    }

    unsafe fn retract(&mut self, size: usize) -> Result<(), RegionError> {
        let old_brk = unsafe { self.current()? };
        let new_brk = (old_brk.as_ptr() as usize)
            .checked_sub(size)
            .ok_or(RegionError::Underflow)?;
        match unsafe { self.set(new_brk as *mut u8) } {
            Ok(()) => Ok(()),
            Err(_) => Err(RegionError::Underflow),
        }
    }
}

/// glibc grows its main arena with `sbrk` and trims it with a negative one.
/// Pushing all of its growth to `mmap` and turning trimming off leaves the
/// break to us.
#[cfg(all(target_os = "linux", target_env = "gnu"))]
fn keep_libc_off_the_break() {
    const M_TRIM_THRESHOLD: libc::c_int = -1;
    const M_MMAP_THRESHOLD: libc::c_int = -3;
    unsafe {
        libc::mallopt(M_MMAP_THRESHOLD, 0);
        libc::mallopt(M_TRIM_THRESHOLD, -1);
    }
}

#[cfg(not(all(target_os = "linux", target_env = "gnu")))]
fn keep_libc_off_the_break() {}

/// A region that simulates a program break over a fixed buffer.
///
/// The region never owns the buffer; the caller keeps it alive for as long
/// as the region (and any heap built on it) is in use.
#[derive(Debug)]
pub struct ArenaRegion {
    base: *mut u8,
    brk: *mut u8,
    end: *mut u8,
    page_size: usize,
}

impl ArenaRegion {
    /// Creates a region that operates on the `len` bytes at `buf`.
    /// The start is moved up to [`CHUNK_ALIGN`] if needed.
    ///
    /// # Panics
    /// Panics if `page_size` is not a multiple of [`CHUNK_ALIGN`]
    /// larger than [`HEADER_SIZE`].
    pub fn new(buf: *mut u8, len: usize, page_size: usize) -> Self {
        assert!(
            page_size > HEADER_SIZE && page_size % CHUNK_ALIGN == 0,
            "page size {page_size} can not host a chunk"
        );
        let end = buf.wrapping_add(len);
        let base = match find_aligned(buf, CHUNK_ALIGN) {
            Some(p) if p <= end as *const u8 => p as *mut u8,
            _ => end,
        };
        ArenaRegion {
            base,
            brk: base,
            end,
            page_size,
        }
    }

    /// The first address of the region.
    pub fn base(&self) -> *mut u8 {
        self.base
    }

    /// How many bytes are currently handed out.
    pub fn used(&self) -> usize {
        self.brk as usize - self.base as usize
    }

    /// Moves the end of the region without telling its user,
    /// the way a foreign `sbrk` call would.
    #[cfg(test)]
    pub(crate) fn move_behind_back(&mut self, size: usize) {
        self.brk = self.brk.wrapping_add(size);
    }
}

unsafe impl Region for ArenaRegion {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn brk(&self) -> Option<NonNull<u8>> {
        NonNull::new(self.brk)
    }

    unsafe fn extend(&mut self, size: usize) -> Result<NonNull<u8>, RegionError> {
        let old_brk = NonNull::new(self.brk).ok_or(RegionError::Exhausted)?;
        let new_brk = checked_add(self.brk, size).ok_or(RegionError::Exhausted)? as *mut u8;
        if new_brk > self.end {
            return Err(RegionError::Exhausted);
        }
        self.brk = new_brk;
        Ok(old_brk)
    }

    unsafe fn retract(&mut self, size: usize) -> Result<(), RegionError> {
        if size > self.used() {
            return Err(RegionError::Underflow);
        }
        self.brk = self.brk.wrapping_sub(size);
        Ok(())
    }
}

unsafe impl<T: Region + ?Sized> Region for &mut T {
    fn page_size(&self) -> usize {
        (**self).page_size()
    }

    fn brk(&self) -> Option<NonNull<u8>> {
        (**self).brk()
    }

    unsafe fn extend(&mut self, size: usize) -> Result<NonNull<u8>, RegionError> {
        (**self).extend(size)
    }

    unsafe fn retract(&mut self, size: usize) -> Result<(), RegionError> {
        (**self).retract(size)
    }
}
