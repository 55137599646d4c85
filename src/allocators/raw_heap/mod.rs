//! A singlethreaded, self-verifying heap.
//!
// For a general view of the allocator's operational semantics see the [`crate`] level documentation.
//
// # Additional implementation notes
// ## Size augmentation
// Every requested size is rounded up to `CHUNK_ALIGN` before it reaches the
// search, split or growth code. Together with a header size that is a multiple
// of `CHUNK_ALIGN` this keeps every chunk and every data pointer aligned, and
// means the private functions can assume augmented sizes.
//
// ## Trust
// Only `heap_start` and `heap_end` are trusted. Every other header is reached
// through a link the verifier has checked in the same call, or is recovered from
// a caller's pointer and validated by `locate` before it is read.

use crate::fault::HeapFault;
use crate::header::{ChunkHeader, CHUNK_ALIGN, HEADER_SIZE, SENTINEL};
use crate::util::find_place;
use crate::region::Region;

use core::fmt::Debug;
use core::ptr::{null_mut, NonNull};
use std::io;

use tracing::{debug, instrument, Level};

use self::growth::augment_size;

mod chunks;
mod growth;
mod verify;

/// A snapshot of one chunk header, as found in the chain.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ChunkInfo {
    pub addr: usize,
    pub corruption_check: u32,
    pub data_size: usize,
    pub available: bool,
    pub prev: usize,
    pub next: usize,
    pub data: usize,
}

/// A singlethreaded heap over a [`Region`].
///
/// Every public operation first verifies the whole chunk chain. Violations come
/// back as [`HeapFault`]s; turning them into process termination is up to the
/// caller (see [`SentinelMalloc`](crate::SentinelMalloc)).
pub struct RawHeap<R: Region> {
    heap_start: *mut ChunkHeader,
    heap_end: *mut ChunkHeader,
    region: R,
}

impl<R: Region> Debug for RawHeap<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawHeap")
            .field("heap_start", &self.heap_start)
            .field("heap_end", &self.heap_end)
            .field("brk", &self.region.brk())
            .finish()
    }
}

impl<R: Region> RawHeap<R> {
    /// Creates an empty heap on top of the specified region.
    ///
    /// # Safety
    /// Callers must make sure that the provided region will be the only object
    /// managing it's underlying buffer for the lifetime of the returned heap.
    pub const unsafe fn with_region(region: R) -> Self {
        RawHeap {
            heap_start: null_mut(),
            heap_end: null_mut(),
            region,
        }
    }

    pub fn region(&self) -> &R {
        &self.region
    }

    /// Returns whether the heap holds no chunks at all.
    pub fn is_empty(&self) -> bool {
        self.heap_start.is_null()
    }

    /// Returns a pointer to at least `size` usable bytes,
    /// or `Ok(None)` if the region can not grow any further.
    ///
    /// `allocate(0)` still hands out a distinct pointer that can be released.
    #[instrument(level = "info", skip(self), ret(level = Level::INFO), err(Display, level = Level::ERROR))]
    pub fn allocate(&mut self, size: usize) -> Result<Option<NonNull<u8>>, HeapFault> {
        self.verify()?;
        let size = augment_size(size)?;
        debug!(augmented_size = size, "Size augmented.");

        if let Some(data) = unsafe { self.find_available(size) } {
            return Ok(Some(data));
        }
        debug!("Couldn't find free chunk to accomodate object, requesting heap growth.");
        unsafe { self.grow(size) }
    }

    /// Like [`allocate`](Self::allocate), but the returned pointer is also
    /// `align`-aligned.
    ///
    /// Alignments above [`CHUNK_ALIGN`] take `size + align + HEADER_SIZE` bytes
    /// and give the unused front back as a free padding chunk, so the result
    /// is released like any other pointer.
    ///
    /// # Panics
    /// Panics if `align` is not a power-of-two.
    #[instrument(level = "info", skip(self), ret(level = Level::INFO), err(Display, level = Level::ERROR))]
    pub fn allocate_aligned(
        &mut self,
        size: usize,
        align: usize,
    ) -> Result<Option<NonNull<u8>>, HeapFault> {
        assert!(align.is_power_of_two(), "alignment {align} is not a power of two");
        if align <= CHUNK_ALIGN {
            return self.allocate(size);
        }

        let size = augment_size(size)?;
        let overflow = HeapFault::Overflow { size };
        let padded = size
            .checked_add(align)
            .and_then(|padded| padded.checked_add(HEADER_SIZE))
            .ok_or(overflow)?;
        let Some(data) = self.allocate(padded)? else {
            return Ok(None);
        };

        unsafe {
            let mut chunk = ChunkHeader::from_data(data.as_ptr());
            let place = find_place(data.as_ptr(), align).ok_or(overflow)? as *mut u8;
            if place != data.as_ptr() {
                chunk = self.pad(chunk, place)?;
            }
            self.trim(chunk, size)?;
            Ok(NonNull::new(ChunkHeader::data(chunk)))
        }
    }

    /// Releases the chunk whose data starts at `ptr`. Releasing null does nothing.
    ///
    /// # Safety
    /// Callers must not access the released memory afterwards.
    /// Any other misuse (double free, foreign pointers, overwritten headers)
    /// is reported as a fault.
    #[instrument(level = "info", skip(self), err(Display, level = Level::ERROR))]
    pub unsafe fn release(&mut self, ptr: *mut u8) -> Result<(), HeapFault> {
        if ptr.is_null() {
            return Ok(());
        }
        self.verify()?;

        let chunk = self.locate(ptr)?;
        if (*chunk).is_available() {
            return Err(HeapFault::DoubleFree { ptr: ptr as usize });
        }
        (*chunk).set_available(true);

        let chunk = self.merge(chunk)?;
        if chunk == self.heap_end {
            self.shrink(chunk)?;
        }
        Ok(())
    }

    /// Returns how many bytes the allocation at `ptr` can actually hold.
    ///
    /// # Safety
    /// `ptr` must not be in concurrent use by another owner.
    pub unsafe fn usable_size(&self, ptr: *mut u8) -> Result<usize, HeapFault> {
        self.verify()?;
        let chunk = self.locate(ptr)?;
        if (*chunk).is_available() {
            return Err(HeapFault::UseAfterFree { ptr: ptr as usize });
        }
        Ok((*chunk).data_size)
    }

    /// Recovers the header of `ptr` and makes sure it can be trusted.
    ///
    /// # Safety
    /// Assumes the chain has just been verified.
    unsafe fn locate(&self, ptr: *mut u8) -> Result<*mut ChunkHeader, HeapFault> {
        let chunk = ChunkHeader::from_data(ptr);
        let addr = chunk as usize;

        if self.heap_start.is_null()
            || addr < self.heap_start as usize
            || addr > self.heap_end as usize
        {
            return Err(HeapFault::OutOfBounds { ptr: ptr as usize });
        }
        if (addr - self.heap_start as usize) % CHUNK_ALIGN != 0 {
            return Err(HeapFault::Misaligned { ptr: ptr as usize });
        }
        if !(*chunk).is_intact() {
            return Err(HeapFault::CorruptedHeader { chunk: addr });
        }
        Ok(chunk)
    }

    /// Takes the first free chunk (in address order) that can hold `size` bytes,
    /// cuts it down to `size` and marks it occupied.
    ///
    /// # Safety
    /// Assumes `size` is augmented and the chain has just been verified.
    unsafe fn find_available(&mut self, size: usize) -> Option<NonNull<u8>> {
        let mut chunk = self.heap_start;

        while !chunk.is_null() {
            if (*chunk).is_available() && (*chunk).data_size >= size {
                debug!(?chunk, data_size = (*chunk).data_size, "Found free chunk.");
                self.split(chunk, size);
                (*chunk).set_available(false);
                return NonNull::new(ChunkHeader::data(chunk));
            }
            chunk = (*chunk).next;
        }

        None
    }

    /// Iterates over the chunk chain in address order.
    ///
    /// The walk does not verify anything, it just stops at the first link
    /// that leaves the heap or does not move forward.
    pub fn chunks(&self) -> Chunks<'_, R> {
        Chunks {
            heap: self,
            next: self.heap_start,
            last: 0,
        }
    }

    /// Writes the heap boundaries, the break and every chunk header to `out`.
    pub fn dump<W: io::Write>(&self, out: &mut W, title: Option<&str>) -> io::Result<()> {
        writeln!(out, "================")?;
        if let Some(title) = title {
            writeln!(out, "STATUS    : {title}")?;
        }
        writeln!(out, "HEAP START: {:p}", self.heap_start)?;
        writeln!(out, "HEAP END  : {:p}", self.heap_end)?;
        writeln!(out, "BREAK     : {:?}", self.region.brk())?;

        for chunk in self.chunks() {
            let at = chunk.addr;
            writeln!(out, "------------")?;
            let sentinel = match chunk.corruption_check {
                SENTINEL => "",
                _ => " (corrupted)",
            };
            writeln!(
                out,
                "{at:#x}: corruption_check: {}{sentinel}",
                chunk.corruption_check
            )?;
            writeln!(out, "{at:#x}: data size: {}", chunk.data_size)?;
            writeln!(out, "{at:#x}: available: {}", chunk.available)?;
            writeln!(out, "{at:#x}: prev: {:#x}", chunk.prev)?;
            writeln!(out, "{at:#x}: next: {:#x}", chunk.next)?;
            writeln!(out, "{at:#x}: data: {:#x}", chunk.data)?;
        }

        writeln!(out, "================")?;
        writeln!(out)
    }
}

/// Iterator returned by [`RawHeap::chunks`].
pub struct Chunks<'a, R: Region> {
    heap: &'a RawHeap<R>,
    next: *mut ChunkHeader,
    last: usize,
}

impl<'a, R: Region> Iterator for Chunks<'a, R> {
    type Item = ChunkInfo;

    fn next(&mut self) -> Option<ChunkInfo> {
        let chunk = self.next;
        let addr = chunk as usize;
        if chunk.is_null()
            || addr <= self.last
            || addr < self.heap.heap_start as usize
            || addr > self.heap.heap_end as usize
            || addr % CHUNK_ALIGN != 0
        {
            return None;
        }

        // In range and aligned, so it lies inside memory the region handed out.
        let header = unsafe { &*chunk };
        self.last = addr;
        self.next = header.next;
        Some(ChunkInfo {
            addr,
            corruption_check: header.corruption_check,
            data_size: header.data_size,
            available: header.is_available(),
            prev: header.prev as usize,
            next: header.next as usize,
            data: ChunkHeader::data(chunk) as usize,
        })
    }
}

#[cfg(test)]
mod tests;
