//! Moving the end of the heap: page-quantised growth on allocation misses and
//! retraction of the tail on release.

use super::RawHeap;
use crate::fault::HeapFault;
use crate::header::{ChunkHeader, CHUNK_ALIGN, HEADER_SIZE};
use crate::region::{Region, RegionError};
use crate::util::round_up;

use core::ptr::{null_mut, NonNull};

use tracing::{debug, instrument, Level};

/// Rounds `size` up to a size every chunk can be cut to,
/// or fails if a chunk of that size could not be described at all.
///
/// Zero-sized requests get [`CHUNK_ALIGN`] bytes so that their pointer never
/// doubles as the address of the next header.
#[inline]
pub(super) fn augment_size(size: usize) -> Result<usize, HeapFault> {
    match round_up(size.max(1), CHUNK_ALIGN) {
        Some(augmented) if augmented <= usize::MAX - HEADER_SIZE => Ok(augmented),
        _ => Err(HeapFault::Overflow { size }),
    }
}

impl<R: Region> RawHeap<R> {
    /// Grows the region for an allocation of `size` bytes and places it in the
    /// new memory, reusing a free tail chunk if there is one.
    /// Returns `Ok(None)` if the region is exhausted.
    ///
    /// # Notes
    /// Growth always happens in whole pages. Whatever the allocation doesn't
    /// need is split off as a free tail chunk.
    ///
    /// Only a header plus `size` wrapping `usize` is an [`HeapFault::Overflow`].
    /// A request that fits but can't be rounded up to whole pages is treated
    /// like any other request the region can't satisfy.
    ///
    /// # Safety
    /// Assumes `size` is augmented and the chain has just been verified.
    #[instrument(level = "debug", skip(self), ret(level = Level::DEBUG), err(Display, level = Level::ERROR))]
    pub(super) unsafe fn grow(&mut self, size: usize) -> Result<Option<NonNull<u8>>, HeapFault> {
        let overflow = HeapFault::Overflow { size };
        let tail = self.heap_end;
        let tail_is_free = !tail.is_null() && (*tail).is_available();

        let mut request = size.checked_add(HEADER_SIZE).ok_or(overflow)?;
        if tail_is_free {
            // The free tail gets absorbed, only ask for what it lacks.
            request = request.saturating_sub((*tail).data_size).max(1);
            debug!(tail_size = (*tail).data_size, request, "Reusing free tail chunk.");
        }

        let page_size = self.region.page_size();
        let Some(growth_amount) = round_up(request, page_size) else {
            debug!(request, "Growth failure, no whole number of pages holds the request.");
            return Ok(None);
        };
        debug!(growth_amount, "Calculated growth amount.");

        let start = match self.region.extend(growth_amount) {
            Ok(start) => start.as_ptr(),
            Err(RegionError::ForeignBreak { expected, found }) => {
                return Err(HeapFault::ForeignBreak { expected, found });
            }
            Err(err) => {
                debug!(%err, "Growth failure, no memory.");
                return Ok(None);
            }
        };

        if !tail.is_null() && start != ChunkHeader::end(tail) {
            return Err(HeapFault::ForeignBreak {
                expected: ChunkHeader::end(tail) as usize,
                found: start as usize,
            });
        }

        let mut chunk = ChunkHeader::write(
            start.cast(),
            growth_amount - HEADER_SIZE,
            false,
            tail,
            null_mut(),
        );
        if self.heap_start.is_null() {
            self.heap_start = chunk;
        }
        if !tail.is_null() {
            (*tail).next = chunk;
        }
        self.heap_end = chunk;
        debug!(?chunk, header = ?*chunk, "Heap growth successful.");

        if tail_is_free {
            chunk = self.merge(chunk)?;
            (*chunk).set_available(false);
        }
        if (*chunk).data_size > size {
            self.split(chunk, size);
        }

        Ok(NonNull::new(ChunkHeader::data(chunk)))
    }

    /// Gives memory at the end of the heap back to the region.
    ///
    /// A tail chunk that is the whole heap goes away entirely. Otherwise only
    /// whole pages are retracted and the tail keeps at least a header's worth
    /// of data.
    ///
    /// # Safety
    /// Assumes `chunk` is the free, already merged tail of the heap.
    #[instrument(level = "debug", skip(self), err(Display, level = Level::ERROR))]
    pub(super) unsafe fn shrink(&mut self, chunk: *mut ChunkHeader) -> Result<(), HeapFault> {
        debug_assert_eq!(chunk, self.heap_end);
        debug_assert!((*chunk).is_available());

        if (*chunk).prev.is_null() {
            let size = HEADER_SIZE + (*chunk).data_size;
            self.heap_start = null_mut();
            self.heap_end = null_mut();
            self.retract(size)?;
            debug!(size, "Released the whole heap.");
            return Ok(());
        }

        let page_size = self.region.page_size();
        let pages = (*chunk).data_size.saturating_sub(HEADER_SIZE) / page_size;
        if pages == 0 {
            debug!(
                data_size = (*chunk).data_size,
                "Tail holds less than a page of slack, keeping it."
            );
            return Ok(());
        }

        let size = pages * page_size;
        (*chunk).data_size -= size;
        self.retract(size)?;
        debug!(size, data_size = (*chunk).data_size, "Trimmed the tail chunk.");
        Ok(())
    }

    unsafe fn retract(&mut self, size: usize) -> Result<(), HeapFault> {
        self.region.retract(size).map_err(|err| match err {
            RegionError::ForeignBreak { expected, found } => {
                HeapFault::ForeignBreak { expected, found }
            }
            RegionError::Exhausted | RegionError::Underflow => HeapFault::RetractFailed { size },
        })
    }
}
