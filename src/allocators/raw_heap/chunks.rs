//! Splitting chunks down to a requested size and coalescing free neighbours.

use super::RawHeap;
use crate::fault::HeapFault;
use crate::header::{ChunkHeader, CHUNK_ALIGN, HEADER_SIZE};
use crate::region::Region;

use tracing::{debug, instrument, Level};

impl<R: Region> RawHeap<R> {
    /// Cuts `chunk` down to `size` bytes, turning the rest into a new free chunk
    /// right after it. Does nothing when the rest could not hold more than a header.
    ///
    /// # Safety
    /// Assumes `chunk` is a verified member of the chain,
    /// `size` is augmented and `size <= data_size`.
    #[instrument(level = "debug", skip(self))]
    pub(super) unsafe fn split(&mut self, chunk: *mut ChunkHeader, size: usize) {
        let data_size = (*chunk).data_size;
        debug_assert!(data_size >= size);

        if data_size - size <= HEADER_SIZE {
            debug!(data_size, "Remainder can't host a chunk, not splitting.");
            return;
        }

        let next = (*chunk).next;
        let rest: *mut ChunkHeader = ChunkHeader::data(chunk).add(size).cast();
        ChunkHeader::write(rest, data_size - size - HEADER_SIZE, true, chunk, next);

        if !next.is_null() {
            (*next).prev = rest;
        }
        (*chunk).next = rest;
        (*chunk).data_size = size;

        if chunk == self.heap_end {
            self.heap_end = rest;
        }
        debug!(?rest, rest_header = ?*rest, "Split off a free chunk.");
    }

    /// Cuts `chunk` down to `size` bytes like [`split`](Self::split) and
    /// coalesces the cut-off rest with a free successor.
    ///
    /// # Safety
    /// Same as for [`split`](Self::split).
    pub(super) unsafe fn trim(
        &mut self,
        chunk: *mut ChunkHeader,
        size: usize,
    ) -> Result<(), HeapFault> {
        let next = (*chunk).next;
        self.split(chunk, size);

        let rest = (*chunk).next;
        if rest != next {
            self.merge(rest)?;
        }
        Ok(())
    }

    /// Moves the start of `chunk`'s data up to `place`. The skipped front keeps
    /// `chunk`'s header and becomes a free padding chunk, a new occupied header
    /// is stamped right before `place`. Returns that new header.
    ///
    /// # Safety
    /// Assumes `chunk` is a verified, occupied member of the chain, `place` is
    /// [`CHUNK_ALIGN`]-aligned and lies at least a header past `chunk`'s data
    /// but before its end.
    #[instrument(level = "debug", skip(self), ret(level = Level::DEBUG), err(Display, level = Level::ERROR))]
    pub(super) unsafe fn pad(
        &mut self,
        chunk: *mut ChunkHeader,
        place: *mut u8,
    ) -> Result<*mut ChunkHeader, HeapFault> {
        let data = ChunkHeader::data(chunk);
        let end = ChunkHeader::end(chunk);
        debug_assert!(place as usize >= data as usize + HEADER_SIZE && place < end);
        debug_assert_eq!(place as usize % CHUNK_ALIGN, 0);

        let next = (*chunk).next;
        let moved = ChunkHeader::write(
            ChunkHeader::from_data(place),
            end as usize - place as usize,
            false,
            chunk,
            next,
        );
        if !next.is_null() {
            (*next).prev = moved;
        }
        if chunk == self.heap_end {
            self.heap_end = moved;
        }

        (*chunk).next = moved;
        (*chunk).data_size = moved as usize - data as usize;
        (*chunk).set_available(true);
        debug!(padding = ?chunk, padding_size = (*chunk).data_size, "Placed a free chunk as left padding.");

        self.merge(chunk)?;
        Ok(moved)
    }

    /// Coalesces `chunk` with its free neighbours, the next one first, then the
    /// previous one. Returns the surviving chunk.
    ///
    /// # Safety
    /// Assumes `chunk` is a verified member of the chain.
    #[instrument(level = "debug", skip(self), ret(level = Level::DEBUG), err(Display, level = Level::ERROR))]
    pub(super) unsafe fn merge(
        &mut self,
        mut chunk: *mut ChunkHeader,
    ) -> Result<*mut ChunkHeader, HeapFault> {
        let next = (*chunk).next;
        if !next.is_null() && (*next).is_available() {
            self.absorb(chunk, next)?;
        }

        let prev = (*chunk).prev;
        if !prev.is_null() && (*prev).is_available() {
            self.absorb(prev, chunk)?;
            chunk = prev;
        }

        Ok(chunk)
    }

    /// Folds `absorbed` into its predecessor `survivor`.
    unsafe fn absorb(
        &mut self,
        survivor: *mut ChunkHeader,
        absorbed: *mut ChunkHeader,
    ) -> Result<(), HeapFault> {
        debug_assert_eq!((*survivor).next, absorbed);

        let data_size = (*absorbed)
            .data_size
            .checked_add(HEADER_SIZE)
            .and_then(|size| size.checked_add((*survivor).data_size))
            .ok_or(HeapFault::MergeOverflow {
                chunk: survivor as usize,
                absorbed: absorbed as usize,
            })?;

        let next = (*absorbed).next;
        (*survivor).data_size = data_size;
        (*survivor).next = next;
        if !next.is_null() {
            (*next).prev = survivor;
        }
        if absorbed == self.heap_end {
            self.heap_end = survivor;
        }

        // A stale header must never pass for a live one.
        (*absorbed).corruption_check = 0;

        debug!(
            ?survivor,
            ?absorbed,
            data_size,
            "Merged with neighbouring free chunk."
        );
        Ok(())
    }
}
