//! Heap integrity verification.

use super::RawHeap;
use crate::fault::{HeapFault, Link};
use crate::header::ChunkHeader;
use crate::region::Region;

use tracing::{instrument, Level};

impl<R: Region> RawHeap<R> {
    /// Walks the whole chain and checks every header against the heap's invariants:
    /// * the sentinel and the free flag are intact,
    /// * `prev` lies in `[heap_start, chunk)`,
    /// * `next` lies in `(chunk, heap_end]`, starts right after the chunk's data
    ///   and links back to the chunk,
    /// * the chain ends at `heap_end`, and `heap_end` ends at the break.
    ///
    /// Returns the first violation found. Links are range-checked before they
    /// are followed, and addresses strictly increase along the walk, so the
    /// walk terminates and never leaves the heap.
    #[instrument(level = "trace", skip(self), err(Display, level = Level::ERROR))]
    pub fn verify(&self) -> Result<(), HeapFault> {
        if self.heap_start.is_null() {
            if !self.heap_end.is_null() {
                return Err(HeapFault::TailMismatch {
                    last: 0,
                    heap_end: self.heap_end as usize,
                });
            }
            return Ok(());
        }

        let heap_start = self.heap_start as usize;
        let heap_end = self.heap_end as usize;
        let mut chunk = self.heap_start;

        loop {
            let addr = chunk as usize;
            // Either `heap_start` or a successor that was range-checked below.
            let header = unsafe { &*chunk };

            if !header.is_intact() {
                return Err(HeapFault::CorruptedHeader { chunk: addr });
            }

            let prev = header.prev as usize;
            if !header.prev.is_null() && (prev < heap_start || prev >= addr) {
                return Err(HeapFault::LinkOutOfRange {
                    chunk: addr,
                    link: Link::Prev,
                    target: prev,
                });
            }

            let chunk_end = unsafe { ChunkHeader::end(chunk) } as usize;
            let next = header.next;

            if next.is_null() {
                if addr != heap_end {
                    return Err(HeapFault::TailMismatch {
                        last: addr,
                        heap_end,
                    });
                }
                if let Some(brk) = self.region.brk() {
                    let brk = brk.as_ptr() as usize;
                    if chunk_end != brk {
                        return Err(HeapFault::BreakMismatch {
                            tail_end: chunk_end,
                            brk,
                        });
                    }
                }
                return Ok(());
            }

            let next_addr = next as usize;
            if next_addr <= addr || next_addr > heap_end {
                return Err(HeapFault::LinkOutOfRange {
                    chunk: addr,
                    link: Link::Next,
                    target: next_addr,
                });
            }
            if next_addr != chunk_end {
                return Err(HeapFault::BrokenChain {
                    chunk: addr,
                    expected: chunk_end,
                    found: next_addr,
                });
            }
            if unsafe { (*next).prev } != chunk {
                return Err(HeapFault::BrokenBackLink {
                    chunk: addr,
                    next: next_addr,
                });
            }

            chunk = next;
        }
    }
}
