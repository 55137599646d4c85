//! A `brk`-backed memory allocator that checks its own heap on every call
//! and stops the process the moment it finds it damaged.
//!
//! # Usage
//! ```
//! use sentinel_malloc::SentinelMalloc;
//! use sentinel_malloc::region::BrkRegion;
//!
//! #[global_allocator]
//! static ALLOCATOR: SentinelMalloc<BrkRegion> =
//!     unsafe { SentinelMalloc::with_region(BrkRegion::new()) };
//!
//! fn main() {
//!     let v1: Vec<u32> = vec![1, 2, 3];
//!     println!("Brk is cool {:?}", v1);
//! }
//! ```
//!
//! The allocator can also be used directly:
//! ```
//! use sentinel_malloc::SentinelMalloc;
//! use sentinel_malloc::region::BrkRegion;
//!
//! static HEAP: SentinelMalloc<BrkRegion> =
//!     unsafe { SentinelMalloc::with_region(BrkRegion::new()) };
//!
//! let p = HEAP.allocate(64).expect("out of memory");
//! unsafe { HEAP.release(p.as_ptr()) };
//! ```
//!
//! # Mode of operation
//! The heap is one contiguous region whose end is the program break.
//! It is divided into [chunks](#chunks) that are chained together in address
//! order, free and occupied ones interleaved.
//! - On allocation the chain is searched from the start for the first free
//!   chunk that is large enough (first fit). If it is larger than needed it is
//!   split and the rest becomes a new free chunk.
//! - If no chunk fits, the break is moved up by whole pages. A free chunk at the
//!   end of the heap is absorbed into the new memory instead of being wasted,
//!   and whatever the allocation doesn't need is split off again.
//! - On release the chunk is marked free and merged with free neighbours. If
//!   the result is the last chunk of the heap, whole pages are handed back to
//!   the system, or the entire heap if it was the only chunk.
//!
//! ## Chunks
//! Each chunk starts with a [`ChunkHeader`](header::ChunkHeader) holding a
//! sentinel value, the size of its data, whether it is free, and links to its
//! neighbours. The data follows right after the header.
//!
//! ## Verification
//! Before every allocation and release the whole chain is walked and every
//! header is checked: sentinels, link ranges, chunk geometry, and that the last
//! chunk ends at the break. A released pointer must additionally lie inside
//! the heap, be chunk aligned, carry an intact header, and not be free already.
//!
//! Anything that fails these checks is a [`HeapFault`]. [`RawHeap`] returns
//! faults as values; [`SentinelMalloc`] logs them through `tracing` and aborts.
//! Running out of memory is not a fault: `allocate` just returns `None`.
//!
//! Verification makes every call linear in the number of chunks.
//!
//! ## Regions
//! The heap does not call `brk` itself, it goes through a [`Region`].
//! [`BrkRegion`] moves the real program break and keeps glibc's `malloc` off it;
//! [`ArenaRegion`] simulates a break over a buffer you own.
//!
//! # Limitations
//! - Pointers are aligned to [`CHUNK_ALIGN`](header::CHUNK_ALIGN) (16 bytes).
//!   Stricter alignments are served by over-allocating and placing a free
//!   padding chunk in front of the data, which costs up to `align` bytes plus
//!   a header per allocation until the padding is reused.
//! - All threads share one lock.
//! - Memory is only returned to the system from the end of the heap.
//! - Do not install a `tracing` subscriber that allocates while the allocator is
//!   the global allocator.
//!
//! [`RawHeap`]: allocators::RawHeap
//! [`SentinelMalloc`]: allocators::SentinelMalloc
//! [`HeapFault`]: fault::HeapFault
//! [`Region`]: region::Region
//! [`BrkRegion`]: region::BrkRegion
//! [`ArenaRegion`]: region::ArenaRegion

pub use crate::allocators::RawHeap;
pub use crate::allocators::SentinelMalloc;

pub mod allocators;
pub mod fault;
pub mod header;
pub mod region;
mod util;
