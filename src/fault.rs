//! Structured descriptions of the conditions the allocator refuses to survive.
//!
//! The core never terminates the process itself. It returns a [`HeapFault`]
//! and leaves it to the locked façade to log it and call [`fail_fast`] once
//! the heap lock has been released.

use core::fmt;

use tracing::error;

/// Which link of a chunk header a fault refers to.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Link {
    Prev,
    Next,
}

impl fmt::Display for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Link::Prev => f.write_str("prev"),
            Link::Next => f.write_str("next"),
        }
    }
}

/// An unrecoverable heap condition. Addresses are plain `usize`s so that a
/// fault can be formatted without touching the (possibly corrupted) heap.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum HeapFault {
    /// `size` plus the chunk header (or its page-rounded form) wraps `usize`.
    Overflow { size: usize },
    /// A header's sentinel or free flag has been overwritten.
    CorruptedHeader { chunk: usize },
    /// A chunk's successor does not start right after its data.
    BrokenChain {
        chunk: usize,
        expected: usize,
        found: usize,
    },
    /// A chunk's successor does not point back at it.
    BrokenBackLink { chunk: usize, next: usize },
    /// A link points outside of the range it is allowed to point into.
    LinkOutOfRange {
        chunk: usize,
        link: Link,
        target: usize,
    },
    /// The chain ended somewhere other than the recorded heap end.
    TailMismatch { last: usize, heap_end: usize },
    /// The tail chunk does not end at the program break.
    BreakMismatch { tail_end: usize, brk: usize },
    /// `release` was given a pointer outside of the heap.
    OutOfBounds { ptr: usize },
    /// `release` was given a pointer that cannot precede a chunk's data.
    Misaligned { ptr: usize },
    /// `release` was called twice for the same allocation.
    DoubleFree { ptr: usize },
    /// An already released allocation was handed back to the allocator.
    UseAfterFree { ptr: usize },
    /// Coalescing two chunks would wrap their combined size.
    MergeOverflow { chunk: usize, absorbed: usize },
    /// The region refused to give back memory.
    RetractFailed { size: usize },
    /// Someone other than the allocator moved the program break.
    ForeignBreak { expected: usize, found: usize },
}

impl fmt::Display for HeapFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            HeapFault::Overflow { size } => {
                write!(f, "request of {size} bytes overflows the chunk size")
            }
            HeapFault::CorruptedHeader { chunk } => {
                write!(f, "corrupted header at {chunk:#x}")
            }
            HeapFault::BrokenChain {
                chunk,
                expected,
                found,
            } => write!(
                f,
                "chunk {chunk:#x} should be followed by {expected:#x} but next is {found:#x}"
            ),
            HeapFault::BrokenBackLink { chunk, next } => {
                write!(f, "chunk {next:#x} does not link back to {chunk:#x}")
            }
            HeapFault::LinkOutOfRange {
                chunk,
                link,
                target,
            } => write!(f, "{link} link of chunk {chunk:#x} points out of range to {target:#x}"),
            HeapFault::TailMismatch { last, heap_end } => {
                write!(f, "chain ends at {last:#x} but heap end is {heap_end:#x}")
            }
            HeapFault::BreakMismatch { tail_end, brk } => {
                write!(f, "tail chunk ends at {tail_end:#x} but the break is at {brk:#x}")
            }
            HeapFault::OutOfBounds { ptr } => write!(f, "free of {ptr:#x} outside of the heap"),
            HeapFault::Misaligned { ptr } => write!(f, "free of misaligned pointer {ptr:#x}"),
            HeapFault::DoubleFree { ptr } => write!(f, "double free of {ptr:#x}"),
            HeapFault::UseAfterFree { ptr } => write!(f, "use of released allocation {ptr:#x}"),
            HeapFault::MergeOverflow { chunk, absorbed } => write!(
                f,
                "merging chunk {absorbed:#x} into {chunk:#x} overflows the chunk size"
            ),
            HeapFault::RetractFailed { size } => {
                write!(f, "could not retract the break by {size} bytes")
            }
            HeapFault::ForeignBreak { expected, found } => write!(
                f,
                "program break moved behind the allocator's back (expected {expected:#x}, found {found:#x})"
            ),
        }
    }
}

/// Logs `fault` and terminates the process without unwinding.
///
/// Must not be called while the heap lock is held: an installed subscriber
/// may allocate.
#[cold]
#[inline(never)]
pub fn fail_fast(fault: HeapFault) -> ! {
    error!(%fault, "Heap fault, aborting.");
    std::process::abort()
}
