//! Defines the [`ChunkHeader`] struct and associated constants and functions.
//!
//! All conversions between chunk addresses and data pointers live here.
//! They use wrapping address arithmetic and never dereference, so a caller
//! can recover a header from an untrusted pointer and validate it before use.

use core::mem::{align_of, size_of};

use static_assertions::const_assert;

pub const HEADER_SIZE: usize = size_of::<ChunkHeader>();
pub const HEADER_ALIGN: usize = align_of::<ChunkHeader>();

/// Alignment of every chunk and of every pointer given out by the allocator.
pub const CHUNK_ALIGN: usize = HEADER_ALIGN;

/// Value stamped into every header at creation.
pub const SENTINEL: u32 = 1_073_197;

const IN_USE: u32 = 0;
const FREE: u32 = 1;

// Data pointers are `chunk + HEADER_SIZE`, so they keep the chunk alignment.
const_assert!(HEADER_SIZE % CHUNK_ALIGN == 0);
const_assert!(CHUNK_ALIGN >= 16);

/// The in-band metadata record that precedes every chunk's data.
///
/// Chunks form a single doubly linked chain in address order, free and
/// occupied chunks interleaved. A chunk's data starts exactly
/// [`HEADER_SIZE`] bytes after its header and its successor (if any) starts
/// exactly `data_size` bytes after that.
///
/// `available` is a `u32` rather than a `bool` so that a header overwritten
/// with arbitrary bytes can still be read and reported as corrupted.
#[derive(Debug)]
#[repr(C, align(16))]
pub struct ChunkHeader {
    pub corruption_check: u32,
    pub available: u32,
    pub data_size: usize,
    pub prev: *mut ChunkHeader,
    pub next: *mut ChunkHeader,
}

impl ChunkHeader {
    /// Stamps a fresh header at `at` and returns it.
    ///
    /// # Safety
    /// `at` must be valid for writes of [`HEADER_SIZE`] bytes and
    /// [`HEADER_ALIGN`]-aligned.
    #[inline]
    pub unsafe fn write(
        at: *mut ChunkHeader,
        data_size: usize,
        available: bool,
        prev: *mut ChunkHeader,
        next: *mut ChunkHeader,
    ) -> *mut ChunkHeader {
        debug_assert_eq!(at as usize % HEADER_ALIGN, 0);
        at.write(ChunkHeader {
            corruption_check: SENTINEL,
            available: if available { FREE } else { IN_USE },
            data_size,
            prev,
            next,
        });
        at
    }

    /// Returns the address where the header for `data` would be.
    /// The result is unchecked and must be validated before it is read.
    #[inline(always)]
    pub fn from_data(data: *mut u8) -> *mut ChunkHeader {
        data.wrapping_sub(HEADER_SIZE).cast()
    }

    /// Returns the data pointer of `chunk`.
    #[inline(always)]
    pub fn data(chunk: *mut ChunkHeader) -> *mut u8 {
        chunk.cast::<u8>().wrapping_add(HEADER_SIZE)
    }

    /// Returns the first address past `chunk`'s data,
    /// that is where its successor has to start.
    ///
    /// # Safety
    /// `chunk` must point to a readable header.
    #[inline(always)]
    pub unsafe fn end(chunk: *mut ChunkHeader) -> *mut u8 {
        Self::data(chunk).wrapping_add((*chunk).data_size)
    }

    #[inline(always)]
    pub fn is_available(&self) -> bool {
        self.available == FREE
    }

    #[inline(always)]
    pub fn set_available(&mut self, available: bool) {
        self.available = if available { FREE } else { IN_USE };
    }

    /// Returns whether the sentinel and the free flag hold legal values.
    #[inline(always)]
    pub fn is_intact(&self) -> bool {
        self.corruption_check == SENTINEL && (self.available == IN_USE || self.available == FREE)
    }
}
