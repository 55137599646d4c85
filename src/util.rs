//! Utility functions.

use crate::header::HEADER_SIZE;

use core::ptr::{null_mut, NonNull};

/// Returns the smallest (in address) `align`-aligned pointer
/// with an address greater or equal to that of `ptr`
/// or `None` if no such pointer exists.
///
/// # Panics
/// Panics if `align` is not a power-of-two.
#[inline]
pub(crate) fn find_aligned(ptr: *const u8, align: usize) -> Option<*const u8> {
    let offset = ptr.align_offset(align);
    debug_assert_ne!(
        offset,
        usize::MAX,
        "align_offset() on a *const u8 should never fail."
    );
    if usize::MAX - offset < ptr as usize {
        return None;
    }
    Some(ptr.wrapping_add(offset))
}

/// Returns the smallest multiple of `y` that is greater or equal to `x`
/// or `None` if that multiple does not fit in a `usize`.
///
/// # Panics
/// Panics if `y` is 0.
#[inline]
pub(crate) fn round_up(x: usize, y: usize) -> Option<usize> {
    match x % y {
        0 => Some(x),
        rem => x.checked_add(y - rem),
    }
}

/// Returns where `align`-aligned data can start inside a chunk whose data
/// starts at `data`: `data` itself if it is aligned, otherwise the first
/// aligned address that leaves room for a padding header in front of it.
/// Returns `None` if no such address exists.
///
/// # Panics
/// Panics if `align` is not a power-of-two.
#[inline]
pub(crate) fn find_place(data: *const u8, align: usize) -> Option<*const u8> {
    if data.align_offset(align) == 0 {
        return Some(data);
    }
    find_aligned(checked_add(data, HEADER_SIZE)?, align)
}

#[inline(always)]
pub(crate) fn raw_ptr<T>(p: Option<NonNull<T>>) -> *mut T {
    p.map_or(null_mut(), |p| p.as_ptr())
}

#[inline(always)]
pub(crate) fn checked_add(ptr: *const u8, offset: usize) -> Option<*const u8> {
    (ptr as usize <= usize::MAX - offset).then(|| ptr.wrapping_add(offset))
}
