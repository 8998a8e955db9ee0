//! Utility functions.

use core::ptr::{null_mut, NonNull};

use crate::config::{PAGE_SHIFT, PAGE_SIZE};

/// Page number of the page containing `ptr`.
pub type PageId = usize;

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

#[inline(always)]
pub(crate) fn raw_ptr<T>(p: Option<NonNull<T>>) -> *mut T {
    p.map_or(null_mut(), |p| p.as_ptr())
}

#[inline(always)]
pub(crate) fn checked_add(ptr: *const u8, offset: usize) -> Option<*const u8> {
    (ptr as usize <= usize::MAX - offset).then_some(ptr.wrapping_add(offset))
}

/// Rounds `x` up to a multiple of `align`, which must be a power of two.
#[inline(always)]
pub(crate) const fn align_up(x: usize, align: usize) -> usize {
    let mask = align - 1;
    (x + mask) & !mask
}

/// Number of pages needed to hold `bytes`, or `None` on overflow.
#[inline]
pub(crate) fn pages_for(bytes: usize) -> Option<usize> {
    bytes.checked_add(PAGE_SIZE - 1).map(|b| b >> PAGE_SHIFT)
}

#[inline(always)]
pub(crate) fn page_of(ptr: *const u8) -> PageId {
    ptr as usize >> PAGE_SHIFT
}

#[inline(always)]
pub(crate) fn page_addr(page: PageId) -> *mut u8 {
    (page << PAGE_SHIFT) as *mut u8
}

/// Index of the most significant set bit; `n` must be nonzero.
#[inline(always)]
pub(crate) const fn floor_log2(n: usize) -> usize {
    (usize::BITS - 1 - n.leading_zeros()) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ptr::null;

    #[test]
    fn test_find_aligned_1() {
        for i in 0..1000 {
            for j in 0..=5 {
                let alignment = 1 << j;
                let align_mask = !(alignment - 1);
                assert_eq!(
                    find_aligned(i as *const u8, alignment).unwrap() as usize,
                    ((i + alignment - 1) & align_mask)
                );
            }
        }
    }

    #[test]
    fn test_find_aligned_2() {
        for i in usize::MAX - 14..=usize::MAX {
            assert!(find_aligned(i as *mut u8, 16).is_none());
        }
        assert_eq!(
            find_aligned((usize::MAX - 15) as *const u8, 16),
            Some((usize::MAX - 15) as *const u8)
        );
    }

    #[test]
    #[should_panic]
    fn test_find_aligned_3() {
        find_aligned(null(), 5);
    }

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 8), 0);
        assert_eq!(align_up(1, 8), 8);
        assert_eq!(align_up(8, 8), 8);
        assert_eq!(align_up(PAGE_SIZE + 1, PAGE_SIZE), 2 * PAGE_SIZE);
    }

    #[test]
    fn test_pages_for() {
        assert_eq!(pages_for(0), Some(0));
        assert_eq!(pages_for(1), Some(1));
        assert_eq!(pages_for(PAGE_SIZE), Some(1));
        assert_eq!(pages_for(PAGE_SIZE + 8), Some(2));
        assert_eq!(pages_for(usize::MAX), None);
    }

    #[test]
    fn test_page_round_trip() {
        let p = page_addr(1234);
        assert_eq!(page_of(p), 1234);
        assert_eq!(page_of(p.wrapping_add(PAGE_SIZE - 1)), 1234);
        assert_eq!(page_of(p.wrapping_add(PAGE_SIZE)), 1235);
    }

    #[test]
    fn test_floor_log2() {
        assert_eq!(floor_log2(1), 0);
        assert_eq!(floor_log2(2), 1);
        assert_eq!(floor_log2(3), 1);
        assert_eq!(floor_log2(4096), 12);
        assert_eq!(floor_log2(usize::MAX), usize::BITS as usize - 1);
    }

    #[test]
    fn test_checked_add() {
        assert_eq!(checked_add(8 as *const u8, 8), Some(16 as *const u8));
        assert!(checked_add(usize::MAX as *const u8, 1).is_none());
    }
}
