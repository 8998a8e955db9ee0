use crate::config::{PAGE_SHIFT, PAGE_SIZE};

/// Sizes between which a reallocation is served in place, see
/// [`Heap::reallocate`](super::Heap::reallocate). Returns the smallest size
/// kept in place and the size to ask for when growing a little.
#[inline]
pub(crate) fn realloc_bounds(old_size: usize) -> (usize, usize) {
    (old_size / 2, old_size.saturating_add(old_size / 4))
}

/// Page alignment of a span serving an `align`-aligned object.
#[inline]
pub(crate) fn align_pages(align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    if align <= PAGE_SIZE {
        1
    } else {
        align >> PAGE_SHIFT
    }
}
