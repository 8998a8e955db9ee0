//! A three-level radix tree mapping page numbers to their [`Span`].
//!
//! Reads are lock-free: interior nodes and entries are loaded with acquire
//! ordering, and every store uses release ordering, so a reader that sees a
//! span pointer also sees the span fields written before it was published.
//! Interior nodes are only ever added, by `ensure`, under the page-heap lock.

use core::mem::{align_of, size_of};
use core::ptr::{null_mut, NonNull};
use core::sync::atomic::{AtomicPtr, Ordering};

use static_assertions::const_assert;

use crate::config::{ADDRESS_BITS, PAGE_SHIFT};
use crate::span::Span;
use crate::util::PageId;

/// Bits of a page number.
const BITS: usize = ADDRESS_BITS - PAGE_SHIFT;
const ROOT_BITS: usize = BITS / 3;
const MID_BITS: usize = BITS / 3;
const LEAF_BITS: usize = BITS - ROOT_BITS - MID_BITS;

const ROOT_LEN: usize = 1 << ROOT_BITS;
const MID_LEN: usize = 1 << MID_BITS;
const LEAF_LEN: usize = 1 << LEAF_BITS;

const_assert!(ROOT_BITS + MID_BITS + LEAF_BITS == BITS);

struct Leaf {
    spans: [AtomicPtr<Span>; LEAF_LEN],
}

struct Mid {
    leaves: [AtomicPtr<Leaf>; MID_LEN],
}

#[allow(clippy::declare_interior_mutable_const)]
const NO_MID: AtomicPtr<Mid> = AtomicPtr::new(null_mut());

/// Page number to span index.
pub struct PageMap {
    root: [AtomicPtr<Mid>; ROOT_LEN],
}

#[inline(always)]
const fn split(page: PageId) -> (usize, usize, usize) {
    (
        page >> (MID_BITS + LEAF_BITS),
        (page >> LEAF_BITS) & (MID_LEN - 1),
        page & (LEAF_LEN - 1),
    )
}

impl PageMap {
    pub const fn new() -> Self {
        PageMap {
            root: [NO_MID; ROOT_LEN],
        }
    }

    /// Bytes of a node the `alloc` callback of [`ensure`](Self::ensure) is
    /// asked for, with their alignment.
    pub const NODE_LAYOUTS: [(usize, usize); 2] = [
        (size_of::<Mid>(), align_of::<Mid>()),
        (size_of::<Leaf>(), align_of::<Leaf>()),
    ];

    #[inline(always)]
    fn leaf(&self, page: PageId) -> Option<&Leaf> {
        if page >> BITS != 0 {
            return None;
        }
        let (i1, i2, _) = split(page);
        let mid = self.root[i1].load(Ordering::Acquire);
        if mid.is_null() {
            return None;
        }
        // SAFETY: published nodes are never freed.
        let leaf = unsafe { (*mid).leaves[i2].load(Ordering::Acquire) };
        unsafe { leaf.as_ref() }
    }

    /// Span covering `page`, or null if the page is unknown.
    #[inline(always)]
    pub fn get(&self, page: PageId) -> *mut Span {
        match self.leaf(page) {
            Some(leaf) => leaf.spans[split(page).2].load(Ordering::Acquire),
            None => null_mut(),
        }
    }

    /// Maps `page` to `span`. Returns `false` if no node covers `page`,
    /// i.e. `ensure` was not called for it.
    #[inline]
    pub fn set(&self, page: PageId, span: *mut Span) -> bool {
        match self.leaf(page) {
            Some(leaf) => {
                leaf.spans[split(page).2].store(span, Ordering::Release);
                true
            }
            None => false,
        }
    }

    /// Makes sure nodes exist for every page in `[start, start + n)`.
    ///
    /// `alloc(size, align)` must return zeroed memory that is never freed.
    /// Returns `false` if the range lies outside the mapped address bits or
    /// `alloc` failed; nodes added before the failure stay in place.
    pub fn ensure(
        &self,
        start: PageId,
        n: usize,
        mut alloc: impl FnMut(usize, usize) -> Option<NonNull<u8>>,
    ) -> bool {
        if n == 0 {
            return true;
        }
        let Some(last) = start.checked_add(n - 1) else {
            return false;
        };
        if last >> BITS != 0 {
            return false;
        }

        let mut key = start;
        while key <= last {
            let (i1, i2, _) = split(key);
            let mut mid = self.root[i1].load(Ordering::Acquire);
            if mid.is_null() {
                let [(size, align), _] = Self::NODE_LAYOUTS;
                let Some(node) = alloc(size, align) else {
                    return false;
                };
                mid = node.as_ptr().cast();
                self.root[i1].store(mid, Ordering::Release);
            }
            // SAFETY: `mid` is published and never freed.
            let slot = unsafe { &(*mid).leaves[i2] };
            if slot.load(Ordering::Acquire).is_null() {
                let [_, (size, align)] = Self::NODE_LAYOUTS;
                let Some(node) = alloc(size, align) else {
                    return false;
                };
                slot.store(node.as_ptr().cast(), Ordering::Release);
            }
            // First page of the next leaf.
            key = match ((key >> LEAF_BITS) + 1).checked_mul(LEAF_LEN) {
                Some(next) => next,
                None => break,
            };
        }
        true
    }
}

impl Default for PageMap {
    fn default() -> Self {
        PageMap::new()
    }
}
