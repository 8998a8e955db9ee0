//! Defines the intrusive object [`FreeList`] and the [`Chain`] batches moved
//! between caches.
//!
//! A free object stores the link to the next free object in its own first
//! word, so lists need no memory besides the objects themselves. Every class
//! size is a multiple of [`MIN_ALIGN`](crate::config::MIN_ALIGN), which is at
//! least pointer sized.

use core::mem::{align_of, size_of};
use core::ptr::{null_mut, NonNull};

use static_assertions::const_assert;

use crate::config::MIN_ALIGN;

/// The first word of a free object.
#[repr(C)]
pub struct FreeObject {
    pub next: *mut FreeObject,
}

const_assert!(size_of::<FreeObject>() <= MIN_ALIGN);
const_assert!(align_of::<FreeObject>() <= MIN_ALIGN);

/// Reads the link stored in `obj`.
///
/// # Safety
/// `obj` must point to a free object.
#[inline(always)]
pub unsafe fn next_of(obj: *mut FreeObject) -> *mut FreeObject {
    (*obj).next
}

/// Overwrites the first word of `obj` with a link to `next`.
///
/// # Safety
/// `obj` must point to at least one writable, suitably aligned word that
/// nothing else uses.
#[inline(always)]
pub unsafe fn set_next(obj: *mut FreeObject, next: *mut FreeObject) {
    obj.write(FreeObject { next });
}

/// A null-terminated run of linked free objects.
#[derive(Debug, Clone, Copy)]
pub struct Chain {
    pub head: *mut FreeObject,
    pub tail: *mut FreeObject,
    pub count: usize,
}

impl Chain {
    pub const fn empty() -> Self {
        Chain {
            head: null_mut(),
            tail: null_mut(),
            count: 0,
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Adds a single object to the front of the chain.
    ///
    /// # Safety
    /// Same as [`set_next`].
    #[inline]
    pub unsafe fn push(&mut self, obj: *mut FreeObject) {
        set_next(obj, self.head);
        if self.tail.is_null() {
            self.tail = obj;
        }
        self.head = obj;
        self.count += 1;
    }

    /// Detaches the first object.
    ///
    /// # Safety
    /// The chain must be well formed.
    #[inline]
    pub unsafe fn pop(&mut self) -> Option<NonNull<FreeObject>> {
        let obj = NonNull::new(self.head)?;
        self.head = next_of(obj.as_ptr());
        self.count -= 1;
        if self.count == 0 {
            self.tail = null_mut();
        }
        Some(obj)
    }
}

/// A per-class LIFO owned by one thread cache.
///
/// Besides the objects, the list tracks the bookkeeping that drives refill
/// and drain decisions: its low-water mark since the last scavenge, its
/// dynamic maximum length, and how often it overflowed that maximum.
#[derive(Debug)]
pub struct FreeList {
    head: *mut FreeObject,
    length: usize,
    lowater: usize,
    max_length: usize,
    length_overages: usize,
}

impl FreeList {
    /// Creates an empty list with a maximum length of one.
    #[inline]
    pub const fn new() -> Self {
        FreeList {
            head: null_mut(),
            length: 0,
            lowater: 0,
            max_length: 1,
            length_overages: 0,
        }
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.head.is_null()
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.length
    }

    #[inline(always)]
    pub fn lowater(&self) -> usize {
        self.lowater
    }

    #[inline(always)]
    pub fn clear_lowater(&mut self) {
        self.lowater = self.length;
    }

    #[inline(always)]
    pub fn max_length(&self) -> usize {
        self.max_length
    }

    #[inline(always)]
    pub fn set_max_length(&mut self, max_length: usize) {
        self.max_length = max_length;
    }

    #[inline(always)]
    pub fn length_overages(&self) -> usize {
        self.length_overages
    }

    #[inline(always)]
    pub fn set_length_overages(&mut self, overages: usize) {
        self.length_overages = overages;
    }

    /// Pushes the object at `p` onto the list. *O*(1).
    ///
    /// # Safety
    /// `p` must point to a free object of this list's class that is not on
    /// any other list.
    #[inline(always)]
    pub unsafe fn push(&mut self, p: *mut u8) {
        let obj: *mut FreeObject = p.cast();
        set_next(obj, self.head);
        self.head = obj;
        self.length += 1;
    }

    /// Pops the most recently pushed object. *O*(1).
    #[inline(always)]
    pub fn pop(&mut self) -> Option<NonNull<u8>> {
        let obj = NonNull::new(self.head)?;
        // SAFETY: every object on the list was linked by `push` or
        // `push_chain`.
        self.head = unsafe { next_of(obj.as_ptr()) };
        self.length -= 1;
        if self.length < self.lowater {
            self.lowater = self.length;
        }
        Some(obj.cast())
    }

    /// Splices a whole chain onto the front of the list.
    ///
    /// # Safety
    /// `chain` must be well formed and its objects on no other list.
    pub unsafe fn push_chain(&mut self, chain: Chain) {
        if chain.is_empty() {
            return;
        }
        set_next(chain.tail, self.head);
        self.head = chain.head;
        self.length += chain.count;
    }

    /// Detaches the first `n` objects (or all of them if there are fewer).
    pub fn pop_chain(&mut self, n: usize) -> Chain {
        let n = n.min(self.length);
        if n == 0 {
            return Chain::empty();
        }
        let head = self.head;
        let mut tail = head;
        // SAFETY: the list holds at least `n` linked objects.
        unsafe {
            for _ in 1..n {
                tail = next_of(tail);
            }
            self.head = next_of(tail);
            set_next(tail, null_mut());
        }
        self.length -= n;
        if self.length < self.lowater {
            self.lowater = self.length;
        }
        Chain {
            head,
            tail,
            count: n,
        }
    }
}

impl Default for FreeList {
    fn default() -> Self {
        FreeList::new()
    }
}
