//! Allocation of the engine's own bookkeeping.
//!
//! Spans, stack traces, thread caches and page-map nodes cannot come from
//! the heap they describe. They are bump-allocated from chunks taken straight
//! from the page source and recycled through typed [`PagePool`]s. Neither
//! ever gives memory back.

use core::marker::PhantomData;
use core::mem::{align_of, size_of};
use core::ptr::{null_mut, NonNull};

use crate::config::PAGE_SIZE;
use crate::error::PageError;
use crate::freelist::{next_of, set_next, FreeObject};
use crate::page_source::PageSource;
use crate::util::{find_aligned, pages_for};

/// Bytes requested from the page source per metadata chunk.
const CHUNK_BYTES: usize = 128 * 1024;

/// A bump allocator over chunks of the page source.
#[derive(Debug)]
pub struct MetaArena {
    area: *mut u8,
    avail: usize,
    bytes: usize,
}

unsafe impl Send for MetaArena {}

impl MetaArena {
    pub const fn new() -> Self {
        MetaArena {
            area: null_mut(),
            avail: 0,
            bytes: 0,
        }
    }

    /// Bytes obtained from the page source for metadata so far.
    #[inline]
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    /// Returns `size` zeroed bytes aligned to `align`.
    ///
    /// # Safety
    /// `align` must be a power of two no larger than [`PAGE_SIZE`].
    pub unsafe fn alloc<S: PageSource + ?Sized>(
        &mut self,
        source: &mut S,
        size: usize,
        align: usize,
    ) -> Result<NonNull<u8>, PageError> {
        debug_assert!(align.is_power_of_two() && align <= PAGE_SIZE);
        let mut pad = match find_aligned(self.area, align) {
            Some(p) if !self.area.is_null() => p as usize - self.area as usize,
            _ => usize::MAX,
        };
        if pad == usize::MAX || pad + size > self.avail {
            let pages = pages_for(size.max(CHUNK_BYTES)).ok_or(PageError::OutOfMemory)?;
            let (base, got) = source
                .acquire(pages)
                .map_err(|_| PageError::OutOfMemory)?;
            self.area = base.as_ptr();
            self.avail = got * PAGE_SIZE;
            self.bytes += got * PAGE_SIZE;
            pad = 0;
        }
        let p = self.area.add(pad);
        self.area = p.add(size);
        self.avail -= pad + size;
        p.write_bytes(0, size);
        Ok(NonNull::new_unchecked(p))
    }
}

impl Default for MetaArena {
    fn default() -> Self {
        MetaArena::new()
    }
}

/// A free list of `T`-sized slots carved from a [`MetaArena`].
///
/// Slots come back uninitialized, apart from being zeroed the first time.
pub struct PagePool<T> {
    free: *mut FreeObject,
    live: usize,
    _marker: PhantomData<T>,
}

unsafe impl<T> Send for PagePool<T> {}

impl<T> PagePool<T> {
    const SLOT_SIZE: usize = if size_of::<T>() > size_of::<FreeObject>() {
        size_of::<T>()
    } else {
        size_of::<FreeObject>()
    };
    const SLOT_ALIGN: usize = if align_of::<T>() > align_of::<FreeObject>() {
        align_of::<T>()
    } else {
        align_of::<FreeObject>()
    };

    pub const fn new() -> Self {
        PagePool {
            free: null_mut(),
            live: 0,
            _marker: PhantomData,
        }
    }

    /// Slots currently handed out.
    #[cfg(test)]
    pub fn live(&self) -> usize {
        self.live
    }

    /// Takes a slot, carving a new one from `arena` if none is free.
    ///
    /// # Safety
    /// `arena` and `source` must be the ones this pool always uses.
    pub unsafe fn alloc<S: PageSource + ?Sized>(
        &mut self,
        arena: &mut MetaArena,
        source: &mut S,
    ) -> Result<NonNull<T>, PageError> {
        let slot = match NonNull::new(self.free) {
            Some(slot) => {
                self.free = next_of(slot.as_ptr());
                slot.cast()
            }
            None => arena.alloc(source, Self::SLOT_SIZE, Self::SLOT_ALIGN)?,
        };
        self.live += 1;
        Ok(slot.cast())
    }

    /// Returns a slot to the pool. The value in it is not dropped.
    ///
    /// # Safety
    /// `p` must come from this pool's `alloc` and not be used afterwards.
    pub unsafe fn free(&mut self, p: NonNull<T>) {
        debug_assert!(self.live > 0);
        let obj: *mut FreeObject = p.as_ptr().cast();
        set_next(obj, self.free);
        self.free = obj;
        self.live -= 1;
    }
}

impl<T> Default for PagePool<T> {
    fn default() -> Self {
        PagePool::new()
    }
}
