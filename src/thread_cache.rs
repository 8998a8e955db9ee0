//! The per-thread cache: the allocation fast path.
//!
//! A [`ThreadCache`] is owned by exactly one thread and holds one
//! [`FreeList`] per size class. Only its total size and its allocation
//! counts are read by other threads (for statistics), which is why those
//! fields are atomic.
//!
//! List lengths adapt to demand. A list's `max_length` starts at one and
//! grows by one per refill until it reaches the class batch size, then by
//! whole batches up to [`MAX_DYNAMIC_FREE_LIST_LENGTH`]. A list that keeps
//! overflowing, or that stays long while nobody uses it, shrinks again.

use core::ptr::{null_mut, NonNull};
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::central::{CentralFreeList, SpanSource};
use crate::config::{MAX_DYNAMIC_FREE_LIST_LENGTH, MAX_OVERAGES};
use crate::freelist::FreeList;
use crate::sampler::Sampler;
use crate::size_class::{NUM_CLASSES, SIZE_MAP};

pub struct ThreadCache {
    lists: [FreeList; NUM_CLASSES],
    /// Bytes cached. Written only by the owner.
    size: AtomicUsize,
    max_size: usize,
    /// Allocations served per class. Written only by the owner.
    allocations: [AtomicU64; NUM_CLASSES],
    pub(crate) sampler: Sampler,
    /// Siblings on the engine's list of live caches.
    pub(crate) next: *mut ThreadCache,
    pub(crate) prev: *mut ThreadCache,
}

impl ThreadCache {
    pub fn new(max_size: usize) -> Self {
        ThreadCache {
            lists: core::array::from_fn(|_| FreeList::new()),
            size: AtomicUsize::new(0),
            max_size,
            allocations: core::array::from_fn(|_| AtomicU64::new(0)),
            sampler: Sampler::new(),
            next: null_mut(),
            prev: null_mut(),
        }
    }

    /// Bytes currently cached.
    #[inline(always)]
    pub fn size(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    /// Reads the size of a cache owned by another thread without forming a
    /// reference to it.
    ///
    /// # Safety
    /// `cache` must point to a live thread cache.
    pub(crate) unsafe fn size_of(cache: *const ThreadCache) -> usize {
        (*core::ptr::addr_of!((*cache).size)).load(Ordering::Relaxed)
    }

    /// Counts one allocation of `class` served on behalf of the owner.
    #[inline(always)]
    pub fn count_allocation(&self, class: usize) {
        let count = &self.allocations[class];
        count.store(count.load(Ordering::Relaxed) + 1, Ordering::Relaxed);
    }

    /// Reads the allocation count of `class` of a cache owned by another
    /// thread.
    ///
    /// # Safety
    /// `cache` must point to a live thread cache.
    pub(crate) unsafe fn allocations_of(cache: *const ThreadCache, class: usize) -> u64 {
        (*core::ptr::addr_of!((*cache).allocations))[class].load(Ordering::Relaxed)
    }

    #[inline(always)]
    fn add_size(&self, bytes: usize) {
        self.size.store(self.size() + bytes, Ordering::Relaxed);
    }

    #[inline(always)]
    fn sub_size(&self, bytes: usize) {
        self.size.store(self.size() - bytes, Ordering::Relaxed);
    }

    #[cfg(test)]
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    #[cfg(test)]
    pub fn list(&self, class: usize) -> &FreeList {
        &self.lists[class]
    }

    /// Pops an object of `class`, or `None` if the list is empty.
    #[inline(always)]
    pub fn pop(&mut self, class: usize) -> Option<NonNull<u8>> {
        let obj = self.lists[class].pop()?;
        self.sub_size(SIZE_MAP.size(class));
        Some(obj)
    }

    /// Pushes a freed object of `class`. Returns `true` if the cache must
    /// drain, see [`ThreadCache::deallocate_slow`].
    ///
    /// # Safety
    /// `p` must be a free object of `class` that is on no list.
    #[inline(always)]
    #[must_use]
    pub unsafe fn push(&mut self, p: *mut u8, class: usize) -> bool {
        let list = &mut self.lists[class];
        list.push(p);
        let too_long = list.len() > list.max_length();
        self.add_size(SIZE_MAP.size(class));
        too_long || self.size() > self.max_size
    }

    /// Refills the list of `class` from the central cache and returns one
    /// object, or `None` if memory is exhausted.
    pub fn fetch_from_central<S: SpanSource + ?Sized>(
        &mut self,
        class: usize,
        central: &CentralFreeList,
        src: &S,
    ) -> Option<NonNull<u8>> {
        let batch = SIZE_MAP.batch(class);
        let list = &mut self.lists[class];
        let wanted = list.max_length().min(batch);
        let mut chain = central.remove_range(wanted, src);
        // SAFETY: the chain was just handed to us by the central cache.
        let first = unsafe { chain.pop()? };
        let fetched = chain.count;
        // SAFETY: as above.
        unsafe { list.push_chain(chain) };

        if list.max_length() < batch {
            list.set_max_length(list.max_length() + 1);
        } else {
            let new_length = (list.max_length() + batch).min(MAX_DYNAMIC_FREE_LIST_LENGTH);
            list.set_max_length(new_length - new_length % batch);
        }
        self.add_size(fetched * SIZE_MAP.size(class));
        Some(first.cast())
    }

    /// Drains after [`push`](Self::push) reported an overflow.
    pub fn deallocate_slow<S: SpanSource + ?Sized>(
        &mut self,
        class: usize,
        centrals: &[CentralFreeList],
        src: &S,
        max_size: usize,
    ) {
        let list = &self.lists[class];
        if list.len() > list.max_length() {
            self.list_too_long(class, &centrals[class], src);
        }
        if self.size() > self.max_size {
            self.scavenge(centrals, src, max_size);
        }
    }

    fn list_too_long<S: SpanSource + ?Sized>(
        &mut self,
        class: usize,
        central: &CentralFreeList,
        src: &S,
    ) {
        let batch = SIZE_MAP.batch(class);
        self.release_to_central(class, batch, central, src);

        let list = &mut self.lists[class];
        if list.max_length() < batch {
            list.set_max_length(list.max_length() + 1);
        } else if list.max_length() > batch {
            list.set_length_overages(list.length_overages() + 1);
            if list.length_overages() > MAX_OVERAGES {
                list.set_max_length(list.max_length() - batch);
                list.set_length_overages(0);
            }
        }
    }

    /// Hands `n` objects (at most the list length) of `class` back to the
    /// central cache, one batch at a time.
    fn release_to_central<S: SpanSource + ?Sized>(
        &mut self,
        class: usize,
        n: usize,
        central: &CentralFreeList,
        src: &S,
    ) {
        let batch = SIZE_MAP.batch(class);
        let list = &mut self.lists[class];
        let n = n.min(list.len());
        let mut left = n;
        while left > 0 {
            let chain = list.pop_chain(left.min(batch));
            left -= chain.count;
            // SAFETY: objects on our lists were handed out by `central`.
            unsafe { central.insert_range(chain, src) };
        }
        self.sub_size(n * SIZE_MAP.size(class));
    }

    /// Returns half of what each list left unused since the last scavenge
    /// and adopts `max_size` as the new budget.
    pub fn scavenge<S: SpanSource + ?Sized>(
        &mut self,
        centrals: &[CentralFreeList],
        src: &S,
        max_size: usize,
    ) {
        for class in 1..NUM_CLASSES {
            let lowater = self.lists[class].lowater();
            if lowater > 0 {
                let drop = if lowater > 1 { lowater / 2 } else { 1 };
                self.release_to_central(class, drop, &centrals[class], src);

                let batch = SIZE_MAP.batch(class);
                let list = &mut self.lists[class];
                if list.max_length() > batch {
                    list.set_max_length((list.max_length() - batch).max(batch));
                }
            }
            self.lists[class].clear_lowater();
        }
        self.max_size = max_size;
    }

    /// Returns every cached object to the central caches.
    pub fn drain<S: SpanSource + ?Sized>(&mut self, centrals: &[CentralFreeList], src: &S) {
        for class in 1..NUM_CLASSES {
            let len = self.lists[class].len();
            if len > 0 {
                self.release_to_central(class, len, &centrals[class], src);
            }
        }
        debug_assert_eq!(self.size(), 0);
    }
}
