//! One instance of the allocation engine.
//!
//! A [`Heap`] ties the tiers together: it owns a [`PageHeap`] behind the
//! page-heap lock, the lock-free [`PageMap`], and one [`CentralFreeList`] per
//! size class. Thread caches are created on demand, either through a
//! [`ThreadCacheHandle`] or by the process-wide [`TcMalloc`] which keeps one
//! per thread in thread-local storage. Calls made without a thread cache go
//! straight to the central caches.
//!
//! Every allocation served by the page heap directly (large objects, and
//! small objects picked by the sampler) has its stack recorded and sits on
//! the sample registry until it is freed.
//!
//! [`TcMalloc`]: crate::allocators::TcMalloc
//
// # Locking
// Nothing logs while the page-heap lock or a central lock is held. Paths
// that touch the page heap take a `PageHeapStats` before and after and log
// the difference once the guard is gone. A thread whose thread-local
// storage is being torn down logs nothing at all, since the subscriber's own
// thread-locals may already be gone.

use self::util::{align_pages, realloc_bounds};
use crate::central::{CentralFreeList, SpanSource};
use crate::config::{Config, MAX_SIZE, MIN_ALIGN, PAGE_SIZE};
use crate::error::{check, PageError};
use crate::freelist::Chain;
use crate::meta::PagePool;
use crate::page_heap::{PageHeap, PageHeapStats};
use crate::page_source::PageSource;
use crate::pagemap::PageMap;
use crate::size_class::{NUM_CLASSES, SIZE_MAP};
use crate::span::{Span, SpanList};
use crate::stack::StackTrace;
use crate::stats::{property, ClassStats, Snapshot};
use crate::thread_cache::ThreadCache;
use crate::util::{page_of, pages_for, raw_ptr};

use core::cell::Cell;
use core::fmt;
use core::ptr::{copy_nonoverlapping, null_mut, NonNull};
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::{debug, error, instrument, warn, Level};

mod util;

#[cfg(test)]
mod tests;

/// Everything guarded by the page-heap lock.
struct HeapState<S: PageSource> {
    pages: PageHeap<S>,
    stacks: PagePool<StackTrace>,
    caches: PagePool<ThreadCache>,
    /// Head of the list of live thread caches.
    threads: *mut ThreadCache,
    thread_count: usize,
    /// Live sampled spans, linked through `Span::next`.
    sampled: SpanList,
}

// SAFETY: the raw pointers lead into memory owned by the page heap and are
// only followed under the page-heap lock.
unsafe impl<S: PageSource + Send> Send for HeapState<S> {}

impl<S: PageSource> HeapState<S> {
    /// Marks an in-use span as sampled and puts it on the registry.
    unsafe fn record_sample(&mut self, span: *mut Span, trace: &StackTrace) {
        (*span).sample = true;
        // Without room for the trace the sample is still counted.
        if let Ok(stack) = self.pages.alloc_meta(&mut self.stacks) {
            stack.as_ptr().write(*trace);
            (*span).stack = stack.as_ptr();
        }
        self.sampled.push_front(span);
    }

    unsafe fn forget_sample(&mut self, span: *mut Span) {
        self.sampled.remove(span);
        if let Some(stack) = NonNull::new((*span).stack) {
            self.stacks.free(stack);
        }
        (*span).stack = null_mut();
        (*span).sample = false;
    }
}

/// A complete allocation engine over the page source `S`.
pub struct Heap<S: PageSource> {
    state: Mutex<HeapState<S>>,
    pagemap: PageMap,
    central: [CentralFreeList; NUM_CLASSES],
    sample_parameter: AtomicUsize,
    overall_thread_cache_size: AtomicUsize,
    min_per_thread_cache_size: AtomicUsize,
    max_per_thread_cache_size: usize,
    /// Budget handed to every thread cache, see `update_per_thread_limit`.
    per_thread_cache_size: AtomicUsize,
    /// Allocations per class made without a cache, plus the counts of
    /// caches that are gone. Live caches keep their own.
    allocations: [AtomicU64; NUM_CLASSES],
}

impl<S: PageSource> fmt::Debug for Heap<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Heap")
            .field("sample_parameter", &self.sample_parameter)
            .field("per_thread_cache_size", &self.per_thread_cache_size)
            .finish_non_exhaustive()
    }
}

impl<S: PageSource> Heap<S> {
    pub fn new(source: S, config: Config) -> Self {
        let heap = Heap {
            state: Mutex::new(HeapState {
                pages: PageHeap::new(source, &config),
                stacks: PagePool::new(),
                caches: PagePool::new(),
                threads: null_mut(),
                thread_count: 0,
                sampled: SpanList::new(),
            }),
            pagemap: PageMap::new(),
            central: core::array::from_fn(CentralFreeList::new),
            sample_parameter: AtomicUsize::new(config.sample_parameter),
            overall_thread_cache_size: AtomicUsize::new(config.overall_thread_cache_size),
            min_per_thread_cache_size: AtomicUsize::new(config.min_per_thread_cache_size),
            max_per_thread_cache_size: config.max_per_thread_cache_size,
            per_thread_cache_size: AtomicUsize::new(0),
            allocations: core::array::from_fn(|_| AtomicU64::new(0)),
        };
        heap.update_per_thread_limit(0);
        heap
    }

    #[inline]
    fn lock(&self) -> MutexGuard<'_, HeapState<S>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    //---------------client API---------------//

    /// Allocates `size` bytes aligned to at least [`MIN_ALIGN`].
    /// Returns null if memory is exhausted.
    pub fn allocate(&self, size: usize) -> *mut u8 {
        self.alloc_in(None, size)
    }

    /// Frees `ptr`. A null `ptr` is ignored.
    ///
    /// # Safety
    /// `ptr` must be null or a live allocation of this heap.
    pub unsafe fn deallocate(&self, ptr: *mut u8) {
        self.dealloc_in(None, ptr)
    }

    /// Resizes the allocation at `ptr`, moving it if needed.
    ///
    /// A null `ptr` allocates, a zero `size` frees and returns null. On
    /// failure null is returned and `ptr` stays valid.
    ///
    /// # Safety
    /// `ptr` must be null or a live allocation of this heap.
    pub unsafe fn reallocate(&self, ptr: *mut u8, size: usize) -> *mut u8 {
        self.realloc_in(None, ptr, size)
    }

    /// Allocates `size` bytes aligned to `align`, which must be a power of
    /// two. Returns null on failure or on an invalid alignment.
    pub fn aligned_allocate(&self, size: usize, align: usize) -> *mut u8 {
        self.aligned_alloc_in(None, size, align)
    }

    /// Bytes usable at `ptr`: the class size of a small object or the span
    /// length of a page-level one. Zero for null.
    ///
    /// # Safety
    /// `ptr` must be null or a live allocation of this heap.
    pub unsafe fn usable_size(&self, ptr: *const u8) -> usize {
        if ptr.is_null() {
            return 0;
        }
        let span = self.pagemap.get(page_of(ptr));
        check!(!span.is_null(), "size query for a pointer the heap does not own");
        match (*span).sizeclass {
            0 => (*span).bytes(),
            class => SIZE_MAP.size(class),
        }
    }

    /// A thread cache bound to this heap, or `None` if its metadata cannot
    /// be allocated. The cache drains back into the heap when the handle
    /// is dropped.
    pub fn thread_cache(&self) -> Option<ThreadCacheHandle<'_, S>> {
        self.create_cache()
            .map(|cache| ThreadCacheHandle { heap: self, cache })
    }

    //---------------allocation paths---------------//

    pub(crate) fn alloc_in(&self, cache: Option<&mut ThreadCache>, size: usize) -> *mut u8 {
        if size <= MAX_SIZE {
            self.alloc_small(cache, SIZE_MAP.small_class_of(size), size)
        } else {
            match pages_for(size) {
                Some(pages) => self.alloc_pages(size, pages, 1),
                None => null_mut(),
            }
        }
    }

    #[inline(always)]
    fn alloc_small(&self, cache: Option<&mut ThreadCache>, class: usize, size: usize) -> *mut u8 {
        let Some(cache) = cache else {
            let mut chain = self.central[class].remove_range(1, self);
            // SAFETY: the chain was just handed to us by the central cache.
            let p: *mut u8 = raw_ptr(unsafe { chain.pop() }).cast();
            if !p.is_null() {
                self.allocations[class].fetch_add(1, Ordering::Relaxed);
            }
            return p;
        };
        let sample_parameter = self.sample_parameter.load(Ordering::Relaxed);
        let p = if cache.sampler.record_allocation(size, sample_parameter) {
            self.alloc_sampled(class, size)
        } else {
            match cache.pop(class) {
                Some(p) => p.as_ptr(),
                None => raw_ptr(cache.fetch_from_central(class, &self.central[class], self)),
            }
        };
        if !p.is_null() {
            cache.count_allocation(class);
        }
        p
    }

    /// Serves a sampled small object from a span of its own, so that the
    /// sample can be recognised on free.
    #[cold]
    fn alloc_sampled(&self, class: usize, size: usize) -> *mut u8 {
        match pages_for(SIZE_MAP.size(class)) {
            Some(pages) => self.alloc_pages(size, pages, 1),
            None => null_mut(),
        }
    }

    /// Takes a span of `pages` pages straight from the page heap and records
    /// it as a sample of a `size`-byte allocation.
    #[cold]
    fn alloc_pages(&self, size: usize, pages: usize, align_pages: usize) -> *mut u8 {
        // The unwinder may allocate, so the stack is taken before locking.
        let trace = StackTrace::capture(size);
        let (result, before, after) = {
            let mut guard = self.lock();
            let state = &mut *guard;
            let before = state.pages.stats();
            let result = state
                .pages
                .new_aligned_span(&self.pagemap, pages, align_pages);
            if let Ok(span) = result {
                // SAFETY: the span was just handed out and nobody else sees it.
                unsafe { state.record_sample(span, &trace) };
            }
            (result, before, state.pages.stats())
        };
        log_page_heap(&before, &after);
        match result {
            // SAFETY: the span is live.
            Ok(span) => unsafe { (*span).start_addr() },
            Err(err) => {
                log_failure(err, pages);
                null_mut()
            }
        }
    }

    pub(crate) fn aligned_alloc_in(
        &self,
        cache: Option<&mut ThreadCache>,
        size: usize,
        align: usize,
    ) -> *mut u8 {
        if !align.is_power_of_two() {
            return null_mut();
        }
        if align <= MIN_ALIGN {
            return self.alloc_in(cache, size);
        }
        if size <= MAX_SIZE && align <= PAGE_SIZE {
            let class = SIZE_MAP.aligned_class_of(size, align);
            if class != 0 {
                return self.alloc_small(cache, class, size);
            }
        }
        match pages_for(size.max(1)) {
            Some(pages) => self.alloc_pages(size, pages, align_pages(align)),
            None => null_mut(),
        }
    }

    pub(crate) unsafe fn dealloc_in(&self, cache: Option<&mut ThreadCache>, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        let span = self.pagemap.get(page_of(ptr));
        check!(!span.is_null(), "free of a pointer the heap does not own");
        let class = (*span).sizeclass;
        if class == 0 {
            return self.free_pages(span, ptr);
        }
        match cache {
            Some(cache) => {
                if cache.push(ptr, class) {
                    let max_size = self.per_thread_cache_size.load(Ordering::Relaxed);
                    cache.deallocate_slow(class, &self.central, self, max_size);
                }
            }
            None => {
                let mut chain = Chain::empty();
                chain.push(ptr.cast());
                self.central[class].insert_range(chain, self);
            }
        }
    }

    #[cold]
    unsafe fn free_pages(&self, span: *mut Span, ptr: *mut u8) {
        let (before, after) = {
            let mut guard = self.lock();
            let state = &mut *guard;
            check!(!(*span).is_free(), "double free of a page-level allocation");
            check!(
                (*span).start_addr() == ptr,
                "free of an interior pointer of a page-level allocation"
            );
            if (*span).sample {
                state.forget_sample(span);
            }
            let before = state.pages.stats();
            state.pages.delete_span(&self.pagemap, span);
            (before, state.pages.stats())
        };
        log_page_heap(&before, &after);
    }

    pub(crate) unsafe fn realloc_in(
        &self,
        mut cache: Option<&mut ThreadCache>,
        ptr: *mut u8,
        size: usize,
    ) -> *mut u8 {
        if ptr.is_null() {
            return self.alloc_in(cache, size);
        }
        if size == 0 {
            self.dealloc_in(cache, ptr);
            return null_mut();
        }
        let old_size = self.usable_size(ptr);
        let (shrink_below, grow_to) = realloc_bounds(old_size);
        if size <= old_size && size >= shrink_below {
            return ptr;
        }

        // Growing a little asks for a quarter more, so that a series of
        // small steps copies a logarithmic number of times.
        let mut new = null_mut();
        if size > old_size && size < grow_to {
            new = self.alloc_in(cache.as_deref_mut(), grow_to);
        }
        if new.is_null() {
            new = self.alloc_in(cache.as_deref_mut(), size);
        }
        if new.is_null() {
            return null_mut();
        }
        copy_nonoverlapping(ptr, new, old_size.min(size));
        self.dealloc_in(cache, ptr);
        new
    }

    //---------------thread caches---------------//

    /// Creates a thread cache and links it into the list of live caches.
    pub(crate) fn create_cache(&self) -> Option<NonNull<ThreadCache>> {
        let (result, count, limit) = {
            let mut guard = self.lock();
            let state = &mut *guard;
            match state.pages.alloc_meta(&mut state.caches) {
                Ok(cache) => {
                    state.thread_count += 1;
                    let limit = self.update_per_thread_limit(state.thread_count);
                    // SAFETY: the slot is fresh and sized for a cache; the
                    // list is only linked under this lock.
                    unsafe {
                        cache.as_ptr().write(ThreadCache::new(limit));
                        (*cache.as_ptr()).next = state.threads;
                        if !state.threads.is_null() {
                            (*state.threads).prev = cache.as_ptr();
                        }
                    }
                    state.threads = cache.as_ptr();
                    (Ok(cache), state.thread_count, limit)
                }
                Err(err) => (Err(err), state.thread_count, 0),
            }
        };
        match result {
            Ok(cache) => {
                let sample_parameter = self.sample_parameter.load(Ordering::Relaxed);
                // SAFETY: the cache belongs to the caller from here on.
                unsafe {
                    (*cache.as_ptr())
                        .sampler
                        .init(cache.as_ptr() as u64, sample_parameter)
                };
                if !quiet() {
                    debug!(threads = count, per_thread_limit = limit, "Thread cache created.");
                }
                Some(cache)
            }
            Err(err) => {
                log_failure(err, 0);
                None
            }
        }
    }

    /// Drains a thread cache, unlinks it and frees its memory.
    ///
    /// # Safety
    /// `cache` must come from [`create_cache`](Self::create_cache) on this
    /// heap and must not be used afterwards.
    pub(crate) unsafe fn destroy_cache(&self, cache: NonNull<ThreadCache>) {
        let cache = cache.as_ptr();
        (*cache).drain(&self.central, self);
        let count = {
            let mut guard = self.lock();
            let state = &mut *guard;
            let (next, prev) = ((*cache).next, (*cache).prev);
            if !next.is_null() {
                (*next).prev = prev;
            }
            if prev.is_null() {
                state.threads = next;
            } else {
                (*prev).next = next;
            }
            for (class, total) in self.allocations.iter().enumerate() {
                total.fetch_add(ThreadCache::allocations_of(cache, class), Ordering::Relaxed);
            }
            state.thread_count -= 1;
            self.update_per_thread_limit(state.thread_count);
            state.caches.free(NonNull::new_unchecked(cache));
            state.thread_count
        };
        if !quiet() {
            debug!(threads = count, "Thread cache released.");
        }
    }

    /// Splits the overall budget over `threads` caches. Callers hold the
    /// page-heap lock, so the stored value always matches the live count.
    fn update_per_thread_limit(&self, threads: usize) -> usize {
        let overall = self.overall_thread_cache_size.load(Ordering::Relaxed);
        let min = self.min_per_thread_cache_size.load(Ordering::Relaxed);
        let limit = (overall / threads.max(1))
            .min(self.max_per_thread_cache_size)
            .max(min);
        self.per_thread_cache_size.store(limit, Ordering::Relaxed);
        limit
    }

    fn refresh_per_thread_limit(&self) {
        let state = self.lock();
        self.update_per_thread_limit(state.thread_count);
    }

    //---------------statistics and tuning---------------//

    /// Where the heap's memory currently is.
    ///
    /// Central caches are read one at a time before the page-heap lock is
    /// taken, so the snapshot is only exact when the heap is quiescent.
    pub fn stats(&self) -> Snapshot {
        let central_cache_free_bytes: usize =
            self.central.iter().map(CentralFreeList::free_bytes).sum();

        let state = self.lock();
        let pages = state.pages.stats();
        let mut thread_cache_free_bytes = 0;
        let mut cache = state.threads;
        while !cache.is_null() {
            // SAFETY: linked caches stay alive while the lock is held.
            unsafe {
                thread_cache_free_bytes += ThreadCache::size_of(cache);
                cache = (*cache).next;
            }
        }
        let metadata_bytes = state.pages.metadata_bytes();
        let thread_cache_count = state.thread_count;
        drop(state);

        let cached = pages.free_bytes
            + pages.unmapped_bytes
            + central_cache_free_bytes
            + thread_cache_free_bytes;
        Snapshot {
            heap_size: pages.system_bytes,
            current_allocated_bytes: pages.system_bytes.saturating_sub(cached),
            page_heap_free_bytes: pages.free_bytes,
            page_heap_unmapped_bytes: pages.unmapped_bytes,
            central_cache_free_bytes,
            thread_cache_free_bytes,
            metadata_bytes,
            thread_cache_count,
        }
    }

    /// Counters of size class `class`, `None` outside `1..NUM_CLASSES`.
    pub fn class_stats(&self, class: usize) -> Option<ClassStats> {
        if !(1..NUM_CLASSES).contains(&class) {
            return None;
        }
        let mut stats = self.central[class].stats();
        let state = self.lock();
        let mut allocations = self.allocations[class].load(Ordering::Relaxed);
        let mut cache = state.threads;
        while !cache.is_null() {
            // SAFETY: linked caches stay alive while the lock is held.
            unsafe {
                allocations += ThreadCache::allocations_of(cache, class);
                cache = (*cache).next;
            }
        }
        stats.allocations = allocations;
        Some(stats)
    }

    /// Reads a numeric property, see [`property`] for the names.
    pub fn get_numeric_property(&self, name: &str) -> Option<usize> {
        let value = match name {
            property::MAX_TOTAL_THREAD_CACHE_BYTES => {
                self.overall_thread_cache_size.load(Ordering::Relaxed)
            }
            property::MIN_PER_THREAD_CACHE_BYTES => {
                self.min_per_thread_cache_size.load(Ordering::Relaxed)
            }
            property::SAMPLE_PARAMETER => self.sample_parameter.load(Ordering::Relaxed),
            property::AGGRESSIVE_MEMORY_DECOMMIT => {
                self.lock().pages.aggressive_decommit() as usize
            }
            property::RELEASE_RATE => self.lock().pages.release_rate(),
            _ => {
                let stats = self.stats();
                match name {
                    property::CURRENT_ALLOCATED_BYTES => stats.current_allocated_bytes,
                    property::HEAP_SIZE => stats.heap_size,
                    property::SLACK_BYTES => stats.slack_bytes(),
                    property::CURRENT_TOTAL_THREAD_CACHE_BYTES => stats.thread_cache_free_bytes,
                    property::PAGEHEAP_FREE_BYTES => stats.page_heap_free_bytes,
                    property::PAGEHEAP_UNMAPPED_BYTES => stats.page_heap_unmapped_bytes,
                    property::CENTRAL_CACHE_FREE_BYTES => stats.central_cache_free_bytes,
                    property::METADATA_BYTES => stats.metadata_bytes,
                    property::THREAD_CACHE_COUNT => stats.thread_cache_count,
                    _ => return None,
                }
            }
        };
        Some(value)
    }

    /// Changes a writable numeric property. Returns `false` for unknown
    /// or read-only names.
    #[instrument(level = "info", skip(self), ret(level = Level::INFO))]
    pub fn set_numeric_property(&self, name: &str, value: usize) -> bool {
        match name {
            property::MAX_TOTAL_THREAD_CACHE_BYTES => {
                self.overall_thread_cache_size
                    .store(value, Ordering::Relaxed);
                self.refresh_per_thread_limit();
            }
            property::MIN_PER_THREAD_CACHE_BYTES => {
                self.min_per_thread_cache_size
                    .store(value, Ordering::Relaxed);
                self.refresh_per_thread_limit();
            }
            property::SAMPLE_PARAMETER => self.sample_parameter.store(value, Ordering::Relaxed),
            property::AGGRESSIVE_MEMORY_DECOMMIT => {
                self.lock().pages.set_aggressive_decommit(value != 0)
            }
            property::RELEASE_RATE => self.lock().pages.set_release_rate(value),
            _ => return false,
        }
        true
    }

    /// Calls `f(size, stack)` for every live sampled allocation.
    ///
    /// Runs under the page-heap lock: `f` must not allocate from this heap.
    pub fn iterate_sampled(&self, mut f: impl FnMut(usize, &StackTrace)) {
        let state = self.lock();
        for span in state.sampled.iter() {
            // SAFETY: registered spans are in use until freed under the lock.
            unsafe {
                match (*span).stack.as_ref() {
                    Some(stack) => f(stack.size, stack),
                    None => f((*span).bytes(), &StackTrace::empty((*span).bytes())),
                }
            }
        }
    }

    /// Returns at least `pages` free pages to the OS if that many are
    /// backed. Returns the number of pages released.
    #[instrument(level = "debug", skip(self), ret(level = Level::DEBUG))]
    pub fn release_at_least(&self, pages: usize) -> usize {
        let mut state = self.lock();
        state.pages.release_at_least(&self.pagemap, pages)
    }

    /// Verifies the page heap free lists, the page map entries of sampled
    /// spans and the thread cache list.
    pub fn check(&self) -> Result<(), &'static str> {
        let state = self.lock();
        state.pages.check(&self.pagemap)?;
        for span in state.sampled.iter() {
            state.pages.check_in_use(&self.pagemap, span)?;
            // SAFETY: registered spans are live.
            if unsafe { !(*span).sample } {
                return Err("unsampled span in the sample registry");
            }
        }
        let mut count = 0;
        let mut cache = state.threads;
        while !cache.is_null() {
            count += 1;
            // SAFETY: linked caches stay alive while the lock is held.
            cache = unsafe { (*cache).next };
        }
        if count != state.thread_count {
            return Err("thread cache list out of sync");
        }
        Ok(())
    }
}

impl<S: PageSource> SpanSource for Heap<S> {
    fn alloc_span(&self, pages: usize, class: usize) -> Option<*mut Span> {
        let (result, before, after) = {
            let mut state = self.lock();
            let before = state.pages.stats();
            let result = state.pages.new_span(&self.pagemap, pages);
            if let Ok(span) = result {
                state.pages.register_sizeclass(&self.pagemap, span, class);
            }
            (result, before, state.pages.stats())
        };
        log_page_heap(&before, &after);
        result.inspect_err(|err| log_failure(*err, pages)).ok()
    }

    fn release_spans(&self, mut span: *mut Span) {
        let (before, after) = {
            let mut state = self.lock();
            let before = state.pages.stats();
            while !span.is_null() {
                // SAFETY: the central cache hands over live unused spans.
                let next = unsafe { (*span).next };
                state.pages.delete_span(&self.pagemap, span);
                span = next;
            }
            (before, state.pages.stats())
        };
        log_page_heap(&before, &after);
    }

    #[inline(always)]
    fn span_of(&self, p: *const u8) -> *mut Span {
        self.pagemap.get(page_of(p))
    }
}

thread_local! {
    static QUIET: Cell<bool> = const { Cell::new(false) };
}

/// Stops the calling thread from emitting events for the rest of its life.
pub(crate) fn silence_thread() {
    QUIET.set(true);
}

#[inline]
fn quiet() -> bool {
    QUIET.get()
}

fn log_page_heap(before: &PageHeapStats, after: &PageHeapStats) {
    if quiet() {
        return;
    }
    if after.system_bytes > before.system_bytes {
        debug!(
            grown_by = after.system_bytes - before.system_bytes,
            heap_size = after.system_bytes,
            "Heap grown."
        );
    }
    if after.released_bytes > before.released_bytes {
        debug!(
            released = after.released_bytes - before.released_bytes,
            unmapped = after.unmapped_bytes,
            "Pages released to the OS."
        );
    }
}

fn log_failure(err: PageError, pages: usize) {
    if quiet() {
        return;
    }
    match err {
        PageError::OutOfMemory => warn!(pages, "Allocation failure, no memory."),
        PageError::CapacityExhausted => error!(pages, "Allocation failure, page map is full."),
    }
}

/// A thread cache of a [`Heap`], for use by one thread.
///
/// Allocations made through the handle may be freed through the heap or
/// another handle of the same heap, and the other way round.
pub struct ThreadCacheHandle<'a, S: PageSource> {
    heap: &'a Heap<S>,
    cache: NonNull<ThreadCache>,
}

impl<'a, S: PageSource> ThreadCacheHandle<'a, S> {
    pub fn heap(&self) -> &'a Heap<S> {
        self.heap
    }

    /// Bytes held by the cache.
    pub fn cached_bytes(&self) -> usize {
        // SAFETY: the handle owns the cache.
        unsafe { self.cache.as_ref().size() }
    }

    pub fn allocate(&mut self, size: usize) -> *mut u8 {
        let heap = self.heap;
        // SAFETY: the handle owns the cache.
        heap.alloc_in(Some(unsafe { self.cache.as_mut() }), size)
    }

    pub fn aligned_allocate(&mut self, size: usize, align: usize) -> *mut u8 {
        let heap = self.heap;
        // SAFETY: as above.
        heap.aligned_alloc_in(Some(unsafe { self.cache.as_mut() }), size, align)
    }

    /// # Safety
    /// See [`Heap::deallocate`].
    pub unsafe fn deallocate(&mut self, ptr: *mut u8) {
        let heap = self.heap;
        heap.dealloc_in(Some(self.cache.as_mut()), ptr)
    }

    /// # Safety
    /// See [`Heap::reallocate`].
    pub unsafe fn reallocate(&mut self, ptr: *mut u8, size: usize) -> *mut u8 {
        let heap = self.heap;
        heap.realloc_in(Some(self.cache.as_mut()), ptr, size)
    }
}

impl<S: PageSource> Drop for ThreadCacheHandle<'_, S> {
    fn drop(&mut self) {
        // SAFETY: the cache was created by this heap and dies with the handle.
        unsafe { self.heap.destroy_cache(self.cache) }
    }
}
