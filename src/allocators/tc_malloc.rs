//! The process-wide allocator.
//!
//! [`TcMalloc`] is a handle to one lazily created [`Heap`] over
//! [`MmapSource`]. Every thread gets its own thread cache on its first
//! allocation; the cache drains back into the heap when the thread exits or
//! calls [`TcMalloc::mark_thread_idle`].
//!
//! ```no_run
//! use rusty_tcmalloc::TcMalloc;
//!
//! #[global_allocator]
//! static ALLOCATOR: TcMalloc = TcMalloc;
//!
//! fn main() {
//!     let v: Vec<u32> = vec![1, 2, 3];
//!     println!("{v:?}");
//! }
//! ```
//
// Nested calls (an allocation made by a subscriber while this thread is
// inside the engine, or by another thread-local destructor after ours ran)
// skip the thread cache and go to the central caches directly.

use crate::allocators::heap::{silence_thread, Heap};
use crate::config::{Config, MIN_ALIGN};
use crate::page_source::MmapSource;
use crate::thread_cache::ThreadCache;

use core::alloc::{GlobalAlloc, Layout};
use core::cell::Cell;
use core::ptr::{copy_nonoverlapping, null_mut, NonNull};
use std::sync::OnceLock;

#[cfg(feature = "allocator-api")]
use core::alloc::{AllocError, Allocator};

static HEAP: OnceLock<Heap<MmapSource>> = OnceLock::new();

thread_local! {
    static CACHE: Cell<*mut ThreadCache> = const { Cell::new(null_mut()) };
    /// Set while this thread is inside the engine.
    static BUSY: Cell<bool> = const { Cell::new(false) };
    /// Set once the thread's destructors have released its cache.
    static DEAD: Cell<bool> = const { Cell::new(false) };
    static OWNER: CacheOwner = const { CacheOwner };
}

/// Releases the thread's cache when thread-local storage is torn down.
struct CacheOwner;

impl Drop for CacheOwner {
    fn drop(&mut self) {
        silence_thread();
        DEAD.set(true);
        release_cache();
    }
}

fn release_cache() {
    if BUSY.replace(true) {
        return;
    }
    if let Some(cache) = NonNull::new(CACHE.replace(null_mut())) {
        // SAFETY: the cache came from this heap and is no longer reachable.
        unsafe { heap().destroy_cache(cache) };
    }
    BUSY.set(false);
}

#[inline(always)]
fn heap() -> &'static Heap<MmapSource> {
    HEAP.get_or_init(|| Heap::new(MmapSource::new(), Config::new()))
}

/// Runs `f` with the calling thread's cache, creating it if needed. Nested
/// calls and calls from threads whose cache is gone get `None`.
#[inline(always)]
fn with_cache<R>(f: impl FnOnce(&'static Heap<MmapSource>, Option<&mut ThreadCache>) -> R) -> R {
    let heap = heap();
    if BUSY.replace(true) {
        return f(heap, None);
    }
    let mut cache = CACHE.get();
    if cache.is_null() && !DEAD.get() {
        cache = create_cache(heap);
    }
    // SAFETY: the cache is owned by this thread, and BUSY keeps nested
    // calls away from it.
    let result = f(heap, unsafe { cache.as_mut() });
    BUSY.set(false);
    result
}

#[cold]
fn create_cache(heap: &'static Heap<MmapSource>) -> *mut ThreadCache {
    let Some(cache) = heap.create_cache() else {
        return null_mut();
    };
    CACHE.set(cache.as_ptr());
    // Touching the owner registers its destructor.
    if OWNER.try_with(|_| ()).is_err() {
        CACHE.set(null_mut());
        DEAD.set(true);
        // SAFETY: the cache was never handed out.
        unsafe { heap.destroy_cache(cache) };
        return null_mut();
    }
    cache.as_ptr()
}

/// The process-wide thread-caching allocator.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcMalloc;

impl TcMalloc {
    /// Creates the engine with `config`. Returns `false` if it already
    /// exists, in which case `config` is ignored.
    pub fn init_with(config: Config) -> bool {
        let mut fresh = false;
        HEAP.get_or_init(|| {
            fresh = true;
            Heap::new(MmapSource::new(), config)
        });
        fresh
    }

    /// The engine, for statistics, properties and the sample stream.
    pub fn heap() -> &'static Heap<MmapSource> {
        heap()
    }

    /// Hands the calling thread's cached objects back and frees its cache.
    /// The next allocation on this thread creates a new one.
    pub fn mark_thread_idle() {
        release_cache();
    }

    pub fn allocate(&self, size: usize) -> *mut u8 {
        with_cache(|heap, cache| heap.alloc_in(cache, size))
    }

    pub fn aligned_allocate(&self, size: usize, align: usize) -> *mut u8 {
        with_cache(|heap, cache| heap.aligned_alloc_in(cache, size, align))
    }

    /// # Safety
    /// `ptr` must be null or a live allocation of this allocator.
    pub unsafe fn deallocate(&self, ptr: *mut u8) {
        with_cache(|heap, cache| heap.dealloc_in(cache, ptr))
    }

    /// # Safety
    /// See [`Heap::reallocate`].
    pub unsafe fn reallocate(&self, ptr: *mut u8, size: usize) -> *mut u8 {
        with_cache(|heap, cache| heap.realloc_in(cache, ptr, size))
    }

    /// # Safety
    /// `ptr` must be null or a live allocation of this allocator.
    pub unsafe fn usable_size(&self, ptr: *const u8) -> usize {
        heap().usable_size(ptr)
    }
}

//---------------impl GlobalAlloc for TcMalloc---------------//

unsafe impl GlobalAlloc for TcMalloc {
    #[inline]
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() <= MIN_ALIGN {
            self.allocate(layout.size())
        } else {
            self.aligned_allocate(layout.size(), layout.align())
        }
    }

    #[inline]
    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        self.deallocate(ptr)
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let p = self.alloc(layout);
        if !p.is_null() {
            p.write_bytes(0, layout.size());
        }
        p
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() <= MIN_ALIGN {
            return self.reallocate(ptr, new_size);
        }
        if new_size <= self.usable_size(ptr) && new_size >= layout.size() / 2 {
            return ptr;
        }
        let new = self.aligned_allocate(new_size, layout.align());
        if !new.is_null() {
            copy_nonoverlapping(ptr, new, layout.size().min(new_size));
            self.deallocate(ptr);
        }
        new
    }
}

//---------------impl Allocator for TcMalloc---------------//

#[cfg(feature = "allocator-api")]
unsafe impl Allocator for TcMalloc {
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        if layout.size() == 0 {
            // SAFETY: alignments are nonzero.
            let dangling = unsafe { NonNull::new_unchecked(layout.align() as *mut u8) };
            return Ok(NonNull::slice_from_raw_parts(dangling, 0));
        }
        // SAFETY: the layout has a nonzero size.
        let p = NonNull::new(unsafe { GlobalAlloc::alloc(self, layout) }).ok_or(AllocError)?;
        // SAFETY: `p` was just allocated.
        let len = unsafe { self.usable_size(p.as_ptr()) };
        Ok(NonNull::slice_from_raw_parts(p, len))
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        if layout.size() != 0 {
            TcMalloc::deallocate(self, ptr.as_ptr())
        }
    }
}
