//! [`PageSource`] trait and structures that implement it.
//!
//! A page source is the only way the engine obtains address space. Swapping
//! it lets tests run an engine over a fixed arena or over a source that
//! fails on demand.

use core::ptr::{null_mut, NonNull};

use crate::config::PAGE_SIZE;
use crate::util::{align_up, checked_add, find_aligned};

/// A supplier of page-aligned, zero-filled virtual memory.
///
/// # Safety
/// * memory returned by `acquire` must stay valid and must not be handed out
///   again for as long as the source lives; moving the source must not
///   invalidate it.
/// * freshly acquired memory, and memory read back after a successful
///   `release`, must read as zero.
pub unsafe trait PageSource {
    /// Acquires at least `pages` pages aligned to [`PAGE_SIZE`].
    /// Returns the base and the number of pages actually obtained,
    /// or `Err(())` if the OS has nothing left.
    ///
    /// # Safety
    /// `pages` must be nonzero.
    unsafe fn acquire(&mut self, pages: usize) -> Result<(NonNull<u8>, usize), ()>;

    /// Advises that the contents of `pages` pages at `base` may be
    /// discarded. Returns whether the advice was taken.
    ///
    /// # Safety
    /// The range must have been obtained from `acquire` and must not be in
    /// use.
    unsafe fn release(&mut self, base: NonNull<u8>, pages: usize) -> bool;

    /// Sets the opaque tag attached to subsequently acquired mappings.
    fn set_tag(&mut self, _tag: u32) {}
}

unsafe impl<T: PageSource + ?Sized> PageSource for &mut T {
    unsafe fn acquire(&mut self, pages: usize) -> Result<(NonNull<u8>, usize), ()> {
        (**self).acquire(pages)
    }

    unsafe fn release(&mut self, base: NonNull<u8>, pages: usize) -> bool {
        (**self).release(base, pages)
    }

    fn set_tag(&mut self, tag: u32) {
        (**self).set_tag(tag)
    }
}

/// Gives the kernel the go-ahead to drop the backing of an anonymous range.
unsafe fn discard(base: NonNull<u8>, pages: usize) -> bool {
    libc::madvise(base.as_ptr().cast(), pages * PAGE_SIZE, libc::MADV_DONTNEED) == 0
}

fn os_page_size() -> usize {
    // SAFETY: sysconf has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 {
        4096
    } else {
        size as usize
    }
}

/// A page source backed by anonymous private mappings.
#[derive(Debug)]
pub struct MmapSource {
    tag: u32,
}

impl MmapSource {
    #[inline(always)]
    pub const fn new() -> Self {
        MmapSource { tag: 0 }
    }

    #[cfg(target_os = "macos")]
    fn tag_fd(&self) -> libc::c_int {
        // VM_MAKE_TAG
        ((self.tag & 0xff) << 24) as libc::c_int
    }

    #[cfg(not(target_os = "macos"))]
    fn tag_fd(&self) -> libc::c_int {
        -1
    }

    unsafe fn map(&self, size: usize) -> *mut u8 {
        #[cfg(target_os = "linux")]
        let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE;
        #[cfg(not(target_os = "linux"))]
        let flags = libc::MAP_PRIVATE | libc::MAP_ANON;

        let ptr = libc::mmap(
            null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            flags,
            self.tag_fd(),
            0,
        );
        if ptr == libc::MAP_FAILED {
            null_mut()
        } else {
            ptr.cast()
        }
    }
}

impl Default for MmapSource {
    fn default() -> Self {
        MmapSource::new()
    }
}

unsafe impl PageSource for MmapSource {
    unsafe fn acquire(&mut self, pages: usize) -> Result<(NonNull<u8>, usize), ()> {
        let size = pages.checked_mul(PAGE_SIZE).ok_or(())?;
        let os_page = os_page_size();
        if os_page >= PAGE_SIZE {
            let size = align_up(size, os_page);
            let base = NonNull::new(self.map(size)).ok_or(())?;
            return Ok((base, size / PAGE_SIZE));
        }

        // Over-map and trim so the result is aligned to our larger page.
        let slack = PAGE_SIZE - os_page;
        let raw = self.map(size.checked_add(slack).ok_or(())?);
        if raw.is_null() {
            return Err(());
        }
        let aligned = find_aligned(raw, PAGE_SIZE).ok_or(())? as *mut u8;
        let prefix = aligned as usize - raw as usize;
        if prefix > 0 {
            libc::munmap(raw.cast(), prefix);
        }
        let suffix = slack - prefix;
        if suffix > 0 {
            libc::munmap(aligned.add(size).cast(), suffix);
        }
        Ok((NonNull::new_unchecked(aligned), pages))
    }

    unsafe fn release(&mut self, base: NonNull<u8>, pages: usize) -> bool {
        discard(base, pages)
    }

    fn set_tag(&mut self, tag: u32) {
        self.tag = tag;
    }
}

/// A page source that moves the end of the process's data segment with
/// [`libc::brk`].
///
/// Only one such source may exist per process, and nothing else may move
/// the program break while it is in use.
#[derive(Debug)]
pub struct SbrkSource {
    heap_end: Option<NonNull<u8>>,
}

impl SbrkSource {
    #[inline(always)]
    pub const fn new() -> Self {
        SbrkSource { heap_end: None }
    }
}

impl Default for SbrkSource {
    fn default() -> Self {
        SbrkSource::new()
    }
}

unsafe impl PageSource for SbrkSource {
    unsafe fn acquire(&mut self, pages: usize) -> Result<(NonNull<u8>, usize), ()> {
        let size = pages.checked_mul(PAGE_SIZE).ok_or(())?;
        let current = libc::sbrk(0);
        if current as isize == -1 {
            return Err(());
        }
        debug_assert!(self.heap_end.map_or(true, |end| end.as_ptr() <= current.cast()));
        let base = find_aligned(current.cast(), PAGE_SIZE).ok_or(())? as *mut u8;
        let new_end = checked_add(base, size).ok_or(())? as *mut u8;
        if libc::brk(new_end.cast()) == -1 {
            return Err(());
        }
        self.heap_end = NonNull::new(new_end);
        Ok((NonNull::new(base).ok_or(())?, pages))
    }

    unsafe fn release(&mut self, base: NonNull<u8>, pages: usize) -> bool {
        discard(base, pages)
    }
}

#[cfg(test)]
pub mod testing {
    //! Page sources for tests.

    use super::PageSource;
    use crate::config::PAGE_SIZE;
    use core::ptr::NonNull;
    use std::alloc::{alloc_zeroed, dealloc, Layout};

    /// An inherently unsafe source that hands out pages of one owned,
    /// fixed-size buffer. Released pages are zeroed to mimic the OS.
    pub struct ArenaSource {
        buf: *mut u8,
        layout: Layout,
        used_pages: usize,
        pub acquire_calls: usize,
        pub released_pages: usize,
    }

    unsafe impl Send for ArenaSource {}

    impl ArenaSource {
        /// Creates an arena of `pages` pages.
        pub fn new(pages: usize) -> Self {
            let layout = Layout::from_size_align(pages * PAGE_SIZE, PAGE_SIZE).unwrap();
            let buf = unsafe { alloc_zeroed(layout) };
            assert!(!buf.is_null(), "could not allocate the test arena");
            ArenaSource {
                buf,
                layout,
                used_pages: 0,
                acquire_calls: 0,
                released_pages: 0,
            }
        }

        pub fn total_pages(&self) -> usize {
            self.layout.size() / PAGE_SIZE
        }

        pub fn used_pages(&self) -> usize {
            self.used_pages
        }
    }

    impl Drop for ArenaSource {
        fn drop(&mut self) {
            unsafe { dealloc(self.buf, self.layout) }
        }
    }

    unsafe impl PageSource for ArenaSource {
        unsafe fn acquire(&mut self, pages: usize) -> Result<(NonNull<u8>, usize), ()> {
            self.acquire_calls += 1;
            if pages > self.total_pages() - self.used_pages {
                return Err(());
            }
            let base = self.buf.add(self.used_pages * PAGE_SIZE);
            self.used_pages += pages;
            Ok((NonNull::new(base).ok_or(())?, pages))
        }

        unsafe fn release(&mut self, base: NonNull<u8>, pages: usize) -> bool {
            base.as_ptr().write_bytes(0, pages * PAGE_SIZE);
            self.released_pages += pages;
            true
        }
    }

    /// Wraps a source and fails its first `failures` acquisitions.
    pub struct FlakySource<S> {
        pub inner: S,
        pub failures: usize,
        pub failed: usize,
    }

    impl<S: PageSource> FlakySource<S> {
        pub fn new(inner: S, failures: usize) -> Self {
            FlakySource {
                inner,
                failures,
                failed: 0,
            }
        }
    }

    /// Wraps a source and fails every acquisition after the first `grants`.
    pub struct CappedSource<S> {
        pub inner: S,
        pub grants: usize,
    }

    impl<S: PageSource> CappedSource<S> {
        pub fn new(inner: S, grants: usize) -> Self {
            CappedSource { inner, grants }
        }
    }

    unsafe impl<S: PageSource> PageSource for CappedSource<S> {
        unsafe fn acquire(&mut self, pages: usize) -> Result<(NonNull<u8>, usize), ()> {
            if self.grants == 0 {
                return Err(());
            }
            self.grants -= 1;
            self.inner.acquire(pages)
        }

        unsafe fn release(&mut self, base: NonNull<u8>, pages: usize) -> bool {
            self.inner.release(base, pages)
        }
    }

    unsafe impl<S: PageSource> PageSource for FlakySource<S> {
        unsafe fn acquire(&mut self, pages: usize) -> Result<(NonNull<u8>, usize), ()> {
            if self.failed < self.failures {
                self.failed += 1;
                return Err(());
            }
            self.inner.acquire(pages)
        }

        unsafe fn release(&mut self, base: NonNull<u8>, pages: usize) -> bool {
            self.inner.release(base, pages)
        }
    }
}
