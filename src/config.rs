//! Compile-time constants and the boot-time [`Config`] record.
//!
//! Page size and minimum alignment are fixed when the crate is built (see the
//! `page-*` and `align-16` cargo features), everything else is chosen when an
//! engine instance is created.

use static_assertions::const_assert;

#[cfg(feature = "page-4k")]
pub const PAGE_SHIFT: usize = 12;
#[cfg(all(feature = "page-16k", not(feature = "page-4k")))]
pub const PAGE_SHIFT: usize = 14;
#[cfg(all(
    feature = "page-32k",
    not(any(feature = "page-4k", feature = "page-16k"))
))]
pub const PAGE_SHIFT: usize = 15;
#[cfg(not(any(feature = "page-4k", feature = "page-16k", feature = "page-32k")))]
pub const PAGE_SHIFT: usize = 13;

/// Size in bytes of one allocator page.
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

#[cfg(feature = "align-16")]
pub const MIN_ALIGN_SHIFT: usize = 4;
#[cfg(not(feature = "align-16"))]
pub const MIN_ALIGN_SHIFT: usize = 3;

/// Smallest alignment of any returned pointer and the first size quantum.
pub const MIN_ALIGN: usize = 1 << MIN_ALIGN_SHIFT;

/// The size quantum never grows past this.
pub const MAX_QUANTUM_SHIFT: usize = 8;

/// Largest request served from the size-class caches.
pub const MAX_SIZE: usize = 32 * 1024;

/// Spans shorter than this many pages live on per-length free lists,
/// longer ones on the address-ordered large list.
pub const MAX_PAGES: usize = (1 << 20) >> PAGE_SHIFT;

/// Upper bound on a thread-cache list's dynamic maximum length.
pub const MAX_DYNAMIC_FREE_LIST_LENGTH: usize = 8192;

/// Times a list may overflow its max length before the max length shrinks.
pub const MAX_OVERAGES: usize = 3;

pub const DEFAULT_SAMPLE_PARAMETER: usize = 512 * 1024;
pub const DEFAULT_OVERALL_THREAD_CACHE_SIZE: usize = 32 << 20;
pub const DEFAULT_MIN_PER_THREAD_CACHE_SIZE: usize = 2 * MAX_SIZE;
pub const DEFAULT_MAX_PER_THREAD_CACHE_SIZE: usize = 4 << 20;
pub const DEFAULT_MIN_SYSTEM_ALLOC_PAGES: usize = (1 << 20) >> PAGE_SHIFT;

/// Pages freed before the page heap releases a span when `release_rate` is 1.
pub const DEFAULT_RELEASE_DELAY: i64 = 1 << 18;
pub const MAX_RELEASE_DELAY: i64 = 1 << 20;

/// Virtual address bits covered by the page map.
pub const ADDRESS_BITS: usize = 48;

const_assert!(PAGE_SHIFT >= 12 && PAGE_SHIFT <= 15);
const_assert!(MIN_ALIGN_SHIFT == 3 || MIN_ALIGN_SHIFT == 4);
const_assert!(MAX_SIZE.is_power_of_two());
const_assert!(MAX_SIZE < MAX_PAGES * PAGE_SIZE);
const_assert!(MAX_QUANTUM_SHIFT > MIN_ALIGN_SHIFT);

/// Boot-time tunables of one engine instance.
///
/// The numeric property interface can change most of these later, the
/// record only supplies the starting values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Mean number of bytes between sampled allocations. Zero disables
    /// sampling of small objects.
    pub sample_parameter: usize,
    /// Budget shared by all thread caches.
    pub overall_thread_cache_size: usize,
    /// Lower clamp of the per-thread budget.
    pub min_per_thread_cache_size: usize,
    /// Upper clamp of the per-thread budget.
    pub max_per_thread_cache_size: usize,
    /// Release pages to the OS on every page-heap free.
    pub aggressive_decommit: bool,
    /// Relative speed of incremental release, zero disables it.
    pub release_rate: usize,
    /// Smallest heap growth, in pages.
    pub min_system_alloc_pages: usize,
    /// Opaque value handed to the page source for VM annotation.
    pub page_source_tag: u32,
}

impl Config {
    pub const fn new() -> Self {
        Config {
            sample_parameter: DEFAULT_SAMPLE_PARAMETER,
            overall_thread_cache_size: DEFAULT_OVERALL_THREAD_CACHE_SIZE,
            min_per_thread_cache_size: DEFAULT_MIN_PER_THREAD_CACHE_SIZE,
            max_per_thread_cache_size: DEFAULT_MAX_PER_THREAD_CACHE_SIZE,
            aggressive_decommit: false,
            release_rate: 1,
            min_system_alloc_pages: DEFAULT_MIN_SYSTEM_ALLOC_PAGES,
            page_source_tag: 0,
        }
    }

    pub const fn with_sample_parameter(mut self, bytes: usize) -> Self {
        self.sample_parameter = bytes;
        self
    }

    pub const fn with_overall_thread_cache_size(mut self, bytes: usize) -> Self {
        self.overall_thread_cache_size = bytes;
        self
    }

    pub const fn with_min_per_thread_cache_size(mut self, bytes: usize) -> Self {
        self.min_per_thread_cache_size = bytes;
        self
    }

    pub const fn with_aggressive_decommit(mut self, enabled: bool) -> Self {
        self.aggressive_decommit = enabled;
        self
    }

    pub const fn with_release_rate(mut self, rate: usize) -> Self {
        self.release_rate = rate;
        self
    }

    pub const fn with_min_system_alloc_pages(mut self, pages: usize) -> Self {
        self.min_system_alloc_pages = if pages == 0 { 1 } else { pages };
        self
    }

    pub const fn with_page_source_tag(mut self, tag: u32) -> Self {
        self.page_source_tag = tag;
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Config::new()
    }
}
