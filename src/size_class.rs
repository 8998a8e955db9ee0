//! The size classifier.
//!
//! Small requests are rounded up to one of a fixed set of object sizes. The
//! sizes are generated by stepping from [`MIN_ALIGN`] with a quantum that is
//! [`MIN_ALIGN`] up to 128 bytes and then an eighth of the enclosing power of
//! two, capped at `1 << MAX_QUANTUM_SHIFT`. That keeps the per-object waste of
//! any class of 64 bytes or more under 12.5%.
//!
//! Lookups are two table loads keyed by `floor(log2(bytes - 1))`:
//!
//! ```text
//! class = base[lg] + ((bytes - 1) >> shift[lg])
//! ```
//!
//! All tables are computed by `const fn`, so [`SIZE_MAP`] is immutable and
//! needs no runtime initialization.

use crate::config::{MAX_QUANTUM_SHIFT, MAX_SIZE, MIN_ALIGN, MIN_ALIGN_SHIFT, PAGE_SIZE};
use crate::util::floor_log2;

use static_assertions::const_assert;

/// Number of class indices, including the sentinel class 0.
pub const NUM_CLASSES: usize = count_classes() + 1;

/// Number of `floor(log2(bytes - 1))` buckets needed to cover `1..=MAX_SIZE`.
const LOG_SLOTS: usize = floor_log2(MAX_SIZE - 1) + 1;

/// Bytes a thread cache moves per refill, before clamping.
const TARGET_BATCH_BYTES: usize = 64 * 1024;
const MIN_BATCH: usize = 2;
const MAX_BATCH: usize = 32;

const_assert!(NUM_CLASSES < u16::MAX as usize);

/// Log2 of the size quantum used for sizes in `(2^lg, 2^(lg + 1)]`.
const fn quantum_shift(lg: usize) -> usize {
    let s = lg.saturating_sub(3);
    if s < MIN_ALIGN_SHIFT {
        MIN_ALIGN_SHIFT
    } else if s > MAX_QUANTUM_SHIFT {
        MAX_QUANTUM_SHIFT
    } else {
        s
    }
}

/// The class size following `size`.
const fn next_size(size: usize) -> usize {
    size + (1 << quantum_shift(floor_log2(size)))
}

const fn count_classes() -> usize {
    let mut count = 0;
    let mut size = MIN_ALIGN;
    while size <= MAX_SIZE {
        count += 1;
        size = next_size(size);
    }
    count
}

/// Static description of one size class.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClassInfo {
    /// Bytes handed out per object.
    pub size: usize,
    /// Pages in a span carved for this class.
    pub pages: usize,
    /// Objects moved between a thread cache and the central cache at once.
    pub batch: usize,
    /// Objects carved from one span.
    pub objects: usize,
}

impl ClassInfo {
    const EMPTY: ClassInfo = ClassInfo {
        size: 0,
        pages: 0,
        batch: 0,
        objects: 0,
    };

    const fn for_size(size: usize) -> ClassInfo {
        let mut batch = TARGET_BATCH_BYTES / size;
        if batch < MIN_BATCH {
            batch = MIN_BATCH;
        }
        if batch > MAX_BATCH {
            batch = MAX_BATCH;
        }

        // Smallest span whose carve leftover stays under an eighth of the
        // span and that still holds a whole batch.
        let mut span_bytes = 0;
        loop {
            span_bytes += PAGE_SIZE;
            while span_bytes % size > span_bytes >> 3 {
                span_bytes += PAGE_SIZE;
            }
            if span_bytes / size >= batch {
                break;
            }
        }

        ClassInfo {
            size,
            pages: span_bytes / PAGE_SIZE,
            batch,
            objects: span_bytes / size,
        }
    }
}

/// Size-class tables.
pub struct SizeMap {
    base: [usize; LOG_SLOTS],
    shift: [u32; LOG_SLOTS],
    info: [ClassInfo; NUM_CLASSES],
}

/// The tables every engine instance shares.
pub static SIZE_MAP: SizeMap = SizeMap::new();

impl SizeMap {
    pub const fn new() -> Self {
        let mut info = [ClassInfo::EMPTY; NUM_CLASSES];
        let mut class = 1;
        let mut size = MIN_ALIGN;
        while size <= MAX_SIZE {
            info[class] = ClassInfo::for_size(size);
            class += 1;
            size = next_size(size);
        }

        let mut base = [0; LOG_SLOTS];
        let mut shift = [0; LOG_SLOTS];
        let mut lg = 0;
        while lg < LOG_SLOTS {
            let s = quantum_shift(lg);
            // The first request of this bucket is 2^lg + 1 bytes.
            let first = Self::search(&info, (1 << lg) + 1);
            base[lg] = first - ((1 << lg) >> s);
            shift[lg] = s as u32;
            lg += 1;
        }

        SizeMap { base, shift, info }
    }

    /// Smallest class holding `bytes`, by linear search.
    const fn search(info: &[ClassInfo; NUM_CLASSES], bytes: usize) -> usize {
        let mut class = 1;
        while class < NUM_CLASSES && info[class].size < bytes {
            class += 1;
        }
        class
    }

    /// Class serving a request of `bytes`, or 0 if it is not cacheable.
    #[inline]
    pub fn class_of(&self, bytes: usize) -> usize {
        if bytes > MAX_SIZE {
            return 0;
        }
        self.small_class_of(bytes)
    }

    /// Class serving a request of `bytes`, which must not exceed [`MAX_SIZE`].
    #[inline(always)]
    pub fn small_class_of(&self, bytes: usize) -> usize {
        debug_assert!(bytes <= MAX_SIZE);
        let n = bytes.saturating_sub(1);
        let lg = floor_log2(n | 1);
        self.base[lg] + (n >> self.shift[lg])
    }

    /// Smallest class holding `bytes` whose objects are all `align`-aligned,
    /// or 0 if there is none.
    pub fn aligned_class_of(&self, bytes: usize, align: usize) -> usize {
        debug_assert!(align.is_power_of_two());
        let mut class = self.class_of(bytes.max(align));
        if class == 0 {
            return 0;
        }
        // Spans start on a page boundary, so an object size that is a
        // multiple of `align` keeps every object aligned.
        while class < NUM_CLASSES {
            if self.info[class].size % align == 0 {
                return class;
            }
            class += 1;
        }
        0
    }

    #[inline(always)]
    pub fn info(&self, class: usize) -> &ClassInfo {
        &self.info[class]
    }

    #[inline(always)]
    pub fn size(&self, class: usize) -> usize {
        self.info[class].size
    }

    #[inline(always)]
    pub fn pages(&self, class: usize) -> usize {
        self.info[class].pages
    }

    #[inline(always)]
    pub fn batch(&self, class: usize) -> usize {
        self.info[class].batch
    }
}

impl Default for SizeMap {
    fn default() -> Self {
        SizeMap::new()
    }
}
