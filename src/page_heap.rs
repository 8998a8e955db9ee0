//! The page heap: owner of every page obtained from the page source.
//!
//! Free spans shorter than [`MAX_PAGES`] pages sit on per-length lists, longer
//! ones on two address-ordered "large" lists. Each length has a normal list
//! (pages backed) and a returned list (pages given back to the OS); returned
//! spans are reused last.
//!
//! A [`PageHeap`] is plain data guarded by the engine's page-heap lock, so
//! nothing in here locks, and nothing in here logs: a subscriber that
//! allocates could re-enter the engine while the lock is held. Callers
//! compare [`PageHeapStats`] before and after an operation and log once the
//! lock is released.

use core::ptr::{null_mut, NonNull};

use crate::config::{Config, DEFAULT_RELEASE_DELAY, MAX_PAGES, MAX_RELEASE_DELAY, PAGE_SIZE};
use crate::error::{check, PageError};
use crate::meta::{MetaArena, PagePool};
use crate::page_source::PageSource;
use crate::pagemap::PageMap;
use crate::span::{Span, SpanList, SpanState};
use crate::util::{page_of, PageId};

/// Byte counters of a page heap.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageHeapStats {
    /// Bytes of span memory obtained from the page source.
    pub system_bytes: usize,
    /// Bytes in free spans whose pages are backed.
    pub free_bytes: usize,
    /// Bytes in free spans whose pages were released to the OS.
    pub unmapped_bytes: usize,
    /// Successful heap growths.
    pub reserve_count: usize,
    /// Bytes ever released to the OS.
    pub released_bytes: usize,
    /// Bytes acquired by a growth that could not be tracked, handed straight
    /// back to the source.
    pub abandoned_bytes: usize,
}

#[derive(Debug, Default)]
struct SpanLists {
    normal: SpanList,
    returned: SpanList,
}

/// The page-level allocator. See the [module docs](self).
pub struct PageHeap<S: PageSource> {
    source: S,
    meta: MetaArena,
    spans: PagePool<Span>,
    /// `free[n]` holds free spans of exactly `n` pages, `free[0]` is unused.
    free: [SpanLists; MAX_PAGES],
    large: SpanLists,
    stats: PageHeapStats,
    scavenge_counter: i64,
    /// Next list `release_at_least` takes a span from; `MAX_PAGES` stands
    /// for the large list.
    release_index: usize,
    aggressive_decommit: bool,
    release_rate: usize,
    min_system_alloc_pages: usize,
}

impl<S: PageSource> PageHeap<S> {
    pub fn new(mut source: S, config: &Config) -> Self {
        source.set_tag(config.page_source_tag);
        PageHeap {
            source,
            meta: MetaArena::new(),
            spans: PagePool::new(),
            free: core::array::from_fn(|_| SpanLists::default()),
            large: SpanLists::default(),
            stats: PageHeapStats::default(),
            scavenge_counter: DEFAULT_RELEASE_DELAY,
            release_index: 0,
            aggressive_decommit: config.aggressive_decommit,
            release_rate: config.release_rate,
            min_system_alloc_pages: config.min_system_alloc_pages.max(1),
        }
    }

    #[inline]
    pub fn stats(&self) -> PageHeapStats {
        self.stats
    }

    /// Bytes of page-source memory spent on bookkeeping.
    #[inline]
    pub fn metadata_bytes(&self) -> usize {
        self.meta.bytes()
    }

    /// Span descriptors currently alive.
    #[cfg(test)]
    pub fn span_count(&self) -> usize {
        self.spans.live()
    }

    pub fn aggressive_decommit(&self) -> bool {
        self.aggressive_decommit
    }

    pub fn set_aggressive_decommit(&mut self, enabled: bool) {
        self.aggressive_decommit = enabled;
    }

    pub fn release_rate(&self) -> usize {
        self.release_rate
    }

    pub fn set_release_rate(&mut self, rate: usize) {
        self.release_rate = rate;
    }

    /// Takes a metadata object out of `pool`, feeding it from this heap's
    /// metadata arena.
    pub fn alloc_meta<T>(&mut self, pool: &mut PagePool<T>) -> Result<NonNull<T>, PageError> {
        // SAFETY: every pool of the engine is fed from this one arena.
        unsafe { pool.alloc(&mut self.meta, &mut self.source) }
    }

    //---------------span allocation---------------//

    /// Returns an in-use span of exactly `n` pages.
    pub fn new_span(&mut self, map: &PageMap, n: usize) -> Result<*mut Span, PageError> {
        check!(n > 0, "zero-page span requested");
        if let Some(span) = self.search_free_and_large(map, n)? {
            return Ok(span);
        }
        self.grow(map, n)?;
        self.search_free_and_large(map, n)?
            .ok_or(PageError::OutOfMemory)
    }

    /// Returns an in-use span of `n` pages whose first page is a multiple of
    /// `align_pages`. The over-allocated prefix and suffix go back to the
    /// free lists.
    pub fn new_aligned_span(
        &mut self,
        map: &PageMap,
        n: usize,
        align_pages: usize,
    ) -> Result<*mut Span, PageError> {
        debug_assert!(align_pages.is_power_of_two());
        if align_pages <= 1 {
            return self.new_span(map, n);
        }
        let total = n
            .checked_add(align_pages - 1)
            .ok_or(PageError::OutOfMemory)?;
        let mut span = self.new_span(map, total)?;
        // SAFETY: `span` is a live in-use span owned by this heap.
        unsafe {
            let start = (*span).start;
            let skip = start.next_multiple_of(align_pages) - start;
            if skip > 0 {
                let rest = match self.split(map, span, skip) {
                    Ok(rest) => rest,
                    Err(e) => {
                        self.delete_span(map, span);
                        return Err(e);
                    }
                };
                self.delete_span(map, span);
                span = rest;
            }
            if (*span).length > n {
                // The aligned span is usable as is if the suffix cannot be cut.
                if let Ok(suffix) = self.split(map, span, n) {
                    self.delete_span(map, suffix);
                }
            }
        }
        Ok(span)
    }

    fn search_free_and_large(
        &mut self,
        map: &PageMap,
        n: usize,
    ) -> Result<Option<*mut Span>, PageError> {
        for len in n..MAX_PAGES {
            let lists = &self.free[len];
            let span = if !lists.normal.is_empty() {
                lists.normal.head()
            } else if !lists.returned.is_empty() {
                lists.returned.head()
            } else {
                continue;
            };
            return self.carve(map, span, n).map(Some);
        }
        self.allocate_large(map, n)
    }

    /// Best fit among the large spans, lowest address first among equals.
    fn allocate_large(&mut self, map: &PageMap, n: usize) -> Result<Option<*mut Span>, PageError> {
        let mut best: *mut Span = null_mut();
        // SAFETY: spans on the free lists are live.
        unsafe {
            for span in self.large.normal.iter().chain(self.large.returned.iter()) {
                let len = (*span).length;
                if len < n {
                    continue;
                }
                if best.is_null()
                    || len < (*best).length
                    || (len == (*best).length && (*span).start < (*best).start)
                {
                    best = span;
                }
            }
        }
        if best.is_null() {
            return Ok(None);
        }
        self.carve(map, best, n).map(Some)
    }

    /// Cuts `n` pages off the front of the free `span` and re-homes the rest.
    fn carve(&mut self, map: &PageMap, span: *mut Span, n: usize) -> Result<*mut Span, PageError> {
        // SAFETY: `span` is on a free list of this heap.
        unsafe {
            debug_assert!((*span).is_free());
            debug_assert!((*span).length >= n);
            let extra = (*span).length - n;
            // Allocate the leftover's descriptor first so failure leaves the
            // heap untouched.
            let leftover = match extra {
                0 => null_mut(),
                _ => self.new_span_object((*span).start + n, extra)?,
            };
            let old_state = (*span).state;
            self.remove_from_free_list(span);
            (*span).state = SpanState::InUse;
            if !leftover.is_null() {
                (*leftover).state = old_state;
                self.record_span(map, leftover);
                self.prepend_to_free_list(leftover);
                (*span).length = n;
                map.set((*span).last_page(), span);
            }
            Ok(span)
        }
    }

    /// Cuts the in-use `span` into an `n`-page prefix (kept in `span`) and
    /// a remainder, returned as a new in-use span.
    pub fn split(&mut self, map: &PageMap, span: *mut Span, n: usize) -> Result<*mut Span, PageError> {
        // SAFETY: `span` is a live in-use span owned by this heap.
        unsafe {
            check!(!(*span).is_free(), "split of a free span");
            check!(n > 0 && n < (*span).length, "split outside of span");
            let rest = self.new_span_object((*span).start + n, (*span).length - n)?;
            self.record_span(map, rest);
            (*span).length = n;
            map.set((*span).last_page(), span);
            Ok(rest)
        }
    }

    /// Marks `span` as carved for `class` and maps every interior page to it,
    /// so a pointer anywhere inside resolves to the span.
    pub fn register_sizeclass(&mut self, map: &PageMap, span: *mut Span, class: usize) {
        // SAFETY: `span` is a live in-use span owned by this heap.
        unsafe {
            check!(!(*span).is_free(), "size class registered on a free span");
            (*span).sizeclass = class;
            for page in (*span).start + 1..(*span).last_page() {
                map.set(page, span);
            }
        }
    }

    //---------------span release---------------//

    /// Returns an in-use span to the free lists, merging it with free
    /// neighbours.
    pub fn delete_span(&mut self, map: &PageMap, span: *mut Span) {
        // SAFETY: `span` is a live span owned by this heap.
        unsafe {
            check!(!(*span).is_free(), "free of a span that is already free");
            let n = (*span).length;
            (*span).sizeclass = 0;
            (*span).sample = false;
            (*span).stack = null_mut();
            (*span).objects = null_mut();
            (*span).refcount = 0;
            (*span).state = SpanState::OnNormalFreelist;
            self.merge_into_free_list(map, span);
            self.incremental_scavenge(map, n);
        }
    }

    unsafe fn merge_into_free_list(&mut self, map: &PageMap, span: *mut Span) {
        debug_assert!((*span).is_free());
        if self.aggressive_decommit
            && (*span).state == SpanState::OnNormalFreelist
            && self.release_pages((*span).start, (*span).length)
        {
            (*span).state = SpanState::OnReturnedFreelist;
        }

        // Only boundary entries are kept current, interior entries of the
        // merged pieces may go stale.
        let start = (*span).start;
        let len = (*span).length;
        if start > 0 {
            let prev = map.get(start - 1);
            if !prev.is_null() && (*prev).is_free() {
                debug_assert_eq!((*prev).last_page() + 1, start);
                self.remove_from_free_list(prev);
                self.reconcile(span, prev);
                (*span).start = (*prev).start;
                (*span).length += (*prev).length;
                self.free_span_object(prev);
                map.set((*span).start, span);
            }
        }
        let next = map.get(start + len);
        if !next.is_null() && (*next).is_free() {
            debug_assert_eq!((*next).start, start + len);
            self.remove_from_free_list(next);
            self.reconcile(span, next);
            (*span).length += (*next).length;
            self.free_span_object(next);
            map.set((*span).last_page(), span);
        }
        self.prepend_to_free_list(span);
    }

    /// Gives `span` the state the merge of `span` and `other` must have.
    /// A backed piece next to a returned one is released so the merged span
    /// is uniformly returned, unless the source refuses.
    unsafe fn reconcile(&mut self, span: *mut Span, other: *mut Span) {
        if (*span).state == (*other).state {
            return;
        }
        let normal = match (*span).state {
            SpanState::OnNormalFreelist => span,
            _ => other,
        };
        (*span).state = if self.release_pages((*normal).start, (*normal).length) {
            SpanState::OnReturnedFreelist
        } else {
            SpanState::OnNormalFreelist
        };
    }

    unsafe fn lists_for(&mut self, span: *mut Span) -> (&mut SpanList, bool) {
        let large = (*span).length >= MAX_PAGES;
        let lists = match large {
            true => &mut self.large,
            false => &mut self.free[(*span).length],
        };
        match (*span).state {
            SpanState::OnNormalFreelist => (&mut lists.normal, large),
            SpanState::OnReturnedFreelist => (&mut lists.returned, large),
            SpanState::InUse => crate::error::fatal("in-use span on a free list"),
        }
    }

    unsafe fn prepend_to_free_list(&mut self, span: *mut Span) {
        let bytes = (*span).bytes();
        match (*span).state {
            SpanState::OnNormalFreelist => self.stats.free_bytes += bytes,
            _ => self.stats.unmapped_bytes += bytes,
        }
        let (list, large) = self.lists_for(span);
        match large {
            true => list.insert_ordered(span),
            false => list.push_front(span),
        }
    }

    unsafe fn remove_from_free_list(&mut self, span: *mut Span) {
        let bytes = (*span).bytes();
        match (*span).state {
            SpanState::OnNormalFreelist => self.stats.free_bytes -= bytes,
            _ => self.stats.unmapped_bytes -= bytes,
        }
        let (list, _) = self.lists_for(span);
        list.remove(span);
    }

    //---------------release to the OS---------------//

    fn release_pages(&mut self, start: PageId, len: usize) -> bool {
        let Some(base) = NonNull::new(crate::util::page_addr(start)) else {
            return false;
        };
        // SAFETY: the range belongs to a free span of this heap.
        let released = unsafe { self.source.release(base, len) };
        if released {
            self.stats.released_bytes += len * PAGE_SIZE;
        }
        released
    }

    /// Releases one backed free span. Returns its length, or 0 if the source
    /// refused.
    unsafe fn release_span(&mut self, map: &PageMap, span: *mut Span) -> usize {
        let len = (*span).length;
        self.remove_from_free_list(span);
        if self.release_pages((*span).start, len) {
            (*span).state = SpanState::OnReturnedFreelist;
            self.merge_into_free_list(map, span);
            len
        } else {
            self.prepend_to_free_list(span);
            0
        }
    }

    /// Releases backed free spans to the OS, round robin over the lists,
    /// until at least `num_pages` pages were released or nothing backed is
    /// left. Returns the number of pages released.
    pub fn release_at_least(&mut self, map: &PageMap, num_pages: usize) -> usize {
        let mut released = 0;
        while released < num_pages && self.stats.free_bytes > 0 {
            let mut i = 0;
            while i <= MAX_PAGES && released < num_pages {
                if self.release_index > MAX_PAGES {
                    self.release_index = 0;
                }
                let span = match self.release_index {
                    MAX_PAGES => self.large.normal.head(),
                    index => self.free[index].normal.tail(),
                };
                i += 1;
                self.release_index += 1;
                if span.is_null() {
                    continue;
                }
                // SAFETY: `span` is on a free list of this heap.
                let len = unsafe { self.release_span(map, span) };
                if len == 0 {
                    return released;
                }
                released += len;
            }
        }
        released
    }

    /// Counts `n` freed pages toward the next incremental release.
    fn incremental_scavenge(&mut self, map: &PageMap, n: usize) {
        if self.release_rate == 0 {
            self.scavenge_counter = DEFAULT_RELEASE_DELAY;
            return;
        }
        self.scavenge_counter -= n as i64;
        if self.scavenge_counter >= 0 {
            return;
        }
        let released = self.release_at_least(map, 1);
        self.scavenge_counter = match released {
            0 => DEFAULT_RELEASE_DELAY,
            _ => {
                // Wait 1000 / rate freed pages per released page.
                let wait = (released as i64).saturating_mul(1000) / self.release_rate as i64;
                wait.min(MAX_RELEASE_DELAY)
            }
        };
    }

    //---------------growth---------------//

    fn grow(&mut self, map: &PageMap, n: usize) -> Result<(), PageError> {
        let ask = n.max(self.min_system_alloc_pages);
        // SAFETY: `ask` and `n` are nonzero.
        let acquired = match unsafe { self.source.acquire(ask) } {
            Ok(region) => Ok(region),
            Err(()) if ask > n => unsafe { self.source.acquire(n) },
            Err(()) => Err(()),
        };
        let (base, got) = acquired.map_err(|_| PageError::OutOfMemory)?;
        let start = page_of(base.as_ptr());

        let meta = &mut self.meta;
        let source = &mut self.source;
        let mut starved = false;
        // SAFETY: node layouts are small and page aligned at most.
        let covered = map.ensure(start, got, |size, align| {
            let node = unsafe { meta.alloc(source, size, align).ok() };
            starved |= node.is_none();
            node
        });
        if !covered {
            self.abandon(base, got);
            return Err(match starved {
                true => PageError::OutOfMemory,
                false => PageError::CapacityExhausted,
            });
        }

        let span = match self.new_span_object(start, got) {
            Ok(span) => span,
            Err(err) => {
                self.abandon(base, got);
                return Err(err);
            }
        };
        self.stats.system_bytes += got * PAGE_SIZE;
        self.stats.reserve_count += 1;
        // SAFETY: `span` is a fresh descriptor for pages nobody else owns.
        unsafe {
            self.record_span(map, span);
            (*span).state = SpanState::OnNormalFreelist;
            self.merge_into_free_list(map, span);
        }
        Ok(())
    }

    /// Gives the memory of a region the heap cannot track back to the
    /// source. Its addresses stay reserved.
    fn abandon(&mut self, base: NonNull<u8>, pages: usize) {
        // SAFETY: the region was just acquired and nothing points into it.
        unsafe { self.source.release(base, pages) };
        self.stats.abandoned_bytes += pages * PAGE_SIZE;
    }

    //---------------descriptors---------------//

    fn new_span_object(&mut self, start: PageId, length: usize) -> Result<*mut Span, PageError> {
        let slot = self.alloc_span_slot()?;
        // SAFETY: `slot` is an unused pool slot.
        unsafe { slot.as_ptr().write(Span::new(start, length)) };
        Ok(slot.as_ptr())
    }

    fn alloc_span_slot(&mut self) -> Result<NonNull<Span>, PageError> {
        // SAFETY: the span pool is fed from this heap's arena only.
        unsafe { self.spans.alloc(&mut self.meta, &mut self.source) }
    }

    unsafe fn free_span_object(&mut self, span: *mut Span) {
        self.spans.free(NonNull::new_unchecked(span));
    }

    /// Maps the first and last page of `span`.
    unsafe fn record_span(&self, map: &PageMap, span: *mut Span) {
        check!(map.set((*span).start, span), "page map does not cover span");
        map.set((*span).last_page(), span);
    }

    //---------------verification---------------//

    /// Walks every free list and verifies list membership, page-map
    /// boundaries, coalescing and the byte counters.
    pub fn check(&self, map: &PageMap) -> Result<(), &'static str> {
        let mut free_bytes = 0;
        let mut unmapped_bytes = 0;
        let all = self
            .free
            .iter()
            .enumerate()
            .map(|(len, lists)| (Some(len), lists))
            .chain(core::iter::once((None, &self.large)));
        for (len, lists) in all {
            for (list, state) in [
                (&lists.normal, SpanState::OnNormalFreelist),
                (&lists.returned, SpanState::OnReturnedFreelist),
            ] {
                let mut prev_start = None;
                for span in list.iter() {
                    // SAFETY: spans on the free lists are live.
                    let span_ref = unsafe { &*span };
                    if span_ref.state != state {
                        return Err("span state does not match its list");
                    }
                    match len {
                        Some(len) if span_ref.length != len => {
                            return Err("span on the wrong length list")
                        }
                        None if span_ref.length < MAX_PAGES => {
                            return Err("small span on the large list")
                        }
                        None if prev_start.is_some_and(|p| p > span_ref.start) => {
                            return Err("large list out of address order")
                        }
                        _ => {}
                    }
                    prev_start = Some(span_ref.start);
                    if map.get(span_ref.start) != span || map.get(span_ref.last_page()) != span {
                        return Err("free span boundary not mapped to span");
                    }
                    let before = match span_ref.start {
                        0 => null_mut(),
                        start => map.get(start - 1),
                    };
                    let after = map.get(span_ref.last_page() + 1);
                    for neighbour in [before, after] {
                        // SAFETY: mapped boundary pages resolve to live spans.
                        if !neighbour.is_null() && unsafe { (*neighbour).is_free() } {
                            return Err("adjacent free spans not merged");
                        }
                    }
                    match state {
                        SpanState::OnNormalFreelist => free_bytes += span_ref.bytes(),
                        _ => unmapped_bytes += span_ref.bytes(),
                    }
                }
            }
        }
        if free_bytes != self.stats.free_bytes || unmapped_bytes != self.stats.unmapped_bytes {
            return Err("free byte counters out of sync");
        }
        if free_bytes + unmapped_bytes > self.stats.system_bytes {
            return Err("more free bytes than system bytes");
        }
        Ok(())
    }

    /// Verifies that every page of an in-use `span` the page map must know
    /// about resolves to it.
    pub fn check_in_use(&self, map: &PageMap, span: *mut Span) -> Result<(), &'static str> {
        // SAFETY: the caller passes a live span.
        let span_ref = unsafe { &*span };
        if span_ref.is_free() {
            return Err("span expected in use");
        }
        let (first, last) = (span_ref.start, span_ref.last_page());
        let mapped = match span_ref.sizeclass {
            // Large spans only keep their boundaries current.
            0 => map.get(first) == span && map.get(last) == span,
            _ => (first..=last).all(|page| map.get(page) == span),
        };
        match mapped {
            true => Ok(()),
            false => Err("in-use span page not mapped to span"),
        }
    }
}
