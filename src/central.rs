//! The central cache: one shared free list per size class.
//!
//! A [`CentralFreeList`] never holds objects outside of spans. Spans with at
//! least one free object sit on the `nonempty` list, fully handed-out spans on
//! the `empty` list; the span an object belongs to is always found through
//! the page map.
//!
//! Lock ordering: a thread holds at most one central lock and never asks the
//! [`SpanSource`] (which takes the page-heap lock) while holding it.

use core::ptr::null_mut;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::error::check;
use crate::freelist::{next_of, set_next, Chain, FreeObject};
use crate::size_class::SIZE_MAP;
use crate::span::{Span, SpanList};
use crate::stats::ClassStats;

/// What a central free list needs from the page heap.
pub trait SpanSource {
    /// Returns an in-use span of `pages` pages registered for `class`, or
    /// `None` if memory is exhausted.
    fn alloc_span(&self, pages: usize, class: usize) -> Option<*mut Span>;

    /// Gives back spans whose objects are all free. The spans are linked
    /// through [`Span::next`].
    fn release_spans(&self, spans: *mut Span);

    /// The span owning the object at `p`, or null.
    fn span_of(&self, p: *const u8) -> *mut Span;
}

#[derive(Debug, Default)]
struct Lists {
    nonempty: SpanList,
    empty: SpanList,
    free_objects: usize,
    spans: usize,
    handed_out: u64,
}

/// The shared free list of one size class.
#[derive(Debug)]
pub struct CentralFreeList {
    class: usize,
    lists: Mutex<Lists>,
}

impl CentralFreeList {
    pub fn new(class: usize) -> Self {
        CentralFreeList {
            class,
            lists: Mutex::new(Lists::default()),
        }
    }

    #[inline]
    fn lock(&self) -> MutexGuard<'_, Lists> {
        self.lists.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Moves up to `n` objects out of the cache, carving a new span first if
    /// none has a free object. An empty chain means memory is exhausted.
    pub fn remove_range<S: SpanSource + ?Sized>(&self, n: usize, src: &S) -> Chain {
        debug_assert!(n > 0);
        let mut lists = self.lock();
        while lists.nonempty.is_empty() {
            drop(lists);
            if !self.populate(src) {
                return Chain::empty();
            }
            lists = self.lock();
        }

        let mut chain = Chain::empty();
        while chain.count < n {
            let span = lists.nonempty.head();
            if span.is_null() {
                break;
            }
            // SAFETY: spans on our lists are carved for this class and their
            // object lists are only touched under our lock.
            unsafe {
                while chain.count < n && !(*span).objects.is_null() {
                    let obj = (*span).objects;
                    (*span).objects = next_of(obj);
                    (*span).refcount += 1;
                    chain.push(obj);
                }
                if (*span).objects.is_null() {
                    lists.nonempty.remove(span);
                    lists.empty.push_front(span);
                }
            }
        }
        lists.free_objects -= chain.count;
        lists.handed_out += chain.count as u64;
        chain
    }

    /// Returns the objects of `chain` to their spans. Spans left with no
    /// object in use go back to the page heap once the lock is dropped.
    ///
    /// # Safety
    /// Every object of `chain` must have been handed out by this cache and
    /// not be in use.
    pub unsafe fn insert_range<S: SpanSource + ?Sized>(&self, chain: Chain, src: &S) {
        let objects_per_span = SIZE_MAP.info(self.class).objects;
        let mut unused: *mut Span = null_mut();
        let mut lists = self.lock();
        let mut obj = chain.head;
        for _ in 0..chain.count {
            let next = next_of(obj);
            let span = src.span_of(obj.cast());
            check!(!span.is_null(), "freed object has no span");
            check!(
                (*span).sizeclass == self.class,
                "object freed to the wrong size class"
            );
            check!((*span).refcount > 0, "span refcount underflow");

            if (*span).objects.is_null() {
                lists.empty.remove(span);
                lists.nonempty.push_front(span);
            }
            set_next(obj, (*span).objects);
            (*span).objects = obj;
            (*span).refcount -= 1;
            lists.free_objects += 1;

            if (*span).refcount == 0 {
                lists.nonempty.remove(span);
                lists.free_objects -= objects_per_span;
                lists.spans -= 1;
                (*span).next = unused;
                unused = span;
            }
            obj = next;
        }
        drop(lists);

        if !unused.is_null() {
            src.release_spans(unused);
        }
    }

    /// Carves a fresh span into objects and adds it to the nonempty list.
    /// Called without the lock held.
    fn populate<S: SpanSource + ?Sized>(&self, src: &S) -> bool {
        let info = SIZE_MAP.info(self.class);
        let Some(span) = src.alloc_span(info.pages, self.class) else {
            return false;
        };
        // SAFETY: the span is fresh and private to this thread until it is
        // pushed onto the list.
        unsafe {
            let base = (*span).start_addr();
            let mut head: *mut FreeObject = null_mut();
            for i in (0..info.objects).rev() {
                let obj: *mut FreeObject = base.add(i * info.size).cast();
                set_next(obj, head);
                head = obj;
            }
            (*span).objects = head;
            (*span).refcount = 0;

            let mut lists = self.lock();
            lists.nonempty.push_front(span);
            lists.free_objects += info.objects;
            lists.spans += 1;
        }
        true
    }

    /// Bytes of free objects held.
    pub fn free_bytes(&self) -> usize {
        self.lock().free_objects * SIZE_MAP.size(self.class)
    }

    pub fn stats(&self) -> ClassStats {
        let lists = self.lock();
        ClassStats {
            object_size: SIZE_MAP.size(self.class),
            central_free_objects: lists.free_objects,
            spans: lists.spans,
            objects_handed_out: lists.handed_out,
            allocations: 0,
        }
    }
}
