//! Defines [`Span`], the unit of page ownership, and the intrusive
//! [`SpanList`] the page heap and the central caches keep spans on.

use core::ptr::null_mut;

use crate::config::PAGE_SHIFT;
use crate::freelist::FreeObject;
use crate::stack::StackTrace;
use crate::util::{page_addr, PageId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanState {
    /// Handed to a client or carved for a size class.
    InUse,
    /// Free with its pages backed.
    OnNormalFreelist,
    /// Free with its pages given back to the OS.
    OnReturnedFreelist,
}

/// A run of consecutive pages.
///
/// Spans never point at their neighbours in memory; the page heap finds them
/// through the page map. `next` and `prev` link the span into whichever
/// single list currently owns it: a page-heap free list, a central cache
/// list, or the sampled-object registry.
#[derive(Debug)]
pub struct Span {
    pub start: PageId,
    /// Length in pages.
    pub length: usize,
    pub next: *mut Span,
    pub prev: *mut Span,
    /// Free objects of a carved span.
    pub objects: *mut FreeObject,
    /// Objects handed out of a carved span and not yet returned.
    pub refcount: usize,
    /// Size class, 0 for spans that are not carved.
    pub sizeclass: usize,
    pub state: SpanState,
    /// Whether the span holds a sampled allocation.
    pub sample: bool,
    /// Recorded stack of a sampled allocation.
    pub stack: *mut StackTrace,
}

impl Span {
    pub const fn new(start: PageId, length: usize) -> Self {
        Span {
            start,
            length,
            next: null_mut(),
            prev: null_mut(),
            objects: null_mut(),
            refcount: 0,
            sizeclass: 0,
            state: SpanState::InUse,
            sample: false,
            stack: null_mut(),
        }
    }

    /// Last page of the span.
    #[inline(always)]
    pub fn last_page(&self) -> PageId {
        self.start + self.length - 1
    }

    #[inline(always)]
    pub fn start_addr(&self) -> *mut u8 {
        page_addr(self.start)
    }

    #[inline(always)]
    pub fn bytes(&self) -> usize {
        self.length << PAGE_SHIFT
    }

    #[inline(always)]
    pub fn is_free(&self) -> bool {
        self.state != SpanState::InUse
    }
}

/// A doubly linked list of spans threaded through [`Span::next`] and
/// [`Span::prev`].
#[derive(Debug)]
pub struct SpanList {
    head: *mut Span,
    tail: *mut Span,
    len: usize,
}

// SAFETY: the list only holds pointers into metadata owned by the engine,
// every access goes through the lock that guards the list.
unsafe impl Send for SpanList {}

impl SpanList {
    #[inline]
    pub const fn new() -> Self {
        SpanList {
            head: null_mut(),
            tail: null_mut(),
            len: 0,
        }
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.head.is_null()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline(always)]
    pub fn head(&self) -> *mut Span {
        self.head
    }

    #[inline(always)]
    pub fn tail(&self) -> *mut Span {
        self.tail
    }

    /// Adds `span` to the front of the list. *O*(1).
    ///
    /// # Safety
    /// `span` must be valid and not on any list.
    pub unsafe fn push_front(&mut self, span: *mut Span) {
        (*span).prev = null_mut();
        (*span).next = self.head;
        match self.head.is_null() {
            true => self.tail = span,
            false => (*self.head).prev = span,
        }
        self.head = span;
        self.len += 1;
    }

    /// Inserts `span` before the first span that starts after it, keeping the
    /// list in address order. *O*(*n*).
    ///
    /// # Safety
    /// `span` must be valid and not on any list, the list must already be in
    /// address order.
    pub unsafe fn insert_ordered(&mut self, span: *mut Span) {
        let mut after = self.tail;
        while !after.is_null() && (*after).start > (*span).start {
            after = (*after).prev;
        }
        if after.is_null() {
            self.push_front(span);
            return;
        }
        let before = (*after).next;
        (*span).prev = after;
        (*span).next = before;
        (*after).next = span;
        match before.is_null() {
            true => self.tail = span,
            false => (*before).prev = span,
        }
        self.len += 1;
    }

    /// Removes `span` from the list. *O*(1).
    ///
    /// # Safety
    /// `span` must be on this list.
    pub unsafe fn remove(&mut self, span: *mut Span) {
        let prev = (*span).prev;
        let next = (*span).next;
        match prev.is_null() {
            true => self.head = next,
            false => (*prev).next = next,
        }
        match next.is_null() {
            true => self.tail = prev,
            false => (*next).prev = prev,
        }
        (*span).next = null_mut();
        (*span).prev = null_mut();
        self.len -= 1;
    }

    /// Iterates over the spans from head to tail.
    ///
    /// The list must not be modified while the iterator is alive.
    pub fn iter(&self) -> SpanIter<'_> {
        SpanIter {
            cur: self.head,
            _list: self,
        }
    }
}

impl Default for SpanList {
    fn default() -> Self {
        SpanList::new()
    }
}

pub struct SpanIter<'a> {
    cur: *mut Span,
    _list: &'a SpanList,
}

impl Iterator for SpanIter<'_> {
    type Item = *mut Span;

    fn next(&mut self) -> Option<*mut Span> {
        if self.cur.is_null() {
            return None;
        }
        let span = self.cur;
        // SAFETY: the borrowed list is not modified while iterating.
        self.cur = unsafe { (*span).next };
        Some(span)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spans(starts: &[usize]) -> Vec<Span> {
        starts.iter().map(|&s| Span::new(s, 1)).collect()
    }

    fn starts(list: &SpanList) -> Vec<usize> {
        list.iter().map(|s| unsafe { (*s).start }).collect()
    }

    #[test]
    fn test_1() {
        let list = SpanList::new();
        assert!(list.is_empty());
        assert!(list.head().is_null());
        assert!(list.tail().is_null());
        assert_eq!(list.iter().count(), 0);
    }

    #[test]
    fn test_push_and_remove() {
        let mut nodes = spans(&[0, 1, 2, 3, 4]);
        let mut list = SpanList::new();
        for node in nodes.iter_mut() {
            unsafe { list.push_front(node) };
        }
        assert_eq!(starts(&list), [4, 3, 2, 1, 0]);
        assert_eq!(list.len(), 5);

        unsafe {
            list.remove(&mut nodes[2]);
            list.remove(&mut nodes[4]);
            list.remove(&mut nodes[0]);
        }
        assert_eq!(starts(&list), [3, 1]);
        assert_eq!(list.tail(), &mut nodes[1] as *mut Span);

        unsafe {
            list.remove(&mut nodes[1]);
            list.remove(&mut nodes[3]);
        }
        assert!(list.is_empty());
        assert!(list.tail().is_null());
    }

    #[test]
    fn test_insert_ordered() {
        let mut nodes = spans(&[50, 10, 30, 70, 20, 60]);
        let mut list = SpanList::new();
        for node in nodes.iter_mut() {
            unsafe { list.insert_ordered(node) };
        }
        assert_eq!(starts(&list), [10, 20, 30, 50, 60, 70]);
        unsafe { list.remove(&mut nodes[3]) };
        assert_eq!(starts(&list), [10, 20, 30, 50, 60]);
        assert_eq!(unsafe { (*list.tail()).start }, 60);
    }

    #[test]
    fn test_span_geometry() {
        let span = Span::new(10, 3);
        assert_eq!(span.last_page(), 12);
        assert_eq!(span.bytes(), 3 << PAGE_SHIFT);
        assert_eq!(span.start_addr() as usize, 10 << PAGE_SHIFT);
        assert!(!span.is_free());
    }
}
