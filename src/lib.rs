//! A thread-caching memory allocator written in Rust.
//!
//! # Usage
//! Add `rusty_tcmalloc` as a dependency in your project's `Cargo.toml` and
//! install [`TcMalloc`] as the global allocator.
//! ```toml
//! [dependencies]
//! rusty_tcmalloc = "0.1"
//! ```
//!
//! ```no_run
//! use rusty_tcmalloc::TcMalloc;
//!
//! #[global_allocator]
//! static ALLOCATOR: TcMalloc = TcMalloc;
//!
//! fn main() {
//!     let v1: Vec<u32> = vec![1, 2, 3];
//!     println!("Thread caches are cool {:?}", v1);
//! }
//! ```
//!
//! # Allocators
//! Two allocators are exported by this crate. [`TcMalloc`] is the process-wide
//! one: it owns a single engine over anonymous mappings and gives each thread
//! its own cache. [`Heap`] is the engine itself, generic over its
//! [page source](#page-sources); it can be created any number of times and
//! hands out thread caches as [`ThreadCacheHandle`]s.
//!
//! # Mode of operation
//! Memory moves through three tiers, each one larger and slower than the
//! one before:
//! - **Thread cache.** Every request of at most [`MAX_SIZE`] bytes is
//!   rounded up to a [size class](#size-classes) and served from the
//!   calling thread's free list of that class. No lock is taken. Freed
//!   objects are pushed back onto the same list.
//! - **Central cache.** When a thread's list runs dry it fetches a batch of
//!   objects from the central free list of the class, which is shared by
//!   all threads and guarded by one lock per class. Lists that grow too
//!   long, or caches that grow past their share of the overall budget,
//!   hand objects back in batches.
//! - **Page heap.** The central cache carves its objects out of spans, runs
//!   of whole pages handed out by the page heap. Larger requests get a span
//!   of their own straight from the page heap. Freed spans are merged with
//!   free neighbours; when nothing fits the page heap grows by asking its
//!   page source for more pages.
//!
//! The tiers share a few abstractions:
//!
//! ## Size classes
//! A fixed table of object sizes, spaced so that rounding a request up
//! wastes at most an eighth of it. Each class also knows how many pages a
//! span carved for it spans and how many objects move between a thread and
//! the central cache at once. See [`size_class`].
//!
//! ## Spans and the page map
//! A span describes a run of pages: whether it is free, carved for a size
//! class or handed out whole, and (for carved spans) its own list of free
//! objects. The page map is a radix tree from page number to span which
//! lets any pointer find its span without a lock. The page map is how a
//! freed pointer finds its size class.
//!
//! ## Page sources
//! A page source is where the page heap gets its memory from.
//! [`MmapSource`] maps anonymous memory and is what [`TcMalloc`] uses,
//! [`SbrkSource`] moves the program break. Anything that implements
//! [`PageSource`] can back a [`Heap`], and free pages are given back
//! through it as well, either on request ([`Heap::release_at_least`]),
//! gradually as spans are freed, or immediately with aggressive decommit.
//!
//! ## Sampling
//! About one allocation every [`Config::sample_parameter`] bytes is
//! sampled: it gets a span of its own and its stack trace is recorded.
//! Allocations served by the page heap directly are always sampled. The
//! live samples can be walked with [`Heap::iterate_sampled`].
//!
//! # Statistics and tuning
//! [`Heap::stats`] returns a [`Snapshot`] of where the memory is, and the
//! tunables can be read and changed at run time through
//! [`Heap::get_numeric_property`] and [`Heap::set_numeric_property`] using
//! the names in [`stats::property`].
//!
//! # Logging
//! Slow paths (heap growth, release to the OS, thread cache creation,
//! failures) emit [`tracing`] events. They are never emitted while an
//! engine lock is held, so a subscriber is free to allocate.
//!
//! [`TcMalloc`]: allocators::TcMalloc
//! [`Heap`]: allocators::Heap
//! [`ThreadCacheHandle`]: allocators::ThreadCacheHandle
//! [`Heap::release_at_least`]: allocators::Heap::release_at_least
//! [`Heap::iterate_sampled`]: allocators::Heap::iterate_sampled
//! [`Heap::stats`]: allocators::Heap::stats
//! [`Heap::get_numeric_property`]: allocators::Heap::get_numeric_property
//! [`Heap::set_numeric_property`]: allocators::Heap::set_numeric_property
//! [`MAX_SIZE`]: config::MAX_SIZE
#![cfg_attr(feature = "allocator-api", feature(allocator_api))]

pub use crate::allocators::{Heap, TcMalloc, ThreadCacheHandle};
pub use crate::config::Config;
pub use crate::error::PageError;
pub use crate::page_source::{MmapSource, PageSource, SbrkSource};
pub use crate::stack::StackTrace;
pub use crate::stats::{ClassStats, Snapshot};

pub mod allocators;
mod central;
pub mod config;
mod error;
mod freelist;
mod meta;
mod page_heap;
pub mod page_source;
mod pagemap;
mod sampler;
pub mod size_class;
mod span;
pub mod stack;
pub mod stats;
mod thread_cache;
mod util;
