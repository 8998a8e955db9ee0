//! The [`Heap`] engine and the process-wide [`TcMalloc`] allocator.

pub mod heap;
pub mod tc_malloc;

pub use heap::{Heap, ThreadCacheHandle};
pub use tc_malloc::TcMalloc;
