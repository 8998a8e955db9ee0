//! Statistics snapshots and the names of the numeric properties.

/// Names understood by `get_numeric_property` and `set_numeric_property`.
pub mod property {
    pub const CURRENT_ALLOCATED_BYTES: &str = "generic.current_allocated_bytes";
    pub const HEAP_SIZE: &str = "generic.heap_size";
    pub const SLACK_BYTES: &str = "tcmalloc.slack_bytes";
    pub const MAX_TOTAL_THREAD_CACHE_BYTES: &str = "tcmalloc.max_total_thread_cache_bytes";
    pub const CURRENT_TOTAL_THREAD_CACHE_BYTES: &str = "tcmalloc.current_total_thread_cache_bytes";
    pub const MIN_PER_THREAD_CACHE_BYTES: &str = "tcmalloc.min_per_thread_cache_bytes";
    pub const SAMPLE_PARAMETER: &str = "tcmalloc.sample_parameter";
    pub const AGGRESSIVE_MEMORY_DECOMMIT: &str = "tcmalloc.aggressive_memory_decommit";
    pub const RELEASE_RATE: &str = "tcmalloc.release_rate";
    pub const PAGEHEAP_FREE_BYTES: &str = "tcmalloc.pageheap_free_bytes";
    pub const PAGEHEAP_UNMAPPED_BYTES: &str = "tcmalloc.pageheap_unmapped_bytes";
    pub const CENTRAL_CACHE_FREE_BYTES: &str = "tcmalloc.central_cache_free_bytes";
    pub const METADATA_BYTES: &str = "tcmalloc.metadata_bytes";
    pub const THREAD_CACHE_COUNT: &str = "tcmalloc.thread_cache_count";
}

/// A consistent view of where the engine's memory is.
///
/// At a quiescent point
/// `heap_size == current_allocated_bytes + page_heap_free_bytes
/// + page_heap_unmapped_bytes + central_cache_free_bytes
/// + thread_cache_free_bytes`. Metadata is not part of `heap_size`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Snapshot {
    /// Bytes of span memory obtained from the page source.
    pub heap_size: usize,
    /// Bytes handed to clients, including size-class rounding.
    pub current_allocated_bytes: usize,
    pub page_heap_free_bytes: usize,
    pub page_heap_unmapped_bytes: usize,
    pub central_cache_free_bytes: usize,
    pub thread_cache_free_bytes: usize,
    /// Bytes of page-source memory used for the engine's own bookkeeping.
    pub metadata_bytes: usize,
    pub thread_cache_count: usize,
}

impl Snapshot {
    /// Free bytes held by the page heap, backed or not.
    pub fn slack_bytes(&self) -> usize {
        self.page_heap_free_bytes + self.page_heap_unmapped_bytes
    }
}

/// Per-size-class counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClassStats {
    /// Bytes per object.
    pub object_size: usize,
    /// Free objects held by the central cache.
    pub central_free_objects: usize,
    /// Spans currently carved for the class.
    pub spans: usize,
    /// Objects ever handed out by the central cache, in batches to thread
    /// caches or one at a time to uncached callers.
    pub objects_handed_out: u64,
    /// Objects of the class allocated since start, however they were served.
    pub allocations: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slack() {
        let snapshot = Snapshot {
            page_heap_free_bytes: 10,
            page_heap_unmapped_bytes: 5,
            ..Default::default()
        };
        assert_eq!(snapshot.slack_bytes(), 15);
    }
}
