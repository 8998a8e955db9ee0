use crate::config::PAGE_SHIFT;
use crate::page_source::testing::{ArenaSource, FlakySource};
use crate::stats::Snapshot;

use self::format::{EventCounter, RecordEntryLayer, SimpleFormatter};

use super::*;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing_subscriber::fmt::Layer as FmtLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Registry};


fn arena_heap(pages: usize, config: Config) -> Heap<ArenaSource> {
    Heap::new(ArenaSource::new(pages), config)
}

unsafe fn fill(p: *mut u8, len: usize, seed: u8) {
    let bytes = core::slice::from_raw_parts_mut(p, len);
    for (i, b) in bytes.iter_mut().enumerate() {
        *b = seed.wrapping_add(i as u8);
    }
}

unsafe fn holds(p: *const u8, len: usize, seed: u8) -> bool {
    let bytes = core::slice::from_raw_parts(p, len);
    bytes
        .iter()
        .enumerate()
        .all(|(i, b)| *b == seed.wrapping_add(i as u8))
}

fn cached_bytes(stats: &Snapshot) -> usize {
    stats.page_heap_free_bytes
        + stats.page_heap_unmapped_bytes
        + stats.central_cache_free_bytes
        + stats.thread_cache_free_bytes
}

/// Steady alloc/free of one size never touches the page heap again.
#[test]
fn test_fast_path_echo() {
    let heap = arena_heap(1024, Config::new().with_sample_parameter(0));
    let mut cache = heap.thread_cache().unwrap();
    let first = cache.allocate(32);
    assert!(!first.is_null());
    unsafe { cache.deallocate(first) };
    let heap_size = heap.stats().heap_size;

    for _ in 0..1_000_000 {
        let p = cache.allocate(32);
        assert_eq!(p, first);
        unsafe { cache.deallocate(p) };
    }

    assert_eq!(heap.stats().heap_size, heap_size);
    let class = SIZE_MAP.class_of(32);
    let stats = heap.class_stats(class).unwrap();
    assert_eq!(stats.objects_handed_out, 1);
    assert_eq!(stats.allocations, 1_000_001);
    assert_eq!(cache.cached_bytes(), SIZE_MAP.size(class));
}

#[test]
fn test_class_allocation_counts() {
    let heap = arena_heap(1024, Config::new().with_sample_parameter(0));
    let class = SIZE_MAP.class_of(100);
    let mut cache = heap.thread_cache().unwrap();
    let cached: Vec<*mut u8> = (0..300).map(|_| cache.allocate(100)).collect();
    let uncached: Vec<*mut u8> = (0..20).map(|_| heap.allocate(100)).collect();
    assert_eq!(heap.class_stats(class).unwrap().allocations, 320);

    for p in cached.iter().chain(&uncached) {
        unsafe { cache.deallocate(*p) };
    }
    drop(cache);
    // Counts outlive the cache that made them.
    assert_eq!(heap.class_stats(class).unwrap().allocations, 320);
    assert_eq!(heap.class_stats(SIZE_MAP.class_of(4000)).unwrap().allocations, 0);
    assert!(heap.class_stats(0).is_none());
    heap.check().unwrap();
}

#[test]
fn test_sampling_sanity() {
    const LARGE: usize = 10_000_000;
    let heap = arena_heap(4096, Config::new().with_sample_parameter(524_288));
    let mut cache = heap.thread_cache().unwrap();
    let small: Vec<*mut u8> = (0..1000).map(|_| cache.allocate(32)).collect();
    let large = cache.allocate(LARGE);
    assert!(!large.is_null());

    let mut samples = Vec::new();
    heap.iterate_sampled(|size, stack| samples.push((size, stack.frames().len())));
    let large_samples: Vec<_> = samples.iter().filter(|s| s.0 == LARGE).collect();
    assert_eq!(large_samples.len(), 1);
    // About 0.06 small samples are expected.
    assert!(samples.len() - 1 <= 3, "{samples:?}");
    #[cfg(all(target_os = "linux", target_env = "gnu"))]
    assert!(large_samples[0].1 > 0);

    unsafe {
        cache.deallocate(large);
        for p in small {
            cache.deallocate(p);
        }
    }
    let mut left = 0;
    heap.iterate_sampled(|size, _| {
        assert_ne!(size, LARGE);
        left += 1;
    });
    assert_eq!(left, 0);
    heap.check().unwrap();
}

/// Every freed page-level object leaves its whole span as slack.
#[test]
fn test_fragmentation_floor() {
    // 8200-byte objects are served by size classes here (MAX_SIZE is
    // 32 KiB), so the smallest page-level size is used instead. N is scaled
    // down to keep the arena small; the slack ratio does not depend on it.
    const N: usize = 2000;
    let size = MAX_SIZE + 8;
    let pages = pages_for(size).unwrap();
    let span_bytes = pages * PAGE_SIZE;
    let heap = arena_heap(N * pages + 2048, Config::new());

    let objects: Vec<*mut u8> = (0..N).map(|_| heap.allocate(size)).collect();
    assert!(objects.iter().all(|p| !p.is_null()));
    for p in objects.iter().step_by(2) {
        unsafe { heap.deallocate(*p) };
    }

    let slack = heap.get_numeric_property(property::SLACK_BYTES).unwrap();
    let expected = N / 2 * span_bytes;
    assert!(slack >= expected, "slack {slack} < {expected}");
    assert!(slack - expected <= expected / 10, "slack {slack} vs {expected}");
    heap.check().unwrap();

    for p in objects.iter().skip(1).step_by(2) {
        unsafe { heap.deallocate(*p) };
    }
    assert_eq!(heap.stats().current_allocated_bytes, 0);
}

/// Short-lived threads recycle their caches; the heap does not grow with
/// the number of threads.
#[test]
fn test_thread_arrival_departure() {
    let heap = arena_heap(8192, Config::new());
    let _main = heap.thread_cache().unwrap();
    let mut heap_size = 0;
    for i in 0..1000 {
        std::thread::scope(|s| {
            s.spawn(|| {
                let mut cache = heap.thread_cache().unwrap();
                let p = cache.allocate(1 << 20);
                assert!(!p.is_null());
                unsafe { fill(p, 4096, i as u8) };
                let small: Vec<*mut u8> = (0..64).map(|_| cache.allocate(100)).collect();
                unsafe {
                    for q in small {
                        cache.deallocate(q);
                    }
                    cache.deallocate(p);
                }
            });
        });
        if i == 0 {
            heap_size = heap.stats().heap_size;
        }
    }
    let stats = heap.stats();
    assert_eq!(stats.thread_cache_count, 1);
    assert_eq!(stats.heap_size, heap_size);
    heap.check().unwrap();
}

#[test]
fn test_reallocate_growth() {
    let heap = arena_heap(1024, Config::new());
    let mut cache = heap.thread_cache().unwrap();
    let mut p = cache.allocate(64);
    let mut prev = 64;
    unsafe { fill(p, prev, 7) };
    for size in [128, 1024, 8192, 65536, 524288] {
        unsafe {
            p = cache.reallocate(p, size);
            assert!(!p.is_null());
            assert!(heap.usable_size(p) >= size);
            assert!(holds(p, prev, 7));
            fill(p, size, 7);
        }
        prev = size;
    }

    unsafe {
        // Shrinking by less than half stays in place.
        assert_eq!(cache.reallocate(p, prev * 3 / 4), p);
        let q = cache.reallocate(p, 100);
        assert_ne!(q, p);
        assert!(holds(q, 100, 7));
        assert!(cache.reallocate(q, 0).is_null());
        let r = cache.reallocate(null_mut(), 40);
        assert!(heap.usable_size(r) >= 40);
        cache.deallocate(r);
    }
    drop(cache);
    assert_eq!(heap.stats().current_allocated_bytes, 0);
}

#[test]
fn test_reallocate_small_growth_overshoots() {
    let heap = arena_heap(1024, Config::new());
    unsafe {
        let p = heap.allocate(1000);
        let old = heap.usable_size(p);
        let q = heap.reallocate(p, old + 1);
        assert!(heap.usable_size(q) >= old + old / 4);
        heap.deallocate(q);
    }
}

/// The first growth fails; the exact-size retry hides it from the client.
#[test]
fn test_page_source_failure_recovery() {
    let heap = Heap::new(FlakySource::new(ArenaSource::new(1024), 1), Config::new());
    let p = heap.allocate(48);
    assert!(!p.is_null());
    unsafe {
        fill(p, 48, 1);
        assert!(holds(p, 48, 1));
        heap.deallocate(p);
    }
    let q = heap.allocate(100_000);
    assert!(!q.is_null());
    unsafe { heap.deallocate(q) };
    heap.check().unwrap();
    assert_eq!(heap.stats().current_allocated_bytes, 0);
}

#[test]
fn test_out_of_memory() {
    let heap = Heap::new(FlakySource::new(ArenaSource::new(64), usize::MAX), Config::new());
    assert!(heap.allocate(48).is_null());
    assert!(heap.allocate(1 << 20).is_null());
    assert!(heap.aligned_allocate(64, 4 * PAGE_SIZE).is_null());
    assert!(heap.thread_cache().is_none());
    assert_eq!(heap.stats().heap_size, 0);

    let heap = arena_heap(256, Config::new());
    assert!(heap.allocate(8 << 20).is_null());
    let p = heap.allocate(64);
    assert!(!p.is_null());
    unsafe {
        assert!(heap.reallocate(p, 8 << 20).is_null());
        heap.deallocate(p);
    }
    heap.check().unwrap();
}

#[test]
fn test_accounting_closure() {
    let heap = arena_heap(16 * 1024, Config::new());
    let mut rng = StdRng::seed_from_u64(17);
    let mut cache = heap.thread_cache().unwrap();
    let mut live = Vec::new();
    for i in 0..5000 {
        let size = match rng.gen_range(0..10) {
            0 => rng.gen_range(MAX_SIZE..200_000),
            _ => rng.gen_range(1..2048),
        };
        let p = if i % 3 == 0 {
            heap.allocate(size)
        } else {
            cache.allocate(size)
        };
        assert!(!p.is_null());
        live.push(p);
        if rng.gen_bool(0.4) {
            let victim = live.swap_remove(rng.gen_range(0..live.len()));
            unsafe { cache.deallocate(victim) };
        }
    }

    let stats = heap.stats();
    let in_use: usize = live.iter().map(|p| unsafe { heap.usable_size(*p) }).sum();
    assert!(cached_bytes(&stats) <= stats.heap_size);
    assert!(in_use <= stats.current_allocated_bytes);
    assert!(stats.metadata_bytes > 0);
    heap.check().unwrap();

    for p in live {
        unsafe { heap.deallocate(p) };
    }
    drop(cache);
    let stats = heap.stats();
    assert_eq!(stats.current_allocated_bytes, 0);
    assert_eq!(stats.central_cache_free_bytes, 0);
    assert_eq!(stats.thread_cache_free_bytes, 0);
    assert_eq!(stats.thread_cache_count, 0);
    assert_eq!(stats.heap_size, stats.slack_bytes());
    heap.check().unwrap();
}

#[test]
fn test_no_overlap() {
    let heap = arena_heap(16 * 1024, Config::new());
    let mut cache = heap.thread_cache().unwrap();
    let mut rng = StdRng::seed_from_u64(3);
    let mut objects: Vec<(*mut u8, usize, u8)> = (0..3000)
        .map(|i| {
            let size = match rng.gen_range(0..20) {
                0 => rng.gen_range(1..150_000),
                _ => rng.gen_range(1..4096),
            };
            let p = cache.allocate(size);
            assert!(!p.is_null());
            unsafe { fill(p, size, i as u8) };
            (p, size, i as u8)
        })
        .collect();

    let mut ranges: Vec<(usize, usize)> = objects
        .iter()
        .map(|(p, _, _)| (*p as usize, unsafe { heap.usable_size(*p) }))
        .collect();
    ranges.sort_unstable();
    for pair in ranges.windows(2) {
        assert!(pair[0].0 + pair[0].1 <= pair[1].0, "{pair:?}");
    }
    for (p, size, seed) in objects.drain(..) {
        unsafe {
            assert!(holds(p, size, seed));
            cache.deallocate(p);
        }
    }
}

#[test]
fn test_usable_size() {
    let heap = arena_heap(1024, Config::new());
    unsafe {
        assert_eq!(heap.usable_size(core::ptr::null()), 0);
        for size in [0, 1, 8, 13, 100, 1000, MAX_SIZE, MAX_SIZE + 1, 300_000] {
            let p = heap.allocate(size);
            assert!(!p.is_null());
            let usable = heap.usable_size(p);
            assert!(usable >= size);
            if size <= MAX_SIZE {
                assert_eq!(usable, SIZE_MAP.size(SIZE_MAP.class_of(size)));
            } else {
                assert_eq!(usable % PAGE_SIZE, 0);
                assert_eq!(p as usize % PAGE_SIZE, 0);
            }
            heap.deallocate(p);
        }
        heap.deallocate(null_mut());
    }
}

#[test]
fn test_power_of_two_alignment() {
    let heap = arena_heap(1024, Config::new());
    let mut cache = heap.thread_cache().unwrap();
    let mut size = MIN_ALIGN;
    while size < PAGE_SIZE {
        let p = cache.allocate(size);
        assert_eq!(p as usize % size, 0, "size {size}");
        unsafe { cache.deallocate(p) };
        size *= 2;
    }
}

#[test]
fn test_aligned_allocate() {
    let heap = arena_heap(4096, Config::new());
    let mut cache = heap.thread_cache().unwrap();
    let mut objects = Vec::new();
    for align_shift in 0..=(PAGE_SHIFT + 3) {
        let align = 1 << align_shift;
        for size in [1, 24, 100, 3000, MAX_SIZE, 100_000] {
            let p = cache.aligned_allocate(size, align);
            assert!(!p.is_null(), "size {size} align {align}");
            assert_eq!(p as usize % align, 0, "size {size} align {align}");
            assert!(unsafe { heap.usable_size(p) } >= size);
            objects.push(p);
        }
    }
    assert!(cache.aligned_allocate(64, 48).is_null());
    assert!(heap.aligned_allocate(64, 0).is_null());
    heap.check().unwrap();
    for p in objects {
        unsafe { cache.deallocate(p) };
    }
    drop(cache);
    assert_eq!(heap.stats().current_allocated_bytes, 0);
    heap.check().unwrap();
}

#[test]
fn test_properties() {
    let heap = arena_heap(1024, Config::new());
    assert_eq!(
        heap.get_numeric_property(property::SAMPLE_PARAMETER),
        Some(512 * 1024)
    );
    assert_eq!(heap.get_numeric_property(property::AGGRESSIVE_MEMORY_DECOMMIT), Some(0));
    assert_eq!(heap.get_numeric_property(property::RELEASE_RATE), Some(1));
    assert_eq!(heap.get_numeric_property(property::HEAP_SIZE), Some(0));
    assert_eq!(heap.get_numeric_property("tcmalloc.no_such_thing"), None);

    assert!(heap.set_numeric_property(property::SAMPLE_PARAMETER, 0));
    assert_eq!(heap.get_numeric_property(property::SAMPLE_PARAMETER), Some(0));
    assert!(heap.set_numeric_property(property::RELEASE_RATE, 5));
    assert_eq!(heap.get_numeric_property(property::RELEASE_RATE), Some(5));
    assert!(!heap.set_numeric_property(property::HEAP_SIZE, 1));
    assert!(!heap.set_numeric_property("tcmalloc.no_such_thing", 1));

    let p = heap.allocate(1000);
    let stats = heap.stats();
    assert_eq!(
        heap.get_numeric_property(property::CURRENT_ALLOCATED_BYTES),
        Some(stats.current_allocated_bytes)
    );
    assert_eq!(
        heap.get_numeric_property(property::CENTRAL_CACHE_FREE_BYTES),
        Some(stats.central_cache_free_bytes)
    );
    assert_eq!(
        heap.get_numeric_property(property::METADATA_BYTES),
        Some(stats.metadata_bytes)
    );
    unsafe { heap.deallocate(p) };
}

#[test]
fn test_per_thread_limit() {
    let overall = 1 << 20;
    let min = 64 << 10;
    let heap = arena_heap(
        1024,
        Config::new()
            .with_overall_thread_cache_size(overall)
            .with_min_per_thread_cache_size(min),
    );
    let limit = || heap.per_thread_cache_size.load(Ordering::Relaxed);
    assert_eq!(limit(), overall);

    let caches: Vec<_> = (0..4).map(|_| heap.thread_cache().unwrap()).collect();
    assert_eq!(limit(), overall / 4);
    assert_eq!(
        heap.get_numeric_property(property::THREAD_CACHE_COUNT),
        Some(4)
    );

    assert!(heap.set_numeric_property(property::MAX_TOTAL_THREAD_CACHE_BYTES, 1 << 10));
    assert_eq!(limit(), min);
    assert!(heap.set_numeric_property(property::MIN_PER_THREAD_CACHE_BYTES, 1 << 7));
    assert_eq!(limit(), 1 << 8);

    drop(caches);
    assert_eq!(limit(), 1 << 10);
    assert_eq!(heap.stats().thread_cache_count, 0);
    heap.check().unwrap();
}

/// A cache over its budget hands objects back until it fits again.
#[test]
fn test_thread_cache_budget() {
    let heap = arena_heap(
        4096,
        Config::new()
            .with_sample_parameter(0)
            .with_overall_thread_cache_size(128 << 10)
            .with_min_per_thread_cache_size(0),
    );
    let mut cache = heap.thread_cache().unwrap();
    let objects: Vec<*mut u8> = (0..4000).map(|_| cache.allocate(1024)).collect();
    for p in objects {
        unsafe { cache.deallocate(p) };
    }
    // Each free over budget scavenges, halving what the lists kept since
    // the previous scavenge.
    for _ in 0..64 {
        let p = cache.allocate(1024);
        unsafe { cache.deallocate(p) };
    }
    assert!(cache.cached_bytes() <= 2 * (128 << 10), "{}", cache.cached_bytes());
    drop(cache);
    assert_eq!(heap.stats().current_allocated_bytes, 0);
}

#[test]
fn test_mixed_cached_and_uncached() {
    let heap = arena_heap(1024, Config::new());
    let mut cache = heap.thread_cache().unwrap();
    unsafe {
        let a = heap.allocate(200);
        let b = cache.allocate(200);
        cache.deallocate(a);
        heap.deallocate(b);
        let c = heap.allocate(64 << 10);
        cache.deallocate(c);
    }
    drop(cache);
    assert_eq!(heap.stats().current_allocated_bytes, 0);
    heap.check().unwrap();
}

#[test]
fn test_aggressive_decommit() {
    let heap = arena_heap(1024, Config::new());
    assert!(heap.set_numeric_property(property::AGGRESSIVE_MEMORY_DECOMMIT, 1));
    let p = heap.allocate(3 << 20);
    assert!(!p.is_null());
    unsafe {
        fill(p, 4096, 9);
        heap.deallocate(p);
    }
    let stats = heap.stats();
    assert_eq!(stats.page_heap_free_bytes, 0);
    assert_eq!(stats.page_heap_unmapped_bytes, stats.heap_size);
    heap.check().unwrap();

    // Returned pages are handed out again, zeroed.
    let q = heap.allocate(3 << 20);
    assert_eq!(q, p);
    unsafe {
        assert!(core::slice::from_raw_parts(q, 4096).iter().all(|b| *b == 0));
        heap.deallocate(q);
    }
}

#[test]
fn test_release_at_least() {
    let heap = arena_heap(2048, Config::new());
    let objects: Vec<*mut u8> = (0..8).map(|i| heap.allocate((i + 1) << 16)).collect();
    // Live neighbours keep the freed spans apart.
    for p in objects.iter().step_by(2) {
        unsafe { heap.deallocate(*p) };
    }
    let free = heap.stats().page_heap_free_bytes;
    assert!(free > 0);

    assert!(heap.release_at_least(1) >= 1);
    let released = heap.release_at_least(usize::MAX);
    let stats = heap.stats();
    assert!(released > 0);
    assert_eq!(stats.page_heap_free_bytes, 0);
    assert_eq!(stats.page_heap_unmapped_bytes, free);
    assert_eq!(heap.release_at_least(usize::MAX), 0);
    heap.check().unwrap();
    for p in objects.iter().skip(1).step_by(2) {
        unsafe { heap.deallocate(*p) };
    }
    heap.check().unwrap();
}

/// After many threads churn and go idle, releasing everything brings the
/// backed footprint back to where it started.
#[test]
fn test_concurrent_footprint() {
    const THREADS: usize = 8;
    const PAIRS: usize = 20_000;
    let heap = arena_heap(16 * 1024, Config::new());

    std::thread::scope(|s| {
        for t in 0..THREADS {
            let heap = &heap;
            s.spawn(move || {
                let mut rng = StdRng::seed_from_u64(t as u64);
                let mut cache = heap.thread_cache().unwrap();
                let mut live: Vec<(*mut u8, usize)> = Vec::new();
                for _ in 0..PAIRS {
                    let size = match rng.gen_range(0..50) {
                        0 => rng.gen_range(MAX_SIZE..300_000),
                        _ => rng.gen_range(1..4096),
                    };
                    let p = cache.allocate(size);
                    assert!(!p.is_null());
                    unsafe { p.write(t as u8) };
                    live.push((p, size));
                    if live.len() > 100 || rng.gen_bool(0.5) {
                        let (q, _) = live.swap_remove(rng.gen_range(0..live.len()));
                        assert_eq!(unsafe { q.read() }, t as u8);
                        unsafe { cache.deallocate(q) };
                    }
                }
                for (q, _) in live {
                    unsafe { cache.deallocate(q) };
                }
            });
        }
    });

    heap.release_at_least(usize::MAX);
    let stats = heap.stats();
    assert_eq!(stats.thread_cache_count, 0);
    assert_eq!(stats.current_allocated_bytes, 0);
    assert_eq!(stats.page_heap_free_bytes, 0);
    assert_eq!(stats.heap_size, stats.page_heap_unmapped_bytes);
    heap.check().unwrap();
}

/// Slow-path events go out with no engine lock held, so a subscriber is
/// free to do whatever it likes.
#[test]
fn test_logging() {
    let subscriber = Registry::default()
        .with(EnvFilter::new("rusty_tcmalloc=debug"))
        .with(RecordEntryLayer::default())
        .with(FmtLayer::new().with_test_writer().event_format(SimpleFormatter));

    tracing::subscriber::with_default(subscriber, || {
        let heap = arena_heap(1024, Config::new());
        let mut cache = heap.thread_cache().unwrap();
        let p = cache.allocate(2 << 20);
        assert!(!p.is_null());
        assert!(cache.allocate(64 << 20).is_null());
        unsafe { cache.deallocate(p) };
        assert!(heap.set_numeric_property(property::RELEASE_RATE, 10));
        assert!(heap.release_at_least(usize::MAX) > 0);
        drop(cache);
        heap.check().unwrap();
    });
}

#[test]
fn test_silenced_thread_logs_nothing() {
    std::thread::spawn(|| {
        let counter = EventCounter::default();
        let subscriber = Registry::default()
            .with(EnvFilter::new("rusty_tcmalloc=debug"))
            .with(counter.clone());

        tracing::subscriber::with_default(subscriber, || {
            let heap = arena_heap(1024, Config::new());
            let cache = heap.thread_cache().unwrap();
            let seen = counter.count();
            assert!(seen > 0);

            silence_thread();
            drop(cache);
            let mut cache = heap.thread_cache().unwrap();
            assert!(cache.allocate(64 << 20).is_null());
            drop(cache);
            assert_eq!(counter.count(), seen);
            heap.check().unwrap();
        });
    })
    .join()
    .unwrap();
}
