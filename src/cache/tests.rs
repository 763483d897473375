//! Cache tests - fast path, refill, release and bookkeeping
//!
//! Test suite organized by operation:
//! - Fast Path: size routing, zeroing and scan accounting
//! - Tiny: block packing through the cache
//! - Refill: donor replacement and flush cadence
//! - Release: giving spans back
//! - Free & Lookup: object return and interior pointers
//! - Stack Cache: segment budget
//! - Sampling: profile thresholds

use super::*;
use crate::config::AllocConfig;
use crate::sizeclass::{objects_per_span, size_to_class, TINY_SIZE_CLASS};

fn heap_with(config: AllocConfig) -> Heap {
    Heap::new(config)
}

fn spc(size: usize, noscan: bool) -> SpanClass {
    SpanClass::new(size_to_class(size).unwrap(), noscan)
}

// ===== Fast Path Tests =====

#[test]
fn zero_size_returns_shared_base() {
    let heap = Heap::with_defaults();
    let mut cache = heap.alloc_cache();
    assert_eq!(cache.alloc(0, false), Some(Address::zero_base()));
    assert_eq!(cache.alloc(0, true), Some(Address::zero_base()));
    assert_eq!(cache.cached_spans(), 0);
}

#[test]
fn large_sizes_are_routed_away() {
    let heap = Heap::with_defaults();
    let mut cache = heap.alloc_cache();
    assert_eq!(cache.alloc(MAX_SMALL_SIZE + 1, false), None);
    assert!(cache.alloc(MAX_SMALL_SIZE, false).is_some());
    assert!(cache.local_stats().refills == 1);
}

#[test]
fn small_objects_are_distinct_and_sized() {
    let heap = Heap::with_defaults();
    let mut cache = heap.alloc_cache();

    let a = cache.alloc(100, false).unwrap();
    let b = cache.alloc(100, false).unwrap();
    assert_eq!(b.offset_from(a), 112);

    let (base, size) = cache.find_object(a).unwrap();
    assert_eq!((base, size), (a, 112));
}

#[test]
fn scan_bytes_only_for_pointer_classes() {
    let heap = Heap::with_defaults();
    let mut cache = heap.alloc_cache();

    cache.alloc(100, false);
    cache.alloc(100, true);
    cache.alloc(20, false);
    assert_eq!(cache.local_scan(), 112 + 32);

    let stats = cache.local_stats();
    assert_eq!(stats.small_allocs[size_to_class(100).unwrap()], 2);
}

#[test]
fn reused_objects_are_zeroed() {
    let heap = Heap::with_defaults();
    let mut cache = heap.alloc_cache();

    let a = cache.alloc(64, false).unwrap();
    let _b = cache.alloc(64, false).unwrap();
    unsafe { std::ptr::write_bytes(a.as_ptr(), 0xEE, 64) };
    cache.free(a);
    cache.release_all();

    let again = cache.alloc(64, false).unwrap();
    assert_eq!(again, a);
    let bytes = unsafe { std::slice::from_raw_parts(again.as_ptr(), 64) };
    assert!(bytes.iter().all(|&b| b == 0));
}

// ===== Tiny Tests =====

#[test]
fn first_tiny_alloc_installs_block() {
    let heap = Heap::with_defaults();
    let mut cache = heap.alloc_cache();

    let addr = cache.alloc(5, true).unwrap();
    assert_eq!(cache.tiny().block(), Some(addr));
    assert_eq!(cache.tiny().offset(), 5);
    assert!(cache.donor(TINY_SPAN_CLASS).is_some());
    assert_eq!(cache.local_stats().small_allocs[TINY_SIZE_CLASS], 1);
    assert_eq!(cache.tiny().allocs(), 0);
}

#[test]
fn tiny_allocs_share_a_block() {
    let heap = Heap::with_defaults();
    let mut cache = heap.alloc_cache();

    let a = cache.alloc(5, true).unwrap();
    let b = cache.alloc(4, true).unwrap();
    let c = cache.alloc(2, true).unwrap();
    assert_eq!(b, a.add(8));
    assert_eq!(c, a.add(12));
    assert_eq!(cache.tiny().offset(), 14);
    assert_eq!(cache.tiny().allocs(), 2);

    // 8 bytes do not fit in the 2 left; a new block is taken
    let d = cache.alloc(8, true).unwrap();
    assert_eq!(d.offset_from(a), 16);
    assert_eq!(cache.tiny().block(), Some(d));
    assert_eq!(cache.tiny().offset(), 8);
}

#[test]
fn pointer_objects_skip_tiny_path() {
    let heap = Heap::with_defaults();
    let mut cache = heap.alloc_cache();
    cache.alloc(5, false).unwrap();
    assert!(cache.tiny().block().is_none());
    assert!(cache.donor(spc(8, false)).is_some());
}

// ===== Refill Tests =====

#[test]
fn refill_replaces_exhausted_donor() {
    let heap = Heap::with_defaults();
    let mut cache = heap.alloc_cache();
    let class = spc(1024, true);
    let per_span = objects_per_span(class.size_class());

    for _ in 0..per_span {
        cache.alloc(1024, true).unwrap();
    }
    let first = cache.donor(class).unwrap();
    assert_eq!(cache.donor_free(class), 0);
    assert_eq!(cache.local_stats().refills, 1);

    cache.alloc(1024, true).unwrap();
    let second = cache.donor(class).unwrap();
    assert_ne!(first, second);
    assert!(!first.in_cache());
    assert_eq!(cache.local_stats().refills, 2);
    assert_eq!(heap.central(class).stats().retired, 1);
}

#[test]
fn explicit_refill_of_empty_slot() {
    let heap = Heap::with_defaults();
    let mut cache = heap.alloc_cache();
    let class = spc(256, false);

    cache.refill(class);
    let span = cache.donor(class).unwrap();
    assert!(span.in_cache());
    assert_eq!(cache.donor_free(class), span.nelems());
    assert_eq!(heap.central(class).stats().retired, 0);
}

#[test]
fn refill_flushes_past_threshold() {
    let heap = heap_with(AllocConfig {
        stats_flush_threshold: 4,
        ..AllocConfig::default()
    });
    let mut cache = heap.alloc_cache();

    for _ in 0..9 {
        cache.alloc(1024, true);
    }
    assert_eq!(heap.stats().total_allocs(), 8);
    assert_eq!(cache.local_stats().total_allocs(), 1);
}

#[test]
fn zero_threshold_never_flushes_on_refill() {
    let heap = heap_with(AllocConfig {
        stats_flush_threshold: 0,
        ..AllocConfig::default()
    });
    let mut cache = heap.alloc_cache();

    for _ in 0..50 {
        cache.alloc(1024, true);
    }
    assert_eq!(heap.stats().total_allocs(), 0);
    drop(cache);
    assert_eq!(heap.stats().total_allocs(), 50);
}

// ===== Release Tests =====

#[test]
fn release_all_empties_every_slot() {
    let heap = Heap::with_defaults();
    let mut cache = heap.alloc_cache();

    cache.alloc(8, false);
    cache.alloc(3, true);
    cache.alloc(2048, true);
    assert_eq!(cache.cached_spans(), 3);

    assert_eq!(cache.release_all(), 3);
    assert_eq!(cache.cached_spans(), 0);
    assert!(cache.tiny().block().is_none());
    assert_eq!(cache.tiny().offset(), 0);
    assert_eq!(heap.central_stats().uncached, 3);

    // Nothing left to release
    assert_eq!(cache.release_all(), 0);
    assert_eq!(heap.central_stats().uncached, 3);
}

#[test]
fn teardown_flushes_and_releases() {
    let heap = Heap::with_defaults();
    {
        let mut cache = heap.alloc_cache();
        cache.alloc(3, true);
        cache.alloc(3, true);
        cache.note_large_free(1 << 20);
        cache.stack_alloc(1);
    }

    let stats = heap.stats();
    assert_eq!(stats.caches_inuse, 0);
    assert_eq!(stats.tiny_allocs, 1);
    assert_eq!(stats.large_frees, 1);
    assert_eq!(stats.large_free_bytes, 1 << 20);
    assert_eq!(heap.central_stats().uncached, 1);
    assert!(heap.stack_pool().available(1) > 0);
}

#[test]
fn swapped_caches_return_storage_to_their_heaps() {
    let first = Heap::with_defaults();
    let second = Heap::with_defaults();
    let mut a = first.alloc_cache();
    let mut b = second.alloc_cache();
    let first_storage = &*a as *const AllocatorCache<'_> as usize;

    a.alloc(64, true);
    b.alloc(64, true);
    b.alloc(64, true);
    std::mem::swap(&mut *a, &mut *b);
    assert!(std::ptr::eq(a.heap(), &second));
    drop(a);
    drop(b);

    // Contents flush to their own heap, storage goes back where it came from
    assert_eq!(first.stats().caches_inuse, 0);
    assert_eq!(second.stats().caches_inuse, 0);
    assert_eq!(first.stats().total_allocs(), 1);
    assert_eq!(second.stats().total_allocs(), 2);

    let reused = second.alloc_cache();
    assert_ne!(&*reused as *const AllocatorCache<'_> as usize, first_storage);
    let own = first.alloc_cache();
    assert_eq!(&*own as *const AllocatorCache<'_> as usize, first_storage);
}

// ===== Free & Lookup Tests =====

#[test]
fn free_counts_locally() {
    let heap = Heap::with_defaults();
    let mut cache = heap.alloc_cache();
    let class = size_to_class(500).unwrap();

    let addr = cache.alloc(500, true).unwrap();
    cache.free(addr);
    assert_eq!(cache.local_stats().small_frees[class], 1);

    let span = heap.span_of(addr).unwrap();
    assert_eq!(span.pending_frees(), 1);
}

#[test]
fn objects_freed_by_another_cache_return() {
    let heap = Heap::with_defaults();
    let mut owner = heap.alloc_cache();
    let mut other = heap.alloc_cache();

    let a = owner.alloc(32, true).unwrap();
    let _b = owner.alloc(32, true).unwrap();
    other.free(a);
    drop(owner);

    // The span went back partially free; the freed slot comes out first
    assert_eq!(other.alloc(32, true), Some(a));
}

#[test]
fn find_object_resolves_interior_pointers() {
    let heap = Heap::with_defaults();
    let mut cache = heap.alloc_cache();
    let addr = cache.alloc(300, false).unwrap();

    assert_eq!(cache.find_object(addr.add(17)), Some((addr, 320)));
    assert_eq!(cache.find_object(Address::new(4096)), None);
    assert_eq!(cache.local_stats().lookups, 2);
}

// ===== Stack Cache Tests =====

#[test]
fn stack_cache_stays_within_budget() {
    let heap = Heap::with_defaults();
    let mut cache = heap.alloc_cache();
    let budget = heap.config().stack_cache_bytes;

    let segs: Vec<_> = (0..24).map(|_| cache.stack_alloc(0)).collect();
    assert_eq!(cache.stack_cached(0), 0);
    assert_eq!(heap.stack_pool().sys_bytes(), 64 * 1024);

    for seg in segs {
        unsafe { cache.stack_free(seg, 0) };
        assert!(cache.stack_cached(0) <= budget);
    }
    assert_eq!(cache.stack_cached(0), budget);
    assert_eq!(heap.stack_pool().available(0), 32 * 1024);

    cache.stack_cache_clear();
    assert_eq!(cache.stack_cached(0), 0);
    assert_eq!(heap.stack_pool().available(0), 64 * 1024);
}

#[test]
fn stack_segments_hold_data() {
    let heap = Heap::with_defaults();
    let mut cache = heap.alloc_cache();
    for order in 0..NUM_STACK_ORDERS {
        let seg = cache.stack_alloc(order);
        unsafe { std::ptr::write_bytes(seg.as_ptr(), order as u8, segment_size(order)) };
        unsafe { cache.stack_free(seg, order) };
    }
}

#[test]
fn large_stack_orders_bypass_the_cache() {
    let heap = Heap::with_defaults();
    let mut cache = heap.alloc_cache();
    let order = NUM_STACK_ORDERS + 1;

    let seg = cache.stack_alloc(order);
    assert_eq!(seg.as_usize() % PAGE_SIZE, 0);
    unsafe { std::ptr::write_bytes(seg.as_ptr(), 0xab, segment_size(order)) };
    assert_eq!(heap.stack_pool().sys_bytes(), 0);

    unsafe { cache.stack_free(seg, order) };
    assert!((0..NUM_STACK_ORDERS).all(|o| cache.stack_cached(o) == 0));

    // The run went back to the page heap and comes out again
    assert_eq!(cache.stack_alloc(order), seg);
}

// ===== Sampling Tests =====

#[test]
fn every_alloc_sampled_at_rate_one() {
    let heap = heap_with(AllocConfig {
        sample_rate: 1,
        ..AllocConfig::default()
    });
    let mut cache = heap.alloc_cache();
    for size in [8, 100, 3000] {
        cache.alloc(size, false);
    }
    assert_eq!(cache.local_stats().samples, 3);
    // 8 + 112 + 3072: small objects are charged their class size
    assert_eq!(cache.local_stats().sampled_bytes, 3192);
}

#[test]
fn sample_gap_shrinks_by_class_size() {
    let heap = heap_with(AllocConfig {
        sample_rate: 1 << 30,
        ..AllocConfig::default()
    });
    let mut cache = heap.alloc_cache();

    let before = cache.next_sample();
    cache.alloc(1000, true);
    assert_eq!(before - cache.next_sample(), 1024);

    let before = cache.next_sample();
    cache.alloc(5, true);
    assert_eq!(before - cache.next_sample(), 5);
}

#[test]
fn sampling_disabled_at_rate_zero() {
    let heap = heap_with(AllocConfig {
        sample_rate: 0,
        ..AllocConfig::default()
    });
    let mut cache = heap.alloc_cache();
    for _ in 0..1000 {
        cache.alloc(4096, true);
    }
    assert_eq!(cache.local_stats().samples, 0);
    assert_eq!(cache.next_sample(), i32::MAX);
}

#[test]
fn handle_moves_between_workers() {
    fn assert_send<T: Send>() {}
    assert_send::<CacheHandle<'static>>();

    let heap = Heap::with_defaults();
    let mut cache = heap.alloc_cache();
    let addr = cache.alloc(64, false).unwrap();

    let mut cache = std::thread::scope(|s| {
        s.spawn(move || {
            cache.free(addr);
            cache
        })
        .join()
        .unwrap()
    });
    assert_eq!(cache.local_stats().small_frees[size_to_class(64).unwrap()], 1);
    cache.release_all();
}
