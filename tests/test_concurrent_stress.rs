use spancache::{Address, AllocConfig, Collector, Heap};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::thread;

const WORKERS: usize = 8;
const ROUNDS: usize = 2000;

/// Sizes spread over tiny, small and multi-page classes.
fn size_for(worker: usize, i: usize) -> usize {
    match (worker + i) % 5 {
        0 => 1 + i % 15,
        1 => 16 + (i * 7) % 240,
        2 => 256 + (i * 31) % 2048,
        3 => 4096 + (i * 131) % 12000,
        _ => 24 + (i % 4) * 8,
    }
}

#[test]
fn test_workers_never_share_objects() {
    let heap = Heap::new(AllocConfig {
        stats_flush_threshold: 64,
        ..AllocConfig::default()
    });
    let all = Mutex::new(HashSet::new());

    thread::scope(|s| {
        for worker in 0..WORKERS {
            let heap = &heap;
            let all = &all;
            s.spawn(move || {
                let mut cache = heap.alloc_cache();
                let mut mine = Vec::with_capacity(ROUNDS);

                for i in 0..ROUNDS {
                    let size = size_for(worker, i);
                    if size < 16 {
                        continue;
                    }
                    let addr = cache.alloc(size, i % 2 == 0).unwrap();
                    // Stamp the whole object with the worker id
                    unsafe { std::ptr::write_bytes(addr.as_ptr(), worker as u8 + 1, size) };
                    mine.push((addr, size));
                }

                for &(addr, size) in &mine {
                    let bytes = unsafe { std::slice::from_raw_parts(addr.as_ptr(), size) };
                    assert!(
                        bytes.iter().all(|&b| b == worker as u8 + 1),
                        "object {} overwritten by another worker",
                        addr
                    );
                }

                let mut all = all.lock().unwrap();
                for &(addr, _) in &mine {
                    assert!(all.insert(addr), "address {} handed to two workers", addr);
                }
            });
        }
    });
}

#[test]
fn test_cross_worker_frees_are_reused() {
    let heap = Heap::with_defaults();
    let (tx, rx) = std::sync::mpsc::channel::<Vec<Address>>();

    thread::scope(|s| {
        let producer_heap = &heap;
        s.spawn(move || {
            let mut cache = producer_heap.alloc_cache();
            for _ in 0..20 {
                let batch: Vec<_> = (0..100).map(|_| cache.alloc(128, false).unwrap()).collect();
                tx.send(batch).unwrap();
            }
        });

        let consumer_heap = &heap;
        s.spawn(move || {
            let mut cache = consumer_heap.alloc_cache();
            for batch in rx {
                for addr in batch {
                    cache.free(addr);
                }
            }
        });
    });

    let stats = heap.stats();
    assert_eq!(stats.total_allocs(), 2000);
    assert_eq!(stats.total_frees(), 2000);
    assert_eq!(stats.spans_inuse, 0);
    assert_eq!(stats.caches_inuse, 0);
}

#[test]
fn test_lookups_race_span_release() {
    let heap = Heap::with_defaults();
    let published = AtomicUsize::new(0);
    let done = AtomicBool::new(false);

    thread::scope(|s| {
        s.spawn(|| {
            let mut cache = heap.alloc_cache();
            for _ in 0..500 {
                // One full span of 1024-byte objects per round
                let batch: Vec<_> = (0..8).map(|_| cache.alloc(1024, true).unwrap()).collect();
                published.store(batch[3].as_usize(), Ordering::Release);
                cache.release_all();
                // The last free hands the span back to the page heap
                for addr in batch {
                    cache.free(addr);
                }
            }
            done.store(true, Ordering::Release);
        });

        s.spawn(|| {
            let mut cache = heap.alloc_cache();
            while !done.load(Ordering::Acquire) {
                let interior = Address::new(published.load(Ordering::Acquire)).add(100);
                if let Some((base, size)) = cache.find_object(interior) {
                    assert_eq!(size, 1024);
                    assert!(base <= interior && interior < base.add(size));
                }
            }
        });
    });

    let stats = heap.stats();
    assert_eq!(stats.spans_inuse, 0);
    assert_eq!(stats.total_allocs(), stats.total_frees());
}

#[test]
fn test_collection_between_parallel_phases() {
    let mut heap = Heap::with_defaults();

    let mut caches: Vec<_> = (0..WORKERS).map(|_| heap.alloc_cache()).collect();
    for phase in 0..3 {
        thread::scope(|s| {
            for (worker, cache) in caches.iter_mut().enumerate() {
                s.spawn(move || {
                    for i in 0..ROUNDS / 4 {
                        cache.alloc(size_for(worker, i + phase), i % 3 == 0).unwrap();
                    }
                });
            }
        });

        // World stopped: every handle is back on this thread
        let result = Collector::new(&heap).mark_termination(caches.iter_mut().map(|c| &mut **c));
        assert_eq!(result.caches, WORKERS);
        assert!(caches.iter().all(|c| c.cached_spans() == 0));
    }

    drop(caches);

    let stats = heap.stats();
    assert_eq!(stats.collections, 3);
    assert_eq!(stats.live_objects(), heap.live_objects());
}
