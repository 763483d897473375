//! Collector hook - cache flush at mark termination
//!
//! Design: The collector's marking machinery lives elsewhere. What it needs
//! from the allocator is one step, run with the world stopped: every cache
//! gives back its spans, drains its stack segments and flushes its
//! statistics, so the collector sees no object in flight and exact totals.
//!
//! Exclusive access is the caller's proof that the world is stopped: the
//! hook takes `&mut AllocatorCache`, which no running worker can hold at
//! the same time.


use crate::cache::AllocatorCache;
use crate::heap::Heap;
use crate::logging::{log_mark_termination, perf};
use crate::worker::{lock_depth, preemptible};

/// Result of one mark-termination flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MarkTermination {
    pub caches: usize,
    pub spans_released: usize,
}

pub struct Collector<'h> {
    heap: &'h Heap,
}

impl<'h> Collector<'h> {
    pub fn new(heap: &'h Heap) -> Self {
        Self { heap }
    }

    /// Flush every cache in `caches`.
    pub fn mark_termination<'a, I>(&self, caches: I) -> MarkTermination
    where
        'h: 'a,
        I: IntoIterator<Item = &'a mut AllocatorCache<'h>>,
    {
        debug_assert!(
            preemptible(),
            "mark termination inside a no-preemption region ({} guards held)",
            lock_depth()
        );
        let timer = perf::track("mark_termination");
        let mut result = MarkTermination::default();

        for cache in caches {
            debug_assert!(std::ptr::eq(cache.heap(), self.heap));
            result.spans_released += cache.release_all();
            cache.stack_cache_clear();
            cache.flush_stats();
            result.caches += 1;
        }

        self.heap.note_collection();
        log_mark_termination(timer.elapsed_us(), result.caches, result.spans_released);
        result
    }
}
