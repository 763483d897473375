//! Central free lists - one per span class
//!
//! Design: A central list brokers spans between caches and the page heap.
//! It owns every span of its class that is not installed in a cache; the
//! ones with free objects sit on `partial`. All ownership changes (and every
//! free into a span it owns) happen under its lock.
//!
//! Lock order: central list, then page table, then heap. The heap never
//! calls back in.

use crate::addr::Address;
use crate::error::{check, throw, InvariantViolation};
use crate::heap::{Heap, SpanPtr};
use crate::sizeclass::SpanClass;
use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicU64, Ordering};

pub struct CentralFreeList {
    spanclass: SpanClass,
    partial: Mutex<Vec<SpanPtr>>,
    counters: CentralCounters,
}

#[derive(Default)]
struct CentralCounters {
    cached: AtomicU64,
    uncached: AtomicU64,
    retired: AtomicU64,
    grown: AtomicU64,
    released: AtomicU64,
}

/// Snapshot of a central list's activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CentralStats {
    /// Spans handed to caches.
    pub cached: u64,
    /// Spans given back by release-all.
    pub uncached: u64,
    /// Exhausted spans given back by refill.
    pub retired: u64,
    /// Spans carved from the page heap.
    pub grown: u64,
    /// Empty spans returned to the page heap.
    pub released: u64,
    /// Spans currently on the partial list.
    pub partial: usize,
}

impl CentralFreeList {
    pub fn new(spanclass: SpanClass) -> Self {
        Self {
            spanclass,
            partial: Mutex::new(Vec::new()),
            counters: CentralCounters::default(),
        }
    }

    #[inline]
    pub fn spanclass(&self) -> SpanClass {
        self.spanclass
    }

    /// Hand a span with at least one free object to a cache.
    ///
    /// Grows from the page heap when no partial span is left; heap
    /// exhaustion aborts.
    pub fn cache_span(&self, heap: &Heap) -> SpanPtr {
        let mut partial = self.partial.lock();
        while let Some(span) = partial.pop() {
            span.set_in_partial(false);
            // Safety: the span is not cached, so this list owns it.
            if unsafe { span.is_full() } {
                continue;
            }
            span.set_in_cache(true);
            self.counters.cached.fetch_add(1, Ordering::Relaxed);
            return span;
        }
        drop(partial);

        let span = heap.alloc_span(self.spanclass);
        span.set_in_cache(true);
        self.counters.grown.fetch_add(1, Ordering::Relaxed);
        self.counters.cached.fetch_add(1, Ordering::Relaxed);
        span
    }

    /// Take back a span a cache no longer holds. The span may have free
    /// objects left.
    pub fn uncache_span(&self, heap: &Heap, span: SpanPtr) {
        self.counters.uncached.fetch_add(1, Ordering::Relaxed);
        self.reclaim(heap, span);
    }

    /// Take back an exhausted span during refill.
    pub fn retire(&self, heap: &Heap, span: SpanPtr) {
        self.counters.retired.fetch_add(1, Ordering::Relaxed);
        self.reclaim(heap, span);
    }

    fn reclaim(&self, heap: &Heap, span: SpanPtr) {
        debug_assert_eq!(span.spanclass(), self.spanclass);
        debug_assert!(span.in_cache());

        let mut partial = self.partial.lock();
        span.set_in_cache(false);
        self.settle(heap, &mut partial, span);
    }

    /// Free the object starting at `addr`.
    ///
    /// If a cache holds the span the free is queued and applied when the
    /// span comes back; otherwise it is applied now. The object is resolved
    /// under the lock, so its span cannot be released in between; an
    /// address whose span of this class is gone was already freed.
    pub fn free_object(&self, heap: &Heap, addr: Address) {
        let mut partial = self.partial.lock();
        let object = match heap.locate(addr) {
            Some(object) if object.spanclass == self.spanclass => object,
            _ => {
                drop(partial);
                throw(InvariantViolation::DoubleFree { addr });
            }
        };

        let span = object.span;
        span.push_pending(object.index as u32);
        if !span.in_cache() {
            self.settle(heap, &mut partial, span);
        }
    }

    /// Apply pending frees to an owned span and file it by occupancy.
    fn settle(&self, heap: &Heap, partial: &mut MutexGuard<'_, Vec<SpanPtr>>, span: SpanPtr) {
        // Safety: the span is not cached and we hold the lock, so we own it.
        unsafe {
            check(span.sweep().map(drop));

            if span.alloc_count() == 0 {
                if span.in_partial() {
                    partial.retain(|s| *s != span);
                    span.set_in_partial(false);
                }
                self.counters.released.fetch_add(1, Ordering::Relaxed);
                heap.free_span(span);
            } else if !span.is_full() && !span.in_partial() {
                span.set_in_partial(true);
                partial.push(span);
            }
        }
    }

    pub fn stats(&self) -> CentralStats {
        CentralStats {
            cached: self.counters.cached.load(Ordering::Relaxed),
            uncached: self.counters.uncached.load(Ordering::Relaxed),
            retired: self.counters.retired.load(Ordering::Relaxed),
            grown: self.counters.grown.load(Ordering::Relaxed),
            released: self.counters.released.load(Ordering::Relaxed),
            partial: self.partial.lock().len(),
        }
    }
}
