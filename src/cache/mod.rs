//! Allocator cache - per-worker small object allocation
//!
//! Design: Each worker owns one cache and allocates from it without locks:
//! 1. Tiny path (pointer-free objects under 16 bytes, packed into a block)
//! 2. Span path (next free object of the donor span for the span class)
//! 3. Refill (exhausted donor goes back to its central list, a new one comes out)
//!
//! Ownership is enforced by the type system. A cache is only reachable
//! through a [`CacheHandle`], which can move between workers but not be
//! shared, or through `&mut AllocatorCache` lent to the collector.

mod sample;
mod stack;
mod stats;
mod tiny;

#[cfg(test)]
mod tests;

pub use sample::Sampler;
pub use stack::{segment_size, StackFreeList, FIXED_STACK, NUM_STACK_ORDERS};
pub use stats::LocalStats;
pub use tiny::{align_offset, TinyAllocator};

use crate::addr::Address;
use crate::error::{check, throw, InvariantViolation};
use crate::heap::{empty_span, Heap, SpanPtr};
use crate::logging::{
    log_cache_create, log_cache_destroy, log_heap_sample, log_refill, log_release_all,
    log_stats_flush,
};
use crate::sizeclass::{
    class_to_size, size_to_class, SpanClass, MAX_SMALL_SIZE, NUM_SPAN_CLASSES, PAGE_SIZE,
    TINY_SIZE, TINY_SPAN_CLASS,
};
use crate::worker::no_preempt;
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;

pub struct AllocatorCache<'h> {
    heap: &'h Heap,
    id: u32,
    /// Bytes left until the next heap-profile sample.
    next_sample: i32,
    /// Bytes allocated in pointer-containing classes since the last flush.
    local_scan: u64,
    tiny: TinyAllocator,
    /// Donor span per span class, or the empty sentinel.
    alloc: [SpanPtr; NUM_SPAN_CLASSES],
    stack_cache: [StackFreeList; NUM_STACK_ORDERS],
    stats: LocalStats,
    sampler: Sampler,
}

impl<'h> AllocatorCache<'h> {
    pub(crate) fn new(heap: &'h Heap, id: u32) -> Self {
        let mut sampler = Sampler::new(heap.config().sample_rate);
        let next_sample = sampler.next_gap();
        log_cache_create(id, next_sample);

        Self {
            heap,
            id,
            next_sample,
            local_scan: 0,
            tiny: TinyAllocator::new(),
            alloc: [empty_span(); NUM_SPAN_CLASSES],
            stack_cache: Default::default(),
            stats: LocalStats::default(),
            sampler,
        }
    }

    #[inline]
    pub fn id(&self) -> u32 {
        self.id
    }

    #[inline]
    pub fn heap(&self) -> &'h Heap {
        self.heap
    }

    /// Allocate `size` bytes.
    ///
    /// Returns `None` when `size` is above the largest size class; such
    /// requests belong to the large-object allocator. Memory is zeroed.
    #[inline]
    pub fn alloc(&mut self, size: usize, noscan: bool) -> Option<Address> {
        if size == 0 {
            return Some(Address::zero_base());
        }
        if size > MAX_SMALL_SIZE {
            return None;
        }

        // Sampling charges the bytes actually handed out: the request for
        // tiny objects, the rounded class size otherwise.
        let (addr, allocated) = if noscan && size < TINY_SIZE {
            (self.alloc_tiny(size), size)
        } else {
            let class = size_to_class(size)?;
            let addr = self.next_free(SpanClass::new(class, noscan));
            let rounded = class_to_size(class);
            if !noscan {
                self.local_scan += rounded as u64;
            }
            (addr, rounded)
        };

        if self.sampler.enabled() {
            self.next_sample -= allocated as i32;
            if self.next_sample <= 0 {
                self.record_sample(addr, allocated);
            }
        }
        Some(addr)
    }

    #[inline]
    fn alloc_tiny(&mut self, size: usize) -> Address {
        if let Some(addr) = self.tiny.try_alloc(size) {
            return addr;
        }
        let block = self.next_free(TINY_SPAN_CLASS);
        self.tiny.offer(block, size);
        block
    }

    /// Next object of `spc` from the donor span, refilling once if needed.
    #[inline]
    fn next_free(&mut self, spc: SpanClass) -> Address {
        // Safety: a donor span is owned by the cache holding it.
        let next = match unsafe { self.alloc[spc.index()].next_free() } {
            Some(next) => next,
            None => {
                self.refill(spc);
                let span = self.alloc[spc.index()];
                match unsafe { span.next_free() } {
                    Some(next) => next,
                    None => throw(InvariantViolation::CachedSpanFull {
                        span_class: spc,
                        nelems: span.nelems(),
                    }),
                }
            }
        };

        let (addr, needzero) = next;
        if needzero {
            let size = class_to_size(spc.size_class());
            unsafe { std::ptr::write_bytes(addr.as_ptr(), 0, size) };
        }
        self.stats.small_allocs[spc.size_class()] += 1;
        addr
    }

    #[cold]
    fn record_sample(&mut self, addr: Address, size: usize) {
        self.stats.samples += 1;
        self.stats.sampled_bytes += size as u64;
        self.next_sample = self.sampler.next_gap();
        log_heap_sample(self.id, addr, size, self.next_sample);
    }

    /// Replace the donor span for `spc` with one that has free objects.
    ///
    /// The current donor must be exhausted; refilling a span with objects
    /// left is a fatal error.
    pub fn refill(&mut self, spc: SpanClass) {
        let _guard = no_preempt();

        let old = self.alloc[spc.index()];
        // Safety: the donor span is ours until handed back below.
        check(unsafe { old.ensure_exhausted() });

        let central = self.heap.central(spc);
        if !old.is_empty_sentinel() {
            central.retire(self.heap, old);
        }

        let span = central.cache_span(self.heap);
        check(unsafe { span.ensure_has_free() });
        self.alloc[spc.index()] = span;
        self.stats.refills += 1;

        log_refill(
            self.id,
            spc,
            span.base(),
            span.nelems(),
            span.nelems() - unsafe { span.alloc_count() },
        );

        let threshold = self.heap.config().stats_flush_threshold;
        if threshold > 0 && self.stats.pending_events() >= threshold {
            self.flush_stats();
        }
    }

    /// Give every donor span back to its central list and drop the tiny
    /// block. Returns how many spans were released.
    pub fn release_all(&mut self) -> usize {
        let mut released = 0;
        for spc in SpanClass::all() {
            let span = self.alloc[spc.index()];
            if !span.is_empty_sentinel() {
                self.heap.central(spc).uncache_span(self.heap, span);
                self.alloc[spc.index()] = empty_span();
                released += 1;
            }
        }
        self.tiny.clear();

        log_release_all(self.id, released);
        released
    }

    /// Free the small object at `addr`.
    ///
    /// Freeing an address that is not the start of a live small object
    /// aborts (immediately, or when the owning span is next swept).
    pub fn free(&mut self, addr: Address) {
        let Some(object) = self.heap.locate(addr) else {
            throw(InvariantViolation::WildFree { addr });
        };

        let spc = object.spanclass;
        self.heap.central(spc).free_object(self.heap, addr);
        self.stats.small_frees[spc.size_class()] += 1;
    }

    /// Resolve an interior address to its object's base and size.
    pub fn find_object(&mut self, addr: Address) -> Option<(Address, usize)> {
        self.stats.lookups += 1;
        self.heap.find_object(addr)
    }

    /// Record a free made by the large-object allocator.
    pub fn note_large_free(&mut self, bytes: usize) {
        self.stats.large_frees += 1;
        self.stats.large_free_bytes += bytes as u64;
    }

    /// Allocate a stack segment of `order`.
    ///
    /// Orders past the cached ones are whole page runs taken straight from
    /// the page heap. `segment_size(order)` must not overflow.
    pub fn stack_alloc(&mut self, order: usize) -> Address {
        let bytes = segment_size(order);
        if order >= NUM_STACK_ORDERS {
            return self.heap.alloc_stack_pages(bytes / PAGE_SIZE);
        }
        let list = &mut self.stack_cache[order];
        if list.is_empty() {
            let target = self.heap.config().stack_cache_bytes / 2;
            self.heap
                .stack_pool()
                .refill(self.heap, order, list, target.max(bytes));
        }
        match list.pop(bytes) {
            Some(seg) => seg,
            None => throw(InvariantViolation::OutOfMemory { pages: 0 }),
        }
    }

    /// Free a stack segment of `order`.
    ///
    /// # Safety
    /// `seg` must come from [`stack_alloc`](Self::stack_alloc) with the same
    /// order and must not be in use.
    pub unsafe fn stack_free(&mut self, seg: Address, order: usize) {
        if order >= NUM_STACK_ORDERS {
            self.heap.free_stack_pages(seg, segment_size(order) / PAGE_SIZE);
            return;
        }
        let budget = self.heap.config().stack_cache_bytes;
        let list = &mut self.stack_cache[order];
        if list.size() >= budget {
            self.heap.stack_pool().release(order, list, budget / 2);
        }
        list.push(seg, segment_size(order));
    }

    /// Return every cached stack segment to the global pool.
    pub fn stack_cache_clear(&mut self) {
        for (order, list) in self.stack_cache.iter_mut().enumerate() {
            self.heap.stack_pool().release(order, list, 0);
        }
    }

    /// Fold local statistics into the heap totals.
    pub fn flush_stats(&mut self) {
        let id = self.id;
        let local = self.pending_stats();
        log_stats_flush(id, local.total_allocs(), local.total_frees(), local.scan_bytes);
        self.heap.flush(&mut self.stats);
    }

    /// Local statistics with the tiny and scan counters folded in.
    fn pending_stats(&mut self) -> &mut LocalStats {
        self.stats.tiny_allocs += self.tiny.take_allocs();
        self.stats.scan_bytes += std::mem::take(&mut self.local_scan);
        &mut self.stats
    }

    // ===== Introspection =====

    /// Unflushed local statistics.
    pub fn local_stats(&self) -> &LocalStats {
        &self.stats
    }

    pub fn tiny(&self) -> &TinyAllocator {
        &self.tiny
    }

    pub fn local_scan(&self) -> u64 {
        self.local_scan
    }

    pub fn next_sample(&self) -> i32 {
        self.next_sample
    }

    /// Donor span for `spc`, or `None` at the sentinel.
    pub fn donor(&self, spc: SpanClass) -> Option<SpanPtr> {
        let span = self.alloc[spc.index()];
        (!span.is_empty_sentinel()).then_some(span)
    }

    /// Objects left in the donor span for `spc`.
    pub fn donor_free(&self, spc: SpanClass) -> usize {
        let span = self.alloc[spc.index()];
        span.nelems() - unsafe { span.alloc_count() }
    }

    /// Number of span classes holding a donor span.
    pub fn cached_spans(&self) -> usize {
        self.alloc.iter().filter(|s| !s.is_empty_sentinel()).count()
    }

    /// Bytes of stack segments cached for `order`.
    pub fn stack_cached(&self, order: usize) -> usize {
        self.stack_cache[order].size()
    }
}

/// Exclusive handle to a cache.
///
/// Not `Clone` and not `Sync`: at most one worker can use the cache at a
/// time. Dropping the handle tears the cache down.
pub struct CacheHandle<'h> {
    cache: NonNull<AllocatorCache<'h>>,
    /// Heap the storage came from. The contents can be swapped with
    /// another handle's, so teardown never trusts `cache.heap` for this.
    heap: &'h Heap,
}

// Safety: the handle owns the cache outright; moving it moves ownership.
unsafe impl Send for CacheHandle<'_> {}

impl<'h> CacheHandle<'h> {
    /// # Safety
    /// `cache` must be a live cache whose storage came from `heap`, with no
    /// other handle.
    pub(crate) unsafe fn from_raw(heap: &'h Heap, cache: NonNull<AllocatorCache<'h>>) -> Self {
        Self { cache, heap }
    }
}

impl<'h> Deref for CacheHandle<'h> {
    type Target = AllocatorCache<'h>;

    #[inline]
    fn deref(&self) -> &AllocatorCache<'h> {
        unsafe { self.cache.as_ref() }
    }
}

impl<'h> DerefMut for CacheHandle<'h> {
    #[inline]
    fn deref_mut(&mut self) -> &mut AllocatorCache<'h> {
        unsafe { self.cache.as_mut() }
    }
}

impl Drop for CacheHandle<'_> {
    fn drop(&mut self) {
        let _guard = no_preempt();
        let id = self.id();

        // Spans, segments and counters go back to the heap they came from,
        // which is not the storage heap if contents were swapped.
        self.release_all();
        self.stack_cache_clear();
        self.flush_stats();
        // Safety: the handle is the only reference and is going away.
        unsafe { self.heap.free_cache(self.cache) };

        log_cache_destroy(id);
    }
}
