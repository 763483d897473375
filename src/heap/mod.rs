//! Global heap - shared state behind every allocator cache
//!
//! Design: Three layers, slowest last:
//! 1. Central free lists (one lock per span class)
//! 2. Page heap (global lock, carves spans from arenas)
//! 3. System allocator (rare, arena-sized blocks)
//!
//! The global lock also guards cache and span header storage and the
//! process-wide statistics. Span lookup by address goes through a
//! concurrent page table and takes no lock. A span is unmapped from the
//! table before its header is dropped, so a lookup that still holds its
//! table entry always sees a live span.

mod arena;
mod central;
mod fixalloc;
mod span;
mod stack_pool;
mod stats;


pub use arena::{Arena, PageHeap};
pub use central::{CentralFreeList, CentralStats};
pub use fixalloc::FixAlloc;
pub use span::{empty_span, Span, SpanPtr};
pub use stack_pool::StackPool;
pub use stats::HeapStats;

use crate::addr::Address;
use crate::cache::{AllocatorCache, CacheHandle, LocalStats};
use crate::config::AllocConfig;
use crate::error::{throw, InvariantViolation};
use crate::logging::{debug, log_span_alloc, log_span_free};
use crate::sizeclass::{class_to_npages, SpanClass, PAGE_SHIFT};
use crate::worker::no_preempt;
use crossbeam::utils::CachePadded;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};

struct HeapInner {
    pages: PageHeap,
    cache_alloc: FixAlloc,
    span_alloc: FixAlloc,
    stats: HeapStats,
}

/// A small object resolved through the page table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ObjectRef {
    pub span: SpanPtr,
    pub spanclass: SpanClass,
    pub index: usize,
}

pub struct Heap {
    config: AllocConfig,
    inner: Mutex<HeapInner>,
    central: Box<[CachePadded<CentralFreeList>]>,
    spans: DashMap<usize, SpanPtr>,
    stack_pool: StackPool,
    next_cache_id: AtomicU32,
}

impl Heap {
    pub fn new(config: AllocConfig) -> Self {
        let central = SpanClass::all()
            .map(|spc| CachePadded::new(CentralFreeList::new(spc)))
            .collect();

        debug!(
            arena_bytes = config.arena_bytes,
            max_heap_bytes = config.max_heap_bytes,
            sample_rate = config.sample_rate,
            "Heap created"
        );

        Self {
            inner: Mutex::new(HeapInner {
                pages: PageHeap::new(config.arena_bytes, config.max_heap_bytes),
                cache_alloc: FixAlloc::for_type::<AllocatorCache<'static>>(),
                span_alloc: FixAlloc::for_type::<Span>(),
                stats: HeapStats::default(),
            }),
            central,
            spans: DashMap::with_capacity(256),
            stack_pool: StackPool::new(),
            next_cache_id: AtomicU32::new(0),
            config,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(AllocConfig::default())
    }

    #[inline]
    pub fn config(&self) -> &AllocConfig {
        &self.config
    }

    /// Central free list for `spc`.
    #[inline]
    pub fn central(&self, spc: SpanClass) -> &CentralFreeList {
        &self.central[spc.index()]
    }

    #[inline]
    pub fn stack_pool(&self) -> &StackPool {
        &self.stack_pool
    }

    /// Create a cache for one worker.
    pub fn alloc_cache(&self) -> CacheHandle<'_> {
        let _guard = no_preempt();
        let id = self.next_cache_id.fetch_add(1, Ordering::Relaxed);

        let mut inner = self.inner.lock();
        let Some(storage) = inner.cache_alloc.alloc() else {
            drop(inner);
            throw(InvariantViolation::OutOfMemory { pages: 0 });
        };
        let cache = storage.cast::<AllocatorCache<'_>>();
        // Safety: fresh storage sized and aligned for a cache.
        unsafe { cache.as_ptr().write(AllocatorCache::new(self, id)) };
        inner.stats.caches_inuse += 1;
        drop(inner);

        // Safety: the cache was just written and nothing else refers to it.
        unsafe { CacheHandle::from_raw(self, cache) }
    }

    /// Drop a torn-down cache and return its storage.
    ///
    /// # Safety
    /// `cache` must be storage from [`alloc_cache`](Self::alloc_cache) on
    /// this heap, already flushed, and must not be used afterwards.
    pub(crate) unsafe fn free_cache(&self, cache: NonNull<AllocatorCache<'_>>) {
        let _guard = no_preempt();
        let mut inner = self.inner.lock();
        debug_assert!(cache.as_ref().local_stats().is_empty());
        std::ptr::drop_in_place(cache.as_ptr());
        inner.cache_alloc.free(cache.cast());
        inner.stats.caches_inuse -= 1;
    }

    /// Fold a cache's local statistics into the global totals.
    pub fn flush(&self, local: &mut LocalStats) {
        self.inner.lock().stats.absorb(local);
    }

    /// Carve a new span for `spc`. Aborts when out of memory.
    pub(crate) fn alloc_span(&self, spc: SpanClass) -> SpanPtr {
        let npages = class_to_npages(spc.size_class());
        let mut inner = self.inner.lock();
        let Some(base) = inner.pages.alloc_pages(npages) else {
            drop(inner);
            throw(InvariantViolation::OutOfMemory { pages: npages });
        };
        let Some(storage) = inner.span_alloc.alloc() else {
            inner.pages.free_pages(base, npages);
            drop(inner);
            throw(InvariantViolation::OutOfMemory { pages: 0 });
        };
        let storage = storage.cast::<Span>();
        // Safety: fresh storage sized and aligned for a span.
        unsafe { storage.as_ptr().write(Span::new(base, npages, spc)) };
        inner.stats.spans_inuse += 1;
        drop(inner);

        // Safety: the header lives until `free_span`.
        let span = unsafe { SpanPtr::from_raw(storage) };
        for page in 0..npages {
            self.spans.insert(page_index(base) + page, span);
        }

        log_span_alloc(spc, base, npages);
        span
    }

    /// Return an empty, uncached span to the page heap.
    ///
    /// Header storage is recycled for later spans, never returned to the
    /// system while the heap lives.
    ///
    /// # Safety
    /// No cache or central list may hold `span` any more.
    pub(crate) unsafe fn free_span(&self, span: SpanPtr) {
        let base = span.base();
        let npages = span.npages();
        let spc = span.spanclass();
        // Unmap first: waits out any lookup still holding a table entry.
        for page in 0..npages {
            self.spans.remove(&(page_index(base) + page));
        }

        {
            let mut inner = self.inner.lock();
            inner.pages.free_pages(base, npages);
            let header = span.as_non_null();
            std::ptr::drop_in_place(header.as_ptr());
            inner.span_alloc.free(header.cast());
            inner.stats.spans_inuse -= 1;
        }

        log_span_free(spc, base, npages);
    }

    /// Pages for the stack pool. Aborts when out of memory.
    pub(crate) fn alloc_stack_pages(&self, npages: usize) -> Address {
        let base = self.inner.lock().pages.alloc_pages(npages);
        match base {
            Some(base) => base,
            None => throw(InvariantViolation::OutOfMemory { pages: npages }),
        }
    }

    /// Return pages from [`alloc_stack_pages`](Self::alloc_stack_pages).
    ///
    /// # Safety
    /// The pages must no longer be in use.
    pub(crate) unsafe fn free_stack_pages(&self, base: Address, npages: usize) {
        self.inner.lock().pages.free_pages(base, npages);
    }

    /// Span containing `addr`, if any.
    ///
    /// The handle is only good while something keeps the span alive (an
    /// object in it, or the cache or central list holding it). Lookups
    /// that race with frees go through [`locate`](Self::locate) instead.
    #[inline]
    pub(crate) fn span_of(&self, addr: Address) -> Option<SpanPtr> {
        self.spans.get(&page_index(addr)).map(|entry| *entry)
    }

    /// Run `f` on the span containing `addr` while its table entry is
    /// held, so the span cannot be released underneath it. `f` must not
    /// take allocator locks.
    #[inline]
    fn with_span<R>(&self, addr: Address, f: impl FnOnce(SpanPtr) -> Option<R>) -> Option<R> {
        let entry = self.spans.get(&page_index(addr))?;
        f(*entry)
    }

    /// The object starting exactly at `addr`.
    pub(crate) fn locate(&self, addr: Address) -> Option<ObjectRef> {
        self.with_span(addr, |span| {
            let index = span.object_index(addr)?;
            (span.object_base(index) == addr).then_some(ObjectRef {
                span,
                spanclass: span.spanclass(),
                index,
            })
        })
    }

    /// Base and size of the object containing `addr`.
    pub fn find_object(&self, addr: Address) -> Option<(Address, usize)> {
        self.with_span(addr, |span| {
            let index = span.object_index(addr)?;
            Some((span.object_base(index), span.elem_size()))
        })
    }

    /// Snapshot of the global statistics.
    pub fn stats(&self) -> HeapStats {
        let inner = self.inner.lock();
        let mut stats = inner.stats.clone();
        stats.heap_sys_bytes = inner.pages.sys_bytes() as u64;
        stats.stack_sys_bytes = self.stack_pool.sys_bytes() as u64;
        stats
    }

    pub(crate) fn note_collection(&self) {
        self.inner.lock().stats.collections += 1;
    }

    /// Summed activity of every central list.
    pub fn central_stats(&self) -> CentralStats {
        self.central
            .iter()
            .map(|central| central.stats())
            .fold(CentralStats::default(), |acc, s| CentralStats {
                cached: acc.cached + s.cached,
                uncached: acc.uncached + s.uncached,
                retired: acc.retired + s.retired,
                grown: acc.grown + s.grown,
                released: acc.released + s.released,
                partial: acc.partial + s.partial,
            })
    }

    /// Objects allocated in all spans, counted from the span bitmaps.
    ///
    /// Needs `&mut self`: no cache can be alive, so every span is owned by
    /// its central list and any queued frees can be applied.
    pub fn live_objects(&mut self) -> u64 {
        let mut live = 0;
        for span in self.unique_spans() {
            // Safety: no caches exist, so nothing else touches span state.
            unsafe {
                if let Err(violation) = span.sweep() {
                    throw(violation);
                }
                live += span.alloc_count() as u64;
            }
        }
        live
    }

    fn unique_spans(&self) -> Vec<SpanPtr> {
        let mut seen = HashSet::new();
        self.spans
            .iter()
            .map(|entry| *entry.value())
            .filter(|span| seen.insert(span.base()))
            .collect()
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        let spans = self.unique_spans();
        self.spans.clear();
        for span in spans {
            // Safety: the heap is going away and no cache can outlive it.
            // Header storage goes with `span_alloc`.
            unsafe { std::ptr::drop_in_place(span.as_non_null().as_ptr()) };
        }
    }
}

#[inline]
fn page_index(addr: Address) -> usize {
    addr.as_usize() >> PAGE_SHIFT
}
