//! Page heap - page-granular memory acquisition and reuse
//!
//! Design: Arenas come from the system allocator in large zeroed blocks and
//! are never returned until the heap drops. Freed page runs go into a
//! best-fit map keyed by base address so neighbours coalesce. Every run
//! handed out is zeroed.

use crate::addr::Address;
use crate::logging::log_arena_grow;
use crate::sizeclass::PAGE_SIZE;
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::collections::BTreeMap;
use std::ptr::NonNull;

/// One block of system memory, page aligned.
pub struct Arena {
    start: NonNull<u8>,
    layout: Layout,
}

// Safety: the arena is plain memory; access is coordinated by the heap lock
// and span ownership.
unsafe impl Send for Arena {}

impl Arena {
    /// Allocate a zeroed arena of `size` bytes (a multiple of the page size).
    pub fn new(size: usize) -> Option<Self> {
        let layout = Layout::from_size_align(size, PAGE_SIZE).ok()?;
        let start = NonNull::new(unsafe { alloc_zeroed(layout) })?;
        Some(Self { start, layout })
    }

    #[inline]
    pub fn base(&self) -> Address {
        Address::from_ptr(self.start.as_ptr())
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.layout.size()
    }

    #[inline]
    pub fn contains(&self, addr: Address) -> bool {
        let base = self.base();
        addr >= base && addr.offset_from(base) < self.size()
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        unsafe {
            dealloc(self.start.as_ptr(), self.layout);
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct FreeRun {
    npages: usize,
    arena: usize,
    zeroed: bool,
}

/// Page allocator over a growing set of arenas.
pub struct PageHeap {
    arenas: Vec<Arena>,
    free: BTreeMap<Address, FreeRun>,
    arena_bytes: usize,
    max_heap_bytes: usize,
    inuse_pages: usize,
}

impl PageHeap {
    pub fn new(arena_bytes: usize, max_heap_bytes: usize) -> Self {
        Self {
            arenas: Vec::new(),
            free: BTreeMap::new(),
            arena_bytes,
            max_heap_bytes,
            inuse_pages: 0,
        }
    }

    /// Allocate `npages` contiguous zeroed pages.
    ///
    /// Returns `None` when the system allocator fails or the heap limit
    /// would be exceeded.
    pub fn alloc_pages(&mut self, npages: usize) -> Option<Address> {
        debug_assert!(npages > 0);

        let (base, run) = match self.best_fit(npages) {
            Some(found) => found,
            None => {
                self.grow(npages)?;
                self.best_fit(npages)?
            }
        };

        self.free.remove(&base);
        if run.npages > npages {
            self.free.insert(
                base.add(npages * PAGE_SIZE),
                FreeRun {
                    npages: run.npages - npages,
                    ..run
                },
            );
        }

        if !run.zeroed {
            unsafe {
                std::ptr::write_bytes(base.as_ptr(), 0, npages * PAGE_SIZE);
            }
        }

        self.inuse_pages += npages;
        Some(base)
    }

    /// Return pages obtained from [`alloc_pages`](Self::alloc_pages).
    pub fn free_pages(&mut self, base: Address, npages: usize) {
        let Some(arena) = self.arenas.iter().position(|a| a.contains(base)) else {
            debug_assert!(false, "freeing pages outside any arena: {}", base);
            return;
        };

        self.inuse_pages -= npages;
        let mut base = base;
        let mut run = FreeRun {
            npages,
            arena,
            zeroed: false,
        };

        // Merge with the run that ends where this one starts
        if let Some((&prev_base, &prev)) = self.free.range(..base).next_back() {
            if prev.arena == arena && prev_base.add(prev.npages * PAGE_SIZE) == base {
                self.free.remove(&prev_base);
                base = prev_base;
                run.npages += prev.npages;
            }
        }

        // Merge with the run that starts where this one ends
        let end = base.add(run.npages * PAGE_SIZE);
        if let Some(next) = self.free.get(&end).copied() {
            if next.arena == arena {
                self.free.remove(&end);
                run.npages += next.npages;
            }
        }

        self.free.insert(base, run);
    }

    fn best_fit(&self, npages: usize) -> Option<(Address, FreeRun)> {
        self.free
            .iter()
            .filter(|(_, run)| run.npages >= npages)
            .min_by_key(|(base, run)| (run.npages, **base))
            .map(|(base, run)| (*base, *run))
    }

    fn grow(&mut self, npages: usize) -> Option<()> {
        let size = self.arena_bytes.max(npages * PAGE_SIZE);
        if self.max_heap_bytes != 0 && self.sys_bytes() + size > self.max_heap_bytes {
            return None;
        }

        let arena = Arena::new(size)?;
        let index = self.arenas.len();
        self.free.insert(
            arena.base(),
            FreeRun {
                npages: size / PAGE_SIZE,
                arena: index,
                zeroed: true,
            },
        );
        self.arenas.push(arena);

        log_arena_grow(size, self.sys_bytes());
        Some(())
    }

    /// Bytes obtained from the system.
    pub fn sys_bytes(&self) -> usize {
        self.arenas.iter().map(Arena::size).sum()
    }

    pub fn inuse_pages(&self) -> usize {
        self.inuse_pages
    }

    pub fn free_pages_total(&self) -> usize {
        self.free.values().map(|run| run.npages).sum()
    }
}
