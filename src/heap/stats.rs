//! Process-wide allocator statistics
//!
//! Only ever touched under the heap lock. Caches fold their local counters
//! in with [`HeapStats::absorb`].

use crate::cache::LocalStats;
use crate::sizeclass::NUM_SIZE_CLASSES;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeapStats {
    pub small_allocs: [u64; NUM_SIZE_CLASSES],
    pub small_frees: [u64; NUM_SIZE_CLASSES],
    pub tiny_allocs: u64,
    pub scan_bytes: u64,
    pub large_frees: u64,
    pub large_free_bytes: u64,
    pub lookups: u64,
    pub refills: u64,
    pub samples: u64,
    pub sampled_bytes: u64,
    pub flushes: u64,
    pub collections: u64,
    pub spans_inuse: u64,
    pub caches_inuse: u64,
    pub heap_sys_bytes: u64,
    pub stack_sys_bytes: u64,
}

impl Default for HeapStats {
    fn default() -> Self {
        Self {
            small_allocs: [0; NUM_SIZE_CLASSES],
            small_frees: [0; NUM_SIZE_CLASSES],
            tiny_allocs: 0,
            scan_bytes: 0,
            large_frees: 0,
            large_free_bytes: 0,
            lookups: 0,
            refills: 0,
            samples: 0,
            sampled_bytes: 0,
            flushes: 0,
            collections: 0,
            spans_inuse: 0,
            caches_inuse: 0,
            heap_sys_bytes: 0,
            stack_sys_bytes: 0,
        }
    }
}

impl HeapStats {
    /// Add `local` into the totals and zero it.
    pub fn absorb(&mut self, local: &mut LocalStats) {
        for class in 0..NUM_SIZE_CLASSES {
            self.small_allocs[class] += local.small_allocs[class];
            self.small_frees[class] += local.small_frees[class];
        }
        self.tiny_allocs += local.tiny_allocs;
        self.scan_bytes += local.scan_bytes;
        self.large_frees += local.large_frees;
        self.large_free_bytes += local.large_free_bytes;
        self.lookups += local.lookups;
        self.refills += local.refills;
        self.samples += local.samples;
        self.sampled_bytes += local.sampled_bytes;
        self.flushes += 1;

        *local = LocalStats::default();
    }

    pub fn total_allocs(&self) -> u64 {
        self.small_allocs.iter().sum()
    }

    pub fn total_frees(&self) -> u64 {
        self.small_frees.iter().sum()
    }

    /// Small objects allocated and not yet freed, as of the last flush.
    ///
    /// Exact only once every cache has flushed; a free can be flushed by one
    /// cache before another flushes the matching allocation.
    pub fn live_objects(&self) -> u64 {
        self.total_allocs().saturating_sub(self.total_frees())
    }
}
