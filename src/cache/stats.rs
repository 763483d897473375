//! Per-cache statistics, accumulated without synchronization and folded
//! into the heap totals on flush.

use crate::sizeclass::NUM_SIZE_CLASSES;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalStats {
    /// Objects handed out per size class (tiny blocks count as class 2).
    pub small_allocs: [u64; NUM_SIZE_CLASSES],
    /// Objects freed per size class.
    pub small_frees: [u64; NUM_SIZE_CLASSES],
    /// Allocations carved from an existing tiny block.
    pub tiny_allocs: u64,
    /// Bytes the collector must scan.
    pub scan_bytes: u64,
    pub large_frees: u64,
    pub large_free_bytes: u64,
    pub lookups: u64,
    pub refills: u64,
    pub samples: u64,
    pub sampled_bytes: u64,
}

impl Default for LocalStats {
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
        }
    }
}

impl LocalStats {
    pub fn total_allocs(&self) -> u64 {
        self.small_allocs.iter().sum()
    }

    pub fn total_frees(&self) -> u64 {
        self.small_frees.iter().sum()
    }

    /// Events recorded since the last flush.
    pub fn pending_events(&self) -> u64 {
        self.total_allocs() + self.total_frees() + self.tiny_allocs + self.large_frees + self.lookups
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}
