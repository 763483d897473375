//! Global stack segment pool
//!
//! Caches move segments in and out in batches. When an order runs dry the
//! pool carves a fresh page run into segments. Runs are never given back to
//! the page heap.

use crate::addr::Address;
use crate::cache::{segment_size, StackFreeList, NUM_STACK_ORDERS};
use crate::heap::Heap;
use crate::sizeclass::PAGE_SIZE;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Pages carved per refill of an empty order.
const STACK_RUN_PAGES: usize = 4;

pub struct StackPool {
    lists: Mutex<[StackFreeList; NUM_STACK_ORDERS]>,
    sys_bytes: AtomicUsize,
}

impl StackPool {
    pub fn new() -> Self {
        Self {
            lists: Mutex::new(Default::default()),
            sys_bytes: AtomicUsize::new(0),
        }
    }

    /// Move segments of `order` into `list` until it holds `target` bytes.
    pub fn refill(&self, heap: &Heap, order: usize, list: &mut StackFreeList, target: usize) {
        let bytes = segment_size(order);
        let mut pool = self.lists.lock();
        while list.size() < target {
            let seg = match pool[order].pop(bytes) {
                Some(seg) => seg,
                None => {
                    self.carve(heap, &mut pool[order], order);
                    continue;
                }
            };
            // Safety: segments on the pool list are unused stack memory.
            unsafe { list.push(seg, bytes) };
        }
    }

    /// Move segments of `order` out of `list` until it holds at most
    /// `target` bytes.
    pub fn release(&self, order: usize, list: &mut StackFreeList, target: usize) {
        let bytes = segment_size(order);
        let mut pool = self.lists.lock();
        while list.size() > target {
            let Some(seg) = list.pop(bytes) else { break };
            unsafe { pool[order].push(seg, bytes) };
        }
    }

    /// Bytes of `order` segments sitting in the pool.
    pub fn available(&self, order: usize) -> usize {
        self.lists.lock()[order].size()
    }

    /// Bytes carved from the page heap.
    pub fn sys_bytes(&self) -> usize {
        self.sys_bytes.load(Ordering::Relaxed)
    }

    fn carve(&self, heap: &Heap, list: &mut StackFreeList, order: usize) {
        let bytes = segment_size(order);
        let run_bytes = STACK_RUN_PAGES * PAGE_SIZE;
        let base: Address = heap.alloc_stack_pages(STACK_RUN_PAGES);
        for offset in (0..run_bytes).step_by(bytes) {
            // Safety: the run is fresh, zeroed and owned by the pool.
            unsafe { list.push(base.add(offset), bytes) };
        }
        self.sys_bytes.fetch_add(run_bytes, Ordering::Relaxed);
    }
}

impl Default for StackPool {
    fn default() -> Self {
        Self::new()
    }
}
