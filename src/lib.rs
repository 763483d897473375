//! spancache - per-worker allocation caches for a size-class allocator
//!
//! Each worker owns an [`AllocatorCache`] and serves small allocations from
//! it without locks. Caches refill from per-span-class central free lists,
//! which in turn carve spans from a shared page heap.

pub mod addr;
pub mod cache;
pub mod config;
pub mod error;
pub mod gc;
pub mod heap;
pub mod logging;
pub mod sizeclass;
pub mod worker;

// Re-export core types
pub use addr::{Address, GcLinkPtr};
pub use cache::{AllocatorCache, CacheHandle, LocalStats};
pub use config::AllocConfig;
pub use error::{ConfigError, InvariantViolation};
pub use gc::{Collector, MarkTermination};
pub use heap::{CentralFreeList, Heap, HeapStats, SpanPtr};
pub use sizeclass::SpanClass;

use once_cell::sync::Lazy;

/// Process-wide heap, configured from the environment on first use.
static GLOBAL_HEAP: Lazy<Heap> = Lazy::new(|| Heap::new(AllocConfig::from_env()));

/// Initialize logging and the global heap.
pub fn init() {
    logging::init();
    Lazy::force(&GLOBAL_HEAP);
    logging::info!(
        arena_bytes = GLOBAL_HEAP.config().arena_bytes,
        sample_rate = GLOBAL_HEAP.config().sample_rate,
        "spancache initialized"
    );
}

/// The process-wide heap.
#[inline]
pub fn global_heap() -> &'static Heap {
    &GLOBAL_HEAP
}

/// C entry point for hosts linking the static library.
#[no_mangle]
pub extern "C" fn spancache_init() {
    init();
}
