//! Worker preemption guard
//!
//! A worker inside a refill or cache create/destroy must not be rescheduled
//! or have its cache handed to the collector half way through. The guard is a
//! per-thread depth counter, nestable, released on drop.

use std::cell::Cell;
use std::marker::PhantomData;

thread_local! {
    static LOCKS: Cell<u32> = const { Cell::new(0) };
}

/// Raised preemption guard. Not `Send`: it must drop on the thread it was
/// raised on.
#[must_use]
pub struct NoPreempt {
    _not_send: PhantomData<*const ()>,
}

/// Raise the guard for the current worker.
#[inline]
pub fn no_preempt() -> NoPreempt {
    LOCKS.with(|locks| locks.set(locks.get() + 1));
    NoPreempt {
        _not_send: PhantomData,
    }
}

impl Drop for NoPreempt {
    #[inline]
    fn drop(&mut self) {
        LOCKS.with(|locks| locks.set(locks.get() - 1));
    }
}

/// Whether the current worker may be preempted.
#[inline]
pub fn preemptible() -> bool {
    lock_depth() == 0
}

/// Current guard nesting depth.
#[inline]
pub fn lock_depth() -> u32 {
    LOCKS.with(Cell::get)
}
