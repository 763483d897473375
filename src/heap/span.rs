//! Spans - runs of pages split into equal-size objects
//!
//! A span's geometry is fixed at creation. Its allocation state has exactly
//! one owner at a time: the cache it is installed in, or its central free
//! list (under the central lock) while it is not cached. Frees from other
//! workers never touch the state directly; they queue on `pending` and the
//! central list applies them when it owns the span.

use crate::addr::Address;
use crate::error::InvariantViolation;
use crate::sizeclass::{class_to_size, objects_per_span, SpanClass, PAGE_SIZE};
use bitvec::prelude::*;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::cell::UnsafeCell;
use std::fmt;
use std::ops::Deref;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};

/// Shared sentinel installed in every empty cache slot. It has no objects,
/// so the fast path finds it full and refills without a special case.
static EMPTY_SPAN: Lazy<Span> = Lazy::new(|| Span::new(Address::NULL, 0, SpanClass::from_index(0)));

struct SpanState {
    free_index: usize,
    alloc_bits: BitVec<u64, Lsb0>,
    alloc_count: usize,
    needzero: bool,
}

pub struct Span {
    base: Address,
    npages: usize,
    spanclass: SpanClass,
    elem_size: usize,
    nelems: usize,
    state: UnsafeCell<SpanState>,
    in_cache: AtomicBool,
    in_partial: AtomicBool,
    pending: Mutex<Vec<u32>>,
}

// Safety: `state` is only touched by the span's current owner (see module
// docs); everything else is atomic or locked.
unsafe impl Sync for Span {}
unsafe impl Send for Span {}

impl Span {
    pub(crate) fn new(base: Address, npages: usize, spanclass: SpanClass) -> Self {
        let size_class = spanclass.size_class();
        let (elem_size, nelems) = match size_class {
            0 => (npages * PAGE_SIZE, usize::from(npages > 0)),
            class => (class_to_size(class), objects_per_span(class)),
        };
        Self {
            base,
            npages,
            spanclass,
            elem_size,
            nelems,
            state: UnsafeCell::new(SpanState {
                free_index: 0,
                alloc_bits: bitvec![u64, Lsb0; 0; nelems],
                alloc_count: 0,
                needzero: false,
            }),
            in_cache: AtomicBool::new(false),
            in_partial: AtomicBool::new(false),
            pending: Mutex::new(Vec::new()),
        }
    }

    #[inline]
    pub fn base(&self) -> Address {
        self.base
    }

    #[inline]
    pub fn npages(&self) -> usize {
        self.npages
    }

    #[inline]
    pub fn spanclass(&self) -> SpanClass {
        self.spanclass
    }

    #[inline]
    pub fn elem_size(&self) -> usize {
        self.elem_size
    }

    #[inline]
    pub fn nelems(&self) -> usize {
        self.nelems
    }

    /// One past the last byte of the span.
    #[inline]
    pub fn limit(&self) -> Address {
        self.base.add(self.npages * PAGE_SIZE)
    }

    #[inline]
    pub fn is_empty_sentinel(&self) -> bool {
        std::ptr::eq(self, &*EMPTY_SPAN)
    }

    #[inline]
    pub fn in_cache(&self) -> bool {
        self.in_cache.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set_in_cache(&self, cached: bool) {
        self.in_cache.store(cached, Ordering::Release);
    }

    #[inline]
    pub(crate) fn in_partial(&self) -> bool {
        self.in_partial.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn set_in_partial(&self, listed: bool) {
        self.in_partial.store(listed, Ordering::Relaxed);
    }

    /// Object index containing `addr`, if `addr` is inside an object.
    #[inline]
    pub fn object_index(&self, addr: Address) -> Option<usize> {
        if addr < self.base || addr >= self.limit() {
            return None;
        }
        let index = addr.offset_from(self.base) / self.elem_size;
        (index < self.nelems).then_some(index)
    }

    #[inline]
    pub fn object_base(&self, index: usize) -> Address {
        self.base.add(index * self.elem_size)
    }

    /// Number of allocated objects.
    ///
    /// # Safety
    /// Caller must own the span.
    #[inline]
    pub(crate) unsafe fn alloc_count(&self) -> usize {
        (*self.state.get()).alloc_count
    }

    /// Whether every object is allocated.
    ///
    /// # Safety
    /// Caller must own the span.
    #[inline]
    pub(crate) unsafe fn is_full(&self) -> bool {
        self.alloc_count() >= self.nelems
    }

    /// Take the next free object. Returns its address and whether it may
    /// hold stale data.
    ///
    /// Never writes to a full span, so calling it on the shared sentinel is
    /// sound.
    ///
    /// # Safety
    /// Caller must own the span.
    #[inline]
    pub(crate) unsafe fn next_free(&self) -> Option<(Address, bool)> {
        if self.is_full() {
            return None;
        }
        let state = &mut *self.state.get();
        let index = state.free_index + state.alloc_bits[state.free_index..].first_zero()?;
        state.alloc_bits.set(index, true);
        state.alloc_count += 1;
        state.free_index = index + 1;
        Some((self.object_base(index), state.needzero))
    }

    /// Precondition of a refill: nothing left to hand out.
    ///
    /// # Safety
    /// Caller must own the span.
    pub(crate) unsafe fn ensure_exhausted(&self) -> Result<(), InvariantViolation> {
        let alloc_count = self.alloc_count();
        if alloc_count != self.nelems {
            return Err(InvariantViolation::RefillNotExhausted {
                span_class: self.spanclass,
                alloc_count,
                nelems: self.nelems,
            });
        }
        Ok(())
    }

    /// Postcondition of a refill: the new span has room.
    ///
    /// # Safety
    /// Caller must own the span.
    pub(crate) unsafe fn ensure_has_free(&self) -> Result<(), InvariantViolation> {
        if self.is_full() {
            return Err(InvariantViolation::CachedSpanFull {
                span_class: self.spanclass,
                nelems: self.nelems,
            });
        }
        Ok(())
    }

    /// Queue a free for the owner to apply.
    pub(crate) fn push_pending(&self, index: u32) {
        self.pending.lock().push(index);
    }

    pub fn pending_frees(&self) -> usize {
        self.pending.lock().len()
    }

    /// Apply queued frees. Returns how many objects were freed.
    ///
    /// # Safety
    /// Caller must own the span.
    pub(crate) unsafe fn sweep(&self) -> Result<usize, InvariantViolation> {
        let pending = std::mem::take(&mut *self.pending.lock());
        if pending.is_empty() {
            return Ok(0);
        }

        let state = &mut *self.state.get();
        for &index in &pending {
            let index = index as usize;
            if !state.alloc_bits[index] {
                return Err(InvariantViolation::DoubleFree {
                    addr: self.object_base(index),
                });
            }
            state.alloc_bits.set(index, false);
            state.alloc_count -= 1;
            state.free_index = state.free_index.min(index);
        }
        state.needzero = true;
        Ok(pending.len())
    }
}

impl fmt::Debug for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Span")
            .field("base", &self.base)
            .field("npages", &self.npages)
            .field("spanclass", &self.spanclass.index())
            .field("nelems", &self.nelems)
            .field("in_cache", &self.in_cache())
            .finish()
    }
}

/// Untraced handle to a heap-owned span. Compared by identity.
///
/// Handles are created only by the heap and stay valid until the heap
/// releases the span, which happens only once no cache or central list
/// refers to it. Released headers are recycled, so a stale handle may
/// name a different span later.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct SpanPtr(NonNull<Span>);

// Safety: see `Span`.
unsafe impl Send for SpanPtr {}
unsafe impl Sync for SpanPtr {}

impl SpanPtr {
    /// # Safety
    /// `span` must point to an initialised span owned by the heap.
    pub(crate) unsafe fn from_raw(span: NonNull<Span>) -> Self {
        Self(span)
    }

    #[inline]
    pub(crate) fn as_non_null(self) -> NonNull<Span> {
        self.0
    }
}

impl Deref for SpanPtr {
    type Target = Span;

    #[inline]
    fn deref(&self) -> &Span {
        unsafe { self.0.as_ref() }
    }
}

impl fmt::Debug for SpanPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

/// The shared empty span.
#[inline]
pub fn empty_span() -> SpanPtr {
    SpanPtr(NonNull::from(&*EMPTY_SPAN))
}
