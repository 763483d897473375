//! Stack segment free lists
//!
//! Segments come in four orders, 2KB << order. A free list threads its
//! links through the segments themselves, so it costs one word per order.

use crate::addr::{Address, GcLinkPtr};

/// Number of cached segment orders.
pub const NUM_STACK_ORDERS: usize = 4;

/// Smallest segment size.
pub const FIXED_STACK: usize = 2048;

/// Bytes in a segment of `order`.
#[inline]
pub const fn segment_size(order: usize) -> usize {
    FIXED_STACK << order
}

/// Singly linked list of free segments of one order.
#[derive(Debug, Default)]
pub struct StackFreeList {
    head: GcLinkPtr,
    size: usize,
}

impl StackFreeList {
    pub const fn new() -> Self {
        Self {
            head: GcLinkPtr::NULL,
            size: 0,
        }
    }

    /// Total bytes on the list.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head.is_null()
    }

    /// Push a free segment of `bytes` bytes.
    ///
    /// # Safety
    /// `seg` must be an unused, writable segment of `bytes` bytes that stays
    /// valid while it is on the list.
    #[inline]
    pub unsafe fn push(&mut self, seg: Address, bytes: usize) {
        let link = GcLinkPtr::from_addr(seg);
        (*link.ptr()).next = self.head;
        self.head = link;
        self.size += bytes;
    }

    /// Pop a segment of `bytes` bytes.
    #[inline]
    pub fn pop(&mut self, bytes: usize) -> Option<Address> {
        if self.head.is_null() {
            return None;
        }
        let seg = self.head;
        // Safety: every linked segment was pushed through `push`.
        self.head = unsafe { (*seg.ptr()).next };
        self.size -= bytes;
        Some(seg.addr())
    }
}
