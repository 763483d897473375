//! Tiny allocator - packs small pointer-free objects into 16-byte blocks
//!
//! Objects below 16 bytes that hold no pointers share a block taken from the
//! 16-byte size class. The block is freed only when every object in it is
//! unreachable, so it must only ever hold pointer-free data.

use crate::addr::Address;
use crate::sizeclass::TINY_SIZE;

#[derive(Debug, Default)]
pub struct TinyAllocator {
    /// Current block, or null. Untraced.
    block: Address,
    /// Bytes used in `block`.
    offset: usize,
    /// Allocations carved from an existing block since the last flush.
    allocs: u64,
}

/// Offset alignment for an object of `size` bytes.
#[inline]
pub fn align_offset(offset: usize, size: usize) -> usize {
    if size & 7 == 0 {
        (offset + 7) & !7
    } else if size & 3 == 0 {
        (offset + 3) & !3
    } else if size & 1 == 0 {
        (offset + 1) & !1
    } else {
        offset
    }
}

impl TinyAllocator {
    pub const fn new() -> Self {
        Self {
            block: Address::NULL,
            offset: 0,
            allocs: 0,
        }
    }

    #[inline]
    pub fn block(&self) -> Option<Address> {
        (!self.block.is_null()).then_some(self.block)
    }

    #[inline]
    pub fn offset(&self) -> usize {
        self.offset
    }

    #[inline]
    pub fn allocs(&self) -> u64 {
        self.allocs
    }

    /// Carve `size` bytes from the current block if they fit.
    #[inline]
    pub fn try_alloc(&mut self, size: usize) -> Option<Address> {
        debug_assert!(size > 0 && size < TINY_SIZE);
        if self.block.is_null() {
            return None;
        }
        let off = align_offset(self.offset, size);
        if off + size > TINY_SIZE {
            return None;
        }
        self.offset = off + size;
        self.allocs += 1;
        Some(self.block.add(off))
    }

    /// Offer a fresh block whose first `size` bytes are already handed out.
    ///
    /// Keeps whichever of the old and new block has more room left.
    #[inline]
    pub fn offer(&mut self, block: Address, size: usize) {
        if self.block.is_null() || size < self.offset {
            self.block = block;
            self.offset = size;
        }
    }

    /// Forget the current block.
    #[inline]
    pub fn clear(&mut self) {
        self.block = Address::NULL;
        self.offset = 0;
    }

    /// Take the carve count for a flush.
    #[inline]
    pub fn take_allocs(&mut self) -> u64 {
        std::mem::take(&mut self.allocs)
    }
}
