//! Fixed-size allocator for allocator metadata
//!
//! Design: Objects are carved from chunks obtained from the system
//! allocator, outside any region the collector scans. Freed objects go on
//! an intrusive free list of untraced links and are reused before any new
//! carving. Chunks are released only when the allocator drops.

use crate::addr::{Address, GcLink, GcLinkPtr};
use std::alloc::{alloc, dealloc, Layout};
use std::mem;
use std::ptr::NonNull;

/// Minimum bytes per chunk.
const CHUNK_BYTES: usize = 16 * 1024;

pub struct FixAlloc {
    size: usize,
    chunk_layout: Layout,
    chunks: Vec<NonNull<u8>>,
    list: GcLinkPtr,
    chunk: Address,
    nchunk: usize,
    inuse: usize,
}

// Safety: chunks are owned memory; callers serialise access (the heap lock).
unsafe impl Send for FixAlloc {}

impl FixAlloc {
    /// Allocator for objects of `layout`.
    pub fn new(layout: Layout) -> Self {
        let layout = layout
            .align_to(mem::align_of::<GcLink>())
            .unwrap_or(layout)
            .pad_to_align();
        let size = layout.size().max(layout.align());
        // Safety: `layout` is valid and padded, so its alignment is a power
        // of two and rounding `size` up cannot overflow.
        let chunk_layout =
            unsafe { Layout::from_size_align_unchecked(CHUNK_BYTES.max(size), layout.align()) };

        Self {
            size,
            chunk_layout,
            chunks: Vec::new(),
            list: GcLinkPtr::NULL,
            chunk: Address::NULL,
            nchunk: 0,
            inuse: 0,
        }
    }

    /// Allocator for values of `T`.
    pub fn for_type<T>() -> Self {
        Self::new(Layout::new::<T>())
    }

    /// Allocate one object. The memory is uninitialised.
    pub fn alloc(&mut self) -> Option<NonNull<u8>> {
        if !self.list.is_null() {
            let block = self.list;
            self.list = unsafe { (*block.ptr()).next };
            self.inuse += self.size;
            return NonNull::new(block.addr().as_ptr());
        }

        if self.nchunk < self.size {
            let chunk = NonNull::new(unsafe { alloc(self.chunk_layout) })?;
            self.chunks.push(chunk);
            self.chunk = Address::from_ptr(chunk.as_ptr());
            self.nchunk = self.chunk_layout.size();
        }

        let block = self.chunk;
        self.chunk = self.chunk.add(self.size);
        self.nchunk -= self.size;
        self.inuse += self.size;
        NonNull::new(block.as_ptr())
    }

    /// Return an object to the free list.
    ///
    /// # Safety
    /// `ptr` must come from [`alloc`](Self::alloc) on this allocator, must
    /// not be freed twice, and its contents must already be dropped.
    pub unsafe fn free(&mut self, ptr: NonNull<u8>) {
        let link = GcLinkPtr::from_addr(Address::from_ptr(ptr.as_ptr()));
        (*link.ptr()).next = self.list;
        self.list = link;
        self.inuse -= self.size;
    }

    /// Bytes currently handed out.
    pub fn inuse(&self) -> usize {
        self.inuse
    }

    /// Bytes obtained from the system.
    pub fn sys_bytes(&self) -> usize {
        self.chunks.len() * self.chunk_layout.size()
    }
}

impl Drop for FixAlloc {
    fn drop(&mut self) {
        for chunk in self.chunks.drain(..) {
            unsafe {
                dealloc(chunk.as_ptr(), self.chunk_layout);
            }
        }
    }
}
