//! Untraced address types
//!
//! Design: Everything the cache holds into heap memory is a plain integer
//! address, never a reference. Nothing in this crate derives ownership or
//! reachability from these values; a collector must not trace them.

use std::fmt;

/// Raw address of a heap object or region.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Address(usize);

/// Backing word for zero-sized allocations.
static ZERO_BASE: u64 = 0;

impl Address {
    pub const NULL: Address = Address(0);

    #[inline]
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    #[inline]
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self(ptr as usize)
    }

    /// Shared address returned for every zero-byte request.
    #[inline]
    pub fn zero_base() -> Self {
        Self::from_ptr(&ZERO_BASE as *const u64)
    }

    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0
    }

    #[inline]
    pub fn as_ptr(self) -> *mut u8 {
        self.0 as *mut u8
    }

    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub const fn add(self, bytes: usize) -> Self {
        Self(self.0 + bytes)
    }

    /// Byte distance from `base` to `self`.
    #[inline]
    pub const fn offset_from(self, base: Address) -> usize {
        self.0 - base.0
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({:#x})", self.0)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Link node written into free memory blocks.
#[repr(C)]
pub struct GcLink {
    pub next: GcLinkPtr,
}

/// Pointer to a [`GcLink`] stored as an integer.
///
/// Free-list heads and links use this instead of `*mut GcLink` so that the
/// list is opaque to anything walking the cache: the pointee is unused
/// memory, not an object.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct GcLinkPtr(usize);

impl GcLinkPtr {
    pub const NULL: GcLinkPtr = GcLinkPtr(0);

    #[inline]
    pub const fn from_addr(addr: Address) -> Self {
        Self(addr.as_usize())
    }

    #[inline]
    pub const fn addr(self) -> Address {
        Address::new(self.0)
    }

    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Pointer form for reading or writing the link word.
    ///
    /// # Safety
    /// `self` must point to a live, writable block of at least
    /// `size_of::<GcLink>()` bytes that nothing else is using. The result
    /// must not be stored.
    #[inline]
    pub unsafe fn ptr(self) -> *mut GcLink {
        self.0 as *mut GcLink
    }
}

impl fmt::Debug for GcLinkPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GcLinkPtr({:#x})", self.0)
    }
}
