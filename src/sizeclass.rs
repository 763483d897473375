//! Size class table - fixed mapping from request size to object size
//!
//! Design: 66 small classes from 8 bytes to 32KB, each backed by spans of a
//! fixed page count. Class 0 is reserved for large objects and is never
//! cached. Lookups are two const-built tables so the fast path is a shift,
//! an index and a load.

/// Span pages are 8KB.
pub const PAGE_SHIFT: usize = 13;
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// Number of size classes, including the large-object class 0.
pub const NUM_SIZE_CLASSES: usize = 67;

/// Two span classes (scan / noscan) per size class.
pub const NUM_SPAN_CLASSES: usize = NUM_SIZE_CLASSES << 1;

/// Largest request served by a size class.
pub const MAX_SMALL_SIZE: usize = 32768;

/// Pointer-free requests below this size go through the tiny allocator.
pub const TINY_SIZE: usize = 16;

/// Size class of tiny blocks.
pub const TINY_SIZE_CLASS: usize = 2;

const SMALL_SIZE_DIV: usize = 8;
const SMALL_SIZE_MAX: usize = 1024;
const LARGE_SIZE_DIV: usize = 128;

/// Object size of each class. Index 0 is the large-object class.
#[rustfmt::skip]
pub const CLASS_TO_SIZE: [usize; NUM_SIZE_CLASSES] = [
    0, 8, 16, 32, 48, 64, 80, 96, 112, 128,
    144, 160, 176, 192, 208, 224, 240, 256,
    288, 320, 352, 384, 416, 448, 480, 512,
    576, 640, 704, 768, 896, 1024,
    1152, 1280, 1408, 1536, 1792, 2048,
    2304, 2688, 3072, 3200, 3456, 4096,
    4864, 5376, 6144, 6528, 6784, 6912, 8192,
    9472, 9728, 10240, 10880, 12288, 13568, 14336, 16384,
    18432, 19072, 20480, 21760, 24576, 27264, 28672, 32768,
];

/// Pages per span of each class.
pub const CLASS_TO_NPAGES: [usize; NUM_SIZE_CLASSES] = build_npages();

static SIZE_TO_CLASS8: [u8; SMALL_SIZE_MAX / SMALL_SIZE_DIV + 1] = build_class8();
static SIZE_TO_CLASS128: [u8; (MAX_SMALL_SIZE - SMALL_SIZE_MAX) / LARGE_SIZE_DIV + 1] =
    build_class128();

/// Smallest class whose object size fits `size`.
const fn class_for(size: usize) -> u8 {
    let mut class = 1;
    while class < NUM_SIZE_CLASSES {
        if CLASS_TO_SIZE[class] >= size {
            return class as u8;
        }
        class += 1;
    }
    0
}

const fn build_class8() -> [u8; SMALL_SIZE_MAX / SMALL_SIZE_DIV + 1] {
    let mut table = [0u8; SMALL_SIZE_MAX / SMALL_SIZE_DIV + 1];
    let mut i = 0;
    while i < table.len() {
        table[i] = class_for(i * SMALL_SIZE_DIV);
        i += 1;
    }
    table
}

const fn build_class128() -> [u8; (MAX_SMALL_SIZE - SMALL_SIZE_MAX) / LARGE_SIZE_DIV + 1] {
    let mut table = [0u8; (MAX_SMALL_SIZE - SMALL_SIZE_MAX) / LARGE_SIZE_DIV + 1];
    let mut i = 0;
    while i < table.len() {
        table[i] = class_for(SMALL_SIZE_MAX + i * LARGE_SIZE_DIV);
        i += 1;
    }
    table
}

/// Fewest pages whose tail waste stays within 1/8 of the span.
const fn build_npages() -> [usize; NUM_SIZE_CLASSES] {
    let mut table = [0usize; NUM_SIZE_CLASSES];
    let mut class = 1;
    while class < NUM_SIZE_CLASSES {
        let size = CLASS_TO_SIZE[class];
        let mut npages = 1;
        loop {
            let span = npages * PAGE_SIZE;
            if span >= size && span % size <= span / 8 {
                break;
            }
            npages += 1;
        }
        table[class] = npages;
        class += 1;
    }
    table
}

/// Size class for a request, or `None` if it must take the large-object path.
#[inline]
pub fn size_to_class(size: usize) -> Option<usize> {
    if size > MAX_SMALL_SIZE {
        return None;
    }
    let class = if size <= SMALL_SIZE_MAX - SMALL_SIZE_DIV {
        SIZE_TO_CLASS8[(size + SMALL_SIZE_DIV - 1) / SMALL_SIZE_DIV]
    } else {
        SIZE_TO_CLASS128[(size + LARGE_SIZE_DIV - 1 - SMALL_SIZE_MAX) / LARGE_SIZE_DIV]
    };
    Some(class.max(1) as usize)
}

#[inline]
pub fn class_to_size(class: usize) -> usize {
    CLASS_TO_SIZE[class]
}

#[inline]
pub fn class_to_npages(class: usize) -> usize {
    CLASS_TO_NPAGES[class]
}

/// Objects that fit in one span of `class`.
#[inline]
pub fn objects_per_span(class: usize) -> usize {
    match CLASS_TO_SIZE[class] {
        0 => 0,
        size => CLASS_TO_NPAGES[class] * PAGE_SIZE / size,
    }
}

/// Size class combined with the "holds no pointers" flag.
///
/// Encoded as `size_class << 1 | noscan` so the two variants of a class sit
/// next to each other in every per-span-class array.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SpanClass(u8);

impl SpanClass {
    #[inline]
    pub const fn new(size_class: usize, noscan: bool) -> Self {
        Self(((size_class << 1) | noscan as usize) as u8)
    }

    #[inline]
    pub const fn from_index(index: usize) -> Self {
        Self(index as u8)
    }

    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    #[inline]
    pub const fn size_class(self) -> usize {
        (self.0 >> 1) as usize
    }

    #[inline]
    pub const fn noscan(self) -> bool {
        self.0 & 1 != 0
    }

    /// Iterator over every span class, in index order.
    pub fn all() -> impl Iterator<Item = SpanClass> {
        (0..NUM_SPAN_CLASSES).map(SpanClass::from_index)
    }
}

const _: () = assert!(NUM_SPAN_CLASSES <= u8::MAX as usize + 1);

/// Span class used for tiny blocks.
pub const TINY_SPAN_CLASS: SpanClass = SpanClass::new(TINY_SIZE_CLASS, true);
