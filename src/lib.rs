//! A segregated-fit dynamic memory allocator over an sbrk-style heap.
//!
//! The allocator manages a single contiguous, monotonically growing region
//! of address space. Every block starts with an 8-byte boundary tag (a
//! "divider") packing the block size together with the allocated bits of
//! the block and of both neighbors; free blocks mirror the tag in a footer
//! and keep their free-list links in the payload. Freed blocks are indexed
//! by six size-classed lists, placement is best-fit within a 22.5% margin,
//! and released blocks coalesce eagerly with any free neighbor. Prologue
//! and epilogue sentinels pin both ends of the heap so coalescing and
//! traversal never special-case the borders.
//!
//! The implementation is wrapped up in a [`Segmalloc`] type. With the
//! `global` feature the crate also provides `GlobalSegmalloc`, an adapter
//! usable as `#[global_allocator]` on Linux, macOS and wasm32.
#![no_std]
#![deny(missing_docs)]
#![allow(dead_code)]
#![allow(clippy::missing_safety_doc)]

mod common;
mod heap;
mod verbose;

#[cfg(all(feature = "global", not(test)))]
mod global;
#[cfg(all(feature = "global", not(test)))]
pub use self::global::{allocated_bytes, GlobalSegmalloc};

#[cfg(target_arch = "wasm32")]
#[path = "wasm.rs"]
mod sys;

#[cfg(target_os = "macos")]
#[path = "macos.rs"]
mod sys;

#[cfg(target_os = "linux")]
#[path = "linux.rs"]
mod sys;

#[cfg(target_os = "windows")]
#[path = "windows.rs"]
mod sys;

/// An allocator instance
///
/// Instances of this type are used to allocate blocks of memory. For best
/// results only use one of these. The managed region is handed back to the
/// system when the instance is dropped.
pub struct Segmalloc(heap::Heap);

/// Constant initializer for `Segmalloc` structure.
pub const SEGMALLOC_INIT: Segmalloc = Segmalloc(heap::HEAP_INIT);

#[allow(clippy::new_without_default)]
impl Segmalloc {
    /// Creates a new instance of an allocator, same as `SEGMALLOC_INIT`.
    pub fn new() -> Segmalloc {
        SEGMALLOC_INIT
    }

    /// Sets up the prologue and epilogue sentinels of an empty heap.
    ///
    /// Calling this up front is optional: the first allocation initializes
    /// the heap on demand. Returns `false` when the backing region cannot
    /// be reserved.
    pub unsafe fn init(&mut self) -> bool {
        self.0.init()
    }

    /// Allocates `size` bytes.
    ///
    /// Returns a null pointer if the allocation fails and for `size == 0`.
    /// Returned payload pointers are 16-byte aligned; alignment above 16 is
    /// not supported.
    #[inline]
    pub unsafe fn malloc(&mut self, size: usize) -> *mut u8 {
        self.0.malloc(size)
    }

    /// Same as `malloc` for `nmemb * size` bytes, except the allocation is
    /// guaranteed to point to zeros if it succeeds. An unrepresentable
    /// product saturates and then fails as out-of-memory.
    #[inline]
    pub unsafe fn calloc(&mut self, nmemb: usize, size: usize) -> *mut u8 {
        self.0.calloc(nmemb, size)
    }

    /// Deallocates `ptr`, a previous allocation. `free(null)` is a no-op.
    #[inline]
    pub unsafe fn free(&mut self, ptr: *mut u8) {
        self.0.free(ptr)
    }

    /// Resizes the allocation `ptr` to `new_size` bytes.
    ///
    /// `realloc(null, n)` behaves as `malloc(n)` and `realloc(p, 0)` frees
    /// `p` and returns null. When the block already holds `new_size` bytes
    /// the pointer is returned unchanged; otherwise the payload moves and
    /// the old block is freed. On failure null is returned and the old
    /// allocation stays valid.
    #[inline]
    pub unsafe fn realloc(&mut self, ptr: *mut u8, new_size: usize) -> *mut u8 {
        self.0.realloc(ptr, new_size)
    }

    /// Walks the heap and every free list, verifying the structural
    /// invariants. `line` tags the diagnostic output of a failed check.
    pub unsafe fn check_heap(&mut self, line: u32) -> bool {
        self.0.check_heap(line)
    }

    /// Returns the number of bytes currently held by allocated blocks,
    /// headers included.
    pub unsafe fn allocated_bytes(&self) -> usize {
        self.0.allocated_bytes()
    }
}
