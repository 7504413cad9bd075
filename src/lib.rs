//! Segregated-fit memory allocator
//!
//! This crate provides a [`Heap`], implementing the classic `malloc`, `free`,
//! `realloc` and `calloc` on top of a single contiguous memory region, that
//! grows like the program break (`sbrk`). On top of that, the [`Allocator`]
//! type implements the [`core::alloc::GlobalAlloc`]-trait, which is required
//! to use the [`alloc`-crate][alloc] on `#![no_std]`-targets.
//!
//! # Usage
//! The heap can be used on its own. Allocations are handed out as offsets
//! into the heap, the memory behind them is accessed through the heap:
//! ```
//! let mut heap = segfit::Heap::<{ 64 * 1024 }>::new();
//!
//! let a = heap.malloc(24).unwrap();
//! assert_eq!(a.offset() % 16, 0);
//! heap.payload_mut(a)[..5].copy_from_slice(b"hello");
//!
//! let b = heap.realloc(Some(a), 500).unwrap();
//! assert_eq!(&heap.payload(b)[..5], b"hello");
//! heap.free(Some(b));
//! assert!(heap.check_heap(line!()).is_ok());
//! ```
//! As a global allocator, just copy and paste the following code snippet into
//! your binary crate and adjust the capacity of the heap (here 4M):
//! ```no_run
//! #[global_allocator]
//! static ALLOCATOR: segfit::Allocator<{ 4 * 1024 * 1024 }> = segfit::Allocator::new();
//!
//! extern crate alloc;
//! ```
//!
//! # Implementation
//! The heap is a sequence of blocks, bounded by two zero-sized sentinels (the
//! prologue and the epilogue). Every block starts with a one-word header,
//! which contains the block size and three flags: whether the block is
//! allocated, whether the previous block is allocated and whether the previous
//! block has the minimum size of 16 bytes. All numbers below are byte offsets.
//! 1.  The heap is initialized with a single free chunk of 4096 bytes.
//!     ```text
//!     0    8                                          4104  4112
//!     | P  | FREE size = 4096                          | E  |
//!     ```
//!     Free blocks are kept in segregated free lists, one per size class. Free
//!     blocks repeat their header in a footer at their very end, so that the
//!     following block can find their start.
//! 2.  A block of 24 bytes is requested.
//!     ```text
//!     0    8          40                              4104  4112
//!     | P  | USED 32  | FREE size = 4064               | E  |
//!     ```
//!     The request is rounded up to include the header: 24 + 8 bytes are 32,
//!     which is a multiple of 16. Allocated blocks do not have a footer, since
//!     the following block records in its own header that its predecessor is
//!     allocated. The free block is split and the remainder is put back into
//!     the list for its size.
//! 3.  A block of 8 bytes is requested.
//!     ```text
//!     0    8          40     56                       4104  4112
//!     | P  | USED 32  |USED16| FREE size = 4048        | E  |
//!     ```
//!     The smallest possible block is 16 bytes: a header and a single word of
//!     payload.
//! 4.  The 8 byte block is freed.
//!     ```text
//!     0    8          40                              4104  4112
//!     | P  | USED 32  | FREE size = 4064               | E  |
//!     ```
//!     Freed blocks are immediately merged with free neighbours, hence there
//!     are never two free blocks next to each other.
//! 5.  If a free block of exactly 16 bytes remains (e.g. after freeing a block
//!     between two allocated ones), it has room for only a single link. Such
//!     blocks are kept in a separate singly-linked list and have no footer:
//!     the next block knows from its `prev_mini` flag, where they start.
//! 6.  If no free block is large enough for a request, the heap is extended by
//!     at least 4096 bytes. The old epilogue becomes the header of the new
//!     free block, which is merged with a free block before it, if any. If the
//!     capacity of the heap is exhausted, the request fails.
//!
//! Every mutating operation verifies the whole heap in debug builds, see
//! [`Heap::check_heap()`].
//!
//! [alloc]: https://doc.rust-lang.org/alloc/index.html
#![cfg_attr(not(test), no_std)]

mod heap;

pub use heap::{
    Allocation, BlockInfo, Heap, OutOfMemory, Violation, ViolationKind, ALIGNMENT, CHUNK_SIZE,
};

use core::alloc::{GlobalAlloc, Layout};
use core::ptr;
use heap::{Arena, Core};

/// The global memory allocator.
///
/// This guards the bookkeeping of a heap with a capacity of `N` bytes by a
/// spin lock, so that it can be shared as a `static`. The heap memory is part
/// of the static memory (e.g. the `.bss`-section), so the heap cannot grow
/// into the stack.
///
/// Its usage is simple: just copy and paste the following in the binary crate
/// you're developing. The capacity of the heap is `4096 * 1024` or 4M in this
/// example. Adjust that value to your needs.
/// ```no_run
/// #[global_allocator]
/// static ALLOCATOR: segfit::Allocator<{ 4096 * 1024 }> = segfit::Allocator::new();
/// ```
/// All allocations are aligned to 16 bytes. Requests with a greater alignment
/// are refused by returning a null pointer.
pub struct Allocator<const N: usize> {
    // kept outside of the lock: taking the lock must not reborrow the memory
    // behind pointers already handed out
    arena: Arena<N>,
    core: spin::Mutex<Core>,
}
impl<const N: usize> Allocator<N> {
    /// Create a new [`Allocator`].
    ///
    /// This function is a `const fn`, therefore you can call it directly when
    /// creating the allocator.
    ///
    /// # Panics
    /// This function will panic, if the supplied capacity, i.e. `N` is less
    /// than `16` or not divisible by `16`.
    #[must_use = "assign the allocator to a static variable and apply the `#[global_allocator]`-attribute to make it the global allocator"]
    pub const fn new() -> Self {
        Self {
            arena: Arena::new(),
            core: spin::Mutex::new(Core::new()),
        }
    }

    /// Verify the consistency of the underlying heap.
    ///
    /// See [`Heap::check_heap()`].
    pub fn check_heap(&self, tag: u32) -> Result<(), Violation> {
        self.core.lock().check_heap(&self.arena, tag)
    }

    fn to_ptr(&self, allocation: Option<Allocation>) -> *mut u8 {
        match allocation {
            // SAFETY: the offset of an allocation lies within the heap memory
            Some(allocation) => unsafe { self.arena.base_ptr().add(allocation.offset()) },
            None => ptr::null_mut(),
        }
    }

    fn to_allocation(&self, ptr: *mut u8) -> Allocation {
        Allocation::from_offset(ptr as usize - self.arena.base_ptr() as usize)
    }
}
impl<const N: usize> Default for Allocator<N> {
    fn default() -> Self {
        Self::new()
    }
}

// SAFETY: the arena is only accessed while holding the lock of `core`, apart
// from the payloads, which belong to the callers of the allocator.
unsafe impl<const N: usize> Sync for Allocator<N> {}

unsafe impl<const N: usize> GlobalAlloc for Allocator<N> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > ALIGNMENT {
            return ptr::null_mut();
        }
        let allocation = self.core.lock().malloc(&self.arena, layout.size());
        self.to_ptr(allocation)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        let allocation = self.to_allocation(ptr);
        self.core.lock().free(&self.arena, Some(allocation));
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        if layout.align() > ALIGNMENT {
            return ptr::null_mut();
        }
        let allocation = self.core.lock().calloc(&self.arena, 1, layout.size());
        self.to_ptr(allocation)
    }

    unsafe fn realloc(&self, ptr: *mut u8, _layout: Layout, new_size: usize) -> *mut u8 {
        let allocation = self.to_allocation(ptr);
        let allocation = self
            .core
            .lock()
            .realloc(&self.arena, Some(allocation), new_size);
        self.to_ptr(allocation)
    }
}
