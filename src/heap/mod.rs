//! This module provides the heap and its support types.
//!
//! The [`Heap`] owns an arena, which grows like `sbrk`, and a core holding
//! the segregated free lists. The core implements the classic
//! `malloc`-family of functions on top of any arena. Allocations are
//! identified by the offset of their payload in the heap, which is always a
//! multiple of 16.
mod arena;
mod block;
mod check;
mod free_list;
mod header;

pub(crate) use arena::Arena;
pub use block::BlockInfo;
pub use check::{Violation, ViolationKind};

use arena::WSIZE;
use block::{Block, Blocks, MIN_BLOCK_SIZE};
use free_list::FreeLists;
use header::Header;

use core::{cmp, fmt, slice};

/// The alignment of every payload (and block size).
pub const ALIGNMENT: usize = 16;

/// The minimum number of bytes the heap is extended by.
pub const CHUNK_SIZE: usize = 1 << 12;

/// Verify the heap around mutating operations, in debug builds only.
macro_rules! debug_check {
    ($core:expr, $arena:expr) => {
        if cfg!(debug_assertions) {
            if let Err(violation) = $core.check_heap($arena, line!()) {
                panic!("{}", violation);
            }
        }
    };
}

/// The heap could not be extended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutOfMemory;
impl fmt::Display for OutOfMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("heap capacity exhausted")
    }
}

/// An allocation handed out by a [`Heap`].
///
/// This is the offset of the payload within the heap. Handing it back to any
/// other heap than the one it was obtained from is a logic error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Allocation(usize);
impl Allocation {
    /// Reconstruct an allocation from a payload offset.
    pub(crate) const fn from_offset(offset: usize) -> Self {
        Self(offset)
    }

    /// The offset of the payload within the heap.
    pub const fn offset(self) -> usize {
        self.0
    }

    fn block(self) -> Block {
        Block::from_payload(self.0)
    }
}

/// A segregated-fit heap with a capacity of `N` bytes.
///
/// The heap starts out empty and is lazily initialized by the first
/// allocation. Afterwards it grows in steps of at least [`CHUNK_SIZE`] bytes
/// until the capacity is exhausted; memory is never given back.
///
/// # Layout
/// ```text
/// | prologue | block | block | ... | block | epilogue |
///   8 bytes    ^-- offset 8                  8 bytes
/// ```
/// Every block starts with a one-word header storing its size and flags. The
/// remaining layout depends on the state of the block:
/// ```text
/// allocated:    | header | payload ..................................... |
/// free:         | header | next | prev | ......................| footer |
/// free minimum: | header | next |
/// ```
/// Since the header of a block records whether the previous block is
/// allocated and whether it is a minimum block, neither allocated blocks nor
/// free minimum blocks need a footer.
pub struct Heap<const N: usize> {
    arena: Arena<N>,
    core: Core,
}
impl<const N: usize> Heap<N> {
    /// Create a new, uninitialized heap.
    ///
    /// # Panics
    /// This function will panic, if the capacity `N` is less than `16` or not
    /// divisible by `16`.
    pub const fn new() -> Self {
        Self {
            arena: Arena::new(),
            core: Core::new(),
        }
    }

    /// (Re-)initialize the heap.
    ///
    /// This discards all existing allocations, lays down the prologue and
    /// epilogue and extends the heap by an initial chunk. It is called by the
    /// first allocation automatically. If only the initial chunk could not be
    /// obtained, the heap is still usable and an error is returned.
    pub fn init(&mut self) -> Result<(), OutOfMemory> {
        self.core.init(&self.arena)
    }

    /// Allocate at least `size` bytes.
    ///
    /// A request of zero bytes returns `None` without allocating. Otherwise a
    /// 16-byte aligned allocation is returned, or `None` if the heap capacity
    /// is exhausted.
    pub fn malloc(&mut self, size: usize) -> Option<Allocation> {
        self.core.malloc(&self.arena, size)
    }

    /// Free an allocation. Freeing `None` does nothing.
    ///
    /// The block is merged with free neighbours immediately.
    pub fn free(&mut self, allocation: Option<Allocation>) {
        self.core.free(&self.arena, allocation)
    }

    /// Resize an allocation.
    ///
    /// `None` is treated like [`malloc()`](Self::malloc) and a size of zero
    /// like [`free()`](Self::free). Otherwise a new allocation is made, the
    /// contents are copied (up to the smaller of both sizes) and the old
    /// allocation is freed. If the new allocation fails, `None` is returned
    /// and the old allocation stays untouched.
    pub fn realloc(&mut self, allocation: Option<Allocation>, size: usize) -> Option<Allocation> {
        self.core.realloc(&self.arena, allocation, size)
    }

    /// Allocate a zeroed array of `count` elements of `size` bytes each.
    ///
    /// Returns `None` if the total size overflows or the allocation fails.
    pub fn calloc(&mut self, count: usize, size: usize) -> Option<Allocation> {
        self.core.calloc(&self.arena, count, size)
    }

    /// Verify the consistency of the whole heap and all free lists.
    ///
    /// Every block is visited in address order and its alignment, size,
    /// footer and previous-block flags are checked, as well as that it is not
    /// a free block following another free block. Afterwards all free lists
    /// are walked and their links, their members and the number of free
    /// blocks are compared with the heap walk. A heap, that was never
    /// initialized, is empty and therefore consistent.
    ///
    /// The `tag` is reported back in the [`Violation`] and should identify the
    /// call site, e.g. `line!()`. The first violation found is also logged.
    pub fn check_heap(&self, tag: u32) -> Result<(), Violation> {
        self.core.check_heap(&self.arena, tag)
    }

    /// The number of bytes usable by the caller, at least the requested size.
    pub fn usable_size(&self, allocation: Allocation) -> usize {
        usable_size(&self.arena, allocation)
    }

    /// The usable memory of an allocation.
    pub fn payload(&self, allocation: Allocation) -> &[u8] {
        let len = self.usable_size(allocation);
        let data = self.arena.range(allocation.0, len);
        // SAFETY: the range lies within the heap and the arena is only
        // written through `&mut self`, which the returned borrow excludes
        unsafe { slice::from_raw_parts(data, len) }
    }

    /// The usable memory of an allocation, mutably.
    pub fn payload_mut(&mut self, allocation: Allocation) -> &mut [u8] {
        let len = self.usable_size(allocation);
        let data = self.arena.range(allocation.0, len);
        // SAFETY: as above, and `&mut self` makes the borrow unique
        unsafe { slice::from_raw_parts_mut(data, len) }
    }

    /// The current size of the heap in bytes, including the sentinels.
    pub fn heap_size(&self) -> usize {
        self.arena.brk()
    }

    /// Iterate over all blocks in address order.
    pub fn blocks(&self) -> impl Iterator<Item = BlockInfo> + '_ {
        self.core.blocks(&self.arena)
    }

    /// Log every block of the heap at debug level.
    pub fn print_heap(&self) {
        log::debug!("heap of {} bytes:", self.heap_size());
        for block in self.blocks() {
            log::debug!(
                "  {:#08x}: {:>6} bytes, {}",
                block.offset,
                block.size,
                if block.allocated { "allocated" } else { "free" }
            );
        }
    }
}
impl<const N: usize> Default for Heap<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// The bookkeeping of a heap, i.e. everything but its memory.
///
/// The core operates on an arena passed to every call. This way the
/// memory can live outside of a lock guarding the core, see
/// [`Allocator`](crate::Allocator).
pub(crate) struct Core {
    lists: FreeLists,
    initialized: bool,
}
impl Core {
    pub const fn new() -> Self {
        Self {
            lists: FreeLists::new(),
            initialized: false,
        }
    }

    pub fn init<const N: usize>(&mut self, arena: &Arena<N>) -> Result<(), OutOfMemory> {
        arena.reset();
        self.lists.clear();
        self.initialized = false;

        let start = arena.sbrk(2 * WSIZE).ok_or(OutOfMemory)?;
        arena.set_header(start, Header::used(0));
        arena.set_header(start + WSIZE, Header::used(0).with_prev(true, false));
        self.initialized = true;

        self.extend_heap(arena, CHUNK_SIZE).ok_or(OutOfMemory)?;
        debug_check!(self, arena);
        Ok(())
    }

    pub fn malloc<const N: usize>(&mut self, arena: &Arena<N>, size: usize) -> Option<Allocation> {
        debug_check!(self, arena);
        if size == 0 {
            return None;
        }
        if !self.initialized {
            if let Err(err) = self.init(arena) {
                log::warn!("heap initialization failed: {}", err);
            }
            if !self.initialized {
                return None;
            }
        }

        let Some(asize) = adjust_size(size) else {
            log::warn!("malloc({}) -> request too large", size);
            return None;
        };

        let block = match self.lists.find_fit(arena, asize) {
            Some(block) => block,
            None => match self.extend_heap(arena, cmp::max(asize, CHUNK_SIZE)) {
                Some(block) => block,
                None => {
                    log::warn!("malloc({}) -> out of memory", size);
                    return None;
                }
            },
        };
        self.place(arena, block, asize);

        let allocation = Allocation(block.payload());
        log::trace!("malloc({}) -> {:#x}", size, allocation.0);
        debug_check!(self, arena);
        Some(allocation)
    }

    pub fn free<const N: usize>(&mut self, arena: &Arena<N>, allocation: Option<Allocation>) {
        let Some(allocation) = allocation else {
            return;
        };
        debug_check!(self, arena);

        let block = allocation.block();
        let header = block.header(arena);
        debug_assert!(header.allocated, "double free of {:#x}", allocation.0);

        let freed = Header::free(header.size).with_prev(header.prev_allocated, header.prev_mini);
        block.write(arena, freed);
        block
            .next(arena)
            .set_prev(arena, false, header.size == MIN_BLOCK_SIZE);
        self.coalesce(arena, block);

        log::trace!("free({:#x})", allocation.0);
        debug_check!(self, arena);
    }

    pub fn realloc<const N: usize>(
        &mut self,
        arena: &Arena<N>,
        allocation: Option<Allocation>,
        size: usize,
    ) -> Option<Allocation> {
        if size == 0 {
            self.free(arena, allocation);
            return None;
        }
        let Some(old) = allocation else {
            return self.malloc(arena, size);
        };

        let new = self.malloc(arena, size)?;
        let len = cmp::min(size, usable_size(arena, old));
        arena.copy(old.0, new.0, len);
        self.free(arena, Some(old));

        log::trace!("realloc({:#x}, {}) -> {:#x}", old.0, size, new.0);
        Some(new)
    }

    pub fn calloc<const N: usize>(
        &mut self,
        arena: &Arena<N>,
        count: usize,
        size: usize,
    ) -> Option<Allocation> {
        let bytes = count.checked_mul(size)?;
        let allocation = self.malloc(arena, bytes)?;
        arena.fill(allocation.0, bytes, 0);
        Some(allocation)
    }

    pub fn blocks<'a, const N: usize>(&self, arena: &'a Arena<N>) -> Blocks<'a, N> {
        let first = self.initialized.then(|| Block::at(WSIZE));
        Blocks::new(arena, first)
    }

    /// Grow the heap by (at least) `size` bytes and return the resulting free
    /// block, merged with a trailing free block if there was one.
    fn extend_heap<const N: usize>(&mut self, arena: &Arena<N>, size: usize) -> Option<Block> {
        let size = round_up(size, ALIGNMENT)?;
        let start = arena.sbrk(size)?;
        log::debug!("extending heap by {} bytes at {:#x}", size, start);

        // the old epilogue header becomes the header of the new block
        let block = Block::from_payload(start);
        let epilogue = block.header(arena);
        let header = Header::free(size).with_prev(epilogue.prev_allocated, epilogue.prev_mini);
        block.write(arena, header);

        let epilogue = block.next(arena);
        arena.set_header(
            epilogue.offset(),
            Header::used(0).with_prev(false, size == MIN_BLOCK_SIZE),
        );

        Some(self.coalesce(arena, block))
    }

    /// Merge a free block (not yet in any list) with its free neighbours and
    /// file the result in its free list.
    fn coalesce<const N: usize>(&mut self, arena: &Arena<N>, block: Block) -> Block {
        let header = block.header(arena);
        let next = block.next(arena);
        let prev_free = !header.prev_allocated;
        let next_free = !next.is_allocated(arena);

        let (merged, size) = match (prev_free, next_free) {
            (false, false) => (block, header.size),
            (false, true) => {
                let next_size = next.size(arena);
                self.lists.remove(arena, next);
                (block, header.size + next_size)
            }
            (true, false) => {
                let prev = block.prev(arena);
                let prev_size = prev.size(arena);
                self.lists.remove(arena, prev);
                (prev, prev_size + header.size)
            }
            (true, true) => {
                let prev = block.prev(arena);
                let prev_size = prev.size(arena);
                let next_size = next.size(arena);
                self.lists.remove(arena, prev);
                self.lists.remove(arena, next);
                (prev, prev_size + header.size + next_size)
            }
        };

        let first = merged.header(arena);
        merged.write(
            arena,
            Header::free(size).with_prev(first.prev_allocated, first.prev_mini),
        );
        merged
            .next(arena)
            .set_prev(arena, false, size == MIN_BLOCK_SIZE);
        self.lists.insert(arena, merged);
        merged
    }

    /// Allocate the first `asize` bytes of a free block, splitting off the
    /// remainder as a new free block.
    fn place<const N: usize>(&mut self, arena: &Arena<N>, block: Block, asize: usize) {
        let header = block.header(arena);
        let csize = header.size;
        debug_assert!(!header.allocated && csize >= asize);

        self.lists.remove(arena, block);

        if csize == asize {
            arena.set_header(
                block.offset(),
                Header::used(csize).with_prev(header.prev_allocated, header.prev_mini),
            );
            block
                .next(arena)
                .set_prev(arena, true, csize == MIN_BLOCK_SIZE);
            return;
        }

        let remainder = csize - asize;
        block.write(
            arena,
            Header::used(asize).with_prev(header.prev_allocated, header.prev_mini),
        );
        let rest = block.next(arena);
        rest.write(
            arena,
            Header::free(remainder).with_prev(true, asize == MIN_BLOCK_SIZE),
        );
        rest.next(arena)
            .set_prev(arena, false, remainder == MIN_BLOCK_SIZE);
        self.lists.insert(arena, rest);
    }
}

fn usable_size<const N: usize>(arena: &Arena<N>, allocation: Allocation) -> usize {
    allocation.block().size(arena) - WSIZE
}

/// Round `size` up to the next multiple of `n` (a power of two).
fn round_up(size: usize, n: usize) -> Option<usize> {
    Some(size.checked_add(n - 1)? & !(n - 1))
}

/// The block size needed for a request of `size` bytes: the payload plus a
/// header, but no footer.
fn adjust_size(size: usize) -> Option<usize> {
    if size <= WSIZE {
        Some(MIN_BLOCK_SIZE)
    } else {
        round_up(size.checked_add(WSIZE)?, ALIGNMENT)
    }
}
