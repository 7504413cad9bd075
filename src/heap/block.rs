//! Blocks and the navigation between physically adjacent blocks.
use super::arena::{Arena, WSIZE};
use super::header::Header;

/// The size of the smallest possible block: a header and a single word of
/// payload (or a single free-list link while the block is free).
pub const MIN_BLOCK_SIZE: usize = 2 * WSIZE;

/// A block in the heap, identified by the offset of its header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Block(usize);
impl Block {
    /// Refer to the block whose header is at `offset`.
    pub const fn at(offset: usize) -> Self {
        Self(offset)
    }

    /// Refer to the block owning the payload at `offset`.
    pub const fn from_payload(offset: usize) -> Self {
        Self(offset - WSIZE)
    }

    /// The offset of the header.
    pub const fn offset(self) -> usize {
        self.0
    }

    /// The offset of the first payload byte.
    pub const fn payload(self) -> usize {
        self.0 + WSIZE
    }

    /// Offset of the `index`-th payload word, used for free-list links.
    pub const fn payload_word(self, index: usize) -> usize {
        self.payload() + index * WSIZE
    }

    pub fn header<const N: usize>(self, arena: &Arena<N>) -> Header {
        arena.header(self.0)
    }

    pub fn size<const N: usize>(self, arena: &Arena<N>) -> usize {
        self.header(arena).size
    }

    pub fn is_allocated<const N: usize>(self, arena: &Arena<N>) -> bool {
        self.header(arena).allocated
    }

    /// The offset of the footer, which is the last word of the block.
    ///
    /// Only free blocks larger than [`MIN_BLOCK_SIZE`] actually have a footer.
    pub fn footer<const N: usize>(self, arena: &Arena<N>) -> usize {
        self.0 + self.size(arena) - WSIZE
    }

    /// Write the header and, if the block needs one, the footer.
    ///
    /// The footer is only written for free blocks above the minimum size:
    /// allocated blocks hand that word out as payload and minimum blocks have
    /// no room for it.
    pub fn write<const N: usize>(self, arena: &Arena<N>, header: Header) {
        arena.set_header(self.0, header);
        if !header.allocated && header.size > MIN_BLOCK_SIZE {
            arena.set_header(self.0 + header.size - WSIZE, header);
        }
    }

    /// Rewrite only the flags describing the previous block.
    pub fn set_prev<const N: usize>(self, arena: &Arena<N>, prev_allocated: bool, prev_mini: bool) {
        let header = self.header(arena).with_prev(prev_allocated, prev_mini);
        arena.set_header(self.0, header);
    }

    /// The block physically following this one.
    ///
    /// # Panics
    /// This function panics if the computed header lies past the break, which
    /// can only happen for the epilogue or a corrupted size.
    pub fn next<const N: usize>(self, arena: &Arena<N>) -> Block {
        let next = Block(self.0 + self.size(arena));
        assert!(
            next.0 + WSIZE <= arena.brk(),
            "block {:#x} runs past the heap",
            self.0
        );
        next
    }

    /// The block physically preceding this one.
    ///
    /// This is only meaningful if the previous block is free (see
    /// [`Header::prev_allocated`]): allocated blocks have no footer to read.
    /// A free minimum block has no footer either, but the `prev_mini` flag
    /// already tells its size.
    pub fn prev<const N: usize>(self, arena: &Arena<N>) -> Block {
        let header = self.header(arena);
        debug_assert!(!header.prev_allocated, "previous block is allocated");

        if header.prev_mini {
            Block(self.0 - MIN_BLOCK_SIZE)
        } else {
            let footer = arena.header(self.0 - WSIZE);
            Block(self.0 - footer.size)
        }
    }
}

/// A summary of a single block, as reported by [`Heap::blocks()`].
///
/// [`Heap::blocks()`]: crate::Heap::blocks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    /// The offset of the block header within the heap.
    pub offset: usize,
    /// The total size of the block, including its header.
    pub size: usize,
    /// Whether the block is currently handed out.
    pub allocated: bool,
}
impl BlockInfo {
    /// The offset of the first payload byte.
    pub const fn payload(&self) -> usize {
        self.offset + WSIZE
    }
}

/// An iterator over all real blocks of a heap, in address order.
///
/// The iteration stops at the epilogue (the only block of size zero).
pub struct Blocks<'a, const N: usize> {
    arena: &'a Arena<N>,
    current: Option<Block>,
}
impl<'a, const N: usize> Blocks<'a, N> {
    /// Walk the blocks starting at `first`, or nothing at all for `None`.
    pub const fn new(arena: &'a Arena<N>, first: Option<Block>) -> Self {
        Self {
            arena,
            current: first,
        }
    }
}
impl<'a, const N: usize> Iterator for Blocks<'a, N> {
    type Item = BlockInfo;

    fn next(&mut self) -> Option<Self::Item> {
        let block = self.current?;
        let header = block.header(self.arena);
        if header.size == 0 {
            self.current = None;
            return None;
        }

        self.current = Some(block.next(self.arena));
        Some(BlockInfo {
            offset: block.offset(),
            size: header.size,
            allocated: header.allocated,
        })
    }
}
