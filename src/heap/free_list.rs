//! The segregated free lists.
//!
//! Free blocks are kept in one of several lists, selected purely by their
//! size. Blocks of the minimum size live in a singly-linked list of their own,
//! since a second link would not fit into them. All other blocks are kept in
//! doubly-linked lists, one per size class:
//! ```text
//! class:   0      1       2       3       4       5        6
//! size:  <80   <200    <300    <430    <840   <1500    >=1500
//! ```
//! Links are stored in the payload of the free blocks themselves: the next
//! link in the first payload word, the previous link (if any) in the second.
use super::arena::Arena;
use super::block::{Block, MIN_BLOCK_SIZE};

/// Exclusive upper bounds of all size classes but the last one.
pub const SIZE_CLASS_LIMITS: [usize; 6] = [80, 200, 300, 430, 840, 1500];

/// The number of doubly-linked size classes.
pub const CLASSES: usize = SIZE_CLASS_LIMITS.len() + 1;

const NEXT: usize = 0;
const PREV: usize = 1;

/// Compute the size class a block of the given size belongs to.
pub fn classify(size: usize) -> usize {
    SIZE_CLASS_LIMITS
        .iter()
        .position(|&limit| size < limit)
        .unwrap_or(SIZE_CLASS_LIMITS.len())
}

/// The list a free block of a certain size is filed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bin {
    /// The singly-linked list of minimum blocks.
    Mini,
    /// One of the doubly-linked size classes.
    Class(usize),
}
impl Bin {
    pub fn of(size: usize) -> Self {
        if size == MIN_BLOCK_SIZE {
            Bin::Mini
        } else {
            Bin::Class(classify(size))
        }
    }
}

/// The heads (and tails) of all free lists.
///
/// This only stores the entry points: the links themselves live inside the
/// free blocks in the [`Arena`].
pub struct FreeLists {
    pub(super) mini: Option<Block>,
    pub(super) heads: [Option<Block>; CLASSES],
    pub(super) tails: [Option<Block>; CLASSES],
}
impl FreeLists {
    pub const fn new() -> Self {
        Self {
            mini: None,
            heads: [None; CLASSES],
            tails: [None; CLASSES],
        }
    }

    /// Forget all blocks.
    pub fn clear(&mut self) {
        *self = Self::new();
    }

    /// Add a free block to the front of its list.
    ///
    /// The block must be free, carry its final size and must not be a member
    /// of any list yet.
    pub fn insert<const N: usize>(&mut self, arena: &Arena<N>, block: Block) {
        match Bin::of(block.size(arena)) {
            Bin::Mini => {
                arena.set_link(block.payload_word(NEXT), self.mini.map(Block::offset));
                self.mini = Some(block);
            }
            Bin::Class(class) => {
                let head = self.heads[class];
                arena.set_link(block.payload_word(NEXT), head.map(Block::offset));
                arena.set_link(block.payload_word(PREV), None);
                match head {
                    Some(head) => arena.set_link(head.payload_word(PREV), Some(block.offset())),
                    None => self.tails[class] = Some(block),
                }
                self.heads[class] = Some(block);
            }
        }
    }

    /// Unlink a free block from its list.
    ///
    /// The block must still carry the size it was inserted with.
    ///
    /// # Panics
    /// This function panics if a minimum block is not found in its list.
    pub fn remove<const N: usize>(&mut self, arena: &Arena<N>, block: Block) {
        match Bin::of(block.size(arena)) {
            Bin::Mini => self.remove_mini(arena, block),
            Bin::Class(class) => {
                let prev = arena.link(block.payload_word(PREV)).map(Block::at);
                let next = arena.link(block.payload_word(NEXT)).map(Block::at);
                match prev {
                    Some(prev) => arena.set_link(prev.payload_word(NEXT), next.map(Block::offset)),
                    None => self.heads[class] = next,
                }
                match next {
                    Some(next) => arena.set_link(next.payload_word(PREV), prev.map(Block::offset)),
                    None => self.tails[class] = prev,
                }
            }
        }
    }

    fn remove_mini<const N: usize>(&mut self, arena: &Arena<N>, block: Block) {
        let successor = arena.link(block.payload_word(NEXT));
        if self.mini == Some(block) {
            self.mini = successor.map(Block::at);
            return;
        }

        let mut current = self.mini;
        while let Some(node) = current {
            let next = arena.link(node.payload_word(NEXT)).map(Block::at);
            if next == Some(block) {
                arena.set_link(node.payload_word(NEXT), successor);
                return;
            }
            current = next;
        }
        panic!("block {:#x} is not in the mini list", block.offset());
    }

    /// Find a free block of at least `asize` bytes.
    ///
    /// A request for a minimum block is served from the mini list if it is not
    /// empty. Otherwise the size classes are searched from the class of
    /// `asize` upwards, each one from its tail, and the first block that is
    /// large enough is returned. The block stays in its list.
    pub fn find_fit<const N: usize>(&self, arena: &Arena<N>, asize: usize) -> Option<Block> {
        if asize == MIN_BLOCK_SIZE && self.mini.is_some() {
            return self.mini;
        }

        for class in classify(asize)..CLASSES {
            let mut current = self.tails[class];
            while let Some(block) = current {
                if block.size(arena) >= asize {
                    return Some(block);
                }
                current = arena.link(block.payload_word(PREV)).map(Block::at);
            }
        }
        None
    }

    /// Iterate over the members of a list from head to tail.
    pub fn iter<'a, const N: usize>(&self, arena: &'a Arena<N>, bin: Bin) -> ListIter<'a, N> {
        let head = match bin {
            Bin::Mini => self.mini,
            Bin::Class(class) => self.heads[class],
        };
        ListIter {
            arena,
            current: head,
        }
    }
}

/// An iterator following the next links of a free list.
pub struct ListIter<'a, const N: usize> {
    arena: &'a Arena<N>,
    current: Option<Block>,
}
impl<'a, const N: usize> ListIter<'a, N> {
    /// The previous link of a block in a doubly-linked list.
    pub fn prev_of(&self, block: Block) -> Option<Block> {
        self.arena.link(block.payload_word(PREV)).map(Block::at)
    }
}
impl<'a, const N: usize> Iterator for ListIter<'a, N> {
    type Item = Block;

    fn next(&mut self) -> Option<Self::Item> {
        let block = self.current?;
        self.current = self.arena.link(block.payload_word(NEXT)).map(Block::at);
        Some(block)
    }
}
