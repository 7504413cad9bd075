//! The block header codec.
//!
//! Every block starts with a single [`Word`]. Since block sizes are always a
//! multiple of 16, the lowest four bits of the size are free to carry flags:
//! ```text
//! 63                                   4   3   2   1   0
//! +------------------------------------+---+---+---+---+
//! |            size >> 4               | - | M | P | A |
//! +------------------------------------+---+---+---+---+
//! A: this block is allocated
//! P: the previous block (by address) is allocated
//! M: the previous block has the minimum block size
//! ```
//! The rest of the crate never touches those bits: it reads and writes
//! [`Header`]s and the conversion happens only at the arena boundary.

/// The machine word used for headers, footers and free-list links.
pub type Word = u64;

const ALLOC_MASK: Word = 0x1;
const PREV_ALLOC_MASK: Word = 0x2;
const PREV_MINI_MASK: Word = 0x4;
const SIZE_MASK: Word = !0xF;

/// The decoded form of a block header (or footer).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Total size of the block in bytes, including the header itself.
    pub size: usize,
    /// Whether the payload of this block is handed out to a caller.
    pub allocated: bool,
    /// Whether the block immediately before this one is allocated.
    pub prev_allocated: bool,
    /// Whether the block immediately before this one is a minimum block.
    pub prev_mini: bool,
}
impl Header {
    /// Create the header of a free block.
    ///
    /// The flags describing the previous block are passed separately via
    /// [`with_prev()`](Self::with_prev).
    pub const fn free(size: usize) -> Self {
        Self {
            size,
            allocated: false,
            prev_allocated: false,
            prev_mini: false,
        }
    }

    /// Create the header of an allocated block.
    pub const fn used(size: usize) -> Self {
        Self {
            size,
            allocated: true,
            prev_allocated: false,
            prev_mini: false,
        }
    }

    /// Replace the flags describing the previous block.
    pub const fn with_prev(mut self, prev_allocated: bool, prev_mini: bool) -> Self {
        self.prev_allocated = prev_allocated;
        self.prev_mini = prev_mini;
        self
    }

    /// Pack the header into its in-memory representation.
    ///
    /// # Panics
    /// In debug builds this panics if the size is not a multiple of 16, since
    /// the flag bits would overlap the size otherwise.
    pub fn pack(self) -> Word {
        debug_assert!(self.size % 16 == 0, "unaligned block size {}", self.size);

        let mut word = self.size as Word;
        if self.allocated {
            word |= ALLOC_MASK;
        }
        if self.prev_allocated {
            word |= PREV_ALLOC_MASK;
        }
        if self.prev_mini {
            word |= PREV_MINI_MASK;
        }
        word
    }

    /// Decode a header from its in-memory representation.
    pub const fn unpack(word: Word) -> Self {
        Self {
            size: (word & SIZE_MASK) as usize,
            allocated: word & ALLOC_MASK != 0,
            prev_allocated: word & PREV_ALLOC_MASK != 0,
            prev_mini: word & PREV_MINI_MASK != 0,
        }
    }
}
