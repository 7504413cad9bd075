//! The heap consistency checker.
use super::arena::{Arena, WSIZE};
use super::block::{Block, MIN_BLOCK_SIZE};
use super::free_list::{Bin, CLASSES};
use super::header::Header;
use super::{Core, ALIGNMENT};

use core::fmt;

/// The kind of inconsistency found by [`Heap::check_heap()`](crate::Heap::check_heap).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViolationKind {
    /// The prologue is not a zero-sized allocated block.
    Prologue,
    /// The epilogue is not a zero-sized allocated block at the very end.
    Epilogue,
    /// A payload is not aligned to 16 bytes.
    MisalignedPayload,
    /// A block or list member lies outside of the heap.
    OutOfBounds,
    /// A block is smaller than the minimum block size.
    TooSmall,
    /// A block size is not a multiple of 16.
    UnalignedSize,
    /// Header and footer of a free block disagree.
    FooterMismatch,
    /// The previous-block flags do not describe the previous block.
    PrevFlagsMismatch,
    /// Two physically adjacent blocks are both free.
    AdjacentFree,
    /// An allocated block is a member of a free list.
    AllocatedInList,
    /// A free block is filed in the list of another size class.
    WrongBin,
    /// The forward and backward links of a list disagree.
    BrokenLink,
    /// The tail of a list is not its last member.
    TailMismatch,
    /// The free lists and the heap do not contain the same number of free blocks.
    FreeCountMismatch {
        /// Free blocks found by walking the heap.
        heap: usize,
        /// Free blocks found by walking the lists (so far).
        lists: usize,
    },
}
impl fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Prologue => f.write_str("corrupted prologue"),
            Self::Epilogue => f.write_str("corrupted epilogue"),
            Self::MisalignedPayload => f.write_str("payload is not 16-byte aligned"),
            Self::OutOfBounds => f.write_str("block outside of the heap"),
            Self::TooSmall => f.write_str("block below the minimum block size"),
            Self::UnalignedSize => f.write_str("block size is not a multiple of 16"),
            Self::FooterMismatch => f.write_str("header and footer do not match"),
            Self::PrevFlagsMismatch => f.write_str("stale previous-block flags"),
            Self::AdjacentFree => f.write_str("two consecutive free blocks"),
            Self::AllocatedInList => f.write_str("allocated block in a free list"),
            Self::WrongBin => f.write_str("free block in the wrong list"),
            Self::BrokenLink => f.write_str("next/prev links are not consistent"),
            Self::TailMismatch => f.write_str("list tail is not the last member"),
            Self::FreeCountMismatch { heap, lists } => write!(
                f,
                "{heap} free blocks in the heap, but {lists} in the free lists"
            ),
        }
    }
}

/// An inconsistency found by [`Heap::check_heap()`](crate::Heap::check_heap).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Violation {
    /// The identifier passed by the caller of the check, e.g. a line number.
    pub tag: u32,
    /// The heap offset of the offending block (or header).
    pub offset: usize,
    /// What exactly is wrong.
    pub kind: ViolationKind,
}
impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at {:#x} (check {})", self.kind, self.offset, self.tag)
    }
}

impl Core {
    pub fn check_heap<const N: usize>(&self, arena: &Arena<N>, tag: u32) -> Result<(), Violation> {
        let result = self
            .walk_heap(arena)
            .and_then(|heap_free| self.walk_lists(arena, heap_free));

        result.map_err(|(offset, kind)| {
            let violation = Violation { tag, offset, kind };
            log::error!("heap check failed: {}", violation);
            violation
        })
    }

    /// Walk all blocks and return the number of free ones.
    ///
    /// A heap, that was never initialized, has no blocks at all.
    fn walk_heap<const N: usize>(&self, arena: &Arena<N>) -> Result<usize, (usize, ViolationKind)> {
        if !self.initialized {
            return Ok(0);
        }
        if arena.header(0) != Header::used(0) {
            return Err((0, ViolationKind::Prologue));
        }

        let mut free = 0;
        // the prologue counts as an allocated non-minimum block
        let mut prev = (true, false);
        let mut block = Block::at(WSIZE);
        loop {
            let offset = block.offset();
            if offset + WSIZE > arena.brk() {
                return Err((offset, ViolationKind::OutOfBounds));
            }
            let header = block.header(arena);
            if (header.prev_allocated, header.prev_mini) != prev {
                return Err((offset, ViolationKind::PrevFlagsMismatch));
            }

            if header.size == 0 {
                if !header.allocated || offset + WSIZE != arena.brk() {
                    return Err((offset, ViolationKind::Epilogue));
                }
                return Ok(free);
            }

            if block.payload() % ALIGNMENT != 0 {
                return Err((offset, ViolationKind::MisalignedPayload));
            }
            if block.payload() < arena.heap_lo()
                || arena.heap_hi().map_or(true, |hi| block.payload() > hi)
                || offset.saturating_add(header.size).saturating_add(WSIZE) > arena.brk()
            {
                return Err((offset, ViolationKind::OutOfBounds));
            }
            if header.size % ALIGNMENT != 0 {
                return Err((offset, ViolationKind::UnalignedSize));
            }
            if header.size < MIN_BLOCK_SIZE {
                return Err((offset, ViolationKind::TooSmall));
            }

            if !header.allocated {
                if !prev.0 {
                    return Err((offset, ViolationKind::AdjacentFree));
                }
                if header.size > MIN_BLOCK_SIZE {
                    let footer = arena.header(block.footer(arena));
                    if footer.size != header.size || footer.allocated != header.allocated {
                        return Err((offset, ViolationKind::FooterMismatch));
                    }
                }
                free += 1;
            }

            prev = (header.allocated, header.size == MIN_BLOCK_SIZE);
            block = Block::at(offset + header.size);
        }
    }

    /// Walk all free lists and compare the number of members with `heap_free`.
    fn walk_lists<const N: usize>(
        &self,
        arena: &Arena<N>,
        heap_free: usize,
    ) -> Result<(), (usize, ViolationKind)> {
        let bins = core::iter::once(Bin::Mini).chain((0..CLASSES).map(Bin::Class));

        let mut found = 0;
        for bin in bins {
            let mut members = self.lists.iter(arena, bin);
            let mut last = None;
            while let Some(block) = members.next() {
                let offset = block.offset();
                if offset < WSIZE || offset + 2 * WSIZE > arena.brk() {
                    return Err((offset, ViolationKind::OutOfBounds));
                }
                if block.payload() % ALIGNMENT != 0 {
                    return Err((offset, ViolationKind::MisalignedPayload));
                }

                let header = block.header(arena);
                if header.allocated {
                    return Err((offset, ViolationKind::AllocatedInList));
                }
                if Bin::of(header.size) != bin {
                    return Err((offset, ViolationKind::WrongBin));
                }
                if matches!(bin, Bin::Class(_)) && members.prev_of(block) != last {
                    return Err((offset, ViolationKind::BrokenLink));
                }

                found += 1;
                if found > heap_free {
                    // also stops the walk of a cyclic list
                    let kind = ViolationKind::FreeCountMismatch {
                        heap: heap_free,
                        lists: found,
                    };
                    return Err((offset, kind));
                }
                last = Some(block);
            }

            if let Bin::Class(class) = bin {
                if self.lists.tails[class] != last {
                    let offset = self.lists.tails[class].map_or(0, Block::offset);
                    return Err((offset, ViolationKind::TailMismatch));
                }
            }
        }

        if found != heap_free {
            let kind = ViolationKind::FreeCountMismatch {
                heap: heap_free,
                lists: found,
            };
            return Err((0, kind));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::ViolationKind;
    use crate::heap::block::Block;
    use crate::heap::header::Header;
    use crate::Heap;

    fn kind_of(heap: &Heap<16384>) -> ViolationKind {
        heap.check_heap(7).unwrap_err().kind
    }

    #[test]
    fn untouched_heap_is_consistent() {
        let mut heap = Heap::<16384>::new();
        assert_eq!(heap.check_heap(42), Ok(()));
        // operations, that do not initialize the heap, leave it consistent
        heap.free(None);
        assert_eq!(heap.malloc(0), None);
        assert_eq!(heap.realloc(None, 0), None);
        assert_eq!(heap.check_heap(43), Ok(()));
        assert_eq!(heap.blocks().count(), 0);
    }

    #[test]
    fn reported_violation_carries_tag() {
        let mut heap = Heap::<16384>::new();
        heap.init().unwrap();
        heap.arena.set_header(0, Header::used(16));
        let violation = heap.check_heap(42).unwrap_err();
        assert_eq!(violation.kind, ViolationKind::Prologue);
        assert_eq!(violation.tag, 42);
        assert_eq!(violation.offset, 0);
    }

    #[test]
    fn fresh_heap_is_consistent() {
        let mut heap = Heap::<16384>::new();
        heap.init().unwrap();
        assert_eq!(heap.check_heap(0), Ok(()));
    }

    #[test]
    fn corrupted_footer_is_detected() {
        let mut heap = Heap::<16384>::new();
        heap.init().unwrap();
        // the single free block spans 8..4104, its footer is the last word
        heap.arena.set_header(4096, Header::free(4080));
        assert_eq!(kind_of(&heap), ViolationKind::FooterMismatch);
    }

    #[test]
    fn stale_prev_flags_are_detected() {
        let mut heap = Heap::<16384>::new();
        let a = heap.malloc(8).unwrap();
        let _guard = heap.malloc(8).unwrap();
        // the guard follows a minimum block; pretend it does not
        let guard = Block::from_payload(a.offset()).next(&heap.arena);
        guard.set_prev(&heap.arena, true, false);
        let violation = heap.check_heap(9).unwrap_err();
        assert_eq!(violation.kind, ViolationKind::PrevFlagsMismatch);
        assert_eq!(violation.offset, guard.offset());
    }

    #[test]
    fn unlisted_free_block_is_detected() {
        let mut heap = Heap::<16384>::new();
        let a = heap.malloc(100).unwrap();
        let _guard = heap.malloc(100).unwrap();
        // mark the block free without filing it in a list
        let block = Block::from_payload(a.offset());
        let header = block.header(&heap.arena);
        block.write(
            &heap.arena,
            Header::free(header.size).with_prev(header.prev_allocated, header.prev_mini),
        );
        let next = block.next(&heap.arena);
        next.set_prev(&heap.arena, false, false);
        assert_eq!(
            kind_of(&heap),
            ViolationKind::FreeCountMismatch { heap: 2, lists: 1 }
        );
    }

    #[test]
    fn adjacent_free_blocks_are_detected() {
        let mut heap = Heap::<16384>::new();
        let a = heap.malloc(100).unwrap();
        // the rest of the chunk is free already; free `a` behind the
        // allocator's back, with consistent flags, but without merging
        let block = Block::from_payload(a.offset());
        let header = block.header(&heap.arena);
        block.write(
            &heap.arena,
            Header::free(header.size).with_prev(header.prev_allocated, header.prev_mini),
        );
        block.next(&heap.arena).set_prev(&heap.arena, false, false);
        assert_eq!(kind_of(&heap), ViolationKind::AdjacentFree);
    }

    #[test]
    fn violation_display() {
        let violation = super::Violation {
            tag: 12,
            offset: 0x40,
            kind: ViolationKind::AdjacentFree,
        };
        assert_eq!(
            violation.to_string(),
            "two consecutive free blocks at 0x40 (check 12)"
        );
    }
}
