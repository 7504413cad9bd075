use super::header::{Header, Word};

use core::cell::{Cell, UnsafeCell};
use core::{mem, ptr};

/// Size of a [`Word`] in bytes.
pub const WSIZE: usize = mem::size_of::<Word>();

/// The backing storage, aligned so that 16-aligned offsets are 16-aligned
/// addresses as well.
#[repr(C, align(16))]
struct Memory<const N: usize>(UnsafeCell<[u8; N]>);

/// A contiguous memory region of fixed capacity that grows like `sbrk`.
///
/// Only the bytes below the current break belong to the heap. Every access is
/// checked against the break, so a corrupted size or link leads to a panic
/// instead of a read or write outside of the heap.
///
/// The memory is never borrowed as a whole: all accesses go through raw
/// pointers, therefore pointers into payloads stay valid while the arena is
/// used through a shared reference.
pub struct Arena<const N: usize> {
    memory: Memory<N>,
    brk: Cell<usize>,
}
impl<const N: usize> Arena<N> {
    /// Create an empty arena (the break is at offset zero).
    ///
    /// The memory is zero-initialized, so that an arena in a `static` is
    /// placed in `.bss`.
    ///
    /// # Panics
    /// This function will panic, if the capacity `N` is less than `16` or not
    /// divisible by `16`.
    pub const fn new() -> Self {
        assert!(N >= 16, "too small heap memory: minimum size is 16");
        assert!(N % 16 == 0, "memory size has to be divisible by 16");

        Self {
            memory: Memory(UnsafeCell::new([0; N])),
            brk: Cell::new(0),
        }
    }

    /// Move the break back to the start, releasing the whole heap.
    pub fn reset(&self) {
        self.brk.set(0);
    }

    /// Extend the heap by `increment` bytes.
    ///
    /// On success the offset of the old break is returned, which is the start
    /// of the newly available region. The region directly follows the one
    /// returned by the previous call. If the capacity of the arena is
    /// exhausted, `None` is returned and the heap is left as it was.
    pub fn sbrk(&self, increment: usize) -> Option<usize> {
        let old = self.brk.get();
        let new = old.checked_add(increment)?;
        if new > N {
            return None;
        }
        self.brk.set(new);
        Some(old)
    }

    /// Offset of the first byte of the heap.
    pub const fn heap_lo(&self) -> usize {
        0
    }

    /// Offset of the last byte of the heap, or `None` for an empty heap.
    pub fn heap_hi(&self) -> Option<usize> {
        self.brk().checked_sub(1)
    }

    /// The current break, i.e. the number of bytes in use.
    pub fn brk(&self) -> usize {
        self.brk.get()
    }

    /// Read a raw word at the given offset.
    ///
    /// # Panics
    /// This function panics if the offset is not word-aligned or the word
    /// would extend past the break.
    pub fn word(&self, offset: usize) -> Word {
        self.check_word(offset);
        // SAFETY: the word lies within the memory and is 8-byte aligned
        unsafe { ptr::read(self.ptr(offset).cast::<Word>()) }
    }

    /// Write a raw word at the given offset.
    ///
    /// # Panics
    /// See [`word()`](Self::word).
    pub fn set_word(&self, offset: usize, value: Word) {
        self.check_word(offset);
        // SAFETY: see `word()`
        unsafe { ptr::write(self.ptr(offset).cast::<Word>(), value) }
    }

    /// Read and decode the header (or footer) word at the given offset.
    pub fn header(&self, offset: usize) -> Header {
        Header::unpack(self.word(offset))
    }

    /// Encode and write a header (or footer) word at the given offset.
    pub fn set_header(&self, offset: usize, header: Header) {
        self.set_word(offset, header.pack());
    }

    /// Read a link word, mapping the null offset `0` to `None`.
    pub fn link(&self, offset: usize) -> Option<usize> {
        match self.word(offset) {
            0 => None,
            link => Some(link as usize),
        }
    }

    /// Write a link word, mapping `None` to the null offset `0`.
    pub fn set_link(&self, offset: usize, link: Option<usize>) {
        self.set_word(offset, link.map_or(0, |link| link as Word));
    }

    /// Pointer to the heap bytes in `offset..offset + len`.
    ///
    /// # Panics
    /// This function panics if the range extends past the break.
    pub fn range(&self, offset: usize, len: usize) -> *mut u8 {
        let end = offset.checked_add(len);
        assert!(
            end.map_or(false, |end| end <= self.brk()),
            "range {offset:#x}+{len} past the heap break {:#x}",
            self.brk()
        );
        self.ptr(offset)
    }

    /// Set the bytes in `offset..offset + len` to `value`.
    ///
    /// # Panics
    /// See [`range()`](Self::range).
    pub fn fill(&self, offset: usize, len: usize, value: u8) {
        let dest = self.range(offset, len);
        // SAFETY: the range lies within the memory
        unsafe { ptr::write_bytes(dest, value, len) }
    }

    /// Copy `len` bytes from `src` to `dest` within the heap.
    ///
    /// # Panics
    /// This function panics if either range extends past the break.
    pub fn copy(&self, src: usize, dest: usize, len: usize) {
        let src = self.range(src, len);
        let dest = self.range(dest, len);
        // SAFETY: both ranges lie within the memory, `ptr::copy` allows overlap
        unsafe { ptr::copy(src, dest, len) }
    }

    /// Pointer to the first byte of the arena.
    ///
    /// Offsets handed out by the heap are turned into addresses relative to
    /// this pointer. It stays valid as long as the arena is not moved.
    pub fn base_ptr(&self) -> *mut u8 {
        self.memory.0.get().cast()
    }

    fn ptr(&self, offset: usize) -> *mut u8 {
        // SAFETY: callers checked `offset` against the break, which never
        // exceeds the capacity
        unsafe { self.base_ptr().add(offset) }
    }

    fn check_word(&self, offset: usize) {
        assert!(offset % WSIZE == 0, "unaligned word access at {offset:#x}");
        assert!(
            offset + WSIZE <= self.brk(),
            "word access at {offset:#x} past the heap break {:#x}",
            self.brk()
        );
    }
}
