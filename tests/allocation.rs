//! Drive the allocator through the `GlobalAlloc` interface, the way the
//! collections of the `alloc`-crate use it.
use std::alloc::{GlobalAlloc, Layout};

const HEAP_SIZE: usize = 4 * 1024 * 1024;

static ALLOCATOR: segfit::Allocator<HEAP_SIZE> = segfit::Allocator::new();

/// A minimal growable vector of `u64` on top of [`ALLOCATOR`].
struct RawVec {
    ptr: *mut u64,
    len: usize,
    cap: usize,
}
impl RawVec {
    fn new() -> Self {
        Self {
            ptr: std::ptr::null_mut(),
            len: 0,
            cap: 0,
        }
    }

    fn layout(cap: usize) -> Layout {
        Layout::array::<u64>(cap).unwrap()
    }

    fn push(&mut self, value: u64) {
        if self.len == self.cap {
            let new_cap = if self.cap == 0 { 4 } else { self.cap * 2 };
            let new_layout = Self::layout(new_cap);
            let ptr = unsafe {
                if self.ptr.is_null() {
                    ALLOCATOR.alloc(new_layout)
                } else {
                    ALLOCATOR.realloc(self.ptr.cast(), Self::layout(self.cap), new_layout.size())
                }
            };
            assert!(!ptr.is_null(), "out of memory");
            self.ptr = ptr.cast();
            self.cap = new_cap;
        }
        unsafe { self.ptr.add(self.len).write(value) };
        self.len += 1;
    }

    fn as_slice(&self) -> &[u64] {
        if self.ptr.is_null() {
            &[]
        } else {
            unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
        }
    }
}
impl Drop for RawVec {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            unsafe { ALLOCATOR.dealloc(self.ptr.cast(), Self::layout(self.cap)) };
        }
    }
}

#[test]
fn growing_vectors() {
    let mut vectors: Vec<RawVec> = (0..8).map(|_| RawVec::new()).collect();
    for round in 0..500u64 {
        for (i, vector) in vectors.iter_mut().enumerate() {
            vector.push(round * 8 + i as u64);
        }
    }

    for (i, vector) in vectors.iter().enumerate() {
        let expected: Vec<u64> = (0..500).map(|round| round * 8 + i as u64).collect();
        assert_eq!(vector.as_slice(), &expected[..]);
    }
    assert!(ALLOCATOR.check_heap(line!()).is_ok());

    drop(vectors);
    assert!(ALLOCATOR.check_heap(line!()).is_ok());
}

#[test]
fn strings_of_many_sizes() {
    let mut pointers = Vec::new();
    for len in 1..200usize {
        let layout = Layout::from_size_align(len, 1).unwrap();
        let ptr = unsafe { ALLOCATOR.alloc(layout) };
        assert!(!ptr.is_null());
        assert_eq!(ptr as usize % segfit::ALIGNMENT, 0);
        unsafe { ptr.write_bytes(len as u8, len) };
        pointers.push((ptr, layout));
    }

    for &(ptr, layout) in &pointers {
        let bytes = unsafe { std::slice::from_raw_parts(ptr, layout.size()) };
        assert!(bytes.iter().all(|&b| b == layout.size() as u8));
    }
    for (ptr, layout) in pointers {
        unsafe { ALLOCATOR.dealloc(ptr, layout) };
    }
    assert!(ALLOCATOR.check_heap(line!()).is_ok());
}
