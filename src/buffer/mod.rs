//! Bounds-checked views over raw shared memory
//!
//! This module provides the `AtomicBuffer` abstraction used by every other
//! component: a non-owning (pointer, length) view over a region of shared
//! memory with accessors at three strengths:
//!
//! - Plain reads/writes for fields only touched by one side at a time
//! - Volatile (acquire) loads and ordered (release) stores for publication
//!   protocols such as the frame-length readiness signal
//! - Atomic read-modify-write operations for multi-writer reservation
//!
//! All multi-byte fields are little-endian. Offsets are `i32` to match the
//! wire contracts; every access is bounds checked and an out-of-range access
//! is a caller contract violation that fails fast.

pub mod mapped;

use std::sync::atomic::{AtomicI32, AtomicI64, Ordering};

/// Align a value up to the given power-of-two alignment.
#[inline]
pub const fn align(value: i32, alignment: i32) -> i32 {
    (value + (alignment - 1)) & !(alignment - 1)
}

/// A non-owning view over a region of (possibly shared) memory.
///
/// The view is `Copy` and freely shareable across threads; the accessors
/// provide the memory-ordering guarantees, not the type system. Whoever
/// creates the view is responsible for keeping the underlying region mapped
/// for as long as any copy of the view is live.
#[derive(Clone, Copy, Debug)]
pub struct AtomicBuffer {
    ptr: *mut u8,
    len: usize,
}

unsafe impl Send for AtomicBuffer {}
unsafe impl Sync for AtomicBuffer {}

impl AtomicBuffer {
    /// Wrap a mutable byte slice. The slice must outlive every copy of the
    /// returned view.
    pub fn wrap_slice(slice: &mut [u8]) -> Self {
        Self {
            ptr: slice.as_mut_ptr(),
            len: slice.len(),
        }
    }

    /// Wrap a raw region.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for reads and writes of `len` bytes for the
    /// lifetime of every copy of the returned view.
    pub unsafe fn from_raw_parts(ptr: *mut u8, len: usize) -> Self {
        Self { ptr, len }
    }

    /// Capacity of the view in bytes.
    #[inline]
    pub fn capacity(&self) -> i32 {
        self.len as i32
    }

    #[inline]
    fn bounds_check(&self, offset: i32, length: usize) {
        assert!(
            offset >= 0 && (offset as usize) + length <= self.len,
            "buffer access out of bounds: offset={} length={} capacity={}",
            offset,
            length,
            self.len
        );
    }

    #[inline]
    fn at(&self, offset: i32) -> *mut u8 {
        unsafe { self.ptr.add(offset as usize) }
    }

    #[inline]
    fn atomic_i32(&self, offset: i32) -> &AtomicI32 {
        self.bounds_check(offset, 4);
        debug_assert!(offset % 4 == 0, "unaligned atomic access at {}", offset);
        unsafe { &*(self.at(offset) as *const AtomicI32) }
    }

    #[inline]
    fn atomic_i64(&self, offset: i32) -> &AtomicI64 {
        self.bounds_check(offset, 8);
        debug_assert!(offset % 8 == 0, "unaligned atomic access at {}", offset);
        unsafe { &*(self.at(offset) as *const AtomicI64) }
    }

    // Plain accessors.

    #[inline]
    pub fn get_u8(&self, offset: i32) -> u8 {
        self.bounds_check(offset, 1);
        unsafe { *self.at(offset) }
    }

    #[inline]
    pub fn put_u8(&self, offset: i32, value: u8) {
        self.bounds_check(offset, 1);
        unsafe { *self.at(offset) = value };
    }

    #[inline]
    pub fn get_u16(&self, offset: i32) -> u16 {
        self.bounds_check(offset, 2);
        let mut bytes = [0u8; 2];
        unsafe { std::ptr::copy_nonoverlapping(self.at(offset), bytes.as_mut_ptr(), 2) };
        u16::from_le_bytes(bytes)
    }

    #[inline]
    pub fn put_u16(&self, offset: i32, value: u16) {
        self.bounds_check(offset, 2);
        let bytes = value.to_le_bytes();
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.at(offset), 2) };
    }

    #[inline]
    pub fn get_i32(&self, offset: i32) -> i32 {
        self.bounds_check(offset, 4);
        let mut bytes = [0u8; 4];
        unsafe { std::ptr::copy_nonoverlapping(self.at(offset), bytes.as_mut_ptr(), 4) };
        i32::from_le_bytes(bytes)
    }

    #[inline]
    pub fn put_i32(&self, offset: i32, value: i32) {
        self.bounds_check(offset, 4);
        let bytes = value.to_le_bytes();
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.at(offset), 4) };
    }

    #[inline]
    pub fn get_i64(&self, offset: i32) -> i64 {
        self.bounds_check(offset, 8);
        let mut bytes = [0u8; 8];
        unsafe { std::ptr::copy_nonoverlapping(self.at(offset), bytes.as_mut_ptr(), 8) };
        i64::from_le_bytes(bytes)
    }

    #[inline]
    pub fn put_i64(&self, offset: i32, value: i64) {
        self.bounds_check(offset, 8);
        let bytes = value.to_le_bytes();
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.at(offset), 8) };
    }

    // Ordered accessors: acquire loads paired with release stores.

    #[inline]
    pub fn get_i32_volatile(&self, offset: i32) -> i32 {
        self.atomic_i32(offset).load(Ordering::Acquire)
    }

    #[inline]
    pub fn put_i32_ordered(&self, offset: i32, value: i32) {
        self.atomic_i32(offset).store(value, Ordering::Release);
    }

    #[inline]
    pub fn get_i64_volatile(&self, offset: i32) -> i64 {
        self.atomic_i64(offset).load(Ordering::Acquire)
    }

    #[inline]
    pub fn put_i64_ordered(&self, offset: i32, value: i64) {
        self.atomic_i64(offset).store(value, Ordering::Release);
    }

    // Read-modify-write accessors.

    #[inline]
    pub fn get_and_add_i64(&self, offset: i32, delta: i64) -> i64 {
        self.atomic_i64(offset).fetch_add(delta, Ordering::AcqRel)
    }

    #[inline]
    pub fn compare_and_set_i32(&self, offset: i32, expected: i32, update: i32) -> bool {
        self.atomic_i32(offset)
            .compare_exchange(expected, update, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    #[inline]
    pub fn compare_and_set_i64(&self, offset: i32, expected: i64, update: i64) -> bool {
        self.atomic_i64(offset)
            .compare_exchange(expected, update, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    // Bulk accessors.

    pub fn get_bytes(&self, offset: i32, dst: &mut [u8]) {
        self.bounds_check(offset, dst.len());
        unsafe { std::ptr::copy_nonoverlapping(self.at(offset), dst.as_mut_ptr(), dst.len()) };
    }

    pub fn put_bytes(&self, offset: i32, src: &[u8]) {
        self.bounds_check(offset, src.len());
        unsafe { std::ptr::copy_nonoverlapping(src.as_ptr(), self.at(offset), src.len()) };
    }

    pub fn set_memory(&self, offset: i32, length: usize, value: u8) {
        self.bounds_check(offset, length);
        unsafe { std::ptr::write_bytes(self.at(offset), value, length) };
    }

    /// Borrow a sub-range of the view as a byte slice.
    pub fn slice(&self, offset: i32, length: i32) -> &[u8] {
        self.bounds_check(offset, length as usize);
        unsafe { std::slice::from_raw_parts(self.at(offset), length as usize) }
    }

    /// Borrow a sub-range of the view as a mutable byte slice.
    ///
    /// # Safety
    ///
    /// The caller must hold exclusive write access to the range, e.g. via a
    /// tail reservation that no other writer can overlap.
    pub unsafe fn slice_mut(&self, offset: i32, length: i32) -> &mut [u8] {
        self.bounds_check(offset, length as usize);
        std::slice::from_raw_parts_mut(self.at(offset), length as usize)
    }

    // Length-prefixed UTF-8 strings, padded to 4-byte alignment.

    /// Write a length-prefixed string, returning the offset just past it.
    pub fn put_string(&self, offset: i32, value: &str) -> i32 {
        let bytes = value.as_bytes();
        self.put_i32(offset, bytes.len() as i32);
        self.put_bytes(offset + 4, bytes);
        offset + 4 + align(bytes.len() as i32, 4)
    }

    /// Read a length-prefixed string, returning it with the offset just past it.
    pub fn get_string(&self, offset: i32) -> (String, i32) {
        let length = self.get_i32(offset);
        assert!(length >= 0, "negative string length at offset {}", offset);
        let value = String::from_utf8_lossy(self.slice(offset + 4, length)).into_owned();
        (value, offset + 4 + align(length, 4))
    }
}
