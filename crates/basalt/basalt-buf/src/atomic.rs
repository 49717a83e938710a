//! Atomic scalar and bulk access over a raw byte region.
//!
//! An [`AtomicBuffer`] is the memory substrate for every basalt data
//! structure: ring buffers and broadcast buffers address it by byte offset
//! and pick the memory ordering per access. The region can be a private
//! heap allocation or a shared memory-mapped file, and the buffer value
//! owns whichever backing it was built from so the mapping outlives every
//! view into it.
//!
//! # Memory model
//!
//! Scalar accesses all go through `AtomicI32`/`AtomicI64`/`AtomicU8`,
//! including the "plain" variants (which use relaxed ordering). Mixing
//! atomic and non-atomic access to the same location is undefined in Rust,
//! and counters in a shared region are touched by several threads, so
//! plain-but-atomic is the only sound rendering. Bulk copies
//! ([`put_bytes`](AtomicBuffer::put_bytes) and friends) are non-atomic:
//! the record protocols guarantee a payload region has exactly one writer
//! between claim and publication, and readers only touch it after an
//! acquire load of the published length.
//!
//! Endianness is native. The layouts built on this buffer are not meant
//! to cross architectures.

use crate::region::MappedRegion;
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::io;
use std::path::Path;
use std::ptr;
use std::sync::atomic::{AtomicI16, AtomicI32, AtomicI64, AtomicU8, Ordering};

use crate::bits::{is_aligned, CACHE_LINE_LENGTH, SIZE_OF_I32, SIZE_OF_I64};

/// Errors raised when constructing or validating a buffer view.
#[derive(Debug, thiserror::Error)]
pub enum BufferError {
    #[error("buffer base address {addr:#x} is not aligned to {required} bytes")]
    Unaligned { addr: usize, required: usize },

    #[error("buffer capacity must be non-zero")]
    ZeroCapacity,

    #[error("failed to map region at '{path}'")]
    Map {
        path: String,
        #[source]
        source: io::Error,
    },
}

enum Backing {
    Heap { ptr: *mut u8, layout: Layout },
    Mapped(MappedRegion),
}

impl Drop for Backing {
    fn drop(&mut self) {
        if let Backing::Heap { ptr, layout } = self {
            // SAFETY: allocated with this exact layout in `allocate` and
            // never freed elsewhere.
            unsafe { dealloc(*ptr, *layout) };
        }
    }
}

/// A typed view over `capacity` bytes supporting plain, acquire, release
/// and read-modify-write access at arbitrary aligned offsets.
///
/// Offsets for scalar access must be aligned to the value size; this is
/// debug-asserted along with bounds. The trailer layouts used by the ring
/// buffers keep their counters on cache-line multiples, so the constraint
/// never binds in practice.
pub struct AtomicBuffer {
    base: *mut u8,
    capacity: usize,
    _backing: Backing,
}

// SAFETY: the buffer hands out no references tied to a single thread; all
// scalar access is atomic and bulk access is governed by the single-writer
// protocols of the structures built on top. Coordinating threads may share
// the view freely.
unsafe impl Send for AtomicBuffer {}
unsafe impl Sync for AtomicBuffer {}

impl AtomicBuffer {
    /// Allocate a zeroed, cache-line-aligned heap region of `capacity`
    /// bytes.
    pub fn allocate(capacity: usize) -> Result<Self, BufferError> {
        if capacity == 0 {
            return Err(BufferError::ZeroCapacity);
        }

        let layout = Layout::from_size_align(capacity, CACHE_LINE_LENGTH)
            .expect("capacity fits a cache-line-aligned layout");
        // SAFETY: layout has non-zero size (checked above).
        let ptr = unsafe { alloc_zeroed(layout) };
        assert!(!ptr.is_null(), "allocation of {capacity} bytes failed");

        Ok(Self {
            base: ptr,
            capacity,
            _backing: Backing::Heap { ptr, layout },
        })
    }

    /// Create a file of `capacity` bytes at `path` and map it read-write.
    ///
    /// The file is truncated and zero-filled, so a freshly created region
    /// is a valid empty buffer for every basalt layout.
    pub fn map_create<P: AsRef<Path>>(path: P, capacity: usize) -> Result<Self, BufferError> {
        if capacity == 0 {
            return Err(BufferError::ZeroCapacity);
        }

        let region = MappedRegion::create(&path, capacity).map_err(|source| BufferError::Map {
            path: path.as_ref().display().to_string(),
            source,
        })?;

        Ok(Self::from_region(region))
    }

    /// Map an existing file at `path` read-write; the capacity is the file
    /// length.
    pub fn map_open<P: AsRef<Path>>(path: P) -> Result<Self, BufferError> {
        let region = MappedRegion::open(&path).map_err(|source| BufferError::Map {
            path: path.as_ref().display().to_string(),
            source,
        })?;

        if region.len() == 0 {
            return Err(BufferError::ZeroCapacity);
        }

        Ok(Self::from_region(region))
    }

    fn from_region(mut region: MappedRegion) -> Self {
        Self {
            base: region.as_mut_ptr(),
            capacity: region.len(),
            _backing: Backing::Mapped(region),
        }
    }

    /// The number of addressable bytes in the region.
    #[inline(always)]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Verify the base address is 8-byte aligned so 64-bit atomics at
    /// 8-byte-aligned offsets are valid.
    ///
    /// Heap regions are cache-line aligned and mappings are page aligned,
    /// so this only fires for exotic externally-provided regions.
    pub fn verify_alignment(&self) -> Result<(), BufferError> {
        let addr = self.base as usize;
        if !is_aligned(addr, SIZE_OF_I64) {
            return Err(BufferError::Unaligned {
                addr,
                required: SIZE_OF_I64,
            });
        }

        Ok(())
    }

    #[inline(always)]
    fn atomic_i64(&self, offset: usize) -> &AtomicI64 {
        debug_assert!(offset + SIZE_OF_I64 <= self.capacity, "offset {offset} out of bounds");
        debug_assert!(is_aligned(offset, SIZE_OF_I64), "offset {offset} unaligned for i64");
        // SAFETY: in bounds, aligned, and the region lives as long as self.
        unsafe { &*(self.base.add(offset) as *const AtomicI64) }
    }

    #[inline(always)]
    fn atomic_i32(&self, offset: usize) -> &AtomicI32 {
        debug_assert!(offset + SIZE_OF_I32 <= self.capacity, "offset {offset} out of bounds");
        debug_assert!(is_aligned(offset, SIZE_OF_I32), "offset {offset} unaligned for i32");
        // SAFETY: in bounds, aligned, and the region lives as long as self.
        unsafe { &*(self.base.add(offset) as *const AtomicI32) }
    }

    #[inline(always)]
    fn atomic_i16(&self, offset: usize) -> &AtomicI16 {
        debug_assert!(offset + 2 <= self.capacity, "offset {offset} out of bounds");
        debug_assert!(is_aligned(offset, 2), "offset {offset} unaligned for i16");
        // SAFETY: in bounds, aligned, and the region lives as long as self.
        unsafe { &*(self.base.add(offset) as *const AtomicI16) }
    }

    #[inline(always)]
    fn atomic_u8(&self, offset: usize) -> &AtomicU8 {
        debug_assert!(offset < self.capacity, "offset {offset} out of bounds");
        // SAFETY: in bounds; byte access has no alignment requirement.
        unsafe { &*(self.base.add(offset) as *const AtomicU8) }
    }

    // --- plain (relaxed) scalar access ---

    #[inline(always)]
    pub fn get_i64(&self, offset: usize) -> i64 {
        self.atomic_i64(offset).load(Ordering::Relaxed)
    }

    #[inline(always)]
    pub fn put_i64(&self, offset: usize, value: i64) {
        self.atomic_i64(offset).store(value, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn get_i32(&self, offset: usize) -> i32 {
        self.atomic_i32(offset).load(Ordering::Relaxed)
    }

    #[inline(always)]
    pub fn put_i32(&self, offset: usize, value: i32) {
        self.atomic_i32(offset).store(value, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn get_i16(&self, offset: usize) -> i16 {
        self.atomic_i16(offset).load(Ordering::Relaxed)
    }

    #[inline(always)]
    pub fn put_i16(&self, offset: usize, value: i16) {
        self.atomic_i16(offset).store(value, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn get_u8(&self, offset: usize) -> u8 {
        self.atomic_u8(offset).load(Ordering::Relaxed)
    }

    #[inline(always)]
    pub fn put_u8(&self, offset: usize, value: u8) {
        self.atomic_u8(offset).store(value, Ordering::Relaxed);
    }

    // --- volatile (acquire/release) scalar access ---

    /// Acquire load: pairs with [`put_i64_ordered`](Self::put_i64_ordered)
    /// to observe every write made before the release.
    #[inline(always)]
    pub fn get_i64_volatile(&self, offset: usize) -> i64 {
        self.atomic_i64(offset).load(Ordering::Acquire)
    }

    /// Sequentially-consistent store; the strongest publish available.
    #[inline(always)]
    pub fn put_i64_volatile(&self, offset: usize, value: i64) {
        self.atomic_i64(offset).store(value, Ordering::SeqCst);
    }

    /// Release store: publishes every write made before it to acquire
    /// loaders of this offset.
    #[inline(always)]
    pub fn put_i64_ordered(&self, offset: usize, value: i64) {
        self.atomic_i64(offset).store(value, Ordering::Release);
    }

    #[inline(always)]
    pub fn get_i32_volatile(&self, offset: usize) -> i32 {
        self.atomic_i32(offset).load(Ordering::Acquire)
    }

    #[inline(always)]
    pub fn put_i32_volatile(&self, offset: usize, value: i32) {
        self.atomic_i32(offset).store(value, Ordering::SeqCst);
    }

    #[inline(always)]
    pub fn put_i32_ordered(&self, offset: usize, value: i32) {
        self.atomic_i32(offset).store(value, Ordering::Release);
    }

    // --- read-modify-write ---

    /// Compare-and-set with acquire-release ordering on success.
    #[inline(always)]
    pub fn compare_and_set_i64(&self, offset: usize, expected: i64, update: i64) -> bool {
        self.atomic_i64(offset)
            .compare_exchange(expected, update, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Atomic post-increment by `delta`; returns the prior value.
    #[inline(always)]
    pub fn get_and_add_i64(&self, offset: usize, delta: i64) -> i64 {
        self.atomic_i64(offset).fetch_add(delta, Ordering::AcqRel)
    }

    // --- bulk access ---

    /// Copy `src` into the region at `offset`.
    ///
    /// Non-atomic: callers must hold exclusive write access to the range,
    /// which the record protocols provide between claim and publication.
    #[inline(always)]
    pub fn put_bytes(&self, offset: usize, src: &[u8]) {
        assert!(offset + src.len() <= self.capacity, "range out of bounds");
        // SAFETY: range checked; src is a distinct allocation.
        unsafe { ptr::copy_nonoverlapping(src.as_ptr(), self.base.add(offset), src.len()) };
    }

    /// Copy `dst.len()` bytes out of the region at `offset`.
    #[inline(always)]
    pub fn get_bytes(&self, offset: usize, dst: &mut [u8]) {
        assert!(offset + dst.len() <= self.capacity, "range out of bounds");
        // SAFETY: range checked; dst is a distinct allocation.
        unsafe { ptr::copy_nonoverlapping(self.base.add(offset), dst.as_mut_ptr(), dst.len()) };
    }

    /// Fill `length` bytes at `offset` with `value`.
    #[inline(always)]
    pub fn set_memory(&self, offset: usize, length: usize, value: u8) {
        assert!(offset + length <= self.capacity, "range out of bounds");
        // SAFETY: range checked.
        unsafe { ptr::write_bytes(self.base.add(offset), value, length) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heap_region_is_zeroed_and_aligned() {
        let buffer = AtomicBuffer::allocate(1024).unwrap();
        buffer.verify_alignment().unwrap();
        assert_eq!(buffer.capacity(), 1024);
        for offset in (0..1024).step_by(8) {
            assert_eq!(buffer.get_i64(offset), 0);
        }
    }

    #[test]
    fn scalar_round_trips() {
        let buffer = AtomicBuffer::allocate(64).unwrap();

        buffer.put_i64(0, -42);
        assert_eq!(buffer.get_i64(0), -42);
        assert_eq!(buffer.get_i64_volatile(0), -42);

        buffer.put_i32_ordered(8, 7);
        assert_eq!(buffer.get_i32_volatile(8), 7);

        buffer.put_i16(12, -300);
        assert_eq!(buffer.get_i16(12), -300);

        buffer.put_u8(14, 0xAB);
        assert_eq!(buffer.get_u8(14), 0xAB);
    }

    #[test]
    fn compare_and_set_only_succeeds_on_expected() {
        let buffer = AtomicBuffer::allocate(64).unwrap();
        buffer.put_i64(0, 10);

        assert!(!buffer.compare_and_set_i64(0, 9, 20));
        assert_eq!(buffer.get_i64(0), 10);

        assert!(buffer.compare_and_set_i64(0, 10, 20));
        assert_eq!(buffer.get_i64(0), 20);
    }

    #[test]
    fn get_and_add_returns_prior() {
        let buffer = AtomicBuffer::allocate(64).unwrap();
        assert_eq!(buffer.get_and_add_i64(0, 5), 0);
        assert_eq!(buffer.get_and_add_i64(0, 5), 5);
        assert_eq!(buffer.get_i64(0), 10);
    }

    #[test]
    fn bulk_copies_and_fills() {
        let buffer = AtomicBuffer::allocate(64).unwrap();
        buffer.put_bytes(16, b"hello");

        let mut out = [0u8; 5];
        buffer.get_bytes(16, &mut out);
        assert_eq!(&out, b"hello");

        buffer.set_memory(16, 5, 0);
        buffer.get_bytes(16, &mut out);
        assert_eq!(out, [0; 5]);
    }

    #[test]
    fn zero_capacity_is_rejected() {
        assert!(matches!(
            AtomicBuffer::allocate(0),
            Err(BufferError::ZeroCapacity)
        ));
    }
}
