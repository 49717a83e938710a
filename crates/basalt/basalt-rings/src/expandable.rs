//! Single-threaded ring buffer that grows instead of rejecting writes.
//!
//! Messages are appended and consumed in FIFO order. When an append does
//! not fit, the capacity doubles (up to [`ExpandableRingBuffer::MAX_CAPACITY`])
//! and the live contents are unwrapped to offset zero in the new
//! allocation. Non-destructive iteration is available alongside
//! consumption, and a consumer can decline a message to stop mid-stream.
//!
//! This buffer shares the header-then-payload record idea with the
//! concurrent rings but none of their atomics: it is plain memory for a
//! single owner, useful for batching and replay queues feeding the
//! concurrent structures.

use basalt_buf::bits::{align, next_positive_power_of_two};

const MESSAGE_LENGTH_OFFSET: usize = 0;
const MESSAGE_TYPE_OFFSET: usize = 4;
const MESSAGE_TYPE_PADDING: i32 = 0;
const MESSAGE_TYPE_DATA: i32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum ExpandableRingBufferError {
    #[error("max capacity must be a power of two no greater than {limit}, got {value}")]
    InvalidMaxCapacity { value: usize, limit: usize },

    #[error("initial capacity {initial} exceeds max capacity {max}")]
    InitialExceedsMax { initial: usize, max: usize },

    #[error("required capacity {required} exceeds max capacity {max}")]
    RequiredExceedsMax { required: usize, max: usize },

    #[error("head offset {offset} is not a record boundary within size {size}")]
    InvalidHeadOffset { offset: usize, size: usize },
}

#[inline]
fn get_i32(buffer: &[u8], offset: usize) -> i32 {
    i32::from_ne_bytes(buffer[offset..offset + 4].try_into().expect("4 bytes"))
}

#[inline]
fn put_i32(buffer: &mut [u8], offset: usize, value: i32) {
    buffer[offset..offset + 4].copy_from_slice(&value.to_ne_bytes());
}

/// A FIFO byte ring with expandable capacity.
pub struct ExpandableRingBuffer {
    buffer: Vec<u8>,
    max_capacity: usize,
    capacity: usize,
    mask: i64,
    head: i64,
    tail: i64,
}

/// Advances the head on every exit path of a consume, including a
/// panicking consumer.
struct ConsumeGuard<'a> {
    head: &'a mut i64,
    position: i64,
}

impl Drop for ConsumeGuard<'_> {
    fn drop(&mut self) {
        *self.head = self.position;
    }
}

impl Default for ExpandableRingBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl ExpandableRingBuffer {
    /// Maximum capacity to which any instance may grow: 1 GiB.
    pub const MAX_CAPACITY: usize = 1 << 30;

    /// Alignment in bytes for the beginning of a message header.
    pub const HEADER_ALIGNMENT: usize = 8;

    /// Length of the encapsulating header: `i32` length plus `i32` type.
    pub const HEADER_LENGTH: usize = 8;

    /// An initially empty buffer that may grow to
    /// [`MAX_CAPACITY`](Self::MAX_CAPACITY).
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            max_capacity: Self::MAX_CAPACITY,
            capacity: 0,
            mask: 0,
            head: 0,
            tail: 0,
        }
    }

    /// A buffer with explicit initial and maximum capacities, both
    /// rounded-up powers of two.
    pub fn with_capacity(
        initial_capacity: usize,
        max_capacity: usize,
    ) -> Result<Self, ExpandableRingBufferError> {
        if max_capacity > Self::MAX_CAPACITY || !max_capacity.is_power_of_two() {
            return Err(ExpandableRingBufferError::InvalidMaxCapacity {
                value: max_capacity,
                limit: Self::MAX_CAPACITY,
            });
        }

        if initial_capacity == 0 {
            let mut buffer = Self::new();
            buffer.max_capacity = max_capacity;
            return Ok(buffer);
        }

        let capacity = next_positive_power_of_two(initial_capacity);
        if capacity > max_capacity {
            return Err(ExpandableRingBufferError::InitialExceedsMax {
                initial: initial_capacity,
                max: max_capacity,
            });
        }

        Ok(Self {
            buffer: vec![0; capacity],
            max_capacity,
            capacity,
            mask: capacity as i64 - 1,
            head: 0,
            tail: 0,
        })
    }

    /// The maximum capacity to which this buffer can grow.
    #[inline]
    pub fn max_capacity(&self) -> usize {
        self.max_capacity
    }

    /// Current capacity in bytes.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes currently populated.
    #[inline]
    pub fn size(&self) -> usize {
        (self.tail - self.head) as usize
    }

    /// True when no messages are queued.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    /// Position from which bytes are consumed.
    #[inline]
    pub fn head(&self) -> i64 {
        self.head
    }

    /// Position at which new bytes are appended.
    #[inline]
    pub fn tail(&self) -> i64 {
        self.tail
    }

    /// Empty the buffer and size it for `required_capacity`, growing or
    /// shrinking the allocation as needed.
    pub fn reset(&mut self, required_capacity: usize) -> Result<(), ExpandableRingBufferError> {
        let new_capacity = next_positive_power_of_two(required_capacity);
        if new_capacity > self.max_capacity {
            return Err(ExpandableRingBufferError::RequiredExceedsMax {
                required: required_capacity,
                max: self.max_capacity,
            });
        }

        if new_capacity != self.capacity {
            self.buffer = vec![0; new_capacity];
            self.capacity = new_capacity;
            self.mask = new_capacity as i64 - 1;
        }

        self.head = 0;
        self.tail = 0;

        Ok(())
    }

    /// Append a message, expanding the buffer if required.
    ///
    /// Returns `false` when the message cannot fit even at
    /// [`max_capacity`](Self::max_capacity).
    pub fn append(&mut self, src: &[u8]) -> bool {
        let head_offset = (self.head & self.mask) as usize;
        let tail_offset = (self.tail & self.mask) as usize;
        let aligned_length = align(Self::HEADER_LENGTH + src.len(), Self::HEADER_ALIGNMENT);

        let total_remaining = self.capacity - self.size();
        if aligned_length > total_remaining {
            self.resize(aligned_length);
        } else if tail_offset >= head_offset {
            let to_end_remaining = self.capacity - tail_offset;
            if aligned_length > to_end_remaining {
                if aligned_length <= total_remaining - to_end_remaining {
                    put_i32(
                        &mut self.buffer,
                        tail_offset + MESSAGE_LENGTH_OFFSET,
                        to_end_remaining as i32,
                    );
                    put_i32(
                        &mut self.buffer,
                        tail_offset + MESSAGE_TYPE_OFFSET,
                        MESSAGE_TYPE_PADDING,
                    );
                    self.tail += to_end_remaining as i64;
                } else {
                    self.resize(aligned_length);
                }
            }
        }

        // The message must fit in the remaining space and contiguously
        // ahead of the (possibly padded or resized) tail; at max capacity
        // both can fail.
        if aligned_length > self.capacity - self.size()
            || aligned_length > self.capacity - ((self.tail & self.mask) as usize)
        {
            return false;
        }

        self.write_message(src);
        self.tail += aligned_length as i64;

        true
    }

    /// Consume messages up to `message_limit`, passing each to `consumer`
    /// as `(payload, head_offset)` where `head_offset` is how far past the
    /// pre-consume head the message ends.
    ///
    /// A consumer returning `false` leaves that message (and everything
    /// after it) in the buffer. Returns the number of bytes consumed; the
    /// head advances even if the consumer panics.
    pub fn consume<F>(&mut self, mut consumer: F, message_limit: usize) -> usize
    where
        F: FnMut(&[u8], usize) -> bool,
    {
        let head = self.head;
        let mut count = 0;

        let mut guard = ConsumeGuard {
            head: &mut self.head,
            position: head,
        };

        while count < message_limit && guard.position < self.tail {
            let offset = (guard.position & self.mask) as usize;
            let length = get_i32(&self.buffer, offset + MESSAGE_LENGTH_OFFSET) as usize;
            let type_id = get_i32(&self.buffer, offset + MESSAGE_TYPE_OFFSET);
            let aligned_length = align(length, Self::HEADER_ALIGNMENT);

            guard.position += aligned_length as i64;

            if type_id != MESSAGE_TYPE_PADDING {
                let head_offset = (guard.position - head) as usize;
                let payload =
                    &self.buffer[offset + Self::HEADER_LENGTH..offset + length];
                if !consumer(payload, head_offset) {
                    guard.position -= aligned_length as i64;
                    break;
                }

                count += 1;
            }
        }

        let bytes = (guard.position - head) as usize;
        drop(guard);

        bytes
    }

    /// Iterate messages without consuming, from the head.
    ///
    /// Returns the number of bytes iterated over.
    pub fn for_each<F>(&self, consumer: F, limit: usize) -> usize
    where
        F: FnMut(&[u8], usize) -> bool,
    {
        self.iterate(self.head, consumer, limit)
    }

    /// Iterate messages without consuming, starting `head_offset` bytes
    /// past the head. The offset must land on a record boundary.
    pub fn for_each_from<F>(
        &self,
        head_offset: usize,
        consumer: F,
        limit: usize,
    ) -> Result<usize, ExpandableRingBufferError>
    where
        F: FnMut(&[u8], usize) -> bool,
    {
        if head_offset > self.size() || head_offset % Self::HEADER_ALIGNMENT != 0 {
            return Err(ExpandableRingBufferError::InvalidHeadOffset {
                offset: head_offset,
                size: self.size(),
            });
        }

        Ok(self.iterate(self.head + head_offset as i64, consumer, limit))
    }

    fn iterate<F>(&self, initial_position: i64, mut consumer: F, limit: usize) -> usize
    where
        F: FnMut(&[u8], usize) -> bool,
    {
        let mut position = initial_position;
        let mut count = 0;

        while count < limit && position < self.tail {
            let offset = (position & self.mask) as usize;
            let length = get_i32(&self.buffer, offset + MESSAGE_LENGTH_OFFSET) as usize;
            let type_id = get_i32(&self.buffer, offset + MESSAGE_TYPE_OFFSET);
            let aligned_length = align(length, Self::HEADER_ALIGNMENT);

            position += aligned_length as i64;

            if type_id != MESSAGE_TYPE_PADDING {
                let head_offset = (position - self.head) as usize;
                let payload = &self.buffer[offset + Self::HEADER_LENGTH..offset + length];
                if !consumer(payload, head_offset) {
                    break;
                }

                count += 1;
            }
        }

        (position - initial_position) as usize
    }

    /// Grow to the next power of two covering the current contents plus
    /// `new_message_length`, unwrapping the live bytes to offset zero.
    /// Silently does nothing when that would exceed the max capacity; the
    /// caller's remaining-space check turns that into a `false` append.
    fn resize(&mut self, new_message_length: usize) {
        let new_capacity = next_positive_power_of_two(self.capacity + new_message_length);
        if new_capacity < self.capacity || new_capacity > self.max_capacity {
            return;
        }

        let mut new_buffer = vec![0u8; new_capacity];

        let head_offset = (self.head & self.mask) as usize;
        let remaining = self.size();
        let first_copy_length = remaining.min(self.capacity - head_offset);
        new_buffer[..first_copy_length]
            .copy_from_slice(&self.buffer[head_offset..head_offset + first_copy_length]);

        let mut tail_offset = first_copy_length;
        if first_copy_length < remaining {
            let length = remaining - first_copy_length;
            new_buffer[first_copy_length..first_copy_length + length]
                .copy_from_slice(&self.buffer[..length]);
            tail_offset += length;
        }

        self.buffer = new_buffer;
        self.capacity = new_capacity;
        self.mask = new_capacity as i64 - 1;
        self.head = 0;
        self.tail = tail_offset as i64;
    }

    fn write_message(&mut self, src: &[u8]) {
        let offset = (self.tail & self.mask) as usize;

        put_i32(
            &mut self.buffer,
            offset + MESSAGE_LENGTH_OFFSET,
            (Self::HEADER_LENGTH + src.len()) as i32,
        );
        put_i32(&mut self.buffer, offset + MESSAGE_TYPE_OFFSET, MESSAGE_TYPE_DATA);
        self.buffer[offset + Self::HEADER_LENGTH..offset + Self::HEADER_LENGTH + src.len()]
            .copy_from_slice(src);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic::{catch_unwind, AssertUnwindSafe};

    #[test]
    fn starts_empty_and_grows_on_first_append() {
        let mut buffer = ExpandableRingBuffer::new();
        assert!(buffer.is_empty());
        assert_eq!(buffer.capacity(), 0);

        assert!(buffer.append(b"abcdefgh"));
        assert!(buffer.capacity() >= 16);
        assert_eq!(buffer.size(), 16);
    }

    #[test]
    fn appends_and_consumes_in_fifo_order() {
        let mut buffer = ExpandableRingBuffer::with_capacity(128, 1024).unwrap();
        for i in 0u32..5 {
            assert!(buffer.append(&i.to_ne_bytes()));
        }

        let mut values = Vec::new();
        let bytes = buffer.consume(
            |payload, _| {
                values.push(u32::from_ne_bytes(payload.try_into().unwrap()));
                true
            },
            usize::MAX,
        );

        assert_eq!(values, vec![0, 1, 2, 3, 4]);
        assert_eq!(bytes, 5 * 16);
        assert!(buffer.is_empty());
    }

    #[test]
    fn growth_unwraps_wrapped_contents() {
        let mut buffer = ExpandableRingBuffer::with_capacity(64, 1024).unwrap();

        // Fill, drain half, refill so the contents wrap, then force a
        // grow and verify order survives the unwrap.
        for i in 0u32..4 {
            assert!(buffer.append(&i.to_ne_bytes()));
        }
        buffer.consume(|_, _| true, 2);
        for i in 4u32..6 {
            assert!(buffer.append(&i.to_ne_bytes()));
        }

        assert!(buffer.append(&[0xAB; 64]));
        assert!(buffer.capacity() > 64);
        assert_eq!(buffer.head(), 0);

        let mut values = Vec::new();
        buffer.consume(
            |payload, _| {
                if payload.len() == 4 {
                    values.push(u32::from_ne_bytes(payload.try_into().unwrap()));
                }
                true
            },
            usize::MAX,
        );
        assert_eq!(values, vec![2, 3, 4, 5]);
    }

    #[test]
    fn wrap_uses_padding_when_space_exists_at_the_front() {
        let mut buffer = ExpandableRingBuffer::with_capacity(64, 64).unwrap();

        for value in [1u8, 2, 3] {
            assert!(buffer.append(&[value; 8])); // 16 bytes each, tail at 48
        }
        buffer.consume(|_, _| true, 2); // head at 32

        // 24 bytes needed, 16 remain at the end, 32 are free at the
        // front: padding wraps the tail without growing, since capacity
        // is already at max.
        assert!(buffer.append(&[4; 16]));
        assert_eq!(buffer.capacity(), 64);

        let mut sizes = Vec::new();
        buffer.consume(
            |payload, _| {
                sizes.push(payload.len());
                true
            },
            usize::MAX,
        );
        assert_eq!(sizes, vec![8, 16]);
    }

    #[test]
    fn append_fails_when_space_is_fragmented_at_max_capacity() {
        let mut buffer = ExpandableRingBuffer::with_capacity(64, 64).unwrap();

        for value in [1u8, 2, 3] {
            assert!(buffer.append(&[value; 8]));
        }
        buffer.consume(|_, _| true, 1); // head at 16, tail at 48

        // 24 bytes needed: 16 at the end plus 16 at the front, but no
        // contiguous run and no room left to grow.
        assert!(!buffer.append(&[4; 16]));
        assert_eq!(buffer.size(), 32);
    }

    #[test]
    fn append_fails_at_max_capacity() {
        let mut buffer = ExpandableRingBuffer::with_capacity(64, 64).unwrap();
        assert!(buffer.append(&[0; 48]));
        assert!(!buffer.append(&[0; 48]));
        // The refused message left the buffer untouched.
        assert_eq!(buffer.size(), 56);
    }

    #[test]
    fn consumer_false_retains_the_message() {
        let mut buffer = ExpandableRingBuffer::with_capacity(128, 128).unwrap();
        buffer.append(&1u32.to_ne_bytes());
        buffer.append(&2u32.to_ne_bytes());

        let bytes = buffer.consume(
            |payload, _| u32::from_ne_bytes(payload.try_into().unwrap()) != 2,
            usize::MAX,
        );

        assert_eq!(bytes, 16);
        assert_eq!(buffer.size(), 16);

        let mut remaining = Vec::new();
        buffer.consume(
            |payload, _| {
                remaining.push(u32::from_ne_bytes(payload.try_into().unwrap()));
                true
            },
            usize::MAX,
        );
        assert_eq!(remaining, vec![2]);
    }

    #[test]
    fn consumer_panic_still_advances_head() {
        let mut buffer = ExpandableRingBuffer::with_capacity(128, 128).unwrap();
        buffer.append(&1u32.to_ne_bytes());
        buffer.append(&2u32.to_ne_bytes());

        let outcome = catch_unwind(AssertUnwindSafe(|| {
            buffer.consume(|_, _| panic!("consumer failure"), usize::MAX)
        }));

        assert!(outcome.is_err());
        // The panicking message was stepped over before the panic.
        assert_eq!(buffer.head(), 16);
        assert_eq!(buffer.size(), 16);
    }

    #[test]
    fn for_each_iterates_without_consuming() {
        let mut buffer = ExpandableRingBuffer::with_capacity(128, 128).unwrap();
        buffer.append(&1u32.to_ne_bytes());
        buffer.append(&2u32.to_ne_bytes());

        let mut seen = 0;
        let bytes = buffer.for_each(
            |_, _| {
                seen += 1;
                true
            },
            usize::MAX,
        );

        assert_eq!(seen, 2);
        assert_eq!(bytes, 32);
        assert_eq!(buffer.size(), 32);
    }

    #[test]
    fn for_each_from_requires_a_record_boundary() {
        let mut buffer = ExpandableRingBuffer::with_capacity(128, 128).unwrap();
        buffer.append(&1u32.to_ne_bytes());
        buffer.append(&2u32.to_ne_bytes());

        let mut seen = 0;
        let bytes = buffer
            .for_each_from(
                16,
                |_, _| {
                    seen += 1;
                    true
                },
                usize::MAX,
            )
            .unwrap();
        assert_eq!(seen, 1);
        assert_eq!(bytes, 16);

        assert!(buffer.for_each_from(12, |_, _| true, usize::MAX).is_err());
        assert!(buffer.for_each_from(64, |_, _| true, usize::MAX).is_err());
    }

    #[test]
    fn reset_empties_and_resizes() {
        let mut buffer = ExpandableRingBuffer::with_capacity(64, 1024).unwrap();
        buffer.append(&[0; 32]);

        buffer.reset(256).unwrap();
        assert!(buffer.is_empty());
        assert_eq!(buffer.capacity(), 256);

        assert!(matches!(
            buffer.reset(2048),
            Err(ExpandableRingBufferError::RequiredExceedsMax { .. })
        ));
    }

    #[test]
    fn rejects_invalid_capacities() {
        assert!(matches!(
            ExpandableRingBuffer::with_capacity(64, 100),
            Err(ExpandableRingBufferError::InvalidMaxCapacity { .. })
        ));
        assert!(matches!(
            ExpandableRingBuffer::with_capacity(512, 256),
            Err(ExpandableRingBufferError::InitialExceedsMax { .. })
        ));
    }
}
