//! One-producer, one-consumer ring buffer.
//!
//! Same record format and read protocol as the many-to-one ring, with the
//! producer side simplified by exclusivity: the tail is advanced with a
//! plain-read/release-write instead of a CAS, and the head cache has a
//! single writer. Strict FIFO from producer to consumer.
//!
//! The producer additionally reserves one extra header's worth of space
//! on every claim and pre-zeroes the 8 bytes that follow the new record
//! before releasing the tail, so the consumer's next acquire load always
//! observes a clean, unpublished header without the consumer having to
//! zero consumed space behind itself.
//!
//! A one-to-one consumer can also drain a ring fed through
//! [`ManyToOneRingBuffer`](crate::ManyToOneRingBuffer) provided no other
//! producer shares it.

use basalt_buf::bits::align;
use basalt_buf::AtomicBuffer;

use crate::descriptor::ring_buffer::{
    check_capacity, max_msg_length, CONSUMER_HEARTBEAT_OFFSET, CORRELATION_COUNTER_OFFSET,
    HEAD_CACHE_POSITION_OFFSET, HEAD_POSITION_OFFSET, TAIL_POSITION_OFFSET,
};
use crate::descriptor::{
    check_type_id, encoded_msg_offset, length_offset, type_offset, RingBufferError, ALIGNMENT,
    HEADER_LENGTH, PADDING_MSG_TYPE_ID,
};

/// A lock-free one-to-one ring buffer over an [`AtomicBuffer`].
///
/// Exactly one thread may act as producer and one as consumer; those
/// contracts are the caller's to uphold.
pub struct OneToOneRingBuffer {
    buffer: AtomicBuffer,
    capacity: usize,
    max_msg_length: usize,
    tail_position_index: usize,
    head_cache_position_index: usize,
    head_position_index: usize,
    correlation_id_counter_index: usize,
    consumer_heartbeat_index: usize,
}

struct ReadGuard<'a> {
    ring: &'a OneToOneRingBuffer,
    head: i64,
    bytes_read: usize,
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        if self.bytes_read != 0 {
            self.ring.buffer.put_i64_ordered(
                self.ring.head_position_index,
                self.head + self.bytes_read as i64,
            );
        }
    }
}

impl OneToOneRingBuffer {
    /// Wrap `buffer` as a one-to-one ring.
    pub fn new(buffer: AtomicBuffer) -> Result<Self, RingBufferError> {
        let capacity = check_capacity(buffer.capacity())?;
        buffer.verify_alignment()?;

        Ok(Self {
            capacity,
            max_msg_length: max_msg_length(capacity),
            tail_position_index: capacity + TAIL_POSITION_OFFSET,
            head_cache_position_index: capacity + HEAD_CACHE_POSITION_OFFSET,
            head_position_index: capacity + HEAD_POSITION_OFFSET,
            correlation_id_counter_index: capacity + CORRELATION_COUNTER_OFFSET,
            consumer_heartbeat_index: capacity + CONSUMER_HEARTBEAT_OFFSET,
            buffer,
        })
    }

    /// Capacity of the data region in bytes.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Largest message payload this ring accepts.
    #[inline]
    pub fn max_msg_length(&self) -> usize {
        self.max_msg_length
    }

    /// The underlying buffer.
    #[inline]
    pub fn buffer(&self) -> &AtomicBuffer {
        &self.buffer
    }

    /// Reserve space and publish a message in one call. `Ok(false)` means
    /// insufficient capacity.
    pub fn write(&self, type_id: i32, src: &[u8]) -> Result<bool, RingBufferError> {
        check_type_id(type_id)?;
        self.check_msg_length(src.len())?;

        let record_length = src.len() + HEADER_LENGTH;
        let record_index = match self.claim_capacity(record_length) {
            None => return Ok(false),
            Some(index) => index,
        };

        let buffer = &self.buffer;
        buffer.put_bytes(encoded_msg_offset(record_index), src);
        buffer.put_i32(type_offset(record_index), type_id);
        buffer.put_i32_ordered(length_offset(record_index), record_length as i32);

        Ok(true)
    }

    /// Reserve space for `length` payload bytes; returns the payload
    /// index, or `None` for insufficient capacity. Finish with
    /// [`commit`](Self::commit) or [`abort`](Self::abort).
    pub fn try_claim(&self, type_id: i32, length: usize) -> Result<Option<usize>, RingBufferError> {
        check_type_id(type_id)?;
        self.check_msg_length(length)?;

        let record_length = length + HEADER_LENGTH;
        let record_index = match self.claim_capacity(record_length) {
            None => return Ok(None),
            Some(index) => index,
        };

        let buffer = &self.buffer;
        buffer.put_i32(type_offset(record_index), type_id);
        // Plain store suffices for the negative length: the header was
        // pre-zeroed during the claim and nothing is published until the
        // commit's release store flips the sign.
        buffer.put_i32(length_offset(record_index), -(record_length as i32));

        Ok(Some(encoded_msg_offset(record_index)))
    }

    /// Publish a claimed record.
    pub fn commit(&self, index: usize) -> Result<(), RingBufferError> {
        let record_index = self.compute_record_index(index)?;
        let record_length = self.verify_claimed_space_not_released(record_index)?;

        self.buffer
            .put_i32_ordered(length_offset(record_index), -record_length);

        Ok(())
    }

    /// Turn a claimed record into padding the consumer skips.
    pub fn abort(&self, index: usize) -> Result<(), RingBufferError> {
        let record_index = self.compute_record_index(index)?;
        let record_length = self.verify_claimed_space_not_released(record_index)?;

        self.buffer
            .put_i32(type_offset(record_index), PADDING_MSG_TYPE_ID);
        self.buffer
            .put_i32_ordered(length_offset(record_index), -record_length);

        Ok(())
    }

    /// Drain all available messages.
    pub fn read<F>(&self, handler: F) -> usize
    where
        F: FnMut(i32, &AtomicBuffer, usize, usize),
    {
        self.read_limited(handler, usize::MAX)
    }

    /// Drain up to `message_count_limit` messages. The head advances past
    /// every record stepped over even if the handler panics.
    pub fn read_limited<F>(&self, mut handler: F, message_count_limit: usize) -> usize
    where
        F: FnMut(i32, &AtomicBuffer, usize, usize),
    {
        let mut messages_read = 0;

        let buffer = &self.buffer;
        let head = buffer.get_i64(self.head_position_index);

        let capacity = self.capacity;
        let head_index = (head & (capacity as i64 - 1)) as usize;
        let contiguous_block_length = capacity - head_index;

        let mut scope = ReadGuard {
            ring: self,
            head,
            bytes_read: 0,
        };

        while scope.bytes_read < contiguous_block_length && messages_read < message_count_limit {
            let record_index = head_index + scope.bytes_read;
            let record_length = buffer.get_i32_volatile(length_offset(record_index));
            if record_length <= 0 {
                break;
            }

            scope.bytes_read += align(record_length as usize, ALIGNMENT);

            let type_id = buffer.get_i32(type_offset(record_index));
            if type_id == PADDING_MSG_TYPE_ID {
                continue;
            }

            messages_read += 1;
            handler(
                type_id,
                buffer,
                encoded_msg_offset(record_index),
                record_length as usize - HEADER_LENGTH,
            );
        }

        messages_read
    }

    /// A single producer cannot strand a claim the way racing producers
    /// can, so there is never anything to unblock.
    #[inline]
    pub fn unblock(&self) -> bool {
        false
    }

    /// Next value from the shared correlation id counter.
    #[inline]
    pub fn next_correlation_id(&self) -> i64 {
        self.buffer.get_and_add_i64(self.correlation_id_counter_index, 1)
    }

    /// The producer's published position in bytes.
    #[inline]
    pub fn producer_position(&self) -> i64 {
        self.buffer.get_i64_volatile(self.tail_position_index)
    }

    /// The consumer's position in bytes.
    #[inline]
    pub fn consumer_position(&self) -> i64 {
        self.buffer.get_i64_volatile(self.head_position_index)
    }

    /// Record the time of the consumer's last activity.
    #[inline]
    pub fn set_consumer_heartbeat_time(&self, time: i64) {
        self.buffer
            .put_i64_ordered(self.consumer_heartbeat_index, time);
    }

    /// The time of the consumer's last recorded activity.
    #[inline]
    pub fn consumer_heartbeat_time(&self) -> i64 {
        self.buffer.get_i64_volatile(self.consumer_heartbeat_index)
    }

    /// Bytes currently queued, consistent under concurrent mutation.
    pub fn size(&self) -> usize {
        let buffer = &self.buffer;
        let mut head_before;
        let mut tail;
        let mut head_after = buffer.get_i64_volatile(self.head_position_index);

        loop {
            head_before = head_after;
            tail = buffer.get_i64_volatile(self.tail_position_index);
            head_after = buffer.get_i64_volatile(self.head_position_index);

            if head_after == head_before {
                break;
            }
        }

        let size = tail - head_after;
        if size < 0 {
            0
        } else if size as usize > self.capacity {
            self.capacity
        } else {
            size as usize
        }
    }

    fn check_msg_length(&self, length: usize) -> Result<(), RingBufferError> {
        if length > self.max_msg_length {
            return Err(RingBufferError::MessageTooLong {
                length,
                max: self.max_msg_length,
            });
        }

        Ok(())
    }

    /// Reserve space ahead of the tail. Beyond the aligned record this
    /// claims one extra header so the following header can always be
    /// pre-zeroed, which is what lets `read` skip zeroing consumed bytes.
    fn claim_capacity(&self, record_length: usize) -> Option<usize> {
        let aligned_record_length = align(record_length, ALIGNMENT);
        let required = aligned_record_length + HEADER_LENGTH;
        let capacity = self.capacity;
        let mask = capacity as i64 - 1;
        let buffer = &self.buffer;

        let mut head = buffer.get_i64(self.head_cache_position_index);
        let tail = buffer.get_i64(self.tail_position_index);

        let available = capacity as i64 - (tail - head);
        if required as i64 > available {
            head = buffer.get_i64_volatile(self.head_position_index);
            if required as i64 > capacity as i64 - (tail - head) {
                return None;
            }

            buffer.put_i64(self.head_cache_position_index, head);
        }

        let mut padding = 0usize;
        let mut record_index = (tail & mask) as usize;
        let to_buffer_end = capacity - record_index;

        if required > to_buffer_end {
            let mut head_index = (head & mask) as usize;

            if required > head_index {
                head = buffer.get_i64_volatile(self.head_position_index);
                head_index = (head & mask) as usize;
                if required > head_index {
                    return None;
                }

                buffer.put_i64(self.head_cache_position_index, head);
            }

            padding = to_buffer_end;
        }

        if padding != 0 {
            buffer.put_i64(0, 0);
            buffer.put_i32(type_offset(record_index), PADDING_MSG_TYPE_ID);
            buffer.put_i32_ordered(length_offset(record_index), padding as i32);
            record_index = 0;
        }

        // Pre-zero the next message header before the tail release makes
        // the claim visible.
        buffer.put_i64(record_index + aligned_record_length, 0);
        buffer.put_i64_ordered(
            self.tail_position_index,
            tail + (aligned_record_length + padding) as i64,
        );

        Some(record_index)
    }

    fn compute_record_index(&self, index: usize) -> Result<usize, RingBufferError> {
        if index < HEADER_LENGTH || index - HEADER_LENGTH > self.capacity - HEADER_LENGTH {
            return Err(RingBufferError::InvalidIndex(index));
        }

        Ok(index - HEADER_LENGTH)
    }

    fn verify_claimed_space_not_released(
        &self,
        record_index: usize,
    ) -> Result<i32, RingBufferError> {
        let record_length = self.buffer.get_i32(length_offset(record_index));
        if record_length < 0 {
            return Ok(record_length);
        }

        if self.buffer.get_i32(type_offset(record_index)) == PADDING_MSG_TYPE_ID {
            Err(RingBufferError::AlreadyAborted)
        } else {
            Err(RingBufferError::AlreadyCommitted)
        }
    }
}
