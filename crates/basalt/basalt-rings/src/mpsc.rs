//! Many-producer, one-consumer ring buffer exchanging variable-length
//! typed messages.
//!
//! Producers race a compare-and-set on the tail position to claim space,
//! then publish by release-storing a positive record length; the consumer
//! walks records from the head, acquire-loading each length, and frees
//! space by zeroing what it consumed and release-storing the advanced
//! head. The only inter-thread synchronisation point for a message is the
//! length field of its record.
//!
//! Messages are consumed in tail order, i.e. the order in which producers
//! won the tail CAS. No fairness between producers is promised.
//!
//! # Thread safety
//!
//! Any number of threads may call the producer operations ([`write`],
//! [`try_claim`], [`commit`], [`abort`], [`next_correlation_id`])
//! concurrently. Exactly one thread at a time may call the consumer
//! operations ([`read`], [`unblock`]); that contract is the caller's to
//! uphold. Observers ([`size`], positions, heartbeat reads) are safe from
//! any thread.
//!
//! [`write`]: ManyToOneRingBuffer::write
//! [`try_claim`]: ManyToOneRingBuffer::try_claim
//! [`commit`]: ManyToOneRingBuffer::commit
//! [`abort`]: ManyToOneRingBuffer::abort
//! [`next_correlation_id`]: ManyToOneRingBuffer::next_correlation_id
//! [`read`]: ManyToOneRingBuffer::read
//! [`unblock`]: ManyToOneRingBuffer::unblock
//! [`size`]: ManyToOneRingBuffer::size

use basalt_buf::bits::align;
use basalt_buf::AtomicBuffer;
use tracing::warn;

use crate::descriptor::ring_buffer::{
    check_capacity, max_msg_length, CONSUMER_HEARTBEAT_OFFSET, CORRELATION_COUNTER_OFFSET,
    HEAD_CACHE_POSITION_OFFSET, HEAD_POSITION_OFFSET, TAIL_POSITION_OFFSET,
};
use crate::descriptor::{
    check_type_id, encoded_msg_offset, length_offset, type_offset, RingBufferError, ALIGNMENT,
    HEADER_LENGTH, PADDING_MSG_TYPE_ID,
};

/// A lock-free many-to-one ring buffer over an [`AtomicBuffer`].
///
/// The underlying region must be a power of two in size plus
/// [`TRAILER_LENGTH`](crate::descriptor::ring_buffer::TRAILER_LENGTH).
pub struct ManyToOneRingBuffer {
    buffer: AtomicBuffer,
    capacity: usize,
    max_msg_length: usize,
    tail_position_index: usize,
    head_cache_position_index: usize,
    head_position_index: usize,
    correlation_id_counter_index: usize,
    consumer_heartbeat_index: usize,
}

/// Commits the consumer's progress on every exit path of a read, matching
/// the guarantee that a panicking handler cannot leave the buffer
/// half-consumed. Consumed bytes are zeroed so stale headers can never be
/// misread as new records.
struct ReadGuard<'a> {
    ring: &'a ManyToOneRingBuffer,
    head: i64,
    head_index: usize,
    bytes_read: usize,
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        if self.bytes_read != 0 {
            let buffer = &self.ring.buffer;
            buffer.set_memory(self.head_index, self.bytes_read, 0);
            buffer.put_i64_ordered(
                self.ring.head_position_index,
                self.head + self.bytes_read as i64,
            );
        }
    }
}

impl ManyToOneRingBuffer {
    /// Wrap `buffer` as a many-to-one ring.
    ///
    /// # Errors
    ///
    /// [`RingBufferError::InvalidCapacity`] if the region is not a power
    /// of two plus the trailer, or a buffer alignment error if the base
    /// address cannot host 64-bit atomics.
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

    /// Largest message payload this ring accepts (an eighth of capacity).
    #[inline]
    pub fn max_msg_length(&self) -> usize {
        self.max_msg_length
    }

    /// The underlying buffer, for zero-copy reads from handlers and for
    /// tooling that inspects the trailer.
    #[inline]
    pub fn buffer(&self) -> &AtomicBuffer {
        &self.buffer
    }

    /// Atomically reserve space and publish a message in one call.
    ///
    /// Returns `Ok(false)` when the ring lacks capacity; that is an
    /// expected outcome under load, not an error.
    pub fn write(&self, type_id: i32, src: &[u8]) -> Result<bool, RingBufferError> {
        check_type_id(type_id)?;
        self.check_msg_length(src.len())?;

        let record_length = src.len() + HEADER_LENGTH;
        let record_index = match self.claim_capacity(record_length) {
            None => return Ok(false),
            Some(index) => index,
        };

        let buffer = &self.buffer;
        buffer.put_i32_ordered(length_offset(record_index), -(record_length as i32));
        buffer.put_i32(type_offset(record_index), type_id);
        buffer.put_bytes(encoded_msg_offset(record_index), src);
        buffer.put_i32_ordered(length_offset(record_index), record_length as i32);

        Ok(true)
    }

    /// Reserve space for a message of `length` bytes and return the index
    /// at which the caller writes the payload directly into
    /// [`buffer`](Self::buffer).
    ///
    /// The claim must be finished with [`commit`](Self::commit) or
    /// [`abort`](Self::abort). Returns `Ok(None)` when the ring lacks
    /// capacity.
    pub fn try_claim(&self, type_id: i32, length: usize) -> Result<Option<usize>, RingBufferError> {
        check_type_id(type_id)?;
        self.check_msg_length(length)?;

        let record_length = length + HEADER_LENGTH;
        let record_index = match self.claim_capacity(record_length) {
            None => return Ok(None),
            Some(index) => index,
        };

        let buffer = &self.buffer;
        buffer.put_i32_ordered(length_offset(record_index), -(record_length as i32));
        buffer.put_i32(type_offset(record_index), type_id);

        Ok(Some(encoded_msg_offset(record_index)))
    }

    /// Publish a claimed record by inverting its length sign with a
    /// release store.
    pub fn commit(&self, index: usize) -> Result<(), RingBufferError> {
        let record_index = self.compute_record_index(index)?;
        let record_length = self.verify_claimed_space_not_released(record_index)?;

        self.buffer
            .put_i32_ordered(length_offset(record_index), -record_length);

        Ok(())
    }

    /// Abandon a claimed record: the reserved space becomes a padding
    /// record the consumer skips.
    pub fn abort(&self, index: usize) -> Result<(), RingBufferError> {
        let record_index = self.compute_record_index(index)?;
        let record_length = self.verify_claimed_space_not_released(record_index)?;

        self.buffer
            .put_i32(type_offset(record_index), PADDING_MSG_TYPE_ID);
        self.buffer
            .put_i32_ordered(length_offset(record_index), -record_length);

        Ok(())
    }

    /// Drain all available messages. Equivalent to
    /// [`read_limited`](Self::read_limited) with no limit.
    pub fn read<F>(&self, handler: F) -> usize
    where
        F: FnMut(i32, &AtomicBuffer, usize, usize),
    {
        self.read_limited(handler, usize::MAX)
    }

    /// Drain up to `message_count_limit` messages, invoking
    /// `handler(type_id, buffer, index, length)` for each.
    ///
    /// Progress is committed even if the handler panics: consumed bytes
    /// are zeroed and the head is advanced past every record the loop
    /// stepped over before the panic escapes.
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
            head_index,
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

    /// Recover from a producer that claimed space and then died before
    /// publishing.
    ///
    /// Converts the stuck record (or the unclaimed gap at the head) into
    /// padding so the consumer can progress. Deliberately conservative: if
    /// a second read of the scanned region shows a producer is still
    /// making progress, nothing is mutated and `false` is returned.
    pub fn unblock(&self) -> bool {
        let buffer = &self.buffer;
        let head_position = buffer.get_i64_volatile(self.head_position_index);
        let tail_position = buffer.get_i64_volatile(self.tail_position_index);

        // Compare the unmasked positions: on an exactly-full ring the
        // masked indices coincide while a stuck claim still blocks the
        // consumer.
        if head_position == tail_position {
            return false;
        }

        let mask = self.capacity as i64 - 1;
        let consumer_index = (head_position & mask) as usize;
        let producer_index = (tail_position & mask) as usize;

        let mut unblocked = false;
        let length = buffer.get_i32_volatile(length_offset(consumer_index));
        if length < 0 {
            // Claimed but never published: convert in place.
            buffer.put_i32(type_offset(consumer_index), PADDING_MSG_TYPE_ID);
            buffer.put_i32_ordered(length_offset(consumer_index), -length);
            unblocked = true;
        } else if length == 0 {
            // Tail moved but the header was never staged. Scan forward for
            // the next record and, if the gap is still all zeros on a
            // second pass, pad over it.
            let limit = if producer_index > consumer_index {
                producer_index
            } else {
                self.capacity
            };

            let mut i = consumer_index + ALIGNMENT;
            loop {
                let forward_length = buffer.get_i32_volatile(length_offset(i));
                if forward_length != 0 {
                    if self.scan_back_to_confirm_still_zeroed(i, consumer_index) {
                        buffer.put_i32(type_offset(consumer_index), PADDING_MSG_TYPE_ID);
                        buffer.put_i32_ordered(
                            length_offset(consumer_index),
                            (i - consumer_index) as i32,
                        );
                        unblocked = true;
                    }

                    break;
                }

                i += ALIGNMENT;
                if i >= limit {
                    break;
                }
            }
        }

        if unblocked {
            warn!(consumer_index, "unblocked ring buffer with padding record");
        }

        unblocked
    }

    /// Next value from the shared correlation id counter.
    #[inline]
    pub fn next_correlation_id(&self) -> i64 {
        self.buffer.get_and_add_i64(self.correlation_id_counter_index, 1)
    }

    /// The producers' published position in bytes.
    #[inline]
    pub fn producer_position(&self) -> i64 {
        self.buffer.get_i64_volatile(self.tail_position_index)
    }

    /// The consumer's position in bytes.
    #[inline]
    pub fn consumer_position(&self) -> i64 {
        self.buffer.get_i64_volatile(self.head_position_index)
    }

    /// Record the time of the consumer's last activity, for liveness
    /// monitoring by watchdogs deciding whether to [`unblock`](Self::unblock).
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

    /// Bytes currently queued between consumer and producers.
    ///
    /// Head is re-read until a tail observation falls between two equal
    /// head observations, so the result is consistent under concurrent
    /// mutation; it is then clamped to `[0, capacity]`.
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

    /// Reserve `record_length` bytes (aligned) ahead of the tail, inserting
    /// a padding record when the claim would straddle the end of the data
    /// region. Returns the record index, or `None` for insufficient
    /// capacity.
    fn claim_capacity(&self, record_length: usize) -> Option<usize> {
        let required = align(record_length, ALIGNMENT);
        let capacity = self.capacity;
        let mask = capacity as i64 - 1;
        let buffer = &self.buffer;

        let mut head = buffer.get_i64_volatile(self.head_cache_position_index);
        let mut record_index;
        let mut padding;

        loop {
            let tail = buffer.get_i64_volatile(self.tail_position_index);

            // The cached head may lag arbitrarily, so available capacity
            // computed from it can be negative; i64 arithmetic throughout.
            let available = capacity as i64 - (tail - head);
            if required as i64 > available {
                head = buffer.get_i64_volatile(self.head_position_index);
                if required as i64 > capacity as i64 - (tail - head) {
                    return None;
                }

                buffer.put_i64_ordered(self.head_cache_position_index, head);
            }

            padding = 0;
            record_index = (tail & mask) as usize;
            let to_buffer_end = capacity - record_index;

            if required > to_buffer_end {
                // Must wrap: the whole record goes at offset zero, which
                // is only free once the consumer has moved past it.
                let mut head_index = (head & mask) as usize;

                if required > head_index {
                    head = buffer.get_i64_volatile(self.head_position_index);
                    head_index = (head & mask) as usize;
                    if required > head_index {
                        return None;
                    }

                    buffer.put_i64_ordered(self.head_cache_position_index, head);
                }

                padding = to_buffer_end;
            }

            if buffer.compare_and_set_i64(
                self.tail_position_index,
                tail,
                tail + (required + padding) as i64,
            ) {
                break;
            }
        }

        if padding != 0 {
            buffer.put_i32_ordered(length_offset(record_index), -(padding as i32));
            buffer.put_i32(type_offset(record_index), PADDING_MSG_TYPE_ID);
            buffer.put_i32_ordered(length_offset(record_index), padding as i32);
            record_index = 0;
        }

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

    fn scan_back_to_confirm_still_zeroed(&self, from: usize, limit: usize) -> bool {
        let mut i = from as isize - ALIGNMENT as isize;
        while i >= limit as isize {
            if self.buffer.get_i32_volatile(length_offset(i as usize)) != 0 {
                return false;
            }

            i -= ALIGNMENT as isize;
        }

        true
    }
}
