//! One-to-many broadcast over a shared byte region.
//!
//! A single transmitter appends records and never waits for anyone;
//! receivers follow the stream independently and are simply lapped when
//! they fall a full buffer behind. Loss is a property of the design, not
//! an error: a lapped receiver jumps forward to the latest record and
//! counts the lap.
//!
//! Torn reads are detected rather than prevented. Before overwriting any
//! bytes the transmitter advances a *tail intent* counter; a receiver
//! validates `cursor + capacity > tail_intent` before exposing a record
//! and again (via [`BroadcastReceiver::validate`]) after consuming it, so
//! data that was overwritten mid-read is refused after the fact.
//!
//! # Thread safety
//!
//! The transmitter is `Send` but must remain single-threaded (`&mut self`
//! methods). Each receiver is likewise independent and single-threaded;
//! any number may follow one stream, with no registration anywhere.

use std::sync::atomic::{fence, AtomicU64, Ordering};

use basalt_buf::bits::align;
use basalt_buf::{AtomicBuffer, BufferError};
use tracing::warn;

use crate::descriptor::broadcast_buffer::{
    check_capacity, max_msg_length, LATEST_COUNTER_OFFSET, TAIL_COUNTER_OFFSET,
    TAIL_INTENT_COUNTER_OFFSET,
};
use crate::descriptor::{
    encoded_msg_offset, length_offset, type_offset, ALIGNMENT, HEADER_LENGTH, PADDING_MSG_TYPE_ID,
};

/// Errors raised by the broadcast buffers.
#[derive(Debug, thiserror::Error)]
pub enum BroadcastError {
    #[error("message type id must be greater than zero, got {0}")]
    InvalidTypeId(i32),

    #[error("message length {length} exceeds max message length {max}")]
    MessageTooLong { length: usize, max: usize },

    #[error(
        "total region length {0} is not a power of two data region plus the trailer"
    )]
    InvalidCapacity(usize),

    #[error("unable to keep up with broadcast")]
    UnableToKeepUp,

    #[error("scratch buffer of {capacity} bytes cannot hold {required} byte message")]
    ScratchTooSmall { required: usize, capacity: usize },

    #[error(transparent)]
    Buffer(#[from] BufferError),
}

fn check_type_id(type_id: i32) -> Result<(), BroadcastError> {
    if type_id < 1 {
        return Err(BroadcastError::InvalidTypeId(type_id));
    }

    Ok(())
}

fn check_broadcast_capacity(total_length: usize) -> Result<usize, BroadcastError> {
    check_capacity(total_length).map_err(|_| BroadcastError::InvalidCapacity(total_length))
}

/// Record-length alignment; any record's aligned length is a multiple of
/// this, as in the ring buffers.
const RECORD_ALIGNMENT: usize = ALIGNMENT;

/// The transmitting side of a broadcast stream.
pub struct BroadcastTransmitter {
    buffer: AtomicBuffer,
    capacity: usize,
    max_msg_length: usize,
    tail_intent_counter_index: usize,
    tail_counter_index: usize,
    latest_counter_index: usize,
}

impl BroadcastTransmitter {
    /// Wrap `buffer` as the transmitter of a broadcast stream. The region
    /// must be a power of two plus
    /// [`TRAILER_LENGTH`](crate::descriptor::broadcast_buffer::TRAILER_LENGTH).
    pub fn new(buffer: AtomicBuffer) -> Result<Self, BroadcastError> {
        let capacity = check_broadcast_capacity(buffer.capacity())?;
        buffer.verify_alignment()?;

        Ok(Self {
            capacity,
            max_msg_length: max_msg_length(capacity),
            tail_intent_counter_index: capacity + TAIL_INTENT_COUNTER_OFFSET,
            tail_counter_index: capacity + TAIL_COUNTER_OFFSET,
            latest_counter_index: capacity + LATEST_COUNTER_OFFSET,
            buffer,
        })
    }

    /// Capacity of the data region in bytes.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Largest message payload this stream accepts.
    #[inline]
    pub fn max_msg_length(&self) -> usize {
        self.max_msg_length
    }

    /// Transmit a message to all receivers that manage to keep up.
    ///
    /// Never blocks and never fails for lack of space: old records are
    /// overwritten and slow receivers detect the lap themselves.
    pub fn transmit(&mut self, type_id: i32, src: &[u8]) -> Result<(), BroadcastError> {
        check_type_id(type_id)?;
        self.check_message_length(src.len())?;

        let buffer = &self.buffer;
        let mask = self.capacity as i64 - 1;

        let mut current_tail = buffer.get_i64(self.tail_counter_index);
        let mut record_offset = (current_tail & mask) as usize;

        let record_length = src.len() + HEADER_LENGTH;
        let aligned_record_length = align(record_length, RECORD_ALIGNMENT);
        let new_tail = current_tail + aligned_record_length as i64;

        let to_end_of_buffer = self.capacity - record_offset;
        if to_end_of_buffer < aligned_record_length {
            // Record would straddle the end: declare intent over the
            // padding as well, fill to the end, wrap to zero.
            self.signal_tail_intent(new_tail + to_end_of_buffer as i64);

            buffer.put_i32(length_offset(record_offset), to_end_of_buffer as i32);
            buffer.put_i32(type_offset(record_offset), PADDING_MSG_TYPE_ID);

            current_tail += to_end_of_buffer as i64;
            record_offset = 0;
        } else {
            self.signal_tail_intent(new_tail);
        }

        buffer.put_i32(length_offset(record_offset), record_length as i32);
        buffer.put_i32(type_offset(record_offset), type_id);
        buffer.put_bytes(encoded_msg_offset(record_offset), src);

        // Latest is released before the tail so a joining or lapped
        // receiver never reads a join point ahead of the committed stream.
        buffer.put_i64_ordered(self.latest_counter_index, current_tail);
        buffer.put_i64_ordered(
            self.tail_counter_index,
            current_tail + aligned_record_length as i64,
        );

        Ok(())
    }

    /// Release the new tail intent before any bytes are touched.
    ///
    /// The full fence keeps the record writes that follow from becoming
    /// visible ahead of the intent: receivers must be able to reject a
    /// record that is being overwritten, which requires intent-then-data
    /// ordering on the store side (the mirror of the load fence in
    /// `BroadcastReceiver::validate`).
    fn signal_tail_intent(&self, new_tail: i64) {
        self.buffer
            .put_i64_ordered(self.tail_intent_counter_index, new_tail);
        fence(Ordering::SeqCst);
    }

    fn check_message_length(&self, length: usize) -> Result<(), BroadcastError> {
        if length > self.max_msg_length {
            return Err(BroadcastError::MessageTooLong {
                length,
                max: self.max_msg_length,
            });
        }

        Ok(())
    }
}

/// The receiving side of a broadcast stream.
///
/// Join at any time: the receiver starts from the latest record at the
/// point of joining. After [`receive_next`](Self::receive_next) returns
/// `true` the exposed [`type_id`](Self::type_id),
/// [`offset`](Self::offset) and [`length`](Self::length) refer into the
/// underlying buffer and remain meaningful only while
/// [`validate`](Self::validate) still holds.
pub struct BroadcastReceiver {
    buffer: AtomicBuffer,
    cursor: i64,
    next_record: i64,
    record_offset: usize,
    capacity: usize,
    tail_intent_counter_index: usize,
    tail_counter_index: usize,
    latest_counter_index: usize,
    lapped_count: AtomicU64,
}

impl BroadcastReceiver {
    /// Wrap `buffer` (an open view of a transmitter's region) as a
    /// receiver, joining at the latest record.
    pub fn new(buffer: AtomicBuffer) -> Result<Self, BroadcastError> {
        let capacity = check_broadcast_capacity(buffer.capacity())?;
        buffer.verify_alignment()?;

        let latest_counter_index = capacity + LATEST_COUNTER_OFFSET;
        let cursor = buffer.get_i64_volatile(latest_counter_index);

        Ok(Self {
            cursor,
            next_record: cursor,
            record_offset: (cursor & (capacity as i64 - 1)) as usize,
            capacity,
            tail_intent_counter_index: capacity + TAIL_INTENT_COUNTER_OFFSET,
            tail_counter_index: capacity + TAIL_COUNTER_OFFSET,
            latest_counter_index,
            lapped_count: AtomicU64::new(0),
            buffer,
        })
    }

    /// Capacity of the data region in bytes.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// How many times the transmitter has lapped this receiver. Each lap
    /// is at least a buffer's worth of loss. Safe to read from a
    /// monitoring thread.
    #[inline]
    pub fn lapped_count(&self) -> u64 {
        self.lapped_count.load(Ordering::Relaxed)
    }

    /// Type id of the received message.
    #[inline]
    pub fn type_id(&self) -> i32 {
        self.buffer.get_i32(type_offset(self.record_offset))
    }

    /// Offset of the received message's payload in [`buffer`](Self::buffer).
    #[inline]
    pub fn offset(&self) -> usize {
        encoded_msg_offset(self.record_offset)
    }

    /// Payload length of the received message.
    #[inline]
    pub fn length(&self) -> usize {
        (self.buffer.get_i32(length_offset(self.record_offset)) as usize)
            .saturating_sub(HEADER_LENGTH)
    }

    /// The underlying buffer holding the stream.
    #[inline]
    pub fn buffer(&self) -> &AtomicBuffer {
        &self.buffer
    }

    /// Non-blocking receive of the next message.
    ///
    /// Returns `true` with `type_id`/`offset`/`length` set when a record
    /// is available; `false` when caught up. Detected laps reset the
    /// cursor to the latest record and bump [`lapped_count`](Self::lapped_count).
    pub fn receive_next(&mut self) -> bool {
        let buffer = &self.buffer;
        let tail = buffer.get_i64_volatile(self.tail_counter_index);
        let mut cursor = self.next_record;

        if tail <= cursor {
            return false;
        }

        let mask = self.capacity as i64 - 1;
        let mut record_offset = (cursor & mask) as usize;

        if !self.is_valid(cursor) {
            self.lapped_count.fetch_add(1, Ordering::Relaxed);

            cursor = buffer.get_i64_volatile(self.latest_counter_index);
            record_offset = (cursor & mask) as usize;
        }

        self.cursor = cursor;
        self.next_record = cursor + aligned_record_length(buffer, record_offset);

        if buffer.get_i32(type_offset(record_offset)) == PADDING_MSG_TYPE_ID {
            record_offset = 0;
            self.cursor = self.next_record;
            self.next_record += aligned_record_length(buffer, record_offset);
        }

        self.record_offset = record_offset;
        true
    }

    /// Re-check that the exposed record has not been overwritten while it
    /// was being consumed. Call after copying or processing the payload;
    /// a `false` result means the data must be discarded.
    pub fn validate(&self) -> bool {
        // Load fence: the payload reads above must not drift past the
        // tail-intent load that vouches for them.
        fence(Ordering::SeqCst);

        self.is_valid(self.cursor)
    }

    #[inline]
    fn is_valid(&self, cursor: i64) -> bool {
        cursor + self.capacity as i64
            > self.buffer.get_i64_volatile(self.tail_intent_counter_index)
    }
}

/// Aligned length of the record at `record_offset`, in stream-position
/// terms.
///
/// Computed in `i64` so a length field torn by a concurrent overwrite
/// cannot wrap the arithmetic; the resulting bogus cursor is caught by
/// the next validation and resolved as a lap.
#[inline]
fn aligned_record_length(buffer: &AtomicBuffer, record_offset: usize) -> i64 {
    let record_length = buffer.get_i32(length_offset(record_offset)) as i64;
    let alignment = RECORD_ALIGNMENT as i64;
    (record_length + (alignment - 1)) & !(alignment - 1)
}

/// Default scratch capacity for [`CopyBroadcastReceiver`].
pub const SCRATCH_BUFFER_LENGTH: usize = 4096;

/// A receiver that copies each message out of the stream before
/// delivering it, so handlers never see bytes the transmitter might be
/// overwriting.
pub struct CopyBroadcastReceiver {
    receiver: BroadcastReceiver,
    scratch: Vec<u8>,
}

impl CopyBroadcastReceiver {
    /// Wrap `receiver` with a default-sized scratch buffer.
    pub fn new(receiver: BroadcastReceiver) -> Self {
        Self::with_scratch_capacity(receiver, SCRATCH_BUFFER_LENGTH)
    }

    /// Wrap `receiver` with a scratch buffer of `scratch_capacity` bytes,
    /// the largest message this receiver can deliver.
    pub fn with_scratch_capacity(receiver: BroadcastReceiver, scratch_capacity: usize) -> Self {
        Self {
            receiver,
            scratch: vec![0; scratch_capacity],
        }
    }

    /// The wrapped receiver.
    #[inline]
    pub fn receiver(&self) -> &BroadcastReceiver {
        &self.receiver
    }

    /// Receive at most one message, delivering a stable copy to `handler`.
    ///
    /// Returns the number of messages delivered (0 or 1).
    ///
    /// # Errors
    ///
    /// [`BroadcastError::UnableToKeepUp`] when the transmitter lapped this
    /// receiver before or during the copy;
    /// [`BroadcastError::ScratchTooSmall`] when the message does not fit
    /// the scratch buffer.
    pub fn receive<F>(&mut self, mut handler: F) -> Result<usize, BroadcastError>
    where
        F: FnMut(i32, &[u8]),
    {
        let receiver = &mut self.receiver;
        let last_seen_lapped_count = receiver.lapped_count();

        if !receiver.receive_next() {
            return Ok(0);
        }

        if last_seen_lapped_count != receiver.lapped_count() {
            warn!(
                lapped_count = receiver.lapped_count(),
                "broadcast receiver lapped"
            );
            return Err(BroadcastError::UnableToKeepUp);
        }

        let length = receiver.length();
        if length > self.scratch.len() {
            return Err(BroadcastError::ScratchTooSmall {
                required: length,
                capacity: self.scratch.len(),
            });
        }

        let type_id = receiver.type_id();
        receiver
            .buffer()
            .get_bytes(receiver.offset(), &mut self.scratch[..length]);

        if !receiver.validate() {
            warn!("broadcast message overwritten during copy");
            return Err(BroadcastError::UnableToKeepUp);
        }

        handler(type_id, &self.scratch[..length]);

        Ok(1)
    }
}
