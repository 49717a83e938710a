//! Byte-exact record and trailer layouts for the ring and broadcast
//! buffers.
//!
//! Every buffer in this crate is a power-of-two data region of records
//! followed by a fixed trailer of 64-bit counters. The constants here are
//! the persisted contract: a region written by one process is read by
//! another (possibly after a restart) purely through these offsets.
//!
//! # Record layout
//!
//! ```text
//! 0        4        8
//! ├────────┼────────┼──────────────────────────┤
//! │ length │ type   │ payload ...              │   aligned to 8 bytes
//! └────────┴────────┴──────────────────────────┘
//! ```
//!
//! `length` counts header plus payload. A negative `length` marks a record
//! that has been claimed but not yet published; the reserved type id
//! [`PADDING_MSG_TYPE_ID`] marks filler inserted so no record straddles
//! the end of the data region.
//!
//! # Ring trailer
//!
//! Five counters, each on its own double cache line so producers hammering
//! the tail never share a line with the consumer's head:
//!
//! ```text
//! capacity + 128   tail position
//! capacity + 256   head cache position
//! capacity + 384   head position
//! capacity + 512   correlation counter
//! capacity + 640   consumer heartbeat
//! ```

use basalt_buf::bits::{is_power_of_two, CACHE_LINE_LENGTH, SIZE_OF_I32, SIZE_OF_I64};
use basalt_buf::BufferError;

/// Record alignment in bytes. Record offsets and lengths are always
/// multiples of this.
pub const ALIGNMENT: usize = SIZE_OF_I64;

/// Bytes in a record header: `i32` length then `i32` type id.
pub const HEADER_LENGTH: usize = SIZE_OF_I32 * 2;

/// Reserved type id marking a padding record.
pub const PADDING_MSG_TYPE_ID: i32 = -1;

/// Offset of the length field within a record at `record_offset`.
#[inline(always)]
pub const fn length_offset(record_offset: usize) -> usize {
    record_offset
}

/// Offset of the type field within a record at `record_offset`.
#[inline(always)]
pub const fn type_offset(record_offset: usize) -> usize {
    record_offset + SIZE_OF_I32
}

/// Offset at which the encoded message payload begins.
#[inline(always)]
pub const fn encoded_msg_offset(record_offset: usize) -> usize {
    record_offset + HEADER_LENGTH
}

/// Errors raised by ring-buffer construction and operations.
#[derive(Debug, thiserror::Error)]
pub enum RingBufferError {
    #[error("message type id must be greater than zero, got {0}")]
    InvalidTypeId(i32),

    #[error("message length {length} exceeds max message length {max}")]
    MessageTooLong { length: usize, max: usize },

    #[error(
        "total region length {0} is not a power of two data region plus the trailer"
    )]
    InvalidCapacity(usize),

    #[error("invalid message index {0}")]
    InvalidIndex(usize),

    #[error("claimed space previously committed")]
    AlreadyCommitted,

    #[error("claimed space previously aborted")]
    AlreadyAborted,

    #[error(transparent)]
    Buffer(#[from] BufferError),
}

/// Reject non-positive message type ids; [`PADDING_MSG_TYPE_ID`] and zero
/// are reserved for the layout itself.
#[inline]
pub fn check_type_id(type_id: i32) -> Result<(), RingBufferError> {
    if type_id < 1 {
        return Err(RingBufferError::InvalidTypeId(type_id));
    }

    Ok(())
}

/// Ring-buffer trailer offsets, relative to the end of the data region.
pub mod ring_buffer {
    use super::*;

    /// Offset of the tail position counter (producer write cursor).
    pub const TAIL_POSITION_OFFSET: usize = CACHE_LINE_LENGTH * 2;
    /// Offset of the producers' cached copy of the head position.
    pub const HEAD_CACHE_POSITION_OFFSET: usize = CACHE_LINE_LENGTH * 4;
    /// Offset of the head position counter (consumer read cursor).
    pub const HEAD_POSITION_OFFSET: usize = CACHE_LINE_LENGTH * 6;
    /// Offset of the correlation id counter.
    pub const CORRELATION_COUNTER_OFFSET: usize = CACHE_LINE_LENGTH * 8;
    /// Offset of the consumer heartbeat timestamp.
    pub const CONSUMER_HEARTBEAT_OFFSET: usize = CACHE_LINE_LENGTH * 10;
    /// Total trailer length appended to the data region.
    pub const TRAILER_LENGTH: usize = CACHE_LINE_LENGTH * 12;

    /// Split a total region length into its data capacity, verifying the
    /// power-of-two-plus-trailer invariant.
    pub fn check_capacity(total_length: usize) -> Result<usize, RingBufferError> {
        let capacity = total_length.wrapping_sub(TRAILER_LENGTH);
        if total_length < TRAILER_LENGTH + ALIGNMENT || !is_power_of_two(capacity) {
            return Err(RingBufferError::InvalidCapacity(total_length));
        }

        Ok(capacity)
    }

    /// Largest message payload a ring of `capacity` accepts.
    #[inline(always)]
    pub const fn max_msg_length(capacity: usize) -> usize {
        capacity / 8
    }
}

/// Broadcast-buffer trailer offsets, relative to the end of the data
/// region.
pub mod broadcast_buffer {
    use super::*;

    /// Offset of the tail intent counter, advanced before any bytes are
    /// overwritten.
    pub const TAIL_INTENT_COUNTER_OFFSET: usize = 0;
    /// Offset of the committed tail counter.
    pub const TAIL_COUNTER_OFFSET: usize = SIZE_OF_I64;
    /// Offset of the latest record counter, the join point for new and
    /// lapped receivers.
    pub const LATEST_COUNTER_OFFSET: usize = SIZE_OF_I64 * 2;
    /// Total trailer length appended to the data region.
    pub const TRAILER_LENGTH: usize = CACHE_LINE_LENGTH * 2;

    /// Split a total region length into its data capacity, verifying the
    /// power-of-two-plus-trailer invariant.
    pub fn check_capacity(total_length: usize) -> Result<usize, RingBufferError> {
        let capacity = total_length.wrapping_sub(TRAILER_LENGTH);
        if total_length < TRAILER_LENGTH + ALIGNMENT || !is_power_of_two(capacity) {
            return Err(RingBufferError::InvalidCapacity(total_length));
        }

        Ok(capacity)
    }

    /// Largest message payload a broadcast buffer of `capacity` accepts.
    #[inline(always)]
    pub const fn max_msg_length(capacity: usize) -> usize {
        capacity / 8
    }
}
