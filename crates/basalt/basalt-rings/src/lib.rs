//! `basalt-rings`: lock-free message buffers over a shared byte region.
//!
//! Four buffers share one record format (length + type header, 8-byte
//! alignment, padding records at the wrap point) and differ in their
//! coordination:
//!
//! - [`ManyToOneRingBuffer`]: many producers race a tail CAS, one
//!   consumer drains. Includes `unblock` recovery for producers that die
//!   mid-publication.
//! - [`OneToOneRingBuffer`]: strict FIFO pair with plain stores on the
//!   producer's fast path.
//! - [`BroadcastTransmitter`] / [`BroadcastReceiver`] /
//!   [`CopyBroadcastReceiver`]: lossy one-to-many stream; slow receivers
//!   are lapped, never waited for.
//! - [`ExpandableRingBuffer`]: single-threaded FIFO byte ring that grows
//!   on demand.
//!
//! All of them address a [`basalt_buf::AtomicBuffer`], so the backing
//! region can be private memory or a mapped file shared between
//! processes. The byte layouts are the stable contract; see
//! [`descriptor`].
//!
//! # Example
//!
//! ```
//! use basalt_buf::AtomicBuffer;
//! use basalt_rings::descriptor::ring_buffer::TRAILER_LENGTH;
//! use basalt_rings::OneToOneRingBuffer;
//!
//! let buffer = AtomicBuffer::allocate(4096 + TRAILER_LENGTH)?;
//! let ring = OneToOneRingBuffer::new(buffer)?;
//!
//! ring.write(1, b"tick")?;
//!
//! let mut payload = Vec::new();
//! ring.read(|_, buffer, index, length| {
//!     payload.resize(length, 0);
//!     buffer.get_bytes(index, &mut payload);
//! });
//! assert_eq!(payload, b"tick");
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod descriptor;

mod broadcast;
mod expandable;
mod mpsc;
mod spsc;

pub use broadcast::{
    BroadcastError, BroadcastReceiver, BroadcastTransmitter, CopyBroadcastReceiver,
    SCRATCH_BUFFER_LENGTH,
};
pub use descriptor::RingBufferError;
pub use expandable::{ExpandableRingBuffer, ExpandableRingBufferError};
pub use mpsc::ManyToOneRingBuffer;
pub use spsc::OneToOneRingBuffer;
