//! `basalt-buf`: atomic byte-buffer views over heap or mapped memory.
//!
//! This crate is the substrate the rest of the basalt workspace builds on:
//!
//! - [`AtomicBuffer`]: scalar get/put at byte offsets with plain,
//!   acquire, release, compare-and-set and fetch-add semantics, plus bulk
//!   copies, over a region it owns.
//! - [`MappedRegion`]: file-backed regions for cross-process buffers.
//! - [`RegionConfig`]: TOML configuration for locating a shared region.
//! - [`bits`]: alignment and power-of-two arithmetic.
//!
//! # Example
//!
//! ```
//! use basalt_buf::AtomicBuffer;
//!
//! let buffer = AtomicBuffer::allocate(1024)?;
//! buffer.put_i64_ordered(0, 42);
//! assert_eq!(buffer.get_i64_volatile(0), 42);
//! # Ok::<(), basalt_buf::BufferError>(())
//! ```

mod atomic;
pub mod bits;
mod config;
mod region;

pub use atomic::{AtomicBuffer, BufferError};
pub use config::{ConfigError, RegionConfig};
pub use region::MappedRegion;
