//! File-backed memory regions for cross-process buffers.
//!
//! A [`MappedRegion`] keeps its [`File`] handle alive for the lifetime of
//! the mapping. Creation sizes and zero-fills the file so a fresh region
//! is immediately usable as an empty buffer; opening maps whatever is
//! already there.

use memmap2::MmapMut;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;
use tracing::debug;

/// A read-write memory-mapped file.
pub struct MappedRegion {
    _file: File,
    mmap: MmapMut,
}

impl MappedRegion {
    /// Create (or truncate) the file at `path`, size it to `len` bytes and
    /// map it read-write.
    pub fn create<P: AsRef<Path>>(path: P, len: usize) -> io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        file.set_len(len as u64)?;

        // SAFETY: the file was just created with the requested length and
        // this process holds it open for the lifetime of the mapping.
        let mmap = unsafe { MmapMut::map_mut(&file)? };

        debug!(path = %path.as_ref().display(), len, "created mapped region");

        Ok(Self { _file: file, mmap })
    }

    /// Open an existing file at `path` and map it read-write.
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(&path)?;

        // SAFETY: the file handle is held for the lifetime of the mapping.
        let mmap = unsafe { MmapMut::map_mut(&file)? };

        debug!(path = %path.as_ref().display(), len = mmap.len(), "opened mapped region");

        Ok(Self { _file: file, mmap })
    }

    /// Raw pointer to the start of the mapped bytes.
    #[inline]
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.mmap.as_mut_ptr()
    }

    /// Length of the mapping in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    /// True when the mapping is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.mmap.len() == 0
    }
}
