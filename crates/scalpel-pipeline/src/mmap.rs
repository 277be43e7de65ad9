//! Memory-mapped byte source for file-backed containers

use bytes::Bytes;
use memmap2::Mmap;
use scalpel_core::security::MAX_MMAP_SIZE;
use scalpel_core::{BoundsError, ByteReader};
use std::fs::File;
use std::io;
use std::path::Path;

/// A byte source backed by a read-only memory-mapped file
///
/// # Example
///
/// ```rust,no_run
/// use scalpel_core::ByteReader;
/// use scalpel_pipeline::MmapSource;
/// use std::path::Path;
///
/// let source = MmapSource::open(Path::new("disk.img")).unwrap();
/// let sector = source.read_at(0, 512).unwrap();
/// ```
pub struct MmapSource {
    mmap: Mmap,
}

impl MmapSource {
    /// Open a file with memory mapping
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or mapped, is not a
    /// regular file, or exceeds [`MAX_MMAP_SIZE`].
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = File::open(path)?;
        Self::from_file(&file)
    }

    /// Map an already opened file
    ///
    /// # Safety
    ///
    /// Uses `unsafe` for memory mapping because:
    /// - The file is validated to be a regular file before mapping
    /// - The mapping is read-only
    /// - The file must not be truncated while mapped (caller responsibility)
    pub fn from_file(file: &File) -> io::Result<Self> {
        let metadata = file.metadata()?;

        if !metadata.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "Only regular files can be memory-mapped",
            ));
        }

        if metadata.len() > MAX_MMAP_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "File size {} exceeds memory mapping limit {}",
                    metadata.len(),
                    MAX_MMAP_SIZE
                ),
            ));
        }

        // SAFETY: regular file, bounded size, valid descriptor, read-only map.
        let mmap = unsafe { Mmap::map(file)? };
        Ok(Self { mmap })
    }

    /// Entire mapped region
    pub fn as_slice(&self) -> &[u8] {
        &self.mmap
    }
}

impl ByteReader for MmapSource {
    fn len(&self) -> u64 {
        self.mmap.len() as u64
    }

    fn read_at(&self, offset: u64, length: u64) -> Result<Bytes, BoundsError> {
        BoundsError::check(offset, length, self.mmap.len() as u64)?;
        let start = offset as usize;
        Ok(Bytes::copy_from_slice(&self.mmap[start..start + length as usize]))
    }
}
