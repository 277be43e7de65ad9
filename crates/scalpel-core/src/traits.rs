//! Core traits: random-access byte readers and the dissection database contract

use crate::error::{BoundsError, PersistenceError};
use crate::types::{DissectionRecord, Fingerprint, HashRecord};
use bytes::Bytes;

/// Bounds-checked random access to a fixed-length byte range
///
/// Implementors must fail with [`BoundsError`] rather than return a short
/// read when `offset + length` exceeds [`len`](Self::len).
pub trait ByteReader: Send + Sync {
    /// Total number of addressable bytes
    fn len(&self) -> u64;

    /// Read exactly `length` bytes starting at `offset`
    fn read_at(&self, offset: u64, length: u64) -> Result<Bytes, BoundsError>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn slice_range(len: usize, offset: u64, length: u64) -> Result<std::ops::Range<usize>, BoundsError> {
    BoundsError::check(offset, length, len as u64)?;
    // Both fit in usize because they are bounded by `len`.
    let start = offset as usize;
    Ok(start..start + length as usize)
}

impl ByteReader for [u8] {
    fn len(&self) -> u64 {
        <[u8]>::len(self) as u64
    }

    fn read_at(&self, offset: u64, length: u64) -> Result<Bytes, BoundsError> {
        let range = slice_range(<[u8]>::len(self), offset, length)?;
        Ok(Bytes::copy_from_slice(&self[range]))
    }
}

impl ByteReader for Vec<u8> {
    fn len(&self) -> u64 {
        self.as_slice().len() as u64
    }

    fn read_at(&self, offset: u64, length: u64) -> Result<Bytes, BoundsError> {
        self.as_slice().read_at(offset, length)
    }
}

impl ByteReader for Bytes {
    fn len(&self) -> u64 {
        Bytes::len(self) as u64
    }

    fn read_at(&self, offset: u64, length: u64) -> Result<Bytes, BoundsError> {
        let range = slice_range(Bytes::len(self), offset, length)?;
        Ok(self.slice(range))
    }
}

/// Persistence contract for hash classifications and dissection records
///
/// Adapters are shared across worker threads and are responsible for their
/// own synchronization: concurrent reads must be allowed, writes must be
/// serialized at least per fingerprint. Storing the same record twice must
/// leave the same observable state as storing it once.
pub trait DissectionDatabase: Send + Sync {
    /// Short adapter identifier for logs
    fn identify(&self) -> &str;

    /// Known classifications for a fingerprint
    fn lookup_hash(&self, fingerprint: &Fingerprint) -> Result<Option<HashRecord>, PersistenceError>;

    /// Previously stored dissection of a fingerprint
    fn lookup_dissection(
        &self,
        fingerprint: &Fingerprint,
    ) -> Result<Option<DissectionRecord>, PersistenceError>;

    /// Store (or overwrite) the dissection record for `fingerprint`
    fn store(&self, fingerprint: &Fingerprint, record: &DissectionRecord) -> Result<(), PersistenceError>;

    /// Union the record's labels into the stored classification
    fn store_hash(&self, record: &HashRecord) -> Result<(), PersistenceError>;

    /// Make every write so far durable; called after each root dissection
    fn flush(&self) -> Result<(), PersistenceError> {
        Ok(())
    }

    /// Release backing resources, flushing pending writes
    fn close(&self) -> Result<(), PersistenceError> {
        Ok(())
    }
}
