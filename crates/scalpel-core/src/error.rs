//! Error taxonomy for dissection runs
//!
//! Errors are layered by how far they are allowed to travel:
//! - [`BoundsError`] aborts a single window or read.
//! - [`DecodeError`] and [`DissectError`] demote one node to `Failed`.
//! - [`PersistenceError`] is logged and never fails a dissection.
//! - [`JobError`] is the only error a job's caller ever sees.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// A byte range fell outside a container's declared extent
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("range {offset}+{length} exceeds extent of {extent} bytes")]
pub struct BoundsError {
    /// Requested start, relative to the container
    pub offset: u64,
    /// Requested length
    pub length: u64,
    /// Length of the container the request was made against
    pub extent: u64,
}

impl BoundsError {
    /// Create a new bounds error
    pub fn new(offset: u64, length: u64, extent: u64) -> Self {
        Self {
            offset,
            length,
            extent,
        }
    }

    /// Check `offset + length <= extent` without overflowing
    pub fn check(offset: u64, length: u64, extent: u64) -> std::result::Result<(), Self> {
        match offset.checked_add(length) {
            Some(end) if end <= extent => Ok(()),
            _ => Err(Self::new(offset, length, extent)),
        }
    }
}

/// A layout could not be satisfied against the available bytes
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The layout needs more bytes than the source holds
    #[error("truncated at offset {offset}: needed {needed} bytes, {available} available")]
    Truncated {
        offset: u64,
        needed: u64,
        available: u64,
    },

    /// No union alternative's discriminant held
    #[error("no matching variant for union '{member}'")]
    NoMatchingVariant { member: String },

    /// A length, count or discriminant expression could not be evaluated
    #[error("invalid expression: {0}")]
    InvalidExpression(String),

    /// The layout itself is inconsistent (e.g. explicit offsets going backwards)
    #[error("invalid layout: {0}")]
    InvalidLayout(String),

    /// A count or length exceeded a safety limit
    #[error("limit exceeded: {0}")]
    LimitExceeded(String),
}

impl DecodeError {
    /// Create an invalid expression error
    pub fn invalid_expression(msg: impl Into<String>) -> Self {
        DecodeError::InvalidExpression(msg.into())
    }

    /// Create an invalid layout error
    pub fn invalid_layout(msg: impl Into<String>) -> Self {
        DecodeError::InvalidLayout(msg.into())
    }

    /// Create a limit exceeded error
    pub fn limit_exceeded(msg: impl Into<String>) -> Self {
        DecodeError::LimitExceeded(msg.into())
    }
}

impl From<BoundsError> for DecodeError {
    fn from(e: BoundsError) -> Self {
        DecodeError::Truncated {
            offset: e.offset,
            needed: e.length,
            available: e.extent.saturating_sub(e.offset),
        }
    }
}

/// A dissector's own logic failed
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DissectError {
    /// Structure decoding failed
    #[error("decode failed: {0}")]
    Decode(#[from] DecodeError),

    /// A read or window fell outside its container
    #[error("out of bounds: {0}")]
    Bounds(#[from] BoundsError),

    /// The data is recognizably this format but corrupt
    #[error("malformed: {0}")]
    Malformed(String),

    /// A feature of the format is not handled
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// The dissector panicked; caught at the node boundary
    #[error("dissector panicked: {0}")]
    Panicked(String),
}

impl DissectError {
    /// Create a malformed data error
    pub fn malformed(msg: impl Into<String>) -> Self {
        DissectError::Malformed(msg.into())
    }

    /// Create an unsupported feature error
    pub fn unsupported(msg: impl Into<String>) -> Self {
        DissectError::Unsupported(msg.into())
    }
}

/// A database adapter call failed
#[derive(Error, Debug)]
pub enum PersistenceError {
    /// I/O error on the backing file
    #[error("ledger I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON document error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Binary record encoding error
    #[error("encoding error: {0}")]
    Encoding(#[from] bincode::Error),

    /// Backend-specific failure
    #[error("backend error: {0}")]
    Backend(String),

    /// A lock guarding the adapter was poisoned
    #[error("ledger lock poisoned")]
    LockPoisoned,

    /// The adapter has been closed
    #[error("ledger closed")]
    Closed,
}

impl PersistenceError {
    /// Create a backend error
    pub fn backend(msg: impl ToString) -> Self {
        PersistenceError::Backend(msg.to_string())
    }
}

/// A whole job could not produce a result
#[derive(Error, Debug)]
pub enum JobError {
    /// The root container could not be constructed
    #[error("cannot open {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The job panicked outside any dissector
    #[error("job panicked: {0}")]
    Panicked(String),

    /// The job exceeded the pool's timeout
    #[error("job timed out after {0:?}")]
    TimedOut(Duration),

    /// The job was cancelled
    #[error("job cancelled")]
    Cancelled,

    /// The pool was shut down before the job could report
    #[error("worker pool closed")]
    PoolClosed,
}

/// Umbrella error for callers that mix layers
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Bounds(#[from] BoundsError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Dissect(#[from] DissectError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error(transparent)]
    Job(#[from] JobError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for scalpel operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounds_check() {
        assert!(BoundsError::check(0, 10, 10).is_ok());
        assert!(BoundsError::check(8, 4, 10).is_err());
        assert!(BoundsError::check(u64::MAX, 2, u64::MAX).is_err());
    }

    #[test]
    fn test_bounds_into_truncated() {
        let err: DecodeError = BoundsError::new(8, 4, 10).into();
        assert_eq!(
            err,
            DecodeError::Truncated {
                offset: 8,
                needed: 4,
                available: 2
            }
        );
    }

    #[test]
    fn test_error_display() {
        let err = DissectError::malformed("bad magic");
        assert_eq!(err.to_string(), "malformed: bad magic");

        let err = BoundsError::new(8, 4, 10);
        assert_eq!(err.to_string(), "range 8+4 exceeds extent of 10 bytes");
    }
}
