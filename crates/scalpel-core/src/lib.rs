//! # Scalpel Core
//!
//! Core types, traits, and error handling for the scalpel dissection framework.
//!
//! This crate provides the foundational abstractions shared by every layer:
//! - **Values**: [`ValueTree`] and [`Value`], the output of structure decoding
//! - **Fingerprints**: content hashes identifying bytes independent of nesting
//! - **Records**: [`HashRecord`] and [`DissectionRecord`], the persisted forms
//! - **Readers**: [`ByteReader`], bounds-checked random access to bytes
//! - **Databases**: [`DissectionDatabase`], the contract ledger adapters satisfy
//!
//! ## Example
//!
//! ```rust
//! use scalpel_core::{ByteReader, Value, ValueTree};
//!
//! let bytes = vec![0xEF, 0xBE, 0xAD, 0xDE];
//! assert_eq!(bytes.read_at(0, 4).unwrap().len(), 4);
//!
//! let tree = ValueTree::new(0).with("magic", Value::Unsigned(0xDEADBEEF));
//! assert_eq!(tree.get_u64("magic"), Some(0xDEADBEEF));
//! ```

pub mod error;
pub mod security;
pub mod traits;
pub mod types;

// Re-export commonly used items
pub use error::{BoundsError, DecodeError, DissectError, Error, JobError, PersistenceError, Result};
pub use traits::{ByteReader, DissectionDatabase};
pub use types::{DissectionRecord, Fingerprint, HashRecord, Outcome, StopReason, Value, ValueTree};
