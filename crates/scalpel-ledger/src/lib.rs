//! # Scalpel Ledger
//!
//! Stores for hash classifications and dissection records. Every store
//! implements [`DissectionDatabase`](scalpel_core::DissectionDatabase) and
//! is safe to share between worker threads:
//!
//! - [`MemoryLedger`]: process-local maps
//! - [`JsonLedger`]: a single JSON document on disk, rewritten atomically
//! - [`RedbLedger`]: a redb key/value database with bincode records

pub mod json;
pub mod memory;
pub mod redb;

#[cfg(test)]
pub(crate) mod testing;

pub use self::json::{JsonLedger, JsonLedgerConfig};
pub use self::memory::MemoryLedger;
pub use self::redb::RedbLedger;

use serde::{Deserialize, Serialize};

/// Record counts held by a ledger
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerStats {
    pub hashes: u64,
    pub dissections: u64,
}
