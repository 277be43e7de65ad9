//! redb-backed ledger

use crate::LedgerStats;
use ::redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};
use scalpel_core::{DissectionDatabase, DissectionRecord, Fingerprint, HashRecord, PersistenceError};
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard};

// Keys are lowercase hex fingerprints, values bincode records.
const HASH_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("hash_records");
const DISSECTION_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("dissection_records");

/// Ledger stored in a redb database file
///
/// redb serializes write transactions and lets read transactions run
/// concurrently, so the handle is shared without an outer mutex. The
/// surrounding lock only guards [`close`](DissectionDatabase::close).
pub struct RedbLedger {
    path: PathBuf,
    db: RwLock<Option<Database>>,
}

impl RedbLedger {
    /// Create or open a ledger at the given path
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, PersistenceError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let db = Database::create(&path).map_err(PersistenceError::backend)?;

        // Initialize tables
        let write_txn = db.begin_write().map_err(PersistenceError::backend)?;
        {
            let _ = write_txn.open_table(HASH_TABLE).map_err(PersistenceError::backend)?;
            let _ = write_txn
                .open_table(DISSECTION_TABLE)
                .map_err(PersistenceError::backend)?;
        }
        write_txn.commit().map_err(PersistenceError::backend)?;

        tracing::info!(path = %path.display(), "Opened redb ledger");
        Ok(Self {
            path,
            db: RwLock::new(Some(db)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn database(&self) -> Result<RwLockReadGuard<'_, Option<Database>>, PersistenceError> {
        let guard = self.db.read().map_err(|_| PersistenceError::LockPoisoned)?;
        if guard.is_none() {
            return Err(PersistenceError::Closed);
        }
        Ok(guard)
    }

    fn get(
        &self,
        table_def: TableDefinition<&str, &[u8]>,
        key: &str,
    ) -> Result<Option<Vec<u8>>, PersistenceError> {
        let guard = self.database()?;
        let db = guard.as_ref().ok_or(PersistenceError::Closed)?;

        let read_txn = db.begin_read().map_err(PersistenceError::backend)?;
        let table = read_txn.open_table(table_def).map_err(PersistenceError::backend)?;
        let value = table.get(key).map_err(PersistenceError::backend)?;
        Ok(value.map(|v| v.value().to_vec()))
    }

    pub fn stats(&self) -> Result<LedgerStats, PersistenceError> {
        let guard = self.database()?;
        let db = guard.as_ref().ok_or(PersistenceError::Closed)?;

        let read_txn = db.begin_read().map_err(PersistenceError::backend)?;
        let hashes = read_txn.open_table(HASH_TABLE).map_err(PersistenceError::backend)?;
        let dissections = read_txn
            .open_table(DISSECTION_TABLE)
            .map_err(PersistenceError::backend)?;

        Ok(LedgerStats {
            hashes: hashes.len().map_err(PersistenceError::backend)?,
            dissections: dissections.len().map_err(PersistenceError::backend)?,
        })
    }
}

impl DissectionDatabase for RedbLedger {
    fn identify(&self) -> &str {
        "redb"
    }

    fn lookup_hash(&self, fingerprint: &Fingerprint) -> Result<Option<HashRecord>, PersistenceError> {
        match self.get(HASH_TABLE, &fingerprint.to_hex())? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    fn lookup_dissection(
        &self,
        fingerprint: &Fingerprint,
    ) -> Result<Option<DissectionRecord>, PersistenceError> {
        match self.get(DISSECTION_TABLE, &fingerprint.to_hex())? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    fn store(&self, fingerprint: &Fingerprint, record: &DissectionRecord) -> Result<(), PersistenceError> {
        let encoded = bincode::serialize(record)?;
        let key = fingerprint.to_hex();

        let guard = self.database()?;
        let db = guard.as_ref().ok_or(PersistenceError::Closed)?;
        let write_txn = db.begin_write().map_err(PersistenceError::backend)?;
        {
            let mut table = write_txn
                .open_table(DISSECTION_TABLE)
                .map_err(PersistenceError::backend)?;
            table
                .insert(key.as_str(), encoded.as_slice())
                .map_err(PersistenceError::backend)?;
        }
        write_txn.commit().map_err(PersistenceError::backend)?;

        tracing::trace!(fingerprint = %fingerprint.short(), "Stored dissection record");
        Ok(())
    }

    fn store_hash(&self, record: &HashRecord) -> Result<(), PersistenceError> {
        let key = record.fingerprint.to_hex();

        let guard = self.database()?;
        let db = guard.as_ref().ok_or(PersistenceError::Closed)?;
        // Read-modify-write within a single write transaction.
        let write_txn = db.begin_write().map_err(PersistenceError::backend)?;
        {
            let mut table = write_txn.open_table(HASH_TABLE).map_err(PersistenceError::backend)?;
            let existing: Option<HashRecord> = match table
                .get(key.as_str())
                .map_err(PersistenceError::backend)?
            {
                Some(value) => Some(bincode::deserialize(value.value())?),
                None => None,
            };

            let mut merged =
                existing.unwrap_or_else(|| HashRecord::new(record.fingerprint, Vec::<String>::new()));
            merged.merge(record.labels.iter().cloned());
            let encoded = bincode::serialize(&merged)?;
            table
                .insert(key.as_str(), encoded.as_slice())
                .map_err(PersistenceError::backend)?;
        }
        write_txn.commit().map_err(PersistenceError::backend)?;
        Ok(())
    }

    fn close(&self) -> Result<(), PersistenceError> {
        let mut guard = self.db.write().map_err(|_| PersistenceError::LockPoisoned)?;
        if guard.take().is_some() {
            tracing::info!(path = %self.path.display(), "Closed redb ledger");
        }
        Ok(())
    }
}
