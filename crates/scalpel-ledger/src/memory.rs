//! Process-local ledger

use crate::LedgerStats;
use scalpel_core::{DissectionDatabase, DissectionRecord, Fingerprint, HashRecord, PersistenceError};
use std::collections::HashMap;
use std::sync::RwLock;

/// Ledger held entirely in memory; useful for single runs and tests
#[derive(Debug, Default)]
pub struct MemoryLedger {
    hashes: RwLock<HashMap<Fingerprint, HashRecord>>,
    dissections: RwLock<HashMap<Fingerprint, DissectionRecord>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> Result<LedgerStats, PersistenceError> {
        let hashes = self.hashes.read().map_err(|_| PersistenceError::LockPoisoned)?;
        let dissections = self
            .dissections
            .read()
            .map_err(|_| PersistenceError::LockPoisoned)?;
        Ok(LedgerStats {
            hashes: hashes.len() as u64,
            dissections: dissections.len() as u64,
        })
    }
}

impl DissectionDatabase for MemoryLedger {
    fn identify(&self) -> &str {
        "memory"
    }

    fn lookup_hash(&self, fingerprint: &Fingerprint) -> Result<Option<HashRecord>, PersistenceError> {
        let hashes = self.hashes.read().map_err(|_| PersistenceError::LockPoisoned)?;
        Ok(hashes.get(fingerprint).cloned())
    }

    fn lookup_dissection(
        &self,
        fingerprint: &Fingerprint,
    ) -> Result<Option<DissectionRecord>, PersistenceError> {
        let dissections = self
            .dissections
            .read()
            .map_err(|_| PersistenceError::LockPoisoned)?;
        Ok(dissections.get(fingerprint).cloned())
    }

    fn store(&self, fingerprint: &Fingerprint, record: &DissectionRecord) -> Result<(), PersistenceError> {
        let mut dissections = self
            .dissections
            .write()
            .map_err(|_| PersistenceError::LockPoisoned)?;
        dissections.insert(*fingerprint, record.clone());
        Ok(())
    }

    fn store_hash(&self, record: &HashRecord) -> Result<(), PersistenceError> {
        let mut hashes = self.hashes.write().map_err(|_| PersistenceError::LockPoisoned)?;
        hashes
            .entry(record.fingerprint)
            .or_insert_with(|| HashRecord::new(record.fingerprint, Vec::<String>::new()))
            .merge(record.labels.iter().cloned());
        Ok(())
    }
}
