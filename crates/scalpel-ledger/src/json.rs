//! File-backed JSON document ledger

use crate::LedgerStats;
use scalpel_core::{DissectionDatabase, DissectionRecord, Fingerprint, HashRecord, PersistenceError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

/// JSON ledger configuration
#[derive(Debug, Clone, Default)]
pub struct JsonLedgerConfig {
    /// Indent the document for human reading
    pub pretty: bool,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Document {
    #[serde(default)]
    hashes: BTreeMap<Fingerprint, HashRecord>,
    #[serde(default)]
    dissections: BTreeMap<Fingerprint, DissectionRecord>,
}

#[derive(Debug, Default)]
struct State {
    document: Document,
    dirty: bool,
    closed: bool,
}

/// Ledger persisted as one JSON document
///
/// The document is loaded at open and kept in memory.
/// [`flush`](DissectionDatabase::flush) rewrites it through a temporary file
/// and a rename, so readers of the file never observe a half-written
/// document. The engine flushes after
/// every root container; anything still pending is written on
/// [`close`](DissectionDatabase::close) and on drop.
///
/// ```json
/// { "hashes": { "<hex>": { "fingerprint": "<hex>", "labels": ["mbr"] } },
///   "dissections": { "<hex>": { "fingerprint": "<hex>", "outcome": "ok", ... } } }
/// ```
#[derive(Debug)]
pub struct JsonLedger {
    path: PathBuf,
    config: JsonLedgerConfig,
    state: RwLock<State>,
}

impl JsonLedger {
    /// Open a document, creating it on first flush if it does not exist
    pub fn open(path: impl Into<PathBuf>, config: JsonLedgerConfig) -> Result<Self, PersistenceError> {
        let path = path.into();

        let document = if path.exists() {
            let content = fs::read_to_string(&path)?;
            if content.trim().is_empty() {
                Document::default()
            } else {
                serde_json::from_str(&content)?
            }
        } else {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    fs::create_dir_all(parent)?;
                }
            }
            Document::default()
        };

        tracing::info!(
            path = %path.display(),
            hashes = document.hashes.len(),
            dissections = document.dissections.len(),
            "Opened JSON ledger"
        );

        Ok(Self {
            path,
            config,
            state: RwLock::new(State {
                document,
                dirty: false,
                closed: false,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush_locked(&self, state: &mut State) -> Result<(), PersistenceError> {
        if !state.dirty {
            return Ok(());
        }

        let encoded = if self.config.pretty {
            serde_json::to_vec_pretty(&state.document)?
        } else {
            serde_json::to_vec(&state.document)?
        };

        let mut temp = self.path.clone().into_os_string();
        temp.push(".tmp");
        let temp = PathBuf::from(temp);
        fs::write(&temp, &encoded)?;
        fs::rename(&temp, &self.path)?;

        state.dirty = false;
        tracing::debug!(path = %self.path.display(), bytes = encoded.len(), "Flushed JSON ledger");
        Ok(())
    }

    pub fn stats(&self) -> Result<LedgerStats, PersistenceError> {
        let state = self.state.read().map_err(|_| PersistenceError::LockPoisoned)?;
        Ok(LedgerStats {
            hashes: state.document.hashes.len() as u64,
            dissections: state.document.dissections.len() as u64,
        })
    }

    fn write_state(&self) -> Result<std::sync::RwLockWriteGuard<'_, State>, PersistenceError> {
        let state = self.state.write().map_err(|_| PersistenceError::LockPoisoned)?;
        if state.closed {
            return Err(PersistenceError::Closed);
        }
        Ok(state)
    }
}

impl DissectionDatabase for JsonLedger {
    fn identify(&self) -> &str {
        "json"
    }

    fn lookup_hash(&self, fingerprint: &Fingerprint) -> Result<Option<HashRecord>, PersistenceError> {
        let state = self.state.read().map_err(|_| PersistenceError::LockPoisoned)?;
        Ok(state.document.hashes.get(fingerprint).cloned())
    }

    fn lookup_dissection(
        &self,
        fingerprint: &Fingerprint,
    ) -> Result<Option<DissectionRecord>, PersistenceError> {
        let state = self.state.read().map_err(|_| PersistenceError::LockPoisoned)?;
        Ok(state.document.dissections.get(fingerprint).cloned())
    }

    fn store(&self, fingerprint: &Fingerprint, record: &DissectionRecord) -> Result<(), PersistenceError> {
        let mut state = self.write_state()?;
        if state.document.dissections.get(fingerprint) != Some(record) {
            state.document.dissections.insert(*fingerprint, record.clone());
            state.dirty = true;
        }
        Ok(())
    }

    fn store_hash(&self, record: &HashRecord) -> Result<(), PersistenceError> {
        let mut state = self.write_state()?;
        let entry = state
            .document
            .hashes
            .entry(record.fingerprint)
            .or_insert_with(|| HashRecord::new(record.fingerprint, Vec::<String>::new()));
        let before = entry.labels.len();
        entry.merge(record.labels.iter().cloned());
        if entry.labels.len() != before || before == 0 {
            state.dirty = true;
        }
        Ok(())
    }

    /// Write pending changes to disk
    fn flush(&self) -> Result<(), PersistenceError> {
        let mut state = self.state.write().map_err(|_| PersistenceError::LockPoisoned)?;
        self.flush_locked(&mut state)
    }

    fn close(&self) -> Result<(), PersistenceError> {
        let mut state = self.state.write().map_err(|_| PersistenceError::LockPoisoned)?;
        if state.closed {
            return Ok(());
        }
        self.flush_locked(&mut state)?;
        state.closed = true;
        tracing::info!(path = %self.path.display(), "Closed JSON ledger");
        Ok(())
    }
}

impl Drop for JsonLedger {
    fn drop(&mut self) {
        if let Ok(state) = self.state.get_mut() {
            if state.dirty {
                let mut state = std::mem::take(state);
                if let Err(e) = self.flush_locked(&mut state) {
                    tracing::warn!(path = %self.path.display(), error = %e, "Failed to flush JSON ledger on drop");
                }
            }
        }
    }
}
