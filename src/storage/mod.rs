//! Local storage for anchor records
//!
//! Persistent store with JSON serialization. Only terminal records are
//! history; in-flight ones belong to the manager that owns them.

use crate::ledger::{AnchorRecord, AnchorStatus};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store I/O failed for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("store {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("record {0} is not terminal and cannot be stored")]
    NotTerminal(Uuid),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreMetadata {
    pub owner: String,
    pub created_at: String,
    pub total_records_ever: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RecordStore {
    pub records: Vec<AnchorRecord>,
    #[serde(skip)]
    pub path: PathBuf,
    pub metadata: StoreMetadata,
}

impl RecordStore {
    /// Open the store at `path`, starting empty when the file does not exist
    pub fn open(path: impl AsRef<Path>, owner: &str) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if path.exists() {
            let data = std::fs::read_to_string(&path).map_err(|source| StoreError::Io {
                path: path.clone(),
                source,
            })?;
            let mut store: RecordStore = serde_json::from_str(&data).map_err(|source| StoreError::Corrupt {
                path: path.clone(),
                source,
            })?;
            store.path = path;
            return Ok(store);
        }
        Ok(Self {
            records: Vec::new(),
            path,
            metadata: StoreMetadata {
                owner: owner.to_string(),
                created_at: chrono::Utc::now().to_rfc3339(),
                total_records_ever: 0,
            },
        })
    }

    pub fn save(&self) -> Result<(), StoreError> {
        let json = serde_json::to_string_pretty(self).map_err(|source| StoreError::Corrupt {
            path: self.path.clone(),
            source,
        })?;
        std::fs::write(&self.path, json).map_err(|source| StoreError::Io {
            path: self.path.clone(),
            source,
        })
    }

    /// Add or replace a terminal record
    pub fn add(&mut self, record: AnchorRecord) -> Result<(), StoreError> {
        if !record.is_terminal() {
            return Err(StoreError::NotTerminal(record.id));
        }
        match self.records.iter_mut().find(|r| r.id == record.id) {
            Some(existing) => *existing = record,
            None => {
                self.metadata.total_records_ever += 1;
                self.records.push(record);
            }
        }
        Ok(())
    }

    pub fn get(&self, id: Uuid) -> Option<&AnchorRecord> {
        self.records.iter().find(|r| r.id == id)
    }

    pub fn list_by_instance(&self, instance_identifier: &str) -> Vec<&AnchorRecord> {
        self.records
            .iter()
            .filter(|r| r.instance_identifier == instance_identifier)
            .collect()
    }

    /// Confirmed records carrying `digest_hex`
    pub fn confirmed_for_digest(&self, digest_hex: &str) -> Vec<&AnchorRecord> {
        self.records
            .iter()
            .filter(|r| r.status == AnchorStatus::Confirmed && r.digest_hex() == digest_hex)
            .collect()
    }

    pub fn summary(&self) -> String {
        let count = |status: AnchorStatus| self.records.iter().filter(|r| r.status == status).count();
        format!(
            "RecordStore '{}' | {} records | {} confirmed, {} failed, {} timed out",
            self.metadata.owner,
            self.records.len(),
            count(AnchorStatus::Confirmed),
            count(AnchorStatus::Failed),
            count(AnchorStatus::TimedOut)
        )
    }
}
