//! # Metadata Store
//!
//! Last-known modification times and content digests for every file in every
//! share. The share engine only depends on the [`MetadataStore`] trait; the
//! bundled [`JsonMetadataStore`] keeps the index in memory and, when given a
//! path, persists it as JSON after every change.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::message::Digest;

/// Read/write interface the share engine needs from a metadata store.
pub trait MetadataStore: Send + Sync {
    fn stored_mod_time(&self, share: &str, path: &str) -> Result<Option<DateTime<Utc>>, StoreError>;
    fn stored_hash(&self, share: &str, path: &str) -> Result<Option<Vec<u8>>, StoreError>;
    fn set_mod_time(&self, share: &str, path: &str, mod_time: DateTime<Utc>) -> Result<(), StoreError>;
    fn set_hash(&self, share: &str, path: &str, hash: &Digest) -> Result<(), StoreError>;
    /// Drop everything recorded for `path` and anything below it.
    fn forget(&self, share: &str, path: &str) -> Result<(), StoreError>;
    /// Every path recorded for `share`.
    fn known_paths(&self, share: &str) -> Result<Vec<String>, StoreError>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileRecord {
    pub mod_time: Option<DateTime<Utc>>,
    pub hash: Option<String>,
}

type Index = HashMap<String, HashMap<String, FileRecord>>;

#[derive(Clone, Default)]
pub struct JsonMetadataStore {
    index_path: Option<PathBuf>,
    index: Arc<RwLock<Index>>,
}

impl JsonMetadataStore {
    /// A store that lives only as long as the process.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Open (or create) a store persisted at `index_path`.
    pub fn open(index_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = index_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let index = if index_path.exists() {
            let data = std::fs::read_to_string(index_path)?;
            match serde_json::from_str(&data) {
                Ok(index) => index,
                Err(e) => {
                    warn!("Metadata index {} is unreadable, starting empty: {}", index_path.display(), e);
                    Index::new()
                }
            }
        } else {
            Index::new()
        };

        Ok(Self {
            index_path: Some(index_path.to_path_buf()),
            index: Arc::new(RwLock::new(index)),
        })
    }

    fn update<F>(&self, share: &str, path: &str, f: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut FileRecord),
    {
        {
            let mut index = self.index.write();
            let record = index
                .entry(share.to_string())
                .or_default()
                .entry(path.to_string())
                .or_default();
            f(record);
        }
        self.save_index()
    }

    fn record(&self, share: &str, path: &str) -> Option<FileRecord> {
        self.index.read().get(share).and_then(|files| files.get(path)).cloned()
    }

    fn save_index(&self) -> Result<(), StoreError> {
        let Some(index_path) = &self.index_path else {
            return Ok(());
        };

        let data = {
            let index = self.index.read();
            serde_json::to_string_pretty(&*index)?
        };
        std::fs::write(index_path, data)
            .map_err(|e| StoreError::Unavailable(format!("{}: {}", index_path.display(), e)))?;
        Ok(())
    }
}

impl MetadataStore for JsonMetadataStore {
    fn stored_mod_time(&self, share: &str, path: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self.record(share, path).and_then(|r| r.mod_time))
    }

    fn stored_hash(&self, share: &str, path: &str) -> Result<Option<Vec<u8>>, StoreError> {
        // An undecodable digest is reported as absent, which callers treat as "changed".
        Ok(self
            .record(share, path)
            .and_then(|r| r.hash)
            .and_then(|h| hex::decode(h).ok()))
    }

    fn set_mod_time(&self, share: &str, path: &str, mod_time: DateTime<Utc>) -> Result<(), StoreError> {
        self.update(share, path, |record| record.mod_time = Some(mod_time))
    }

    fn set_hash(&self, share: &str, path: &str, hash: &Digest) -> Result<(), StoreError> {
        self.update(share, path, |record| record.hash = Some(hex::encode(hash)))
    }

    fn forget(&self, share: &str, path: &str) -> Result<(), StoreError> {
        let removed = {
            let mut index = self.index.write();
            match index.get_mut(share) {
                Some(files) => {
                    let prefix = format!("{}/", path);
                    let before = files.len();
                    files.retain(|name, _| name != path && !name.starts_with(&prefix));
                    before - files.len()
                }
                None => 0,
            }
        };

        if removed > 0 {
            debug!("Forgot {} record(s) under {}/{}", removed, share, path);
            self.save_index()?;
        }
        Ok(())
    }

    fn known_paths(&self, share: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .index
            .read()
            .get(share)
            .map(|files| files.keys().cloned().collect())
            .unwrap_or_default())
    }
}
