//! Persistent storage backend on top of `sled`.
//!
//! Grounded on the retrieval pack's `hyperspace_cache` and `vector_kb`
//! crates, both of which open a `sled::Db` at a configurable path and treat
//! it as a flat key→bytes map. `save` here goes one step further than those
//! two (which only ever insert/scan) to satisfy the "atomic replace of
//! durable state" contract: it diffs the new entry set against what's on
//! disk and applies the additions/removals as a single `sled::Batch`, which
//! sled commits atomically.

use super::{StorageBackend, StorageError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

pub struct SledBackend {
    db: sled::Db,
    path: PathBuf,
}

impl SledBackend {
    /// Open (creating if necessary) a sled database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = sled::open(&path)?;
        Ok(Self { db, path })
    }

    /// Default on-disk location: `<data dir>/volumestore/store.sled`.
    pub fn default_path() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("volumestore")
            .join("store.sled")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl StorageBackend for SledBackend {
    async fn load(&self) -> Result<HashMap<String, Vec<u8>>, StorageError> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            let mut out = HashMap::new();
            for kv in db.iter() {
                let (k, v) = kv?;
                let key = String::from_utf8(k.to_vec())
                    .map_err(|e| StorageError::Other(format!("non-utf8 key: {e}")))?;
                out.insert(key, v.to_vec());
            }
            Ok(out)
        })
        .await
        .map_err(|e| StorageError::Other(format!("blocking task panicked: {e}")))?
    }

    async fn save(&self, entries: HashMap<String, Vec<u8>>) -> Result<(), StorageError> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            let existing: Vec<Vec<u8>> = db
                .iter()
                .keys()
                .filter_map(|k| k.ok().map(|k| k.to_vec()))
                .collect();

            let mut batch = sled::Batch::default();
            for key in &existing {
                if !entries.contains_key(&String::from_utf8_lossy(key).to_string()) {
                    batch.remove(key.as_slice());
                }
            }
            for (key, value) in &entries {
                batch.insert(key.as_bytes(), value.as_slice());
            }
            db.apply_batch(batch)?;
            db.flush()?;
            Ok(())
        })
        .await
        .map_err(|e| StorageError::Other(format!("blocking task panicked: {e}")))?
    }

    async fn close(&self) -> Result<(), StorageError> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || db.flush().map(|_| ()))
            .await
            .map_err(|e| StorageError::Other(format!("blocking task panicked: {e}")))??;
        Ok(())
    }
}
