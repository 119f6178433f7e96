//! In-memory storage backend: a plain `HashMap` guarded by a lock.
//!
//! Useful as the default backend for tests and for embedders that want a
//! scratch store with no durability at all — `close()` and `save()` are both
//! no-ops beyond committing to the in-memory map.

use super::{StorageBackend, StorageError};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::Mutex;

#[derive(Default)]
pub struct MemoryBackend {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn load(&self) -> Result<HashMap<String, Vec<u8>>, StorageError> {
        Ok(self.entries.lock().await.clone())
    }

    async fn save(&self, entries: HashMap<String, Vec<u8>>) -> Result<(), StorageError> {
        *self.entries.lock().await = entries;
        Ok(())
    }

    async fn close(&self) -> Result<(), StorageError> {
        Ok(())
    }
}
