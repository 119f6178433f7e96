//! Pluggable key→bytes storage backend.
//!
//! The engine never depends on a concrete backend directly — it holds a
//! `Box<dyn StorageBackend>` and talks only through this trait, the same
//! shape `hyperspace_cache` and `vector_kb` use in the retrieval pack (there
//! via a `#[cfg(feature = ...)]` backend switch; here via a trait object,
//! since the backend is meant to be swapped by embedders rather than chosen
//! at compile time).

mod memory;
mod sled_backend;

pub use memory::MemoryBackend;
pub use sled_backend::SledBackend;

use async_trait::async_trait;
use std::collections::HashMap;

/// Reserved storage key holding the serialized adaptive-learner snapshot.
/// All other keys are volume ids.
pub const LEARNING_KEY: &str = "__learning";

/// Contract for a persistence backend.
///
/// `save` MUST be atomic: an all-or-nothing replace of the durable state.
/// `load` failure is surfaced by the engine as `VolumeStoreError::Corruption`.
/// The engine tolerates a missing backing store by treating `load` on an
/// empty/nonexistent store as an empty mapping, not an error.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Load the full key→bytes mapping.
    async fn load(&self) -> Result<HashMap<String, Vec<u8>>, StorageError>;

    /// Atomically replace the durable state with `entries`.
    async fn save(&self, entries: HashMap<String, Vec<u8>>) -> Result<(), StorageError>;

    /// Release any held resources (file handles, connections, …).
    async fn close(&self) -> Result<(), StorageError>;
}

/// Backend-level failure. Kept distinct from `VolumeStoreError` so backend
/// implementations don't need to depend on the engine's error type; the
/// engine wraps this into `VolumeStoreError::Corruption`/`Transient` at the
/// call site depending on whether it happened during `load` or `save`.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("backend io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("backend error: {0}")]
    Other(String),
}

impl From<sled::Error> for StorageError {
    fn from(e: sled::Error) -> Self {
        StorageError::Other(e.to_string())
    }
}
