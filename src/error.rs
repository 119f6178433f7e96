//! Unified error type for the volume store core.
//!
//! Modeled on the retrieval pack's `vector_kb`/`error_types` crates: a
//! `thiserror` enum with `#[from]` conversions at the seams, rather than a
//! boxed `anyhow::Error`. Library callers match on variants; only the
//! teacher's own CLI-shaped code used `anyhow` directly.

use thiserror::Error;

/// Every error the core can surface to a caller.
///
/// Validation errors and `Duplicate` surface immediately, `Corruption` is
/// unrecoverable for that store instance, and `Transient` wraps a failed
/// `save` that the save chain will retry on the next call.
#[derive(Debug, Error)]
pub enum VolumeStoreError {
    /// Operation invoked before `load()` completed.
    #[error("store not loaded")]
    NotLoaded,

    /// `add`/`add_batch` called with empty text.
    #[error("volume text must not be empty")]
    EmptyText,

    /// `add`/`add_batch` called with an empty embedding vector.
    #[error("volume embedding must not be empty")]
    EmptyEmbedding,

    /// A near-duplicate was found and `duplicate_behavior` was `Error`.
    #[error("duplicate of existing volume {existing_id} (similarity {similarity:.4})")]
    Duplicate {
        existing_id: uuid::Uuid,
        similarity: f32,
    },

    /// The backend or codec failed irrecoverably while loading.
    #[error("store corrupted during load: {0}")]
    Corruption(String),

    /// `save` failed; the save chain will retry on the next call.
    #[error("save failed: {0}")]
    Transient(String),

    /// A requested volume id does not exist in the store.
    #[error("no volume with id {0}")]
    NotFound(uuid::Uuid),

    /// Underlying storage backend error.
    #[error("storage backend error: {0}")]
    Backend(#[from] std::io::Error),

    /// Metadata (de)serialization failure.
    #[error("metadata serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// sled-backed storage failure, when the `sled` backend is in use.
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),
}

pub type Result<T> = std::result::Result<T, VolumeStoreError>;
