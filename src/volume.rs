//! The `Volume` record and its access statistics.
//!
//! A `Volume` is immutable once created: callers only ever see it via
//! `&Volume` borrows or owned clones returned from the engine, never a
//! mutable handle. Shaped like `memory.rs`'s `MemoryEntry`, generalized
//! from a JSONL-journal row to a record that also carries a metadata map
//! and a stable 128-bit id.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Reserved metadata key used to derive a volume's topic.
pub const TOPIC_KEY: &str = "topic";

/// Default topic assigned to a volume with no `topic` metadata entry.
pub const DEFAULT_TOPIC: &str = "uncategorized";

/// An immutable stored record: text + embedding + metadata + timestamp + id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Volume {
    pub id: Uuid,
    pub text: String,
    pub embedding: Vec<f32>,
    pub metadata: HashMap<String, String>,
    /// Milliseconds since the Unix epoch at creation. Never updated.
    pub timestamp: u64,
}

impl Volume {
    /// Construct a new volume with a fresh id and the current timestamp.
    ///
    /// Callers are expected to have already validated `text`/`embedding`
    /// are non-empty (see `VolumeStoreError::EmptyText`/`EmptyEmbedding`);
    /// this constructor does not re-check, since it's only called from
    /// engine code that has already done so.
    pub fn new(text: String, embedding: Vec<f32>, metadata: HashMap<String, String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            text,
            embedding,
            metadata,
            timestamp: now_ms(),
        }
    }

    /// Construct a volume with an explicit id/timestamp, for codec round-trips
    /// and deterministic tests.
    pub fn from_parts(
        id: Uuid,
        text: String,
        embedding: Vec<f32>,
        metadata: HashMap<String, String>,
        timestamp: u64,
    ) -> Self {
        Self {
            id,
            text,
            embedding,
            metadata,
            timestamp,
        }
    }

    /// The volume's topic: `metadata["topic"]`, or [`DEFAULT_TOPIC`] if absent.
    pub fn topic(&self) -> &str {
        self.metadata
            .get(TOPIC_KEY)
            .map(|s| s.as_str())
            .unwrap_or(DEFAULT_TOPIC)
    }

    /// `id` rendered as lowercase hex with hyphens (the UUID's canonical form).
    pub fn id_string(&self) -> String {
        self.id.to_string()
    }
}

/// Current time in milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Per-id access record: `(access_count, last_accessed_ms)`.
///
/// Incremented on any direct `get_by_id` and on each result returned by
/// cosine/advanced search. Never incremented by `recommend` (would create a
/// positive-feedback loop) nor by plain text search.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccessStats {
    pub access_count: u32,
    pub last_accessed: u64,
}

impl AccessStats {
    pub fn record_access(&mut self, at_ms: u64) {
        self.access_count = self.access_count.saturating_add(1);
        self.last_accessed = at_ms;
    }
}
