//! `volumestore` — an embedded, persistent vector+metadata store.
//!
//! A `volumestore` is a flat collection of **volumes**: short text paired
//! with a dense embedding and a string-keyed metadata map. On top of that
//! it offers four composable retrieval modes (cosine similarity, lexical
//! search, structured filtering, and a weighted recommendation score) plus
//! an optional adaptive learner that biases recommendations toward
//! recurrent interests, all behind a pluggable key→bytes storage backend.
//!
//! [`facade::VolumeLibrary`] is the entry point most embedders want: it
//! embeds text through an [`facade::EmbeddingProvider`] and forwards
//! everything else to [`engine::VolumeStoreEngine`], which owns the
//! volumes, every index, the write lock, and the save chain.

pub mod codec;
pub mod config;
pub mod dedup;
pub mod engine;
pub mod error;
pub mod facade;
pub mod indexes;
pub mod learner;
pub mod query;
pub mod recommend;
pub mod scoring;
pub mod storage;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod volume;

pub use config::EngineConfig;
pub use engine::VolumeStoreEngine;
pub use error::{Result, VolumeStoreError};
pub use facade::VolumeLibrary;
pub use volume::Volume;
