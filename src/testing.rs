//! Deterministic stand-ins for the embedding and text-generation providers
//! spec §6 treats as external collaborators.
//!
//! Grounded on the retrieval pack's `vector_kb::StubEmbedder`: a
//! hashing-trick bag-of-tokens embedding, L2-normalized, with no model
//! weights or network calls. Gated behind `cfg(test)`/the `testing`
//! feature so it never becomes an embedder's default choice — a real
//! embedding provider is always an explicit, intentional wiring decision.

use crate::engine::TextSearchMode;
use crate::indexes::tokenize;
use crate::VolumeStoreError;
use async_trait::async_trait;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use crate::facade::{EmbeddingProvider, TextGenerationProvider};

/// Hashing-trick token embedder: each token hashes into one of `dimension`
/// buckets and adds `1.0`; the resulting vector is L2-normalized. Identical
/// text always produces an identical (and therefore cosine-1.0-with-itself)
/// embedding, which is exactly what fixture-driven tests need.
pub struct StubEmbedder {
    dimension: usize,
}

impl StubEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }

    fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dimension];
        for token in tokenize(text) {
            let mut hasher = DefaultHasher::new();
            token.hash(&mut hasher);
            let bucket = (hasher.finish() as usize) % self.dimension;
            v[bucket] += 1.0;
        }
        let mag = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if mag > 0.0 {
            for x in &mut v {
                *x /= mag;
            }
        }
        v
    }
}

#[async_trait]
impl EmbeddingProvider for StubEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, VolumeStoreError> {
        Ok(texts.iter().map(|t| self.embed_text(t)).collect())
    }
}

/// Extractive stand-in for a text-generation provider: joins the prompt's
/// enumerated source lines into one sentence rather than calling a model.
pub struct StubGenerator;

#[async_trait]
impl TextGenerationProvider for StubGenerator {
    async fn generate(&self, prompt: &str) -> Result<String, VolumeStoreError> {
        let joined: Vec<&str> = prompt
            .lines()
            .filter(|line| line.chars().next().is_some_and(|c| c.is_ascii_digit()))
            .map(|line| line.splitn(2, ". ").nth(1).unwrap_or(line))
            .collect();
        Ok(format!("Summary: {}", joined.join("; ")))
    }
}

/// Test helper mirroring `TextSearchMode::Bm25`'s default, re-exported so
/// integration tests under `tests/` don't need to reach into `engine`
/// directly just to name the default mode.
pub const DEFAULT_TEXT_MODE: TextSearchMode = TextSearchMode::Bm25;
