//! Tunable knobs for the engine.
//!
//! `EngineConfig` is a plain data struct: it is *defined* and *validated*
//! here, but reading it from a file or environment is an external config
//! loader's job (spec §1 excludes that loader from the core, the same way
//! the teacher repo kept `cortex_get_rules`' YAML-merge logic out of the
//! library proper).

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// How an `add` reacts to a near-duplicate embedding above
/// `duplicate_threshold`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicateBehavior {
    /// Return the existing id instead of inserting.
    Skip,
    /// Log and insert anyway.
    Warn,
    /// Raise `VolumeStoreError::Duplicate`.
    Error,
}

impl Default for DuplicateBehavior {
    fn default() -> Self {
        DuplicateBehavior::Warn
    }
}

/// Weights for [`crate::recommend`]'s blended score. Normalized to sum to
/// `1.0` by [`EngineConfig::validated`] — constructing one directly with
/// unnormalized weights is legal, callers just get un-normalized behavior
/// until it passes through `validated()`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RecommendWeights {
    pub vector: f32,
    pub recency: f32,
    pub frequency: f32,
}

impl Default for RecommendWeights {
    fn default() -> Self {
        Self {
            vector: 0.5,
            recency: 0.3,
            frequency: 0.2,
        }
    }
}

impl RecommendWeights {
    /// Scale all three weights so they sum to `1.0`. A weight set that sums
    /// to `0.0` falls back to the default split rather than dividing by zero.
    pub fn normalized(self) -> Self {
        let sum = self.vector + self.recency + self.frequency;
        if sum.abs() < f32::EPSILON {
            return Self::default();
        }
        Self {
            vector: self.vector / sum,
            recency: self.recency / sum,
            frequency: self.frequency / sum,
        }
    }
}

/// Rate constants for the adaptive learner (spec §4.7). These are fixed
/// constants in the spec's source, exposed here as config only so tests and
/// embedders can tune them without forking the crate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LearnerRates {
    /// Interest-embedding EMA rate.
    pub alpha: f32,
    /// Interest-similarity boost weight in `compute_boost`.
    pub beta: f32,
    /// Relevance-count boost weight in `compute_boost`.
    pub gamma: f32,
}

impl Default for LearnerRates {
    fn default() -> Self {
        Self {
            alpha: 0.05,
            beta: 0.15,
            gamma: 0.1,
        }
    }
}

/// Every tunable the engine, recommender, and learner read from. `Default`
/// matches the values spec.md calls out explicitly; `validated()` clamps and
/// normalizes anything a caller might hand in out of range.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Cosine-similarity threshold above which `add` considers a volume a
    /// duplicate. `0.0` disables duplicate detection entirely.
    pub duplicate_threshold: f32,
    pub duplicate_behavior: DuplicateBehavior,

    pub recommend_weights: RecommendWeights,
    /// Half-life, in milliseconds, of the recency decay term.
    pub recency_half_life_ms: u64,
    /// Recommendations below this score are dropped before truncation.
    pub recommend_min_score: f32,
    /// Default cap on the number of recommendations/search results returned.
    pub default_max_results: usize,

    /// Whether the adaptive learner is enabled at all (spec §4.7/§9's
    /// `Disabled`/`Enabled` sum type).
    pub learning_enabled: bool,
    /// Size of the learner's recent-query ring.
    pub learner_ring_size: usize,
    pub learner_rates: LearnerRates,

    /// Patterns longer than this are rejected by the regex scorer.
    pub max_regex_pattern_length: usize,

    /// Topic assigned to a volume with no `metadata["topic"]` entry.
    pub default_topic: String,

    /// `true`: every mutation flushes immediately. `false`: rely on the
    /// background flush timer (`flush_interval_ms`), if armed.
    pub auto_save: bool,
    /// Background flush period; `0` disables the timer. Only consulted when
    /// `auto_save` is `false`.
    pub flush_interval_ms: u64,

    /// Default on-disk location for the `sled` backend, when an embedder
    /// doesn't supply its own path.
    pub storage_path: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            duplicate_threshold: 0.0,
            duplicate_behavior: DuplicateBehavior::default(),
            recommend_weights: RecommendWeights::default(),
            recency_half_life_ms: 7 * 24 * 60 * 60 * 1000,
            recommend_min_score: 0.0,
            default_max_results: 10,
            learning_enabled: true,
            learner_ring_size: 200,
            learner_rates: LearnerRates::default(),
            max_regex_pattern_length: 256,
            default_topic: crate::volume::DEFAULT_TOPIC.to_string(),
            auto_save: true,
            flush_interval_ms: 0,
            storage_path: None,
        }
    }
}

impl EngineConfig {
    /// Normalize weights and clamp ranges that would otherwise make
    /// downstream arithmetic nonsensical (negative thresholds, a zero ring
    /// size, etc). Does not touch fields that have no invalid range
    /// (`storage_path`, `default_topic`).
    pub fn validated(mut self) -> Self {
        self.recommend_weights = self.recommend_weights.normalized();
        self.duplicate_threshold = self.duplicate_threshold.clamp(0.0, 1.0);
        self.recommend_min_score = self.recommend_min_score.max(0.0);
        self.learner_ring_size = self.learner_ring_size.max(1);
        self.max_regex_pattern_length = self.max_regex_pattern_length.max(1);
        if self.default_max_results == 0 {
            self.default_max_results = 10;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_weights_already_sum_to_one() {
        let w = RecommendWeights::default().normalized();
        assert!((w.vector + w.recency + w.frequency - 1.0).abs() < 1e-6);
    }

    #[test]
    fn normalized_rescales_arbitrary_weights() {
        let w = RecommendWeights {
            vector: 2.0,
            recency: 1.0,
            frequency: 1.0,
        }
        .normalized();
        assert!((w.vector - 0.5).abs() < 1e-6);
        assert!((w.recency - 0.25).abs() < 1e-6);
    }

    #[test]
    fn zero_sum_weights_fall_back_to_default() {
        let w = RecommendWeights {
            vector: 0.0,
            recency: 0.0,
            frequency: 0.0,
        }
        .normalized();
        assert_eq!(w, RecommendWeights::default());
    }

    #[test]
    fn validated_clamps_negative_threshold_to_zero() {
        let mut cfg = EngineConfig::default();
        cfg.duplicate_threshold = -1.0;
        let cfg = cfg.validated();
        assert_eq!(cfg.duplicate_threshold, 0.0);
    }

    #[test]
    fn validated_rejects_zero_ring_size() {
        let mut cfg = EngineConfig::default();
        cfg.learner_ring_size = 0;
        assert_eq!(cfg.validated().learner_ring_size, 1);
    }
}
