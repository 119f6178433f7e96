//! Adaptive recommendation learner (spec §4.7).
//!
//! Modeled as a sum type per spec §9's "Design Notes": [`Learner::Disabled`]
//! holds no state and every operation is a no-op returning neutral defaults
//! (boost `1.0`, weights unchanged); [`Learner::Enabled`] carries the ring
//! of recent queries, the EMA interest embedding, and per-id relevance
//! counts described in spec §4.7/§3 "Learning state".
//!
//! Every failure mode here is swallowed, never raised to the caller (spec
//! §4.9/§7: "adaptive-learning internal failures are swallowed") — there is
//! deliberately no `Result` anywhere in this module's public surface.

use crate::config::{LearnerRates, RecommendWeights};
use crate::scoring::cosine_similarity;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use uuid::Uuid;

/// One observed query: its embedding, the ids returned, and when.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRecord {
    pub embedding: Vec<f32>,
    pub ids_returned: Vec<Uuid>,
    pub timestamp: u64,
}

/// Frozen snapshot of learner state, returned by `learning_profile()` per
/// spec §9's "frozen returned objects" — callers get an owned copy, never a
/// live handle into the engine's state.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LearningProfile {
    pub ring_len: usize,
    pub interest_dimension: usize,
    pub top_relevance: Vec<(Uuid, u64)>,
}

/// Persisted/enabled learner state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnabledState {
    ring: VecDeque<QueryRecord>,
    ring_capacity: usize,
    interest_embedding: Vec<f32>,
    relevance: HashMap<Uuid, u64>,
}

/// The adaptive learner: disabled (pure no-op) or enabled (spec §4.7 state
/// + operations).
#[derive(Debug, Clone)]
pub enum Learner {
    Disabled,
    Enabled {
        state: EnabledState,
        rates: LearnerRates,
    },
}

impl Learner {
    pub fn disabled() -> Self {
        Learner::Disabled
    }

    pub fn enabled(ring_capacity: usize, rates: LearnerRates) -> Self {
        Learner::Enabled {
            state: EnabledState {
                ring: VecDeque::with_capacity(ring_capacity),
                ring_capacity,
                interest_embedding: Vec::new(),
                relevance: HashMap::new(),
            },
            rates,
        }
    }

    /// Restore from a persisted snapshot (see `codec`/`storage`'s reserved
    /// `__learning` key), keeping the configured rates/capacity.
    pub fn from_state(state: EnabledState, ring_capacity: usize, rates: LearnerRates) -> Self {
        let mut state = state;
        state.ring_capacity = ring_capacity;
        Learner::Enabled { state, rates }
    }

    pub fn snapshot_state(&self) -> Option<EnabledState> {
        match self {
            Learner::Disabled => None,
            Learner::Enabled { state, .. } => Some(state.clone()),
        }
    }

    /// Record a vector-search result set against the learner. No-op when
    /// disabled. Never fails — any internal inconsistency (e.g. a
    /// zero-length query embedding) degrades to "don't update the interest
    /// embedding this round" rather than propagating an error.
    pub fn observe_search(&mut self, query_embedding: &[f32], result_ids: &[Uuid], now_ms: u64) {
        let (state, rates) = match self {
            Learner::Disabled => return,
            Learner::Enabled { state, rates } => (state, *rates),
        };

        if state.ring.len() == state.ring_capacity.max(1) {
            state.ring.pop_front();
        }
        state.ring.push_back(QueryRecord {
            embedding: query_embedding.to_vec(),
            ids_returned: result_ids.to_vec(),
            timestamp: now_ms,
        });

        if let Some(normalized) = normalize(query_embedding) {
            state.interest_embedding = ema_update(&state.interest_embedding, &normalized, rates.alpha);
        }

        for id in result_ids {
            *state.relevance.entry(*id).or_insert(0) += 1;
        }
    }

    /// Drop relevance entries for ids no longer present in the store (spec
    /// §4.7 `pruneEntries`, called after `load`).
    pub fn prune_entries(&mut self, valid_ids: &std::collections::HashSet<Uuid>) {
        if let Learner::Enabled { state, .. } = self {
            state.relevance.retain(|id, _| valid_ids.contains(id));
        }
    }

    /// Shift the default weights toward vector-similarity when the
    /// interest embedding agrees strongly with the mean recent query, or
    /// toward frequency when relevance counts are concentrated in a few
    /// ids. Both shifts are capped at `0.1` total and always renormalized.
    pub fn adapted_weights(&self, defaults: RecommendWeights) -> RecommendWeights {
        let state = match self {
            Learner::Disabled => return defaults,
            Learner::Enabled { state, .. } => state,
        };
        if state.ring.is_empty() {
            return defaults;
        }

        let mean_query = mean_embedding(state.ring.iter().map(|q| q.embedding.as_slice()));
        let interest_alignment = match (&mean_query, normalize(&state.interest_embedding)) {
            (Some(mean), Some(interest)) => cosine_similarity(mean, &interest).max(0.0),
            _ => 0.0,
        };

        let concentration = relevance_concentration(&state.relevance);

        let vector_shift = 0.1 * interest_alignment;
        let frequency_shift = 0.1 * concentration;

        let shifted = RecommendWeights {
            vector: defaults.vector + vector_shift,
            recency: defaults.recency,
            frequency: defaults.frequency + frequency_shift,
        };
        shifted.normalized()
    }

    /// `1 + beta*cosine(interest, emb) + gamma*(relevance[id]/max_relevance)`,
    /// clipped to `[0.5, 1.5]`. `1.0` (neutral) when disabled.
    pub fn compute_boost(&self, id: Uuid, embedding: &[f32]) -> f32 {
        let (state, rates) = match self {
            Learner::Disabled => return 1.0,
            Learner::Enabled { state, rates } => (state, *rates),
        };

        let interest_term = match normalize(&state.interest_embedding) {
            Some(interest) => cosine_similarity(&interest, embedding),
            None => 0.0,
        };

        let max_relevance = state.relevance.values().copied().max().unwrap_or(0);
        let relevance_term = if max_relevance == 0 {
            0.0
        } else {
            state.relevance.get(&id).copied().unwrap_or(0) as f32 / max_relevance as f32
        };

        (1.0 + rates.beta * interest_term + rates.gamma * relevance_term).clamp(0.5, 1.5)
    }

    /// Frozen snapshot for external inspection (spec §9's "get-by-hidden
    /// property getter" `learningProfile`).
    pub fn profile(&self) -> LearningProfile {
        match self {
            Learner::Disabled => LearningProfile::default(),
            Learner::Enabled { state, .. } => {
                let mut top: Vec<(Uuid, u64)> =
                    state.relevance.iter().map(|(id, count)| (*id, *count)).collect();
                top.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
                top.truncate(10);
                LearningProfile {
                    ring_len: state.ring.len(),
                    interest_dimension: state.interest_embedding.len(),
                    top_relevance: top,
                }
            }
        }
    }
}

fn normalize(v: &[f32]) -> Option<Vec<f32>> {
    if v.is_empty() {
        return None;
    }
    let mag = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if mag == 0.0 {
        return None;
    }
    Some(v.iter().map(|x| x / mag).collect())
}

/// `interest <- alpha*normalized_query + (1-alpha)*interest`, renormalized.
/// If `interest` is empty (first observation) or dimension differs from the
/// incoming query, the incoming query's normalized form replaces it outright
/// rather than producing a dimension mismatch.
fn ema_update(interest: &[f32], normalized_query: &[f32], alpha: f32) -> Vec<f32> {
    if interest.is_empty() || interest.len() != normalized_query.len() {
        return normalized_query.to_vec();
    }
    let blended: Vec<f32> = interest
        .iter()
        .zip(normalized_query.iter())
        .map(|(i, q)| alpha * q + (1.0 - alpha) * i)
        .collect();
    normalize(&blended).unwrap_or(blended)
}

fn mean_embedding<'a>(vectors: impl Iterator<Item = &'a [f32]>) -> Option<Vec<f32>> {
    let mut sum: Vec<f32> = Vec::new();
    let mut count = 0usize;
    for v in vectors {
        if v.is_empty() {
            continue;
        }
        if sum.is_empty() {
            sum = vec![0.0; v.len()];
        }
        if v.len() != sum.len() {
            continue;
        }
        for (s, x) in sum.iter_mut().zip(v.iter()) {
            *s += x;
        }
        count += 1;
    }
    if count == 0 {
        return None;
    }
    Some(sum.iter().map(|x| x / count as f32).collect())
}

/// How concentrated the relevance counts are in the top id, as a fraction
/// of the total. `0.0` with no observations.
fn relevance_concentration(relevance: &HashMap<Uuid, u64>) -> f32 {
    let total: u64 = relevance.values().sum();
    if total == 0 {
        return 0.0;
    }
    let max = relevance.values().copied().max().unwrap_or(0);
    max as f32 / total as f32
}
