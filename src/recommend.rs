//! Recommendation scorer (spec §4.6): blends vector similarity, recency
//! decay, and access frequency into a single ranked score, optionally
//! multiplied by the adaptive learner's boost.

use crate::config::RecommendWeights;
use crate::scoring::cosine_similarity;
use crate::volume::{AccessStats, Volume};
use uuid::Uuid;

/// One candidate's decomposed sub-scores, kept around on the result so
/// callers can see why something ranked where it did.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RecommendationSubScores {
    pub vector: f32,
    pub recency: f32,
    pub frequency: f32,
    pub boost: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Recommendation {
    pub id: Uuid,
    pub score: f32,
    pub sub_scores: RecommendationSubScores,
}

/// Exponential recency decay: `exp(-ln(2) * age_ms / half_life_ms)`. An
/// `age_ms` of `0` scores `1.0`; a `half_life_ms` of `0` is treated as
/// "decays instantly" rather than dividing by zero.
fn recency_score(age_ms: u64, half_life_ms: u64) -> f32 {
    if half_life_ms == 0 {
        return if age_ms == 0 { 1.0 } else { 0.0 };
    }
    let ratio = age_ms as f64 / half_life_ms as f64;
    (std::f64::consts::LN_2 * -ratio).exp() as f32
}

/// One candidate handed to [`recommend`]: the volume itself, its access
/// stats (or `None` if it's never been accessed), and the learner's
/// multiplicative boost for it (`1.0` when learning is disabled).
pub struct Candidate<'a> {
    pub volume: &'a Volume,
    pub access: Option<AccessStats>,
    pub boost: f32,
}

/// Score and rank `candidates` against an optional query embedding.
///
/// `now_ms` is passed in (rather than read internally) so recency scoring
/// is deterministic and testable. Results below `min_score` are dropped;
/// the rest are sorted by score descending, ties broken by the candidate's
/// original position in `candidates` (stable sort), and truncated to
/// `max_results`.
pub fn recommend(
    candidates: &[Candidate<'_>],
    query_embedding: Option<&[f32]>,
    weights: RecommendWeights,
    half_life_ms: u64,
    min_score: f32,
    max_results: usize,
    now_ms: u64,
) -> Vec<Recommendation> {
    let weights = weights.normalized();
    let max_access_count = candidates
        .iter()
        .map(|c| c.access.map(|a| a.access_count).unwrap_or(0))
        .max()
        .unwrap_or(0);

    let mut scored: Vec<Recommendation> = candidates
        .iter()
        .map(|c| {
            let vector = query_embedding
                .map(|q| cosine_similarity(q, &c.volume.embedding))
                .unwrap_or(0.0);
            let age_ms = now_ms.saturating_sub(c.volume.timestamp);
            let recency = recency_score(age_ms, half_life_ms);
            let access_count = c.access.map(|a| a.access_count).unwrap_or(0);
            let frequency = if max_access_count == 0 {
                0.0
            } else {
                access_count as f32 / max_access_count as f32
            };

            let base = weights.vector * vector + weights.recency * recency + weights.frequency * frequency;
            let score = base * c.boost;

            Recommendation {
                id: c.volume.id,
                score,
                sub_scores: RecommendationSubScores {
                    vector,
                    recency,
                    frequency,
                    boost: c.boost,
                },
            }
        })
        .filter(|r| r.score >= min_score)
        .collect();

    scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    scored.truncate(max_results);
    scored
}
