//! Vector and text scoring functions.
//!
//! Cosine similarity is the only vector-space metric; everything else here
//! is lexical scoring used by `text_search`/`advanced_search`. Every scorer
//! returns a value in `[0.0, 1.0]` so callers can threshold or combine them
//! uniformly.

use crate::indexes::{tokenize, InvertedIndex};
use regex::Regex;
use std::collections::HashMap;
use uuid::Uuid;

/// `cos(u, v) = (u·v) / (‖u‖‖v‖)`. Returns `0.0` if either vector has zero
/// magnitude or the vectors differ in length (mismatched embeddings never
/// panic, they just never match).
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let mag_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if mag_a == 0.0 || mag_b == 0.0 {
        return 0.0;
    }
    (dot / (mag_a * mag_b)).clamp(-1.0, 1.0)
}

/// Cosine similarity using a precomputed magnitude for `a`, skipping one
/// sqrt per candidate during a brute-force scan.
pub fn cosine_similarity_with_magnitude(a: &[f32], mag_a: f32, b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() || mag_a == 0.0 {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let mag_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if mag_b == 0.0 {
        return 0.0;
    }
    (dot / (mag_a * mag_b)).clamp(-1.0, 1.0)
}

/// Longest-common-subsequence ratio between `needle` and `haystack`
/// (lowercased), normalized by the query's length (spec §4.3: "longest
/// monotone char match … divided by query length"). Used for `fuzzy~term`
/// query clauses.
pub fn fuzzy_ratio(needle: &str, haystack: &str) -> f32 {
    let needle = needle.to_lowercase();
    let haystack = haystack.to_lowercase();
    if needle.is_empty() || haystack.is_empty() {
        return 0.0;
    }
    let n: Vec<char> = needle.chars().collect();
    let h: Vec<char> = haystack.chars().collect();
    let lcs = longest_common_subsequence(&n, &h);
    lcs as f32 / n.len() as f32
}

fn longest_common_subsequence(a: &[char], b: &[char]) -> usize {
    let mut prev = vec![0usize; b.len() + 1];
    let mut curr = vec![0usize; b.len() + 1];
    for &ca in a {
        for (j, &cb) in b.iter().enumerate() {
            curr[j + 1] = if ca == cb {
                prev[j] + 1
            } else {
                prev[j + 1].max(curr[j])
            };
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

/// `1.0` if `needle` (lowercased) occurs anywhere in `haystack`, else `0.0`.
pub fn substring_score(needle: &str, haystack: &str) -> f32 {
    if haystack.to_lowercase().contains(&needle.to_lowercase()) {
        1.0
    } else {
        0.0
    }
}

/// `1.0` on an exact (trimmed, case-insensitive) match, else `0.0`.
pub fn exact_score(needle: &str, haystack: &str) -> f32 {
    if haystack.trim().eq_ignore_ascii_case(needle.trim()) {
        1.0
    } else {
        0.0
    }
}

/// Fraction of query tokens present anywhere in the document's tokens.
pub fn token_overlap_score(query: &str, document: &str) -> f32 {
    let query_tokens = tokenize(query);
    if query_tokens.is_empty() {
        return 0.0;
    }
    let doc_tokens: std::collections::HashSet<String> = tokenize(document).into_iter().collect();
    let hits = query_tokens
        .iter()
        .filter(|t| doc_tokens.contains(*t))
        .count();
    hits as f32 / query_tokens.len() as f32
}

/// Guards against catastrophic regex compilation by rejecting patterns
/// longer than `max_len` before handing them to the regex engine.
pub fn compile_guarded_regex(pattern: &str, max_len: usize) -> Result<Regex, RegexScoreError> {
    if pattern.len() > max_len {
        return Err(RegexScoreError::TooLong {
            len: pattern.len(),
            max: max_len,
        });
    }
    Regex::new(pattern).map_err(RegexScoreError::Invalid)
}

#[derive(Debug, thiserror::Error)]
pub enum RegexScoreError {
    #[error("regex pattern too long: {len} bytes (max {max})")]
    TooLong { len: usize, max: usize },
    #[error("invalid regex pattern: {0}")]
    Invalid(#[from] regex::Error),
}

/// `1.0` if the compiled pattern matches anywhere in `haystack`, else `0.0`.
pub fn regex_score(pattern: &Regex, haystack: &str) -> f32 {
    if pattern.is_match(haystack) {
        1.0
    } else {
        0.0
    }
}

/// BM25 parameters, fixed rather than configurable: `k1 = 1.2`, `b = 0.75`.
const BM25_K1: f32 = 1.2;
const BM25_B: f32 = 0.75;

/// Okapi BM25 score of `query` against one document, given the inverted
/// index it was built from (for document frequency / corpus size / average
/// document length). Raw BM25 scores are unbounded, so callers typically
/// min-max normalize across the candidate set via [`normalize_scores`].
pub fn bm25_score(query: &str, doc_id: &Uuid, index: &InvertedIndex) -> f32 {
    let doc_len = index.doc_length(doc_id) as f32;
    let avg_len = index.average_doc_length();
    if avg_len == 0.0 {
        return 0.0;
    }
    let n = index.doc_count() as f32;
    let query_tokens = tokenize(query);

    let mut score = 0.0f32;
    for term in &query_tokens {
        let df = index.document_frequency(term) as f32;
        if df == 0.0 {
            continue;
        }
        let idf = ((n - df + 0.5) / (df + 0.5) + 1.0).ln();
        // Presence-only term frequency: the index stores postings, not
        // per-document term counts, so repeated occurrences within a
        // document aren't distinguished from a single occurrence.
        let tf = 1.0f32;
        let denom = tf + BM25_K1 * (1.0 - BM25_B + BM25_B * (doc_len / avg_len));
        score += idf * (tf * (BM25_K1 + 1.0)) / denom;
    }
    score.max(0.0)
}

/// Min-max normalize a set of raw scores into `[0.0, 1.0]`. All-equal inputs
/// (including a single score) map to `1.0` if nonzero, else `0.0`.
pub fn normalize_scores(scores: &HashMap<Uuid, f32>) -> HashMap<Uuid, f32> {
    if scores.is_empty() {
        return HashMap::new();
    }
    let min = scores.values().cloned().fold(f32::INFINITY, f32::min);
    let max = scores.values().cloned().fold(f32::NEG_INFINITY, f32::max);
    if (max - min).abs() < f32::EPSILON {
        return scores
            .keys()
            .map(|id| (*id, if max > 0.0 { 1.0 } else { 0.0 }))
            .collect();
    }
    scores
        .iter()
        .map(|(id, &s)| (*id, (s - min) / (max - min)))
        .collect()
}
