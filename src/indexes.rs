//! Secondary indexes over the volume set.
//!
//! All four indexes here are fully derivable from the live volume set and
//! are rebuilt from scratch on `load` — none of them are persisted
//! directly. Insertion, removal, and clear are all O(m) in the number of
//! indexed attributes of a single volume, never O(n) in store size.

use std::collections::{HashMap, HashSet};
use uuid::Uuid;

/// Lowercase, punctuation-stripped whitespace tokenization shared by the
/// inverted index and the BM25/token scorers. Fixed and deterministic so
/// that scoring is reproducible across runs.
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_string())
        .collect()
}

/// Topic string → set of volume ids, plus per-ancestor subtree counts so
/// that `all_topics()` can prune branches that have gone empty without
/// rescanning the whole volume set.
#[derive(Debug, Default)]
pub struct TopicIndex {
    by_topic: HashMap<String, HashSet<Uuid>>,
    subtree_counts: HashMap<String, u64>,
}

impl TopicIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every path-like ancestor of `topic`, including `topic` itself, e.g.
    /// `"proj/a/b"` → `["proj", "proj/a", "proj/a/b"]`.
    fn ancestors(topic: &str) -> Vec<String> {
        let mut out = Vec::new();
        let mut acc = String::new();
        for segment in topic.split('/') {
            if !acc.is_empty() {
                acc.push('/');
            }
            acc.push_str(segment);
            out.push(acc.clone());
        }
        out
    }

    pub fn insert(&mut self, topic: &str, id: Uuid) {
        self.by_topic
            .entry(topic.to_string())
            .or_default()
            .insert(id);
        for ancestor in Self::ancestors(topic) {
            *self.subtree_counts.entry(ancestor).or_insert(0) += 1;
        }
    }

    pub fn remove(&mut self, topic: &str, id: &Uuid) {
        if let Some(ids) = self.by_topic.get_mut(topic) {
            ids.remove(id);
            if ids.is_empty() {
                self.by_topic.remove(topic);
            }
        }
        for ancestor in Self::ancestors(topic) {
            if let Some(count) = self.subtree_counts.get_mut(&ancestor) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    self.subtree_counts.remove(&ancestor);
                }
            }
        }
    }

    pub fn clear(&mut self) {
        self.by_topic.clear();
        self.subtree_counts.clear();
    }

    /// Ids whose topic is exactly `topic` (no subtree matching).
    pub fn ids_for(&self, topic: &str) -> HashSet<Uuid> {
        self.by_topic.get(topic).cloned().unwrap_or_default()
    }

    /// All topics (and non-empty ancestor prefixes) that currently have at
    /// least one volume in their subtree, lazily pruned of empty branches.
    pub fn all_topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self
            .subtree_counts
            .iter()
            .filter(|(_, &count)| count > 0)
            .map(|(t, _)| t.clone())
            .collect();
        topics.sort();
        topics
    }

    pub fn len(&self) -> usize {
        self.by_topic.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_topic.is_empty()
    }
}

/// `(key, value)` → set of ids; supports only equality lookups. Richer
/// predicates fall back to a full scan over the volume set (see `engine`).
#[derive(Debug, Default)]
pub struct MetadataIndex {
    by_kv: HashMap<(String, String), HashSet<Uuid>>,
}

impl MetadataIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, metadata: &HashMap<String, String>, id: Uuid) {
        for (k, v) in metadata {
            self.by_kv
                .entry((k.clone(), v.clone()))
                .or_default()
                .insert(id);
        }
    }

    pub fn remove(&mut self, metadata: &HashMap<String, String>, id: &Uuid) {
        for (k, v) in metadata {
            let key = (k.clone(), v.clone());
            if let Some(ids) = self.by_kv.get_mut(&key) {
                ids.remove(id);
                if ids.is_empty() {
                    self.by_kv.remove(&key);
                }
            }
        }
    }

    pub fn clear(&mut self) {
        self.by_kv.clear();
    }

    pub fn ids_for(&self, key: &str, value: &str) -> HashSet<Uuid> {
        self.by_kv
            .get(&(key.to_string(), value.to_string()))
            .cloned()
            .unwrap_or_default()
    }
}

/// id → precomputed `‖embedding‖₂`.
#[derive(Debug, Default)]
pub struct MagnitudeCache {
    magnitudes: HashMap<Uuid, f32>,
}

impl MagnitudeCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: Uuid, embedding: &[f32]) {
        let magnitude = embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
        self.magnitudes.insert(id, magnitude);
    }

    pub fn remove(&mut self, id: &Uuid) {
        self.magnitudes.remove(id);
    }

    pub fn clear(&mut self) {
        self.magnitudes.clear();
    }

    pub fn get(&self, id: &Uuid) -> Option<f32> {
        self.magnitudes.get(id).copied()
    }

    pub fn len(&self) -> usize {
        self.magnitudes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.magnitudes.is_empty()
    }
}

/// Lowercased token → set of ids, used to prune BM25/token search
/// candidates before scoring.
#[derive(Debug, Default)]
pub struct InvertedIndex {
    by_token: HashMap<String, HashSet<Uuid>>,
    /// Token count per volume, kept alongside the index so BM25 doesn't need
    /// to re-tokenize every document on every query.
    doc_lengths: HashMap<Uuid, usize>,
}

impl InvertedIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: Uuid, text: &str) {
        let tokens = tokenize(text);
        self.doc_lengths.insert(id, tokens.len());
        for token in tokens {
            self.by_token.entry(token).or_default().insert(id);
        }
    }

    pub fn remove(&mut self, id: &Uuid, text: &str) {
        self.doc_lengths.remove(id);
        for token in tokenize(text) {
            if let Some(ids) = self.by_token.get_mut(&token) {
                ids.remove(id);
                if ids.is_empty() {
                    self.by_token.remove(&token);
                }
            }
        }
    }

    pub fn clear(&mut self) {
        self.by_token.clear();
        self.doc_lengths.clear();
    }

    pub fn ids_for_token(&self, token: &str) -> HashSet<Uuid> {
        self.by_token.get(token).cloned().unwrap_or_default()
    }

    pub fn doc_length(&self, id: &Uuid) -> usize {
        self.doc_lengths.get(id).copied().unwrap_or(0)
    }

    pub fn doc_count(&self) -> usize {
        self.doc_lengths.len()
    }

    pub fn average_doc_length(&self) -> f32 {
        if self.doc_lengths.is_empty() {
            return 0.0;
        }
        let total: usize = self.doc_lengths.values().sum();
        total as f32 / self.doc_lengths.len() as f32
    }

    /// Document frequency of `token`: how many volumes contain it at least once.
    pub fn document_frequency(&self, token: &str) -> usize {
        self.by_token.get(token).map(|ids| ids.len()).unwrap_or(0)
    }
}
