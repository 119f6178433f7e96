//! The vector store engine (spec §4.9): owns the volumes, all indexes,
//! access stats, the adaptive learner, and the write lock / save chain
//! that serialize mutations and persistence.
//!
//! Two orthogonal `tokio::sync::Mutex<()>` chains give the ordering
//! guarantees spec §5 asks for without a hand-rolled queue: `write_lock`
//! serializes whole mutation sequences (so duplicate-check-then-insert is
//! atomic across concurrent callers), `save_chain` serializes `save`
//! attempts so the flush timer and `dispose` never race each other. The
//! engine's owned state lives behind a `tokio::sync::RwLock` so readers
//! never observe a torn intermediate between the volume list and its
//! indexes.

use crate::config::{DuplicateBehavior, EngineConfig};
use crate::dedup::{check_duplicate, find_duplicate_groups, DuplicateGroup};
use crate::indexes::{tokenize, InvertedIndex, MagnitudeCache, MetadataIndex, TopicIndex};
use crate::learner::{Learner, LearningProfile};
use crate::recommend::{self, Candidate, Recommendation};
use crate::scoring::{
    bm25_score, compile_guarded_regex, cosine_similarity_with_magnitude, exact_score, fuzzy_ratio,
    normalize_scores, regex_score, substring_score, token_overlap_score,
};
use crate::storage::{StorageBackend, LEARNING_KEY};
use crate::volume::{now_ms, AccessStats, Volume};
use crate::{codec, VolumeStoreError};
use rayon::prelude::*;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

/// Which scorer `text_search`/`advanced_search` uses against a candidate's
/// `text` field. `Bm25` is the DSL's default plain-text mode; the others
/// correspond 1:1 to spec §4.3's five scorers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextSearchMode {
    Fuzzy,
    Substring,
    Exact,
    Regex,
    Token,
    Bm25,
}

/// One metadata predicate. `Equals`/`NotEquals` cover the DSL's
/// `metadata:k=v`; `Contains`/`Exists` are the "advanced predicates" spec
/// §1/§4.4 mention beyond flat equality.
#[derive(Debug, Clone)]
pub enum MetadataPredicate {
    Equals { key: String, value: String },
    NotEquals { key: String, value: String },
    Contains { key: String, substring: String },
    Exists { key: String },
}

impl MetadataPredicate {
    fn matches(&self, metadata: &HashMap<String, String>) -> bool {
        match self {
            MetadataPredicate::Equals { key, value } => metadata.get(key) == Some(value),
            MetadataPredicate::NotEquals { key, value } => metadata.get(key) != Some(value),
            MetadataPredicate::Contains { key, substring } => metadata
                .get(key)
                .map(|v| v.contains(substring.as_str()))
                .unwrap_or(false),
            MetadataPredicate::Exists { key } => metadata.contains_key(key),
        }
    }
}

/// A `text ∧ metadata ∧ date ∧ vector` query combined into one ranked
/// result set (spec §4.9 `advancedSearch`).
#[derive(Debug, Clone, Default)]
pub struct AdvancedSearchOptions<'a> {
    pub query_embedding: Option<&'a [f32]>,
    pub text: Option<(&'a str, TextSearchMode)>,
    pub metadata_filters: &'a [MetadataPredicate],
    pub topic_filter: &'a [String],
    pub date_after: Option<u64>,
    pub date_before: Option<u64>,
    pub min_score: f32,
    pub max_results: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AdvancedSubScores {
    pub vector: Option<f32>,
    pub text: Option<f32>,
}

#[derive(Debug, Clone)]
pub struct AdvancedResult {
    pub volume: Volume,
    pub score: f32,
    pub sub_scores: AdvancedSubScores,
}

/// Options for `recommend` (spec §4.6/§4.9).
#[derive(Debug, Clone, Default)]
pub struct RecommendOptions {
    pub query_embedding: Option<Vec<f32>>,
    pub weights: Option<crate::config::RecommendWeights>,
    pub min_score: Option<f32>,
    pub max_results: Option<usize>,
    /// Restrict candidates to these ids, or all volumes when empty.
    pub candidate_ids: Vec<Uuid>,
}

struct EngineState {
    volumes: HashMap<Uuid, Volume>,
    /// Insertion order, oldest first — used to break recommend/search ties
    /// deterministically (spec §8 S5: "tie-break by insertion order").
    order: Vec<Uuid>,
    access: HashMap<Uuid, AccessStats>,
    topic_index: TopicIndex,
    metadata_index: MetadataIndex,
    magnitude_cache: MagnitudeCache,
    inverted_index: InvertedIndex,
    learner: Learner,
}

impl EngineState {
    fn empty(config: &EngineConfig) -> Self {
        Self {
            volumes: HashMap::new(),
            order: Vec::new(),
            access: HashMap::new(),
            topic_index: TopicIndex::new(),
            metadata_index: MetadataIndex::new(),
            magnitude_cache: MagnitudeCache::new(),
            inverted_index: InvertedIndex::new(),
            learner: if config.learning_enabled {
                Learner::enabled(config.learner_ring_size, config.learner_rates)
            } else {
                Learner::disabled()
            },
        }
    }

    fn topic_of<'a>(&self, metadata: &'a HashMap<String, String>, default_topic: &'a str) -> String {
        metadata
            .get(crate::volume::TOPIC_KEY)
            .cloned()
            .unwrap_or_else(|| default_topic.to_string())
    }

    fn index_insert(&mut self, volume: &Volume, default_topic: &str) {
        let topic = self.topic_of(&volume.metadata, default_topic);
        self.topic_index.insert(&topic, volume.id);
        self.metadata_index.insert(&volume.metadata, volume.id);
        self.magnitude_cache.insert(volume.id, &volume.embedding);
        self.inverted_index.insert(volume.id, &volume.text);
    }

    fn index_remove(&mut self, volume: &Volume, default_topic: &str) {
        let topic = self.topic_of(&volume.metadata, default_topic);
        self.topic_index.remove(&topic, &volume.id);
        self.metadata_index.remove(&volume.metadata, &volume.id);
        self.magnitude_cache.remove(&volume.id);
        self.inverted_index.remove(&volume.id, &volume.text);
    }

    fn insert_volume(&mut self, volume: Volume, default_topic: &str) {
        self.index_insert(&volume, default_topic);
        self.order.push(volume.id);
        self.volumes.insert(volume.id, volume);
    }

    fn remove_volume(&mut self, id: &Uuid, default_topic: &str) -> Option<Volume> {
        let volume = self.volumes.remove(id)?;
        self.index_remove(&volume, default_topic);
        self.order.retain(|v| v != id);
        self.access.remove(id);
        Some(volume)
    }
}

/// Uninitialized / Ready / Closed (spec §4.9 state machine).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Uninitialized,
    Ready,
    Closed,
}

pub struct VolumeStoreEngine {
    config: EngineConfig,
    backend: Box<dyn StorageBackend>,
    state: RwLock<EngineState>,
    write_lock: Mutex<()>,
    save_chain: Mutex<()>,
    lifecycle: RwLock<Lifecycle>,
    dirty: AtomicBool,
    size: AtomicUsize,
    /// Owned background-flush-timer handle (spec §4.9/§5: "an owned resource
    /// released on `dispose`"). `None` until `spawn_flush_timer` arms it;
    /// a plain `std::sync::Mutex` suffices since it's only ever held for the
    /// duration of a field swap, never across an `.await`.
    flush_timer: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl VolumeStoreEngine {
    pub fn new(config: EngineConfig, backend: Box<dyn StorageBackend>) -> Self {
        let config = config.validated();
        Self {
            state: RwLock::new(EngineState::empty(&config)),
            config,
            backend,
            write_lock: Mutex::new(()),
            save_chain: Mutex::new(()),
            lifecycle: RwLock::new(Lifecycle::Uninitialized),
            dirty: AtomicBool::new(false),
            size: AtomicUsize::new(0),
            flush_timer: std::sync::Mutex::new(None),
        }
    }

    /// Lock-free read of the live volume count (spec §9: `size` is a
    /// read-only accessor that doesn't take the write lock).
    pub fn size(&self) -> usize {
        self.size.load(Ordering::Acquire)
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    async fn ensure_ready(&self) -> Result<(), VolumeStoreError> {
        if *self.lifecycle.read().await != Lifecycle::Ready {
            return Err(VolumeStoreError::NotLoaded);
        }
        Ok(())
    }

    /// Idempotent. Concurrent callers racing `load` all observe the same
    /// end state because the write lock serializes them; a second caller
    /// arriving after the first succeeded just re-reads an already-Ready
    /// store's entries, which is harmless (same keys, same bytes).
    pub async fn load(&self) -> Result<(), VolumeStoreError> {
        let _guard = self.write_lock.lock().await;
        if *self.lifecycle.read().await == Lifecycle::Ready {
            return Ok(());
        }

        let raw = self
            .backend
            .load()
            .await
            .map_err(|e| VolumeStoreError::Corruption(e.to_string()))?;

        let mut state = EngineState::empty(&self.config);
        let mut corruption_count = 0u64;
        let mut any_corrupt = false;

        let mut learner_bytes = None;
        let mut entries: Vec<(String, Vec<u8>)> = Vec::new();
        for (key, bytes) in raw {
            if key == LEARNING_KEY {
                learner_bytes = Some(bytes);
            } else {
                entries.push((key, bytes));
            }
        }

        for (key, bytes) in entries {
            let id = match key.parse::<Uuid>() {
                Ok(id) => id,
                Err(_) => {
                    tracing::warn!(key = %key, "skipping storage key that isn't a volume id");
                    corruption_count += 1;
                    any_corrupt = true;
                    continue;
                }
            };
            match codec::decode_record(id, &bytes) {
                Ok((volume, access)) => {
                    state.insert_volume(volume, &self.config.default_topic);
                    if access != AccessStats::default() {
                        state.access.insert(id, access);
                    }
                }
                Err(e) => {
                    tracing::warn!(id = %id, error = %e, "skipping corrupt volume record during load");
                    corruption_count += 1;
                    any_corrupt = true;
                }
            }
        }

        if let Some(bytes) = learner_bytes {
            match serde_json::from_slice::<crate::learner::EnabledState>(&bytes) {
                Ok(learner_state) if self.config.learning_enabled => {
                    state.learner = Learner::from_state(
                        learner_state,
                        self.config.learner_ring_size,
                        self.config.learner_rates,
                    );
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "skipping corrupt learning snapshot during load");
                    any_corrupt = true;
                }
            }
        }

        let valid_ids: HashSet<Uuid> = state.volumes.keys().copied().collect();
        state.learner.prune_entries(&valid_ids);

        if corruption_count > 0 {
            tracing::warn!(count = corruption_count, "load encountered corrupt records");
        }

        self.size.store(state.volumes.len(), Ordering::Release);
        *self.state.write().await = state;
        *self.lifecycle.write().await = Lifecycle::Ready;
        self.dirty.store(any_corrupt, Ordering::Release);

        Ok(())
    }

    /// Serialize the live state and hand it to the backend. A failed save
    /// leaves `dirty` set so the next call (manual or via the flush timer)
    /// retries (spec §4.9 "Save chain").
    pub async fn save(&self) -> Result<(), VolumeStoreError> {
        self.ensure_ready().await?;
        let _guard = self.save_chain.lock().await;

        let mut entries = HashMap::new();
        {
            let state = self.state.read().await;
            for (id, volume) in &state.volumes {
                let access = state.access.get(id).copied().unwrap_or_default();
                entries.insert(id.to_string(), codec::encode_record(volume, access));
            }
            if let Some(learner_state) = state.learner.snapshot_state() {
                if let Ok(bytes) = serde_json::to_vec(&learner_state) {
                    entries.insert(LEARNING_KEY.to_string(), bytes);
                }
            }
        }

        match self.backend.save(entries).await {
            Ok(()) => {
                self.dirty.store(false, Ordering::Release);
                Ok(())
            }
            Err(e) => {
                // dirty stays set; caller (or the flush timer) will retry.
                Err(VolumeStoreError::Transient(e.to_string()))
            }
        }
    }

    /// Arm the background flush timer (spec §4.9: "armed iff
    /// `autoSave=false ∧ flushIntervalMs>0 ∧ initialized`"). A no-op when
    /// the config doesn't meet that condition or a timer is already armed.
    ///
    /// Takes `Arc<Self>` because the spawned task holds a strong reference
    /// across ticks for the engine's lifetime; embedders that want periodic
    /// background flushing construct the engine behind an `Arc` (as
    /// [`crate::facade::VolumeLibrary`] does) and call this once after
    /// `load()` succeeds. Timer ticks never propagate errors to a caller —
    /// a failed background flush only logs (spec §7 "background flush
    /// failures log only").
    pub fn spawn_flush_timer(self: &Arc<Self>) {
        if self.config.auto_save || self.config.flush_interval_ms == 0 {
            return;
        }
        let mut slot = self.flush_timer.lock().expect("flush timer mutex poisoned");
        if slot.is_some() {
            return;
        }
        let engine = Arc::clone(self);
        let period = std::time::Duration::from_millis(self.config.flush_interval_ms);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await; // first tick fires immediately; skip it
            loop {
                interval.tick().await;
                if engine.is_dirty() {
                    if let Err(e) = engine.save().await {
                        tracing::warn!(error = %e, "background flush failed");
                    }
                }
            }
        });
        *slot = Some(handle);
    }

    /// Drain the write lock, await the save chain, then run one final save
    /// if dirty (spec §4.9). Also releases the flush timer, if armed — it's
    /// an owned resource per spec §5's "Resource discipline".
    pub async fn dispose(&self) -> Result<(), VolumeStoreError> {
        if let Some(handle) = self.flush_timer.lock().expect("flush timer mutex poisoned").take() {
            handle.abort();
        }
        {
            let _write_guard = self.write_lock.lock().await;
        }
        {
            let _save_guard = self.save_chain.lock().await;
        }
        if self.is_dirty() {
            self.save().await?;
        }
        self.backend
            .close()
            .await
            .map_err(|e| VolumeStoreError::Transient(e.to_string()))?;
        *self.lifecycle.write().await = Lifecycle::Closed;
        Ok(())
    }

    async fn after_mutation(&self) {
        self.dirty.store(true, Ordering::Release);
        if self.config.auto_save {
            if let Err(e) = self.save().await {
                tracing::warn!(error = %e, "auto-save failed after mutation");
            }
        }
    }

    /// Insert one volume. Duplicate detection (when
    /// `config.duplicate_threshold > 0`) runs inside the write lock so two
    /// concurrent `add`s can never both observe "no duplicate" and insert
    /// twins (spec §4.9 "Duplicate detection policy").
    pub async fn add(
        &self,
        text: String,
        embedding: Vec<f32>,
        metadata: HashMap<String, String>,
    ) -> Result<Uuid, VolumeStoreError> {
        if text.is_empty() {
            return Err(VolumeStoreError::EmptyText);
        }
        if embedding.is_empty() {
            return Err(VolumeStoreError::EmptyEmbedding);
        }
        self.ensure_ready().await?;

        let _guard = self.write_lock.lock().await;
        let id = {
            let mut state = self.state.write().await;
            if self.config.duplicate_threshold > 0.0 {
                let candidates = state
                    .order
                    .iter()
                    .map(|id| (*id, state.volumes[id].embedding.clone()));
                if let Some(hit) = check_duplicate(&embedding, candidates, self.config.duplicate_threshold) {
                    match self.config.duplicate_behavior {
                        DuplicateBehavior::Skip => return Ok(hit.existing_id),
                        DuplicateBehavior::Warn => {
                            tracing::warn!(
                                existing_id = %hit.existing_id,
                                similarity = hit.similarity,
                                "inserting near-duplicate volume"
                            );
                        }
                        DuplicateBehavior::Error => {
                            return Err(VolumeStoreError::Duplicate {
                                existing_id: hit.existing_id,
                                similarity: hit.similarity,
                            })
                        }
                    }
                }
            }

            let volume = Volume::new(text, embedding, metadata);
            let id = volume.id;
            state.insert_volume(volume, &self.config.default_topic);
            self.size.store(state.volumes.len(), Ordering::Release);
            id
        };
        self.after_mutation().await;
        Ok(id)
    }

    /// All-or-nothing: every item is staged and duplicate-checked (against
    /// both already-committed volumes and earlier items in this same batch)
    /// before any of them touch `state`. A duplicate-as-error anywhere in
    /// the batch returns without ever mutating `state`, so `size()` and
    /// `get_all()` both still reflect exactly what existed before the call.
    pub async fn add_batch(
        &self,
        items: Vec<(String, Vec<f32>, HashMap<String, String>)>,
    ) -> Result<Vec<Uuid>, VolumeStoreError> {
        for (text, embedding, _) in &items {
            if text.is_empty() {
                return Err(VolumeStoreError::EmptyText);
            }
            if embedding.is_empty() {
                return Err(VolumeStoreError::EmptyEmbedding);
            }
        }
        self.ensure_ready().await?;

        enum Staged {
            Insert(Volume),
            Existing(Uuid),
        }

        let _guard = self.write_lock.lock().await;
        let ids = {
            let mut state = self.state.write().await;

            // Staging pass: no call here may mutate `state`.
            let mut staged = Vec::with_capacity(items.len());
            let mut pending: Vec<(Uuid, Vec<f32>)> = Vec::new();
            for (text, embedding, metadata) in items {
                if self.config.duplicate_threshold > 0.0 {
                    let candidates = state
                        .order
                        .iter()
                        .map(|id| (*id, state.volumes[id].embedding.clone()))
                        .chain(pending.iter().cloned());
                    if let Some(hit) =
                        check_duplicate(&embedding, candidates, self.config.duplicate_threshold)
                    {
                        match self.config.duplicate_behavior {
                            DuplicateBehavior::Skip => {
                                staged.push(Staged::Existing(hit.existing_id));
                                continue;
                            }
                            DuplicateBehavior::Warn => {
                                tracing::warn!(
                                    existing_id = %hit.existing_id,
                                    similarity = hit.similarity,
                                    "inserting near-duplicate volume in batch"
                                );
                            }
                            DuplicateBehavior::Error => {
                                return Err(VolumeStoreError::Duplicate {
                                    existing_id: hit.existing_id,
                                    similarity: hit.similarity,
                                })
                            }
                        }
                    }
                }
                let volume = Volume::new(text, embedding, metadata);
                pending.push((volume.id, volume.embedding.clone()));
                staged.push(Staged::Insert(volume));
            }

            // Commit pass: the whole batch validated, so every staged item
            // is now inserted unconditionally.
            let mut ids = Vec::with_capacity(staged.len());
            for item in staged {
                match item {
                    Staged::Insert(volume) => {
                        let id = volume.id;
                        state.insert_volume(volume, &self.config.default_topic);
                        ids.push(id);
                    }
                    Staged::Existing(id) => ids.push(id),
                }
            }
            self.size.store(state.volumes.len(), Ordering::Release);
            ids
        };
        self.after_mutation().await;
        Ok(ids)
    }

    pub async fn delete(&self, id: Uuid) -> Result<bool, VolumeStoreError> {
        self.ensure_ready().await?;
        let _guard = self.write_lock.lock().await;
        let removed = {
            let mut state = self.state.write().await;
            let removed = state.remove_volume(&id, &self.config.default_topic).is_some();
            self.size.store(state.volumes.len(), Ordering::Release);
            removed
        };
        self.after_mutation().await;
        Ok(removed)
    }

    pub async fn delete_batch(&self, ids: &[Uuid]) -> Result<usize, VolumeStoreError> {
        self.ensure_ready().await?;
        let _guard = self.write_lock.lock().await;
        let count = {
            let mut state = self.state.write().await;
            let mut count = 0;
            for id in ids {
                if state.remove_volume(id, &self.config.default_topic).is_some() {
                    count += 1;
                }
            }
            self.size.store(state.volumes.len(), Ordering::Release);
            count
        };
        self.after_mutation().await;
        Ok(count)
    }

    pub async fn clear(&self) -> Result<(), VolumeStoreError> {
        self.ensure_ready().await?;
        let _guard = self.write_lock.lock().await;
        {
            let mut state = self.state.write().await;
            *state = EngineState::empty(&self.config);
            self.size.store(0, Ordering::Release);
        }
        self.after_mutation().await;
        Ok(())
    }

    /// Cosine-similarity search, descending, truncated to `max_results`.
    /// Every returned result's access stats are incremented (spec §3
    /// "Access stats").
    pub async fn search(
        &self,
        query_embedding: &[f32],
        max_results: usize,
        threshold: f32,
    ) -> Result<Vec<(Volume, f32)>, VolumeStoreError> {
        self.ensure_ready().await?;
        let now = now_ms();
        let mut state = self.state.write().await;

        // Brute-force cosine scan, parallelized the way the teacher's
        // `hybrid_search` fans per-entry scoring out across `rayon` rather
        // than scanning single-threaded.
        let mut scored: Vec<(Uuid, f32)> = state
            .order
            .par_iter()
            .filter_map(|id| {
                let volume = &state.volumes[id];
                let mag = state.magnitude_cache.get(id)?;
                let score = cosine_similarity_with_magnitude(query_embedding, mag, &volume.embedding);
                (score >= threshold).then_some((*id, score))
            })
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(max_results);

        let ids: Vec<Uuid> = scored.iter().map(|(id, _)| *id).collect();
        for id in &ids {
            state.access.entry(*id).or_default().record_access(now);
        }
        state.learner.observe_search(query_embedding, &ids, now);

        Ok(scored
            .into_iter()
            .map(|(id, score)| (state.volumes[&id].clone(), score))
            .collect())
    }

    fn text_clause_score(mode: TextSearchMode, query: &str, volume: &Volume, index: &InvertedIndex, max_regex_len: usize) -> f32 {
        match mode {
            TextSearchMode::Fuzzy => fuzzy_ratio(query, &volume.text),
            TextSearchMode::Substring => substring_score(query, &volume.text),
            TextSearchMode::Exact => exact_score(query, &volume.text),
            TextSearchMode::Token => token_overlap_score(query, &volume.text),
            TextSearchMode::Regex => match compile_guarded_regex(query, max_regex_len) {
                Ok(re) => regex_score(&re, &volume.text),
                Err(e) => {
                    tracing::warn!(error = %e, pattern = query, "rejecting regex search pattern");
                    0.0
                }
            },
            TextSearchMode::Bm25 => bm25_score(query, &volume.id, index),
        }
    }

    /// Lexical search over volume text. Does **not** touch access stats
    /// (spec §3: plain text search never increments them).
    pub async fn text_search(
        &self,
        query: &str,
        mode: TextSearchMode,
        threshold: f32,
    ) -> Result<Vec<(Volume, f32)>, VolumeStoreError> {
        self.ensure_ready().await?;
        let state = self.state.read().await;

        // BM25's raw scores are unbounded; score everything first, then
        // min-max normalize before thresholding.
        if mode == TextSearchMode::Bm25 {
            let candidate_ids: HashSet<Uuid> = tokenize(query)
                .iter()
                .flat_map(|t| state.inverted_index.ids_for_token(t))
                .collect();
            let raw: HashMap<Uuid, f32> = candidate_ids
                .iter()
                .map(|id| (*id, bm25_score(query, id, &state.inverted_index)))
                .collect();
            let normalized = normalize_scores(&raw);
            let mut results: Vec<(Volume, f32)> = normalized
                .into_iter()
                .filter(|(_, score)| *score >= threshold)
                .map(|(id, score)| (state.volumes[&id].clone(), score))
                .collect();
            results.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
            return Ok(results);
        }

        let mut results: Vec<(Volume, f32)> = state
            .order
            .iter()
            .map(|id| &state.volumes[id])
            .map(|v| {
                let score = Self::text_clause_score(
                    mode,
                    query,
                    v,
                    &state.inverted_index,
                    self.config.max_regex_pattern_length,
                );
                (v.clone(), score)
            })
            .filter(|(_, score)| *score >= threshold)
            .collect();
        results.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        Ok(results)
    }

    pub async fn filter_by_metadata(
        &self,
        predicates: &[MetadataPredicate],
    ) -> Result<Vec<Volume>, VolumeStoreError> {
        self.ensure_ready().await?;
        let state = self.state.read().await;

        // Fast path: a single `Equals` predicate can use the metadata index
        // directly instead of scanning every volume.
        if let [MetadataPredicate::Equals { key, value }] = predicates {
            return Ok(state
                .metadata_index
                .ids_for(key, value)
                .into_iter()
                .map(|id| state.volumes[&id].clone())
                .collect());
        }

        Ok(state
            .order
            .iter()
            .map(|id| &state.volumes[id])
            .filter(|v| predicates.iter().all(|p| p.matches(&v.metadata)))
            .cloned()
            .collect())
    }

    pub async fn filter_by_date_range(
        &self,
        after: Option<u64>,
        before: Option<u64>,
    ) -> Result<Vec<Volume>, VolumeStoreError> {
        self.ensure_ready().await?;
        let state = self.state.read().await;
        Ok(state
            .order
            .iter()
            .map(|id| &state.volumes[id])
            .filter(|v| after.map(|a| v.timestamp >= a).unwrap_or(true))
            .filter(|v| before.map(|b| v.timestamp <= b).unwrap_or(true))
            .cloned()
            .collect())
    }

    pub async fn filter_by_topic(&self, topics: &[String]) -> Result<Vec<Volume>, VolumeStoreError> {
        self.ensure_ready().await?;
        let state = self.state.read().await;
        let ids: HashSet<Uuid> = topics
            .iter()
            .flat_map(|t| state.topic_index.ids_for(t))
            .collect();
        Ok(state
            .order
            .iter()
            .filter(|id| ids.contains(id))
            .map(|id| state.volumes[id].clone())
            .collect())
    }

    pub async fn get_topics(&self) -> Result<Vec<String>, VolumeStoreError> {
        self.ensure_ready().await?;
        Ok(self.state.read().await.topic_index.all_topics())
    }

    pub async fn get_all(&self) -> Result<Vec<Volume>, VolumeStoreError> {
        self.ensure_ready().await?;
        let state = self.state.read().await;
        Ok(state.order.iter().map(|id| state.volumes[id].clone()).collect())
    }

    /// Increments access stats (spec §3: direct get-by-id counts as access).
    pub async fn get_by_id(&self, id: Uuid) -> Result<Option<Volume>, VolumeStoreError> {
        self.ensure_ready().await?;
        let mut state = self.state.write().await;
        let volume = state.volumes.get(&id).cloned();
        if volume.is_some() {
            let now = now_ms();
            state.access.entry(id).or_default().record_access(now);
        }
        Ok(volume)
    }

    /// Combined vector + text + metadata + date + topic search (spec §4.9
    /// `advancedSearch`). Increments access stats like `search` does, since
    /// it's cosine-backed whenever a query embedding is present.
    pub async fn advanced_search(
        &self,
        opts: AdvancedSearchOptions<'_>,
    ) -> Result<Vec<AdvancedResult>, VolumeStoreError> {
        self.ensure_ready().await?;
        let now = now_ms();
        let mut state = self.state.write().await;

        let topic_ids: Option<HashSet<Uuid>> = if opts.topic_filter.is_empty() {
            None
        } else {
            Some(
                opts.topic_filter
                    .iter()
                    .flat_map(|t| state.topic_index.ids_for(t))
                    .collect(),
            )
        };

        // BM25's raw scores are unbounded (spec §4.3: "min-max normalized
        // per-query before combining"), so precompute the normalized map the
        // same way `text_search` does rather than averaging a raw BM25 score
        // directly against a vector score in [0, 1].
        let normalized_bm25: Option<HashMap<Uuid, f32>> = match opts.text {
            Some((query, TextSearchMode::Bm25)) => {
                let candidate_ids: HashSet<Uuid> = tokenize(query)
                    .iter()
                    .flat_map(|t| state.inverted_index.ids_for_token(t))
                    .collect();
                let raw: HashMap<Uuid, f32> = candidate_ids
                    .iter()
                    .map(|id| (*id, bm25_score(query, id, &state.inverted_index)))
                    .collect();
                Some(normalize_scores(&raw))
            }
            _ => None,
        };

        let mut out = Vec::new();
        for id in state.order.clone() {
            let volume = state.volumes[&id].clone();

            if let Some(ids) = &topic_ids {
                if !ids.contains(&id) {
                    continue;
                }
            }
            if !opts.metadata_filters.iter().all(|p| p.matches(&volume.metadata)) {
                continue;
            }
            if let Some(after) = opts.date_after {
                if volume.timestamp < after {
                    continue;
                }
            }
            if let Some(before) = opts.date_before {
                if volume.timestamp > before {
                    continue;
                }
            }

            let vector_score = opts.query_embedding.map(|q| {
                let mag = state.magnitude_cache.get(&id).unwrap_or(0.0);
                cosine_similarity_with_magnitude(q, mag, &volume.embedding)
            });
            let text_score = opts.text.map(|(query, mode)| match (&normalized_bm25, mode) {
                (Some(normalized), TextSearchMode::Bm25) => normalized.get(&id).copied().unwrap_or(0.0),
                _ => Self::text_clause_score(mode, query, &volume, &state.inverted_index, self.config.max_regex_pattern_length),
            });

            let components: Vec<f32> = [vector_score, text_score].into_iter().flatten().collect();
            if components.is_empty() {
                continue;
            }
            let score = components.iter().sum::<f32>() / components.len() as f32;
            if score < opts.min_score {
                continue;
            }

            out.push(AdvancedResult {
                volume,
                score,
                sub_scores: AdvancedSubScores {
                    vector: vector_score,
                    text: text_score,
                },
            });
        }

        out.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        if opts.max_results > 0 {
            out.truncate(opts.max_results);
        }

        if opts.query_embedding.is_some() {
            let ids: Vec<Uuid> = out.iter().map(|r| r.volume.id).collect();
            for id in &ids {
                state.access.entry(*id).or_default().record_access(now);
            }
            if let Some(q) = opts.query_embedding {
                state.learner.observe_search(q, &ids, now);
            }
        }

        Ok(out)
    }

    /// Blended recommendation score (spec §4.6). Never touches access
    /// stats (spec §3: "Not incremented by recommend").
    pub async fn recommend(&self, opts: RecommendOptions) -> Result<Vec<Recommendation>, VolumeStoreError> {
        self.ensure_ready().await?;
        let now = now_ms();
        let state = self.state.read().await;

        let ids: Vec<Uuid> = if opts.candidate_ids.is_empty() {
            state.order.clone()
        } else {
            opts.candidate_ids.clone()
        };
        let volumes: Vec<&Volume> = ids.iter().filter_map(|id| state.volumes.get(id)).collect();

        let weights = opts.weights.unwrap_or(self.config.recommend_weights);
        let weights = state.learner.adapted_weights(weights);

        let candidates: Vec<Candidate> = volumes
            .iter()
            .map(|v| Candidate {
                volume: v,
                access: state.access.get(&v.id).copied(),
                boost: opts
                    .query_embedding
                    .as_ref()
                    .map(|q| state.learner.compute_boost(v.id, q))
                    .unwrap_or(1.0),
            })
            .collect();

        Ok(recommend::recommend(
            &candidates,
            opts.query_embedding.as_deref(),
            weights,
            self.config.recency_half_life_ms,
            opts.min_score.unwrap_or(self.config.recommend_min_score),
            opts.max_results.unwrap_or(self.config.default_max_results),
            now,
        ))
    }

    pub async fn find_duplicates(&self, threshold: Option<f32>) -> Result<Vec<DuplicateGroup>, VolumeStoreError> {
        self.ensure_ready().await?;
        let state = self.state.read().await;
        let volumes: Vec<Volume> = state.order.iter().map(|id| state.volumes[id].clone()).collect();
        let threshold = threshold.unwrap_or(self.config.duplicate_threshold);
        Ok(find_duplicate_groups(&volumes, threshold))
    }

    pub async fn check_duplicate(
        &self,
        embedding: &[f32],
    ) -> Result<Option<crate::dedup::DuplicateMatch>, VolumeStoreError> {
        self.ensure_ready().await?;
        let state = self.state.read().await;
        let threshold = if self.config.duplicate_threshold > 0.0 {
            self.config.duplicate_threshold
        } else {
            return Ok(None);
        };
        let candidates = state
            .order
            .iter()
            .map(|id| (*id, state.volumes[id].embedding.clone()));
        Ok(check_duplicate(embedding, candidates, threshold))
    }

    pub async fn learning_profile(&self) -> LearningProfile {
        self.state.read().await.learner.profile()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryBackend;

    fn engine(config: EngineConfig) -> VolumeStoreEngine {
        VolumeStoreEngine::new(config, Box::new(MemoryBackend::new()))
    }

    #[tokio::test]
    async fn flush_timer_is_not_armed_when_auto_save_is_on() {
        let engine = Arc::new(engine(EngineConfig::default()));
        engine.load().await.unwrap();
        engine.spawn_flush_timer();
        assert!(engine.flush_timer.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn flush_timer_periodically_saves_dirty_state() {
        let mut config = EngineConfig::default();
        config.auto_save = false;
        config.flush_interval_ms = 20;
        let engine = Arc::new(engine(config));
        engine.load().await.unwrap();
        engine.spawn_flush_timer();

        engine.add("x".into(), vec![1.0], HashMap::new()).await.unwrap();
        assert!(engine.is_dirty(), "auto_save disabled: add must not save inline");

        tokio::time::sleep(std::time::Duration::from_millis(120)).await;
        assert!(!engine.is_dirty(), "flush timer should have saved the dirty state");

        engine.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn ops_before_load_return_not_loaded() {
        let engine = engine(EngineConfig::default());
        let err = engine.add("x".into(), vec![1.0], HashMap::new()).await;
        assert!(matches!(err, Err(VolumeStoreError::NotLoaded)));
    }

    #[tokio::test]
    async fn add_then_search_s1() {
        let engine = engine(EngineConfig::default());
        engine.load().await.unwrap();

        let mut meta_a = HashMap::new();
        meta_a.insert("topic".to_string(), "a".to_string());
        engine.add("alpha".into(), vec![1.0, 0.0], meta_a).await.unwrap();

        let mut meta_b = HashMap::new();
        meta_b.insert("topic".to_string(), "b".to_string());
        engine.add("beta".into(), vec![0.0, 1.0], meta_b).await.unwrap();

        let all = engine.search(&[1.0, 0.0], 2, 0.0).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].0.text, "alpha");
        assert!((all[0].1 - 1.0).abs() < 1e-6);
        assert!((all[1].1 - 0.0).abs() < 1e-6);

        let filtered = engine.search(&[1.0, 0.0], 2, 0.5).await.unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].0.text, "alpha");
    }

    #[tokio::test]
    async fn dedup_skip_s2() {
        let mut config = EngineConfig::default();
        config.duplicate_threshold = 0.99;
        config.duplicate_behavior = DuplicateBehavior::Skip;
        let engine = engine(config);
        engine.load().await.unwrap();

        let first = engine.add("x".into(), vec![1.0, 0.0], HashMap::new()).await.unwrap();
        let second = engine.add("y".into(), vec![1.0, 0.0], HashMap::new()).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(engine.size(), 1);
    }

    #[tokio::test]
    async fn dedup_error_leaves_no_partial_batch_insert() {
        let mut config = EngineConfig::default();
        config.duplicate_threshold = 0.99;
        config.duplicate_behavior = DuplicateBehavior::Error;
        let engine = engine(config);
        engine.load().await.unwrap();
        engine.add("x".into(), vec![1.0, 0.0], HashMap::new()).await.unwrap();

        let result = engine
            .add_batch(vec![
                ("new".into(), vec![0.0, 1.0], HashMap::new()),
                ("dup".into(), vec![1.0, 0.0], HashMap::new()),
            ])
            .await;
        assert!(matches!(result, Err(VolumeStoreError::Duplicate { .. })));
        assert_eq!(engine.size(), 1);
        assert_eq!(engine.get_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn topic_filter_s3() {
        let engine = engine(EngineConfig::default());
        engine.load().await.unwrap();

        for (text, topic) in [("a", "proj/a"), ("b", "proj/b"), ("c", "other")] {
            let mut meta = HashMap::new();
            meta.insert("topic".to_string(), topic.to_string());
            engine.add(text.into(), vec![1.0], meta).await.unwrap();
        }

        let results = engine.filter_by_topic(&["proj/a".to_string()]).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].text, "a");
    }

    #[tokio::test]
    async fn check_duplicate_matches_self_at_similarity_one_s5() {
        let mut config = EngineConfig::default();
        config.duplicate_threshold = 0.5;
        let engine = engine(config);
        engine.load().await.unwrap();
        engine.add("x".into(), vec![1.0, 2.0, 3.0], HashMap::new()).await.unwrap();

        let hit = engine.check_duplicate(&[1.0, 2.0, 3.0]).await.unwrap().unwrap();
        assert!((hit.similarity - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn clear_then_save_then_reload_is_empty() {
        let engine = engine(EngineConfig::default());
        engine.load().await.unwrap();
        engine.add("x".into(), vec![1.0], HashMap::new()).await.unwrap();
        engine.clear().await.unwrap();
        engine.save().await.unwrap();

        assert_eq!(engine.size(), 0);
        assert!(engine.get_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn plain_text_search_does_not_touch_access_stats() {
        let engine = engine(EngineConfig::default());
        engine.load().await.unwrap();
        let id = engine.add("hello world".into(), vec![1.0], HashMap::new()).await.unwrap();

        engine
            .text_search("hello", TextSearchMode::Substring, 0.0)
            .await
            .unwrap();

        let recs = engine
            .recommend(RecommendOptions {
                query_embedding: None,
                weights: Some(crate::config::RecommendWeights {
                    vector: 0.0,
                    recency: 0.0,
                    frequency: 1.0,
                }),
                min_score: Some(0.0),
                max_results: Some(10),
                candidate_ids: vec![id],
            })
            .await
            .unwrap();
        assert_eq!(recs[0].sub_scores.frequency, 0.0, "text search must not bump access stats");
    }

    #[tokio::test]
    async fn get_by_id_increments_access_stats() {
        let engine = engine(EngineConfig::default());
        engine.load().await.unwrap();
        let id = engine.add("hello".into(), vec![1.0], HashMap::new()).await.unwrap();
        engine.get_by_id(id).await.unwrap();
        engine.get_by_id(id).await.unwrap();

        let recs = engine
            .recommend(RecommendOptions {
                query_embedding: None,
                weights: Some(crate::config::RecommendWeights {
                    vector: 0.0,
                    recency: 0.0,
                    frequency: 1.0,
                }),
                min_score: Some(0.0),
                max_results: Some(10),
                candidate_ids: vec![id],
            })
            .await
            .unwrap();
        assert_eq!(recs[0].sub_scores.frequency, 1.0);
    }

    #[tokio::test]
    async fn metadata_equality_filter_uses_index_fast_path() {
        let engine = engine(EngineConfig::default());
        engine.load().await.unwrap();
        let mut meta = HashMap::new();
        meta.insert("pri".to_string(), "high".to_string());
        engine.add("urgent".into(), vec![1.0], meta).await.unwrap();
        engine.add("calm".into(), vec![1.0], HashMap::new()).await.unwrap();

        let results = engine
            .filter_by_metadata(&[MetadataPredicate::Equals {
                key: "pri".to_string(),
                value: "high".to_string(),
            }])
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].text, "urgent");
    }

    #[tokio::test]
    async fn advanced_search_combines_vector_and_text_and_respects_filters() {
        let engine = engine(EngineConfig::default());
        engine.load().await.unwrap();

        let mut meta_a = HashMap::new();
        meta_a.insert("topic".to_string(), "work".to_string());
        meta_a.insert("pri".to_string(), "high".to_string());
        engine.add("urgent login bug".into(), vec![1.0, 0.0], meta_a).await.unwrap();

        let mut meta_b = HashMap::new();
        meta_b.insert("topic".to_string(), "personal".to_string());
        engine.add("grocery list".into(), vec![0.0, 1.0], meta_b).await.unwrap();

        let topic_filter = vec!["work".to_string()];
        let results = engine
            .advanced_search(AdvancedSearchOptions {
                query_embedding: Some(&[1.0, 0.0]),
                text: Some(("urgent login bug", TextSearchMode::Bm25)),
                topic_filter: &topic_filter,
                max_results: 10,
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(results.len(), 1, "topic filter must exclude the personal volume");
        assert_eq!(results[0].volume.text, "urgent login bug");
        assert!(results[0].sub_scores.vector.unwrap() > 0.9);
        assert!(results[0].sub_scores.text.unwrap() > 0.0);
    }

    #[tokio::test]
    async fn advanced_search_bm25_text_score_is_normalized_into_unit_range() {
        let engine = engine(EngineConfig::default());
        engine.load().await.unwrap();
        engine.add("the quick brown fox jumps".into(), vec![1.0], HashMap::new()).await.unwrap();
        engine.add("a slow turtle creeps".into(), vec![1.0], HashMap::new()).await.unwrap();
        engine.add("fox fox fox everywhere fox".into(), vec![1.0], HashMap::new()).await.unwrap();

        let results = engine
            .advanced_search(AdvancedSearchOptions {
                text: Some(("fox", TextSearchMode::Bm25)),
                max_results: 10,
                ..Default::default()
            })
            .await
            .unwrap();

        for r in &results {
            let text_score = r.sub_scores.text.expect("bm25 clause must produce a text sub-score");
            assert!((0.0..=1.0).contains(&text_score), "bm25 score must be min-max normalized into [0, 1], got {text_score}");
        }
    }

    #[tokio::test]
    async fn advanced_search_date_range_excludes_out_of_range_volumes() {
        let engine = engine(EngineConfig::default());
        engine.load().await.unwrap();
        let id = engine.add("x".into(), vec![1.0], HashMap::new()).await.unwrap();
        let volume = engine.get_by_id(id).await.unwrap().unwrap();

        let results = engine
            .advanced_search(AdvancedSearchOptions {
                text: Some(("x", TextSearchMode::Exact)),
                date_after: Some(volume.timestamp + 1),
                max_results: 10,
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(results.is_empty(), "a date_after past the volume's timestamp must exclude it");
    }

    #[tokio::test]
    async fn advanced_search_with_vector_component_increments_access_stats() {
        let engine = engine(EngineConfig::default());
        engine.load().await.unwrap();
        let id = engine.add("hello".into(), vec![1.0], HashMap::new()).await.unwrap();

        engine
            .advanced_search(AdvancedSearchOptions {
                query_embedding: Some(&[1.0]),
                max_results: 10,
                ..Default::default()
            })
            .await
            .unwrap();

        let recs = engine
            .recommend(RecommendOptions {
                query_embedding: None,
                weights: Some(crate::config::RecommendWeights {
                    vector: 0.0,
                    recency: 0.0,
                    frequency: 1.0,
                }),
                min_score: Some(0.0),
                max_results: Some(10),
                candidate_ids: vec![id],
            })
            .await
            .unwrap();
        assert_eq!(recs[0].sub_scores.frequency, 1.0, "advanced_search's vector component must bump access stats");
    }
}
