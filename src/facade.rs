//! Library facade (spec §4.10 / C10): the thin orchestration layer an
//! embedder actually talks to. It knows how to call an embedding provider
//! and a text-generation provider; all storage semantics live in
//! [`crate::engine::VolumeStoreEngine`], which it just forwards to.

use crate::config::EngineConfig;
use crate::dedup::DuplicateGroup;
use crate::engine::{
    AdvancedResult, AdvancedSearchOptions, MetadataPredicate, RecommendOptions, TextSearchMode,
    VolumeStoreEngine,
};
use crate::learner::LearningProfile;
use crate::recommend::Recommendation;
use crate::storage::StorageBackend;
use crate::volume::Volume;
use crate::VolumeStoreError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// External embedding collaborator (spec §6): `embed(text|text[]) -> f32[][]`.
/// The engine is agnostic to dimension; every embedding handed to one store
/// must share a dimension for cosine to be meaningful.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, VolumeStoreError>;

    async fn embed_one(&self, text: &str) -> Result<Vec<f32>, VolumeStoreError> {
        let mut out = self.embed(std::slice::from_ref(&text.to_string())).await?;
        Ok(out.pop().unwrap_or_default())
    }
}

/// External text-generation collaborator (spec §6), used only by
/// `compendium` and optional auto-summarization: `generate(prompt) -> text`.
#[async_trait]
pub trait TextGenerationProvider: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String, VolumeStoreError>;
}

/// Options for `compendium` (spec §4.10).
#[derive(Debug, Clone, Default)]
pub struct CompendiumOptions {
    pub delete_originals: bool,
    pub extra_metadata: HashMap<String, String>,
}

/// Reserved metadata key on a compendium volume listing its source ids,
/// comma-joined. See spec §9 "Compendium cyclicity": this is a reference,
/// not ownership — a dangling entry after the sources are deleted is by
/// design, there is no back-pointer.
pub const SOURCE_IDS_KEY: &str = "sourceIds";
pub const COMPENDIUM_TOPIC: &str = "compendium";

pub struct VolumeLibrary {
    engine: Arc<VolumeStoreEngine>,
    embedder: Box<dyn EmbeddingProvider>,
    generator: Option<Box<dyn TextGenerationProvider>>,
}

impl VolumeLibrary {
    pub fn new(
        config: EngineConfig,
        backend: Box<dyn StorageBackend>,
        embedder: Box<dyn EmbeddingProvider>,
        generator: Option<Box<dyn TextGenerationProvider>>,
    ) -> Self {
        Self {
            engine: Arc::new(VolumeStoreEngine::new(config, backend)),
            embedder,
            generator,
        }
    }

    pub fn engine(&self) -> &VolumeStoreEngine {
        &self.engine
    }

    /// Loads the store, then arms the background flush timer if `config`
    /// calls for one (spec §4.9: armed iff `auto_save=false ∧
    /// flush_interval_ms>0 ∧ initialized`).
    pub async fn initialize(&self) -> Result<(), VolumeStoreError> {
        self.engine.load().await?;
        self.engine.spawn_flush_timer();
        Ok(())
    }

    pub async fn dispose(&self) -> Result<(), VolumeStoreError> {
        self.engine.dispose().await
    }

    /// Embed `text`, then store it with `metadata` through the engine's
    /// normal lock-protected `add`.
    pub async fn add(
        &self,
        text: impl Into<String>,
        metadata: HashMap<String, String>,
    ) -> Result<Uuid, VolumeStoreError> {
        let text = text.into();
        let embedding = self.embedder.embed_one(&text).await?;
        self.engine.add(text, embedding, metadata).await
    }

    pub async fn search(
        &self,
        query: &str,
        max_results: usize,
        threshold: Option<f32>,
    ) -> Result<Vec<(Volume, f32)>, VolumeStoreError> {
        let embedding = self.embedder.embed_one(query).await?;
        self.engine.search(&embedding, max_results, threshold.unwrap_or(0.0)).await
    }

    pub async fn text_search(
        &self,
        query: &str,
        mode: TextSearchMode,
        threshold: f32,
    ) -> Result<Vec<(Volume, f32)>, VolumeStoreError> {
        self.engine.text_search(query, mode, threshold).await
    }

    pub async fn filter_by_metadata(
        &self,
        predicates: &[MetadataPredicate],
    ) -> Result<Vec<Volume>, VolumeStoreError> {
        self.engine.filter_by_metadata(predicates).await
    }

    pub async fn filter_by_date_range(
        &self,
        after: Option<u64>,
        before: Option<u64>,
    ) -> Result<Vec<Volume>, VolumeStoreError> {
        self.engine.filter_by_date_range(after, before).await
    }

    pub async fn filter_by_topic(&self, topics: &[String]) -> Result<Vec<Volume>, VolumeStoreError> {
        self.engine.filter_by_topic(topics).await
    }

    pub async fn advanced_search(
        &self,
        opts: AdvancedSearchOptions<'_>,
    ) -> Result<Vec<AdvancedResult>, VolumeStoreError> {
        self.engine.advanced_search(opts).await
    }

    /// Embeds `query` (if supplied as text) before delegating to the engine.
    pub async fn recommend(
        &self,
        query: Option<&str>,
        mut opts: RecommendOptions,
    ) -> Result<Vec<Recommendation>, VolumeStoreError> {
        if let Some(q) = query {
            opts.query_embedding = Some(self.embedder.embed_one(q).await?);
        }
        self.engine.recommend(opts).await
    }

    pub async fn find_duplicates(&self, threshold: Option<f32>) -> Result<Vec<DuplicateGroup>, VolumeStoreError> {
        self.engine.find_duplicates(threshold).await
    }

    pub async fn get_all(&self) -> Result<Vec<Volume>, VolumeStoreError> {
        self.engine.get_all().await
    }

    pub async fn get_by_id(&self, id: Uuid) -> Result<Option<Volume>, VolumeStoreError> {
        self.engine.get_by_id(id).await
    }

    pub async fn get_topics(&self) -> Result<Vec<String>, VolumeStoreError> {
        self.engine.get_topics().await
    }

    pub fn size(&self) -> usize {
        self.engine.size()
    }

    pub fn is_dirty(&self) -> bool {
        self.engine.is_dirty()
    }

    pub async fn learning_profile(&self) -> LearningProfile {
        self.engine.learning_profile().await
    }

    /// Summarize `ids` into one new volume tagged `topic=compendium`, via
    /// the text-generation provider, then (optionally) delete the sources.
    /// Goes entirely through the engine's normal lock-protected operations —
    /// no new locks are introduced (spec §4.10).
    pub async fn compendium(
        &self,
        ids: &[Uuid],
        opts: CompendiumOptions,
    ) -> Result<Uuid, VolumeStoreError> {
        let generator = self
            .generator
            .as_ref()
            .ok_or_else(|| VolumeStoreError::Corruption("no text-generation provider configured".to_string()))?;

        let mut sources = Vec::with_capacity(ids.len());
        for id in ids {
            match self.engine.get_by_id(*id).await? {
                Some(v) => sources.push(v),
                None => return Err(VolumeStoreError::NotFound(*id)),
            }
        }

        let prompt = build_compendium_prompt(&sources);
        let summary_text = generator.generate(&prompt).await?;
        let embedding = self.embedder.embed_one(&summary_text).await?;

        let mut metadata = opts.extra_metadata;
        metadata.insert(crate::volume::TOPIC_KEY.to_string(), COMPENDIUM_TOPIC.to_string());
        metadata.insert(
            SOURCE_IDS_KEY.to_string(),
            ids.iter().map(Uuid::to_string).collect::<Vec<_>>().join(","),
        );

        let compendium_id = self.engine.add(summary_text, embedding, metadata).await?;

        if opts.delete_originals {
            self.engine.delete_batch(ids).await?;
        }

        Ok(compendium_id)
    }
}

fn build_compendium_prompt(sources: &[Volume]) -> String {
    let mut prompt = String::from("Summarize the following volumes into one concise compendium entry:\n\n");
    for (i, v) in sources.iter().enumerate() {
        prompt.push_str(&format!("{}. {}\n", i + 1, v.text));
    }
    prompt
}
