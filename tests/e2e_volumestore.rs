//! End-to-end scenarios mirroring spec §8: the concrete S1-S6 scenarios and
//! the quantified invariants that must hold after any sequence of mutations.
//!
//! Run with:
//! ```
//! cargo test --test e2e_volumestore --features testing -- --nocapture
//! ```

use std::collections::HashMap;
use volumestore::config::{DuplicateBehavior, EngineConfig, RecommendWeights};
use volumestore::engine::{RecommendOptions, TextSearchMode, VolumeStoreEngine};
use volumestore::storage::{MemoryBackend, SledBackend};
use volumestore::volume::Volume;
use volumestore::VolumeStoreError;

// ─────────────────────────────────────────────────────────────────────────
// Fixture helpers
// ─────────────────────────────────────────────────────────────────────────

fn engine_with(config: EngineConfig) -> VolumeStoreEngine {
    VolumeStoreEngine::new(config, Box::new(MemoryBackend::new()))
}

fn meta(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

// ─────────────────────────────────────────────────────────────────────────
// S1: add & cosine
// ─────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn s1_add_and_cosine_search() {
    let engine = engine_with(EngineConfig::default());
    engine.load().await.unwrap();

    engine
        .add("alpha".into(), vec![1.0, 0.0], meta(&[("topic", "a")]))
        .await
        .unwrap();
    engine
        .add("beta".into(), vec![0.0, 1.0], meta(&[("topic", "b")]))
        .await
        .unwrap();

    let all = engine.search(&[1.0, 0.0], 2, 0.0).await.unwrap();
    assert_eq!(all.len(), 2, "both volumes clear threshold 0.0");
    assert_eq!(all[0].0.text, "alpha", "alpha is the exact match, must rank first");
    assert!((all[0].1 - 1.0).abs() < 1e-6);
    assert!((all[1].1 - 0.0).abs() < 1e-6);

    let filtered = engine.search(&[1.0, 0.0], 2, 0.5).await.unwrap();
    assert_eq!(filtered.len(), 1, "beta's score of 0.0 must not clear threshold 0.5");
    assert_eq!(filtered[0].0.text, "alpha");
}

// ─────────────────────────────────────────────────────────────────────────
// S2: dedup skip
// ─────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn s2_dedup_skip_returns_existing_id() {
    let mut config = EngineConfig::default();
    config.duplicate_threshold = 0.99;
    config.duplicate_behavior = DuplicateBehavior::Skip;
    let engine = engine_with(config);
    engine.load().await.unwrap();

    let first = engine.add("x".into(), vec![1.0, 0.0], HashMap::new()).await.unwrap();
    let second = engine.add("y".into(), vec![1.0, 0.0], HashMap::new()).await.unwrap();

    assert_eq!(first, second, "skip behavior must return the existing id");
    assert_eq!(engine.size(), 1, "no second volume should have been inserted");
}

// ─────────────────────────────────────────────────────────────────────────
// S3: topic filter
// ─────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn s3_topic_filter_matches_exact_topic_only() {
    let engine = engine_with(EngineConfig::default());
    engine.load().await.unwrap();

    for (text, topic) in [("a", "proj/a"), ("b", "proj/b"), ("c", "other")] {
        engine
            .add(text.into(), vec![1.0], meta(&[("topic", topic)]))
            .await
            .unwrap();
    }

    let results = engine.filter_by_topic(&["proj/a".to_string()]).await.unwrap();
    assert_eq!(results.len(), 1, "only the exact-topic volume should match");
    assert_eq!(results[0].text, "a");
}

// ─────────────────────────────────────────────────────────────────────────
// S4: DSL parsing
// ─────────────────────────────────────────────────────────────────────────

#[test]
fn s4_dsl_parses_combined_clauses() {
    let parsed = volumestore::query::parse(r#"topic:work metadata:pri=high "urgent fix" score>0.6"#);

    assert_eq!(parsed.topic_filter, vec!["work".to_string()]);
    assert_eq!(parsed.metadata_filters.len(), 1);
    assert_eq!(parsed.metadata_filters[0].key, "pri");
    assert_eq!(parsed.metadata_filters[0].value, "high");
    let text = parsed.text_search.expect("quoted phrase must set a text clause");
    assert_eq!(text.text, "urgent fix");
    assert_eq!(text.mode, TextSearchMode::Exact, "a quoted phrase must set exact mode");
    assert_eq!(parsed.min_score, Some(0.6));
}

// ─────────────────────────────────────────────────────────────────────────
// S5: recommend blend
// ─────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn s5_recommend_ranks_by_access_count_then_ties_on_vector_only_weights() {
    let engine = engine_with(EngineConfig::default());
    engine.load().await.unwrap();

    let popular = engine.add("popular".into(), vec![1.0, 0.0], HashMap::new()).await.unwrap();
    let quiet = engine.add("quiet".into(), vec![1.0, 0.0], HashMap::new()).await.unwrap();

    for _ in 0..10 {
        engine.get_by_id(popular).await.unwrap();
    }

    let defaults = engine
        .recommend(RecommendOptions {
            query_embedding: Some(vec![1.0, 0.0]),
            weights: None,
            min_score: Some(0.0),
            max_results: Some(10),
            candidate_ids: vec![popular, quiet],
        })
        .await
        .unwrap();
    assert_eq!(defaults[0].id, popular, "default weights must favor the higher access count");

    let vector_only = engine
        .recommend(RecommendOptions {
            query_embedding: Some(vec![1.0, 0.0]),
            weights: Some(RecommendWeights {
                vector: 1.0,
                recency: 0.0,
                frequency: 0.0,
            }),
            min_score: Some(0.0),
            max_results: Some(10),
            candidate_ids: vec![popular, quiet],
        })
        .await
        .unwrap();
    assert!(
        (vector_only[0].score - vector_only[1].score).abs() < 1e-6,
        "vector-only weights must tie identical-similarity candidates"
    );
}

// ─────────────────────────────────────────────────────────────────────────
// S6: corruption tolerance
// ─────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn s6_corrupt_record_is_skipped_and_store_is_marked_dirty() {
    let backend = MemoryBackend::new();

    let good_a = Volume::new("good a".into(), vec![1.0, 0.0], HashMap::new());
    let good_b = Volume::new("good b".into(), vec![0.0, 1.0], HashMap::new());
    let mut good_encoded = volumestore::codec::encode_record(&good_a, Default::default());
    good_encoded.truncate(good_encoded.len() - 5); // corrupt: truncated embedding field

    let mut entries = HashMap::new();
    entries.insert(good_a.id.to_string(), good_encoded);
    entries.insert(
        good_b.id.to_string(),
        volumestore::codec::encode_record(&good_b, Default::default()),
    );
    backend.save(entries).await.unwrap();

    let engine = VolumeStoreEngine::new(EngineConfig::default(), Box::new(backend));
    engine.load().await.unwrap();

    assert_eq!(engine.size(), 1, "only the uncorrupted record should have loaded");
    assert!(engine.is_dirty(), "load must mark the store dirty so the next save drops the bad record");

    engine.save().await.unwrap();
    assert!(!engine.is_dirty(), "a successful save clears the dirty flag");
}

// ─────────────────────────────────────────────────────────────────────────
// Quantified invariants (spec §8)
// ─────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn invariant_get_by_id_matches_get_all() {
    let engine = engine_with(EngineConfig::default());
    engine.load().await.unwrap();
    engine.add("a".into(), vec![1.0], HashMap::new()).await.unwrap();
    engine.add("b".into(), vec![2.0], HashMap::new()).await.unwrap();

    for v in engine.get_all().await.unwrap() {
        let fetched = engine.get_by_id(v.id).await.unwrap().unwrap();
        assert_eq!(fetched.id, v.id);
        assert_eq!(fetched.text, v.text);
    }
}

#[tokio::test]
async fn invariant_topics_and_filter_by_topic_agree() {
    let engine = engine_with(EngineConfig::default());
    engine.load().await.unwrap();
    for (text, topic) in [("a", "x"), ("b", "x"), ("c", "y")] {
        engine.add(text.into(), vec![1.0], meta(&[("topic", topic)])).await.unwrap();
    }

    for topic in engine.get_topics().await.unwrap() {
        let filtered = engine.filter_by_topic(&[topic.clone()]).await.unwrap();
        assert!(filtered.iter().all(|v| v.topic() == topic));
    }
}

#[tokio::test]
async fn invariant_size_equals_get_all_length() {
    let engine = engine_with(EngineConfig::default());
    engine.load().await.unwrap();
    for i in 0..5 {
        engine.add(format!("v{i}"), vec![1.0], HashMap::new()).await.unwrap();
    }
    assert_eq!(engine.size(), engine.get_all().await.unwrap().len());

    engine.delete(engine.get_all().await.unwrap()[0].id).await.unwrap();
    assert_eq!(engine.size(), engine.get_all().await.unwrap().len());
}

#[tokio::test]
async fn invariant_clear_then_save_then_reload_is_empty() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store.sled");

    {
        let engine = VolumeStoreEngine::new(
            EngineConfig::default(),
            Box::new(SledBackend::open(&path).unwrap()),
        );
        engine.load().await.unwrap();
        engine.add("x".into(), vec![1.0], HashMap::new()).await.unwrap();
        engine.clear().await.unwrap();
        engine.save().await.unwrap();
        assert_eq!(engine.size(), 0);
        engine.dispose().await.unwrap();
    }

    let reloaded = VolumeStoreEngine::new(
        EngineConfig::default(),
        Box::new(SledBackend::open(&path).unwrap()),
    );
    reloaded.load().await.unwrap();
    assert_eq!(reloaded.size(), 0, "a cleared-and-saved store must reload empty");
    assert!(reloaded.get_all().await.unwrap().is_empty());
}

#[tokio::test]
async fn invariant_check_duplicate_matches_self_at_similarity_one() {
    let mut config = EngineConfig::default();
    config.duplicate_threshold = 0.5;
    let engine = engine_with(config);
    engine.load().await.unwrap();
    engine.add("x".into(), vec![1.0, 2.0, 3.0], HashMap::new()).await.unwrap();

    let hit = engine.check_duplicate(&[1.0, 2.0, 3.0]).await.unwrap().unwrap();
    assert!((hit.similarity - 1.0).abs() < 1e-5, "a volume must be its own duplicate at similarity 1.0");
}

#[tokio::test]
async fn invariant_search_results_are_sorted_above_threshold_and_unique() {
    let engine = engine_with(EngineConfig::default());
    engine.load().await.unwrap();
    engine.add("a".into(), vec![1.0, 0.0, 0.0], HashMap::new()).await.unwrap();
    engine.add("b".into(), vec![0.9, 0.1, 0.0], HashMap::new()).await.unwrap();
    engine.add("c".into(), vec![0.0, 1.0, 0.0], HashMap::new()).await.unwrap();

    let results = engine.search(&[1.0, 0.0, 0.0], 10, 0.3).await.unwrap();
    for pair in results.windows(2) {
        assert!(pair[0].1 >= pair[1].1, "results must be sorted descending by score");
    }
    assert!(results.iter().all(|(_, score)| *score >= 0.3));
    let mut seen = std::collections::HashSet::new();
    assert!(results.iter().all(|(v, _)| seen.insert(v.id)), "no duplicate results");
}

#[tokio::test]
async fn invariant_save_then_load_round_trip_is_byte_identical() {
    let dir = tempfile::tempdir().unwrap();
    let backend = SledBackend::open(dir.path().join("store.sled")).unwrap();
    let engine = VolumeStoreEngine::new(EngineConfig::default(), Box::new(backend));
    engine.load().await.unwrap();

    let id = engine
        .add(
            "round trip me".into(),
            vec![1.0, -2.5, 0.0, 3.25],
            meta(&[("topic", "x"), ("k", "v")]),
        )
        .await
        .unwrap();
    engine.save().await.unwrap();
    engine.dispose().await.unwrap();

    let reopened_backend = SledBackend::open(dir.path().join("store.sled")).unwrap();
    let reloaded = VolumeStoreEngine::new(EngineConfig::default(), Box::new(reopened_backend));
    reloaded.load().await.unwrap();

    let volume = reloaded.get_by_id(id).await.unwrap().unwrap();
    assert_eq!(volume.text, "round trip me");
    assert_eq!(volume.embedding, vec![1.0, -2.5, 0.0, 3.25]);
    assert_eq!(volume.metadata.get("topic"), Some(&"x".to_string()));
    assert_eq!(volume.metadata.get("k"), Some(&"v".to_string()));
}

#[tokio::test]
async fn invariant_add_batch_equivalent_to_sequential_adds_when_no_duplicates() {
    let batched = engine_with(EngineConfig::default());
    batched.load().await.unwrap();
    let ids = batched
        .add_batch(vec![
            ("a".into(), vec![1.0], HashMap::new()),
            ("b".into(), vec![2.0], HashMap::new()),
            ("c".into(), vec![3.0], HashMap::new()),
        ])
        .await
        .unwrap();
    assert_eq!(ids.len(), 3);
    assert_eq!(batched.size(), 3);

    let sequential = engine_with(EngineConfig::default());
    sequential.load().await.unwrap();
    for text in ["a", "b", "c"] {
        sequential.add(text.into(), vec![1.0], HashMap::new()).await.unwrap();
    }
    assert_eq!(sequential.size(), batched.size());
}

#[tokio::test]
async fn invariant_add_batch_duplicate_error_leaves_no_partial_insertion() {
    let mut config = EngineConfig::default();
    config.duplicate_threshold = 0.99;
    config.duplicate_behavior = DuplicateBehavior::Error;
    let engine = engine_with(config);
    engine.load().await.unwrap();
    engine.add("x".into(), vec![1.0, 0.0], HashMap::new()).await.unwrap();

    let result = engine
        .add_batch(vec![
            ("new".into(), vec![0.0, 1.0], HashMap::new()),
            ("dup".into(), vec![1.0, 0.0], HashMap::new()),
        ])
        .await;
    assert!(matches!(result, Err(VolumeStoreError::Duplicate { .. })));
    assert_eq!(engine.size(), 1, "the batch's first item must not remain inserted after the second fails");
    assert_eq!(
        engine.get_all().await.unwrap().len(),
        1,
        "get_all() must not expose the batch's first item either"
    );
}

#[tokio::test]
async fn invariant_concurrent_adds_with_duplicate_threshold_insert_at_most_one_per_group() {
    use std::sync::Arc;

    let mut config = EngineConfig::default();
    config.duplicate_threshold = 0.99;
    config.duplicate_behavior = DuplicateBehavior::Skip;
    let engine = Arc::new(engine_with(config));
    engine.load().await.unwrap();

    let mut handles = Vec::new();
    for i in 0..8 {
        let engine = Arc::clone(&engine);
        handles.push(tokio::spawn(async move {
            engine
                .add(format!("dup-{i}"), vec![1.0, 0.0], HashMap::new())
                .await
                .unwrap()
        }));
    }
    let mut ids = Vec::new();
    for h in handles {
        ids.push(h.await.unwrap());
    }

    assert_eq!(engine.size(), 1, "the write lock must serialize duplicate-check-then-insert");
    let unique: std::collections::HashSet<_> = ids.into_iter().collect();
    assert_eq!(unique.len(), 1, "every concurrent caller must observe the same winning id");
}

// ─────────────────────────────────────────────────────────────────────────
// Facade-level scenario (compendium, embedder round trip)
// ─────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn facade_add_search_and_compendium_round_trip() {
    use volumestore::facade::{CompendiumOptions, VolumeLibrary};
    use volumestore::testing::{StubEmbedder, StubGenerator};

    let lib = VolumeLibrary::new(
        EngineConfig::default(),
        Box::new(MemoryBackend::new()),
        Box::new(StubEmbedder::new(32)),
        Some(Box::new(StubGenerator)),
    );
    lib.initialize().await.unwrap();

    let a = lib.add("first important note", HashMap::new()).await.unwrap();
    let b = lib.add("second important note", HashMap::new()).await.unwrap();

    let results = lib.search("important note", 5, Some(0.0)).await.unwrap();
    assert_eq!(results.len(), 2);

    let compendium_id = lib
        .compendium(
            &[a, b],
            CompendiumOptions {
                delete_originals: true,
                extra_metadata: HashMap::new(),
            },
        )
        .await
        .unwrap();

    let summary = lib.get_by_id(compendium_id).await.unwrap().unwrap();
    assert_eq!(summary.topic(), "compendium");
    assert!(lib.get_by_id(a).await.unwrap().is_none(), "sources must be deleted");
    assert!(lib.get_by_id(b).await.unwrap().is_none());
}
