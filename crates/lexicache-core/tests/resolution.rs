mod common;

use std::sync::Arc;

use futures::future::join_all;
use serde_json::json;

use common::*;
use lexicache_core::cascade::baseline_keys;
use lexicache_core::source::DirectoryChunkSource;
use lexicache_core::{ChunkRegistry, MemoryStorage, Strategy, VocabularyCache};

fn sorted(records: &[lexicache_core::Record]) -> Vec<String> {
    let mut keys: Vec<String> = records.iter().map(|r| r.key.clone()).collect();
    keys.sort();
    keys
}

#[tokio::test]
async fn one_failing_chunk_still_serves_known_keys() {
    let source = Arc::new(FlakySource::new().down("advanced"));
    let cache = sample_cache(source);

    let records = cache.ensure_loaded(&keys(&["ser", "traer", "ghost"])).await;
    assert_eq!(sorted(&records), vec!["ser", "traer"]);
    assert!(cache.get_by_key("traer").is_some());
    assert!(cache.get_by_key("ghost").is_none());
}

#[tokio::test]
async fn total_failure_serves_baseline() {
    let cache = cache_with(
        Arc::new(FlakySource::offline()),
        Arc::new(OfflineStore),
        Arc::new(MemoryStorage::new()),
        fast_tuning(),
    );

    let records = cache.ensure_loaded(&keys(&["traer", "ghost"])).await;
    let mut expected: Vec<String> = baseline_keys().map(String::from).collect();
    expected.sort();
    assert_eq!(sorted(&records), expected);
    assert_eq!(cache.cascade().last_strategy(), Some(Strategy::Baseline));
}

#[tokio::test]
async fn concurrent_requests_fetch_each_chunk_once() {
    let source = Arc::new(FlakySource::new());
    let cache = sample_cache(source.clone());
    let requested = keys(&["ser", "estar", "traer"]);

    let results = join_all((0..10).map(|_| cache.ensure_loaded(&requested))).await;
    for records in &results {
        assert_eq!(records.len(), 3);
    }
    assert_eq!(source.requests("core"), 1);
    assert_eq!(source.requests("advanced"), 1);
    assert!(cache.stats().loader.coalesced > 0);
}

#[tokio::test]
async fn repeated_failures_degrade_every_instance_on_the_storage() {
    let storage = Arc::new(MemoryStorage::new());
    let tuning = lexicache_core::Tuning {
        failure_threshold: 1,
        ..fast_tuning()
    };

    let first = cache_with(
        Arc::new(FlakySource::offline()),
        Arc::new(OfflineStore),
        storage.clone(),
        tuning.clone(),
    );
    let records = first.ensure_loaded(&keys(&["ser"])).await;
    assert!(!records.is_empty());
    assert!(!first.settings().chunked_loading_enabled());
    assert_eq!(first.stats().chunk_failures, 1);

    let source = Arc::new(FlakySource::new());
    let second = cache_with(source.clone(), Arc::new(Records::sample()), storage, tuning);
    assert!(!second.settings().chunked_loading_enabled());

    // Preferred chunks are skipped, so "hablar" is only found in the flat store
    let records = second.ensure_loaded(&keys(&["hablar"])).await;
    assert_eq!(sorted(&records), vec!["hablar"]);
    assert_eq!(second.cascade().last_strategy(), Some(Strategy::FlatStore));
    assert_eq!(source.requests("bucket-ar"), 0);
}

#[tokio::test]
async fn empty_request_still_gets_the_baseline() {
    let cache = cache_with(
        Arc::new(FlakySource::offline()),
        Arc::new(OfflineStore),
        Arc::new(MemoryStorage::new()),
        fast_tuning(),
    );

    let records = cache.ensure_loaded(&[]).await;
    let mut expected: Vec<String> = baseline_keys().map(String::from).collect();
    expected.sort();
    assert_eq!(sorted(&records), expected);
}

#[tokio::test]
async fn real_records_replace_baseline_once_the_store_recovers() {
    let mut tener = record("tener");
    tener.payload = json!({ "lemma": "tener", "gloss": "to have, to hold", "real": true });
    let store = Arc::new(SwitchableStore::down(vec![record("traer"), tener]));
    let cache = cache_with(
        Arc::new(FlakySource::offline()),
        store.clone(),
        Arc::new(MemoryStorage::new()),
        fast_tuning(),
    );

    let records = cache.ensure_loaded(&keys(&["traer"])).await;
    assert!(records.iter().any(|r| r.key == "tener" && r.payload["baseline"] == true));
    assert_eq!(cache.cascade().last_strategy(), Some(Strategy::Baseline));

    store.recover();
    let records = cache.ensure_loaded(&keys(&["tener"])).await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].payload["real"], true);
    assert_ne!(cache.cascade().last_strategy(), Some(Strategy::Baseline));

    // Real records are cached from now on
    assert_eq!(cache.get_by_key("tener").unwrap().payload["real"], true);
}

#[tokio::test]
async fn registry_and_chunks_from_disk() {
    let tmp = temp_dir("chunks");
    let dir = tmp.path();
    std::fs::write(
        dir.join("core.json"),
        r#"{"id": "core", "records": [{"key": "ser", "payload": {"gloss": "to be"}}, {"key": "estar"}]}"#,
    )
    .unwrap();
    std::fs::write(dir.join("advanced.json"), r#"[{"key": "traer"}]"#).unwrap();

    let registry = ChunkRegistry::from_json(r#"{"core": ["ser", "estar"], "advanced": ["traer"]}"#).unwrap();
    let collaborators = lexicache_core::Collaborators::new(
        Arc::new(DirectoryChunkSource::new(dir)),
        Arc::new(Records(Vec::new())),
        Arc::new(MemoryStorage::new()),
    );
    let cache = VocabularyCache::builder(collaborators)
        .registry(registry)
        .tuning(fast_tuning())
        .build();

    let records = cache.ensure_loaded(&keys(&["traer", "ser"])).await;
    assert_eq!(records[0].key, "traer");
    assert_eq!(records[1].payload["gloss"], "to be");
    assert_eq!(cache.stats().loader.fetched, 2);
}
