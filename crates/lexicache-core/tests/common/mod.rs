#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use serde_json::json;

use lexicache_core::{
    Chunk, ChunkMetadata, ChunkRegistry, ChunkSource, Collaborators, LoadError, MemoryStorage,
    Record, RecordStore, SharedStorage, Tuning, VocabularyCache,
};

pub fn record(key: &str) -> Record {
    Record::new(key, json!({ "lemma": key }))
}

pub fn keys(keys: &[&str]) -> Vec<String> {
    keys.iter().map(|k| k.to_string()).collect()
}

pub fn registry() -> ChunkRegistry {
    ChunkRegistry::new([
        ChunkMetadata::new("core", ["ser", "estar"]).with_priority(1),
        ChunkMetadata::new("advanced", ["traer"]).with_priority(3),
    ])
}

/// In-process chunk server that counts requests.
pub struct FlakySource {
    chunks: HashMap<String, Chunk>,
    down: Mutex<HashSet<String>>,
    offline: bool,
    delay: Duration,
    requests: Mutex<HashMap<String, usize>>,
}

impl FlakySource {
    pub fn new() -> Self {
        let chunks = [
            Chunk::new("core", vec![record("ser"), record("estar")]),
            Chunk::new("advanced", vec![record("traer")]),
        ];
        Self {
            chunks: chunks.into_iter().map(|c| (c.id.clone(), c)).collect(),
            down: Mutex::new(HashSet::new()),
            offline: false,
            delay: Duration::from_millis(20),
            requests: Mutex::new(HashMap::new()),
        }
    }

    pub fn offline() -> Self {
        Self {
            offline: true,
            ..Self::new()
        }
    }

    pub fn down(self, chunk_id: &str) -> Self {
        self.down.lock().unwrap().insert(chunk_id.to_string());
        self
    }

    pub fn requests(&self, chunk_id: &str) -> usize {
        self.requests.lock().unwrap().get(chunk_id).copied().unwrap_or(0)
    }
}

impl ChunkSource for FlakySource {
    fn fetch<'a>(&'a self, chunk_id: &'a str) -> BoxFuture<'a, Result<Chunk, LoadError>> {
        async move {
            *self.requests.lock().unwrap().entry(chunk_id.to_string()).or_default() += 1;
            tokio::time::sleep(self.delay).await;
            if self.offline || self.down.lock().unwrap().contains(chunk_id) {
                return Err(LoadError::Transient("connection reset".to_string()));
            }
            self.chunks
                .get(chunk_id)
                .cloned()
                .ok_or_else(|| LoadError::Structural(format!("no chunk {}", chunk_id)))
        }
        .boxed()
    }
}

pub struct Records(pub Vec<Record>);

impl Records {
    pub fn sample() -> Self {
        Self(["ser", "estar", "traer", "hablar"].iter().map(|k| record(k)).collect())
    }
}

impl RecordStore for Records {
    fn get_all(&self) -> BoxFuture<'_, Result<Vec<Record>, LoadError>> {
        async move { Ok(self.0.clone()) }.boxed()
    }
}

/// A record store that can go down and come back.
pub struct SwitchableStore {
    records: Vec<Record>,
    up: AtomicBool,
}

impl SwitchableStore {
    pub fn down(records: Vec<Record>) -> Self {
        Self {
            records,
            up: AtomicBool::new(false),
        }
    }

    pub fn recover(&self) {
        self.up.store(true, Ordering::SeqCst);
    }
}

impl RecordStore for SwitchableStore {
    fn get_all(&self) -> BoxFuture<'_, Result<Vec<Record>, LoadError>> {
        async move {
            if self.up.load(Ordering::SeqCst) {
                Ok(self.records.clone())
            } else {
                Err(LoadError::Transient("record store offline".to_string()))
            }
        }
        .boxed()
    }
}

pub struct OfflineStore;

impl RecordStore for OfflineStore {
    fn get_all(&self) -> BoxFuture<'_, Result<Vec<Record>, LoadError>> {
        async { Err(LoadError::Transient("record store offline".to_string())) }.boxed()
    }
}

pub fn fast_tuning() -> Tuning {
    Tuning {
        max_retries: 1,
        timeout_ms: 1_000,
        initial_backoff_ms: 5,
        ..Tuning::default()
    }
}

pub fn cache_with(
    source: Arc<dyn ChunkSource>,
    store: Arc<dyn RecordStore>,
    storage: Arc<dyn SharedStorage>,
    tuning: Tuning,
) -> VocabularyCache {
    VocabularyCache::builder(Collaborators::new(source, store, storage))
        .registry(registry())
        .tuning(tuning)
        .build()
}

pub fn sample_cache(source: Arc<FlakySource>) -> VocabularyCache {
    cache_with(
        source,
        Arc::new(Records::sample()),
        Arc::new(MemoryStorage::new()),
        fast_tuning(),
    )
}

/// Removed when dropped, including when an assertion fails.
pub fn temp_dir(label: &str) -> tempfile::TempDir {
    tempfile::Builder::new()
        .prefix(&format!("lexicache-{}-", label))
        .tempdir()
        .unwrap()
}
