//! Fixtures shared by unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use serde_json::json;

use crate::error::LoadError;
use crate::models::{Chunk, Record};
use crate::registry::{ChunkMetadata, ChunkRegistry};
use crate::source::{ChunkSource, MemoryRecordStore, RecordStore};

pub(crate) fn record(key: &str) -> Record {
    Record::new(key, json!({ "lemma": key }))
}

/// `core` (priority 1, irregular) = ser, estar; `advanced` (priority 3) = traer
pub(crate) fn sample_registry() -> ChunkRegistry {
    ChunkRegistry::new([
        ChunkMetadata::new("core", ["ser", "estar"])
            .with_priority(1)
            .with_categories(["irregular"]),
        ChunkMetadata::new("advanced", ["traer"])
            .with_priority(3)
            .with_categories(["irregular", "preterite"]),
    ])
}

pub(crate) fn sample_store() -> MemoryRecordStore {
    MemoryRecordStore::new(["ser", "estar", "traer", "hablar"].iter().map(|k| record(k)).collect())
}

/// Serves chunks from memory, counting fetches and failing on demand.
pub(crate) struct ScriptedSource {
    chunks: HashMap<String, Chunk>,
    failing: Mutex<HashSet<String>>,
    /// Chunk id → failures left before fetches start succeeding
    flaky: Mutex<HashMap<String, usize>>,
    fail_all: bool,
    delay: Duration,
    fetches: Mutex<HashMap<String, usize>>,
}

impl ScriptedSource {
    pub(crate) fn new(chunks: Vec<Chunk>) -> Self {
        Self {
            chunks: chunks.into_iter().map(|c| (c.id.clone(), c)).collect(),
            failing: Mutex::new(HashSet::new()),
            flaky: Mutex::new(HashMap::new()),
            fail_all: false,
            delay: Duration::from_millis(10),
            fetches: Mutex::new(HashMap::new()),
        }
    }

    /// Chunks matching `sample_registry`.
    pub(crate) fn sample() -> Self {
        Self::new(vec![
            Chunk::new("core", vec![record("ser"), record("estar")]),
            Chunk::new("advanced", vec![record("traer")]),
        ])
    }

    pub(crate) fn offline() -> Self {
        Self {
            fail_all: true,
            ..Self::sample()
        }
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub(crate) fn failing(self, chunk_id: &str) -> Self {
        self.failing.lock().unwrap().insert(chunk_id.to_string());
        self
    }

    /// Fail the first `times` fetches of `chunk_id`, then serve it.
    pub(crate) fn failing_times(self, chunk_id: &str, times: usize) -> Self {
        self.flaky.lock().unwrap().insert(chunk_id.to_string(), times);
        self
    }

    pub(crate) fn fetches(&self, chunk_id: &str) -> usize {
        self.fetches.lock().unwrap().get(chunk_id).copied().unwrap_or(0)
    }

    pub(crate) fn total_fetches(&self) -> usize {
        self.fetches.lock().unwrap().values().sum()
    }
}

impl ChunkSource for ScriptedSource {
    fn fetch<'a>(&'a self, chunk_id: &'a str) -> BoxFuture<'a, Result<Chunk, LoadError>> {
        async move {
            *self
                .fetches
                .lock()
                .unwrap()
                .entry(chunk_id.to_string())
                .or_default() += 1;
            tokio::time::sleep(self.delay).await;
            if self.fail_all || self.failing.lock().unwrap().contains(chunk_id) {
                return Err(LoadError::Transient("simulated network failure".to_string()));
            }
            if let Some(left) = self.flaky.lock().unwrap().get_mut(chunk_id).filter(|n| **n > 0) {
                *left -= 1;
                return Err(LoadError::Transient("simulated network blip".to_string()));
            }
            self.chunks
                .get(chunk_id)
                .cloned()
                .ok_or_else(|| LoadError::Structural(chunk_id.to_string()))
        }
        .boxed()
    }
}

pub(crate) struct BrokenStore;

impl RecordStore for BrokenStore {
    fn get_all(&self) -> BoxFuture<'_, Result<Vec<Record>, LoadError>> {
        async { Err(LoadError::Transient("record store offline".to_string())) }.boxed()
    }
}
