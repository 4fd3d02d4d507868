//! Chunk loader.
//!
//! `load(chunk_id)` returns a resident chunk immediately, joins an in-flight
//! load of the same chunk if there is one, and otherwise spawns exactly one
//! load task whose result every concurrent caller shares. The task fetches
//! from the `ChunkSource`; if that fails it derives the chunk by filtering
//! the full `RecordStore`. Callers only see an error when both paths fail.
//!
//! Load tasks run to completion even if every caller stops waiting, so a
//! caller's timeout never wastes a fetch: the late result still lands in
//! the resident map.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use futures::future::{join_all, BoxFuture, FutureExt, Shared};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::error::LoadError;
use crate::models::{Chunk, Record};
use crate::registry::metadata::CRITICAL_PRIORITY;
use crate::registry::{ChunkRegistry, IndexProvenance, KeyIndex};
use crate::source::{ChunkSource, RecordStore};

type SharedLoad = Shared<BoxFuture<'static, Result<Arc<Chunk>, LoadError>>>;

struct LoadedChunk {
    chunk: Arc<Chunk>,
    loaded_at: Instant,
    priority: u8,
}

#[derive(Default)]
struct LoaderState {
    loaded: HashMap<String, LoadedChunk>,
    in_flight: HashMap<String, SharedLoad>,
}

#[derive(Default)]
struct LoadCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    coalesced: AtomicU64,
    fetched: AtomicU64,
    derived: AtomicU64,
    failures: AtomicU64,
    evicted: AtomicU64,
    completed: AtomicU64,
    total_load_micros: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct LoaderStats {
    pub hits: u64,
    pub misses: u64,
    pub coalesced: u64,
    pub fetched: u64,
    pub derived: u64,
    pub failures: u64,
    pub evicted: u64,
    pub chunks_loaded: usize,
    pub hit_rate: f64,
    pub avg_load_time_ms: f64,
}

struct LoaderInner {
    registry: Arc<ChunkRegistry>,
    index: Arc<KeyIndex>,
    source: Arc<dyn ChunkSource>,
    store: Arc<dyn RecordStore>,
    state: Mutex<LoaderState>,
    counters: LoadCounters,
}

/// Clone is cheap; clones share resident chunks and in-flight loads.
#[derive(Clone)]
pub struct ChunkLoader {
    inner: Arc<LoaderInner>,
}

impl LoaderInner {
    fn lock_state(&self) -> MutexGuard<'_, LoaderState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn fetch_or_derive(&self, chunk_id: &str) -> Result<Arc<Chunk>, LoadError> {
        let started = Instant::now();

        let result = match self.source.fetch(chunk_id).await {
            Ok(chunk) => {
                bump(&self.counters.fetched);
                debug!(chunk = chunk_id, records = chunk.len(), "Fetched chunk");
                Ok(chunk)
            }
            Err(fetch_err) => {
                warn!(chunk = chunk_id, error = %fetch_err, "Chunk fetch failed, deriving from record store");
                match self.derive_from_store(chunk_id).await {
                    Ok(chunk) => {
                        bump(&self.counters.derived);
                        info!(chunk = chunk_id, records = chunk.len(), "Derived chunk from record store");
                        Ok(chunk)
                    }
                    Err(derive_err) => {
                        error!(
                            chunk = chunk_id,
                            fetch_error = %fetch_err,
                            derive_error = %derive_err,
                            "Chunk unavailable from source and record store"
                        );
                        Err(combine_errors(chunk_id, fetch_err, derive_err))
                    }
                }
            }
        };

        self.finish(chunk_id, result, started.elapsed())
    }

    async fn derive_from_store(&self, chunk_id: &str) -> Result<Chunk, LoadError> {
        let records = self.store.get_all().await?;

        match self.registry.get(chunk_id) {
            Some(meta) => {
                let mut by_key: HashMap<&str, &Record> =
                    records.iter().map(|r| (r.key.as_str(), r)).collect();
                let members: Vec<Record> = meta
                    .members
                    .iter()
                    .filter_map(|k| by_key.remove(k.as_str()).cloned())
                    .collect();
                if members.is_empty() && !meta.members.is_empty() {
                    return Err(LoadError::Structural(format!(
                        "record store holds none of the {} members of {}",
                        meta.members.len(),
                        chunk_id
                    )));
                }
                if members.len() < meta.members.len() {
                    debug!(
                        chunk = chunk_id,
                        expected = meta.members.len(),
                        found = members.len(),
                        "Record store is missing chunk members"
                    );
                }
                Ok(Chunk::new(chunk_id, members))
            }
            // Not a registry chunk: membership is whatever the index routes here
            None => {
                let members = records
                    .into_iter()
                    .filter(|r| self.index.resolve_chunk(&r.key) == chunk_id)
                    .collect();
                Ok(Chunk::new(chunk_id, members))
            }
        }
    }

    fn finish(
        &self,
        chunk_id: &str,
        result: Result<Chunk, LoadError>,
        elapsed: Duration,
    ) -> Result<Arc<Chunk>, LoadError> {
        self.counters.completed.fetch_add(1, Ordering::Relaxed);
        self.counters
            .total_load_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);

        let result = result.map(|chunk| {
            if self.registry.get(chunk_id).is_none() {
                for key in chunk.keys() {
                    self.index.insert_if_absent(key, chunk_id, IndexProvenance::Supplement);
                }
            }
            Arc::new(chunk)
        });

        let mut state = self.lock_state();
        state.in_flight.remove(chunk_id);
        match &result {
            Ok(chunk) => {
                state.loaded.insert(
                    chunk_id.to_string(),
                    LoadedChunk {
                        chunk: Arc::clone(chunk),
                        loaded_at: Instant::now(),
                        priority: self.registry.priority_of(chunk_id),
                    },
                );
            }
            Err(_) => bump(&self.counters.failures),
        }
        result
    }
}

fn combine_errors(chunk_id: &str, fetch_err: LoadError, derive_err: LoadError) -> LoadError {
    if fetch_err.is_retryable() || derive_err.is_retryable() {
        LoadError::Transient(format!("{}: fetch: {}; derive: {}", chunk_id, fetch_err, derive_err))
    } else {
        LoadError::Structural(format!("{}: fetch: {}; derive: {}", chunk_id, fetch_err, derive_err))
    }
}

impl ChunkLoader {
    pub fn new(
        registry: Arc<ChunkRegistry>,
        index: Arc<KeyIndex>,
        source: Arc<dyn ChunkSource>,
        store: Arc<dyn RecordStore>,
    ) -> Self {
        Self {
            inner: Arc::new(LoaderInner {
                registry,
                index,
                source,
                store,
                state: Mutex::new(LoaderState::default()),
                counters: LoadCounters::default(),
            }),
        }
    }

    pub fn registry(&self) -> &Arc<ChunkRegistry> {
        &self.inner.registry
    }

    pub fn index(&self) -> &Arc<KeyIndex> {
        &self.inner.index
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.inner.store
    }

    pub async fn load(&self, chunk_id: &str) -> Result<Arc<Chunk>, LoadError> {
        let pending = {
            let mut state = self.inner.lock_state();
            if let Some(loaded) = state.loaded.get(chunk_id) {
                bump(&self.inner.counters.hits);
                return Ok(Arc::clone(&loaded.chunk));
            }
            match state.in_flight.get(chunk_id) {
                Some(pending) => {
                    bump(&self.inner.counters.coalesced);
                    debug!(chunk = chunk_id, "Joining in-flight chunk load");
                    pending.clone()
                }
                None => {
                    bump(&self.inner.counters.misses);
                    let pending = self.spawn_load(chunk_id);
                    state.in_flight.insert(chunk_id.to_string(), pending.clone());
                    pending
                }
            }
        };
        pending.await
    }

    /// Called with the state lock held, so the task cannot finish (and clear
    /// its in-flight entry) before that entry has been inserted.
    fn spawn_load(&self, chunk_id: &str) -> SharedLoad {
        let task_inner = Arc::clone(&self.inner);
        let task_id = chunk_id.to_string();
        let task = tokio::spawn(async move { task_inner.fetch_or_derive(&task_id).await });

        let inner = Arc::clone(&self.inner);
        let id = chunk_id.to_string();
        async move {
            match task.await {
                Ok(result) => result,
                Err(e) => {
                    error!(chunk = %id, error = %e, "Chunk load task failed");
                    inner.lock_state().in_flight.remove(&id);
                    bump(&inner.counters.failures);
                    Err(LoadError::Transient(format!("load task for {} failed: {}", id, e)))
                }
            }
        }
        .boxed()
        .shared()
    }

    /// Load several chunks concurrently. Results are in input order.
    pub async fn load_many(&self, chunk_ids: &[String]) -> Vec<Result<Arc<Chunk>, LoadError>> {
        join_all(chunk_ids.iter().map(|id| self.load(id))).await
    }

    pub fn get_resident(&self, chunk_id: &str) -> Option<Arc<Chunk>> {
        self.inner
            .lock_state()
            .loaded
            .get(chunk_id)
            .map(|l| Arc::clone(&l.chunk))
    }

    pub fn is_loaded(&self, chunk_id: &str) -> bool {
        self.inner.lock_state().loaded.contains_key(chunk_id)
    }

    pub fn is_loading(&self, chunk_id: &str) -> bool {
        self.inner.lock_state().in_flight.contains_key(chunk_id)
    }

    pub fn loaded_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.lock_state().loaded.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Drop resident chunks older than `ttl`. Critical-priority chunks stay.
    pub fn evict_expired(&self, ttl: Duration) -> usize {
        let mut state = self.inner.lock_state();
        let before = state.loaded.len();
        state
            .loaded
            .retain(|_, l| l.priority <= CRITICAL_PRIORITY || l.loaded_at.elapsed() < ttl);
        let evicted = before - state.loaded.len();
        if evicted > 0 {
            self.inner
                .counters
                .evicted
                .fetch_add(evicted as u64, Ordering::Relaxed);
            debug!(evicted = evicted, remaining = state.loaded.len(), "Evicted expired chunks");
        }
        evicted
    }

    /// Forget every resident chunk. In-flight loads are unaffected.
    pub fn clear(&self) {
        self.inner.lock_state().loaded.clear();
    }

    pub fn stats(&self) -> LoaderStats {
        let c = &self.inner.counters;
        let hits = c.hits.load(Ordering::Relaxed);
        let misses = c.misses.load(Ordering::Relaxed);
        let completed = c.completed.load(Ordering::Relaxed);
        let total_micros = c.total_load_micros.load(Ordering::Relaxed);
        let lookups = hits + misses;

        LoaderStats {
            hits,
            misses,
            coalesced: c.coalesced.load(Ordering::Relaxed),
            fetched: c.fetched.load(Ordering::Relaxed),
            derived: c.derived.load(Ordering::Relaxed),
            failures: c.failures.load(Ordering::Relaxed),
            evicted: c.evicted.load(Ordering::Relaxed),
            chunks_loaded: self.inner.lock_state().loaded.len(),
            hit_rate: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
            avg_load_time_ms: if completed == 0 {
                0.0
            } else {
                total_micros as f64 / completed as f64 / 1000.0
            },
        }
    }
}
