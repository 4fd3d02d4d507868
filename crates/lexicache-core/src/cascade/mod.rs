//! Failsafe cascade.
//!
//! `resolve(keys)` walks an escalating ladder until one rung produces
//! records:
//!
//! 1. the chunks the key index points at (skipped once chunked loading
//!    is disabled)
//! 2. every registry chunk
//! 3. the flat record store, bypassing chunks
//! 4. the built-in baseline set
//!
//! Rungs 1-3 are retried with exponential backoff, each attempt under a soft
//! timeout. Repeated failures of rung 1 are counted in shared storage; past a
//! threshold the cascade turns chunked loading off for good.

pub mod baseline;

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::error::{CascadeError, LoadError, StorageError};
use crate::loader::ChunkLoader;
use crate::models::{Chunk, Record};
use crate::mutex::{CrossTabMutex, MutexOptions, RetryPolicy};
use crate::registry::IndexProvenance;
use crate::settings::SettingsHandle;
use crate::storage::{get_json, set_json, SharedStorage};

pub use baseline::{baseline_keys, baseline_records, BASELINE_CHUNK_ID};

/// Shared storage key for the chunk failure counter.
pub const FAILURE_COUNTER_KEY: &str = "lexicache:chunk-failures";

/// Lock guarding the failure counter.
pub const FAILURE_LOCK_KEY: &str = "lexicache:lock:chunk-failures";

/// Chunk id under which keys found by the flat-store import are indexed.
pub const FALLBACK_CHUNK_ID: &str = "fallback";

const DEFAULT_MAX_RETRIES: u32 = 2;
const DEFAULT_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_INITIAL_BACKOFF_MS: u64 = 200;
const DEFAULT_FAILURE_THRESHOLD: u32 = 3;

#[derive(Debug, Clone, Copy)]
pub struct CascadeOptions {
    pub max_retries: u32,
    pub timeout: Duration,
    pub initial_backoff: Duration,
    /// Chunk failures (across sessions) before chunked loading is disabled
    pub failure_threshold: u32,
    pub lock: MutexOptions,
    pub lock_retry: RetryPolicy,
}

impl Default for CascadeOptions {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            initial_backoff: Duration::from_millis(DEFAULT_INITIAL_BACKOFF_MS),
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            lock: MutexOptions::default(),
            lock_retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    PreferredChunks,
    AllChunks,
    FlatStore,
    Baseline,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Strategy::PreferredChunks => "preferred-chunks",
            Strategy::AllChunks => "all-chunks",
            Strategy::FlatStore => "flat-store",
            Strategy::Baseline => "baseline",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct FailureCounter {
    count: u32,
    last_failure_at: Option<DateTime<Utc>>,
}

enum Outcome {
    Found(Vec<Record>),
    /// The strategy worked but holds none of the keys
    Empty,
    Failed(LoadError),
}

pub struct FailsafeCascade {
    loader: ChunkLoader,
    settings: SettingsHandle,
    storage: Arc<dyn SharedStorage>,
    mutex: CrossTabMutex,
    options: CascadeOptions,
    last_strategy: Mutex<Option<Strategy>>,
}

/// Records for `keys`, in request order, without duplicates.
fn pick<'a>(keys: &[String], records: impl Iterator<Item = &'a Record>) -> Vec<Record> {
    let by_key: HashMap<&str, &Record> = records.map(|r| (r.key.as_str(), r)).collect();
    let mut seen = HashSet::new();
    keys.iter()
        .filter(|k| seen.insert(k.as_str()))
        .filter_map(|k| by_key.get(k.as_str()).map(|r| (*r).clone()))
        .collect()
}

/// Pick from whichever chunks loaded. An error is only reported when it may
/// be hiding the requested keys.
fn pick_from_chunks(
    keys: &[String],
    results: Vec<Result<Arc<Chunk>, LoadError>>,
) -> Result<Vec<Record>, LoadError> {
    let mut chunks = Vec::with_capacity(results.len());
    let mut first_err = None;
    for result in results {
        match result {
            Ok(chunk) => chunks.push(chunk),
            Err(e) => {
                first_err.get_or_insert(e);
            }
        }
    }

    let records = pick(keys, chunks.iter().flat_map(|c| c.records.iter()));
    match first_err {
        Some(e) if records.is_empty() => Err(e),
        Some(e) => {
            debug!(error = %e, found = records.len(), "Partial chunk failure");
            Ok(records)
        }
        None => Ok(records),
    }
}

impl FailsafeCascade {
    pub fn new(
        loader: ChunkLoader,
        settings: SettingsHandle,
        storage: Arc<dyn SharedStorage>,
        options: CascadeOptions,
    ) -> Self {
        let mutex = CrossTabMutex::new(Arc::clone(&storage), FAILURE_LOCK_KEY, options.lock);
        Self {
            loader,
            settings,
            storage,
            mutex,
            options,
            last_strategy: Mutex::new(None),
        }
    }

    pub fn options(&self) -> &CascadeOptions {
        &self.options
    }

    /// Strategy that served the most recent `resolve`.
    pub fn last_strategy(&self) -> Option<Strategy> {
        *self.last_strategy.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn note_strategy(&self, strategy: Strategy) {
        *self.last_strategy.lock().unwrap_or_else(PoisonError::into_inner) = Some(strategy);
    }

    /// `resolve` with the configured retry count and timeout.
    pub async fn resolve_default(&self, keys: &[String]) -> Vec<Record> {
        self.resolve(keys, self.options.max_retries, self.options.timeout).await
    }

    /// Best-effort records for `keys`. Never empty: when nothing else works
    /// the baseline set is returned.
    pub async fn resolve(&self, keys: &[String], max_retries: u32, timeout: Duration) -> Vec<Record> {
        self.resolve_with_strategy(keys, max_retries, timeout).await.0
    }

    /// `resolve`, also reporting which strategy produced the records.
    /// Unlike `last_strategy`, the answer belongs to this call even when
    /// other resolutions run concurrently.
    pub async fn resolve_with_strategy(
        &self,
        keys: &[String],
        max_retries: u32,
        timeout: Duration,
    ) -> (Vec<Record>, Strategy) {
        let mut attempts = 0;

        if self.settings.chunked_loading_enabled() {
            match self.run(Strategy::PreferredChunks, keys, max_retries, timeout, &mut attempts).await {
                Outcome::Found(records) => {
                    self.reset_failures().await;
                    return (records, Strategy::PreferredChunks);
                }
                Outcome::Empty => {}
                Outcome::Failed(e) => self.record_chunk_failure(&e).await,
            }
        } else {
            debug!("Chunked loading disabled, skipping preferred chunks");
        }

        if let Outcome::Found(records) =
            self.run(Strategy::AllChunks, keys, max_retries, timeout, &mut attempts).await
        {
            return (records, Strategy::AllChunks);
        }

        if let Outcome::Found(records) =
            self.run(Strategy::FlatStore, keys, max_retries, timeout, &mut attempts).await
        {
            return (records, Strategy::FlatStore);
        }

        let exhausted = CascadeError::Exhausted {
            keys: keys.len(),
            attempts,
        };
        error!(error = %exhausted, "Serving baseline records");
        (self.baseline(), Strategy::Baseline)
    }

    async fn run(
        &self,
        strategy: Strategy,
        keys: &[String],
        max_retries: u32,
        timeout: Duration,
        attempts: &mut u32,
    ) -> Outcome {
        let mut backoff = self.options.initial_backoff;
        let mut attempt = 0;

        loop {
            *attempts += 1;
            let err = match tokio::time::timeout(timeout, self.execute(strategy, keys)).await {
                Ok(Ok(records)) if records.is_empty() => {
                    debug!(strategy = %strategy, "Strategy holds none of the requested keys");
                    return Outcome::Empty;
                }
                Ok(Ok(records)) => {
                    debug!(strategy = %strategy, found = records.len(), requested = keys.len(), "Resolved records");
                    self.note_strategy(strategy);
                    return Outcome::Found(records);
                }
                Ok(Err(e)) => e,
                Err(_) => LoadError::Timeout(timeout.as_millis() as u64),
            };

            if !err.is_retryable() {
                warn!(strategy = %strategy, error = %err, "Strategy failed, escalating");
                return Outcome::Failed(err);
            }
            if attempt >= max_retries {
                warn!(strategy = %strategy, retries = max_retries, error = %err, "Retries exhausted, escalating");
                return Outcome::Failed(err);
            }

            attempt += 1;
            warn!(
                strategy = %strategy,
                retry = attempt,
                backoff_ms = backoff.as_millis() as u64,
                error = %err,
                "Attempt failed, backing off"
            );
            tokio::time::sleep(backoff).await;
            backoff *= 2; // Exponential backoff
        }
    }

    async fn execute(&self, strategy: Strategy, keys: &[String]) -> Result<Vec<Record>, LoadError> {
        match strategy {
            Strategy::PreferredChunks => {
                let index = self.loader.index();
                let mut chunk_ids: Vec<String> = Vec::new();
                for key in keys {
                    let chunk_id = index.resolve_chunk(key);
                    if !chunk_ids.contains(&chunk_id) {
                        chunk_ids.push(chunk_id);
                    }
                }
                pick_from_chunks(keys, self.loader.load_many(&chunk_ids).await)
            }
            Strategy::AllChunks => {
                let chunk_ids = self.loader.registry().ids().to_vec();
                pick_from_chunks(keys, self.loader.load_many(&chunk_ids).await)
            }
            Strategy::FlatStore => {
                let all = self.loader.store().get_all().await?;
                let records = pick(keys, all.iter());
                let index = self.loader.index();
                for record in &records {
                    index.insert_if_absent(&record.key, FALLBACK_CHUNK_ID, IndexProvenance::Fallback);
                }
                Ok(records)
            }
            Strategy::Baseline => Ok(self.baseline()),
        }
    }

    fn baseline(&self) -> Vec<Record> {
        let records = baseline_records();
        let index = self.loader.index();
        for record in &records {
            index.insert_if_absent(&record.key, BASELINE_CHUNK_ID, IndexProvenance::Hardcoded);
        }
        self.note_strategy(Strategy::Baseline);
        records
    }

    fn read_counter(storage: &dyn SharedStorage) -> FailureCounter {
        match get_json::<FailureCounter>(storage, FAILURE_COUNTER_KEY) {
            Ok(counter) => counter.unwrap_or_default(),
            Err(e) => {
                warn!(error = %e, "Resetting unreadable chunk failure counter");
                FailureCounter::default()
            }
        }
    }

    /// Current value of the persisted chunk failure counter.
    pub fn failure_count(&self) -> u32 {
        Self::read_counter(self.storage.as_ref()).count
    }

    async fn record_chunk_failure(&self, cause: &LoadError) {
        let storage = Arc::clone(&self.storage);
        let updated = self
            .mutex
            .with_mutex(
                || async move {
                    let mut counter = Self::read_counter(storage.as_ref());
                    counter.count += 1;
                    counter.last_failure_at = Some(Utc::now());
                    set_json(storage.as_ref(), FAILURE_COUNTER_KEY, &counter)?;
                    Ok::<_, StorageError>(counter.count)
                },
                self.options.lock_retry,
            )
            .await;

        let Some(count) = updated else {
            warn!(error = %cause, "Chunk failure not recorded");
            return;
        };
        warn!(failures = count, threshold = self.options.failure_threshold, error = %cause, "Chunk loading failed");

        if count >= self.options.failure_threshold && self.settings.disable_chunked_loading() {
            warn!(failures = count, "Disabling chunked loading after repeated failures");
            self.settings.persist(self.storage.as_ref());
        }
    }

    async fn reset_failures(&self) {
        if self.failure_count() == 0 {
            return;
        }
        let storage = Arc::clone(&self.storage);
        let cleared = self
            .mutex
            .with_mutex(
                || async move { storage.remove(FAILURE_COUNTER_KEY) },
                self.options.lock_retry,
            )
            .await;
        if cleared.is_some() {
            info!("Chunk loading recovered, failure counter reset");
        }
    }
}
