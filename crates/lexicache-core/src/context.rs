//! The [`VocabularyCache`] context object.
//!
//! Owns the registry, key index, loader, cascade, predictive cache and
//! preload orchestrator, and the periodic task that re-runs preload and
//! sweeps expired chunks between `start()` and `stop()`.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context as _, Result};
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::{CacheStats, PredictiveCache};
use crate::cascade::{baseline_records, FailsafeCascade, Strategy};
use crate::config::{Config, Tuning};
use crate::loader::{ChunkLoader, LoaderStats};
use crate::models::{Record, UserSettings};
use crate::preload::{ErrorAnalytics, MasteryStore, PreloadOrchestrator, PreloadReport, Scheduler};
use crate::registry::metadata::CRITICAL_PRIORITY;
use crate::registry::{ChunkHeuristic, ChunkRegistry, KeyIndex, SuffixHeuristic};
use crate::settings::SettingsHandle;
use crate::source::{
    ChunkSource, DirectoryChunkSource, HttpChunkSource, HttpRecordStore, JsonFileRecordStore,
    MemoryRecordStore, NoChunkSource, RecordStore,
};
use crate::storage::{FileStorage, MemoryStorage, SharedStorage};

/// Cache priority for records pulled in by `ensure_loaded`.
const DEFAULT_PRIORITY_HINT: f64 = 0.5;

/// External services the cache is built on.
#[derive(Clone)]
pub struct Collaborators {
    pub source: Arc<dyn ChunkSource>,
    pub store: Arc<dyn RecordStore>,
    pub storage: Arc<dyn SharedStorage>,
    pub scheduler: Option<Arc<dyn Scheduler>>,
    pub analytics: Option<Arc<dyn ErrorAnalytics>>,
    pub mastery: Option<Arc<dyn MasteryStore>>,
}

impl Collaborators {
    pub fn new(
        source: Arc<dyn ChunkSource>,
        store: Arc<dyn RecordStore>,
        storage: Arc<dyn SharedStorage>,
    ) -> Self {
        Self {
            source,
            store,
            storage,
            scheduler: None,
            analytics: None,
            mastery: None,
        }
    }

    /// Sources and storage described by `config`. A base URL wins over local
    /// paths; with neither, chunks cannot be fetched and the record store is
    /// empty, leaving only the baseline.
    pub fn from_config(config: &Config) -> Result<Self> {
        let (source, store): (Arc<dyn ChunkSource>, Arc<dyn RecordStore>) =
            match config.chunk_base_url.as_deref() {
                Some(base_url) => {
                    let source = HttpChunkSource::new(base_url).context("Failed to build chunk source")?;
                    let store: Arc<dyn RecordStore> = match &config.records_path {
                        Some(path) => Arc::new(JsonFileRecordStore::new(path.clone())),
                        None => Arc::new(HttpRecordStore::new(base_url).context("Failed to build record store")?),
                    };
                    (Arc::new(source), store)
                }
                None => {
                    let source: Arc<dyn ChunkSource> = match &config.chunk_dir {
                        Some(dir) => Arc::new(DirectoryChunkSource::new(dir.clone())),
                        None => Arc::new(NoChunkSource),
                    };
                    let store: Arc<dyn RecordStore> = match &config.records_path {
                        Some(path) => Arc::new(JsonFileRecordStore::new(path.clone())),
                        None => Arc::new(MemoryRecordStore::default()),
                    };
                    (source, store)
                }
            };

        let storage_dir = config.storage_dir()?;
        let storage = FileStorage::new(storage_dir.clone())
            .with_context(|| format!("Failed to open shared storage at {}", storage_dir.display()))?;

        Ok(Self::new(source, store, Arc::new(storage)))
    }

    pub fn with_scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn with_analytics(mut self, analytics: Arc<dyn ErrorAnalytics>) -> Self {
        self.analytics = Some(analytics);
        self
    }

    pub fn with_mastery(mut self, mastery: Arc<dyn MasteryStore>) -> Self {
        self.mastery = Some(mastery);
        self
    }
}

pub struct VocabularyCacheBuilder {
    collaborators: Collaborators,
    registry: ChunkRegistry,
    settings: UserSettings,
    user_id: Option<String>,
    tuning: Tuning,
    heuristic: Option<Box<dyn ChunkHeuristic>>,
}

impl VocabularyCacheBuilder {
    pub fn new(collaborators: Collaborators) -> Self {
        Self {
            collaborators,
            registry: ChunkRegistry::default(),
            settings: UserSettings::default(),
            user_id: None,
            tuning: Tuning::default(),
            heuristic: None,
        }
    }

    pub fn registry(mut self, registry: ChunkRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn settings(mut self, settings: UserSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn tuning(mut self, tuning: Tuning) -> Self {
        self.tuning = tuning;
        self
    }

    /// Replace the suffix heuristic used for keys the registry does not list.
    pub fn heuristic(mut self, heuristic: Box<dyn ChunkHeuristic>) -> Self {
        self.heuristic = Some(heuristic);
        self
    }

    /// Settings, user and tuning from `config`.
    pub fn config(mut self, config: &Config) -> Self {
        self.settings = config.settings.clone();
        self.user_id = config.user_id.clone();
        self.tuning = config.tuning.clone();
        self
    }

    pub fn build(self) -> VocabularyCache {
        let Collaborators {
            source,
            store,
            storage,
            scheduler,
            analytics,
            mastery,
        } = self.collaborators;

        let registry = Arc::new(self.registry);
        let heuristic = self.heuristic.unwrap_or_else(|| Box::new(SuffixHeuristic));
        let index = Arc::new(KeyIndex::from_registry(&registry, heuristic));
        let loader = ChunkLoader::new(Arc::clone(&registry), index, source, store);

        let settings = SettingsHandle::new(self.settings);
        settings.adopt_persisted(storage.as_ref());

        let cascade = FailsafeCascade::new(
            loader.clone(),
            settings.clone(),
            Arc::clone(&storage),
            self.tuning.cascade_options(),
        );

        let cache = Arc::new(PredictiveCache::new(self.tuning.capacity));
        let mut preload = PreloadOrchestrator::new(loader.clone(), Arc::clone(&cache), self.tuning.preload_options());
        if let Some(scheduler) = scheduler {
            preload = preload.with_scheduler(scheduler);
        }
        if let Some(analytics) = analytics {
            preload = preload.with_analytics(analytics);
        }
        if let Some(mastery) = mastery {
            preload = preload.with_mastery(mastery);
        }

        info!(
            chunks = registry.len(),
            capacity = self.tuning.capacity,
            chunked = settings.chunked_loading_enabled(),
            "Vocabulary cache ready"
        );

        VocabularyCache {
            loader,
            cascade,
            cache,
            preload: Arc::new(preload),
            settings,
            user_id: self.user_id,
            tuning: self.tuning,
            background: Mutex::new(None),
        }
    }
}

/// Combined statistics for the `stats` surface.
#[derive(Debug, Clone, Serialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct VocabularyStats {
    pub hit_rate: f64,
    pub chunks_loaded: usize,
    pub avg_load_time_ms: f64,
    pub indexed_keys: usize,
    pub chunked_loading_enabled: bool,
    pub chunk_failures: u32,
    pub last_strategy: Option<String>,
    pub loader: LoaderStats,
    pub cache: CacheStats,
}

struct BackgroundTask {
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

pub struct VocabularyCache {
    loader: ChunkLoader,
    cascade: FailsafeCascade,
    cache: Arc<PredictiveCache>,
    preload: Arc<PreloadOrchestrator>,
    settings: SettingsHandle,
    user_id: Option<String>,
    tuning: Tuning,
    background: Mutex<Option<BackgroundTask>>,
}

impl VocabularyCache {
    pub fn builder(collaborators: Collaborators) -> VocabularyCacheBuilder {
        VocabularyCacheBuilder::new(collaborators)
    }

    /// Build with in-memory storage and no chunk source. Everything comes
    /// from `store`.
    pub fn in_memory(registry: ChunkRegistry, store: Arc<dyn RecordStore>) -> Self {
        let collaborators = Collaborators::new(Arc::new(NoChunkSource), store, Arc::new(MemoryStorage::new()));
        Self::builder(collaborators).registry(registry).build()
    }

    pub fn loader(&self) -> &ChunkLoader {
        &self.loader
    }

    pub fn cascade(&self) -> &FailsafeCascade {
        &self.cascade
    }

    pub fn settings(&self) -> &SettingsHandle {
        &self.settings
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    /// Records for `keys`, best effort. Cached keys are served directly; the
    /// rest go through the cascade. Never empty: if nothing can be found, or
    /// nothing was asked for, the baseline records come back instead.
    ///
    /// Only records found in real data are cached. Baseline stand-ins would
    /// otherwise shadow the real records once the sources recover.
    pub async fn ensure_loaded(&self, keys: &[String]) -> Vec<Record> {
        if keys.is_empty() {
            debug!("Empty request, serving baseline records");
            return baseline_records();
        }

        let mut seen = HashSet::new();
        let mut cached: HashMap<&str, Record> = HashMap::new();
        let mut missing: Vec<String> = Vec::new();
        for key in keys {
            if !seen.insert(key.as_str()) {
                continue;
            }
            match self.cache.get(key) {
                Some(record) => {
                    cached.insert(key.as_str(), record);
                }
                None => missing.push(key.clone()),
            }
        }

        let (resolved, strategy) = if missing.is_empty() {
            (Vec::new(), None)
        } else {
            debug!(cached = cached.len(), missing = missing.len(), "Resolving uncached keys");
            let options = self.cascade.options();
            let (records, strategy) = self
                .cascade
                .resolve_with_strategy(&missing, options.max_retries, options.timeout)
                .await;
            (records, Some(strategy))
        };
        let cacheable = strategy.is_some_and(|s| s != Strategy::Baseline);

        let mut by_key: HashMap<String, Record> = HashMap::with_capacity(resolved.len());
        let mut extras = Vec::new();
        for record in resolved {
            if seen.contains(record.key.as_str()) {
                if cacheable && !self.cache.contains(&record.key) {
                    self.cache.set(&record.key, record.clone(), DEFAULT_PRIORITY_HINT);
                }
                by_key.insert(record.key.clone(), record);
            } else {
                extras.push(record);
            }
        }

        // Request order first, then whatever the baseline added
        let mut out: Vec<Record> = Vec::with_capacity(seen.len() + extras.len());
        let mut emitted = HashSet::new();
        for key in keys {
            if !emitted.insert(key.as_str()) {
                continue;
            }
            if let Some(record) = cached.remove(key.as_str()).or_else(|| by_key.remove(key)) {
                out.push(record);
            }
        }
        out.extend(extras);
        out
    }

    /// A record that is already in memory, from the cache or a resident
    /// chunk. Never triggers a load.
    pub fn get_by_key(&self, key: &str) -> Option<Record> {
        if let Some(record) = self.cache.get(key) {
            return Some(record);
        }
        let chunk_id = self.loader.index().resolve_chunk(key);
        let record = self.loader.get_resident(&chunk_id)?.get(key).cloned()?;
        self.cache.set(key, record.clone(), DEFAULT_PRIORITY_HINT);
        Some(record)
    }

    pub fn stats(&self) -> VocabularyStats {
        let loader = self.loader.stats();
        VocabularyStats {
            hit_rate: loader.hit_rate,
            chunks_loaded: loader.chunks_loaded,
            avg_load_time_ms: loader.avg_load_time_ms,
            indexed_keys: self.loader.index().len(),
            chunked_loading_enabled: self.settings.chunked_loading_enabled(),
            chunk_failures: self.cascade.failure_count(),
            last_strategy: self.cascade.last_strategy().map(|s| s.to_string()),
            loader,
            cache: self.cache.stats(),
        }
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub async fn smart_preload(&self, settings: &UserSettings, user_id: Option<&str>) -> PreloadReport {
        self.preload.smart_preload(settings, user_id).await
    }

    /// `smart_preload` with the live settings and configured user.
    pub async fn preload_now(&self) -> PreloadReport {
        self.smart_preload(&self.settings.snapshot(), self.user_id.as_deref()).await
    }

    /// Load the critical chunks, then spawn the periodic preload and TTL
    /// sweep. Returns how many critical chunks loaded. Calling `start` on a
    /// running cache does nothing.
    pub async fn start(&self) -> usize {
        if self.is_running() {
            warn!("Vocabulary cache already started");
            return 0;
        }

        let critical = if self.settings.chunked_loading_enabled() {
            let ids: Vec<String> = self
                .loader
                .registry()
                .chunks_up_to_priority(CRITICAL_PRIORITY)
                .into_iter()
                .map(|m| m.id.clone())
                .collect();
            let loaded = self.loader.load_many(&ids).await.iter().filter(|r| r.is_ok()).count();
            info!(loaded = loaded, requested = ids.len(), "Critical chunks warmed");
            loaded
        } else {
            0
        };

        let (shutdown, mut shutdown_rx) = oneshot::channel();
        let loader = self.loader.clone();
        let preload = Arc::clone(&self.preload);
        let settings = self.settings.clone();
        let user_id = self.user_id.clone();
        let ttl = self.tuning.chunk_ttl();
        let period = self.tuning.preload_interval();

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = interval.tick() => {
                        let evicted = loader.evict_expired(ttl);
                        let report = preload.smart_preload(&settings.snapshot(), user_id.as_deref()).await;
                        debug!(evicted = evicted, warmed = report.total(), "Background maintenance");
                    }
                }
            }
            debug!("Background maintenance stopped");
        });

        *self.background.lock().unwrap_or_else(PoisonError::into_inner) = Some(BackgroundTask { shutdown, handle });
        critical
    }

    pub fn is_running(&self) -> bool {
        self.background
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|task| !task.handle.is_finished())
    }

    /// Stop the periodic task and wait for it to finish.
    pub async fn stop(&self) {
        let task = self.background.lock().unwrap_or_else(PoisonError::into_inner).take();
        let Some(task) = task else {
            return;
        };
        // The receiver is gone only if the task already exited
        let _ = task.shutdown.send(());
        if let Err(e) = task.handle.await {
            warn!(error = %e, "Background maintenance task failed");
        }
        info!("Vocabulary cache stopped");
    }
}

impl Drop for VocabularyCache {
    fn drop(&mut self) {
        let task = self.background.get_mut().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(task) = task {
            task.handle.abort();
        }
    }
}
