//! Smart preload.
//!
//! Four independent passes warm chunks (and the predictive cache) ahead of
//! demand:
//!
//! - settings: chunks implied by proficiency level and preferred category
//! - SRS: chunks holding the learner's due keys
//! - error: records from the learner's highest-impact error categories
//! - mastery: the weakest keys, cached with priority `1 - score`
//!
//! Passes run concurrently and fail independently.

pub mod collaborators;
pub mod rules;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cache::PredictiveCache;
use crate::loader::ChunkLoader;
use crate::models::{Chunk, UserSettings};

pub use collaborators::{ErrorAnalytics, MasteryStore, Scheduler};
pub use rules::PreloadPlan;

const DEFAULT_MAX_ERROR_RECORDS: usize = 20;
const DEFAULT_MAX_ERROR_CATEGORIES: usize = 3;
const DEFAULT_MAX_MASTERY_RECORDS: usize = 30;
const DEFAULT_MASTERY_THRESHOLD: f64 = 0.6;

/// Cache priority for records that are due for review.
const DUE_PRIORITY: f64 = 1.0;

#[derive(Debug, Clone, Copy)]
pub struct PreloadOptions {
    pub max_error_records: usize,
    pub max_error_categories: usize,
    pub max_mastery_records: usize,
    /// Keys scoring below this count as weak
    pub mastery_threshold: f64,
}

impl Default for PreloadOptions {
    fn default() -> Self {
        Self {
            max_error_records: DEFAULT_MAX_ERROR_RECORDS,
            max_error_categories: DEFAULT_MAX_ERROR_CATEGORIES,
            max_mastery_records: DEFAULT_MAX_MASTERY_RECORDS,
            mastery_threshold: DEFAULT_MASTERY_THRESHOLD,
        }
    }
}

/// What one `smart_preload` warmed. `settings_driven` counts chunks, the
/// other passes count records placed in the cache.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct PreloadReport {
    pub settings_driven: usize,
    pub srs_driven: usize,
    pub error_driven: usize,
    pub mastery_driven: usize,
    pub total_time_ms: u64,
}

impl PreloadReport {
    pub fn total(&self) -> usize {
        self.settings_driven + self.srs_driven + self.error_driven + self.mastery_driven
    }
}

pub struct PreloadOrchestrator {
    loader: ChunkLoader,
    cache: Arc<PredictiveCache>,
    scheduler: Option<Arc<dyn Scheduler>>,
    analytics: Option<Arc<dyn ErrorAnalytics>>,
    mastery: Option<Arc<dyn MasteryStore>>,
    options: PreloadOptions,
}

impl PreloadOrchestrator {
    pub fn new(loader: ChunkLoader, cache: Arc<PredictiveCache>, options: PreloadOptions) -> Self {
        Self {
            loader,
            cache,
            scheduler: None,
            analytics: None,
            mastery: None,
            options,
        }
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

    pub async fn smart_preload(&self, settings: &UserSettings, user_id: Option<&str>) -> PreloadReport {
        let started = Instant::now();

        if !settings.enable_chunked_loading {
            debug!("Chunked loading disabled, skipping preload");
            return PreloadReport::default();
        }

        let (settings_res, srs_res, error_res, mastery_res) = tokio::join!(
            self.settings_pass(settings),
            self.srs_pass(user_id),
            self.error_pass(user_id),
            self.mastery_pass(user_id),
        );

        let report = PreloadReport {
            settings_driven: settings_res,
            srs_driven: Self::count_or_zero("srs", srs_res),
            error_driven: Self::count_or_zero("error", error_res),
            mastery_driven: Self::count_or_zero("mastery", mastery_res),
            total_time_ms: started.elapsed().as_millis() as u64,
        };
        info!(
            settings = report.settings_driven,
            srs = report.srs_driven,
            errors = report.error_driven,
            mastery = report.mastery_driven,
            elapsed_ms = report.total_time_ms,
            "Preload complete"
        );
        report
    }

    fn count_or_zero(pass: &str, result: anyhow::Result<usize>) -> usize {
        match result {
            Ok(count) => count,
            Err(e) => {
                warn!(pass = pass, error = %e, "Preload pass failed");
                0
            }
        }
    }

    /// Load chunks one at a time, yielding in between. Failed chunks are
    /// skipped.
    async fn load_sequential(&self, chunk_ids: &[String]) -> Vec<Arc<Chunk>> {
        let mut chunks = Vec::with_capacity(chunk_ids.len());
        for chunk_id in chunk_ids {
            match self.loader.load(chunk_id).await {
                Ok(chunk) => chunks.push(chunk),
                Err(e) => debug!(chunk = %chunk_id, error = %e, "Preload skipped chunk"),
            }
            tokio::task::yield_now().await;
        }
        chunks
    }

    /// Cache each key with its priority. Returns how many were found.
    async fn warm_keys(&self, keys: &[(String, f64)]) -> usize {
        let index = self.loader.index();
        let mut plan = PreloadPlan::default();
        for (key, _) in keys {
            plan.push(index.resolve_chunk(key));
        }

        let chunks = self.load_sequential(plan.chunk_ids()).await;
        let mut warmed = 0;
        for (key, priority) in keys {
            if let Some(record) = chunks.iter().find_map(|c| c.get(key)) {
                self.cache.set(key, record.clone(), *priority);
                warmed += 1;
            }
        }
        warmed
    }

    async fn settings_pass(&self, settings: &UserSettings) -> usize {
        let plan = PreloadPlan::for_settings(self.loader.registry(), settings);
        let loaded = self.load_sequential(plan.chunk_ids()).await.len();
        debug!(planned = plan.chunk_ids().len(), loaded = loaded, level = settings.level.display_name(), "Settings preload");
        loaded
    }

    async fn srs_pass(&self, user_id: Option<&str>) -> anyhow::Result<usize> {
        let (Some(scheduler), Some(user_id)) = (&self.scheduler, user_id) else {
            return Ok(0);
        };
        let due = scheduler.get_due_keys(user_id).await?;
        let keys: Vec<(String, f64)> = due.into_iter().map(|k| (k, DUE_PRIORITY)).collect();
        Ok(self.warm_keys(&keys).await)
    }

    async fn error_pass(&self, user_id: Option<&str>) -> anyhow::Result<usize> {
        let (Some(analytics), Some(user_id)) = (&self.analytics, user_id) else {
            return Ok(0);
        };
        let combos = rules::top_error_combos(
            analytics.get_error_prone_combos(user_id).await?,
            self.options.max_error_categories,
        );
        let Some(max_impact) = combos.first().map(|c| c.impact) else {
            return Ok(0);
        };

        let registry = self.loader.registry();
        let mut plan = PreloadPlan::default();
        let mut impact_by_chunk: HashMap<String, f64> = HashMap::new();
        for combo in &combos {
            for meta in registry.chunks_with_category(&combo.category) {
                plan.push(meta.id.as_str());
                // Combos are sorted, so the first impact seen is the largest
                impact_by_chunk.entry(meta.id.clone()).or_insert(combo.impact);
            }
        }

        let mut warmed = 0;
        'chunks: for chunk in self.load_sequential(plan.chunk_ids()).await {
            let impact = impact_by_chunk.get(&chunk.id).copied().unwrap_or(0.0);
            for record in &chunk.records {
                if warmed >= self.options.max_error_records {
                    break 'chunks;
                }
                if self.cache.contains(&record.key) {
                    continue;
                }
                self.cache.set(&record.key, record.clone(), impact / max_impact);
                warmed += 1;
            }
        }
        Ok(warmed)
    }

    async fn mastery_pass(&self, user_id: Option<&str>) -> anyhow::Result<usize> {
        let (Some(mastery), Some(user_id)) = (&self.mastery, user_id) else {
            return Ok(0);
        };
        let weakest = rules::weakest_keys(
            mastery.get_mastery_records(user_id).await?,
            self.options.mastery_threshold,
            self.options.max_mastery_records,
        );
        let keys: Vec<(String, f64)> = weakest.into_iter().map(|r| (r.key, 1.0 - r.score)).collect();
        Ok(self.warm_keys(&keys).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use futures::future::{BoxFuture, FutureExt};

    use crate::models::{ErrorCombo, MasteryRecord, ProficiencyLevel};
    use crate::registry::{KeyIndex, SuffixHeuristic};
    use crate::testing::{sample_registry, sample_store, ScriptedSource};

    struct FailingScheduler;

    impl Scheduler for FailingScheduler {
        fn get_due_keys<'a>(&'a self, _user_id: &'a str) -> BoxFuture<'a, anyhow::Result<Vec<String>>> {
            async { Err(anyhow!("scheduler unavailable")) }.boxed()
        }
    }

    struct DueKeys(Vec<&'static str>);

    impl Scheduler for DueKeys {
        fn get_due_keys<'a>(&'a self, _user_id: &'a str) -> BoxFuture<'a, anyhow::Result<Vec<String>>> {
            let keys: Vec<String> = self.0.iter().map(|k| k.to_string()).collect();
            async move { Ok(keys) }.boxed()
        }
    }

    struct Combos(Vec<ErrorCombo>);

    impl ErrorAnalytics for Combos {
        fn get_error_prone_combos<'a>(&'a self, _user_id: &'a str) -> BoxFuture<'a, anyhow::Result<Vec<ErrorCombo>>> {
            let combos = self.0.clone();
            async move { Ok(combos) }.boxed()
        }
    }

    struct Scores(Vec<MasteryRecord>);

    impl MasteryStore for Scores {
        fn get_mastery_records<'a>(&'a self, _user_id: &'a str) -> BoxFuture<'a, anyhow::Result<Vec<MasteryRecord>>> {
            let records = self.0.clone();
            async move { Ok(records) }.boxed()
        }
    }

    fn orchestrator() -> (PreloadOrchestrator, ChunkLoader, Arc<PredictiveCache>) {
        let registry = Arc::new(sample_registry());
        let index = Arc::new(KeyIndex::from_registry(&registry, Box::new(SuffixHeuristic)));
        let loader = ChunkLoader::new(
            registry,
            index,
            Arc::new(ScriptedSource::sample()),
            Arc::new(sample_store()),
        );
        let cache = Arc::new(PredictiveCache::new(10));
        let orchestrator = PreloadOrchestrator::new(loader.clone(), Arc::clone(&cache), PreloadOptions::default());
        (orchestrator, loader, cache)
    }

    #[tokio::test]
    async fn test_failing_scheduler_does_not_stop_settings_pass() {
        let (orchestrator, loader, _cache) = orchestrator();
        let orchestrator = orchestrator.with_scheduler(Arc::new(FailingScheduler));

        let report = orchestrator.smart_preload(&UserSettings::default(), Some("learner-1")).await;
        assert!(report.settings_driven > 0);
        assert_eq!(report.srs_driven, 0);
        assert!(loader.is_loaded("core"));
    }

    #[tokio::test]
    async fn test_srs_pass_caches_due_records_at_top_priority() {
        let (orchestrator, _loader, cache) = orchestrator();
        let orchestrator = orchestrator.with_scheduler(Arc::new(DueKeys(vec!["traer", "hablar", "ghost"])));

        let report = orchestrator.smart_preload(&UserSettings::default(), Some("learner-1")).await;
        assert_eq!(report.srs_driven, 2);
        assert_eq!(cache.priority_of("traer"), Some(1.0));
        assert!(cache.contains("hablar"));
        assert!(!cache.contains("ghost"));
    }

    #[tokio::test]
    async fn test_learner_passes_need_a_user() {
        let (orchestrator, _loader, cache) = orchestrator();
        let orchestrator = orchestrator.with_scheduler(Arc::new(DueKeys(vec!["traer"])));

        let report = orchestrator.smart_preload(&UserSettings::default(), None).await;
        assert_eq!(report.srs_driven, 0);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_error_pass_warms_category_records() {
        let (orchestrator, _loader, cache) = orchestrator();
        let orchestrator = orchestrator.with_analytics(Arc::new(Combos(vec![
            ErrorCombo { category: "preterite".into(), impact: 0.8 },
            ErrorCombo { category: "subjunctive".into(), impact: 0.4 },
        ])));

        let report = orchestrator.smart_preload(&UserSettings::default(), Some("learner-1")).await;
        assert_eq!(report.error_driven, 1);
        assert_eq!(cache.priority_of("traer"), Some(1.0));
    }

    #[tokio::test]
    async fn test_mastery_pass_prioritises_weak_keys() {
        let (orchestrator, _loader, cache) = orchestrator();
        let orchestrator = orchestrator.with_mastery(Arc::new(Scores(vec![
            MasteryRecord { key: "ser".into(), score: 0.25 },
            MasteryRecord { key: "estar".into(), score: 0.95 },
        ])));

        let settings = UserSettings {
            level: ProficiencyLevel::Advanced,
            ..UserSettings::default()
        };
        let report = orchestrator.smart_preload(&settings, Some("learner-1")).await;
        assert_eq!(report.settings_driven, 2);
        assert_eq!(report.mastery_driven, 1);
        assert_eq!(cache.priority_of("ser"), Some(0.75));
        assert!(!cache.contains("estar"));
    }

    #[tokio::test]
    async fn test_disabled_chunking_skips_preload() {
        let (orchestrator, loader, _cache) = orchestrator();
        let settings = UserSettings {
            enable_chunked_loading: false,
            ..UserSettings::default()
        };
        let report = orchestrator.smart_preload(&settings, Some("learner-1")).await;
        assert_eq!(report.total(), 0);
        assert!(loader.loaded_ids().is_empty());
    }
}
