//! Application configuration management.
//!
//! Configuration is stored at `~/.config/lexicache/config.json`. A missing
//! file means defaults; `LEXICACHE_*` environment variables override a few
//! fields on top of whatever was loaded.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cache::DEFAULT_CAPACITY;
use crate::cascade::CascadeOptions;
use crate::models::{ProficiencyLevel, UserSettings};
use crate::mutex::{MutexOptions, RetryPolicy};
use crate::preload::PreloadOptions;

/// Application name used for config/cache directory paths
const APP_NAME: &str = "lexicache";

/// Config file name
const CONFIG_FILE: &str = "config.json";

const ENV_PREFIX: &str = "LEXICACHE_";

/// Knobs for the cache, cascade, loader and preload loop. Every field has a
/// default so partial files parse.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Tuning {
    pub capacity: usize,
    pub max_retries: u32,
    pub timeout_ms: u64,
    pub initial_backoff_ms: u64,
    pub failure_threshold: u32,
    pub chunk_ttl_secs: u64,
    pub preload_interval_secs: u64,
    pub lock_timeout_secs: u64,
    pub max_error_records: usize,
    pub max_error_categories: usize,
    pub max_mastery_records: usize,
    pub mastery_threshold: f64,
}

impl Default for Tuning {
    fn default() -> Self {
        let cascade = CascadeOptions::default();
        let preload = PreloadOptions::default();
        Self {
            capacity: DEFAULT_CAPACITY,
            max_retries: cascade.max_retries,
            timeout_ms: cascade.timeout.as_millis() as u64,
            initial_backoff_ms: cascade.initial_backoff.as_millis() as u64,
            failure_threshold: cascade.failure_threshold,
            chunk_ttl_secs: 30 * 60,
            preload_interval_secs: 5 * 60,
            lock_timeout_secs: cascade.lock.timeout.as_secs(),
            max_error_records: preload.max_error_records,
            max_error_categories: preload.max_error_categories,
            max_mastery_records: preload.max_mastery_records,
            mastery_threshold: preload.mastery_threshold,
        }
    }
}

impl Tuning {
    pub fn cascade_options(&self) -> CascadeOptions {
        CascadeOptions {
            max_retries: self.max_retries,
            timeout: Duration::from_millis(self.timeout_ms),
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            failure_threshold: self.failure_threshold.max(1),
            lock: MutexOptions {
                timeout: Duration::from_secs(self.lock_timeout_secs),
                ..MutexOptions::default()
            },
            lock_retry: RetryPolicy::default(),
        }
    }

    pub fn preload_options(&self) -> PreloadOptions {
        PreloadOptions {
            max_error_records: self.max_error_records,
            max_error_categories: self.max_error_categories,
            max_mastery_records: self.max_mastery_records,
            mastery_threshold: self.mastery_threshold,
        }
    }

    pub fn chunk_ttl(&self) -> Duration {
        Duration::from_secs(self.chunk_ttl_secs)
    }

    pub fn preload_interval(&self) -> Duration {
        Duration::from_secs(self.preload_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub user_id: Option<String>,
    pub settings: UserSettings,
    /// Chunk registry JSON. Without one every key goes through the heuristic
    pub registry_path: Option<PathBuf>,
    /// Flat JSON array of every record
    pub records_path: Option<PathBuf>,
    /// Directory of `<chunk_id>.json` files
    pub chunk_dir: Option<PathBuf>,
    /// Serves `/chunks/<id>.json` and `/records.json`; wins over the local paths
    pub chunk_base_url: Option<String>,
    pub tuning: Tuning,
}

impl Config {
    /// Load from the default location, then apply environment overrides.
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        let mut config = Self::load_from(&path)?;
        config.apply_env();
        Ok(config)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config {}", path.display()))?;
            let config = serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse config {}", path.display()))?;
            debug!(path = %path.display(), "Loaded config");
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)
            .with_context(|| format!("Failed to write config {}", path.display()))?;
        Ok(())
    }

    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Per-user cache directory. Holds shared storage and logs.
    pub fn cache_dir(&self) -> Result<PathBuf> {
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;

        let mut path = cache_dir.join(APP_NAME);
        if let Some(ref user) = self.user_id {
            path = path.join(user);
        }
        Ok(path)
    }

    pub fn storage_dir(&self) -> Result<PathBuf> {
        Ok(self.cache_dir()?.join("shared"))
    }

    pub fn apply_env(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    /// Apply `LEXICACHE_*` overrides using `lookup` to read variables.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let var = |suffix: &str| lookup(&format!("{}{}", ENV_PREFIX, suffix)).filter(|v| !v.is_empty());

        if let Some(user_id) = var("USER_ID") {
            self.user_id = Some(user_id);
        }
        if let Some(url) = var("CHUNK_BASE_URL") {
            self.chunk_base_url = Some(url);
        }
        if let Some(path) = var("REGISTRY_PATH") {
            self.registry_path = Some(PathBuf::from(path));
        }
        if let Some(path) = var("RECORDS_PATH") {
            self.records_path = Some(PathBuf::from(path));
        }
        if let Some(path) = var("CHUNK_DIR") {
            self.chunk_dir = Some(PathBuf::from(path));
        }
        if let Some(level) = var("LEVEL") {
            match ProficiencyLevel::parse(&level) {
                Some(level) => self.settings.level = level,
                None => warn!(value = %level, "Ignoring unknown LEXICACHE_LEVEL"),
            }
        }
        if let Some(enabled) = var("CHUNKED_LOADING") {
            match enabled.to_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => self.settings.enable_chunked_loading = true,
                "0" | "false" | "no" | "off" => self.settings.enable_chunked_loading = false,
                _ => warn!(value = %enabled, "Ignoring unparsable LEXICACHE_CHUNKED_LOADING"),
            }
        }
        if let Some(capacity) = var("CAPACITY") {
            match capacity.parse() {
                Ok(capacity) => self.tuning.capacity = capacity,
                Err(_) => warn!(value = %capacity, "Ignoring unparsable LEXICACHE_CAPACITY"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: Config = serde_json::from_str(r#"{"user_id": "learner-1", "tuning": {"capacity": 50}}"#).unwrap();
        assert_eq!(config.user_id.as_deref(), Some("learner-1"));
        assert_eq!(config.tuning.capacity, 50);
        assert_eq!(config.tuning.max_retries, Tuning::default().max_retries);
        assert!(config.settings.enable_chunked_loading);
    }

    #[test]
    fn test_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_from(&dir.path().join("config.json")).unwrap();
        assert!(config.user_id.is_none());
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let mut config = Config::default();
        config.chunk_base_url = Some("https://example.org/vocab".to_string());
        config.settings.level = ProficiencyLevel::Advanced;
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.chunk_base_url, config.chunk_base_url);
        assert_eq!(loaded.settings.level, ProficiencyLevel::Advanced);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("LEXICACHE_USER_ID", "learner-2"),
            ("LEXICACHE_LEVEL", "B1"),
            ("LEXICACHE_CHUNKED_LOADING", "off"),
            ("LEXICACHE_CAPACITY", "not-a-number"),
            ("LEXICACHE_CHUNK_DIR", ""),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_overrides(|name| env.get(name).map(|v| v.to_string()));
        assert_eq!(config.user_id.as_deref(), Some("learner-2"));
        assert_eq!(config.settings.level, ProficiencyLevel::Intermediate);
        assert!(!config.settings.enable_chunked_loading);
        assert_eq!(config.tuning.capacity, DEFAULT_CAPACITY);
        assert!(config.chunk_dir.is_none());
    }

    #[test]
    fn test_tuning_converts_to_options() {
        let tuning = Tuning {
            timeout_ms: 750,
            failure_threshold: 0,
            ..Tuning::default()
        };
        let options = tuning.cascade_options();
        assert_eq!(options.timeout, Duration::from_millis(750));
        assert_eq!(options.failure_threshold, 1);
    }
}
