//! Shared, mostly read-only view of the learner's settings.
//!
//! Everything may read; only the cascade's degradation path may write, which
//! is why the mutator is crate-private.

use std::sync::{Arc, PoisonError, RwLock};

use tracing::warn;

use crate::models::UserSettings;
use crate::storage::{get_json, set_json, SharedStorage};

/// Shared storage key holding the last persisted (degraded) settings.
pub const SETTINGS_STORAGE_KEY: &str = "lexicache:user-settings";

#[derive(Debug, Clone, Default)]
pub struct SettingsHandle {
    inner: Arc<RwLock<UserSettings>>,
}

impl SettingsHandle {
    pub fn new(settings: UserSettings) -> Self {
        Self {
            inner: Arc::new(RwLock::new(settings)),
        }
    }

    pub fn snapshot(&self) -> UserSettings {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn chunked_loading_enabled(&self) -> bool {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .enable_chunked_loading
    }

    /// Turn chunked loading off. Returns false if it already was.
    pub(crate) fn disable_chunked_loading(&self) -> bool {
        let mut settings = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let changed = settings.enable_chunked_loading;
        settings.enable_chunked_loading = false;
        changed
    }

    /// Write the current settings where other processes can see them.
    pub(crate) fn persist(&self, storage: &dyn SharedStorage) {
        if let Err(e) = set_json(storage, SETTINGS_STORAGE_KEY, &self.snapshot()) {
            warn!(error = %e, "Failed to persist user settings");
        }
    }

    /// Apply a degradation another process persisted earlier.
    pub(crate) fn adopt_persisted(&self, storage: &dyn SharedStorage) {
        match get_json::<UserSettings>(storage, SETTINGS_STORAGE_KEY) {
            Ok(Some(persisted)) if !persisted.enable_chunked_loading => {
                if self.disable_chunked_loading() {
                    warn!("Chunked loading was disabled by an earlier session");
                }
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Ignoring unreadable persisted settings"),
        }
    }
}
