//! Core library for lexicache.
//!
//! Serves vocabulary records (one record per lemma) out of independently
//! loadable chunks without ever blocking on the full dataset, and without
//! ever returning "no data":
//!
//! - [`registry`]: static chunk metadata and the key → chunk index
//! - [`loader`]: coalescing chunk loader with record-store derivation
//! - [`cascade`]: four-step failsafe ladder ending in a hardcoded baseline
//! - [`cache`]: mastery-aware predictive cache
//! - [`preload`]: settings / SRS / error / mastery driven warm-up
//! - [`mutex`]: cross-process lock over [`storage::SharedStorage`]
//! - [`context`]: the [`VocabularyCache`] that wires everything together

pub mod cache;
pub mod cascade;
pub mod config;
pub mod context;
pub mod error;
pub mod loader;
pub mod models;
pub mod mutex;
pub mod preload;
pub mod registry;
pub mod settings;
pub mod source;
pub mod storage;

#[cfg(test)]
mod testing;

pub use cache::{CacheStats, PredictiveCache};
pub use cascade::{CascadeOptions, FailsafeCascade, Strategy};
pub use config::{Config, Tuning};
pub use context::{Collaborators, VocabularyCache, VocabularyCacheBuilder, VocabularyStats};
pub use error::{CascadeError, LoadError, LockError, StorageError};
pub use loader::{ChunkLoader, LoaderStats};
pub use models::{Chunk, ErrorCombo, MasteryRecord, ProficiencyLevel, Record, UserSettings};
pub use mutex::{CrossTabMutex, LockRecord, MutexOptions, RetryPolicy};
pub use preload::{ErrorAnalytics, MasteryStore, PreloadOptions, PreloadOrchestrator, PreloadReport, Scheduler};
pub use registry::{ChunkHeuristic, ChunkMetadata, ChunkRegistry, IndexProvenance, KeyIndex, SuffixHeuristic};
pub use settings::SettingsHandle;
pub use source::{ChunkSource, RecordStore};
pub use storage::{FileStorage, MemoryStorage, SharedStorage};
