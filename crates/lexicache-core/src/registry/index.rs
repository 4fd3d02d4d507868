use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::ChunkRegistry;

/// How a key ended up in the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexProvenance {
    /// Built from registry membership at startup
    Registry,
    /// Discovered while deriving a chunk the registry does not describe
    Supplement,
    /// Found by importing the flat record store
    Fallback,
    /// Served from the built-in baseline set
    Hardcoded,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub chunk_id: String,
    pub provenance: IndexProvenance,
}

/// Maps keys the registry does not know about onto some chunk id.
///
/// Intentionally approximate: a wrong guess only costs a derivation from
/// the record store.
pub trait ChunkHeuristic: Send + Sync {
    fn bucket(&self, key: &str) -> String;
}

impl<F> ChunkHeuristic for F
where
    F: Fn(&str) -> String + Send + Sync,
{
    fn bucket(&self, key: &str) -> String {
        self(key)
    }
}

/// Buckets unregistered keys by their infinitive ending.
#[derive(Debug, Clone, Copy, Default)]
pub struct SuffixHeuristic;

impl SuffixHeuristic {
    pub const REFLEXIVE: &'static str = "bucket-reflexive";
    pub const AR: &'static str = "bucket-ar";
    pub const ER: &'static str = "bucket-er";
    pub const IR: &'static str = "bucket-ir";
    pub const MISC: &'static str = "bucket-misc";
}

impl ChunkHeuristic for SuffixHeuristic {
    fn bucket(&self, key: &str) -> String {
        let lower = key.trim().to_lowercase();
        let bucket = if lower.chars().count() > 4 && lower.ends_with("se") {
            Self::REFLEXIVE
        } else if lower.ends_with("ar") {
            Self::AR
        } else if lower.ends_with("er") {
            Self::ER
        } else if lower.ends_with("ir") || lower.ends_with("ír") {
            Self::IR
        } else {
            Self::MISC
        };
        bucket.to_string()
    }
}

/// Key → chunk mapping. A key maps to exactly one chunk at any instant.
pub struct KeyIndex {
    entries: RwLock<HashMap<String, IndexEntry>>,
    heuristic: Box<dyn ChunkHeuristic>,
}

impl KeyIndex {
    pub fn new(heuristic: Box<dyn ChunkHeuristic>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            heuristic,
        }
    }

    /// Build the index eagerly from registry membership. When a key is listed
    /// by several chunks, the highest-priority chunk wins.
    pub fn from_registry(registry: &ChunkRegistry, heuristic: Box<dyn ChunkHeuristic>) -> Self {
        let mut entries: HashMap<String, IndexEntry> = HashMap::new();
        for meta in registry.iter() {
            for key in &meta.members {
                if let Some(existing) = entries.get(key) {
                    warn!(
                        key = %key,
                        kept = %existing.chunk_id,
                        ignored = %meta.id,
                        "Key listed by multiple chunks"
                    );
                    continue;
                }
                entries.insert(
                    key.clone(),
                    IndexEntry {
                        chunk_id: meta.id.clone(),
                        provenance: IndexProvenance::Registry,
                    },
                );
            }
        }
        debug!(keys = entries.len(), chunks = registry.len(), "Built key index");

        Self {
            entries: RwLock::new(entries),
            heuristic,
        }
    }

    /// Chunk believed to hold `key`. Never fails: unknown keys go to the
    /// heuristic bucket.
    pub fn resolve_chunk(&self, key: &str) -> String {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        match entries.get(key) {
            Some(entry) => entry.chunk_id.clone(),
            None => self.heuristic.bucket(key),
        }
    }

    pub fn entry(&self, key: &str) -> Option<IndexEntry> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.get(key).cloned()
    }

    pub fn provenance(&self, key: &str) -> Option<IndexProvenance> {
        self.entry(key).map(|e| e.provenance)
    }

    /// Map `key` to `chunk_id`, replacing any previous mapping.
    pub fn insert(&self, key: &str, chunk_id: &str, provenance: IndexProvenance) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.insert(
            key.to_string(),
            IndexEntry {
                chunk_id: chunk_id.to_string(),
                provenance,
            },
        );
    }

    /// Map `key` to `chunk_id` unless it is already indexed. Returns whether
    /// an entry was added.
    pub fn insert_if_absent(&self, key: &str, chunk_id: &str, provenance: IndexProvenance) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if entries.contains_key(key) {
            return false;
        }
        entries.insert(
            key.to_string(),
            IndexEntry {
                chunk_id: chunk_id.to_string(),
                provenance,
            },
        );
        true
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for KeyIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyIndex").field("len", &self.len()).finish()
    }
}
