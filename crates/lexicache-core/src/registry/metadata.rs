use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Priority given to chunks that do not declare one.
pub const DEFAULT_PRIORITY: u8 = 2;

/// Priority tier that is never evicted by the TTL sweep.
pub const CRITICAL_PRIORITY: u8 = 1;

/// Where a chunk definition came from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkProvenance {
    #[default]
    Bundled,
    Supplement,
}

fn default_priority() -> u8 {
    DEFAULT_PRIORITY
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub id: String,
    pub members: Vec<String>,
    /// 1 = highest
    #[serde(default = "default_priority")]
    pub priority: u8,
    #[serde(default)]
    pub expected_count: usize,
    #[serde(default)]
    pub provenance: ChunkProvenance,
    /// Label categories this chunk covers (e.g. "irregular", "reflexive").
    #[serde(default)]
    pub categories: Vec<String>,
}

impl ChunkMetadata {
    pub fn new<S: Into<String>>(id: impl Into<String>, members: impl IntoIterator<Item = S>) -> Self {
        let members: Vec<String> = members.into_iter().map(Into::into).collect();
        Self {
            id: id.into(),
            expected_count: members.len(),
            members,
            priority: DEFAULT_PRIORITY,
            provenance: ChunkProvenance::Bundled,
            categories: Vec::new(),
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority.max(CRITICAL_PRIORITY);
        self
    }

    pub fn with_categories<S: Into<String>>(mut self, categories: impl IntoIterator<Item = S>) -> Self {
        self.categories = categories.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_provenance(mut self, provenance: ChunkProvenance) -> Self {
        self.provenance = provenance;
        self
    }

    pub fn contains(&self, key: &str) -> bool {
        self.members.iter().any(|m| m == key)
    }

    pub fn has_category(&self, category: &str) -> bool {
        self.categories.iter().any(|c| c.eq_ignore_ascii_case(category))
    }
}

/// Registry file format: a full metadata list, or the compact
/// `{"chunk": ["key", ...]}` membership map.
#[derive(Deserialize)]
#[serde(untagged)]
enum RegistryFile {
    Full(Vec<ChunkMetadata>),
    Compact(BTreeMap<String, Vec<String>>),
}

/// Read-only chunk metadata, built once at startup.
#[derive(Debug, Clone, Default)]
pub struct ChunkRegistry {
    chunks: HashMap<String, ChunkMetadata>,
    /// Chunk ids sorted by (priority, id)
    order: Vec<String>,
}

impl ChunkRegistry {
    pub fn new(chunks: impl IntoIterator<Item = ChunkMetadata>) -> Self {
        let mut map = HashMap::new();
        for mut meta in chunks {
            if meta.expected_count == 0 {
                meta.expected_count = meta.members.len();
            }
            if map.contains_key(&meta.id) {
                tracing::warn!(chunk = %meta.id, "Duplicate chunk id in registry, keeping the last definition");
            }
            map.insert(meta.id.clone(), meta);
        }

        let mut order: Vec<String> = map.keys().cloned().collect();
        order.sort_by(|a, b| {
            let pa = map[a].priority;
            let pb = map[b].priority;
            pa.cmp(&pb).then_with(|| a.cmp(b))
        });

        Self { chunks: map, order }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let file: RegistryFile =
            serde_json::from_str(json).context("Failed to parse chunk registry")?;
        Ok(match file {
            RegistryFile::Full(chunks) => Self::new(chunks),
            RegistryFile::Compact(map) => {
                Self::new(map.into_iter().map(|(id, members)| ChunkMetadata::new(id, members)))
            }
        })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read chunk registry: {}", path.display()))?;
        Self::from_json(&contents)
    }

    pub fn get(&self, chunk_id: &str) -> Option<&ChunkMetadata> {
        self.chunks.get(chunk_id)
    }

    /// Chunk ids, highest priority first.
    pub fn ids(&self) -> &[String] {
        &self.order
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChunkMetadata> {
        self.order.iter().filter_map(|id| self.chunks.get(id))
    }

    pub fn chunks_up_to_priority(&self, tier: u8) -> Vec<&ChunkMetadata> {
        self.iter().filter(|c| c.priority <= tier).collect()
    }

    pub fn chunks_with_category(&self, category: &str) -> Vec<&ChunkMetadata> {
        self.iter().filter(|c| c.has_category(category)).collect()
    }

    /// Priority tier of a chunk; unknown chunks rank below every registered tier.
    pub fn priority_of(&self, chunk_id: &str) -> u8 {
        self.chunks.get(chunk_id).map(|c| c.priority).unwrap_or(u8::MAX)
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}
