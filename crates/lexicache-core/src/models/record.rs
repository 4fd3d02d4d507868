use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One vocabulary entry, e.g. the full paradigm of a lemma.
///
/// The payload is opaque to the cache; only the key is interpreted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub key: String,
    #[serde(default)]
    pub payload: Value,
}

impl Record {
    pub fn new(key: impl Into<String>, payload: Value) -> Self {
        Self {
            key: key.into(),
            payload,
        }
    }
}

/// A named partition of the record set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    #[serde(default)]
    pub records: Vec<Record>,
}

impl Chunk {
    pub fn new(id: impl Into<String>, records: Vec<Record>) -> Self {
        Self {
            id: id.into(),
            records,
        }
    }

    pub fn get(&self, key: &str) -> Option<&Record> {
        self.records.iter().find(|r| r.key == key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.records.iter().map(|r| r.key.as_str())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Wire format of a chunk file: either a full chunk object or a bare
/// array of records.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum ChunkPayload {
    Full(Chunk),
    Records(Vec<Record>),
}

impl ChunkPayload {
    /// Convert into a chunk, forcing the id to the one that was requested.
    pub fn into_chunk(self, chunk_id: &str) -> Chunk {
        match self {
            ChunkPayload::Full(mut chunk) => {
                chunk.id = chunk_id.to_string();
                chunk
            }
            ChunkPayload::Records(records) => Chunk::new(chunk_id, records),
        }
    }
}
