//! Where chunks and records come from.
//!
//! The loader and cascade only see the two capabilities below, so HTTP,
//! files on disk and in-memory fixtures are interchangeable:
//!
//! - `ChunkSource`: fetch one chunk by id
//! - `RecordStore`: the flat, complete record set

pub mod http;
pub mod local;

use futures::future::BoxFuture;

use crate::error::LoadError;
use crate::models::{Chunk, Record};

pub use http::{HttpChunkSource, HttpRecordStore};
pub use local::{DirectoryChunkSource, JsonFileRecordStore, MemoryRecordStore, NoChunkSource};

/// Chunk ids end up in URLs and file names. Only letters, digits, `-`, `_`
/// and inner `.` are accepted, so an id can never name a path outside the
/// chunk root.
pub(crate) fn check_chunk_id(chunk_id: &str) -> Result<(), LoadError> {
    let valid = !chunk_id.is_empty()
        && !chunk_id.starts_with('.')
        && chunk_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(LoadError::Structural(format!("invalid chunk id {:?}", chunk_id)))
    }
}

pub trait ChunkSource: Send + Sync {
    fn fetch<'a>(&'a self, chunk_id: &'a str) -> BoxFuture<'a, Result<Chunk, LoadError>>;
}

/// Immutable source of truth for every record.
pub trait RecordStore: Send + Sync {
    fn get_all(&self) -> BoxFuture<'_, Result<Vec<Record>, LoadError>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_ids() {
        for id in ["core", "bucket-ar", "level_2", "es.verbs"] {
            assert!(check_chunk_id(id).is_ok(), "{}", id);
        }
        for id in ["", ".", "..", "../etc/passwd", "a/b", "a\\b", ".hidden", "core?x=1", "café"] {
            assert!(matches!(check_chunk_id(id), Err(LoadError::Structural(_))), "{}", id);
        }
    }
}
