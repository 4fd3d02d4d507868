//! Sources that never touch the network.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::PathBuf;

use futures::future::{BoxFuture, FutureExt};
use tokio::sync::OnceCell;

use super::{check_chunk_id, ChunkSource, RecordStore};
use crate::error::LoadError;
use crate::models::{Chunk, ChunkPayload, Record};

async fn read_file(path: &PathBuf, missing: impl FnOnce() -> LoadError) -> Result<String, LoadError> {
    match tokio::fs::read_to_string(path).await {
        Ok(contents) => Ok(contents),
        Err(e) if e.kind() == ErrorKind::NotFound => Err(missing()),
        Err(e) => Err(LoadError::Transient(format!("{}: {}", path.display(), e))),
    }
}

/// One `{id}.json` file per chunk in a directory.
#[derive(Debug, Clone)]
pub struct DirectoryChunkSource {
    dir: PathBuf,
}

impl DirectoryChunkSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn chunk_path(&self, chunk_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", chunk_id))
    }
}

impl ChunkSource for DirectoryChunkSource {
    fn fetch<'a>(&'a self, chunk_id: &'a str) -> BoxFuture<'a, Result<Chunk, LoadError>> {
        async move {
            check_chunk_id(chunk_id)?;
            let path = self.chunk_path(chunk_id);
            let contents =
                read_file(&path, || LoadError::Structural(chunk_id.to_string())).await?;
            let payload: ChunkPayload = serde_json::from_str(&contents)?;
            Ok(payload.into_chunk(chunk_id))
        }
        .boxed()
    }
}

/// A source with nothing behind it. Every chunk is derived from the store.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoChunkSource;

impl ChunkSource for NoChunkSource {
    fn fetch<'a>(&'a self, chunk_id: &'a str) -> BoxFuture<'a, Result<Chunk, LoadError>> {
        async move { Err(LoadError::Structural(chunk_id.to_string())) }.boxed()
    }
}

/// Flat JSON array of records, read once and kept in memory.
#[derive(Debug)]
pub struct JsonFileRecordStore {
    path: PathBuf,
    records: OnceCell<Vec<Record>>,
}

impl JsonFileRecordStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            records: OnceCell::new(),
        }
    }
}

impl RecordStore for JsonFileRecordStore {
    fn get_all(&self) -> BoxFuture<'_, Result<Vec<Record>, LoadError>> {
        async move {
            let records = self
                .records
                .get_or_try_init(|| async {
                    let contents = read_file(&self.path, || {
                        LoadError::Structural(self.path.display().to_string())
                    })
                    .await?;
                    Ok::<_, LoadError>(serde_json::from_str::<Vec<Record>>(&contents)?)
                })
                .await?;
            Ok(records.clone())
        }
        .boxed()
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryRecordStore {
    records: Vec<Record>,
}

impl MemoryRecordStore {
    pub fn new(records: Vec<Record>) -> Self {
        Self { records }
    }

    /// Split the store into chunks following a `chunk id → keys` map.
    pub fn partition(&self, layout: &HashMap<String, Vec<String>>) -> HashMap<String, Chunk> {
        layout
            .iter()
            .map(|(id, keys)| {
                let records = keys
                    .iter()
                    .filter_map(|k| self.records.iter().find(|r| &r.key == k).cloned())
                    .collect();
                (id.clone(), Chunk::new(id.clone(), records))
            })
            .collect()
    }
}

impl RecordStore for MemoryRecordStore {
    fn get_all(&self) -> BoxFuture<'_, Result<Vec<Record>, LoadError>> {
        async move { Ok(self.records.clone()) }.boxed()
    }
}
