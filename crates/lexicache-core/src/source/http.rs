//! HTTP chunk source and record store.
//!
//! Chunks are served as static JSON files: `{base}/chunks/{id}.json`, and
//! the flat store as `{base}/records.json`.

use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use reqwest::{header, Client};
use serde::de::DeserializeOwned;
use tracing::debug;

use super::{check_chunk_id, ChunkSource, RecordStore};
use crate::error::LoadError;
use crate::models::{Chunk, ChunkPayload, Record};

/// HTTP request timeout in seconds.
/// The cascade applies its own, usually shorter, per-attempt timeout.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Build the shared reqwest client.
fn build_client() -> Result<Client, LoadError> {
    Client::builder()
        .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
        .build()
        .map_err(LoadError::from)
}

/// Check if response is successful, returning an error with body if not.
async fn check_response(response: reqwest::Response) -> Result<reqwest::Response, LoadError> {
    if response.status().is_success() {
        Ok(response)
    } else {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Err(LoadError::from_status(status, &body))
    }
}

async fn get_json<T: DeserializeOwned>(client: &Client, url: &str) -> Result<T, LoadError> {
    debug!(url = url, "GET");
    let response = client
        .get(url)
        .header(header::ACCEPT, "application/json")
        .send()
        .await?;
    let response = check_response(response).await?;
    let text = response.text().await?;
    Ok(serde_json::from_str(&text)?)
}

/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct HttpChunkSource {
    client: Client,
    base_url: String,
}

impl HttpChunkSource {
    pub fn new(base_url: impl Into<String>) -> Result<Self, LoadError> {
        Ok(Self {
            client: build_client()?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    /// Share the connection pool of an existing client.
    pub fn with_client(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn chunk_url(&self, chunk_id: &str) -> String {
        format!("{}/chunks/{}.json", self.base_url, chunk_id)
    }
}

impl ChunkSource for HttpChunkSource {
    fn fetch<'a>(&'a self, chunk_id: &'a str) -> BoxFuture<'a, Result<Chunk, LoadError>> {
        async move {
            check_chunk_id(chunk_id)?;
            let url = self.chunk_url(chunk_id);
            let payload: ChunkPayload = get_json(&self.client, &url).await?;
            Ok(payload.into_chunk(chunk_id))
        }
        .boxed()
    }
}

#[derive(Clone)]
pub struct HttpRecordStore {
    client: Client,
    url: String,
}

impl HttpRecordStore {
    pub fn new(base_url: &str) -> Result<Self, LoadError> {
        Ok(Self {
            client: build_client()?,
            url: format!("{}/records.json", base_url.trim_end_matches('/')),
        })
    }
}

impl RecordStore for HttpRecordStore {
    fn get_all(&self) -> BoxFuture<'_, Result<Vec<Record>, LoadError>> {
        async move { get_json(&self.client, &self.url).await }.boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_urls_ignore_trailing_slash() {
        let source = HttpChunkSource::with_client(Client::new(), "https://cdn.example.com/verbs/");
        assert_eq!(
            source.chunk_url("core"),
            "https://cdn.example.com/verbs/chunks/core.json"
        );
    }

    #[tokio::test]
    async fn test_path_like_ids_never_reach_the_network() {
        let source = HttpChunkSource::with_client(Client::new(), "http://127.0.0.1:9/verbs");
        for id in ["../records", "a/b"] {
            assert!(matches!(source.fetch(id).await, Err(LoadError::Structural(_))));
        }
    }
}
