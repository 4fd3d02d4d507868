use thiserror::Error;

/// Failure to produce a chunk.
///
/// Clone because a single load result is shared between every caller that
/// coalesced onto the same in-flight request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LoadError {
    #[error("Transient load failure: {0}")]
    Transient(String),

    #[error("No backing source for chunk: {0}")]
    Structural(String),

    #[error("Load timed out after {0}ms")]
    Timeout(u64),

    #[error("Invalid chunk payload: {0}")]
    InvalidPayload(String),
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

impl LoadError {
    /// Truncate a response body to avoid logging excessive data
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            body.to_string()
        } else {
            let mut end = MAX_ERROR_BODY_LENGTH;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
        }
    }

    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let truncated = Self::truncate_body(body);
        match status.as_u16() {
            404 | 410 => LoadError::Structural(truncated),
            408 | 429 => LoadError::Transient(format!("Status {}", status)),
            500..=599 => LoadError::Transient(format!("Status {}: {}", status, truncated)),
            _ => LoadError::InvalidPayload(format!("Status {}: {}", status, truncated)),
        }
    }

    /// Whether retrying the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LoadError::Transient(_) | LoadError::Timeout(_))
    }
}

impl From<reqwest::Error> for LoadError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            LoadError::Transient(format!("request timed out: {}", err))
        } else if err.is_decode() {
            LoadError::InvalidPayload(err.to_string())
        } else {
            LoadError::Transient(err.to_string())
        }
    }
}

impl From<serde_json::Error> for LoadError {
    fn from(err: serde_json::Error) -> Self {
        LoadError::InvalidPayload(err.to_string())
    }
}

/// Raised only into the log: the cascade always falls back to the baseline.
#[derive(Error, Debug)]
pub enum CascadeError {
    #[error("All loading strategies failed for {keys} keys after {attempts} attempts")]
    Exhausted { keys: usize, attempts: u32 },
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum LockError {
    #[error("Lock is held by another owner")]
    Contention,

    #[error("Unparsable lock record: {0}")]
    Corrupt(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}
