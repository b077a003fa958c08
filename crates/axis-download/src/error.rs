//! Download error types

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("HTTP {0}")]
    Status(u16),

    #[error("Request timed out")]
    Timeout,

    #[error("Request failed: {0}")]
    Request(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("Download of {url} failed after {attempts} attempts: {source}")]
    Terminal {
        url: String,
        attempts: u32,
        #[source]
        source: TransportError,
    },

    #[error("Failed to write {}: {reason}", path.display())]
    Write { path: PathBuf, reason: String },

    #[error("Fetch already in flight: {0}")]
    AlreadyRequested(String),

    #[error("Fetcher stopped")]
    Stopped,
}

impl FetchError {
    pub fn write(path: impl Into<PathBuf>, err: &std::io::Error) -> Self {
        FetchError::Write {
            path: path.into(),
            reason: err.to_string(),
        }
    }
}
