//! License error types

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LicenseError {
    #[error("License download failed: {0}")]
    Fetch(#[from] axis_download::FetchError),

    #[error("Corrupt license: {0}")]
    Corrupt(String),

    #[error("License does not match vault {0}")]
    Invalid(String),

    #[error("License file error at {path}: {reason}")]
    Io { path: String, reason: String },

    #[error("Invalid license URL: {0}")]
    InvalidUrl(String),
}

impl LicenseError {
    pub(crate) fn io(path: &std::path::Path, err: impl std::fmt::Display) -> Self {
        LicenseError::Io {
            path: path.display().to_string(),
            reason: err.to_string(),
        }
    }
}
