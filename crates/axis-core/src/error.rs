//! Fulfillment error types

use axis_crypto::CryptoError;
use axis_download::FetchError;
use axis_license::LicenseError;
use axis_tasks::UnitAbandoned;
use thiserror::Error;

/// The single terminal outcome of a failed fulfillment
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FulfillmentError {
    #[error("Key generation failed: {0}")]
    KeyGeneration(String),

    #[error("Download of {url} failed: {reason}")]
    TerminalFetch { url: String, reason: String },

    #[error("Failed to write {path}: {reason}")]
    Write { path: String, reason: String },

    #[error("File error at {path}: {reason}")]
    Io { path: String, reason: String },

    #[error("Downloads were stopped: {0}")]
    Aborted(String),

    #[error("Corrupt license: {0}")]
    CorruptLicense(String),

    #[error("License does not match vault {0}")]
    InvalidLicense(String),

    #[error("Invalid container file: {0}")]
    InvalidContainerFile(String),

    #[error("Invalid package file: {0}")]
    InvalidPackageFile(String),

    #[error("Missing artifact after download: {0}")]
    MissingArtifact(String),

    #[error("Content decryption failed: {0}")]
    Decryption(String),

    #[error("Content key is not available")]
    ContentKeyUnavailable,

    #[error("Download cancelled by user")]
    UserCancelled,

    #[error("'{0}' was released before completing")]
    PrematureDeallocation(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl FulfillmentError {
    /// Whether trying again later may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FulfillmentError::TerminalFetch { .. }
                | FulfillmentError::Write { .. }
                | FulfillmentError::Io { .. }
                | FulfillmentError::Aborted(_)
                | FulfillmentError::MissingArtifact(_)
                | FulfillmentError::PrematureDeallocation(_)
        )
    }

    /// Text for the UI layer
    pub fn user_message(&self) -> &'static str {
        match self {
            FulfillmentError::UserCancelled => "The download was cancelled.",
            FulfillmentError::InvalidLicense(_)
            | FulfillmentError::CorruptLicense(_)
            | FulfillmentError::InvalidContainerFile(_)
            | FulfillmentError::InvalidPackageFile(_)
            | FulfillmentError::Decryption(_)
            | FulfillmentError::ContentKeyUnavailable => {
                "This book is not usable. Please contact support."
            }
            FulfillmentError::KeyGeneration(_) => {
                "Secure keys could not be created on this device."
            }
            FulfillmentError::Config(_) => "The application is not configured correctly.",
            _ => "The book could not be downloaded. Please try again later.",
        }
    }
}

impl From<FetchError> for FulfillmentError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::Terminal { url, source, .. } => {
                FulfillmentError::TerminalFetch {
                    url,
                    reason: source.to_string(),
                }
            }
            FetchError::Write { path, reason } => FulfillmentError::Write {
                path: path.display().to_string(),
                reason,
            },
            FetchError::AlreadyRequested(url) => {
                FulfillmentError::Aborted(format!("duplicate request for {url}"))
            }
            FetchError::Stopped => FulfillmentError::Aborted("fetcher stopped".to_string()),
        }
    }
}

impl From<LicenseError> for FulfillmentError {
    fn from(err: LicenseError) -> Self {
        match err {
            LicenseError::Fetch(e) => e.into(),
            LicenseError::Corrupt(reason) => FulfillmentError::CorruptLicense(reason),
            LicenseError::Invalid(vault) => FulfillmentError::InvalidLicense(vault),
            LicenseError::Io { path, reason } => FulfillmentError::Io { path, reason },
            LicenseError::InvalidUrl(reason) => FulfillmentError::Config(reason),
        }
    }
}

impl From<CryptoError> for FulfillmentError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::DecryptionFailed(reason) => FulfillmentError::Decryption(reason),
            other => FulfillmentError::KeyGeneration(other.to_string()),
        }
    }
}

impl From<UnitAbandoned> for FulfillmentError {
    fn from(err: UnitAbandoned) -> Self {
        FulfillmentError::PrematureDeallocation(err.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axis_download::TransportError;

    #[test]
    fn test_fetch_errors_are_retryable() {
        let err: FulfillmentError = FetchError::Terminal {
            url: "https://cdn.test/a".to_string(),
            attempts: 3,
            source: TransportError::Status(503),
        }
        .into();

        assert!(matches!(err, FulfillmentError::TerminalFetch { .. }));
        assert!(err.is_retryable());
        assert_eq!(
            err.user_message(),
            "The book could not be downloaded. Please try again later."
        );
    }

    #[test]
    fn test_license_errors_are_not_retryable() {
        let err: FulfillmentError = LicenseError::Invalid("vault-1".to_string()).into();
        assert_eq!(err, FulfillmentError::InvalidLicense("vault-1".to_string()));
        assert!(!err.is_retryable());
        assert_eq!(
            err.user_message(),
            "This book is not usable. Please contact support."
        );

        let nested: FulfillmentError = LicenseError::Fetch(FetchError::Stopped).into();
        assert!(matches!(nested, FulfillmentError::Aborted(_)));
    }

    #[test]
    fn test_crypto_and_abandoned_units() {
        let err: FulfillmentError = CryptoError::InvalidModulus(12).into();
        assert!(matches!(err, FulfillmentError::KeyGeneration(_)));

        let err: FulfillmentError = UnitAbandoned("package".to_string()).into();
        assert_eq!(
            err,
            FulfillmentError::PrematureDeallocation("package".to_string())
        );
    }
}
