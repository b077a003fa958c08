//! Axis License
//!
//! License lifecycle for one book:
//! ```text
//! DownloadLicense -> ValidateLicense -> SaveBookInfo -> ... -> DeleteLicenseFile
//! ```
//! The license file must not outlive the fulfillment session; only the
//! book info needed to request it again is kept on disk.

mod error;
mod model;
mod validator;

pub use error::LicenseError;
pub use model::{license_url, LicenseDocument, LicenseRecord, LicenseRequest};
pub use validator::{LicenseValidator, BOOK_INFO_FILE, LICENSE_FILE};

pub type Result<T> = std::result::Result<T, LicenseError>;
