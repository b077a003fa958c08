//! Axis Download
//!
//! Network side of fulfillment:
//! - `HttpTransport`: GET-with-timeout seam, `ReqwestTransport` for production
//! - `ItemFetcher`: per-URL bounded retry, fail-fast across siblings
//! - `ProgressAggregator`: fixed and flexible weighted progress

mod error;
mod fetcher;
mod files;
mod progress;
mod transport;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use error::{FetchError, TransportError};
pub use fetcher::{ItemFetcher, DEFAULT_MAX_ATTEMPTS};
pub use files::{read_file, remove_file_if_exists, write_file};
pub use progress::{DownloadTask, ProgressAggregator};
pub use transport::{HttpTransport, ReqwestTransport};

pub type Result<T> = std::result::Result<T, FetchError>;
