//! Axis Core
//!
//! Fulfillment of one DRM-protected book: a fresh RSA key pair, a validated
//! license, then the container, encryption and package documents and every
//! asset the package references, with weighted progress and a single
//! terminal outcome.

mod assets;
mod config;
mod document;
mod error;
mod handle;
mod identity;
mod orchestrator;

use std::path::Path;
use std::sync::Arc;

pub use config::Config;
pub use document::{DocumentError, StructuredDocument};
pub use error::FulfillmentError;
pub use handle::FulfillmentHandle;
pub use identity::{DeviceIdentityProvider, StaticIdentity, UNKNOWN_CLIENT_IP};
pub use orchestrator::{FulfillmentOrchestrator, CONTAINER_PATH, ENCRYPTION_PATH, METADATA_WEIGHT};

// Re-export pipeline components
pub use axis_download::{HttpTransport, ReqwestTransport};
pub use axis_license::{BOOK_INFO_FILE, LICENSE_FILE};
pub use axis_storage::{Database, FulfillmentLedger, FulfillmentRecord, FulfillmentState, StorageError};

pub type Result<T> = std::result::Result<T, FulfillmentError>;

/// Initialize logging
pub fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt().with_env_filter(filter).with_target(true).init();
}

/// Start a fulfillment with the default configuration and HTTP transport.
///
/// Must be called from within a tokio runtime.
pub fn start_fulfillment(
    isbn: &str,
    vault_id: &str,
    device_id: &str,
    client_ip: Option<String>,
    destination_dir: &Path,
) -> Result<FulfillmentHandle> {
    let handle = tokio::runtime::Handle::try_current()
        .map_err(|e| FulfillmentError::Config(e.to_string()))?;
    let transport = ReqwestTransport::new().map_err(|e| FulfillmentError::Config(e.to_string()))?;

    let orchestrator = FulfillmentOrchestrator::new(
        Config::default(),
        Arc::new(transport),
        Arc::new(StaticIdentity::new(device_id, client_ip)),
        handle,
    );
    Ok(orchestrator.start(isbn, vault_id, destination_dir))
}
