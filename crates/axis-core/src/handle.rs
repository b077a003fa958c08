//! Caller-facing handle to a running fulfillment

use std::path::Path;
use std::sync::Arc;

use axis_crypto::decrypt_aes;
use axis_download::read_file;
use axis_tasks::ChainResult;

use crate::assets::resolve_href;
use crate::error::FulfillmentError;
use crate::orchestrator::{io_error, Session};
use crate::Result;

#[derive(Clone)]
pub struct FulfillmentHandle {
    session: Arc<Session>,
}

impl FulfillmentHandle {
    pub(crate) fn new(session: Arc<Session>) -> Self {
        Self { session }
    }

    pub fn isbn(&self) -> &str {
        self.session.isbn()
    }

    /// Directory holding this book's artifacts
    pub fn book_dir(&self) -> &Path {
        self.session.book_dir()
    }

    /// Ledger record of this attempt, when a ledger is attached
    pub fn fulfillment_id(&self) -> Option<String> {
        self.session.record_id()
    }

    /// Called with overall progress in `[0, 1]` each time a download completes
    pub fn on_progress(&self, listener: impl Fn(f64) + Send + Sync + 'static) {
        self.session.progress.on_progress(listener);
    }

    pub fn progress(&self) -> f64 {
        self.session.progress.current_progress()
    }

    /// Called exactly once with the terminal outcome, immediately if it is already known
    pub fn on_completion(&self, handler: impl FnOnce(ChainResult<FulfillmentError>) + Send + 'static) {
        self.session.on_completion(handler);
    }

    pub fn cancel(&self) {
        self.session.chain.cancel(FulfillmentError::UserCancelled);
    }

    pub fn outcome(&self) -> Option<ChainResult<FulfillmentError>> {
        self.session.outcome()
    }

    /// Wait for the terminal outcome
    pub async fn finished(&self) -> ChainResult<FulfillmentError> {
        let mut done = self.session.subscribe();
        let outcome = done
            .wait_for(Option::is_some)
            .await
            .ok()
            .and_then(|outcome| outcome.clone());

        outcome.unwrap_or_else(|| {
            Err(FulfillmentError::PrematureDeallocation(
                "fulfillment session".to_string(),
            ))
        })
    }

    /// Read a downloaded resource and decrypt it with the session's content key
    pub async fn decrypt_resource(&self, relative_path: &str) -> Result<Vec<u8>> {
        let key = self
            .session
            .content_key()
            .ok_or(FulfillmentError::ContentKeyUnavailable)?;

        let relative = resolve_href("", relative_path).ok_or_else(|| FulfillmentError::Io {
            path: relative_path.to_string(),
            reason: "not a path inside the book directory".to_string(),
        })?;
        let path = self.session.local_path(&relative);
        let ciphertext = read_file(&path).await.map_err(|e| io_error(&path, e))?;

        Ok(decrypt_aes(&ciphertext, &key)?)
    }
}

impl std::fmt::Debug for FulfillmentHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FulfillmentHandle")
            .field("isbn", &self.isbn())
            .field("progress", &self.progress())
            .finish()
    }
}
