//! License validation state machine
//!
//! Every step enters the validator's `SyncCounter` before it starts and
//! leaves when it finishes, so `wait()` observes the steps strictly in order
//! even though the download completes on a runtime worker. Saving the book
//! info waits for validation although the two touch disjoint data: book info
//! is never persisted for an unvalidated license.
//!
//! A failing step takes the abort path: it records the error, leaves the
//! group, stops the item fetcher and notifies the termination listener.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use axis_crypto::KeyCryptographer;
use axis_download::{remove_file_if_exists, ItemFetcher};
use axis_tasks::{Guarded, SyncCounter};
use tokio::runtime::Handle;

use crate::error::LicenseError;
use crate::model::{license_url, LicenseDocument, LicenseRecord, LicenseRequest};
use crate::Result;

pub const LICENSE_FILE: &str = "license.json";
pub const BOOK_INFO_FILE: &str = "book_info.json";

type TerminationListener = Arc<dyn Fn(&LicenseError) + Send + Sync>;

pub struct LicenseValidator {
    request: LicenseRequest,
    license_url: String,
    book_dir: PathBuf,
    keys: Arc<KeyCryptographer>,
    fetcher: Arc<ItemFetcher>,
    handle: Handle,
    group: SyncCounter,
    failure: Guarded<Option<LicenseError>>,
    listener: Guarded<Option<TerminationListener>>,
}

impl LicenseValidator {
    pub fn new(
        license_base_url: &str,
        request: LicenseRequest,
        book_dir: PathBuf,
        keys: Arc<KeyCryptographer>,
        fetcher: Arc<ItemFetcher>,
        handle: Handle,
    ) -> Result<Arc<Self>> {
        let license_url = license_url(license_base_url, &request, &keys)?;

        Ok(Arc::new(Self {
            request,
            license_url,
            book_dir,
            keys,
            fetcher,
            handle,
            group: SyncCounter::new(),
            failure: Guarded::default(),
            listener: Guarded::default(),
        }))
    }

    pub fn license_url(&self) -> &str {
        &self.license_url
    }

    pub fn license_path(&self) -> PathBuf {
        self.book_dir.join(LICENSE_FILE)
    }

    pub fn book_info_path(&self) -> PathBuf {
        self.book_dir.join(BOOK_INFO_FILE)
    }

    pub fn group(&self) -> &SyncCounter {
        &self.group
    }

    pub fn failure(&self) -> Option<LicenseError> {
        self.failure.get()
    }

    /// Listener for the error that aborted the license steps
    pub fn on_termination(&self, listener: impl Fn(&LicenseError) + Send + Sync + 'static) {
        let listener: TerminationListener = Arc::new(listener);
        self.listener.write(Some(listener));
    }

    /// Run download, validation and book-info steps in order and return the
    /// decrypted content key.
    ///
    /// Blocks the calling thread; run it on a blocking worker.
    pub fn fulfill(self: &Arc<Self>) -> Result<Vec<u8>> {
        self.download_license();
        self.group.wait();
        self.check_failure()?;

        self.validate_license()?;
        self.group.wait();

        self.save_book_info()?;
        self.group.wait();

        self.content_key()
    }

    /// Start downloading the license document. Completion leaves the group.
    pub fn download_license(self: &Arc<Self>) {
        self.group.enter();
        tracing::info!(isbn = %self.request.isbn, "Requesting license");

        let validator = Arc::clone(self);
        self.handle.spawn(async move {
            let path = validator.license_path();
            match validator.fetcher.fetch_to(&validator.license_url, &path).await {
                Ok(()) => validator.group.leave(),
                Err(e) => {
                    validator.leave_group_and_stop_download(e.into());
                }
            }
        });
    }

    /// Check that the license was issued for this key pair and vault
    pub fn validate_license(&self) -> Result<()> {
        self.group.enter();

        let result = self.read_license().and_then(|doc| {
            let key_check = doc.key_check()?;
            let decrypted = self
                .keys
                .decrypt_oaep(&key_check)
                .map_err(|_| LicenseError::Invalid(self.request.vault_id.clone()))?;

            match String::from_utf8(decrypted) {
                Ok(vault) if vault == self.request.vault_id => Ok(()),
                _ => Err(LicenseError::Invalid(self.request.vault_id.clone())),
            }
        });

        match result {
            Ok(()) => {
                tracing::info!(isbn = %self.request.isbn, "License validated");
                self.group.leave();
                Ok(())
            }
            Err(e) => Err(self.leave_group_and_stop_download(e)),
        }
    }

    /// Persist what a later session needs to request the license again
    pub fn save_book_info(&self) -> Result<()> {
        self.group.enter();

        let record = LicenseRecord {
            isbn: self.request.isbn.clone(),
            vault_id: self.request.vault_id.clone(),
            local_path: self.book_dir.clone(),
        };

        match record.save(&self.book_info_path()) {
            Ok(()) => {
                self.group.leave();
                Ok(())
            }
            Err(e) => Err(self.leave_group_and_stop_download(e)),
        }
    }

    /// Base64-decoded `encryption.content_key.encrypted_value`
    pub fn encrypted_content_key(&self) -> Result<Vec<u8>> {
        match self.read_license().and_then(|doc| doc.encrypted_content_key()) {
            Ok(key) => Ok(key),
            Err(e) => {
                self.group.enter();
                Err(self.leave_group_and_stop_download(e))
            }
        }
    }

    /// Content key recovered with the session's private key
    pub fn content_key(&self) -> Result<Vec<u8>> {
        let encrypted = self.encrypted_content_key()?;

        self.keys.decrypt_oaep(&encrypted).map_err(|e| {
            self.group.enter();
            self.leave_group_and_stop_download(LicenseError::Corrupt(format!(
                "content key: {e}"
            )))
        })
    }

    /// Remove the license document. Returns whether a file was removed.
    pub fn delete_license_file(&self) -> Result<bool> {
        self.group.enter();
        let path = self.license_path();
        let result = remove_file_if_exists(&path).map_err(|e| LicenseError::io(&path, e));
        self.group.leave();

        if let Ok(true) = result {
            tracing::info!(isbn = %self.request.isbn, "Deleted license file");
        }
        result
    }

    /// Delete the license file once no license step is in flight, then run `then`
    pub fn schedule_license_deletion(self: &Arc<Self>, then: impl FnOnce() + Send + 'static) {
        let validator = Arc::clone(self);
        self.group.notify_on_drain(&self.handle, move || {
            if let Err(e) = validator.delete_license_file() {
                tracing::error!(error = %e, "Failed to delete license file");
            }
            then();
        });
    }

    fn read_license(&self) -> Result<LicenseDocument> {
        let path = self.license_path();
        let bytes = read_bytes(&path)?;
        LicenseDocument::parse(&bytes)
    }

    fn check_failure(&self) -> Result<()> {
        match self.failure() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Abort path shared by every step. Returns the error that should be reported.
    fn leave_group_and_stop_download(&self, error: LicenseError) -> LicenseError {
        let reported = self.failure.update(|f| f.get_or_insert_with(|| error.clone()).clone());
        self.group.leave();
        self.fetcher.stop();

        tracing::warn!(isbn = %self.request.isbn, error = %reported, "License step failed");
        if let Some(listener) = self.listener.get() {
            listener(&reported);
        }
        reported
    }
}

fn read_bytes(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).map_err(|e| LicenseError::io(path, e))
}
