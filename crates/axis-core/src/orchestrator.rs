//! Fulfillment pipeline
//!
//! ```text
//! keys -> license -> container -> encryption -> package -+-> assets -> verify
//!                                                        (inner chain)
//! ```
//!
//! One `ItemFetcher` serves the whole session, so a terminal failure on any
//! download stops every sibling and cancels the chain. Whatever the outcome,
//! the license file is deleted once no license step is in flight, and only
//! then is the outcome published to the handle.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use axis_crypto::KeyCryptographer;
use axis_download::{read_file, HttpTransport, ItemFetcher, ProgressAggregator};
use axis_license::{LicenseRequest, LicenseValidator};
use axis_storage::FulfillmentLedger;
use axis_tasks::{ChainResult, Guarded, TaskChain, TaskCompletion, TaskUnit};
use futures_util::{stream, StreamExt, TryStreamExt};
use tokio::runtime::Handle;
use tokio::sync::watch;

use crate::assets::{asset_paths, package_path};
use crate::config::Config;
use crate::error::FulfillmentError;
use crate::handle::FulfillmentHandle;
use crate::identity::DeviceIdentityProvider;
use crate::Result;

/// Progress share reserved for each of license, container, encryption and package
pub const METADATA_WEIGHT: f64 = 0.05;

pub const CONTAINER_PATH: &str = "META-INF/container.xml";
pub const ENCRYPTION_PATH: &str = "META-INF/encryption.xml";

type CompletionHandler = Box<dyn FnOnce(ChainResult<FulfillmentError>) + Send>;

pub struct FulfillmentOrchestrator {
    config: Config,
    transport: Arc<dyn HttpTransport>,
    identity: Arc<dyn DeviceIdentityProvider>,
    ledger: Option<FulfillmentLedger>,
    handle: Handle,
}

impl FulfillmentOrchestrator {
    pub fn new(
        config: Config,
        transport: Arc<dyn HttpTransport>,
        identity: Arc<dyn DeviceIdentityProvider>,
        handle: Handle,
    ) -> Self {
        Self {
            config,
            transport,
            identity,
            ledger: None,
            handle,
        }
    }

    /// Record every attempt in `ledger`
    pub fn with_ledger(mut self, ledger: FulfillmentLedger) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Start fulfilling one book into `destination_dir/<isbn>`.
    ///
    /// Only one fulfillment per book may run at a time.
    pub fn start(&self, isbn: &str, vault_id: &str, destination_dir: &Path) -> FulfillmentHandle {
        let request = LicenseRequest {
            isbn: isbn.to_string(),
            vault_id: vault_id.to_string(),
            device_id: self.identity.device_id(),
            client_ip: self.identity.client_ip(),
        };
        let book_dir = destination_dir.join(isbn);

        tracing::info!(isbn = %isbn, book_dir = %book_dir.display(), "Starting fulfillment");

        let session = Session::new(
            request,
            book_dir,
            self.config.clone(),
            Arc::clone(&self.transport),
            self.ledger.clone(),
            self.handle.clone(),
        );
        session.begin();
        FulfillmentHandle::new(session)
    }
}

#[derive(Default)]
struct SessionState {
    record_id: Option<String>,
    validator: Option<Arc<LicenseValidator>>,
    content_key: Option<Vec<u8>>,
    artifacts: Vec<PathBuf>,
    assets: Option<TaskChain<FulfillmentError>>,
}

#[derive(Default)]
struct Outcome {
    result: Option<ChainResult<FulfillmentError>>,
    handlers: Vec<CompletionHandler>,
}

pub(crate) struct Session {
    request: LicenseRequest,
    book_dir: PathBuf,
    config: Config,
    handle: Handle,
    fetcher: Arc<ItemFetcher>,
    pub(crate) progress: ProgressAggregator,
    pub(crate) chain: TaskChain<FulfillmentError>,
    ledger: Option<FulfillmentLedger>,
    state: Guarded<SessionState>,
    outcome: Guarded<Outcome>,
    done: watch::Sender<Option<ChainResult<FulfillmentError>>>,
}

impl Session {
    fn new(
        request: LicenseRequest,
        book_dir: PathBuf,
        config: Config,
        transport: Arc<dyn HttpTransport>,
        ledger: Option<FulfillmentLedger>,
        handle: Handle,
    ) -> Arc<Self> {
        let fetcher = ItemFetcher::new(
            transport,
            handle.clone(),
            config.request_timeout(),
            config.max_fetch_attempts,
        );
        let chain = TaskChain::new(format!("fulfillment:{}", request.isbn));

        Arc::new(Self {
            request,
            book_dir,
            config,
            handle,
            fetcher,
            progress: ProgressAggregator::new(),
            chain,
            ledger,
            state: Guarded::default(),
            outcome: Guarded::default(),
            done: watch::channel(None).0,
        })
    }

    pub(crate) fn isbn(&self) -> &str {
        &self.request.isbn
    }

    pub(crate) fn book_dir(&self) -> &Path {
        &self.book_dir
    }

    pub(crate) fn record_id(&self) -> Option<String> {
        self.state.read(|s| s.record_id.clone())
    }

    pub(crate) fn content_key(&self) -> Option<Vec<u8>> {
        self.state.read(|s| s.content_key.clone())
    }

    pub(crate) fn outcome(&self) -> Option<ChainResult<FulfillmentError>> {
        self.outcome.read(|o| o.result.clone())
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<Option<ChainResult<FulfillmentError>>> {
        self.done.subscribe()
    }

    /// Register a completion handler, replaying the outcome if already published
    pub(crate) fn on_completion(
        &self,
        handler: impl FnOnce(ChainResult<FulfillmentError>) + Send + 'static,
    ) {
        let replay = self.outcome.update(|o| match &o.result {
            Some(result) => Some((result.clone(), handler)),
            None => {
                o.handlers.push(Box::new(handler));
                None
            }
        });

        if let Some((result, handler)) = replay {
            handler(result);
        }
    }

    /// `<book_dir>/<relative>`
    pub(crate) fn local_path(&self, relative: &str) -> PathBuf {
        relative
            .split('/')
            .filter(|s| !s.is_empty())
            .fold(self.book_dir.clone(), |path, segment| path.join(segment))
    }

    /// `<content_base_url>/<isbn>/<relative>`
    fn resource_url(&self, relative: &str) -> Result<String> {
        let base = &self.config.content_base_url;
        let mut url = url::Url::parse(base).map_err(|e| FulfillmentError::Config(e.to_string()))?;

        url.path_segments_mut()
            .map_err(|_| FulfillmentError::Config(format!("{base} cannot be a base URL")))?
            .pop_if_empty()
            .push(&self.request.isbn)
            .extend(relative.split('/'));

        Ok(url.into())
    }

    fn begin(self: &Arc<Self>) {
        self.record_start();

        let chain = self.chain.clone();
        self.fetcher
            .on_termination(move |e| chain.cancel(e.clone().into()));

        let package = Arc::clone(self);
        self.chain.add_all([
            TaskUnit::from_future("keys", &self.handle, Arc::clone(self).generate_keys()),
            TaskUnit::from_future("license", &self.handle, Arc::clone(self).fulfill_license()),
            TaskUnit::from_future(
                "container",
                &self.handle,
                Arc::clone(self).fetch_metadata(CONTAINER_PATH),
            ),
            TaskUnit::from_future(
                "encryption",
                &self.handle,
                Arc::clone(self).fetch_metadata(ENCRYPTION_PATH),
            ),
            TaskUnit::new("package", move |completion| package.fetch_package(completion)),
        ]);

        let session = Arc::clone(self);
        self.chain.on_completion(move |result| session.finish(result));
        self.chain.run();
    }

    async fn generate_keys(self: Arc<Self>) -> ChainResult<FulfillmentError> {
        let keys = tokio::task::spawn_blocking(KeyCryptographer::generate)
            .await
            .map_err(|e| FulfillmentError::KeyGeneration(e.to_string()))??;
        tracing::debug!(isbn = %self.request.isbn, "Generated session key pair");

        let validator = LicenseValidator::new(
            &self.config.license_base_url,
            self.request.clone(),
            self.book_dir.clone(),
            Arc::new(keys),
            Arc::clone(&self.fetcher),
            self.handle.clone(),
        )?;

        let chain = self.chain.clone();
        validator.on_termination(move |e| chain.cancel(e.clone().into()));
        self.state.update(|s| s.validator = Some(validator));
        Ok(())
    }

    async fn fulfill_license(self: Arc<Self>) -> ChainResult<FulfillmentError> {
        let validator = self
            .state
            .read(|s| s.validator.clone())
            .ok_or_else(|| FulfillmentError::PrematureDeallocation("license validator".to_string()))?;

        let url = validator.license_url().to_string();
        self.progress.add_fixed_weight(&url, METADATA_WEIGHT);

        let worker = Arc::clone(&validator);
        let content_key = tokio::task::spawn_blocking(move || worker.fulfill())
            .await
            .map_err(|e| FulfillmentError::PrematureDeallocation(format!("license worker: {e}")))??;

        self.state.update(|s| s.content_key = Some(content_key));
        self.progress.mark_completed(&url);
        Ok(())
    }

    async fn fetch_metadata(self: Arc<Self>, relative: &'static str) -> ChainResult<FulfillmentError> {
        let url = self.resource_url(relative)?;
        self.progress.add_fixed_weight(&url, METADATA_WEIGHT);

        self.fetch_resource(&url, relative).await?;
        self.progress.mark_completed(&url);
        Ok(())
    }

    fn fetch_package(self: Arc<Self>, completion: TaskCompletion<FulfillmentError>) {
        let handle = self.handle.clone();
        handle.spawn(async move {
            match self.discover_assets().await {
                Ok(assets) => self.download_assets(assets, completion),
                Err(e) => completion.failed(e),
            }
        });
    }

    /// Download the package manifest and list the assets it references
    async fn discover_assets(&self) -> Result<Vec<String>> {
        let container_path = self.local_path(CONTAINER_PATH);
        let container = read_file(&container_path)
            .await
            .map_err(|e| io_error(&container_path, e))?;
        let package_path = package_path(&container)?;

        let url = self.resource_url(&package_path)?;
        self.progress.add_fixed_weight(&url, METADATA_WEIGHT);
        let path = self.fetch_resource(&url, &package_path).await?;
        self.progress.mark_completed(&url);

        let package = read_file(&path).await.map_err(|e| io_error(&path, e))?;
        let assets = asset_paths(&package_path, &package)?;

        tracing::info!(
            isbn = %self.request.isbn,
            package = %package_path,
            assets = assets.len(),
            "Parsed package manifest"
        );
        Ok(assets)
    }

    fn download_assets(self: Arc<Self>, assets: Vec<String>, completion: TaskCompletion<FulfillmentError>) {
        let entries = match assets
            .into_iter()
            .map(|relative| Ok((self.resource_url(&relative)?, relative)))
            .collect::<Result<Vec<(String, String)>>>()
        {
            Ok(entries) => entries,
            Err(e) => return completion.failed(e),
        };

        for (url, _) in &entries {
            self.progress.add_flexible_weight(url);
        }

        let assets = TaskChain::new(format!("assets:{}", self.request.isbn));
        assets.add_all([
            TaskUnit::from_future("download", &self.handle, Arc::clone(&self).fetch_assets(entries)),
            TaskUnit::from_future("verify", &self.handle, Arc::clone(&self).verify_artifacts()),
        ]);
        assets.on_completion(move |result| match result {
            Ok(()) => completion.succeeded(),
            Err(e) => completion.failed(e),
        });

        // `finish` cancels the stored chain; an outer chain that already
        // finished is seen here instead.
        self.state.update(|s| s.assets = Some(assets.clone()));
        match self.chain.result() {
            Some(Err(e)) => assets.cancel(e),
            _ => {
                assets.run();
            }
        }
    }

    async fn fetch_assets(self: Arc<Self>, entries: Vec<(String, String)>) -> ChainResult<FulfillmentError> {
        let width = self.config.max_concurrent_downloads.max(1);

        stream::iter(entries)
            .map(|(url, relative)| {
                let session = Arc::clone(&self);
                async move {
                    session.fetch_resource(&url, &relative).await?;
                    session.progress.mark_completed(&url);
                    Ok::<(), FulfillmentError>(())
                }
            })
            .buffer_unordered(width)
            .try_collect::<Vec<()>>()
            .await?;
        Ok(())
    }

    async fn verify_artifacts(self: Arc<Self>) -> ChainResult<FulfillmentError> {
        let artifacts = self.state.read(|s| s.artifacts.clone());

        if let Some(missing) = artifacts.iter().find(|path| !path.is_file()) {
            return Err(FulfillmentError::MissingArtifact(missing.display().to_string()));
        }

        tracing::debug!(isbn = %self.request.isbn, artifacts = artifacts.len(), "Verified artifacts");
        Ok(())
    }

    async fn fetch_resource(&self, url: &str, relative: &str) -> Result<PathBuf> {
        let path = self.local_path(relative);
        self.fetcher.fetch_to(url, &path).await?;
        self.state.update(|s| s.artifacts.push(path.clone()));
        Ok(path)
    }

    fn finish(self: Arc<Self>, result: ChainResult<FulfillmentError>) {
        match &result {
            Ok(()) => self.progress.finish(),
            Err(e) => {
                self.fetcher.stop();
                if let Some(assets) = self.state.read(|s| s.assets.clone()) {
                    assets.cancel(e.clone());
                }
            }
        }

        match self.state.read(|s| s.validator.clone()) {
            Some(validator) => {
                let session = Arc::clone(&self);
                validator.schedule_license_deletion(move || session.publish(result));
            }
            None => self.publish(result),
        }
    }

    fn publish(&self, result: ChainResult<FulfillmentError>) {
        self.record_outcome(&result);

        match &result {
            Ok(()) => tracing::info!(isbn = %self.request.isbn, "Fulfillment completed"),
            Err(FulfillmentError::UserCancelled) => {
                tracing::info!(isbn = %self.request.isbn, "Fulfillment cancelled")
            }
            Err(e) => tracing::warn!(isbn = %self.request.isbn, error = %e, "Fulfillment failed"),
        }

        let handlers = self.outcome.update(|o| {
            o.result = Some(result.clone());
            std::mem::take(&mut o.handlers)
        });
        self.done.send_replace(Some(result.clone()));

        for handler in handlers {
            handler(result.clone());
        }
    }

    fn record_start(&self) {
        let Some(ledger) = &self.ledger else {
            return;
        };

        let book_dir = self.book_dir.display().to_string();
        let recorded = ledger
            .create(&self.request.isbn, &self.request.vault_id, &book_dir)
            .and_then(|record| ledger.mark_downloading(&record.id));

        match recorded {
            Ok(record) => self.state.update(|s| s.record_id = Some(record.id)),
            Err(e) => tracing::error!(isbn = %self.request.isbn, error = %e, "Failed to record fulfillment"),
        }
    }

    fn record_outcome(&self, result: &ChainResult<FulfillmentError>) {
        let (Some(ledger), Some(id)) = (&self.ledger, self.record_id()) else {
            return;
        };

        let recorded = match result {
            Ok(()) => ledger.complete(&id),
            Err(FulfillmentError::UserCancelled) => ledger.cancel(&id),
            Err(e) => ledger.fail(&id, &e.to_string()),
        };
        if let Err(e) = recorded {
            tracing::error!(fulfillment_id = %id, error = %e, "Failed to record fulfillment outcome");
        }
    }
}

pub(crate) fn io_error(path: &Path, err: std::io::Error) -> FulfillmentError {
    FulfillmentError::Io {
        path: path.display().to_string(),
        reason: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::StaticIdentity;
    use aes::cipher::{block_padding::Pkcs7, BlockEncryptMut, KeyIvInit};
    use axis_download::testing::MemoryTransport;
    use axis_license::{BOOK_INFO_FILE, LICENSE_FILE};
    use axis_storage::{Database, FulfillmentState};
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use bytes::Bytes;
    use rand::rngs::OsRng;
    use rsa::{BigUint, Oaep, RsaPublicKey};
    use sha1::Sha1;
    use std::sync::Mutex;
    use std::time::Duration;

    const ISBN: &str = "9780000000001";
    const VAULT: &str = "vault-42";
    const LICENSE_BASE: &str = "https://license.test/api";
    const CONTENT_BASE: &str = "https://content.test/books";
    const CONTENT_KEY: [u8; 16] = [0x11; 16];
    const CHAPTER: &[u8] = b"<html><body><p>Chapter one.</p></body></html>";

    const CONTAINER: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<container version="1.0">
  <rootfiles>
    <rootfile full-path="OEBPS/content.opf" media-type="application/oebps-package+xml"/>
  </rootfiles>
</container>"#;

    const PACKAGE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<package version="3.0">
  <manifest>
    <item id="ch1" href="text/ch1.xhtml" media-type="application/xhtml+xml"/>
    <item id="ch2" href="text/ch2.xhtml" media-type="application/xhtml+xml"/>
    <item id="css" href="styles/book.css" media-type="text/css"/>
    <item id="cover" href="images/cover.jpg" media-type="image/jpeg"/>
    <item id="font" href="https://fonts.example/serif.woff" media-type="font/woff"/>
  </manifest>
  <spine><itemref idref="ch1"/><itemref idref="ch2"/></spine>
  <guide><reference type="text" href="text/ch1.xhtml#start"/></guide>
</package>"#;

    const ASSETS: [&str; 4] = [
        "OEBPS/text/ch1.xhtml",
        "OEBPS/text/ch2.xhtml",
        "OEBPS/styles/book.css",
        "OEBPS/images/cover.jpg",
    ];

    struct Fixture {
        dir: tempfile::TempDir,
        transport: Arc<MemoryTransport>,
        ledger: FulfillmentLedger,
        orchestrator: FulfillmentOrchestrator,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let mut config = Config::new(dir.path().to_path_buf());
            config.license_base_url = LICENSE_BASE.to_string();
            config.content_base_url = CONTENT_BASE.to_string();

            let transport = Arc::new(MemoryTransport::new());
            let ledger = FulfillmentLedger::new(Database::open_in_memory().unwrap());
            let orchestrator = FulfillmentOrchestrator::new(
                config,
                Arc::clone(&transport) as Arc<dyn HttpTransport>,
                Arc::new(StaticIdentity::new("device-1", None)),
                Handle::current(),
            )
            .with_ledger(ledger.clone());

            Self {
                dir,
                transport,
                ledger,
                orchestrator,
            }
        }

        fn start(&self) -> FulfillmentHandle {
            self.orchestrator
                .start(ISBN, VAULT, &self.dir.path().join("library"))
        }

        fn record_state(&self, handle: &FulfillmentHandle) -> FulfillmentState {
            let id = handle.fulfillment_id().unwrap();
            self.ledger.get(&id).unwrap().state
        }
    }

    fn content_url(relative: &str) -> String {
        format!("{CONTENT_BASE}/{ISBN}/{relative}")
    }

    /// License server stand-in: encrypts to the public key named in the request URL
    fn serve_license(transport: &MemoryTransport, vault: &'static str) {
        transport.respond_with_prefix(&format!("{LICENSE_BASE}/license/"), move |url| {
            let mut segments = url.rsplit('/');
            let exponent = segments.next().unwrap_or_default().to_string();
            let modulus = segments.next().unwrap_or_default().replace('_', "/");
            let key = RsaPublicKey::new(
                BigUint::from_bytes_be(&STANDARD.decode(modulus).unwrap()),
                BigUint::from_bytes_be(&STANDARD.decode(exponent).unwrap()),
            )
            .unwrap();

            let encrypt = |data: &[u8]| {
                STANDARD.encode(key.encrypt(&mut OsRng, Oaep::new::<Sha1>(), data).unwrap())
            };
            Ok(Bytes::from(format!(
                r#"{{"id": "lic-1", "encryption": {{"user_key": {{"key_check": "{}"}}, "content_key": {{"encrypted_value": "{}"}}}}}}"#,
                encrypt(vault.as_bytes()),
                encrypt(&CONTENT_KEY),
            )))
        });
    }

    fn encrypted_chapter() -> Vec<u8> {
        let iv = [3u8; 16];
        let body = cbc::Encryptor::<aes::Aes128>::new_from_slices(&CONTENT_KEY, &iv)
            .unwrap()
            .encrypt_padded_vec_mut::<Pkcs7>(CHAPTER);
        let mut out = iv.to_vec();
        out.extend_from_slice(&body);
        out
    }

    fn serve_book(transport: &MemoryTransport) {
        transport.serve(&content_url(CONTAINER_PATH), CONTAINER);
        transport.serve(&content_url(ENCRYPTION_PATH), "<encryption/>");
        transport.serve(&content_url("OEBPS/content.opf"), PACKAGE);
        transport.serve(&content_url(ASSETS[0]), encrypted_chapter());
        for asset in &ASSETS[1..] {
            transport.serve(&content_url(asset), format!("contents of {asset}"));
        }
    }

    fn count_files(dir: &Path) -> usize {
        std::fs::read_dir(dir)
            .unwrap()
            .map(|entry| entry.unwrap().path())
            .map(|path| if path.is_dir() { count_files(&path) } else { 1 })
            .sum()
    }

    async fn finished(handle: &FulfillmentHandle) -> ChainResult<FulfillmentError> {
        tokio::time::timeout(Duration::from_secs(60), handle.finished())
            .await
            .unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_fulfillment_downloads_every_artifact() {
        let fixture = Fixture::new();
        serve_license(&fixture.transport, VAULT);
        serve_book(&fixture.transport);
        fixture
            .transport
            .serve_after_failures(&content_url(ASSETS[1]), 2, "flaky chapter");

        let reports = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&reports);
        let handle = fixture.start();
        handle.on_progress(move |p| sink.lock().unwrap().push(p));

        assert_eq!(finished(&handle).await, Ok(()));

        let book = handle.book_dir();
        for relative in [CONTAINER_PATH, ENCRYPTION_PATH, "OEBPS/content.opf"]
            .iter()
            .chain(ASSETS.iter())
        {
            assert!(book.join(relative).is_file(), "missing {relative}");
        }
        // Four assets plus the manifest; the remote font is never fetched
        assert_eq!(count_files(&book.join("OEBPS")), 5);
        assert_eq!(fixture.transport.calls("https://fonts.example/serif.woff"), 0);
        assert_eq!(fixture.transport.calls(&content_url(ASSETS[1])), 3);
        assert_eq!(fixture.transport.calls(&content_url(ASSETS[0])), 1);

        assert!(!book.join(LICENSE_FILE).exists());
        assert!(book.join(BOOK_INFO_FILE).is_file());

        assert_eq!(handle.progress(), 1.0);
        let reports = reports.lock().unwrap();
        assert!(reports.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(reports.last().copied(), Some(1.0));

        assert_eq!(fixture.record_state(&handle), FulfillmentState::Completed);
        assert_eq!(
            handle.decrypt_resource(ASSETS[0]).await.unwrap(),
            CHAPTER
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_encoded_hrefs_are_fetched_and_stored_decoded() {
        let fixture = Fixture::new();
        serve_license(&fixture.transport, VAULT);
        serve_book(&fixture.transport);
        fixture.transport.serve(
            &content_url("OEBPS/content.opf"),
            r#"<package><manifest>
                <item href="text/chapter%201.xhtml"/>
                <item href="images/caf%C3%A9.jpg"/>
            </manifest></package>"#,
        );
        let chapter = content_url("OEBPS/text/chapter%201.xhtml");
        let cover = content_url("OEBPS/images/caf%C3%A9.jpg");
        fixture.transport.serve(&chapter, "chapter one");
        fixture.transport.serve(&cover, "cover");

        let handle = fixture.start();
        assert_eq!(finished(&handle).await, Ok(()));

        assert_eq!(fixture.transport.calls(&chapter), 1);
        assert_eq!(fixture.transport.calls(&cover), 1);

        let book = handle.book_dir();
        assert_eq!(
            std::fs::read(book.join("OEBPS/text/chapter 1.xhtml")).unwrap(),
            b"chapter one"
        );
        assert!(book.join("OEBPS/images/café.jpg").is_file());
        assert!(!book.join("OEBPS/text/chapter%201.xhtml").exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_invalid_license_stops_pipeline() {
        let fixture = Fixture::new();
        serve_license(&fixture.transport, "some-other-vault");
        serve_book(&fixture.transport);

        let handle = fixture.start();
        assert_eq!(
            finished(&handle).await,
            Err(FulfillmentError::InvalidLicense(VAULT.to_string()))
        );

        assert_eq!(fixture.transport.calls(&content_url(CONTAINER_PATH)), 0);
        assert!(!handle.book_dir().join(LICENSE_FILE).exists());
        assert!(!handle.book_dir().join(BOOK_INFO_FILE).exists());
        assert_eq!(fixture.record_state(&handle), FulfillmentState::Failed);
        assert_eq!(
            handle.decrypt_resource(ASSETS[0]).await,
            Err(FulfillmentError::ContentKeyUnavailable)
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_terminal_asset_failure_fails_fulfillment() {
        let fixture = Fixture::new();
        serve_license(&fixture.transport, VAULT);
        serve_book(&fixture.transport);
        fixture.transport.fail_always(&content_url(ASSETS[2]));

        let handle = fixture.start();
        let result = finished(&handle).await;

        let err = result.unwrap_err();
        assert!(matches!(err, FulfillmentError::TerminalFetch { ref url, .. } if url == &content_url(ASSETS[2])));
        assert!(err.is_retryable());
        assert_eq!(fixture.transport.calls(&content_url(ASSETS[2])), 3);
        assert!(!handle.book_dir().join(LICENSE_FILE).exists());

        let record = fixture
            .ledger
            .get(&handle.fulfillment_id().unwrap())
            .unwrap();
        assert_eq!(record.state, FulfillmentState::Failed);
        assert!(record.error.is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_cancel_aborts_in_flight_downloads() {
        let fixture = Fixture::new();
        serve_license(&fixture.transport, VAULT);
        serve_book(&fixture.transport);
        let stuck = content_url(ASSETS[3]);
        fixture.transport.hang(&stuck);

        let handle = fixture.start();
        for _ in 0..3000 {
            if fixture.transport.calls(&stuck) > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(fixture.transport.calls(&stuck), 1);

        handle.cancel();
        let result = tokio::time::timeout(Duration::from_secs(5), handle.finished())
            .await
            .unwrap();
        assert_eq!(result, Err(FulfillmentError::UserCancelled));

        // Late registration still sees the single outcome
        let (tx, rx) = tokio::sync::oneshot::channel();
        handle.on_completion(move |result| {
            let _ = tx.send(result);
        });
        assert_eq!(rx.await.unwrap(), Err(FulfillmentError::UserCancelled));

        assert!(!handle.book_dir().join(LICENSE_FILE).exists());
        assert_eq!(fixture.record_state(&handle), FulfillmentState::Cancelled);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_container_without_package_path() {
        let fixture = Fixture::new();
        serve_license(&fixture.transport, VAULT);
        serve_book(&fixture.transport);
        fixture.transport.serve(
            &content_url(CONTAINER_PATH),
            "<container><rootfiles/></container>",
        );

        let handle = fixture.start();
        assert!(matches!(
            finished(&handle).await,
            Err(FulfillmentError::InvalidContainerFile(_))
        ));
        assert_eq!(fixture.transport.calls(&content_url("OEBPS/content.opf")), 0);
        assert!(!handle.book_dir().join(LICENSE_FILE).exists());
    }

    #[tokio::test]
    async fn test_resource_urls_and_paths() {
        let fixture = Fixture::new();
        let session = Session::new(
            LicenseRequest {
                isbn: ISBN.to_string(),
                vault_id: VAULT.to_string(),
                device_id: "device-1".to_string(),
                client_ip: "0.0.0.0".to_string(),
            },
            fixture.dir.path().join(ISBN),
            fixture.orchestrator.config().clone(),
            Arc::clone(&fixture.transport) as Arc<dyn HttpTransport>,
            None,
            Handle::current(),
        );

        assert_eq!(
            session.resource_url("OEBPS/text/chapter 1.xhtml").unwrap(),
            format!("{CONTENT_BASE}/{ISBN}/OEBPS/text/chapter%201.xhtml")
        );
        assert_eq!(
            session.local_path("META-INF/container.xml"),
            fixture.dir.path().join(ISBN).join("META-INF").join("container.xml")
        );
    }
}
