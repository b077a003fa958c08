//! Bounded-retry item fetcher
//!
//! Each URL is retried up to `max_attempts` times. When a URL exhausts its
//! attempts the fetcher stops for good: every other in-flight request is
//! aborted, their callers observe `FetchError::Stopped`, and the termination
//! listener receives the terminal error. A book with one missing resource is
//! unusable, so sibling downloads are not worth finishing.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axis_tasks::Guarded;
use bytes::Bytes;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;

use crate::error::{FetchError, TransportError};
use crate::files::write_file;
use crate::transport::HttpTransport;
use crate::Result;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

type Handler = oneshot::Sender<Result<Bytes>>;
type TerminationListener = Arc<dyn Fn(&FetchError) + Send + Sync>;

struct PendingFetch {
    task: AbortHandle,
    handler: Handler,
}

#[derive(Default)]
struct FetcherState {
    errored: bool,
    in_flight: HashMap<String, PendingFetch>,
    attempts: HashMap<String, u32>,
    listener: Option<TerminationListener>,
}

enum Next {
    Ignore,
    Retry(Handler, u32, TransportError),
    Terminal(Handler, FetchError, Option<TerminationListener>),
}

pub struct ItemFetcher {
    transport: Arc<dyn HttpTransport>,
    handle: Handle,
    timeout: Duration,
    max_attempts: u32,
    state: Guarded<FetcherState>,
}

impl ItemFetcher {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        handle: Handle,
        timeout: Duration,
        max_attempts: u32,
    ) -> Arc<Self> {
        Arc::new(Self {
            transport,
            handle,
            timeout,
            max_attempts: max_attempts.max(1),
            state: Guarded::default(),
        })
    }

    /// Download `url`.
    ///
    /// Fails immediately with `AlreadyRequested` while the same URL is in
    /// flight, and with `Stopped` once the fetcher has stopped.
    pub async fn fetch(self: &Arc<Self>, url: &str) -> Result<Bytes> {
        let (tx, rx) = oneshot::channel();
        self.request(url.to_string(), tx)?;
        rx.await.unwrap_or(Err(FetchError::Stopped))
    }

    /// Download `url` and store it at `path`
    pub async fn fetch_to(self: &Arc<Self>, url: &str, path: &Path) -> Result<()> {
        let bytes = self.fetch(url).await?;
        write_file(path, &bytes)
            .await
            .map_err(|e| FetchError::write(path, &e))?;

        tracing::debug!(url = %url, path = %path.display(), bytes = bytes.len(), "Stored item");
        Ok(())
    }

    /// Listener for the terminal failure that stopped the fetcher
    pub fn on_termination(&self, listener: impl Fn(&FetchError) + Send + Sync + 'static) {
        let listener: TerminationListener = Arc::new(listener);
        self.state.update(|s| s.listener = Some(listener));
    }

    /// Abort every request and refuse new ones. Returns false if already stopped.
    pub fn stop(&self) -> bool {
        let (was_running, pending) = self.state.update(|s| {
            let was_running = !std::mem::replace(&mut s.errored, true);
            s.attempts.clear();
            let pending: Vec<PendingFetch> = s.in_flight.drain().map(|(_, p)| p).collect();
            (was_running, pending)
        });

        if was_running {
            tracing::debug!(aborted = pending.len(), "Stopping item fetcher");
        }
        for fetch in pending {
            fetch.task.abort();
        }
        was_running
    }

    pub fn is_stopped(&self) -> bool {
        self.state.read(|s| s.errored)
    }

    pub fn in_flight(&self) -> usize {
        self.state.read(|s| s.in_flight.len())
    }

    fn request(self: &Arc<Self>, url: String, handler: Handler) -> Result<()> {
        self.state.update(|s| {
            if s.errored {
                return Err(FetchError::Stopped);
            }
            if s.in_flight.contains_key(&url) {
                return Err(FetchError::AlreadyRequested(url.clone()));
            }

            let attempt = s.attempts.entry(url.clone()).or_insert(0);
            *attempt += 1;

            let fetcher = Arc::clone(self);
            let transport = Arc::clone(&self.transport);
            let timeout = self.timeout;
            let task_url = url.clone();
            let task = self.handle.spawn(async move {
                let result = transport.get(&task_url, timeout).await;
                fetcher.on_response(task_url, result);
            });

            s.in_flight.insert(
                url,
                PendingFetch {
                    task: task.abort_handle(),
                    handler,
                },
            );
            Ok(())
        })
    }

    fn on_response(self: &Arc<Self>, url: String, result: std::result::Result<Bytes, TransportError>) {
        let err = match result {
            Ok(bytes) => {
                let handler = self.state.update(|s| {
                    s.attempts.remove(&url);
                    s.in_flight.remove(&url).map(|p| p.handler)
                });
                if let Some(handler) = handler {
                    let _ = handler.send(Ok(bytes));
                }
                return;
            }
            Err(err) => err,
        };

        let next = self.state.update(|s| {
            let Some(pending) = s.in_flight.remove(&url) else {
                return Next::Ignore;
            };
            let attempts = s.attempts.get(&url).copied().unwrap_or(0);
            if attempts < self.max_attempts {
                return Next::Retry(pending.handler, attempts, err.clone());
            }

            s.errored = true;
            s.attempts.clear();
            for (_, sibling) in s.in_flight.drain() {
                sibling.task.abort();
            }
            let error = FetchError::Terminal {
                url: url.clone(),
                attempts,
                source: err.clone(),
            };
            Next::Terminal(pending.handler, error, s.listener.clone())
        });

        match next {
            Next::Ignore => {}
            Next::Retry(handler, attempts, err) => {
                tracing::debug!(url = %url, attempt = attempts, error = %err, "Retrying item");
                if let Err(e) = self.request(url.clone(), handler) {
                    tracing::debug!(url = %url, error = %e, "Retry not issued");
                }
            }
            Next::Terminal(handler, error, listener) => {
                tracing::warn!(url = %url, error = %error, "Item failed, stopping all downloads");
                let _ = handler.send(Err(error.clone()));
                if let Some(listener) = listener {
                    listener(&error);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryTransport;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fetcher(transport: &Arc<MemoryTransport>, timeout: Duration) -> Arc<ItemFetcher> {
        ItemFetcher::new(
            Arc::clone(transport) as Arc<dyn HttpTransport>,
            Handle::current(),
            timeout,
            DEFAULT_MAX_ATTEMPTS,
        )
    }

    #[tokio::test]
    async fn test_fetch_success() {
        let transport = Arc::new(MemoryTransport::new());
        transport.serve("https://cdn.test/a", "alpha");
        let fetcher = fetcher(&transport, Duration::from_secs(5));

        let bytes = fetcher.fetch("https://cdn.test/a").await.unwrap();
        assert_eq!(&bytes[..], b"alpha");
        assert_eq!(fetcher.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_retries_transient_failures() {
        let transport = Arc::new(MemoryTransport::new());
        transport.serve_after_failures("https://cdn.test/flaky", 2, "ok");
        let fetcher = fetcher(&transport, Duration::from_secs(5));

        let bytes = fetcher.fetch("https://cdn.test/flaky").await.unwrap();
        assert_eq!(&bytes[..], b"ok");
        assert_eq!(transport.calls("https://cdn.test/flaky"), 3);
        assert!(!fetcher.is_stopped());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_terminal_failure_stops_siblings() {
        let transport = Arc::new(MemoryTransport::new());
        transport.fail_always("https://cdn.test/missing");
        transport.hang("https://cdn.test/slow");
        let fetcher = fetcher(&transport, Duration::from_secs(30));

        let terminations = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&terminations);
        fetcher.on_termination(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let sibling = {
            let fetcher = Arc::clone(&fetcher);
            tokio::spawn(async move { fetcher.fetch("https://cdn.test/slow").await })
        };
        tokio::task::yield_now().await;

        let result = fetcher.fetch("https://cdn.test/missing").await;
        assert!(matches!(
            result,
            Err(FetchError::Terminal { attempts: 3, .. })
        ));
        assert_eq!(transport.calls("https://cdn.test/missing"), 3);

        let sibling = tokio::time::timeout(Duration::from_secs(5), sibling)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(sibling, Err(FetchError::Stopped));

        assert_eq!(terminations.load(Ordering::SeqCst), 1);
        assert!(fetcher.is_stopped());
        assert_eq!(
            fetcher.fetch("https://cdn.test/other").await,
            Err(FetchError::Stopped)
        );
    }

    #[tokio::test]
    async fn test_duplicate_request_is_rejected() {
        let transport = Arc::new(MemoryTransport::new());
        transport.hang("https://cdn.test/slow");
        let fetcher = fetcher(&transport, Duration::from_secs(30));

        let first = {
            let fetcher = Arc::clone(&fetcher);
            tokio::spawn(async move { fetcher.fetch("https://cdn.test/slow").await })
        };
        while fetcher.in_flight() == 0 {
            tokio::task::yield_now().await;
        }

        assert_eq!(
            fetcher.fetch("https://cdn.test/slow").await,
            Err(FetchError::AlreadyRequested("https://cdn.test/slow".to_string()))
        );

        assert!(fetcher.stop());
        assert_eq!(first.await.unwrap(), Err(FetchError::Stopped));
        assert!(!fetcher.stop());
    }

    #[tokio::test]
    async fn test_fetch_to_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(MemoryTransport::new());
        transport.serve("https://cdn.test/META-INF/container.xml", "<container/>");
        let fetcher = fetcher(&transport, Duration::from_secs(5));

        let path = dir.path().join("META-INF/container.xml");
        fetcher
            .fetch_to("https://cdn.test/META-INF/container.xml", &path)
            .await
            .unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"<container/>");
    }
}
