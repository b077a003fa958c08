//! In-memory transport for tests

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axis_tasks::Guarded;
use bytes::Bytes;

use crate::error::TransportError;
use crate::transport::HttpTransport;

type Responder = Arc<dyn Fn(&str) -> Result<Bytes, TransportError> + Send + Sync>;

#[derive(Clone)]
enum Route {
    Body(Bytes),
    FailThenServe { failures: u32, body: Bytes },
    AlwaysFail,
    Hang,
    Dynamic(Responder),
}

/// Scripted transport: exact routes first, then the longest matching prefix route.
/// Unknown URLs answer HTTP 404.
#[derive(Default)]
pub struct MemoryTransport {
    exact: Guarded<HashMap<String, Route>>,
    prefixes: Guarded<Vec<(String, Route)>>,
    calls: Guarded<HashMap<String, u32>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn serve(&self, url: &str, body: impl Into<Bytes>) -> &Self {
        self.insert(url, Route::Body(body.into()))
    }

    pub fn serve_after_failures(&self, url: &str, failures: u32, body: impl Into<Bytes>) -> &Self {
        self.insert(
            url,
            Route::FailThenServe {
                failures,
                body: body.into(),
            },
        )
    }

    pub fn fail_always(&self, url: &str) -> &Self {
        self.insert(url, Route::AlwaysFail)
    }

    /// Never answers before the request timeout
    pub fn hang(&self, url: &str) -> &Self {
        self.insert(url, Route::Hang)
    }

    pub fn respond_with_prefix(
        &self,
        prefix: &str,
        responder: impl Fn(&str) -> Result<Bytes, TransportError> + Send + Sync + 'static,
    ) -> &Self {
        let route = Route::Dynamic(Arc::new(responder));
        self.prefixes.update(|p| p.push((prefix.to_string(), route)));
        self
    }

    pub fn calls(&self, url: &str) -> u32 {
        self.calls.read(|c| c.get(url).copied().unwrap_or(0))
    }

    fn insert(&self, url: &str, route: Route) -> &Self {
        self.exact.update(|e| e.insert(url.to_string(), route));
        self
    }

    fn route_for(&self, url: &str) -> Option<Route> {
        if let Some(route) = self.exact.read(|e| e.get(url).cloned()) {
            return Some(route);
        }
        self.prefixes.read(|p| {
            p.iter()
                .filter(|(prefix, _)| url.starts_with(prefix.as_str()))
                .max_by_key(|(prefix, _)| prefix.len())
                .map(|(_, route)| route.clone())
        })
    }
}

#[async_trait]
impl HttpTransport for MemoryTransport {
    async fn get(&self, url: &str, timeout: Duration) -> Result<Bytes, TransportError> {
        let call = self.calls.update(|c| {
            let n = c.entry(url.to_string()).or_insert(0);
            *n += 1;
            *n
        });

        match self.route_for(url) {
            None => Err(TransportError::Status(404)),
            Some(Route::Body(body)) => Ok(body),
            Some(Route::FailThenServe { failures, body }) => {
                if call <= failures {
                    Err(TransportError::Request("connection reset".to_string()))
                } else {
                    Ok(body)
                }
            }
            Some(Route::AlwaysFail) => Err(TransportError::Status(503)),
            Some(Route::Hang) => {
                tokio::time::sleep(timeout).await;
                Err(TransportError::Timeout)
            }
            Some(Route::Dynamic(responder)) => responder(url),
        }
    }
}
