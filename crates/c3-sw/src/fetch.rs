//! Per-request fetch policy.
//!
//! Same-origin GETs are served stale-while-revalidate: a cache hit returns at
//! once while a detached task refreshes the entry; a miss goes to the network
//! and falls back to the offline document (navigations) or a synthetic 503.

use std::sync::Arc;
use std::time::Duration;

use c3_common::with_timeout;
use c3_net::{Fetcher, Request, Response};
use http::Method;
use tokio::sync::RwLock;
use tracing::{debug, trace};

use crate::background::BackgroundTasks;
use crate::cache::{CacheFile, CacheStorage};
use crate::config::WorkerConfig;
use crate::error::Result;

/// Result of offering a request to the interceptor.
#[derive(Debug)]
pub enum FetchOutcome {
    /// Not intercepted; the caller should hit the network untouched.
    Passthrough,
    /// Respond with this.
    Respond(Response),
}

impl FetchOutcome {
    pub fn response(self) -> Option<Response> {
        match self {
            FetchOutcome::Passthrough => None,
            FetchOutcome::Respond(response) => Some(response),
        }
    }

    pub fn is_passthrough(&self) -> bool {
        matches!(self, FetchOutcome::Passthrough)
    }
}

/// Fetch a request, bounded by `timeout` when one is configured.
pub(crate) async fn fetch_network(
    fetcher: &dyn Fetcher,
    request: &Request,
    timeout: Option<Duration>,
) -> Result<Response> {
    let response = match timeout {
        Some(limit) => with_timeout(limit, || fetcher.fetch(request)).await??,
        None => fetcher.fetch(request).await?,
    };
    Ok(response)
}

/// Applies the cache policy to outgoing requests.
pub struct FetchInterceptor {
    config: Arc<WorkerConfig>,
    fetcher: Arc<dyn Fetcher>,
    caches: Arc<RwLock<CacheStorage>>,
    background: BackgroundTasks,
    cache_file: Option<Arc<CacheFile>>,
}

impl FetchInterceptor {
    pub fn new(
        config: Arc<WorkerConfig>,
        fetcher: Arc<dyn Fetcher>,
        caches: Arc<RwLock<CacheStorage>>,
        background: BackgroundTasks,
    ) -> Self {
        Self {
            config,
            fetcher,
            caches,
            background,
            cache_file: None,
        }
    }

    /// Mirror runtime cache writes to `file`.
    pub fn with_cache_file(mut self, file: Arc<CacheFile>) -> Self {
        self.cache_file = Some(file);
        self
    }

    /// Whether the policy applies to this request at all.
    pub fn intercepts(&self, request: &Request) -> bool {
        request.method == Method::GET && request.is_same_origin(&self.config.origin)
    }

    /// Handle one request.
    pub async fn handle(&self, request: Request) -> FetchOutcome {
        if !self.intercepts(&request) {
            trace!(url = %request.url, method = %request.method, "Passing request through");
            return FetchOutcome::Passthrough;
        }

        let cached = {
            let caches = self.caches.read().await;
            caches
                .get(&self.config.cache_version)
                .and_then(|cache| cache.match_request(&request))
                .map(|entry| entry.to_response())
        };

        if let Some(response) = cached {
            trace!(url = %request.url, "Cache hit");
            self.revalidate(request).await;
            return FetchOutcome::Respond(response);
        }

        trace!(url = %request.url, "Cache miss");
        FetchOutcome::Respond(self.fetch_and_store(request).await)
    }

    async fn fetch_and_store(&self, request: Request) -> Response {
        match fetch_network(self.fetcher.as_ref(), &request, self.config.network_timeout()).await {
            Ok(response) => {
                if response.ok() {
                    self.caches
                        .write()
                        .await
                        .open(&self.config.cache_version)
                        .put(&request, &response);
                    if let Some(file) = &self.cache_file {
                        file.save_or_warn(&self.caches).await;
                    }
                } else {
                    debug!(url = %request.url, status = %response.status, "Not caching error response");
                }
                response
            }
            Err(e) => {
                debug!(url = %request.url, error = %e, "Network failed on cache miss");
                self.offline_response(&request).await
            }
        }
    }

    async fn offline_response(&self, request: &Request) -> Response {
        if request.is_navigation() {
            if let Ok(offline_url) = self.config.offline_url() {
                let caches = self.caches.read().await;
                if let Some(entry) = caches.match_url(&offline_url) {
                    debug!(url = %request.url, "Serving offline document");
                    return entry.to_response();
                }
            }
        }
        Response::service_unavailable(request.url.clone())
    }

    /// Refresh a cached entry without holding up the caller.
    async fn revalidate(&self, request: Request) {
        let fetcher = Arc::clone(&self.fetcher);
        let caches = Arc::clone(&self.caches);
        let version = self.config.cache_version.clone();
        let timeout = self.config.network_timeout();
        let cache_file = self.cache_file.clone();

        self.background
            .spawn("revalidate", async move {
                match fetch_network(fetcher.as_ref(), &request, timeout).await {
                    Ok(response) if response.ok() => {
                        caches.write().await.open(&version).put(&request, &response);
                        trace!(url = %request.url, "Revalidated cache entry");
                        if let Some(file) = cache_file {
                            file.save_or_warn(&caches).await;
                        }
                    }
                    Ok(response) => {
                        debug!(url = %request.url, status = %response.status, "Revalidation returned error status");
                    }
                    Err(e) => {
                        debug!(url = %request.url, error = %e, "Revalidation failed");
                    }
                }
            })
            .await;
    }
}
