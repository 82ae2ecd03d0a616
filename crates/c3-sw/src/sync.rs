//! Deferred background sync.
//!
//! ```text
//! SyncManager (platform side: registrations, dispatch, backoff)
//!     └── tag → SyncHandler (unit of work)
//!                 └── ReplayHandler → SubmissionStore → Fetcher
//! ```
//!
//! The application enqueues a [`PendingSubmission`] when a check-in or gift
//! cannot be sent. When connectivity returns the manager fires the tag's
//! handler, which resubmits each pending entry and removes it only after the
//! server confirms.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use c3_common::{retry_if, C3Error, RetryConfig};
use c3_net::{Fetcher, Request};
use hashbrown::HashMap;
use http::{HeaderValue, Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::WorkerConfig;
use crate::error::{Result, ServiceWorkerError};
use crate::fetch::fetch_network;

// ==================== Handlers ====================

/// The replay work for one sync tag.
#[async_trait]
pub trait SyncHandler: Send + Sync {
    /// Run once. An `Err` asks the platform to retry later.
    async fn run(&self, tag: &str) -> Result<()>;
}

/// Sync registration state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncState {
    /// Waiting for connectivity.
    #[default]
    Pending,
    /// Handler running.
    Firing,
    /// Completed.
    Success,
    /// Gave up after the last retry.
    Failed,
}

/// Interest in a tag.
#[derive(Debug, Clone)]
pub struct SyncRegistration {
    pub tag: String,
    pub state: SyncState,
    /// Handler runs across all dispatches.
    pub attempts: u32,
}

impl SyncRegistration {
    fn new(tag: &str) -> Self {
        Self {
            tag: tag.to_string(),
            state: SyncState::Pending,
            attempts: 0,
        }
    }
}

/// Registrations plus the handler for each tag.
pub struct SyncManager {
    handlers: HashMap<String, Arc<dyn SyncHandler>>,
    registrations: RwLock<HashMap<String, SyncRegistration>>,
    /// One run per tag at a time; later dispatches queue behind it.
    running: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    retry: RetryConfig,
}

impl SyncManager {
    pub fn new(retry: RetryConfig) -> Self {
        Self {
            handlers: HashMap::new(),
            registrations: RwLock::new(HashMap::new()),
            running: Mutex::new(HashMap::new()),
            retry,
        }
    }

    /// Attach the handler for `tag`, replacing any earlier one.
    pub fn set_handler(&mut self, tag: impl Into<String>, handler: Arc<dyn SyncHandler>) {
        self.handlers.insert(tag.into(), handler);
    }

    pub fn has_handler(&self, tag: &str) -> bool {
        self.handlers.contains_key(tag)
    }

    /// Record interest in `tag`. Re-registering resets a finished tag.
    pub async fn register(&self, tag: &str) {
        if !self.has_handler(tag) {
            warn!(tag, "Registering sync tag with no handler");
        }
        let mut registrations = self.registrations.write().await;
        let registration = registrations
            .entry(tag.to_string())
            .or_insert_with(|| SyncRegistration::new(tag));
        if registration.state != SyncState::Firing {
            registration.state = SyncState::Pending;
        }
        debug!(tag, "Sync registered");
    }

    /// Snapshot of a registration.
    pub async fn registration(&self, tag: &str) -> Option<SyncRegistration> {
        self.registrations.read().await.get(tag).cloned()
    }

    /// Tags waiting for connectivity, sorted.
    pub async fn pending_tags(&self) -> Vec<String> {
        let mut tags: Vec<String> = self
            .registrations
            .read()
            .await
            .values()
            .filter(|r| r.state == SyncState::Pending)
            .map(|r| r.tag.clone())
            .collect();
        tags.sort();
        tags
    }

    /// Fire the handler for `tag`, retrying transient failures with backoff,
    /// and resolve when it has either succeeded or given up.
    ///
    /// A dispatch for a tag that is already firing waits for that run to
    /// finish and then runs again, so a handler never overlaps itself.
    /// Tags without a handler are ignored.
    pub async fn dispatch(&self, tag: &str) -> Result<()> {
        let Some(handler) = self.handlers.get(tag).cloned() else {
            warn!(tag, "No sync handler for tag");
            return Ok(());
        };

        let tag_lock = {
            let mut running = self.running.lock().await;
            Arc::clone(running.entry(tag.to_string()).or_default())
        };
        let _running = tag_lock.lock().await;

        self.update(tag, |r| r.state = SyncState::Firing).await;
        info!(tag, "Syncing");

        let result = retry_if(
            &self.retry,
            || {
                let handler = Arc::clone(&handler);
                async move {
                    self.update(tag, |r| r.attempts += 1).await;
                    handler.run(tag).await
                }
            },
            ServiceWorkerError::is_transient,
        )
        .await;

        match result {
            Ok(()) => {
                self.update(tag, |r| r.state = SyncState::Success).await;
                info!(tag, "Sync complete");
                Ok(())
            }
            Err(e) => {
                self.update(tag, |r| r.state = SyncState::Failed).await;
                warn!(tag, error = %e, "Sync failed after retries");
                Err(ServiceWorkerError::SyncError(format!("{tag}: {e}")))
            }
        }
    }

    /// Fire every pending registration, as when connectivity returns.
    pub async fn dispatch_all(&self) -> Vec<(String, Result<()>)> {
        let mut results = Vec::new();
        for tag in self.pending_tags().await {
            let result = self.dispatch(&tag).await;
            results.push((tag, result));
        }
        results
    }

    async fn update(&self, tag: &str, f: impl FnOnce(&mut SyncRegistration)) {
        let mut registrations = self.registrations.write().await;
        let registration = registrations
            .entry(tag.to_string())
            .or_insert_with(|| SyncRegistration::new(tag));
        f(registration);
    }
}

// ==================== Pending submissions ====================

/// A state change waiting to reach the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingSubmission {
    pub id: String,
    /// Sync tag that replays this submission.
    pub tag: String,
    /// Root-relative endpoint.
    pub path: String,
    pub method: String,
    pub body: JsonValue,
    /// ms since epoch.
    pub queued_at: u64,
}

impl PendingSubmission {
    /// A POST of `body` to `path`, replayed under `tag`.
    pub fn post(tag: impl Into<String>, path: impl Into<String>, body: JsonValue) -> Self {
        Self {
            id: submission_id(),
            tag: tag.into(),
            path: path.into(),
            method: Method::POST.to_string(),
            body,
            queued_at: now_millis(),
        }
    }
}

/// Durable queue of pending submissions.
#[async_trait]
pub trait SubmissionStore: Send + Sync {
    async fn enqueue(&self, submission: PendingSubmission) -> Result<()>;

    /// Pending entries for `tag`, oldest first.
    async fn pending(&self, tag: &str) -> Result<Vec<PendingSubmission>>;

    /// Remove a confirmed entry. Returns whether it was present.
    async fn remove(&self, id: &str) -> Result<bool>;

    async fn len(&self) -> Result<usize>;
}

/// Process-lifetime store.
#[derive(Default)]
pub struct MemorySubmissionStore {
    entries: Mutex<Vec<PendingSubmission>>,
}

impl MemorySubmissionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SubmissionStore for MemorySubmissionStore {
    async fn enqueue(&self, submission: PendingSubmission) -> Result<()> {
        self.entries.lock().await.push(submission);
        Ok(())
    }

    async fn pending(&self, tag: &str) -> Result<Vec<PendingSubmission>> {
        Ok(self
            .entries
            .lock()
            .await
            .iter()
            .filter(|s| s.tag == tag)
            .cloned()
            .collect())
    }

    async fn remove(&self, id: &str) -> Result<bool> {
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|s| s.id != id);
        Ok(entries.len() != before)
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.entries.lock().await.len())
    }
}

/// Store backed by a single JSON file, rewritten on every change.
pub struct JsonFileSubmissionStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonFileSubmissionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    async fn load(&self) -> Result<Vec<PendingSubmission>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                ServiceWorkerError::SyncError(format!(
                    "parsing {}: {e}",
                    self.path.display()
                ))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(C3Error::storage(&self.path, e).into()),
        }
    }

    async fn save(&self, entries: &[PendingSubmission]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| C3Error::storage(parent, e))?;
            }
        }
        let contents = serde_json::to_vec_pretty(entries)
            .map_err(|e| ServiceWorkerError::SyncError(e.to_string()))?;

        // Write then rename so a crash never leaves a truncated queue.
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, contents)
            .await
            .map_err(|e| C3Error::storage(&tmp, e))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| C3Error::storage(&self.path, e))?;
        Ok(())
    }
}

#[async_trait]
impl SubmissionStore for JsonFileSubmissionStore {
    async fn enqueue(&self, submission: PendingSubmission) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut entries = self.load().await?;
        entries.push(submission);
        self.save(&entries).await
    }

    async fn pending(&self, tag: &str) -> Result<Vec<PendingSubmission>> {
        let _guard = self.lock.lock().await;
        Ok(self
            .load()
            .await?
            .into_iter()
            .filter(|s| s.tag == tag)
            .collect())
    }

    async fn remove(&self, id: &str) -> Result<bool> {
        let _guard = self.lock.lock().await;
        let mut entries = self.load().await?;
        let before = entries.len();
        entries.retain(|s| s.id != id);
        if entries.len() == before {
            return Ok(false);
        }
        self.save(&entries).await?;
        Ok(true)
    }

    async fn len(&self) -> Result<usize> {
        let _guard = self.lock.lock().await;
        Ok(self.load().await?.len())
    }
}

// ==================== Replay ====================

/// Resubmits the pending entries for a tag.
pub struct ReplayHandler {
    config: Arc<WorkerConfig>,
    store: Arc<dyn SubmissionStore>,
    fetcher: Arc<dyn Fetcher>,
}

impl ReplayHandler {
    pub fn new(
        config: Arc<WorkerConfig>,
        store: Arc<dyn SubmissionStore>,
        fetcher: Arc<dyn Fetcher>,
    ) -> Self {
        Self {
            config,
            store,
            fetcher,
        }
    }

    fn build_request(&self, submission: &PendingSubmission) -> Result<Request> {
        let url = self.config.resolve(&submission.path)?;
        let method = Method::from_bytes(submission.method.as_bytes()).map_err(|e| {
            ServiceWorkerError::SyncError(format!("bad method {:?}: {e}", submission.method))
        })?;
        let body = serde_json::to_vec(&submission.body)
            .map_err(|e| ServiceWorkerError::SyncError(e.to_string()))?;

        let mut request = Request::post(url, Bytes::from(body)).header(
            http::header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        request.method = method;
        Ok(request)
    }

    /// Drop a submission that can never succeed so it stops blocking the
    /// entries queued after it.
    async fn discard(&self, submission: &PendingSubmission, reason: &str) -> Result<()> {
        warn!(
            tag = %submission.tag,
            id = %submission.id,
            method = %submission.method,
            path = %submission.path,
            body = %submission.body,
            reason,
            "Discarding submission"
        );
        self.store.remove(&submission.id).await?;
        Ok(())
    }
}

/// A 4xx the server will give again on every retry. 408 and 429 are about
/// timing, not the request, and stay retryable.
fn is_rejection(status: StatusCode) -> bool {
    status.is_client_error()
        && status != StatusCode::REQUEST_TIMEOUT
        && status != StatusCode::TOO_MANY_REQUESTS
}

#[async_trait]
impl SyncHandler for ReplayHandler {
    async fn run(&self, tag: &str) -> Result<()> {
        let pending = self.store.pending(tag).await?;
        if pending.is_empty() {
            debug!(tag, "Nothing to replay");
            return Ok(());
        }
        info!(tag, count = pending.len(), "Replaying pending submissions");

        for submission in pending {
            let request = match self.build_request(&submission) {
                Ok(request) => request,
                Err(e) => {
                    self.discard(&submission, &e.to_string()).await?;
                    continue;
                }
            };
            let response =
                fetch_network(self.fetcher.as_ref(), &request, self.config.network_timeout())
                    .await?;
            if is_rejection(response.status) {
                let reason = format!("server rejected it with {}", response.status);
                self.discard(&submission, &reason).await?;
                continue;
            }
            if !response.ok() {
                return Err(ServiceWorkerError::SyncError(format!(
                    "{} {} returned {}",
                    submission.method, submission.path, response.status
                )));
            }
            self.store.remove(&submission.id).await?;
            debug!(tag, id = %submission.id, "Submission confirmed");
        }
        Ok(())
    }
}

// ==================== Helpers ====================

fn submission_id() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default();
    format!("{:016x}-{:04x}", nanos, COUNTER.fetch_add(1, Ordering::Relaxed))
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
