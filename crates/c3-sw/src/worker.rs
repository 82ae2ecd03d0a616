//! The offline cache manager: one isolated worker instance and its event loop.
//!
//! ```text
//! WorkerHandle ──Command──▶ event loop
//!                             ├── install / activate   (inline, serialized)
//!                             ├── push / click / defer (inline)
//!                             ├── fetch                (task per request)
//!                             └── sync                 (background task)
//! ```

use std::sync::Arc;

use bytes::Bytes;
use c3_net::{Fetcher, Request};
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{debug, info, warn};

use crate::background::BackgroundTasks;
use crate::cache::{CacheFile, CacheStorage};
use crate::clients::Clients;
use crate::config::WorkerConfig;
use crate::error::{Result, ServiceWorkerError};
use crate::fetch::{FetchInterceptor, FetchOutcome};
use crate::lifecycle::{ActivateReport, InstallReport, LifecycleManager, ServiceWorkerState};
use crate::notifications::{ClickOutcome, Notification, Notifications};
use crate::sync::{
    JsonFileSubmissionStore, MemorySubmissionStore, PendingSubmission, ReplayHandler,
    SubmissionStore, SyncHandler, SyncManager,
};
use crate::ServiceWorkerEvent;

type Reply<T> = oneshot::Sender<T>;

enum Command {
    Install(Reply<Result<InstallReport>>),
    Activate(Reply<Result<ActivateReport>>),
    Fetch(Request, Reply<FetchOutcome>),
    Defer(PendingSubmission, Reply<Result<()>>),
    RegisterSync(String, Reply<()>),
    Sync(String, Reply<Result<()>>),
    SyncAll(Reply<Vec<(String, Result<()>)>>),
    Push(Option<Bytes>, Reply<Notification>),
    NotificationClick {
        id: String,
        action: Option<String>,
        reply: Reply<Result<ClickOutcome>>,
    },
    Shutdown(Reply<()>),
}

/// A worker instance for one origin and cache generation.
///
/// [`OfflineCacheManager::new`] owns fresh caches, clients and queue. A newer
/// version takes over from a running one with
/// [`OfflineCacheManager::with_shared`], so that its activation sees and
/// deletes the older generation.
pub struct OfflineCacheManager {
    config: Arc<WorkerConfig>,
    fetcher: Arc<dyn Fetcher>,
    caches: Arc<RwLock<CacheStorage>>,
    clients: Arc<RwLock<Clients>>,
    store: Arc<dyn SubmissionStore>,
    cache_file: Option<Arc<CacheFile>>,
    sync: SyncManager,
    background: BackgroundTasks,
    event_tx: mpsc::UnboundedSender<ServiceWorkerEvent>,
}

impl OfflineCacheManager {
    /// Create a manager with a [`ReplayHandler`] for every configured sync tag.
    ///
    /// With `cache_store` set, the caches start from the saved snapshot.
    pub fn new(
        config: WorkerConfig,
        fetcher: Arc<dyn Fetcher>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ServiceWorkerEvent>)> {
        config.validate()?;
        let store: Arc<dyn SubmissionStore> = match &config.pending_store {
            Some(path) => Arc::new(JsonFileSubmissionStore::new(path)),
            None => Arc::new(MemorySubmissionStore::new()),
        };
        let caches = match &config.cache_store {
            Some(path) => CacheStorage::load_from(path)?,
            None => CacheStorage::new(),
        };
        Self::with_shared(
            config,
            fetcher,
            Arc::new(RwLock::new(caches)),
            Arc::new(RwLock::new(Clients::new())),
            store,
        )
    }

    /// Create a manager over existing caches, clients and submission queue,
    /// typically those of the version it replaces (see
    /// [`WorkerHandle::caches`], [`WorkerHandle::clients`] and
    /// [`WorkerHandle::submissions`]).
    pub fn with_shared(
        config: WorkerConfig,
        fetcher: Arc<dyn Fetcher>,
        caches: Arc<RwLock<CacheStorage>>,
        clients: Arc<RwLock<Clients>>,
        store: Arc<dyn SubmissionStore>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ServiceWorkerEvent>)> {
        config.validate()?;
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let config = Arc::new(config);
        let cache_file = config
            .cache_store
            .as_ref()
            .map(|path| Arc::new(CacheFile::new(path)));

        let mut sync = SyncManager::new(config.sync_retry.to_retry_config());
        let replay: Arc<dyn SyncHandler> = Arc::new(ReplayHandler::new(
            Arc::clone(&config),
            Arc::clone(&store),
            Arc::clone(&fetcher),
        ));
        for tag in &config.sync_tags {
            sync.set_handler(tag.clone(), Arc::clone(&replay));
        }

        Ok((
            Self {
                config,
                fetcher,
                caches,
                clients,
                store,
                cache_file,
                sync,
                background: BackgroundTasks::new(),
                event_tx,
            },
            event_rx,
        ))
    }

    /// Attach a handler for `tag`, replacing the default replay.
    pub fn register_sync_handler(&mut self, tag: impl Into<String>, handler: Arc<dyn SyncHandler>) {
        self.sync.set_handler(tag, handler);
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Spawn the event loop. Requires a running tokio runtime.
    pub fn start(self) -> WorkerHandle {
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        let mut lifecycle = LifecycleManager::new(
            Arc::clone(&self.config),
            Arc::clone(&self.fetcher),
            Arc::clone(&self.caches),
            Arc::clone(&self.clients),
            self.event_tx.clone(),
        );
        let mut interceptor = FetchInterceptor::new(
            Arc::clone(&self.config),
            Arc::clone(&self.fetcher),
            Arc::clone(&self.caches),
            self.background.clone(),
        );
        if let Some(file) = &self.cache_file {
            lifecycle = lifecycle.with_cache_file(Arc::clone(file));
            interceptor = interceptor.with_cache_file(Arc::clone(file));
        }
        let lifecycle = Arc::new(lifecycle);
        let interceptor = Arc::new(interceptor);

        let handle = WorkerHandle {
            commands: command_tx,
            lifecycle: Arc::clone(&lifecycle),
            caches: Arc::clone(&self.caches),
            clients: Arc::clone(&self.clients),
            store: Arc::clone(&self.store),
            background: self.background.clone(),
        };

        let event_loop = EventLoop {
            notifications: Notifications::new(Arc::clone(&self.config)),
            lifecycle,
            interceptor,
            sync: Arc::new(self.sync),
            store: self.store,
            clients: self.clients,
            background: self.background,
            events: self.event_tx,
        };
        info!(
            origin = %self.config.origin,
            version = %self.config.cache_version,
            "Starting offline cache manager"
        );
        tokio::spawn(event_loop.run(command_rx));

        handle
    }
}

struct EventLoop {
    lifecycle: Arc<LifecycleManager>,
    interceptor: Arc<FetchInterceptor>,
    sync: Arc<SyncManager>,
    store: Arc<dyn SubmissionStore>,
    notifications: Notifications,
    clients: Arc<RwLock<Clients>>,
    background: BackgroundTasks,
    events: mpsc::UnboundedSender<ServiceWorkerEvent>,
}

impl EventLoop {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = commands.recv().await {
            match command {
                Command::Install(reply) => {
                    let _ = reply.send(self.lifecycle.install().await);
                }
                Command::Activate(reply) => {
                    let _ = reply.send(self.lifecycle.activate().await);
                }
                Command::Fetch(request, reply) => {
                    let interceptor = Arc::clone(&self.interceptor);
                    tokio::spawn(async move {
                        let _ = reply.send(interceptor.handle(request).await);
                    });
                }
                Command::Defer(submission, reply) => {
                    let tag = submission.tag.clone();
                    let result = self.store.enqueue(submission).await;
                    if result.is_ok() {
                        self.sync.register(&tag).await;
                    }
                    let _ = reply.send(result);
                }
                Command::RegisterSync(tag, reply) => {
                    self.sync.register(&tag).await;
                    let _ = reply.send(());
                }
                Command::Sync(tag, reply) => {
                    let sync = Arc::clone(&self.sync);
                    let events = self.events.clone();
                    self.background
                        .spawn("sync", async move {
                            let result = sync.dispatch(&tag).await;
                            let _ = events.send(ServiceWorkerEvent::SyncComplete {
                                tag,
                                success: result.is_ok(),
                            });
                            let _ = reply.send(result);
                        })
                        .await;
                }
                Command::SyncAll(reply) => {
                    let sync = Arc::clone(&self.sync);
                    let events = self.events.clone();
                    self.background
                        .spawn("sync-all", async move {
                            let results = sync.dispatch_all().await;
                            for (tag, result) in &results {
                                let _ = events.send(ServiceWorkerEvent::SyncComplete {
                                    tag: tag.clone(),
                                    success: result.is_ok(),
                                });
                            }
                            let _ = reply.send(results);
                        })
                        .await;
                }
                Command::Push(data, reply) => {
                    let notification = self.notifications.show_push(data.as_deref());
                    let _ = self.events.send(ServiceWorkerEvent::NotificationShown {
                        notification_id: notification.id.clone(),
                    });
                    let _ = reply.send(notification);
                }
                Command::NotificationClick { id, action, reply } => {
                    let mut clients = self.clients.write().await;
                    let outcome = self
                        .notifications
                        .click(&id, action.as_deref(), &mut clients);
                    let _ = reply.send(outcome);
                }
                Command::Shutdown(reply) => {
                    debug!("Shutdown requested, draining background work");
                    self.background.wait_idle().await;
                    let _ = reply.send(());
                    break;
                }
            }
        }
        info!("Offline cache manager stopped");
    }
}

/// Cloneable front door to a running worker.
#[derive(Clone)]
pub struct WorkerHandle {
    commands: mpsc::UnboundedSender<Command>,
    lifecycle: Arc<LifecycleManager>,
    caches: Arc<RwLock<CacheStorage>>,
    clients: Arc<RwLock<Clients>>,
    store: Arc<dyn SubmissionStore>,
    background: BackgroundTasks,
}

impl WorkerHandle {
    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(build(tx))
            .map_err(|_| ServiceWorkerError::Stopped)?;
        rx.await.map_err(|_| ServiceWorkerError::Stopped)
    }

    pub async fn install(&self) -> Result<InstallReport> {
        self.request(Command::Install).await?
    }

    pub async fn activate(&self) -> Result<ActivateReport> {
        self.request(Command::Activate).await?
    }

    /// Install, then activate straight away when the install asks to skip
    /// waiting.
    pub async fn update(&self) -> Result<(InstallReport, Option<ActivateReport>)> {
        let installed = self.install().await?;
        if !installed.skip_waiting {
            return Ok((installed, None));
        }
        let activated = self.activate().await?;
        Ok((installed, Some(activated)))
    }

    /// Route a request through the cache policy.
    pub async fn fetch(&self, request: Request) -> Result<FetchOutcome> {
        self.request(|reply| Command::Fetch(request, reply)).await
    }

    /// Queue a submission that could not be sent and register its tag.
    pub async fn defer(&self, submission: PendingSubmission) -> Result<()> {
        self.request(|reply| Command::Defer(submission, reply)).await?
    }

    pub async fn register_sync(&self, tag: impl Into<String>) -> Result<()> {
        let tag = tag.into();
        self.request(|reply| Command::RegisterSync(tag, reply)).await
    }

    /// Fire one sync tag and wait for the outcome, retries included.
    pub async fn sync(&self, tag: impl Into<String>) -> Result<()> {
        let tag = tag.into();
        self.request(|reply| Command::Sync(tag, reply)).await?
    }

    /// Fire every pending sync registration.
    pub async fn connectivity_restored(&self) -> Result<Vec<(String, Result<()>)>> {
        self.request(Command::SyncAll).await
    }

    /// Deliver a push message.
    pub async fn push(&self, data: Option<Bytes>) -> Result<Notification> {
        self.request(|reply| Command::Push(data, reply)).await
    }

    pub async fn notification_click(
        &self,
        id: impl Into<String>,
        action: Option<&str>,
    ) -> Result<ClickOutcome> {
        let id = id.into();
        let action = action.map(str::to_string);
        self.request(|reply| Command::NotificationClick { id, action, reply })
            .await?
    }

    pub async fn state(&self) -> ServiceWorkerState {
        self.lifecycle.state().await
    }

    pub fn caches(&self) -> Arc<RwLock<CacheStorage>> {
        Arc::clone(&self.caches)
    }

    pub fn clients(&self) -> Arc<RwLock<Clients>> {
        Arc::clone(&self.clients)
    }

    pub fn submissions(&self) -> Arc<dyn SubmissionStore> {
        Arc::clone(&self.store)
    }

    /// Wait for detached work (revalidation, sync) to finish.
    pub async fn wait_idle(&self) {
        self.background.wait_idle().await;
    }

    /// Stop the event loop after draining background work.
    pub async fn shutdown(&self) -> Result<()> {
        let result = self.request(Command::Shutdown).await;
        if result.is_err() {
            warn!("Worker already stopped");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SYNC_CHECKIN, SYNC_GIVING};
    use crate::test_support::ScriptedFetcher;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use url::Url;

    fn config() -> WorkerConfig {
        let mut config = WorkerConfig::for_origin(Url::parse("https://c3.example/").unwrap())
            .with_precache(["/", "/css/base.css"]);
        config.sync_retry.max_attempts = 1;
        config.sync_retry.initial_delay_ms = 1;
        config
    }

    fn started(
        config: WorkerConfig,
        fetcher: &ScriptedFetcher,
    ) -> (WorkerHandle, mpsc::UnboundedReceiver<ServiceWorkerEvent>) {
        let (manager, events) =
            OfflineCacheManager::new(config, Arc::new(fetcher.clone())).unwrap();
        (manager.start(), events)
    }

    #[tokio::test]
    async fn test_update_installs_and_activates() {
        let config = config();
        let fetcher = ScriptedFetcher::serving_manifest(&config);
        let (worker, _events) = started(config, &fetcher);

        let (installed, activated) = worker.update().await.unwrap();
        assert_eq!(installed.cached, 2);
        assert!(activated.is_some());
        assert_eq!(worker.state().await, ServiceWorkerState::Activated);

        let outcome = worker
            .fetch(Request::get(Url::parse("https://c3.example/css/base.css").unwrap()))
            .await
            .unwrap();
        let response = outcome.response().unwrap();
        assert!(response.from_cache);
        assert_eq!(response.text().unwrap(), "/css/base.css v1");

        worker.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_defer_then_sync_replays() {
        let fetcher = ScriptedFetcher::new();
        fetcher.ok("https://c3.example/api/checkin", "");
        let (worker, mut events) = started(config(), &fetcher);

        worker
            .defer(PendingSubmission::post(
                SYNC_CHECKIN,
                "/api/checkin",
                json!({"member": 12}),
            ))
            .await
            .unwrap();
        assert_eq!(worker.submissions().len().await.unwrap(), 1);

        worker.sync(SYNC_CHECKIN).await.unwrap();
        assert_eq!(worker.submissions().len().await.unwrap(), 0);

        let mut completed = None;
        while let Ok(event) = events.try_recv() {
            if let ServiceWorkerEvent::SyncComplete { tag, success } = event {
                completed = Some((tag, success));
            }
        }
        assert_eq!(completed, Some((SYNC_CHECKIN.to_string(), true)));
    }

    #[tokio::test]
    async fn test_connectivity_restored_fires_pending_tags() {
        let fetcher = ScriptedFetcher::new();
        fetcher.ok("https://c3.example/api/give", "");
        let (worker, _events) = started(config(), &fetcher);

        worker
            .defer(PendingSubmission::post(SYNC_GIVING, "/api/give", json!({"amount": 20})))
            .await
            .unwrap();
        let results = worker.connectivity_restored().await.unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0, SYNC_GIVING);
        assert!(results[0].1.is_ok());
        assert_eq!(fetcher.call_count("https://c3.example/api/give"), 1);
    }

    #[tokio::test]
    async fn test_overlapping_syncs_post_each_gift_once() {
        let fetcher = ScriptedFetcher::new();
        fetcher.delayed(
            "https://c3.example/api/give",
            std::time::Duration::from_millis(100),
            "",
        );
        let (worker, _events) = started(config(), &fetcher);

        worker
            .defer(PendingSubmission::post(SYNC_GIVING, "/api/give", json!({"amount": 40})))
            .await
            .unwrap();
        let (first, second) = tokio::join!(worker.sync(SYNC_GIVING), worker.sync(SYNC_GIVING));

        assert!(first.is_ok() && second.is_ok());
        assert_eq!(fetcher.call_count("https://c3.example/api/give"), 1);
        assert_eq!(worker.submissions().len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_cache_store_restores_precache_after_restart() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config();
        config.cache_store = Some(dir.path().join("caches.json"));
        let fetcher = ScriptedFetcher::serving_manifest(&config);

        let (worker, _events) = started(config.clone(), &fetcher);
        worker.update().await.unwrap();
        worker.shutdown().await.unwrap();

        let offline = ScriptedFetcher::new();
        let (restarted, _events) = started(config, &offline);
        let response = restarted
            .fetch(Request::get(Url::parse("https://c3.example/css/base.css").unwrap()))
            .await
            .unwrap()
            .response()
            .unwrap();
        assert!(response.from_cache);
        assert_eq!(response.text().unwrap(), "/css/base.css v1");
        restarted.wait_idle().await;
    }

    struct Counting(AtomicU32);

    #[async_trait]
    impl SyncHandler for Counting {
        async fn run(&self, _tag: &str) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_custom_sync_handler_replaces_default() {
        let counting = Arc::new(Counting(AtomicU32::new(0)));
        let (mut manager, _events) =
            OfflineCacheManager::new(config(), Arc::new(ScriptedFetcher::new())).unwrap();
        manager.register_sync_handler(SYNC_GIVING, counting.clone());
        let worker = manager.start();

        worker.sync(SYNC_GIVING).await.unwrap();
        assert_eq!(counting.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_push_and_click_open_window() {
        let (worker, mut events) = started(config(), &ScriptedFetcher::new());

        let shown = worker
            .push(Some(Bytes::from_static(br#"{"url":"/events"}"#)))
            .await
            .unwrap();
        let outcome = worker.notification_click(&shown.id, None).await.unwrap();

        let ClickOutcome::Opened(client_id) = outcome else {
            panic!("expected a new window, got {outcome:?}");
        };
        let clients = worker.clients();
        let clients = clients.read().await;
        assert_eq!(
            clients.get(&client_id).unwrap().url.as_str(),
            "https://c3.example/events"
        );
        assert!(matches!(
            events.try_recv(),
            Ok(ServiceWorkerEvent::NotificationShown { .. })
        ));
    }

    #[tokio::test]
    async fn test_stopped_worker_rejects_commands() {
        let (worker, _events) = started(config(), &ScriptedFetcher::new());
        worker.shutdown().await.unwrap();

        assert!(matches!(
            worker.install().await,
            Err(ServiceWorkerError::Stopped)
        ));
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = config().with_cache_version("  ");
        assert!(OfflineCacheManager::new(config, Arc::new(ScriptedFetcher::new())).is_err());
    }
}
