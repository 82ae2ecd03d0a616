//! Install and activate phases for a cache generation.

use std::sync::Arc;

use c3_net::{Fetcher, Request, Response};
use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use crate::cache::{CacheFile, CacheStorage};
use crate::clients::Clients;
use crate::config::WorkerConfig;
use crate::error::{Result, ServiceWorkerError};
use crate::fetch::fetch_network;
use crate::ServiceWorkerEvent;

/// Service worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ServiceWorkerState {
    /// Constructed, nothing run yet.
    #[default]
    Parsed,
    /// Precaching the manifest.
    Installing,
    /// Generation populated, waiting to activate.
    Installed,
    /// Deleting old generations and claiming clients.
    Activating,
    /// Active and controlling clients.
    Activated,
    /// Install failed.
    Redundant,
}

/// What a successful install did.
#[derive(Debug, Clone)]
pub struct InstallReport {
    /// Generation that was populated.
    pub generation: String,
    /// Number of manifest entries stored.
    pub cached: usize,
    /// Whether the offline document was cached alongside the manifest.
    pub offline_cached: bool,
    /// Whether the new generation should take over without waiting for
    /// existing clients to close.
    pub skip_waiting: bool,
}

/// What a successful activation did.
#[derive(Debug, Clone, Default)]
pub struct ActivateReport {
    /// Generations removed.
    pub deleted: Vec<String>,
    /// Clients that came under control.
    pub claimed: Vec<String>,
}

/// Drives install/activate for the configured generation.
pub struct LifecycleManager {
    config: Arc<WorkerConfig>,
    fetcher: Arc<dyn Fetcher>,
    caches: Arc<RwLock<CacheStorage>>,
    clients: Arc<RwLock<Clients>>,
    events: mpsc::UnboundedSender<ServiceWorkerEvent>,
    state: RwLock<ServiceWorkerState>,
    cache_file: Option<Arc<CacheFile>>,
}

impl LifecycleManager {
    pub fn new(
        config: Arc<WorkerConfig>,
        fetcher: Arc<dyn Fetcher>,
        caches: Arc<RwLock<CacheStorage>>,
        clients: Arc<RwLock<Clients>>,
        events: mpsc::UnboundedSender<ServiceWorkerEvent>,
    ) -> Self {
        Self {
            config,
            fetcher,
            caches,
            clients,
            events,
            state: RwLock::new(ServiceWorkerState::Parsed),
            cache_file: None,
        }
    }

    /// Mirror install and activate results to `file`.
    pub fn with_cache_file(mut self, file: Arc<CacheFile>) -> Self {
        self.cache_file = Some(file);
        self
    }

    async fn persist(&self) {
        if let Some(file) = &self.cache_file {
            file.save_or_warn(&self.caches).await;
        }
    }

    /// Current state.
    pub async fn state(&self) -> ServiceWorkerState {
        *self.state.read().await
    }

    async fn set_state(&self, state: ServiceWorkerState) {
        *self.state.write().await = state;
        debug!(version = %self.config.cache_version, ?state, "Worker state changed");
        let _ = self.events.send(ServiceWorkerEvent::StateChange {
            cache_version: self.config.cache_version.clone(),
            new_state: state,
        });
    }

    /// Precache every manifest path into the current generation.
    ///
    /// All responses are fetched and checked before anything is written, so a
    /// failure leaves the generation untouched.
    pub async fn install(&self) -> Result<InstallReport> {
        match self.state().await {
            ServiceWorkerState::Parsed | ServiceWorkerState::Redundant => {}
            other => {
                return Err(ServiceWorkerError::StateError(format!(
                    "cannot install from {other:?}"
                )))
            }
        }
        self.set_state(ServiceWorkerState::Installing).await;

        info!(
            version = %self.config.cache_version,
            assets = self.config.precache.len(),
            "Caching core assets"
        );

        let fetched = match self.fetch_manifest().await {
            Ok(fetched) => fetched,
            Err(e) => {
                warn!(version = %self.config.cache_version, error = %e, "Install failed");
                self.set_state(ServiceWorkerState::Redundant).await;
                return Err(e);
            }
        };

        let cached = fetched.len();
        let offline = self.fetch_offline_document().await;
        let offline_cached = offline.is_some() || self.manifest_has_offline_document();
        {
            let mut caches = self.caches.write().await;
            let cache = caches.open(&self.config.cache_version);
            for (request, response) in fetched.iter().chain(offline.iter()) {
                cache.put(request, response);
            }
        }
        self.persist().await;

        self.set_state(ServiceWorkerState::Installed).await;

        Ok(InstallReport {
            generation: self.config.cache_version.clone(),
            cached,
            offline_cached,
            skip_waiting: true,
        })
    }

    fn manifest_has_offline_document(&self) -> bool {
        self.config.precache.contains(&self.config.offline_path)
    }

    /// Best-effort fetch of the offline document when the manifest lacks it.
    /// Failure only means navigations get a plain 503 while offline.
    async fn fetch_offline_document(&self) -> Option<(Request, Response)> {
        if self.manifest_has_offline_document() {
            return None;
        }
        let url = self.config.offline_url().ok()?;
        let request = Request::get(url);
        match fetch_network(self.fetcher.as_ref(), &request, self.config.network_timeout()).await {
            Ok(response) if response.ok() => Some((request, response)),
            Ok(response) => {
                warn!(status = %response.status, "Offline document not cached");
                None
            }
            Err(e) => {
                warn!(error = %e, "Offline document not cached");
                None
            }
        }
    }

    async fn fetch_manifest(&self) -> Result<Vec<(Request, Response)>> {
        let timeout = self.config.network_timeout();

        let fetches = self.config.precache.iter().map(|path| async move {
            let url = self
                .config
                .resolve(path)
                .map_err(|e| ServiceWorkerError::InstallFailed {
                    path: path.clone(),
                    reason: e.to_string(),
                })?;
            let request = Request::get(url);
            let response = fetch_network(self.fetcher.as_ref(), &request, timeout)
                .await
                .map_err(|e| ServiceWorkerError::InstallFailed {
                    path: path.clone(),
                    reason: e.to_string(),
                })?;
            if !response.ok() {
                return Err(ServiceWorkerError::InstallFailed {
                    path: path.clone(),
                    reason: format!("status {}", response.status),
                });
            }
            Ok::<_, ServiceWorkerError>((request, response))
        });

        try_join_all(fetches).await
    }

    /// Drop every other generation and take control of open clients.
    pub async fn activate(&self) -> Result<ActivateReport> {
        let state = self.state().await;
        if state != ServiceWorkerState::Installed {
            return Err(ServiceWorkerError::StateError(format!(
                "cannot activate from {state:?}; install must complete first"
            )));
        }
        self.set_state(ServiceWorkerState::Activating).await;

        let deleted = {
            let mut caches = self.caches.write().await;
            let stale: Vec<String> = caches
                .keys()
                .into_iter()
                .filter(|name| *name != self.config.cache_version)
                .collect();
            for name in &stale {
                caches.delete(name);
                info!(generation = %name, "Deleted old cache generation");
            }
            stale
        };
        if !deleted.is_empty() {
            self.persist().await;
        }

        let claimed = self.clients.write().await.claim(&self.config.cache_version);
        for client_id in &claimed {
            let _ = self.events.send(ServiceWorkerEvent::ControllerChange {
                client_id: client_id.clone(),
            });
        }

        self.set_state(ServiceWorkerState::Activated).await;

        Ok(ActivateReport { deleted, claimed })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::Client;
    use crate::test_support::ScriptedFetcher;
    use url::Url;

    struct Harness {
        lifecycle: LifecycleManager,
        caches: Arc<RwLock<CacheStorage>>,
        clients: Arc<RwLock<Clients>>,
        events: mpsc::UnboundedReceiver<ServiceWorkerEvent>,
    }

    fn harness(config: WorkerConfig, fetcher: ScriptedFetcher) -> Harness {
        let caches = Arc::new(RwLock::new(CacheStorage::new()));
        let clients = Arc::new(RwLock::new(Clients::new()));
        let (tx, rx) = mpsc::unbounded_channel();
        Harness {
            lifecycle: LifecycleManager::new(
                Arc::new(config),
                Arc::new(fetcher),
                caches.clone(),
                clients.clone(),
                tx,
            ),
            caches,
            clients,
            events: rx,
        }
    }

    fn config() -> WorkerConfig {
        WorkerConfig::for_origin(Url::parse("https://c3.example/").unwrap())
    }

    #[tokio::test]
    async fn test_install_caches_every_manifest_path() {
        let config = config();
        let fetcher = ScriptedFetcher::serving_manifest(&config);
        let h = harness(config.clone(), fetcher);

        let report = h.lifecycle.install().await.unwrap();
        assert_eq!(report.generation, "c3-app-v1");
        assert_eq!(report.cached, config.precache.len());
        assert!(report.skip_waiting);
        assert!(report.offline_cached);
        assert_eq!(h.lifecycle.state().await, ServiceWorkerState::Installed);

        let caches = h.caches.read().await;
        let cache = caches.get("c3-app-v1").unwrap();
        for path in &config.precache {
            let entry = cache.match_url(&config.resolve(path).unwrap()).unwrap();
            assert_eq!(entry.status, 200, "{path}");
        }
        assert!(cache.match_url(&config.offline_url().unwrap()).is_some());
    }

    #[tokio::test]
    async fn test_missing_offline_document_does_not_fail_install() {
        let config = config().with_precache(["/"]);
        let fetcher = ScriptedFetcher::new();
        fetcher.ok("https://c3.example/", "<html></html>");
        let h = harness(config, fetcher);

        let report = h.lifecycle.install().await.unwrap();
        assert_eq!(report.cached, 1);
        assert!(!report.offline_cached);
    }

    #[tokio::test]
    async fn test_install_failure_writes_nothing() {
        let config = config();
        let fetcher = ScriptedFetcher::serving_manifest(&config);
        fetcher.fail("https://c3.example/css/liquid-glass.css");
        let h = harness(config, fetcher);

        let err = h.lifecycle.install().await.unwrap_err();
        match err {
            ServiceWorkerError::InstallFailed { path, .. } => {
                assert_eq!(path, "/css/liquid-glass.css")
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(h.lifecycle.state().await, ServiceWorkerState::Redundant);
        assert!(h
            .caches
            .read()
            .await
            .get("c3-app-v1")
            .map_or(true, |c| c.is_empty()));
    }

    #[tokio::test]
    async fn test_install_rejects_error_status() {
        let config = config().with_precache(["/", "/missing.css"]);
        let fetcher = ScriptedFetcher::new();
        fetcher.ok("https://c3.example/", "<html></html>");
        fetcher.status("https://c3.example/missing.css", 404, "not found");
        let h = harness(config, fetcher);

        assert!(matches!(
            h.lifecycle.install().await,
            Err(ServiceWorkerError::InstallFailed { .. })
        ));
    }

    #[tokio::test]
    async fn test_install_can_retry_after_failure() {
        let config = config().with_precache(["/"]);
        let fetcher = ScriptedFetcher::new();
        fetcher.fail("https://c3.example/");
        let h = harness(config, fetcher.clone());

        assert!(h.lifecycle.install().await.is_err());
        fetcher.ok("https://c3.example/", "<html></html>");
        assert!(h.lifecycle.install().await.is_ok());
    }

    #[tokio::test]
    async fn test_activate_before_install_is_rejected() {
        let h = harness(config(), ScriptedFetcher::new());
        assert!(matches!(
            h.lifecycle.activate().await,
            Err(ServiceWorkerError::StateError(_))
        ));
        assert_eq!(h.lifecycle.state().await, ServiceWorkerState::Parsed);
    }

    #[tokio::test]
    async fn test_activate_deletes_old_generations_and_claims() {
        let config = config().with_cache_version("c3-app-v2").with_precache(["/"]);
        let fetcher = ScriptedFetcher::new();
        fetcher.ok("https://c3.example/", "<html>v2</html>");
        let mut h = harness(config, fetcher);

        {
            let mut caches = h.caches.write().await;
            caches.open("c3-app-v1");
            caches.open("c3-app-v0");
        }
        let client = Client::window(Url::parse("https://c3.example/").unwrap());
        let client_id = client.id.clone();
        h.clients.write().await.add(client);

        h.lifecycle.install().await.unwrap();
        let report = h.lifecycle.activate().await.unwrap();

        let mut deleted = report.deleted.clone();
        deleted.sort();
        assert_eq!(deleted, vec!["c3-app-v0", "c3-app-v1"]);
        assert_eq!(report.claimed, vec![client_id.clone()]);
        assert_eq!(h.caches.read().await.keys(), vec!["c3-app-v2"]);
        assert_eq!(h.lifecycle.state().await, ServiceWorkerState::Activated);

        let mut saw_controller_change = false;
        let mut last_state = None;
        while let Ok(event) = h.events.try_recv() {
            match event {
                ServiceWorkerEvent::ControllerChange { client_id: id } => {
                    assert_eq!(id, client_id);
                    saw_controller_change = true;
                }
                ServiceWorkerEvent::StateChange { new_state, .. } => last_state = Some(new_state),
                _ => {}
            }
        }
        assert!(saw_controller_change);
        assert_eq!(last_state, Some(ServiceWorkerState::Activated));
    }

    #[tokio::test]
    async fn test_second_activation_is_rejected() {
        let config = config().with_precache(["/"]);
        let fetcher = ScriptedFetcher::new();
        fetcher.ok("https://c3.example/", "<html></html>");
        let h = harness(config, fetcher);

        h.lifecycle.install().await.unwrap();
        h.lifecycle.activate().await.unwrap();
        assert!(h.lifecycle.activate().await.is_err());
    }
}
