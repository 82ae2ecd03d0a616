//! End-to-end behaviour of a started worker against a mock network.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use c3_net::{Fetcher, NetError, Request, Response};
use c3_sw::{
    ClickOutcome, Client, OfflineCacheManager, PendingSubmission, ServiceWorkerError,
    ServiceWorkerEvent, ServiceWorkerState, WorkerConfig, WorkerHandle, SYNC_CHECKIN,
};
use http::{Method, StatusCode};
use serde_json::json;
use tokio::sync::mpsc;
use url::Url;

const ORIGIN: &str = "https://c3hays.example/";

/// Network double: fixed bodies per URL, optional global outage and latency.
#[derive(Clone, Default)]
struct MockNetwork {
    pages: Arc<Mutex<HashMap<String, (u16, String)>>>,
    offline: Arc<Mutex<bool>>,
    latency: Arc<Mutex<Option<Duration>>>,
    hits: Arc<Mutex<Vec<String>>>,
}

impl MockNetwork {
    fn serve(&self, path: &str, body: &str) {
        self.serve_status(path, 200, body);
    }

    fn serve_status(&self, path: &str, status: u16, body: &str) {
        let url = Url::parse(ORIGIN).unwrap().join(path).unwrap();
        self.pages
            .lock()
            .unwrap()
            .insert(url.to_string(), (status, body.to_string()));
    }

    fn go_offline(&self) {
        *self.offline.lock().unwrap() = true;
    }

    fn go_online(&self) {
        *self.offline.lock().unwrap() = false;
    }

    fn slow_down(&self, latency: Duration) {
        *self.latency.lock().unwrap() = Some(latency);
    }

    fn hits(&self) -> Vec<String> {
        self.hits.lock().unwrap().clone()
    }
}

#[async_trait]
impl Fetcher for MockNetwork {
    async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
        self.hits.lock().unwrap().push(request.identity());
        let latency = *self.latency.lock().unwrap();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if *self.offline.lock().unwrap() {
            return Err(NetError::RequestFailed("network unreachable".into()));
        }
        let page = self.pages.lock().unwrap().get(request.url.as_str()).cloned();
        match page {
            Some((status, body)) => Ok(Response::new(
                request.url.clone(),
                StatusCode::from_u16(status).unwrap(),
                body,
            )),
            None => Ok(Response::new(request.url.clone(), StatusCode::NOT_FOUND, "")),
        }
    }
}

fn url(path: &str) -> Url {
    Url::parse(ORIGIN).unwrap().join(path).unwrap()
}

fn config(version: &str) -> WorkerConfig {
    let mut config = WorkerConfig::for_origin(Url::parse(ORIGIN).unwrap())
        .with_cache_version(version);
    config.sync_retry.max_attempts = 2;
    config.sync_retry.initial_delay_ms = 1;
    config.sync_retry.max_delay_ms = 5;
    config
}

fn network_for(config: &WorkerConfig) -> MockNetwork {
    let network = MockNetwork::default();
    for path in &config.precache {
        network.serve(path, &format!("{path} shell"));
    }
    network.serve(&config.offline_path, "<h1>You are offline</h1>");
    network
}

fn start(
    config: WorkerConfig,
    network: &MockNetwork,
) -> (WorkerHandle, mpsc::UnboundedReceiver<ServiceWorkerEvent>) {
    let (manager, events) = OfflineCacheManager::new(config, Arc::new(network.clone())).unwrap();
    (manager.start(), events)
}

fn drain(events: &mut mpsc::UnboundedReceiver<ServiceWorkerEvent>) -> Vec<ServiceWorkerEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    seen
}

#[tokio::test]
async fn install_then_activate_serves_every_manifest_path() {
    let config = config("c3-app-v1");
    let network = network_for(&config);
    let precache = config.precache.clone();
    let (worker, mut events) = start(config, &network);

    worker.install().await.unwrap();
    worker.activate().await.unwrap();
    assert_eq!(worker.state().await, ServiceWorkerState::Activated);

    network.go_offline();
    for path in &precache {
        let response = worker
            .fetch(Request::get(url(path)))
            .await
            .unwrap()
            .response()
            .unwrap();
        assert!(response.ok(), "{path} should be a cache hit");
        assert_eq!(response.text().unwrap(), format!("{path} shell"));
    }

    let states: Vec<ServiceWorkerState> = drain(&mut events)
        .into_iter()
        .filter_map(|e| match e {
            ServiceWorkerEvent::StateChange { new_state, .. } => Some(new_state),
            _ => None,
        })
        .collect();
    assert_eq!(
        states,
        vec![
            ServiceWorkerState::Installing,
            ServiceWorkerState::Installed,
            ServiceWorkerState::Activating,
            ServiceWorkerState::Activated,
        ]
    );
    worker.shutdown().await.unwrap();
}

#[tokio::test]
async fn new_version_replaces_old_generation_and_claims_pages() {
    let old = config("c3-app-v1");
    let network = network_for(&old);
    let (first, _events) = start(old, &network);
    let page = Client::window(url("/"));
    let page_id = page.id.clone();
    first.clients().write().await.add(page);
    first.update().await.unwrap();

    let (manager, mut events) = OfflineCacheManager::with_shared(
        config("c3-app-v2"),
        Arc::new(network.clone()),
        first.caches(),
        first.clients(),
        first.submissions(),
    )
    .unwrap();
    let second = manager.start();

    let (_, activated) = second.update().await.unwrap();
    let activated = activated.unwrap();

    assert_eq!(activated.deleted, vec!["c3-app-v1".to_string()]);
    assert_eq!(first.caches().read().await.keys(), vec!["c3-app-v2".to_string()]);
    assert!(drain(&mut events).contains(&ServiceWorkerEvent::ControllerChange {
        client_id: page_id.clone()
    }));
    let clients = first.clients();
    let clients = clients.read().await;
    assert_eq!(
        clients.get(&page_id).unwrap().controller.as_deref(),
        Some("c3-app-v2")
    );
}

#[tokio::test]
async fn failed_install_leaves_generation_empty() {
    let config = config("c3-app-v1");
    let network = network_for(&config);
    network.serve_status("/js/app.js", 500, "boom");
    let (worker, _events) = start(config, &network);

    let err = worker.install().await.unwrap_err();
    assert!(matches!(err, ServiceWorkerError::InstallFailed { ref path, .. } if path == "/js/app.js"));
    assert_eq!(worker.state().await, ServiceWorkerState::Redundant);

    let caches = worker.caches();
    let caches = caches.read().await;
    assert!(caches.get("c3-app-v1").map_or(true, |c| c.is_empty()));
}

#[tokio::test]
async fn activate_before_install_is_rejected() {
    let config = config("c3-app-v1");
    let network = network_for(&config);
    let (worker, _events) = start(config, &network);

    assert!(matches!(
        worker.activate().await,
        Err(ServiceWorkerError::StateError(_))
    ));
}

#[tokio::test]
async fn cache_hit_does_not_wait_for_slow_network() {
    let config = config("c3-app-v1");
    let network = network_for(&config);
    let (worker, _events) = start(config, &network);
    worker.update().await.unwrap();

    network.slow_down(Duration::from_millis(800));
    let started = Instant::now();
    let response = worker
        .fetch(Request::get(url("/css/base.css")))
        .await
        .unwrap()
        .response()
        .unwrap();

    assert!(response.from_cache);
    assert!(started.elapsed() < Duration::from_millis(400));
    worker.wait_idle().await;
}

#[tokio::test]
async fn offline_navigation_gets_offline_document() {
    let config = config("c3-app-v1");
    let network = network_for(&config);
    let (worker, _events) = start(config, &network);
    worker.update().await.unwrap();

    network.go_offline();
    let page = worker
        .fetch(Request::navigate(url("/sermons/2024-10-06")))
        .await
        .unwrap()
        .response()
        .unwrap();
    assert_eq!(page.text().unwrap(), "<h1>You are offline</h1>");

    let image = worker
        .fetch(Request::get(url("/assets/images/hero.jpg")))
        .await
        .unwrap()
        .response()
        .unwrap();
    assert_eq!(image.status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(image.text().unwrap(), "Offline");
}

#[tokio::test]
async fn non_get_and_cross_origin_pass_through() {
    let config = config("c3-app-v1");
    let network = network_for(&config);
    let (worker, _events) = start(config, &network);

    let post = Request::post(url("/api/prayer"), Bytes::from_static(b"{}"));
    assert!(worker.fetch(post).await.unwrap().is_passthrough());

    let cdn = Request::get(Url::parse("https://cdn.example/fonts/inter.woff2").unwrap());
    assert!(worker.fetch(cdn).await.unwrap().is_passthrough());

    assert!(network.hits().is_empty());
    assert!(worker.caches().read().await.keys().is_empty());
}

#[tokio::test]
async fn deferred_checkin_replays_once_online() {
    let config = config("c3-app-v1");
    let network = network_for(&config);
    network.serve("/api/checkin", "");
    network.go_offline();
    let (worker, _events) = start(config, &network);

    worker
        .defer(PendingSubmission::post(
            SYNC_CHECKIN,
            "/api/checkin",
            json!({"member": 7, "service": "sunday-11am"}),
        ))
        .await
        .unwrap();

    assert!(worker.sync(SYNC_CHECKIN).await.is_err());
    assert_eq!(worker.submissions().len().await.unwrap(), 1);

    network.go_online();
    worker.register_sync(SYNC_CHECKIN).await.unwrap();
    let results = worker.connectivity_restored().await.unwrap();
    assert!(results.iter().all(|(_, r)| r.is_ok()));
    assert_eq!(worker.submissions().len().await.unwrap(), 0);

    let replayed = network
        .hits()
        .iter()
        .filter(|h| h.as_str() == format!("{} {}", Method::POST, url("/api/checkin")))
        .count();
    // Two failed attempts offline, one success.
    assert_eq!(replayed, 3);
}

#[tokio::test]
async fn notification_click_routes_to_window() {
    let config = config("c3-app-v1");
    let network = network_for(&config);
    let (worker, _events) = start(config, &network);

    let events_page = Client::window(url("/events"));
    let events_id = events_page.id.clone();
    worker.clients().write().await.add(events_page);

    let shown = worker
        .push(Some(Bytes::from_static(br#"{"title":"Youth night","url":"/events"}"#)))
        .await
        .unwrap();
    assert_eq!(shown.title, "Youth night");
    assert_eq!(
        worker.notification_click(&shown.id, Some("open")).await.unwrap(),
        ClickOutcome::Focused(events_id)
    );

    let dismissed = worker.push(None).await.unwrap();
    assert_eq!(
        worker
            .notification_click(&dismissed.id, Some("dismiss"))
            .await
            .unwrap(),
        ClickOutcome::Dismissed
    );
    assert_eq!(worker.clients().read().await.len(), 1);
}
