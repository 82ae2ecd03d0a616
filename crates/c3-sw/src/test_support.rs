//! Scripted network for unit tests.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use c3_net::{Fetcher, NetError, Request, Response};
use hashbrown::HashMap;
use http::StatusCode;

use crate::config::WorkerConfig;

#[derive(Debug, Clone)]
enum Script {
    Respond {
        status: u16,
        body: String,
        delay: Option<Duration>,
    },
    Fail {
        delay: Option<Duration>,
    },
}

/// A [`Fetcher`] that answers from a per-URL script and records calls.
#[derive(Clone, Default)]
pub(crate) struct ScriptedFetcher {
    routes: Arc<Mutex<HashMap<String, Script>>>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl ScriptedFetcher {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Serve `"<path> v1"` for every precache path and the offline page.
    pub(crate) fn serving_manifest(config: &WorkerConfig) -> Self {
        let fetcher = Self::new();
        for path in config.precache.iter().chain(std::iter::once(&config.offline_path)) {
            let url = config.resolve(path).unwrap();
            fetcher.ok(url.as_str(), &format!("{path} v1"));
        }
        fetcher
    }

    fn set(&self, url: &str, script: Script) {
        self.routes.lock().unwrap().insert(url.to_string(), script);
    }

    pub(crate) fn ok(&self, url: &str, body: &str) {
        self.status(url, 200, body);
    }

    pub(crate) fn status(&self, url: &str, status: u16, body: &str) {
        self.set(
            url,
            Script::Respond {
                status,
                body: body.to_string(),
                delay: None,
            },
        );
    }

    pub(crate) fn delayed(&self, url: &str, delay: Duration, body: &str) {
        self.set(
            url,
            Script::Respond {
                status: 200,
                body: body.to_string(),
                delay: Some(delay),
            },
        );
    }

    pub(crate) fn fail(&self, url: &str) {
        self.set(url, Script::Fail { delay: None });
    }

    pub(crate) fn fail_after(&self, url: &str, delay: Duration) {
        self.set(url, Script::Fail { delay: Some(delay) });
    }

    /// Every `METHOD url` fetched so far.
    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn call_count(&self, url: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.ends_with(url))
            .count()
    }
}

#[async_trait]
impl Fetcher for ScriptedFetcher {
    async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
        self.calls.lock().unwrap().push(request.identity());
        let script = self.routes.lock().unwrap().get(request.url.as_str()).cloned();

        match script {
            Some(Script::Respond {
                status,
                body,
                delay,
            }) => {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                Ok(Response::new(
                    request.url.clone(),
                    StatusCode::from_u16(status).unwrap(),
                    body,
                ))
            }
            Some(Script::Fail { delay }) => {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                Err(NetError::RequestFailed("connection refused".to_string()))
            }
            None => Err(NetError::RequestFailed(format!("no route for {}", request.url))),
        }
    }
}
