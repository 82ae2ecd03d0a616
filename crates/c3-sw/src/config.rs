//! Worker configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use c3_common::{C3Error, RetryConfig};
use serde::{Deserialize, Serialize};
use url::Url;

/// Default cache generation label. Bump it to bust every cached asset.
pub const DEFAULT_CACHE_VERSION: &str = "c3-app-v1";

/// Document served to navigations that fail with nothing cached.
pub const DEFAULT_OFFLINE_PATH: &str = "/offline.html";

/// Sync tag for check-in replay.
pub const SYNC_CHECKIN: &str = "sync-checkin";

/// Sync tag for giving replay.
pub const SYNC_GIVING: &str = "sync-giving";

/// Static resources populated at install time.
pub const DEFAULT_PRECACHE: &[&str] = &[
    "/",
    "/index.html",
    "/css/variables.css",
    "/css/base.css",
    "/css/liquid-glass.css",
    "/css/components.css",
    "/js/app.js",
    "/manifest.json",
];

/// Offline cache manager configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Origin whose GET requests are intercepted.
    pub origin: Url,

    /// Current cache generation label.
    pub cache_version: String,

    /// Root-relative paths cached at install.
    pub precache: Vec<String>,

    /// Root-relative path of the offline document.
    pub offline_path: String,

    /// Sync tags registered at start.
    pub sync_tags: Vec<String>,

    /// Optional bound on foreground and revalidation fetches.
    pub network_timeout_ms: Option<u64>,

    /// Backoff applied when a sync handler fails.
    pub sync_retry: SyncRetrySettings,

    /// JSON file holding pending submissions. In-memory when unset.
    pub pending_store: Option<PathBuf>,

    /// JSON file mirroring the cache generations across restarts.
    pub cache_store: Option<PathBuf>,

    /// Push notification defaults.
    pub notifications: NotificationDefaults,
}

/// Backoff settings for sync dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncRetrySettings {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

/// Defaults for fields missing from a push payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationDefaults {
    pub title: String,
    pub body: String,
    pub url: String,
    pub icon: String,
    pub badge: String,
    pub vibrate: Vec<u32>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            origin: Url::parse("http://localhost/").expect("static URL is valid"),
            cache_version: DEFAULT_CACHE_VERSION.to_string(),
            precache: DEFAULT_PRECACHE.iter().map(|p| p.to_string()).collect(),
            offline_path: DEFAULT_OFFLINE_PATH.to_string(),
            sync_tags: vec![SYNC_CHECKIN.to_string(), SYNC_GIVING.to_string()],
            network_timeout_ms: None,
            sync_retry: SyncRetrySettings::default(),
            pending_store: None,
            cache_store: None,
            notifications: NotificationDefaults::default(),
        }
    }
}

impl Default for SyncRetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 5_000,
            max_delay_ms: 5 * 60 * 1000,
        }
    }
}

impl Default for NotificationDefaults {
    fn default() -> Self {
        Self {
            title: "C3 Hays".to_string(),
            body: "New update from C3 Hays".to_string(),
            url: "/".to_string(),
            icon: "/assets/images/app-icon-192.png".to_string(),
            badge: "/assets/images/badge-72.png".to_string(),
            vibrate: vec![100, 50, 100],
        }
    }
}

impl SyncRetrySettings {
    /// Convert into the shared backoff config.
    pub fn to_retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_attempts,
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            ..RetryConfig::default()
        }
    }
}

impl WorkerConfig {
    /// Defaults for the given origin.
    pub fn for_origin(origin: Url) -> Self {
        Self {
            origin,
            ..Default::default()
        }
    }

    /// Set the cache generation label.
    pub fn with_cache_version(mut self, version: impl Into<String>) -> Self {
        self.cache_version = version.into();
        self
    }

    /// Replace the precache manifest.
    pub fn with_precache<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.precache = paths.into_iter().map(Into::into).collect();
        self
    }

    /// Parse from JSON, filling missing fields with defaults.
    pub fn from_json_str(json: &str) -> c3_common::Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| C3Error::config_with_source("invalid worker config", e))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> c3_common::Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            C3Error::config_with_source(format!("reading {}", path.display()), e)
        })?;
        Self::from_json_str(&contents)
    }

    /// Check invariants serde cannot express.
    pub fn validate(&self) -> c3_common::Result<()> {
        if self.cache_version.trim().is_empty() {
            return Err(C3Error::config("cache_version must not be empty"));
        }
        if self.origin.cannot_be_a_base() {
            return Err(C3Error::config(format!(
                "origin {} cannot resolve paths",
                self.origin
            )));
        }
        for path in self.precache.iter().chain(std::iter::once(&self.offline_path)) {
            if !path.starts_with('/') {
                return Err(C3Error::config(format!(
                    "path {path:?} must be root-relative"
                )));
            }
        }
        Ok(())
    }

    /// Resolve a root-relative path against the origin.
    pub fn resolve(&self, path: &str) -> c3_common::Result<Url> {
        self.origin
            .join(path)
            .map_err(|e| C3Error::config_with_source(format!("resolving {path}"), e))
    }

    /// Absolute URL of the offline document.
    pub fn offline_url(&self) -> c3_common::Result<Url> {
        self.resolve(&self.offline_path)
    }

    /// Network bound, if any.
    pub fn network_timeout(&self) -> Option<Duration> {
        self.network_timeout_ms.map(Duration::from_millis)
    }
}
