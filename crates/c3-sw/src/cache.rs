//! Cache generations and the storage that holds them.
//!
//! ```text
//! CacheStorage
//!     └── Cache ("c3-app-v1")
//!             └── "GET https://origin/css/base.css" → CacheEntry
//! ```
//!
//! Storage lives in memory. A [`CacheFile`] mirrors it to disk so a restart
//! still has the precache to serve from.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use c3_common::C3Error;
use c3_net::{request_identity, Request, Response};
use hashbrown::HashMap;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, trace, warn};
use url::Url;

use crate::error::{Result, ServiceWorkerError};

/// A stored response snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Request URL.
    pub url: Url,

    /// Request method.
    pub method: String,

    /// Response status.
    pub status: u16,

    /// Response headers in wire order. Repeated names keep every value;
    /// values are raw bytes since they need not be UTF-8.
    pub headers: Vec<(String, Vec<u8>)>,

    /// Response body.
    pub body: Vec<u8>,

    /// Cached at timestamp (ms since epoch).
    pub cached_at: u64,
}

impl CacheEntry {
    /// Snapshot a response for the given request.
    pub fn from_response(request: &Request, response: &Response) -> Self {
        let headers = response
            .headers
            .iter()
            .map(|(name, value)| (name.as_str().to_string(), value.as_bytes().to_vec()))
            .collect();

        Self {
            url: request.url.clone(),
            method: request.method.to_string(),
            status: response.status.as_u16(),
            headers,
            body: response.body.to_vec(),
            cached_at: now_millis(),
        }
    }

    /// Request identity this entry is stored under.
    pub fn identity(&self) -> String {
        format!("{} {}", self.method, self.url)
    }

    /// Rebuild a response from the snapshot.
    pub fn to_response(&self) -> Response {
        let mut headers = HeaderMap::new();
        for (name, value) in &self.headers {
            match (
                HeaderName::try_from(name.as_str()),
                HeaderValue::from_bytes(value),
            ) {
                (Ok(n), Ok(v)) => {
                    headers.append(n, v);
                }
                _ => warn!(header = %name, "Dropping unparseable cached header"),
            }
        }

        Response {
            url: self.url.clone(),
            status: StatusCode::from_u16(self.status).unwrap_or(StatusCode::OK),
            headers,
            body: Bytes::from(self.body.clone()),
            from_cache: true,
        }
    }
}

/// A single cache generation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Cache {
    /// Generation name.
    pub name: String,

    entries: HashMap<String, CacheEntry>,
}

impl Cache {
    /// Create a new cache.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: HashMap::new(),
        }
    }

    /// Look up a request by identity.
    pub fn match_request(&self, request: &Request) -> Option<&CacheEntry> {
        self.entries.get(&request.identity())
    }

    /// Look up a GET for a URL.
    pub fn match_url(&self, url: &Url) -> Option<&CacheEntry> {
        self.entries.get(&request_identity(&Method::GET, url))
    }

    /// Store a response. Last writer wins per identity.
    pub fn put(&mut self, request: &Request, response: &Response) {
        let entry = CacheEntry::from_response(request, response);
        trace!(cache = %self.name, key = %request.identity(), "Cache put");
        self.entries.insert(request.identity(), entry);
    }

    /// Delete entry.
    pub fn delete(&mut self, request: &Request) -> bool {
        self.entries.remove(&request.identity()).is_some()
    }

    /// All stored identities.
    pub fn keys(&self) -> Vec<&str> {
        self.entries.keys().map(|s| s.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// All cache generations, by name.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct CacheStorage {
    caches: HashMap<String, Cache>,
}

impl CacheStorage {
    /// Create new cache storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a cache (creates if doesn't exist).
    pub fn open(&mut self, name: &str) -> &mut Cache {
        self.caches
            .entry(name.to_string())
            .or_insert_with(|| Cache::new(name))
    }

    /// Borrow a cache without creating it.
    pub fn get(&self, name: &str) -> Option<&Cache> {
        self.caches.get(name)
    }

    /// Check if cache exists.
    pub fn has(&self, name: &str) -> bool {
        self.caches.contains_key(name)
    }

    /// Delete a cache.
    pub fn delete(&mut self, name: &str) -> bool {
        self.caches.remove(name).is_some()
    }

    /// Get all cache names.
    pub fn keys(&self) -> Vec<String> {
        self.caches.keys().cloned().collect()
    }

    /// Match a GET for `url` across all caches.
    pub fn match_url(&self, url: &Url) -> Option<&CacheEntry> {
        self.caches.values().find_map(|cache| cache.match_url(url))
    }

    /// Read a snapshot written by [`CacheFile::save`]. A missing file is an
    /// empty storage.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        match std::fs::read(path) {
            Ok(bytes) => {
                let storage: Self = serde_json::from_slice(&bytes).map_err(|e| {
                    ServiceWorkerError::CacheError(format!("parsing {}: {e}", path.display()))
                })?;
                debug!(
                    path = %path.display(),
                    generations = storage.caches.len(),
                    "Loaded cache snapshot"
                );
                Ok(storage)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::new()),
            Err(e) => Err(C3Error::storage(path, e).into()),
        }
    }
}

/// On-disk mirror of a [`CacheStorage`], rewritten whole after each change.
pub struct CacheFile {
    path: PathBuf,
    lock: Mutex<()>,
}

impl CacheFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Snapshot `caches` to disk.
    pub async fn save(&self, caches: &RwLock<CacheStorage>) -> Result<()> {
        // Held across snapshot and rename so saves land in order.
        let _guard = self.lock.lock().await;
        let contents = {
            let caches = caches.read().await;
            serde_json::to_vec(&*caches)
                .map_err(|e| ServiceWorkerError::CacheError(e.to_string()))?
        };

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| C3Error::storage(parent, e))?;
            }
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, contents)
            .await
            .map_err(|e| C3Error::storage(&tmp, e))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| C3Error::storage(&self.path, e))?;
        trace!(path = %self.path.display(), "Saved cache snapshot");
        Ok(())
    }

    /// Save, logging instead of failing. The in-memory storage stays
    /// authoritative for this process.
    pub async fn save_or_warn(&self, caches: &RwLock<CacheStorage>) {
        if let Err(e) = self.save(caches).await {
            warn!(path = %self.path.display(), error = %e, "Cache snapshot not saved");
        }
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
