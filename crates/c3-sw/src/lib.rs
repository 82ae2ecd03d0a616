//! # C3 Offline Cache Manager
//!
//! Keeps the C3 church app usable on flaky connections.
//!
//! ## Features
//!
//! - **Precache**: install fetches the app shell into a versioned cache generation
//! - **Activation**: old generations are deleted and open pages are claimed
//! - **Fetch policy**: stale-while-revalidate for same-origin GETs, with an
//!   offline document for navigations and a 503 for everything else
//! - **Deferred sync**: check-ins and gifts queued offline are replayed later
//! - **Notifications**: push display and click routing to app windows
//!
//! ## Architecture
//!
//! ```text
//! OfflineCacheManager ──start()──▶ WorkerHandle
//!     │
//!     ├── LifecycleManager (install / activate)
//!     ├── FetchInterceptor ──▶ BackgroundTasks (revalidation)
//!     ├── SyncManager ──▶ ReplayHandler ──▶ SubmissionStore
//!     └── Notifications ──▶ Clients
//!
//! CacheStorage
//!     └── Cache (one per generation)
//!             └── "METHOD url" → CacheEntry
//! ```

pub mod background;
pub mod cache;
pub mod clients;
pub mod config;
pub mod error;
pub mod fetch;
pub mod lifecycle;
pub mod notifications;
pub mod sync;
pub mod worker;

#[cfg(test)]
mod test_support;

pub use background::BackgroundTasks;
pub use cache::{Cache, CacheEntry, CacheFile, CacheStorage};
pub use clients::{Client, ClientMatchOptions, ClientType, Clients, VisibilityState};
pub use config::{WorkerConfig, DEFAULT_CACHE_VERSION, SYNC_CHECKIN, SYNC_GIVING};
pub use error::{Result, ServiceWorkerError};
pub use fetch::{FetchInterceptor, FetchOutcome};
pub use lifecycle::{ActivateReport, InstallReport, LifecycleManager, ServiceWorkerState};
pub use notifications::{ClickOutcome, Notification, Notifications, PushPayload};
pub use sync::{
    JsonFileSubmissionStore, MemorySubmissionStore, PendingSubmission, ReplayHandler,
    SubmissionStore, SyncHandler, SyncManager, SyncState,
};
pub use worker::{OfflineCacheManager, WorkerHandle};

/// Events broadcast by a running worker.
#[derive(Debug, Clone, PartialEq)]
pub enum ServiceWorkerEvent {
    /// Lifecycle state changed.
    StateChange {
        cache_version: String,
        new_state: ServiceWorkerState,
    },
    /// A client came under this worker's control.
    ControllerChange { client_id: String },
    NotificationShown { notification_id: String },
    /// A sync tag finished, after retries.
    SyncComplete { tag: String, success: bool },
}
