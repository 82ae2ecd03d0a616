//! Errors for the offline cache manager.

use c3_common::C3Error;
use thiserror::Error;

/// Errors that can occur in service worker operations.
#[derive(Error, Debug)]
pub enum ServiceWorkerError {
    /// A precache resource could not be fetched or came back non-2xx.
    #[error("Install failed for {path}: {reason}")]
    InstallFailed { path: String, reason: String },

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("State error: {0}")]
    StateError(String),

    #[error("Cache error: {0}")]
    CacheError(String),

    #[error("Sync error: {0}")]
    SyncError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// The worker event loop is gone.
    #[error("Worker stopped")]
    Stopped,

    #[error(transparent)]
    Common(#[from] C3Error),
}

impl From<c3_net::NetError> for ServiceWorkerError {
    fn from(err: c3_net::NetError) -> Self {
        Self::NetworkError(err.to_string())
    }
}

impl ServiceWorkerError {
    /// Whether running the same work again later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::NetworkError(_) | Self::SyncError(_) | Self::InstallFailed { .. } => true,
            Self::Common(e) => e.is_transient(),
            Self::StateError(_) | Self::CacheError(_) | Self::NotFound(_) | Self::Stopped => {
                false
            }
        }
    }
}

/// Result type alias for service worker operations.
pub type Result<T> = std::result::Result<T, ServiceWorkerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_failures_are_transient() {
        let err: ServiceWorkerError = c3_net::NetError::RequestFailed("refused".into()).into();
        assert!(err.is_transient());
        assert!(ServiceWorkerError::Common(C3Error::Timeout(std::time::Duration::from_secs(1)))
            .is_transient());
    }

    #[test]
    fn test_state_errors_are_permanent() {
        assert!(!ServiceWorkerError::StateError("not installed".into()).is_transient());
        assert!(!ServiceWorkerError::Common(C3Error::config("bad origin")).is_transient());
    }
}
