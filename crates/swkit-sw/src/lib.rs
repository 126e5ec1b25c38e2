//! # SwKit Service Worker
//!
//! Offline caching worker runtime for an installable web front-end.
//!
//! ## Features
//!
//! - **Cache buckets**: named, versioned request → response stores, optionally
//!   persisted to disk
//! - **Strategies**: network-first, cache-first, stale-while-revalidate,
//!   chosen per request
//! - **Lifecycle**: install (precache), activate (drop stale versions), claim
//! - **Control channel**: skip-waiting, version, clear, stats
//! - **Background tasks**: sync, periodic cleanup, push notifications
//!
//! ## Architecture
//!
//! ```text
//! host adapter ── HostEvent ──► WorkerRuntime::dispatch
//!                                   ├── install / activate      (lifecycle)
//!                                   ├── handle_fetch            (strategy)
//!                                   │       └── CacheStorage ◄── Fetcher
//!                                   ├── handle_message          (control)
//!                                   └── sync / push / click     (background)
//!
//! WorkerRuntime ── WorkerEvent ──► telemetry receiver
//! ```

use swkit_common::SwKitError;
use swkit_net::NetError;
use thiserror::Error;

pub mod background;
pub mod cache;
pub mod clients;
pub mod config;
pub mod control;
pub mod lifecycle;
pub mod runtime;
pub mod strategy;

#[cfg(test)]
mod test_support;

pub use background::{Notification, NotificationAction, NotificationId, BACKGROUND_SYNC_TAG, CLEANUP_TAG};
pub use cache::{format_bytes, BucketName, BucketStats, CacheStorage, MatchScope, RequestKey, StorageError, StoredEntry};
pub use clients::{Client, ClientId, ClientType, Clients};
pub use config::{BucketConfig, WorkerConfig, CORE_BUCKET, GAME_BUCKET};
pub use control::{ControlMessage, ControlReply, ReplyPort};
pub use lifecycle::{ActivationReport, InstallReport, LifecycleState, PrecacheFailure};
pub use runtime::{DispatchOutcome, EventKind, HostEvent, WorkerEvent, WorkerRuntime};
pub use strategy::{classify, DetachedTask, FetchDisposition, FetchResponse, Route, Strategy};

/// Errors that can occur in service worker operations.
#[derive(Error, Debug)]
pub enum ServiceWorkerError {
    #[error("State error: {0}")]
    StateError(String),

    #[error("Network error: {0}")]
    Network(#[from] NetError),

    #[error("Cache error: {0}")]
    Cache(#[from] StorageError),

    #[error("Background sync failed: {0}")]
    SyncFailed(String),

    #[error(transparent)]
    Common(#[from] SwKitError),
}

impl ServiceWorkerError {
    /// Whether trying again later might succeed.
    ///
    /// Network outages and rejected uploads are transient. Storage, state and
    /// configuration failures repeat until something else changes.
    pub fn is_retryable(&self) -> bool {
        match self {
            ServiceWorkerError::Network(_) | ServiceWorkerError::SyncFailed(_) => true,
            ServiceWorkerError::StateError(_) | ServiceWorkerError::Cache(_) => false,
            ServiceWorkerError::Common(e) => e.is_retryable(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ServiceWorkerError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_retryable_errors() {
        assert!(ServiceWorkerError::from(NetError::RequestFailed("offline".into())).is_retryable());
        assert!(ServiceWorkerError::SyncFailed("HTTP 503".into()).is_retryable());
        assert!(ServiceWorkerError::from(SwKitError::Timeout(Duration::from_secs(1))).is_retryable());

        assert!(!ServiceWorkerError::StateError("installing".into()).is_retryable());
        assert!(!ServiceWorkerError::from(StorageError::UnsupportedMethod("POST".into())).is_retryable());
        assert!(!ServiceWorkerError::from(SwKitError::config("bad endpoint")).is_retryable());
    }
}
