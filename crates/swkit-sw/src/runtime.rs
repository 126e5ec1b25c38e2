//! The worker runtime and its host event table.

use std::sync::Arc;

use serde_json::Value as JsonValue;
use swkit_net::{Fetcher, Request};
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, error, info};

use crate::background::{Notification, NotificationId, Notifications};
use crate::cache::{BucketName, BucketStats, CacheStorage};
use crate::clients::{ClientId, Clients};
use crate::config::WorkerConfig;
use crate::control::ReplyPort;
use crate::lifecycle::{ActivationReport, InstallReport, Lifecycle, LifecycleState};
use crate::strategy::FetchDisposition;
use crate::Result;

/// Events reported to the host's telemetry sink.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    /// Lifecycle state changed.
    StateChange { state: LifecycleState },
    /// A client is now served by this worker.
    ControllerChange { client_id: ClientId },
    /// A stale or cleared bucket was removed.
    BucketDeleted { name: BucketName },
    NotificationShown { id: NotificationId, title: String },
    NotificationClosed { id: NotificationId },
    WindowOpened { client_id: ClientId, url: String },
    /// Answer to a stats query, mirrored for monitoring.
    CacheStats { stats: std::collections::BTreeMap<String, BucketStats> },
}

/// Everything the host can deliver to the worker.
#[derive(Debug)]
pub enum HostEvent {
    Install,
    Activate,
    Fetch(Request),
    Message {
        data: JsonValue,
        reply: Option<ReplyPort>,
    },
    Sync {
        tag: String,
    },
    PeriodicSync {
        tag: String,
    },
    Push {
        payload: Option<String>,
    },
    NotificationClick {
        notification: NotificationId,
        action: Option<String>,
    },
}

/// Discriminant of [`HostEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Install,
    Activate,
    Fetch,
    Message,
    Sync,
    PeriodicSync,
    Push,
    NotificationClick,
}

impl HostEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            HostEvent::Install => EventKind::Install,
            HostEvent::Activate => EventKind::Activate,
            HostEvent::Fetch(_) => EventKind::Fetch,
            HostEvent::Message { .. } => EventKind::Message,
            HostEvent::Sync { .. } => EventKind::Sync,
            HostEvent::PeriodicSync { .. } => EventKind::PeriodicSync,
            HostEvent::Push { .. } => EventKind::Push,
            HostEvent::NotificationClick { .. } => EventKind::NotificationClick,
        }
    }
}

/// What handling an event produced.
#[derive(Debug)]
pub enum DispatchOutcome {
    Installed(InstallReport),
    Activated(ActivationReport),
    Fetch(FetchDisposition),
    Notified(Notification),
    Done,
}

/// A single worker instance: configuration, storage, clients, and state.
///
/// Cheap to clone; clones share state. Detached tasks hold a clone so they
/// outlive the event that spawned them.
#[derive(Clone)]
pub struct WorkerRuntime {
    pub(crate) config: Arc<WorkerConfig>,
    pub(crate) fetcher: Arc<dyn Fetcher>,
    pub(crate) caches: Arc<RwLock<CacheStorage>>,
    pub(crate) clients: Arc<RwLock<Clients>>,
    pub(crate) lifecycle: Arc<RwLock<Lifecycle>>,
    pub(crate) notifications: Arc<RwLock<Notifications>>,
    pub(crate) sync_queue: Arc<Mutex<Vec<JsonValue>>>,
    event_tx: mpsc::UnboundedSender<WorkerEvent>,
}

impl WorkerRuntime {
    /// Create a runtime. Opens persisted storage if the config names a
    /// directory. The receiver carries telemetry events.
    pub fn new(
        config: WorkerConfig,
        fetcher: Arc<dyn Fetcher>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<WorkerEvent>)> {
        config.validate()?;

        let mut storage = match config.storage_dir {
            Some(ref dir) => CacheStorage::with_dir(dir)?,
            None => CacheStorage::new(),
        };
        for bucket in &config.buckets {
            if let Some(max) = bucket.max_entries {
                storage.set_limit(&bucket.name, max);
            }
        }

        info!(
            version = %config.version,
            origin = %config.origin,
            persistent = storage.is_persistent(),
            "Worker runtime created"
        );

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let runtime = Self {
            config: Arc::new(config),
            fetcher,
            caches: Arc::new(RwLock::new(storage)),
            clients: Arc::new(RwLock::new(Clients::new())),
            lifecycle: Arc::new(RwLock::new(Lifecycle::new())),
            notifications: Arc::new(RwLock::new(Notifications::new())),
            sync_queue: Arc::new(Mutex::new(Vec::new())),
            event_tx,
        };
        Ok((runtime, event_rx))
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Shared cache storage. Hosts read it for diagnostics; the worker is the
    /// only writer.
    pub fn caches(&self) -> Arc<RwLock<CacheStorage>> {
        Arc::clone(&self.caches)
    }

    pub fn clients(&self) -> Arc<RwLock<Clients>> {
        Arc::clone(&self.clients)
    }

    pub(crate) fn emit(&self, event: WorkerEvent) {
        if self.event_tx.send(event).is_err() {
            debug!("Telemetry receiver dropped");
        }
    }

    /// Route a host event to its handler.
    pub async fn dispatch(&self, event: HostEvent) -> Result<DispatchOutcome> {
        let kind = event.kind();
        debug!(?kind, "Dispatching host event");

        let outcome = match event {
            HostEvent::Install => self.install().await.map(DispatchOutcome::Installed),
            HostEvent::Activate => self.activate().await.map(DispatchOutcome::Activated),
            HostEvent::Fetch(request) => Ok(DispatchOutcome::Fetch(self.handle_fetch(request).await)),
            HostEvent::Message { data, reply } => {
                self.handle_message(data, reply).await;
                Ok(DispatchOutcome::Done)
            }
            HostEvent::Sync { tag } => self.handle_sync(&tag).await.map(|_| DispatchOutcome::Done),
            HostEvent::PeriodicSync { tag } => self
                .handle_periodic_sync(&tag)
                .await
                .map(|_| DispatchOutcome::Done),
            HostEvent::Push { payload } => Ok(DispatchOutcome::Notified(
                self.show_push_notification(payload).await,
            )),
            HostEvent::NotificationClick {
                notification,
                action,
            } => self
                .handle_notification_click(notification, action.as_deref())
                .await
                .map(|_| DispatchOutcome::Done),
        };

        if let Err(ref e) = outcome {
            error!(?kind, error = %e, "Event handler failed");
        }
        outcome
    }

    pub async fn state(&self) -> LifecycleState {
        self.lifecycle.read().await.state()
    }
}
