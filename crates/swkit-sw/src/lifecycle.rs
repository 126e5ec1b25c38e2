//! Install, activation, and takeover.
//!
//! ```text
//! Parsed ──install──► Installing ──► Waiting ──activate──► Activating ──► Active
//!                                       ▲
//!                              skip-waiting (config or message)
//! ```

use std::time::Instant;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use swkit_common::with_timeout;
use swkit_net::Request;
use tracing::{debug, info, warn};

use crate::cache::{BucketName, RequestKey};
use crate::clients::ClientId;
use crate::runtime::{WorkerEvent, WorkerRuntime};
use crate::{Result, ServiceWorkerError};

/// Worker lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum LifecycleState {
    /// Script loaded, install not started.
    #[default]
    Parsed,
    Installing,
    /// Installed, waiting for activation.
    Waiting,
    Activating,
    /// Controlling clients and serving fetches.
    Active,
}

#[derive(Debug)]
pub(crate) struct Lifecycle {
    state: LifecycleState,
    skip_waiting_requested: bool,
    changed_at: Instant,
}

impl Lifecycle {
    pub(crate) fn new() -> Self {
        Self {
            state: LifecycleState::Parsed,
            skip_waiting_requested: false,
            changed_at: Instant::now(),
        }
    }

    pub(crate) fn state(&self) -> LifecycleState {
        self.state
    }

    fn transition(&mut self, from: LifecycleState, to: LifecycleState) -> Result<()> {
        if self.state != from {
            return Err(ServiceWorkerError::StateError(format!(
                "cannot move to {:?} from {:?}",
                to, self.state
            )));
        }
        debug!(?from, ?to, in_previous_ms = self.changed_at.elapsed().as_millis() as u64, "Lifecycle transition");
        self.state = to;
        self.changed_at = Instant::now();
        Ok(())
    }
}

/// A manifest URL that could not be precached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrecacheFailure {
    pub bucket: BucketName,
    pub url: String,
    pub reason: String,
}

/// Outcome of install.
#[derive(Debug, Default)]
pub struct InstallReport {
    /// Entries stored across all buckets.
    pub cached: usize,
    pub failed: Vec<PrecacheFailure>,
    /// Present when skip-waiting activated the worker right away.
    pub activation: Option<ActivationReport>,
}

/// Outcome of activation.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ActivationReport {
    /// Stale buckets removed.
    pub deleted: Vec<BucketName>,
    /// Clients that switched to this worker.
    pub claimed: Vec<ClientId>,
}

impl WorkerRuntime {
    async fn set_state(&self, from: LifecycleState, to: LifecycleState) -> Result<()> {
        self.lifecycle.write().await.transition(from, to)?;
        self.emit(WorkerEvent::StateChange { state: to });
        Ok(())
    }

    /// Open every declared bucket and precache its manifest.
    ///
    /// Always reaches `Waiting`; individual precache failures are reported,
    /// not returned. Activates immediately when skip-waiting is configured or
    /// was requested during install.
    pub async fn install(&self) -> Result<InstallReport> {
        self.set_state(LifecycleState::Parsed, LifecycleState::Installing).await?;
        info!(version = %self.config.version, "Installing");

        {
            let mut caches = self.caches.write().await;
            for name in self.config.current_buckets() {
                // A bucket that cannot be created shows up as failed precaches.
                if let Err(e) = caches.open(&name) {
                    warn!(bucket = %name, error = %e, "Failed to open bucket");
                }
            }
        }

        let jobs = self.config.buckets.iter().flat_map(|bucket| {
            let name = self.config.bucket_name(&bucket.name);
            bucket
                .precache
                .iter()
                .map(move |entry| self.precache_one(name.clone(), entry.clone()))
        });
        let results = join_all(jobs).await;

        let mut report = InstallReport::default();
        for result in results {
            match result {
                Ok(()) => report.cached += 1,
                Err(failure) => {
                    warn!(
                        bucket = %failure.bucket,
                        url = %failure.url,
                        reason = %failure.reason,
                        "Precache failed"
                    );
                    report.failed.push(failure);
                }
            }
        }
        info!(cached = report.cached, failed = report.failed.len(), "Install complete");

        self.set_state(LifecycleState::Installing, LifecycleState::Waiting).await?;

        let requested = self.lifecycle.read().await.skip_waiting_requested;
        if self.config.skip_waiting || requested {
            debug!(requested, "Skipping waiting phase");
            report.activation = Some(self.activate().await?);
        }
        Ok(report)
    }

    async fn precache_one(&self, bucket: BucketName, entry: String) -> std::result::Result<(), PrecacheFailure> {
        let fail = |reason: String| PrecacheFailure {
            bucket: bucket.clone(),
            url: entry.clone(),
            reason,
        };

        let url = self.config.resolve(&entry).map_err(|e| fail(e.to_string()))?;
        let response = with_timeout(self.config.precache_timeout(), self.fetch_from_network(Request::get(url.clone())))
            .await
            .map_err(|e| fail(e.to_string()))?
            .map_err(|e| fail(e.to_string()))?;

        if !response.ok() {
            return Err(fail(format!("HTTP {}", response.status)));
        }
        self.caches
            .write()
            .await
            .put(&bucket, RequestKey::get(&url), response)
            .map_err(|e| fail(e.to_string()))
    }

    /// Delete stale versions of this worker's buckets, claim clients, and
    /// start serving.
    pub async fn activate(&self) -> Result<ActivationReport> {
        self.set_state(LifecycleState::Waiting, LifecycleState::Activating).await?;

        let existing = self.caches.read().await.keys();
        let mut report = ActivationReport::default();
        for name in existing {
            let Some((logical, version)) = name.parts() else {
                continue;
            };
            if !self.config.declares(logical) || version == self.config.version {
                continue;
            }

            // Each delete takes the lock on its own so fetches can interleave.
            let deleted = self.caches.write().await.delete_bucket(&name);
            match deleted {
                Ok(true) => {
                    info!(bucket = %name, "Deleted stale bucket");
                    self.emit(WorkerEvent::BucketDeleted { name: name.clone() });
                    report.deleted.push(name);
                }
                Ok(false) => {}
                Err(e) => warn!(bucket = %name, error = %e, "Failed to delete stale bucket"),
            }
        }

        report.claimed = self.claim_clients().await;
        self.set_state(LifecycleState::Activating, LifecycleState::Active).await?;
        info!(
            version = %self.config.version,
            deleted = report.deleted.len(),
            claimed = report.claimed.len(),
            "Activated"
        );
        Ok(report)
    }

    async fn claim_clients(&self) -> Vec<ClientId> {
        let claimed = self.clients.write().await.claim();
        for &client_id in &claimed {
            self.emit(WorkerEvent::ControllerChange { client_id });
        }
        claimed
    }

    /// Activate as soon as possible.
    ///
    /// From `Waiting` this activates now. Before install finishes the request
    /// is remembered and honoured when install completes. Once activating or
    /// active it does nothing.
    pub async fn skip_waiting(&self) -> Result<Option<ActivationReport>> {
        let state = {
            let mut lifecycle = self.lifecycle.write().await;
            if matches!(lifecycle.state, LifecycleState::Parsed | LifecycleState::Installing) {
                lifecycle.skip_waiting_requested = true;
            }
            lifecycle.state
        };

        match state {
            LifecycleState::Waiting => self.activate().await.map(Some),
            LifecycleState::Parsed | LifecycleState::Installing => {
                debug!(?state, "Skip waiting deferred until install completes");
                Ok(None)
            }
            LifecycleState::Activating | LifecycleState::Active => Ok(None),
        }
    }
}
