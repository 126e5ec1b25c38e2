//! Deferred and host-scheduled work: background sync, periodic cleanup, and
//! push notifications.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use swkit_common::{retry_with_backoff_if, RetryConfig, SwKitError};
use swkit_net::Request;
use tracing::{debug, info, warn};

use crate::cache::BucketName;
use crate::clients::{ClientId, ClientType};
use crate::runtime::{WorkerEvent, WorkerRuntime};
use crate::{Result, ServiceWorkerError};

/// Sync tag that flushes queued analytics.
pub const BACKGROUND_SYNC_TAG: &str = "background-sync";

/// Periodic sync tag that removes buckets from other versions.
pub const CLEANUP_TAG: &str = "cleanup-old-caches";

const EXPLORE_ACTION: &str = "explore";
const CLOSE_ACTION: &str = "close";

/// Unique identifier for a shown notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NotificationId(u64);

impl NotificationId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// A button on a notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationAction {
    pub action: String,
    pub title: String,
    pub icon: String,
}

/// A notification as handed to the host for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub id: NotificationId,
    pub title: String,
    pub body: String,
    pub icon: String,
    pub badge: String,
    /// Vibration pattern in milliseconds.
    pub vibrate: Vec<u32>,
    /// Arrival time, Unix milliseconds.
    pub timestamp: u64,
    pub actions: Vec<NotificationAction>,
}

/// Notifications currently shown.
#[derive(Debug, Default)]
pub(crate) struct Notifications {
    shown: HashMap<NotificationId, Notification>,
}

impl Notifications {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn show(&mut self, notification: Notification) {
        self.shown.insert(notification.id, notification);
    }

    fn close(&mut self, id: NotificationId) -> Option<Notification> {
        self.shown.remove(&id)
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.shown.len()
    }
}

impl WorkerRuntime {
    /// Queue data for the next background sync.
    ///
    /// Beyond `max_sync_queue` items the oldest are dropped.
    pub async fn queue_sync_data(&self, data: JsonValue) {
        let mut queue = self.sync_queue.lock().await;
        queue.push(data);
        self.trim_sync_queue(&mut queue);
    }

    fn trim_sync_queue(&self, queue: &mut Vec<JsonValue>) {
        let excess = queue.len().saturating_sub(self.config.max_sync_queue);
        if excess > 0 {
            queue.drain(..excess);
            warn!(dropped = excess, max = self.config.max_sync_queue, "Sync queue full, dropped oldest items");
        }
    }

    /// Number of items waiting for background sync.
    pub async fn pending_sync(&self) -> usize {
        self.sync_queue.lock().await.len()
    }

    /// Send queued data to the analytics endpoint. Returns how many items
    /// were sent.
    ///
    /// On failure the items go back to the front of the queue and the error
    /// is returned so the host's scheduler can retry.
    pub async fn background_sync(&self) -> Result<usize> {
        let batch = std::mem::take(&mut *self.sync_queue.lock().await);
        if batch.is_empty() {
            debug!("Nothing to sync");
            return Ok(0);
        }

        match self.send_analytics(&batch).await {
            Ok(()) => {
                info!(items = batch.len(), "Background sync complete");
                Ok(batch.len())
            }
            Err(e) => {
                warn!(items = batch.len(), error = %e, "Background sync failed, requeueing");
                let mut queue = self.sync_queue.lock().await;
                let newer = std::mem::replace(&mut *queue, batch);
                queue.extend(newer);
                self.trim_sync_queue(&mut queue);
                Err(e)
            }
        }
    }

    async fn send_analytics(&self, batch: &[JsonValue]) -> Result<()> {
        let url = self.config.resolve(&self.config.analytics_endpoint).map_err(|e| {
            SwKitError::config_with_source(format!("analytics endpoint {:?}", self.config.analytics_endpoint), e)
        })?;
        let request = Request::post_json(url, &batch)?;
        let response = self.fetch_from_network(request).await?;
        if !response.ok() {
            return Err(ServiceWorkerError::SyncFailed(format!(
                "analytics endpoint returned {}",
                response.status
            )));
        }
        Ok(())
    }

    /// Run background sync with backoff, for hosts without a sync scheduler.
    pub async fn run_sync_with_retry(&self, retry: &RetryConfig) -> Result<usize> {
        retry_with_backoff_if(retry, ServiceWorkerError::is_retryable, || self.background_sync()).await
    }

    /// Handle a one-off sync event.
    pub async fn handle_sync(&self, tag: &str) -> Result<()> {
        match tag {
            BACKGROUND_SYNC_TAG => self.background_sync().await.map(drop),
            _ => {
                debug!(tag, "Ignoring sync tag");
                Ok(())
            }
        }
    }

    /// Handle a periodic sync event.
    pub async fn handle_periodic_sync(&self, tag: &str) -> Result<()> {
        match tag {
            CLEANUP_TAG => self.cleanup_old_caches().await.map(drop),
            _ => {
                debug!(tag, "Ignoring periodic sync tag");
                Ok(())
            }
        }
    }

    /// Delete every bucket that is not one of the current version's.
    /// Running it again deletes nothing.
    pub async fn cleanup_old_caches(&self) -> Result<Vec<BucketName>> {
        let current = self.config.current_buckets();
        let stale: Vec<BucketName> = self
            .caches
            .read()
            .await
            .keys()
            .into_iter()
            .filter(|name| !current.contains(name))
            .collect();

        let mut deleted = Vec::new();
        let mut first_error = None;
        for name in stale {
            let result = self.caches.write().await.delete_bucket(&name);
            match result {
                Ok(true) => {
                    self.emit(WorkerEvent::BucketDeleted { name: name.clone() });
                    deleted.push(name);
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(bucket = %name, error = %e, "Cleanup failed for bucket");
                    first_error.get_or_insert(e);
                }
            }
        }

        if !deleted.is_empty() {
            info!(deleted = deleted.len(), "Cleaned up old caches");
        }
        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(deleted),
        }
    }

    /// Show a notification for a push message.
    pub async fn show_push_notification(&self, payload: Option<String>) -> Notification {
        let template = &self.config.notification;
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);

        let notification = Notification {
            id: NotificationId::new(),
            title: template.title.clone(),
            body: payload.unwrap_or_else(|| template.default_body.clone()),
            icon: template.icon.clone(),
            badge: template.badge.clone(),
            vibrate: template.vibrate.clone(),
            timestamp,
            actions: vec![
                NotificationAction {
                    action: EXPLORE_ACTION.to_string(),
                    title: template.open_action_title.clone(),
                    icon: template.icon.clone(),
                },
                NotificationAction {
                    action: CLOSE_ACTION.to_string(),
                    title: template.dismiss_action_title.clone(),
                    icon: template.icon.clone(),
                },
            ],
        };

        self.notifications.write().await.show(notification.clone());
        self.emit(WorkerEvent::NotificationShown {
            id: notification.id,
            title: notification.title.clone(),
        });
        notification
    }

    /// Handle a click on a notification or one of its actions.
    ///
    /// Closes the notification. A body click or `explore` focuses an open
    /// window, or opens one at the start URL; returns that window.
    pub async fn handle_notification_click(
        &self,
        id: NotificationId,
        action: Option<&str>,
    ) -> Result<Option<ClientId>> {
        if self.notifications.write().await.close(id).is_some() {
            self.emit(WorkerEvent::NotificationClosed { id });
        } else {
            debug!(id = id.raw(), "Click on unknown notification");
        }

        match action {
            None | Some(EXPLORE_ACTION) => self.focus_or_open_window().await.map(Some),
            Some(CLOSE_ACTION) => Ok(None),
            Some(other) => {
                debug!(action = other, "Ignoring notification action");
                Ok(None)
            }
        }
    }

    async fn focus_or_open_window(&self) -> Result<ClientId> {
        let start = self.config.resolve(&self.config.notification.start_url).map_err(|e| {
            SwKitError::config_with_source(format!("start url {:?}", self.config.notification.start_url), e)
        })?;

        let mut clients = self.clients.write().await;
        let existing = clients
            .match_all(ClientType::Window, true)
            .first()
            .map(|client| client.id);
        if let Some(id) = existing {
            clients.focus(id);
            debug!(client = id.raw(), "Focused existing window");
            return Ok(id);
        }

        let opened = clients.open_window(start);
        drop(clients);
        info!(client = opened.id.raw(), url = %opened.url, "Opened window");
        self.emit(WorkerEvent::WindowOpened {
            client_id: opened.id,
            url: opened.url.to_string(),
        });
        Ok(opened.id)
    }
}
