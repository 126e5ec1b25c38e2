//! Page → worker control messages.
//!
//! Messages arrive as JSON objects tagged by `type`:
//!
//! ```json
//! { "type": "SKIP_WAITING" }
//! { "type": "GET_VERSION" }      → { "version": "core@v2.1.0" }
//! { "type": "CLEAR_CACHE" }      → { "success": true }
//! { "type": "GET_CACHE_STATS" }  → { "stats": { "core@v2.1.0": { ... } } }
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::cache::BucketStats;
use crate::config::CORE_BUCKET;
use crate::runtime::{WorkerEvent, WorkerRuntime};

/// A control message from a page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlMessage {
    SkipWaiting,
    GetVersion,
    ClearCache,
    GetCacheStats,
}

/// Reply sent back over a [`ReplyPort`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ControlReply {
    Version { version: String },
    Cleared { success: bool },
    Stats { stats: BTreeMap<String, BucketStats> },
}

/// One-shot reply channel supplied with a message.
pub type ReplyPort = oneshot::Sender<ControlReply>;

impl WorkerRuntime {
    /// Handle a raw message. Unknown or malformed messages are logged and
    /// dropped without a reply.
    pub async fn handle_message(&self, data: JsonValue, reply: Option<ReplyPort>) {
        match serde_json::from_value::<ControlMessage>(data.clone()) {
            Ok(message) => self.handle_control(message, reply).await,
            Err(e) => {
                let tag = data.get("type").and_then(JsonValue::as_str).unwrap_or("<none>");
                warn!(tag, error = %e, "Ignoring unknown control message");
            }
        }
    }

    /// Handle a parsed control message.
    pub async fn handle_control(&self, message: ControlMessage, reply: Option<ReplyPort>) {
        debug!(?message, "Control message");

        let answer = match message {
            ControlMessage::SkipWaiting => {
                if let Err(e) = self.skip_waiting().await {
                    warn!(error = %e, "Skip waiting failed");
                }
                None
            }
            ControlMessage::GetVersion => Some(ControlReply::Version {
                version: self.config.bucket_name(CORE_BUCKET).to_string(),
            }),
            ControlMessage::ClearCache => Some(ControlReply::Cleared {
                success: self.clear_all_caches().await,
            }),
            ControlMessage::GetCacheStats => Some(ControlReply::Stats {
                stats: self.cache_stats().await,
            }),
        };

        if let (Some(answer), Some(port)) = (answer, reply) {
            if port.send(answer).is_err() {
                debug!("Reply port closed before reply");
            }
        }
    }

    /// Delete every bucket. Returns whether all deletions succeeded.
    pub async fn clear_all_caches(&self) -> bool {
        let names = self.caches.read().await.keys();
        let mut success = true;
        for name in names {
            let deleted = self.caches.write().await.delete_bucket(&name);
            match deleted {
                Ok(true) => self.emit(WorkerEvent::BucketDeleted { name }),
                Ok(false) => {}
                Err(e) => {
                    warn!(bucket = %name, error = %e, "Failed to clear bucket");
                    success = false;
                }
            }
        }
        info!(success, "Cleared all caches");
        success
    }

    /// Per-bucket statistics, also reported to telemetry.
    pub async fn cache_stats(&self) -> BTreeMap<String, BucketStats> {
        let stats = self.caches.read().await.stats();
        self.emit(WorkerEvent::CacheStats { stats: stats.clone() });
        stats
    }
}
