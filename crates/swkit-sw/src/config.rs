//! Worker configuration.
//!
//! Everything the worker would otherwise keep in scope-global constants:
//! the version tag, bucket declarations and their precache manifests,
//! routing patterns, and the fixed text of synthetic responses and
//! notifications. Loaded once, owned by a single runtime.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use swkit_common::SwKitError;
use swkit_net::UrlPattern;
use url::Url;

use crate::cache::BucketName;

/// Logical name of the app-shell bucket.
pub const CORE_BUCKET: &str = "core";

/// Logical name of the embedded game bucket.
pub const GAME_BUCKET: &str = "game";

/// Worker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Build tag embedded in every bucket name.
    pub version: String,

    /// Origin the worker is registered for; relative URLs resolve here.
    pub origin: Url,

    /// Declared buckets, in precache order.
    pub buckets: Vec<BucketConfig>,

    /// External game asset URLs served stale-while-revalidate.
    pub game_assets: Vec<UrlPattern>,

    /// Cached documents tried, in order, when a navigation fails offline.
    pub navigation_fallbacks: Vec<String>,

    /// Where background sync posts queued analytics.
    pub analytics_endpoint: String,

    /// Activate as soon as install finishes.
    pub skip_waiting: bool,

    /// Requests slower than this are logged as slow.
    pub slow_request_threshold_ms: u64,

    /// Upper bound for a single precache fetch during install.
    pub precache_timeout_secs: u64,

    /// Most items held for background sync; the oldest are dropped first.
    pub max_sync_queue: usize,

    /// Directory for persisted buckets. In-memory when unset.
    pub storage_dir: Option<PathBuf>,

    pub offline: OfflineText,

    pub notification: NotificationTemplate,
}

/// A declared cache bucket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketConfig {
    /// Logical name, e.g. `core`.
    pub name: String,

    /// URLs fetched into the bucket during install.
    #[serde(default)]
    pub precache: Vec<String>,

    /// Evict the oldest entry beyond this many.
    #[serde(default)]
    pub max_entries: Option<usize>,
}

/// Bodies of worker-generated error responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OfflineText {
    pub document: String,
    pub resource: String,
    pub game: String,
}

/// Fixed template for push notifications.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationTemplate {
    pub title: String,
    pub default_body: String,
    pub icon: String,
    pub badge: String,
    pub vibrate: Vec<u32>,
    pub open_action_title: String,
    pub dismiss_action_title: String,
    /// Window opened by the "open app" action.
    pub start_url: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            version: "v2.1.0".to_string(),
            origin: Url::parse("http://localhost:8000/").expect("static origin parses"),
            buckets: vec![
                BucketConfig {
                    name: CORE_BUCKET.to_string(),
                    precache: [
                        "/",
                        "/index.html",
                        "/manifest.json",
                        "/icons/icon-192x192.png",
                        "/icons/icon-512x512.png",
                    ]
                    .map(String::from)
                    .to_vec(),
                    max_entries: None,
                },
                BucketConfig {
                    name: GAME_BUCKET.to_string(),
                    precache: vec!["https://slopeunblocked.bitbucket.io/file/".to_string()],
                    max_entries: None,
                },
            ],
            game_assets: vec![UrlPattern::prefix("https://slopeunblocked.bitbucket.io/file/")],
            navigation_fallbacks: vec!["/".to_string(), "/index.html".to_string()],
            analytics_endpoint: "/api/analytics".to_string(),
            skip_waiting: true,
            slow_request_threshold_ms: 1000,
            precache_timeout_secs: 30,
            max_sync_queue: 1000,
            storage_dir: None,
            offline: OfflineText::default(),
            notification: NotificationTemplate::default(),
        }
    }
}

impl Default for OfflineText {
    fn default() -> Self {
        Self {
            document: "Offline - Game not available".to_string(),
            resource: "Resource not available".to_string(),
            game: "Game resource not available".to_string(),
        }
    }
}

impl Default for NotificationTemplate {
    fn default() -> Self {
        Self {
            title: "Slope Unblocked".to_string(),
            default_body: "New update available!".to_string(),
            icon: "/icons/icon-192x192.png".to_string(),
            badge: "/icons/icon-192x192.png".to_string(),
            vibrate: vec![100, 50, 100],
            open_action_title: "Play Now".to_string(),
            dismiss_action_title: "Close".to_string(),
            start_url: "/".to_string(),
        }
    }
}

impl WorkerConfig {
    /// Read a JSON configuration file. Missing fields take defaults.
    pub fn load(path: impl AsRef<Path>) -> swkit_common::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| SwKitError::config_with_source(format!("reading {}", path.display()), e))?;
        Self::from_json_str(&raw)
    }

    pub fn from_json_str(raw: &str) -> swkit_common::Result<Self> {
        let config: WorkerConfig = serde_json::from_str(raw)
            .map_err(|e| SwKitError::config_with_source("parsing worker config", e))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations whose bucket names could not round-trip.
    pub fn validate(&self) -> swkit_common::Result<()> {
        if !is_name_part(&self.version) {
            return Err(SwKitError::config(format!("invalid version tag {:?}", self.version)));
        }
        if !self.declares(CORE_BUCKET) {
            return Err(SwKitError::config("the core bucket must be declared"));
        }
        if self.max_sync_queue == 0 {
            return Err(SwKitError::config("max_sync_queue must be at least 1"));
        }
        for (i, bucket) in self.buckets.iter().enumerate() {
            if !is_name_part(&bucket.name) {
                return Err(SwKitError::config(format!("invalid bucket name {:?}", bucket.name)));
            }
            if self.buckets[..i].iter().any(|b| b.name == bucket.name) {
                return Err(SwKitError::config(format!("bucket {:?} declared twice", bucket.name)));
            }
        }
        Ok(())
    }

    /// Whether `logical` is one of this worker's buckets.
    pub fn declares(&self, logical: &str) -> bool {
        self.buckets.iter().any(|b| b.name == logical)
    }

    /// Current versioned name for a logical bucket.
    pub fn bucket_name(&self, logical: &str) -> BucketName {
        BucketName::new(logical, &self.version)
    }

    /// Names of every current bucket.
    pub fn current_buckets(&self) -> Vec<BucketName> {
        self.buckets.iter().map(|b| self.bucket_name(&b.name)).collect()
    }

    /// Resolve a manifest entry or path against the origin.
    pub fn resolve(&self, url: &str) -> Result<Url, url::ParseError> {
        self.origin.join(url)
    }

    pub fn slow_request_threshold(&self) -> Duration {
        Duration::from_millis(self.slow_request_threshold_ms)
    }

    pub fn precache_timeout(&self) -> Duration {
        Duration::from_secs(self.precache_timeout_secs)
    }
}

/// One half of a `logical@version` bucket name. Must not be empty or read as
/// a path.
fn is_name_part(part: &str) -> bool {
    !part.is_empty()
        && !part.contains(['@', '/', '\\', '\0'])
        && part != "."
        && !part.contains("..")
}
