//! Cache storage: named, versioned buckets of request → response entries.
//!
//! ```text
//! CacheStorage
//!     ├── core@v2  (CacheBucket)
//!     │       └── RequestKey → StoredEntry   (insertion order)
//!     └── game@v2
//! ```
//!
//! Every mutation is a single call on [`CacheStorage`]; the runtime holds it
//! behind a write lock, so each `put`/`delete` is atomic while operations from
//! different events may interleave.
//!
//! With a storage directory each bucket is a directory of entry files:
//!
//! ```text
//! <dir>/<hash(bucket)>/bucket.json        { name }
//! <dir>/<hash(bucket)>/<hash(key)>.json   { seq, entry }
//! ```
//!
//! The file is written before memory changes, so a failed write leaves the
//! bucket as it was.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD as BASE64;
use hashbrown::HashMap;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use swkit_net::{NetError, Request, Response};
use thiserror::Error;
use tracing::{debug, trace, warn};
use url::Url;

/// Storage failures. Strategies treat these as a cache miss.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Storage I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt bucket data: {0}")]
    Corrupt(#[from] serde_json::Error),

    #[error("Response body unavailable: {0}")]
    Body(#[from] NetError),

    #[error("Only GET requests can be cached, got {0}")]
    UnsupportedMethod(String),

    #[error("Bucket not found: {0}")]
    NotFound(String),
}

// ==================== Names and keys ====================

/// Bucket name, `logical@version` for buckets this worker owns.
///
/// Names without `@` are foreign: they are listed and can be cleared but are
/// never treated as a version of a declared bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BucketName(String);

impl BucketName {
    pub fn new(logical: &str, version: &str) -> Self {
        Self(format!("{logical}@{version}"))
    }

    /// Wrap an arbitrary name, e.g. one listed from storage.
    pub fn raw(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `(logical, version)` if the name follows the `logical@version` shape.
    pub fn parts(&self) -> Option<(&str, &str)> {
        self.0
            .rsplit_once('@')
            .filter(|(logical, version)| !logical.is_empty() && !version.is_empty())
    }

    pub fn logical(&self) -> Option<&str> {
        self.parts().map(|(logical, _)| logical)
    }

    pub fn version(&self) -> Option<&str> {
        self.parts().map(|(_, version)| version)
    }
}

impl fmt::Display for BucketName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Cache key: method and absolute URL. Only GET is ever stored.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestKey {
    pub method: String,
    pub url: String,
}

impl RequestKey {
    pub fn get(url: &Url) -> Self {
        Self {
            method: Method::GET.to_string(),
            url: url.as_str().to_string(),
        }
    }

    /// Key for a cacheable request; `None` for anything but GET.
    pub fn for_request(request: &Request) -> Option<Self> {
        (request.method == Method::GET).then(|| Self::get(&request.url))
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.url)
    }
}

// ==================== Entries ====================

/// A response snapshot as stored in a bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEntry {
    pub key: RequestKey,
    pub status: u16,
    pub headers: Vec<(String, String)>,
    #[serde(with = "body_base64")]
    pub body: Vec<u8>,
    /// Cached at, in ms since the epoch.
    pub cached_at: u64,
}

impl StoredEntry {
    /// Capture a response, reading its body. Pass a clone, not the response
    /// that goes back to the requester.
    pub fn capture(key: RequestKey, mut response: Response) -> Result<Self, StorageError> {
        let body = response.bytes()?.to_vec();
        let headers = response
            .headers
            .iter()
            .filter_map(|(name, value)| Some((name.to_string(), value.to_str().ok()?.to_string())))
            .collect();

        Ok(Self {
            key,
            status: response.status.as_u16(),
            headers,
            body,
            cached_at: now_millis(),
        })
    }

    /// Materialize a fresh response with its own unread body.
    pub fn to_response(&self) -> Response {
        let mut headers = HeaderMap::new();
        for (name, value) in &self.headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::try_from(name.as_str()),
                HeaderValue::try_from(value.as_str()),
            ) {
                headers.append(name, value);
            }
        }
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::OK);

        let mut response = Response::new(status, headers, self.body.clone());
        response.from_cache = true;
        match Url::parse(&self.key.url) {
            Ok(url) => response.with_url(url),
            Err(_) => response,
        }
    }

    pub fn size(&self) -> u64 {
        self.body.len() as u64
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

mod body_base64 {
    use super::BASE64;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64.decode(encoded).map_err(serde::de::Error::custom)
    }
}

// ==================== Bucket ====================

/// One bucket: entries in insertion order.
#[derive(Debug, Clone)]
pub struct CacheBucket {
    name: BucketName,
    entries: IndexMap<RequestKey, StoredEntry>,
    max_entries: Option<usize>,
}

impl CacheBucket {
    fn new(name: BucketName, max_entries: Option<usize>) -> Self {
        Self {
            name,
            entries: IndexMap::new(),
            max_entries,
        }
    }

    pub fn name(&self) -> &BucketName {
        &self.name
    }

    pub fn match_request(&self, key: &RequestKey) -> Option<&StoredEntry> {
        self.entries.get(key)
    }

    /// Keys in insertion order.
    pub fn keys(&self) -> Vec<&RequestKey> {
        self.entries.keys().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sum of stored body sizes.
    pub fn size(&self) -> u64 {
        self.entries.values().map(StoredEntry::size).sum()
    }

    /// Insert, moving an overwritten key to the newest position.
    /// Returns the keys evicted to stay under the entry cap.
    fn insert(&mut self, entry: StoredEntry) -> Vec<RequestKey> {
        self.entries.shift_remove(&entry.key);
        self.entries.insert(entry.key.clone(), entry);

        let mut evicted = Vec::new();
        if let Some(max) = self.max_entries {
            while self.entries.len() > max {
                match self.entries.shift_remove_index(0) {
                    Some((key, _)) => evicted.push(key),
                    None => break,
                }
            }
        }
        evicted
    }

    fn remove(&mut self, key: &RequestKey) -> bool {
        self.entries.shift_remove(key).is_some()
    }
}

/// Marker file naming the bucket stored in a directory.
const BUCKET_MARKER: &str = "bucket.json";

#[derive(Serialize, Deserialize)]
struct BucketMarker {
    name: BucketName,
}

/// On-disk form of one entry. `seq` restores insertion order on load.
#[derive(Serialize, Deserialize)]
struct EntryRecord<E> {
    seq: u64,
    entry: E,
}

/// Filesystem-safe stand-in for a bucket name or request key.
fn hashed(value: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(value.as_bytes());
    hex::encode(&hasher.finalize()[..16])
}

/// Read one bucket directory. Unreadable entry files are skipped.
fn load_bucket(path: &Path) -> Result<(CacheBucket, u64), StorageError> {
    let marker: BucketMarker = serde_json::from_slice(&std::fs::read(path.join(BUCKET_MARKER))?)?;

    let mut records = Vec::new();
    for file in std::fs::read_dir(path)? {
        let file = file?.path();
        if file.extension().and_then(|e| e.to_str()) != Some("json")
            || file.file_name().and_then(|n| n.to_str()) == Some(BUCKET_MARKER)
        {
            continue;
        }
        let record = std::fs::read(&file)
            .map_err(StorageError::from)
            .and_then(|raw| serde_json::from_slice::<EntryRecord<StoredEntry>>(&raw).map_err(StorageError::from));
        match record {
            Ok(record) => records.push(record),
            Err(e) => warn!(path = %file.display(), error = %e, "Skipping unreadable entry file"),
        }
    }
    records.sort_by_key(|record| record.seq);

    let last_seq = records.last().map(|record| record.seq).unwrap_or(0);
    let mut bucket = CacheBucket::new(marker.name, None);
    for record in records {
        bucket.entries.insert(record.entry.key.clone(), record.entry);
    }
    Ok((bucket, last_seq))
}

// ==================== Storage ====================

/// Where a lookup searches.
#[derive(Debug, Clone, Copy)]
pub enum MatchScope<'a> {
    /// Every bucket, in name order.
    All,
    Bucket(&'a BucketName),
}

/// Per-bucket statistics as reported to the page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketStats {
    pub entries: usize,
    pub size: u64,
    #[serde(rename = "sizeFormatted")]
    pub size_formatted: String,
}

/// All buckets owned by one worker.
#[derive(Debug, Default)]
pub struct CacheStorage {
    buckets: HashMap<BucketName, CacheBucket>,
    /// Entry caps by logical name.
    limits: HashMap<String, usize>,
    dir: Option<PathBuf>,
    /// Next on-disk insertion sequence number.
    next_seq: u64,
}

impl CacheStorage {
    /// In-memory storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Storage persisted under `dir`, loading any buckets already there.
    pub fn with_dir(dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;

        let mut buckets = HashMap::new();
        let mut last_seq = 0;
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if !path.is_dir() {
                continue;
            }
            match load_bucket(&path) {
                Ok((bucket, seq)) => {
                    debug!(bucket = %bucket.name, entries = bucket.len(), "Loaded bucket");
                    last_seq = last_seq.max(seq);
                    buckets.insert(bucket.name.clone(), bucket);
                }
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable bucket directory"),
            }
        }

        Ok(Self {
            buckets,
            limits: HashMap::new(),
            dir: Some(dir),
            next_seq: last_seq + 1,
        })
    }

    pub fn is_persistent(&self) -> bool {
        self.dir.is_some()
    }

    /// Cap entries for every version of a logical bucket.
    pub fn set_limit(&mut self, logical: &str, max_entries: usize) {
        self.limits.insert(logical.to_string(), max_entries);
        for (name, bucket) in self.buckets.iter_mut() {
            if name.logical() == Some(logical) {
                bucket.max_entries = Some(max_entries);
            }
        }
    }

    /// Open a bucket, creating it if absent.
    pub fn open(&mut self, name: &BucketName) -> Result<&CacheBucket, StorageError> {
        if !self.buckets.contains_key(name) {
            self.create_bucket_dir(name)?;
            let limit = name.logical().and_then(|l| self.limits.get(l)).copied();
            self.buckets.insert(name.clone(), CacheBucket::new(name.clone(), limit));
            debug!(bucket = %name, "Created bucket");
        }
        self.buckets
            .get(name)
            .ok_or_else(|| StorageError::NotFound(name.to_string()))
    }

    pub fn has(&self, name: &BucketName) -> bool {
        self.buckets.contains_key(name)
    }

    pub fn bucket(&self, name: &BucketName) -> Option<&CacheBucket> {
        self.buckets.get(name)
    }

    /// Look up a request.
    pub fn match_request(&self, scope: MatchScope<'_>, key: &RequestKey) -> Option<&StoredEntry> {
        match scope {
            MatchScope::Bucket(name) => self.buckets.get(name)?.match_request(key),
            MatchScope::All => self
                .keys()
                .into_iter()
                .find_map(|name| self.buckets.get(&name)?.match_request(key)),
        }
    }

    /// Store a response under `key`, creating the bucket if needed.
    ///
    /// Consumes `response` and reads its body: hand over a clone. On error the
    /// bucket keeps its previous contents.
    pub fn put(&mut self, name: &BucketName, key: RequestKey, response: Response) -> Result<(), StorageError> {
        if key.method != Method::GET.as_str() {
            return Err(StorageError::UnsupportedMethod(key.method));
        }
        let entry = StoredEntry::capture(key, response)?;
        trace!(bucket = %name, key = %entry.key, size = entry.size(), "Storing entry");

        self.open(name)?;
        if let Some(path) = self.entry_path(name, &entry.key) {
            let record = EntryRecord {
                seq: self.next_seq,
                entry: &entry,
            };
            write_atomically(&path, &serde_json::to_vec(&record)?)?;
        }
        self.next_seq += 1;

        let evicted = match self.buckets.get_mut(name) {
            Some(bucket) => bucket.insert(entry),
            None => return Err(StorageError::NotFound(name.to_string())),
        };
        for key in &evicted {
            debug!(bucket = %name, key = %key, "Evicted oldest entry");
            if let Err(e) = self.remove_entry_file(name, key) {
                warn!(bucket = %name, key = %key, error = %e, "Failed to remove evicted entry file");
            }
        }
        Ok(())
    }

    /// Remove one entry. Returns whether it existed.
    pub fn delete(&mut self, name: &BucketName, key: &RequestKey) -> Result<bool, StorageError> {
        let exists = self
            .buckets
            .get(name)
            .is_some_and(|bucket| bucket.match_request(key).is_some());
        if !exists {
            return Ok(false);
        }
        self.remove_entry_file(name, key)?;
        Ok(self.buckets.get_mut(name).is_some_and(|bucket| bucket.remove(key)))
    }

    /// Remove a whole bucket. Returns whether it existed.
    pub fn delete_bucket(&mut self, name: &BucketName) -> Result<bool, StorageError> {
        if let Some(dir) = self.bucket_dir(name) {
            ignore_missing(std::fs::remove_dir_all(&dir))?;
        }
        Ok(self.buckets.remove(name).is_some())
    }

    /// All bucket names, sorted.
    pub fn keys(&self) -> Vec<BucketName> {
        let mut names: Vec<BucketName> = self.buckets.keys().cloned().collect();
        names.sort();
        names
    }

    /// Keys of one bucket in insertion order.
    pub fn entries(&self, name: &BucketName) -> Option<Vec<RequestKey>> {
        self.buckets
            .get(name)
            .map(|bucket| bucket.keys().into_iter().cloned().collect())
    }

    /// Entry count and byte size per bucket.
    pub fn stats(&self) -> BTreeMap<String, BucketStats> {
        self.buckets
            .iter()
            .map(|(name, bucket)| {
                let size = bucket.size();
                (
                    name.to_string(),
                    BucketStats {
                        entries: bucket.len(),
                        size,
                        size_formatted: format_bytes(size),
                    },
                )
            })
            .collect()
    }

    fn bucket_dir(&self, name: &BucketName) -> Option<PathBuf> {
        self.dir.as_ref().map(|dir| dir.join(hashed(name.as_str())))
    }

    fn entry_path(&self, name: &BucketName, key: &RequestKey) -> Option<PathBuf> {
        self.bucket_dir(name)
            .map(|dir| dir.join(format!("{}.json", hashed(&key.to_string()))))
    }

    fn create_bucket_dir(&self, name: &BucketName) -> Result<(), StorageError> {
        let Some(dir) = self.bucket_dir(name) else {
            return Ok(());
        };
        std::fs::create_dir_all(&dir)?;
        let marker = BucketMarker { name: name.clone() };
        write_atomically(&dir.join(BUCKET_MARKER), &serde_json::to_vec(&marker)?)
    }

    fn remove_entry_file(&self, name: &BucketName, key: &RequestKey) -> Result<(), StorageError> {
        match self.entry_path(name, key) {
            Some(path) => ignore_missing(std::fs::remove_file(&path)),
            None => Ok(()),
        }
    }
}

fn ignore_missing(result: std::io::Result<()>) -> Result<(), StorageError> {
    match result {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}

/// Write via a temp file and rename so a crash never leaves half a file.
fn write_atomically(path: &Path, contents: &[u8]) -> Result<(), StorageError> {
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, contents)?;
    if let Err(e) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(())
}

/// Human readable size: `0 Bytes`, `350 Bytes`, `1.5 KB`, `1 MB`.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["Bytes", "KB", "MB", "GB"];
    if bytes == 0 {
        return "0 Bytes".to_string();
    }

    let mut unit = 0;
    while unit + 1 < UNITS.len() && bytes >= 1024u64.pow(unit as u32 + 1) {
        unit += 1;
    }
    let value = bytes as f64 / 1024f64.powi(unit as i32);
    let rounded = (value * 100.0).round() / 100.0;
    format!("{} {}", rounded, UNITS[unit])
}
