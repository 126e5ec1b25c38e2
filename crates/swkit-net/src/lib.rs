//! # SwKit Net
//!
//! Request and response model for the SwKit worker, plus the network
//! boundary it fetches through.
//!
//! ## Design Goals
//!
//! 1. **Single-read bodies**: a [`Response`] body can be read once, like a
//!    platform response stream. Storing and returning the same response
//!    requires [`Response::try_clone`] before either read.
//! 2. **Pluggable network**: strategies talk to a [`Fetcher`]; production
//!    uses [`HttpFetcher`], tests use scripted fetchers.
//! 3. **URL patterns**: [`UrlPattern`] for routing rules in configuration.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use mime::Mime;
use serde::Serialize;
use thiserror::Error;
use url::Url;

pub mod loader;
pub mod pattern;

pub use loader::{Fetcher, HttpFetcher, LoaderConfig};
pub use pattern::UrlPattern;

/// Errors that can occur in networking.
#[derive(Error, Debug)]
pub enum NetError {
    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Body has already been read")]
    BodyUsed,

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),
}

/// Unique identifier for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(u64);

impl RequestId {
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

/// Request mode, as reported by the host for an intercepted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestMode {
    /// Top-level document load.
    Navigate,
    SameOrigin,
    NoCors,
    #[default]
    Cors,
}

/// HTTP request.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: RequestId,
    pub url: Url,
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    pub mode: RequestMode,
    pub timeout: Option<Duration>,
}

impl Request {
    /// Create a GET request.
    pub fn get(url: Url) -> Self {
        Self {
            id: RequestId::new(),
            url,
            method: Method::GET,
            headers: HeaderMap::new(),
            body: None,
            mode: RequestMode::default(),
            timeout: None,
        }
    }

    /// Create a navigation request for a top-level document.
    pub fn navigate(url: Url) -> Self {
        Self::get(url)
            .mode(RequestMode::Navigate)
            .header(header::ACCEPT, HeaderValue::from_static("text/html,application/xhtml+xml"))
    }

    /// Create a POST request.
    pub fn post(url: Url, body: Bytes) -> Self {
        Self {
            method: Method::POST,
            body: Some(body),
            ..Self::get(url)
        }
    }

    /// Create a POST request carrying `value` as a JSON body.
    pub fn post_json<T: Serialize>(url: Url, value: &T) -> Result<Self, NetError> {
        let body = serde_json::to_vec(value).map_err(|e| NetError::RequestFailed(e.to_string()))?;
        Ok(Self::post(url, Bytes::from(body)).header(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        ))
    }

    /// Add a header.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Set the request mode.
    pub fn mode(mut self, mode: RequestMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set timeout.
    pub fn timeout(mut self, duration: Duration) -> Self {
        self.timeout = Some(duration);
        self
    }

    /// Whether this is a top-level document load.
    pub fn is_navigation(&self) -> bool {
        self.mode == RequestMode::Navigate
    }

    /// Whether the `Accept` header lists an HTML media type.
    pub fn accepts_html(&self) -> bool {
        let Some(accept) = self.headers.get(header::ACCEPT).and_then(|v| v.to_str().ok()) else {
            return false;
        };
        accept
            .split(',')
            .filter_map(|part| part.trim().parse::<Mime>().ok())
            .any(|m| m.essence_str() == mime::TEXT_HTML.essence_str())
    }

    /// Whether the scheme is `http` or `https`.
    pub fn is_http(&self) -> bool {
        matches!(self.url.scheme(), "http" | "https")
    }
}

/// A response body that can be read exactly once.
#[derive(Debug, Default)]
pub struct Body {
    data: Bytes,
    used: bool,
}

impl Body {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            used: false,
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_used(&self) -> bool {
        self.used
    }

    /// Byte length of the unread body; zero once read.
    pub fn len(&self) -> usize {
        if self.used {
            0
        } else {
            self.data.len()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read the body, marking it used.
    pub fn take(&mut self) -> Result<Bytes, NetError> {
        if self.used {
            return Err(NetError::BodyUsed);
        }
        self.used = true;
        Ok(std::mem::take(&mut self.data))
    }

    /// Snapshot the unread body into a new, independent owner.
    pub fn try_clone(&self) -> Result<Body, NetError> {
        if self.used {
            return Err(NetError::BodyUsed);
        }
        Ok(Body::new(self.data.clone()))
    }
}

/// HTTP response.
#[derive(Debug)]
pub struct Response {
    pub url: Option<Url>,
    pub status: StatusCode,
    pub headers: HeaderMap,
    /// Served from a cache bucket rather than the network.
    pub from_cache: bool,
    body: Body,
}

impl Response {
    /// Create a response.
    pub fn new(status: StatusCode, headers: HeaderMap, body: impl Into<Bytes>) -> Self {
        Self {
            url: None,
            status,
            headers,
            from_cache: false,
            body: Body::new(body),
        }
    }

    /// A worker-generated plain text response. Never cached by proxies.
    pub fn synthetic(status: StatusCode, text: &str) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        Self::new(status, headers, Bytes::copy_from_slice(text.as_bytes()))
    }

    pub fn with_url(mut self, url: Url) -> Self {
        self.url = Some(url);
        self
    }

    /// Check if request was successful (2xx).
    pub fn ok(&self) -> bool {
        self.status.is_success()
    }

    pub fn status_text(&self) -> &'static str {
        self.status.canonical_reason().unwrap_or("")
    }

    pub fn content_type(&self) -> Option<Mime> {
        self.headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<Mime>().ok())
    }

    pub fn body_used(&self) -> bool {
        self.body.is_used()
    }

    /// Length of the unread body.
    pub fn body_len(&self) -> usize {
        self.body.len()
    }

    /// Read the body as bytes. Fails on a second read.
    pub fn bytes(&mut self) -> Result<Bytes, NetError> {
        self.body.take()
    }

    /// Read the body as UTF-8 text.
    pub fn text(&mut self) -> Result<String, NetError> {
        let bytes = self.bytes()?;
        String::from_utf8(bytes.to_vec()).map_err(|e| NetError::RequestFailed(e.to_string()))
    }

    /// Clone the response; fails if the body was already read.
    pub fn try_clone(&self) -> Result<Response, NetError> {
        Ok(Response {
            url: self.url.clone(),
            status: self.status,
            headers: self.headers.clone(),
            from_cache: self.from_cache,
            body: self.body.try_clone()?,
        })
    }
}
