//! URL patterns for routing rules.

use serde::{Deserialize, Serialize};
use url::Url;

/// A URL matcher, written in configuration as `{ "prefix": "https://cdn/" }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UrlPattern {
    /// Whole URL must be equal.
    Exact(String),
    /// URL starts with the pattern.
    Prefix(String),
    /// URL ends with the pattern (e.g. an extension).
    Suffix(String),
    /// URL contains the pattern anywhere.
    Contains(String),
}

impl UrlPattern {
    pub fn exact(url: &str) -> Self {
        Self::Exact(url.to_string())
    }

    pub fn prefix(prefix: &str) -> Self {
        Self::Prefix(prefix.to_string())
    }

    pub fn suffix(suffix: &str) -> Self {
        Self::Suffix(suffix.to_string())
    }

    pub fn contains(substring: &str) -> Self {
        Self::Contains(substring.to_string())
    }

    /// Check if a URL matches this pattern.
    pub fn matches(&self, url: &Url) -> bool {
        let url = url.as_str();
        match self {
            UrlPattern::Exact(p) => url == p,
            UrlPattern::Prefix(p) => url.starts_with(p.as_str()),
            UrlPattern::Suffix(p) => url.ends_with(p.as_str()),
            UrlPattern::Contains(p) => url.contains(p.as_str()),
        }
    }

    /// The literal string this pattern matches against.
    pub fn as_str(&self) -> &str {
        match self {
            UrlPattern::Exact(p) | UrlPattern::Prefix(p) | UrlPattern::Suffix(p) | UrlPattern::Contains(p) => p,
        }
    }
}
