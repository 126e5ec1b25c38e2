//! # SwKit Common
//!
//! Shared error type, logging setup, and retry helpers for the SwKit
//! offline worker crates.
//!
//! ## Features
//!
//! - Unified error type with a retry predicate
//! - Logging configuration and setup
//! - Retry with exponential backoff, and timeouts

use std::time::Duration;
use thiserror::Error;

pub mod logging;
pub mod retry;

pub use logging::{init_logging, LogConfig, LogFormat};
pub use retry::{retry_with_backoff, retry_with_backoff_if, with_timeout, RetryConfig};

/// Unified error type for SwKit.
#[derive(Error, Debug)]
pub enum SwKitError {
    /// Configuration errors.
    #[error("Config error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Timeout errors.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),
}

impl SwKitError {
    /// Create a config error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    /// Create a config error with source.
    pub fn config_with_source<E: std::error::Error + Send + Sync + 'static>(
        message: impl Into<String>,
        source: E,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Check if this error is retryable. A bad config stays bad.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SwKitError::Timeout(_))
    }
}

/// Result type alias for SwKit operations.
pub type Result<T> = std::result::Result<T, SwKitError>;
