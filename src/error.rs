//! Error types shared across the monitor.
//!
//! None of these are fatal once the process is up: the scheduler logs and
//! skips whatever operation failed, and the HTTP layer degrades.

use thiserror::Error;

/// A configuration was rejected or could not be read/written.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The document parsed but violates the schema.
    #[error("invalid configuration: {0}")]
    Validation(String),

    #[error("config I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ConfigError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }
}

/// A scrape of one search URL failed.
#[derive(Error, Debug)]
pub enum ScrapeError {
    /// Worth retrying: timeouts, rate limiting, upstream hiccups.
    #[error("transient scrape failure: {0}")]
    Transient(String),

    /// Retrying won't help for this cycle.
    #[error("fatal scrape failure: {0}")]
    Fatal(String),
}

impl ScrapeError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<reqwest::Error> for ScrapeError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_builder() || error.is_decode() {
            return Self::Fatal(error.to_string());
        }
        if error.is_timeout() || error.is_connect() || error.is_request() || error.is_body() {
            return Self::Transient(error.to_string());
        }
        match error.status() {
            Some(status) if status.as_u16() == 429 || status.is_server_error() => {
                Self::Transient(error.to_string())
            }
            _ => Self::Fatal(error.to_string()),
        }
    }
}

/// The storage backend failed to load or persist ads.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// The feed document could not be rendered.
#[derive(Error, Debug)]
#[error("failed to render feed: {0}")]
pub struct FeedError(#[from] pub rss::Error);
