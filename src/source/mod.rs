//! Upstream data sources
//!
//! A [`Source`] is one concrete origin for a feed: it either produces a parsed
//! payload or fails with a [`SourceError`]. Feeds hold an ordered list of
//! sources and try them in turn; errors never escape the cache layer.

pub mod html;

pub use html::{HtmlSource, Layout};

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::data::Feed;

/// Errors a single source attempt can end with
#[derive(Debug, Error)]
pub enum SourceError {
    /// HTTP request failed
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Server answered with a non-success status
    #[error("Unexpected HTTP status: {0}")]
    Status(u16),

    /// Server asked us to slow down
    #[error("Rate limited by upstream")]
    RateLimited,

    /// Page did not have the expected structure
    #[error("Failed to parse page: {0}")]
    Parse(String),

    /// Attempt exceeded the per-source time budget
    #[error("Source attempt timed out after {0:?}")]
    Timeout(Duration),

    /// This source cannot serve the requested feed
    #[error("Source '{source_name}' does not serve feed '{feed}'")]
    Unsupported { source_name: String, feed: String },
}

/// One upstream origin able to produce payloads of type `T`
#[async_trait]
pub trait Source<T>: Send + Sync {
    /// Name used in logs and configuration
    fn name(&self) -> &str;

    /// Fetches and parses a fresh payload for `feed`
    async fn fetch(&self, feed: &Feed) -> Result<T, SourceError>;
}
