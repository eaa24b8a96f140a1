pub mod engine;
pub mod http_fetcher;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::{CacheValidators, FetchedItem};

#[derive(Debug)]
pub enum FetchResponse {
    /// New content fetched successfully
    Content {
        body: Vec<u8>,
        validators: CacheValidators,
    },
    /// Content not modified (HTTP 304)
    NotModified,
}

/// Why a single source could not be fetched. Callers treat every kind alike.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("network error: {0}")]
    Network(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("unexpected HTTP status {0}")]
    Status(u16),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("fetch task aborted: {0}")]
    Aborted(String),
}

#[async_trait]
pub trait Fetcher {
    async fn fetch(
        &self,
        url: &str,
        validators: &CacheValidators,
    ) -> Result<FetchResponse, FetchError>;
}

/// Parsed content of one successfully fetched source.
#[derive(Debug, Clone, Default)]
pub struct FetchedFeed {
    pub title: Option<String>,
    pub items: Vec<FetchedItem>,
    /// Present only when the server sent fresh validators.
    pub validators: Option<CacheValidators>,
    pub not_modified: bool,
}

/// Outcome for one source, positionally matched to the input list.
#[derive(Debug, Clone)]
pub struct FetchResult {
    pub source_id: i64,
    pub source_url: String,
    pub source_name: Option<String>,
    pub outcome: Result<FetchedFeed, FetchError>,
}

impl FetchResult {
    pub fn is_ok(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn items(&self) -> &[FetchedItem] {
        match &self.outcome {
            Ok(feed) => &feed.items,
            Err(_) => &[],
        }
    }

    /// Configured name, then the feed's own title, then the URL.
    pub fn display_name(&self) -> &str {
        self.source_name
            .as_deref()
            .or_else(|| self.outcome.as_ref().ok().and_then(|f| f.title.as_deref()))
            .unwrap_or(&self.source_url)
    }
}
