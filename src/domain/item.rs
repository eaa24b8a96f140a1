use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One entry extracted from a fetched feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchedItem {
    /// Native entry id, or the entry link when the feed has none.
    pub guid: String,
    pub title: Option<String>,
    pub link: Option<String>,
    /// Full content when present, otherwise the summary.
    pub content: Option<String>,
    /// Published time, falling back to updated time.
    pub published_at: Option<DateTime<Utc>>,
}

impl FetchedItem {
    pub fn new(guid: &str) -> Self {
        Self {
            guid: guid.to_string(),
            title: None,
            link: None,
            content: None,
            published_at: None,
        }
    }

    pub fn display_title(&self) -> &str {
        self.title.as_deref().unwrap_or("(Untitled)")
    }

    /// Items without a timestamp are never considered too old.
    pub fn is_older_than(&self, cutoff: DateTime<Utc>) -> bool {
        self.published_at.is_some_and(|at| at < cutoff)
    }
}

/// Dedup ledger row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeenItem {
    pub id: i64,
    pub source_id: i64,
    pub guid: String,
    pub title: Option<String>,
    pub link: Option<String>,
    pub seen_at: DateTime<Utc>,
}
