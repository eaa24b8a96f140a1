use thiserror::Error;

#[derive(Error, Debug)]
pub enum FeedpostError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] rusqlite_migration::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid cron expression '{expr}': {reason}")]
    Cron { expr: String, reason: String },

    #[error("Subscription not found: {0}")]
    SubscriptionNotFound(i64),

    #[error("Fetch failed: {0}")]
    Fetch(#[from] crate::fetcher::FetchError),

    #[error("All {0} sources failed to fetch")]
    AllSourcesFailed(usize),

    #[error("Rate limit exceeded for {0}")]
    RateLimited(String),

    #[error("Render error: {0}")]
    Render(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Tracking token not found or already opened")]
    TokenRejected,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, FeedpostError>;
