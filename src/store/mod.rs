pub mod sqlite;
pub mod token;

use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};

use crate::app::Result;
use crate::domain::{
    CacheValidators, Engagement, LogEntry, LogLevel, NewSendRecord, NewSource, NewSubscription,
    SeenItem, SendRecord, Source, Subscription,
};

pub use sqlite::SqliteStore;

/// One (source, guid) pair to record in the dedup ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeenMark {
    pub source_id: i64,
    pub guid: String,
    pub title: Option<String>,
    pub link: Option<String>,
}

pub trait SubscriptionStore {
    fn create_subscription(&self, subscription: &NewSubscription) -> Result<i64>;
    fn get_subscription(&self, id: i64) -> Result<Option<Subscription>>;
    fn list_subscriptions(&self) -> Result<Vec<Subscription>>;
    /// Active subscriptions whose next run is at or before `now`, oldest first.
    fn list_due(&self, now: DateTime<Utc>) -> Result<Vec<Subscription>>;
    fn update_run_times(
        &self,
        id: i64,
        last_run: DateTime<Utc>,
        next_run: DateTime<Utc>,
    ) -> Result<()>;
    /// `None` deactivates the subscription.
    fn update_next_run(&self, id: i64, next_run: Option<DateTime<Utc>>) -> Result<()>;
    fn record_engagement(&self, id: i64, at: DateTime<Utc>) -> Result<()>;
    /// Active subscriptions with at least `min_sends` sends and no engagement
    /// since `now - inactivity`, excluding ones created inside that window.
    fn list_inactive(
        &self,
        inactivity: Duration,
        min_sends: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<i64>>;
    fn unsubscribe_token(&self, id: i64) -> Result<String>;
    fn append_log(&self, id: i64, level: LogLevel, message: &str) -> Result<()>;
    fn recent_logs(&self, id: i64, limit: usize) -> Result<Vec<LogEntry>>;
}

pub trait SourceStore {
    fn add_source(&self, subscription_id: i64, source: &NewSource) -> Result<i64>;
    fn get_source(&self, id: i64) -> Result<Option<Source>>;
    fn list_sources(&self, subscription_id: i64) -> Result<Vec<Source>>;
    /// Stamps the fetch time; validators are only replaced when given.
    fn update_fetch_metadata(
        &self,
        id: i64,
        validators: Option<&CacheValidators>,
        fetched_at: DateTime<Utc>,
    ) -> Result<()>;
}

pub trait DedupLedger {
    /// The subset of `guids` already recorded for `source_id`, in one query.
    fn batch_seen(&self, source_id: i64, guids: &[String]) -> Result<HashSet<String>>;
    /// Idempotent upsert; re-marking refreshes title and link.
    fn mark_seen(
        &self,
        source_id: i64,
        guid: &str,
        title: Option<&str>,
        link: Option<&str>,
    ) -> Result<()>;
    /// Bulk upsert in one transaction, used to pre-seed a new source.
    fn mark_seen_batch(&self, marks: &[SeenMark]) -> Result<usize>;
    /// Records every mark and the send record atomically.
    fn commit_delivery(&self, marks: &[SeenMark], record: &NewSendRecord) -> Result<i64>;
    fn recent_seen(&self, source_id: i64, limit: usize) -> Result<Vec<SeenItem>>;
    fn prune_seen(&self, older_than: Duration) -> Result<usize>;
}

pub trait SendLog {
    fn send_records(&self, subscription_id: i64) -> Result<Vec<SendRecord>>;
    /// Fails with `TokenRejected` for unknown or already-opened tokens.
    fn mark_opened(&self, tracking_token: &str) -> Result<()>;
    /// Keep-alive click; returns the owning subscription id.
    fn record_keep_alive(&self, tracking_token: &str) -> Result<i64>;
    fn mark_bounced(&self, subscription_id: i64, recipient: &str, reason: &str) -> Result<bool>;
    fn engagement(&self, subscription_id: i64, window: Duration) -> Result<Engagement>;
    fn prune_sends(&self, older_than: Duration) -> Result<usize>;
}

/// Everything the digest engine needs from storage.
pub trait Store: SubscriptionStore + SourceStore + DedupLedger + SendLog + Send + Sync {}

impl<T> Store for T where T: SubscriptionStore + SourceStore + DedupLedger + SendLog + Send + Sync {}
