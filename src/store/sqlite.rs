use std::collections::HashSet;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use rusqlite_migration::{Migrations, M};

use crate::app::{FeedpostError, Result};
use crate::domain::{
    CacheValidators, Engagement, LogEntry, LogLevel, NewSendRecord, NewSource, NewSubscription,
    SeenItem, SendRecord, Source, Subscription,
};
use crate::store::token::{random_token, UNSUBSCRIBE_TOKEN_BYTES};
use crate::store::{DedupLedger, SeenMark, SendLog, SourceStore, SubscriptionStore};

const SUBSCRIPTION_COLUMNS: &str = "id, subscriber, name, recipient, cron_expr, inline_content, \
     inline_threshold, last_run, next_run, created_at, last_engagement_at";

const SOURCE_COLUMNS: &str =
    "id, subscription_id, url, name, last_fetched_at, etag, last_modified";

const SEND_COLUMNS: &str = "id, subscription_id, recipient, subject, tracking_token, sent_at, \
     opened, opened_at, bounced, bounce_reason";

const UPSERT_SEEN: &str = "INSERT INTO seen_items (source_id, guid, title, link, seen_at)
     VALUES (?1, ?2, ?3, ?4, ?5)
     ON CONFLICT(source_id, guid) DO UPDATE SET title = excluded.title, link = excluded.link";

/// Fixed-width UTC timestamps so that string comparison in SQL is chronological.
fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(StdDuration::from_secs(5))?;
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.run_migrations()?;
        Ok(store)
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.run_migrations()?;
        Ok(store)
    }

    fn run_migrations(&self) -> Result<()> {
        let migrations = Migrations::new(vec![M::up(include_str!(
            "../../migrations/001-initial/up.sql"
        ))]);

        let mut conn = self.conn()?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        migrations.to_latest(&mut conn)?;

        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|e| {
            FeedpostError::Database(rusqlite::Error::SqliteFailure(
                rusqlite::ffi::Error::new(1),
                Some(e.to_string()),
            ))
        })
    }

    fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
            .or_else(|| s.parse::<DateTime<Utc>>().ok())
    }

    fn opt_datetime(row: &Row, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
        Ok(row
            .get::<_, Option<String>>(idx)?
            .and_then(|s| Self::parse_datetime(&s)))
    }

    fn datetime(row: &Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
        Ok(row
            .get::<_, String>(idx)
            .ok()
            .and_then(|s| Self::parse_datetime(&s))
            .unwrap_or_else(Utc::now))
    }

    fn subscription_from_row(row: &Row) -> rusqlite::Result<Subscription> {
        Ok(Subscription {
            id: row.get(0)?,
            subscriber: row.get(1)?,
            name: row.get(2)?,
            recipient: row.get(3)?,
            cron_expr: row.get(4)?,
            inline_content: row.get::<_, i64>(5)? != 0,
            inline_threshold: row.get::<_, i64>(6)?.max(0) as usize,
            last_run: Self::opt_datetime(row, 7)?,
            next_run: Self::opt_datetime(row, 8)?,
            created_at: Self::datetime(row, 9)?,
            last_engagement_at: Self::opt_datetime(row, 10)?,
        })
    }

    fn source_from_row(row: &Row) -> rusqlite::Result<Source> {
        Ok(Source {
            id: row.get(0)?,
            subscription_id: row.get(1)?,
            url: row.get(2)?,
            name: row.get(3)?,
            last_fetched_at: Self::opt_datetime(row, 4)?,
            etag: row.get(5)?,
            last_modified: row.get(6)?,
        })
    }

    fn send_from_row(row: &Row) -> rusqlite::Result<SendRecord> {
        Ok(SendRecord {
            id: row.get(0)?,
            subscription_id: row.get(1)?,
            recipient: row.get(2)?,
            subject: row.get(3)?,
            tracking_token: row.get(4)?,
            sent_at: Self::datetime(row, 5)?,
            opened: row.get::<_, i64>(6)? != 0,
            opened_at: Self::opt_datetime(row, 7)?,
            bounced: row.get::<_, i64>(8)? != 0,
            bounce_reason: row.get(9)?,
        })
    }
}

impl SubscriptionStore for SqliteStore {
    fn create_subscription(&self, subscription: &NewSubscription) -> Result<i64> {
        let conn = self.conn()?;

        conn.execute(
            "INSERT INTO subscriptions
                (subscriber, name, recipient, cron_expr, inline_content, inline_threshold, next_run, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                subscription.subscriber,
                subscription.name,
                subscription.recipient,
                subscription.cron_expr,
                subscription.inline_content,
                subscription.inline_threshold as i64,
                subscription.next_run.as_ref().map(ts),
                ts(&Utc::now()),
            ],
        )?;

        Ok(conn.last_insert_rowid())
    }

    fn get_subscription(&self, id: i64) -> Result<Option<Subscription>> {
        let conn = self.conn()?;

        let result = conn
            .query_row(
                &format!("SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE id = ?1"),
                params![id],
                Self::subscription_from_row,
            )
            .optional()?;

        Ok(result)
    }

    fn list_subscriptions(&self) -> Result<Vec<Subscription>> {
        let conn = self.conn()?;

        let mut stmt =
            conn.prepare(&format!("SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions ORDER BY id"))?;
        let subscriptions = stmt
            .query_map([], Self::subscription_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(subscriptions)
    }

    fn list_due(&self, now: DateTime<Utc>) -> Result<Vec<Subscription>> {
        let conn = self.conn()?;

        let mut stmt = conn.prepare(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions
             WHERE next_run IS NOT NULL AND next_run <= ?1
             ORDER BY next_run ASC, id ASC"
        ))?;
        let subscriptions = stmt
            .query_map(params![ts(&now)], Self::subscription_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(subscriptions)
    }

    fn update_run_times(
        &self,
        id: i64,
        last_run: DateTime<Utc>,
        next_run: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.conn()?;

        let updated = conn.execute(
            "UPDATE subscriptions SET last_run = ?1, next_run = ?2 WHERE id = ?3",
            params![ts(&last_run), ts(&next_run), id],
        )?;
        if updated == 0 {
            return Err(FeedpostError::SubscriptionNotFound(id));
        }

        Ok(())
    }

    fn update_next_run(&self, id: i64, next_run: Option<DateTime<Utc>>) -> Result<()> {
        let conn = self.conn()?;

        let updated = conn.execute(
            "UPDATE subscriptions SET next_run = ?1 WHERE id = ?2",
            params![next_run.as_ref().map(ts), id],
        )?;
        if updated == 0 {
            return Err(FeedpostError::SubscriptionNotFound(id));
        }

        Ok(())
    }

    fn record_engagement(&self, id: i64, at: DateTime<Utc>) -> Result<()> {
        let conn = self.conn()?;

        conn.execute(
            "UPDATE subscriptions SET last_engagement_at = ?1 WHERE id = ?2",
            params![ts(&at), id],
        )?;

        Ok(())
    }

    fn list_inactive(
        &self,
        inactivity: Duration,
        min_sends: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<i64>> {
        let conn = self.conn()?;
        let cutoff = ts(&(now - inactivity));

        let mut stmt = conn.prepare(
            "SELECT s.id FROM subscriptions s
             WHERE s.next_run IS NOT NULL
               AND s.created_at < ?1
               AND (s.last_engagement_at IS NULL OR s.last_engagement_at < ?1)
               AND (SELECT COUNT(*) FROM send_records r WHERE r.subscription_id = s.id) >= ?2
             ORDER BY s.id",
        )?;
        let ids = stmt
            .query_map(params![cutoff, min_sends as i64], |row| row.get(0))?
            .collect::<std::result::Result<Vec<i64>, _>>()?;

        Ok(ids)
    }

    fn unsubscribe_token(&self, id: i64) -> Result<String> {
        let conn = self.conn()?;

        let existing: Option<String> = conn
            .query_row(
                "SELECT token FROM unsubscribe_tokens WHERE subscription_id = ?1
                 ORDER BY id LIMIT 1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(token) = existing {
            return Ok(token);
        }

        let token = random_token(UNSUBSCRIBE_TOKEN_BYTES);
        conn.execute(
            "INSERT INTO unsubscribe_tokens (token, subscription_id, created_at) VALUES (?1, ?2, ?3)",
            params![token, id, ts(&Utc::now())],
        )?;

        Ok(token)
    }

    fn append_log(&self, id: i64, level: LogLevel, message: &str) -> Result<()> {
        let conn = self.conn()?;

        conn.execute(
            "INSERT INTO subscription_logs (subscription_id, level, message, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![id, level.as_str(), message, ts(&Utc::now())],
        )?;

        Ok(())
    }

    fn recent_logs(&self, id: i64, limit: usize) -> Result<Vec<LogEntry>> {
        let conn = self.conn()?;

        let mut stmt = conn.prepare(
            "SELECT id, subscription_id, level, message, created_at FROM subscription_logs
             WHERE subscription_id = ?1 ORDER BY id DESC LIMIT ?2",
        )?;
        let logs = stmt
            .query_map(params![id, limit as i64], |row| {
                Ok(LogEntry {
                    id: row.get(0)?,
                    subscription_id: row.get(1)?,
                    level: row
                        .get::<_, String>(2)?
                        .parse()
                        .unwrap_or(LogLevel::Info),
                    message: row.get(3)?,
                    created_at: Self::datetime(row, 4)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(logs)
    }
}

impl SourceStore for SqliteStore {
    fn add_source(&self, subscription_id: i64, source: &NewSource) -> Result<i64> {
        let conn = self.conn()?;

        conn.execute(
            "INSERT INTO sources (subscription_id, url, name) VALUES (?1, ?2, ?3)",
            params![subscription_id, source.url, source.name],
        )?;

        Ok(conn.last_insert_rowid())
    }

    fn get_source(&self, id: i64) -> Result<Option<Source>> {
        let conn = self.conn()?;

        let result = conn
            .query_row(
                &format!("SELECT {SOURCE_COLUMNS} FROM sources WHERE id = ?1"),
                params![id],
                Self::source_from_row,
            )
            .optional()?;

        Ok(result)
    }

    fn list_sources(&self, subscription_id: i64) -> Result<Vec<Source>> {
        let conn = self.conn()?;

        let mut stmt = conn.prepare(&format!(
            "SELECT {SOURCE_COLUMNS} FROM sources WHERE subscription_id = ?1 ORDER BY id"
        ))?;
        let sources = stmt
            .query_map(params![subscription_id], Self::source_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(sources)
    }

    fn update_fetch_metadata(
        &self,
        id: i64,
        validators: Option<&CacheValidators>,
        fetched_at: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.conn()?;

        match validators {
            Some(v) => conn.execute(
                "UPDATE sources SET last_fetched_at = ?1, etag = ?2, last_modified = ?3 WHERE id = ?4",
                params![ts(&fetched_at), v.etag, v.last_modified, id],
            )?,
            None => conn.execute(
                "UPDATE sources SET last_fetched_at = ?1 WHERE id = ?2",
                params![ts(&fetched_at), id],
            )?,
        };

        Ok(())
    }
}

impl DedupLedger for SqliteStore {
    fn batch_seen(&self, source_id: i64, guids: &[String]) -> Result<HashSet<String>> {
        if guids.is_empty() {
            return Ok(HashSet::new());
        }

        let conn = self.conn()?;
        let wanted = serde_json::to_string(guids)?;

        let mut stmt = conn.prepare_cached(
            "SELECT guid FROM seen_items
             WHERE source_id = ?1 AND guid IN (SELECT value FROM json_each(?2))",
        )?;
        let seen = stmt
            .query_map(params![source_id, wanted], |row| row.get(0))?
            .collect::<std::result::Result<HashSet<String>, _>>()?;

        Ok(seen)
    }

    fn mark_seen(
        &self,
        source_id: i64,
        guid: &str,
        title: Option<&str>,
        link: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            UPSERT_SEEN,
            params![source_id, guid, title, link, ts(&Utc::now())],
        )?;
        Ok(())
    }

    fn mark_seen_batch(&self, marks: &[SeenMark]) -> Result<usize> {
        let mut conn = self.conn()?;
        let now = ts(&Utc::now());

        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(UPSERT_SEEN)?;
            for mark in marks {
                stmt.execute(params![mark.source_id, mark.guid, mark.title, mark.link, now])?;
            }
        }
        tx.commit()?;

        Ok(marks.len())
    }

    fn commit_delivery(&self, marks: &[SeenMark], record: &NewSendRecord) -> Result<i64> {
        let mut conn = self.conn()?;
        let now = ts(&Utc::now());

        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(UPSERT_SEEN)?;
            for mark in marks {
                stmt.execute(params![mark.source_id, mark.guid, mark.title, mark.link, now])?;
            }
        }
        tx.execute(
            "INSERT INTO send_records (subscription_id, recipient, subject, tracking_token, sent_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                record.subscription_id,
                record.recipient,
                record.subject,
                record.tracking_token,
                now
            ],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;

        Ok(id)
    }

    fn recent_seen(&self, source_id: i64, limit: usize) -> Result<Vec<SeenItem>> {
        let conn = self.conn()?;

        let mut stmt = conn.prepare(
            "SELECT id, source_id, guid, title, link, seen_at FROM seen_items
             WHERE source_id = ?1 ORDER BY seen_at DESC, id DESC LIMIT ?2",
        )?;
        let items = stmt
            .query_map(params![source_id, limit as i64], |row| {
                Ok(SeenItem {
                    id: row.get(0)?,
                    source_id: row.get(1)?,
                    guid: row.get(2)?,
                    title: row.get(3)?,
                    link: row.get(4)?,
                    seen_at: Self::datetime(row, 5)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(items)
    }

    fn prune_seen(&self, older_than: Duration) -> Result<usize> {
        let conn = self.conn()?;
        let cutoff = ts(&(Utc::now() - older_than));
        let deleted = conn.execute("DELETE FROM seen_items WHERE seen_at < ?1", params![cutoff])?;
        Ok(deleted)
    }
}

impl SendLog for SqliteStore {
    fn send_records(&self, subscription_id: i64) -> Result<Vec<SendRecord>> {
        let conn = self.conn()?;

        let mut stmt = conn.prepare(&format!(
            "SELECT {SEND_COLUMNS} FROM send_records WHERE subscription_id = ?1
             ORDER BY sent_at DESC, id DESC"
        ))?;
        let records = stmt
            .query_map(params![subscription_id], Self::send_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(records)
    }

    fn mark_opened(&self, tracking_token: &str) -> Result<()> {
        let mut conn = self.conn()?;
        let now = ts(&Utc::now());

        let tx = conn.transaction()?;
        let subscription_id: Option<i64> = tx
            .query_row(
                "UPDATE send_records SET opened = 1, opened_at = ?1
                 WHERE tracking_token = ?2 AND opened = 0
                 RETURNING subscription_id",
                params![now, tracking_token],
                |row| row.get(0),
            )
            .optional()?;
        let Some(subscription_id) = subscription_id else {
            return Err(FeedpostError::TokenRejected);
        };
        tx.execute(
            "UPDATE subscriptions SET last_engagement_at = ?1 WHERE id = ?2",
            params![now, subscription_id],
        )?;
        tx.commit()?;

        Ok(())
    }

    fn record_keep_alive(&self, tracking_token: &str) -> Result<i64> {
        let conn = self.conn()?;

        let subscription_id: Option<i64> = conn
            .query_row(
                "SELECT subscription_id FROM send_records WHERE tracking_token = ?1",
                params![tracking_token],
                |row| row.get(0),
            )
            .optional()?;
        let subscription_id = subscription_id.ok_or(FeedpostError::TokenRejected)?;

        conn.execute(
            "UPDATE subscriptions SET last_engagement_at = ?1 WHERE id = ?2",
            params![ts(&Utc::now()), subscription_id],
        )?;

        Ok(subscription_id)
    }

    fn mark_bounced(&self, subscription_id: i64, recipient: &str, reason: &str) -> Result<bool> {
        let conn = self.conn()?;
        let window = ts(&(Utc::now() - Duration::days(7)));

        let updated = conn.execute(
            "UPDATE send_records SET bounced = 1, bounce_reason = ?1
             WHERE id = (
                 SELECT id FROM send_records
                 WHERE subscription_id = ?2 AND recipient = ?3 AND sent_at > ?4
                 ORDER BY sent_at DESC, id DESC LIMIT 1
             )",
            params![reason, subscription_id, recipient, window],
        )?;

        Ok(updated > 0)
    }

    fn engagement(&self, subscription_id: i64, window: Duration) -> Result<Engagement> {
        let conn = self.conn()?;
        let since = ts(&(Utc::now() - window));

        let engagement = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(opened), 0), COALESCE(SUM(bounced), 0), MAX(opened_at)
             FROM send_records WHERE subscription_id = ?1 AND sent_at >= ?2",
            params![subscription_id, since],
            |row| {
                Ok(Engagement {
                    total_sends: row.get::<_, i64>(0)? as usize,
                    opens: row.get::<_, i64>(1)? as usize,
                    bounces: row.get::<_, i64>(2)? as usize,
                    last_open: Self::opt_datetime(row, 3)?,
                })
            },
        )?;

        Ok(engagement)
    }

    fn prune_sends(&self, older_than: Duration) -> Result<usize> {
        let conn = self.conn()?;
        let cutoff = ts(&(Utc::now() - older_than));
        let deleted = conn.execute("DELETE FROM send_records WHERE sent_at < ?1", params![cutoff])?;
        Ok(deleted)
    }
}
