use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::app::{FeedpostError, Result};
use crate::coordinator::SendCoordinator;
use crate::digest::DigestAssembler;
use crate::domain::{next_run_after, LogLevel, RunStats, Source, Subscription};
use crate::fetcher::engine::FetchEngine;
use crate::fetcher::FetchResult;
use crate::store::{SeenMark, Store};

/// One subscription run: fetch, assemble, deliver, then advance the schedule.
pub struct Pipeline {
    store: Arc<dyn Store>,
    engine: FetchEngine,
    assembler: DigestAssembler,
    coordinator: SendCoordinator,
}

impl Pipeline {
    pub fn new(
        store: Arc<dyn Store>,
        engine: FetchEngine,
        assembler: DigestAssembler,
        coordinator: SendCoordinator,
    ) -> Self {
        Self {
            store,
            engine,
            assembler,
            coordinator,
        }
    }

    pub async fn run(
        &self,
        subscription: &Subscription,
        progress: Option<Arc<AtomicUsize>>,
    ) -> Result<RunStats> {
        let id = subscription.id;

        // An unparseable schedule would leave the subscription due forever.
        if let Err(e) = next_run_after(&subscription.cron_expr, Utc::now()) {
            self.store.update_next_run(id, None)?;
            self.log(id, LogLevel::Error, &format!("Deactivated: {}", e));
            return Err(e);
        }

        let sources = self.store.list_sources(id)?;
        tracing::debug!("Running subscription {} with {} sources", id, sources.len());

        let results = self.engine.fetch_all(&sources, progress).await;
        let mut stats = RunStats {
            total_sources: results.len(),
            fetched: results.iter().filter(|r| r.is_ok()).count(),
            ..Default::default()
        };
        stats.failed = stats.total_sources - stats.fetched;

        if stats.all_failed() {
            let next_run = self.advance(subscription, false)?;
            let err = FeedpostError::AllSourcesFailed(stats.total_sources);
            self.log(
                id,
                LogLevel::Error,
                &format!("{}; next run at {}", err, next_run.to_rfc3339()),
            );
            return Err(err);
        }

        let digest = self.assembler.assemble(self.store.as_ref(), &results, Utc::now());
        stats.new_items = digest.new_item_count();

        if !digest.is_empty() {
            if let Err(e) = self.coordinator.deliver(subscription, &digest).await {
                self.log(
                    id,
                    LogLevel::Error,
                    &format!("Delivery of {} new items failed: {}", stats.new_items, e),
                );
                return Err(e);
            }
            stats.notification_sent = true;
        }

        self.write_fetch_metadata(&results);
        let next_run = self.advance(subscription, true)?;

        let summary = if stats.notification_sent {
            format!(
                "Sent {} new items from {}/{} sources; next run at {}",
                stats.new_items,
                stats.fetched,
                stats.total_sources,
                next_run.to_rfc3339()
            )
        } else {
            format!(
                "No new items from {}/{} sources; next run at {}",
                stats.fetched,
                stats.total_sources,
                next_run.to_rfc3339()
            )
        };
        tracing::info!("Subscription {}: {}", id, summary);
        self.log(id, LogLevel::Info, &summary);

        Ok(stats)
    }

    /// Fetch a newly added source and record its current backlog as seen, so
    /// the first digest only carries items published afterwards.
    pub async fn seed_source(&self, source: &Source) -> Result<usize> {
        let results = self
            .engine
            .fetch_all(std::slice::from_ref(source), None)
            .await;
        let Some(result) = results.into_iter().next() else {
            return Ok(0);
        };

        let feed = result.outcome.clone()?;
        let marks: Vec<SeenMark> = feed
            .items
            .iter()
            .map(|item| SeenMark {
                source_id: source.id,
                guid: item.guid.clone(),
                title: item.title.clone(),
                link: item.link.clone(),
            })
            .collect();

        let seeded = self.store.mark_seen_batch(&marks)?;
        self.write_fetch_metadata(std::slice::from_ref(&result));
        tracing::info!("Seeded {} items for {}", seeded, source.url);
        Ok(seeded)
    }

    /// Next run from the completion time, never from the previous next run.
    fn advance(&self, subscription: &Subscription, completed: bool) -> Result<DateTime<Utc>> {
        let now = Utc::now();
        let next_run = next_run_after(&subscription.cron_expr, now)?;
        if completed {
            self.store.update_run_times(subscription.id, now, next_run)?;
        } else {
            self.store.update_next_run(subscription.id, Some(next_run))?;
        }
        Ok(next_run)
    }

    fn write_fetch_metadata(&self, results: &[FetchResult]) {
        let now = Utc::now();
        for result in results {
            let Ok(feed) = &result.outcome else {
                continue;
            };
            if let Err(e) =
                self.store
                    .update_fetch_metadata(result.source_id, feed.validators.as_ref(), now)
            {
                tracing::warn!(
                    "Failed to store fetch metadata for {}: {}",
                    result.source_url,
                    e
                );
            }
        }
    }

    fn log(&self, id: i64, level: LogLevel, message: &str) {
        if let Err(e) = self.store.append_log(id, level, message) {
            tracing::warn!("Failed to append log for subscription {}: {}", id, e);
        }
    }
}
