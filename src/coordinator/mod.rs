//! Delivery of an assembled digest.
//!
//! The ledger marks and the send record are staged in a [`PendingDelivery`]
//! while the notification is rendered and sent. Only a successful send
//! commits them, in a single store transaction; any earlier failure drops the
//! stage and leaves every item new for the next run.

use std::sync::Arc;

use crate::app::{FeedpostError, Result};
use crate::digest::{ContentMode, Digest};
use crate::domain::{NewSendRecord, Subscription};
use crate::notify::{Links, Outgoing, Renderer, Transport};
use crate::ratelimit::RateLimiter;
use crate::store::token::{random_token, TRACKING_TOKEN_BYTES};
use crate::store::{SeenMark, Store};

/// Ledger writes for one delivery, applied only after the send succeeds.
#[derive(Debug)]
#[must_use = "a pending delivery is discarded unless committed"]
pub struct PendingDelivery {
    marks: Vec<SeenMark>,
    record: NewSendRecord,
}

impl PendingDelivery {
    pub fn stage(digest: &Digest, record: NewSendRecord) -> Self {
        Self {
            marks: digest.marks.clone(),
            record,
        }
    }

    pub fn marks(&self) -> &[SeenMark] {
        &self.marks
    }

    pub fn record(&self) -> &NewSendRecord {
        &self.record
    }

    /// Write all marks and the send record atomically.
    pub fn commit<S: Store + ?Sized>(self, store: &S) -> Result<i64> {
        store.commit_delivery(&self.marks, &self.record)
    }
}

pub struct SendCoordinator {
    store: Arc<dyn Store>,
    limiter: Arc<RateLimiter>,
    renderer: Arc<dyn Renderer + Send + Sync>,
    transport: Arc<dyn Transport + Send + Sync>,
    links: Links,
    tracking: bool,
}

impl SendCoordinator {
    pub fn new(
        store: Arc<dyn Store>,
        limiter: Arc<RateLimiter>,
        renderer: Arc<dyn Renderer + Send + Sync>,
        transport: Arc<dyn Transport + Send + Sync>,
        links: Links,
    ) -> Self {
        Self {
            store,
            limiter,
            renderer,
            transport,
            links,
            tracking: true,
        }
    }

    pub fn with_tracking(mut self, tracking: bool) -> Self {
        self.tracking = tracking;
        self
    }

    /// Render, admit, send and commit. Returns the send record id.
    pub async fn deliver(&self, subscription: &Subscription, digest: &Digest) -> Result<i64> {
        let count = digest.new_item_count();
        let mode = ContentMode::decide(
            subscription.inline_content,
            count,
            subscription.inline_threshold,
        );
        if subscription.inline_content && mode == ContentMode::Summary {
            tracing::debug!(
                "Subscription {}: {} items exceed inline threshold {}",
                subscription.id,
                count,
                subscription.inline_threshold
            );
        }

        let rendered = self.renderer.render(subscription, digest, mode)?;

        if !self.limiter.allow(&subscription.recipient).await {
            return Err(FeedpostError::RateLimited(subscription.recipient.clone()));
        }

        let tracking_token = self
            .tracking
            .then(|| random_token(TRACKING_TOKEN_BYTES));
        let unsubscribe_token = self.store.unsubscribe_token(subscription.id)?;

        let pending = PendingDelivery::stage(
            digest,
            NewSendRecord {
                subscription_id: subscription.id,
                recipient: subscription.recipient.clone(),
                subject: rendered.subject.clone(),
                tracking_token: tracking_token.clone(),
            },
        );

        let outgoing = Outgoing {
            recipient: subscription.recipient.clone(),
            digest: rendered,
            unsubscribe_token: Some(unsubscribe_token),
            dashboard_url: Some(self.links.dashboard(&subscription.subscriber)),
            tracking_token,
        };

        self.transport.send(&outgoing).await?;

        let record_id = pending.commit(self.store.as_ref())?;
        tracing::info!(
            "Delivered {} new items to {} (subscription {})",
            count,
            subscription.recipient,
            subscription.id
        );
        Ok(record_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::digest::DigestGroup;
    use crate::domain::{FetchedItem, NewSource, NewSubscription};
    use crate::notify::DigestRenderer;
    use crate::store::{DedupLedger, SendLog, SourceStore, SqliteStore, SubscriptionStore};
    use crate::test_support::{FailingRenderer, RecordingTransport};

    struct Fixture {
        store: Arc<SqliteStore>,
        transport: Arc<RecordingTransport>,
        subscription: Subscription,
        digest: Digest,
    }

    fn fixture(items: usize, inline: bool) -> Fixture {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let mut new = NewSubscription::new("alice", "alice@example.com", "0 8 * * *");
        new.inline_content = inline;
        let sub_id = store.create_subscription(&new).unwrap();
        let source_id = store
            .add_source(sub_id, &NewSource::new("https://blog.test/feed"))
            .unwrap();

        let items: Vec<FetchedItem> = (0..items)
            .map(|i| FetchedItem {
                content: Some(format!("Body of p{i}")),
                link: Some(format!("https://blog.test/p{i}")),
                ..FetchedItem::new(&format!("p{i}"))
            })
            .collect();
        let marks = items
            .iter()
            .map(|i| SeenMark {
                source_id,
                guid: i.guid.clone(),
                title: None,
                link: i.link.clone(),
            })
            .collect();
        let digest = Digest {
            groups: vec![DigestGroup {
                source_id,
                source_name: "Blog".into(),
                source_url: "https://blog.test/feed".into(),
                items,
            }],
            marks,
            skipped_sources: Vec::new(),
        };

        Fixture {
            subscription: store.get_subscription(sub_id).unwrap().unwrap(),
            store,
            transport: Arc::new(RecordingTransport::new()),
            digest,
        }
    }

    fn coordinator(f: &Fixture, renderer: Arc<dyn Renderer + Send + Sync>) -> SendCoordinator {
        let limiter = Arc::new(RateLimiter::new(1.0, 1, Duration::from_secs(300)).unwrap());
        SendCoordinator::new(
            f.store.clone(),
            limiter,
            renderer,
            f.transport.clone(),
            Links::new("https://f.test").unwrap(),
        )
    }

    fn seen(f: &Fixture) -> usize {
        let source_id = f.digest.groups[0].source_id;
        f.store.recent_seen(source_id, 100).unwrap().len()
    }

    #[tokio::test]
    async fn test_successful_delivery_commits() {
        let f = fixture(2, false);
        let id = coordinator(&f, Arc::new(DigestRenderer::new()))
            .deliver(&f.subscription, &f.digest)
            .await
            .unwrap();

        let sent = f.transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].dashboard_url.as_deref(), Some("https://f.test/alice"));
        assert!(sent[0].unsubscribe_token.is_some());
        assert!(sent[0].tracking_token.is_some());

        assert_eq!(seen(&f), 2);
        let records = f.store.send_records(f.subscription.id).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, id);
        assert_eq!(records[0].tracking_token, sent[0].tracking_token);
    }

    #[tokio::test]
    async fn test_transport_failure_persists_nothing() {
        let f = fixture(2, false);
        f.transport.set_failing(true);

        let err = coordinator(&f, Arc::new(DigestRenderer::new()))
            .deliver(&f.subscription, &f.digest)
            .await
            .unwrap_err();

        assert!(matches!(err, FeedpostError::Transport(_)));
        assert_eq!(seen(&f), 0);
        assert!(f.store.send_records(f.subscription.id).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_render_failure_sends_nothing() {
        let f = fixture(1, false);
        let err = coordinator(&f, Arc::new(FailingRenderer))
            .deliver(&f.subscription, &f.digest)
            .await
            .unwrap_err();

        assert!(matches!(err, FeedpostError::Render(_)));
        assert!(f.transport.sent().is_empty());
        assert_eq!(seen(&f), 0);
    }

    #[tokio::test]
    async fn test_rate_limit_denies_second_send() {
        let f = fixture(1, false);
        let coordinator = coordinator(&f, Arc::new(DigestRenderer::new()));

        coordinator.deliver(&f.subscription, &f.digest).await.unwrap();
        let err = coordinator
            .deliver(&f.subscription, &f.digest)
            .await
            .unwrap_err();

        assert!(matches!(err, FeedpostError::RateLimited(ref r) if r == "alice@example.com"));
        assert_eq!(f.transport.sent().len(), 1);
        assert_eq!(f.store.send_records(f.subscription.id).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_inline_threshold_forces_summary() {
        let over = fixture(6, true);
        coordinator(&over, Arc::new(DigestRenderer::new()))
            .deliver(&over.subscription, &over.digest)
            .await
            .unwrap();
        assert!(!over.transport.sent()[0].digest.text.contains("Body of"));

        let under = fixture(2, true);
        coordinator(&under, Arc::new(DigestRenderer::new()))
            .deliver(&under.subscription, &under.digest)
            .await
            .unwrap();
        assert!(under.transport.sent()[0].digest.text.contains("Body of p0"));
    }

    #[tokio::test]
    async fn test_tracking_can_be_disabled() {
        let f = fixture(1, false);
        coordinator(&f, Arc::new(DigestRenderer::new()))
            .with_tracking(false)
            .deliver(&f.subscription, &f.digest)
            .await
            .unwrap();

        assert!(f.transport.sent()[0].tracking_token.is_none());
        let records = f.store.send_records(f.subscription.id).unwrap();
        assert!(records[0].tracking_token.is_none());
    }

    #[test]
    fn test_dropped_stage_writes_nothing() {
        let f = fixture(2, false);
        let pending = PendingDelivery::stage(
            &f.digest,
            NewSendRecord {
                subscription_id: f.subscription.id,
                recipient: "alice@example.com".into(),
                subject: "s".into(),
                tracking_token: None,
            },
        );
        assert_eq!(pending.marks().len(), 2);
        drop(pending);
        assert_eq!(seen(&f), 0);
    }
}
