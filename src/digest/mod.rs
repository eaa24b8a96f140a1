//! Turns a subscription's fetch results into the set of not-yet-notified
//! items, grouped by source.

use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};

use crate::domain::FetchedItem;
use crate::fetcher::FetchResult;
use crate::store::{DedupLedger, SeenMark};

pub const DEFAULT_MAX_ITEM_AGE_DAYS: i64 = 90;

/// How item bodies are presented in the notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentMode {
    /// Titles and links only.
    Summary,
    /// Full item content in the message body.
    Inline,
}

impl ContentMode {
    /// Inline is honored only up to `threshold` new items.
    pub fn decide(prefers_inline: bool, new_items: usize, threshold: usize) -> Self {
        if prefers_inline && new_items <= threshold {
            ContentMode::Inline
        } else {
            ContentMode::Summary
        }
    }
}

#[derive(Debug, Clone)]
pub struct DigestGroup {
    pub source_id: i64,
    pub source_name: String,
    pub source_url: String,
    pub items: Vec<FetchedItem>,
}

#[derive(Debug, Clone, Default)]
pub struct Digest {
    /// Sources with at least one new item, in source order.
    pub groups: Vec<DigestGroup>,
    /// Every in-age item from every usable source, new or not. These are
    /// written to the ledger when the digest is delivered.
    pub marks: Vec<SeenMark>,
    /// Sources whose ledger lookup failed; their items are left out entirely.
    pub skipped_sources: Vec<i64>,
}

impl Digest {
    pub fn new_item_count(&self) -> usize {
        self.groups.iter().map(|g| g.items.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct DigestAssembler {
    max_item_age: Duration,
}

impl Default for DigestAssembler {
    fn default() -> Self {
        Self::new(Duration::days(DEFAULT_MAX_ITEM_AGE_DAYS))
    }
}

impl DigestAssembler {
    pub fn new(max_item_age: Duration) -> Self {
        Self { max_item_age }
    }

    pub fn assemble<L>(&self, ledger: &L, results: &[FetchResult], now: DateTime<Utc>) -> Digest
    where
        L: DedupLedger + ?Sized,
    {
        let cutoff = now - self.max_item_age;
        let mut digest = Digest::default();

        for result in results {
            let Ok(feed) = &result.outcome else {
                continue;
            };

            let mut unique = HashSet::new();
            let candidates: Vec<&FetchedItem> = feed
                .items
                .iter()
                .filter(|item| !item.is_older_than(cutoff))
                .filter(|item| unique.insert(item.guid.as_str()))
                .collect();
            if candidates.is_empty() {
                continue;
            }

            let guids: Vec<String> = candidates.iter().map(|i| i.guid.clone()).collect();
            let seen = match ledger.batch_seen(result.source_id, &guids) {
                Ok(seen) => seen,
                Err(e) => {
                    tracing::warn!(
                        "Skipping source {} ({}): dedup lookup failed: {}",
                        result.source_id,
                        result.source_url,
                        e
                    );
                    digest.skipped_sources.push(result.source_id);
                    continue;
                }
            };

            let new_items: Vec<FetchedItem> = candidates
                .iter()
                .filter(|item| !seen.contains(&item.guid))
                .map(|item| (*item).clone())
                .collect();

            digest
                .marks
                .extend(candidates.iter().map(|item| SeenMark {
                    source_id: result.source_id,
                    guid: item.guid.clone(),
                    title: item.title.clone(),
                    link: item.link.clone(),
                }));

            if !new_items.is_empty() {
                tracing::debug!(
                    "{} new of {} items from {}",
                    new_items.len(),
                    candidates.len(),
                    result.source_url
                );
                digest.groups.push(DigestGroup {
                    source_id: result.source_id,
                    source_name: result.display_name().to_string(),
                    source_url: result.source_url.clone(),
                    items: new_items,
                });
            }
        }

        digest
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::{FeedpostError, Result};
    use crate::domain::{NewSource, NewSubscription, SeenItem};
    use crate::fetcher::{FetchError, FetchedFeed};
    use crate::store::{SourceStore, SqliteStore, SubscriptionStore};

    fn item(guid: &str, published_at: Option<DateTime<Utc>>) -> FetchedItem {
        FetchedItem {
            published_at,
            title: Some(format!("Title {guid}")),
            ..FetchedItem::new(guid)
        }
    }

    fn ok(source_id: i64, items: Vec<FetchedItem>) -> FetchResult {
        FetchResult {
            source_id,
            source_url: format!("https://feeds.test/{source_id}"),
            source_name: None,
            outcome: Ok(FetchedFeed {
                items,
                ..Default::default()
            }),
        }
    }

    fn store_with_sources(n: usize) -> (SqliteStore, Vec<i64>) {
        let store = SqliteStore::in_memory().unwrap();
        let sub = store
            .create_subscription(&NewSubscription::new("a", "a@example.com", "0 8 * * *"))
            .unwrap();
        let ids = (0..n)
            .map(|i| {
                store
                    .add_source(sub, &NewSource::new(&format!("https://feeds.test/{i}")))
                    .unwrap()
            })
            .collect();
        (store, ids)
    }

    #[test]
    fn test_content_mode_threshold() {
        assert_eq!(ContentMode::decide(true, 6, 5), ContentMode::Summary);
        assert_eq!(ContentMode::decide(true, 5, 5), ContentMode::Inline);
        assert_eq!(ContentMode::decide(false, 1, 5), ContentMode::Summary);
    }

    #[test]
    fn test_groups_only_unseen_items() {
        let (store, ids) = store_with_sources(2);
        store.mark_seen(ids[1], "b-old", None, None).unwrap();

        let results = vec![
            ok(ids[0], vec![item("a1", None), item("a2", None), item("a3", None)]),
            ok(ids[1], vec![item("b-old", None)]),
        ];
        let digest = DigestAssembler::default().assemble(&store, &results, Utc::now());

        assert_eq!(digest.new_item_count(), 3);
        assert_eq!(digest.groups.len(), 1);
        assert_eq!(digest.groups[0].source_id, ids[0]);
        // Already-seen items are still re-marked.
        assert_eq!(digest.marks.len(), 4);
    }

    #[test]
    fn test_old_items_are_neither_reported_nor_marked() {
        let (store, ids) = store_with_sources(1);
        let now = Utc::now();
        let results = vec![ok(
            ids[0],
            vec![
                item("ancient", Some(now - Duration::days(120))),
                item("recent", Some(now - Duration::days(2))),
                item("undated", None),
            ],
        )];

        let digest = DigestAssembler::default().assemble(&store, &results, now);
        let reported: Vec<_> = digest.groups[0].items.iter().map(|i| &i.guid).collect();
        assert_eq!(reported, vec!["recent", "undated"]);
        assert!(digest.marks.iter().all(|m| m.guid != "ancient"));
    }

    #[test]
    fn test_failed_sources_and_duplicate_guids() {
        let (store, ids) = store_with_sources(1);
        let results = vec![
            FetchResult {
                source_id: 99,
                source_url: "https://down.test/".into(),
                source_name: None,
                outcome: Err(FetchError::Status(502)),
            },
            ok(ids[0], vec![item("x", None), item("x", None)]),
        ];

        let digest = DigestAssembler::default().assemble(&store, &results, Utc::now());
        assert_eq!(digest.new_item_count(), 1);
        assert_eq!(digest.marks.len(), 1);
    }

    struct BrokenLedger;

    impl DedupLedger for BrokenLedger {
        fn batch_seen(&self, source_id: i64, _guids: &[String]) -> Result<HashSet<String>> {
            if source_id == 2 {
                Err(FeedpostError::Other("disk I/O error".into()))
            } else {
                Ok(HashSet::new())
            }
        }

        fn mark_seen(&self, _: i64, _: &str, _: Option<&str>, _: Option<&str>) -> Result<()> {
            Ok(())
        }

        fn mark_seen_batch(&self, marks: &[SeenMark]) -> Result<usize> {
            Ok(marks.len())
        }

        fn commit_delivery(
            &self,
            _marks: &[SeenMark],
            _record: &crate::domain::NewSendRecord,
        ) -> Result<i64> {
            Ok(1)
        }

        fn recent_seen(&self, _: i64, _: usize) -> Result<Vec<SeenItem>> {
            Ok(Vec::new())
        }

        fn prune_seen(&self, _: Duration) -> Result<usize> {
            Ok(0)
        }
    }

    #[test]
    fn test_lookup_failure_skips_only_that_source() {
        let results = vec![ok(1, vec![item("a", None)]), ok(2, vec![item("b", None)])];
        let digest = DigestAssembler::default().assemble(&BrokenLedger, &results, Utc::now());

        assert_eq!(digest.new_item_count(), 1);
        assert_eq!(digest.skipped_sources, vec![2]);
        assert!(digest.marks.iter().all(|m| m.source_id == 1));
    }
}
