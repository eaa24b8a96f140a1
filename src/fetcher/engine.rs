use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;

use crate::domain::Source;
use crate::fetcher::{FetchError, FetchResponse, FetchResult, FetchedFeed, Fetcher};
use crate::normalizer::Normalizer;

pub const DEFAULT_MAX_CONCURRENT: usize = 30;
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(15);

/// Fetches a subscription's sources concurrently.
///
/// Always returns one [`FetchResult`] per input source, in input order. A
/// failing source is reported in its own slot and never fails the batch.
#[derive(Clone)]
pub struct FetchEngine {
    fetcher: Arc<dyn Fetcher + Send + Sync>,
    normalizer: Normalizer,
    max_concurrent: usize,
    timeout: Duration,
}

impl FetchEngine {
    pub fn new(fetcher: Arc<dyn Fetcher + Send + Sync>) -> Self {
        Self::with_limits(fetcher, DEFAULT_MAX_CONCURRENT, DEFAULT_FETCH_TIMEOUT)
    }

    pub fn with_limits(
        fetcher: Arc<dyn Fetcher + Send + Sync>,
        max_concurrent: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            fetcher,
            normalizer: Normalizer::new(),
            max_concurrent: max_concurrent.max(1),
            timeout,
        }
    }

    /// Fetch every source. `progress`, when given, is bumped once per
    /// completed fetch regardless of outcome.
    pub async fn fetch_all(
        &self,
        sources: &[Source],
        progress: Option<Arc<AtomicUsize>>,
    ) -> Vec<FetchResult> {
        if sources.is_empty() {
            return Vec::new();
        }

        let permits = self.max_concurrent.min(sources.len());
        let semaphore = Arc::new(Semaphore::new(permits));
        let mut handles = Vec::with_capacity(sources.len());

        for source in sources {
            let source = source.clone();
            let fetcher = self.fetcher.clone();
            let normalizer = self.normalizer.clone();
            let semaphore = semaphore.clone();
            let progress = progress.clone();
            let timeout = self.timeout;

            let handle = tokio::spawn(async move {
                let outcome = match semaphore.acquire_owned().await {
                    Ok(_permit) => {
                        match tokio::time::timeout(
                            timeout,
                            fetch_single_source(&fetcher, &normalizer, &source),
                        )
                        .await
                        {
                            Ok(outcome) => outcome,
                            Err(_) => Err(FetchError::Timeout(timeout)),
                        }
                    }
                    Err(e) => Err(FetchError::Aborted(e.to_string())),
                };

                if let Some(progress) = progress {
                    progress.fetch_add(1, Ordering::Relaxed);
                }

                outcome
            });

            handles.push(handle);
        }

        let mut results = Vec::with_capacity(sources.len());
        for (source, handle) in sources.iter().zip(handles) {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::error!("Fetch task for {} failed to join: {}", source.url, e);
                    Err(FetchError::Aborted(e.to_string()))
                }
            };

            if let Err(ref e) = outcome {
                tracing::warn!("Source {} ({}) failed: {}", source.id, source.url, e);
            }

            results.push(FetchResult {
                source_id: source.id,
                source_url: source.url.clone(),
                source_name: source.name.clone(),
                outcome,
            });
        }

        results
    }
}

async fn fetch_single_source(
    fetcher: &Arc<dyn Fetcher + Send + Sync>,
    normalizer: &Normalizer,
    source: &Source,
) -> Result<FetchedFeed, FetchError> {
    let response = fetcher.fetch(&source.url, &source.validators()).await?;

    match response {
        FetchResponse::NotModified => {
            tracing::debug!("Source {} not modified", source.url);
            Ok(FetchedFeed {
                not_modified: true,
                ..Default::default()
            })
        }
        FetchResponse::Content { body, validators } => {
            let parsed = normalizer.normalize(&body)?;
            tracing::debug!("Fetched {} items from {}", parsed.items.len(), source.url);

            Ok(FetchedFeed {
                title: parsed.title,
                items: parsed.items,
                validators: (!validators.is_empty()).then_some(validators),
                not_modified: false,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::CacheValidators;
    use crate::test_support::{rss, source, ScriptedFetcher};

    #[tokio::test]
    async fn test_empty_source_list() {
        let engine = FetchEngine::new(Arc::new(ScriptedFetcher::new()));
        assert!(engine.fetch_all(&[], None).await.is_empty());
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded_and_results_positional() {
        let fetcher = Arc::new(ScriptedFetcher::new().with_jitter());
        let mut sources = Vec::new();
        for i in 0..50 {
            let url = format!("https://example.com/{}.xml", i);
            fetcher.serve(&url, rss(&[(&format!("item-{}", i), None)]), None);
            sources.push(source(i, &url));
        }

        let engine = FetchEngine::with_limits(fetcher.clone(), 10, Duration::from_secs(5));
        let progress = Arc::new(AtomicUsize::new(0));
        let results = engine.fetch_all(&sources, Some(progress.clone())).await;

        assert!(fetcher.max_in_flight() <= 10);
        assert!(fetcher.max_in_flight() > 1);
        assert_eq!(progress.load(Ordering::Relaxed), 50);
        assert_eq!(results.len(), 50);
        for (i, result) in results.iter().enumerate() {
            assert_eq!(result.source_id, i as i64);
            assert_eq!(result.items()[0].guid, format!("item-{}", i));
        }
    }

    #[tokio::test]
    async fn test_one_failure_does_not_affect_others() {
        let fetcher = Arc::new(ScriptedFetcher::new());
        fetcher.serve("https://a.test/feed", rss(&[("a1", None)]), None);
        fetcher.fail("https://b.test/feed", FetchError::Status(500));
        fetcher.serve("https://c.test/feed", b"<<<not a feed".to_vec(), None);

        let sources = vec![
            source(1, "https://a.test/feed"),
            source(2, "https://b.test/feed"),
            source(3, "https://c.test/feed"),
        ];
        let results = FetchEngine::new(fetcher).fetch_all(&sources, None).await;

        assert!(results[0].is_ok());
        assert_eq!(results[1].outcome.as_ref().unwrap_err(), &FetchError::Status(500));
        assert!(matches!(results[2].outcome, Err(FetchError::Parse(_))));
    }

    #[tokio::test]
    async fn test_timeout_is_reported_per_source() {
        let fetcher = Arc::new(ScriptedFetcher::new());
        fetcher.serve("https://fast.test/feed", rss(&[("f1", None)]), None);
        fetcher.serve("https://slow.test/feed", rss(&[("s1", None)]), None);
        fetcher.delay("https://slow.test/feed", Duration::from_millis(500));

        let sources = vec![
            source(1, "https://slow.test/feed"),
            source(2, "https://fast.test/feed"),
        ];
        let engine = FetchEngine::with_limits(fetcher, 5, Duration::from_millis(50));
        let results = engine.fetch_all(&sources, None).await;

        assert!(matches!(results[0].outcome, Err(FetchError::Timeout(_))));
        assert!(results[1].is_ok());
    }

    #[tokio::test]
    async fn test_conditional_fetch() {
        let fetcher = Arc::new(ScriptedFetcher::new());
        let current = CacheValidators {
            etag: Some("\"v2\"".into()),
            last_modified: None,
        };
        fetcher.serve(
            "https://example.com/feed.xml",
            rss(&[("fresh", None)]),
            Some(current.clone()),
        );

        let mut fresh = source(1, "https://example.com/feed.xml");
        fresh.etag = Some("\"v2\"".into());
        let mut stale = source(2, "https://example.com/feed.xml");
        stale.etag = Some("\"v1\"".into());

        let results = FetchEngine::new(fetcher)
            .fetch_all(&[fresh, stale], None)
            .await;

        let matched = results[0].outcome.as_ref().unwrap();
        assert!(matched.not_modified);
        assert!(matched.items.is_empty());
        assert!(matched.validators.is_none());

        let updated = results[1].outcome.as_ref().unwrap();
        assert!(!updated.not_modified);
        assert_eq!(updated.items.len(), 1);
        assert_eq!(updated.validators.as_ref(), Some(&current));
    }
}
