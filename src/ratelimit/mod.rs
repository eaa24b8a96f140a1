//! Per-key token buckets for outgoing sends.
//!
//! Buckets are created lazily on the first [`RateLimiter::allow`] for a key.
//! The map lock is only held to find or insert a bucket; the admission
//! decision itself runs on the bucket, so distinct keys never serialize.

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use governor::clock::DefaultClock;
use governor::middleware::NoOpMiddleware;
use governor::state::{InMemoryState, NotKeyed};
use governor::Quota;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::app::{FeedpostError, Result};

type DirectLimiter = governor::RateLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>;

struct Bucket {
    limiter: DirectLimiter,
    /// Milliseconds since the owning limiter's epoch.
    last_seen: AtomicU64,
}

pub struct RateLimiter {
    quota: Quota,
    sweep_interval: Duration,
    epoch: Instant,
    buckets: RwLock<HashMap<String, Arc<Bucket>>>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("quota", &self.quota)
            .field("sweep_interval", &self.sweep_interval)
            .field("buckets", &"<HashMap>")
            .finish()
    }
}

impl RateLimiter {
    /// `rate` is tokens per second; `burst` is the bucket capacity.
    pub fn new(rate: f64, burst: u32, sweep_interval: Duration) -> Result<Self> {
        if !(rate.is_finite() && rate > 0.0) {
            return Err(FeedpostError::Config(format!(
                "rate limit must be a positive number, got {}",
                rate
            )));
        }

        let period = Duration::try_from_secs_f64(1.0 / rate).map_err(|_| {
            FeedpostError::Config(format!("rate limit {} is too low", rate))
        })?;
        let burst = NonZeroU32::new(burst.max(1)).unwrap_or(NonZeroU32::MIN);
        let quota = Quota::with_period(period)
            .ok_or_else(|| FeedpostError::Config(format!("rate limit {} is too high", rate)))?
            .allow_burst(burst);

        Ok(Self {
            quota,
            sweep_interval,
            epoch: Instant::now(),
            buckets: RwLock::new(HashMap::new()),
        })
    }

    /// Consume one token for `key` if available.
    pub async fn allow(&self, key: &str) -> bool {
        let bucket = self.bucket(key).await;
        bucket.last_seen.store(self.now_millis(), Ordering::Relaxed);
        bucket.limiter.check().is_ok()
    }

    async fn bucket(&self, key: &str) -> Arc<Bucket> {
        {
            let buckets = self.buckets.read().await;
            if let Some(bucket) = buckets.get(key) {
                return Arc::clone(bucket);
            }
        }

        let mut buckets = self.buckets.write().await;
        if let Some(bucket) = buckets.get(key) {
            return Arc::clone(bucket);
        }

        let bucket = Arc::new(Bucket {
            limiter: governor::RateLimiter::direct(self.quota),
            last_seen: AtomicU64::new(self.now_millis()),
        });
        buckets.insert(key.to_string(), Arc::clone(&bucket));
        bucket
    }

    /// Drop buckets untouched for more than twice the sweep interval.
    /// Returns how many were evicted.
    pub async fn sweep(&self) -> usize {
        let idle_limit = (self.sweep_interval * 2).as_millis() as u64;
        let now = self.now_millis();

        let mut buckets = self.buckets.write().await;
        let before = buckets.len();
        buckets.retain(|_, bucket| {
            now.saturating_sub(bucket.last_seen.load(Ordering::Relaxed)) <= idle_limit
        });
        before - buckets.len()
    }

    pub async fn len(&self) -> usize {
        self.buckets.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.buckets.read().await.is_empty()
    }

    /// Run [`Self::sweep`] every sweep interval until `cancel` fires.
    pub fn spawn_sweeper(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.sweep_interval);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let evicted = self.sweep().await;
                        if evicted > 0 {
                            tracing::debug!("Evicted {} idle rate-limit buckets", evicted);
                        }
                    }
                }
            }
        })
    }

    fn now_millis(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bucket_refills_over_time() {
        let limiter = RateLimiter::new(1.0, 1, Duration::from_secs(300)).unwrap();

        assert!(limiter.allow("alice@example.com").await);
        assert!(!limiter.allow("alice@example.com").await);

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert!(limiter.allow("alice@example.com").await);
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let limiter = RateLimiter::new(1.0, 1, Duration::from_secs(300)).unwrap();

        assert!(limiter.allow("a@example.com").await);
        assert!(!limiter.allow("a@example.com").await);
        assert!(limiter.allow("b@example.com").await);
        assert_eq!(limiter.len().await, 2);
    }

    #[tokio::test]
    async fn test_burst_allows_multiple() {
        let limiter = RateLimiter::new(0.1, 3, Duration::from_secs(300)).unwrap();
        for _ in 0..3 {
            assert!(limiter.allow("k").await);
        }
        assert!(!limiter.allow("k").await);
    }

    #[tokio::test]
    async fn test_sweep_evicts_idle_buckets() {
        let limiter = RateLimiter::new(1.0, 1, Duration::from_millis(20)).unwrap();
        limiter.allow("idle").await;

        tokio::time::sleep(Duration::from_millis(60)).await;
        limiter.allow("active").await;

        assert_eq!(limiter.sweep().await, 1);
        assert_eq!(limiter.len().await, 1);
        // A fresh bucket is created on the next use.
        assert!(limiter.allow("idle").await);
    }

    #[test]
    fn test_rejects_non_positive_rate() {
        assert!(RateLimiter::new(0.0, 1, Duration::from_secs(1)).is_err());
        assert!(RateLimiter::new(f64::NAN, 1, Duration::from_secs(1)).is_err());
    }

    #[test]
    fn test_rejects_rate_with_unrepresentable_period() {
        let err = RateLimiter::new(1e-300, 1, Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, FeedpostError::Config(ref m) if m.contains("too low")));
    }
}
