//! Periodic driver for due subscriptions and maintenance sweeps.
//!
//! A [`Scheduler`] owns its loop: [`Scheduler::start`] spawns it and
//! [`Scheduler::stop`] cancels it and waits for the current unit of work to
//! finish. Every tick, subscription run and sweep is its own fault boundary;
//! errors and panics are logged and the loop carries on.

pub mod pipeline;
pub mod sweeps;

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::app::{FeedpostError, Result};
use crate::config::{format_interval, EngineConfig};
use crate::domain::{RunStats, ScheduleState};
use crate::ratelimit::RateLimiter;
use crate::store::Store;

pub use pipeline::Pipeline;
pub use sweeps::{SweepSettings, Sweeper};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub tick_interval: Duration,
    pub cleanup_interval: Duration,
    pub engagement_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(60),
            cleanup_interval: Duration::from_secs(86400),
            engagement_interval: Duration::from_secs(7 * 86400),
        }
    }
}

impl SchedulerConfig {
    pub fn from_config(engine: &EngineConfig) -> Self {
        Self {
            tick_interval: engine.tick_interval,
            cleanup_interval: engine.cleanup_interval,
            engagement_interval: engine.engagement_interval,
        }
    }
}

struct Running {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

pub struct Scheduler {
    store: Arc<dyn Store>,
    pipeline: Arc<Pipeline>,
    sweeper: Sweeper,
    limiter: Arc<RateLimiter>,
    config: SchedulerConfig,
    /// Per-subscription run locks so a manual run and a tick never overlap.
    locks: std::sync::Mutex<HashMap<i64, Arc<AsyncMutex<()>>>>,
    running: AsyncMutex<Option<Running>>,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn Store>,
        pipeline: Arc<Pipeline>,
        sweeper: Sweeper,
        limiter: Arc<RateLimiter>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            pipeline,
            sweeper,
            limiter,
            config,
            locks: std::sync::Mutex::new(HashMap::new()),
            running: AsyncMutex::new(None),
        }
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn sweeper(&self) -> &Sweeper {
        &self.sweeper
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Spawn the scheduling loop and the rate-limit sweeper.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(FeedpostError::Other("scheduler already running".into()));
        }

        let cancel = CancellationToken::new();
        let scheduler = Arc::clone(self);
        let loop_handle = tokio::spawn(scheduler.run_loop(cancel.child_token()));
        let sweep_handle = Arc::clone(&self.limiter).spawn_sweeper(cancel.child_token());

        *running = Some(Running {
            cancel,
            handles: vec![loop_handle, sweep_handle],
        });
        tracing::info!(
            "Scheduler started (tick every {})",
            format_interval(self.config.tick_interval)
        );
        Ok(())
    }

    /// Cancel the loop and wait for in-flight work to finish.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };

        running.cancel.cancel();
        for handle in running.handles {
            if let Err(e) = handle.await {
                tracing::error!("Scheduler task ended abnormally: {}", e);
            }
        }
        tracing::info!("Scheduler stopped");
    }

    async fn run_loop(self: Arc<Self>, cancel: CancellationToken) {
        guarded("startup cleanup", async { self.sweeper.cleanup() }).await;

        let mut tick = interval(self.config.tick_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut cleanup = interval_at(
            Instant::now() + self.config.cleanup_interval,
            self.config.cleanup_interval,
        );
        let mut engagement = interval_at(
            Instant::now() + self.config.engagement_interval,
            self.config.engagement_interval,
        );

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {
                    guarded("tick", async {
                        self.tick(&cancel).await;
                    })
                    .await;
                }
                _ = cleanup.tick() => {
                    guarded("cleanup", async { self.sweeper.cleanup() }).await;
                }
                _ = engagement.tick() => {
                    guarded("engagement sweep", async {
                        if let Err(e) = self.sweeper.deactivate_inactive(Utc::now()) {
                            tracing::error!("Engagement sweep failed: {}", e);
                        }
                    })
                    .await;
                }
            }
        }
    }

    /// Run every due subscription once. Stops early, between subscriptions,
    /// when `cancel` fires. Returns how many runs succeeded.
    pub async fn tick(&self, cancel: &CancellationToken) -> usize {
        let due = match self.store.list_due(Utc::now()) {
            Ok(due) => due,
            Err(e) => {
                tracing::error!("Failed to list due subscriptions: {}", e);
                return 0;
            }
        };
        if !due.is_empty() {
            tracing::debug!("{} subscriptions due", due.len());
        }

        let mut succeeded = 0;
        for subscription in due {
            if cancel.is_cancelled() {
                tracing::info!("Shutdown requested; leaving remaining subscriptions for later");
                break;
            }

            let id = subscription.id;
            let outcome = AssertUnwindSafe(self.run_if_due(id)).catch_unwind().await;
            match outcome {
                Ok(Ok(Some(_))) => succeeded += 1,
                Ok(Ok(None)) => tracing::debug!("Subscription {} no longer due", id),
                Ok(Err(e)) => tracing::error!("Subscription {} run failed: {}", id, e),
                Err(panic) => tracing::error!(
                    "Subscription {} run panicked: {}",
                    id,
                    panic_message(&*panic)
                ),
            }
        }
        succeeded
    }

    /// Run one subscription immediately, outside the tick cadence.
    pub async fn run_now(
        &self,
        subscription_id: i64,
        progress: Option<Arc<AtomicUsize>>,
    ) -> Result<RunStats> {
        let lock = self.lock_for(subscription_id);
        let result = self.run_now_locked(&lock, subscription_id, progress).await;
        self.release_lock(subscription_id, lock);
        result
    }

    async fn run_now_locked(
        &self,
        lock: &AsyncMutex<()>,
        subscription_id: i64,
        progress: Option<Arc<AtomicUsize>>,
    ) -> Result<RunStats> {
        let _guard = lock.lock().await;

        let subscription = self
            .store
            .get_subscription(subscription_id)?
            .ok_or(FeedpostError::SubscriptionNotFound(subscription_id))?;
        self.pipeline.run(&subscription, progress).await
    }

    /// Scheduled run. The subscription is re-read under its lock, so a manual
    /// run that finished in the meantime is not repeated.
    async fn run_if_due(&self, subscription_id: i64) -> Result<Option<RunStats>> {
        let lock = self.lock_for(subscription_id);
        let result = self.run_if_due_locked(&lock, subscription_id).await;
        self.release_lock(subscription_id, lock);
        result
    }

    async fn run_if_due_locked(
        &self,
        lock: &AsyncMutex<()>,
        subscription_id: i64,
    ) -> Result<Option<RunStats>> {
        let _guard = lock.lock().await;

        let Some(subscription) = self.store.get_subscription(subscription_id)? else {
            return Ok(None);
        };
        if subscription.state(Utc::now()) != ScheduleState::Due {
            return Ok(None);
        }
        self.pipeline.run(&subscription, None).await.map(Some)
    }

    fn lock_for(&self, id: i64) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(locks.entry(id).or_default())
    }

    /// Drop the map entry once no other run holds or waits on it.
    fn release_lock(&self, id: i64, lock: Arc<AsyncMutex<()>>) {
        drop(lock);
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        if locks.get(&id).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(&id);
        }
    }

    #[cfg(test)]
    fn tracked_locks(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// Await `work`, logging instead of propagating a panic.
async fn guarded<F>(name: &str, work: F)
where
    F: Future<Output = ()>,
{
    if let Err(panic) = AssertUnwindSafe(work).catch_unwind().await {
        tracing::error!("{} panicked: {}", name, panic_message(&*panic));
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".into()
    }
}
