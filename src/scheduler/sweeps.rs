use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use crate::app::Result;
use crate::config::EngineConfig;
use crate::domain::LogLevel;
use crate::store::Store;

/// Retention and inactivity thresholds for the maintenance sweeps.
#[derive(Debug, Clone)]
pub struct SweepSettings {
    pub seen_retention: Duration,
    pub send_retention: Duration,
    pub inactivity: Duration,
    pub min_sends: usize,
}

impl Default for SweepSettings {
    fn default() -> Self {
        Self {
            seen_retention: Duration::days(180),
            send_retention: Duration::days(180),
            inactivity: Duration::days(90),
            min_sends: 3,
        }
    }
}

impl SweepSettings {
    pub fn from_config(engine: &EngineConfig) -> Self {
        let defaults = Self::default();
        Self {
            seen_retention: to_chrono(engine.seen_retention, defaults.seen_retention),
            send_retention: to_chrono(engine.send_retention, defaults.send_retention),
            inactivity: to_chrono(engine.inactivity_threshold, defaults.inactivity),
            min_sends: engine.min_sends_before_deactivation,
        }
    }
}

pub(crate) fn to_chrono(value: std::time::Duration, fallback: Duration) -> Duration {
    Duration::from_std(value).unwrap_or(fallback)
}

pub struct Sweeper {
    store: Arc<dyn Store>,
    settings: SweepSettings,
}

impl Sweeper {
    pub fn new(store: Arc<dyn Store>, settings: SweepSettings) -> Self {
        Self { store, settings }
    }

    pub fn prune_seen(&self) -> Result<usize> {
        let deleted = self.store.prune_seen(self.settings.seen_retention)?;
        tracing::info!("Pruned {} seen items", deleted);
        Ok(deleted)
    }

    pub fn prune_sends(&self) -> Result<usize> {
        let deleted = self.store.prune_sends(self.settings.send_retention)?;
        tracing::info!("Pruned {} send records", deleted);
        Ok(deleted)
    }

    /// Both retention sweeps; a failure in one does not skip the other.
    pub fn cleanup(&self) {
        if let Err(e) = self.prune_seen() {
            tracing::error!("Seen-item pruning failed: {}", e);
        }
        if let Err(e) = self.prune_sends() {
            tracing::error!("Send-record pruning failed: {}", e);
        }
    }

    /// Deactivate subscriptions that keep receiving digests but never engage.
    /// Returns the ids that were deactivated.
    pub fn deactivate_inactive(&self, now: DateTime<Utc>) -> Result<Vec<i64>> {
        let candidates =
            self.store
                .list_inactive(self.settings.inactivity, self.settings.min_sends, now)?;
        let days = self.settings.inactivity.num_days();

        let mut deactivated = Vec::with_capacity(candidates.len());
        for id in candidates {
            let result = self.store.update_next_run(id, None).and_then(|_| {
                self.store.append_log(
                    id,
                    LogLevel::Info,
                    &format!(
                        "Deactivated after {} days without engagement; re-activate to resume",
                        days
                    ),
                )
            });
            match result {
                Ok(()) => deactivated.push(id),
                Err(e) => tracing::error!("Failed to deactivate subscription {}: {}", id, e),
            }
        }

        if !deactivated.is_empty() {
            tracing::info!("Deactivated {} inactive subscriptions", deactivated.len());
        }
        Ok(deactivated)
    }
}
