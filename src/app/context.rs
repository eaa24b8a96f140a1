use std::path::PathBuf;
use std::sync::Arc;

use chrono::Duration;

use crate::app::error::{FeedpostError, Result};
use crate::config::Config;
use crate::coordinator::SendCoordinator;
use crate::digest::DigestAssembler;
use crate::fetcher::engine::FetchEngine;
use crate::fetcher::http_fetcher::HttpFetcher;
use crate::fetcher::Fetcher;
use crate::notify::{DigestRenderer, Links, SmtpTransport, TransportMode};
use crate::ratelimit::RateLimiter;
use crate::scheduler::sweeps::to_chrono;
use crate::scheduler::{Pipeline, Scheduler, SchedulerConfig, SweepSettings, Sweeper};
use crate::store::sqlite::SqliteStore;

pub struct AppContext {
    pub config: Config,
    pub store: Arc<SqliteStore>,
    /// Shared by the send path and the scheduler's idle-bucket sweeper.
    pub limiter: Arc<RateLimiter>,
}

impl AppContext {
    pub fn new(config: Config) -> Result<Self> {
        let db_path = match &config.database_path {
            Some(p) => p.clone(),
            None => Self::default_db_path()?,
        };
        let store = Arc::new(SqliteStore::new(&db_path)?);
        Self::with_store(config, store)
    }

    pub fn in_memory(config: Config) -> Result<Self> {
        let store = Arc::new(SqliteStore::in_memory()?);
        Self::with_store(config, store)
    }

    fn with_store(config: Config, store: Arc<SqliteStore>) -> Result<Self> {
        let limiter = Arc::new(RateLimiter::new(
            config.rate_limit.rate_per_second(),
            config.rate_limit.burst,
            config.rate_limit.sweep_interval,
        )?);
        Ok(Self {
            config,
            store,
            limiter,
        })
    }

    pub fn links(&self) -> Result<Links> {
        Links::new(&self.config.origin)
    }

    pub fn fetch_engine(&self) -> Result<FetchEngine> {
        let fetcher: Arc<dyn Fetcher + Send + Sync> =
            Arc::new(HttpFetcher::new(self.config.engine.fetch_timeout)?);
        Ok(FetchEngine::with_limits(
            fetcher,
            self.config.engine.fetch_concurrency,
            self.config.engine.fetch_timeout,
        ))
    }

    /// Wire fetcher, assembler, renderer and SMTP transport into a pipeline.
    pub fn pipeline(&self) -> Result<Arc<Pipeline>> {
        let links = self.links()?;
        let mode = TransportMode::from_config(&self.config.smtp)?;
        let transport = Arc::new(SmtpTransport::new(
            &self.config.smtp,
            mode,
            links.clone(),
        )?);

        let coordinator = SendCoordinator::new(
            self.store.clone(),
            self.limiter.clone(),
            Arc::new(DigestRenderer::new()),
            transport,
            links,
        )
        .with_tracking(self.config.engine.tracking);

        let assembler = DigestAssembler::new(to_chrono(
            self.config.engine.max_item_age,
            Duration::days(crate::digest::DEFAULT_MAX_ITEM_AGE_DAYS),
        ));

        Ok(Arc::new(Pipeline::new(
            self.store.clone(),
            self.fetch_engine()?,
            assembler,
            coordinator,
        )))
    }

    pub fn sweeper(&self) -> Sweeper {
        Sweeper::new(
            self.store.clone(),
            SweepSettings::from_config(&self.config.engine),
        )
    }

    pub fn scheduler(&self) -> Result<Arc<Scheduler>> {
        Ok(Arc::new(Scheduler::new(
            self.store.clone(),
            self.pipeline()?,
            self.sweeper(),
            self.limiter.clone(),
            SchedulerConfig::from_config(&self.config.engine),
        )))
    }

    fn default_db_path() -> Result<PathBuf> {
        let data_dir = dirs::data_dir()
            .ok_or_else(|| FeedpostError::Config("Could not find data directory".into()))?;
        let feedpost_dir = data_dir.join("feedpost");
        std::fs::create_dir_all(&feedpost_dir)?;
        Ok(feedpost_dir.join("feedpost.db"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SubscriptionStore;

    #[tokio::test]
    async fn test_in_memory_context_wires_scheduler() {
        let ctx = AppContext::in_memory(Config::default()).unwrap();
        assert!(ctx.store.list_subscriptions().unwrap().is_empty());

        let scheduler = ctx.scheduler().unwrap();
        assert!(!scheduler.is_running().await);
    }

    #[test]
    fn test_bad_smtp_config_rejected() {
        let mut config = Config::default();
        config.smtp.user = Some("only-user".into());
        let ctx = AppContext::in_memory(config).unwrap();
        assert!(matches!(ctx.pipeline(), Err(FeedpostError::Config(_))));
    }

    #[test]
    fn test_tiny_send_rate_is_a_config_error() {
        let mut config = Config::default();
        config.rate_limit.sends_per_minute = 1e-300;
        assert!(config.validate().is_err());
        assert!(matches!(
            AppContext::in_memory(config),
            Err(FeedpostError::Config(_))
        ));
    }

    #[test]
    fn test_file_backed_store() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            database_path: Some(dir.path().join("feedpost.db")),
            ..Config::default()
        };
        let ctx = AppContext::new(config).unwrap();
        assert!(ctx.store.list_subscriptions().unwrap().is_empty());
        assert!(dir.path().join("feedpost.db").exists());
    }
}
