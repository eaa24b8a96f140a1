//! Configuration for the digest engine.
//!
//! Read from `~/.config/feedpost/config.toml` (or an explicit path), then
//! overridden by `FEEDPOST_*` environment variables. Every section is
//! optional; missing fields take their defaults.

pub mod interval;

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

pub use interval::{format_interval, parse_interval};

/// Main configuration struct.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Defaults to `feedpost.db` under the platform data directory.
    pub database_path: Option<PathBuf>,
    /// Public base URL for dashboard, unsubscribe and tracking links.
    pub origin: String,
    pub engine: EngineConfig,
    pub rate_limit: RateLimitConfig,
    pub smtp: SmtpConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: None,
            origin: "http://localhost:8080".into(),
            engine: EngineConfig::default(),
            rate_limit: RateLimitConfig::default(),
            smtp: SmtpConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub fetch_concurrency: usize,
    #[serde(deserialize_with = "interval::deserialize")]
    pub fetch_timeout: Duration,
    #[serde(deserialize_with = "interval::deserialize")]
    pub max_item_age: Duration,
    #[serde(deserialize_with = "interval::deserialize")]
    pub seen_retention: Duration,
    #[serde(deserialize_with = "interval::deserialize")]
    pub send_retention: Duration,
    /// Default for new subscriptions; above it inline content is forced off.
    pub inline_threshold: usize,
    #[serde(deserialize_with = "interval::deserialize")]
    pub tick_interval: Duration,
    #[serde(deserialize_with = "interval::deserialize")]
    pub cleanup_interval: Duration,
    #[serde(deserialize_with = "interval::deserialize")]
    pub engagement_interval: Duration,
    #[serde(deserialize_with = "interval::deserialize")]
    pub inactivity_threshold: Duration,
    pub min_sends_before_deactivation: usize,
    pub tracking: bool,
}

const DAY: u64 = 86400;

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            fetch_concurrency: 30,
            fetch_timeout: Duration::from_secs(15),
            max_item_age: Duration::from_secs(90 * DAY),
            seen_retention: Duration::from_secs(180 * DAY),
            send_retention: Duration::from_secs(180 * DAY),
            inline_threshold: 5,
            tick_interval: Duration::from_secs(60),
            cleanup_interval: Duration::from_secs(DAY),
            engagement_interval: Duration::from_secs(7 * DAY),
            inactivity_threshold: Duration::from_secs(90 * DAY),
            min_sends_before_deactivation: 3,
            tracking: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Sends allowed per recipient per minute, fractional values allowed.
    pub sends_per_minute: f64,
    pub burst: u32,
    #[serde(deserialize_with = "interval::deserialize")]
    pub sweep_interval: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            sends_per_minute: 1.0,
            burst: 1,
            sweep_interval: Duration::from_secs(300),
        }
    }
}

impl RateLimitConfig {
    /// Refill rate in tokens per second.
    pub fn rate_per_second(&self) -> f64 {
        self.sends_per_minute / 60.0
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub from: String,
    pub user: Option<String>,
    pub pass: Option<String>,
    /// PEM; literal `\n` sequences are accepted for single-line values.
    pub dkim_private_key: Option<String>,
    pub dkim_private_key_file: Option<PathBuf>,
    pub dkim_selector: Option<String>,
    pub dkim_domain: Option<String>,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 587,
            from: "Feedpost <digest@localhost>".into(),
            user: None,
            pass: None,
            dkim_private_key: None,
            dkim_private_key_file: None,
            dkim_selector: None,
            dkim_domain: None,
        }
    }
}

impl Config {
    /// Load from `path`, or the default path when `None`. A missing file
    /// yields the defaults. Environment overrides are applied afterwards.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config_path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::default_config_path()?,
        };

        let mut config = if config_path.exists() {
            let content = fs::read_to_string(&config_path).map_err(|e| ConfigError::Io {
                path: config_path.clone(),
                source: e,
            })?;
            toml::from_str(&content).map_err(|e| ConfigError::Parse {
                path: config_path,
                source: e,
            })?
        } else {
            tracing::debug!("No config at {}, using defaults", config_path.display());
            Config::default()
        };

        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Get the default config file path: `~/.config/feedpost/config.toml`
    pub fn default_config_path() -> Result<PathBuf, ConfigError> {
        let config_dir = dirs::config_dir().ok_or(ConfigError::NoConfigDir)?;
        Ok(config_dir.join("feedpost").join("config.toml"))
    }

    /// Apply `FEEDPOST_*` overrides using `lookup` to read variables.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("FEEDPOST_DB_PATH") {
            self.database_path = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("FEEDPOST_ORIGIN") {
            self.origin = v;
        }
        if let Some(v) = lookup("FEEDPOST_SMTP_HOST") {
            self.smtp.host = v;
        }
        if let Some(v) = lookup("FEEDPOST_SMTP_PORT") {
            self.smtp.port = v
                .parse()
                .map_err(|_| ConfigError::Invalid(format!("FEEDPOST_SMTP_PORT: {}", v)))?;
        }
        if let Some(v) = lookup("FEEDPOST_SMTP_USER") {
            self.smtp.user = Some(v);
        }
        if let Some(v) = lookup("FEEDPOST_SMTP_PASS") {
            self.smtp.pass = Some(v);
        }
        if let Some(v) = lookup("FEEDPOST_SMTP_FROM") {
            self.smtp.from = v;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        url::Url::parse(&self.origin)
            .map_err(|e| ConfigError::Invalid(format!("origin {}: {}", self.origin, e)))?;

        if self.engine.fetch_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "engine.fetch_concurrency must be at least 1".into(),
            ));
        }
        for (name, value) in [
            ("engine.fetch_timeout", self.engine.fetch_timeout),
            ("engine.tick_interval", self.engine.tick_interval),
            ("engine.cleanup_interval", self.engine.cleanup_interval),
            ("engine.engagement_interval", self.engine.engagement_interval),
            ("rate_limit.sweep_interval", self.rate_limit.sweep_interval),
        ] {
            if value.is_zero() {
                return Err(ConfigError::Invalid(format!("{} must be non-zero", name)));
            }
        }
        if !(self.rate_limit.sends_per_minute.is_finite() && self.rate_limit.sends_per_minute > 0.0)
        {
            return Err(ConfigError::Invalid(
                "rate_limit.sends_per_minute must be positive".into(),
            ));
        }
        if Duration::try_from_secs_f64(1.0 / self.rate_limit.rate_per_second()).is_err() {
            return Err(ConfigError::Invalid(format!(
                "rate_limit.sends_per_minute {} is too low",
                self.rate_limit.sends_per_minute
            )));
        }

        Ok(())
    }

    /// Write the commented default configuration to `path`. Never overwrites.
    pub fn init(path: Option<&Path>) -> Result<PathBuf, ConfigError> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::default_config_path()?,
        };
        if path.exists() {
            return Err(ConfigError::AlreadyExists(path));
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| ConfigError::Io {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        let mut file = fs::File::create(&path).map_err(|e| ConfigError::Io {
            path: path.clone(),
            source: e,
        })?;
        file.write_all(Self::default_config_content().as_bytes())
            .map_err(|e| ConfigError::Io {
                path: path.clone(),
                source: e,
            })?;

        Ok(path)
    }

    /// Generate the default config file content with comments.
    fn default_config_content() -> String {
        r##"# Feedpost configuration
#
# Intervals accept "90s", "30m", "6h", "7d" or a number of seconds.
# Environment variables FEEDPOST_DB_PATH, FEEDPOST_ORIGIN, FEEDPOST_SMTP_HOST,
# FEEDPOST_SMTP_PORT, FEEDPOST_SMTP_USER, FEEDPOST_SMTP_PASS and
# FEEDPOST_SMTP_FROM override the values below.

# database_path = "/var/lib/feedpost/feedpost.db"

# Public base URL used in dashboard, unsubscribe and tracking links
origin = "http://localhost:8080"

[engine]
fetch_concurrency = 30
fetch_timeout = "15s"

# Items published longer ago than this are ignored
max_item_age = "90d"

# How long delivered items and send records are kept
seen_retention = "180d"
send_retention = "180d"

# Above this many new items a digest never inlines content
inline_threshold = 5

tick_interval = "60s"
cleanup_interval = "24h"
engagement_interval = "7d"

# Subscriptions with no opens for this long are deactivated once they have
# received at least min_sends_before_deactivation digests
inactivity_threshold = "90d"
min_sends_before_deactivation = 3

# Embed a tracking pixel and keep-alive link in each digest
tracking = true

[rate_limit]
sends_per_minute = 1
burst = 1
sweep_interval = "5m"

[smtp]
host = "localhost"
port = 587
from = "Feedpost <digest@localhost>"
# user = ""
# pass = ""

# DKIM signing; set all three or none
# dkim_private_key_file = "/etc/feedpost/dkim.pem"
# dkim_selector = "feedpost"
# dkim_domain = "example.com"
"##
        .to_string()
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Could not determine config directory")]
    NoConfigDir,

    #[error("Failed to read/write config file at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file at {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Config file already exists at {0}")]
    AlreadyExists(PathBuf),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
