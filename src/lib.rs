//! # Feedpost
//!
//! A scheduled RSS/Atom digest engine: it polls a subscription's feeds on a
//! cron schedule and emails only the items the subscriber has not seen yet.
//!
//! ## Architecture
//!
//! Every due subscription goes through one pipeline run:
//!
//! ```text
//! Scheduler → FetchEngine → DigestAssembler → SendCoordinator → Store
//!               (collect)       (dedupe)        (render, send)   (commit)
//! ```
//!
//! Items are marked seen only in the same transaction that records a
//! successful send, so a failed run leaves everything new for the next one.
//!
//! ## Quick Start
//!
//! ```bash
//! # Write a default config
//! feedpost init
//!
//! # Subscribe to two feeds, delivered every morning
//! feedpost subscribe --subscriber alice --recipient alice@example.com \
//!     --cron "0 8 * * *" https://blog.rust-lang.org/feed.xml https://lwn.net/headlines/rss
//!
//! # Run the scheduler
//! feedpost serve
//! ```

/// Application context and error handling.
///
/// The [`AppContext`](app::AppContext) struct wires together all components:
/// store, fetch engine, rate limiter, renderer and SMTP transport.
pub mod app;

/// Command-line interface using clap.
///
/// - `serve` - Run the scheduler until interrupted
/// - `run <id>` - Run one subscription now
/// - `status` - List subscriptions and their schedule
/// - `subscribe` - Create, pre-seed and activate a subscription
/// - `activate` / `deactivate <id>` - Toggle scheduling
/// - `logs <id>` - Show a subscription's run log
/// - `prune` - Apply retention to seen items and send records
/// - `init [path]` - Write a default config file
pub mod cli;

/// Configuration loaded from `~/.config/feedpost/config.toml` with
/// `FEEDPOST_*` environment overrides.
pub mod config;

/// Rate-limited, staged delivery of a digest.
pub mod coordinator;

/// Digest assembly: age filtering and de-duplication against the ledger.
pub mod digest;

/// Core domain models.
///
/// - [`Subscription`](domain::Subscription): recipient, cron schedule, run times
/// - [`Source`](domain::Source): one feed URL with its cache validators
/// - [`SendRecord`](domain::SendRecord): one delivered digest
pub mod domain;

/// HTTP fetching with conditional request support.
///
/// - [`Fetcher`](fetcher::Fetcher): Async trait for feed fetching
/// - [`HttpFetcher`](fetcher::http_fetcher::HttpFetcher): reqwest-based implementation
/// - [`FetchEngine`](fetcher::engine::FetchEngine): Bounded concurrent fetching with per-source results
pub mod fetcher;

/// Feed parsing and normalization.
///
/// Converts RSS 0.9x/1.0/2.0, Atom 0.3/1.0, and JSON Feed 1.0
/// into [`FetchedItem`](domain::FetchedItem)s with stable GUIDs.
pub mod normalizer;

/// Digest rendering and the SMTP transport.
pub mod notify;

/// Per-recipient token-bucket rate limiting.
pub mod ratelimit;

/// The scheduling loop, the per-subscription pipeline and maintenance sweeps.
pub mod scheduler;

/// SQLite persistence layer.
///
/// - [`SubscriptionStore`](store::SubscriptionStore), [`SourceStore`](store::SourceStore),
///   [`DedupLedger`](store::DedupLedger), [`SendLog`](store::SendLog): storage traits
/// - [`SqliteStore`](store::SqliteStore): SQLite implementation
pub mod store;

#[cfg(test)]
mod test_support;
