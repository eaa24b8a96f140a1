pub mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "feedpost")]
#[command(about = "Scheduled RSS/Atom digests delivered by email", long_about = None)]
pub struct Cli {
    /// Path to the config file (default: ~/.config/feedpost/config.toml)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the scheduler until Ctrl-C or SIGTERM
    Serve,
    /// Run one subscription now, regardless of its schedule
    Run {
        /// Subscription id
        id: i64,
    },
    /// List subscriptions with their last and next runs
    Status,
    /// Create a subscription, pre-seed its sources and activate it
    Subscribe {
        /// Owning subscriber handle
        #[arg(long)]
        subscriber: String,
        /// Email address digests are sent to
        #[arg(long)]
        recipient: String,
        /// Cron expression (e.g., "0 8 * * *")
        #[arg(long)]
        cron: String,
        /// Display name used in the subject line
        #[arg(long)]
        name: Option<String>,
        /// Include item content in the digest body
        #[arg(long)]
        inline: bool,
        /// Feed URLs
        #[arg(required = true)]
        urls: Vec<String>,
    },
    /// Schedule a subscription from now on
    Activate {
        /// Subscription id
        id: i64,
    },
    /// Stop scheduling a subscription
    Deactivate {
        /// Subscription id
        id: i64,
    },
    /// Show a subscription's run log
    Logs {
        /// Subscription id
        id: i64,
        /// Number of entries to show
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },
    /// Prune old seen items and send records
    Prune,
    /// Write a commented default config file
    Init {
        /// Destination (default: ~/.config/feedpost/config.toml)
        path: Option<PathBuf>,
    },
}
