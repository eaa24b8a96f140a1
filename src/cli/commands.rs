use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::app::{AppContext, FeedpostError, Result};
use crate::config::Config;
use crate::domain::{next_run_after, NewSource, NewSubscription, ScheduleState, Subscription};
use crate::store::{SourceStore, SubscriptionStore};

/// Run the scheduler until SIGINT or SIGTERM, then drain it.
pub async fn serve(ctx: &AppContext) -> Result<()> {
    let scheduler = ctx.scheduler()?;
    scheduler.start().await?;
    println!("Scheduler running, press Ctrl-C to stop");

    shutdown_signal().cancelled().await;

    println!("Shutting down...");
    scheduler.stop().await;
    Ok(())
}

/// A token cancelled on Ctrl-C, or SIGTERM on unix.
fn shutdown_signal() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();

    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = ctrl_c => tracing::info!("Received SIGINT"),
                        _ = sigterm.recv() => tracing::info!("Received SIGTERM"),
                    }
                }
                Err(e) => {
                    tracing::warn!("Could not install SIGTERM handler: {}", e);
                    let _ = ctrl_c.await;
                }
            }
        }

        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
            tracing::info!("Received Ctrl-C");
        }

        trigger.cancel();
    });

    token
}

pub async fn run_subscription(ctx: &AppContext, id: i64) -> Result<()> {
    let subscription = ctx
        .store
        .get_subscription(id)?
        .ok_or(FeedpostError::SubscriptionNotFound(id))?;
    let total = ctx.store.list_sources(id)?.len();
    println!(
        "Running {} ({} sources)...",
        subscription.display_name(),
        total
    );

    let scheduler = ctx.scheduler()?;
    let progress = Arc::new(AtomicUsize::new(0));
    let reporter = {
        let progress = progress.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(200));
            loop {
                ticker.tick().await;
                let done = progress.load(Ordering::Relaxed);
                eprint!("\r  fetched {}/{}", done, total);
                if done >= total {
                    break;
                }
            }
        })
    };

    let result = scheduler.run_now(id, Some(progress)).await;
    reporter.abort();
    eprintln!();

    let stats = result?;
    println!(
        "Run complete: {}/{} sources fetched, {} new items, {}",
        stats.fetched,
        stats.total_sources,
        stats.new_items,
        if stats.notification_sent {
            "digest sent"
        } else {
            "nothing sent"
        }
    );
    Ok(())
}

pub fn status(ctx: &AppContext) -> Result<()> {
    let subscriptions = ctx.store.list_subscriptions()?;

    if subscriptions.is_empty() {
        println!("No subscriptions");
        return Ok(());
    }

    let now = Utc::now();
    for subscription in subscriptions {
        let sources = ctx.store.list_sources(subscription.id)?.len();
        println!(
            "#{} {} <{}> [{}] {}\n  {} sources, last run {}, next run {}",
            subscription.id,
            subscription.display_name(),
            subscription.recipient,
            subscription.cron_expr,
            state_label(&subscription, now),
            sources,
            format_time(subscription.last_run),
            format_time(subscription.next_run),
        );
    }

    Ok(())
}

fn state_label(subscription: &Subscription, now: DateTime<Utc>) -> &'static str {
    match subscription.state(now) {
        ScheduleState::Unscheduled => "inactive",
        ScheduleState::Pending => "pending",
        ScheduleState::Due => "due",
    }
}

fn format_time(at: Option<DateTime<Utc>>) -> String {
    at.map(|t| t.format("%Y-%m-%d %H:%M UTC").to_string())
        .unwrap_or_else(|| "never".to_string())
}

pub struct SubscribeArgs<'a> {
    pub subscriber: &'a str,
    pub recipient: &'a str,
    pub cron: &'a str,
    pub name: Option<&'a str>,
    pub inline: bool,
    pub urls: &'a [String],
}

/// Create a subscription, mark each source's current backlog as seen, then
/// schedule it. Sources that fail to seed are kept and seeded by the first
/// run instead.
pub async fn subscribe(ctx: &AppContext, args: SubscribeArgs<'_>) -> Result<i64> {
    next_run_after(args.cron, Utc::now())?;
    for url in args.urls {
        url::Url::parse(url)?;
    }

    // Transport settings are checked before anything is written.
    let pipeline = ctx.pipeline()?;

    let mut new = NewSubscription::new(args.subscriber, args.recipient, args.cron);
    new.name = args.name.unwrap_or_default().to_string();
    new.inline_content = args.inline;
    new.inline_threshold = ctx.config.engine.inline_threshold;
    let id = ctx.store.create_subscription(&new)?;
    println!("Created subscription #{}", id);

    for url in args.urls {
        let source_id = ctx.store.add_source(id, &NewSource::new(url))?;
        let Some(source) = ctx.store.get_source(source_id)? else {
            continue;
        };
        match pipeline.seed_source(&source).await {
            Ok(count) => println!("  {}: {} existing items marked seen", url, count),
            Err(e) => eprintln!("  {}: could not pre-seed: {}", url, e),
        }
    }

    activate(ctx, id)?;
    Ok(id)
}

pub fn activate(ctx: &AppContext, id: i64) -> Result<()> {
    let subscription = ctx
        .store
        .get_subscription(id)?
        .ok_or(FeedpostError::SubscriptionNotFound(id))?;

    let next = next_run_after(&subscription.cron_expr, Utc::now())?;
    ctx.store.update_next_run(id, Some(next))?;
    println!(
        "Activated #{}, next run {}",
        id,
        format_time(Some(next))
    );
    Ok(())
}

pub fn deactivate(ctx: &AppContext, id: i64) -> Result<()> {
    ctx.store.update_next_run(id, None)?;
    println!("Deactivated #{}", id);
    Ok(())
}

pub fn logs(ctx: &AppContext, id: i64, limit: usize) -> Result<()> {
    if ctx.store.get_subscription(id)?.is_none() {
        return Err(FeedpostError::SubscriptionNotFound(id));
    }

    let entries = ctx.store.recent_logs(id, limit)?;
    if entries.is_empty() {
        println!("No log entries");
        return Ok(());
    }

    for entry in entries {
        println!(
            "{} {:5} {}",
            entry.created_at.format("%Y-%m-%d %H:%M:%S"),
            entry.level,
            entry.message
        );
    }
    Ok(())
}

pub fn prune(ctx: &AppContext) -> Result<()> {
    let sweeper = ctx.sweeper();
    let seen = sweeper.prune_seen()?;
    let sends = sweeper.prune_sends()?;
    println!("Pruned {} seen items and {} send records", seen, sends);
    Ok(())
}

pub fn init_config(path: Option<&Path>) -> Result<()> {
    let path = Config::init(path).map_err(|e| FeedpostError::Config(e.to_string()))?;
    println!("Wrote default config to {}", path.display());
    Ok(())
}
