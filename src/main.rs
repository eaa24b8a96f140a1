use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use feedpost::app::AppContext;
use feedpost::cli::commands::{self, SubscribeArgs};
use feedpost::cli::{Cli, Commands};
use feedpost::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("feedpost=info")))
        .init();

    let cli = Cli::parse();

    // Writing the config must not depend on being able to load one.
    if let Commands::Init { path } = &cli.command {
        commands::init_config(path.as_deref())?;
        return Ok(());
    }

    let config = Config::load(cli.config.as_deref())?;
    let ctx = AppContext::new(config)?;

    match cli.command {
        Commands::Serve => {
            commands::serve(&ctx).await?;
        }
        Commands::Run { id } => {
            commands::run_subscription(&ctx, id).await?;
        }
        Commands::Status => {
            commands::status(&ctx)?;
        }
        Commands::Subscribe {
            subscriber,
            recipient,
            cron,
            name,
            inline,
            urls,
        } => {
            commands::subscribe(
                &ctx,
                SubscribeArgs {
                    subscriber: &subscriber,
                    recipient: &recipient,
                    cron: &cron,
                    name: name.as_deref(),
                    inline,
                    urls: &urls,
                },
            )
            .await?;
        }
        Commands::Activate { id } => {
            commands::activate(&ctx, id)?;
        }
        Commands::Deactivate { id } => {
            commands::deactivate(&ctx, id)?;
        }
        Commands::Logs { id, limit } => {
            commands::logs(&ctx, id, limit)?;
        }
        Commands::Prune => {
            commands::prune(&ctx)?;
        }
        Commands::Init { .. } => {}
    }

    Ok(())
}
