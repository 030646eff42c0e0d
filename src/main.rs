use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use newsflow::{Config, Services};

#[derive(Parser, Debug)]
#[command(
    name = "newsflow",
    about = "News content-enrichment pipeline: section rotation, AI commentary, tiered caching"
)]
struct Args {
    /// Skip the boot-time backfill pass over all sections
    #[arg(long)]
    no_backfill: bool,

    /// Run one backfill pass over all sections, then exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("newsflow=info")),
        )
        .init();

    let args = Args::parse();
    let config = Config::from_env().context("Failed to load configuration")?;
    let services = Services::build(config)
        .await
        .context("Failed to build services")?;

    if args.once {
        services.scheduler.backfill().await;
        let status = services.gate.status().await?;
        tracing::info!(gate_open = status.met, "Single backfill pass complete");
        return Ok(());
    }

    if !args.no_backfill {
        services.scheduler.backfill().await;
    }

    let handles = services.start();
    tracing::info!("newsflow running; Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutdown signal received");

    // Ordered stop: the queue drains its workers first, then the scheduler
    // tick loop ends, then the shard health loop; adapters close on drop.
    services.shutdown();
    for handle in handles {
        if let Err(e) = handle.await {
            tracing::warn!(error = %e, "Task ended abnormally during shutdown");
        }
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
