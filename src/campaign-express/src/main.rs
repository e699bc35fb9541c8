//! Campaign Express — customer outreach campaign engine.
//!
//! Main entry point that wires the engine, the delivery event feed and the
//! scheduler loop, then runs until Ctrl-C.

mod demo;

use std::sync::Arc;

use campaign_core::config::AppConfig;
use campaign_core::event_bus::TracingSink;
use campaign_core::{InMemoryCustomerStore, SystemClock};
use campaign_delivery::{DeliveryEventFeed, LogTransport};
use campaign_engine::{OutreachEngine, SchedulerLoop};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "campaign-express")]
#[command(about = "Customer outreach campaign engine")]
#[command(version)]
struct Cli {
    /// Path to a TOML configuration file
    #[arg(long, short = 'c', env = "CAMPAIGN_EXPRESS_CONFIG")]
    config: Option<String>,

    /// Node identifier (overrides config)
    #[arg(long, env = "CAMPAIGN_EXPRESS__NODE_ID")]
    node_id: Option<String>,

    /// This node's scheduler shard (overrides config)
    #[arg(long, env = "CAMPAIGN_EXPRESS__SCHEDULER__SHARD_INDEX")]
    shard_index: Option<u32>,

    /// Total scheduler shards (overrides config)
    #[arg(long, env = "CAMPAIGN_EXPRESS__SCHEDULER__SHARD_COUNT")]
    shard_count: Option<u32>,

    /// Scheduler tick interval in milliseconds (overrides config)
    #[arg(long)]
    tick_interval_ms: Option<u64>,

    /// Seed a demo store with customers, a segment, a campaign and a
    /// recovery sequence
    #[arg(long, default_value_t = false)]
    demo: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "campaign_express=info,campaign_engine=info".into()),
        )
        .json()
        .init();

    let cli = Cli::parse();

    info!("Campaign Express starting up");

    let mut config = AppConfig::load_from(cli.config.as_deref()).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        AppConfig::default()
    });

    if let Some(node_id) = cli.node_id {
        config.node_id = node_id;
    }
    if let Some(index) = cli.shard_index {
        config.scheduler.shard_index = index;
    }
    if let Some(count) = cli.shard_count {
        config.scheduler.shard_count = count;
    }
    if let Some(interval) = cli.tick_interval_ms {
        config.scheduler.tick_interval_ms = interval;
    }
    config.validate()?;

    info!(
        node_id = %config.node_id,
        shard = config.scheduler.shard_index,
        shards = config.scheduler.shard_count,
        tick_interval_ms = config.scheduler.tick_interval_ms,
        "Configuration loaded"
    );

    let customers = Arc::new(InMemoryCustomerStore::new());
    let engine = Arc::new(OutreachEngine::new(
        config.clone(),
        customers.clone(),
        Arc::new(LogTransport),
        Arc::new(SystemClock),
        Arc::new(TracingSink),
    ));

    if cli.demo {
        if let Err(e) = demo::seed(&engine, &customers).await {
            error!(error = %e, "Failed to seed demo store");
        }
    }

    let shutdown = CancellationToken::new();
    let (_feed, feed_handle) =
        DeliveryEventFeed::spawn(&config.feed, engine.clone(), shutdown.clone());
    let scheduler_handle = SchedulerLoop::new(engine.clone(), shutdown.clone()).spawn();

    info!("Campaign Express is running");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    shutdown.cancel();

    if let Err(e) = scheduler_handle.await {
        error!(error = %e, "Scheduler task panicked");
    }
    if let Err(e) = feed_handle.await {
        error!(error = %e, "Delivery event feed task panicked");
    }

    info!("Campaign Express stopped");
    Ok(())
}
