#![warn(missing_docs)]

//! geocoord-node: runs one coordination instance until interrupted.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use geocoord_core::config::LockBackend;
use geocoord_core::health::HealthStatus;
use geocoord_core::replica::TcpConnectProbe;
use geocoord_core::{CoordinationConfig, Coordinator};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Command-line arguments.
#[derive(Debug, Parser)]
#[command(name = "geocoord-node", about = "Run a geocoord coordination instance")]
struct Args {
    /// TOML or JSON configuration file.
    #[arg(short, long, env = "GEOCOORD_CONFIG")]
    config: Option<PathBuf>,

    /// Overrides cluster.instance_id.
    #[arg(long, env = "GEOCOORD_INSTANCE_ID")]
    instance_id: Option<String>,

    /// Emit logs as JSON lines.
    #[arg(long)]
    json_logs: bool,

    /// Seconds between health report log lines.
    #[arg(long, default_value_t = 30)]
    health_interval_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if args.json_logs {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init();
    }

    let mut config = match &args.config {
        Some(path) => CoordinationConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => {
            tracing::warn!("no config file given, using defaults");
            CoordinationConfig::default()
        }
    };
    if let Some(id) = args.instance_id {
        config.cluster.instance_id = Some(id);
    }
    if config.lock_manager == LockBackend::External {
        bail!("the external lock backend needs a shared store wired in by the embedding service");
    }

    let coordinator = Coordinator::in_memory(config)?.with_replica_probe(Arc::new(TcpConnectProbe));
    coordinator.start();

    let mut health_tick = tokio::time::interval(Duration::from_secs(args.health_interval_secs.max(1)));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = health_tick.tick() => {
                let report = coordinator.health_report();
                match report.overall {
                    HealthStatus::Unhealthy => tracing::error!(
                        unhealthy = ?report.unhealthy_components().iter().map(|c| &c.name).collect::<Vec<_>>(),
                        "instance unhealthy"
                    ),
                    status => tracing::info!(?status, is_leader = report.is_leader, "health"),
                }
            }
        }
    }

    tracing::info!("shutting down");
    coordinator.shutdown().await;
    Ok(())
}
