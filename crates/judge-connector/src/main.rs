use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use judge_connector::config::Config;
use judge_connector::engine::CommandEngine;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Connects to one or more dispatchers and judges the work they send.
#[derive(Parser, Debug)]
#[command(name = "judge-connector", version)]
struct Args {
    /// Config file (default: $JUDGE_CONNECTOR_CONFIG or ~/.config/judge-connector/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Verbose logging and stack traces in error reports
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let default_filter = if args.debug {
        "judge_connector=debug"
    } else {
        "judge_connector=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()),
        )
        .init();

    let mut config = Config::load(args.config.as_deref())?;
    config.debug |= args.debug;
    info!(
        hosts = config.hosts.len(),
        concurrency = config.concurrency,
        tmpfs = config.tmpfs,
        "judge-connector starting"
    );

    let engine = Arc::new(CommandEngine::new(&config.engine));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
            shutdown_tx.send_replace(true);
        }
    });

    judge_connector::run(config, engine, shutdown_rx).await
}
