use std::path::PathBuf;
use std::sync::Arc;

use bridge::config::Config;
use bridge::coordinator::Coordinator;
use clap::Parser;
use tracing::{error, info};

/// Edge bridge: ingests one bay's AMG shot timer and BT50 target sensors
/// over BLE, detects impacts, correlates them to shots, and appends every
/// event to the local capture store.
#[derive(Parser, Debug)]
#[command(name = "steeltrace-bridge", version, about)]
struct Cli {
    /// Path to the bridge assignment TOML (bridge id, stage, timer/sensor MACs).
    #[arg(long, short, default_value = "bridge.toml")]
    config: PathBuf,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "bridge=info".into()),
        )
        .init();

    let cli = Cli::parse();

    let config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, path = %cli.config.display(), "failed to load bridge configuration");
            std::process::exit(1);
        }
    };

    info!(bridge_id = %config.bridge_id, display_name = %config.display_name, "starting steeltrace bridge");

    let coordinator = match Coordinator::start(config).await {
        Ok(coordinator) => Arc::new(coordinator),
        Err(err) => {
            error!(error = %err, "failed to initialize coordinator");
            std::process::exit(1);
        }
    };

    let run_handle = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.run().await })
    };

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to install ctrl_c handler, running until killed");
        let _ = run_handle.await;
        return;
    }

    info!("shutdown signal received, draining");
    coordinator.stop();

    match run_handle.await {
        Ok(Ok(())) => info!("bridge stopped cleanly"),
        Ok(Err(err)) => error!(error = %err, "bridge stopped with error"),
        Err(join_err) => error!(error = %join_err, "coordinator task panicked"),
    }
}
