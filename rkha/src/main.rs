mod cli;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use cli::Cli;
use log::{error, info};
use rkha::{CommandSupervisor, FailoverConfig, FailoverController, XlineLockCoordinator, load_config};
use tokio_util::sync::CancellationToken;

/// Startup connection. A failure here ends the process with exit code 1.
async fn connect(config: &FailoverConfig) -> anyhow::Result<XlineLockCoordinator> {
    XlineLockCoordinator::connect(config)
        .await
        .context("failed to connect to the coordination service")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();
    let cli = Cli::parse();

    let config = Arc::new(load_config(&cli.config)?);
    let coordinator = connect(&config).await?;

    let shutdown = CancellationToken::new();
    {
        let token = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("failed to listen for ctrl_c: {e:?}");
                return;
            }
            info!("Received CTRL-C, shutting down...");
            token.cancel();
        });
    }

    let controller = FailoverController::new(config, coordinator, CommandSupervisor::new());
    controller.run(shutdown).await;
    Ok(())
}
