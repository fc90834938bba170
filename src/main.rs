use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};

mod api;
mod config;
mod engine;
mod models;
mod notify;
mod probe;
mod settings;
mod storage;
mod utils;

use crate::config::FileConfig;
use crate::engine::Monitor;
use crate::notify::SlackNotifier;
use crate::probe::HttpProbe;
use crate::settings::Cli;
use crate::storage::StateStore;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let settings = Cli::parse().resolve()?;
    info!(data_dir = %settings.data_dir.display(), "starting uptime monitor");

    let listener = api::bind(settings.listen).await?;

    let notifier = SlackNotifier::new(&settings.slack_token, &settings.slack_username)
        .context("failed to build Slack client")?;
    notifier
        .connect()
        .await
        .context("unable to connect to Slack")?;

    let probe = HttpProbe::new().context("failed to build HTTP client")?;
    let store = StateStore::new(&settings.state_path);
    info!(
        path = %store.path().display(),
        records = store.snapshot().await.len(),
        "state store ready"
    );

    let source = FileConfig::new(&settings.config_path);
    info!(path = %source.path().display(), "reading healthchecks");

    let monitor = Arc::new(Monitor::new(
        source,
        probe,
        store,
        notifier,
        settings.period,
        settings.max_concurrency,
    ));

    let config = monitor
        .bootstrap()
        .await
        .context("unable to load initial configuration")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let liveness = monitor.liveness();
    let api_shutdown = shutdown_rx.clone();
    let api_task = tokio::spawn(async move {
        if let Err(e) = api::start_server(listener, liveness, api_shutdown).await {
            error!("liveness endpoint failed: {:#}", e);
        }
    });

    let loop_task = tokio::spawn(Arc::clone(&monitor).run(config, shutdown_rx));

    info!("up and running");
    signal::ctrl_c().await?;
    info!("sigint received, shutting down");

    let _ = shutdown_tx.send(true);
    if let Err(e) = loop_task.await {
        error!("check loop panicked: {}", e);
    }
    if let Err(e) = api_task.await {
        error!("liveness task panicked: {}", e);
    }

    info!("good bye");
    Ok(())
}
