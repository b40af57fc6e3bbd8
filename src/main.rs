//! AlertWatch - scheduled alerting on event sources
//!
//! Loads the configuration and rule files, starts one worker per rule and
//! runs until Ctrl-C. On Unix, SIGHUP reloads the rule files.

use alertwatch::{app::App, cli::Cli, config::Config};
use anyhow::Result;
use clap::Parser;
use tokio::sync::{mpsc, watch};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match Config::load(&cli) {
        Ok(config) => config,
        Err(err) => {
            tracing_subscriber::fmt().init();
            error!("Failed to load configuration: {:#}", err);
            std::process::exit(1);
        }
    };

    // RUST_LOG wins over the configured level.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("AlertWatch starting up...");
    info!("-------------------- Configuration --------------------");
    info!("Log Level: {}", config.log_level);
    info!("Rule Files: {:?}", config.rule_files);
    match &config.state_path {
        Some(path) => info!("State Path: {}", path.display()),
        None => info!("State Path: in-memory"),
    }
    info!("Send Timeout: {}ms", config.dispatch.send_timeout_ms);
    info!("Max Retries: {}", config.dispatch.retry.max_retries);
    info!("Auto-Silence After: {} failed dispatches", config.dispatch.auto_silence_after);
    info!("Metrics: {}", if config.metrics.enabled { "Enabled" } else { "Disabled" });
    info!("-------------------------------------------------------");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (reload_tx, reload_rx) = mpsc::channel(1);
    spawn_reload_listener(reload_tx);

    let app = App::builder(config)
        .reload_signal(reload_rx)
        .build(shutdown_rx)
        .await?;
    let app_handle = tokio::spawn(app.run());

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received. Shutting down gracefully...");
    if shutdown_tx.send(true).is_err() {
        error!("Application stopped before the shutdown signal was sent");
    }

    match app_handle.await {
        Ok(result) => result?,
        Err(e) => error!("Application task panicked: {}", e),
    }
    info!("Exiting.");
    Ok(())
}

#[cfg(unix)]
fn spawn_reload_listener(reload_tx: mpsc::Sender<()>) {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async move {
        let mut hangup = match signal(SignalKind::hangup()) {
            Ok(hangup) => hangup,
            Err(e) => {
                error!("Failed to install SIGHUP handler, reload disabled: {}", e);
                return;
            }
        };
        while hangup.recv().await.is_some() {
            info!("SIGHUP received, reloading rules");
            // A reload already queued covers this one.
            let _ = reload_tx.try_send(());
        }
    });
}

#[cfg(not(unix))]
fn spawn_reload_listener(_reload_tx: mpsc::Sender<()>) {}
