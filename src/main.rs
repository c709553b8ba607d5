use anyhow::{Context, Result};
use daq_supervision::alive::AliveTimerSweeper;
use daq_supervision::config::{load_config, new_runtime_config, SupervisionConfig};
use daq_supervision::notifier::LogListener;
use daq_supervision::SupervisionManager;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "daq_supervision=info".into()),
        )
        .init();

    info!("DAQ supervision starting...");

    let config = match std::env::args().nth(1) {
        Some(path) => load_config(&path).context("Failed to load configuration")?,
        None => SupervisionConfig::default(),
    };
    let runtime = new_runtime_config(&config);
    {
        let switches = runtime
            .read()
            .map_err(|_| anyhow::anyhow!("runtime config lock poisoned"))?;
        info!(
            tolerance_factor = config.alive.tolerance_factor,
            sweep_interval_millis = config.sweeper.interval_millis,
            test_mode = switches.test_mode,
            reject_delayed_alive = switches.reject_delayed_alive,
            "Configuration loaded"
        );
    }

    let sweeper_config = config.sweeper.clone();
    let manager = Arc::new(SupervisionManager::new(config, runtime));

    let log_listener = manager.notifier().register(Arc::new(LogListener));
    log_listener.start();

    let shutdown = CancellationToken::new();
    let sweeper = AliveTimerSweeper::new(Arc::clone(&manager), sweeper_config).spawn(shutdown.clone());

    // Cold start: push current status to listeners and tags
    let pushed = manager.refresh_all_supervision_status();
    info!(events = pushed, "Supervision engine started");

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl_c signal")?;
    info!("Shutdown signal received");

    // Graceful shutdown
    shutdown.cancel();
    let _ = sweeper.await;
    log_listener.shutdown().await;

    let metrics = manager.metrics().snapshot();
    info!(
        events_raised = metrics.events_raised,
        expirations = metrics.expirations,
        listener_overflows = metrics.listener_overflows,
        "DAQ supervision stopped"
    );

    Ok(())
}
