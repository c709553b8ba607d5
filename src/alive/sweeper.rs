use crate::config::SweeperConfig;
use crate::supervision::SupervisionManager;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Periodically scans the alive timers and raises DOWN for overdue ones.
pub struct AliveTimerSweeper {
    manager: Arc<SupervisionManager>,
    config: SweeperConfig,
}

impl AliveTimerSweeper {
    pub fn new(manager: Arc<SupervisionManager>, config: SweeperConfig) -> Self {
        Self { manager, config }
    }

    /// Run the sweep loop until `shutdown` is cancelled.
    pub async fn run(&self, shutdown: CancellationToken) {
        if !self.config.enabled {
            info!("Alive timer sweeper disabled, exiting loop");
            return;
        }

        info!(
            interval_millis = self.config.interval_millis,
            "Starting alive timer sweeper"
        );

        let mut timer = interval(Duration::from_millis(self.config.interval_millis.max(1)));
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = timer.tick() => {
                    let raised = self.manager.check_alive_timers(Utc::now());
                    if raised > 0 {
                        debug!(raised = raised, "Sweep raised expiry events");
                    }
                }
            }
        }

        info!("Alive timer sweeper stopped");
    }

    /// Spawn the loop on the current runtime.
    pub fn spawn(self, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move { self.run(shutdown).await })
    }
}
