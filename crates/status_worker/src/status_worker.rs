use crate::domain::DeviceStatusService;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct StatusWorkerConfig {
    pub check_interval: Duration,
}

/// Periodically sweeps for devices whose heartbeats have stopped
pub struct StatusWorker {
    service: Arc<DeviceStatusService>,
    config: StatusWorkerConfig,
}

impl StatusWorker {
    pub fn new(service: Arc<DeviceStatusService>, config: StatusWorkerConfig) -> Self {
        debug!("Initializing status worker module");
        Self { service, config }
    }

    pub fn into_runner_process(
        self,
    ) -> impl FnOnce(
        CancellationToken,
    ) -> std::pin::Pin<
        Box<dyn std::future::Future<Output = anyhow::Result<()>> + Send>,
    > {
        move |ctx| Box::pin(async move { self.run(ctx).await })
    }

    async fn run(self, ctx: CancellationToken) -> anyhow::Result<()> {
        info!(
            check_interval_secs = self.config.check_interval.as_secs(),
            "Starting device status worker"
        );

        let mut ticker = interval(self.config.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ctx.cancelled() => {
                    info!("Device status worker shutdown signal received");
                    break;
                }
                _ = ticker.tick() => {
                    match self.service.sweep(Utc::now()).await {
                        Ok(report) if report.marked_offline > 0 => {
                            info!(marked_offline = report.marked_offline, "offline sweep complete");
                        }
                        Ok(report) => debug!(silent = report.silent, "offline sweep complete"),
                        Err(e) => warn!(error = %e, "offline sweep failed"),
                    }
                }
            }
        }

        Ok(())
    }
}
