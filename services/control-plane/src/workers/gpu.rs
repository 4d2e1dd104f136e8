//! Periodic GPU lease synchronizer.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{error, info, instrument};

use crate::service::gpu;
use crate::service::Core;

#[derive(Debug, Clone)]
pub struct GpuSyncConfig {
    pub interval: Duration,
}

impl Default for GpuSyncConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
        }
    }
}

pub struct GpuSynchronizer {
    core: Arc<Core>,
    config: GpuSyncConfig,
}

impl GpuSynchronizer {
    pub fn new(core: Arc<Core>, config: GpuSyncConfig) -> Self {
        Self { core, config }
    }

    #[instrument(skip(self, shutdown), name = "gpu_synchronizer")]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            "Starting gpu lease synchronizer"
        );
        let mut interval = tokio::time::interval(self.config.interval);

        loop {
            tokio::select! {
                _ = interval.tick() => self.sync_once().await,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Gpu lease synchronizer shutting down");
                        break;
                    }
                }
            }
        }
    }

    async fn sync_once(&self) {
        match gpu::sync(&self.core, Utc::now()).await {
            Ok(report) if report != Default::default() => {
                info!(
                    removed_unknown = report.removed_unknown,
                    expired = report.expired,
                    assigned = report.assigned,
                    activated = report.activated,
                    evicted = report.evicted,
                    "Gpu leases synchronized"
                );
            }
            Ok(_) => {}
            Err(e) => error!(error = %e, "Gpu lease synchronization failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::gpu::GpuGroup;
    use crate::service::testing;

    #[tokio::test]
    async fn test_first_tick_publishes_groups() {
        let t = testing::core();
        let worker = GpuSynchronizer::new(
            t.core.clone(),
            GpuSyncConfig {
                interval: Duration::from_millis(10),
            },
        );
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(async move { worker.run(rx).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        task.await.unwrap();

        let groups = t.core.repo::<GpuGroup>().find(&crate::db::Filter::new()).await.unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].name, "nvidia-a100");
    }
}
