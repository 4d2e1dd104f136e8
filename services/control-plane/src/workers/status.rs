//! Worker heartbeats.
//!
//! Every background worker of a process reports `running` on an interval and
//! `stopped` on shutdown, keyed by `<host>/<worker>`.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use crate::db::Filter;
use crate::model::worker::{WorkerState, WorkerStatus};
use crate::service::{Core, ServiceError};

/// Name this process reports under.
pub fn host_name() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

pub async fn report(core: &Core, host: &str, worker: &str, state: WorkerState) -> Result<(), ServiceError> {
    let status = WorkerStatus {
        id: format!("{host}/{worker}"),
        name: worker.to_string(),
        status: state,
        reported_at: Utc::now(),
    };
    core.repo::<WorkerStatus>().upsert(&status).await?;
    debug!(worker, state = ?state, "Worker status reported");
    Ok(())
}

/// Every reported worker, by name.
pub async fn list(core: &Core) -> Result<Vec<WorkerStatus>, ServiceError> {
    let mut statuses = core.repo::<WorkerStatus>().find(&Filter::new()).await?;
    statuses.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(statuses)
}

/// Reports heartbeats for a fixed set of workers.
pub struct StatusReporter {
    core: Arc<Core>,
    host: String,
    workers: Vec<&'static str>,
    interval: Duration,
}

impl StatusReporter {
    pub fn new(core: Arc<Core>, workers: Vec<&'static str>, interval: Duration) -> Self {
        Self {
            core,
            host: host_name(),
            workers,
            interval,
        }
    }

    async fn report_all(&self, state: WorkerState) {
        for worker in &self.workers {
            if let Err(e) = report(&self.core, &self.host, worker, state).await {
                warn!(worker, error = %e, "Failed to report worker status");
            }
        }
    }

    #[instrument(skip(self, shutdown), name = "status_reporter")]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval.as_secs(),
            workers = ?self.workers,
            "Starting status reporter"
        );
        let mut interval = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = interval.tick() => self.report_all(WorkerState::Running).await,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        self.report_all(WorkerState::Stopped).await;
        info!("Status reporter shutting down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::testing;

    #[tokio::test]
    async fn test_report_overwrites_previous_beat() {
        let t = testing::core();
        report(&t.core, "cp-1", "jobRunner", WorkerState::Running).await.unwrap();
        report(&t.core, "cp-1", "jobRunner", WorkerState::Stopped).await.unwrap();
        report(&t.core, "cp-2", "jobRunner", WorkerState::Running).await.unwrap();

        let statuses = list(&t.core).await.unwrap();
        assert_eq!(statuses.len(), 2);
        assert_eq!(statuses[0].id, "cp-1/jobRunner");
        assert_eq!(statuses[0].status, WorkerState::Stopped);
    }

    #[tokio::test]
    async fn test_reporter_marks_stopped_on_shutdown() {
        let t = testing::core();
        let reporter = StatusReporter::new(t.core.clone(), vec!["jobRunner"], Duration::from_millis(10));
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(async move { reporter.run(rx).await });

        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.send(true).unwrap();
        task.await.unwrap();

        let statuses = list(&t.core).await.unwrap();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].status, WorkerState::Stopped);
    }
}
