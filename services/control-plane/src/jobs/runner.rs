//! The job runner: a pool of workers leasing jobs from the store.
//!
//! Each attempt runs the definition's guards, takes the definition's
//! activity on the target (delete jobs drain other work first), runs the
//! handler under a cancellation watcher and persists the outcome. A job in
//! a terminal status is never written again.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fabric_id::JobId;
use fabric_reconcile::retry_backoff;
use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, instrument, warn};

use super::guards::Verdict;
use super::registry::{Definition, Registry};
use super::{target, JobError};
use crate::config::JobSettings;
use crate::db::{JobFilter, StoreError};
use crate::model::job::{Job, JobStatus};
use crate::model::{ActivityTag, ResourceKind};
use crate::service::{Core, ServiceError};

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub workers: usize,
    pub max_attempts: u32,
    /// Base delay for guard reschedules; up to half again is added as jitter.
    pub guard_backoff: Duration,
    pub idle_poll: Duration,
    pub cancel_poll: Duration,
    pub drain_poll: Duration,
}

impl RunnerConfig {
    pub fn from_settings(settings: &JobSettings, workers: usize) -> Self {
        Self {
            workers: workers.max(1),
            max_attempts: settings.max_attempts.max(1),
            guard_backoff: settings.guard_backoff(),
            idle_poll: settings.idle_poll(),
            cancel_poll: settings.cancel_poll(),
            drain_poll: settings.drain_poll(),
        }
    }
}

enum Outcome {
    Done,
    Reschedule(String),
    Error(JobError),
    /// The job left `running` under us.
    Cancelled,
}

fn store_error(err: StoreError) -> JobError {
    ServiceError::from(err).into()
}

fn after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    now + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero())
}

fn jittered(base: Duration) -> Duration {
    let spread = (base.as_millis() / 2) as u64;
    base + Duration::from_millis(rand::rng().random_range(0..=spread))
}

pub struct JobRunner {
    core: Arc<Core>,
    registry: Registry,
    config: RunnerConfig,
}

impl JobRunner {
    pub fn new(core: Arc<Core>, registry: Registry, config: RunnerConfig) -> Self {
        Self {
            core,
            registry,
            config,
        }
    }

    /// Return jobs orphaned in `running` by a crashed process to the queue.
    pub async fn recover(&self) -> Result<u64, ServiceError> {
        let reset = self.core.jobs_store().reset_running().await?;
        if reset > 0 {
            warn!(jobs = reset, "Reset jobs left running by a previous process");
        }
        Ok(reset)
    }

    /// Run the worker pool until shutdown is signaled. Workers finish the
    /// job in hand before exiting.
    #[instrument(skip(self, shutdown), name = "job_runner")]
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        if let Err(e) = self.recover().await {
            error!(error = %e, "Failed to reset running jobs");
        }
        info!(workers = self.config.workers, "Starting job runner");

        let mut workers = JoinSet::new();
        for index in 0..self.config.workers {
            let runner = Arc::clone(&self);
            let shutdown = shutdown.clone();
            workers.spawn(async move { runner.worker(index, shutdown).await });
        }
        while let Some(result) = workers.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "Job worker panicked");
            }
        }
        info!("Job runner stopped");
    }

    #[instrument(skip(self, shutdown))]
    async fn worker(&self, index: usize, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            let idle = match self.run_next().await {
                Ok(Some(_)) => false,
                Ok(None) => true,
                Err(e) => {
                    error!(error = %e, "Job attempt could not be recorded");
                    true
                }
            };
            if idle {
                tokio::select! {
                    _ = shutdown.changed() => {}
                    _ = sleep(self.config.idle_poll) => {}
                }
            }
        }
        debug!("Job worker exiting");
    }

    /// Lease and run the next due job. Returns the job and the status it
    /// was left in, or `None` when nothing is due.
    pub async fn run_next(&self) -> Result<Option<(JobId, JobStatus)>, ServiceError> {
        self.run_due(Utc::now()).await
    }

    pub async fn run_due(&self, now: DateTime<Utc>) -> Result<Option<(JobId, JobStatus)>, ServiceError> {
        let Some(job) = self.core.jobs_store().lease_next(now).await? else {
            return Ok(None);
        };
        let id = job.id;
        let status = self.execute(job).await?;
        Ok(Some((id, status)))
    }

    /// Run one attempt of a leased job and persist its outcome.
    #[instrument(
        skip(self, job),
        fields(job_id = %job.id, job_type = %job.job_type, version = %job.version, resource_id = job.resource_id().unwrap_or_default())
    )]
    pub async fn execute(&self, job: Job) -> Result<JobStatus, ServiceError> {
        let store = self.core.jobs_store();
        let Some(definition) = self.registry.get(job.job_type, job.version) else {
            warn!("No handler for job type");
            store.mark_terminated(job.id, "unknown job type").await?;
            return Ok(JobStatus::Terminated);
        };

        debug!(attempt = job.retry_count + 1, "Job started");
        let outcome = self.attempt(&job, definition).await;
        let final_outcome = matches!(
            outcome,
            Outcome::Done | Outcome::Cancelled | Outcome::Error(JobError::Terminated(_))
        );
        if final_outcome {
            self.release(&job, definition).await;
        }

        let status = match outcome {
            Outcome::Done => {
                if store.mark_completed(job.id).await? {
                    info!("Job completed");
                    JobStatus::Completed
                } else {
                    info!("Job finished after it was cancelled; status kept");
                    JobStatus::Terminated
                }
            }
            Outcome::Reschedule(reason) => {
                let run_after = after(Utc::now(), jittered(self.config.guard_backoff));
                debug!(reason = %reason, run_after = %run_after, "Job rescheduled");
                store.reschedule(job.id, run_after, &reason).await?;
                JobStatus::Pending
            }
            Outcome::Cancelled => {
                info!("Job cancelled while running");
                JobStatus::Terminated
            }
            Outcome::Error(JobError::Terminated(reason)) => {
                warn!(error = %reason, "Job terminated");
                store.mark_terminated(job.id, &reason).await?;
                JobStatus::Terminated
            }
            Outcome::Error(JobError::Failed(reason)) => {
                let attempts = job.retry_count + 1;
                if attempts >= self.config.max_attempts {
                    warn!(error = %reason, attempts, "Job failed; giving up");
                    store.mark_terminated(job.id, &reason).await?;
                    self.release(&job, definition).await;
                    JobStatus::Terminated
                } else {
                    let run_after = after(Utc::now(), retry_backoff(attempts));
                    warn!(error = %reason, attempts, run_after = %run_after, "Job failed; will retry");
                    store.mark_failed(job.id, attempts, run_after, &reason).await?;
                    JobStatus::Failed
                }
            }
        };
        Ok(status)
    }

    async fn attempt(&self, job: &Job, definition: &Definition) -> Outcome {
        for guard in &definition.guards {
            match guard.check(&self.core, job, definition.kind).await {
                Ok(Verdict::Proceed) => {}
                Ok(Verdict::Reschedule(reason)) => return Outcome::Reschedule(reason),
                Ok(Verdict::Terminate(reason)) => return Outcome::Error(JobError::Terminated(reason)),
                Err(e) => return Outcome::Error(e.into()),
            }
        }

        if let Err(e) = self.acquire(job, definition).await {
            return Outcome::Error(e);
        }

        let outcome = tokio::select! {
            result = definition.handler.run(&self.core, job) => match result {
                Ok(()) => Outcome::Done,
                Err(e) => Outcome::Error(e),
            },
            () = self.cancelled(job.id) => Outcome::Cancelled,
        };

        // A delete that returned while the record is still live has not
        // converged; let the queue retry it.
        if let (Outcome::Done, Some(kind), Some(_)) = (&outcome, definition.kind, definition.drain) {
            let id = job.resource_id().unwrap_or_default();
            match target::exists(&self.core, kind, id).await {
                Ok(false) => {}
                Ok(true) => {
                    return Outcome::Error(JobError::failed(format!("{kind} {id} still exists after delete")))
                }
                Err(e) => return Outcome::Error(e.into()),
            }
        }
        outcome
    }

    /// Entry hook: drain for deletes, otherwise take the activity.
    async fn acquire(&self, job: &Job, definition: &Definition) -> Result<(), JobError> {
        let (Some(kind), Some(id)) = (definition.kind, job.resource_id()) else {
            return Ok(());
        };
        if let Some(deadline) = definition.drain {
            return self.drain(job, kind, id, deadline).await;
        }
        let Some(tag) = definition.activity else {
            return Ok(());
        };
        match target::add(&self.core, kind, id, tag).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() && !definition.requires_target() => Ok(()),
            Err(e) => Err(JobError::terminated(e.to_string())),
        }
    }

    /// Exit hook. Failures are logged; the outcome stands.
    async fn release(&self, job: &Job, definition: &Definition) {
        let (Some(kind), Some(id)) = (definition.kind, job.resource_id()) else {
            return;
        };
        let tag = match (definition.drain, definition.activity) {
            (Some(_), _) => ActivityTag::BeingDeleted,
            (None, Some(tag)) => tag,
            (None, None) => return,
        };
        if let Err(e) = target::remove(&self.core, kind, id, tag).await {
            warn!(resource_id = %id, activity = %tag, error = %e, "Failed to remove activity");
        }
    }

    /// Mark the target as being deleted and wait up to `deadline` for other
    /// work on it to finish. Jobs scheduled for later are not waited on.
    async fn drain(&self, job: &Job, kind: ResourceKind, id: &str, deadline: Duration) -> Result<(), JobError> {
        let store = self.core.jobs_store();
        let marked = match target::add(&self.core, kind, id, ActivityTag::BeingDeleted).await {
            Ok(()) => true,
            // Nothing left to delete; the handler is idempotent.
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => {
                debug!(error = %e, "Marking deferred until in-flight work drains");
                false
            }
        };

        let others = JobFilter::new()
            .with_statuses(JobStatus::NON_TERMINAL)
            .with_resource(id)
            .excluding(job.id);
        let started = Instant::now();
        loop {
            let now = Utc::now();
            let waiting = store
                .list_jobs(&others)
                .await
                .map_err(store_error)?
                .into_iter()
                .filter(|other| other.job_type != job.job_type)
                .filter(|other| other.status == JobStatus::Running || other.run_after <= now)
                .count();
            if waiting == 0 {
                break;
            }
            if started.elapsed() >= deadline {
                return Err(JobError::terminated(format!(
                    "timed out waiting for {waiting} jobs on {kind} {id}"
                )));
            }
            debug!(waiting, "Waiting for other jobs before delete");
            sleep(self.config.drain_poll).await;
        }

        if !marked {
            // A create that never finished leaves its tag behind.
            target::remove(&self.core, kind, id, ActivityTag::BeingCreated).await?;
            target::add(&self.core, kind, id, ActivityTag::BeingDeleted)
                .await
                .map_err(|e| JobError::terminated(e.to_string()))?;
        }
        Ok(())
    }

    /// Resolves once the job is no longer `running` in the store.
    async fn cancelled(&self, id: JobId) {
        let store = self.core.jobs_store();
        let mut tick = tokio::time::interval(self.config.cancel_poll);
        loop {
            tick.tick().await;
            match store.get_job(id).await {
                Ok(Some(job)) if job.status == JobStatus::Running => {}
                Ok(_) => return,
                Err(e) => warn!(job_id = %id, error = %e, "Failed to poll job status"),
            }
        }
    }
}
