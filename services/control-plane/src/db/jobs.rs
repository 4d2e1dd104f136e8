//! Job queue persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fabric_id::JobId;

use super::filter::Pagination;
use super::StoreError;
use crate::model::job::{Job, JobStatus, JobType};

/// Selection of jobs. Empty lists match everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobFilter {
    pub statuses: Vec<JobStatus>,
    pub types: Vec<JobType>,
    /// Matches `args.id`.
    pub resource_id: Option<String>,
    pub user_id: Option<String>,
    pub exclude_id: Option<JobId>,
    pub pagination: Option<Pagination>,
}

impl JobFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_statuses(mut self, statuses: impl IntoIterator<Item = JobStatus>) -> Self {
        self.statuses = statuses.into_iter().collect();
        self
    }

    pub fn with_types(mut self, types: impl IntoIterator<Item = JobType>) -> Self {
        self.types = types.into_iter().collect();
        self
    }

    pub fn with_resource(mut self, resource_id: impl Into<String>) -> Self {
        self.resource_id = Some(resource_id.into());
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn excluding(mut self, id: JobId) -> Self {
        self.exclude_id = Some(id);
        self
    }

    pub fn with_pagination(mut self, pagination: Option<Pagination>) -> Self {
        self.pagination = pagination;
        self
    }

    pub fn matches(&self, job: &Job) -> bool {
        (self.statuses.is_empty() || self.statuses.contains(&job.status))
            && (self.types.is_empty() || self.types.contains(&job.job_type))
            && self
                .resource_id
                .as_deref()
                .is_none_or(|id| job.resource_id() == Some(id))
            && self.user_id.as_deref().is_none_or(|u| job.user_id == u)
            && self.exclude_id.is_none_or(|id| job.id != id)
    }
}

/// The job queue.
///
/// Status transitions out of `running` are conditional: they report
/// `false` when the job is no longer running (cancelled meanwhile).
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create_job(&self, job: &Job) -> Result<(), StoreError>;

    async fn get_job(&self, id: JobId) -> Result<Option<Job>, StoreError>;

    /// Newest first.
    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError>;

    /// Atomically claim the oldest `pending` or `failed` job whose
    /// `runAfter` has passed, marking it `running`.
    async fn lease_next(&self, now: DateTime<Utc>) -> Result<Option<Job>, StoreError>;

    async fn mark_completed(&self, id: JobId) -> Result<bool, StoreError>;

    /// Back to the retry queue with a new attempt count and earliest run.
    async fn mark_failed(
        &self,
        id: JobId,
        retry_count: u32,
        run_after: DateTime<Utc>,
        error: &str,
    ) -> Result<bool, StoreError>;

    async fn mark_terminated(&self, id: JobId, reason: &str) -> Result<bool, StoreError>;

    /// Terminate a job that has not finished. Returns whether it changed.
    async fn cancel(&self, id: JobId, reason: &str) -> Result<bool, StoreError>;

    /// Return a running job to `pending` without counting an attempt.
    async fn reschedule(
        &self,
        id: JobId,
        run_after: DateTime<Utc>,
        reason: &str,
    ) -> Result<bool, StoreError>;

    /// Return every `running` job to `pending`. Used at startup to recover
    /// jobs orphaned by a crash.
    async fn reset_running(&self) -> Result<u64, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map};

    use crate::model::job::JobVersion;

    fn job(job_type: JobType, resource: &str) -> Job {
        let mut args = Map::new();
        args.insert("id".to_string(), json!(resource));
        Job::new(JobId::new(), "u1", job_type, JobVersion::V2, args)
    }

    #[test]
    fn test_filter_matches_resource_and_status() {
        let job = job(JobType::UpdateVm, "vm-1");
        let filter = JobFilter::new()
            .with_resource("vm-1")
            .with_statuses(JobStatus::NON_TERMINAL);
        assert!(filter.matches(&job));
        assert!(!filter.clone().with_resource("vm-2").matches(&job));
        assert!(!filter.excluding(job.id).matches(&job));
    }

    #[test]
    fn test_empty_filter_matches_all() {
        assert!(JobFilter::new().matches(&job(JobType::DeleteSm, "sm")));
    }
}
