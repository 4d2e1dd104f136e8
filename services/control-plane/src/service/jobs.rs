//! Read access to the job queue, and admin cancellation.

use fabric_id::JobId;
use serde::Deserialize;
use tracing::{info, instrument};

use super::{AuthInfo, Core, ServiceError};
use crate::db::{JobFilter, Pagination};
use crate::model::job::{Job, JobStatus, JobType};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListParams {
    #[serde(default)]
    pub status: Option<JobStatus>,
    #[serde(default, rename = "type")]
    pub job_type: Option<JobType>,
    #[serde(default)]
    pub user_id: Option<String>,
    /// Admins only: every user's jobs.
    #[serde(default)]
    pub all: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateParams {
    pub status: JobStatus,
}

pub struct Jobs<'a> {
    core: &'a Core,
    auth: Option<&'a AuthInfo>,
}

impl<'a> Jobs<'a> {
    pub fn new(core: &'a Core, auth: Option<&'a AuthInfo>) -> Self {
        Self { core, auth }
    }

    pub async fn get(&self, id: JobId) -> Result<Job, ServiceError> {
        self.core
            .jobs_store()
            .get_job(id)
            .await?
            .filter(|job| {
                self.auth
                    .is_none_or(|auth| auth.is_admin || job.user_id == auth.user_id.as_str())
            })
            .ok_or_else(|| ServiceError::not_found("job", id))
    }

    pub async fn list(&self, params: &ListParams, pagination: Option<Pagination>) -> Result<Vec<Job>, ServiceError> {
        let mut filter = JobFilter::new().with_pagination(pagination);
        if let Some(status) = params.status {
            filter = filter.with_statuses([status]);
        }
        if let Some(job_type) = params.job_type {
            filter = filter.with_types([job_type]);
        }
        let user = match self.auth {
            Some(auth) if auth.is_admin => params.user_id.clone().filter(|_| !params.all),
            Some(auth) => Some(auth.user_id.as_str().to_string()),
            None => params.user_id.clone(),
        };
        if let Some(user) = user {
            filter = filter.with_user(user);
        }
        Ok(self.core.jobs_store().list_jobs(&filter).await?)
    }

    /// Only cancellation is supported: the job moves to `terminated` and a
    /// running handler stops at its next suspension point.
    #[instrument(skip(self, params))]
    pub async fn update(&self, id: JobId, params: UpdateParams) -> Result<Job, ServiceError> {
        if let Some(auth) = self.auth {
            auth.require_admin()?;
        }
        if params.status != JobStatus::Terminated {
            return Err(ServiceError::invalid("jobs can only be set to terminated"));
        }
        let job = self.get(id).await?;
        if self
            .core
            .jobs_store()
            .cancel(job.id, "cancelled by admin")
            .await?
        {
            info!(job_id = %id, job_type = %job.job_type, "Job cancelled");
        }
        self.get(id).await
    }
}
