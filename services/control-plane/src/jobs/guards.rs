//! Preconditions evaluated before a job runs.
//!
//! Guards only read the job queue and the target record. A guard that
//! reschedules puts the job back to `pending` without spending an attempt.

use crate::db::JobFilter;
use crate::model::job::{Job, JobStatus, JobType};
use crate::model::{ActivityTag, ResourceKind};
use crate::service::{Core, ServiceError};

use super::target;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Proceed,
    Reschedule(String),
    Terminate(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Guard {
    /// The target exists and is not being deleted.
    ResourceAlive,
    /// No owner update of the target is running.
    NoOwnerUpdate,
    /// No other job of the same type runs against the same target.
    OnePerResource,
    /// A user takes one snapshot at a time.
    OneUserSnapshotPerUser,
}

const OWNER_UPDATES: [JobType; 2] = [JobType::UpdateDeploymentOwner, JobType::UpdateVmOwner];

async fn any_running(core: &Core, filter: JobFilter) -> Result<bool, ServiceError> {
    let filter = filter.with_statuses([JobStatus::Running]);
    Ok(!core.jobs_store().list_jobs(&filter).await?.is_empty())
}

impl Guard {
    pub async fn check(
        self,
        core: &Core,
        job: &Job,
        kind: Option<ResourceKind>,
    ) -> Result<Verdict, ServiceError> {
        let Some(id) = job.resource_id() else {
            return Ok(Verdict::Terminate("job has no target id".to_string()));
        };

        match self {
            Self::ResourceAlive => {
                let Some(kind) = kind else {
                    return Ok(Verdict::Proceed);
                };
                Ok(match target::activities(core, kind, id).await? {
                    None => Verdict::Terminate(format!("{kind} {id} not found")),
                    Some(tags) if tags.contains_key(&ActivityTag::BeingDeleted) => {
                        Verdict::Terminate(format!("{kind} {id} is being deleted"))
                    }
                    Some(_) => Verdict::Proceed,
                })
            }
            Self::NoOwnerUpdate => {
                let filter = JobFilter::new()
                    .with_types(OWNER_UPDATES)
                    .with_resource(id)
                    .excluding(job.id);
                Ok(if any_running(core, filter).await? {
                    Verdict::Reschedule("owner update in progress".to_string())
                } else {
                    Verdict::Proceed
                })
            }
            Self::OnePerResource => {
                let filter = JobFilter::new()
                    .with_types([job.job_type])
                    .with_resource(id)
                    .excluding(job.id);
                Ok(if any_running(core, filter).await? {
                    Verdict::Reschedule(format!("another {} job is running for {id}", job.job_type))
                } else {
                    Verdict::Proceed
                })
            }
            Self::OneUserSnapshotPerUser => {
                let filter = JobFilter::new()
                    .with_types([JobType::CreateUserVmSnapshot])
                    .with_user(job.user_id.as_str())
                    .excluding(job.id);
                Ok(if any_running(core, filter).await? {
                    Verdict::Reschedule("user already has a snapshot in progress".to_string())
                } else {
                    Verdict::Proceed
                })
            }
        }
    }
}
