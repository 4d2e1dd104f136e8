//! Job handlers: parse the arguments and call the owning service.
//!
//! One handler per resource family; the job type selects the operation.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

use super::{JobError, JobResult};
use crate::model::job::{Job, JobType, JobVersion};
use crate::service::deployments::{self, Deployments};
use crate::service::gpu::{Gpus, LeaseSpec};
use crate::service::migrations;
use crate::service::sms::Sms;
use crate::service::vms::snapshots::SnapshotParams;
use crate::service::vms::{self, ActionParams, Vms};
use crate::service::Core;

#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(&self, core: &Core, job: &Job) -> JobResult<()>;
}

fn resource_id(job: &Job) -> JobResult<&str> {
    job.resource_id()
        .ok_or_else(|| JobError::terminated("bad job arguments: missing id"))
}

fn params<T: DeserializeOwned>(job: &Job) -> JobResult<T> {
    let params = job
        .args
        .get("params")
        .cloned()
        .ok_or_else(|| JobError::terminated("bad job arguments: missing params"))?;
    Ok(serde_json::from_value(params)?)
}

fn migration_id(job: &Job) -> Option<&str> {
    job.args.get("resourceMigrationId").and_then(Value::as_str)
}

fn unexpected(job: &Job, family: &str) -> JobError {
    JobError::terminated(format!("{} is not a {family} job", job.job_type))
}

pub struct DeploymentJobs;

#[async_trait]
impl JobHandler for DeploymentJobs {
    async fn run(&self, core: &Core, job: &Job) -> JobResult<()> {
        let id = resource_id(job)?;
        let svc = Deployments::new(core, None);
        match job.job_type {
            JobType::CreateDeployment => svc.do_create(id).await?,
            JobType::UpdateDeployment => {
                let params: deployments::UpdateParams = params(job)?;
                svc.do_update(id, &params).await?
            }
            JobType::UpdateDeploymentOwner => {
                let params = migrations::job_params(&job.args)?;
                svc.do_update_owner(id, &params, migration_id(job)).await?
            }
            JobType::DeleteDeployment => svc.do_delete(id).await?,
            JobType::RepairDeployment => svc.do_repair(id).await?,
            _ => return Err(unexpected(job, "deployment")),
        }
        Ok(())
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AttachParams {
    lease_id: String,
}

#[derive(Deserialize)]
struct SnapshotName {
    name: String,
}

/// VM jobs of one handler version.
pub struct VmJobs {
    pub version: JobVersion,
}

#[async_trait]
impl JobHandler for VmJobs {
    async fn run(&self, core: &Core, job: &Job) -> JobResult<()> {
        let id = resource_id(job)?;
        let svc = Vms::new(core, None).with_version(self.version);
        match job.job_type {
            JobType::CreateVm => svc.do_create(id).await?,
            JobType::UpdateVm => {
                let params: vms::UpdateParams = params(job)?;
                svc.do_update(id, &params).await?
            }
            JobType::UpdateVmOwner => {
                let params = migrations::job_params(&job.args)?;
                svc.do_update_owner(id, &params, migration_id(job)).await?
            }
            JobType::DeleteVm => svc.do_delete(id).await?,
            JobType::RepairVm => svc.do_repair(id).await?,
            JobType::CreateSystemVmSnapshot | JobType::CreateUserVmSnapshot => {
                let params: SnapshotParams = params(job)?;
                let user_created = job.job_type == JobType::CreateUserVmSnapshot;
                svc.do_create_snapshot(id, &params.name, user_created).await?
            }
            JobType::DeleteVmSnapshot => {
                let params: SnapshotName = params(job)?;
                svc.do_delete_snapshot(id, &params.name).await?
            }
            JobType::DoVmAction => {
                let params: ActionParams = params(job)?;
                svc.do_action(id, params.action).await?
            }
            JobType::AttachGpu => {
                let params: AttachParams = params(job)?;
                svc.do_attach_gpu(id, &params.lease_id).await?
            }
            JobType::DetachGpuFromVm => svc.do_detach_gpu(id).await?,
            _ => return Err(unexpected(job, "vm")),
        }
        Ok(())
    }
}

pub struct SmJobs;

#[async_trait]
impl JobHandler for SmJobs {
    async fn run(&self, core: &Core, job: &Job) -> JobResult<()> {
        let id = resource_id(job)?;
        let svc = Sms::new(core, None);
        match job.job_type {
            JobType::CreateSm => svc.do_create(id).await?,
            JobType::DeleteSm => svc.do_delete(id).await?,
            JobType::RepairSm => svc.do_repair(id).await?,
            _ => return Err(unexpected(job, "storage manager")),
        }
        Ok(())
    }
}

pub struct GpuLeaseJobs;

#[async_trait]
impl JobHandler for GpuLeaseJobs {
    async fn run(&self, core: &Core, job: &Job) -> JobResult<()> {
        let id = resource_id(job)?;
        let svc = Gpus::new(core, None);
        match job.job_type {
            JobType::CreateGpuLease => {
                let spec: LeaseSpec = params(job)?;
                svc.do_create_lease(id, &spec).await?
            }
            JobType::DeleteGpuLease => svc.do_delete_lease(id).await?,
            _ => return Err(unexpected(job, "gpu lease")),
        }
        Ok(())
    }
}
