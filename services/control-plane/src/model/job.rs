//! Job records and their status state machine.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use fabric_id::JobId;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Handler names. Stable: they are persisted in job records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum JobType {
    #[serde(rename = "createDeployment")]
    CreateDeployment,
    #[serde(rename = "updateDeployment")]
    UpdateDeployment,
    #[serde(rename = "updateDeploymentOwner")]
    UpdateDeploymentOwner,
    #[serde(rename = "deleteDeployment")]
    DeleteDeployment,
    #[serde(rename = "repairDeployment")]
    RepairDeployment,
    #[serde(rename = "createVM")]
    CreateVm,
    #[serde(rename = "updateVM")]
    UpdateVm,
    #[serde(rename = "updateVmOwner")]
    UpdateVmOwner,
    #[serde(rename = "deleteVM")]
    DeleteVm,
    #[serde(rename = "repairVM")]
    RepairVm,
    #[serde(rename = "createSystemVmSnapshot")]
    CreateSystemVmSnapshot,
    #[serde(rename = "createUserVmSnapshot")]
    CreateUserVmSnapshot,
    #[serde(rename = "deleteVmSnapshot")]
    DeleteVmSnapshot,
    #[serde(rename = "doVmAction")]
    DoVmAction,
    #[serde(rename = "createSM")]
    CreateSm,
    #[serde(rename = "deleteSM")]
    DeleteSm,
    #[serde(rename = "repairSM")]
    RepairSm,
    #[serde(rename = "createGpuLease")]
    CreateGpuLease,
    #[serde(rename = "deleteGpuLease")]
    DeleteGpuLease,
    #[serde(rename = "attachGPU")]
    AttachGpu,
    #[serde(rename = "detachGpuFromVM")]
    DetachGpuFromVm,
}

impl JobType {
    pub const ALL: [JobType; 21] = [
        Self::CreateDeployment,
        Self::UpdateDeployment,
        Self::UpdateDeploymentOwner,
        Self::DeleteDeployment,
        Self::RepairDeployment,
        Self::CreateVm,
        Self::UpdateVm,
        Self::UpdateVmOwner,
        Self::DeleteVm,
        Self::RepairVm,
        Self::CreateSystemVmSnapshot,
        Self::CreateUserVmSnapshot,
        Self::DeleteVmSnapshot,
        Self::DoVmAction,
        Self::CreateSm,
        Self::DeleteSm,
        Self::RepairSm,
        Self::CreateGpuLease,
        Self::DeleteGpuLease,
        Self::AttachGpu,
        Self::DetachGpuFromVm,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CreateDeployment => "createDeployment",
            Self::UpdateDeployment => "updateDeployment",
            Self::UpdateDeploymentOwner => "updateDeploymentOwner",
            Self::DeleteDeployment => "deleteDeployment",
            Self::RepairDeployment => "repairDeployment",
            Self::CreateVm => "createVM",
            Self::UpdateVm => "updateVM",
            Self::UpdateVmOwner => "updateVmOwner",
            Self::DeleteVm => "deleteVM",
            Self::RepairVm => "repairVM",
            Self::CreateSystemVmSnapshot => "createSystemVmSnapshot",
            Self::CreateUserVmSnapshot => "createUserVmSnapshot",
            Self::DeleteVmSnapshot => "deleteVmSnapshot",
            Self::DoVmAction => "doVmAction",
            Self::CreateSm => "createSM",
            Self::DeleteSm => "deleteSM",
            Self::RepairSm => "repairSM",
            Self::CreateGpuLease => "createGpuLease",
            Self::DeleteGpuLease => "deleteGpuLease",
            Self::AttachGpu => "attachGPU",
            Self::DetachGpuFromVm => "detachGpuFromVM",
        }
    }

    /// Delete jobs drain other work on the resource before running.
    pub fn is_delete(&self) -> bool {
        matches!(self, Self::DeleteDeployment | Self::DeleteVm | Self::DeleteSm)
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown job type '{s}'"))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobVersion {
    V1,
    #[default]
    V2,
}

impl fmt::Display for JobVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::V1 => "v1",
            Self::V2 => "v2",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    /// Failed with a retryable error; leasable again after `runAfter`.
    Failed,
    Completed,
    Terminated,
}

impl JobStatus {
    pub const NON_TERMINAL: [JobStatus; 3] = [Self::Pending, Self::Running, Self::Failed];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Failed => "failed",
            Self::Completed => "completed",
            Self::Terminated => "terminated",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Terminated)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "failed" => Ok(Self::Failed),
            "completed" => Ok(Self::Completed),
            "terminated" => Ok(Self::Terminated),
            other => Err(format!("unknown job status '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    pub user_id: String,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub version: JobVersion,
    /// Handler arguments; `args.id` names the target resource.
    pub args: Map<String, Value>,
    pub status: JobStatus,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub run_after: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_msg: Option<String>,
}

impl Job {
    pub fn new(
        id: JobId,
        user_id: impl Into<String>,
        job_type: JobType,
        version: JobVersion,
        args: Map<String, Value>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            user_id: user_id.into(),
            job_type,
            version,
            args,
            status: JobStatus::Pending,
            retry_count: 0,
            created_at: now,
            run_after: now,
            started_at: None,
            finished_at: None,
            error_msg: None,
        }
    }

    /// Target resource id, if the job has one.
    pub fn resource_id(&self) -> Option<&str> {
        self.args.get("id").and_then(Value::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_job_type_names_round_trip() {
        for job_type in JobType::ALL {
            let json = serde_json::to_value(job_type).unwrap();
            assert_eq!(json, json!(job_type.as_str()));
            assert_eq!(job_type.as_str().parse::<JobType>().unwrap(), job_type);
        }
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Terminated.is_terminal());
        assert!(!JobStatus::Failed.is_terminal());
        assert!(JobStatus::NON_TERMINAL.iter().all(|s| !s.is_terminal()));
    }

    #[test]
    fn test_resource_id_reads_args() {
        let mut args = Map::new();
        args.insert("id".to_string(), json!("abc"));
        let job = Job::new(JobId::new(), "u1", JobType::RepairVm, JobVersion::V2, args);
        assert_eq!(job.resource_id(), Some("abc"));
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.run_after, job.created_at);
    }
}
