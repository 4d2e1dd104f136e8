//! Virtual machines.

use chrono::{DateTime, Utc};
use fabric_id::{GpuLeaseId, ResourceId, UserId};
use serde::{Deserialize, Serialize};

use super::job::JobVersion;
use super::{impl_resource, Activities, ResourceKind, Transfer};
use crate::db::{Collection, Document};
use crate::subsystems::cs::CsRecord;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmSpecs {
    pub cpu_cores: i64,
    /// GB
    pub ram: i64,
    /// GB
    pub disk_size: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortSpec {
    pub name: String,
    pub port: u16,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    /// Assigned from the zone's port range.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_port: Option<u16>,
}

fn default_protocol() -> String {
    "tcp".to_string()
}

/// The GPU currently attached through a lease.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachedGpu {
    pub lease_id: GpuLeaseId,
    pub gpu_group: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VmSubsystems {
    pub cs: CsRecord,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Vm {
    pub id: ResourceId,
    pub name: String,
    pub owner_id: UserId,
    pub zone: String,
    /// API generation the VM was created through.
    pub version: JobVersion,

    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repaired_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub activities: Activities,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transfer: Option<Transfer>,

    pub specs: VmSpecs,
    #[serde(default)]
    pub ssh_public_key: String,
    #[serde(default)]
    pub ports: Vec<PortSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu: Option<AttachedGpu>,

    #[serde(default)]
    pub subsystems: VmSubsystems,
}

impl Vm {
    /// Snapshots taken on the user's request; these count against quota.
    pub fn user_snapshot_count(&self) -> i64 {
        self.subsystems
            .cs
            .snapshot_map
            .values()
            .filter(|s| s.user_created)
            .count() as i64
    }
}

impl Document for Vm {
    const COLLECTION: Collection = Collection::Vms;
}

impl_resource!(Vm, ResourceKind::Vm);
