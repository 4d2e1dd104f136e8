//! Quota admission, evaluated before a record is written or a job enqueued.

use fabric_id::UserId;
use serde::Serialize;

use super::{AuthInfo, Core, ServiceError};
use crate::config::RoleQuotas;
use crate::db::Filter;
use crate::model::deployment::Deployment;
use crate::model::vm::{Vm, VmSpecs};

/// What a user currently holds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    /// Sum of `max(replicas, 1)` over deployments.
    pub deployments: i64,
    pub cpu_cores: i64,
    pub ram: i64,
    pub disk_size: i64,
    /// User-created snapshots only.
    pub snapshots: i64,
}

/// Quantities a pending change adds on top of the current usage.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Delta {
    pub deployments: i64,
    pub cpu_cores: i64,
    pub ram: i64,
    pub disk_size: i64,
    pub snapshots: i64,
}

impl Delta {
    pub fn vm_create(specs: &VmSpecs) -> Self {
        Self {
            cpu_cores: specs.cpu_cores,
            ram: specs.ram,
            disk_size: specs.disk_size,
            ..Self::default()
        }
    }

    /// Growth of a VM from `current` to `next`; shrinking never counts.
    pub fn vm_update(current: &VmSpecs, next: &VmSpecs) -> Self {
        Self {
            cpu_cores: (next.cpu_cores - current.cpu_cores).max(0),
            ram: (next.ram - current.ram).max(0),
            disk_size: (next.disk_size - current.disk_size).max(0),
            ..Self::default()
        }
    }

    pub fn deployment_replicas(current: Option<i64>, next: i64) -> Self {
        let current = current.map(|r| r.max(1)).unwrap_or(0);
        Self {
            deployments: (next.max(1) - current).max(0),
            ..Self::default()
        }
    }

    pub fn snapshot() -> Self {
        Self {
            snapshots: 1,
            ..Self::default()
        }
    }

    fn is_zero(&self) -> bool {
        *self == Self::default()
    }
}

/// Reject the change if any quota would be exceeded.
///
/// `current` in the error is the total the user would hold afterwards.
pub fn check(usage: &Usage, delta: &Delta, quotas: &RoleQuotas) -> Result<(), ServiceError> {
    let fields: [(&'static str, i64, i64, i64); 5] = [
        ("deployments", usage.deployments, delta.deployments, quotas.deployments),
        ("cpuCores", usage.cpu_cores, delta.cpu_cores, quotas.cpu_cores),
        ("ram", usage.ram, delta.ram, quotas.ram),
        ("diskSize", usage.disk_size, delta.disk_size, quotas.disk_size),
        ("snapshots", usage.snapshots, delta.snapshots, quotas.snapshots),
    ];

    for (field, used, added, quota) in fields {
        if added > 0 && used + added > quota {
            return Err(ServiceError::QuotaExceeded {
                field,
                current: (used + added) as f64,
                quota: quota as f64,
            });
        }
    }
    Ok(())
}

/// Lease duration a user may ask for.
pub fn check_gpu_lease_duration(hours: f64, quotas: &RoleQuotas) -> Result<(), ServiceError> {
    if hours > quotas.gpu_lease_duration {
        return Err(ServiceError::QuotaExceeded {
            field: "gpuLeaseDuration",
            current: hours,
            quota: quotas.gpu_lease_duration,
        });
    }
    Ok(())
}

pub async fn usage(core: &Core, user_id: &UserId) -> Result<Usage, ServiceError> {
    let filter = Filter::new().with_owner(user_id.as_str());
    let mut usage = Usage::default();

    for deployment in core.repo::<Deployment>().find(&filter).await? {
        usage.deployments += deployment.quota_replicas();
    }
    for vm in core.repo::<Vm>().find(&filter).await? {
        usage.cpu_cores += vm.specs.cpu_cores;
        usage.ram += vm.specs.ram;
        usage.disk_size += vm.specs.disk_size;
        usage.snapshots += vm.user_snapshot_count();
    }
    Ok(usage)
}

/// Admission for the caller. Admins and system callers are not limited.
pub async fn admit(core: &Core, auth: Option<&AuthInfo>, delta: Delta) -> Result<(), ServiceError> {
    let Some(auth) = auth else {
        return Ok(());
    };
    if auth.is_admin || delta.is_zero() {
        return Ok(());
    }
    let usage = usage(core, &auth.user_id).await?;
    check(&usage, &delta, &auth.role.quotas)
}
