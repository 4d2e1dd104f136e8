//! Attaching leased GPUs to VMs.
//!
//! The lease's `vmId` is claimed with a compare-and-set, so of two attaches
//! racing for one lease exactly one wins; the loser returns without effect.

use chrono::Utc;
use fabric_id::ResourceId;
use tracing::{info, instrument};

use super::Vms;
use crate::db::{Condition, Filter, Patch, PatchOutcome};
use crate::model::gpu::GpuLease;
use crate::model::vm::AttachedGpu;
use crate::service::{ResultExt, ServiceError};
use crate::subsystems::SubsystemError;

/// Point the lease at `vm_id` unless it already points somewhere. Returns
/// whether this call made the claim.
pub(crate) async fn claim(core: &crate::service::Core, lease_id: &str, vm_id: ResourceId) -> Result<bool, ServiceError> {
    let patch = Patch::new()
        .set("vmId", vm_id.to_string())
        .when(Condition::Missing("vmId".to_string()));
    match core.repo::<GpuLease>().patch(lease_id, &patch).await? {
        PatchOutcome::Applied => Ok(true),
        PatchOutcome::GuardFailed => Ok(false),
        PatchOutcome::NotFound => Err(ServiceError::not_found("gpuLease", lease_id)),
    }
}

impl Vms<'_> {
    /// Attach the GPU of `lease_id` to the VM, activating the lease on its
    /// first attach.
    #[instrument(skip(self))]
    pub async fn do_attach_gpu(&self, id: &str, lease_id: &str) -> Result<(), ServiceError> {
        let vm = self.repo().require(id).await?;
        let leases = self.core.repo::<GpuLease>();
        let lease = leases
            .get(lease_id)
            .await?
            .filter(|l| l.user_id == vm.owner_id)
            .ok_or_else(|| ServiceError::not_found("gpuLease", lease_id))?;

        let now = Utc::now();
        if lease.assigned_at.is_none() {
            return Err(SubsystemError::BadState(format!("gpu lease {lease_id} is still queued")).into());
        }
        if lease.is_expired(now) {
            return Err(SubsystemError::BadState(format!("gpu lease {lease_id} has expired")).into());
        }

        if let Some(current) = vm.gpu.as_ref().filter(|g| g.lease_id != lease.id) {
            info!(vm_id = %id, lease_id = %current.lease_id, "Replacing attached gpu");
            self.detach_gpu(id).await?;
        }
        match lease.vm_id {
            Some(vm_id) if vm_id == vm.id => {}
            Some(other) => {
                info!(lease_id, from = %other, to = %id, "Moving gpu to another vm");
                self.detach_gpu(&other.to_string()).await?;
                if !claim(self.core, lease_id, vm.id).await? {
                    info!(vm_id = %id, lease_id, "Gpu claimed concurrently, leaving it");
                    return Ok(());
                }
            }
            None => {
                if !claim(self.core, lease_id, vm.id).await? {
                    info!(vm_id = %id, lease_id, "Gpu claimed concurrently, leaving it");
                    return Ok(());
                }
            }
        }

        if lease.activated_at.is_none() {
            let activate = Patch::new()
                .set("activatedAt", serde_json::to_value(now)?)
                .set("endsAt", serde_json::to_value(lease.ends_at_from(now))?)
                .when(Condition::Missing("activatedAt".to_string()));
            if leases.patch(lease_id, &activate).await?.applied() {
                info!(lease_id, "Gpu lease activated by first attach");
            }
        }

        let attached = AttachedGpu {
            lease_id: lease.id,
            gpu_group: lease.gpu_group.clone(),
        };
        self.repo().set_path(id, "gpu", &attached).await?;
        self.converge(id)
            .await
            .context(|| format!("attach gpu to vm {id}"))?;
        info!(vm_id = %id, lease_id, gpu_group = %lease.gpu_group, "Gpu attached");
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn do_detach_gpu(&self, id: &str) -> Result<(), ServiceError> {
        self.detach_gpu(id).await?;
        info!(vm_id = %id, "Gpu detached");
        Ok(())
    }

    /// Remove the GPU from the machine and release every lease pointing at
    /// the VM. A VM that is gone only has its leases released.
    pub(super) async fn detach_gpu(&self, id: &str) -> Result<(), ServiceError> {
        if let Some(vm) = self.repo().get(id).await? {
            if vm.gpu.is_some() {
                self.repo().unset_path(id, "gpu").await?;
                self.converge(id)
                    .await
                    .context(|| format!("detach gpu from vm {id}"))?;
            }
        }

        let leases = self.core.repo::<GpuLease>();
        for lease in leases.find(&Filter::new().with_eq("vmId", id)).await? {
            let release = Patch::new()
                .unset("vmId")
                .when(Condition::Eq("vmId".to_string(), id.into()));
            leases.patch(&lease.id.to_string(), &release).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use fabric_id::{GpuLeaseId, UserId};

    use super::super::testing::created;
    use super::*;
    use crate::model::vm::Vm;
    use crate::service::testing;
    use crate::subsystems::ObjectKind;

    async fn lease(t: &testing::TestCore, owner: &str, assigned: bool) -> String {
        let lease = GpuLease {
            id: GpuLeaseId::new(),
            gpu_group: "nvidia-a100".into(),
            user_id: UserId::parse(owner).unwrap(),
            vm_id: None,
            lease_duration_hours: 10.0,
            created_at: Utc::now(),
            assigned_at: assigned.then(Utc::now),
            activated_at: None,
            ends_at: None,
            expired_at: None,
        };
        t.core.repo::<GpuLease>().insert(&lease).await.unwrap();
        lease.id.to_string()
    }

    #[tokio::test]
    async fn test_first_attach_activates() {
        let t = testing::core();
        let alice = t.user("alice").await;
        let id = created(&t.core, &alice, "box").await;
        let lease_id = lease(&t, "alice", true).await;
        let svc = Vms::new(&t.core, None);

        svc.do_attach_gpu(&id, &lease_id).await.unwrap();

        let lease = t.core.repo::<GpuLease>().require(&lease_id).await.unwrap();
        assert_eq!(lease.vm_id.map(|v| v.to_string()), Some(id.clone()));
        let activated = lease.activated_at.unwrap();
        assert_eq!(lease.ends_at, Some(activated + Duration::hours(10)));
        let (_, machine) = t.sim.cs.objects(ObjectKind::VirtualMachine).remove(0);
        assert_eq!(machine["gpu"], "nvidia-a100");

        // Attaching again changes nothing.
        let writes = t.sim.writes();
        svc.do_attach_gpu(&id, &lease_id).await.unwrap();
        assert_eq!(t.sim.writes(), writes);
        let again = t.core.repo::<GpuLease>().require(&lease_id).await.unwrap();
        assert_eq!(again.activated_at, Some(activated));
    }

    #[tokio::test]
    async fn test_queued_or_foreign_lease_is_rejected() {
        let t = testing::core();
        let alice = t.user("alice").await;
        let id = created(&t.core, &alice, "box").await;
        let svc = Vms::new(&t.core, None);

        let queued = lease(&t, "alice", false).await;
        let err = svc.do_attach_gpu(&id, &queued).await.unwrap_err();
        assert!(err.is_terminal());

        let foreign = lease(&t, "bob", true).await;
        assert!(svc.do_attach_gpu(&id, &foreign).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_claim_has_one_winner() {
        let t = testing::core();
        let lease_id = lease(&t, "alice", true).await;
        let (a, b) = (ResourceId::new(), ResourceId::new());

        assert!(claim(&t.core, &lease_id, a).await.unwrap());
        assert!(!claim(&t.core, &lease_id, b).await.unwrap());
        let lease = t.core.repo::<GpuLease>().require(&lease_id).await.unwrap();
        assert_eq!(lease.vm_id, Some(a));
    }

    #[tokio::test]
    async fn test_attach_moves_gpu_between_vms() {
        let t = testing::core();
        let alice = t.user("alice").await;
        let first = created(&t.core, &alice, "one").await;
        let second = created(&t.core, &alice, "two").await;
        let lease_id = lease(&t, "alice", true).await;
        let svc = Vms::new(&t.core, None);

        svc.do_attach_gpu(&first, &lease_id).await.unwrap();
        svc.do_attach_gpu(&second, &lease_id).await.unwrap();

        let vms = t.core.repo::<Vm>();
        assert!(vms.require(&first).await.unwrap().gpu.is_none());
        assert!(vms.require(&second).await.unwrap().gpu.is_some());
        let lease = t.core.repo::<GpuLease>().require(&lease_id).await.unwrap();
        assert_eq!(lease.vm_id.map(|v| v.to_string()), Some(second));
    }

    #[tokio::test]
    async fn test_detach_releases_lease() {
        let t = testing::core();
        let alice = t.user("alice").await;
        let id = created(&t.core, &alice, "box").await;
        let lease_id = lease(&t, "alice", true).await;
        let svc = Vms::new(&t.core, None);
        svc.do_attach_gpu(&id, &lease_id).await.unwrap();

        svc.do_detach_gpu(&id).await.unwrap();

        let lease = t.core.repo::<GpuLease>().require(&lease_id).await.unwrap();
        assert!(lease.vm_id.is_none());
        assert!(lease.activated_at.is_some());
        let (_, machine) = t.sim.cs.objects(ObjectKind::VirtualMachine).remove(0);
        assert!(machine.get("gpu").is_none());
    }
}
