//! VM snapshots.
//!
//! Snapshots are created and deleted on the hypervisor only through jobs;
//! the record's `snapshotMap` mirrors what lives there. User snapshots count
//! against quota, system snapshots do not.

use fabric_reconcile::{SsCreator, SsDeleter, WriteBack};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, instrument, warn};

use super::generator::machine_name;
use super::Vms;
use crate::job_args;
use crate::model::job::JobType;
use crate::model::vm::Vm;
use crate::model::{ActivityTag, Resource};
use crate::service::quota::{self, Delta};
use crate::service::resources::GetOpts;
use crate::service::{validate_name, JobRef, ResultExt, ServiceError};
use crate::subsystems::cs::{Snapshot, VirtualMachine};
use crate::subsystems::SubsystemError;

pub(super) const SNAPSHOT_PREFIX: &str = "subsystems.cs.snapshotMap";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotParams {
    pub name: String,
    /// Only admins may create system snapshots.
    #[serde(default = "user_created")]
    pub user_created: bool,
}

fn user_created() -> bool {
    true
}

/// A recorded snapshot by id or name.
pub fn find<'v>(vm: &'v Vm, id_or_name: &str) -> Option<&'v Snapshot> {
    let snapshots = &vm.subsystems.cs.snapshot_map;
    snapshots.get(id_or_name).or_else(|| {
        snapshots
            .values()
            .find(|s| s.id.as_deref() == Some(id_or_name))
    })
}

impl Vms<'_> {
    fn snapshots_client(&self, vm: &Vm) -> crate::service::reconcile::ObjectClient<Snapshot> {
        self.cs_client(&vm.zone, &machine_name(vm))
    }

    pub async fn list_snapshots(&self, vm_id: &str) -> Result<Vec<Snapshot>, ServiceError> {
        let vm = self.get(vm_id, GetOpts::default()).await?;
        Ok(vm.subsystems.cs.snapshot_map.into_values().collect())
    }

    pub async fn get_snapshot(&self, vm_id: &str, snapshot: &str) -> Result<Snapshot, ServiceError> {
        let vm = self.get(vm_id, GetOpts::default()).await?;
        find(&vm, snapshot)
            .cloned()
            .ok_or_else(|| ServiceError::not_found("snapshot", snapshot))
    }

    #[instrument(skip(self, params), fields(name = %params.name))]
    pub async fn create_snapshot(&self, vm_id: &str, mut params: SnapshotParams) -> Result<JobRef, ServiceError> {
        let vm = self.get(vm_id, GetOpts::default()).await?;
        if vm.has_activity(ActivityTag::BeingCreated) || vm.has_activity(ActivityTag::BeingDeleted) {
            return Err(ServiceError::ConflictingActivity(
                "cannot snapshot a vm that is being created or deleted".to_string(),
            ));
        }
        validate_name(&params.name)?;
        if self.auth.is_some_and(|auth| !auth.is_admin) {
            params.user_created = true;
        }
        if vm.subsystems.cs.snapshot_map.contains_key(&params.name) {
            return Err(ServiceError::AlreadyExists(format!("snapshot {}", params.name)));
        }
        if params.user_created {
            quota::admit(self.core, self.auth, Delta::snapshot()).await?;
        }

        let job_type = if params.user_created {
            JobType::CreateUserVmSnapshot
        } else {
            JobType::CreateSystemVmSnapshot
        };
        let job_id = self
            .enqueue(
                job_type,
                job_args! {
                    "id" => vm_id,
                    "params" => params,
                },
            )
            .await?;
        Ok(JobRef::new(vm_id, job_id))
    }

    #[instrument(skip(self))]
    pub async fn delete_snapshot(&self, vm_id: &str, snapshot: &str) -> Result<JobRef, ServiceError> {
        let vm = self.get(vm_id, GetOpts::default()).await?;
        let name = find(&vm, snapshot)
            .map(|s| s.name.clone())
            .ok_or_else(|| ServiceError::not_found("snapshot", snapshot))?;
        let job_id = self
            .enqueue(
                JobType::DeleteVmSnapshot,
                job_args! {
                    "id" => vm_id,
                    "params" => json!({ "name": name }),
                },
            )
            .await?;
        Ok(JobRef::new(vm_id, job_id))
    }

    #[instrument(skip(self))]
    pub async fn do_create_snapshot(&self, id: &str, name: &str, user_created: bool) -> Result<(), ServiceError> {
        let vm = self.repo().require(id).await?;
        if vm.subsystems.cs.vm.is_none() {
            return Err(SubsystemError::BadState(format!("vm {id} has no virtual machine yet")).into());
        }
        let snapshot = Snapshot {
            name: name.to_string(),
            vm_name: machine_name(&vm),
            description: if user_created {
                "created by user".to_string()
            } else {
                "created by system".to_string()
            },
            user_created,
            id: None,
            created_at: None,
        };
        SsCreator::new(
            &self.snapshots_client(&vm),
            &self.writer(id, format!("{SNAPSHOT_PREFIX}.{name}")),
        )
        .with_public(snapshot)
        .exec()
        .await
        .context(|| format!("create snapshot {name} of vm {id}"))?;
        info!(vm_id = %id, snapshot = name, user_created, "Snapshot created");
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn do_delete_snapshot(&self, id: &str, name: &str) -> Result<(), ServiceError> {
        let vm = self.repo().require(id).await?;
        let Some(snapshot) = find(&vm, name).cloned() else {
            return Err(SubsystemError::SnapshotNotFound(name.to_string()).into());
        };
        SsDeleter::<Snapshot, _, _>::new(
            &self.snapshots_client(&vm),
            &self.writer(id, format!("{SNAPSHOT_PREFIX}.{}", snapshot.name)),
        )
        .with_key(snapshot.name.clone())
        .exec()
        .await
        .context(|| format!("delete snapshot {name} of vm {id}"))?;
        info!(vm_id = %id, snapshot = %snapshot.name, "Snapshot deleted");
        Ok(())
    }

    /// Revert the machine to a recorded snapshot. The machine is stopped for
    /// the revert and started again afterwards.
    #[instrument(skip(self))]
    pub(super) async fn apply_snapshot(&self, id: &str, snapshot: &str) -> Result<(), ServiceError> {
        let vm = self.repo().require(id).await?;
        let Some(name) = find(&vm, snapshot).map(|s| s.name.clone()) else {
            return Err(SubsystemError::SnapshotNotFound(snapshot.to_string()).into());
        };

        let running = vm
            .subsystems
            .cs
            .vm
            .as_ref()
            .and_then(|m| m.power_state.as_deref())
            != Some("stopped");
        if running {
            self.invoke(&vm, "stop", serde_json::Value::Null).await?;
        }
        let reverted = self
            .invoke(&vm, "revertToSnapshot", json!({ "snapshot": name }))
            .await;
        let machine = match self.invoke(&vm, "start", serde_json::Value::Null).await {
            Ok(machine) => machine,
            Err(err) => {
                warn!(vm_id = %id, error = %err, "Starting the vm after revert failed");
                reverted?;
                return Err(err);
            }
        };
        WriteBack::<VirtualMachine, ServiceError>::write(&self.writer(id, "subsystems.cs.vm"), Some(&machine))
            .await?;
        reverted?;
        info!(vm_id = %id, snapshot = %name, "Snapshot applied");
        Ok(())
    }
}
