//! VM service.
//!
//! A VM is one hypervisor machine plus a forwarding rule per public port.
//! Public ports are leased from the zone's range; snapshots and GPU
//! attachment live in their own submodules.

pub mod generator;
pub mod gpu;
pub mod ports;
pub mod snapshots;

use std::collections::{BTreeMap, BTreeSet};

use chrono::Utc;
use fabric_id::UserId;
use fabric_reconcile::{SsCreator, SsDeleter, WriteBack};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use self::generator::machine_name;
use super::activity::can_add_activity;
use super::auth::effective_owner;
use super::quota::{self, Delta};
use super::reconcile::{repair_map, repair_one, ObjectClient, RecordWriter};
use super::resources::{self, GetOpts, ListOpts};
use super::{
    migrations, notifications, teams, validate_name, AuthInfo, Core, JobRef, ResultExt,
    ServiceError,
};
use crate::db::{Collection, Filter, Patch, Repo};
use crate::job_args;
use crate::model::job::{JobType, JobVersion};
use crate::model::migration::UpdateOwnerParams;
use crate::model::vm::{PortSpec, Vm, VmSpecs};
use crate::model::{Activity, ActivityTag, Resource};
use crate::subsystems::cs::{PortForwardingRule, Snapshot, VirtualMachine};
use crate::subsystems::SubsystemError;

const RULE_PREFIX: &str = "subsystems.cs.portForwardingRuleMap";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortParams {
    pub name: String,
    pub port: u16,
    #[serde(default = "default_protocol")]
    pub protocol: String,
}

fn default_protocol() -> String {
    "tcp".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateParams {
    pub name: String,
    #[serde(default)]
    pub zone: Option<String>,
    pub cpu_cores: i64,
    pub ram: i64,
    pub disk_size: i64,
    pub ssh_public_key: String,
    #[serde(default)]
    pub ports: Vec<PortParams>,
    /// Admins may create on behalf of another user.
    #[serde(default)]
    pub owner_id: Option<UserId>,
}

/// Only the fields present are changed. A snapshot to apply takes
/// precedence over every other field.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_cores: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ram: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_size: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ports: Option<Vec<PortParams>>,
    /// Revert the VM to this snapshot (id or name).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_id: Option<String>,
}

impl UpdateParams {
    fn changes_spec(&self) -> bool {
        self.name.is_some()
            || self.cpu_cores.is_some()
            || self.ram.is_some()
            || self.disk_size.is_some()
            || self.ports.is_some()
    }

    fn specs(&self, current: &VmSpecs) -> VmSpecs {
        VmSpecs {
            cpu_cores: self.cpu_cores.unwrap_or(current.cpu_cores),
            ram: self.ram.unwrap_or(current.ram),
            disk_size: self.disk_size.unwrap_or(current.disk_size),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum VmAction {
    Start,
    Stop,
    Restart,
}

impl VmAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Restart => "restart",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionParams {
    pub action: VmAction,
}

fn validate_specs(specs: &VmSpecs) -> Result<(), ServiceError> {
    if specs.cpu_cores < 1 || specs.ram < 1 || specs.disk_size < 1 {
        return Err(ServiceError::invalid(
            "cpuCores, ram and diskSize must be positive",
        ));
    }
    Ok(())
}

fn validate_ports(ports: &[PortParams]) -> Result<(), ServiceError> {
    let mut names = BTreeSet::new();
    for port in ports {
        validate_name(&port.name)?;
        if port.port == 0 {
            return Err(ServiceError::invalid(format!("port {} must be non-zero", port.name)));
        }
        if !matches!(port.protocol.as_str(), "tcp" | "udp") {
            return Err(ServiceError::invalid(format!(
                "protocol of port {} must be tcp or udp",
                port.name
            )));
        }
        if !names.insert(port.name.as_str()) {
            return Err(ServiceError::invalid(format!("duplicate port name {}", port.name)));
        }
    }
    Ok(())
}

/// Port specs for `requested`, keeping the public port of unchanged entries.
fn merge_ports(current: &[PortSpec], requested: &[PortParams]) -> Vec<PortSpec> {
    requested
        .iter()
        .map(|p| PortSpec {
            name: p.name.clone(),
            port: p.port,
            protocol: p.protocol.clone(),
            public_port: current
                .iter()
                .find(|c| c.name == p.name && c.port == p.port && c.protocol == p.protocol)
                .and_then(|c| c.public_port),
        })
        .collect()
}

pub struct Vms<'a> {
    core: &'a Core,
    auth: Option<&'a AuthInfo>,
    version: JobVersion,
}

impl<'a> Vms<'a> {
    pub fn new(core: &'a Core, auth: Option<&'a AuthInfo>) -> Self {
        Self {
            core,
            auth,
            version: JobVersion::V2,
        }
    }

    /// Requests go through the given API generation.
    pub fn with_version(mut self, version: JobVersion) -> Self {
        self.version = version;
        self
    }

    fn repo(&self) -> Repo<'a, Vm> {
        self.core.repo()
    }

    fn job_user(&self) -> Result<UserId, ServiceError> {
        match self.auth {
            Some(auth) => Ok(auth.user_id.clone()),
            None => self.core.manager_id(),
        }
    }

    fn cs_client<T: crate::subsystems::PublicObject>(&self, zone: &str, scope: &str) -> ObjectClient<T> {
        ObjectClient::new(&self.core.subsystems.cs, zone, scope)
    }

    fn writer(&self, id: &str, path: impl Into<String>) -> RecordWriter<'a> {
        RecordWriter::new(self.core.store.as_ref(), Collection::Vms, id, path)
    }

    pub async fn get(&self, id: &str, opts: GetOpts) -> Result<Vm, ServiceError> {
        resources::get(self.core, self.auth, id, opts).await
    }

    pub async fn list(&self, opts: &ListOpts) -> Result<Vec<Vm>, ServiceError> {
        resources::list(self.core, self.auth, opts).await
    }

    async fn get_for(&self, id: &str, tag: ActivityTag) -> Result<Vm, ServiceError> {
        let vm = self.get(id, GetOpts::default()).await?;
        let (allowed, reason) = can_add_activity(&self.repo(), id, tag).await?;
        if !allowed {
            return Err(ServiceError::ConflictingActivity(reason));
        }
        Ok(vm)
    }

    async fn enqueue(&self, job_type: JobType, args: serde_json::Map<String, serde_json::Value>) -> Result<fabric_id::JobId, ServiceError> {
        self.core
            .enqueue(&self.job_user()?, job_type, self.version, args)
            .await
    }

    // =========================================================================
    // Requests
    // =========================================================================

    #[instrument(skip(self, params), fields(name = %params.name))]
    pub async fn create(&self, params: CreateParams) -> Result<JobRef, ServiceError> {
        if let Some(auth) = self.auth {
            if !auth.role.permissions.use_vms {
                return Err(ServiceError::Forbidden("role may not create vms".to_string()));
            }
        }
        validate_name(&params.name)?;
        let specs = VmSpecs {
            cpu_cores: params.cpu_cores,
            ram: params.ram,
            disk_size: params.disk_size,
        };
        validate_specs(&specs)?;
        validate_ports(&params.ports)?;
        if params.ssh_public_key.trim().is_empty() {
            return Err(ServiceError::invalid("sshPublicKey is required"));
        }
        let zone = self.core.zone(params.zone.as_deref())?.clone();

        let owner_id = match self.auth {
            Some(auth) => effective_owner(auth, params.owner_id.as_ref())?,
            None => params
                .owner_id
                .clone()
                .ok_or_else(|| ServiceError::invalid("ownerId is required"))?,
        };
        quota::admit(self.core, self.auth, Delta::vm_create(&specs)).await?;

        let mut vm = Vm {
            id: fabric_id::ResourceId::new(),
            name: params.name.clone(),
            owner_id: owner_id.clone(),
            zone: zone.name.clone(),
            version: self.version,
            created_at: Utc::now(),
            updated_at: None,
            repaired_at: None,
            deleted_at: None,
            activities: Default::default(),
            transfer: None,
            specs,
            ssh_public_key: params.ssh_public_key.clone(),
            ports: merge_ports(&[], &params.ports),
            host: None,
            gpu: None,
            subsystems: Default::default(),
        };
        vm.activities
            .insert(ActivityTag::BeingCreated, Activity::new(ActivityTag::BeingCreated));

        self.repo().insert(&vm).await?;
        let id = vm.id.to_string();
        let job_id = self
            .enqueue(
                JobType::CreateVm,
                job_args! {
                    "id" => id,
                    "ownerId" => owner_id.as_str(),
                    "params" => params,
                },
            )
            .await?;
        Ok(JobRef::new(id, job_id))
    }

    #[instrument(skip(self, params))]
    pub async fn update(&self, id: &str, params: UpdateParams) -> Result<JobRef, ServiceError> {
        let current = self.get_for(id, ActivityTag::Updating).await?;

        if let Some(snapshot) = &params.snapshot_id {
            if snapshots::find(&current, snapshot).is_none() {
                return Err(SubsystemError::SnapshotNotFound(snapshot.clone()).into());
            }
        } else {
            if let Some(name) = &params.name {
                validate_name(name)?;
                if name != &current.name
                    && self.repo().exists(&Filter::new().with_name(name.as_str())).await?
                {
                    return Err(ServiceError::NonUniqueField(format!("name {name}")));
                }
            }
            if let Some(ports) = &params.ports {
                validate_ports(ports)?;
            }
            let next = params.specs(&current.specs);
            validate_specs(&next)?;
            if next.disk_size < current.specs.disk_size {
                return Err(ServiceError::invalid("diskSize cannot shrink"));
            }
            quota::admit(self.core, self.auth, Delta::vm_update(&current.specs, &next)).await?;
        }

        let job_id = self
            .enqueue(
                JobType::UpdateVm,
                job_args! {
                    "id" => id,
                    "params" => params,
                },
            )
            .await?;
        Ok(JobRef::new(id, job_id))
    }

    #[instrument(skip(self))]
    pub async fn delete(&self, id: &str) -> Result<JobRef, ServiceError> {
        self.get_for(id, ActivityTag::BeingDeleted).await?;
        let job_id = self.enqueue(JobType::DeleteVm, job_args! { "id" => id }).await?;
        Ok(JobRef::new(id, job_id))
    }

    #[instrument(skip(self))]
    pub async fn repair(&self, id: &str) -> Result<JobRef, ServiceError> {
        self.get_for(id, ActivityTag::Repairing).await?;
        let job_id = self.enqueue(JobType::RepairVm, job_args! { "id" => id }).await?;
        Ok(JobRef::new(id, job_id))
    }

    #[instrument(skip(self))]
    pub async fn action(&self, id: &str, params: ActionParams) -> Result<JobRef, ServiceError> {
        let vm = self.get(id, GetOpts::default()).await?;
        if vm.has_activity(ActivityTag::BeingCreated) || vm.has_activity(ActivityTag::BeingDeleted) {
            return Err(ServiceError::ConflictingActivity(format!(
                "cannot {} a vm that is being created or deleted",
                params.action.as_str()
            )));
        }
        let job_id = self
            .enqueue(
                JobType::DoVmAction,
                job_args! {
                    "id" => id,
                    "params" => params,
                },
            )
            .await?;
        Ok(JobRef::new(id, job_id))
    }

    // =========================================================================
    // Job side
    // =========================================================================

    /// Set up the hypervisor objects of a freshly inserted VM.
    ///
    /// On failure the VM is repaired to clean up partial state, except for
    /// v2 VMs when that is switched off in the job settings, and the failure
    /// is final.
    #[instrument(skip(self))]
    pub async fn do_create(&self, id: &str) -> Result<(), ServiceError> {
        let vm = self.repo().require(id).await?;
        self.core.zone_with(&vm.zone, "vm")?;

        if let Err(err) = self.create_subsystems(&vm).await {
            let repair = match vm.version {
                JobVersion::V1 => true,
                JobVersion::V2 => self.core.config.jobs.repair_on_v2_vm_create_failure,
            };
            if repair {
                if let Err(repair_err) = self.do_repair(id).await {
                    warn!(vm_id = %id, error = %repair_err, "Repair after failed create failed");
                }
            }
            return Err(err.context(format!("create vm {id}")).abandon());
        }

        info!(vm_id = %id, name = %vm.name, "VM created");
        Ok(())
    }

    async fn create_subsystems(&self, vm: &Vm) -> Result<(), ServiceError> {
        let id = vm.id.to_string();
        self.place(vm).await?;
        let vm = self.repo().require(&id).await?;
        let host = vm.host.clone().unwrap_or_default();
        let objects = generator::cs(&vm, &host);

        SsCreator::new(
            &self.cs_client::<VirtualMachine>(&vm.zone, ""),
            &self.writer(&id, "subsystems.cs.vm"),
        )
        .with_public(objects.vm)
        .exec()
        .await
        .context(|| "create virtual machine".to_string())?;

        let rules = self.cs_client::<PortForwardingRule>(&vm.zone, &machine_name(&vm));
        for (name, rule) in objects.rules {
            SsCreator::new(&rules, &self.writer(&id, format!("{RULE_PREFIX}.{name}")))
                .with_public(rule)
                .exec()
                .await
                .context(|| format!("create port forwarding rule {name}"))?;
        }
        Ok(())
    }

    /// Pin the host and lease public ports for every port spec, releasing
    /// leases of ports that are gone.
    async fn place(&self, vm: &Vm) -> Result<(), ServiceError> {
        let id = vm.id.to_string();
        let zone = self.core.zone(Some(&vm.zone))?;
        let mut patch = Patch::new();

        if vm.host.is_none() {
            let host = generator::pick_host(vm, zone, &self.core.config)?;
            patch = patch.set("host", host);
        }

        let mut ports = vm.ports.clone();
        for port in ports.iter_mut().filter(|p| p.public_port.is_none()) {
            let public = ports::allocate(self.core, zone, vm.id, &vm.owner_id, &port.name).await?;
            port.public_port = Some(public);
        }
        if ports != vm.ports {
            patch = patch.set("ports", serde_json::to_value(&ports)?);
        }

        let held = self
            .core
            .repo::<crate::model::worker::VmPort>()
            .find(&Filter::new().with_eq("vmId", id.as_str()))
            .await?;
        for lease in held.iter().filter(|l| !ports.iter().any(|p| p.name == l.port_name)) {
            ports::release(self.core, vm.id, &lease.port_name).await?;
        }

        if !patch.is_empty() {
            self.repo().update(&id, &patch).await?;
        }
        Ok(())
    }

    /// Apply `params` to the record and converge the hypervisor.
    #[instrument(skip(self, params))]
    pub async fn do_update(&self, id: &str, params: &UpdateParams) -> Result<(), ServiceError> {
        if let Some(snapshot) = &params.snapshot_id {
            if params.changes_spec() {
                warn!(vm_id = %id, "Snapshot apply requested together with a spec change, discarding the spec change");
            }
            return self.apply_snapshot(id, snapshot).await;
        }

        let current = self.repo().require(id).await?;
        let specs = params.specs(&current.specs);
        let mut patch = Patch::new().set_some("name", params.name.clone());
        if specs != current.specs {
            patch = patch.set("specs", serde_json::to_value(specs)?);
        }
        if let Some(ports) = &params.ports {
            patch = patch.set("ports", serde_json::to_value(merge_ports(&current.ports, ports))?);
        }
        if !patch.is_empty() {
            let patch = patch.set("updatedAt", serde_json::to_value(Utc::now())?);
            self.repo().update(id, &patch).await?;
        }

        self.converge(id).await.context(|| format!("update vm {id}"))?;
        info!(vm_id = %id, "VM updated");
        Ok(())
    }

    /// Hand the VM to a new owner. Hypervisor objects are not owner scoped;
    /// an attached GPU belongs to the previous owner's lease and is detached.
    #[instrument(skip(self, params), fields(new_owner = %params.new_owner_id))]
    pub async fn do_update_owner(
        &self,
        id: &str,
        params: &UpdateOwnerParams,
        migration_id: Option<&str>,
    ) -> Result<(), ServiceError> {
        let vm = self.repo().require(id).await?;
        if vm.gpu.is_some() && vm.owner_id != params.new_owner_id {
            self.detach_gpu(id).await?;
        }

        let patch = Patch::new()
            .set("ownerId", params.new_owner_id.as_str())
            .unset("transfer")
            .set("updatedAt", serde_json::to_value(Utc::now())?);
        self.repo().update(id, &patch).await?;
        ports::reassign(self.core, vm.id, &params.new_owner_id).await?;

        self.converge(id)
            .await
            .context(|| format!("update owner of vm {id}"))?;

        notifications::complete_transfer(self.core, id).await?;
        if let Some(migration_id) = migration_id {
            migrations::remove(self.core, migration_id).await?;
        }
        info!(vm_id = %id, "VM owner updated");
        Ok(())
    }

    /// Tear down the hypervisor objects, release the ports and hide the record.
    #[instrument(skip(self))]
    pub async fn do_delete(&self, id: &str) -> Result<(), ServiceError> {
        let Some(vm) = self.repo().get(id).await? else {
            return Ok(());
        };

        notifications::delete_for_resource(self.core, id).await?;
        migrations::delete_for_resource(self.core, id).await?;
        teams::clean_resource(self.core, id).await?;
        if vm.gpu.is_some() {
            self.detach_gpu(id).await?;
        }

        let scope = machine_name(&vm);
        let recorded = &vm.subsystems.cs;
        let rules = self.cs_client::<PortForwardingRule>(&vm.zone, &scope);
        for (name, rule) in &recorded.port_forwarding_rule_map {
            SsDeleter::<PortForwardingRule, _, _>::new(&rules, &self.writer(id, format!("{RULE_PREFIX}.{name}")))
                .with_key(rule.name.clone())
                .exec()
                .await
                .context(|| format!("delete port forwarding rule {name} of vm {id}"))?;
        }
        let snapshots = self.cs_client::<Snapshot>(&vm.zone, &scope);
        for name in recorded.snapshot_map.keys() {
            SsDeleter::<Snapshot, _, _>::new(
                &snapshots,
                &self.writer(id, format!("{}.{name}", snapshots::SNAPSHOT_PREFIX)),
            )
            .with_key(name.clone())
            .exec()
            .await
            .context(|| format!("delete snapshot {name} of vm {id}"))?;
        }
        SsDeleter::<VirtualMachine, _, _>::new(
            &self.cs_client::<VirtualMachine>(&vm.zone, ""),
            &self.writer(id, "subsystems.cs.vm"),
        )
        .with_key(scope.clone())
        .exec()
        .await
        .context(|| format!("delete virtual machine of vm {id}"))?;

        ports::release_all(self.core, vm.id).await?;
        self.repo().soft_delete(id).await?;
        info!(vm_id = %id, "VM deleted");
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn do_repair(&self, id: &str) -> Result<(), ServiceError> {
        self.converge(id)
            .await
            .context(|| format!("repair vm {id}"))?;
        self.repo()
            .set_path(id, "repairedAt", &Utc::now())
            .await?;
        info!(vm_id = %id, "VM repaired");
        Ok(())
    }

    /// Converge the hypervisor against the current record. Returns whether
    /// anything was written.
    async fn converge(&self, id: &str) -> Result<bool, ServiceError> {
        let vm = self.repo().require(id).await?;
        self.place(&vm).await?;
        let vm = self.repo().require(id).await?;
        let host = vm.host.clone().unwrap_or_default();
        let objects = generator::cs(&vm, &host);
        let scope = machine_name(&vm);
        let store = self.core.store.as_ref();

        let mut changed = repair_one(
            &self.cs_client::<VirtualMachine>(&vm.zone, ""),
            store,
            Collection::Vms,
            id,
            "subsystems.cs.vm",
            vm.subsystems.cs.vm.as_ref(),
            Some(objects.vm),
        )
        .await?
        .changed();

        changed |= repair_map(
            &self.cs_client::<PortForwardingRule>(&vm.zone, &scope),
            store,
            Collection::Vms,
            id,
            RULE_PREFIX,
            &vm.subsystems.cs.port_forwarding_rule_map,
            objects.rules,
        )
        .await?;

        self.refresh_snapshots(&vm).await?;
        Ok(changed)
    }

    /// Record the snapshots that live on the hypervisor. Snapshots are never
    /// recreated; one that vanished is dropped from the record.
    async fn refresh_snapshots(&self, vm: &Vm) -> Result<(), ServiceError> {
        let live: BTreeMap<String, Snapshot> = self
            .cs_client::<Snapshot>(&vm.zone, &machine_name(vm))
            .list()
            .await?
            .into_iter()
            .map(|s| (s.name.clone(), s))
            .collect();
        if live != vm.subsystems.cs.snapshot_map {
            self.repo()
                .update(
                    &vm.id.to_string(),
                    &Patch::new().set(snapshots::SNAPSHOT_PREFIX, serde_json::to_value(&live)?),
                )
                .await?;
        }
        Ok(())
    }

    /// Power action on the hypervisor machine.
    #[instrument(skip(self))]
    pub async fn do_action(&self, id: &str, action: VmAction) -> Result<(), ServiceError> {
        let vm = self.repo().require(id).await?;
        let machine = self.invoke(&vm, action.as_str(), serde_json::Value::Null).await?;
        WriteBack::<VirtualMachine, ServiceError>::write(&self.writer(id, "subsystems.cs.vm"), Some(&machine))
            .await?;
        info!(vm_id = %id, action = action.as_str(), "VM action done");
        Ok(())
    }

    async fn invoke(&self, vm: &Vm, action: &str, args: serde_json::Value) -> Result<VirtualMachine, ServiceError> {
        if vm.subsystems.cs.vm.is_none() {
            return Err(SubsystemError::BadState(format!(
                "vm {} has no virtual machine yet",
                vm.id
            ))
            .into());
        }
        self.cs_client::<VirtualMachine>(&vm.zone, "")
            .invoke(&machine_name(vm), action, args)
            .await
            .context(|| format!("{action} vm {}", vm.id))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// A VM record in the default zone, without subsystem state.
    pub fn vm(owner: &str, name: &str) -> Vm {
        Vm {
            id: fabric_id::ResourceId::new(),
            name: name.to_string(),
            owner_id: UserId::parse(owner).unwrap(),
            zone: "dev".into(),
            version: JobVersion::V2,
            created_at: Utc::now(),
            updated_at: None,
            repaired_at: None,
            deleted_at: None,
            activities: Default::default(),
            transfer: None,
            specs: VmSpecs {
                cpu_cores: 2,
                ram: 4,
                disk_size: 20,
            },
            ssh_public_key: "ssh-ed25519 AAAA alice".into(),
            ports: vec![],
            host: None,
            gpu: None,
            subsystems: Default::default(),
        }
    }

    pub fn params(name: &str) -> CreateParams {
        CreateParams {
            name: name.to_string(),
            cpu_cores: 2,
            ram: 4,
            disk_size: 20,
            ssh_public_key: "ssh-ed25519 AAAA alice".into(),
            ports: vec![PortParams {
                name: "ssh".into(),
                port: 22,
                protocol: "tcp".into(),
            }],
            ..Default::default()
        }
    }

    /// Create through the service and run the create job body, leaving the
    /// VM without activities.
    pub async fn created(core: &Core, auth: &AuthInfo, name: &str) -> String {
        let job = Vms::new(core, Some(auth)).create(params(name)).await.unwrap();
        Vms::new(core, None).do_create(&job.id).await.unwrap();
        crate::service::activity::remove_activity(&core.repo::<Vm>(), &job.id, ActivityTag::BeingCreated)
            .await
            .unwrap();
        job.id
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{created, params};
    use super::*;
    use crate::config::FabricConfig;
    use crate::db::JobFilter;
    use crate::model::worker::VmPort;
    use crate::service::testing;
    use crate::subsystems::simulated::Operation;
    use crate::subsystems::ObjectKind;

    #[tokio::test]
    async fn test_create_records_machine_and_rules() {
        let t = testing::core();
        let alice = t.user("alice").await;
        let id = created(&t.core, &alice, "box").await;

        let vm = t.core.repo::<Vm>().require(&id).await.unwrap();
        assert!(vm.host.is_some());
        let public = vm.ports[0].public_port.unwrap();
        assert!((30000..30100).contains(&public));

        let machine = vm.subsystems.cs.vm.unwrap();
        assert_eq!(machine.power_state.as_deref(), Some("running"));
        assert!(machine.id.is_some());
        assert_eq!(vm.subsystems.cs.port_forwarding_rule_map["ssh"].public_port, public);
        assert_eq!(t.core.repo::<VmPort>().count(&Filter::new()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_quota_rejection_writes_nothing() {
        let t = testing::core();
        let alice = t.user("alice").await;
        let mut big = params("big");
        big.cpu_cores = 5;

        let err = Vms::new(&t.core, Some(&alice)).create(big).await.unwrap_err();
        match err {
            ServiceError::QuotaExceeded { field, current, quota } => {
                assert_eq!(field, "cpuCores");
                assert_eq!((current, quota), (5.0, 4.0));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(t.core.repo::<Vm>().count(&Filter::new()).await.unwrap(), 0);
        assert!(t.core.store.list_jobs(&JobFilter::new()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_role_without_vms_is_forbidden() {
        let mut config = FabricConfig::default();
        config.roles[0].permissions.use_vms = false;
        let t = testing::core_with(config);
        let alice = t.user("alice").await;
        let err = Vms::new(&t.core, Some(&alice)).create(params("box")).await.unwrap_err();
        assert!(matches!(err, ServiceError::Forbidden(_)));
    }

    #[tokio::test]
    async fn test_failed_create_is_repaired_for_v1() {
        let t = testing::core();
        let alice = t.user("alice").await;
        let job = Vms::new(&t.core, Some(&alice))
            .with_version(JobVersion::V1)
            .create(params("box"))
            .await
            .unwrap();
        t.sim.cs.fail_next(
            ObjectKind::PortForwardingRule,
            Operation::Create,
            SubsystemError::Transient("injected".into()),
        );

        let err = Vms::new(&t.core, None).do_create(&job.id).await.unwrap_err();
        assert!(err.is_terminal());
        assert!(matches!(err.subsystem(), Some(SubsystemError::Transient(_))));

        // The repair in the failure path already created the rule.
        let vm = t.core.repo::<Vm>().require(&job.id).await.unwrap();
        assert!(vm.subsystems.cs.port_forwarding_rule_map.contains_key("ssh"));
    }

    #[tokio::test]
    async fn test_failed_v2_create_without_repair_leaves_partial_state() {
        let mut config = FabricConfig::default();
        config.jobs.repair_on_v2_vm_create_failure = false;
        let t = testing::core_with(config);
        let alice = t.user("alice").await;
        let job = Vms::new(&t.core, Some(&alice)).create(params("box")).await.unwrap();
        t.sim.cs.fail_next(
            ObjectKind::PortForwardingRule,
            Operation::Create,
            SubsystemError::Transient("injected".into()),
        );

        let err = Vms::new(&t.core, None).do_create(&job.id).await.unwrap_err();
        assert!(err.is_terminal());

        let vm = t.core.repo::<Vm>().require(&job.id).await.unwrap();
        assert!(vm.subsystems.cs.vm.is_some());
        assert!(vm.subsystems.cs.port_forwarding_rule_map.is_empty());
    }

    #[tokio::test]
    async fn test_update_resizes_and_reports_growth_to_quota() {
        let t = testing::core();
        let alice = t.user("alice").await;
        let id = created(&t.core, &alice, "box").await;
        let svc = Vms::new(&t.core, Some(&alice));

        let err = svc
            .update(&id, UpdateParams { cpu_cores: Some(8), ..Default::default() })
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::QuotaExceeded { .. }));

        let update = UpdateParams {
            cpu_cores: Some(4),
            ..Default::default()
        };
        svc.update(&id, update.clone()).await.unwrap();
        Vms::new(&t.core, None).do_update(&id, &update).await.unwrap();

        let vm = t.core.repo::<Vm>().require(&id).await.unwrap();
        assert_eq!(vm.specs.cpu_cores, 4);
        assert_eq!(vm.subsystems.cs.vm.unwrap().cpu_cores, 4);
    }

    #[tokio::test]
    async fn test_rename_keeps_the_machine() {
        let t = testing::core();
        let alice = t.user("alice").await;
        let id = created(&t.core, &alice, "box").await;
        let before = t.sim.cs.writes_for(ObjectKind::VirtualMachine);

        Vms::new(&t.core, None)
            .do_update(&id, &UpdateParams { name: Some("crate".into()), ..Default::default() })
            .await
            .unwrap();

        assert_eq!(t.sim.cs.writes_for(ObjectKind::VirtualMachine), before);
        assert_eq!(t.core.repo::<Vm>().require(&id).await.unwrap().name, "crate");
    }

    #[tokio::test]
    async fn test_removed_port_releases_lease_and_rule() {
        let t = testing::core();
        let alice = t.user("alice").await;
        let id = created(&t.core, &alice, "box").await;

        Vms::new(&t.core, None)
            .do_update(&id, &UpdateParams { ports: Some(vec![]), ..Default::default() })
            .await
            .unwrap();

        let vm = t.core.repo::<Vm>().require(&id).await.unwrap();
        assert!(vm.subsystems.cs.port_forwarding_rule_map.is_empty());
        assert!(t.sim.cs.objects(ObjectKind::PortForwardingRule).is_empty());
        assert_eq!(t.core.repo::<VmPort>().count(&Filter::new()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_repair_is_idempotent() {
        let t = testing::core();
        let alice = t.user("alice").await;
        let id = created(&t.core, &alice, "box").await;
        let svc = Vms::new(&t.core, None);

        svc.do_repair(&id).await.unwrap();
        let writes = t.sim.writes();
        svc.do_repair(&id).await.unwrap();
        assert_eq!(t.sim.writes(), writes);
    }

    #[tokio::test]
    async fn test_repair_recreates_deleted_machine() {
        let t = testing::core();
        let alice = t.user("alice").await;
        let id = created(&t.core, &alice, "box").await;
        let (key, _) = t.sim.cs.objects(ObjectKind::VirtualMachine).remove(0);
        t.sim.cs.remove_raw(&key);

        Vms::new(&t.core, None).do_repair(&id).await.unwrap();
        assert_eq!(t.sim.cs.objects(ObjectKind::VirtualMachine).len(), 1);
    }

    #[tokio::test]
    async fn test_delete_removes_everything() {
        let t = testing::core();
        let alice = t.user("alice").await;
        let id = created(&t.core, &alice, "box").await;

        Vms::new(&t.core, None).do_delete(&id).await.unwrap();

        assert!(t.core.repo::<Vm>().get(&id).await.unwrap().is_none());
        assert!(t.sim.cs.objects(ObjectKind::VirtualMachine).is_empty());
        assert!(t.sim.cs.objects(ObjectKind::PortForwardingRule).is_empty());
        assert_eq!(t.core.repo::<VmPort>().count(&Filter::new()).await.unwrap(), 0);
        // A second run finds nothing to do.
        Vms::new(&t.core, None).do_delete(&id).await.unwrap();
    }

    #[tokio::test]
    async fn test_power_actions() {
        let t = testing::core();
        let alice = t.user("alice").await;
        let id = created(&t.core, &alice, "box").await;
        let svc = Vms::new(&t.core, None);

        svc.do_action(&id, VmAction::Stop).await.unwrap();
        let vm = t.core.repo::<Vm>().require(&id).await.unwrap();
        assert_eq!(vm.subsystems.cs.vm.unwrap().power_state.as_deref(), Some("stopped"));

        svc.do_action(&id, VmAction::Start).await.unwrap();
        let vm = t.core.repo::<Vm>().require(&id).await.unwrap();
        assert_eq!(vm.subsystems.cs.vm.unwrap().power_state.as_deref(), Some("running"));
    }

    #[tokio::test]
    async fn test_update_owner_moves_port_leases() {
        let t = testing::core();
        let alice = t.user("alice").await;
        let id = created(&t.core, &alice, "box").await;
        let bob = UserId::parse("bob").unwrap();

        let params = UpdateOwnerParams {
            new_owner_id: bob.clone(),
            old_owner_id: alice.user_id.clone(),
        };
        let svc = Vms::new(&t.core, None);
        svc.do_update_owner(&id, &params, None).await.unwrap();
        // Reapplying yields the same state.
        svc.do_update_owner(&id, &params, None).await.unwrap();

        let vm = t.core.repo::<Vm>().require(&id).await.unwrap();
        assert_eq!(vm.owner_id, bob);
        let leases = t.core.repo::<VmPort>().find(&Filter::new()).await.unwrap();
        assert!(leases.iter().all(|l| l.user_id == bob));
    }

    #[test]
    fn test_merge_ports_keeps_public_port_of_unchanged_entries() {
        let current = vec![PortSpec {
            name: "ssh".into(),
            port: 22,
            protocol: "tcp".into(),
            public_port: Some(30001),
        }];
        let requested = vec![
            PortParams { name: "ssh".into(), port: 22, protocol: "tcp".into() },
            PortParams { name: "web".into(), port: 80, protocol: "tcp".into() },
        ];
        let merged = merge_ports(&current, &requested);
        assert_eq!(merged[0].public_port, Some(30001));
        assert_eq!(merged[1].public_port, None);

        let moved = vec![PortParams { name: "ssh".into(), port: 2222, protocol: "tcp".into() }];
        assert_eq!(merge_ports(&current, &moved)[0].public_port, None);
    }

    #[test]
    fn test_validate_ports() {
        let dup = vec![
            PortParams { name: "ssh".into(), port: 22, protocol: "tcp".into() },
            PortParams { name: "ssh".into(), port: 23, protocol: "tcp".into() },
        ];
        assert!(validate_ports(&dup).is_err());
        let bad_protocol = vec![PortParams { name: "ssh".into(), port: 22, protocol: "sctp".into() }];
        assert!(validate_ports(&bad_protocol).is_err());
    }
}
