//! Static table of job definitions keyed by `(type, version)`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use super::guards::Guard;
use super::handlers::{DeploymentJobs, GpuLeaseJobs, JobHandler, SmJobs, VmJobs};
use crate::config::JobSettings;
use crate::model::job::{JobType, JobVersion};
use crate::model::{ActivityTag, ResourceKind};

/// How one `(type, version)` runs.
#[derive(Clone)]
pub struct Definition {
    pub handler: Arc<dyn JobHandler>,
    /// Kind of the record `args.id` names, when it is a resource.
    pub kind: Option<ResourceKind>,
    pub guards: Vec<Guard>,
    /// Held on the target while the job runs.
    pub activity: Option<ActivityTag>,
    /// Delete jobs wait this long for other work on the target.
    pub drain: Option<Duration>,
}

impl Definition {
    pub fn new(handler: Arc<dyn JobHandler>) -> Self {
        Self {
            handler,
            kind: None,
            guards: Vec::new(),
            activity: None,
            drain: None,
        }
    }

    pub fn for_kind(mut self, kind: ResourceKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn with_guards(mut self, guards: impl IntoIterator<Item = Guard>) -> Self {
        self.guards = guards.into_iter().collect();
        self
    }

    pub fn with_activity(mut self, tag: ActivityTag) -> Self {
        self.activity = Some(tag);
        self
    }

    pub fn with_drain(mut self, deadline: Duration) -> Self {
        self.drain = Some(deadline);
        self
    }

    /// Whether the job needs its target to exist before it runs.
    pub fn requires_target(&self) -> bool {
        self.guards.contains(&Guard::ResourceAlive)
    }
}

pub struct Registry {
    definitions: HashMap<(JobType, JobVersion), Definition>,
}

impl Registry {
    pub fn empty() -> Self {
        Self {
            definitions: HashMap::new(),
        }
    }

    /// Every handler the control plane ships.
    pub fn new(settings: &JobSettings) -> Self {
        use Guard::*;
        use JobType::*;

        let mut registry = Self::empty();
        let mutate = [ResourceAlive, NoOwnerUpdate, OnePerResource];

        let deployments: Arc<dyn JobHandler> = Arc::new(DeploymentJobs);
        let d = Definition::new(deployments).for_kind(ResourceKind::Deployment);
        registry.register(
            CreateDeployment,
            JobVersion::V2,
            d.clone()
                .with_guards([OnePerResource])
                .with_activity(ActivityTag::BeingCreated),
        );
        registry.register(
            UpdateDeployment,
            JobVersion::V2,
            d.clone().with_guards(mutate).with_activity(ActivityTag::Updating),
        );
        registry.register(
            UpdateDeploymentOwner,
            JobVersion::V2,
            d.clone()
                .with_guards([ResourceAlive, OnePerResource])
                .with_activity(ActivityTag::Updating),
        );
        registry.register(
            DeleteDeployment,
            JobVersion::V2,
            d.clone()
                .with_guards([OnePerResource])
                .with_drain(settings.deployment_drain()),
        );
        registry.register(
            RepairDeployment,
            JobVersion::V2,
            d.with_guards(mutate).with_activity(ActivityTag::Repairing),
        );

        for version in [JobVersion::V1, JobVersion::V2] {
            let handler: Arc<dyn JobHandler> = Arc::new(VmJobs { version });
            let vm = Definition::new(handler).for_kind(ResourceKind::Vm);
            registry.register(
                CreateVm,
                version,
                vm.clone()
                    .with_guards([OnePerResource])
                    .with_activity(ActivityTag::BeingCreated),
            );
            registry.register(
                UpdateVm,
                version,
                vm.clone().with_guards(mutate).with_activity(ActivityTag::Updating),
            );
            registry.register(
                UpdateVmOwner,
                version,
                vm.clone()
                    .with_guards([ResourceAlive, OnePerResource])
                    .with_activity(ActivityTag::Updating),
            );
            registry.register(
                DeleteVm,
                version,
                vm.clone()
                    .with_guards([OnePerResource])
                    .with_drain(settings.vm_drain()),
            );
            registry.register(
                RepairVm,
                version,
                vm.clone().with_guards(mutate).with_activity(ActivityTag::Repairing),
            );
            if version == JobVersion::V1 {
                continue;
            }

            registry.register(CreateSystemVmSnapshot, version, vm.clone().with_guards(mutate));
            registry.register(
                CreateUserVmSnapshot,
                version,
                vm.clone()
                    .with_guards([ResourceAlive, NoOwnerUpdate, OnePerResource, OneUserSnapshotPerUser]),
            );
            registry.register(DeleteVmSnapshot, version, vm.clone().with_guards(mutate));
            registry.register(DoVmAction, version, vm.clone().with_guards(mutate));
            registry.register(
                AttachGpu,
                version,
                vm.clone().with_guards(mutate).with_activity(ActivityTag::AttachingGpu),
            );
            // The VM may already be gone; detaching then only frees the lease.
            registry.register(
                DetachGpuFromVm,
                version,
                vm.with_guards([OnePerResource])
                    .with_activity(ActivityTag::DetachingGpu),
            );
        }

        let sms: Arc<dyn JobHandler> = Arc::new(SmJobs);
        let sm = Definition::new(sms).for_kind(ResourceKind::StorageManager);
        registry.register(
            CreateSm,
            JobVersion::V2,
            sm.clone()
                .with_guards([OnePerResource])
                .with_activity(ActivityTag::BeingCreated),
        );
        registry.register(
            DeleteSm,
            JobVersion::V2,
            sm.clone()
                .with_guards([OnePerResource])
                .with_drain(settings.deployment_drain()),
        );
        registry.register(
            RepairSm,
            JobVersion::V2,
            sm.with_guards([ResourceAlive, OnePerResource])
                .with_activity(ActivityTag::Repairing),
        );

        let leases = Definition::new(Arc::new(GpuLeaseJobs)).with_guards([OnePerResource]);
        registry.register(CreateGpuLease, JobVersion::V2, leases.clone());
        registry.register(DeleteGpuLease, JobVersion::V2, leases);

        registry
    }

    pub fn register(&mut self, job_type: JobType, version: JobVersion, definition: Definition) {
        self.definitions.insert((job_type, version), definition);
    }

    pub fn get(&self, job_type: JobType, version: JobVersion) -> Option<&Definition> {
        self.definitions.get(&(job_type, version))
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_type_has_a_v2_handler() {
        let registry = Registry::new(&JobSettings::default());
        for job_type in JobType::ALL {
            assert!(
                registry.get(job_type, JobVersion::V2).is_some(),
                "{job_type} has no v2 handler"
            );
        }
    }

    #[test]
    fn test_v1_covers_legacy_vm_jobs_only() {
        let registry = Registry::new(&JobSettings::default());
        let v1: Vec<_> = JobType::ALL
            .into_iter()
            .filter(|t| registry.get(*t, JobVersion::V1).is_some())
            .collect();
        assert_eq!(
            v1,
            vec![
                JobType::CreateVm,
                JobType::UpdateVm,
                JobType::UpdateVmOwner,
                JobType::DeleteVm,
                JobType::RepairVm
            ]
        );
        assert_eq!(registry.len(), JobType::ALL.len() + 5);
    }

    #[test]
    fn test_deletes_drain() {
        let settings = JobSettings::default();
        let registry = Registry::new(&settings);
        let drain = |t| registry.get(t, JobVersion::V2).and_then(|d| d.drain);
        assert_eq!(drain(JobType::DeleteVm), Some(settings.vm_drain()));
        assert_eq!(drain(JobType::DeleteDeployment), Some(settings.deployment_drain()));
        assert_eq!(drain(JobType::DeleteSm), Some(settings.deployment_drain()));
        assert_eq!(drain(JobType::RepairVm), None);
    }
}
