//! GPU groups and the lease queue.
//!
//! Leases of one group queue in creation order. The first `total` unexpired
//! leases are assigned; an assigned lease activates when first attached to a
//! VM, or on its own a day after assignment. The synchronizer advances the
//! queue and expires leases; attaching and detaching run as VM jobs.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use fabric_id::{GpuLeaseId, ResourceId, UserId};
use serde::{Deserialize, Deserializer, Serialize};
use tracing::{info, instrument, warn};

use super::activity::can_add_activity;
use super::quota;
use super::vms::Vms;
use super::{AuthInfo, Core, JobRef, ServiceError};
use crate::db::{Filter, Pagination, Patch, SortOrder};
use crate::job_args;
use crate::model::gpu::{GpuGroup, GpuLease, ACTIVATION_FALLBACK_HOURS, FOREVER_HOURS};
use crate::model::job::{JobType, JobVersion};
use crate::model::vm::Vm;
use crate::model::ActivityTag;

/// Position of a lease with `before` unexpired leases created ahead of it in
/// a group of `total` GPUs. Zero means it holds (or is about to hold) a GPU.
pub fn queue_position(before: usize, total: i64) -> i64 {
    (before as i64 - total + 1).max(0)
}

/// When a lease is expected to run out, assuming no extension. Queued leases
/// have no estimate.
fn expected_end(lease: &GpuLease) -> Option<DateTime<Utc>> {
    if lease.ends_at.is_some() {
        return lease.ends_at;
    }
    let activation = lease.assigned_at? + Duration::hours(ACTIVATION_FALLBACK_HOURS);
    Some(lease.ends_at_from(activation))
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupView {
    #[serde(flatten)]
    pub group: GpuGroup,
    /// Unexpired leases in the group.
    pub leases: usize,
    pub available: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaseView {
    #[serde(flatten)]
    pub lease: GpuLease,
    pub queue_position: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_available_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateLeaseParams {
    pub gpu_group_id: String,
    /// Defaults to the role's maximum.
    #[serde(default)]
    pub lease_duration_hours: Option<f64>,
    /// Admins only.
    #[serde(default)]
    pub lease_forever: bool,
}

/// What the create job inserts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaseSpec {
    pub gpu_group_id: String,
    pub user_id: UserId,
    pub lease_duration_hours: f64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateLeaseParams {
    /// A VM id attaches, `null` detaches, absent leaves the lease alone.
    #[serde(default, deserialize_with = "present")]
    pub vm_id: Option<Option<ResourceId>>,
}

fn present<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    T::deserialize(deserializer).map(Some)
}

/// Mirror the configured groups into the `gpuGroups` collection.
pub async fn ensure_groups(core: &Core) -> Result<(), ServiceError> {
    let repo = core.repo::<GpuGroup>();
    let config = &core.config;
    for group in config.gpu_groups.iter().filter(|g| !config.is_excluded_gpu(&g.name)) {
        repo.upsert(&GpuGroup::from(group)).await?;
    }
    for stale in repo.find(&Filter::new()).await? {
        if config.gpu_group(&stale.name).is_none() || config.is_excluded_gpu(&stale.name) {
            repo.remove(&stale.id).await?;
        }
    }
    Ok(())
}

/// Unexpired leases of `group`, oldest first.
async fn queue(core: &Core, group: &str, now: DateTime<Utc>) -> Result<Vec<GpuLease>, ServiceError> {
    let leases = core
        .repo::<GpuLease>()
        .find(
            &Filter::new()
                .with_eq("gpuGroup", group)
                .with_sort(SortOrder::CreatedAtAsc),
        )
        .await?;
    Ok(leases.into_iter().filter(|l| !l.is_expired(now)).collect())
}

pub struct Gpus<'a> {
    core: &'a Core,
    auth: Option<&'a AuthInfo>,
}

impl<'a> Gpus<'a> {
    pub fn new(core: &'a Core, auth: Option<&'a AuthInfo>) -> Self {
        Self { core, auth }
    }

    fn job_user(&self) -> Result<UserId, ServiceError> {
        match self.auth {
            Some(auth) => Ok(auth.user_id.clone()),
            None => self.core.manager_id(),
        }
    }

    async fn group_view(&self, group: GpuGroup) -> Result<GroupView, ServiceError> {
        let now = Utc::now();
        let queued = queue(self.core, &group.name, now).await?;
        let active = queued.iter().filter(|l| l.is_active(now)).count() as i64;
        Ok(GroupView {
            available: (group.total - active).max(0),
            leases: queued.len(),
            group,
        })
    }

    pub async fn list_groups(&self) -> Result<Vec<GroupView>, ServiceError> {
        let mut views = Vec::new();
        for group in self.core.repo::<GpuGroup>().find(&Filter::new()).await? {
            views.push(self.group_view(group).await?);
        }
        views.sort_by(|a, b| a.group.name.cmp(&b.group.name));
        Ok(views)
    }

    pub async fn get_group(&self, id: &str) -> Result<GroupView, ServiceError> {
        let group = self
            .core
            .repo::<GpuGroup>()
            .get(id)
            .await?
            .ok_or_else(|| ServiceError::not_found("gpuGroup", id))?;
        self.group_view(group).await
    }

    async fn lease_view(&self, lease: GpuLease) -> Result<LeaseView, ServiceError> {
        let now = Utc::now();
        let total = self
            .core
            .config
            .gpu_group(&lease.gpu_group)
            .map(|g| g.total)
            .unwrap_or(0);
        let queued = queue(self.core, &lease.gpu_group, now).await?;
        let Some(index) = queued.iter().position(|l| l.id == lease.id) else {
            return Ok(LeaseView {
                lease,
                queue_position: 0,
                estimated_available_at: None,
            });
        };

        let queue_position = queue_position(index, total);
        let estimated_available_at = if queue_position == 0 {
            None
        } else {
            queued[..index].iter().filter_map(expected_end).min()
        };
        Ok(LeaseView {
            lease,
            queue_position,
            estimated_available_at,
        })
    }

    async fn lease(&self, id: &str) -> Result<GpuLease, ServiceError> {
        self.core
            .repo::<GpuLease>()
            .get(id)
            .await?
            .filter(|l| self.auth.is_none_or(|auth| auth.owns(&l.user_id)))
            .ok_or_else(|| ServiceError::not_found("gpuLease", id))
    }

    pub async fn get_lease(&self, id: &str) -> Result<LeaseView, ServiceError> {
        let lease = self.lease(id).await?;
        self.lease_view(lease).await
    }

    /// The caller's leases; everyone's for admins asking for `all`.
    pub async fn list_leases(
        &self,
        user_id: Option<&UserId>,
        all: bool,
        pagination: Option<Pagination>,
    ) -> Result<Vec<LeaseView>, ServiceError> {
        let mut filter = Filter::new().with_pagination(pagination);
        match self.auth {
            Some(auth) if !(auth.is_admin && all) => {
                let owner = match user_id {
                    Some(user) if auth.is_admin => user.clone(),
                    _ => auth.user_id.clone(),
                };
                filter = filter.with_eq("userId", owner.as_str());
            }
            _ => {
                if let Some(user) = user_id {
                    filter = filter.with_eq("userId", user.as_str());
                }
            }
        }
        let mut views = Vec::new();
        for lease in self.core.repo::<GpuLease>().find(&filter).await? {
            views.push(self.lease_view(lease).await?);
        }
        Ok(views)
    }

    #[instrument(skip(self, params), fields(group = %params.gpu_group_id))]
    pub async fn create_lease(&self, params: CreateLeaseParams) -> Result<JobRef, ServiceError> {
        let config = &self.core.config;
        let group = config
            .gpu_group(&params.gpu_group_id)
            .filter(|g| !config.is_excluded_gpu(&g.name))
            .ok_or_else(|| ServiceError::not_found("gpuGroup", &params.gpu_group_id))?;

        let user_id = self.job_user()?;
        let hours = match self.auth {
            Some(auth) => {
                if !auth.role.permissions.use_gpus {
                    return Err(ServiceError::Forbidden("role may not lease gpus".to_string()));
                }
                if config.is_privileged_gpu(&group.name) && !auth.role.permissions.use_privileged_gpus {
                    return Err(ServiceError::Forbidden(format!(
                        "role may not lease gpus of group {}",
                        group.name
                    )));
                }
                if params.lease_forever {
                    auth.require_admin()?;
                    FOREVER_HOURS
                } else {
                    let hours = params
                        .lease_duration_hours
                        .unwrap_or(auth.role.quotas.gpu_lease_duration);
                    if hours <= 0.0 {
                        return Err(ServiceError::invalid("leaseDurationHours must be positive"));
                    }
                    quota::check_gpu_lease_duration(hours, &auth.role.quotas)?;
                    hours
                }
            }
            None if params.lease_forever => FOREVER_HOURS,
            None => params
                .lease_duration_hours
                .ok_or_else(|| ServiceError::invalid("leaseDurationHours is required"))?,
        };

        let held = self
            .core
            .repo::<GpuLease>()
            .exists(
                &Filter::new()
                    .with_eq("userId", user_id.as_str())
                    .with_eq("gpuGroup", group.name.as_str()),
            )
            .await?;
        if held {
            return Err(ServiceError::AlreadyExists(format!(
                "gpu lease for group {}",
                group.name
            )));
        }

        let id = GpuLeaseId::new().to_string();
        let spec = LeaseSpec {
            gpu_group_id: group.name.clone(),
            user_id: user_id.clone(),
            lease_duration_hours: hours,
        };
        let job_id = self
            .core
            .enqueue(
                &user_id,
                JobType::CreateGpuLease,
                JobVersion::V2,
                job_args! {
                    "id" => id,
                    "params" => spec,
                },
            )
            .await?;
        Ok(JobRef::new(id, job_id))
    }

    /// Attach the lease to a VM of its owner, or detach it.
    #[instrument(skip(self, params))]
    pub async fn update_lease(&self, id: &str, params: UpdateLeaseParams) -> Result<Option<JobRef>, ServiceError> {
        let lease = self.lease(id).await?;
        let user_id = self.job_user()?;
        let Some(target) = params.vm_id else {
            return Ok(None);
        };

        let Some(vm_id) = target else {
            let Some(attached) = lease.vm_id else {
                return Ok(None);
            };
            let vm_id = attached.to_string();
            let job_id = self
                .core
                .enqueue(&user_id, JobType::DetachGpuFromVm, JobVersion::V2, job_args! { "id" => vm_id })
                .await?;
            return Ok(Some(JobRef::new(vm_id, job_id)));
        };

        let vm_id = vm_id.to_string();
        let vm: Vm = Vms::new(self.core, self.auth)
            .get(&vm_id, Default::default())
            .await?;
        if vm.owner_id != lease.user_id {
            return Err(ServiceError::Forbidden(
                "the gpu lease and the vm must have the same owner".to_string(),
            ));
        }
        let now = Utc::now();
        if lease.assigned_at.is_none() {
            return Err(ServiceError::invalid(format!("gpu lease {id} is still queued")));
        }
        if lease.is_expired(now) {
            return Err(ServiceError::invalid(format!("gpu lease {id} has expired")));
        }
        let (allowed, reason) = can_add_activity(&self.core.repo::<Vm>(), &vm_id, ActivityTag::AttachingGpu).await?;
        if !allowed {
            return Err(ServiceError::ConflictingActivity(reason));
        }

        let job_id = self
            .core
            .enqueue(
                &user_id,
                JobType::AttachGpu,
                JobVersion::V2,
                job_args! {
                    "id" => vm_id,
                    "params" => serde_json::json!({ "leaseId": id }),
                },
            )
            .await?;
        Ok(Some(JobRef::new(vm_id, job_id)))
    }

    #[instrument(skip(self))]
    pub async fn delete_lease(&self, id: &str) -> Result<JobRef, ServiceError> {
        self.lease(id).await?;
        let job_id = self
            .core
            .enqueue(&self.job_user()?, JobType::DeleteGpuLease, JobVersion::V2, job_args! { "id" => id })
            .await?;
        Ok(JobRef::new(id, job_id))
    }

    // =========================================================================
    // Job side
    // =========================================================================

    #[instrument(skip(self, spec))]
    pub async fn do_create_lease(&self, id: &str, spec: &LeaseSpec) -> Result<(), ServiceError> {
        let repo = self.core.repo::<GpuLease>();
        if repo.get_including_deleted(id).await?.is_some() {
            return Ok(());
        }
        let lease = GpuLease {
            id: GpuLeaseId::parse(id).map_err(|e| ServiceError::invalid(format!("lease id: {e}")))?,
            gpu_group: spec.gpu_group_id.clone(),
            user_id: spec.user_id.clone(),
            vm_id: None,
            lease_duration_hours: spec.lease_duration_hours,
            created_at: Utc::now(),
            assigned_at: None,
            activated_at: None,
            ends_at: None,
            expired_at: None,
        };
        repo.insert(&lease).await?;
        info!(lease_id = %id, group = %spec.gpu_group_id, user_id = %spec.user_id, "Gpu lease created");
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn do_delete_lease(&self, id: &str) -> Result<(), ServiceError> {
        let repo = self.core.repo::<GpuLease>();
        let Some(lease) = repo.get(id).await? else {
            return Ok(());
        };
        if let Some(vm_id) = lease.vm_id {
            Vms::new(self.core, None).do_detach_gpu(&vm_id.to_string()).await?;
        }
        repo.remove(id).await?;
        info!(lease_id = %id, "Gpu lease deleted");
        Ok(())
    }
}

/// What one synchronizer pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub removed_unknown: usize,
    pub expired: usize,
    pub assigned: usize,
    pub activated: usize,
    pub evicted: usize,
}

/// One pass of the lease synchronizer at `now`.
#[instrument(skip(core))]
pub async fn sync(core: &Core, now: DateTime<Utc>) -> Result<SyncReport, ServiceError> {
    ensure_groups(core).await?;
    let repo = core.repo::<GpuLease>();
    let config = &core.config;
    let manager = core.manager_id()?;
    let mut report = SyncReport::default();

    let detach = |vm_id: ResourceId| {
        let manager = manager.clone();
        async move {
            core.enqueue(
                &manager,
                JobType::DetachGpuFromVm,
                JobVersion::V2,
                job_args! { "id" => vm_id.to_string() },
            )
            .await
        }
    };

    let mut by_group: BTreeMap<String, Vec<GpuLease>> = BTreeMap::new();
    for lease in repo.find(&Filter::new().with_sort(SortOrder::CreatedAtAsc)).await? {
        if config.gpu_group(&lease.gpu_group).is_none() || config.is_excluded_gpu(&lease.gpu_group) {
            warn!(lease_id = %lease.id, group = %lease.gpu_group, "Removing lease of unknown gpu group");
            if let Some(vm_id) = lease.vm_id {
                detach(vm_id).await?;
            }
            repo.remove(&lease.id.to_string()).await?;
            report.removed_unknown += 1;
            continue;
        }
        by_group.entry(lease.gpu_group.clone()).or_default().push(lease);
    }

    for (group, leases) in by_group {
        let total = config.gpu_group(&group).map(|g| g.total).unwrap_or(0);
        let mut waiting = Vec::new();
        let mut expired = Vec::new();

        for lease in leases {
            let id = lease.id.to_string();
            if lease.expired_at.is_some() {
                expired.push(lease);
                continue;
            }
            if lease.ends_at.is_some_and(|end| end <= now) {
                repo.update(&id, &Patch::new().set("expiredAt", serde_json::to_value(now)?))
                    .await?;
                if let Some(vm_id) = lease.vm_id {
                    detach(vm_id).await?;
                }
                info!(lease_id = %id, group = %group, "Gpu lease expired");
                report.expired += 1;
                expired.push(GpuLease {
                    expired_at: Some(now),
                    ..lease
                });
                continue;
            }

            let position = queue_position(waiting.len(), total);
            if position == 0 {
                if lease.assigned_at.is_none() {
                    repo.update(&id, &Patch::new().set("assignedAt", serde_json::to_value(now)?))
                        .await?;
                    info!(lease_id = %id, group = %group, "Gpu lease assigned");
                    report.assigned += 1;
                } else if lease.activated_at.is_none()
                    && lease
                        .assigned_at
                        .is_some_and(|at| now - at >= Duration::hours(ACTIVATION_FALLBACK_HOURS))
                {
                    let activate = Patch::new()
                        .set("activatedAt", serde_json::to_value(now)?)
                        .set("endsAt", serde_json::to_value(lease.ends_at_from(now))?)
                        .when(crate::db::Condition::Missing("activatedAt".to_string()));
                    if repo.patch(&id, &activate).await?.applied() {
                        info!(lease_id = %id, group = %group, "Gpu lease activated without attach");
                        report.activated += 1;
                    }
                }
            }
            waiting.push(lease);
        }

        // Expired leases block their owners from queueing again; make room
        // for as many as are waiting, longest expired first.
        let over = (waiting.len() as i64 - total).max(0) as usize;
        expired.sort_by_key(|l| l.expired_at);
        for lease in expired.into_iter().filter(|l| l.vm_id.is_none()).take(over) {
            repo.remove(&lease.id.to_string()).await?;
            info!(lease_id = %lease.id, group = %group, "Expired gpu lease evicted");
            report.evicted += 1;
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::config::FabricConfig;
    use crate::db::{JobFilter, JobStore};
    use crate::service::testing;

    #[rstest]
    #[case(0, 1, 0)]
    #[case(1, 1, 1)]
    #[case(3, 1, 3)]
    #[case(1, 2, 0)]
    #[case(2, 2, 1)]
    fn test_queue_position(#[case] before: usize, #[case] total: i64, #[case] expected: i64) {
        assert_eq!(queue_position(before, total), expected);
    }

    async fn create(t: &testing::TestCore, auth: &AuthInfo) -> String {
        let job = Gpus::new(&t.core, Some(auth))
            .create_lease(CreateLeaseParams {
                gpu_group_id: "nvidia-a100".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        let queued = t.core.store.get_job(job.job_id).await.unwrap().unwrap();
        let spec: LeaseSpec = serde_json::from_value(queued.args["params"].clone()).unwrap();
        Gpus::new(&t.core, None).do_create_lease(&job.id, &spec).await.unwrap();
        job.id
    }

    #[tokio::test]
    async fn test_one_lease_per_group() {
        let t = testing::core();
        let alice = t.user("alice").await;
        let id = create(&t, &alice).await;

        let lease = t.core.repo::<GpuLease>().require(&id).await.unwrap();
        assert_eq!(lease.lease_duration_hours, 168.0);

        let err = Gpus::new(&t.core, Some(&alice))
            .create_lease(CreateLeaseParams {
                gpu_group_id: "nvidia-a100".into(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_duration_bounded_by_role() {
        let t = testing::core();
        let alice = t.user("alice").await;
        let svc = Gpus::new(&t.core, Some(&alice));

        let err = svc
            .create_lease(CreateLeaseParams {
                gpu_group_id: "nvidia-a100".into(),
                lease_duration_hours: Some(200.0),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::QuotaExceeded { field: "gpuLeaseDuration", .. }));

        let err = svc
            .create_lease(CreateLeaseParams {
                gpu_group_id: "nvidia-a100".into(),
                lease_forever: true,
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Forbidden(_)));
    }

    #[tokio::test]
    async fn test_unknown_or_privileged_group() {
        let mut config = FabricConfig::default();
        config.privileged_gpus = vec!["nvidia-a100".into()];
        let t = testing::core_with(config);
        let alice = t.user("alice").await;
        let svc = Gpus::new(&t.core, Some(&alice));

        let err = svc
            .create_lease(CreateLeaseParams { gpu_group_id: "tpu".into(), ..Default::default() })
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        let err = svc
            .create_lease(CreateLeaseParams { gpu_group_id: "nvidia-a100".into(), ..Default::default() })
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Forbidden(_)));
    }

    #[tokio::test]
    async fn test_queue_advances_and_estimates() {
        let t = testing::core();
        let alice = t.user("alice").await;
        let bob = t.user("bob").await;
        let first = create(&t, &alice).await;
        let second = create(&t, &bob).await;

        let now = Utc::now();
        let report = sync(&t.core, now).await.unwrap();
        assert_eq!(report.assigned, 1);

        let svc = Gpus::new(&t.core, None);
        let head = svc.get_lease(&first).await.unwrap();
        assert_eq!(head.queue_position, 0);
        assert!(head.lease.assigned_at.is_some());

        let behind = svc.get_lease(&second).await.unwrap();
        assert_eq!(behind.queue_position, 1);
        let estimate = behind.estimated_available_at.unwrap();
        let expected = now + Duration::hours(ACTIVATION_FALLBACK_HOURS) + Duration::hours(168);
        assert!((estimate - expected).num_seconds().abs() < 5);

        // Bob only sees his own lease.
        let bobs = Gpus::new(&t.core, Some(&bob)).list_leases(None, true, None).await.unwrap();
        assert_eq!(bobs.len(), 1);
    }

    #[tokio::test]
    async fn test_fallback_activation_then_expiry() {
        let t = testing::core();
        let alice = t.user("alice").await;
        let id = create(&t, &alice).await;
        let start = Utc::now();

        sync(&t.core, start).await.unwrap();
        let report = sync(&t.core, start + Duration::hours(24)).await.unwrap();
        assert_eq!(report.activated, 1);
        let lease = t.core.repo::<GpuLease>().require(&id).await.unwrap();
        assert_eq!(lease.ends_at, Some(start + Duration::hours(24 + 168)));

        t.core
            .repo::<GpuLease>()
            .update(&id, &Patch::new().set("vmId", ResourceId::new().to_string()))
            .await
            .unwrap();
        let report = sync(&t.core, start + Duration::hours(24 + 168)).await.unwrap();
        assert_eq!(report.expired, 1);
        let jobs = t.core.store.list_jobs(&JobFilter::new()).await.unwrap();
        assert!(jobs.iter().any(|j| j.job_type == JobType::DetachGpuFromVm));
    }

    #[tokio::test]
    async fn test_expired_leases_evicted_when_oversubscribed() {
        let t = testing::core();
        let alice = t.user("alice").await;
        let bob = t.user("bob").await;
        let old = create(&t, &alice).await;
        let now = Utc::now();
        t.core
            .repo::<GpuLease>()
            .update(&old, &Patch::new().set("expiredAt", serde_json::to_value(now).unwrap()))
            .await
            .unwrap();

        // Alone in the group, the expired lease stays.
        sync(&t.core, now).await.unwrap();
        assert!(t.core.repo::<GpuLease>().get(&old).await.unwrap().is_some());

        create(&t, &bob).await;
        let carol = t.user("carol").await;
        create(&t, &carol).await;
        let report = sync(&t.core, now).await.unwrap();
        assert_eq!(report.evicted, 1);
        assert!(t.core.repo::<GpuLease>().get(&old).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unknown_group_removed() {
        let t = testing::core();
        let alice = t.user("alice").await;
        let id = create(&t, &alice).await;
        t.core
            .repo::<GpuLease>()
            .update(&id, &Patch::new().set("gpuGroup", "retired"))
            .await
            .unwrap();

        let report = sync(&t.core, Utc::now()).await.unwrap();
        assert_eq!(report.removed_unknown, 1);
        assert_eq!(Gpus::new(&t.core, None).list_groups().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_update_enqueues_attach_and_detach() {
        let t = testing::core();
        let alice = t.user("alice").await;
        let id = create(&t, &alice).await;
        let vm_id = crate::service::vms::testing::created(&t.core, &alice, "box").await;
        let svc = Gpus::new(&t.core, Some(&alice));

        let attach = UpdateLeaseParams {
            vm_id: Some(Some(ResourceId::parse(&vm_id).unwrap())),
        };
        let err = svc.update_lease(&id, attach.clone()).await.unwrap_err();
        assert!(matches!(err, ServiceError::InvalidArgument(_)));

        sync(&t.core, Utc::now()).await.unwrap();
        let job = svc.update_lease(&id, attach).await.unwrap().unwrap();
        let queued = t.core.store.get_job(job.job_id).await.unwrap().unwrap();
        assert_eq!(queued.job_type, JobType::AttachGpu);
        assert_eq!(queued.args["params"]["leaseId"], id.as_str());

        // Nothing attached yet, so detaching has nothing to do.
        let detach: UpdateLeaseParams = serde_json::from_value(serde_json::json!({ "vmId": null })).unwrap();
        assert_eq!(detach.vm_id, Some(None));
        assert!(svc.update_lease(&id, detach).await.unwrap().is_none());
    }
}
