//! Ownership transfer.
//!
//! Setup by the current owner records a pending migration, mirrors
//! `{userId, code}` into the resource's `transfer` field and notifies the
//! prospective owner. Acceptance with the code (or any admin action)
//! enqueues the owner update job, which commits the swap and removes the
//! migration.

use chrono::Utc;
use fabric_id::{MigrationId, UserId};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, instrument, warn};

use super::notifications;
use super::{AuthInfo, Core, ServiceError};
use crate::db::{Collection, Condition, Filter, Pagination, Patch, PatchOutcome};
use crate::job_args;
use crate::model::deployment::Deployment;
use crate::model::job::{JobType, JobVersion};
use crate::model::migration::{MigrationStatus, MigrationType, ResourceMigration, UpdateOwnerParams};
use crate::model::notification::NotificationType;
use crate::model::user::User;
use crate::model::vm::Vm;
use crate::model::{ActivityTag, Resource, ResourceKind, Transfer};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateOwnerRequest {
    pub owner_id: UserId,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateParams {
    pub resource_id: String,
    #[serde(rename = "type")]
    pub migration_type: MigrationType,
    pub update_owner: UpdateOwnerRequest,
    /// Presented by the prospective owner to accept in one step.
    #[serde(default)]
    pub code: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateParams {
    pub status: MigrationStatus,
    #[serde(default)]
    pub code: Option<String>,
}

/// What setup or acceptance produced.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationOutcome {
    pub migration: ResourceMigration,
    /// Set once the owner update job has been enqueued.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<fabric_id::JobId>,
}

/// The parts of a resource the transfer protocol needs.
struct Target {
    kind: ResourceKind,
    name: String,
    owner_id: UserId,
}

fn collection_of(kind: ResourceKind) -> Result<Collection, ServiceError> {
    match kind {
        ResourceKind::Deployment => Ok(Collection::Deployments),
        ResourceKind::Vm => Ok(Collection::Vms),
        ResourceKind::StorageManager => Err(ServiceError::invalid(
            "storage managers cannot change owner",
        )),
    }
}

fn update_owner_job(kind: ResourceKind) -> Result<JobType, ServiceError> {
    match kind {
        ResourceKind::Deployment => Ok(JobType::UpdateDeploymentOwner),
        ResourceKind::Vm => Ok(JobType::UpdateVmOwner),
        ResourceKind::StorageManager => Err(ServiceError::invalid(
            "storage managers cannot change owner",
        )),
    }
}

fn summary<T: Resource>(resource: &T) -> Target {
    Target {
        kind: T::KIND,
        name: resource.name().to_string(),
        owner_id: resource.owner_id().clone(),
    }
}

async fn target(core: &Core, resource_id: &str) -> Result<Target, ServiceError> {
    if let Some(deployment) = core.repo::<Deployment>().get(resource_id).await? {
        return Ok(summary(&deployment));
    }
    if let Some(vm) = core.repo::<Vm>().get(resource_id).await? {
        return Ok(summary(&vm));
    }
    Err(ServiceError::not_found("resource", resource_id))
}

/// Opaque code shared with the prospective owner.
fn new_code() -> String {
    hex::encode(Sha256::digest(uuid::Uuid::new_v4().as_bytes()))
}

pub struct Migrations<'a> {
    core: &'a Core,
    auth: Option<&'a AuthInfo>,
}

impl<'a> Migrations<'a> {
    pub fn new(core: &'a Core, auth: Option<&'a AuthInfo>) -> Self {
        Self { core, auth }
    }

    fn is_admin(&self) -> bool {
        self.auth.is_none_or(|auth| auth.is_admin)
    }

    /// Requester, prospective owner or admin.
    fn visible(&self, migration: &ResourceMigration) -> bool {
        match self.auth {
            None => true,
            Some(auth) => {
                auth.is_admin
                    || auth.user_id == migration.user_id
                    || auth.user_id == migration.params.new_owner_id
            }
        }
    }

    pub async fn get(&self, id: &str) -> Result<ResourceMigration, ServiceError> {
        let migration = self
            .core
            .repo::<ResourceMigration>()
            .get(id)
            .await?
            .filter(|m| self.visible(m))
            .ok_or_else(|| ServiceError::not_found("resource migration", id))?;
        Ok(migration)
    }

    pub async fn list(&self, pagination: Option<Pagination>) -> Result<Vec<ResourceMigration>, ServiceError> {
        let mut filter = Filter::new().with_pagination(pagination);
        if let Some(auth) = self.auth.filter(|auth| !auth.is_admin) {
            let me = auth.user_id.to_string();
            filter = filter.with_any_of([
                Condition::Eq("userId".into(), me.clone().into()),
                Condition::Eq("params.newOwnerId".into(), me.into()),
            ]);
        }
        Ok(self.core.repo::<ResourceMigration>().find(&filter).await?)
    }

    /// Start a transfer, or accept the pending one when the prospective owner
    /// presents its code.
    #[instrument(skip(self, params), fields(resource_id = %params.resource_id))]
    pub async fn create(&self, params: CreateParams) -> Result<MigrationOutcome, ServiceError> {
        let resource_id = params.resource_id.as_str();
        let new_owner = params.update_owner.owner_id;
        let target = target(self.core, resource_id).await?;

        let existing = self
            .core
            .repo::<ResourceMigration>()
            .first(Filter::new().with_eq("resourceId", resource_id))
            .await?;
        if let Some(existing) = existing {
            let is_new_owner = self
                .auth
                .is_some_and(|auth| auth.user_id == existing.params.new_owner_id);
            return match params.code {
                Some(code) if is_new_owner && existing.params.new_owner_id == new_owner => {
                    self.accept(existing, Some(code)).await
                }
                _ => Err(ServiceError::AlreadyExists(format!(
                    "a migration for resource {resource_id} already exists"
                ))),
            };
        }

        if let Some(auth) = self.auth {
            if !auth.owns(&target.owner_id) {
                return Err(ServiceError::not_found(target.kind.as_str(), resource_id));
            }
        }
        if target.owner_id == new_owner {
            return Err(ServiceError::AlreadyMigrated(new_owner.to_string()));
        }
        if self.core.repo::<User>().get(new_owner.as_str()).await?.is_none() {
            return Err(ServiceError::not_found("user", &new_owner));
        }
        collection_of(target.kind)?;

        let requester = match self.auth {
            Some(auth) => auth.user_id.clone(),
            None => self.core.manager_id()?,
        };
        let admin = self.is_admin();
        let mut migration = ResourceMigration {
            id: MigrationId::new(),
            user_id: requester,
            resource_id: resource_id.to_string(),
            resource_type: target.kind,
            migration_type: params.migration_type,
            status: MigrationStatus::Pending,
            code: (!admin).then(new_code),
            params: UpdateOwnerParams {
                new_owner_id: new_owner.clone(),
                old_owner_id: target.owner_id.clone(),
            },
            created_at: Utc::now(),
            deleted_at: None,
        };

        if admin {
            migration.status = MigrationStatus::Accepted;
            self.core.repo::<ResourceMigration>().insert(&migration).await?;
            let job_id = self.enqueue(&migration).await?;
            info!(migration_id = %migration.id, "Resource migration committed by admin");
            return Ok(MigrationOutcome {
                migration,
                job_id: Some(job_id),
            });
        }

        self.core.repo::<ResourceMigration>().insert(&migration).await?;
        if let Err(err) = self.offer(&migration, &target).await {
            self.abort_setup(&migration).await;
            return Err(err);
        }

        info!(migration_id = %migration.id, new_owner = %new_owner, "Resource migration pending acceptance");
        Ok(MigrationOutcome {
            migration,
            job_id: None,
        })
    }

    /// Mirror the transfer onto the resource and notify the prospective owner.
    async fn offer(&self, migration: &ResourceMigration, target: &Target) -> Result<(), ServiceError> {
        let resource_id = migration.resource_id.as_str();
        let new_owner = &migration.params.new_owner_id;
        let code = migration.code.clone().unwrap_or_default();
        let transfer = Transfer {
            user_id: new_owner.clone(),
            code: code.clone(),
        };
        let patch = Patch::new()
            .set("transfer", serde_json::to_value(&transfer)?)
            .when(Condition::Missing(format!("activities.{}", ActivityTag::BeingDeleted)));
        match self
            .core
            .store
            .patch(collection_of(target.kind)?, resource_id, &patch)
            .await?
        {
            PatchOutcome::Applied => {}
            PatchOutcome::GuardFailed => {
                return Err(ServiceError::ConflictingActivity(format!(
                    "{} {resource_id} is being deleted",
                    target.kind.as_str()
                )))
            }
            PatchOutcome::NotFound => {
                return Err(ServiceError::not_found(target.kind.as_str(), resource_id))
            }
        }
        notifications::create(
            self.core,
            new_owner,
            NotificationType::ResourceTransfer,
            job_args! {
                "id" => resource_id,
                "name" => target.name.clone(),
                "type" => target.kind.as_str(),
                "migrationId" => migration.id.to_string(),
                "code" => code,
            },
        )
        .await?;
        Ok(())
    }

    /// Undo a half-finished setup. Failures here are logged; the caller
    /// reports the error that caused the abort.
    async fn abort_setup(&self, migration: &ResourceMigration) {
        if let Err(err) = clear_transfer(self.core, migration).await {
            warn!(migration_id = %migration.id, error = %err, "Failed to clear transfer after aborted setup");
        }
        if let Err(err) = remove(self.core, &migration.id.to_string()).await {
            warn!(migration_id = %migration.id, error = %err, "Failed to remove migration after aborted setup");
        }
    }

    /// Accept a pending migration.
    #[instrument(skip(self, params))]
    pub async fn update(&self, id: &str, params: UpdateParams) -> Result<MigrationOutcome, ServiceError> {
        let migration = self.get(id).await?;
        if params.status != MigrationStatus::Accepted {
            return Err(ServiceError::invalid("a migration can only be accepted"));
        }
        self.accept(migration, params.code).await
    }

    async fn accept(
        &self,
        mut migration: ResourceMigration,
        code: Option<String>,
    ) -> Result<MigrationOutcome, ServiceError> {
        if migration.status == MigrationStatus::Accepted {
            return Err(ServiceError::AlreadyAccepted);
        }
        if let Some(auth) = self.auth {
            if !auth.is_admin {
                if auth.user_id != migration.params.new_owner_id {
                    return Err(ServiceError::Forbidden(
                        "only the new owner may accept a migration".to_string(),
                    ));
                }
                if code.is_none() || code != migration.code {
                    return Err(ServiceError::BadMigrationCode);
                }
            }
        }

        let id = migration.id.to_string();
        let outcome = self
            .core
            .repo::<ResourceMigration>()
            .patch(
                &id,
                &Patch::new()
                    .set("status", "accepted")
                    .when(Condition::Eq("status".into(), "pending".into())),
            )
            .await?;
        match outcome {
            PatchOutcome::Applied => {}
            PatchOutcome::GuardFailed => return Err(ServiceError::AlreadyAccepted),
            PatchOutcome::NotFound => return Err(ServiceError::not_found("resource migration", &id)),
        }
        migration.status = MigrationStatus::Accepted;

        let job_id = self.enqueue(&migration).await?;
        info!(migration_id = %id, "Resource migration accepted");
        Ok(MigrationOutcome {
            migration,
            job_id: Some(job_id),
        })
    }

    async fn enqueue(&self, migration: &ResourceMigration) -> Result<fabric_id::JobId, ServiceError> {
        let user = match self.auth {
            Some(auth) => auth.user_id.clone(),
            None => self.core.manager_id()?,
        };
        self.core
            .enqueue(
                &user,
                update_owner_job(migration.resource_type)?,
                JobVersion::V2,
                job_args! {
                    "id" => migration.resource_id,
                    "params" => migration.params,
                    "resourceMigrationId" => migration.id.to_string(),
                },
            )
            .await
    }

    /// Withdraw a pending migration.
    #[instrument(skip(self))]
    pub async fn delete(&self, id: &str) -> Result<(), ServiceError> {
        let migration = self.get(id).await?;
        if migration.status == MigrationStatus::Accepted {
            return Err(ServiceError::AlreadyAccepted);
        }
        clear_transfer(self.core, &migration).await?;
        notifications::delete_for_resource(self.core, &migration.resource_id).await?;
        self.core.repo::<ResourceMigration>().remove(id).await?;
        info!(migration_id = %id, "Resource migration withdrawn");
        Ok(())
    }
}

async fn clear_transfer(core: &Core, migration: &ResourceMigration) -> Result<(), ServiceError> {
    let collection = collection_of(migration.resource_type)?;
    core.store
        .patch(collection, &migration.resource_id, &Patch::new().unset("transfer"))
        .await?;
    Ok(())
}

/// Drop a migration once its owner update has committed. Missing is fine.
pub async fn remove(core: &Core, migration_id: &str) -> Result<(), ServiceError> {
    core.repo::<ResourceMigration>().remove(migration_id).await?;
    Ok(())
}

/// Drop every migration of a resource that is going away.
pub async fn delete_for_resource(core: &Core, resource_id: &str) -> Result<(), ServiceError> {
    let repo = core.repo::<ResourceMigration>();
    for migration in repo
        .find(&Filter::new().with_eq("resourceId", resource_id))
        .await?
    {
        repo.remove(&migration.id.to_string()).await?;
    }
    Ok(())
}

/// Hand a job's parsed owner update to the service owning the resource kind.
pub fn job_params(args: &serde_json::Map<String, serde_json::Value>) -> Result<UpdateOwnerParams, ServiceError> {
    let params = args
        .get("params")
        .cloned()
        .ok_or_else(|| ServiceError::invalid("missing params"))?;
    Ok(serde_json::from_value(params)?)
}
