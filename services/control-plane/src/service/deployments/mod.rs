//! Deployment service.
//!
//! Request-side methods validate, admit against quota and enqueue a job.
//! The `do_*` methods are what the job handlers run; they drive the
//! registry, k8s and CI subsystems.

pub mod generator;
pub mod harbor;

use std::time::Duration;

use chrono::Utc;
use fabric_id::UserId;
use fabric_reconcile::{SsCreator, SsDeleter};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use self::generator::MAIN;
use self::harbor::HarborSync;
use super::activity::{add_activity, can_add_activity, remove_activity, remove_activity_later};
use super::auth::effective_owner;
use super::k8s::K8sSync;
use super::quota::{self, Delta};
use super::reconcile::{repair_one, ObjectClient, RecordWriter};
use super::resources::{self, GetOpts, ListOpts};
use super::{
    migrations, notifications, teams, validate_name, AuthInfo, Core, JobRef, ResultExt,
    ServiceError,
};
use crate::db::{Collection, Filter, Patch, Repo};
use crate::job_args;
use crate::model::deployment::{
    Deployment, DeploymentType, Env, GithubSource, Volume, DEFAULT_INTERNAL_PORT,
};
use crate::model::job::{JobType, JobVersion};
use crate::model::migration::UpdateOwnerParams;
use crate::model::ActivityTag;
use crate::subsystems::github::{BuildRun, Webhook as GithubWebhook};
use crate::subsystems::SubsystemError;

/// How long `restarting` stays on a deployment after a restart.
const RESTART_ACTIVITY: Duration = Duration::from_secs(5);

/// Minutes after which a `restarting` activity is stale and removed by repair.
const STALE_RESTART_MINUTES: i64 = 5;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateParams {
    pub name: String,
    #[serde(default)]
    pub zone: Option<String>,
    /// Absent for a custom deployment built into the owner's registry.
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub replicas: Option<i64>,
    #[serde(default)]
    pub envs: Vec<Env>,
    #[serde(default)]
    pub internal_port: Option<u16>,
    #[serde(default)]
    pub private: bool,
    #[serde(default)]
    pub custom_domain: Option<String>,
    #[serde(default)]
    pub volumes: Vec<Volume>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub github: Option<GithubSource>,
    /// Admins may create on behalf of another user.
    #[serde(default)]
    pub owner_id: Option<UserId>,
}

/// Only the fields present are changed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub envs: Option<Vec<Env>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub internal_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private: Option<bool>,
    /// An empty string removes the custom domain.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volumes: Option<Vec<Volume>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<String>>,
}

/// Imperative verbs on a deployment.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "command", rename_all = "camelCase")]
pub enum Command {
    Restart,
    Build {
        #[serde(default, rename = "ref")]
        git_ref: Option<String>,
    },
}

pub struct Deployments<'a> {
    core: &'a Core,
    auth: Option<&'a AuthInfo>,
}

impl<'a> Deployments<'a> {
    pub fn new(core: &'a Core, auth: Option<&'a AuthInfo>) -> Self {
        Self { core, auth }
    }

    fn repo(&self) -> Repo<'a, Deployment> {
        self.core.repo()
    }

    fn job_user(&self) -> Result<UserId, ServiceError> {
        match self.auth {
            Some(auth) => Ok(auth.user_id.clone()),
            None => self.core.manager_id(),
        }
    }

    pub async fn get(&self, id: &str, opts: GetOpts) -> Result<Deployment, ServiceError> {
        resources::get(self.core, self.auth, id, opts).await
    }

    pub async fn list(&self, opts: &ListOpts) -> Result<Vec<Deployment>, ServiceError> {
        resources::list(self.core, self.auth, opts).await
    }

    /// A deployment the caller may modify, with `tag` admissible on it.
    async fn get_for(&self, id: &str, tag: ActivityTag) -> Result<Deployment, ServiceError> {
        let deployment = self.get(id, GetOpts::default()).await?;
        let (allowed, reason) = can_add_activity(&self.repo(), id, tag).await?;
        if !allowed {
            return Err(ServiceError::ConflictingActivity(reason));
        }
        Ok(deployment)
    }

    // =========================================================================
    // Requests
    // =========================================================================

    #[instrument(skip(self, params), fields(name = %params.name))]
    pub async fn create(&self, params: CreateParams) -> Result<JobRef, ServiceError> {
        validate_name(&params.name)?;
        let zone = self.core.zone(params.zone.as_deref())?.clone();

        let owner_id = match self.auth {
            Some(auth) => effective_owner(auth, params.owner_id.as_ref())?,
            None => params
                .owner_id
                .clone()
                .ok_or_else(|| ServiceError::invalid("ownerId is required"))?,
        };

        let deployment_type = match params.image {
            Some(_) => DeploymentType::Prebuilt,
            None => DeploymentType::Custom,
        };
        if let Some(auth) = self.auth {
            if deployment_type == DeploymentType::Custom && !auth.role.permissions.use_custom_deployments {
                return Err(ServiceError::Forbidden(
                    "role may not create custom deployments".to_string(),
                ));
            }
        }

        let replicas = params.replicas.unwrap_or(1).max(1);
        quota::admit(self.core, self.auth, Delta::deployment_replicas(None, replicas)).await?;

        let image = match &params.image {
            Some(image) => image.clone(),
            None => generator::custom_image(&self.core.config, &owner_id, &params.name),
        };
        let mut deployment = Deployment {
            id: fabric_id::ResourceId::new(),
            name: params.name.clone(),
            owner_id: owner_id.clone(),
            zone: zone.name.clone(),
            deployment_type,
            created_at: Utc::now(),
            updated_at: None,
            repaired_at: None,
            restarted_at: None,
            deleted_at: None,
            activities: Default::default(),
            transfer: None,
            image,
            replicas,
            envs: params.envs.clone(),
            internal_port: params.internal_port.unwrap_or(DEFAULT_INTERNAL_PORT),
            private: params.private,
            custom_domain: params.custom_domain.clone().filter(|d| !d.is_empty()),
            volumes: params.volumes.clone(),
            args: params.args.clone(),
            github: params.github.clone(),
            subsystems: Default::default(),
        };
        deployment.activities.insert(
            ActivityTag::BeingCreated,
            crate::model::Activity::new(ActivityTag::BeingCreated),
        );

        self.repo().insert(&deployment).await?;
        let id = deployment.id.to_string();
        let job_id = self
            .core
            .enqueue(
                &self.job_user()?,
                JobType::CreateDeployment,
                JobVersion::V2,
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
    pub async fn update(&self, id: &str, mut params: UpdateParams) -> Result<JobRef, ServiceError> {
        let current = self.get_for(id, ActivityTag::Updating).await?;

        if let Some(name) = &params.name {
            validate_name(name)?;
            if name != &current.name
                && self.repo().exists(&Filter::new().with_name(name.as_str())).await?
            {
                return Err(ServiceError::NonUniqueField(format!("name {name}")));
            }
        }
        if current.is_custom() && params.image.is_some() {
            return Err(ServiceError::invalid(
                "the image of a custom deployment follows its registry repository",
            ));
        }
        if let Some(replicas) = params.replicas.as_mut() {
            *replicas = (*replicas).max(1);
            quota::admit(
                self.core,
                self.auth,
                Delta::deployment_replicas(Some(current.replicas), *replicas),
            )
            .await?;
        }

        let job_id = self
            .core
            .enqueue(
                &self.job_user()?,
                JobType::UpdateDeployment,
                JobVersion::V2,
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
        let job_id = self
            .core
            .enqueue(
                &self.job_user()?,
                JobType::DeleteDeployment,
                JobVersion::V2,
                job_args! { "id" => id },
            )
            .await?;
        Ok(JobRef::new(id, job_id))
    }

    #[instrument(skip(self))]
    pub async fn repair(&self, id: &str) -> Result<JobRef, ServiceError> {
        self.get_for(id, ActivityTag::Repairing).await?;
        let job_id = self
            .core
            .enqueue(
                &self.job_user()?,
                JobType::RepairDeployment,
                JobVersion::V2,
                job_args! { "id" => id },
            )
            .await?;
        Ok(JobRef::new(id, job_id))
    }

    pub async fn command(&self, id: &str, command: Command) -> Result<(), ServiceError> {
        match command {
            Command::Restart => {
                self.get_for(id, ActivityTag::Restarting).await?;
                self.restart(id).await
            }
            Command::Build { git_ref } => {
                self.get_for(id, ActivityTag::Building).await?;
                self.build(id, git_ref.as_deref()).await
            }
        }
    }

    // =========================================================================
    // Job side
    // =========================================================================

    /// Set up every subsystem of a freshly inserted deployment.
    #[instrument(skip(self))]
    pub async fn do_create(&self, id: &str) -> Result<(), ServiceError> {
        let deployment = self.repo().require(id).await?;
        self.core.zone_with(&deployment.zone, "deployment")?;

        if let Err(err) = self.create_subsystems(&deployment).await {
            if !matches!(err.subsystem(), Some(SubsystemError::ZoneCapabilityMissing { .. })) {
                if let Err(repair_err) = self.do_repair(id).await {
                    warn!(deployment_id = %id, error = %repair_err, "Repair after failed create failed");
                }
            }
            return Err(err.context(format!("create deployment {id}")).abandon());
        }

        info!(deployment_id = %id, name = %deployment.name, "Deployment created");
        Ok(())
    }

    async fn create_subsystems(&self, deployment: &Deployment) -> Result<(), ServiceError> {
        let id = deployment.id.to_string();
        let zone = self.core.zone(Some(&deployment.zone))?;

        if deployment.is_custom() {
            HarborSync::new(self.core, &id, &zone.name)
                .create(&generator::harbor(deployment, &self.core.config))
                .await
                .context(|| "set up registry".to_string())?;
        }

        // The image pull secret needs the robot just recorded.
        let deployment = self.repo().require(&id).await?;
        K8sSync::new(self.core, Collection::Deployments, &id, &zone.name)
            .create(&generator::k8s(&deployment, zone, &self.core.config))
            .await
            .context(|| "set up k8s".to_string())?;

        if let Some(webhook) = generator::github_webhook(&deployment, &self.core.config) {
            self.create_github_webhook(&deployment, webhook).await?;
            let deployment = self.repo().require(&id).await?;
            let default_branch = deployment.github.as_ref().and_then(|g| g.default_branch.clone());
            if let Some(branch) = default_branch {
                self.trigger_build(&deployment, &branch).await?;
            }
        }
        Ok(())
    }

    async fn create_github_webhook(
        &self,
        deployment: &Deployment,
        webhook: GithubWebhook,
    ) -> Result<(), ServiceError> {
        let id = deployment.id.to_string();
        let client = ObjectClient::<GithubWebhook>::new(
            &self.core.subsystems.github,
            &deployment.zone,
            &webhook.repository_id.to_string(),
        );
        let writer = RecordWriter::new(
            self.core.store.as_ref(),
            Collection::Deployments,
            &id,
            "subsystems.github.webhook",
        );
        match SsCreator::new(&client, &writer).with_public(webhook).exec().await {
            Ok(_) => Ok(()),
            Err(err)
                if matches!(
                    err.subsystem(),
                    Some(SubsystemError::NotFound(_) | SubsystemError::Unauthorized(_))
                ) =>
            {
                warn!(deployment_id = %id, error = %err, "Source repository unreachable, using a placeholder");
                self.repo()
                    .set_path(&id, "subsystems.github.placeholder", &true)
                    .await?;
                Ok(())
            }
            Err(err) => Err(err.context(format!("create webhook for deployment {id}"))),
        }
    }

    async fn trigger_build(&self, deployment: &Deployment, git_ref: &str) -> Result<(), ServiceError> {
        if deployment.subsystems.github.placeholder {
            return Ok(());
        }
        let Some(run) = generator::build_run(deployment, git_ref) else {
            return Ok(());
        };
        let id = deployment.id.to_string();
        let client = ObjectClient::<BuildRun>::new(
            &self.core.subsystems.github,
            &deployment.zone,
            &run.repository_id.to_string(),
        );
        let writer = RecordWriter::new(
            self.core.store.as_ref(),
            Collection::Deployments,
            &id,
            "subsystems.github.lastBuild",
        );
        SsCreator::new(&client, &writer)
            .with_public(run)
            .exec()
            .await
            .context(|| format!("start build for deployment {id}"))?;
        info!(deployment_id = %id, git_ref, "Build started");
        Ok(())
    }

    /// Apply `params` to the record and converge the subsystems.
    #[instrument(skip(self, params))]
    pub async fn do_update(&self, id: &str, params: &UpdateParams) -> Result<(), ServiceError> {
        let current = self.repo().require(id).await?;

        let mut patch = Patch::new()
            .set_some("name", params.name.clone())
            .set_some("replicas", params.replicas.map(|r| r.max(1)))
            .set_some("internalPort", params.internal_port)
            .set_some("private", params.private);
        if !current.is_custom() {
            patch = patch.set_some("image", params.image.clone());
        }
        if let Some(name) = params.name.as_ref().filter(|_| current.is_custom()) {
            patch = patch.set(
                "image",
                generator::custom_image(&self.core.config, &current.owner_id, name),
            );
        }
        if let Some(envs) = &params.envs {
            patch = patch.set("envs", serde_json::to_value(envs)?);
        }
        if let Some(volumes) = &params.volumes {
            patch = patch.set("volumes", serde_json::to_value(volumes)?);
        }
        if let Some(args) = &params.args {
            patch = patch.set("args", serde_json::to_value(args)?);
        }
        patch = match params.custom_domain.as_deref() {
            Some("") => patch.unset("customDomain"),
            Some(domain) => patch.set("customDomain", domain),
            None => patch,
        };

        if !patch.is_empty() {
            let patch = patch.set("updatedAt", serde_json::to_value(Utc::now())?);
            self.repo().update(id, &patch).await?;
        }

        self.converge(id, false)
            .await
            .context(|| format!("update deployment {id}"))?;
        info!(deployment_id = %id, "Deployment updated");
        Ok(())
    }

    /// Hand the deployment to a new owner and move its subsystem objects.
    #[instrument(skip(self, params), fields(new_owner = %params.new_owner_id))]
    pub async fn do_update_owner(
        &self,
        id: &str,
        params: &UpdateOwnerParams,
        migration_id: Option<&str>,
    ) -> Result<(), ServiceError> {
        let before = self.repo().require(id).await?;
        let new_owner = &params.new_owner_id;

        let mut patch = Patch::new()
            .set("ownerId", new_owner.as_str())
            .unset("transfer")
            .set("updatedAt", serde_json::to_value(Utc::now())?);
        if before.is_custom() {
            patch = patch.set(
                "image",
                generator::custom_image(&self.core.config, new_owner, &before.name),
            );
        }
        self.repo().update(id, &patch).await?;

        let deployment = self.repo().require(id).await?;
        let zone = self.core.zone(Some(&deployment.zone))?;

        if deployment.is_custom() {
            HarborSync::new(self.core, id, &zone.name)
                .ensure_owner(
                    &before.subsystems.harbor,
                    generator::harbor(&deployment, &self.core.config),
                )
                .await
                .context(|| format!("move registry objects of deployment {id}"))?;
        }

        let new_namespace = super::owner_scope(new_owner);
        let recorded = &before.subsystems.k8s;
        if recorded
            .namespace
            .as_ref()
            .is_some_and(|ns| ns.name != new_namespace)
        {
            K8sSync::new(self.core, Collection::Deployments, id, &zone.name)
                .delete(recorded)
                .await
                .context(|| format!("remove k8s objects of deployment {id} from previous owner"))?;
        }
        self.converge(id, true)
            .await
            .context(|| format!("update owner of deployment {id}"))?;

        notifications::complete_transfer(self.core, id).await?;
        if let Some(migration_id) = migration_id {
            migrations::remove(self.core, migration_id).await?;
        }
        info!(deployment_id = %id, "Deployment owner updated");
        Ok(())
    }

    /// Tear down every subsystem object and hide the record.
    #[instrument(skip(self))]
    pub async fn do_delete(&self, id: &str) -> Result<(), ServiceError> {
        let Some(deployment) = self.repo().get(id).await? else {
            return Ok(());
        };
        let zone = self.core.zone(Some(&deployment.zone))?;

        notifications::delete_for_resource(self.core, id).await?;
        migrations::delete_for_resource(self.core, id).await?;
        teams::clean_resource(self.core, id).await?;

        if let Some(webhook) = &deployment.subsystems.github.webhook {
            let client = ObjectClient::<GithubWebhook>::new(
                &self.core.subsystems.github,
                &zone.name,
                &webhook.repository_id.to_string(),
            );
            let writer = RecordWriter::new(
                self.core.store.as_ref(),
                Collection::Deployments,
                id,
                "subsystems.github.webhook",
            );
            SsDeleter::<GithubWebhook, _, _>::new(&client, &writer)
                .with_key(webhook.name.clone())
                .exec()
                .await
                .context(|| format!("delete webhook of deployment {id}"))?;
        }

        HarborSync::new(self.core, id, &zone.name)
            .delete(&deployment.subsystems.harbor)
            .await
            .context(|| format!("delete registry objects of deployment {id}"))?;
        K8sSync::new(self.core, Collection::Deployments, id, &zone.name)
            .delete(&deployment.subsystems.k8s)
            .await
            .context(|| format!("delete k8s objects of deployment {id}"))?;

        self.repo().soft_delete(id).await?;
        info!(deployment_id = %id, "Deployment deleted");
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn do_repair(&self, id: &str) -> Result<(), ServiceError> {
        let deployment = self.repo().require(id).await?;

        if let Some(restart) = deployment.activities.get(&ActivityTag::Restarting) {
            if Utc::now() - restart.started_at > chrono::Duration::minutes(STALE_RESTART_MINUTES) {
                remove_activity(&self.repo(), id, ActivityTag::Restarting).await?;
            }
        }

        self.converge(id, true)
            .await
            .context(|| format!("repair deployment {id}"))?;
        self.repo()
            .set_path(id, "repairedAt", &Utc::now())
            .await?;
        info!(deployment_id = %id, "Deployment repaired");
        Ok(())
    }

    /// Repair every subsystem against the current record.
    ///
    /// An ingress host taken by someone else is only the user's to fix; with
    /// `tolerate_host_in_use` it is logged and the rest still converges.
    async fn converge(&self, id: &str, tolerate_host_in_use: bool) -> Result<bool, ServiceError> {
        let deployment = self.repo().require(id).await?;
        let zone = self.core.zone(Some(&deployment.zone))?;
        let mut changed = false;

        if deployment.is_custom() {
            changed |= HarborSync::new(self.core, id, &zone.name)
                .repair(
                    &deployment.subsystems.harbor,
                    generator::harbor(&deployment, &self.core.config),
                )
                .await?;
        }

        if let Some(webhook) = generator::github_webhook(&deployment, &self.core.config) {
            if !deployment.subsystems.github.placeholder {
                let client = ObjectClient::<GithubWebhook>::new(
                    &self.core.subsystems.github,
                    &zone.name,
                    &webhook.repository_id.to_string(),
                );
                changed |= repair_one(
                    &client,
                    self.core.store.as_ref(),
                    Collection::Deployments,
                    id,
                    "subsystems.github.webhook",
                    deployment.subsystems.github.webhook.as_ref(),
                    Some(webhook),
                )
                .await?
                .changed();
            }
        }

        let deployment = self.repo().require(id).await?;
        let k8s = K8sSync::new(self.core, Collection::Deployments, id, &zone.name);
        match k8s
            .repair(
                &deployment.subsystems.k8s,
                generator::k8s(&deployment, zone, &self.core.config),
            )
            .await
        {
            Ok(k8s_changed) => changed |= k8s_changed,
            Err(err)
                if tolerate_host_in_use
                    && matches!(err.subsystem(), Some(SubsystemError::IngressHostInUse(_))) =>
            {
                warn!(deployment_id = %id, error = %err, "Ingress host is in use, leaving ingress unconverged");
                changed = true;
            }
            Err(err) => return Err(err),
        }
        Ok(changed)
    }

    /// Roll the pods of the deployment.
    ///
    /// `restarting` is removed by a background task shortly after the k8s
    /// update went through.
    #[instrument(skip(self))]
    pub async fn restart(&self, id: &str) -> Result<(), ServiceError> {
        let now = Utc::now();
        self.repo().set_path(id, "restartedAt", &now).await?;
        add_activity(&self.repo(), id, ActivityTag::Restarting).await?;

        let result = self.restart_k8s(id).await;
        remove_activity_later::<Deployment>(
            self.core.store.clone(),
            id.to_string(),
            ActivityTag::Restarting,
            RESTART_ACTIVITY,
        );
        result.context(|| format!("restart deployment {id}"))
    }

    async fn restart_k8s(&self, id: &str) -> Result<(), ServiceError> {
        let deployment = self.repo().require(id).await?;
        let zone = self.core.zone(Some(&deployment.zone))?;
        let Some(main) = generator::k8s(&deployment, zone, &self.core.config)
            .deployments
            .remove(MAIN)
        else {
            return Ok(());
        };
        K8sSync::new(self.core, Collection::Deployments, id, &zone.name)
            .restart(MAIN, main)
            .await
    }

    /// Build `git_ref` (the default branch when absent) and restart.
    #[instrument(skip(self))]
    pub async fn build(&self, id: &str, git_ref: Option<&str>) -> Result<(), ServiceError> {
        let deployment = self.repo().require(id).await?;
        let Some(source) = deployment.github.clone().filter(|_| deployment.is_custom()) else {
            return Err(ServiceError::invalid(
                "only custom deployments with a source repository can be built",
            ));
        };
        let git_ref = git_ref
            .map(str::to_string)
            .or(source.default_branch)
            .ok_or_else(|| ServiceError::invalid("no ref given and no default branch known"))?;

        add_activity(&self.repo(), id, ActivityTag::Building).await?;
        let result = async {
            self.trigger_build(&deployment, &git_ref).await?;
            self.restart(id).await
        }
        .await;
        remove_activity(&self.repo(), id, ActivityTag::Building).await?;
        result
    }

    // =========================================================================
    // Hooks
    // =========================================================================

    /// An image was pushed to `project/repository`. Restarts the custom
    /// deployment running it and returns how many were restarted.
    pub async fn on_image_pushed(&self, project: &str, repository: &str) -> Result<usize, ServiceError> {
        let candidates = self
            .repo()
            .find(
                &Filter::new()
                    .with_name(repository)
                    .with_eq("type", "custom"),
            )
            .await?;

        let mut restarted = 0;
        for deployment in candidates
            .iter()
            .filter(|d| super::owner_scope(&d.owner_id) == project)
        {
            let id = deployment.id.to_string();
            let (allowed, reason) = can_add_activity(&self.repo(), &id, ActivityTag::Restarting).await?;
            if !allowed {
                info!(deployment_id = %id, reason, "Skipping restart on push");
                continue;
            }
            self.restart(&id).await?;
            restarted += 1;
        }
        Ok(restarted)
    }

    /// A push to `git_ref` of a source repository. Builds every deployment
    /// tracking that ref and returns how many builds were started.
    pub async fn on_source_pushed(&self, repository_id: i64, git_ref: &str) -> Result<usize, ServiceError> {
        let candidates = self
            .repo()
            .find(&Filter::new().with_eq("github.repositoryId", repository_id))
            .await?;

        let mut built = 0;
        for deployment in candidates {
            let Some(branch) = deployment.github.as_ref().and_then(|g| g.default_branch.clone()) else {
                continue;
            };
            if git_ref != branch && git_ref != format!("refs/heads/{branch}") {
                continue;
            }
            let id = deployment.id.to_string();
            let (allowed, reason) = can_add_activity(&self.repo(), &id, ActivityTag::Building).await?;
            if !allowed {
                info!(deployment_id = %id, reason, "Skipping build on push");
                continue;
            }
            self.build(&id, Some(&branch)).await?;
            built += 1;
        }
        Ok(built)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::db::JobFilter;
    use crate::model::job::JobStatus;
    use crate::model::Resource;
    use crate::service::testing;
    use crate::subsystems::simulated::Operation;
    use crate::subsystems::ObjectKind;

    fn params(name: &str) -> CreateParams {
        CreateParams {
            name: name.to_string(),
            image: Some("nginx:1.27".to_string()),
            replicas: Some(2),
            ..CreateParams::default()
        }
    }

    async fn created(t: &testing::TestCore, auth: &AuthInfo, name: &str) -> String {
        let svc = Deployments::new(&t.core, Some(auth));
        let job = svc.create(params(name)).await.unwrap();
        Deployments::new(&t.core, None).do_create(&job.id).await.unwrap();
        remove_activity(&t.core.repo::<Deployment>(), &job.id, ActivityTag::BeingCreated)
            .await
            .unwrap();
        job.id
    }

    #[tokio::test]
    async fn test_create_inserts_and_enqueues() {
        let t = testing::core();
        let alice = t.user("alice").await;
        let job = Deployments::new(&t.core, Some(&alice))
            .create(params("web-1"))
            .await
            .unwrap();

        let d = t.core.repo::<Deployment>().require(&job.id).await.unwrap();
        assert_eq!(d.owner_id.as_str(), "alice");
        assert_eq!(d.replicas, 2);
        assert!(d.has_activity(ActivityTag::BeingCreated));

        let queued = t.core.store.get_job(job.job_id).await.unwrap().unwrap();
        assert_eq!(queued.job_type, JobType::CreateDeployment);
        assert_eq!(queued.resource_id(), Some(job.id.as_str()));
        assert_eq!(queued.status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn test_create_name_clash() {
        let t = testing::core();
        let alice = t.user("alice").await;
        let svc = Deployments::new(&t.core, Some(&alice));
        svc.create(params("web-1")).await.unwrap();
        let err = svc.create(params("web-1")).await.unwrap_err();
        assert!(matches!(err, ServiceError::NonUniqueField(_)));
    }

    #[tokio::test]
    async fn test_quota_rejection_writes_nothing() {
        let t = testing::core();
        let alice = t.user("alice").await;
        let mut p = params("big");
        p.replicas = Some(6);
        let err = Deployments::new(&t.core, Some(&alice)).create(p).await.unwrap_err();
        assert!(matches!(err, ServiceError::QuotaExceeded { field: "deployments", .. }));
        assert_eq!(t.core.repo::<Deployment>().count(&Filter::new()).await.unwrap(), 0);
        assert!(t.core.store.list_jobs(&JobFilter::new()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_zero_replicas_are_one() {
        let t = testing::core();
        let alice = t.user("alice").await;
        let mut p = params("web");
        p.replicas = Some(0);
        let job = Deployments::new(&t.core, Some(&alice)).create(p).await.unwrap();
        let d = t.core.repo::<Deployment>().require(&job.id).await.unwrap();
        assert_eq!(d.replicas, 1);
    }

    #[tokio::test]
    async fn test_do_create_records_live_objects() {
        let t = testing::core();
        let alice = t.user("alice").await;
        let id = created(&t, &alice, "web-1").await;

        let d = t.core.repo::<Deployment>().require(&id).await.unwrap();
        let main = &d.subsystems.k8s.deployment_map[MAIN];
        assert_eq!(main.replicas, 2);
        assert!(main.created_at.is_some());
        assert!(d.subsystems.k8s.ingress_map.contains_key(MAIN));
        assert_eq!(t.sim.k8s.objects(ObjectKind::Deployment).len(), 1);
        assert!(t.sim.harbor.objects(ObjectKind::HarborProject).is_empty());
    }

    #[tokio::test]
    async fn test_repair_is_idempotent() {
        let t = testing::core();
        let alice = t.user("alice").await;
        let id = created(&t, &alice, "web-1").await;
        let system = Deployments::new(&t.core, None);

        system.do_repair(&id).await.unwrap();
        let writes = t.sim.writes();
        system.do_repair(&id).await.unwrap();
        assert_eq!(t.sim.writes(), writes);
    }

    #[tokio::test]
    async fn test_failed_ingress_is_repaired() {
        let t = testing::core();
        let alice = t.user("alice").await;
        let job = Deployments::new(&t.core, Some(&alice))
            .create(params("web-1"))
            .await
            .unwrap();
        t.sim.k8s.fail_next(
            ObjectKind::Ingress,
            Operation::Create,
            SubsystemError::IngressHostInUse("web-1.app.fabric.local".into()),
        );

        let system = Deployments::new(&t.core, None);
        let err = system.do_create(&job.id).await.unwrap_err();
        assert!(err.is_terminal());

        system.do_repair(&job.id).await.unwrap();
        let d = t.core.repo::<Deployment>().require(&job.id).await.unwrap();
        assert!(d.subsystems.k8s.ingress_map.contains_key(MAIN));
        assert!(d.subsystems.k8s.service_map.contains_key(MAIN));
        assert_eq!(t.sim.k8s.objects(ObjectKind::Ingress).len(), 1);
    }

    #[tokio::test]
    async fn test_update_converges_replicas() {
        let t = testing::core();
        let alice = t.user("alice").await;
        let id = created(&t, &alice, "web-1").await;

        let update = UpdateParams {
            replicas: Some(3),
            custom_domain: Some("example.org".into()),
            ..UpdateParams::default()
        };
        Deployments::new(&t.core, Some(&alice))
            .update(&id, update.clone())
            .await
            .unwrap();
        Deployments::new(&t.core, None).do_update(&id, &update).await.unwrap();

        let d = t.core.repo::<Deployment>().require(&id).await.unwrap();
        assert_eq!(d.replicas, 3);
        assert_eq!(d.subsystems.k8s.deployment_map[MAIN].replicas, 3);
        assert!(d.subsystems.k8s.ingress_map.contains_key(generator::CUSTOM_DOMAIN));
        assert!(d.updated_at.is_some());
    }

    #[tokio::test]
    async fn test_update_to_taken_name() {
        let t = testing::core();
        let alice = t.user("alice").await;
        let svc = Deployments::new(&t.core, Some(&alice));
        svc.create(params("web-1")).await.unwrap();
        let other = svc.create(params("web-2")).await.unwrap();
        remove_activity(&t.core.repo::<Deployment>(), &other.id, ActivityTag::BeingCreated)
            .await
            .unwrap();

        let err = svc
            .update(
                &other.id,
                UpdateParams {
                    name: Some("web-1".into()),
                    ..UpdateParams::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::NonUniqueField(_)));
    }

    #[tokio::test]
    async fn test_others_see_not_found() {
        let t = testing::core();
        let alice = t.user("alice").await;
        let bob = t.user("bob").await;
        let id = created(&t, &alice, "web-1").await;

        let err = Deployments::new(&t.core, Some(&bob)).delete(&id).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_delete_rejected_while_being_created() {
        let t = testing::core();
        let alice = t.user("alice").await;
        let svc = Deployments::new(&t.core, Some(&alice));
        let job = svc.create(params("web-1")).await.unwrap();
        let err = svc.delete(&job.id).await.unwrap_err();
        assert!(matches!(err, ServiceError::ConflictingActivity(_)));
    }

    #[tokio::test]
    async fn test_delete_removes_everything() {
        let t = testing::core();
        let alice = t.user("alice").await;
        let id = created(&t, &alice, "web-1").await;

        Deployments::new(&t.core, None).do_delete(&id).await.unwrap();

        assert!(t.core.repo::<Deployment>().get(&id).await.unwrap().is_none());
        assert!(t.sim.k8s.objects(ObjectKind::Deployment).is_empty());
        assert!(t.sim.k8s.objects(ObjectKind::Ingress).is_empty());
        assert!(t.sim.k8s.objects(ObjectKind::Service).is_empty());
        // Namespace and wildcard certificate are shared.
        assert_eq!(t.sim.k8s.objects(ObjectKind::Namespace).len(), 1);
        assert_eq!(t.sim.k8s.objects(ObjectKind::Secret).len(), 1);
    }

    #[tokio::test]
    async fn test_create_delete_create() {
        let t = testing::core();
        let alice = t.user("alice").await;
        let first = created(&t, &alice, "web-1").await;
        Deployments::new(&t.core, None).do_delete(&first).await.unwrap();
        let second = created(&t, &alice, "web-1").await;

        let d = t.core.repo::<Deployment>().require(&second).await.unwrap();
        assert_eq!(d.name, "web-1");
        assert_eq!(t.sim.k8s.objects(ObjectKind::Deployment).len(), 1);
    }

    #[tokio::test]
    async fn test_custom_deployment_sets_up_registry() {
        let t = testing::core();
        let alice = t.user("alice").await;
        let mut p = params("api");
        p.image = None;
        let job = Deployments::new(&t.core, Some(&alice)).create(p).await.unwrap();
        Deployments::new(&t.core, None).do_create(&job.id).await.unwrap();

        let d = t.core.repo::<Deployment>().require(&job.id).await.unwrap();
        assert_eq!(d.image, "registry.fabric.local/u-alice/api");
        assert!(d.subsystems.harbor.robot.is_some());
        assert!(d.subsystems.k8s.secret_map.contains_key(generator::IMAGE_PULL_SECRET));
        assert_eq!(
            d.subsystems.k8s.deployment_map[MAIN].image_pull_secrets,
            vec!["api-image-pull-secret"]
        );
    }

    #[tokio::test]
    async fn test_unreachable_source_is_a_placeholder() {
        let t = testing::core();
        let alice = t.user("alice").await;
        let mut p = params("api");
        p.image = None;
        p.github = Some(GithubSource {
            repository_id: 7,
            repository_name: "alice/api".into(),
            default_branch: Some("main".into()),
        });
        t.sim.github.fail_next(
            ObjectKind::GithubWebhook,
            Operation::Create,
            SubsystemError::Unauthorized("bad token".into()),
        );
        let job = Deployments::new(&t.core, Some(&alice)).create(p).await.unwrap();
        Deployments::new(&t.core, None).do_create(&job.id).await.unwrap();

        let d = t.core.repo::<Deployment>().require(&job.id).await.unwrap();
        assert!(d.subsystems.github.placeholder);
        assert!(d.subsystems.github.last_build.is_none());
        assert!(t.sim.github.objects(ObjectKind::BuildRun).is_empty());
    }

    #[tokio::test]
    async fn test_initial_build_on_default_branch() {
        let t = testing::core();
        let alice = t.user("alice").await;
        let mut p = params("api");
        p.image = None;
        p.github = Some(GithubSource {
            repository_id: 7,
            repository_name: "alice/api".into(),
            default_branch: Some("main".into()),
        });
        let job = Deployments::new(&t.core, Some(&alice)).create(p).await.unwrap();
        Deployments::new(&t.core, None).do_create(&job.id).await.unwrap();

        let d = t.core.repo::<Deployment>().require(&job.id).await.unwrap();
        let build = d.subsystems.github.last_build.unwrap();
        assert_eq!(build.git_ref, "main");
        assert_eq!(build.status.as_deref(), Some("queued"));
        assert!(d.subsystems.github.webhook.is_some());
    }

    #[tokio::test]
    async fn test_zone_without_capability_terminates() {
        let mut config = crate::config::FabricConfig::default();
        config.zones[0].capabilities = vec!["vm".to_string()];
        let t = testing::core_with(config);
        let alice = t.user("alice").await;
        let job = Deployments::new(&t.core, Some(&alice))
            .create(params("web"))
            .await
            .unwrap();

        let err = Deployments::new(&t.core, None).do_create(&job.id).await.unwrap_err();
        assert!(err.is_terminal());
        assert_eq!(t.sim.k8s.writes(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_clears_activity_later() {
        let t = testing::core();
        let alice = t.user("alice").await;
        let id = created(&t, &alice, "web-1").await;

        Deployments::new(&t.core, Some(&alice))
            .command(&id, Command::Restart)
            .await
            .unwrap();
        let d = t.core.repo::<Deployment>().require(&id).await.unwrap();
        assert!(d.has_activity(ActivityTag::Restarting));
        assert!(d.subsystems.k8s.deployment_map[MAIN].restarted_at.is_some());

        tokio::time::sleep(RESTART_ACTIVITY + Duration::from_millis(10)).await;
        tokio::task::yield_now().await;
        let d = t.core.repo::<Deployment>().require(&id).await.unwrap();
        assert!(!d.has_activity(ActivityTag::Restarting));
    }

    #[tokio::test]
    async fn test_update_owner_moves_namespace() {
        let t = testing::core();
        let alice = t.user("alice").await;
        t.user("bob").await;
        let id = created(&t, &alice, "web-1").await;

        let params = UpdateOwnerParams {
            new_owner_id: UserId::parse("bob").unwrap(),
            old_owner_id: UserId::parse("alice").unwrap(),
        };
        let system = Deployments::new(&t.core, None);
        system.do_update_owner(&id, &params, None).await.unwrap();
        // Reapplying the same transfer lands in the same state.
        system.do_update_owner(&id, &params, None).await.unwrap();

        let d = t.core.repo::<Deployment>().require(&id).await.unwrap();
        assert_eq!(d.owner_id.as_str(), "bob");
        assert!(d.transfer.is_none());
        assert_eq!(d.subsystems.k8s.deployment_map[MAIN].namespace, "u-bob");
        let scopes: Vec<String> = t
            .sim
            .k8s
            .objects(ObjectKind::Deployment)
            .into_iter()
            .map(|(key, _)| key.scope)
            .collect();
        assert_eq!(scopes, vec!["u-bob"]);
    }

    #[tokio::test]
    async fn test_image_push_restarts_custom_deployment() {
        let t = testing::core();
        let alice = t.user("alice").await;
        let mut p = params("api");
        p.image = None;
        let job = Deployments::new(&t.core, Some(&alice)).create(p).await.unwrap();
        let system = Deployments::new(&t.core, None);
        system.do_create(&job.id).await.unwrap();
        remove_activity(&t.core.repo::<Deployment>(), &job.id, ActivityTag::BeingCreated)
            .await
            .unwrap();

        assert_eq!(system.on_image_pushed("u-alice", "api").await.unwrap(), 1);
        assert_eq!(system.on_image_pushed("u-bob", "api").await.unwrap(), 0);
        let d = t.core.repo::<Deployment>().require(&job.id).await.unwrap();
        assert!(d.restarted_at.is_some());
    }

    #[test]
    fn test_command_parsing() {
        let restart: Command = serde_json::from_value(json!({"command": "restart"})).unwrap();
        assert_eq!(restart, Command::Restart);
        let build: Command =
            serde_json::from_value(json!({"command": "build", "ref": "dev"})).unwrap();
        assert_eq!(
            build,
            Command::Build {
                git_ref: Some("dev".into())
            }
        );
    }
}
