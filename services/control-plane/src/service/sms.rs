//! Storage managers: a file browser over the owner's NFS share, one per
//! user, reachable at `<owner>.<storage domain>`.

use std::collections::BTreeMap;

use chrono::Utc;
use fabric_id::UserId;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use super::activity::can_add_activity;
use super::auth::effective_owner;
use super::k8s::{K8sObjects, K8sSync, WILDCARD_CERT_SECRET};
use super::resources::{self, GetOpts, ListOpts};
use super::{notifications, owner_scope, slug, teams, AuthInfo, Core, JobRef, ResultExt, ServiceError};
use crate::config::ZoneConfig;
use crate::db::{Collection, Filter, Repo};
use crate::job_args;
use crate::model::job::{JobType, JobVersion};
use crate::model::sm::StorageManager;
use crate::model::{Activity, ActivityTag};
use crate::subsystems::k8s::{
    Deployment as K8sDeployment, EnvVar, Ingress, Namespace, PersistentVolume,
    PersistentVolumeClaim, Secret, SecretType, Service, VolumeMount,
};

const MAIN: &str = "main";
const WILDCARD_CERT: &str = "wildcardCert";
const FILE_BROWSER_IMAGE: &str = "filebrowser/filebrowser:v2";
const FILE_BROWSER_PORT: u16 = 80;
const STORAGE_CAPACITY: &str = "50Gi";
const MOUNT_PATH: &str = "/srv";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateParams {
    #[serde(default)]
    pub zone: Option<String>,
    /// Admins may create on behalf of another user.
    #[serde(default)]
    pub owner_id: Option<UserId>,
}

/// Name of the storage manager of `owner`.
pub fn sm_name(owner: &UserId) -> String {
    format!("sm-{}", slug(owner.as_str()))
}

/// Every k8s object a storage manager needs.
pub fn generate_k8s(sm: &StorageManager, zone: &ZoneConfig) -> K8sObjects {
    let ns = owner_scope(&sm.owner_id);
    let pvc_name = format!("{}-data", sm.name);
    let pv = PersistentVolume {
        name: format!("pv-{}", sm.name),
        capacity: STORAGE_CAPACITY.to_string(),
        nfs_server: zone.nfs_server.clone(),
        nfs_path: format!("{}/{}", zone.nfs_path.trim_end_matches('/'), sm.owner_id),
        created_at: None,
    };
    let pvc = PersistentVolumeClaim {
        name: pvc_name.clone(),
        namespace: ns.clone(),
        capacity: STORAGE_CAPACITY.to_string(),
        volume_name: pv.name.clone(),
        created_at: None,
    };

    K8sObjects {
        namespace: Namespace {
            name: ns.clone(),
            created_at: None,
        },
        secrets: BTreeMap::from([(
            WILDCARD_CERT.to_string(),
            Secret {
                name: WILDCARD_CERT_SECRET.to_string(),
                namespace: ns.clone(),
                secret_type: SecretType::Tls,
                data: BTreeMap::new(),
                created_at: None,
            },
        )]),
        pvs: BTreeMap::from([(MAIN.to_string(), pv)]),
        pvcs: BTreeMap::from([(MAIN.to_string(), pvc)]),
        deployments: BTreeMap::from([(
            MAIN.to_string(),
            K8sDeployment {
                name: sm.name.clone(),
                namespace: ns.clone(),
                image: FILE_BROWSER_IMAGE.to_string(),
                replicas: 1,
                envs: vec![EnvVar {
                    name: "FB_ROOT".to_string(),
                    value: MOUNT_PATH.to_string(),
                }],
                port: Some(FILE_BROWSER_PORT),
                volumes: vec![VolumeMount {
                    name: "data".to_string(),
                    pvc_name,
                    mount_path: MOUNT_PATH.to_string(),
                }],
                image_pull_secrets: Vec::new(),
                args: Vec::new(),
                restarted_at: None,
                created_at: None,
            },
        )]),
        services: BTreeMap::from([(
            MAIN.to_string(),
            Service {
                name: sm.name.clone(),
                namespace: ns.clone(),
                port: FILE_BROWSER_PORT,
                target_port: FILE_BROWSER_PORT,
                selector: sm.name.clone(),
                created_at: None,
            },
        )]),
        ingresses: BTreeMap::from([(
            MAIN.to_string(),
            Ingress {
                name: sm.name.clone(),
                namespace: ns,
                service_name: sm.name.clone(),
                service_port: FILE_BROWSER_PORT,
                hosts: vec![format!("{}.{}", slug(sm.owner_id.as_str()), zone.storage_domain)],
                tls_secret: Some(WILDCARD_CERT_SECRET.to_string()),
                created_at: None,
            },
        )]),
    }
}

pub struct Sms<'a> {
    core: &'a Core,
    auth: Option<&'a AuthInfo>,
}

impl<'a> Sms<'a> {
    pub fn new(core: &'a Core, auth: Option<&'a AuthInfo>) -> Self {
        Self { core, auth }
    }

    fn repo(&self) -> Repo<'a, StorageManager> {
        self.core.repo()
    }

    fn job_user(&self) -> Result<UserId, ServiceError> {
        match self.auth {
            Some(auth) => Ok(auth.user_id.clone()),
            None => self.core.manager_id(),
        }
    }

    pub async fn get(&self, id: &str, opts: GetOpts) -> Result<StorageManager, ServiceError> {
        resources::get(self.core, self.auth, id, opts).await
    }

    pub async fn list(&self, opts: &ListOpts) -> Result<Vec<StorageManager>, ServiceError> {
        resources::list(self.core, self.auth, opts).await
    }

    async fn get_for(&self, id: &str, tag: ActivityTag) -> Result<StorageManager, ServiceError> {
        let sm = self.get(id, GetOpts::default()).await?;
        let (allowed, reason) = can_add_activity(&self.repo(), id, tag).await?;
        if !allowed {
            return Err(ServiceError::ConflictingActivity(reason));
        }
        Ok(sm)
    }

    async fn enqueue(&self, job_type: JobType, id: &str) -> Result<JobRef, ServiceError> {
        let job_id = self
            .core
            .enqueue(&self.job_user()?, job_type, JobVersion::V2, job_args! { "id" => id })
            .await?;
        Ok(JobRef::new(id, job_id))
    }

    #[instrument(skip(self, params))]
    pub async fn create(&self, params: CreateParams) -> Result<JobRef, ServiceError> {
        let zone = self.core.zone(params.zone.as_deref())?.clone();
        let owner_id = match self.auth {
            Some(auth) => effective_owner(auth, params.owner_id.as_ref())?,
            None => params
                .owner_id
                .clone()
                .ok_or_else(|| ServiceError::invalid("ownerId is required"))?,
        };
        if self
            .repo()
            .exists(&Filter::new().with_owner(owner_id.as_str()))
            .await?
        {
            return Err(ServiceError::AlreadyExists(format!(
                "storage manager of user {owner_id}"
            )));
        }

        let mut sm = StorageManager {
            id: fabric_id::ResourceId::new(),
            name: sm_name(&owner_id),
            owner_id,
            zone: zone.name.clone(),
            created_at: Utc::now(),
            repaired_at: None,
            deleted_at: None,
            activities: Default::default(),
            subsystems: Default::default(),
        };
        sm.activities
            .insert(ActivityTag::BeingCreated, Activity::new(ActivityTag::BeingCreated));
        match self.repo().insert(&sm).await {
            Ok(()) => {}
            Err(err) if err.is_non_unique() => {
                return Err(ServiceError::AlreadyExists(format!("storage manager {}", sm.name)));
            }
            Err(err) => return Err(err.into()),
        }
        self.enqueue(JobType::CreateSm, &sm.id.to_string()).await
    }

    #[instrument(skip(self))]
    pub async fn delete(&self, id: &str) -> Result<JobRef, ServiceError> {
        self.get_for(id, ActivityTag::BeingDeleted).await?;
        self.enqueue(JobType::DeleteSm, id).await
    }

    #[instrument(skip(self))]
    pub async fn repair(&self, id: &str) -> Result<JobRef, ServiceError> {
        self.get_for(id, ActivityTag::Repairing).await?;
        self.enqueue(JobType::RepairSm, id).await
    }

    #[instrument(skip(self))]
    pub async fn do_create(&self, id: &str) -> Result<(), ServiceError> {
        let sm = self.repo().require(id).await?;
        let zone = self.core.zone_with(&sm.zone, "sm")?;
        let sync = K8sSync::new(self.core, Collection::StorageManagers, id, &zone.name);

        if let Err(err) = sync.create(&generate_k8s(&sm, zone)).await {
            if let Err(repair_err) = self.do_repair(id).await {
                tracing::warn!(sm_id = %id, error = %repair_err, "Repair after failed create failed");
            }
            return Err(err.context(format!("create storage manager {id}")).abandon());
        }
        info!(sm_id = %id, owner_id = %sm.owner_id, "Storage manager created");
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn do_delete(&self, id: &str) -> Result<(), ServiceError> {
        let Some(sm) = self.repo().get(id).await? else {
            return Ok(());
        };
        notifications::delete_for_resource(self.core, id).await?;
        teams::clean_resource(self.core, id).await?;

        K8sSync::new(self.core, Collection::StorageManagers, id, &sm.zone)
            .delete(&sm.subsystems.k8s)
            .await
            .context(|| format!("delete k8s objects of storage manager {id}"))?;
        self.repo().soft_delete(id).await?;
        info!(sm_id = %id, "Storage manager deleted");
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn do_repair(&self, id: &str) -> Result<(), ServiceError> {
        let sm = self.repo().require(id).await?;
        let zone = self.core.zone(Some(&sm.zone))?;
        K8sSync::new(self.core, Collection::StorageManagers, id, &zone.name)
            .repair(&sm.subsystems.k8s, generate_k8s(&sm, zone))
            .await
            .context(|| format!("repair storage manager {id}"))?;
        self.repo().set_path(id, "repairedAt", &Utc::now()).await?;
        info!(sm_id = %id, "Storage manager repaired");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::testing;
    use crate::subsystems::ObjectKind;

    async fn created(t: &testing::TestCore, auth: &AuthInfo) -> String {
        let job = Sms::new(&t.core, Some(auth)).create(CreateParams::default()).await.unwrap();
        Sms::new(&t.core, None).do_create(&job.id).await.unwrap();
        crate::service::activity::remove_activity(
            &t.core.repo::<StorageManager>(),
            &job.id,
            ActivityTag::BeingCreated,
        )
        .await
        .unwrap();
        job.id
    }

    #[tokio::test]
    async fn test_one_per_user() {
        let t = testing::core();
        let alice = t.user("alice").await;
        created(&t, &alice).await;

        let err = Sms::new(&t.core, Some(&alice))
            .create(CreateParams::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_create_sets_up_file_browser() {
        let t = testing::core();
        let alice = t.user("alice").await;
        let id = created(&t, &alice).await;

        let sm = t.core.repo::<StorageManager>().require(&id).await.unwrap();
        assert_eq!(sm.name, "sm-alice");
        let k8s = &sm.subsystems.k8s;
        assert_eq!(k8s.ingress_map[MAIN].hosts, vec!["alice.storage.fabric.local"]);
        assert_eq!(k8s.pv_map[MAIN].nfs_path, "/mnt/cloud/alice");
        assert_eq!(k8s.deployment_map[MAIN].namespace, "u-alice");
        assert_eq!(t.sim.k8s.objects(ObjectKind::PersistentVolumeClaim).len(), 1);
    }

    #[tokio::test]
    async fn test_repair_is_idempotent() {
        let t = testing::core();
        let alice = t.user("alice").await;
        let id = created(&t, &alice).await;
        let system = Sms::new(&t.core, None);

        system.do_repair(&id).await.unwrap();
        let writes = t.sim.writes();
        system.do_repair(&id).await.unwrap();
        assert_eq!(t.sim.writes(), writes);
    }

    #[tokio::test]
    async fn test_delete_then_recreate() {
        let t = testing::core();
        let alice = t.user("alice").await;
        let id = created(&t, &alice).await;

        Sms::new(&t.core, None).do_delete(&id).await.unwrap();
        assert!(t.core.repo::<StorageManager>().get(&id).await.unwrap().is_none());
        assert!(t.sim.k8s.objects(ObjectKind::Deployment).is_empty());
        assert!(t.sim.k8s.objects(ObjectKind::PersistentVolume).is_empty());

        created(&t, &alice).await;
        assert_eq!(t.sim.k8s.objects(ObjectKind::Deployment).len(), 1);
    }

    #[tokio::test]
    async fn test_zone_without_capability_terminates() {
        let mut config = crate::config::FabricConfig::default();
        config.zones[0].capabilities = vec!["vm".to_string()];
        let t = testing::core_with(config);
        let alice = t.user("alice").await;
        let job = Sms::new(&t.core, Some(&alice))
            .create(CreateParams::default())
            .await
            .unwrap();

        let err = Sms::new(&t.core, None).do_create(&job.id).await.unwrap_err();
        assert!(err.is_terminal());
        assert_eq!(t.sim.k8s.writes(), 0);
    }
}
