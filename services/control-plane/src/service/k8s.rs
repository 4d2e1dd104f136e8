//! Converging the k8s objects of a deployment or storage manager.
//!
//! Objects are grouped by kind into maps keyed by logical name, recorded at
//! `subsystems.k8s.<kind>Map.<name>` of the owning document. Namespaces and
//! the wildcard certificate are shared with the owner's other resources
//! and are never deleted.
//!
//! Persistent volumes and their claims cannot be changed in place. When any
//! of them drifts, the claims, the volumes and the deployments mounting
//! them are deleted and recreated together.

use std::collections::BTreeMap;

use fabric_reconcile::{
    equivalent, ObjectOps, Public, Retained, SsCreator, SsDeleter, SsUpdater, WriteBack,
};
use tracing::{debug, info, instrument};

use super::reconcile::{repair_map, repair_one, ObjectClient, RecordWriter};
use super::{Core, ServiceError};
use crate::db::Collection;
use crate::subsystems::k8s::{
    Deployment, Ingress, K8sRecord, Namespace, PersistentVolume, PersistentVolumeClaim, Secret,
    Service,
};
use crate::subsystems::PublicObject;

/// Name of the TLS secret copied into every user namespace.
pub const WILDCARD_CERT_SECRET: &str = "wildcard-cert";

/// Everything a generator wants to exist in k8s for one resource.
#[derive(Debug, Clone, Default)]
pub struct K8sObjects {
    pub namespace: Namespace,
    pub secrets: BTreeMap<String, Secret>,
    pub pvs: BTreeMap<String, PersistentVolume>,
    pub pvcs: BTreeMap<String, PersistentVolumeClaim>,
    pub deployments: BTreeMap<String, Deployment>,
    pub services: BTreeMap<String, Service>,
    pub ingresses: BTreeMap<String, Ingress>,
}

/// k8s reconciliation for one resource document.
pub struct K8sSync<'a> {
    core: &'a Core,
    collection: Collection,
    id: String,
    zone: String,
}

fn is_shared_secret(secret: &Secret) -> bool {
    secret.name == WILDCARD_CERT_SECRET
}

impl<'a> K8sSync<'a> {
    pub fn new(core: &'a Core, collection: Collection, id: impl ToString, zone: &str) -> Self {
        Self {
            core,
            collection,
            id: id.to_string(),
            zone: zone.to_string(),
        }
    }

    fn client<T: PublicObject>(&self, scope: &str) -> ObjectClient<T> {
        ObjectClient::new(&self.core.subsystems.k8s, &self.zone, scope)
    }

    fn writer(&self, path: impl AsRef<str>) -> RecordWriter<'a> {
        RecordWriter::new(
            self.core.store.as_ref(),
            self.collection,
            &self.id,
            format!("subsystems.k8s.{}", path.as_ref()),
        )
    }

    async fn create_all<T, O>(&self, ops: &O, map: &str, objects: &BTreeMap<String, T>) -> Result<(), ServiceError>
    where
        T: PublicObject,
        O: ObjectOps<T, Error = ServiceError>,
    {
        for (name, object) in objects {
            let writer = self.writer(format!("{map}.{name}"));
            SsCreator::new(ops, &writer)
                .with_public(object.clone())
                .exec()
                .await?;
        }
        Ok(())
    }

    async fn delete_all<T>(
        &self,
        map: &str,
        recorded: &BTreeMap<String, T>,
        scope: impl Fn(&T) -> String,
    ) -> Result<(), ServiceError>
    where
        T: PublicObject,
    {
        for (name, object) in recorded {
            let client = self.client::<T>(&scope(object));
            let writer = self.writer(format!("{map}.{name}"));
            SsDeleter::<T, _, _>::new(&client, &writer)
                .with_key(object.key())
                .exec()
                .await?;
        }
        Ok(())
    }

    /// Create every generated object, in dependency order.
    #[instrument(skip(self, generated), fields(resource_id = %self.id))]
    pub async fn create(&self, generated: &K8sObjects) -> Result<(), ServiceError> {
        let ns = &generated.namespace.name;

        let namespaces = self.client::<Namespace>("");
        SsCreator::new(&Retained(&namespaces), &self.writer("namespace"))
            .with_public(generated.namespace.clone())
            .exec()
            .await?;

        self.create_all(&self.client::<PersistentVolume>(""), "pvMap", &generated.pvs)
            .await?;
        self.create_all(&self.client::<PersistentVolumeClaim>(ns), "pvcMap", &generated.pvcs)
            .await?;
        self.create_all(&self.client::<Secret>(ns), "secretMap", &generated.secrets)
            .await?;
        self.create_all(&self.client::<Deployment>(ns), "deploymentMap", &generated.deployments)
            .await?;
        self.create_all(&self.client::<Service>(ns), "serviceMap", &generated.services)
            .await?;
        self.create_all(&self.client::<Ingress>(ns), "ingressMap", &generated.ingresses)
            .await?;

        info!(namespace = %ns, "k8s objects created");
        Ok(())
    }

    /// Delete every recorded object. Shared objects are only forgotten.
    #[instrument(skip(self, recorded), fields(resource_id = %self.id))]
    pub async fn delete(&self, recorded: &K8sRecord) -> Result<(), ServiceError> {
        self.delete_all("ingressMap", &recorded.ingress_map, |o: &Ingress| o.namespace.clone())
            .await?;
        self.delete_all("serviceMap", &recorded.service_map, |o: &Service| o.namespace.clone())
            .await?;
        self.delete_all("deploymentMap", &recorded.deployment_map, |o: &Deployment| {
            o.namespace.clone()
        })
        .await?;
        self.delete_all("pvcMap", &recorded.pvc_map, |o: &PersistentVolumeClaim| {
            o.namespace.clone()
        })
        .await?;
        self.delete_all("pvMap", &recorded.pv_map, |_: &PersistentVolume| String::new())
            .await?;

        for (name, secret) in &recorded.secret_map {
            let client = self.client::<Secret>(&secret.namespace);
            let writer = self.writer(format!("secretMap.{name}"));
            if is_shared_secret(secret) {
                SsDeleter::<Secret, _, _>::new(&Retained(&client), &writer)
                    .with_key(secret.name.clone())
                    .exec()
                    .await?;
            } else {
                SsDeleter::<Secret, _, _>::new(&client, &writer)
                    .with_key(secret.name.clone())
                    .exec()
                    .await?;
            }
        }

        if let Some(namespace) = &recorded.namespace {
            let client = self.client::<Namespace>("");
            SsDeleter::<Namespace, _, _>::new(&Retained(&client), &self.writer("namespace"))
                .with_key(namespace.name.clone())
                .exec()
                .await?;
        }

        info!("k8s objects deleted");
        Ok(())
    }

    /// Converge k8s to `generated`. Returns whether anything was written.
    ///
    /// Errors from the ingresses surface last, after everything else has
    /// converged.
    #[instrument(skip(self, recorded, generated), fields(resource_id = %self.id))]
    pub async fn repair(&self, recorded: &K8sRecord, generated: K8sObjects) -> Result<bool, ServiceError> {
        let store = self.core.store.as_ref();
        let ns = generated.namespace.name.clone();
        let mut changed = false;

        let namespaces = self.client::<Namespace>("");
        changed |= repair_one(
            &Retained(&namespaces),
            store,
            self.collection,
            &self.id,
            "subsystems.k8s.namespace",
            recorded.namespace.as_ref(),
            Some(generated.namespace.clone()),
        )
        .await?
        .changed();

        let secrets = self.client::<Secret>(&ns);
        let (shared_recorded, own_recorded): (BTreeMap<_, _>, BTreeMap<_, _>) = recorded
            .secret_map
            .clone()
            .into_iter()
            .partition(|(_, s)| is_shared_secret(s));
        let (shared, own): (BTreeMap<_, _>, BTreeMap<_, _>) = generated
            .secrets
            .clone()
            .into_iter()
            .partition(|(_, s)| is_shared_secret(s));
        changed |= repair_map(
            &Retained(&secrets),
            store,
            self.collection,
            &self.id,
            "subsystems.k8s.secretMap",
            &shared_recorded,
            shared,
        )
        .await?;
        changed |= repair_map(
            &secrets,
            store,
            self.collection,
            &self.id,
            "subsystems.k8s.secretMap",
            &own_recorded,
            own,
        )
        .await?;

        if self.volumes_converged(recorded, &generated).await? {
            changed |= repair_map(
                &self.client::<Deployment>(&ns),
                store,
                self.collection,
                &self.id,
                "subsystems.k8s.deploymentMap",
                &recorded.deployment_map,
                generated.deployments.clone(),
            )
            .await?;
        } else {
            self.recreate_volume_cohort(recorded, &generated).await?;
            changed = true;
        }

        changed |= repair_map(
            &self.client::<Service>(&ns),
            store,
            self.collection,
            &self.id,
            "subsystems.k8s.serviceMap",
            &recorded.service_map,
            generated.services.clone(),
        )
        .await?;

        changed |= repair_map(
            &self.client::<Ingress>(&ns),
            store,
            self.collection,
            &self.id,
            "subsystems.k8s.ingressMap",
            &recorded.ingress_map,
            generated.ingresses,
        )
        .await?;

        debug!(changed, "k8s repaired");
        Ok(changed)
    }

    /// Bump the restart marker of one deployment.
    pub async fn restart(&self, map_name: &str, mut deployment: Deployment) -> Result<(), ServiceError> {
        deployment.restarted_at = Some(chrono::Utc::now());
        let client = self.client::<Deployment>(&deployment.namespace);
        let writer = self.writer(format!("deploymentMap.{map_name}"));
        SsUpdater::new(&client, &writer)
            .with_public(deployment)
            .exec()
            .await?;
        Ok(())
    }

    /// Create missing volumes and claims and record the live ones. Returns
    /// false if any of them drifted or is no longer wanted.
    async fn volumes_converged(&self, recorded: &K8sRecord, generated: &K8sObjects) -> Result<bool, ServiceError> {
        let stale = recorded.pv_map.keys().any(|k| !generated.pvs.contains_key(k))
            || recorded.pvc_map.keys().any(|k| !generated.pvcs.contains_key(k));
        if stale {
            return Ok(false);
        }

        let pvs = self.client::<PersistentVolume>("");
        for (name, pv) in &generated.pvs {
            if !self.converge_sticky(&pvs, &format!("pvMap.{name}"), pv).await? {
                return Ok(false);
            }
        }
        let pvcs = self.client::<PersistentVolumeClaim>(&generated.namespace.name);
        for (name, pvc) in &generated.pvcs {
            if !self.converge_sticky(&pvcs, &format!("pvcMap.{name}"), pvc).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn converge_sticky<T: PublicObject>(
        &self,
        ops: &ObjectClient<T>,
        path: &str,
        generated: &T,
    ) -> Result<bool, ServiceError> {
        let writer = self.writer(path);
        let Some(live) = ops.read(&generated.key()).await? else {
            SsCreator::new(ops, &writer)
                .with_public(generated.clone())
                .exec()
                .await?;
            return Ok(true);
        };

        let mut expected = generated.clone();
        expected.inherit(&live);
        if !equivalent(&expected, &live) {
            return Ok(false);
        }
        WriteBack::<T, ServiceError>::write(&writer, Some(&live)).await?;
        Ok(true)
    }

    /// Deployment, claim, volume deletes, then volume, claim, deployment
    /// creates.
    async fn recreate_volume_cohort(&self, recorded: &K8sRecord, generated: &K8sObjects) -> Result<(), ServiceError> {
        info!(resource_id = %self.id, "Volumes drifted, recreating them with their deployments");
        let ns = &generated.namespace.name;

        let mut deployments = recorded.deployment_map.clone();
        deployments.extend(generated.deployments.clone());
        self.delete_all("deploymentMap", &deployments, |o: &Deployment| o.namespace.clone())
            .await?;

        let mut pvcs = recorded.pvc_map.clone();
        pvcs.extend(generated.pvcs.clone());
        self.delete_all("pvcMap", &pvcs, |o: &PersistentVolumeClaim| o.namespace.clone())
            .await?;

        let mut pvs = recorded.pv_map.clone();
        pvs.extend(generated.pvs.clone());
        self.delete_all("pvMap", &pvs, |_: &PersistentVolume| String::new())
            .await?;

        self.create_all(&self.client::<PersistentVolume>(""), "pvMap", &generated.pvs)
            .await?;
        self.create_all(&self.client::<PersistentVolumeClaim>(ns), "pvcMap", &generated.pvcs)
            .await?;
        self.create_all(&self.client::<Deployment>(ns), "deploymentMap", &generated.deployments)
            .await?;
        Ok(())
    }
}
