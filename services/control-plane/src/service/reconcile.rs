//! Adapters between the reconcile operators, the subsystem clients and the
//! resource records.

use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use fabric_reconcile::{ObjectOps, Public, RepairOutcome, SsDeleter, SsRepairer, WriteBack};
use serde_json::Value;

use super::ServiceError;
use crate::db::{Collection, DocumentStore, Patch, PatchOutcome};
use crate::subsystems::{ObjectApi, ObjectKey, PublicObject, SubsystemError};

/// Typed access to one kind of object within one scope of a subsystem.
pub struct ObjectClient<T> {
    api: Arc<dyn ObjectApi>,
    zone: String,
    scope: String,
    _kind: PhantomData<fn() -> T>,
}

impl<T: PublicObject> ObjectClient<T> {
    pub fn new(api: &Arc<dyn ObjectApi>, zone: &str, scope: &str) -> Self {
        Self {
            api: api.clone(),
            zone: zone.to_string(),
            scope: scope.to_string(),
            _kind: PhantomData,
        }
    }

    pub fn object_key(&self, name: &str) -> ObjectKey {
        ObjectKey {
            zone: self.zone.clone(),
            kind: T::KIND,
            scope: self.scope.clone(),
            name: name.to_string(),
        }
    }

    fn decode(&self, value: Value) -> Result<T, ServiceError> {
        serde_json::from_value(value).map_err(|e| {
            SubsystemError::Other(format!("malformed {} object: {e}", T::KIND)).into()
        })
    }

    pub async fn list(&self) -> Result<Vec<T>, ServiceError> {
        self.api
            .list(&self.zone, T::KIND, &self.scope)
            .await?
            .into_iter()
            .map(|value| self.decode(value))
            .collect()
    }

    pub async fn invoke(&self, name: &str, action: &str, args: Value) -> Result<T, ServiceError> {
        let value = self.api.invoke(&self.object_key(name), action, args).await?;
        self.decode(value)
    }
}

#[async_trait]
impl<T: PublicObject> ObjectOps<T> for ObjectClient<T> {
    type Error = ServiceError;

    async fn read(&self, key: &str) -> Result<Option<T>, ServiceError> {
        match self.api.read(&self.object_key(key)).await? {
            Some(value) => self.decode(value).map(Some),
            None => Ok(None),
        }
    }

    async fn create(&self, public: &T) -> Result<T, ServiceError> {
        let body = serde_json::to_value(public)?;
        let created = self.api.create(&self.object_key(&public.key()), body).await?;
        self.decode(created)
    }

    async fn update(&self, public: &T) -> Result<T, ServiceError> {
        let body = serde_json::to_value(public)?;
        let updated = self.api.update(&self.object_key(&public.key()), body).await?;
        self.decode(updated)
    }

    async fn delete(&self, key: &str) -> Result<(), ServiceError> {
        Ok(self.api.delete(&self.object_key(key)).await?)
    }

    fn is_not_found(err: &ServiceError) -> bool {
        err.subsystem().is_some_and(SubsystemError::is_not_found)
    }
}

/// Records operator results at a dotted path of a resource document.
pub struct RecordWriter<'a> {
    store: &'a dyn DocumentStore,
    collection: Collection,
    id: String,
    path: String,
}

impl<'a> RecordWriter<'a> {
    pub fn new(
        store: &'a dyn DocumentStore,
        collection: Collection,
        id: impl ToString,
        path: impl Into<String>,
    ) -> Self {
        Self {
            store,
            collection,
            id: id.to_string(),
            path: path.into(),
        }
    }
}

#[async_trait]
impl<T: Public> WriteBack<T, ServiceError> for RecordWriter<'_> {
    async fn write(&self, value: Option<&T>) -> Result<(), ServiceError> {
        let patch = match value {
            Some(value) => Patch::new().set(self.path.clone(), serde_json::to_value(value)?),
            None => Patch::new().unset(self.path.clone()),
        };
        match self.store.patch(self.collection, &self.id, &patch).await? {
            PatchOutcome::NotFound => Err(ServiceError::not_found(self.collection.name(), &self.id)),
            PatchOutcome::GuardFailed | PatchOutcome::Applied => Ok(()),
        }
    }
}

/// Converge a map of generated objects against what is recorded under
/// `prefix`, keyed by logical name.
///
/// Recorded entries whose logical name is no longer generated, or whose
/// object was renamed, are deleted.
pub async fn repair_map<T, O>(
    ops: &O,
    store: &dyn DocumentStore,
    collection: Collection,
    id: &str,
    prefix: &str,
    recorded: &BTreeMap<String, T>,
    generated: BTreeMap<String, T>,
) -> Result<bool, ServiceError>
where
    T: PublicObject,
    O: ObjectOps<T, Error = ServiceError>,
{
    let mut changed = false;

    for (name, stale) in recorded {
        let renamed = generated.get(name).is_some_and(|g| g.key() != stale.key());
        if generated.contains_key(name) && !renamed {
            continue;
        }
        let writer = RecordWriter::new(store, collection, id, format!("{prefix}.{name}"));
        SsDeleter::<T, _, _>::new(ops, &writer)
            .with_key(stale.key())
            .exec()
            .await?;
        changed = true;
    }

    for (name, object) in generated {
        let writer = RecordWriter::new(store, collection, id, format!("{prefix}.{name}"));
        let outcome = SsRepairer::new(ops, &writer)
            .with_generated(Some(object))
            .exec()
            .await?;
        changed |= outcome.changed();
    }

    Ok(changed)
}

/// Converge a single generated object recorded at `path`.
pub async fn repair_one<T, O>(
    ops: &O,
    store: &dyn DocumentStore,
    collection: Collection,
    id: &str,
    path: &str,
    recorded: Option<&T>,
    generated: Option<T>,
) -> Result<RepairOutcome, ServiceError>
where
    T: PublicObject,
    O: ObjectOps<T, Error = ServiceError>,
{
    let writer = RecordWriter::new(store, collection, id, path);
    let mut repairer = SsRepairer::new(ops, &writer).with_generated(generated.clone());
    if let Some(recorded) = recorded {
        if generated.as_ref().is_some_and(|g| g.key() != recorded.key()) {
            SsDeleter::<T, _, _>::new(ops, &writer)
                .with_key(recorded.key())
                .exec()
                .await?;
        }
        repairer = repairer.with_key(recorded.key());
    }
    repairer.exec().await
}
