//! The kind-erased document store and its typed facade.

use std::fmt;
use std::marker::PhantomData;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use super::filter::{Filter, Pagination, Patch, PatchOutcome};
use super::StoreError;

/// Document collections other than jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Collection {
    Deployments,
    Vms,
    StorageManagers,
    GpuLeases,
    GpuGroups,
    VmPorts,
    Notifications,
    ResourceMigrations,
    Teams,
    Users,
    WorkerStatus,
}

impl Collection {
    pub const ALL: [Collection; 11] = [
        Self::Deployments,
        Self::Vms,
        Self::StorageManagers,
        Self::GpuLeases,
        Self::GpuGroups,
        Self::VmPorts,
        Self::Notifications,
        Self::ResourceMigrations,
        Self::Teams,
        Self::Users,
        Self::WorkerStatus,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Deployments => "deployments",
            Self::Vms => "vms",
            Self::StorageManagers => "storageManagers",
            Self::GpuLeases => "gpuLeases",
            Self::GpuGroups => "gpuGroups",
            Self::VmPorts => "vmPorts",
            Self::Notifications => "notifications",
            Self::ResourceMigrations => "resourceMigrations",
            Self::Teams => "teams",
            Self::Users => "users",
            Self::WorkerStatus => "workerStatus",
        }
    }

    pub fn table(&self) -> &'static str {
        match self {
            Self::Deployments => "deployments",
            Self::Vms => "vms",
            Self::StorageManagers => "storage_managers",
            Self::GpuLeases => "gpu_leases",
            Self::GpuGroups => "gpu_groups",
            Self::VmPorts => "vm_ports",
            Self::Notifications => "notifications",
            Self::ResourceMigrations => "resource_migrations",
            Self::Teams => "teams",
            Self::Users => "users",
            Self::WorkerStatus => "worker_status",
        }
    }

    /// Whether `name` is unique among live documents.
    pub fn unique_name(&self) -> bool {
        matches!(
            self,
            Self::Deployments | Self::Vms | Self::StorageManagers | Self::GpuGroups
        )
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// JSON documents keyed by their `id` field.
///
/// Writes are atomic per document. Soft-deleted documents (`deletedAt`
/// set) are invisible to reads unless asked for and are never patched.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Insert a new document.
    ///
    /// Fails with `NonUniqueField` if a live document has the same id or,
    /// for name-unique collections, the same name. A soft-deleted document
    /// with the same id is replaced.
    async fn insert(&self, collection: Collection, doc: Value) -> Result<(), StoreError>;

    /// Insert or fully replace a document.
    async fn upsert(&self, collection: Collection, doc: Value) -> Result<(), StoreError>;

    async fn get(
        &self,
        collection: Collection,
        id: &str,
        include_deleted: bool,
    ) -> Result<Option<Value>, StoreError>;

    async fn find(&self, collection: Collection, filter: &Filter) -> Result<Vec<Value>, StoreError>;

    async fn count(&self, collection: Collection, filter: &Filter) -> Result<u64, StoreError>;

    /// Apply a field-level patch to a live document.
    async fn patch(
        &self,
        collection: Collection,
        id: &str,
        patch: &Patch,
    ) -> Result<PatchOutcome, StoreError>;

    /// Remove a document outright. Returns whether it existed.
    async fn remove(&self, collection: Collection, id: &str) -> Result<bool, StoreError>;

    async fn health_check(&self) -> Result<(), StoreError>;
}

pub(crate) fn doc_id(doc: &Value) -> Result<&str, StoreError> {
    doc.get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| StoreError::InvalidDocument("document has no string id".to_string()))
}

pub(crate) fn doc_name(doc: &Value) -> Option<&str> {
    doc.get("name").and_then(Value::as_str)
}

pub(crate) fn doc_created_at(doc: &Value) -> Option<DateTime<Utc>> {
    doc.get("createdAt")
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
}

/// A typed document living in one collection.
pub trait Document: Serialize + DeserializeOwned + Send + Sync {
    const COLLECTION: Collection;
}

/// Typed access to the documents of `T`'s collection.
pub struct Repo<'a, T> {
    store: &'a dyn DocumentStore,
    _doc: PhantomData<fn() -> T>,
}

impl<'a, T: Document> Repo<'a, T> {
    pub fn new(store: &'a dyn DocumentStore) -> Self {
        Self {
            store,
            _doc: PhantomData,
        }
    }

    fn decode(value: Value) -> Result<T, StoreError> {
        Ok(serde_json::from_value(value)?)
    }

    pub async fn insert(&self, doc: &T) -> Result<(), StoreError> {
        self.store
            .insert(T::COLLECTION, serde_json::to_value(doc)?)
            .await
    }

    pub async fn upsert(&self, doc: &T) -> Result<(), StoreError> {
        self.store
            .upsert(T::COLLECTION, serde_json::to_value(doc)?)
            .await
    }

    pub async fn get(&self, id: &str) -> Result<Option<T>, StoreError> {
        self.store
            .get(T::COLLECTION, id, false)
            .await?
            .map(Self::decode)
            .transpose()
    }

    pub async fn get_including_deleted(&self, id: &str) -> Result<Option<T>, StoreError> {
        self.store
            .get(T::COLLECTION, id, true)
            .await?
            .map(Self::decode)
            .transpose()
    }

    /// Like [`Repo::get`], but a missing document is `NotFound`.
    pub async fn require(&self, id: &str) -> Result<T, StoreError> {
        self.get(id).await?.ok_or_else(|| StoreError::NotFound {
            collection: T::COLLECTION.name(),
            id: id.to_string(),
        })
    }

    pub async fn find(&self, filter: &Filter) -> Result<Vec<T>, StoreError> {
        self.store
            .find(T::COLLECTION, filter)
            .await?
            .into_iter()
            .map(Self::decode)
            .collect()
    }

    pub async fn first(&self, filter: Filter) -> Result<Option<T>, StoreError> {
        let filter = filter.with_pagination(Some(Pagination {
            page: 0,
            page_size: 1,
        }));
        Ok(self.find(&filter).await?.into_iter().next())
    }

    pub async fn count(&self, filter: &Filter) -> Result<u64, StoreError> {
        self.store.count(T::COLLECTION, filter).await
    }

    pub async fn exists(&self, filter: &Filter) -> Result<bool, StoreError> {
        Ok(self.count(filter).await? > 0)
    }

    pub async fn patch(&self, id: &str, patch: &Patch) -> Result<PatchOutcome, StoreError> {
        self.store.patch(T::COLLECTION, id, patch).await
    }

    /// Apply an unguarded patch; a missing document is `NotFound`.
    pub async fn update(&self, id: &str, patch: &Patch) -> Result<(), StoreError> {
        match self.patch(id, patch).await? {
            PatchOutcome::NotFound => Err(StoreError::NotFound {
                collection: T::COLLECTION.name(),
                id: id.to_string(),
            }),
            PatchOutcome::GuardFailed | PatchOutcome::Applied => Ok(()),
        }
    }

    /// Write one value at a dotted path.
    pub async fn set_path<V: Serialize>(&self, id: &str, path: &str, value: &V) -> Result<(), StoreError> {
        let patch = Patch::new().set(path, serde_json::to_value(value)?);
        self.update(id, &patch).await
    }

    pub async fn unset_path(&self, id: &str, path: &str) -> Result<(), StoreError> {
        self.update(id, &Patch::new().unset(path)).await
    }

    /// Hide the document from default queries.
    pub async fn soft_delete(&self, id: &str) -> Result<(), StoreError> {
        let patch = Patch::new().set("deletedAt", serde_json::to_value(Utc::now())?);
        self.update(id, &patch).await
    }

    pub async fn remove(&self, id: &str) -> Result<bool, StoreError> {
        self.store.remove(T::COLLECTION, id).await
    }
}
