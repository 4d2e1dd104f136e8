//! Storage managers: one file browser per user over the user's NFS share.

use chrono::{DateTime, Utc};
use fabric_id::{ResourceId, UserId};
use serde::{Deserialize, Serialize};

use super::{impl_resource, Activities, ResourceKind};
use crate::db::{Collection, Document};
use crate::subsystems::k8s::K8sRecord;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SmSubsystems {
    pub k8s: K8sRecord,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageManager {
    pub id: ResourceId,
    pub name: String,
    pub owner_id: UserId,
    pub zone: String,

    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repaired_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub activities: Activities,

    #[serde(default)]
    pub subsystems: SmSubsystems,
}

impl Document for StorageManager {
    const COLLECTION: Collection = Collection::StorageManagers;
}

impl_resource!(StorageManager, ResourceKind::StorageManager);
