//! Resource migrations: protocol state of an ownership transfer.

use chrono::{DateTime, Utc};
use fabric_id::{MigrationId, UserId};
use serde::{Deserialize, Serialize};

use super::ResourceKind;
use crate::db::{Collection, Document};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MigrationType {
    UpdateOwner,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MigrationStatus {
    Pending,
    Accepted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateOwnerParams {
    pub new_owner_id: UserId,
    pub old_owner_id: UserId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceMigration {
    pub id: MigrationId,
    /// The user that requested the migration.
    pub user_id: UserId,
    pub resource_id: String,
    pub resource_type: ResourceKind,
    #[serde(rename = "type")]
    pub migration_type: MigrationType,
    pub status: MigrationStatus,
    /// Shared with the new owner; absent when the migration needs no consent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub params: UpdateOwnerParams,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Document for ResourceMigration {
    const COLLECTION: Collection = Collection::ResourceMigrations;
}
