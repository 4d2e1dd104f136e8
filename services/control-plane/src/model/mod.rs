//! Persisted documents.
//!
//! Every document serializes in camelCase; the JSON form is what both the
//! store and the HTTP API see.

pub mod activity;
pub mod deployment;
pub mod gpu;
pub mod job;
pub mod migration;
pub mod notification;
pub mod sm;
pub mod team;
pub mod user;
pub mod vm;
pub mod worker;

use std::fmt;

use chrono::{DateTime, Utc};
use fabric_id::{ResourceId, UserId};
use serde::{Deserialize, Serialize};

use crate::db::Document;

pub use activity::{Activities, Activity, ActivityTag};

/// Kinds of managed resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResourceKind {
    Deployment,
    Vm,
    #[serde(rename = "storageManager")]
    StorageManager,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deployment => "deployment",
            Self::Vm => "vm",
            Self::StorageManager => "storageManager",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pending ownership transfer mirrored on the resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transfer {
    pub user_id: UserId,
    pub code: String,
}

/// Common view of Deployments, VMs and storage managers.
pub trait Resource: Document {
    const KIND: ResourceKind;

    fn id(&self) -> ResourceId;
    fn name(&self) -> &str;
    fn owner_id(&self) -> &UserId;
    fn zone(&self) -> &str;
    fn activities(&self) -> &Activities;
    fn created_at(&self) -> DateTime<Utc>;
    fn deleted_at(&self) -> Option<DateTime<Utc>>;

    fn has_activity(&self, tag: ActivityTag) -> bool {
        self.activities().contains_key(&tag)
    }

    /// No activity in flight.
    fn ready(&self) -> bool {
        self.activities().is_empty()
    }
}

/// Implement [`Resource`] for a document with the usual field names.
macro_rules! impl_resource {
    ($ty:ty, $kind:expr) => {
        impl $crate::model::Resource for $ty {
            const KIND: $crate::model::ResourceKind = $kind;

            fn id(&self) -> fabric_id::ResourceId {
                self.id
            }

            fn name(&self) -> &str {
                &self.name
            }

            fn owner_id(&self) -> &fabric_id::UserId {
                &self.owner_id
            }

            fn zone(&self) -> &str {
                &self.zone
            }

            fn activities(&self) -> &$crate::model::Activities {
                &self.activities
            }

            fn created_at(&self) -> chrono::DateTime<chrono::Utc> {
                self.created_at
            }

            fn deleted_at(&self) -> Option<chrono::DateTime<chrono::Utc>> {
                self.deleted_at
            }
        }
    };
}

pub(crate) use impl_resource;
