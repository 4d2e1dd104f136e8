//! Container deployments.

use chrono::{DateTime, Utc};
use fabric_id::{ResourceId, UserId};
use serde::{Deserialize, Serialize};

use super::{impl_resource, Activities, ResourceKind, Transfer};
use crate::db::{Collection, Document};
use crate::subsystems::github::GithubRecord;
use crate::subsystems::harbor::HarborRecord;
use crate::subsystems::k8s::K8sRecord;

pub const DEFAULT_INTERNAL_PORT: u16 = 8080;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DeploymentType {
    /// Runs a user-supplied image.
    #[default]
    Prebuilt,
    /// Runs an image built into the owner's registry project.
    Custom,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Env {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Volume {
    pub name: String,
    /// Mount point inside the container.
    pub app_path: String,
    /// Directory on the zone's NFS share, relative to the owner's root.
    pub server_path: String,
}

/// Source repository a custom deployment builds from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GithubSource {
    pub repository_id: i64,
    #[serde(default)]
    pub repository_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_branch: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeploymentSubsystems {
    pub k8s: K8sRecord,
    pub harbor: HarborRecord,
    pub github: GithubRecord,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Deployment {
    pub id: ResourceId,
    pub name: String,
    pub owner_id: UserId,
    pub zone: String,
    #[serde(rename = "type")]
    pub deployment_type: DeploymentType,

    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repaired_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restarted_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub activities: Activities,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transfer: Option<Transfer>,

    pub image: String,
    pub replicas: i64,
    #[serde(default)]
    pub envs: Vec<Env>,
    pub internal_port: u16,
    #[serde(default)]
    pub private: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_domain: Option<String>,
    #[serde(default)]
    pub volumes: Vec<Volume>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub github: Option<GithubSource>,

    #[serde(default)]
    pub subsystems: DeploymentSubsystems,
}

impl Deployment {
    /// Replicas counted against the deployment quota.
    pub fn quota_replicas(&self) -> i64 {
        self.replicas.max(1)
    }

    pub fn is_custom(&self) -> bool {
        self.deployment_type == DeploymentType::Custom
    }
}

impl Document for Deployment {
    const COLLECTION: Collection = Collection::Deployments;
}

impl_resource!(Deployment, ResourceKind::Deployment);
