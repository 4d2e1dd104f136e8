//! CI provider public objects.

use chrono::{DateTime, Utc};
use fabric_reconcile::Public;
use serde::{Deserialize, Serialize};

use super::{ObjectKind, PublicObject};

/// Push webhook on a source repository.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Webhook {
    pub name: String,
    pub repository_id: i64,
    pub target: String,
    #[serde(default)]
    pub secret: String,
    #[serde(default)]
    pub events: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

/// One CI build producing a deployment image.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildRun {
    pub name: String,
    pub repository_id: i64,
    #[serde(rename = "ref")]
    pub git_ref: String,
    /// Image the build pushes to.
    pub image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl Public for Webhook {
    fn key(&self) -> String {
        self.name.clone()
    }

    fn inherit(&mut self, live: &Self) {
        self.id = live.id;
    }
}

impl Public for BuildRun {
    fn key(&self) -> String {
        self.name.clone()
    }

    fn inherit(&mut self, live: &Self) {
        self.id = live.id;
        self.status.clone_from(&live.status);
    }
}

impl PublicObject for Webhook {
    const KIND: ObjectKind = ObjectKind::GithubWebhook;
}

impl PublicObject for BuildRun {
    const KIND: ObjectKind = ObjectKind::BuildRun;
}

/// Last applied CI objects of one deployment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GithubRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook: Option<Webhook>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_build: Option<BuildRun>,
    /// The repository could not be reached; CI integration is a placeholder.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub placeholder: bool,
}
