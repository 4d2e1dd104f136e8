//! Image registry public objects.

use chrono::{DateTime, Utc};
use fabric_reconcile::Public;
use serde::{Deserialize, Serialize};

use super::{ObjectKind, PublicObject};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub name: String,
    #[serde(default)]
    pub public: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

/// Robot account used as image pull credentials.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Robot {
    pub name: String,
    pub project: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl Robot {
    /// Login name the registry expects for a project robot.
    pub fn full_name(&self) -> String {
        format!("robot${}+{}", self.project, self.name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Repository {
    pub name: String,
    pub project: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

/// Push notification policy pointing back at the control plane.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Webhook {
    pub name: String,
    pub project: String,
    pub target: String,
    #[serde(default)]
    pub token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl Public for Project {
    fn key(&self) -> String {
        self.name.clone()
    }

    fn inherit(&mut self, live: &Self) {
        self.id = live.id;
    }
}

impl Public for Robot {
    fn key(&self) -> String {
        self.name.clone()
    }

    fn inherit(&mut self, live: &Self) {
        self.id = live.id;
        if self.secret.is_none() {
            self.secret.clone_from(&live.secret);
        }
    }
}

impl Public for Repository {
    fn key(&self) -> String {
        self.name.clone()
    }

    fn inherit(&mut self, live: &Self) {
        self.id = live.id;
    }
}

impl Public for Webhook {
    fn key(&self) -> String {
        self.name.clone()
    }

    fn inherit(&mut self, live: &Self) {
        self.id = live.id;
    }
}

impl PublicObject for Project {
    const KIND: ObjectKind = ObjectKind::HarborProject;
}

impl PublicObject for Robot {
    const KIND: ObjectKind = ObjectKind::HarborRobot;
}

impl PublicObject for Repository {
    const KIND: ObjectKind = ObjectKind::HarborRepository;
}

impl PublicObject for Webhook {
    const KIND: ObjectKind = ObjectKind::HarborWebhook;
}

/// Last applied registry objects of one deployment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HarborRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project: Option<Project>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub robot: Option<Robot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repository: Option<Repository>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook: Option<Webhook>,
}
