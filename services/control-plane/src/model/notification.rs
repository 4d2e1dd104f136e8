//! User notifications.

use chrono::{DateTime, Utc};
use fabric_id::{NotificationId, UserId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::db::{Collection, Document};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NotificationType {
    ResourceTransfer,
    TeamInvite,
}

impl NotificationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ResourceTransfer => "resourceTransfer",
            Self::TeamInvite => "teamInvite",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: NotificationId,
    pub user_id: UserId,
    #[serde(rename = "type")]
    pub notification_type: NotificationType,
    pub content: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Document for Notification {
    const COLLECTION: Collection = Collection::Notifications;
}
