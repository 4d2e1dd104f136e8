//! Users, created on their first authenticated request.

use chrono::{DateTime, Utc};
use fabric_id::UserId;
use serde::{Deserialize, Serialize};

use crate::db::{Collection, Document};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: UserId,
    pub username: String,
    /// Name of a configured role.
    pub role: String,
    #[serde(default)]
    pub is_admin: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_authenticated_at: Option<DateTime<Utc>>,
}

impl Document for User {
    const COLLECTION: Collection = Collection::Users;
}
