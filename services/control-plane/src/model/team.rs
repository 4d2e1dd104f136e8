//! Teams share resources between their members.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use fabric_id::{TeamId, UserId};
use serde::{Deserialize, Serialize};

use super::ResourceKind;
use crate::db::{Collection, Document};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MemberStatus {
    Invited,
    Joined,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeamMember {
    pub id: UserId,
    pub member_status: MemberStatus,
    /// Presented by the invitee to join.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invitation_code: Option<String>,
    pub added_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub joined_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeamResource {
    pub id: String,
    #[serde(rename = "type")]
    pub resource_type: ResourceKind,
    pub added_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Team {
    pub id: TeamId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub owner_id: UserId,
    /// Keyed by user id.
    #[serde(default)]
    pub member_map: BTreeMap<String, TeamMember>,
    /// Keyed by resource id.
    #[serde(default)]
    pub resource_map: BTreeMap<String, TeamResource>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Team {
    /// Owner or a member that has joined.
    pub fn has_joined(&self, user: &UserId) -> bool {
        &self.owner_id == user
            || self
                .member_map
                .get(user.as_str())
                .is_some_and(|m| m.member_status == MemberStatus::Joined)
    }
}

impl Document for Team {
    const COLLECTION: Collection = Collection::Teams;
}
