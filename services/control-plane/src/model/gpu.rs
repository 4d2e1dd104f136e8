//! GPU groups and leases.

use chrono::{DateTime, Duration, Utc};
use fabric_id::{GpuLeaseId, ResourceId, UserId};
use serde::{Deserialize, Serialize};

use crate::config::GpuGroupConfig;
use crate::db::{Collection, Document};

/// Lease duration granted to admins asking for a lease without end.
pub const FOREVER_HOURS: f64 = 1000.0 * 365.0 * 24.0;

/// Leases activate on their own this many hours after assignment.
pub const ACTIVATION_FALLBACK_HOURS: i64 = 24;

/// A pool of identical GPUs in one zone. Keyed by name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GpuGroup {
    pub id: String,
    pub name: String,
    pub display_name: String,
    pub zone: String,
    pub vendor: String,
    pub total: i64,
}

impl From<&GpuGroupConfig> for GpuGroup {
    fn from(config: &GpuGroupConfig) -> Self {
        Self {
            id: config.name.clone(),
            name: config.name.clone(),
            display_name: if config.display_name.is_empty() {
                config.name.clone()
            } else {
                config.display_name.clone()
            },
            zone: config.zone.clone(),
            vendor: config.vendor.clone(),
            total: config.total,
        }
    }
}

impl Document for GpuGroup {
    const COLLECTION: Collection = Collection::GpuGroups;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GpuLease {
    pub id: GpuLeaseId,
    pub gpu_group: String,
    pub user_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vm_id: Option<ResourceId>,
    pub lease_duration_hours: f64,
    pub created_at: DateTime<Utc>,
    /// Reached the head of the queue.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ends_at: Option<DateTime<Utc>>,
    /// Set by the synchronizer once the lease has run out.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expired_at: Option<DateTime<Utc>>,
}

impl GpuLease {
    pub fn duration(&self) -> Duration {
        Duration::milliseconds((self.lease_duration_hours * 3_600_000.0) as i64)
    }

    /// End of the active window when activated at `activated_at`.
    pub fn ends_at_from(&self, activated_at: DateTime<Utc>) -> DateTime<Utc> {
        activated_at + self.duration()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expired_at.is_some() || self.ends_at.is_some_and(|end| end <= now)
    }

    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.activated_at.is_some() && !self.is_expired(now)
    }
}

impl Document for GpuLease {
    const COLLECTION: Collection = Collection::GpuLeases;
}
