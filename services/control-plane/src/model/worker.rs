//! Background worker heartbeats and VM port leases.

use chrono::{DateTime, Utc};
use fabric_id::{ResourceId, UserId};
use serde::{Deserialize, Serialize};

use crate::db::{Collection, Document};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WorkerState {
    Running,
    Stopped,
}

/// Last heartbeat of one background worker. Keyed by `<host>/<worker>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStatus {
    pub id: String,
    pub name: String,
    pub status: WorkerState,
    pub reported_at: DateTime<Utc>,
}

impl Document for WorkerStatus {
    const COLLECTION: Collection = Collection::WorkerStatus;
}

/// A public port of a zone, leased to one VM. Keyed by `<zone>-<port>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmPort {
    pub id: String,
    pub zone: String,
    pub public_port: u16,
    pub vm_id: ResourceId,
    pub user_id: UserId,
    /// Name of the VM port spec holding the lease.
    pub port_name: String,
    pub created_at: DateTime<Utc>,
}

impl VmPort {
    pub fn key(zone: &str, port: u16) -> String {
        format!("{zone}-{port}")
    }
}

impl Document for VmPort {
    const COLLECTION: Collection = Collection::VmPorts;
}
