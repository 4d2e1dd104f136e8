//! Hypervisor public objects.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use fabric_reconcile::Public;
use serde::{Deserialize, Serialize};

use super::{ObjectKind, PublicObject};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachine {
    pub name: String,
    pub host: String,
    pub cpu_cores: i64,
    /// GB
    pub ram: i64,
    /// GB
    pub disk_size: i64,
    #[serde(default)]
    pub ssh_public_key: String,
    /// Attached GPU group, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// `running` or `stopped`, owned by the hypervisor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub power_state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortForwardingRule {
    pub name: String,
    pub vm_name: String,
    pub public_port: u16,
    pub private_port: u16,
    pub protocol: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub name: String,
    pub vm_name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub user_created: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl Public for VirtualMachine {
    fn key(&self) -> String {
        self.name.clone()
    }

    fn inherit(&mut self, live: &Self) {
        self.id.clone_from(&live.id);
        self.power_state.clone_from(&live.power_state);
    }
}

impl Public for PortForwardingRule {
    fn key(&self) -> String {
        self.name.clone()
    }

    fn inherit(&mut self, live: &Self) {
        self.id.clone_from(&live.id);
    }
}

impl Public for Snapshot {
    fn key(&self) -> String {
        self.name.clone()
    }

    fn inherit(&mut self, live: &Self) {
        self.id.clone_from(&live.id);
    }
}

impl PublicObject for VirtualMachine {
    const KIND: ObjectKind = ObjectKind::VirtualMachine;
}

impl PublicObject for PortForwardingRule {
    const KIND: ObjectKind = ObjectKind::PortForwardingRule;
}

impl PublicObject for Snapshot {
    const KIND: ObjectKind = ObjectKind::Snapshot;
}

/// Last applied hypervisor objects of one VM.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CsRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vm: Option<VirtualMachine>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub port_forwarding_rule_map: BTreeMap<String, PortForwardingRule>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub snapshot_map: BTreeMap<String, Snapshot>,
}
