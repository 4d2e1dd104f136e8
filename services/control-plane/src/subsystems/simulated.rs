//! In-process subsystem backend.
//!
//! Behaves like the real subsystems where the control plane depends on it:
//! server-assigned ids, idempotent creates, ingress host and public port
//! uniqueness, cascading deletes of scoped objects. Counts writes and
//! supports one-shot fault injection and artificial latency for tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::debug;

use super::{ObjectApi, ObjectKey, ObjectKind, SubsystemError};

/// Largest VM the simulated hypervisor accepts.
const MAX_VM_CPU_CORES: i64 = 64;
const MAX_VM_RAM: i64 = 256;

/// Server-side fields that survive an update.
const SERVER_FIELDS: &[&str] = &["id", "createdAt", "secret", "powerState", "status"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Read,
    Create,
    Update,
    Delete,
    Invoke,
}

#[derive(Default)]
pub struct SimulatedBackend {
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    objects: BTreeMap<ObjectKey, Value>,
    sequence: i64,
    writes: u64,
    writes_by_kind: HashMap<ObjectKind, u64>,
    faults: Vec<(ObjectKind, Operation, SubsystemError)>,
    latency: Option<Duration>,
}

impl State {
    fn take_fault(&mut self, kind: ObjectKind, op: Operation) -> Result<(), SubsystemError> {
        match self
            .faults
            .iter()
            .position(|(k, o, _)| *k == kind && *o == op)
        {
            Some(index) => Err(self.faults.remove(index).2),
            None => Ok(()),
        }
    }

    fn record_write(&mut self, kind: ObjectKind) {
        self.writes += 1;
        *self.writes_by_kind.entry(kind).or_default() += 1;
    }

    fn validate(&self, key: &ObjectKey, body: &Value) -> Result<(), SubsystemError> {
        let others = self
            .objects
            .iter()
            .filter(|(k, _)| k.zone == key.zone && k.kind == key.kind && *k != key);

        match key.kind {
            ObjectKind::Ingress => {
                let hosts = string_array(body, "hosts");
                for (_, other) in others {
                    if let Some(host) = string_array(other, "hosts")
                        .into_iter()
                        .find(|h| hosts.contains(h))
                    {
                        return Err(SubsystemError::IngressHostInUse(host));
                    }
                }
            }
            ObjectKind::PortForwardingRule => {
                let port = body.get("publicPort").and_then(Value::as_u64);
                for (_, other) in others {
                    if port.is_some() && other.get("publicPort").and_then(Value::as_u64) == port {
                        return Err(SubsystemError::PortInUse(port.unwrap_or_default() as u16));
                    }
                }
            }
            ObjectKind::VirtualMachine => {
                let cores = body.get("cpuCores").and_then(Value::as_i64).unwrap_or(0);
                let ram = body.get("ram").and_then(Value::as_i64).unwrap_or(0);
                if cores > MAX_VM_CPU_CORES || ram > MAX_VM_RAM {
                    return Err(SubsystemError::VmTooLarge(format!(
                        "{cores} cores and {ram} GB requested"
                    )));
                }

                // One VM per (host, gpu group) may hold a GPU.
                if let (Some(gpu), Some(host)) = (
                    body.get("gpu").and_then(Value::as_str),
                    body.get("host").and_then(Value::as_str),
                ) {
                    let taken = others.into_iter().any(|(_, other)| {
                        other.get("gpu").and_then(Value::as_str) == Some(gpu)
                            && other.get("host").and_then(Value::as_str) == Some(host)
                    });
                    if taken {
                        return Err(SubsystemError::HostInUse(format!(
                            "gpu group {gpu} on host {host} is attached to another vm"
                        )));
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn assign_server_fields(&mut self, key: &ObjectKey, body: &mut Value) {
        let Some(map) = body.as_object_mut() else {
            return;
        };

        match key.kind {
            ObjectKind::HarborProject
            | ObjectKind::HarborRobot
            | ObjectKind::HarborRepository
            | ObjectKind::HarborWebhook
            | ObjectKind::GithubWebhook
            | ObjectKind::BuildRun => {
                if is_missing(map, "id") {
                    self.sequence += 1;
                    map.insert("id".to_string(), json!(self.sequence));
                }
            }
            ObjectKind::VirtualMachine | ObjectKind::PortForwardingRule | ObjectKind::Snapshot => {
                if is_missing(map, "id") {
                    map.insert("id".to_string(), json!(digest(&key.to_string(), 16)));
                }
            }
            _ => {}
        }

        if key.kind == ObjectKind::HarborRobot && is_missing(map, "secret") {
            map.insert("secret".to_string(), json!(digest(&format!("secret:{key}"), 32)));
        }
        if key.kind == ObjectKind::VirtualMachine {
            map.insert("powerState".to_string(), json!("running"));
        }
        if key.kind == ObjectKind::BuildRun {
            map.insert("status".to_string(), json!("queued"));
        }
        map.insert("createdAt".to_string(), json!(Utc::now()));
    }

    fn cascade(&mut self, key: &ObjectKey) {
        let scoped_kinds: &[ObjectKind] = match key.kind {
            ObjectKind::Namespace => &[
                ObjectKind::Deployment,
                ObjectKind::Service,
                ObjectKind::Ingress,
                ObjectKind::Secret,
                ObjectKind::PersistentVolumeClaim,
            ],
            ObjectKind::HarborProject => &[
                ObjectKind::HarborRobot,
                ObjectKind::HarborRepository,
                ObjectKind::HarborWebhook,
            ],
            ObjectKind::VirtualMachine => &[ObjectKind::PortForwardingRule, ObjectKind::Snapshot],
            _ => &[],
        };
        self.objects.retain(|k, _| {
            !(k.zone == key.zone && k.scope == key.name && scoped_kinds.contains(&k.kind))
        });
    }
}

fn is_missing(map: &serde_json::Map<String, Value>, field: &str) -> bool {
    map.get(field).is_none_or(Value::is_null)
}

fn string_array(value: &Value, field: &str) -> Vec<String> {
    value
        .get(field)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect()
        })
        .unwrap_or_default()
}

fn digest(input: &str, len: usize) -> String {
    let hash = hex::encode(Sha256::digest(input.as_bytes()));
    hash[..len.min(hash.len())].to_string()
}

impl SimulatedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fail the next `op` on an object of `kind` with `error`.
    pub fn fail_next(&self, kind: ObjectKind, op: Operation, error: SubsystemError) {
        self.lock().faults.push((kind, op, error));
    }

    /// Delay every operation by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.lock().latency = latency;
    }

    /// Number of create, update, delete and invoke calls that changed state.
    pub fn writes(&self) -> u64 {
        self.lock().writes
    }

    pub fn writes_for(&self, kind: ObjectKind) -> u64 {
        self.lock().writes_by_kind.get(&kind).copied().unwrap_or(0)
    }

    pub fn get(&self, key: &ObjectKey) -> Option<Value> {
        self.lock().objects.get(key).cloned()
    }

    /// All objects of `kind`, in key order.
    pub fn objects(&self, kind: ObjectKind) -> Vec<(ObjectKey, Value)> {
        self.lock()
            .objects
            .iter()
            .filter(|(k, _)| k.kind == kind)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Overwrite an object without validation, as an operator editing it by hand would.
    pub fn put_raw(&self, key: ObjectKey, value: Value) {
        self.lock().objects.insert(key, value);
    }

    pub fn remove_raw(&self, key: &ObjectKey) -> Option<Value> {
        self.lock().objects.remove(key)
    }

    async fn pause(&self) {
        let latency = self.lock().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl ObjectApi for SimulatedBackend {
    async fn read(&self, key: &ObjectKey) -> Result<Option<Value>, SubsystemError> {
        self.pause().await;
        let mut state = self.lock();
        state.take_fault(key.kind, Operation::Read)?;
        Ok(state.objects.get(key).cloned())
    }

    async fn create(&self, key: &ObjectKey, mut body: Value) -> Result<Value, SubsystemError> {
        self.pause().await;
        let mut state = self.lock();
        state.take_fault(key.kind, Operation::Create)?;

        if let Some(existing) = state.objects.get(key) {
            debug!(key = %key, "Object already exists, returning it");
            return Ok(existing.clone());
        }

        state.validate(key, &body)?;
        state.assign_server_fields(key, &mut body);
        state.objects.insert(key.clone(), body.clone());
        state.record_write(key.kind);
        Ok(body)
    }

    async fn update(&self, key: &ObjectKey, mut body: Value) -> Result<Value, SubsystemError> {
        self.pause().await;
        let mut state = self.lock();
        state.take_fault(key.kind, Operation::Update)?;

        let Some(existing) = state.objects.get(key).cloned() else {
            return Err(SubsystemError::NotFound(key.to_string()));
        };
        state.validate(key, &body)?;

        if let (Some(map), Some(existing)) = (body.as_object_mut(), existing.as_object()) {
            for field in SERVER_FIELDS {
                if let Some(value) = existing.get(*field) {
                    if map.get(*field).is_none_or(Value::is_null) {
                        map.insert((*field).to_string(), value.clone());
                    }
                }
            }
        }

        state.objects.insert(key.clone(), body.clone());
        state.record_write(key.kind);
        Ok(body)
    }

    async fn delete(&self, key: &ObjectKey) -> Result<(), SubsystemError> {
        self.pause().await;
        let mut state = self.lock();
        state.take_fault(key.kind, Operation::Delete)?;

        if state.objects.remove(key).is_none() {
            return Err(SubsystemError::NotFound(key.to_string()));
        }
        state.cascade(key);
        state.record_write(key.kind);
        Ok(())
    }

    async fn list(
        &self,
        zone: &str,
        kind: ObjectKind,
        scope: &str,
    ) -> Result<Vec<Value>, SubsystemError> {
        self.pause().await;
        let mut state = self.lock();
        state.take_fault(kind, Operation::Read)?;
        Ok(state
            .objects
            .iter()
            .filter(|(k, _)| k.zone == zone && k.kind == kind && k.scope == scope)
            .map(|(_, v)| v.clone())
            .collect())
    }

    async fn invoke(
        &self,
        key: &ObjectKey,
        action: &str,
        args: Value,
    ) -> Result<Value, SubsystemError> {
        self.pause().await;
        let mut state = self.lock();
        state.take_fault(key.kind, Operation::Invoke)?;

        if key.kind != ObjectKind::VirtualMachine {
            return Err(SubsystemError::Other(format!(
                "action {action} not supported on {}",
                key.kind
            )));
        }

        let power = state
            .objects
            .get(key)
            .ok_or_else(|| SubsystemError::NotFound(key.to_string()))?
            .get("powerState")
            .and_then(Value::as_str)
            .unwrap_or("running")
            .to_string();

        let next = match action {
            "start" | "restart" => "running",
            "stop" => "stopped",
            "revertToSnapshot" => {
                let snapshot = args
                    .get("snapshot")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let snapshot_key = ObjectKey {
                    zone: key.zone.clone(),
                    kind: ObjectKind::Snapshot,
                    scope: key.name.clone(),
                    name: snapshot.clone(),
                };
                if !state.objects.contains_key(&snapshot_key) {
                    return Err(SubsystemError::SnapshotNotFound(snapshot));
                }
                if power != "stopped" {
                    return Err(SubsystemError::BadState(format!(
                        "vm must be stopped to revert, is {power}"
                    )));
                }
                "stopped"
            }
            other => {
                return Err(SubsystemError::Other(format!("unknown vm action {other}")));
            }
        };

        let vm = state
            .objects
            .get_mut(key)
            .ok_or_else(|| SubsystemError::NotFound(key.to_string()))?;
        if let Some(map) = vm.as_object_mut() {
            map.insert("powerState".to_string(), json!(next));
        }
        let vm = vm.clone();
        state.record_write(key.kind);
        Ok(vm)
    }
}
