//! External subsystems: container orchestrator (`k8s`), image registry
//! (`harbor`), hypervisor (`cs`) and CI provider (`github`).
//!
//! Each subsystem is reached through the kind-erased [`ObjectApi`]. Typed
//! public objects ([`PublicObject`]) describe what the control plane
//! persists as the last applied state of every subsystem object.

pub mod cs;
mod error;
pub mod github;
pub mod harbor;
pub mod harbor_http;
pub mod k8s;
pub mod simulated;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use fabric_reconcile::Public;
use serde::de::DeserializeOwned;
use serde_json::Value;

pub use error::SubsystemError;

/// Every kind of object the control plane manages in a subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ObjectKind {
    Namespace,
    Deployment,
    Service,
    Ingress,
    Secret,
    PersistentVolume,
    PersistentVolumeClaim,
    HarborProject,
    HarborRobot,
    HarborRepository,
    HarborWebhook,
    VirtualMachine,
    PortForwardingRule,
    Snapshot,
    GithubWebhook,
    BuildRun,
}

impl ObjectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Namespace => "namespace",
            Self::Deployment => "deployment",
            Self::Service => "service",
            Self::Ingress => "ingress",
            Self::Secret => "secret",
            Self::PersistentVolume => "persistentVolume",
            Self::PersistentVolumeClaim => "persistentVolumeClaim",
            Self::HarborProject => "project",
            Self::HarborRobot => "robot",
            Self::HarborRepository => "repository",
            Self::HarborWebhook => "webhook",
            Self::VirtualMachine => "virtualMachine",
            Self::PortForwardingRule => "portForwardingRule",
            Self::Snapshot => "snapshot",
            Self::GithubWebhook => "githubWebhook",
            Self::BuildRun => "buildRun",
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Address of one object in a subsystem.
///
/// `scope` is the enclosing container: a namespace, a registry project, a
/// VM, or a repository. Cluster-wide objects use an empty scope.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectKey {
    pub zone: String,
    pub kind: ObjectKind,
    pub scope: String,
    pub name: String,
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}/{}", self.zone, self.kind, self.scope, self.name)
    }
}

/// Kind-erased access to one subsystem.
#[async_trait]
pub trait ObjectApi: Send + Sync {
    /// Read the live object. `Ok(None)` when it does not exist.
    async fn read(&self, key: &ObjectKey) -> Result<Option<Value>, SubsystemError>;

    /// Create the object. Creating an object that already exists returns the
    /// existing one.
    async fn create(&self, key: &ObjectKey, body: Value) -> Result<Value, SubsystemError>;

    async fn update(&self, key: &ObjectKey, body: Value) -> Result<Value, SubsystemError>;

    async fn delete(&self, key: &ObjectKey) -> Result<(), SubsystemError>;

    /// Objects of `kind` within `scope`.
    async fn list(
        &self,
        zone: &str,
        kind: ObjectKind,
        scope: &str,
    ) -> Result<Vec<Value>, SubsystemError>;

    /// Imperative operation on an existing object (power actions, snapshot
    /// revert).
    async fn invoke(
        &self,
        key: &ObjectKey,
        action: &str,
        args: Value,
    ) -> Result<Value, SubsystemError>;
}

/// A typed public object living in a subsystem.
pub trait PublicObject: Public + DeserializeOwned {
    const KIND: ObjectKind;
}

/// Implement [`Public`] and [`PublicObject`] for a type keyed by its `name`.
macro_rules! public_object {
    ($ty:ty, $kind:expr) => {
        impl fabric_reconcile::Public for $ty {
            fn key(&self) -> String {
                self.name.clone()
            }
        }

        impl $crate::subsystems::PublicObject for $ty {
            const KIND: $crate::subsystems::ObjectKind = $kind;
        }
    };
}

pub(crate) use public_object;

/// The subsystem clients of one control plane process.
#[derive(Clone)]
pub struct Subsystems {
    pub k8s: Arc<dyn ObjectApi>,
    pub harbor: Arc<dyn ObjectApi>,
    pub cs: Arc<dyn ObjectApi>,
    pub github: Arc<dyn ObjectApi>,
}

impl Subsystems {
    /// Every subsystem backed by its own in-process simulation.
    pub fn simulated() -> (Self, SimulatedSet) {
        let set = SimulatedSet::default();
        (set.subsystems(), set)
    }
}

/// Handles on the simulated backends, for inspection and fault injection.
#[derive(Clone, Default)]
pub struct SimulatedSet {
    pub k8s: Arc<simulated::SimulatedBackend>,
    pub harbor: Arc<simulated::SimulatedBackend>,
    pub cs: Arc<simulated::SimulatedBackend>,
    pub github: Arc<simulated::SimulatedBackend>,
}

impl SimulatedSet {
    pub fn subsystems(&self) -> Subsystems {
        Subsystems {
            k8s: self.k8s.clone(),
            harbor: self.harbor.clone(),
            cs: self.cs.clone(),
            github: self.github.clone(),
        }
    }

    /// Total subsystem writes across all backends.
    pub fn writes(&self) -> u64 {
        self.k8s.writes() + self.harbor.writes() + self.cs.writes() + self.github.writes()
    }
}
