//! Resource services: the operations behind the HTTP API and the job
//! handlers.
//!
//! Every service borrows the process-wide [`Core`] and an optional
//! [`AuthInfo`]. With auth present, reads are limited to what the caller
//! owns (or, with `shared`, what their teams hold) and writes are checked
//! against ownership and quota. Without auth the caller is the system.

pub mod activity;
pub mod auth;
pub mod deployments;
mod error;
pub mod gpu;
pub mod jobs;
pub mod k8s;
pub mod migrations;
pub mod notifications;
pub mod quota;
pub mod resources;
pub mod reconcile;
pub mod sms;
pub mod teams;
pub mod users;
pub mod vms;
pub mod zones;

use std::sync::Arc;

use fabric_id::{JobId, UserId};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::info;

use crate::config::{FabricConfig, ZoneConfig};
use crate::db::{Document, JobStore, Repo, Store};
use crate::model::job::{Job, JobType, JobVersion};
use crate::subsystems::{Subsystems, SubsystemError};

pub use auth::AuthInfo;
pub use error::{ResultExt, ServiceError};

/// Everything a service needs: the store, the subsystem clients and the
/// fabric description.
pub struct Core {
    pub store: Arc<dyn Store>,
    pub subsystems: Subsystems,
    pub config: Arc<FabricConfig>,
}

impl Core {
    pub fn new(store: Arc<dyn Store>, subsystems: Subsystems, config: Arc<FabricConfig>) -> Self {
        Self {
            store,
            subsystems,
            config,
        }
    }

    pub fn repo<T: Document>(&self) -> Repo<'_, T> {
        Repo::new(self.store.as_ref())
    }

    pub fn jobs_store(&self) -> &dyn JobStore {
        self.store.as_ref()
    }

    /// Zone by name, or the default zone.
    pub fn zone(&self, name: Option<&str>) -> Result<&ZoneConfig, ServiceError> {
        match name {
            Some(name) => self
                .config
                .zone(name)
                .ok_or_else(|| ServiceError::not_found("zone", name)),
            None => Ok(self.config.default_zone()),
        }
    }

    /// Zone that must offer `capability`.
    pub fn zone_with(&self, name: &str, capability: &str) -> Result<&ZoneConfig, ServiceError> {
        let zone = self.zone(Some(name))?;
        if !zone.has_capability(capability) {
            return Err(SubsystemError::ZoneCapabilityMissing {
                zone: zone.name.clone(),
                capability: capability.to_string(),
            }
            .into());
        }
        Ok(zone)
    }

    /// Insert a pending job and return its id.
    pub async fn enqueue(
        &self,
        user_id: &UserId,
        job_type: JobType,
        version: JobVersion,
        args: Map<String, Value>,
    ) -> Result<JobId, ServiceError> {
        let job = Job::new(JobId::new(), user_id.as_str(), job_type, version, args);
        self.store.create_job(&job).await?;
        info!(
            job_id = %job.id,
            job_type = %job_type,
            version = %version,
            resource_id = job.resource_id().unwrap_or_default(),
            "Job enqueued"
        );
        Ok(job.id)
    }

    /// The identity used for work done on behalf of the system.
    pub fn manager_id(&self) -> Result<UserId, ServiceError> {
        UserId::parse(&self.config.manager.user_id)
            .map_err(|e| ServiceError::invalid(format!("manager user id: {e}")))
    }
}

/// Build a job argument map from `key => value` pairs.
#[macro_export]
macro_rules! job_args {
    ($($key:literal => $value:expr),* $(,)?) => {{
        let mut args = serde_json::Map::new();
        $(args.insert($key.to_string(), serde_json::json!($value));)*
        args
    }};
}

/// What a write that enqueued a job returns.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRef {
    pub id: String,
    pub job_id: JobId,
}

impl JobRef {
    pub fn new(id: impl ToString, job_id: JobId) -> Self {
        Self {
            id: id.to_string(),
            job_id,
        }
    }
}

/// Namespace and registry project holding a user's objects.
pub fn owner_scope(owner: &UserId) -> String {
    format!("u-{}", slug(owner.as_str()))
}

/// Resource names double as DNS labels.
pub fn validate_name(name: &str) -> Result<(), ServiceError> {
    let valid_chars = name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    let valid_ends = name.starts_with(|c: char| c.is_ascii_alphanumeric())
        && name.ends_with(|c: char| c.is_ascii_alphanumeric());
    if name.is_empty() || name.len() > 63 || !valid_chars || !valid_ends {
        return Err(ServiceError::invalid(format!(
            "name '{name}' must be a lowercase DNS label of at most 63 characters"
        )));
    }
    Ok(())
}

/// Lowercase DNS-safe form of a user id, used in derived subsystem names.
pub fn slug(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
        } else if !out.ends_with('-') {
            out.push('-');
        }
    }
    out.trim_matches('-').to_string()
}


#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    #[rstest]
    #[case("alice", "alice")]
    #[case("Alice.Smith@kth.se", "alice-smith-kth-se")]
    #[case("--x__y--", "x-y")]
    fn test_slug(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(slug(input), expected);
    }

    #[rstest]
    #[case("web-1", true)]
    #[case("a", true)]
    #[case("-web", false)]
    #[case("web-", false)]
    #[case("Web", false)]
    #[case("web_1", false)]
    #[case("", false)]
    fn test_validate_name(#[case] name: &str, #[case] valid: bool) {
        assert_eq!(validate_name(name).is_ok(), valid);
        assert!(validate_name(&"a".repeat(64)).is_err());
    }

    #[test]
    fn test_owner_scope() {
        assert_eq!(owner_scope(&UserId::parse("Alice.S").unwrap()), "u-alice-s");
    }

    proptest! {
        #[test]
        fn prop_slug_is_dns_safe_and_stable(input in "[A-Za-z0-9._@-]{1,40}") {
            let out = slug(&input);
            prop_assert!(out.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-'));
            prop_assert!(!out.starts_with('-') && !out.ends_with('-'));
            prop_assert!(!out.contains("--"));
            prop_assert_eq!(slug(&out), out);
        }
    }

    #[test]
    fn test_job_args_macro() {
        let args = crate::job_args! {
            "id" => "d1",
            "params" => serde_json::json!({"replicas": 2}),
        };
        assert_eq!(args["id"], "d1");
        assert_eq!(args["params"]["replicas"], 2);
    }
}
