//! Service layer errors.

use thiserror::Error;

use crate::db::StoreError;
use crate::subsystems::SubsystemError;

/// Every failure a resource service can report.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("non-unique field: {0}")]
    NonUniqueField(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("{field} quota exceeded (requested total {current}, quota {quota})")]
    QuotaExceeded {
        field: &'static str,
        current: f64,
        quota: f64,
    },

    #[error("failed to start activity: {0}")]
    ConflictingActivity(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("resource is already owned by {0}")]
    AlreadyMigrated(String),

    #[error("resource migration already accepted")]
    AlreadyAccepted,

    #[error("bad migration code")]
    BadMigrationCode,

    #[error(transparent)]
    Subsystem(#[from] SubsystemError),

    #[error(transparent)]
    Store(StoreError),

    /// Final whatever the cause: the job has already cleaned up after itself.
    #[error(transparent)]
    Abandoned(Box<ServiceError>),

    #[error("failed to {action}: {source}")]
    Context {
        action: String,
        #[source]
        source: Box<ServiceError>,
    },
}

impl From<StoreError> for ServiceError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { collection, id } => Self::NotFound {
                kind: collection,
                id,
            },
            StoreError::NonUniqueField { detail, .. } => Self::NonUniqueField(detail),
            other => Self::Store(other),
        }
    }
}

impl From<serde_json::Error> for ServiceError {
    fn from(err: serde_json::Error) -> Self {
        Self::Store(StoreError::Serialization(err))
    }
}

impl ServiceError {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    /// Wrap with `failed to <action>`.
    pub fn context(self, action: impl Into<String>) -> Self {
        Self::Context {
            action: action.into(),
            source: Box::new(self),
        }
    }

    /// Mark the failure as not worth retrying.
    pub fn abandon(self) -> Self {
        Self::Abandoned(Box::new(self))
    }

    /// The innermost error, beneath any context.
    pub fn root(&self) -> &ServiceError {
        match self {
            Self::Context { source, .. } | Self::Abandoned(source) => source.root(),
            other => other,
        }
    }

    fn is_abandoned(&self) -> bool {
        match self {
            Self::Abandoned(_) => true,
            Self::Context { source, .. } => source.is_abandoned(),
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.root(), Self::NotFound { .. })
    }

    pub fn subsystem(&self) -> Option<&SubsystemError> {
        match self.root() {
            Self::Subsystem(err) => Some(err),
            _ => None,
        }
    }

    /// Whether a job failing with this error must not be retried.
    ///
    /// Target not found, name clashes, subsystem failures with a
    /// deterministic cause and abandoned operations are terminal; everything
    /// else is retried.
    pub fn is_terminal(&self) -> bool {
        if self.is_abandoned() {
            return true;
        }
        match self.root() {
            Self::NotFound { .. } | Self::NonUniqueField(_) => true,
            Self::Subsystem(err) => err.is_terminal(),
            _ => false,
        }
    }
}

/// Attach `failed to <action>` context to a fallible result.
pub trait ResultExt<T> {
    fn context(self, action: impl FnOnce() -> String) -> Result<T, ServiceError>;
}

impl<T, E: Into<ServiceError>> ResultExt<T> for Result<T, E> {
    fn context(self, action: impl FnOnce() -> String) -> Result<T, ServiceError> {
        self.map_err(|err| err.into().context(action()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(ServiceError::not_found("deployment", "d1"), true)]
    #[case(ServiceError::NonUniqueField("name web".into()), true)]
    #[case(SubsystemError::IngressHostInUse("web.example".into()).into(), true)]
    #[case(SubsystemError::PortInUse(30001).into(), true)]
    #[case(SubsystemError::NoPortsAvailable("dev".into()).into(), true)]
    #[case(SubsystemError::SnapshotNotFound("s1".into()).into(), true)]
    #[case(SubsystemError::ZoneCapabilityMissing { zone: "z".into(), capability: "vm".into() }.into(), true)]
    #[case(SubsystemError::Transient("timeout".into()).into(), false)]
    #[case(SubsystemError::NotFound("ingress".into()).into(), false)]
    #[case(ServiceError::Store(StoreError::Transient("pool".into())), false)]
    fn test_terminal_classification(#[case] err: ServiceError, #[case] terminal: bool) {
        assert_eq!(err.is_terminal(), terminal);
        assert_eq!(err.context("create deployment d1").is_terminal(), terminal);
    }

    #[test]
    fn test_store_errors_map_to_kinds() {
        let err: ServiceError = StoreError::NotFound {
            collection: "vms",
            id: "v1".into(),
        }
        .into();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_abandoned_is_terminal_and_keeps_root() {
        let err = ServiceError::from(SubsystemError::Transient("503".into()))
            .context("create deployment d1")
            .abandon()
            .context("run job");
        assert!(err.is_terminal());
        assert!(matches!(err.subsystem(), Some(SubsystemError::Transient(_))));
        assert_eq!(
            err.to_string(),
            "failed to run job: failed to create deployment d1: temporarily unavailable: 503"
        );
    }

    #[test]
    fn test_context_message() {
        let err = ServiceError::from(SubsystemError::Transient("503".into()))
            .context("create ingress for deployment d1");
        assert_eq!(
            err.to_string(),
            "failed to create ingress for deployment d1: temporarily unavailable: 503"
        );
    }
}
