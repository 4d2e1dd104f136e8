//! Job outcome classification.

use thiserror::Error;

use crate::service::ServiceError;

/// Result type for job handlers.
pub type JobResult<T> = Result<T, JobError>;

/// How a job attempt failed. The variant decides the next status.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum JobError {
    /// Never retried.
    #[error("{0}")]
    Terminated(String),

    /// Retried with backoff until the attempts run out.
    #[error("{0}")]
    Failed(String),
}

impl JobError {
    pub fn terminated(reason: impl Into<String>) -> Self {
        Self::Terminated(reason.into())
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed(reason.into())
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminated(_))
    }
}

impl From<ServiceError> for JobError {
    fn from(err: ServiceError) -> Self {
        // Rejections of the arguments themselves cannot succeed later.
        let rejected = matches!(
            err.root(),
            ServiceError::InvalidArgument(_)
                | ServiceError::Forbidden(_)
                | ServiceError::QuotaExceeded { .. }
                | ServiceError::AlreadyExists(_)
                | ServiceError::AlreadyMigrated(_)
                | ServiceError::AlreadyAccepted
                | ServiceError::BadMigrationCode
        );
        if err.is_terminal() || rejected {
            Self::Terminated(err.to_string())
        } else {
            Self::Failed(err.to_string())
        }
    }
}

impl From<serde_json::Error> for JobError {
    fn from(err: serde_json::Error) -> Self {
        Self::Terminated(format!("bad job arguments: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::StoreError;
    use crate::subsystems::SubsystemError;
    use rstest::rstest;

    #[rstest]
    #[case(ServiceError::not_found("vm", "v1"), true)]
    #[case(ServiceError::invalid("bad port"), true)]
    #[case(ServiceError::BadMigrationCode, true)]
    #[case(SubsystemError::HostInUse("h1".into()).into(), true)]
    #[case(SubsystemError::Transient("timeout".into()).into(), false)]
    #[case(ServiceError::ConflictingActivity("busy".into()), false)]
    #[case(ServiceError::Store(StoreError::Transient("pool".into())), false)]
    fn test_classification(#[case] err: ServiceError, #[case] terminal: bool) {
        let wrapped = err.context("repair vm v1");
        let job_err = JobError::from(wrapped);
        assert_eq!(job_err.is_terminal(), terminal);
        assert!(job_err.to_string().starts_with("failed to repair vm v1: "));
    }
}
