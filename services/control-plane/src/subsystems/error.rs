//! Subsystem error types.

use thiserror::Error;

/// Failures reported by an external subsystem.
///
/// Every kind is either terminal (retrying cannot help) or transient.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SubsystemError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("ingress host already in use: {0}")]
    IngressHostInUse(String),

    #[error("port already in use: {0}")]
    PortInUse(u16),

    #[error("no ports available in zone {0}")]
    NoPortsAvailable(String),

    #[error("snapshot not found: {0}")]
    SnapshotNotFound(String),

    #[error("zone {zone} lacks capability {capability}")]
    ZoneCapabilityMissing { zone: String, capability: String },

    #[error("host in use: {0}")]
    HostInUse(String),

    #[error("vm too large: {0}")]
    VmTooLarge(String),

    #[error("no host available: {0}")]
    HostNotAvailable(String),

    #[error("bad state: {0}")]
    BadState(String),

    #[error("temporarily unavailable: {0}")]
    Transient(String),

    #[error("{0}")]
    Other(String),
}

impl SubsystemError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Whether the failure has a deterministic cause that a retry cannot fix.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::IngressHostInUse(_)
                | Self::PortInUse(_)
                | Self::NoPortsAvailable(_)
                | Self::SnapshotNotFound(_)
                | Self::ZoneCapabilityMissing { .. }
                | Self::HostInUse(_)
                | Self::VmTooLarge(_)
                | Self::HostNotAvailable(_)
                | Self::BadState(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(SubsystemError::IngressHostInUse("a.example".into()), true)]
    #[case(SubsystemError::PortInUse(30001), true)]
    #[case(SubsystemError::NoPortsAvailable("dev".into()), true)]
    #[case(SubsystemError::SnapshotNotFound("s".into()), true)]
    #[case(SubsystemError::HostInUse("h".into()), true)]
    #[case(SubsystemError::BadState("running".into()), true)]
    #[case(SubsystemError::Transient("timeout".into()), false)]
    #[case(SubsystemError::NotFound("x".into()), false)]
    #[case(SubsystemError::Other("boom".into()), false)]
    fn test_terminal_classification(#[case] err: SubsystemError, #[case] terminal: bool) {
        assert_eq!(err.is_terminal(), terminal);
    }
}
