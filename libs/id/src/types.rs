//! Typed ID definitions for all control plane records.

use crate::define_id;
use crate::IdError;

// =============================================================================
// Managed Resources
// =============================================================================

// Deployments, VMs and storage managers share one ID space.
define_id!(ResourceId, "resource");
define_id!(GpuLeaseId, "gpu lease");

// =============================================================================
// Jobs and Protocol Records
// =============================================================================

define_id!(JobId, "job");
define_id!(NotificationId, "notification");
define_id!(MigrationId, "resource migration");
define_id!(TeamId, "team");

// =============================================================================
// Requests
// =============================================================================

define_id!(RequestId, "request");

// =============================================================================
// Users
// =============================================================================

/// Maximum accepted length of a user ID.
pub const MAX_USER_ID_LEN: usize = 128;

/// User ID as issued by the identity provider.
///
/// Opaque string restricted to `[A-Za-z0-9._@-]`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UserId(String);

impl UserId {
    /// Parses and validates a user ID.
    pub fn parse(s: &str) -> Result<Self, IdError> {
        if s.is_empty() {
            return Err(IdError::Empty);
        }

        if s.len() > MAX_USER_ID_LEN {
            return Err(IdError::InvalidUserId {
                message: format!("must be at most {MAX_USER_ID_LEN} characters"),
            });
        }

        if let Some(c) = s
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '@' | '-')))
        {
            return Err(IdError::InvalidUserId {
                message: format!("unexpected character {c:?}"),
            });
        }

        Ok(Self(s.to_string()))
    }

    /// Returns the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for UserId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl AsRef<str> for UserId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl serde::Serialize for UserId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for UserId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_job_id_roundtrip() {
        let id = JobId::new();
        let s = id.to_string();
        let parsed: JobId = s.parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_job_id_is_hyphenated_lowercase() {
        let id = JobId::new();
        let s = id.to_string();
        assert_eq!(s.len(), 36);
        assert_eq!(s, s.to_lowercase());
    }

    #[test]
    fn test_resource_id_rejects_other_versions() {
        // Nil UUID has version 0.
        let result: Result<ResourceId, _> = "00000000-0000-0000-0000-000000000000".parse();
        assert!(matches!(
            result.unwrap_err(),
            crate::IdError::WrongVersion { version: 0, .. }
        ));
    }

    #[test]
    fn test_resource_id_invalid() {
        let result: Result<ResourceId, _> = "not-a-uuid".parse();
        assert!(matches!(
            result.unwrap_err(),
            crate::IdError::InvalidUuid { .. }
        ));
    }

    #[test]
    fn test_resource_id_empty() {
        let result: Result<ResourceId, _> = "".parse();
        assert!(result.unwrap_err().is_empty());
    }

    #[test]
    fn test_resource_id_json_roundtrip() {
        let id = ResourceId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{id}\""));
        let parsed: ResourceId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_user_id_accepts_idp_subjects() {
        for s in ["u1", "alice@example.com", "a6b1c2d3-0000-4000-8000-000000000000", "first.last_2"] {
            assert_eq!(UserId::parse(s).unwrap().as_str(), s);
        }
    }

    #[test]
    fn test_user_id_rejects_bad_input() {
        assert!(UserId::parse("").unwrap_err().is_empty());
        assert!(matches!(
            UserId::parse("has space").unwrap_err(),
            crate::IdError::InvalidUserId { .. }
        ));
        let long = "a".repeat(MAX_USER_ID_LEN + 1);
        assert!(UserId::parse(&long).is_err());
    }

    #[test]
    fn test_user_id_json_rejects_invalid() {
        let result: Result<UserId, _> = serde_json::from_str("\"a/b\"");
        assert!(result.is_err());
    }

    proptest! {
        #[test]
        fn prop_user_id_roundtrip(s in "[A-Za-z0-9._@-]{1,128}") {
            let id = UserId::parse(&s).unwrap();
            let parsed: UserId = id.to_string().parse().unwrap();
            prop_assert_eq!(id, parsed);
        }

        #[test]
        fn prop_uuid_ids_roundtrip(bytes in any::<[u8; 16]>()) {
            let uuid = uuid::Builder::from_random_bytes(bytes).into_uuid();
            let id = MigrationId::from_uuid(uuid);
            let parsed: MigrationId = id.to_string().parse().unwrap();
            prop_assert_eq!(id, parsed);
        }
    }
}
