//! Caller identity as seen by the services.

use fabric_id::UserId;

use super::ServiceError;
use crate::config::{FabricConfig, RoleConfig};
use crate::model::user::User;

/// An authenticated caller with their resolved role.
#[derive(Debug, Clone)]
pub struct AuthInfo {
    pub user_id: UserId,
    pub username: String,
    pub is_admin: bool,
    pub role: RoleConfig,
}

impl AuthInfo {
    /// Resolve the role of a stored user; unknown roles fall back to the
    /// default role.
    pub fn for_user(user: &User, config: &FabricConfig) -> Result<Self, ServiceError> {
        let role = config
            .role(&user.role)
            .or_else(|| config.role(&config.default_role))
            .ok_or_else(|| ServiceError::not_found("role", &user.role))?;
        Ok(Self {
            user_id: user.id.clone(),
            username: user.username.clone(),
            is_admin: user.is_admin,
            role: role.clone(),
        })
    }

    /// Admins act on everything; everyone else on what they own.
    pub fn owns(&self, owner: &UserId) -> bool {
        self.is_admin || &self.user_id == owner
    }

    pub fn require_owner(&self, owner: &UserId, what: &str) -> Result<(), ServiceError> {
        if self.owns(owner) {
            Ok(())
        } else {
            Err(ServiceError::Forbidden(format!(
                "{} may not modify {what}",
                self.user_id
            )))
        }
    }

    pub fn require_admin(&self) -> Result<(), ServiceError> {
        if self.is_admin {
            Ok(())
        } else {
            Err(ServiceError::Forbidden("admin only".to_string()))
        }
    }
}

/// Owner used for a new resource: the caller, unless an admin creates on
/// behalf of someone else.
pub fn effective_owner(auth: &AuthInfo, requested: Option<&UserId>) -> Result<UserId, ServiceError> {
    match requested {
        Some(owner) if owner != &auth.user_id => {
            auth.require_admin()?;
            Ok(owner.clone())
        }
        _ => Ok(auth.user_id.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn user(role: &str, admin: bool) -> User {
        User {
            id: UserId::parse("alice").unwrap(),
            username: "alice".into(),
            role: role.into(),
            is_admin: admin,
            created_at: Utc::now(),
            last_authenticated_at: None,
        }
    }

    #[test]
    fn test_unknown_role_falls_back_to_default() {
        let auth = AuthInfo::for_user(&user("retired", false), &FabricConfig::default()).unwrap();
        assert_eq!(auth.role.name, "default");
    }

    #[test]
    fn test_ownership() {
        let config = FabricConfig::default();
        let alice = AuthInfo::for_user(&user("default", false), &config).unwrap();
        let bob = UserId::parse("bob").unwrap();
        assert!(alice.owns(&alice.user_id));
        assert!(!alice.owns(&bob));
        assert!(matches!(
            effective_owner(&alice, Some(&bob)),
            Err(ServiceError::Forbidden(_))
        ));

        let admin = AuthInfo::for_user(&user("default", true), &config).unwrap();
        assert!(admin.owns(&bob));
        assert_eq!(effective_owner(&admin, Some(&bob)).unwrap(), bob);
    }
}
