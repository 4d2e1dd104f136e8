//! Users: created on their first authenticated request, with the default
//! role.

use chrono::Utc;
use fabric_id::UserId;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::quota::{self, Usage};
use super::{AuthInfo, Core, ServiceError};
use crate::config::{RolePermissions, RoleQuotas};
use crate::db::{Filter, Pagination, Patch};
use crate::model::user::User;

/// A user with their resolved role and current usage.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserView {
    #[serde(flatten)]
    pub user: User,
    pub permissions: RolePermissions,
    pub quota: RoleQuotas,
    pub usage: Usage,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateParams {
    /// Admins only.
    #[serde(default)]
    pub role: Option<String>,
}

/// Resolve the caller, creating the user on first sight.
pub async fn authenticate(
    core: &Core,
    user_id: &UserId,
    is_admin: bool,
) -> Result<AuthInfo, ServiceError> {
    let repo = core.repo::<User>();
    let now = Utc::now();
    let user = match repo.get(user_id.as_str()).await? {
        Some(mut user) => {
            let mut patch = Patch::new().set("lastAuthenticatedAt", serde_json::to_value(now)?);
            if user.is_admin != is_admin {
                patch = patch.set("isAdmin", is_admin);
                user.is_admin = is_admin;
            }
            repo.update(user_id.as_str(), &patch).await?;
            user.last_authenticated_at = Some(now);
            user
        }
        None => {
            let user = User {
                id: user_id.clone(),
                username: user_id.to_string(),
                role: core.config.default_role.clone(),
                is_admin,
                created_at: now,
                last_authenticated_at: Some(now),
            };
            repo.upsert(&user).await?;
            info!(user_id = %user_id, role = %user.role, "User created");
            user
        }
    };
    AuthInfo::for_user(&user, &core.config)
}

pub struct Users<'a> {
    core: &'a Core,
    auth: Option<&'a AuthInfo>,
}

impl<'a> Users<'a> {
    pub fn new(core: &'a Core, auth: Option<&'a AuthInfo>) -> Self {
        Self { core, auth }
    }

    async fn view(&self, user: User) -> Result<UserView, ServiceError> {
        let info = AuthInfo::for_user(&user, &self.core.config)?;
        let usage = quota::usage(self.core, &user.id).await?;
        Ok(UserView {
            user,
            permissions: info.role.permissions,
            quota: info.role.quotas,
            usage,
        })
    }

    pub async fn get(&self, id: &str) -> Result<UserView, ServiceError> {
        let user = self
            .core
            .repo::<User>()
            .get(id)
            .await?
            .filter(|u| self.auth.is_none_or(|auth| auth.owns(&u.id)))
            .ok_or_else(|| ServiceError::not_found("user", id))?;
        self.view(user).await
    }

    /// Everyone for admins, yourself otherwise.
    pub async fn list(&self, pagination: Option<Pagination>) -> Result<Vec<UserView>, ServiceError> {
        let mut filter = Filter::new().with_pagination(pagination);
        if let Some(auth) = self.auth.filter(|auth| !auth.is_admin) {
            filter = filter.with_eq("id", auth.user_id.as_str());
        }
        let mut views = Vec::new();
        for user in self.core.repo::<User>().find(&filter).await? {
            views.push(self.view(user).await?);
        }
        Ok(views)
    }

    pub async fn update(&self, id: &str, params: UpdateParams) -> Result<UserView, ServiceError> {
        self.get(id).await?;
        if let Some(role) = params.role {
            if let Some(auth) = self.auth {
                auth.require_admin()?;
            }
            if self.core.config.role(&role).is_none() {
                return Err(ServiceError::not_found("role", role));
            }
            self.core
                .repo::<User>()
                .update(id, &Patch::new().set("role", role.as_str()))
                .await?;
            info!(user_id = %id, role = %role, "User role changed");
        }
        self.get(id).await
    }
}
