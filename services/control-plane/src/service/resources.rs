//! Visibility rules shared by every resource kind.

use fabric_id::UserId;

use super::{AuthInfo, Core, ServiceError};
use crate::db::{Filter, Pagination};
use crate::model::team::Team;
use crate::model::Resource;

#[derive(Debug, Clone, Copy, Default)]
pub struct GetOpts {
    /// Also resolve resources shared with the caller through a team.
    pub shared: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ListOpts {
    pub user_id: Option<UserId>,
    /// Every user's resources. Admins only.
    pub all: bool,
    pub shared: bool,
    pub pagination: Option<Pagination>,
}

/// Teams the user owns or has joined.
pub async fn teams_of(core: &Core, user: &UserId) -> Result<Vec<Team>, ServiceError> {
    Ok(core
        .repo::<Team>()
        .find(&Filter::new())
        .await?
        .into_iter()
        .filter(|team| team.has_joined(user))
        .collect())
}

async fn shared_with(core: &Core, user: &UserId, resource_id: &str) -> Result<bool, ServiceError> {
    Ok(teams_of(core, user)
        .await?
        .iter()
        .any(|team| team.resource_map.contains_key(resource_id)))
}

/// Read one resource the caller may see. Anything else is `NotFound`.
pub async fn get<T: Resource>(
    core: &Core,
    auth: Option<&AuthInfo>,
    id: &str,
    opts: GetOpts,
) -> Result<T, ServiceError> {
    let not_found = || ServiceError::not_found(T::KIND.as_str(), id);
    let resource = core.repo::<T>().get(id).await?.ok_or_else(not_found)?;

    let Some(auth) = auth else {
        return Ok(resource);
    };
    if auth.owns(resource.owner_id()) {
        return Ok(resource);
    }
    if opts.shared && shared_with(core, &auth.user_id, id).await? {
        return Ok(resource);
    }
    Err(not_found())
}

/// Owner the listing is restricted to, or `None` for everyone.
fn effective_user(auth: Option<&AuthInfo>, opts: &ListOpts) -> Option<UserId> {
    match auth {
        None if opts.all => None,
        None => opts.user_id.clone(),
        Some(auth) if auth.is_admin && opts.all => None,
        Some(auth) => match &opts.user_id {
            Some(requested) if auth.is_admin || requested == &auth.user_id => Some(requested.clone()),
            _ => Some(auth.user_id.clone()),
        },
    }
}

/// List resources the caller may see, newest first.
pub async fn list<T: Resource>(
    core: &Core,
    auth: Option<&AuthInfo>,
    opts: &ListOpts,
) -> Result<Vec<T>, ServiceError> {
    let user = effective_user(auth, opts);
    let mut filter = Filter::new();
    if let Some(user) = &user {
        filter = filter.with_owner(user.as_str());
    }

    let (Some(user), true) = (user, opts.shared) else {
        filter = filter.with_pagination(opts.pagination);
        return Ok(core.repo::<T>().find(&filter).await?);
    };

    // Owned and shared resources come from two collections, so paginate here.
    let mut resources = core.repo::<T>().find(&filter).await?;
    let shared_ids: Vec<String> = teams_of(core, &user)
        .await?
        .into_iter()
        .flat_map(|team| team.resource_map.into_values())
        .filter(|r| r.resource_type == T::KIND)
        .map(|r| r.id)
        .filter(|id| !resources.iter().any(|owned| owned.id().to_string() == *id))
        .collect();
    if !shared_ids.is_empty() {
        let shared = core
            .repo::<T>()
            .find(&Filter::new().with_ids(shared_ids))
            .await?;
        resources.extend(shared);
    }

    resources.sort_by(|a, b| b.created_at().cmp(&a.created_at()));
    Ok(match opts.pagination {
        Some(page) => resources
            .into_iter()
            .skip(page.offset())
            .take(page.page_size as usize)
            .collect(),
        None => resources,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FabricConfig;
    use crate::model::user::User;
    use chrono::Utc;

    fn auth(id: &str, admin: bool) -> AuthInfo {
        let user = User {
            id: UserId::parse(id).unwrap(),
            username: id.into(),
            role: "default".into(),
            is_admin: admin,
            created_at: Utc::now(),
            last_authenticated_at: None,
        };
        AuthInfo::for_user(&user, &FabricConfig::default()).unwrap()
    }

    fn uid(id: &str) -> UserId {
        UserId::parse(id).unwrap()
    }

    #[test]
    fn test_effective_user() {
        let alice = auth("alice", false);
        let admin = auth("root", true);

        let opts = ListOpts {
            user_id: Some(uid("bob")),
            ..Default::default()
        };
        assert_eq!(effective_user(Some(&alice), &opts), Some(uid("alice")));
        assert_eq!(effective_user(Some(&admin), &opts), Some(uid("bob")));
        assert_eq!(effective_user(None, &opts), Some(uid("bob")));

        let all = ListOpts {
            all: true,
            ..Default::default()
        };
        assert_eq!(effective_user(Some(&alice), &all), Some(uid("alice")));
        assert_eq!(effective_user(Some(&admin), &all), None);
        assert_eq!(effective_user(Some(&admin), &ListOpts::default()), Some(uid("root")));
    }
}
