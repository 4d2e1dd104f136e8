//! Teams: an owner, invited members and shared resources.
//!
//! Members are invited with a code delivered as a notification and only
//! see the team's resources after joining with it.

use std::collections::BTreeMap;

use chrono::Utc;
use fabric_id::{TeamId, UserId};
use serde::Deserialize;
use tracing::{info, instrument};

use super::notifications;
use super::resources::teams_of;
use super::{AuthInfo, Core, ServiceError};
use crate::db::{Filter, Pagination, Patch};
use crate::job_args;
use crate::model::deployment::Deployment;
use crate::model::notification::{Notification, NotificationType};
use crate::model::sm::StorageManager;
use crate::model::team::{MemberStatus, Team, TeamMember, TeamResource};
use crate::model::user::User;
use crate::model::vm::Vm;
use crate::model::{Resource, ResourceKind};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberRef {
    pub id: UserId,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateParams {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Resource ids, owned by the caller.
    #[serde(default)]
    pub resources: Vec<String>,
    #[serde(default)]
    pub members: Vec<MemberRef>,
}

/// Lists replace the current set when present.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateParams {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub resources: Option<Vec<String>>,
    #[serde(default)]
    pub members: Option<Vec<MemberRef>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinParams {
    pub invitation_code: String,
}

fn invitation_code() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

pub struct Teams<'a> {
    core: &'a Core,
    auth: Option<&'a AuthInfo>,
}

impl<'a> Teams<'a> {
    pub fn new(core: &'a Core, auth: Option<&'a AuthInfo>) -> Self {
        Self { core, auth }
    }

    fn caller(&self) -> Result<UserId, ServiceError> {
        match self.auth {
            Some(auth) => Ok(auth.user_id.clone()),
            None => self.core.manager_id(),
        }
    }

    /// Owners, members (invited or joined) and admins see a team.
    fn visible(&self, team: &Team) -> bool {
        self.auth.is_none_or(|auth| {
            auth.owns(&team.owner_id) || team.member_map.contains_key(auth.user_id.as_str())
        })
    }

    pub async fn get(&self, id: &str) -> Result<Team, ServiceError> {
        self.core
            .repo::<Team>()
            .get(id)
            .await?
            .filter(|team| self.visible(team))
            .ok_or_else(|| ServiceError::not_found("team", id))
    }

    pub async fn list(&self, all: bool, pagination: Option<Pagination>) -> Result<Vec<Team>, ServiceError> {
        let teams = match self.auth {
            Some(auth) if !(all && auth.is_admin) => self
                .core
                .repo::<Team>()
                .find(&Filter::new())
                .await?
                .into_iter()
                .filter(|team| self.visible(team))
                .collect(),
            _ => self.core.repo::<Team>().find(&Filter::new()).await?,
        };
        Ok(match pagination {
            Some(page) => teams
                .into_iter()
                .skip(page.offset())
                .take(page.page_size as usize)
                .collect(),
            None => teams,
        })
    }

    async fn require_manageable(&self, id: &str) -> Result<Team, ServiceError> {
        let team = self.get(id).await?;
        if let Some(auth) = self.auth {
            auth.require_owner(&team.owner_id, "this team")?;
        }
        Ok(team)
    }

    async fn ensure_name_free(&self, name: &str, except: Option<TeamId>) -> Result<(), ServiceError> {
        let taken = self
            .core
            .repo::<Team>()
            .first(Filter::new().with_name(name))
            .await?
            .is_some_and(|team| Some(team.id) != except);
        if taken {
            return Err(ServiceError::NonUniqueField(format!("team name {name}")));
        }
        Ok(())
    }

    /// Resolve shared resources, each of which the caller must own.
    async fn resources(&self, ids: &[String]) -> Result<BTreeMap<String, TeamResource>, ServiceError> {
        let now = Utc::now();
        let mut map = BTreeMap::new();
        for id in ids {
            let (kind, owner) = resource_owner(self.core, id).await?;
            if let Some(auth) = self.auth {
                if !auth.owns(&owner) {
                    return Err(ServiceError::not_found(kind.as_str(), id));
                }
            }
            map.insert(
                id.clone(),
                TeamResource {
                    id: id.clone(),
                    resource_type: kind,
                    added_at: now,
                },
            );
        }
        Ok(map)
    }

    /// Members for `requested`, keeping the state of those already present
    /// and inviting the rest.
    async fn members(
        &self,
        team_id: TeamId,
        team_name: &str,
        owner: &UserId,
        current: &BTreeMap<String, TeamMember>,
        requested: &[MemberRef],
    ) -> Result<BTreeMap<String, TeamMember>, ServiceError> {
        let mut map = BTreeMap::new();
        for member in requested.iter().filter(|m| &m.id != owner) {
            if let Some(existing) = current.get(member.id.as_str()) {
                map.insert(member.id.to_string(), existing.clone());
                continue;
            }
            if self.core.repo::<User>().get(member.id.as_str()).await?.is_none() {
                return Err(ServiceError::not_found("user", &member.id));
            }
            let code = invitation_code();
            notifications::create(
                self.core,
                &member.id,
                NotificationType::TeamInvite,
                job_args! {
                    "id" => team_id.to_string(),
                    "name" => team_name,
                    "code" => code,
                },
            )
            .await?;
            map.insert(
                member.id.to_string(),
                TeamMember {
                    id: member.id.clone(),
                    member_status: MemberStatus::Invited,
                    invitation_code: Some(code),
                    added_at: Utc::now(),
                    joined_at: None,
                },
            );
        }
        Ok(map)
    }

    #[instrument(skip(self, params), fields(name = %params.name))]
    pub async fn create(&self, params: CreateParams) -> Result<Team, ServiceError> {
        if params.name.trim().is_empty() {
            return Err(ServiceError::invalid("team name must not be empty"));
        }
        self.ensure_name_free(&params.name, None).await?;

        let owner = self.caller()?;
        let id = TeamId::new();
        let resource_map = self.resources(&params.resources).await?;
        let member_map = self
            .members(id, &params.name, &owner, &BTreeMap::new(), &params.members)
            .await?;

        let team = Team {
            id,
            name: params.name,
            description: params.description,
            owner_id: owner,
            member_map,
            resource_map,
            created_at: Utc::now(),
            updated_at: None,
            deleted_at: None,
        };
        self.core.repo::<Team>().insert(&team).await?;
        info!(team_id = %team.id, members = team.member_map.len(), "Team created");
        Ok(team)
    }

    #[instrument(skip(self, params))]
    pub async fn update(&self, id: &str, params: UpdateParams) -> Result<Team, ServiceError> {
        let team = self.require_manageable(id).await?;
        let mut patch = Patch::new().set("updatedAt", serde_json::to_value(Utc::now())?);

        let name = match params.name {
            Some(name) if name != team.name => {
                self.ensure_name_free(&name, Some(team.id)).await?;
                patch = patch.set("name", name.as_str());
                name
            }
            _ => team.name.clone(),
        };
        patch = patch.set_some("description", params.description);

        if let Some(resources) = params.resources {
            // Already shared resources stay even when the caller no longer owns them.
            let (kept, added): (Vec<String>, Vec<String>) = resources
                .into_iter()
                .partition(|r| team.resource_map.contains_key(r));
            let mut map = self.resources(&added).await?;
            for id in kept {
                if let Some(existing) = team.resource_map.get(&id) {
                    map.insert(id, existing.clone());
                }
            }
            patch = patch.set("resourceMap", serde_json::to_value(&map)?);
        }

        if let Some(members) = params.members {
            let map = self
                .members(team.id, &name, &team.owner_id, &team.member_map, &members)
                .await?;
            for removed in team.member_map.keys().filter(|k| !map.contains_key(*k)) {
                retract_invite(self.core, removed, &team.id.to_string()).await?;
            }
            patch = patch.set("memberMap", serde_json::to_value(&map)?);
        }

        self.core.repo::<Team>().update(id, &patch).await?;
        self.get(id).await
    }

    /// Accept an invitation.
    #[instrument(skip(self, params))]
    pub async fn join(&self, id: &str, params: JoinParams) -> Result<Team, ServiceError> {
        let user = self.caller()?;
        let team = self.get(id).await?;
        let Some(member) = team.member_map.get(user.as_str()) else {
            return Err(ServiceError::not_found("team", id));
        };
        if member.member_status == MemberStatus::Joined {
            return Ok(team);
        }
        if member.invitation_code.as_deref() != Some(params.invitation_code.as_str()) {
            return Err(ServiceError::Forbidden("bad invitation code".to_string()));
        }

        let mut joined = member.clone();
        joined.member_status = MemberStatus::Joined;
        joined.invitation_code = None;
        joined.joined_at = Some(Utc::now());
        let mut map = team.member_map.clone();
        map.insert(user.to_string(), joined);
        self.core
            .repo::<Team>()
            .update(id, &Patch::new().set("memberMap", serde_json::to_value(&map)?))
            .await?;

        let now = serde_json::to_value(Utc::now())?;
        let repo = self.core.repo::<Notification>();
        for invite in repo.find(&invites(user.as_str(), id)).await? {
            repo.update(
                &invite.id.to_string(),
                &Patch::new().set("readAt", now.clone()).set("completedAt", now.clone()),
            )
            .await?;
        }

        info!(team_id = %id, user_id = %user, "Joined team");
        self.get(id).await
    }

    #[instrument(skip(self))]
    pub async fn delete(&self, id: &str) -> Result<(), ServiceError> {
        let team = self.require_manageable(id).await?;
        for member in team.member_map.keys() {
            retract_invite(self.core, member, id).await?;
        }
        self.core.repo::<Team>().soft_delete(id).await?;
        info!(team_id = %id, "Team deleted");
        Ok(())
    }

    /// Whether the caller shares `resource_id` through any team.
    pub async fn shares(&self, resource_id: &str) -> Result<bool, ServiceError> {
        let user = self.caller()?;
        Ok(teams_of(self.core, &user)
            .await?
            .iter()
            .any(|team| team.resource_map.contains_key(resource_id)))
    }
}

fn invites(user: &str, team_id: &str) -> Filter {
    Filter::new()
        .with_eq("userId", user)
        .with_eq("type", NotificationType::TeamInvite.as_str())
        .with_eq("content.id", team_id)
}

async fn retract_invite(core: &Core, user: &str, team_id: &str) -> Result<(), ServiceError> {
    let repo = core.repo::<Notification>();
    for invite in repo.find(&invites(user, team_id)).await? {
        repo.soft_delete(&invite.id.to_string()).await?;
    }
    Ok(())
}

async fn lookup<T: Resource>(core: &Core, id: &str) -> Result<Option<(ResourceKind, UserId)>, ServiceError> {
    Ok(core
        .repo::<T>()
        .get(id)
        .await?
        .map(|r| (T::KIND, r.owner_id().clone())))
}

async fn resource_owner(core: &Core, id: &str) -> Result<(ResourceKind, UserId), ServiceError> {
    if let Some(found) = lookup::<Deployment>(core, id).await? {
        return Ok(found);
    }
    if let Some(found) = lookup::<Vm>(core, id).await? {
        return Ok(found);
    }
    if let Some(found) = lookup::<StorageManager>(core, id).await? {
        return Ok(found);
    }
    Err(ServiceError::not_found("resource", id))
}

/// Unshare a resource that is going away.
pub async fn clean_resource(core: &Core, resource_id: &str) -> Result<(), ServiceError> {
    let repo = core.repo::<Team>();
    for team in repo.find(&Filter::new()).await? {
        if !team.resource_map.contains_key(resource_id) {
            continue;
        }
        let mut map = team.resource_map.clone();
        map.remove(resource_id);
        repo.update(
            &team.id.to_string(),
            &Patch::new().set("resourceMap", serde_json::to_value(&map)?),
        )
        .await?;
    }
    Ok(())
}
