//! User notifications: transfer offers and team invites.
//!
//! Notifications about a resource carry its id at `content.id`; that is
//! how they are found again when the transfer completes or the resource
//! goes away.

use chrono::Utc;
use fabric_id::{NotificationId, UserId};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::debug;

use super::{AuthInfo, Core, ServiceError};
use crate::db::{Filter, Pagination, Patch};
use crate::model::notification::{Notification, NotificationType};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateParams {
    #[serde(default)]
    pub read: Option<bool>,
}

pub struct Notifications<'a> {
    core: &'a Core,
    auth: Option<&'a AuthInfo>,
}

impl<'a> Notifications<'a> {
    pub fn new(core: &'a Core, auth: Option<&'a AuthInfo>) -> Self {
        Self { core, auth }
    }

    pub async fn get(&self, id: &str) -> Result<Notification, ServiceError> {
        let notification = self
            .core
            .repo::<Notification>()
            .get(id)
            .await?
            .ok_or_else(|| ServiceError::not_found("notification", id))?;
        match self.auth {
            Some(auth) if !auth.owns(&notification.user_id) => {
                Err(ServiceError::not_found("notification", id))
            }
            _ => Ok(notification),
        }
    }

    /// The caller's notifications, newest first. Admins may pass `all`.
    pub async fn list(
        &self,
        all: bool,
        pagination: Option<Pagination>,
    ) -> Result<Vec<Notification>, ServiceError> {
        let mut filter = Filter::new().with_pagination(pagination);
        match self.auth {
            Some(auth) if !(all && auth.is_admin) => {
                filter = filter.with_eq("userId", auth.user_id.as_str());
            }
            _ => {}
        }
        Ok(self.core.repo::<Notification>().find(&filter).await?)
    }

    pub async fn update(&self, id: &str, params: UpdateParams) -> Result<Notification, ServiceError> {
        self.get(id).await?;
        let patch = match params.read {
            Some(true) => Patch::new().set("readAt", serde_json::to_value(Utc::now())?),
            Some(false) => Patch::new().unset("readAt"),
            None => Patch::new(),
        };
        if !patch.is_empty() {
            self.core.repo::<Notification>().update(id, &patch).await?;
        }
        self.get(id).await
    }

    pub async fn delete(&self, id: &str) -> Result<(), ServiceError> {
        self.get(id).await?;
        self.core.repo::<Notification>().soft_delete(id).await?;
        Ok(())
    }
}

pub async fn create(
    core: &Core,
    user_id: &UserId,
    notification_type: NotificationType,
    content: Map<String, Value>,
) -> Result<Notification, ServiceError> {
    let notification = Notification {
        id: NotificationId::new(),
        user_id: user_id.clone(),
        notification_type,
        content,
        created_at: Utc::now(),
        read_at: None,
        completed_at: None,
        deleted_at: None,
    };
    core.repo::<Notification>().insert(&notification).await?;
    debug!(
        notification_id = %notification.id,
        user_id = %user_id,
        notification_type = notification_type.as_str(),
        "Notification created"
    );
    Ok(notification)
}

fn about(resource_id: &str) -> Filter {
    Filter::new().with_eq("content.id", resource_id)
}

/// Mark the pending transfer offer for `resource_id` read and completed.
pub async fn complete_transfer(core: &Core, resource_id: &str) -> Result<(), ServiceError> {
    let repo = core.repo::<Notification>();
    let pending = repo
        .find(
            &about(resource_id)
                .with_eq("type", NotificationType::ResourceTransfer.as_str())
                .with_missing("completedAt"),
        )
        .await?;
    let now = serde_json::to_value(Utc::now())?;
    for notification in pending {
        let patch = Patch::new()
            .set("readAt", now.clone())
            .set("completedAt", now.clone());
        repo.update(&notification.id.to_string(), &patch).await?;
    }
    Ok(())
}

/// Hide every notification about `resource_id`.
pub async fn delete_for_resource(core: &Core, resource_id: &str) -> Result<(), ServiceError> {
    let repo = core.repo::<Notification>();
    for notification in repo.find(&about(resource_id)).await? {
        repo.soft_delete(&notification.id.to_string()).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::testing;

    fn content(resource_id: &str) -> Map<String, Value> {
        crate::job_args! { "id" => resource_id, "name" => "web" }
    }

    #[tokio::test]
    async fn test_complete_transfer_marks_read_and_completed() {
        let t = testing::core();
        let bob = UserId::parse("bob").unwrap();
        let n = create(&t.core, &bob, NotificationType::ResourceTransfer, content("r1"))
            .await
            .unwrap();

        complete_transfer(&t.core, "r1").await.unwrap();
        // A second completion finds nothing pending.
        complete_transfer(&t.core, "r1").await.unwrap();

        let n = t.core.repo::<Notification>().require(&n.id.to_string()).await.unwrap();
        assert!(n.read_at.is_some());
        assert!(n.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_others_cannot_read() {
        let t = testing::core();
        let alice = t.user("alice").await;
        let bob = t.user("bob").await;
        let n = create(&t.core, &bob.user_id, NotificationType::TeamInvite, content("t1"))
            .await
            .unwrap();
        let id = n.id.to_string();

        assert!(Notifications::new(&t.core, Some(&alice)).get(&id).await.unwrap_err().is_not_found());
        assert!(Notifications::new(&t.core, Some(&alice)).list(false, None).await.unwrap().is_empty());

        let read = Notifications::new(&t.core, Some(&bob))
            .update(&id, UpdateParams { read: Some(true) })
            .await
            .unwrap();
        assert!(read.read_at.is_some());
    }

    #[tokio::test]
    async fn test_delete_for_resource() {
        let t = testing::core();
        let bob = UserId::parse("bob").unwrap();
        create(&t.core, &bob, NotificationType::ResourceTransfer, content("r1")).await.unwrap();
        create(&t.core, &bob, NotificationType::ResourceTransfer, content("r2")).await.unwrap();

        delete_for_resource(&t.core, "r1").await.unwrap();

        let left = Notifications::new(&t.core, None).list(true, None).await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].content["id"], "r2");
    }
}
