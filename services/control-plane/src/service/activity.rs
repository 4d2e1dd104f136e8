//! Activity ledger: adding and removing in-flight operation tags.
//!
//! Adding a tag is a guarded patch. The guard asserts that every tag absent
//! when the admission rules were evaluated is still absent, so two
//! conflicting adds racing on one resource cannot both succeed.

use tracing::{debug, warn};

use super::ServiceError;
use crate::db::{Condition, Patch, PatchOutcome, Repo};
use crate::model::activity::can_add;
use crate::model::{Activity, ActivityTag, Resource};

const MAX_ADD_ATTEMPTS: usize = 5;

fn activity_path(tag: ActivityTag) -> String {
    format!("activities.{tag}")
}

/// Whether `tag` may be added to the resource right now, with the refusal
/// reason when it may not.
pub async fn can_add_activity<T: Resource>(
    repo: &Repo<'_, T>,
    id: &str,
    tag: ActivityTag,
) -> Result<(bool, String), ServiceError> {
    let resource = repo.require(id).await?;
    Ok(match can_add(T::KIND, resource.activities(), tag) {
        Ok(()) => (true, String::new()),
        Err(reason) => (false, reason),
    })
}

/// Add `tag` to the resource. Adding a tag that is already present is a
/// no-op.
pub async fn add_activity<T: Resource>(
    repo: &Repo<'_, T>,
    id: &str,
    tag: ActivityTag,
) -> Result<(), ServiceError> {
    for _ in 0..MAX_ADD_ATTEMPTS {
        let resource = repo.require(id).await?;
        let current = resource.activities();
        if current.contains_key(&tag) {
            return Ok(());
        }
        can_add(T::KIND, current, tag).map_err(ServiceError::ConflictingActivity)?;

        let mut patch = Patch::new().set(activity_path(tag), serde_json::to_value(Activity::new(tag))?);
        for absent in ActivityTag::ALL.iter().filter(|t| !current.contains_key(t)) {
            patch = patch.when(Condition::Missing(activity_path(*absent)));
        }

        match repo.patch(id, &patch).await? {
            PatchOutcome::Applied => {
                debug!(resource_id = %id, activity = %tag, "Activity added");
                return Ok(());
            }
            PatchOutcome::NotFound => return Err(ServiceError::not_found(T::KIND.as_str(), id)),
            PatchOutcome::GuardFailed => continue,
        }
    }

    Err(ServiceError::ConflictingActivity(format!(
        "cannot start {tag}: activities changed concurrently"
    )))
}

/// Remove `tag` from the resource. Missing tags and missing resources are
/// fine.
pub async fn remove_activity<T: Resource>(
    repo: &Repo<'_, T>,
    id: &str,
    tag: ActivityTag,
) -> Result<(), ServiceError> {
    match repo.patch(id, &Patch::new().unset(activity_path(tag))).await? {
        PatchOutcome::Applied => debug!(resource_id = %id, activity = %tag, "Activity removed"),
        PatchOutcome::NotFound | PatchOutcome::GuardFailed => {}
    }
    Ok(())
}

/// Remove `tag` from a spawned task after `delay`, logging instead of
/// returning failures.
pub fn remove_activity_later<T: Resource + 'static>(
    store: std::sync::Arc<dyn crate::db::Store>,
    id: String,
    tag: ActivityTag,
    delay: std::time::Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let repo = Repo::<T>::new(store.as_ref());
        if let Err(e) = remove_activity(&repo, &id, tag).await {
            warn!(resource_id = %id, activity = %tag, error = %e, "Failed to remove activity");
        }
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::db::{MemoryStore, Store};
    use crate::model::deployment::Deployment;
    use crate::service::testing;

    fn deployment(name: &str) -> Deployment {
        testing::deployment("alice", name)
    }

    #[tokio::test]
    async fn test_add_and_remove() {
        let store = MemoryStore::new();
        let repo = Repo::<Deployment>::new(&store);
        let d = deployment("web");
        repo.insert(&d).await.unwrap();
        let id = d.id.to_string();

        add_activity(&repo, &id, ActivityTag::BeingCreated).await.unwrap();
        add_activity(&repo, &id, ActivityTag::BeingCreated).await.unwrap();
        assert!(repo.require(&id).await.unwrap().has_activity(ActivityTag::BeingCreated));

        let err = add_activity(&repo, &id, ActivityTag::BeingDeleted).await.unwrap_err();
        assert!(matches!(err, ServiceError::ConflictingActivity(_)));
        let (allowed, reason) = can_add_activity(&repo, &id, ActivityTag::BeingDeleted)
            .await
            .unwrap();
        assert!(!allowed);
        assert!(reason.contains("being created"));

        remove_activity(&repo, &id, ActivityTag::BeingCreated).await.unwrap();
        remove_activity(&repo, &id, ActivityTag::BeingCreated).await.unwrap();
        assert!(repo.require(&id).await.unwrap().ready());
    }

    #[tokio::test]
    async fn test_concurrent_conflicting_adds_admit_one() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let d = deployment("web");
        Repo::<Deployment>::new(store.as_ref()).insert(&d).await.unwrap();
        let id = d.id.to_string();

        let mut tasks = Vec::new();
        for tag in [ActivityTag::BeingCreated, ActivityTag::BeingDeleted] {
            let store = store.clone();
            let id = id.clone();
            tasks.push(tokio::spawn(async move {
                add_activity(&Repo::<Deployment>::new(store.as_ref()), &id, tag).await
            }));
        }
        let mut admitted = 0;
        for task in tasks {
            if task.await.unwrap().is_ok() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 1);
    }

    #[tokio::test]
    async fn test_missing_resource_is_not_found() {
        let store = MemoryStore::new();
        let repo = Repo::<Deployment>::new(&store);
        let err = add_activity(&repo, "nope", ActivityTag::Updating).await.unwrap_err();
        assert!(err.is_not_found());
        remove_activity(&repo, "nope", ActivityTag::Updating).await.unwrap();
    }
}
