//! Kind-erased access to the record a job targets.

use crate::model::deployment::Deployment;
use crate::model::sm::StorageManager;
use crate::model::vm::Vm;
use crate::model::{Activities, ActivityTag, Resource, ResourceKind};
use crate::service::activity::{add_activity, remove_activity};
use crate::service::{Core, ServiceError};

macro_rules! with_repo {
    ($core:expr, $kind:expr, |$repo:ident| $body:expr) => {
        match $kind {
            ResourceKind::Deployment => {
                let $repo = $core.repo::<Deployment>();
                $body
            }
            ResourceKind::Vm => {
                let $repo = $core.repo::<Vm>();
                $body
            }
            ResourceKind::StorageManager => {
                let $repo = $core.repo::<StorageManager>();
                $body
            }
        }
    };
}

/// Activities of a live record, `None` when there is no such record.
pub async fn activities(
    core: &Core,
    kind: ResourceKind,
    id: &str,
) -> Result<Option<Activities>, ServiceError> {
    with_repo!(core, kind, |repo| Ok(repo
        .get(id)
        .await?
        .map(|r| r.activities().clone())))
}

pub async fn exists(core: &Core, kind: ResourceKind, id: &str) -> Result<bool, ServiceError> {
    Ok(activities(core, kind, id).await?.is_some())
}

pub async fn add(core: &Core, kind: ResourceKind, id: &str, tag: ActivityTag) -> Result<(), ServiceError> {
    with_repo!(core, kind, |repo| add_activity(&repo, id, tag).await)
}

pub async fn remove(core: &Core, kind: ResourceKind, id: &str, tag: ActivityTag) -> Result<(), ServiceError> {
    with_repo!(core, kind, |repo| remove_activity(&repo, id, tag).await)
}
