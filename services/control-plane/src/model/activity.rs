//! Activities: tags marking in-flight operations on a resource.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ResourceKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ActivityTag {
    BeingCreated,
    BeingDeleted,
    Updating,
    Restarting,
    Building,
    Repairing,
    #[serde(rename = "attachingGPU")]
    AttachingGpu,
    #[serde(rename = "detachingGPU")]
    DetachingGpu,
}

impl ActivityTag {
    pub const ALL: [ActivityTag; 8] = [
        Self::BeingCreated,
        Self::BeingDeleted,
        Self::Updating,
        Self::Restarting,
        Self::Building,
        Self::Repairing,
        Self::AttachingGpu,
        Self::DetachingGpu,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BeingCreated => "beingCreated",
            Self::BeingDeleted => "beingDeleted",
            Self::Updating => "updating",
            Self::Restarting => "restarting",
            Self::Building => "building",
            Self::Repairing => "repairing",
            Self::AttachingGpu => "attachingGPU",
            Self::DetachingGpu => "detachingGPU",
        }
    }
}

impl fmt::Display for ActivityTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Activity {
    pub tag: ActivityTag,
    pub started_at: DateTime<Utc>,
}

impl Activity {
    pub fn new(tag: ActivityTag) -> Self {
        Self {
            tag,
            started_at: Utc::now(),
        }
    }
}

pub type Activities = BTreeMap<ActivityTag, Activity>;

/// Decide whether `tag` may be added next to the `current` activities.
///
/// Returns the refusal reason when it may not.
pub fn can_add(kind: ResourceKind, current: &Activities, tag: ActivityTag) -> Result<(), String> {
    use ActivityTag::*;

    let has = |t: ActivityTag| current.contains_key(&t);
    let gpu_busy = has(AttachingGpu) || has(DetachingGpu);
    let is_vm = kind == ResourceKind::Vm;

    let refusal = match tag {
        BeingCreated if has(BeingDeleted) => Some("resource is being deleted"),
        BeingCreated => None,
        BeingDeleted if has(BeingCreated) => Some("resource is being created"),
        BeingDeleted => None,
        Updating | Restarting | Building if has(BeingDeleted) => Some("resource is being deleted"),
        Updating | Restarting | Building if has(BeingCreated) => Some("resource is being created"),
        Updating if is_vm && gpu_busy => Some("gpu is being attached or detached"),
        Updating | Restarting | Building => None,
        Repairing if !current.is_empty() => Some("resource is not ready"),
        Repairing => None,
        AttachingGpu if has(BeingDeleted) => Some("resource is being deleted"),
        AttachingGpu if has(BeingCreated) => Some("resource is being created"),
        AttachingGpu if gpu_busy => Some("gpu is being attached or detached"),
        AttachingGpu if has(Updating) => Some("resource is being updated"),
        AttachingGpu => None,
        DetachingGpu if has(AttachingGpu) => Some("gpu is being attached"),
        DetachingGpu => None,
    };

    match refusal {
        Some(reason) => Err(format!("cannot start {tag}: {reason}")),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use ActivityTag::*;

    fn set(tags: &[ActivityTag]) -> Activities {
        tags.iter().map(|t| (*t, Activity::new(*t))).collect()
    }

    #[rstest]
    #[case(ResourceKind::Deployment, &[], BeingCreated, true)]
    #[case(ResourceKind::Deployment, &[BeingDeleted], BeingCreated, false)]
    #[case(ResourceKind::Deployment, &[BeingCreated], BeingDeleted, false)]
    #[case(ResourceKind::Deployment, &[Updating], BeingDeleted, true)]
    #[case(ResourceKind::Deployment, &[BeingDeleted], Updating, false)]
    #[case(ResourceKind::Deployment, &[BeingCreated], Restarting, false)]
    #[case(ResourceKind::Deployment, &[BeingDeleted], Building, false)]
    #[case(ResourceKind::Deployment, &[Building], Updating, true)]
    #[case(ResourceKind::Deployment, &[], Repairing, true)]
    #[case(ResourceKind::Deployment, &[Restarting], Repairing, false)]
    #[case(ResourceKind::Vm, &[AttachingGpu], Updating, false)]
    #[case(ResourceKind::Deployment, &[AttachingGpu], Updating, true)]
    #[case(ResourceKind::Vm, &[DetachingGpu], AttachingGpu, false)]
    #[case(ResourceKind::Vm, &[Updating], AttachingGpu, false)]
    #[case(ResourceKind::Vm, &[DetachingGpu], Repairing, false)]
    #[case(ResourceKind::Vm, &[AttachingGpu], DetachingGpu, false)]
    #[case(ResourceKind::Vm, &[Updating], DetachingGpu, true)]
    fn test_can_add(
        #[case] kind: ResourceKind,
        #[case] current: &[ActivityTag],
        #[case] tag: ActivityTag,
        #[case] allowed: bool,
    ) {
        assert_eq!(can_add(kind, &set(current), tag).is_ok(), allowed);
    }

    #[test]
    fn test_refusal_reason_names_the_activity() {
        let err = can_add(ResourceKind::Deployment, &set(&[BeingDeleted]), Updating).unwrap_err();
        assert_eq!(err, "cannot start updating: resource is being deleted");
    }

    #[test]
    fn test_activity_map_serializes_by_tag() {
        let json = serde_json::to_value(set(&[AttachingGpu])).unwrap();
        assert_eq!(json["attachingGPU"]["tag"], "attachingGPU");
    }
}
