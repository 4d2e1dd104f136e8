//! Registry objects of custom deployments.
//!
//! The project and its webhook are shared by every deployment of the owner
//! and are never deleted from here. The repository holds pushed images, so
//! repair only ever creates it.

use fabric_reconcile::{ObjectOps, Retained, SsCreator, SsDeleter, WriteBack};
use tracing::{debug, info, instrument};

use super::generator::HarborObjects;
use crate::db::Collection;
use crate::service::reconcile::{repair_one, ObjectClient, RecordWriter};
use crate::service::{Core, ServiceError};
use crate::subsystems::harbor::{HarborRecord, Project, Repository, Robot, Webhook};
use crate::subsystems::PublicObject;

pub struct HarborSync<'a> {
    core: &'a Core,
    id: String,
    zone: String,
}

impl<'a> HarborSync<'a> {
    pub fn new(core: &'a Core, id: impl ToString, zone: &str) -> Self {
        Self {
            core,
            id: id.to_string(),
            zone: zone.to_string(),
        }
    }

    fn client<T: PublicObject>(&self, project: &str) -> ObjectClient<T> {
        ObjectClient::new(&self.core.subsystems.harbor, &self.zone, project)
    }

    fn writer(&self, field: &str) -> RecordWriter<'a> {
        RecordWriter::new(
            self.core.store.as_ref(),
            Collection::Deployments,
            &self.id,
            format!("subsystems.harbor.{field}"),
        )
    }

    #[instrument(skip(self, generated), fields(deployment_id = %self.id))]
    pub async fn create(&self, generated: &HarborObjects) -> Result<(), ServiceError> {
        let project = &generated.project.name;

        let projects = self.client::<Project>("");
        SsCreator::new(&Retained(&projects), &self.writer("project"))
            .with_public(generated.project.clone())
            .exec()
            .await?;
        SsCreator::new(&self.client::<Robot>(project), &self.writer("robot"))
            .with_public(generated.robot.clone())
            .exec()
            .await?;
        SsCreator::new(&self.client::<Repository>(project), &self.writer("repository"))
            .with_public(generated.repository.clone())
            .exec()
            .await?;
        let webhooks = self.client::<Webhook>(project);
        SsCreator::new(&Retained(&webhooks), &self.writer("webhook"))
            .with_public(generated.webhook.clone())
            .exec()
            .await?;

        info!(project = %project, "Registry objects created");
        Ok(())
    }

    #[instrument(skip(self, recorded), fields(deployment_id = %self.id))]
    pub async fn delete(&self, recorded: &HarborRecord) -> Result<(), ServiceError> {
        if let Some(webhook) = &recorded.webhook {
            let client = self.client::<Webhook>(&webhook.project);
            SsDeleter::<Webhook, _, _>::new(&Retained(&client), &self.writer("webhook"))
                .with_key(webhook.name.clone())
                .exec()
                .await?;
        }
        if let Some(repository) = &recorded.repository {
            SsDeleter::<Repository, _, _>::new(
                &self.client::<Repository>(&repository.project),
                &self.writer("repository"),
            )
            .with_key(repository.name.clone())
            .exec()
            .await?;
        }
        if let Some(robot) = &recorded.robot {
            SsDeleter::<Robot, _, _>::new(&self.client::<Robot>(&robot.project), &self.writer("robot"))
                .with_key(robot.name.clone())
                .exec()
                .await?;
        }
        if let Some(project) = &recorded.project {
            let client = self.client::<Project>("");
            SsDeleter::<Project, _, _>::new(&Retained(&client), &self.writer("project"))
                .with_key(project.name.clone())
                .exec()
                .await?;
        }
        Ok(())
    }

    /// Converge the registry to `generated`. Returns whether anything was
    /// written.
    #[instrument(skip(self, recorded, generated), fields(deployment_id = %self.id))]
    pub async fn repair(&self, recorded: &HarborRecord, generated: HarborObjects) -> Result<bool, ServiceError> {
        let store = self.core.store.as_ref();
        let project = generated.project.name.clone();
        let mut changed = false;

        let projects = self.client::<Project>("");
        changed |= repair_one(
            &Retained(&projects),
            store,
            Collection::Deployments,
            &self.id,
            "subsystems.harbor.project",
            recorded.project.as_ref(),
            Some(generated.project),
        )
        .await?
        .changed();

        changed |= repair_one(
            &self.client::<Robot>(&project),
            store,
            Collection::Deployments,
            &self.id,
            "subsystems.harbor.robot",
            recorded.robot.as_ref(),
            Some(generated.robot),
        )
        .await?
        .changed();

        let repositories = self.client::<Repository>(&project);
        let writer = self.writer("repository");
        match repositories.read(&generated.repository.name).await? {
            Some(live) => {
                if recorded.repository.as_ref() != Some(&live) {
                    WriteBack::<Repository, ServiceError>::write(&writer, Some(&live)).await?;
                }
            }
            None => {
                SsCreator::new(&repositories, &writer)
                    .with_public(generated.repository)
                    .exec()
                    .await?;
                changed = true;
            }
        }

        let webhooks = self.client::<Webhook>(&project);
        changed |= repair_one(
            &Retained(&webhooks),
            store,
            Collection::Deployments,
            &self.id,
            "subsystems.harbor.webhook",
            recorded.webhook.as_ref(),
            Some(generated.webhook),
        )
        .await?
        .changed();

        debug!(changed, "Registry repaired");
        Ok(changed)
    }

    /// Move the registry objects into the new owner's project.
    ///
    /// `recorded` is the record written under the previous owner;
    /// `generated` is already derived from the new owner.
    #[instrument(skip(self, recorded, generated), fields(deployment_id = %self.id))]
    pub async fn ensure_owner(&self, recorded: &HarborRecord, generated: HarborObjects) -> Result<(), ServiceError> {
        let new_project = generated.project.name.clone();

        let projects = self.client::<Project>("");
        SsCreator::new(&Retained(&projects), &self.writer("project"))
            .with_public(generated.project.clone())
            .exec()
            .await?;

        SsCreator::new(&self.client::<Repository>(&new_project), &self.writer("repository"))
            .with_public(generated.repository.clone())
            .exec()
            .await?;

        if let Some(robot) = recorded.robot.as_ref().filter(|r| r.project != new_project) {
            SsDeleter::<Robot, _, _>::new(&self.client::<Robot>(&robot.project), &self.writer("robot"))
                .with_key(robot.name.clone())
                .exec()
                .await?;
        }
        WriteBack::<Webhook, ServiceError>::write(&self.writer("webhook"), None).await?;

        self.repair(&HarborRecord::default(), generated).await?;
        info!(project = %new_project, "Registry objects moved to new owner");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::deployments::generator;
    use crate::service::testing;
    use crate::subsystems::ObjectKind;
    use serde_json::json;

    async fn seed(core: &Core, id: &str) {
        core.store
            .insert(
                Collection::Deployments,
                json!({"id": id, "name": "api", "ownerId": "alice"}),
            )
            .await
            .unwrap();
    }

    fn objects(core: &Core, owner: &str) -> HarborObjects {
        generator::harbor(&testing::deployment(owner, "api"), &core.config)
    }

    async fn record(core: &Core, id: &str) -> HarborRecord {
        let doc = core
            .store
            .get(Collection::Deployments, id, false)
            .await
            .unwrap()
            .unwrap();
        serde_json::from_value(doc["subsystems"]["harbor"].clone()).unwrap_or_default()
    }

    #[tokio::test]
    async fn test_create_then_repair_is_quiet() {
        let t = testing::core();
        seed(&t.core, "d1").await;
        let sync = HarborSync::new(&t.core, "d1", "dev");

        sync.create(&objects(&t.core, "alice")).await.unwrap();
        let recorded = record(&t.core, "d1").await;
        assert!(recorded.robot.as_ref().unwrap().secret.is_some());
        assert_eq!(recorded.project.as_ref().unwrap().name, "u-alice");

        let writes = t.sim.harbor.writes();
        let changed = sync.repair(&recorded, objects(&t.core, "alice")).await.unwrap();
        assert!(!changed);
        assert_eq!(t.sim.harbor.writes(), writes);
    }

    #[tokio::test]
    async fn test_delete_keeps_shared_project() {
        let t = testing::core();
        seed(&t.core, "d1").await;
        let sync = HarborSync::new(&t.core, "d1", "dev");
        sync.create(&objects(&t.core, "alice")).await.unwrap();

        sync.delete(&record(&t.core, "d1").await).await.unwrap();

        assert_eq!(t.sim.harbor.objects(ObjectKind::HarborProject).len(), 1);
        assert_eq!(t.sim.harbor.objects(ObjectKind::HarborWebhook).len(), 1);
        assert!(t.sim.harbor.objects(ObjectKind::HarborRobot).is_empty());
        assert!(t.sim.harbor.objects(ObjectKind::HarborRepository).is_empty());
        assert_eq!(record(&t.core, "d1").await, HarborRecord::default());
    }

    #[tokio::test]
    async fn test_ensure_owner_moves_project() {
        let t = testing::core();
        seed(&t.core, "d1").await;
        let sync = HarborSync::new(&t.core, "d1", "dev");
        sync.create(&objects(&t.core, "alice")).await.unwrap();

        let recorded = record(&t.core, "d1").await;
        sync.ensure_owner(&recorded, objects(&t.core, "bob")).await.unwrap();

        let moved = record(&t.core, "d1").await;
        assert_eq!(moved.robot.unwrap().project, "u-bob");
        assert_eq!(moved.repository.unwrap().project, "u-bob");
        let robots = t.sim.harbor.objects(ObjectKind::HarborRobot);
        assert_eq!(robots.len(), 1);
        assert_eq!(robots[0].0.scope, "u-bob");
    }
}
