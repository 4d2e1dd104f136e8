//! The four subsystem operators.
//!
//! Each operator is a small builder: construct it over the subsystem
//! operations and the write-back, attach the public object or key, then
//! `exec()`.

use tracing::debug;

use crate::normalize::{equivalent, SpecHash};
use crate::ops::{ObjectOps, Public, WriteBack};

/// What a repair pass did to one object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairOutcome {
    /// Live object already matched; nothing was written to the subsystem.
    Unchanged,

    /// Object was missing and has been created.
    Created,

    /// Object drifted and an in-place update converged it.
    Updated,

    /// Object drifted and had to be deleted and created again.
    Recreated,

    /// Object is no longer wanted and has been deleted.
    Deleted,
}

impl RepairOutcome {
    /// Returns true if the subsystem was written to.
    pub fn changed(&self) -> bool {
        !matches!(self, Self::Unchanged)
    }
}

/// Creates a public object and records the created object.
pub struct SsCreator<'a, T, O, W> {
    ops: &'a O,
    write: &'a W,
    public: Option<T>,
}

impl<'a, T, O, W> SsCreator<'a, T, O, W>
where
    T: Public,
    O: ObjectOps<T>,
    W: WriteBack<T, O::Error>,
{
    pub fn new(ops: &'a O, write: &'a W) -> Self {
        Self {
            ops,
            write,
            public: None,
        }
    }

    pub fn with_public(mut self, public: T) -> Self {
        self.public = Some(public);
        self
    }

    /// Returns the created object, or `None` when no public object was given.
    pub async fn exec(self) -> Result<Option<T>, O::Error> {
        let Some(public) = self.public else {
            return Ok(None);
        };

        let created = self.ops.create(&public).await?;
        self.write.write(Some(&created)).await?;
        Ok(Some(created))
    }
}

/// Updates a public object and records the result.
///
/// An object that no longer exists is removed from the record.
pub struct SsUpdater<'a, T, O, W> {
    ops: &'a O,
    write: &'a W,
    public: Option<T>,
}

impl<'a, T, O, W> SsUpdater<'a, T, O, W>
where
    T: Public,
    O: ObjectOps<T>,
    W: WriteBack<T, O::Error>,
{
    pub fn new(ops: &'a O, write: &'a W) -> Self {
        Self {
            ops,
            write,
            public: None,
        }
    }

    pub fn with_public(mut self, public: T) -> Self {
        self.public = Some(public);
        self
    }

    pub async fn exec(self) -> Result<Option<T>, O::Error> {
        let Some(public) = self.public else {
            return Ok(None);
        };

        match self.ops.update(&public).await {
            Ok(updated) => {
                self.write.write(Some(&updated)).await?;
                Ok(Some(updated))
            }
            Err(err) if O::is_not_found(&err) => {
                debug!(key = %public.key(), "Object to update is gone, clearing record");
                self.write.write(None).await?;
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }
}

/// Deletes an object by key, ignoring "not found", and clears the record.
pub struct SsDeleter<'a, T, O, W> {
    ops: &'a O,
    write: &'a W,
    key: Option<String>,
    _public: std::marker::PhantomData<T>,
}

impl<'a, T, O, W> SsDeleter<'a, T, O, W>
where
    T: Public,
    O: ObjectOps<T>,
    W: WriteBack<T, O::Error>,
{
    pub fn new(ops: &'a O, write: &'a W) -> Self {
        Self {
            ops,
            write,
            key: None,
            _public: std::marker::PhantomData,
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub async fn exec(self) -> Result<(), O::Error> {
        if let Some(key) = &self.key {
            delete_ignoring_not_found::<T, O>(self.ops, key).await?;
        }
        self.write.write(None).await
    }
}

/// Converges one object: generated vs live, recorded through the write-back.
///
/// - live missing: create
/// - live equivalent to generated: record live, no subsystem writes
/// - otherwise update; if the update fails or still diverges, delete and create
/// - nothing generated: delete the object under `key`
pub struct SsRepairer<'a, T, O, W> {
    ops: &'a O,
    write: &'a W,
    key: Option<String>,
    generated: Option<T>,
}

impl<'a, T, O, W> SsRepairer<'a, T, O, W>
where
    T: Public,
    O: ObjectOps<T>,
    W: WriteBack<T, O::Error>,
{
    pub fn new(ops: &'a O, write: &'a W) -> Self {
        Self {
            ops,
            write,
            key: None,
            generated: None,
        }
    }

    /// Key of the object to remove when nothing is generated for it.
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_generated(mut self, generated: Option<T>) -> Self {
        self.generated = generated;
        self
    }

    pub async fn exec(self) -> Result<RepairOutcome, O::Error> {
        let Some(mut generated) = self.generated else {
            let Some(key) = self.key else {
                return Ok(RepairOutcome::Unchanged);
            };
            delete_ignoring_not_found::<T, O>(self.ops, &key).await?;
            self.write.write(None).await?;
            return Ok(RepairOutcome::Deleted);
        };

        let key = generated.key();
        let Some(live) = self.ops.read(&key).await? else {
            debug!(key = %key, "Object missing, creating");
            let created = self.ops.create(&generated).await?;
            self.write.write(Some(&created)).await?;
            return Ok(RepairOutcome::Created);
        };

        generated.inherit(&live);
        if equivalent(&generated, &live) {
            self.write.write(Some(&live)).await?;
            return Ok(RepairOutcome::Unchanged);
        }

        debug!(
            key = %key,
            generated = %SpecHash::of(&generated),
            live = %SpecHash::of(&live),
            "Object drifted, updating"
        );

        match self.ops.update(&generated).await {
            Ok(updated) if equivalent(&generated, &updated) => {
                self.write.write(Some(&updated)).await?;
                return Ok(RepairOutcome::Updated);
            }
            Ok(_) => debug!(key = %key, "Object still diverges after update, recreating"),
            Err(_) => debug!(key = %key, "Update failed, recreating"),
        }

        delete_ignoring_not_found::<T, O>(self.ops, &key).await?;
        let created = self.ops.create(&generated).await?;
        self.write.write(Some(&created)).await?;
        Ok(RepairOutcome::Recreated)
    }
}

async fn delete_ignoring_not_found<T, O>(ops: &O, key: &str) -> Result<(), O::Error>
where
    T: Public,
    O: ObjectOps<T>,
{
    match ops.delete(key).await {
        Ok(()) => Ok(()),
        Err(err) if O::is_not_found(&err) => Ok(()),
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use serde::Serialize;

    use super::*;
    use crate::ops::{Discard, Retained};

    #[derive(Debug, Clone, PartialEq, Serialize)]
    #[serde(rename_all = "camelCase")]
    struct Obj {
        name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<u32>,
        replicas: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        created_at: Option<String>,
    }

    impl Obj {
        fn new(name: &str, replicas: u32) -> Self {
            Self {
                name: name.to_string(),
                id: None,
                replicas,
                created_at: None,
            }
        }
    }

    impl Public for Obj {
        fn key(&self) -> String {
            self.name.clone()
        }

        fn inherit(&mut self, live: &Self) {
            self.id = live.id;
        }
    }

    #[derive(Debug, PartialEq)]
    enum FakeError {
        NotFound,
        Broken,
    }

    #[derive(Default)]
    struct Fake {
        objects: Mutex<BTreeMap<String, Obj>>,
        next_id: Mutex<u32>,
        writes: Mutex<u32>,
        // Updates are accepted but ignore `replicas`.
        sticky_replicas: bool,
        fail_updates: bool,
    }

    impl Fake {
        fn writes(&self) -> u32 {
            *self.writes.lock().unwrap()
        }

        fn insert(&self, mut obj: Obj) {
            let mut next = self.next_id.lock().unwrap();
            *next += 1;
            obj.id = Some(*next);
            obj.created_at = Some("2024-01-01T00:00:00Z".to_string());
            self.objects.lock().unwrap().insert(obj.name.clone(), obj);
        }
    }

    #[async_trait]
    impl ObjectOps<Obj> for Fake {
        type Error = FakeError;

        async fn read(&self, key: &str) -> Result<Option<Obj>, FakeError> {
            Ok(self.objects.lock().unwrap().get(key).cloned())
        }

        async fn create(&self, public: &Obj) -> Result<Obj, FakeError> {
            *self.writes.lock().unwrap() += 1;
            self.insert(public.clone());
            Ok(self.objects.lock().unwrap()[&public.name].clone())
        }

        async fn update(&self, public: &Obj) -> Result<Obj, FakeError> {
            *self.writes.lock().unwrap() += 1;
            if self.fail_updates {
                return Err(FakeError::Broken);
            }
            let mut objects = self.objects.lock().unwrap();
            let live = objects.get_mut(&public.name).ok_or(FakeError::NotFound)?;
            if !self.sticky_replicas {
                live.replicas = public.replicas;
            }
            Ok(live.clone())
        }

        async fn delete(&self, key: &str) -> Result<(), FakeError> {
            *self.writes.lock().unwrap() += 1;
            self.objects
                .lock()
                .unwrap()
                .remove(key)
                .map(|_| ())
                .ok_or(FakeError::NotFound)
        }

        fn is_not_found(err: &FakeError) -> bool {
            *err == FakeError::NotFound
        }
    }

    #[derive(Default)]
    struct Record(Mutex<Option<Obj>>);

    #[async_trait]
    impl WriteBack<Obj, FakeError> for Record {
        async fn write(&self, value: Option<&Obj>) -> Result<(), FakeError> {
            *self.0.lock().unwrap() = value.cloned();
            Ok(())
        }
    }

    impl Record {
        fn get(&self) -> Option<Obj> {
            self.0.lock().unwrap().clone()
        }
    }

    #[tokio::test]
    async fn test_creator_records_server_fields() {
        let fake = Fake::default();
        let record = Record::default();

        let created = SsCreator::new(&fake, &record)
            .with_public(Obj::new("web", 1))
            .exec()
            .await
            .unwrap()
            .unwrap();

        assert_eq!(created.id, Some(1));
        assert_eq!(record.get(), Some(created));
    }

    #[tokio::test]
    async fn test_creator_without_public_is_noop() {
        let fake = Fake::default();
        let created = SsCreator::<Obj, _, _>::new(&fake, &Discard).exec().await.unwrap();
        assert!(created.is_none());
        assert_eq!(fake.writes(), 0);
    }

    #[tokio::test]
    async fn test_deleter_ignores_not_found() {
        let fake = Fake::default();
        let record = Record(Mutex::new(Some(Obj::new("web", 1))));

        SsDeleter::<Obj, _, _>::new(&fake, &record)
            .with_key("web")
            .exec()
            .await
            .unwrap();

        assert_eq!(record.get(), None);
    }

    #[tokio::test]
    async fn test_updater_clears_record_when_gone() {
        let fake = Fake::default();
        let record = Record(Mutex::new(Some(Obj::new("web", 1))));

        let updated = SsUpdater::new(&fake, &record)
            .with_public(Obj::new("web", 2))
            .exec()
            .await
            .unwrap();

        assert!(updated.is_none());
        assert_eq!(record.get(), None);
    }

    #[tokio::test]
    async fn test_repairer_creates_missing() {
        let fake = Fake::default();
        let record = Record::default();

        let outcome = SsRepairer::new(&fake, &record)
            .with_generated(Some(Obj::new("web", 2)))
            .exec()
            .await
            .unwrap();

        assert_eq!(outcome, RepairOutcome::Created);
        assert_eq!(record.get().unwrap().replicas, 2);
    }

    #[tokio::test]
    async fn test_repairer_is_idempotent() {
        let fake = Fake::default();
        fake.insert(Obj::new("web", 2));
        let record = Record::default();

        let outcome = SsRepairer::new(&fake, &record)
            .with_generated(Some(Obj::new("web", 2)))
            .exec()
            .await
            .unwrap();

        assert_eq!(outcome, RepairOutcome::Unchanged);
        assert_eq!(fake.writes(), 0);
        // Converged: the record holds the live object, server id included.
        assert_eq!(record.get().unwrap().id, Some(1));
    }

    #[tokio::test]
    async fn test_repairer_updates_drift() {
        let fake = Fake::default();
        fake.insert(Obj::new("web", 1));
        let record = Record::default();

        let outcome = SsRepairer::new(&fake, &record)
            .with_generated(Some(Obj::new("web", 3)))
            .exec()
            .await
            .unwrap();

        assert_eq!(outcome, RepairOutcome::Updated);
        assert_eq!(fake.writes(), 1);
        assert_eq!(record.get().unwrap().replicas, 3);
    }

    #[tokio::test]
    async fn test_repairer_recreates_when_update_does_not_converge() {
        let fake = Fake {
            sticky_replicas: true,
            ..Default::default()
        };
        fake.insert(Obj::new("web", 1));
        let record = Record::default();

        let outcome = SsRepairer::new(&fake, &record)
            .with_generated(Some(Obj::new("web", 3)))
            .exec()
            .await
            .unwrap();

        assert_eq!(outcome, RepairOutcome::Recreated);
        let stored = record.get().unwrap();
        assert_eq!(stored.replicas, 3);
        // New server identity after recreate.
        assert_eq!(stored.id, Some(2));
    }

    #[tokio::test]
    async fn test_repairer_recreates_when_update_fails() {
        let fake = Fake {
            fail_updates: true,
            ..Default::default()
        };
        fake.insert(Obj::new("web", 1));
        let record = Record::default();

        let outcome = SsRepairer::new(&fake, &record)
            .with_generated(Some(Obj::new("web", 3)))
            .exec()
            .await
            .unwrap();

        assert_eq!(outcome, RepairOutcome::Recreated);
        assert_eq!(record.get().unwrap().replicas, 3);
    }

    #[tokio::test]
    async fn test_repairer_deletes_when_nothing_generated() {
        let fake = Fake::default();
        fake.insert(Obj::new("stale", 1));
        let record = Record(Mutex::new(Some(Obj::new("stale", 1))));

        let outcome = SsRepairer::<Obj, _, _>::new(&fake, &record)
            .with_key("stale")
            .with_generated(None)
            .exec()
            .await
            .unwrap();

        assert_eq!(outcome, RepairOutcome::Deleted);
        assert!(outcome.changed());
        assert_eq!(record.get(), None);
        assert!(fake.read("stale").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_retained_never_deletes() {
        let fake = Fake::default();
        fake.insert(Obj::new("wildcard-cert", 1));
        let record = Record(Mutex::new(Some(Obj::new("wildcard-cert", 1))));
        let retained = Retained(&fake);

        SsDeleter::<Obj, _, _>::new(&retained, &record)
            .with_key("wildcard-cert")
            .exec()
            .await
            .unwrap();

        assert_eq!(record.get(), None);
        assert!(fake.read("wildcard-cert").await.unwrap().is_some());
    }
}
