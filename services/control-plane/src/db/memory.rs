//! In-process store used by dev mode and tests.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fabric_id::JobId;
use serde_json::Value;
use tokio::sync::Mutex;

use super::document::{doc_created_at, doc_id, doc_name};
use super::filter::{is_deleted, Filter, Pagination, Patch, PatchOutcome, SortOrder};
use super::path::{set_path, unset_path};
use super::{Collection, DocumentStore, JobFilter, JobStore, StoreError};
use crate::model::job::{Job, JobStatus};

#[derive(Default)]
struct Inner {
    docs: HashMap<Collection, BTreeMap<String, Value>>,
    jobs: BTreeMap<JobId, Job>,
}

impl Inner {
    fn collection(&mut self, collection: Collection) -> &mut BTreeMap<String, Value> {
        self.docs.entry(collection).or_default()
    }

    /// Fails if another live document in `collection` carries `doc`'s name.
    fn check_unique_name(&self, collection: Collection, doc: &Value) -> Result<(), StoreError> {
        if !collection.unique_name() || is_deleted(doc) {
            return Ok(());
        }
        let (Ok(id), Some(name)) = (doc_id(doc), doc_name(doc)) else {
            return Ok(());
        };
        let taken = self.docs.get(&collection).is_some_and(|docs| {
            docs.iter().any(|(other_id, other)| {
                other_id != id && !is_deleted(other) && doc_name(other) == Some(name)
            })
        });
        if taken {
            return Err(StoreError::NonUniqueField {
                collection: collection.name(),
                detail: format!("name {name} is taken"),
            });
        }
        Ok(())
    }
}

/// A [`DocumentStore`] and [`JobStore`] held in memory.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn sort_key(doc: &Value) -> (Option<DateTime<Utc>>, String) {
    (
        doc_created_at(doc),
        doc_id(doc).map(str::to_string).unwrap_or_default(),
    )
}

fn paginate<T>(items: Vec<T>, pagination: Option<Pagination>) -> Vec<T> {
    match pagination {
        Some(page) => items
            .into_iter()
            .skip(page.offset())
            .take(page.page_size as usize)
            .collect(),
        None => items,
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn insert(&self, collection: Collection, doc: Value) -> Result<(), StoreError> {
        let id = doc_id(&doc)?.to_string();
        let mut inner = self.inner.lock().await;
        if inner
            .docs
            .get(&collection)
            .and_then(|docs| docs.get(&id))
            .is_some_and(|existing| !is_deleted(existing))
        {
            return Err(StoreError::NonUniqueField {
                collection: collection.name(),
                detail: format!("id {id} exists"),
            });
        }
        inner.check_unique_name(collection, &doc)?;
        inner.collection(collection).insert(id, doc);
        Ok(())
    }

    async fn upsert(&self, collection: Collection, doc: Value) -> Result<(), StoreError> {
        let id = doc_id(&doc)?.to_string();
        let mut inner = self.inner.lock().await;
        inner.check_unique_name(collection, &doc)?;
        inner.collection(collection).insert(id, doc);
        Ok(())
    }

    async fn get(
        &self,
        collection: Collection,
        id: &str,
        include_deleted: bool,
    ) -> Result<Option<Value>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .docs
            .get(&collection)
            .and_then(|docs| docs.get(id))
            .filter(|doc| include_deleted || !is_deleted(doc))
            .cloned())
    }

    async fn find(&self, collection: Collection, filter: &Filter) -> Result<Vec<Value>, StoreError> {
        let inner = self.inner.lock().await;
        let mut docs: Vec<Value> = inner
            .docs
            .get(&collection)
            .map(|docs| docs.values().filter(|d| filter.matches(d)).cloned().collect())
            .unwrap_or_default();
        docs.sort_by_key(sort_key);
        if filter.sort == SortOrder::CreatedAtDesc {
            docs.reverse();
        }
        Ok(paginate(docs, filter.pagination))
    }

    async fn count(&self, collection: Collection, filter: &Filter) -> Result<u64, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .docs
            .get(&collection)
            .map(|docs| docs.values().filter(|d| filter.matches(d)).count() as u64)
            .unwrap_or(0))
    }

    async fn patch(
        &self,
        collection: Collection,
        id: &str,
        patch: &Patch,
    ) -> Result<PatchOutcome, StoreError> {
        let mut inner = self.inner.lock().await;
        let Some(current) = inner
            .docs
            .get(&collection)
            .and_then(|docs| docs.get(id))
            .filter(|doc| !is_deleted(doc))
        else {
            return Ok(PatchOutcome::NotFound);
        };
        if !patch.guards.iter().all(|guard| guard.matches(current)) {
            return Ok(PatchOutcome::GuardFailed);
        }

        let mut next = current.clone();
        for (path, value) in &patch.set {
            set_path(&mut next, path, value.clone())?;
        }
        for path in &patch.unset {
            unset_path(&mut next, path);
        }
        inner.check_unique_name(collection, &next)?;
        inner.collection(collection).insert(id.to_string(), next);
        Ok(PatchOutcome::Applied)
    }

    async fn remove(&self, collection: Collection, id: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        Ok(inner.collection(collection).remove(id).is_some())
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn create_job(&self, job: &Job) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if inner.jobs.contains_key(&job.id) {
            return Err(StoreError::NonUniqueField {
                collection: "jobs",
                detail: format!("id {} exists", job.id),
            });
        }
        inner.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get_job(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        Ok(self.inner.lock().await.jobs.get(&id).cloned())
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError> {
        let inner = self.inner.lock().await;
        let mut jobs: Vec<Job> = inner
            .jobs
            .values()
            .filter(|job| filter.matches(job))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(paginate(jobs, filter.pagination))
    }

    async fn lease_next(&self, now: DateTime<Utc>) -> Result<Option<Job>, StoreError> {
        let mut inner = self.inner.lock().await;
        let next = inner
            .jobs
            .values()
            .filter(|job| {
                matches!(job.status, JobStatus::Pending | JobStatus::Failed) && job.run_after <= now
            })
            .min_by_key(|job| (job.created_at, job.id))
            .map(|job| job.id);
        let Some(id) = next else {
            return Ok(None);
        };
        let Some(job) = inner.jobs.get_mut(&id) else {
            return Ok(None);
        };
        job.status = JobStatus::Running;
        job.started_at = Some(now);
        Ok(Some(job.clone()))
    }

    async fn mark_completed(&self, id: JobId) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        Ok(match inner.jobs.get_mut(&id) {
            Some(job) if job.status == JobStatus::Running => {
                job.status = JobStatus::Completed;
                job.finished_at = Some(Utc::now());
                true
            }
            _ => false,
        })
    }

    async fn mark_failed(
        &self,
        id: JobId,
        retry_count: u32,
        run_after: DateTime<Utc>,
        error: &str,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        Ok(match inner.jobs.get_mut(&id) {
            Some(job) if job.status == JobStatus::Running => {
                job.status = JobStatus::Failed;
                job.retry_count = retry_count;
                job.run_after = run_after;
                job.error_msg = Some(error.to_string());
                true
            }
            _ => false,
        })
    }

    async fn mark_terminated(&self, id: JobId, reason: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        Ok(match inner.jobs.get_mut(&id) {
            Some(job) if job.status == JobStatus::Running => {
                job.status = JobStatus::Terminated;
                job.finished_at = Some(Utc::now());
                job.error_msg = Some(reason.to_string());
                true
            }
            _ => false,
        })
    }

    async fn cancel(&self, id: JobId, reason: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        Ok(match inner.jobs.get_mut(&id) {
            Some(job) if !job.status.is_terminal() => {
                job.status = JobStatus::Terminated;
                job.finished_at = Some(Utc::now());
                job.error_msg = Some(reason.to_string());
                true
            }
            _ => false,
        })
    }

    async fn reschedule(
        &self,
        id: JobId,
        run_after: DateTime<Utc>,
        reason: &str,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        Ok(match inner.jobs.get_mut(&id) {
            Some(job) if job.status == JobStatus::Running => {
                job.status = JobStatus::Pending;
                job.run_after = run_after;
                job.error_msg = Some(reason.to_string());
                true
            }
            _ => false,
        })
    }

    async fn reset_running(&self) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().await;
        let mut reset = 0;
        for job in inner.jobs.values_mut() {
            if job.status == JobStatus::Running {
                job.status = JobStatus::Pending;
                reset += 1;
            }
        }
        Ok(reset)
    }
}
