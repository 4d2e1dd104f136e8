//! Postgres-backed store.
//!
//! Each collection is a table of `jsonb` documents with a few generated
//! columns (`name`, `owner_id`, `deleted_at`) for indexing. Jobs have a typed
//! table of their own.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fabric_id::JobId;
use serde_json::Value;
use sqlx::postgres::{PgArguments, PgPool, PgRow};
use sqlx::{Postgres, QueryBuilder, Row};

use super::document::{doc_created_at, doc_id};
use super::filter::{Condition, Filter, Patch, PatchOutcome, SortOrder};
use super::path::{segments, set_path, unset_path};
use super::{Collection, DocumentStore, JobFilter, JobStore, StoreError};
use crate::model::job::Job;

/// A [`DocumentStore`] and [`JobStore`] over a Postgres pool.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn path_array(path: &str) -> Result<Vec<String>, StoreError> {
    Ok(segments(path)?.into_iter().map(str::to_string).collect())
}

/// Append ` AND <predicate>` for one condition.
fn push_condition(
    query: &mut QueryBuilder<'_, Postgres>,
    condition: &Condition,
) -> Result<(), StoreError> {
    query.push(" AND ");
    push_predicate(query, condition)
}

fn push_predicate(
    query: &mut QueryBuilder<'_, Postgres>,
    condition: &Condition,
) -> Result<(), StoreError> {
    match condition {
        Condition::Eq(path, value) => {
            query.push("doc #> ");
            query.push_bind(path_array(path)?);
            query.push("::text[] = ");
            query.push_bind(value.clone());
        }
        Condition::In(path, values) => {
            query.push("doc #> ");
            query.push_bind(path_array(path)?);
            query.push("::text[] IN (SELECT jsonb_array_elements(");
            query.push_bind(Value::Array(values.clone()));
            query.push("))");
        }
        Condition::NotIn(path, values) => {
            let path = path_array(path)?;
            query.push("(COALESCE(doc #> ");
            query.push_bind(path.clone());
            query.push("::text[], 'null'::jsonb) = 'null'::jsonb OR doc #> ");
            query.push_bind(path);
            query.push("::text[] NOT IN (SELECT jsonb_array_elements(");
            query.push_bind(Value::Array(values.clone()));
            query.push(")))");
        }
        Condition::Missing(path) => {
            query.push("COALESCE(doc #> ");
            query.push_bind(path_array(path)?);
            query.push("::text[], 'null'::jsonb) = 'null'::jsonb");
        }
        Condition::Exists(path) => {
            query.push("COALESCE(doc #> ");
            query.push_bind(path_array(path)?);
            query.push("::text[], 'null'::jsonb) <> 'null'::jsonb");
        }
        Condition::AnyOf(conditions) => {
            query.push("(FALSE");
            for condition in conditions {
                query.push(" OR ");
                push_predicate(query, condition)?;
            }
            query.push(")");
        }
    }
    Ok(())
}

fn push_filter(
    query: &mut QueryBuilder<'_, Postgres>,
    filter: &Filter,
) -> Result<(), StoreError> {
    if !filter.include_deleted {
        query.push(" AND deleted_at IS NULL");
    }
    for condition in &filter.conditions {
        push_condition(query, condition)?;
    }
    Ok(())
}

#[async_trait]
impl DocumentStore for PgStore {
    async fn insert(&self, collection: Collection, doc: Value) -> Result<(), StoreError> {
        let id = doc_id(&doc)?.to_string();
        let created_at = doc_created_at(&doc).unwrap_or_else(Utc::now);
        let table = collection.table();
        // A soft-deleted row with the same id is replaced; a live one is not.
        let sql = format!(
            "INSERT INTO {table} (id, doc, created_at) VALUES ($1, $2, $3) \
             ON CONFLICT (id) DO UPDATE SET doc = EXCLUDED.doc, created_at = EXCLUDED.created_at \
             WHERE {table}.deleted_at IS NOT NULL"
        );
        let result = sqlx::query(&sql)
            .bind(&id)
            .bind(&doc)
            .bind(created_at)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::from_query(collection.name(), e))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NonUniqueField {
                collection: collection.name(),
                detail: format!("id {id} exists"),
            });
        }
        Ok(())
    }

    async fn upsert(&self, collection: Collection, doc: Value) -> Result<(), StoreError> {
        let id = doc_id(&doc)?.to_string();
        let created_at = doc_created_at(&doc).unwrap_or_else(Utc::now);
        let sql = format!(
            "INSERT INTO {} (id, doc, created_at) VALUES ($1, $2, $3) \
             ON CONFLICT (id) DO UPDATE SET doc = EXCLUDED.doc",
            collection.table()
        );
        sqlx::query(&sql)
            .bind(&id)
            .bind(&doc)
            .bind(created_at)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::from_query(collection.name(), e))?;
        Ok(())
    }

    async fn get(
        &self,
        collection: Collection,
        id: &str,
        include_deleted: bool,
    ) -> Result<Option<Value>, StoreError> {
        let mut sql = format!("SELECT doc FROM {} WHERE id = $1", collection.table());
        if !include_deleted {
            sql.push_str(" AND deleted_at IS NULL");
        }
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::from_query(collection.name(), e))?;
        Ok(row.map(|row| row.get("doc")))
    }

    async fn find(&self, collection: Collection, filter: &Filter) -> Result<Vec<Value>, StoreError> {
        let mut query = QueryBuilder::<Postgres>::new(format!(
            "SELECT doc FROM {} WHERE TRUE",
            collection.table()
        ));
        push_filter(&mut query, filter)?;
        query.push(match filter.sort {
            SortOrder::CreatedAtDesc => " ORDER BY created_at DESC, id DESC",
            SortOrder::CreatedAtAsc => " ORDER BY created_at ASC, id ASC",
        });
        if let Some(page) = filter.pagination {
            query.push(" LIMIT ");
            query.push_bind(i64::from(page.page_size));
            query.push(" OFFSET ");
            query.push_bind(page.offset() as i64);
        }
        let rows = query
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::from_query(collection.name(), e))?;
        Ok(rows.into_iter().map(|row| row.get("doc")).collect())
    }

    async fn count(&self, collection: Collection, filter: &Filter) -> Result<u64, StoreError> {
        let mut query = QueryBuilder::<Postgres>::new(format!(
            "SELECT COUNT(*) AS n FROM {} WHERE TRUE",
            collection.table()
        ));
        push_filter(&mut query, filter)?;
        let row = query
            .build()
            .fetch_one(&self.pool)
            .await
            .map_err(|e| StoreError::from_query(collection.name(), e))?;
        let n: i64 = row.get("n");
        Ok(n.max(0) as u64)
    }

    async fn patch(
        &self,
        collection: Collection,
        id: &str,
        patch: &Patch,
    ) -> Result<PatchOutcome, StoreError> {
        let table = collection.table();
        let name = collection.name();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::from_query(name, e))?;

        let select = format!("SELECT doc FROM {table} WHERE id = $1 AND deleted_at IS NULL FOR UPDATE");
        let Some(row) = sqlx::query(&select)
            .bind(id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| StoreError::from_query(name, e))?
        else {
            return Ok(PatchOutcome::NotFound);
        };
        let mut doc: Value = row.get("doc");
        if !patch.guards.iter().all(|guard| guard.matches(&doc)) {
            return Ok(PatchOutcome::GuardFailed);
        }

        for (path, value) in &patch.set {
            set_path(&mut doc, path, value.clone())?;
        }
        for path in &patch.unset {
            unset_path(&mut doc, path);
        }

        let update = format!("UPDATE {table} SET doc = $2 WHERE id = $1");
        sqlx::query(&update)
            .bind(id)
            .bind(&doc)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::from_query(name, e))?;
        tx.commit()
            .await
            .map_err(|e| StoreError::from_query(name, e))?;
        Ok(PatchOutcome::Applied)
    }

    async fn remove(&self, collection: Collection, id: &str) -> Result<bool, StoreError> {
        let sql = format!("DELETE FROM {} WHERE id = $1", collection.table());
        let result = sqlx::query(&sql)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::from_query(collection.name(), e))?;
        Ok(result.rows_affected() > 0)
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::from_query("health", e))?;
        Ok(())
    }
}

const JOB_COLUMNS: &str = "id, user_id, type, version, args, status, retry_count, created_at, \
                           run_after, started_at, finished_at, error_msg";

fn job_from_row(row: &PgRow) -> Result<Job, StoreError> {
    let query = |e| StoreError::from_query("jobs", e);
    let job_type: String = row.try_get("type").map_err(query)?;
    let version: String = row.try_get("version").map_err(query)?;
    let status: String = row.try_get("status").map_err(query)?;
    let args: Value = row.try_get("args").map_err(query)?;
    let retry_count: i32 = row.try_get("retry_count").map_err(query)?;

    Ok(Job {
        id: JobId::from_uuid(row.try_get("id").map_err(query)?),
        user_id: row.try_get("user_id").map_err(query)?,
        job_type: job_type.parse().map_err(StoreError::InvalidDocument)?,
        version: serde_json::from_value(Value::String(version))?,
        args: match args {
            Value::Object(map) => map,
            other => {
                return Err(StoreError::InvalidDocument(format!(
                    "job args must be an object, got {other}"
                )))
            }
        },
        status: status.parse().map_err(StoreError::InvalidDocument)?,
        retry_count: retry_count.max(0) as u32,
        created_at: row.try_get("created_at").map_err(query)?,
        run_after: row.try_get("run_after").map_err(query)?,
        started_at: row.try_get("started_at").map_err(query)?,
        finished_at: row.try_get("finished_at").map_err(query)?,
        error_msg: row.try_get("error_msg").map_err(query)?,
    })
}

impl PgStore {
    /// Run a status transition and report whether a row changed.
    async fn transition(
        &self,
        query: sqlx::query::Query<'_, Postgres, PgArguments>,
    ) -> Result<bool, StoreError> {
        let result = query
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::from_query("jobs", e))?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl JobStore for PgStore {
    async fn create_job(&self, job: &Job) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO jobs (
                id, user_id, type, version, args, status, retry_count,
                created_at, run_after, started_at, finished_at, error_msg
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(job.id.uuid())
        .bind(&job.user_id)
        .bind(job.job_type.as_str())
        .bind(job.version.to_string())
        .bind(Value::Object(job.args.clone()))
        .bind(job.status.as_str())
        .bind(job.retry_count as i32)
        .bind(job.created_at)
        .bind(job.run_after)
        .bind(job.started_at)
        .bind(job.finished_at)
        .bind(&job.error_msg)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::from_query("jobs", e))?;
        Ok(())
    }

    async fn get_job(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::from_query("jobs", e))?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError> {
        let mut query =
            QueryBuilder::<Postgres>::new(format!("SELECT {JOB_COLUMNS} FROM jobs WHERE TRUE"));
        if !filter.statuses.is_empty() {
            let statuses: Vec<String> =
                filter.statuses.iter().map(|s| s.as_str().to_string()).collect();
            query.push(" AND status = ANY(");
            query.push_bind(statuses);
            query.push(")");
        }
        if !filter.types.is_empty() {
            let types: Vec<String> = filter.types.iter().map(|t| t.as_str().to_string()).collect();
            query.push(" AND type = ANY(");
            query.push_bind(types);
            query.push(")");
        }
        if let Some(resource_id) = &filter.resource_id {
            query.push(" AND args->>'id' = ");
            query.push_bind(resource_id.clone());
        }
        if let Some(user_id) = &filter.user_id {
            query.push(" AND user_id = ");
            query.push_bind(user_id.clone());
        }
        if let Some(exclude) = filter.exclude_id {
            query.push(" AND id <> ");
            query.push_bind(exclude.uuid());
        }
        query.push(" ORDER BY created_at DESC");
        if let Some(page) = filter.pagination {
            query.push(" LIMIT ");
            query.push_bind(i64::from(page.page_size));
            query.push(" OFFSET ");
            query.push_bind(page.offset() as i64);
        }
        let rows = query
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::from_query("jobs", e))?;
        rows.iter().map(job_from_row).collect()
    }

    async fn lease_next(&self, now: DateTime<Utc>) -> Result<Option<Job>, StoreError> {
        let sql = format!(
            r#"
            UPDATE jobs SET status = 'running', started_at = $1
            WHERE id = (
                SELECT id FROM jobs
                WHERE status IN ('pending', 'failed') AND run_after <= $1
                ORDER BY created_at
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {JOB_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(now)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::from_query("jobs", e))?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn mark_completed(&self, id: JobId) -> Result<bool, StoreError> {
        self.transition(
            sqlx::query(
                "UPDATE jobs SET status = 'completed', finished_at = now() \
                 WHERE id = $1 AND status = 'running'",
            )
            .bind(id.uuid()),
        )
        .await
    }

    async fn mark_failed(
        &self,
        id: JobId,
        retry_count: u32,
        run_after: DateTime<Utc>,
        error: &str,
    ) -> Result<bool, StoreError> {
        self.transition(
            sqlx::query(
                "UPDATE jobs SET status = 'failed', retry_count = $2, run_after = $3, error_msg = $4 \
                 WHERE id = $1 AND status = 'running'",
            )
            .bind(id.uuid())
            .bind(retry_count as i32)
            .bind(run_after)
            .bind(error.to_string()),
        )
        .await
    }

    async fn mark_terminated(&self, id: JobId, reason: &str) -> Result<bool, StoreError> {
        self.transition(
            sqlx::query(
                "UPDATE jobs SET status = 'terminated', finished_at = now(), error_msg = $2 \
                 WHERE id = $1 AND status = 'running'",
            )
            .bind(id.uuid())
            .bind(reason.to_string()),
        )
        .await
    }

    async fn cancel(&self, id: JobId, reason: &str) -> Result<bool, StoreError> {
        self.transition(
            sqlx::query(
                "UPDATE jobs SET status = 'terminated', finished_at = now(), error_msg = $2 \
                 WHERE id = $1 AND status IN ('pending', 'running', 'failed')",
            )
            .bind(id.uuid())
            .bind(reason.to_string()),
        )
        .await
    }

    async fn reschedule(
        &self,
        id: JobId,
        run_after: DateTime<Utc>,
        reason: &str,
    ) -> Result<bool, StoreError> {
        self.transition(
            sqlx::query(
                "UPDATE jobs SET status = 'pending', run_after = $2, error_msg = $3 \
                 WHERE id = $1 AND status = 'running'",
            )
            .bind(id.uuid())
            .bind(run_after)
            .bind(reason.to_string()),
        )
        .await
    }

    async fn reset_running(&self) -> Result<u64, StoreError> {
        let result = sqlx::query("UPDATE jobs SET status = 'pending' WHERE status = 'running'")
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::from_query("jobs", e))?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_condition_sql_binds_path_array() {
        let mut query = QueryBuilder::<Postgres>::new("SELECT doc FROM vms WHERE TRUE");
        push_condition(&mut query, &Condition::Missing("gpu.leaseId".into())).unwrap();
        assert_eq!(
            query.sql(),
            "SELECT doc FROM vms WHERE TRUE AND COALESCE(doc #> $1::text[], 'null'::jsonb) = 'null'::jsonb"
        );
    }

    #[test]
    fn test_filter_sql_hides_deleted() {
        let mut query = QueryBuilder::<Postgres>::new("SELECT doc FROM vms WHERE TRUE");
        push_filter(&mut query, &Filter::new().with_owner("u1")).unwrap();
        assert_eq!(
            query.sql(),
            "SELECT doc FROM vms WHERE TRUE AND deleted_at IS NULL AND doc #> $1::text[] = $2"
        );
    }

    #[test]
    fn test_any_of_sql_joins_with_or() {
        let mut query = QueryBuilder::<Postgres>::new("SELECT doc FROM migrations WHERE TRUE");
        let filter = Filter::new().with_any_of([
            Condition::Eq("userId".into(), "u1".into()),
            Condition::Eq("params.newOwnerId".into(), "u1".into()),
        ]);
        push_filter(&mut query, &filter).unwrap();
        assert_eq!(
            query.sql(),
            "SELECT doc FROM migrations WHERE TRUE AND deleted_at IS NULL AND (FALSE OR doc #> $1::text[] = $2 OR doc #> $3::text[] = $4)"
        );
    }
}
