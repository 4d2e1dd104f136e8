//! Resource store for the control plane.
//!
//! This module provides:
//! - The kind-erased document store and its typed facade ([`Repo`])
//! - Query filters and field-level patches
//! - The job queue
//! - A Postgres backend (SQLx, `jsonb` documents) and an in-memory backend

mod document;
mod error;
mod filter;
mod jobs;
mod memory;
mod path;
mod postgres;

pub use document::{Collection, Document, DocumentStore, Repo};
pub use error::StoreError;
pub use filter::{is_deleted, Condition, Filter, Pagination, Patch, PatchOutcome, SortOrder};
pub use jobs::{JobFilter, JobStore};
pub use memory::MemoryStore;
pub use path::{get_path, set_path, unset_path};
pub use postgres::PgStore;

use std::path::PathBuf;
use std::time::Duration;

use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::info;

/// Everything the engine persists.
pub trait Store: DocumentStore + JobStore {}

impl<T: DocumentStore + JobStore> Store for T {}

/// Postgres pool settings.
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    /// How long a caller waits for a free connection before the store
    /// reports a transient failure.
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_lifetime: Duration,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost/fabric".to_string(),
            max_connections: 10,
            min_connections: 1,
            acquire_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(10 * 60),
            max_lifetime: Duration::from_secs(30 * 60),
        }
    }
}

fn env_or<T: std::str::FromStr>(key: &str, fallback: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(fallback)
}

impl DbConfig {
    /// `DATABASE_URL`, `DB_MAX_CONNECTIONS` and `DB_MIN_CONNECTIONS`, each
    /// falling back to the default.
    pub fn from_env() -> Self {
        let base = Self::default();
        Self {
            database_url: env_or("DATABASE_URL", base.database_url.clone()),
            max_connections: env_or("DB_MAX_CONNECTIONS", base.max_connections),
            min_connections: env_or("DB_MIN_CONNECTIONS", base.min_connections),
            ..base
        }
    }
}

/// Places the schema may live, relative to the usual working directories.
fn migration_dirs() -> [PathBuf; 3] {
    [
        PathBuf::from("./migrations"),
        PathBuf::from("services/control-plane/migrations"),
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("migrations"),
    ]
}

/// An open Postgres pool backing [`PgStore`].
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    pub async fn connect(config: &DbConfig) -> Result<Self, StoreError> {
        info!(
            max_connections = config.max_connections,
            min_connections = config.min_connections,
            "Opening store pool"
        );
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout)
            .idle_timeout(Some(config.idle_timeout))
            .max_lifetime(Some(config.max_lifetime))
            .connect(&config.database_url)
            .await
            .map_err(StoreError::Connect)?;
        Ok(Self { pool })
    }

    /// Applies `migrations/` from the first directory that loads.
    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        let dirs = migration_dirs();
        let mut last_error = None;
        for dir in &dirs {
            let migrator = match sqlx::migrate::Migrator::new(dir.clone()).await {
                Ok(migrator) => migrator,
                Err(e) => {
                    last_error = Some(e.to_string());
                    continue;
                }
            };
            migrator.run(&self.pool).await.map_err(StoreError::Migration)?;
            info!(dir = %dir.display(), "Store schema up to date");
            return Ok(());
        }
        Err(StoreError::MigrationDirNotFound {
            tried: dirs
                .iter()
                .map(|dir| dir.display().to_string())
                .collect::<Vec<_>>()
                .join(", "),
            last_error: last_error.unwrap_or_default(),
        })
    }

    pub fn store(&self) -> PgStore {
        PgStore::new(self.pool.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_defaults() {
        let config = DbConfig::default();
        assert_eq!(config.max_connections, 10);
        assert!(config.min_connections <= config.max_connections);
        assert!(config.database_url.ends_with("/fabric"));
    }

    #[test]
    fn test_env_or_falls_back_on_garbage() {
        assert_eq!(env_or("FABRIC_TEST_UNSET_VARIABLE", 7u32), 7);
    }
}
