//! Store error types.

use thiserror::Error;

/// Resource store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The document does not exist (or is soft-deleted).
    #[error("{collection} document not found: {id}")]
    NotFound { collection: &'static str, id: String },

    /// A unique field (the resource name) is already taken.
    #[error("non-unique field in {collection}: {detail}")]
    NonUniqueField {
        collection: &'static str,
        detail: String,
    },

    /// Temporary failure; the caller may retry.
    #[error("transient store failure: {0}")]
    Transient(String),

    #[error("failed to connect to the store: {0}")]
    Connect(#[source] sqlx::Error),

    #[error("query failed: {0}")]
    Query(#[source] sqlx::Error),

    #[error("schema migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),

    /// None of the candidate `migrations/` directories could be loaded.
    #[error("no migrations directory found (tried {tried}): {last_error}")]
    MigrationDirNotFound { tried: String, last_error: String },

    /// A document could not be converted to or from JSON.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A patch or document is malformed (bad path, missing id).
    #[error("invalid document: {0}")]
    InvalidDocument(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_non_unique(&self) -> bool {
        matches!(self, Self::NonUniqueField { .. })
    }

    /// Whether the failure may go away on retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Connect(_))
    }

    /// Classify a sqlx error from a query.
    pub(crate) fn from_query(collection: &'static str, err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) if db.code().as_deref() == Some("23505") => {
                Self::NonUniqueField {
                    collection,
                    detail: db.message().to_string(),
                }
            }
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                Self::Transient(err.to_string())
            }
            _ => Self::Query(err),
        }
    }
}
