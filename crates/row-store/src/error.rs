use thiserror::Error;

use crate::{NaturalId, Version};

/// Errors that can occur when interacting with the row store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A version-checked write found a different stored version.
    #[error("Version conflict for {entity} {natural_id}: expected version {expected}")]
    Conflict {
        entity: &'static str,
        natural_id: NaturalId,
        expected: Version,
    },

    /// A row references a natural id that does not exist.
    #[error("{entity} {natural_id} references a missing row ({reference})")]
    MissingReference {
        entity: &'static str,
        natural_id: NaturalId,
        reference: String,
    },

    /// A row cannot be deleted while other rows reference it.
    #[error("{entity} {natural_id} is still referenced by {referrer}")]
    StillReferenced {
        entity: &'static str,
        natural_id: NaturalId,
        referrer: String,
    },

    /// A stored column could not be mapped back into a record.
    #[error("Invalid stored data: {0}")]
    InvalidData(String),

    /// The revision procedures were called out of order.
    #[error("Revision error: {0}")]
    Revision(String),

    /// The ambient transaction was begun, committed or rolled back out of order.
    #[error("Transaction error: {0}")]
    Transaction(String),

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

/// Result type for row store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
