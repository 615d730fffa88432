//! Domain error types.

use common::NaturalId;
use row_store::{StoreError, Version};
use thiserror::Error;

/// A rule of the domain model was violated by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DomainError {
    #[error("Already present: {0}")]
    AlreadyPresent(NaturalId),

    #[error("Not present: {0}")]
    NotPresent(NaturalId),

    #[error("Child {child} is already assigned to parent {parent}")]
    AlreadyAssigned { child: NaturalId, parent: NaturalId },

    #[error("Child {child} is not assigned to parent {parent}")]
    NotAssigned { child: NaturalId, parent: NaturalId },

    #[error("Deleted: {entity} {natural_id}")]
    Deleted {
        entity: &'static str,
        natural_id: NaturalId,
    },

    #[error("Parent {parent} still has {count} assigned children")]
    HasAssignedChildren { parent: NaturalId, count: usize },

    #[error("Child {child} is still assigned to parent {parent}")]
    StillAssigned { child: NaturalId, parent: NaturalId },
}

/// Errors that can occur during domain operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Domain(#[from] DomainError),

    /// Internal consistency broke; this is a defect, not a caller mistake.
    #[error("Bug: {0}")]
    Bug(String),

    /// Storage rejected a write made against a stale version.
    #[error("Stale {entity} {natural_id} at version {version}")]
    Conflict {
        entity: &'static str,
        natural_id: NaturalId,
        version: Version,
    },

    #[error("Storage error: {0}")]
    Store(StoreError),

    /// A named revision was started while another is active.
    #[error("Cannot start revision '{name}' inside revision '{active}'")]
    NestedRevision { name: String, active: String },

    /// The unit of work failed and undoing it failed as well.
    #[error("Revision '{name}' failed ({original}) and its rollback failed ({rollback})")]
    RollbackFailed {
        name: String,
        original: Box<Error>,
        rollback: Box<Error>,
    },
}

impl From<StoreError> for Error {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Conflict {
                entity,
                natural_id,
                expected,
            } => Error::Conflict {
                entity,
                natural_id,
                version: expected,
            },
            other => Error::Store(other),
        }
    }
}

impl Error {
    pub fn domain(&self) -> Option<&DomainError> {
        match self {
            Error::Domain(e) => Some(e),
            _ => None,
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict { .. })
    }
}

/// Result type for domain operations.
pub type Result<T> = std::result::Result<T, Error>;
