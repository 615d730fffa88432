use std::pin::Pin;

use async_trait::async_trait;
use futures_core::Stream;
use serde::{Deserialize, Serialize};

use crate::{ChildRecord, NaturalId, Result, UpsertableRecord};

/// A stream of records.
pub type RecordStream<R> = Pin<Box<dyn Stream<Item = Result<R>> + Send>>;

/// Identifier of a named revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RevisionId(i32);

impl RevisionId {
    pub fn new(value: i32) -> Self {
        Self(value)
    }

    pub fn as_i32(&self) -> i32 {
        self.0
    }
}

impl std::fmt::Display for RevisionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Row-level storage for one record type.
///
/// Writes are version-checked: the stored version must equal the version the
/// caller read, otherwise the write is rejected and nothing changes.
#[async_trait]
pub trait Repository<R: UpsertableRecord>: Send + Sync {
    /// Streams every row, ordered by natural id.
    async fn find_all(&self) -> Result<RecordStream<R>>;

    async fn find_by_natural_id(&self, natural_id: &NaturalId) -> Result<Option<R>>;

    /// Inserts or updates a row.
    ///
    /// Returns the authoritative row after the write, including a fresh
    /// version and surrogate key. An update that changes no column returns the
    /// stored row without bumping its version. Returns `None` when the
    /// record's version is stale.
    async fn upsert(&self, record: &R) -> Result<Option<R>>;

    /// Deletes a row, failing with `Conflict` on a stale version.
    async fn delete(&self, record: &R) -> Result<()>;
}

/// Child rows looked up through their parent reference.
#[async_trait]
pub trait ChildLookup: Send + Sync {
    /// Children assigned to a parent, ordered by natural id.
    async fn find_by_parent_natural_id(
        &self,
        parent_natural_id: &NaturalId,
    ) -> Result<Vec<ChildRecord>>;
}

/// Storage-side procedures that bracket a named revision.
#[async_trait]
pub trait RevisionRepository: Send + Sync {
    async fn begin_revision(&self, name: &str) -> Result<RevisionId>;

    async fn complete_revision(&self) -> Result<()>;

    async fn delete_revision(&self, revision: RevisionId) -> Result<()>;
}

/// The ambient transaction every repository call runs in while open.
#[async_trait]
pub trait UnitOfWork: Send + Sync {
    async fn begin(&self) -> Result<()>;

    async fn commit(&self) -> Result<()>;

    async fn rollback(&self) -> Result<()>;
}
