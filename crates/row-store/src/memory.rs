use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::{
    ChildRecord, NaturalId, OtherRecord, ParentRecord, Result, StoreError, UpsertableRecord,
    Version,
    store::{ChildLookup, RecordStream, Repository, RevisionId, RevisionRepository, UnitOfWork},
};

/// A named revision as recorded by the in-memory store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevisionRow {
    pub name: String,
    pub completed: bool,
}

#[derive(Debug, Clone, Default)]
struct Tables {
    others: BTreeMap<NaturalId, OtherRecord>,
    parents: BTreeMap<NaturalId, ParentRecord>,
    children: BTreeMap<NaturalId, ChildRecord>,
    revisions: BTreeMap<RevisionId, RevisionRow>,
    open_revision: Option<RevisionId>,
    next_id: i64,
    next_revision: i32,
}

#[derive(Debug, Default)]
struct State {
    tables: Tables,
    rollback_to: Option<Tables>,
    writes: usize,
}

/// In-memory row store implementation for testing.
///
/// Mirrors the PostgreSQL schema: version-checked upserts that skip
/// unchanged rows, enforced references, the child-to-parent version bump,
/// named revisions, and a single ambient transaction that can be rolled back.
#[derive(Clone, Default)]
pub struct InMemoryRowStore {
    state: Arc<RwLock<State>>,
}

impl InMemoryRowStore {
    /// Creates a new empty in-memory row store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of upsert and delete calls received.
    pub async fn write_count(&self) -> usize {
        self.state.read().await.writes
    }

    /// Returns every revision, completed or not, ordered by id.
    pub async fn revisions(&self) -> Vec<(RevisionId, RevisionRow)> {
        let state = self.state.read().await;
        state
            .tables
            .revisions
            .iter()
            .map(|(id, row)| (*id, row.clone()))
            .collect()
    }

    /// Whether an ambient transaction is open.
    pub async fn in_transaction(&self) -> bool {
        self.state.read().await.rollback_to.is_some()
    }

    /// Clears all rows, revisions and counters.
    pub async fn clear(&self) {
        *self.state.write().await = State::default();
    }
}

mod rows {
    use super::*;

    /// Per-table behaviour of the in-memory schema.
    pub trait StoredRow: UpsertableRecord {
        fn table(tables: &Tables) -> &BTreeMap<NaturalId, Self>;

        fn table_mut(tables: &mut Tables) -> &mut BTreeMap<NaturalId, Self>;

        fn check_references(&self, _tables: &Tables) -> Result<()> {
            Ok(())
        }

        fn check_unreferenced(&self, tables: &Tables) -> Result<()>;

        /// Runs after a row is inserted, updated or deleted.
        fn after_write(_before: Option<&Self>, _after: Option<&Self>, _tables: &mut Tables) {}
    }

    fn missing(
        entity: &'static str,
        natural_id: &NaturalId,
        target: &'static str,
        reference: &NaturalId,
    ) -> StoreError {
        StoreError::MissingReference {
            entity,
            natural_id: natural_id.clone(),
            reference: format!("{target} {reference}"),
        }
    }

    fn references_other(other: Option<&NaturalId>, tables: &Tables) -> Option<NaturalId> {
        other
            .filter(|id| !tables.others.contains_key(*id))
            .cloned()
    }

    impl StoredRow for OtherRecord {
        fn table(tables: &Tables) -> &BTreeMap<NaturalId, Self> {
            &tables.others
        }

        fn table_mut(tables: &mut Tables) -> &mut BTreeMap<NaturalId, Self> {
            &mut tables.others
        }

        fn check_unreferenced(&self, tables: &Tables) -> Result<()> {
            let referrer = if tables
                .parents
                .values()
                .any(|p| p.other_natural_id.as_ref() == Some(&self.natural_id))
            {
                Some(ParentRecord::ENTITY)
            } else if tables
                .children
                .values()
                .any(|c| c.other_natural_id.as_ref() == Some(&self.natural_id))
            {
                Some(ChildRecord::ENTITY)
            } else {
                None
            };
            match referrer {
                Some(referrer) => Err(StoreError::StillReferenced {
                    entity: Self::ENTITY,
                    natural_id: self.natural_id.clone(),
                    referrer: referrer.to_owned(),
                }),
                None => Ok(()),
            }
        }
    }

    impl StoredRow for ParentRecord {
        fn table(tables: &Tables) -> &BTreeMap<NaturalId, Self> {
            &tables.parents
        }

        fn table_mut(tables: &mut Tables) -> &mut BTreeMap<NaturalId, Self> {
            &mut tables.parents
        }

        fn check_references(&self, tables: &Tables) -> Result<()> {
            match references_other(self.other_natural_id.as_ref(), tables) {
                Some(other) => Err(missing(
                    Self::ENTITY,
                    &self.natural_id,
                    OtherRecord::ENTITY,
                    &other,
                )),
                None => Ok(()),
            }
        }

        fn check_unreferenced(&self, tables: &Tables) -> Result<()> {
            if tables
                .children
                .values()
                .any(|c| c.parent_natural_id.as_ref() == Some(&self.natural_id))
            {
                return Err(StoreError::StillReferenced {
                    entity: Self::ENTITY,
                    natural_id: self.natural_id.clone(),
                    referrer: ChildRecord::ENTITY.to_owned(),
                });
            }
            Ok(())
        }
    }

    impl StoredRow for ChildRecord {
        fn table(tables: &Tables) -> &BTreeMap<NaturalId, Self> {
            &tables.children
        }

        fn table_mut(tables: &mut Tables) -> &mut BTreeMap<NaturalId, Self> {
            &mut tables.children
        }

        fn check_references(&self, tables: &Tables) -> Result<()> {
            if let Some(other) = references_other(self.other_natural_id.as_ref(), tables) {
                return Err(missing(
                    Self::ENTITY,
                    &self.natural_id,
                    OtherRecord::ENTITY,
                    &other,
                ));
            }
            if let Some(parent) = &self.parent_natural_id
                && !tables.parents.contains_key(parent)
            {
                return Err(missing(
                    Self::ENTITY,
                    &self.natural_id,
                    ParentRecord::ENTITY,
                    parent,
                ));
            }
            Ok(())
        }

        fn check_unreferenced(&self, _tables: &Tables) -> Result<()> {
            Ok(())
        }

        // Same rule as the `touch_parent` trigger: the parent a child leaves
        // and the parent it joins each move up one version. A write that keeps
        // the same parent touches nothing.
        fn after_write(before: Option<&Self>, after: Option<&Self>, tables: &mut Tables) {
            let old = before.and_then(|b| b.parent_natural_id.as_ref());
            let new = after.and_then(|a| a.parent_natural_id.as_ref());
            if old == new {
                return;
            }
            let touched: BTreeSet<&NaturalId> = old.into_iter().chain(new).collect();
            for parent in touched {
                if let Some(row) = tables.parents.get_mut(parent) {
                    row.version = row.version.next();
                    tracing::trace!(parent = %parent, version = %row.version, "parent touched by child write");
                }
            }
        }
    }
}

use rows::StoredRow;

#[async_trait]
impl<R: StoredRow> Repository<R> for InMemoryRowStore {
    async fn find_all(&self) -> Result<RecordStream<R>> {
        use futures_util::stream;

        let state = self.state.read().await;
        let rows: Vec<R> = R::table(&state.tables).values().cloned().collect();
        Ok(Box::pin(stream::iter(rows.into_iter().map(Ok))))
    }

    async fn find_by_natural_id(&self, natural_id: &NaturalId) -> Result<Option<R>> {
        let state = self.state.read().await;
        Ok(R::table(&state.tables).get(natural_id).cloned())
    }

    async fn upsert(&self, record: &R) -> Result<Option<R>> {
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        state.writes += 1;
        record.check_references(&state.tables)?;

        let tables = &mut state.tables;
        let existing = R::table(tables).get(record.natural_id()).cloned();
        let written = match &existing {
            None if record.is_persisted() => return Ok(None),
            None => {
                tables.next_id += 1;
                record.stamped(Some(tables.next_id), Version::first())
            }
            Some(stored) if stored.version() != record.version() => return Ok(None),
            Some(stored) => {
                if record.stamped(stored.id(), stored.version()) == *stored {
                    return Ok(Some(stored.clone()));
                }
                record.stamped(stored.id(), stored.version().next())
            }
        };

        R::table_mut(tables).insert(written.natural_id().clone(), written.clone());
        R::after_write(existing.as_ref(), Some(&written), tables);
        tracing::debug!(
            entity = R::ENTITY,
            natural_id = %written.natural_id(),
            version = %written.version(),
            "row upserted"
        );
        Ok(Some(written))
    }

    async fn delete(&self, record: &R) -> Result<()> {
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        state.writes += 1;

        let tables = &mut state.tables;
        let stored = match R::table(tables).get(record.natural_id()) {
            Some(stored) if stored.version() == record.version() => stored.clone(),
            _ => {
                return Err(StoreError::Conflict {
                    entity: R::ENTITY,
                    natural_id: record.natural_id().clone(),
                    expected: record.version(),
                });
            }
        };
        stored.check_unreferenced(tables)?;

        R::table_mut(tables).remove(stored.natural_id());
        R::after_write(Some(&stored), None, tables);
        tracing::debug!(entity = R::ENTITY, natural_id = %stored.natural_id(), "row deleted");
        Ok(())
    }
}

#[async_trait]
impl ChildLookup for InMemoryRowStore {
    async fn find_by_parent_natural_id(
        &self,
        parent_natural_id: &NaturalId,
    ) -> Result<Vec<ChildRecord>> {
        let state = self.state.read().await;
        Ok(state
            .tables
            .children
            .values()
            .filter(|c| c.parent_natural_id.as_ref() == Some(parent_natural_id))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl RevisionRepository for InMemoryRowStore {
    async fn begin_revision(&self, name: &str) -> Result<RevisionId> {
        let mut state = self.state.write().await;
        let tables = &mut state.tables;
        if let Some(open) = tables.open_revision {
            return Err(StoreError::Revision(format!(
                "revision {open} is already in progress"
            )));
        }
        tables.next_revision += 1;
        let revision = RevisionId::new(tables.next_revision);
        tables.revisions.insert(
            revision,
            RevisionRow {
                name: name.to_owned(),
                completed: false,
            },
        );
        tables.open_revision = Some(revision);
        Ok(revision)
    }

    async fn complete_revision(&self) -> Result<()> {
        let mut state = self.state.write().await;
        let tables = &mut state.tables;
        let open = tables
            .open_revision
            .take()
            .ok_or_else(|| StoreError::Revision("no revision in progress".into()))?;
        if let Some(row) = tables.revisions.get_mut(&open) {
            row.completed = true;
        }
        Ok(())
    }

    async fn delete_revision(&self, revision: RevisionId) -> Result<()> {
        let mut state = self.state.write().await;
        let tables = &mut state.tables;
        if tables.revisions.remove(&revision).is_none() {
            return Err(StoreError::Revision(format!("unknown revision {revision}")));
        }
        if tables.open_revision == Some(revision) {
            tables.open_revision = None;
        }
        Ok(())
    }
}

#[async_trait]
impl UnitOfWork for InMemoryRowStore {
    async fn begin(&self) -> Result<()> {
        let mut state = self.state.write().await;
        if state.rollback_to.is_some() {
            return Err(StoreError::Transaction(
                "a transaction is already in progress".into(),
            ));
        }
        state.rollback_to = Some(state.tables.clone());
        Ok(())
    }

    async fn commit(&self) -> Result<()> {
        let mut state = self.state.write().await;
        state
            .rollback_to
            .take()
            .map(|_| ())
            .ok_or_else(|| StoreError::Transaction("no transaction to commit".into()))
    }

    async fn rollback(&self) -> Result<()> {
        let mut state = self.state.write().await;
        let saved = state
            .rollback_to
            .take()
            .ok_or_else(|| StoreError::Transaction("no transaction to roll back".into()))?;
        state.tables = saved;
        Ok(())
    }
}
