//! The save/delete protocol shared by every persisted entity.
//!
//! A [`PersistedDomain`] owns three things: the record as last read from or
//! written to storage, the snapshot taken at that moment, and the computed
//! details (tracked relations to other domain objects). Comparing the stored
//! snapshot with a fresh projection of the record is how `changed` is decided,
//! and it is the only thing that decides whether `save` writes anything.

use std::fmt;
use std::pin::Pin;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use common::NaturalId;
use futures_core::Stream;
use row_store::{Repository, UpsertableRecord, Version};

use crate::{DomainError, Error, Result};

/// A stream of domain objects.
pub type DomainStream<T> = Pin<Box<dyn Stream<Item = Result<T>> + Send>>;

/// Outcome of a save: the saved object and whether storage changed.
#[derive(Debug, Clone)]
pub struct UpsertedDomainResult<D> {
    pub domain: D,
    pub changed: bool,
}

/// Entity-specific persistence hooks driven by [`PersistedDomain`].
#[async_trait]
pub trait PersistedFactory: Clone + Send + Sync + 'static {
    type Snapshot: Clone + PartialEq + fmt::Debug + Send + Sync + 'static;
    type Record: UpsertableRecord;
    type Computed: ComputedDetails;

    /// Writes the record and returns the authoritative row.
    async fn save(&self, record: &Self::Record) -> Result<Self::Record>;

    async fn delete(&self, record: &Self::Record) -> Result<()>;

    /// Re-reads a row whose server-side columns may have moved.
    async fn refresh_record(&self, record: &Self::Record) -> Result<Self::Record>;

    fn notify_changed(&self, before: Option<Self::Snapshot>, after: Option<Self::Snapshot>);

    fn to_snapshot(&self, record: &Self::Record, computed: &Self::Computed) -> Self::Snapshot;

    /// Refuses a delete that would leave dangling relationships.
    fn check_deletable(&self, _record: &Self::Record, _computed: &Self::Computed) -> Result<()> {
        Ok(())
    }
}

/// A related object whose pending changes are written with its owner.
#[async_trait]
pub trait Dependent: Send + Sync + 'static {
    /// Saves the dependent, returning whether storage changed.
    async fn save_dependent(&self) -> Result<bool>;
}

/// The relation state of an entity.
pub trait ComputedDetails: Clone + PartialEq + fmt::Debug + Send + Sync + 'static {
    type Dependent: Dependent;

    /// Dependents that joined, left or stayed in a relation and have unsaved
    /// changes, in write order.
    fn mutated(&self) -> Result<Vec<Self::Dependent>>;

    /// Re-baselines every tracked relation.
    fn reset(&mut self);
}

/// For entities without dependents.
#[derive(Debug, Clone)]
pub enum NoDependents {}

#[async_trait]
impl Dependent for NoDependents {
    async fn save_dependent(&self) -> Result<bool> {
        match *self {}
    }
}

struct State<F: PersistedFactory> {
    snapshot: Option<F::Snapshot>,
    record: Option<F::Record>,
    computed: F::Computed,
}

impl<F: PersistedFactory> State<F> {
    fn record(&self, natural_id: &NaturalId) -> Result<&F::Record> {
        self.record.as_ref().ok_or_else(|| deleted::<F>(natural_id))
    }
}

fn deleted<F: PersistedFactory>(natural_id: &NaturalId) -> Error {
    DomainError::Deleted {
        entity: F::Record::ENTITY,
        natural_id: natural_id.clone(),
    }
    .into()
}

/// One persisted object: record, last-saved snapshot and computed details.
///
/// The guard around the state is never held across an `.await`. Saves are
/// single-writer: callers serialize `update`, `save` and `delete` on the same
/// object.
pub struct PersistedDomain<F: PersistedFactory> {
    natural_id: NaturalId,
    factory: F,
    state: Mutex<State<F>>,
}

impl<F: PersistedFactory> PersistedDomain<F> {
    pub fn new(
        factory: F,
        snapshot: Option<F::Snapshot>,
        record: F::Record,
        computed: F::Computed,
    ) -> Self {
        Self {
            natural_id: record.natural_id().clone(),
            factory,
            state: Mutex::new(State {
                snapshot,
                record: Some(record),
                computed,
            }),
        }
    }

    pub fn natural_id(&self) -> &NaturalId {
        &self.natural_id
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }

    fn lock(&self) -> MutexGuard<'_, State<F>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reads the record and computed details.
    pub fn read<R>(&self, f: impl FnOnce(&F::Record, &F::Computed) -> R) -> Result<R> {
        let state = self.lock();
        let record = state.record(&self.natural_id)?;
        Ok(f(record, &state.computed))
    }

    /// Mutates the record and computed details in place.
    ///
    /// The closure must not call back into this object.
    pub fn update<R>(
        &self,
        f: impl FnOnce(&mut F::Record, &mut F::Computed) -> Result<R>,
    ) -> Result<R> {
        let mut guard = self.lock();
        let State {
            record, computed, ..
        } = &mut *guard;
        let record = record
            .as_mut()
            .ok_or_else(|| deleted::<F>(&self.natural_id))?;
        f(record, computed)
    }

    pub fn version(&self) -> Result<Version> {
        self.read(|record, _| record.version())
    }

    pub fn is_deleted(&self) -> bool {
        self.lock().record.is_none()
    }

    /// Whether the current projection differs from the last saved snapshot.
    pub fn changed(&self) -> Result<bool> {
        let state = self.lock();
        let record = state.record(&self.natural_id)?;
        let current = self.factory.to_snapshot(record, &state.computed);
        Ok(state.snapshot.as_ref() != Some(&current))
    }

    /// The current projection of this object.
    pub fn snapshot(&self) -> Result<F::Snapshot> {
        self.read(|record, computed| self.factory.to_snapshot(record, computed))
    }

    /// Writes this object, then any mutated dependents.
    ///
    /// Nothing is written when neither this object nor a dependent changed.
    /// The stored record is kept as soon as this object's own write lands, so
    /// a retry after a failed dependent does not conflict with it. The
    /// baseline snapshot and relations are only replaced once every write
    /// succeeded.
    #[tracing::instrument(skip(self), fields(entity = F::Record::ENTITY, natural_id = %self.natural_id))]
    pub async fn save(&self) -> Result<bool> {
        let (before, record, changed) = {
            let state = self.lock();
            let record = state.record(&self.natural_id)?.clone();
            let current = self.factory.to_snapshot(&record, &state.computed);
            let changed = state.snapshot.as_ref() != Some(&current);
            (state.snapshot.clone(), record, changed)
        };

        let mut record = if changed {
            metrics::counter!("domain_upserts_total", "entity" => F::Record::ENTITY).increment(1);
            let saved = self.factory.save(&record).await?;
            self.lock().record = Some(saved.clone());
            saved
        } else {
            record
        };

        let dependents = self.lock().computed.mutated()?;
        let dependents_saved = save_all(&dependents).await?;
        if dependents_saved {
            record = self.factory.refresh_record(&record).await?;
        }

        let after = {
            let mut state = self.lock();
            state.computed.reset();
            let after = self.factory.to_snapshot(&record, &state.computed);
            state.record = Some(record);
            state.snapshot = Some(after.clone());
            after
        };

        if before.as_ref() != Some(&after) {
            tracing::debug!(?after, "saved with changes");
            self.factory.notify_changed(before, Some(after));
        }
        Ok(changed || dependents_saved)
    }

    /// Deletes this object after writing any mutated dependents.
    ///
    /// An object that was never saved is only marked deleted.
    #[tracing::instrument(skip(self), fields(entity = F::Record::ENTITY, natural_id = %self.natural_id))]
    pub async fn delete(&self) -> Result<()> {
        let (before, record, dependents) = {
            let state = self.lock();
            let record = state.record(&self.natural_id)?.clone();
            self.factory.check_deletable(&record, &state.computed)?;
            (state.snapshot.clone(), record, state.computed.mutated()?)
        };

        let record = if save_all(&dependents).await? {
            self.factory.refresh_record(&record).await?
        } else {
            record
        };
        if record.is_persisted() {
            metrics::counter!("domain_deletes_total", "entity" => F::Record::ENTITY).increment(1);
            self.factory.delete(&record).await?;
        }

        {
            let mut state = self.lock();
            state.computed.reset();
            state.record = None;
            state.snapshot = None;
        }

        if before.is_some() {
            tracing::debug!("deleted");
            self.factory.notify_changed(before, None);
        }
        Ok(())
    }

    fn parts(&self) -> (Option<F::Snapshot>, Option<F::Record>, F::Computed) {
        let state = self.lock();
        (
            state.snapshot.clone(),
            state.record.clone(),
            state.computed.clone(),
        )
    }
}

async fn save_all<D: Dependent>(dependents: &[D]) -> Result<bool> {
    let mut saved = false;
    for dependent in dependents {
        saved |= dependent.save_dependent().await?;
    }
    Ok(saved)
}

impl<F: PersistedFactory> PartialEq for PersistedDomain<F> {
    fn eq(&self, other: &Self) -> bool {
        if std::ptr::eq(self, other) {
            return true;
        }
        self.parts() == other.parts()
    }
}

impl<F: PersistedFactory> fmt::Debug for PersistedDomain<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("PersistedDomain")
            .field("entity", &F::Record::ENTITY)
            .field("natural_id", &self.natural_id)
            .field("version", &state.record.as_ref().map(UpsertableRecord::version))
            .field("deleted", &state.record.is_none())
            .finish()
    }
}

/// Upserts through a repository, turning a stale-version answer into a conflict.
pub(crate) async fn upsert_checked<R: UpsertableRecord>(
    repository: &dyn Repository<R>,
    record: &R,
) -> Result<R> {
    repository
        .upsert(record)
        .await?
        .ok_or_else(|| conflict(record))
}

/// Re-reads a row that must still exist.
pub(crate) async fn refetch<R: UpsertableRecord>(
    repository: &dyn Repository<R>,
    record: &R,
) -> Result<R> {
    repository
        .find_by_natural_id(record.natural_id())
        .await?
        .ok_or_else(|| conflict(record))
}

fn conflict<R: UpsertableRecord>(record: &R) -> Error {
    Error::Conflict {
        entity: R::ENTITY,
        natural_id: record.natural_id().clone(),
        version: record.version(),
    }
}
