//! Children: entities that belong to at most one parent.
//!
//! A child never assigns itself. The parent's tracked children set is the one
//! entry point, and its hooks write the child's parent reference through the
//! crate-private [`Child::assign_to_parent`] and
//! [`Child::unassign_from_parent`].

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{KnownState, NaturalId};
use futures_util::StreamExt;
use row_store::{ChildLookup, ChildRecord, Repository, Version};
use serde::{Deserialize, Serialize};

use crate::computations::child_current_side_values;
use crate::events::{ChangePublisher, ChangedEvent, DomainChangedEvent};
use crate::other::{Other, OtherFactory};
use crate::persisted::{
    ComputedDetails, Dependent, DomainStream, NoDependents, PersistedDomain, PersistedFactory,
    UpsertedDomainResult, refetch, upsert_checked,
};
use crate::tracked::{Keyed, OptionalOne, TrackedSortedSet};
use crate::{DomainError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildSnapshot {
    pub natural_id: NaturalId,
    pub other_natural_id: Option<NaturalId>,
    pub parent_natural_id: Option<NaturalId>,
    pub state: KnownState,
    pub at: DateTime<Utc>,
    pub value: Option<String>,
    pub default_side_values: BTreeSet<String>,
    pub side_values: BTreeSet<String>,
    pub version: Version,
}

/// Read-only view of a child's fields.
pub trait ChildDetails {
    fn natural_id(&self) -> &NaturalId;
    fn parent_natural_id(&self) -> Option<&NaturalId>;
    fn other_natural_id(&self) -> Option<&NaturalId>;
    fn state(&self) -> KnownState;
    fn at(&self) -> DateTime<Utc>;
    fn value(&self) -> Option<&str>;
    fn default_side_values(&self) -> &BTreeSet<String>;
    fn side_values(&self) -> &BTreeSet<String>;

    fn relevant(&self) -> bool {
        self.state().is_relevant()
    }

    fn current_side_values(&self) -> BTreeSet<String> {
        child_current_side_values(self.state(), self.side_values(), self.default_side_values())
    }
}

/// Field mutations allowed inside [`Child::update`].
pub trait MutableChildDetails: ChildDetails {
    fn set_state(&mut self, state: KnownState);
    fn set_at(&mut self, at: DateTime<Utc>);
    fn set_value(&mut self, value: Option<String>);
    fn default_side_values_mut(&mut self) -> &mut BTreeSet<String>;
    fn side_values_mut(&mut self) -> &mut BTreeSet<String>;
}

/// The relations a child tracks.
pub trait ChildDependentDetails {
    fn other(&self) -> Option<&Other>;
}

impl ChildDetails for ChildRecord {
    fn natural_id(&self) -> &NaturalId {
        &self.natural_id
    }

    fn parent_natural_id(&self) -> Option<&NaturalId> {
        self.parent_natural_id.as_ref()
    }

    fn other_natural_id(&self) -> Option<&NaturalId> {
        self.other_natural_id.as_ref()
    }

    fn state(&self) -> KnownState {
        self.state
    }

    fn at(&self) -> DateTime<Utc> {
        self.at
    }

    fn value(&self) -> Option<&str> {
        self.value.as_deref()
    }

    fn default_side_values(&self) -> &BTreeSet<String> {
        &self.default_side_values
    }

    fn side_values(&self) -> &BTreeSet<String> {
        &self.side_values
    }
}

impl MutableChildDetails for ChildRecord {
    fn set_state(&mut self, state: KnownState) {
        self.state = state;
    }

    fn set_at(&mut self, at: DateTime<Utc>) {
        self.at = at;
    }

    fn set_value(&mut self, value: Option<String>) {
        self.value = value;
    }

    fn default_side_values_mut(&mut self) -> &mut BTreeSet<String> {
        &mut self.default_side_values
    }

    fn side_values_mut(&mut self) -> &mut BTreeSet<String> {
        &mut self.side_values
    }
}

fn other_assigned(other: &Other, record: &mut ChildRecord) -> Result<()> {
    record.other_natural_id = Some(other.natural_id().clone());
    Ok(())
}

fn other_unassigned(other: &Other, record: &mut ChildRecord) -> Result<()> {
    if record.other_natural_id.as_ref() == Some(other.natural_id()) {
        record.other_natural_id = None;
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChildComputed {
    other: TrackedSortedSet<Other, ChildRecord>,
}

impl ChildComputed {
    fn new(other: Option<Other>) -> Self {
        Self {
            other: TrackedSortedSet::optional_one(other, other_assigned, other_unassigned),
        }
    }
}

impl ChildDependentDetails for ChildComputed {
    fn other(&self) -> Option<&Other> {
        self.other.first()
    }
}

impl ComputedDetails for ChildComputed {
    type Dependent = NoDependents;

    fn mutated(&self) -> Result<Vec<NoDependents>> {
        Ok(Vec::new())
    }

    fn reset(&mut self) {
        self.other.reset();
    }
}

/// Scoped mutable access handed to [`Child::update`].
pub struct MutableChild<'a> {
    record: &'a mut ChildRecord,
    computed: &'a mut ChildComputed,
}

impl MutableChild<'_> {
    /// The other this child points at, as a replaceable single value.
    pub fn other(&mut self) -> OptionalOne<'_, Other, ChildRecord> {
        OptionalOne::new(&mut self.computed.other, self.record)
    }

    pub fn assign_other(&mut self, other: &Other) -> Result<()> {
        self.other().set(Some(other.clone()))
    }

    pub fn unassign_any_other(&mut self) -> Result<()> {
        self.other().set(None)
    }
}

impl ChildDetails for MutableChild<'_> {
    fn natural_id(&self) -> &NaturalId {
        self.record.natural_id()
    }

    fn parent_natural_id(&self) -> Option<&NaturalId> {
        ChildDetails::parent_natural_id(&*self.record)
    }

    fn other_natural_id(&self) -> Option<&NaturalId> {
        ChildDetails::other_natural_id(&*self.record)
    }

    fn state(&self) -> KnownState {
        self.record.state
    }

    fn at(&self) -> DateTime<Utc> {
        self.record.at
    }

    fn value(&self) -> Option<&str> {
        self.record.value.as_deref()
    }

    fn default_side_values(&self) -> &BTreeSet<String> {
        &self.record.default_side_values
    }

    fn side_values(&self) -> &BTreeSet<String> {
        &self.record.side_values
    }
}

impl MutableChildDetails for MutableChild<'_> {
    fn set_state(&mut self, state: KnownState) {
        self.record.set_state(state);
    }

    fn set_at(&mut self, at: DateTime<Utc>) {
        self.record.set_at(at);
    }

    fn set_value(&mut self, value: Option<String>) {
        self.record.set_value(value);
    }

    fn default_side_values_mut(&mut self) -> &mut BTreeSet<String> {
        self.record.default_side_values_mut()
    }

    fn side_values_mut(&mut self) -> &mut BTreeSet<String> {
        self.record.side_values_mut()
    }
}

#[derive(Clone)]
pub struct Child {
    persisted: Arc<PersistedDomain<ChildFactory>>,
}

impl Child {
    pub fn natural_id(&self) -> &NaturalId {
        self.persisted.natural_id()
    }

    pub fn parent_natural_id(&self) -> Result<Option<NaturalId>> {
        self.persisted
            .read(|record, _| record.parent_natural_id.clone())
    }

    pub fn other(&self) -> Result<Option<Other>> {
        self.persisted
            .read(|_, computed| computed.other().cloned())
    }

    pub fn state(&self) -> Result<KnownState> {
        self.persisted.read(|record, _| record.state)
    }

    pub fn at(&self) -> Result<DateTime<Utc>> {
        self.persisted.read(|record, _| record.at)
    }

    pub fn value(&self) -> Result<Option<String>> {
        self.persisted.read(|record, _| record.value.clone())
    }

    pub fn default_side_values(&self) -> Result<BTreeSet<String>> {
        self.persisted
            .read(|record, _| record.default_side_values.clone())
    }

    pub fn side_values(&self) -> Result<BTreeSet<String>> {
        self.persisted.read(|record, _| record.side_values.clone())
    }

    pub fn relevant(&self) -> Result<bool> {
        self.persisted.read(|record, _| record.relevant())
    }

    pub fn current_side_values(&self) -> Result<BTreeSet<String>> {
        self.persisted
            .read(|record, _| record.current_side_values())
    }

    pub fn version(&self) -> Result<Version> {
        self.persisted.version()
    }

    pub fn changed(&self) -> Result<bool> {
        self.persisted.changed()
    }

    pub fn is_deleted(&self) -> bool {
        self.persisted.is_deleted()
    }

    pub fn snapshot(&self) -> Result<ChildSnapshot> {
        self.persisted.snapshot()
    }

    pub fn update<R>(&self, f: impl FnOnce(&mut MutableChild<'_>) -> Result<R>) -> Result<R> {
        self.persisted
            .update(|record, computed| f(&mut MutableChild { record, computed }))
    }

    pub fn assign_other(&self, other: &Other) -> Result<()> {
        self.update(|child| child.assign_other(other))
    }

    pub fn unassign_any_other(&self) -> Result<()> {
        self.update(|child| child.unassign_any_other())
    }

    pub async fn save(&self) -> Result<UpsertedDomainResult<Child>> {
        let changed = self.persisted.save().await?;
        Ok(UpsertedDomainResult {
            domain: self.clone(),
            changed,
        })
    }

    pub async fn delete(&self) -> Result<()> {
        self.persisted.delete().await
    }

    pub(crate) fn assign_to_parent(&self, parent: &NaturalId) -> Result<()> {
        self.persisted
            .update(|record, _| match &record.parent_natural_id {
                Some(current) if current != parent => Err(DomainError::AlreadyAssigned {
                    child: record.natural_id.clone(),
                    parent: current.clone(),
                }
                .into()),
                _ => {
                    record.parent_natural_id = Some(parent.clone());
                    Ok(())
                }
            })
    }

    pub(crate) fn unassign_from_parent(&self, parent: &NaturalId) -> Result<()> {
        self.persisted.update(|record, _| {
            if record.parent_natural_id.as_ref() != Some(parent) {
                return Err(DomainError::NotAssigned {
                    child: record.natural_id.clone(),
                    parent: parent.clone(),
                }
                .into());
            }
            record.parent_natural_id = None;
            Ok(())
        })
    }
}

impl Keyed for Child {
    fn key(&self) -> &NaturalId {
        self.natural_id()
    }
}

impl PartialEq for Child {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.persisted, &other.persisted) || self.persisted == other.persisted
    }
}

impl std::fmt::Debug for Child {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Child").field(self.natural_id()).finish()
    }
}

#[async_trait]
impl Dependent for Child {
    async fn save_dependent(&self) -> Result<bool> {
        Ok(self.save().await?.changed)
    }
}

/// Creates, finds and persists children.
#[derive(Clone)]
pub struct ChildFactory {
    children: Arc<dyn Repository<ChildRecord>>,
    lookup: Arc<dyn ChildLookup>,
    others: OtherFactory,
    publisher: Arc<dyn ChangePublisher>,
}

impl ChildFactory {
    pub fn new(
        children: Arc<dyn Repository<ChildRecord>>,
        lookup: Arc<dyn ChildLookup>,
        others: OtherFactory,
        publisher: Arc<dyn ChangePublisher>,
    ) -> Self {
        Self {
            children,
            lookup,
            others,
            publisher,
        }
    }

    pub async fn all(&self) -> Result<DomainStream<Child>> {
        let records = self.children.find_all().await?;
        let factory = self.clone();
        Ok(Box::pin(records.then(move |record| {
            let factory = factory.clone();
            async move { factory.to_domain(record?).await }
        })))
    }

    #[tracing::instrument(skip(self))]
    pub async fn find_existing(&self, natural_id: &NaturalId) -> Result<Option<Child>> {
        match self.children.find_by_natural_id(natural_id).await? {
            Some(record) => Ok(Some(self.to_domain(record).await?)),
            None => Ok(None),
        }
    }

    /// A new, unassigned child.
    pub fn create_new(&self, natural_id: NaturalId) -> Child {
        Child {
            persisted: Arc::new(PersistedDomain::new(
                self.clone(),
                None,
                ChildRecord::new(natural_id),
                ChildComputed::new(None),
            )),
        }
    }

    pub async fn find_existing_or_create_new(&self, natural_id: NaturalId) -> Result<Child> {
        match self.find_existing(&natural_id).await? {
            Some(child) => Ok(child),
            None => Ok(self.create_new(natural_id)),
        }
    }

    /// Children currently assigned to a parent, in natural-id order.
    #[tracing::instrument(skip(self))]
    pub async fn find_assigned_to(&self, parent_natural_id: &NaturalId) -> Result<Vec<Child>> {
        let records = self
            .lookup
            .find_by_parent_natural_id(parent_natural_id)
            .await?;
        let mut children = Vec::with_capacity(records.len());
        for record in records {
            children.push(self.to_domain(record).await?);
        }
        Ok(children)
    }

    async fn to_domain(&self, record: ChildRecord) -> Result<Child> {
        let other = match &record.other_natural_id {
            Some(other) => self.others.find_existing(other).await?,
            None => None,
        };
        let computed = ChildComputed::new(other);
        let snapshot = self.to_snapshot(&record, &computed);
        Ok(Child {
            persisted: Arc::new(PersistedDomain::new(
                self.clone(),
                Some(snapshot),
                record,
                computed,
            )),
        })
    }
}

#[async_trait]
impl PersistedFactory for ChildFactory {
    type Snapshot = ChildSnapshot;
    type Record = ChildRecord;
    type Computed = ChildComputed;

    async fn save(&self, record: &ChildRecord) -> Result<ChildRecord> {
        upsert_checked(self.children.as_ref(), record).await
    }

    async fn delete(&self, record: &ChildRecord) -> Result<()> {
        Ok(self.children.delete(record).await?)
    }

    async fn refresh_record(&self, record: &ChildRecord) -> Result<ChildRecord> {
        refetch(self.children.as_ref(), record).await
    }

    fn notify_changed(&self, before: Option<ChildSnapshot>, after: Option<ChildSnapshot>) {
        self.publisher
            .publish(ChangedEvent::ChildChanged(DomainChangedEvent::new(
                before, after,
            )));
    }

    fn to_snapshot(&self, record: &ChildRecord, _computed: &ChildComputed) -> ChildSnapshot {
        ChildSnapshot {
            natural_id: record.natural_id.clone(),
            other_natural_id: record.other_natural_id.clone(),
            parent_natural_id: record.parent_natural_id.clone(),
            state: record.state,
            at: record.at,
            value: record.value.clone(),
            default_side_values: record.default_side_values.clone(),
            side_values: record.side_values.clone(),
            version: record.version,
        }
    }

    fn check_deletable(&self, record: &ChildRecord, _computed: &ChildComputed) -> Result<()> {
        match &record.parent_natural_id {
            Some(parent) => Err(DomainError::StillAssigned {
                child: record.natural_id.clone(),
                parent: parent.clone(),
            }
            .into()),
            None => Ok(()),
        }
    }
}
