//! Parents: entities that own a sorted set of children.
//!
//! A parent's `at` is not stored. It is derived from the children every time
//! a snapshot is taken, so assigning or re-timing a child changes the parent's
//! snapshot and makes the parent publish an event on its next save.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{KnownState, NaturalId};
use futures_util::StreamExt;
use row_store::{ParentRecord, Repository, Version};
use serde::{Deserialize, Serialize};

use crate::child::{Child, ChildFactory};
use crate::computations::{earliest_at, parent_current_side_values};
use crate::events::{ChangePublisher, ChangedEvent, DomainChangedEvent};
use crate::other::{Other, OtherFactory};
use crate::persisted::{
    ComputedDetails, DomainStream, PersistedDomain, PersistedFactory, UpsertedDomainResult,
    refetch, upsert_checked,
};
use crate::tracked::{OptionalOne, TrackedSortedSet};
use crate::{DomainError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentSnapshot {
    pub natural_id: NaturalId,
    pub other_natural_id: Option<NaturalId>,
    pub state: KnownState,
    pub at: Option<DateTime<Utc>>,
    pub value: Option<String>,
    pub side_values: BTreeSet<String>,
    pub version: Version,
}

/// Read-only view of a parent's stored fields.
pub trait ParentDetails {
    fn natural_id(&self) -> &NaturalId;
    fn other_natural_id(&self) -> Option<&NaturalId>;
    fn state(&self) -> KnownState;
    fn value(&self) -> Option<&str>;
    fn side_values(&self) -> &BTreeSet<String>;
}

/// Field mutations allowed inside [`Parent::update`].
pub trait MutableParentDetails: ParentDetails {
    fn set_state(&mut self, state: KnownState);
    fn set_value(&mut self, value: Option<String>);
    fn side_values_mut(&mut self) -> &mut BTreeSet<String>;
}

/// The relations a parent tracks and what is derived from them.
pub trait ParentDependentDetails {
    fn other(&self) -> Option<&Other>;
    fn children(&self) -> Vec<Child>;

    /// Earliest `at` over the assigned children.
    fn at(&self) -> Option<DateTime<Utc>> {
        earliest_at(self.children().iter().filter_map(|child| child.at().ok()))
    }

    fn children_side_values(&self) -> Vec<BTreeSet<String>> {
        self.children()
            .iter()
            .filter_map(|child| child.current_side_values().ok())
            .collect()
    }
}

impl ParentDetails for ParentRecord {
    fn natural_id(&self) -> &NaturalId {
        &self.natural_id
    }

    fn other_natural_id(&self) -> Option<&NaturalId> {
        self.other_natural_id.as_ref()
    }

    fn state(&self) -> KnownState {
        self.state
    }

    fn value(&self) -> Option<&str> {
        self.value.as_deref()
    }

    fn side_values(&self) -> &BTreeSet<String> {
        &self.side_values
    }
}

impl MutableParentDetails for ParentRecord {
    fn set_state(&mut self, state: KnownState) {
        self.state = state;
    }

    fn set_value(&mut self, value: Option<String>) {
        self.value = value;
    }

    fn side_values_mut(&mut self) -> &mut BTreeSet<String> {
        &mut self.side_values
    }
}

fn other_assigned(other: &Other, record: &mut ParentRecord) -> Result<()> {
    record.other_natural_id = Some(other.natural_id().clone());
    Ok(())
}

fn other_unassigned(other: &Other, record: &mut ParentRecord) -> Result<()> {
    if record.other_natural_id.as_ref() == Some(other.natural_id()) {
        record.other_natural_id = None;
    }
    Ok(())
}

fn child_assigned(child: &Child, record: &mut ParentRecord) -> Result<()> {
    child.assign_to_parent(&record.natural_id)
}

fn child_unassigned(child: &Child, record: &mut ParentRecord) -> Result<()> {
    child.unassign_from_parent(&record.natural_id)
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParentComputed {
    other: TrackedSortedSet<Other, ParentRecord>,
    children: TrackedSortedSet<Child, ParentRecord>,
}

impl ParentComputed {
    fn new(other: Option<Other>, children: Vec<Child>) -> Self {
        Self {
            other: TrackedSortedSet::optional_one(other, other_assigned, other_unassigned),
            children: TrackedSortedSet::many(children, child_assigned, child_unassigned),
        }
    }
}

impl ParentDependentDetails for ParentComputed {
    fn other(&self) -> Option<&Other> {
        self.other.first()
    }

    fn children(&self) -> Vec<Child> {
        self.children.iter().cloned().collect()
    }
}

impl ComputedDetails for ParentComputed {
    type Dependent = Child;

    /// Children that joined, left or stayed and carry unsaved changes.
    fn mutated(&self) -> Result<Vec<Child>> {
        let mut mutated = Vec::new();
        let mut failed = None;
        let mut unsaved = |child: &Child| {
            // a deleted child already wrote its last state, including leaving us
            if child.is_deleted() {
                return false;
            }
            match child.changed() {
                Ok(true) => {
                    mutated.push(child.clone());
                    true
                }
                Ok(false) => false,
                Err(e) => {
                    failed.get_or_insert(e);
                    false
                }
            }
        };
        self.children.added(&mut unsaved);
        self.children.removed(&mut unsaved);
        self.children.changed(&mut unsaved);
        match failed {
            Some(e) => Err(e),
            None => Ok(mutated),
        }
    }

    fn reset(&mut self) {
        self.other.reset();
        self.children.reset();
    }
}

/// Scoped mutable access handed to [`Parent::update`].
pub struct MutableParent<'a> {
    record: &'a mut ParentRecord,
    computed: &'a mut ParentComputed,
}

impl MutableParent<'_> {
    pub fn other(&mut self) -> OptionalOne<'_, Other, ParentRecord> {
        OptionalOne::new(&mut self.computed.other, self.record)
    }

    pub fn assign_other(&mut self, other: &Other) -> Result<()> {
        self.other().set(Some(other.clone()))
    }

    pub fn unassign_any_other(&mut self) -> Result<()> {
        self.other().set(None)
    }

    pub fn children(&self) -> Vec<Child> {
        self.computed.children()
    }

    pub fn assign_child(&mut self, child: &Child) -> Result<()> {
        self.computed.children.add(child.clone(), self.record)
    }

    pub fn unassign_child(&mut self, child: &Child) -> Result<()> {
        self.computed.children.remove(child, self.record)
    }

    /// Unassigns every child `keep` rejects.
    pub fn retain_children(&mut self, keep: impl FnMut(&Child) -> bool) -> Result<()> {
        self.computed.children.retain(self.record, keep)
    }
}

impl ParentDetails for MutableParent<'_> {
    fn natural_id(&self) -> &NaturalId {
        &self.record.natural_id
    }

    fn other_natural_id(&self) -> Option<&NaturalId> {
        self.record.other_natural_id.as_ref()
    }

    fn state(&self) -> KnownState {
        self.record.state
    }

    fn value(&self) -> Option<&str> {
        self.record.value.as_deref()
    }

    fn side_values(&self) -> &BTreeSet<String> {
        &self.record.side_values
    }
}

impl MutableParentDetails for MutableParent<'_> {
    fn set_state(&mut self, state: KnownState) {
        self.record.set_state(state);
    }

    fn set_value(&mut self, value: Option<String>) {
        self.record.set_value(value);
    }

    fn side_values_mut(&mut self) -> &mut BTreeSet<String> {
        self.record.side_values_mut()
    }
}

#[derive(Clone)]
pub struct Parent {
    persisted: Arc<PersistedDomain<ParentFactory>>,
}

impl Parent {
    pub fn natural_id(&self) -> &NaturalId {
        self.persisted.natural_id()
    }

    pub fn other(&self) -> Result<Option<Other>> {
        self.persisted
            .read(|_, computed| computed.other().cloned())
    }

    /// Assigned children in natural-id order.
    pub fn children(&self) -> Result<Vec<Child>> {
        self.persisted.read(|_, computed| computed.children())
    }

    pub fn state(&self) -> Result<KnownState> {
        self.persisted.read(|record, _| record.state)
    }

    pub fn value(&self) -> Result<Option<String>> {
        self.persisted.read(|record, _| record.value.clone())
    }

    pub fn side_values(&self) -> Result<BTreeSet<String>> {
        self.persisted.read(|record, _| record.side_values.clone())
    }

    pub fn current_side_values(&self) -> Result<BTreeSet<String>> {
        self.persisted.read(|record, computed| {
            parent_current_side_values(&record.side_values, computed.children_side_values())
        })
    }

    pub fn at(&self) -> Result<Option<DateTime<Utc>>> {
        self.persisted.read(|_, computed| computed.at())
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

    pub fn snapshot(&self) -> Result<ParentSnapshot> {
        self.persisted.snapshot()
    }

    pub fn update<R>(&self, f: impl FnOnce(&mut MutableParent<'_>) -> Result<R>) -> Result<R> {
        self.persisted
            .update(|record, computed| f(&mut MutableParent { record, computed }))
    }

    pub fn assign_child(&self, child: &Child) -> Result<()> {
        self.update(|parent| parent.assign_child(child))
    }

    pub fn unassign_child(&self, child: &Child) -> Result<()> {
        self.update(|parent| parent.unassign_child(child))
    }

    pub fn assign_other(&self, other: &Other) -> Result<()> {
        self.update(|parent| parent.assign_other(other))
    }

    pub fn unassign_any_other(&self) -> Result<()> {
        self.update(|parent| parent.unassign_any_other())
    }

    /// Saves the parent first, then every child whose assignment or fields
    /// changed.
    pub async fn save(&self) -> Result<UpsertedDomainResult<Parent>> {
        let changed = self.persisted.save().await?;
        Ok(UpsertedDomainResult {
            domain: self.clone(),
            changed,
        })
    }

    pub async fn delete(&self) -> Result<()> {
        self.persisted.delete().await
    }
}

impl PartialEq for Parent {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.persisted, &other.persisted) || self.persisted == other.persisted
    }
}

impl std::fmt::Debug for Parent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Parent").field(self.natural_id()).finish()
    }
}

/// Creates, finds and persists parents together with their children.
#[derive(Clone)]
pub struct ParentFactory {
    parents: Arc<dyn Repository<ParentRecord>>,
    children: ChildFactory,
    others: OtherFactory,
    publisher: Arc<dyn ChangePublisher>,
}

impl ParentFactory {
    pub fn new(
        parents: Arc<dyn Repository<ParentRecord>>,
        children: ChildFactory,
        others: OtherFactory,
        publisher: Arc<dyn ChangePublisher>,
    ) -> Self {
        Self {
            parents,
            children,
            others,
            publisher,
        }
    }

    pub async fn all(&self) -> Result<DomainStream<Parent>> {
        let records = self.parents.find_all().await?;
        let factory = self.clone();
        Ok(Box::pin(records.then(move |record| {
            let factory = factory.clone();
            async move { factory.to_domain(record?).await }
        })))
    }

    #[tracing::instrument(skip(self))]
    pub async fn find_existing(&self, natural_id: &NaturalId) -> Result<Option<Parent>> {
        match self.parents.find_by_natural_id(natural_id).await? {
            Some(record) => Ok(Some(self.to_domain(record).await?)),
            None => Ok(None),
        }
    }

    pub fn create_new(&self, natural_id: NaturalId) -> Parent {
        Parent {
            persisted: Arc::new(PersistedDomain::new(
                self.clone(),
                None,
                ParentRecord::new(natural_id),
                ParentComputed::new(None, Vec::new()),
            )),
        }
    }

    pub async fn find_existing_or_create_new(&self, natural_id: NaturalId) -> Result<Parent> {
        match self.find_existing(&natural_id).await? {
            Some(parent) => Ok(parent),
            None => Ok(self.create_new(natural_id)),
        }
    }

    async fn to_domain(&self, record: ParentRecord) -> Result<Parent> {
        let other = match &record.other_natural_id {
            Some(other) => self.others.find_existing(other).await?,
            None => None,
        };
        let children = self.children.find_assigned_to(&record.natural_id).await?;
        let computed = ParentComputed::new(other, children);
        let snapshot = self.to_snapshot(&record, &computed);
        Ok(Parent {
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
impl PersistedFactory for ParentFactory {
    type Snapshot = ParentSnapshot;
    type Record = ParentRecord;
    type Computed = ParentComputed;

    async fn save(&self, record: &ParentRecord) -> Result<ParentRecord> {
        upsert_checked(self.parents.as_ref(), record).await
    }

    async fn delete(&self, record: &ParentRecord) -> Result<()> {
        Ok(self.parents.delete(record).await?)
    }

    async fn refresh_record(&self, record: &ParentRecord) -> Result<ParentRecord> {
        refetch(self.parents.as_ref(), record).await
    }

    fn notify_changed(&self, before: Option<ParentSnapshot>, after: Option<ParentSnapshot>) {
        self.publisher
            .publish(ChangedEvent::ParentChanged(DomainChangedEvent::new(
                before, after,
            )));
    }

    fn to_snapshot(&self, record: &ParentRecord, computed: &ParentComputed) -> ParentSnapshot {
        ParentSnapshot {
            natural_id: record.natural_id.clone(),
            other_natural_id: record.other_natural_id.clone(),
            state: record.state,
            at: computed.at(),
            value: record.value.clone(),
            side_values: record.side_values.clone(),
            version: record.version,
        }
    }

    fn check_deletable(&self, record: &ParentRecord, computed: &ParentComputed) -> Result<()> {
        if computed.children.is_empty() {
            return Ok(());
        }
        Err(DomainError::HasAssignedChildren {
            parent: record.natural_id.clone(),
            count: computed.children.len(),
        }
        .into())
    }
}
