//! Others: standalone entities that parents and children may point at.

use std::sync::Arc;

use async_trait::async_trait;
use common::NaturalId;
use futures_util::StreamExt;
use row_store::{ChildRecord, OtherRecord, ParentRecord, Repository, Version};
use serde::{Deserialize, Serialize};

use crate::events::{ChangePublisher, ChangedEvent, DomainChangedEvent};
use crate::persisted::{
    ComputedDetails, DomainStream, NoDependents, PersistedDomain, PersistedFactory,
    UpsertedDomainResult, refetch, upsert_checked,
};
use crate::tracked::Keyed;
use crate::Result;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OtherSnapshot {
    pub natural_id: NaturalId,
    pub value: Option<String>,
    pub version: Version,
}

/// Read-only view of an other's fields.
pub trait OtherDetails {
    fn natural_id(&self) -> &NaturalId;
    fn value(&self) -> Option<&str>;
}

/// Field mutations allowed inside [`Other::update`].
pub trait MutableOtherDetails: OtherDetails {
    fn set_value(&mut self, value: Option<String>);
}

impl OtherDetails for OtherRecord {
    fn natural_id(&self) -> &NaturalId {
        &self.natural_id
    }

    fn value(&self) -> Option<&str> {
        self.value.as_deref()
    }
}

/// Others track no relations of their own.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OtherComputed;

impl ComputedDetails for OtherComputed {
    type Dependent = NoDependents;

    fn mutated(&self) -> Result<Vec<NoDependents>> {
        Ok(Vec::new())
    }

    fn reset(&mut self) {}
}

/// Scoped mutable access handed to [`Other::update`].
pub struct MutableOther<'a> {
    record: &'a mut OtherRecord,
}

impl OtherDetails for MutableOther<'_> {
    fn natural_id(&self) -> &NaturalId {
        &self.record.natural_id
    }

    fn value(&self) -> Option<&str> {
        self.record.value.as_deref()
    }
}

impl MutableOtherDetails for MutableOther<'_> {
    fn set_value(&mut self, value: Option<String>) {
        self.record.value = value;
    }
}

#[derive(Clone)]
pub struct Other {
    persisted: Arc<PersistedDomain<OtherFactory>>,
}

impl Other {
    pub fn natural_id(&self) -> &NaturalId {
        self.persisted.natural_id()
    }

    pub fn value(&self) -> Result<Option<String>> {
        self.persisted.read(|record, _| record.value.clone())
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

    pub fn snapshot(&self) -> Result<OtherSnapshot> {
        self.persisted.snapshot()
    }

    pub fn update<R>(&self, f: impl FnOnce(&mut MutableOther<'_>) -> Result<R>) -> Result<R> {
        self.persisted
            .update(|record, _| f(&mut MutableOther { record }))
    }

    pub async fn save(&self) -> Result<UpsertedDomainResult<Other>> {
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

impl Keyed for Other {
    fn key(&self) -> &NaturalId {
        self.natural_id()
    }
}

impl PartialEq for Other {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.persisted, &other.persisted) || self.persisted == other.persisted
    }
}

impl std::fmt::Debug for Other {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Other").field(self.natural_id()).finish()
    }
}

/// Creates, finds and persists others.
#[derive(Clone)]
pub struct OtherFactory {
    others: Arc<dyn Repository<OtherRecord>>,
    parents: Arc<dyn Repository<ParentRecord>>,
    children: Arc<dyn Repository<ChildRecord>>,
    publisher: Arc<dyn ChangePublisher>,
}

impl OtherFactory {
    pub fn new(
        others: Arc<dyn Repository<OtherRecord>>,
        parents: Arc<dyn Repository<ParentRecord>>,
        children: Arc<dyn Repository<ChildRecord>>,
        publisher: Arc<dyn ChangePublisher>,
    ) -> Self {
        Self {
            others,
            parents,
            children,
            publisher,
        }
    }

    pub async fn all(&self) -> Result<DomainStream<Other>> {
        let records = self.others.find_all().await?;
        let factory = self.clone();
        Ok(Box::pin(records.map(move |record| {
            record
                .map(|record| factory.to_domain(record))
                .map_err(Into::into)
        })))
    }

    #[tracing::instrument(skip(self))]
    pub async fn find_existing(&self, natural_id: &NaturalId) -> Result<Option<Other>> {
        Ok(self
            .others
            .find_by_natural_id(natural_id)
            .await?
            .map(|record| self.to_domain(record)))
    }

    pub fn create_new(&self, natural_id: NaturalId) -> Other {
        Other {
            persisted: Arc::new(PersistedDomain::new(
                self.clone(),
                None,
                OtherRecord::new(natural_id),
                OtherComputed,
            )),
        }
    }

    pub async fn find_existing_or_create_new(&self, natural_id: NaturalId) -> Result<Other> {
        match self.find_existing(&natural_id).await? {
            Some(other) => Ok(other),
            None => Ok(self.create_new(natural_id)),
        }
    }

    /// The other a parent or child with this natural id points at.
    #[tracing::instrument(skip(self))]
    pub async fn find_assigned_to(&self, natural_id: &NaturalId) -> Result<Option<Other>> {
        let assigned = match self.parents.find_by_natural_id(natural_id).await? {
            Some(parent) => parent.other_natural_id,
            None => self
                .children
                .find_by_natural_id(natural_id)
                .await?
                .and_then(|child| child.other_natural_id),
        };
        match assigned {
            Some(other) => self.find_existing(&other).await,
            None => Ok(None),
        }
    }

    fn to_domain(&self, record: OtherRecord) -> Other {
        let snapshot = self.to_snapshot(&record, &OtherComputed);
        Other {
            persisted: Arc::new(PersistedDomain::new(
                self.clone(),
                Some(snapshot),
                record,
                OtherComputed,
            )),
        }
    }
}

#[async_trait]
impl PersistedFactory for OtherFactory {
    type Snapshot = OtherSnapshot;
    type Record = OtherRecord;
    type Computed = OtherComputed;

    async fn save(&self, record: &OtherRecord) -> Result<OtherRecord> {
        upsert_checked(self.others.as_ref(), record).await
    }

    async fn delete(&self, record: &OtherRecord) -> Result<()> {
        Ok(self.others.delete(record).await?)
    }

    async fn refresh_record(&self, record: &OtherRecord) -> Result<OtherRecord> {
        refetch(self.others.as_ref(), record).await
    }

    fn notify_changed(&self, before: Option<OtherSnapshot>, after: Option<OtherSnapshot>) {
        self.publisher
            .publish(ChangedEvent::OtherChanged(DomainChangedEvent::new(
                before, after,
            )));
    }

    fn to_snapshot(&self, record: &OtherRecord, _computed: &OtherComputed) -> OtherSnapshot {
        OtherSnapshot {
            natural_id: record.natural_id.clone(),
            value: record.value.clone(),
            version: record.version,
        }
    }
}
