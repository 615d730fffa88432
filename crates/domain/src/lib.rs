//! Domain layer for the persisted entity graph.
//!
//! This crate provides:
//! - `TrackedSortedSet`, a relation that remembers its baseline
//! - `PersistedDomain`, the snapshot-driven save/delete protocol
//! - Parent, Child and Other entities with their factories
//! - change events published after every persisted write
//! - `Revisions`, which runs a unit of work inside a named revision

use std::sync::Arc;

use row_store::{
    ChildLookup, ChildRecord, OtherRecord, ParentRecord, Repository, RevisionRepository,
    UnitOfWork,
};

pub mod child;
pub mod computations;
pub mod error;
pub mod events;
pub mod other;
pub mod parent;
pub mod persisted;
pub mod revision;
pub mod tracked;

pub use child::{
    Child, ChildDependentDetails, ChildDetails, ChildFactory, ChildSnapshot, MutableChild,
    MutableChildDetails,
};
pub use error::{DomainError, Error, Result};
pub use events::{BroadcastChangeBus, ChangeKind, ChangePublisher, ChangedEvent, DomainChangedEvent};
pub use other::{MutableOther, MutableOtherDetails, Other, OtherDetails, OtherFactory, OtherSnapshot};
pub use parent::{
    MutableParent, MutableParentDetails, Parent, ParentDependentDetails, ParentDetails,
    ParentFactory, ParentSnapshot,
};
pub use persisted::{DomainStream, UpsertedDomainResult};
pub use revision::Revisions;
pub use tracked::{Arity, Keyed, OptionalOne, TrackedSortedSet};

/// The three factories and the revision wrapper, wired to one store.
#[derive(Clone)]
pub struct Persistence {
    pub others: OtherFactory,
    pub parents: ParentFactory,
    pub children: ChildFactory,
    pub revisions: Revisions,
}

impl Persistence {
    pub fn new<S>(store: Arc<S>, publisher: Arc<dyn ChangePublisher>) -> Self
    where
        S: Repository<OtherRecord>
            + Repository<ParentRecord>
            + Repository<ChildRecord>
            + ChildLookup
            + RevisionRepository
            + UnitOfWork
            + 'static,
    {
        let others = OtherFactory::new(
            store.clone(),
            store.clone(),
            store.clone(),
            publisher.clone(),
        );
        let children = ChildFactory::new(
            store.clone(),
            store.clone(),
            others.clone(),
            publisher.clone(),
        );
        let parents = ParentFactory::new(
            store.clone(),
            children.clone(),
            others.clone(),
            publisher,
        );
        let revisions = Revisions::new(store.clone(), store);
        Self {
            others,
            parents,
            children,
            revisions,
        }
    }
}
