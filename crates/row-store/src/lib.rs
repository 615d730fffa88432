pub mod config;
pub mod error;
pub mod memory;
pub mod postgres;
pub mod record;
pub mod store;

pub use common::{KnownState, NaturalId};
pub use config::StoreConfig;
pub use error::{Result, StoreError};
pub use memory::InMemoryRowStore;
pub use postgres::PostgresRowStore;
pub use record::{ChildRecord, OtherRecord, ParentRecord, UpsertableRecord, Version};
pub use store::{
    ChildLookup, RecordStream, Repository, RevisionId, RevisionRepository, UnitOfWork,
};
