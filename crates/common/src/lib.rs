//! Shared types for the persisted domain graph.

pub mod types;

pub use types::{KnownState, NaturalId, UnknownState, at_zero};
