use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{KnownState, NaturalId};

/// Row version used for optimistic concurrency control.
///
/// Unsaved records carry version 0. Storage assigns 1 on insert and adds one
/// for every accepted write that changes a stored column.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Version(i64);

impl Version {
    /// Creates a new version from a raw value.
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    /// The version of a record that has never been written.
    pub fn initial() -> Self {
        Self(0)
    }

    /// The version storage assigns on insert.
    pub fn first() -> Self {
        Self(1)
    }

    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for Version {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl From<Version> for i64 {
    fn from(version: Version) -> Self {
        version.0
    }
}

/// A storage row that can be upserted under a version check.
pub trait UpsertableRecord:
    Clone + PartialEq + std::fmt::Debug + Send + Sync + 'static
{
    /// Table-level name used in errors and logs.
    const ENTITY: &'static str;

    fn natural_id(&self) -> &NaturalId;

    /// Surrogate key, absent until the first write.
    fn id(&self) -> Option<i64>;

    fn version(&self) -> Version;

    fn is_persisted(&self) -> bool {
        self.version() != Version::initial()
    }

    /// A copy carrying the given surrogate key and version.
    ///
    /// Storage uses this to compare a candidate against the stored row on
    /// content alone.
    fn stamped(&self, id: Option<i64>, version: Version) -> Self;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OtherRecord {
    pub id: Option<i64>,
    pub natural_id: NaturalId,
    pub value: Option<String>,
    pub version: Version,
}

impl OtherRecord {
    pub fn new(natural_id: NaturalId) -> Self {
        Self {
            id: None,
            natural_id,
            value: None,
            version: Version::initial(),
        }
    }
}

impl UpsertableRecord for OtherRecord {
    const ENTITY: &'static str = "other";

    fn natural_id(&self) -> &NaturalId {
        &self.natural_id
    }

    fn id(&self) -> Option<i64> {
        self.id
    }

    fn version(&self) -> Version {
        self.version
    }

    fn stamped(&self, id: Option<i64>, version: Version) -> Self {
        Self {
            id,
            version,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentRecord {
    pub id: Option<i64>,
    pub natural_id: NaturalId,
    pub other_natural_id: Option<NaturalId>,
    pub state: KnownState,
    pub value: Option<String>,
    pub side_values: BTreeSet<String>,
    pub version: Version,
}

impl ParentRecord {
    pub fn new(natural_id: NaturalId) -> Self {
        Self {
            id: None,
            natural_id,
            other_natural_id: None,
            state: KnownState::Enabled,
            value: None,
            side_values: BTreeSet::new(),
            version: Version::initial(),
        }
    }
}

impl UpsertableRecord for ParentRecord {
    const ENTITY: &'static str = "parent";

    fn natural_id(&self) -> &NaturalId {
        &self.natural_id
    }

    fn id(&self) -> Option<i64> {
        self.id
    }

    fn version(&self) -> Version {
        self.version
    }

    fn stamped(&self, id: Option<i64>, version: Version) -> Self {
        Self {
            id,
            version,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildRecord {
    pub id: Option<i64>,
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

impl ChildRecord {
    pub fn new(natural_id: NaturalId) -> Self {
        Self {
            id: None,
            natural_id,
            other_natural_id: None,
            parent_natural_id: None,
            state: KnownState::Enabled,
            at: common::at_zero(),
            value: None,
            default_side_values: BTreeSet::new(),
            side_values: BTreeSet::new(),
            version: Version::initial(),
        }
    }
}

impl UpsertableRecord for ChildRecord {
    const ENTITY: &'static str = "child";

    fn natural_id(&self) -> &NaturalId {
        &self.natural_id
    }

    fn id(&self) -> Option<i64> {
        self.id
    }

    fn version(&self) -> Version {
        self.version
    }

    fn stamped(&self, id: Option<i64>, version: Version) -> Self {
        Self {
            id,
            version,
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_ordering_and_next() {
        let v1 = Version::new(1);
        let v2 = Version::new(2);
        assert!(v1 < v2);
        assert_eq!(v1.next(), v2);
        assert_eq!(Version::initial().next(), Version::first());
    }

    #[test]
    fn new_records_are_unsaved_with_defaults() {
        let child = ChildRecord::new(NaturalId::from("c"));
        assert!(!child.is_persisted());
        assert_eq!(child.state, KnownState::Enabled);
        assert_eq!(child.at, common::at_zero());
        assert_eq!(child.id, None);

        let parent = ParentRecord::new(NaturalId::from("p"));
        assert_eq!(parent.version, Version::initial());
        assert!(parent.side_values.is_empty());
    }

    #[test]
    fn stamped_compares_on_content_only() {
        let mut stored = OtherRecord::new(NaturalId::from("o"));
        stored.id = Some(7);
        stored.version = Version::new(3);

        let candidate = OtherRecord::new(NaturalId::from("o")).stamped(Some(7), Version::new(3));
        assert_eq!(candidate, stored);

        let mut changed = candidate.clone();
        changed.value = Some("x".into());
        assert_ne!(changed, stored);
    }
}
