use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Business identifier shared by every persisted entity.
///
/// Natural ids are what callers look entities up by and what relationship
/// columns reference. Ordering is lexicographic, which is the order tracked
/// relationship sets iterate in.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NaturalId(String);

impl NaturalId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl std::fmt::Display for NaturalId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NaturalId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for NaturalId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl AsRef<str> for NaturalId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Lifecycle state stored on parents and children.
///
/// Only `Enabled` children contribute side values to their parent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KnownState {
    #[default]
    Enabled,
    Disabled,
}

impl KnownState {
    pub fn as_str(&self) -> &'static str {
        match self {
            KnownState::Enabled => "ENABLED",
            KnownState::Disabled => "DISABLED",
        }
    }

    /// Whether an entity in this state takes part in derived computations.
    pub fn is_relevant(&self) -> bool {
        matches!(self, KnownState::Enabled)
    }
}

impl std::fmt::Display for KnownState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownState(pub String);

impl std::fmt::Display for UnknownState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unknown state: {}", self.0)
    }
}

impl std::error::Error for UnknownState {}

impl std::str::FromStr for KnownState {
    type Err = UnknownState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ENABLED" => Ok(KnownState::Enabled),
            "DISABLED" => Ok(KnownState::Disabled),
            other => Err(UnknownState(other.to_owned())),
        }
    }
}

/// The epoch in UTC, used as the default child timestamp.
pub fn at_zero() -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH
}
