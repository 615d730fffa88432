//! Derived values shared by parents and children.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use common::KnownState;

/// The earliest of the children's timestamps, if there are children.
pub fn earliest_at(ats: impl IntoIterator<Item = DateTime<Utc>>) -> Option<DateTime<Utc>> {
    ats.into_iter().min()
}

/// Side values a child currently contributes.
///
/// A child that is not relevant contributes nothing. Otherwise its own side
/// values win over the defaults whenever it has any.
pub fn child_current_side_values(
    state: KnownState,
    side_values: &BTreeSet<String>,
    default_side_values: &BTreeSet<String>,
) -> BTreeSet<String> {
    if !state.is_relevant() {
        BTreeSet::new()
    } else if !side_values.is_empty() {
        side_values.clone()
    } else {
        default_side_values.clone()
    }
}

/// Side values a parent currently exposes.
///
/// The parent's own values win when present. Otherwise the result is the
/// intersection of every child contribution that is not empty.
pub fn parent_current_side_values(
    own: &BTreeSet<String>,
    children: impl IntoIterator<Item = BTreeSet<String>>,
) -> BTreeSet<String> {
    if !own.is_empty() {
        return own.clone();
    }
    children
        .into_iter()
        .filter(|values| !values.is_empty())
        .reduce(|shared, values| shared.intersection(&values).cloned().collect())
        .unwrap_or_default()
}
