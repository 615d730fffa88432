//! Relationship sets that remember their baseline.
//!
//! A [`TrackedSortedSet`] holds the related objects of one relation, ordered
//! by natural id. It keeps the membership it was loaded with (`initial`) next
//! to the live membership (`current`), so a save can work out which members
//! joined, left, or stayed. Every add and remove runs a hook against the
//! owner of the relation, which is how the other side of a two-sided
//! relationship is kept in step.

use std::collections::BTreeMap;

use common::NaturalId;

use crate::{DomainError, Error, Result};

/// Anything that can be a member of a tracked set.
pub trait Keyed {
    fn key(&self) -> &NaturalId;
}

impl Keyed for NaturalId {
    fn key(&self) -> &NaturalId {
        self
    }
}

/// How many members a relation may hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Many,
    OptionalOne,
}

/// Runs after a member is added or removed, with exclusive access to the
/// owner of the relation.
pub type Hook<T, C> = fn(&T, &mut C) -> Result<()>;

pub struct TrackedSortedSet<T, C> {
    arity: Arity,
    initial: BTreeMap<NaturalId, T>,
    current: BTreeMap<NaturalId, T>,
    add_one: Hook<T, C>,
    remove_one: Hook<T, C>,
}

impl<T: Keyed + Clone, C> TrackedSortedSet<T, C> {
    pub fn new(
        arity: Arity,
        initial: impl IntoIterator<Item = T>,
        add_one: Hook<T, C>,
        remove_one: Hook<T, C>,
    ) -> Self {
        let initial: BTreeMap<NaturalId, T> = initial
            .into_iter()
            .map(|element| (element.key().clone(), element))
            .collect();
        Self {
            arity,
            current: initial.clone(),
            initial,
            add_one,
            remove_one,
        }
    }

    pub fn many(
        initial: impl IntoIterator<Item = T>,
        add_one: Hook<T, C>,
        remove_one: Hook<T, C>,
    ) -> Self {
        Self::new(Arity::Many, initial, add_one, remove_one)
    }

    pub fn optional_one(initial: Option<T>, add_one: Hook<T, C>, remove_one: Hook<T, C>) -> Self {
        Self::new(Arity::OptionalOne, initial, add_one, remove_one)
    }

    pub fn arity(&self) -> Arity {
        self.arity
    }

    pub fn len(&self) -> usize {
        self.current.len()
    }

    pub fn is_empty(&self) -> bool {
        self.current.is_empty()
    }

    pub fn contains(&self, element: &T) -> bool {
        self.current.contains_key(element.key())
    }

    pub fn get(&self, key: &NaturalId) -> Option<&T> {
        self.current.get(key)
    }

    /// Members in natural-id order.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.current.values()
    }

    /// The lowest member, which for an optional-one set is its only member.
    pub fn first(&self) -> Option<&T> {
        self.current.values().next()
    }

    pub fn add(&mut self, element: T, owner: &mut C) -> Result<()> {
        let key = element.key().clone();
        if self.current.contains_key(&key) {
            return Err(DomainError::AlreadyPresent(key).into());
        }
        self.current.insert(key.clone(), element.clone());
        if let Err(e) = (self.add_one)(&element, owner) {
            self.current.remove(&key);
            return Err(e);
        }
        self.check_arity()
    }

    pub fn remove(&mut self, element: &T, owner: &mut C) -> Result<()> {
        let key = element.key();
        let Some(removed) = self.current.remove(key) else {
            return Err(DomainError::NotPresent(key.clone()).into());
        };
        if let Err(e) = (self.remove_one)(&removed, owner) {
            self.current.insert(key.clone(), removed);
            return Err(e);
        }
        Ok(())
    }

    /// Removes every member `keep` rejects, running the remove hook for each.
    pub fn retain(&mut self, owner: &mut C, mut keep: impl FnMut(&T) -> bool) -> Result<()> {
        let doomed: Vec<NaturalId> = self
            .current
            .iter()
            .filter(|(_, element)| !keep(*element))
            .map(|(key, _)| key.clone())
            .collect();
        for key in doomed {
            if let Some(removed) = self.current.remove(&key)
                && let Err(e) = (self.remove_one)(&removed, owner)
            {
                self.current.insert(key, removed);
                return Err(e);
            }
        }
        Ok(())
    }

    pub fn clear(&mut self, owner: &mut C) -> Result<()> {
        self.retain(owner, |_| false)
    }

    /// Makes the live membership the new baseline.
    pub fn reset(&mut self) {
        self.initial = self.current.clone();
    }

    /// Whether membership differs from the baseline.
    pub fn is_modified(&self) -> bool {
        !self.initial.keys().eq(self.current.keys())
    }

    /// Applies `predicate` to every member that joined since the baseline.
    pub fn added(&self, predicate: impl FnMut(&T) -> bool) -> bool {
        flag_all(
            self.current
                .iter()
                .filter(|(key, _)| !self.initial.contains_key(*key))
                .map(|(_, element)| element),
            predicate,
        )
    }

    /// Applies `predicate` to every member that left since the baseline.
    pub fn removed(&self, predicate: impl FnMut(&T) -> bool) -> bool {
        flag_all(
            self.initial
                .iter()
                .filter(|(key, _)| !self.current.contains_key(*key))
                .map(|(_, element)| element),
            predicate,
        )
    }

    /// Applies `predicate` to every member present both in the baseline and now.
    pub fn changed(&self, predicate: impl FnMut(&T) -> bool) -> bool {
        flag_all(
            self.current
                .iter()
                .filter(|(key, _)| self.initial.contains_key(*key))
                .map(|(_, element)| element),
            predicate,
        )
    }

    fn check_arity(&self) -> Result<()> {
        if self.arity == Arity::OptionalOne && self.current.len() > 1 {
            let keys: Vec<&str> = self.current.keys().map(NaturalId::as_str).collect();
            return Err(Error::Bug(format!(
                "optional-one relation holds {} members: {}",
                keys.len(),
                keys.join(", ")
            )));
        }
        Ok(())
    }
}

// Every element sees the predicate; callers rely on it for side effects.
fn flag_all<'a, T: 'a>(
    elements: impl Iterator<Item = &'a T>,
    mut predicate: impl FnMut(&T) -> bool,
) -> bool {
    elements.fold(false, |flagged, element| predicate(element) | flagged)
}

impl<T: Clone, C> Clone for TrackedSortedSet<T, C> {
    fn clone(&self) -> Self {
        Self {
            arity: self.arity,
            initial: self.initial.clone(),
            current: self.current.clone(),
            add_one: self.add_one,
            remove_one: self.remove_one,
        }
    }
}

impl<T: PartialEq, C> PartialEq for TrackedSortedSet<T, C> {
    fn eq(&self, other: &Self) -> bool {
        self.arity == other.arity && self.initial == other.initial && self.current == other.current
    }
}

impl<T: std::fmt::Debug, C> std::fmt::Debug for TrackedSortedSet<T, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackedSortedSet")
            .field("arity", &self.arity)
            .field("initial", &self.initial.keys().collect::<Vec<_>>())
            .field("current", &self.current.values().collect::<Vec<_>>())
            .finish()
    }
}

/// Single-value view of an optional-one relation.
pub struct OptionalOne<'a, T, C> {
    set: &'a mut TrackedSortedSet<T, C>,
    owner: &'a mut C,
}

impl<'a, T: Keyed + Clone, C> OptionalOne<'a, T, C> {
    pub fn new(set: &'a mut TrackedSortedSet<T, C>, owner: &'a mut C) -> Self {
        Self { set, owner }
    }

    pub fn get(&self) -> Option<&T> {
        self.set.first()
    }

    /// Replaces the member: the current one is removed, then `value` added.
    pub fn set(&mut self, value: Option<T>) -> Result<()> {
        self.set.clear(self.owner)?;
        match value {
            Some(value) => self.set.add(value, self.owner),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Log = Vec<String>;

    fn log_add(element: &NaturalId, log: &mut Log) -> Result<()> {
        log.push(format!("+{element}"));
        Ok(())
    }

    fn log_remove(element: &NaturalId, log: &mut Log) -> Result<()> {
        log.push(format!("-{element}"));
        Ok(())
    }

    fn refuse(element: &NaturalId, _log: &mut Log) -> Result<()> {
        Err(DomainError::AlreadyAssigned {
            child: element.clone(),
            parent: NaturalId::from("elsewhere"),
        }
        .into())
    }

    fn nid(value: &str) -> NaturalId {
        NaturalId::from(value)
    }

    fn many(initial: &[&str]) -> TrackedSortedSet<NaturalId, Log> {
        TrackedSortedSet::many(initial.iter().map(|s| nid(s)), log_add, log_remove)
    }

    fn keys(set: &TrackedSortedSet<NaturalId, Log>) -> Vec<&str> {
        set.iter().map(NaturalId::as_str).collect()
    }

    #[test]
    fn add_inserts_in_order_and_runs_hook() {
        let mut log = Log::new();
        let mut set = many(&["b"]);

        set.add(nid("c"), &mut log).unwrap();
        set.add(nid("a"), &mut log).unwrap();

        assert_eq!(keys(&set), vec!["a", "b", "c"]);
        assert_eq!(log, vec!["+c", "+a"]);
    }

    #[test]
    fn adding_a_present_element_fails_without_hook() {
        let mut log = Log::new();
        let mut set = many(&["abc"]);

        let err = set.add(nid("abc"), &mut log).unwrap_err();

        assert_eq!(err.domain(), Some(&DomainError::AlreadyPresent(nid("abc"))));
        assert!(log.is_empty());
    }

    #[test]
    fn removing_an_absent_element_fails() {
        let mut log = Log::new();
        let mut set = many(&[]);

        let err = set.remove(&nid("abc"), &mut log).unwrap_err();

        assert_eq!(err.domain(), Some(&DomainError::NotPresent(nid("abc"))));
        assert!(log.is_empty());
    }

    #[test]
    fn remove_runs_hook() {
        let mut log = Log::new();
        let mut set = many(&["abc"]);

        set.remove(&nid("abc"), &mut log).unwrap();

        assert!(set.is_empty());
        assert_eq!(log, vec!["-abc"]);
    }

    #[test]
    fn retain_runs_hook_for_each_removal() {
        let mut log = Log::new();
        let mut set = many(&["a", "b", "c"]);

        set.retain(&mut log, |e| e.as_str() == "b").unwrap();

        assert_eq!(keys(&set), vec!["b"]);
        assert_eq!(log, vec!["-a", "-c"]);
    }

    #[test]
    fn failing_add_hook_undoes_insertion() {
        let mut log = Log::new();
        let mut set: TrackedSortedSet<NaturalId, Log> =
            TrackedSortedSet::many([], refuse, log_remove);

        let err = set.add(nid("c"), &mut log).unwrap_err();

        assert!(matches!(
            err.domain(),
            Some(DomainError::AlreadyAssigned { .. })
        ));
        assert!(set.is_empty());
    }

    #[test]
    fn failing_remove_hook_restores_member() {
        let mut log = Log::new();
        let mut set: TrackedSortedSet<NaturalId, Log> =
            TrackedSortedSet::many([nid("c")], log_add, refuse);

        assert!(set.remove(&nid("c"), &mut log).is_err());
        assert!(set.contains(&nid("c")));
    }

    #[test]
    fn optional_one_rejects_a_second_member_as_a_bug() {
        let mut log = Log::new();
        let mut set: TrackedSortedSet<NaturalId, Log> =
            TrackedSortedSet::optional_one(Some(nid("one")), log_add, log_remove);

        let err = set.add(nid("two"), &mut log).unwrap_err();

        assert!(matches!(err, Error::Bug(_)));
    }

    #[test]
    fn optional_one_accessor_replaces_member() {
        let mut log = Log::new();
        let mut set: TrackedSortedSet<NaturalId, Log> =
            TrackedSortedSet::optional_one(Some(nid("one")), log_add, log_remove);

        let mut one = OptionalOne::new(&mut set, &mut log);
        assert_eq!(one.get(), Some(&nid("one")));
        one.set(Some(nid("two"))).unwrap();
        assert_eq!(one.get(), Some(&nid("two")));
        one.set(None).unwrap();
        assert_eq!(one.get(), None);

        assert_eq!(log, vec!["-one", "+two", "-two"]);
    }

    #[test]
    fn diff_predicates_see_their_subsets() {
        let mut log = Log::new();
        let mut set = many(&["kept", "gone"]);
        set.remove(&nid("gone"), &mut log).unwrap();
        set.add(nid("new"), &mut log).unwrap();

        let mut seen = Vec::new();
        assert!(set.added(|e| {
            seen.push(format!("added {e}"));
            true
        }));
        assert!(set.removed(|e| {
            seen.push(format!("removed {e}"));
            true
        }));
        assert!(set.changed(|e| {
            seen.push(format!("changed {e}"));
            true
        }));

        assert_eq!(seen, vec!["added new", "removed gone", "changed kept"]);
    }

    #[test]
    fn changed_reports_only_flagged_members_but_visits_all() {
        let set = many(&["ABC", "DEF"]);

        let mut visited = Vec::new();
        let flagged = set.changed(|e| {
            visited.push(e.as_str().to_owned());
            e.as_str() == "ABC"
        });

        assert!(flagged);
        assert_eq!(visited, vec!["ABC", "DEF"]);
        assert!(!set.changed(|_| false));
    }

    #[test]
    fn unmodified_set_has_empty_added_and_removed() {
        let set = many(&["abc"]);

        assert!(!set.added(|_| true));
        assert!(!set.removed(|_| true));
        assert!(set.changed(|_| true));
        assert!(!set.is_modified());
    }

    #[test]
    fn reset_rebaselines() {
        let mut log = Log::new();
        let mut set = many(&["a"]);
        set.add(nid("b"), &mut log).unwrap();
        assert!(set.is_modified());

        set.reset();

        assert!(!set.is_modified());
        assert!(!set.added(|_| true));
        assert!(set.changed(|_| true));
    }

    #[test]
    fn equality_covers_baseline_and_membership() {
        let mut log = Log::new();
        let mut left = many(&["a"]);
        let right = many(&["a"]);
        assert_eq!(left, right);

        left.add(nid("b"), &mut log).unwrap();
        assert_ne!(left, right);
    }
}
