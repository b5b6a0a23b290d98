// Copyright 2024 Eval Graph project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use fnv::FnvHashSet as HashSet;
use smallvec::SmallVec;

use crate::node::Node;
use crate::store::Key;

type Group<N> = SmallVec<[Key<N>; 2]>;

///
/// An ordered list of dependency keys partitioned into groups.
///
/// The list preserves both the order in which a Builder requested its dependencies and the
/// boundaries of each batch request: members of a group were requested together, and may be
/// change-checked together (in parallel) when the owning entry is dirty.
///
/// Equality is grouped and ordered: two lists are equal only if they contain the same keys in
/// the same order with the same group boundaries.
///
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct GroupedDeps<N: Node> {
    groups: Vec<Group<N>>,
}

impl<N: Node> GroupedDeps<N> {
    pub fn new() -> GroupedDeps<N> {
        GroupedDeps { groups: Vec::new() }
    }

    ///
    /// Appends a single key as its own group.
    ///
    pub fn push_single(&mut self, key: Key<N>) {
        let mut group = Group::new();
        group.push(key);
        self.groups.push(group);
    }

    ///
    /// Appends a batch of keys as one group. An empty batch appends nothing.
    ///
    pub fn push_group<I: IntoIterator<Item = Key<N>>>(&mut self, keys: I) {
        let group: Group<N> = keys.into_iter().collect();
        if !group.is_empty() {
            self.groups.push(group);
        }
    }

    ///
    /// Appends all of the given list's groups, preserving their boundaries.
    ///
    pub fn extend_from(&mut self, other: &GroupedDeps<N>) {
        self.groups.extend(other.groups.iter().cloned());
    }

    pub fn group(&self, index: usize) -> Option<&[Key<N>]> {
        self.groups.get(index).map(|g| g.as_slice())
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    ///
    /// Iterates over groups in insertion order.
    ///
    pub fn groups(&self) -> impl Iterator<Item = &[Key<N>]> {
        self.groups.iter().map(|g| g.as_slice())
    }

    ///
    /// Iterates over all members in insertion order, ignoring group boundaries.
    ///
    pub fn iter(&self) -> impl Iterator<Item = &Key<N>> {
        self.groups.iter().flatten()
    }

    ///
    /// The total number of members across all groups.
    ///
    pub fn len(&self) -> usize {
        self.groups.iter().map(|g| g.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn to_set(&self) -> HashSet<Key<N>> {
        self.iter().cloned().collect()
    }

    ///
    /// Removes every member of the given set. Groups emptied by the removal are dropped;
    /// the boundaries of all surviving groups are preserved.
    ///
    pub fn remove_all(&mut self, to_remove: &HashSet<Key<N>>) {
        for group in &mut self.groups {
            group.retain(|key| !to_remove.contains(key));
        }
        self.groups.retain(|group| !group.is_empty());
    }
}

impl<N: Node> Default for GroupedDeps<N> {
    fn default() -> GroupedDeps<N> {
        GroupedDeps::new()
    }
}
