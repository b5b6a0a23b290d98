// Copyright 2024 Eval Graph project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use std::mem;

use fnv::FnvHashSet as HashSet;
use parking_lot::Mutex;

use crate::deps::GroupedDeps;
use crate::event::EventSet;
use crate::node::{ErrorInfo, Node, Version};
use crate::store::Key;
use crate::test_trace_log;

///
/// The result of registering a reverse-dependency edge on an entry.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum DependencyState {
    /// The entry transitioned to Evaluating for this caller: the caller must enqueue it.
    /// Returned exactly once per Evaluating cycle.
    NeedsScheduling,
    /// The entry is already Evaluating; the caller will be signaled when it completes.
    AddedDep,
    /// The entry is Done; the caller should signal itself with the entry's version.
    Done,
}

///
/// The dirty lifecycle of a previously completed entry.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum DirtyPhase {
    /// Dependencies are being re-checked group by group.
    CheckDeps,
    /// All dependency groups were checked and none changed: the previous value is reusable.
    VerifiedClean,
    /// A dependency changed (or the entry was invalidated as changed): the builder must run.
    Rebuilding,
}

///
/// Snapshot of an entry's previous build, captured when it is marked dirty and consumed either
/// by `mark_clean` (restoring the previous result) or at commit (for change comparison and
/// stale-edge pruning).
///
#[derive(Debug)]
struct DirtyState<N: Node> {
    phase: DirtyPhase,
    /// Dirtied with `is_changed = true`: the rebuild is unconditional and the commit never
    /// preserves the previous version, even for an equal result.
    forced: bool,
    last_deps: GroupedDeps<N>,
    last_value: Option<N::Value>,
    last_error: Option<ErrorInfo<N>>,
    last_events: EventSet,
    next_group: usize,
    exhausted: bool,
}

impl<N: Node> DirtyState<N> {
    fn reset(&mut self) {
        self.phase = if self.forced {
            DirtyPhase::Rebuilding
        } else {
            DirtyPhase::CheckDeps
        };
        self.next_group = 0;
        self.exhausted = false;
    }
}

///
/// The temporary state of an Evaluating entry.
///
#[derive(Debug)]
struct Building<N: Node> {
    /// Latch ensuring NeedsScheduling is handed out once per Evaluating cycle.
    scheduled: bool,
    deps: GroupedDeps<N>,
    dep_set: HashSet<Key<N>>,
    signaled: usize,
    /// Parents registered during this cycle: the only parents signaled at commit.
    registered_parents: HashSet<Key<N>>,
    dirty: Option<DirtyState<N>>,
}

impl<N: Node> Building<N> {
    fn new(dirty: Option<DirtyState<N>>) -> Building<N> {
        Building {
            scheduled: false,
            deps: GroupedDeps::new(),
            dep_set: HashSet::default(),
            signaled: 0,
            registered_parents: HashSet::default(),
            dirty,
        }
    }

    fn ready(&self) -> bool {
        self.signaled == self.deps.len()
    }
}

///
/// The persistent state of a Done entry.
///
#[derive(Debug)]
struct Completed<N: Node> {
    value: Option<N::Value>,
    error: Option<ErrorInfo<N>>,
    deps: GroupedDeps<N>,
    evaluated_at: Version,
    events: EventSet,
}

#[derive(Debug)]
enum EntryState<N: Node> {
    /// Never requested: no reverse dep has been registered yet.
    Fresh,
    /// Being evaluated (or dirty and awaiting scheduling). Carries no committed value.
    Evaluating(Building<N>),
    /// Completed with a value and/or an error.
    Done(Completed<N>),
}

struct EntryInner<N: Node> {
    state: EntryState<N>,
    /// Keys of entries whose direct deps contain this one. Persisted across dirtying; used for
    /// dirty propagation and consistency pruning, but only parents registered during the
    /// current Evaluating cycle are signaled at commit.
    reverse_deps: HashSet<Key<N>>,
    /// The graph version at which this entry's value last changed.
    version: Version,
}

///
/// The commit outcome handed back to the driver: the parents to signal with the committed
/// version, and the previous-build children no longer depended on (whose reverse-dep edge to
/// this entry must be removed).
///
pub(crate) struct Commit<N: Node> {
    pub(crate) parents: Vec<Key<N>>,
    pub(crate) dropped_children: Vec<Key<N>>,
    pub(crate) version: Version,
}

///
/// The per-key unit of graph state. All operations are synchronized by the entry's own mutex;
/// no operation takes another entry's lock.
///
pub struct Entry<N: Node> {
    node: Key<N>,
    inner: Mutex<EntryInner<N>>,
}

impl<N: Node> Entry<N> {
    pub(crate) fn new(node: Key<N>) -> Entry<N> {
        Entry {
            node,
            inner: Mutex::new(EntryInner {
                state: EntryState::Fresh,
                reverse_deps: HashSet::default(),
                version: Version::initial(),
            }),
        }
    }

    ///
    /// The graph version at which this entry's value last changed.
    ///
    pub fn version(&self) -> Version {
        self.inner.lock().version
    }

    pub fn is_done(&self) -> bool {
        matches!(self.inner.lock().state, EntryState::Done(..))
    }

    ///
    /// If the entry is Done, returns a clone of its value.
    ///
    pub fn peek(&self) -> Option<N::Value> {
        match self.inner.lock().state {
            EntryState::Done(ref completed) => completed.value.clone(),
            _ => None,
        }
    }

    pub fn peek_error(&self) -> Option<ErrorInfo<N>> {
        match self.inner.lock().state {
            EntryState::Done(ref completed) => completed.error.clone(),
            _ => None,
        }
    }

    pub fn events(&self) -> Option<EventSet> {
        match self.inner.lock().state {
            EntryState::Done(ref completed) => Some(completed.events.clone()),
            _ => None,
        }
    }

    ///
    /// The graph version of this entry's most recent successful evaluation (which may be
    /// newer than `version`, if re-evaluation reused the previous value).
    ///
    pub fn evaluated_at(&self) -> Option<Version> {
        match self.inner.lock().state {
            EntryState::Done(ref completed) => Some(completed.evaluated_at),
            _ => None,
        }
    }

    pub(crate) fn has_transient_error(&self) -> bool {
        match self.inner.lock().state {
            EntryState::Done(ref completed) => completed
                .error
                .as_ref()
                .map(|e| e.is_transient())
                .unwrap_or(false),
            _ => false,
        }
    }

    ///
    /// The current direct deps: temporary deps for an Evaluating entry, final deps for a Done
    /// entry.
    ///
    pub(crate) fn current_deps(&self) -> Vec<Key<N>> {
        match self.inner.lock().state {
            EntryState::Evaluating(ref building) => building.deps.iter().cloned().collect(),
            EntryState::Done(ref completed) => completed.deps.iter().cloned().collect(),
            EntryState::Fresh => Vec::new(),
        }
    }

    ///
    /// If the entry is Done, returns a clone of its final (immutable) grouped dep list.
    ///
    pub fn final_deps(&self) -> Option<GroupedDeps<N>> {
        match self.inner.lock().state {
            EntryState::Done(ref completed) => Some(completed.deps.clone()),
            _ => None,
        }
    }

    ///
    /// The set of deps registered so far in the current Evaluating cycle, used to seed a
    /// builder environment on (re-)invocation.
    ///
    pub(crate) fn registered_dep_set(&self) -> HashSet<Key<N>> {
        match self.inner.lock().state {
            EntryState::Evaluating(ref building) => building.dep_set.clone(),
            _ => HashSet::default(),
        }
    }

    pub(crate) fn reverse_deps_snapshot(&self) -> Vec<Key<N>> {
        self.inner.lock().reverse_deps.iter().cloned().collect()
    }

    pub(crate) fn dirty_phase(&self) -> Option<DirtyPhase> {
        match self.inner.lock().state {
            EntryState::Evaluating(ref building) => building.dirty.as_ref().map(|d| d.phase),
            _ => None,
        }
    }

    ///
    /// Registers a reverse-dep edge from the given parent (none for an externally requested
    /// root) and reports how the caller must proceed. Idempotent per parent and cycle; the
    /// Fresh-to-Evaluating transition (and the equivalent first registration on a dirtied
    /// entry) reports NeedsScheduling to exactly one caller, which must enqueue this entry.
    ///
    pub(crate) fn add_reverse_dep_and_check_if_done(
        &self,
        parent: Option<&Key<N>>,
    ) -> DependencyState {
        let mut inner = self.inner.lock();
        let EntryInner {
            state,
            reverse_deps,
            ..
        } = &mut *inner;
        if let Some(parent) = parent {
            reverse_deps.insert(parent.clone());
        }
        match state {
            EntryState::Done(..) => DependencyState::Done,
            EntryState::Fresh => {
                test_trace_log!("Starting {}", self.node);
                let mut building = Building::new(None);
                building.scheduled = true;
                if let Some(parent) = parent {
                    building.registered_parents.insert(parent.clone());
                }
                *state = EntryState::Evaluating(building);
                DependencyState::NeedsScheduling
            }
            EntryState::Evaluating(building) => {
                if let Some(parent) = parent {
                    building.registered_parents.insert(parent.clone());
                }
                if building.scheduled {
                    DependencyState::AddedDep
                } else {
                    building.scheduled = true;
                    test_trace_log!("Scheduling dirty {}", self.node);
                    DependencyState::NeedsScheduling
                }
            }
        }
    }

    ///
    /// Records that one direct dep completed at the given version, and returns true if this
    /// entry became ready (all registered deps have signaled).
    ///
    /// While checking deps, a dep version newer than this entry's own version forces a
    /// rebuild; once the final dirty group has been checked with no change, the entry is
    /// verified clean.
    ///
    pub(crate) fn signal_dep(&self, dep_version: Version) -> bool {
        let mut inner = self.inner.lock();
        let version = inner.version;
        match inner.state {
            EntryState::Evaluating(ref mut building) => {
                building.signaled += 1;
                assert!(
                    building.signaled <= building.deps.len(),
                    "Entry {} signaled more deps than it has registered.",
                    self.node,
                );
                let ready = building.ready();
                if let Some(dirty) = building.dirty.as_mut() {
                    if dirty.phase == DirtyPhase::CheckDeps {
                        if dep_version > version {
                            test_trace_log!(
                                "Dep changed ({} > {}): will rebuild {}",
                                dep_version,
                                version,
                                self.node,
                            );
                            dirty.phase = DirtyPhase::Rebuilding;
                        } else if ready && dirty.exhausted {
                            dirty.phase = DirtyPhase::VerifiedClean;
                        }
                    }
                }
                ready
            }
            _ => panic!(
                "Entry {} was signaled while not evaluating: this indicates a scheduling bug.",
                self.node,
            ),
        }
    }

    ///
    /// Yields the next unchecked group of previous-build deps, advancing the cursor. Yields
    /// None once all groups have been handed out; a None with zero groups promotes the entry
    /// straight to VerifiedClean (there is nothing to check).
    ///
    pub(crate) fn next_dirty_dep_group(&self) -> Option<Vec<Key<N>>> {
        let mut inner = self.inner.lock();
        let building = match inner.state {
            EntryState::Evaluating(ref mut building) => building,
            _ => panic!("Requested a dirty dep group from {} while not evaluating.", self.node),
        };
        let ready = building.ready();
        let dirty = building
            .dirty
            .as_mut()
            .expect("next_dirty_dep_group called on a non-dirty entry.");
        debug_assert_eq!(dirty.phase, DirtyPhase::CheckDeps);
        if dirty.next_group < dirty.last_deps.group_count() {
            let group = dirty
                .last_deps
                .group(dirty.next_group)
                .map(|g| g.to_vec())
                .unwrap_or_default();
            dirty.next_group += 1;
            if dirty.next_group == dirty.last_deps.group_count() {
                // The iterator is cleared before the group's deps signal, so that the final
                // signal_dep can conclude VerifiedClean.
                dirty.exhausted = true;
            }
            Some(group)
        } else {
            dirty.exhausted = true;
            if ready {
                dirty.phase = DirtyPhase::VerifiedClean;
            }
            None
        }
    }

    ///
    /// Appends newly discovered deps, preserving their group boundaries. Must be called
    /// before the corresponding edges are registered on the children, so that readiness
    /// accounting includes every dep that may signal.
    ///
    pub(crate) fn add_temporary_deps(&self, new_deps: &GroupedDeps<N>) {
        let mut inner = self.inner.lock();
        match inner.state {
            EntryState::Evaluating(ref mut building) => {
                for key in new_deps.iter() {
                    let inserted = building.dep_set.insert(key.clone());
                    debug_assert!(inserted, "Dep {key} was registered twice.");
                }
                building.deps.extend_from(new_deps);
            }
            _ => panic!("Added temporary deps to {} while not evaluating.", self.node),
        }
    }

    pub(crate) fn add_temporary_dep_group(&self, group: Vec<Key<N>>) {
        let mut deps = GroupedDeps::new();
        deps.push_group(group);
        self.add_temporary_deps(&deps);
    }

    ///
    /// Commits the entry. If the previous build's snapshot exists, was not a forced rebuild,
    /// and both the value and the grouped dep structure are unchanged, the entry's version is
    /// preserved so that the change does not propagate to parents.
    ///
    pub(crate) fn set_value(
        &self,
        value: Option<N::Value>,
        error: Option<ErrorInfo<N>>,
        events: EventSet,
        graph_version: Version,
    ) -> Commit<N> {
        let mut inner = self.inner.lock();
        let building = match mem::replace(&mut inner.state, EntryState::Fresh) {
            EntryState::Evaluating(building) => building,
            _ => panic!("Committed {} while not evaluating.", self.node),
        };
        debug_assert!(building.ready());

        let mut new_version = graph_version;
        let mut dropped_children = Vec::new();
        if let Some(dirty) = building.dirty {
            let unchanged = !dirty.forced
                && error.is_none()
                && dirty.last_error.is_none()
                && value == dirty.last_value
                && building.deps == dirty.last_deps;
            if unchanged {
                new_version = inner.version;
            }
            dropped_children = dirty
                .last_deps
                .iter()
                .filter(|key| !building.dep_set.contains(key))
                .cloned()
                .collect();
        }

        test_trace_log!(
            "Committing {} at {} (value: {}, error: {})",
            self.node,
            new_version,
            value.is_some(),
            error.is_some(),
        );

        inner.version = new_version;
        inner.state = EntryState::Done(Completed {
            value,
            error,
            deps: building.deps,
            evaluated_at: graph_version,
            events,
        });
        Commit {
            parents: building.registered_parents.into_iter().collect(),
            dropped_children,
            version: new_version,
        }
    }

    ///
    /// Finalizes a VerifiedClean dirty check: the previous value, error, deps and events are
    /// restored verbatim and the version is left unchanged.
    ///
    pub(crate) fn mark_clean(&self, graph_version: Version) -> Commit<N> {
        let mut inner = self.inner.lock();
        let building = match mem::replace(&mut inner.state, EntryState::Fresh) {
            EntryState::Evaluating(building) => building,
            _ => panic!("Marked {} clean while not evaluating.", self.node),
        };
        let dirty = building
            .dirty
            .expect("mark_clean called on a non-dirty entry.");
        debug_assert_eq!(dirty.phase, DirtyPhase::VerifiedClean);

        test_trace_log!("Verified clean: {} at {}", self.node, inner.version);

        let version = inner.version;
        inner.state = EntryState::Done(Completed {
            value: dirty.last_value,
            error: dirty.last_error,
            deps: dirty.last_deps,
            evaluated_at: graph_version,
            events: dirty.last_events,
        });
        Commit {
            parents: building.registered_parents.into_iter().collect(),
            dropped_children: Vec::new(),
            version,
        }
    }

    ///
    /// Dirties a Done entry: captures the previous build as a snapshot and installs a fresh
    /// building context, to be scheduled on its next registration. Returns true if the entry
    /// was newly dirtied (false for entries already dirty or never completed, which debounces
    /// transitive re-dirtying).
    ///
    pub(crate) fn mark_dirty(&self, is_changed: bool) -> bool {
        let mut inner = self.inner.lock();
        let state = &mut inner.state;
        if matches!(state, EntryState::Done(..)) {
            let completed = match mem::replace(state, EntryState::Fresh) {
                EntryState::Done(completed) => completed,
                _ => unreachable!(),
            };
            test_trace_log!("Dirtying {} (changed: {})", self.node, is_changed);
            *state = EntryState::Evaluating(Building::new(Some(DirtyState {
                phase: if is_changed {
                    DirtyPhase::Rebuilding
                } else {
                    DirtyPhase::CheckDeps
                },
                forced: is_changed,
                last_deps: completed.deps,
                last_value: completed.value,
                last_error: completed.error,
                last_events: completed.events,
                next_group: 0,
                exhausted: false,
            })));
            return true;
        }
        if let EntryState::Evaluating(building) = state {
            // Already dirty: upgrade an unscheduled check to a forced rebuild if needed.
            if is_changed && !building.scheduled {
                if let Some(dirty) = building.dirty.as_mut() {
                    dirty.phase = DirtyPhase::Rebuilding;
                    dirty.forced = true;
                }
            }
        }
        false
    }

    pub(crate) fn remove_reverse_dep(&self, parent: &Key<N>) {
        let mut inner = self.inner.lock();
        inner.reverse_deps.remove(parent);
        if let EntryState::Evaluating(ref mut building) = inner.state {
            building.registered_parents.remove(parent);
        }
    }

    ///
    /// Prunes unfinished deps from an Evaluating entry (they must not have signaled), and
    /// returns whether the entry is ready afterwards.
    ///
    pub(crate) fn remove_unfinished_deps(&self, to_remove: &HashSet<Key<N>>) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            EntryState::Evaluating(ref mut building) => {
                building.deps.remove_all(to_remove);
                building.dep_set.retain(|key| !to_remove.contains(key));
                assert!(
                    building.signaled <= building.deps.len(),
                    "Removed a signaled dep from {}.",
                    self.node,
                );
                building.ready()
            }
            _ => panic!("Removed deps from {} while not evaluating.", self.node),
        }
    }

    ///
    /// Abandons an interrupted Evaluating cycle. Returns the temporary dep keys (whose
    /// reverse edges the caller must deregister) and whether the entry should be removed from
    /// the graph entirely (it had never completed).
    ///
    pub(crate) fn abandon(&self) -> (Vec<Key<N>>, bool) {
        let mut inner = self.inner.lock();
        match inner.state {
            EntryState::Evaluating(ref mut building) => {
                let children = building.deps.iter().cloned().collect();
                if let Some(dirty) = building.dirty.as_mut() {
                    // A previous result exists: reset to an unscheduled dirty state so the
                    // next evaluation re-checks from the first group.
                    dirty.reset();
                    building.scheduled = false;
                    building.deps = GroupedDeps::new();
                    building.dep_set.clear();
                    building.signaled = 0;
                    building.registered_parents.clear();
                    (children, false)
                } else {
                    (children, true)
                }
            }
            _ => (Vec::new(), false),
        }
    }
}
