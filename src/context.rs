// Copyright 2024 Eval Graph project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use fnv::{FnvHashMap as HashMap, FnvHashSet as HashSet};

use crate::deps::GroupedDeps;
use crate::event::Event;
use crate::node::{BuildError, ErrorInfo, Node};
use crate::store::{Graph, Key};

///
/// The per-invocation environment through which a Builder requests dependency values and emits
/// events.
///
/// Dependencies registered during an earlier invocation of the same build cycle are served
/// directly from the graph (they are guaranteed complete before the builder is re-invoked).
/// Newly requested dependencies are recorded (preserving single/group boundaries) and
/// registered by the driver after the builder returns; if any of them is not yet complete, the
/// builder is expected to return `Ok(None)` and will be resumed later.
///
pub struct Context<'a, N: Node> {
    graph: &'a Graph<N>,
    node: Key<N>,
    registered: HashSet<Key<N>>,
    new_deps: GroupedDeps<N>,
    new_dep_set: HashSet<Key<N>>,
    pending: bool,
    child_errors: Vec<ErrorInfo<N>>,
    events: Vec<Event>,
    /// During error bubbling, deps present here are treated as already failed without
    /// consulting (or mutating) the graph.
    bubbled_errors: Option<&'a HashMap<Key<N>, ErrorInfo<N>>>,
}

///
/// What a builder invocation left behind, consumed by the driver.
///
pub(crate) struct ContextOutcome<N: Node> {
    pub(crate) new_deps: GroupedDeps<N>,
    pub(crate) pending: bool,
    pub(crate) child_errors: Vec<ErrorInfo<N>>,
    pub(crate) events: Vec<Event>,
}

impl<'a, N: Node> Context<'a, N> {
    pub(crate) fn new(
        graph: &'a Graph<N>,
        node: Key<N>,
        registered: HashSet<Key<N>>,
        bubbled_errors: Option<&'a HashMap<Key<N>, ErrorInfo<N>>>,
    ) -> Context<'a, N> {
        Context {
            graph,
            node,
            registered,
            new_deps: GroupedDeps::new(),
            new_dep_set: HashSet::default(),
            pending: false,
            child_errors: Vec::new(),
            events: Vec::new(),
            bubbled_errors,
        }
    }

    ///
    /// The node being built.
    ///
    pub fn node(&self) -> &N {
        self.node.node()
    }

    ///
    /// Requests a single dependency, returning its value if it has completed with one.
    ///
    /// Returns None when the dependency has not completed yet (see `deps_missing`), or when it
    /// completed in error with no value; in the latter case the error is recorded and
    /// aggregated into this node's own error if the builder does not produce a value. A dep
    /// that completed with both a value and an error serves the value (the error is still
    /// recorded for aggregation).
    ///
    pub fn get(&mut self, node: N) -> Option<N::Value> {
        self.get_or_err(node).unwrap_or(None)
    }

    ///
    /// As `get`, but surfaces a value-less dependency failure to the builder, which may handle
    /// it or translate it into a more specific failure.
    ///
    pub fn get_or_err(&mut self, node: N) -> Result<Option<N::Value>, BuildError> {
        let (result, key) = self.resolve(node);
        if let Some(key) = key {
            self.new_deps.push_single(key);
        }
        result
    }

    ///
    /// Requests a batch of dependencies as one group. Group boundaries are preserved on the
    /// entry's dep list, so a later dirty check can re-check the whole group in parallel.
    ///
    pub fn get_group<I: IntoIterator<Item = N>>(&mut self, nodes: I) -> Vec<Option<N::Value>> {
        let (values, _) = self.get_group_inner(nodes);
        values
    }

    ///
    /// As `get_group`, but returns the first dependency error encountered alongside the
    /// values.
    ///
    pub fn get_group_or_err<I: IntoIterator<Item = N>>(
        &mut self,
        nodes: I,
    ) -> Result<Vec<Option<N::Value>>, BuildError> {
        let (values, first_error) = self.get_group_inner(nodes);
        match first_error {
            Some(error) => Err(error),
            None => Ok(values),
        }
    }

    fn get_group_inner<I: IntoIterator<Item = N>>(
        &mut self,
        nodes: I,
    ) -> (Vec<Option<N::Value>>, Option<BuildError>) {
        let mut values = Vec::new();
        let mut first_error = None;
        let mut group = Vec::new();
        for node in nodes {
            let (result, key) = self.resolve(node);
            if let Some(key) = key {
                group.push(key);
            }
            match result {
                Ok(value) => values.push(value),
                Err(error) => {
                    if first_error.is_none() {
                        first_error = Some(error);
                    }
                    values.push(None);
                }
            }
        }
        self.new_deps.push_group(group);
        (values, first_error)
    }

    ///
    /// Resolves one requested dep: serves a value or error if the dep is complete, marks the
    /// build pending otherwise. Returns the key to record as a newly discovered dep, if this
    /// is the first request for it in the cycle.
    ///
    fn resolve(&mut self, node: N) -> (Result<Option<N::Value>, BuildError>, Option<Key<N>>) {
        let key = self.graph.intern(node);

        let newly_requested = if self.registered.contains(&key) || self.new_dep_set.contains(&key)
        {
            None
        } else {
            self.new_dep_set.insert(key.clone());
            Some(key.clone())
        };

        if let Some(bubbled) = self.bubbled_errors {
            if let Some(info) = bubbled.get(&key) {
                self.child_errors.push(info.clone());
                return (Err(info.primary()), newly_requested);
            }
        }

        let entry = match self.graph.entry(&key) {
            Some(entry) if entry.is_done() => entry,
            _ => {
                self.pending = true;
                return (Ok(None), newly_requested);
            }
        };

        // A dep that completed with both a value and an error (a tolerated failure in its own
        // subtree) serves the value; the error is still recorded so that it aggregates into
        // this node's error if the builder does not handle it. Only a value-less error takes
        // the error path.
        match (entry.peek(), entry.peek_error()) {
            (value, Some(info)) => {
                self.child_errors.push(info.clone());
                if value.is_some() {
                    (Ok(value), newly_requested)
                } else {
                    (Err(info.primary()), newly_requested)
                }
            }
            (value, None) => (Ok(value), newly_requested),
        }
    }

    ///
    /// True iff any dependency requested so far has not completed. A dependency which
    /// completed in error does not count as missing.
    ///
    pub fn deps_missing(&self) -> bool {
        self.pending
    }

    ///
    /// Captures a warning to be replayed through the external reporter when this node commits.
    ///
    pub fn warn<S: Into<String>>(&mut self, message: S) {
        self.events.push(Event::warning(message));
    }

    ///
    /// Captures an error-severity event. Unlike returning `Err` from the builder, this does
    /// not fail the node.
    ///
    pub fn error<S: Into<String>>(&mut self, message: S) {
        self.events.push(Event::error(message));
    }

    pub(crate) fn finish(self) -> ContextOutcome<N> {
        ContextOutcome {
            new_deps: self.new_deps,
            pending: self.pending,
            child_errors: self.child_errors,
            events: self.events,
        }
    }
}
