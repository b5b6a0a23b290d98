// Copyright 2024 Eval Graph project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::fmt::{self, Debug, Display};
use std::hash::Hash;

use fnv::FnvHashMap as HashMap;
use itertools::Itertools;

use crate::context::Context;

///
/// Defines a memoizable computation keyed by a content-addressable value.
///
/// A Node is the identity half of a graph entry: a cheaply hashable key carrying a type tag
/// that selects the Builder responsible for producing its value.
///
pub trait Node: Clone + Debug + Display + Eq + Hash + Send + Sync + 'static {
    ///
    /// The node-type tag used for Builder lookup in a `BuilderRegistry`.
    ///
    type Tag: Copy + Debug + Eq + Hash + Send + Sync + 'static;

    ///
    /// The value produced by evaluating this Node.
    ///
    /// `Eq` is load-bearing: commits compare the new value with the previous one to decide
    /// whether the entry's version advances (change-pruning for dependents).
    ///
    type Value: Clone + Debug + Eq + Send + Sync + 'static;

    fn tag(&self) -> Self::Tag;
}

///
/// Produces the value for one Node, requesting dependency values through the given Context.
///
/// A Builder may be invoked multiple times for the same Node during a single evaluation: each
/// invocation observes a (possibly larger) set of already-completed dependencies, and a Builder
/// that finds a dependency unavailable returns `Ok(None)` to be resumed once the dependency
/// completes. Builders must therefore be deterministic given the same Node and dependency
/// values. Once a Builder returns `Ok(Some(..))` it is not re-invoked for that Node in the
/// same evaluation.
///
pub trait Builder<N: Node>: Send + Sync {
    fn build(&self, node: &N, context: &mut Context<N>) -> Result<Option<N::Value>, BuildError>;
}

///
/// An O(1) mapping from node-type tag to the Builder for that tag.
///
pub struct BuilderRegistry<N: Node> {
    builders: HashMap<N::Tag, Box<dyn Builder<N>>>,
}

impl<N: Node> BuilderRegistry<N> {
    pub fn new() -> BuilderRegistry<N> {
        BuilderRegistry {
            builders: HashMap::default(),
        }
    }

    pub fn register(&mut self, tag: N::Tag, builder: Box<dyn Builder<N>>) {
        self.builders.insert(tag, builder);
    }

    pub(crate) fn get(&self, tag: N::Tag) -> Option<&dyn Builder<N>> {
        self.builders.get(&tag).map(|b| &**b)
    }
}

///
/// A monotonically non-decreasing graph version, supplied by the caller per evaluation.
///
/// Each completed entry records the version at which its value last changed; dependents compare
/// dependency versions against their own to decide whether a dirty entry must rebuild.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub struct Version(u64);

impl Version {
    pub fn initial() -> Version {
        Version(0)
    }

    pub fn new(version: u64) -> Version {
        Version(version)
    }
}

impl Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

///
/// A failure signaled by a Builder.
///
/// Transient errors are re-evaluated on the next evaluation call even if nothing else changed.
///
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BuildError {
    message: String,
    transient: bool,
}

impl BuildError {
    pub fn new<S: Into<String>>(message: S) -> BuildError {
        BuildError {
            message: message.into(),
            transient: false,
        }
    }

    pub fn transient<S: Into<String>>(message: S) -> BuildError {
        BuildError {
            message: message.into(),
            transient: true,
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_transient(&self) -> bool {
        self.transient
    }
}

impl Display for BuildError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

///
/// One dependency cycle, described by the path from the requested root to the first node of
/// the cycle (inclusive), and the cycle itself.
///
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CycleInfo<N: Node> {
    pub path: Vec<N>,
    pub cycle: Vec<N>,
}

impl<N: Node> Display for CycleInfo<N> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "cycle: {}, via: {}",
            self.cycle.iter().map(|n| n.to_string()).join(" -> "),
            self.path.iter().map(|n| n.to_string()).join(" -> "),
        )
    }
}

///
/// The committed error state of an entry: the union of builder errors and cycles observed in
/// its own build and those of its failed dependencies.
///
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ErrorInfo<N: Node> {
    errors: Vec<BuildError>,
    cycles: Vec<CycleInfo<N>>,
    transient: bool,
}

impl<N: Node> ErrorInfo<N> {
    pub fn from_builder(error: BuildError) -> ErrorInfo<N> {
        let transient = error.is_transient();
        ErrorInfo {
            errors: vec![error],
            cycles: Vec::new(),
            transient,
        }
    }

    pub fn from_cycle(cycle: CycleInfo<N>) -> ErrorInfo<N> {
        ErrorInfo {
            errors: Vec::new(),
            cycles: vec![cycle],
            transient: false,
        }
    }

    ///
    /// The aggregate error for a parent whose children failed but which did not itself fail.
    ///
    pub fn from_children<I: IntoIterator<Item = ErrorInfo<N>>>(children: I) -> ErrorInfo<N> {
        let mut info = ErrorInfo {
            errors: Vec::new(),
            cycles: Vec::new(),
            transient: false,
        };
        for child in children {
            info.absorb(child);
        }
        info
    }

    ///
    /// Merges another ErrorInfo into this one, deduplicating identical entries.
    ///
    pub(crate) fn absorb(&mut self, other: ErrorInfo<N>) {
        for error in other.errors {
            if !self.errors.contains(&error) {
                self.errors.push(error);
            }
        }
        for cycle in other.cycles {
            if !self.cycles.contains(&cycle) {
                self.cycles.push(cycle);
            }
        }
        self.transient |= other.transient;
    }

    pub fn errors(&self) -> &[BuildError] {
        &self.errors
    }

    pub fn cycles(&self) -> &[CycleInfo<N>] {
        &self.cycles
    }

    pub fn is_transient(&self) -> bool {
        self.transient
    }

    ///
    /// The error surfaced to a Builder that requests a failed dependency.
    ///
    pub(crate) fn primary(&self) -> BuildError {
        if let Some(error) = self.errors.first() {
            error.clone()
        } else if let Some(cycle) = self.cycles.first() {
            BuildError::new(cycle.to_string())
        } else {
            BuildError::new("dependency failed")
        }
    }
}

impl<N: Node> Display for ErrorInfo<N> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let rendered = self
            .errors
            .iter()
            .map(|e| e.to_string())
            .chain(self.cycles.iter().map(|c| c.to_string()))
            .join("; ");
        write!(f, "{rendered}")
    }
}

///
/// The evaluation was interrupted cooperatively. The graph is left consistent: every entry is
/// either completed, or has been reset with no dangling edges.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Interrupted;

impl Display for Interrupted {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "evaluation interrupted")
    }
}

///
/// How an entry reached its completed state during an evaluation.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Evaluated {
    /// The entry's dependencies were verified unchanged and its previous value was reused.
    Clean,
    /// The entry's builder ran.
    Built,
}

///
/// An optional observer of evaluation progress.
///
pub trait ProgressReceiver<N: Node>: Send + Sync {
    ///
    /// Called the first time a node is enqueued during an evaluation.
    ///
    fn enqueueing(&self, node: &N);

    ///
    /// Called when a node completes, with its value (if any) and whether it was rebuilt or
    /// verified clean.
    ///
    fn evaluated(&self, node: &N, value: Option<&N::Value>, how: Evaluated);
}
