// Copyright 2024 Eval Graph project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::fmt::{self, Display};
use std::sync::Arc;

use fnv::FnvHashSet as HashSet;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Severity {
    Warning,
    Error,
}

///
/// A diagnostic emitted by a Builder, captured by the environment and replayed through the
/// external reporter.
///
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Event {
    pub severity: Severity,
    pub message: String,
}

impl Event {
    pub fn warning<S: Into<String>>(message: S) -> Event {
        Event {
            severity: Severity::Warning,
            message: message.into(),
        }
    }

    pub fn error<S: Into<String>>(message: S) -> Event {
        Event {
            severity: Severity::Error,
            message: message.into(),
        }
    }
}

impl Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let prefix = match self.severity {
            Severity::Warning => "WARNING",
            Severity::Error => "ERROR",
        };
        write!(f, "{}: {}", prefix, self.message)
    }
}

///
/// The external sink for events. Receives a node's newly emitted events when it commits, and
/// the roots' aggregated events (deduplicated) when an evaluation completes.
///
pub trait EventReporter: Send + Sync {
    fn report(&self, event: &Event);
}

///
/// An immutable tree of events shared by reference between entries.
///
/// An entry's set holds the events its own build emitted plus the sets of its direct
/// dependencies, so a subtree shared by many parents (a diamond) is stored once and can be
/// skipped during replay once visited.
///
#[derive(Clone, Debug)]
pub struct EventSet(Arc<EventSetInner>);

#[derive(Debug)]
struct EventSetInner {
    direct: Vec<Event>,
    nested: Vec<EventSet>,
}

impl EventSet {
    pub fn empty() -> EventSet {
        EventSet::new(Vec::new(), Vec::new())
    }

    pub fn new(direct: Vec<Event>, nested: Vec<EventSet>) -> EventSet {
        EventSet(Arc::new(EventSetInner { direct, nested }))
    }

    pub fn direct(&self) -> &[Event] {
        &self.0.direct
    }

    ///
    /// A stable identity for this set, used to deduplicate replay across shared subtrees.
    ///
    pub(crate) fn id(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }

    ///
    /// Replays every event reachable from the given sets exactly once, skipping the direct
    /// events of sets whose ids appear in `already_reported` (they were replayed when their
    /// entry committed during this evaluation).
    ///
    pub(crate) fn replay_all<'a, I>(
        sets: I,
        reporter: &dyn EventReporter,
        already_reported: &HashSet<usize>,
    ) where
        I: IntoIterator<Item = &'a EventSet>,
    {
        let mut visited = HashSet::default();
        for set in sets {
            set.replay_inner(reporter, already_reported, &mut visited);
        }
    }

    fn replay_inner(
        &self,
        reporter: &dyn EventReporter,
        already_reported: &HashSet<usize>,
        visited: &mut HashSet<usize>,
    ) {
        if !visited.insert(self.id()) {
            return;
        }
        if !already_reported.contains(&self.id()) {
            for event in &self.0.direct {
                reporter.report(event);
            }
        }
        for nested in &self.0.nested {
            nested.replay_inner(reporter, already_reported, visited);
        }
    }
}
