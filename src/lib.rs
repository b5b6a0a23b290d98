// Copyright 2024 Eval Graph project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]
// Enable all clippy lints except for many of the pedantic ones. It's a shame this needs to be copied and pasted across crates, but there doesn't appear to be a way to include inner attributes from a common source.
#![deny(
    clippy::all,
    clippy::default_trait_access,
    clippy::expl_impl_clone_on_copy,
    clippy::if_not_else,
    clippy::needless_continue,
    clippy::unseparated_literal_suffix,
    clippy::used_underscore_binding
)]
// It is often more clear to show that nothing is being moved.
#![allow(clippy::match_ref_pats)]
// Subjective style.
#![allow(
    clippy::len_without_is_empty,
    clippy::redundant_field_names,
    clippy::too_many_arguments
)]
// Default isn't as big a deal as people seem to think it is.
#![allow(clippy::new_without_default, clippy::new_ret_no_self)]
// Arc<Mutex> can be more clear than needing to grok Orderings:
#![allow(clippy::mutex_atomic)]

mod context;
mod cycles;
mod deps;
// The entry type is re-exported so that tests (and embedders) can inspect committed state.
mod entry;
mod event;
mod node;
mod store;
mod visit;

#[cfg(test)]
mod tests;

pub use crate::context::Context;
pub use crate::deps::GroupedDeps;
pub use crate::entry::Entry;
pub use crate::event::{Event, EventReporter, EventSet, Severity};
pub use crate::node::{
    BuildError, Builder, BuilderRegistry, CycleInfo, ErrorInfo, Evaluated, Interrupted, Node,
    ProgressReceiver, Version,
};
pub use crate::store::{Graph, Key};

use std::cmp;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use fnv::{FnvHashMap as HashMap, FnvHashSet as HashSet};
use parking_lot::Mutex;

use crate::cycles::FoundCycle;
use crate::entry::{Commit, DependencyState, DirtyPhase};
use crate::visit::{Abort, Message, Visitor};

///
/// Logs at trace level, but only in `cfg(test)`.
///
#[macro_export]
macro_rules! test_trace_log {
    ($($arg:tt)+) => {
      #[cfg(test)]
      {
        log::trace!($($arg)+)
      }
    };
}

#[derive(Clone, Debug)]
pub struct EvalConfig {
    /// When true, nodes in error do not halt the evaluation: their parents complete with
    /// aggregated child errors, and roots whose subtrees succeeded still produce values.
    pub keep_going: bool,
    /// The number of worker threads per evaluation.
    pub thread_count: usize,
    /// The cap on cycles reported per root in keep-going mode, to bound detection work.
    pub max_cycles_reported: usize,
}

impl Default for EvalConfig {
    fn default() -> EvalConfig {
        EvalConfig {
            keep_going: false,
            thread_count: num_cpus::get(),
            max_cycles_reported: 20,
        }
    }
}

#[derive(Debug, Eq, PartialEq)]
pub struct InvalidationResult {
    pub invalidated: usize,
    pub dirtied: usize,
}

///
/// The per-root outcome of an evaluation. In keep-going mode a root may appear in both maps,
/// if its builder produced a value while part of its subtree failed.
///
#[derive(Debug)]
pub struct EvalResult<N: Node> {
    pub values: HashMap<N, N::Value>,
    pub errors: HashMap<N, ErrorInfo<N>>,
    pub has_error: bool,
}

///
/// Counters exposed for observability and tests.
///
#[derive(Default)]
pub struct Stats {
    ran: AtomicUsize,
    cleaned: AtomicUsize,
}

impl Stats {
    ///
    /// The number of builder invocations across all evaluations.
    ///
    pub fn ran(&self) -> usize {
        self.ran.load(Ordering::SeqCst)
    }

    ///
    /// The number of dirty entries whose previous values were reused after their deps were
    /// verified unchanged.
    ///
    pub fn cleaned(&self) -> usize {
        self.cleaned.load(Ordering::SeqCst)
    }
}

///
/// A handle used to cooperatively interrupt a running evaluation. Workers observe the
/// interrupt at builder boundaries; the interrupted evaluation cleans its in-flight entries
/// before returning, leaving the graph consistent.
///
#[derive(Clone)]
pub struct Interrupter {
    interrupt: Arc<AtomicBool>,
}

impl Interrupter {
    pub fn interrupt(&self) {
        self.interrupt.store(true, Ordering::SeqCst);
    }
}

///
/// A parallel incremental evaluator over a persistent graph of memoized entries.
///
/// Clients request the values of root nodes; the evaluator walks their transitive deps,
/// invoking the registered Builders to produce each entry's value and re-using results whose
/// transitive inputs have not changed since the last evaluation.
///
pub struct Evaluator<N: Node> {
    graph: Graph<N>,
    builders: BuilderRegistry<N>,
    reporter: Option<Arc<dyn EventReporter>>,
    progress: Option<Arc<dyn ProgressReceiver<N>>>,
    config: EvalConfig,
    interrupt: Arc<AtomicBool>,
    last_version: Mutex<Option<Version>>,
    stats: Stats,
}

impl<N: Node> Evaluator<N> {
    pub fn new(builders: BuilderRegistry<N>) -> Evaluator<N> {
        Evaluator {
            graph: Graph::new(),
            builders,
            reporter: None,
            progress: None,
            config: EvalConfig::default(),
            interrupt: Arc::new(AtomicBool::new(false)),
            last_version: Mutex::new(None),
            stats: Stats::default(),
        }
    }

    pub fn with_config(mut self, config: EvalConfig) -> Evaluator<N> {
        self.config = config;
        self
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn EventReporter>) -> Evaluator<N> {
        self.reporter = Some(reporter);
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressReceiver<N>>) -> Evaluator<N> {
        self.progress = Some(progress);
        self
    }

    pub fn graph(&self) -> &Graph<N> {
        &self.graph
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn interrupter(&self) -> Interrupter {
        Interrupter {
            interrupt: self.interrupt.clone(),
        }
    }

    ///
    /// Marks the given completed entries dirty. With `is_changed`, the entries rebuild
    /// unconditionally on their next evaluation; otherwise their deps are change-checked
    /// first and their previous values reused if nothing changed. Transitive dependents are
    /// dirtied for change-checking in either case.
    ///
    pub fn invalidate(&self, nodes: &[N], is_changed: bool) -> InvalidationResult {
        let mut invalidated = 0;
        let mut dependents = Vec::new();
        for node in nodes {
            let key = self.graph.intern(node.clone());
            if let Some(entry) = self.graph.entry(&key) {
                if entry.mark_dirty(is_changed) {
                    log::info!("Invalidating {key}");
                    invalidated += 1;
                    dependents.extend(entry.reverse_deps_snapshot());
                }
            }
        }
        let dirtied = self.dirty_dependents(dependents);
        InvalidationResult {
            invalidated,
            dirtied,
        }
    }

    ///
    /// Dirties the transitive dependents of already-dirtied entries, for change-checking.
    /// Entries that are already dirty (or never completed) stop the walk: their dependents
    /// were dirtied when they were.
    ///
    fn dirty_dependents(&self, mut queue: Vec<Key<N>>) -> usize {
        let mut dirtied = 0;
        while let Some(key) = queue.pop() {
            if let Some(entry) = self.graph.entry(&key) {
                if entry.mark_dirty(false) {
                    log::info!("Dirtying {key}");
                    dirtied += 1;
                    queue.extend(entry.reverse_deps_snapshot());
                }
            }
        }
        dirtied
    }

    ///
    /// Entries completed with a transient error are re-dirtied as changed at the start of
    /// every evaluation, so that they are rebuilt rather than reused.
    ///
    fn invalidate_transient_errors(&self) {
        let mut dependents = Vec::new();
        for (key, entry) in self.graph.entries() {
            if entry.has_transient_error() && entry.mark_dirty(true) {
                log::debug!("Re-dirtying transient error: {key}");
                dependents.extend(entry.reverse_deps_snapshot());
            }
        }
        self.dirty_dependents(dependents);
    }

    ///
    /// Evaluates the given roots at the given graph version, which must be non-decreasing
    /// across calls. Returns per-root values and errors, or `Interrupted` if the evaluation
    /// was cooperatively canceled.
    ///
    pub fn eval(&self, roots: &[N], version: Version) -> Result<EvalResult<N>, Interrupted> {
        {
            let mut last = self.last_version.lock();
            if let Some(last_version) = *last {
                assert!(
                    version >= last_version,
                    "eval called with a decreasing graph version ({version} < {last_version})",
                );
            }
            *last = Some(version);
        }
        self.interrupt.store(false, Ordering::SeqCst);
        self.invalidate_transient_errors();

        let root_keys: Vec<Key<N>> = roots
            .iter()
            .map(|node| self.graph.intern(node.clone()))
            .collect();
        let evaluation = Evaluation {
            evaluator: self,
            version,
            visitor: Visitor::new(),
            bubbled: Mutex::new(HashMap::default()),
            replayed: Mutex::new(HashSet::default()),
        };
        evaluation.run(&root_keys)
    }
}

///
/// The state of one `eval` call: the work queue, the error-bubbling sideband, and the set of
/// event sets already replayed through the reporter at commit time.
///
struct Evaluation<'a, N: Node> {
    evaluator: &'a Evaluator<N>,
    version: Version,
    visitor: Visitor<N>,
    bubbled: Mutex<HashMap<Key<N>, ErrorInfo<N>>>,
    replayed: Mutex<HashSet<usize>>,
}

impl<'a, N: Node> Evaluation<'a, N> {
    fn graph(&self) -> &Graph<N> {
        &self.evaluator.graph
    }

    fn run(&self, roots: &[Key<N>]) -> Result<EvalResult<N>, Interrupted> {
        loop {
            for root in roots {
                self.child_enqueue(root, None, true);
            }
            match self.run_round() {
                Some(Abort::Interrupted) => {
                    self.visitor.clean(self.graph());
                    return Err(Interrupted);
                }
                Some(Abort::Panic(payload)) => {
                    self.visitor.clean(self.graph());
                    panic::resume_unwind(payload);
                }
                Some(Abort::Error(key, info)) => {
                    self.bubble(key, info, roots);
                    break;
                }
                None => {
                    let stalled = roots.iter().any(|root| {
                        self.graph()
                            .entry(root)
                            .map(|entry| !entry.is_done())
                            .unwrap_or(true)
                    });
                    if stalled && self.evaluator.config.keep_going && self.break_cycles(roots) {
                        continue;
                    }
                    break;
                }
            }
        }
        let result = self.assemble(roots);
        self.visitor.clean(self.graph());
        Ok(result)
    }

    ///
    /// Runs one pool of workers to drain the queue, returning the abort reason if any.
    ///
    fn run_round(&self) -> Option<Abort<N>> {
        let threads = cmp::max(1, self.evaluator.config.thread_count);
        thread::scope(|scope| {
            for _ in 0..threads {
                scope.spawn(|| self.worker());
            }
            let abort = self.visitor.wait();
            self.visitor.shutdown_workers(threads);
            abort
        })
    }

    fn worker(&self) {
        loop {
            match self.visitor.recv() {
                Message::Shutdown => break,
                Message::Work(key) => {
                    if self.evaluator.interrupt.load(Ordering::SeqCst) {
                        self.visitor.abort(Abort::Interrupted);
                    }
                    if !self.visitor.aborted() {
                        let result = panic::catch_unwind(AssertUnwindSafe(|| self.process(&key)));
                        if let Err(payload) = result {
                            self.visitor.abort(Abort::Panic(payload));
                        }
                    }
                    self.visitor.task_done();
                }
            }
        }
    }

    ///
    /// Evaluates one ready key: advances a dirty check, finalizes a verified-clean entry, or
    /// runs the builder.
    ///
    fn process(&self, key: &Key<N>) {
        let entry = self
            .graph()
            .entry(key)
            .expect("a queued key must have an entry");
        match entry.dirty_phase() {
            Some(DirtyPhase::CheckDeps) => {
                if let Some(group) = entry.next_dirty_dep_group() {
                    // Register the whole group before introducing any edge, so readiness
                    // accounting includes every member that may signal synchronously.
                    entry.add_temporary_dep_group(group.clone());
                    for dep in &group {
                        self.child_enqueue(dep, Some((key, &entry)), true);
                    }
                } else {
                    // There was nothing left to check: the entry is verified clean.
                    self.commit_clean(key, &entry);
                }
            }
            Some(DirtyPhase::VerifiedClean) => self.commit_clean(key, &entry),
            Some(DirtyPhase::Rebuilding) | None => self.build(key, &entry),
        }
    }

    fn build(&self, key: &Key<N>, entry: &Arc<Entry<N>>) {
        let graph = self.graph();
        self.evaluator.stats.ran.fetch_add(1, Ordering::SeqCst);
        let builder = self
            .evaluator
            .builders
            .get(key.node().tag())
            .unwrap_or_else(|| panic!("No builder registered for tag {:?}", key.node().tag()));
        let mut context = Context::new(graph, key.clone(), entry.registered_dep_set(), None);
        let outcome = builder.build(key.node(), &mut context);
        let out = context.finish();

        // Register newly discovered deps: all groups at once, then the edges. When the
        // builder found every requested dep complete (it will commit in this invocation),
        // the protocol must signal this entry without re-enqueueing it.
        if !out.new_deps.is_empty() && outcome.is_ok() {
            entry.add_temporary_deps(&out.new_deps);
            for dep in out.new_deps.iter() {
                self.child_enqueue(dep, Some((key, entry)), out.pending);
            }
        }

        match outcome {
            Err(error) => {
                let mut info = ErrorInfo::from_builder(error);
                for child in out.child_errors {
                    info.absorb(child);
                }
                if !self.evaluator.config.keep_going {
                    self.visitor.abort(Abort::Error(key.clone(), info.clone()));
                }
                self.commit(key, entry, None, Some(info), out.events);
            }
            Ok(Some(value)) => {
                assert!(
                    !out.pending,
                    "Builder for {key} returned a value with dependencies still missing.",
                );
                let error = if out.child_errors.is_empty() {
                    None
                } else {
                    Some(ErrorInfo::from_children(out.child_errors))
                };
                self.commit(key, entry, Some(value), error, out.events);
            }
            Ok(None) => {
                if out.pending {
                    // Deferred: the entry is re-enqueued when its last dep signals.
                    return;
                }
                if out.child_errors.is_empty() {
                    panic!(
                        "Builder for {key} returned no value without requesting new dependencies.",
                    );
                }
                let info = ErrorInfo::from_children(out.child_errors);
                if !self.evaluator.config.keep_going {
                    self.visitor.abort(Abort::Error(key.clone(), info.clone()));
                }
                self.commit(key, entry, None, Some(info), out.events);
            }
        }
    }

    ///
    /// The only legal way to introduce a new dep edge. Ensures the child exists, registers
    /// the reverse edge, and either signals the parent (child already Done), schedules the
    /// child (first registration of its cycle), or does nothing (the child is already
    /// evaluating and will signal the parent when it commits).
    ///
    /// `enqueue_parent` is false when the caller is about to commit the parent in the current
    /// invocation: the signal still counts toward readiness, but a re-enqueue would race with
    /// the commit.
    ///
    fn child_enqueue(
        &self,
        dep: &Key<N>,
        parent: Option<(&Key<N>, &Arc<Entry<N>>)>,
        enqueue_parent: bool,
    ) {
        let dep_entry = self.graph().ensure_entry(dep);
        match dep_entry.add_reverse_dep_and_check_if_done(parent.map(|(key, _)| key)) {
            DependencyState::Done => {
                if let Some((parent_key, parent_entry)) = parent {
                    if parent_entry.signal_dep(dep_entry.version()) && enqueue_parent {
                        self.enqueue(parent_key.clone());
                    }
                }
            }
            DependencyState::AddedDep => {}
            DependencyState::NeedsScheduling => self.enqueue(dep.clone()),
        }
    }

    fn enqueue(&self, key: Key<N>) {
        let node = key.node().clone();
        if self.visitor.enqueue(key) {
            if let Some(progress) = &self.evaluator.progress {
                progress.enqueueing(&node);
            }
        }
    }

    ///
    /// Commits a built entry (value and/or error), aggregating its deps' event sets by
    /// reference and replaying its newly emitted events (also on error commits, so that
    /// diagnostics of failed builds are not lost).
    ///
    fn commit(
        &self,
        key: &Key<N>,
        entry: &Arc<Entry<N>>,
        value: Option<N::Value>,
        error: Option<ErrorInfo<N>>,
        direct_events: Vec<Event>,
    ) {
        let graph = self.graph();
        let mut nested = Vec::new();
        for dep in entry.current_deps() {
            if let Some(dep_entry) = graph.entry(&dep) {
                if let Some(set) = dep_entry.events() {
                    nested.push(set);
                }
            }
        }
        let events = EventSet::new(direct_events, nested);
        if let Some(reporter) = &self.evaluator.reporter {
            for event in events.direct() {
                reporter.report(event);
            }
        }
        self.replayed.lock().insert(events.id());

        let progress_value = value.clone();
        let commit = entry.set_value(value, error, events, self.version);
        for dropped in &commit.dropped_children {
            if let Some(child) = graph.entry(&dropped) {
                child.remove_reverse_dep(key);
            }
        }
        self.visitor.notify_done(key);
        if let Some(progress) = &self.evaluator.progress {
            progress.evaluated(key.node(), progress_value.as_ref(), Evaluated::Built);
        }
        self.signal_parents(commit);
    }

    ///
    /// Finalizes a verified-clean entry: its previous value is reused, its version is
    /// preserved, and its builder is not invoked.
    ///
    fn commit_clean(&self, key: &Key<N>, entry: &Arc<Entry<N>>) {
        self.evaluator.stats.cleaned.fetch_add(1, Ordering::SeqCst);
        let commit = entry.mark_clean(self.version);
        self.visitor.notify_done(key);
        if let Some(progress) = &self.evaluator.progress {
            progress.evaluated(key.node(), entry.peek().as_ref(), Evaluated::Clean);
        }
        self.signal_parents(commit);
    }

    ///
    /// Signals the parents registered during the committed cycle, at the committed version,
    /// and enqueues those that became ready. Parents registering after the commit observe
    /// Done and signal themselves through the child-enqueue protocol.
    ///
    fn signal_parents(&self, commit: Commit<N>) {
        for parent in commit.parents {
            if let Some(parent_entry) = self.graph().entry(&parent) {
                if parent_entry.signal_dep(commit.version) {
                    self.enqueue(parent);
                }
            }
        }
    }

    ///
    /// Fail-fast error propagation: walks reverse-dep edges breadth-first from the failed
    /// entry toward the nearest requested root, recording an error per traversed parent in a
    /// sideband map without mutating the graph. A Done parent contributes its recorded error;
    /// an incomplete parent has its builder invoked once more with the failing child visible
    /// as failed, so it may produce a more specific error. Already-visited parents are
    /// skipped, so a cyclic graph drains the walk without reaching a root and falls through
    /// to cycle detection during result assembly.
    ///
    fn bubble(&self, error_key: Key<N>, info: ErrorInfo<N>, roots: &[Key<N>]) {
        let graph = self.graph();
        let mut bubbled = self.bubbled.lock();
        bubbled.insert(error_key.clone(), info.clone());
        if roots.contains(&error_key) {
            return;
        }
        let mut visited: HashSet<Key<N>> = HashSet::default();
        visited.insert(error_key.clone());
        let mut queue: VecDeque<(Key<N>, ErrorInfo<N>)> = VecDeque::new();
        queue.push_back((error_key, info));

        while let Some((current, current_info)) = queue.pop_front() {
            let parents = match graph.entry(&current) {
                Some(entry) => entry.reverse_deps_snapshot(),
                None => continue,
            };
            for parent in parents {
                if !visited.insert(parent.clone()) {
                    continue;
                }
                let parent_entry = match graph.entry(&parent) {
                    Some(entry) => entry,
                    None => continue,
                };

                let new_info = if parent_entry.is_done() {
                    parent_entry
                        .peek_error()
                        .unwrap_or_else(|| ErrorInfo::from_children([current_info.clone()]))
                } else {
                    let builder = self
                        .evaluator
                        .builders
                        .get(parent.node().tag())
                        .unwrap_or_else(|| {
                            panic!("No builder registered for tag {:?}", parent.node().tag())
                        });
                    let mut context = Context::new(
                        graph,
                        parent.clone(),
                        parent_entry.registered_dep_set(),
                        Some(&*bubbled),
                    );
                    let outcome = builder.build(parent.node(), &mut context);
                    let out = context.finish();
                    match outcome {
                        Err(error) => {
                            let mut info = ErrorInfo::from_builder(error);
                            for child in out.child_errors {
                                info.absorb(child);
                            }
                            info
                        }
                        Ok(_) => {
                            if out.child_errors.is_empty() {
                                ErrorInfo::from_children([current_info.clone()])
                            } else {
                                ErrorInfo::from_children(out.child_errors)
                            }
                        }
                    }
                };
                bubbled.insert(parent.clone(), new_info.clone());
                if roots.contains(&parent) {
                    return;
                }
                queue.push_back((parent, new_info));
            }
        }
    }

    ///
    /// Keep-going cycle handling: finds cycles reachable from incomplete roots, committing
    /// each cycle's first node with a synthesized error (child errors plus the cycle) so that
    /// its dependents can complete with aggregated errors on the next round. Returns whether
    /// any entry was committed.
    ///
    fn break_cycles(&self, roots: &[Key<N>]) -> bool {
        let graph = self.graph();
        let mut progressed = false;
        for root in roots {
            if graph
                .entry(root)
                .map(|entry| entry.is_done())
                .unwrap_or(true)
            {
                continue;
            }
            let mut reported = 0;
            while reported < self.evaluator.config.max_cycles_reported {
                let FoundCycle { top, info } = match cycles::find_cycle(graph, root) {
                    Some(found) => found,
                    None => break,
                };
                log::debug!("Breaking cycle at {top}: {info}");
                self.commit_cycle_error(&top, info);
                progressed = true;
                reported += 1;
            }
        }
        progressed
    }

    ///
    /// Commits a synthesized cycle error on the given entry: its unfinished deps are pruned
    /// (restoring the ready invariant and deregistering the edges that formed the cycle), and
    /// the errors and events of its completed children are aggregated as usual.
    ///
    fn commit_cycle_error(&self, key: &Key<N>, info: CycleInfo<N>) {
        let graph = self.graph();
        let entry = graph
            .entry(key)
            .expect("a cycle was found through a removed entry");

        let unfinished: HashSet<Key<N>> = entry
            .current_deps()
            .into_iter()
            .filter(|dep| {
                graph
                    .entry(dep)
                    .map(|dep_entry| !dep_entry.is_done())
                    .unwrap_or(true)
            })
            .collect();
        for dep in &unfinished {
            if let Some(dep_entry) = graph.entry(dep) {
                dep_entry.remove_reverse_dep(key);
            }
        }
        entry.remove_unfinished_deps(&unfinished);

        let mut error = ErrorInfo::from_cycle(info);
        for dep in entry.current_deps() {
            if let Some(dep_entry) = graph.entry(&dep) {
                if let Some(child_info) = dep_entry.peek_error() {
                    error.absorb(child_info);
                }
            }
        }
        self.commit(key, &entry, None, Some(error), Vec::new());
    }

    ///
    /// Produces the per-root result mapping, falling back per root to the bubbled error or a
    /// fresh cycle search when the root did not complete, then replays the roots' aggregated
    /// events once through the reporter (identity-deduplicated, skipping events already
    /// replayed at commit during this evaluation).
    ///
    fn assemble(&self, roots: &[Key<N>]) -> EvalResult<N> {
        let graph = self.graph();
        let mut values = HashMap::default();
        let mut errors: HashMap<N, ErrorInfo<N>> = HashMap::default();
        let bubbled = self.bubbled.lock();
        let mut root_events: Vec<EventSet> = Vec::new();

        for root in roots {
            match graph.entry(root) {
                Some(entry) if entry.is_done() => {
                    if let Some(set) = entry.events() {
                        root_events.push(set);
                    }
                    let error = entry.peek_error();
                    if let Some(value) = entry.peek() {
                        if error.is_none() || self.evaluator.config.keep_going {
                            values.insert(root.node().clone(), value);
                        }
                    }
                    if let Some(info) = error {
                        errors.insert(root.node().clone(), info);
                    }
                }
                _ => {
                    if let Some(info) = bubbled.get(root) {
                        errors.insert(root.node().clone(), info.clone());
                    } else if let Some(found) = cycles::find_cycle(graph, root) {
                        errors.insert(root.node().clone(), ErrorInfo::from_cycle(found.info));
                    }
                    // Otherwise the evaluation aborted before reaching this root, and it is
                    // absent from the result.
                }
            }
        }

        if let Some(reporter) = &self.evaluator.reporter {
            let replayed = self.replayed.lock();
            EventSet::replay_all(root_events.iter(), reporter.as_ref(), &replayed);
        }
        let has_error = !errors.is_empty();
        EvalResult {
            values,
            errors,
            has_error,
        }
    }
}
