// Copyright 2024 Eval Graph project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{self, AtomicUsize};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;

use crate::{
    BuildError, Builder, BuilderRegistry, Context, CycleInfo, EvalConfig, Evaluated, Evaluator,
    Event, EventReporter, GroupedDeps, Interrupted, Node, ProgressReceiver, Severity, Version,
};

fn evaluator(builder: &TBuilder) -> Evaluator<TNode> {
    evaluator_with(builder, EvalConfig::default())
}

fn evaluator_with(builder: &TBuilder, config: EvalConfig) -> Evaluator<TNode> {
    let mut registry = BuilderRegistry::new();
    registry.register((), Box::new(builder.clone()));
    Evaluator::new(registry).with_config(config)
}

fn keep_going() -> EvalConfig {
    EvalConfig {
        keep_going: true,
        ..EvalConfig::default()
    }
}

fn version_of(evaluator: &Evaluator<TNode>, id: usize) -> Version {
    let graph = evaluator.graph();
    let key = graph.intern(TNode::new(id));
    graph
        .entry(&key)
        .unwrap_or_else(|| panic!("no entry for TNode({id})"))
        .version()
}

fn is_done(evaluator: &Evaluator<TNode>, id: usize) -> bool {
    let graph = evaluator.graph();
    let key = graph.intern(TNode::new(id));
    graph.entry(&key).map(|e| e.is_done()).unwrap_or(false)
}

#[test]
fn create() {
    let _logger = env_logger::try_init();
    let builder = TBuilder::new();
    let evaluator = evaluator(&builder);

    let result = evaluator.eval(&[TNode::new(2)], Version::new(1)).unwrap();
    assert_eq!(
        result.values.get(&TNode::new(2)),
        Some(&vec![T(0, 0), T(1, 0), T(2, 0)])
    );
    assert!(!result.has_error);
    // Each node with deps runs twice: once to request them, once with them available.
    assert_eq!(
        builder.runs(),
        vec![
            TNode::new(2),
            TNode::new(1),
            TNode::new(0),
            TNode::new(1),
            TNode::new(2)
        ]
    );
    for id in 0..3 {
        assert_eq!(version_of(&evaluator, id), Version::new(1));
    }
    assert_eq!(evaluator.stats().ran(), 5);
}

#[test]
fn reuse_without_invalidation() {
    // Re-evaluating at a later version with no invalidation re-runs nothing and preserves
    // every entry's version.
    let builder = TBuilder::new();
    let evaluator = evaluator(&builder);

    let first = evaluator.eval(&[TNode::new(2)], Version::new(1)).unwrap();
    builder.clear_runs();
    let second = evaluator.eval(&[TNode::new(2)], Version::new(2)).unwrap();

    assert_eq!(
        first.values.get(&TNode::new(2)),
        second.values.get(&TNode::new(2))
    );
    assert_eq!(builder.runs(), Vec::<TNode>::new());
    for id in 0..3 {
        assert_eq!(version_of(&evaluator, id), Version::new(1));
    }
}

#[test]
fn invalidate_and_clean() {
    let _logger = env_logger::try_init();
    let builder = TBuilder::new();
    let evaluator = evaluator(&builder);

    evaluator.eval(&[TNode::new(2)], Version::new(1)).unwrap();
    builder.clear_runs();

    // Dirty the middle node for change-checking: its dep is unchanged, so both it and its
    // dependent are verified clean without running any builder.
    assert_eq!(
        evaluator.invalidate(&[TNode::new(1)], false),
        crate::InvalidationResult {
            invalidated: 1,
            dirtied: 1
        }
    );
    let result = evaluator.eval(&[TNode::new(2)], Version::new(2)).unwrap();

    assert_eq!(
        result.values.get(&TNode::new(2)),
        Some(&vec![T(0, 0), T(1, 0), T(2, 0)])
    );
    assert_eq!(builder.runs(), Vec::<TNode>::new());
    assert_eq!(evaluator.stats().cleaned(), 2);
    for id in 0..3 {
        assert_eq!(version_of(&evaluator, id), Version::new(1));
    }
    // The clean re-evaluation advanced evaluated_at without advancing the version.
    let graph = evaluator.graph();
    let key = graph.intern(TNode::new(2));
    assert_eq!(
        graph.entry(&key).unwrap().evaluated_at(),
        Some(Version::new(2))
    );
}

#[test]
fn invalidate_and_rerun() {
    let builder = TBuilder::new();
    let evaluator = evaluator(&builder);

    evaluator.eval(&[TNode::new(2)], Version::new(1)).unwrap();
    builder.clear_runs();

    // Change the outside world and invalidate the middle node as changed: it and its
    // dependent re-run, the leaf does not.
    builder.set_salt(1);
    evaluator.invalidate(&[TNode::new(1)], true);
    let result = evaluator.eval(&[TNode::new(2)], Version::new(2)).unwrap();

    assert_eq!(
        result.values.get(&TNode::new(2)),
        Some(&vec![T(0, 0), T(1, 1), T(2, 1)])
    );
    assert_eq!(builder.runs(), vec![TNode::new(1), TNode::new(2)]);
    assert_eq!(version_of(&evaluator, 0), Version::new(1));
    assert_eq!(version_of(&evaluator, 1), Version::new(2));
    assert_eq!(version_of(&evaluator, 2), Version::new(2));
}

#[test]
fn version_preserved_on_equal_recompute() {
    let _logger = env_logger::try_init();
    let builder = TBuilder::new();
    let evaluator = evaluator(&builder);

    evaluator.eval(&[TNode::new(2)], Version::new(1)).unwrap();
    builder.clear_runs();

    // Force the leaf to rebuild without changing its output. The forced rebuild advances the
    // leaf's version unconditionally; its dependent re-runs (the leaf's version is newer than
    // its own), produces an equal value over equal deps, and keeps its version; the root then
    // verifies clean without running.
    evaluator.invalidate(&[TNode::new(0)], true);
    let result = evaluator.eval(&[TNode::new(2)], Version::new(2)).unwrap();

    assert_eq!(
        result.values.get(&TNode::new(2)),
        Some(&vec![T(0, 0), T(1, 0), T(2, 0)])
    );
    assert_eq!(builder.runs(), vec![TNode::new(0), TNode::new(1)]);
    assert_eq!(version_of(&evaluator, 0), Version::new(2));
    assert_eq!(version_of(&evaluator, 1), Version::new(1));
    assert_eq!(version_of(&evaluator, 2), Version::new(1));
    assert_eq!(evaluator.stats().cleaned(), 1);
}

#[test]
fn cyclic_failure() {
    // Requesting a cycle in fail-fast mode reports the cycle on the root and leaves no
    // partial entries behind.
    let builder = TBuilder::new();
    builder.set_edges(TNode::new(0), vec![TNode::new(2)]);
    let evaluator = evaluator(&builder);

    let result = evaluator.eval(&[TNode::new(2)], Version::new(1)).unwrap();

    assert!(result.has_error);
    assert!(result.values.is_empty());
    let info = result.errors.get(&TNode::new(2)).unwrap();
    assert_eq!(
        info.cycles(),
        &[CycleInfo {
            path: vec![TNode::new(2)],
            cycle: vec![TNode::new(2), TNode::new(1), TNode::new(0)],
        }]
    );
    // All entries participated in the cycle and were cleaned away.
    assert_eq!(evaluator.graph().len(), 0);
}

#[test]
fn cyclic_failure_keep_going() {
    let builder = TBuilder::new();
    builder.set_edges(TNode::new(0), vec![TNode::new(2)]);
    let evaluator = evaluator_with(&builder, keep_going());

    let result = evaluator.eval(&[TNode::new(2)], Version::new(1)).unwrap();

    assert!(result.has_error);
    let info = result.errors.get(&TNode::new(2)).unwrap();
    assert_eq!(info.cycles().len(), 1);
    assert_eq!(
        info.cycles()[0].cycle,
        vec![TNode::new(2), TNode::new(1), TNode::new(0)]
    );
    // The cycle node itself was committed with the synthesized error.
    assert!(is_done(&evaluator, 2));
}

#[test]
fn keep_going_child_error() {
    let builder = TBuilder::new();
    builder.set_edges(TNode::new(1), vec![TNode::new(0)]);
    builder.set_error(TNode::new(0));
    let evaluator = evaluator_with(&builder, keep_going());

    let result = evaluator.eval(&[TNode::new(1)], Version::new(1)).unwrap();

    assert!(result.has_error);
    assert!(result.values.is_empty());
    let info = result.errors.get(&TNode::new(1)).unwrap();
    assert_eq!(info.errors(), &[BuildError::new("boom")]);
    // Both entries completed: the child with its own error, the parent with the aggregate.
    assert!(is_done(&evaluator, 0));
    assert!(is_done(&evaluator, 1));
}

#[test]
fn fail_fast_bubbling() {
    let _logger = env_logger::try_init();
    let builder = TBuilder::new();
    builder.set_edges(TNode::new(1), vec![TNode::new(0)]);
    builder.set_error(TNode::new(0));
    let evaluator = evaluator(&builder);

    let result = evaluator.eval(&[TNode::new(1)], Version::new(1)).unwrap();

    assert!(result.has_error);
    let info = result.errors.get(&TNode::new(1)).unwrap();
    assert_eq!(info.errors(), &[BuildError::new("boom")]);
    // The failing entry committed with its error; the incomplete parent was cleaned away.
    assert!(is_done(&evaluator, 0));
    assert!(!is_done(&evaluator, 1));
}

#[test]
fn transient_error_reevaluates() {
    let builder = TBuilder::new();
    builder.set_transient(TNode::new(0));
    let evaluator = evaluator(&builder);

    let result = evaluator.eval(&[TNode::new(0)], Version::new(1)).unwrap();
    assert!(result.errors.get(&TNode::new(0)).unwrap().is_transient());
    assert_eq!(builder.runs().len(), 1);

    // A transient error is re-evaluated on the next call even with no invalidation.
    let result = evaluator.eval(&[TNode::new(0)], Version::new(2)).unwrap();
    assert!(result.has_error);
    assert_eq!(builder.runs().len(), 2);

    // Once the cause clears, the node rebuilds and succeeds.
    builder.clear_transient(TNode::new(0));
    let result = evaluator.eval(&[TNode::new(0)], Version::new(3)).unwrap();
    assert_eq!(result.values.get(&TNode::new(0)), Some(&vec![T(0, 0)]));
    assert!(!result.has_error);
}

#[test]
fn tolerated_child_error_keeps_value_and_error() {
    // A builder that handles a dependency failure and still produces a value commits with
    // both, and the root appears in both result maps in keep-going mode.
    let builder = TBuilder::new();
    builder.set_edges(TNode::new(1), vec![TNode::new(0)]);
    builder.set_error(TNode::new(0));
    builder.set_tolerant(TNode::new(1));
    let evaluator = evaluator_with(&builder, keep_going());

    let result = evaluator.eval(&[TNode::new(1)], Version::new(1)).unwrap();

    assert!(result.has_error);
    assert_eq!(result.values.get(&TNode::new(1)), Some(&vec![T(1, 0)]));
    assert_eq!(
        result.errors.get(&TNode::new(1)).unwrap().errors(),
        &[BuildError::new("boom")]
    );
}

#[test]
fn dependent_observes_value_of_tolerated_child_error() {
    // A node committed with both a value and an error serves its value to dependents; the
    // error still aggregates upward, so the consumer completes with both.
    let builder = TBuilder::new();
    builder.set_error(TNode::new(0));
    builder.set_tolerant(TNode::new(1));
    let evaluator = evaluator_with(&builder, keep_going());

    let result = evaluator.eval(&[TNode::new(2)], Version::new(1)).unwrap();

    assert!(result.has_error);
    assert_eq!(
        result.values.get(&TNode::new(2)),
        Some(&vec![T(1, 0), T(2, 0)])
    );
    assert_eq!(
        result.errors.get(&TNode::new(2)).unwrap().errors(),
        &[BuildError::new("boom")]
    );

    // The error-surfacing request variant also observes the value.
    let graph = evaluator.graph();
    let mut context = Context::new(
        graph,
        graph.intern(TNode::new(9)),
        fnv::FnvHashSet::default(),
        None,
    );
    assert_eq!(
        context.get_or_err(TNode::new(1)),
        Ok(Some(vec![T(1, 0)]))
    );
    assert!(!context.deps_missing());
}

#[test]
fn builder_panic_propagates() {
    let builder = TBuilder::new();
    builder.set_panic(TNode::new(0));
    let evaluator = evaluator(&builder);

    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        evaluator.eval(&[TNode::new(2)], Version::new(1))
    }));
    assert!(result.is_err());
    // The in-flight entries were cleaned before the panic was re-raised.
    assert_eq!(evaluator.graph().len(), 0);
}

#[test]
fn interrupt() {
    let builder = TBuilder::new();
    builder.set_delay(TNode::new(0), Duration::from_millis(200));
    let evaluator = evaluator(&builder);
    let interrupter = evaluator.interrupter();

    let handle = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        interrupter.interrupt();
    });
    let result = evaluator.eval(&[TNode::new(2)], Version::new(1));
    handle.join().unwrap();

    assert_eq!(result.err(), Some(Interrupted));
    // The leaf may have committed before the interrupt was observed; nothing else did, and
    // no partial entries remain.
    for id in 1..3 {
        assert!(!is_done(&evaluator, id));
    }
}

#[test]
fn warning_replayed_once_for_diamond() {
    let _logger = env_logger::try_init();
    // 3 -> {2, 1} -> 0: the leaf's warning is stored once and replayed once even though two
    // parents share its subtree.
    let builder = TBuilder::new();
    builder.set_edges(TNode::new(3), vec![TNode::new(2), TNode::new(1)]);
    builder.set_edges(TNode::new(2), vec![TNode::new(0)]);
    builder.set_edges(TNode::new(1), vec![TNode::new(0)]);
    builder.set_warning(TNode::new(0), "leaf warning");
    let reporter = Arc::new(TReporter::new());
    let evaluator = evaluator(&builder).with_reporter(reporter.clone());

    evaluator.eval(&[TNode::new(3)], Version::new(1)).unwrap();
    assert_eq!(reporter.warnings(), vec!["leaf warning".to_owned()]);

    // A fully cached re-evaluation replays the stored events once more.
    evaluator.eval(&[TNode::new(3)], Version::new(2)).unwrap();
    assert_eq!(
        reporter.warnings(),
        vec!["leaf warning".to_owned(), "leaf warning".to_owned()]
    );
}

#[test]
fn error_commit_replays_events() {
    // Events emitted before a failure are not lost.
    let builder = TBuilder::new();
    builder.set_warning(TNode::new(0), "about to fail");
    builder.set_error(TNode::new(0));
    let reporter = Arc::new(TReporter::new());
    let evaluator = evaluator_with(&builder, keep_going()).with_reporter(reporter.clone());

    let result = evaluator.eval(&[TNode::new(0)], Version::new(1)).unwrap();
    assert!(result.has_error);
    assert_eq!(reporter.warnings(), vec!["about to fail".to_owned()]);
}

#[test]
fn progress_receiver_observes_clean_and_built() {
    let builder = TBuilder::new();
    let progress = Arc::new(TProgress::new());
    let evaluator = evaluator(&builder).with_progress(progress.clone());

    evaluator.eval(&[TNode::new(2)], Version::new(1)).unwrap();
    assert_eq!(progress.enqueued(), 3);
    assert_eq!(progress.built(), 3);
    assert_eq!(progress.cleaned(), 0);

    evaluator.invalidate(&[TNode::new(0)], false);
    evaluator.eval(&[TNode::new(2)], Version::new(2)).unwrap();
    assert_eq!(progress.cleaned(), 3);
}

#[test]
fn dep_groups_are_preserved_and_rechecked_in_order() {
    let _logger = env_logger::try_init();
    // A node requesting two groups across restarts records two groups, and a dirty check
    // walks them in insertion order.
    let builder = TBuilder::new();
    builder.set_edges(TNode::new(3), vec![TNode::new(2)]);
    builder.set_extra_group(TNode::new(3), vec![TNode::new(1)]);
    let evaluator = evaluator(&builder);

    evaluator.eval(&[TNode::new(3)], Version::new(1)).unwrap();
    {
        let graph = evaluator.graph();
        let key = graph.intern(TNode::new(3));
        let deps = graph.entry(&key).unwrap().final_deps().unwrap();
        let groups: Vec<Vec<TNode>> = deps
            .groups()
            .map(|g| g.iter().map(|k| k.node().clone()).collect())
            .collect();
        assert_eq!(
            groups,
            vec![vec![TNode::new(2)], vec![TNode::new(1)]]
        );
    }

    // An unchanged dirty check reuses the value without re-running the builder.
    builder.clear_runs();
    evaluator.invalidate(&[TNode::new(3)], false);
    let result = evaluator.eval(&[TNode::new(3)], Version::new(2)).unwrap();
    assert!(result.values.contains_key(&TNode::new(3)));
    assert_eq!(builder.runs(), Vec::<TNode>::new());
}

#[test]
fn clear_discards_all_state() {
    let builder = TBuilder::new();
    let evaluator = evaluator(&builder);

    evaluator.eval(&[TNode::new(2)], Version::new(1)).unwrap();
    builder.clear_runs();
    evaluator.graph().clear();

    evaluator.eval(&[TNode::new(2)], Version::new(2)).unwrap();
    assert_eq!(builder.runs().len(), 5);
}

#[test]
fn interner_canonicalizes() {
    let graph = crate::Graph::<TNode>::new();
    let a = graph.intern(TNode::new(7));
    let b = graph.intern(TNode::new(7));
    assert_eq!(a, b);
    assert!(std::ptr::eq(a.node(), b.node()));
}

#[test]
fn grouped_deps_removal_preserves_boundaries() {
    let graph = crate::Graph::<TNode>::new();
    let key = |id: usize| graph.intern(TNode::new(id));

    let mut deps = GroupedDeps::new();
    deps.push_group(vec![key(0), key(1)]);
    deps.push_single(key(2));
    deps.push_group(vec![key(3), key(4)]);
    assert_eq!(deps.group_count(), 3);
    assert_eq!(deps.len(), 5);

    let to_remove = vec![key(1), key(2)].into_iter().collect();
    deps.remove_all(&to_remove);

    let groups: Vec<Vec<TNode>> = deps
        .groups()
        .map(|g| g.iter().map(|k| k.node().clone()).collect())
        .collect();
    assert_eq!(
        groups,
        vec![
            vec![TNode::new(0)],
            vec![TNode::new(3), TNode::new(4)]
        ]
    );
}

#[test]
fn invalidate_of_unknown_or_fresh_nodes_is_a_noop() {
    let builder = TBuilder::new();
    let evaluator = evaluator(&builder);
    assert_eq!(
        evaluator.invalidate(&[TNode::new(9)], true),
        crate::InvalidationResult {
            invalidated: 0,
            dirtied: 0
        }
    );
}

#[test]
fn invalidate_randomly() {
    let _logger = env_logger::try_init();
    let builder = TBuilder::new();
    let evaluator = evaluator(&builder);
    let range = 20;

    let mut rng = rand::thread_rng();
    let mut version = 1;
    evaluator
        .eval(&[TNode::new(range)], Version::new(version))
        .unwrap();

    for salt in 1..10 {
        let candidate = rng.gen_range(0..range);
        builder.set_salt(salt);
        evaluator.invalidate(&[TNode::new(candidate)], true);
        version += 1;
        let result = evaluator
            .eval(&[TNode::new(range)], Version::new(version))
            .unwrap();
        let output = result.values.get(&TNode::new(range)).unwrap();
        TNode::validate(output).unwrap();
        // The invalidated node and everything above it carry the new salt.
        assert_eq!(output[candidate].1, salt);
        assert_eq!(output[range].1, salt);
    }
}

///
/// A token containing the id of a node and the salt it was built at. Has a short name to
/// minimize the verbosity of tests.
///
#[derive(Clone, Debug, Eq, PartialEq)]
struct T(usize, usize);

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
struct TNode {
    id: usize,
}

impl TNode {
    fn new(id: usize) -> TNode {
        TNode { id }
    }

    ///
    /// Validates the given output. Node ids should increase monotonically left to right, and
    /// salts non-monotonically (an invalidated node and its dependents rebuild at the newest
    /// salt, while untouched subtrees keep older ones).
    ///
    fn validate(output: &[T]) -> Result<(), String> {
        let mut previous_id: Option<usize> = None;
        let mut previous_salt = 0_usize;
        for &T(id, salt) in output {
            if let Some(previous) = previous_id {
                if previous + 1 != id {
                    return Err(format!("Node ids in {output:?} were not monotonic."));
                }
            }
            if salt < previous_salt {
                return Err(format!("Salts in {output:?} were not ordered."));
            }
            previous_id = Some(id);
            previous_salt = salt;
        }
        Ok(())
    }
}

impl fmt::Display for TNode {
    fn fmt(&self, f: &mut fmt::Formatter) -> Result<(), fmt::Error> {
        write!(f, "{self:?}")
    }
}

impl Node for TNode {
    type Tag = ();
    type Value = Vec<T>;

    fn tag(&self) -> Self::Tag {}
}

///
/// A builder that produces a Vec of tokens by recursively requesting the next smaller node
/// (or explicitly configured edges) and appending its own token to the result.
///
#[derive(Clone)]
struct TBuilder(Arc<TBuilderInner>);

struct TBuilderInner {
    // A value included in every token, standing in for the state of the outside world. Tests
    // that want to "change the outside world" bump the salt before invalidating.
    salt: AtomicUsize,
    edges: Mutex<HashMap<TNode, Vec<TNode>>>,
    // A second dep group requested after the first one completes.
    extra_groups: Mutex<HashMap<TNode, Vec<TNode>>>,
    errors: Mutex<HashSet<TNode>>,
    transient: Mutex<HashSet<TNode>>,
    tolerant: Mutex<HashSet<TNode>>,
    panics: Mutex<HashSet<TNode>>,
    delays: Mutex<HashMap<TNode, Duration>>,
    warnings: Mutex<HashMap<TNode, String>>,
    runs: Mutex<Vec<TNode>>,
}

impl TBuilder {
    fn new() -> TBuilder {
        TBuilder(Arc::new(TBuilderInner {
            salt: AtomicUsize::new(0),
            edges: Mutex::default(),
            extra_groups: Mutex::default(),
            errors: Mutex::default(),
            transient: Mutex::default(),
            tolerant: Mutex::default(),
            panics: Mutex::default(),
            delays: Mutex::default(),
            warnings: Mutex::default(),
            runs: Mutex::default(),
        }))
    }

    fn set_salt(&self, salt: usize) {
        self.0.salt.store(salt, atomic::Ordering::SeqCst);
    }

    fn salt(&self) -> usize {
        self.0.salt.load(atomic::Ordering::SeqCst)
    }

    fn set_edges(&self, node: TNode, deps: Vec<TNode>) {
        self.0.edges.lock().insert(node, deps);
    }

    fn set_extra_group(&self, node: TNode, deps: Vec<TNode>) {
        self.0.extra_groups.lock().insert(node, deps);
    }

    fn set_error(&self, node: TNode) {
        self.0.errors.lock().insert(node);
    }

    fn set_transient(&self, node: TNode) {
        self.0.transient.lock().insert(node);
    }

    fn clear_transient(&self, node: TNode) {
        self.0.transient.lock().remove(&node);
    }

    fn set_tolerant(&self, node: TNode) {
        self.0.tolerant.lock().insert(node);
    }

    fn set_panic(&self, node: TNode) {
        self.0.panics.lock().insert(node);
    }

    fn set_delay(&self, node: TNode, delay: Duration) {
        self.0.delays.lock().insert(node, delay);
    }

    fn set_warning(&self, node: TNode, warning: &str) {
        self.0.warnings.lock().insert(node, warning.to_owned());
    }

    fn runs(&self) -> Vec<TNode> {
        self.0.runs.lock().clone()
    }

    fn clear_runs(&self) {
        self.0.runs.lock().clear();
    }

    fn dependencies_of(&self, node: &TNode) -> Vec<TNode> {
        match self.0.edges.lock().get(node) {
            Some(deps) => deps.clone(),
            None if node.id > 0 => vec![TNode::new(node.id - 1)],
            None => vec![],
        }
    }
}

impl Builder<TNode> for TBuilder {
    fn build(
        &self,
        node: &TNode,
        context: &mut Context<TNode>,
    ) -> Result<Option<Vec<T>>, BuildError> {
        self.0.runs.lock().push(node.clone());
        if let Some(delay) = self.0.delays.lock().get(node) {
            thread::sleep(*delay);
        }
        if self.0.panics.lock().contains(node) {
            panic!("{node} panicked");
        }
        if let Some(warning) = self.0.warnings.lock().get(node) {
            context.warn(warning.clone());
        }
        if self.0.errors.lock().contains(node) {
            return Err(BuildError::new("boom"));
        }
        if self.0.transient.lock().contains(node) {
            return Err(BuildError::transient("flaky"));
        }

        let token = T(node.id, self.salt());
        let deps = self.dependencies_of(node);
        if deps.is_empty() {
            return Ok(Some(vec![token]));
        }

        let values = context.get_group(deps);
        if context.deps_missing() {
            return Ok(None);
        }
        if self.0.tolerant.lock().contains(node) {
            // Dependency failures are handled: produce a value regardless.
            return Ok(Some(vec![token]));
        }
        let mut result = match values.into_iter().next() {
            Some(Some(value)) => value,
            // A dep completed without a value (it failed): give up and let the aggregated
            // child errors stand for this node.
            _ => return Ok(None),
        };

        if let Some(extra) = self.0.extra_groups.lock().get(node) {
            let extra_values = context.get_group(extra.clone());
            if context.deps_missing() {
                return Ok(None);
            }
            if extra_values.iter().any(|v| v.is_none()) {
                return Ok(None);
            }
        }

        result.push(token);
        Ok(Some(result))
    }
}

///
/// A reporter that records every event it receives.
///
struct TReporter {
    events: Mutex<Vec<Event>>,
}

impl TReporter {
    fn new() -> TReporter {
        TReporter {
            events: Mutex::default(),
        }
    }

    fn warnings(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.severity == Severity::Warning)
            .map(|e| e.message.clone())
            .collect()
    }
}

impl EventReporter for TReporter {
    fn report(&self, event: &Event) {
        self.events.lock().push(event.clone());
    }
}

///
/// A progress receiver that counts callbacks.
///
struct TProgress {
    enqueued: AtomicUsize,
    built: AtomicUsize,
    cleaned: AtomicUsize,
}

impl TProgress {
    fn new() -> TProgress {
        TProgress {
            enqueued: AtomicUsize::new(0),
            built: AtomicUsize::new(0),
            cleaned: AtomicUsize::new(0),
        }
    }

    fn enqueued(&self) -> usize {
        self.enqueued.load(atomic::Ordering::SeqCst)
    }

    fn built(&self) -> usize {
        self.built.load(atomic::Ordering::SeqCst)
    }

    fn cleaned(&self) -> usize {
        self.cleaned.load(atomic::Ordering::SeqCst)
    }
}

impl ProgressReceiver<TNode> for TProgress {
    fn enqueueing(&self, _node: &TNode) {
        self.enqueued.fetch_add(1, atomic::Ordering::SeqCst);
    }

    fn evaluated(&self, _node: &TNode, _value: Option<&Vec<T>>, how: Evaluated) {
        match how {
            Evaluated::Built => self.built.fetch_add(1, atomic::Ordering::SeqCst),
            Evaluated::Clean => self.cleaned.fetch_add(1, atomic::Ordering::SeqCst),
        };
    }
}
