// Copyright 2024 Eval Graph project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use fnv::FnvHashSet as HashSet;

use crate::node::{CycleInfo, Node};
use crate::store::{Graph, Key};

///
/// A cycle located by `find_cycle`: the rendered CycleInfo plus the key of the first cycle
/// node, which a keep-going evaluation commits with a synthesized error to break the cycle.
///
pub(crate) struct FoundCycle<N: Node> {
    pub(crate) top: Key<N>,
    pub(crate) info: CycleInfo<N>,
}

enum WalkItem<N: Node> {
    Visit(Key<N>),
    ChildrenFinished,
}

///
/// Searches for one cycle in the incomplete entries reachable from the given root.
///
/// Runs only when an evaluation stalls: an iterative depth-first search with an explicit
/// stack, keeping the current DFS path as both a list (for rendering) and a set (for O(1)
/// membership), with a sentinel marker pushed below each node's children to detect subtree
/// completion. Done entries are skipped: their transitive deps completed, so they cannot
/// participate in a cycle.
///
pub(crate) fn find_cycle<N: Node>(graph: &Graph<N>, root: &Key<N>) -> Option<FoundCycle<N>> {
    let mut stack: Vec<WalkItem<N>> = vec![WalkItem::Visit(root.clone())];
    let mut path: Vec<Key<N>> = Vec::new();
    let mut path_set: HashSet<Key<N>> = HashSet::default();
    let mut finished: HashSet<Key<N>> = HashSet::default();

    while let Some(item) = stack.pop() {
        match item {
            WalkItem::ChildrenFinished => {
                let key = path.pop().expect("path underflow in cycle detection");
                path_set.remove(&key);
                finished.insert(key);
            }
            WalkItem::Visit(key) => {
                if path_set.contains(&key) {
                    let index = path
                        .iter()
                        .position(|k| k == &key)
                        .expect("path and path_set diverged");
                    return Some(FoundCycle {
                        top: key,
                        info: CycleInfo {
                            path: path[..=index].iter().map(|k| k.node().clone()).collect(),
                            cycle: path[index..].iter().map(|k| k.node().clone()).collect(),
                        },
                    });
                }
                if finished.contains(&key) {
                    continue;
                }
                let entry = match graph.entry(&key) {
                    Some(entry) if !entry.is_done() => entry,
                    _ => continue,
                };
                path.push(key.clone());
                path_set.insert(key);
                stack.push(WalkItem::ChildrenFinished);
                for child in entry.current_deps() {
                    stack.push(WalkItem::Visit(child));
                }
            }
        }
    }
    None
}
