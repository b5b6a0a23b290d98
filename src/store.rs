// Copyright 2024 Eval Graph project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::cmp;
use std::fmt::{self, Display};
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Weak};

use fnv::FnvHashMap as HashMap;
use parking_lot::Mutex;

use crate::entry::Entry;
use crate::node::Node;

///
/// An interned node key: a shared handle to a canonicalized Node value.
///
/// Keys compare and hash by node content, but canonicalization makes the common case a pointer
/// comparison, and edges stored as keys share one allocation per distinct node.
///
#[derive(Debug)]
pub struct Key<N: Node>(Arc<N>);

impl<N: Node> Key<N> {
    pub fn node(&self) -> &N {
        &self.0
    }
}

impl<N: Node> Clone for Key<N> {
    fn clone(&self) -> Key<N> {
        Key(self.0.clone())
    }
}

impl<N: Node> PartialEq for Key<N> {
    fn eq(&self, other: &Key<N>) -> bool {
        Arc::ptr_eq(&self.0, &other.0) || self.0 == other.0
    }
}

impl<N: Node> Eq for Key<N> {}

impl<N: Node> Hash for Key<N> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

impl<N: Node> Display for Key<N> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        Display::fmt(&*self.0, f)
    }
}

///
/// Canonicalizes Node values into shared Keys via weak references, so that the intern table
/// does not retain nodes which are no longer referenced by any entry. Dead weak references are
/// swept opportunistically as the table grows.
///
struct Interner<N: Node> {
    inner: Mutex<InternerInner<N>>,
}

struct InternerInner<N: Node> {
    forward: HashMap<N, Weak<N>>,
    sweep_at: usize,
}

const INTERNER_INITIAL_SWEEP: usize = 64;

impl<N: Node> Interner<N> {
    fn new() -> Interner<N> {
        Interner {
            inner: Mutex::new(InternerInner {
                forward: HashMap::default(),
                sweep_at: INTERNER_INITIAL_SWEEP,
            }),
        }
    }

    fn intern(&self, node: N) -> Key<N> {
        let mut inner = self.inner.lock();
        if let Some(weak) = inner.forward.get(&node) {
            if let Some(existing) = weak.upgrade() {
                return Key(existing);
            }
        }

        let arc = Arc::new(node.clone());
        inner.forward.insert(node, Arc::downgrade(&arc));
        if inner.forward.len() >= inner.sweep_at {
            inner.forward.retain(|_, weak| weak.strong_count() > 0);
            inner.sweep_at = cmp::max(INTERNER_INITIAL_SWEEP, inner.forward.len() * 2);
        }
        Key(arc)
    }

    fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.forward.clear();
        inner.sweep_at = INTERNER_INITIAL_SWEEP;
    }
}

///
/// A thread-safe mapping from interned Key to Entry with create-if-absent semantics.
///
/// The store guarantees a total order of operations per key via each entry's own lock; it takes
/// no lock across entries, and its own map lock is held only for lookup and insertion.
///
pub struct Graph<N: Node> {
    nodes: Mutex<HashMap<Key<N>, Arc<Entry<N>>>>,
    interner: Interner<N>,
}

impl<N: Node> Graph<N> {
    pub fn new() -> Graph<N> {
        Graph {
            nodes: Mutex::new(HashMap::default()),
            interner: Interner::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.lock().len()
    }

    pub(crate) fn intern(&self, node: N) -> Key<N> {
        self.interner.intern(node)
    }

    ///
    /// Returns the entry for the given key, creating an empty one if absent.
    ///
    pub(crate) fn ensure_entry(&self, key: &Key<N>) -> Arc<Entry<N>> {
        let mut nodes = self.nodes.lock();
        nodes
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Entry::new(key.clone())))
            .clone()
    }

    pub(crate) fn entry(&self, key: &Key<N>) -> Option<Arc<Entry<N>>> {
        self.nodes.lock().get(key).cloned()
    }

    pub(crate) fn remove(&self, key: &Key<N>) {
        self.nodes.lock().remove(key);
    }

    pub(crate) fn entries(&self) -> Vec<(Key<N>, Arc<Entry<N>>)> {
        self.nodes
            .lock()
            .iter()
            .map(|(k, e)| (k.clone(), e.clone()))
            .collect()
    }

    ///
    /// Drops the state of all entries in the graph.
    ///
    pub fn clear(&self) {
        self.nodes.lock().clear();
        self.interner.clear();
    }
}
