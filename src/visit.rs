// Copyright 2024 Eval Graph project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::any::Any;

use crossbeam_channel::{unbounded, Receiver, Sender};
use fnv::FnvHashSet as HashSet;
use parking_lot::{Condvar, Mutex};

use crate::node::{ErrorInfo, Node};
use crate::store::{Graph, Key};
use crate::test_trace_log;

///
/// The reason an evaluation stopped before the queue drained. The first abort recorded wins;
/// later aborts (from workers still finishing their current node) are dropped.
///
pub(crate) enum Abort<N: Node> {
    /// A builder failed with keep-going disabled: the error bubbles to a root.
    Error(Key<N>, ErrorInfo<N>),
    /// A builder panicked: the payload is re-raised on the driver thread after cleanup.
    Panic(Box<dyn Any + Send + 'static>),
    /// The evaluation was cooperatively interrupted.
    Interrupted,
}

pub(crate) enum Message<N: Node> {
    Work(Key<N>),
    Shutdown,
}

struct VisitorState<N: Node> {
    in_flight: HashSet<Key<N>>,
    outstanding: usize,
    abort: Option<Abort<N>>,
}

///
/// The work queue shared between the driver and a bounded pool of workers.
///
/// Queue ordering is unspecified; correctness relies only on the per-entry readiness
/// accounting (a key is enqueued exactly once per Ready transition). The in-flight set tracks
/// keys that have been enqueued but not yet committed, so that an aborted or stalled
/// evaluation can restore graph consistency.
///
pub(crate) struct Visitor<N: Node> {
    sender: Sender<Message<N>>,
    receiver: Receiver<Message<N>>,
    state: Mutex<VisitorState<N>>,
    completed: Condvar,
}

impl<N: Node> Visitor<N> {
    pub(crate) fn new() -> Visitor<N> {
        let (sender, receiver) = unbounded();
        Visitor {
            sender,
            receiver,
            state: Mutex::new(VisitorState {
                in_flight: HashSet::default(),
                outstanding: 0,
                abort: None,
            }),
            completed: Condvar::new(),
        }
    }

    ///
    /// Enqueues a key for evaluation, returning true on its first enqueue of this evaluation.
    ///
    pub(crate) fn enqueue(&self, key: Key<N>) -> bool {
        let first = {
            let mut state = self.state.lock();
            state.outstanding += 1;
            state.in_flight.insert(key.clone())
        };
        test_trace_log!("Enqueueing {} (first: {})", key, first);
        self.sender
            .send(Message::Work(key))
            .expect("the work queue outlives the visitor");
        first
    }

    ///
    /// Removes a committed key from the in-flight set.
    ///
    pub(crate) fn notify_done(&self, key: &Key<N>) {
        self.state.lock().in_flight.remove(key);
    }

    ///
    /// Marks one dequeued message as handled, waking the driver when the queue drains.
    ///
    pub(crate) fn task_done(&self) {
        let mut state = self.state.lock();
        state.outstanding -= 1;
        if state.outstanding == 0 {
            self.completed.notify_all();
        }
    }

    pub(crate) fn abort(&self, abort: Abort<N>) {
        let mut state = self.state.lock();
        if state.abort.is_none() {
            state.abort = Some(abort);
        }
    }

    pub(crate) fn aborted(&self) -> bool {
        self.state.lock().abort.is_some()
    }

    pub(crate) fn recv(&self) -> Message<N> {
        self.receiver
            .recv()
            .expect("the work queue outlives the visitor")
    }

    ///
    /// Blocks until every enqueued message has been handled, then takes the abort reason (if
    /// any). Workers drain remaining messages without processing once an abort is recorded,
    /// so this terminates promptly after a failure.
    ///
    pub(crate) fn wait(&self) -> Option<Abort<N>> {
        let mut state = self.state.lock();
        while state.outstanding > 0 {
            self.completed.wait(&mut state);
        }
        state.abort.take()
    }

    pub(crate) fn shutdown_workers(&self, count: usize) {
        for _ in 0..count {
            self.sender
                .send(Message::Shutdown)
                .expect("the work queue outlives the visitor");
        }
    }

    ///
    /// Restores graph consistency after an abort or stall: every in-flight entry that did not
    /// commit has its temporary dep edges deregistered, and is then either removed from the
    /// graph (if it had never completed) or reset to an unscheduled dirty state (preserving
    /// its previous result for the next evaluation).
    ///
    pub(crate) fn clean(&self, graph: &Graph<N>) {
        let keys: Vec<Key<N>> = {
            let mut state = self.state.lock();
            state.in_flight.drain().collect()
        };
        for key in keys {
            let entry = match graph.entry(&key) {
                Some(entry) => entry,
                None => continue,
            };
            if entry.is_done() {
                continue;
            }
            test_trace_log!("Cleaning partial entry {}", key);
            let (children, remove) = entry.abandon();
            for child in children {
                if let Some(child_entry) = graph.entry(&child) {
                    child_entry.remove_reverse_dep(&key);
                }
            }
            if remove {
                graph.remove(&key);
            }
        }
    }
}
