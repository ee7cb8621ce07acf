use std::collections::VecDeque;

use crate::graph::GraphStore;
use crate::{Key, NodeState, Tracer, Value};

/// Invalidation is a record of one node marked changed or dirty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invalidation<K> {
    /// The node that was marked.
    pub key: K,
    /// The key whose invalidation caused this one.
    pub source: K,
    /// Why the node was marked.
    pub reason: InvalidationReason,
}

impl<K: Clone> Invalidation<K> {
    /// Create an invalidation of `key` caused by itself.
    pub fn new_source(key: K, reason: InvalidationReason) -> Self {
        Self {
            source: key.clone(),
            key,
            reason,
        }
    }
}

/// InvalidationReason is the reason why a node is invalidated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum InvalidationReason {
    /// The caller reported that the data behind the key changed.
    Manual,
    /// A precomputed value was replaced.
    Injected,
    /// The key failed transiently in the previous round and is retried.
    TransientRetry,
    /// A transitive dependency was invalidated; the node is dirty.
    DependencyInvalidated,
}

/// Mark `keys` changed and every transitive dependent dirty.
///
/// Keys without a node, injected keys and keys that are already `Changed` are skipped.
pub(crate) fn invalidate<K: Key, V: Value>(
    graph: &GraphStore<K, V>,
    keys: impl IntoIterator<Item = K>,
    reason: InvalidationReason,
    tracer: &dyn Tracer<K>,
) -> Vec<Invalidation<K>> {
    let mut invalidations = Vec::new();
    for key in keys {
        let Some(entry) = graph.get(&key) else {
            continue;
        };
        {
            let mut node = entry.lock();
            if node.injected {
                tracing::debug!(?key, "ignoring invalidation of an injected key");
                continue;
            }
            match node.state {
                NodeState::Done | NodeState::Error | NodeState::Dirty => {
                    node.state = NodeState::Changed;
                }
                // Nothing cached yet, or already marked.
                NodeState::New | NodeState::Changed | NodeState::Evaluating => continue,
            }
        }
        tracer.on_invalidated(&key, reason);
        invalidations.push(Invalidation::new_source(key.clone(), reason));
        mark_dependents_dirty(graph, &key, tracer, &mut invalidations);
    }
    invalidations
}

/// Breadth-first walk over reverse edges marking `Done`/`Error` dependents dirty.
///
/// The walk stops at nodes that are already dirty or changed: their dependents were marked
/// when they were.
pub(crate) fn mark_dependents_dirty<K: Key, V: Value>(
    graph: &GraphStore<K, V>,
    source: &K,
    tracer: &dyn Tracer<K>,
    invalidations: &mut Vec<Invalidation<K>>,
) {
    let mut queue = VecDeque::from([source.clone()]);
    while let Some(key) = queue.pop_front() {
        let Some(entry) = graph.get(&key) else {
            continue;
        };
        let dependents: Vec<K> = entry.lock().reverse_deps.iter().cloned().collect();
        for dependent in dependents {
            let Some(dep_entry) = graph.get(&dependent) else {
                continue;
            };
            {
                let mut node = dep_entry.lock();
                if !node.state.is_terminal() {
                    continue;
                }
                node.state = NodeState::Dirty;
            }
            tracer.on_invalidated(&dependent, InvalidationReason::DependencyInvalidated);
            invalidations.push(Invalidation {
                key: dependent.clone(),
                source: source.clone(),
                reason: InvalidationReason::DependencyInvalidated,
            });
            queue.push_back(dependent);
        }
    }
}
