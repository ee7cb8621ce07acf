use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::{EvalError, GroupedKeys, Version};

/// Lifecycle state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum NodeState {
    /// Created on first reference, never evaluated.
    New,
    /// A function is running or waiting for dependencies in the current round.
    Evaluating,
    /// A value is committed and valid.
    Done,
    /// Some transitive dependency changed; dependencies must be re-checked before use.
    Dirty,
    /// The node itself was invalidated and must be recomputed.
    Changed,
    /// An error is committed and valid.
    Error,
}

impl NodeState {
    /// Returns true for states that hold a valid result.
    pub fn is_terminal(self) -> bool {
        matches!(self, NodeState::Done | NodeState::Error)
    }
}

/// Predicate recorded by `get_value_or_throw`: does the dependency's error match the requested type?
pub(crate) type Catcher<K> = fn(&EvalError<K>) -> bool;

/// What an evaluating node is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    /// Re-validating the dependency groups of a dirty node, one group at a time.
    Checking { group: usize, awaiting: bool },
    /// Running the function.
    Computing,
}

/// Round-local bookkeeping of an evaluating node.
#[derive(Debug)]
pub(crate) struct Building<K> {
    /// State to return to if the round is interrupted.
    pub(crate) prior: NodeState,
    pub(crate) phase: Phase,
    /// Dependencies of `batch` that are not terminal yet.
    pub(crate) pending: usize,
    /// Dependencies awaited before the next step.
    pub(crate) batch: Vec<K>,
    /// Dependencies requested by the latest attempt.
    pub(crate) requested: GroupedKeys<K>,
    pub(crate) catchers: Vec<(K, Catcher<K>)>,
    /// Nodes to signal on commit.
    pub(crate) waiting: Vec<K>,
    pub(crate) attempts: usize,
}

impl<K> Building<K> {
    pub(crate) fn new(prior: NodeState, phase: Phase) -> Self {
        Self {
            prior,
            phase,
            pending: 0,
            batch: Vec::new(),
            requested: GroupedKeys::default(),
            catchers: Vec::new(),
            waiting: Vec::new(),
            attempts: 0,
        }
    }
}

/// Node is the per-key record kept by the graph store.
#[derive(Debug)]
pub(crate) struct Node<K, V> {
    pub(crate) state: NodeState,
    /// Present when `Done`; kept while `Dirty`/`Changed` so a recomputation can be compared.
    pub(crate) value: Option<Arc<V>>,
    pub(crate) error: Option<Arc<EvalError<K>>>,
    pub(crate) direct_deps: GroupedKeys<K>,
    pub(crate) reverse_deps: ahash::HashSet<K>,
    /// Version at which `value`/`error` last changed.
    pub(crate) last_changed: Version,
    /// Version at which the node was last computed or re-validated.
    pub(crate) last_evaluated: Version,
    /// Set for precomputed inputs, which have no function.
    pub(crate) injected: bool,
    pub(crate) building: Option<Building<K>>,
}

impl<K, V> Default for Node<K, V> {
    fn default() -> Self {
        Self {
            state: NodeState::New,
            value: None,
            error: None,
            direct_deps: GroupedKeys::default(),
            reverse_deps: ahash::HashSet::default(),
            last_changed: Version::ZERO,
            last_evaluated: Version::ZERO,
            injected: false,
            building: None,
        }
    }
}

/// A key with its lock-protected node. Shared between the store and running evaluations.
#[derive(Debug)]
pub(crate) struct NodeEntry<K, V> {
    key: K,
    node: Mutex<Node<K, V>>,
}

impl<K, V> NodeEntry<K, V> {
    pub(crate) fn new(key: K) -> Self {
        Self {
            key,
            node: Mutex::new(Node::default()),
        }
    }

    pub(crate) fn key(&self) -> &K {
        &self.key
    }

    /// Lock the node. Never hold two node locks at once.
    pub(crate) fn lock(&self) -> MutexGuard<'_, Node<K, V>> {
        self.node.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_nodes_start_empty() {
        let entry: NodeEntry<u32, String> = NodeEntry::new(7);
        let node = entry.lock();
        assert_eq!(*entry.key(), 7);
        assert_eq!(node.state, NodeState::New);
        assert!(node.value.is_none());
        assert!(node.direct_deps.is_empty());
        assert!(node.reverse_deps.is_empty());
    }

    #[test]
    fn terminal_states() {
        assert!(NodeState::Done.is_terminal());
        assert!(NodeState::Error.is_terminal());
        assert!(!NodeState::Dirty.is_terminal());
        assert!(!NodeState::Changed.is_terminal());
        assert!(!NodeState::Evaluating.is_terminal());
        assert!(!NodeState::New.is_terminal());
    }
}
