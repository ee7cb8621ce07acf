//! The concurrent node store.

use std::fmt;
use std::sync::Arc;

use papaya::HashMap;

use crate::node::NodeEntry;
use crate::{EvalError, GroupedKeys, Key, NodeState, Value, Version};

/// GraphStore maps every key ever referenced to its node.
///
/// Lookups and insertions are lock-free; each node carries its own lock. Nodes are only
/// removed by [`Evaluator::prune`](crate::Evaluator::prune).
pub struct GraphStore<K: Key, V> {
    nodes: HashMap<K, Arc<NodeEntry<K, V>>, ahash::RandomState>,
}

impl<K: Key, V: Value> Default for GraphStore<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Key, V: Value> GraphStore<K, V> {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            nodes: HashMap::with_hasher(ahash::RandomState::new()),
        }
    }

    pub(crate) fn get(&self, key: &K) -> Option<Arc<NodeEntry<K, V>>> {
        self.nodes.pin().get(key).cloned()
    }

    /// Fetch the node for `key`, creating a `New` one if absent.
    pub(crate) fn get_or_create(&self, key: &K) -> Arc<NodeEntry<K, V>> {
        let pinned = self.nodes.pin();
        if let Some(entry) = pinned.get(key) {
            return entry.clone();
        }
        pinned
            .get_or_insert_with(key.clone(), || Arc::new(NodeEntry::new(key.clone())))
            .clone()
    }

    pub(crate) fn remove(&self, key: &K) -> bool {
        self.nodes.pin().remove(key).is_some()
    }

    pub(crate) fn entries(&self) -> Vec<Arc<NodeEntry<K, V>>> {
        self.nodes.pin().values().cloned().collect()
    }

    /// Returns true if a node exists for `key`.
    pub fn contains(&self, key: &K) -> bool {
        self.nodes.pin().contains_key(key)
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.pin().len()
    }

    /// Returns true if the store holds no node.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every key with a node, in no particular order.
    pub fn keys(&self) -> Vec<K> {
        self.nodes.pin().keys().cloned().collect()
    }

    /// Current state of `key`.
    pub fn state(&self, key: &K) -> Option<NodeState> {
        self.get(key).map(|entry| entry.lock().state)
    }

    /// The committed value of `key`, if the node is `Done`.
    pub fn value(&self, key: &K) -> Option<Arc<V>> {
        let entry = self.get(key)?;
        let node = entry.lock();
        match node.state {
            NodeState::Done => node.value.clone(),
            _ => None,
        }
    }

    /// The committed error of `key`, if the node is in the `Error` state.
    pub fn error(&self, key: &K) -> Option<Arc<EvalError<K>>> {
        let entry = self.get(key)?;
        let node = entry.lock();
        match node.state {
            NodeState::Error => node.error.clone(),
            _ => None,
        }
    }

    /// Dependencies recorded by the last committed evaluation of `key`.
    pub fn direct_deps(&self, key: &K) -> Option<GroupedKeys<K>> {
        self.get(key).map(|entry| entry.lock().direct_deps.clone())
    }

    /// Nodes whose last committed evaluation depends on `key`, in no particular order.
    pub fn reverse_deps(&self, key: &K) -> Option<Vec<K>> {
        self.get(key)
            .map(|entry| entry.lock().reverse_deps.iter().cloned().collect())
    }

    /// `(last_changed, last_evaluated)` versions of `key`.
    pub fn versions(&self, key: &K) -> Option<(Version, Version)> {
        self.get(key).map(|entry| {
            let node = entry.lock();
            (node.last_changed, node.last_evaluated)
        })
    }

    /// Bring the reverse edges of `key`'s dependencies in line with a new dependency record.
    pub(crate) fn update_reverse_deps(&self, key: &K, old: &GroupedKeys<K>, new: &GroupedKeys<K>) {
        for dep in old.iter().filter(|dep| !new.contains(dep)) {
            if let Some(entry) = self.get(dep) {
                entry.lock().reverse_deps.remove(key);
            }
        }
        for dep in new.iter().filter(|dep| !old.contains(dep)) {
            self.get_or_create(dep)
                .lock()
                .reverse_deps
                .insert(key.clone());
        }
    }

    /// Verify the structural invariants of the graph between rounds.
    ///
    /// Checks that forward and reverse edges mirror each other, and that every `Done` node
    /// only depends on `Done` or `Error` nodes.
    pub fn check_consistency(&self) -> Result<(), Vec<Inconsistency<K>>> {
        let mut problems = Vec::new();
        for entry in self.entries() {
            let (state, deps, rdeps) = {
                let node = entry.lock();
                (
                    node.state,
                    node.direct_deps.clone(),
                    node.reverse_deps.iter().cloned().collect::<Vec<_>>(),
                )
            };
            let key = entry.key();
            for dep in deps.iter() {
                match self.get(dep) {
                    None => problems.push(Inconsistency::MissingNode {
                        node: key.clone(),
                        dependency: dep.clone(),
                    }),
                    Some(dep_entry) => {
                        let dep_node = dep_entry.lock();
                        if !dep_node.reverse_deps.contains(key) {
                            problems.push(Inconsistency::MissingReverseEdge {
                                node: key.clone(),
                                dependency: dep.clone(),
                            });
                        }
                        if state == NodeState::Done && !dep_node.state.is_terminal() {
                            problems.push(Inconsistency::InvalidDependency {
                                node: key.clone(),
                                dependency: dep.clone(),
                                state: dep_node.state,
                            });
                        }
                    }
                }
            }
            for rdep in rdeps {
                let mirrored = self
                    .get(&rdep)
                    .is_some_and(|rdep_entry| rdep_entry.lock().direct_deps.contains(key));
                if !mirrored {
                    problems.push(Inconsistency::DanglingReverseEdge {
                        node: key.clone(),
                        dependent: rdep,
                    });
                }
            }
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(problems)
        }
    }
}

impl<K: Key, V> fmt::Debug for GraphStore<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GraphStore")
            .field("nodes", &self.nodes.pin().len())
            .finish()
    }
}

/// A violated graph invariant reported by [`GraphStore::check_consistency`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inconsistency<K> {
    /// `node` depends on a key that has no node.
    MissingNode {
        /// The dependent.
        node: K,
        /// The missing dependency.
        dependency: K,
    },
    /// `node` depends on `dependency`, but `dependency` does not list `node` as a dependent.
    MissingReverseEdge {
        /// The dependent.
        node: K,
        /// The dependency.
        dependency: K,
    },
    /// `node` lists `dependent`, but `dependent` does not depend on `node`.
    DanglingReverseEdge {
        /// The dependency.
        node: K,
        /// The listed dependent.
        dependent: K,
    },
    /// A `Done` node depends on a node without a valid result.
    InvalidDependency {
        /// The dependent.
        node: K,
        /// The dependency.
        dependency: K,
        /// State of the dependency.
        state: NodeState,
    },
}
