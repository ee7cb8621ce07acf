//! The dependency-request handle passed to functions.

use std::sync::Arc;

use indexmap::IndexSet;

use crate::graph::GraphStore;
use crate::node::Catcher;
use crate::{
    ComputeError, EvalError, Event, EventKind, GroupedKeys, Key, NodeState, TypedErr, Value,
};

/// Environment is what a function uses to request dependencies and report events.
///
/// Requesting a dependency never blocks. If the dependency has no valid result yet, the
/// request returns `None`, the key is recorded as missing, and the function is expected to
/// return [`ComputeError::Incomplete`] (usually through [`check_missing`](Self::check_missing)).
/// The engine evaluates the missing keys and runs the function again.
///
/// Keys requested together through [`get_values`](Self::get_values) form one dependency
/// group: they are fetched in parallel, and a dirty dependent re-checks them together.
pub struct Environment<'a, K: Key, V: Value> {
    key: &'a K,
    graph: &'a GraphStore<K, V>,
    requested: GroupedKeys<K>,
    missing: IndexSet<K, ahash::RandomState>,
    unhandled: Option<(K, Arc<EvalError<K>>)>,
    catchers: Vec<(K, Catcher<K>)>,
    events: Vec<Event<K>>,
}

/// Everything an attempt recorded, handed back to the scheduler.
pub(crate) struct Attempt<K> {
    pub(crate) requested: GroupedKeys<K>,
    pub(crate) missing: Vec<K>,
    pub(crate) unhandled: Option<(K, Arc<EvalError<K>>)>,
    pub(crate) catchers: Vec<(K, Catcher<K>)>,
    pub(crate) events: Vec<Event<K>>,
}

enum Lookup<K, V> {
    Value(Arc<V>),
    Missing,
    Failed(Arc<EvalError<K>>),
}

fn catches<K, E: std::error::Error + Send + Sync + 'static>(error: &EvalError<K>) -> bool {
    error.downcast_ref::<E>().is_some()
}

impl<'a, K: Key, V: Value> Environment<'a, K, V> {
    pub(crate) fn new(key: &'a K, graph: &'a GraphStore<K, V>) -> Self {
        Self {
            key,
            graph,
            requested: GroupedKeys::new(),
            missing: IndexSet::default(),
            unhandled: None,
            catchers: Vec::new(),
            events: Vec::new(),
        }
    }

    pub(crate) fn finish(self) -> Attempt<K> {
        Attempt {
            requested: self.requested,
            missing: self.missing.into_iter().collect(),
            unhandled: self.unhandled,
            catchers: self.catchers,
            events: self.events,
        }
    }

    /// The key being computed.
    pub fn key(&self) -> &K {
        self.key
    }

    /// Request one dependency.
    ///
    /// Returns `None` if the dependency is not available yet, or if it failed. A failed
    /// dependency makes this key fail too, unless the failure is handled through
    /// [`get_value_or_throw`](Self::get_value_or_throw).
    pub fn get_value(&mut self, key: &K) -> Option<Arc<V>> {
        self.get_values([key.clone()]).pop().flatten()
    }

    /// Request several dependencies as one group. Results are in request order.
    pub fn get_values(&mut self, keys: impl IntoIterator<Item = K>) -> Vec<Option<Arc<V>>> {
        let keys: Vec<K> = keys.into_iter().collect();
        self.requested.push_group(keys.iter().cloned());
        keys.iter()
            .map(|key| match self.lookup(key) {
                Lookup::Value(value) => Some(value),
                Lookup::Missing => {
                    self.record_missing(key);
                    None
                }
                Lookup::Failed(error) => {
                    self.record_unhandled(key, error);
                    None
                }
            })
            .collect()
    }

    /// Request one dependency, surfacing its failure if the root error is an `E`.
    ///
    /// - `Ok(Some(value))`: the dependency is available.
    /// - `Ok(None)`: the dependency is missing, or failed with an error of another type.
    /// - `Err(e)`: the dependency failed with an `E`; the function may handle it, or
    ///   rethrow it with `?`.
    ///
    /// Cycle errors never match.
    pub fn get_value_or_throw<E>(&mut self, key: &K) -> Result<Option<Arc<V>>, TypedErr<E>>
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.get_values_or_throw::<E>([key.clone()])
            .pop()
            .unwrap_or(Ok(None))
    }

    /// Group form of [`get_value_or_throw`](Self::get_value_or_throw).
    pub fn get_values_or_throw<E>(
        &mut self,
        keys: impl IntoIterator<Item = K>,
    ) -> Vec<Result<Option<Arc<V>>, TypedErr<E>>>
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        let keys: Vec<K> = keys.into_iter().collect();
        self.requested.push_group(keys.iter().cloned());
        keys.iter()
            .map(|key| {
                self.catchers.push((key.clone(), catches::<K, E> as Catcher<K>));
                match self.lookup(key) {
                    Lookup::Value(value) => Ok(Some(value)),
                    Lookup::Missing => {
                        self.record_missing(key);
                        Ok(None)
                    }
                    Lookup::Failed(error) => {
                        let typed = error
                            .function_error()
                            .and_then(|e| TypedErr::<E>::new(e.error().clone()));
                        match typed {
                            Some(typed) => Err(typed),
                            None => {
                                self.record_unhandled(key, error);
                                Ok(None)
                            }
                        }
                    }
                }
            })
            .collect()
    }

    /// Declare dependencies whose values the function does not need.
    ///
    /// The keys are evaluated and recorded as one group, so a change to any of them
    /// invalidates this key.
    pub fn declare_dependencies(&mut self, keys: impl IntoIterator<Item = K>) {
        let _ = self.get_values(keys);
    }

    /// Returns true if some requested dependency is missing or failed unhandled.
    ///
    /// Once this is true the function's result is discarded, so it should stop and return
    /// [`ComputeError::Incomplete`].
    pub fn values_missing(&self) -> bool {
        !self.missing.is_empty() || self.unhandled.is_some()
    }

    /// `Err(ComputeError::Incomplete)` if [`values_missing`](Self::values_missing).
    ///
    /// ```ignore
    /// let values = env.get_values([BuildKey::Env("PATH".into()), BuildKey::File(path)]);
    /// env.check_missing()?;
    /// ```
    pub fn check_missing(&self) -> Result<(), ComputeError> {
        if self.values_missing() {
            Err(ComputeError::Incomplete)
        } else {
            Ok(())
        }
    }

    /// Report an event. Delivered to the event sink only if this attempt commits.
    pub fn report(&mut self, kind: EventKind, message: impl Into<String>) {
        self.events.push(Event {
            kind,
            key: self.key.clone(),
            message: message.into(),
        });
    }

    fn lookup(&self, key: &K) -> Lookup<K, V> {
        let Some(entry) = self.graph.get(key) else {
            return Lookup::Missing;
        };
        let node = entry.lock();
        match (node.state, &node.value, &node.error) {
            (NodeState::Done, Some(value), _) => Lookup::Value(value.clone()),
            (NodeState::Error, _, Some(error)) => Lookup::Failed(error.clone()),
            _ => Lookup::Missing,
        }
    }

    fn record_missing(&mut self, key: &K) {
        if !self.missing.contains(key) {
            self.missing.insert(key.clone());
        }
    }

    fn record_unhandled(&mut self, key: &K, error: Arc<EvalError<K>>) {
        if self.unhandled.is_none() {
            self.unhandled = Some((key.clone(), error));
        }
    }
}
