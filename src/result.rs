use std::sync::Arc;

use indexmap::IndexMap;

use crate::{EvalError, Key};

/// Result of one [`Evaluator::evaluate`](crate::Evaluator::evaluate) call: one entry per
/// requested root, in request order.
#[derive(Debug, Clone)]
pub struct EvaluationResult<K: Key, V> {
    results: IndexMap<K, Result<Arc<V>, EvalError<K>>, ahash::RandomState>,
}

impl<K: Key, V> Default for EvaluationResult<K, V> {
    fn default() -> Self {
        Self {
            results: IndexMap::with_hasher(ahash::RandomState::new()),
        }
    }
}

impl<K: Key, V> EvaluationResult<K, V> {
    pub(crate) fn insert(&mut self, key: K, result: Result<Arc<V>, EvalError<K>>) {
        self.results.insert(key, result);
    }

    /// The result for `key`, if it was a root.
    pub fn get(&self, key: &K) -> Option<&Result<Arc<V>, EvalError<K>>> {
        self.results.get(key)
    }

    /// The value of `key`, if it was a root and succeeded.
    pub fn value(&self, key: &K) -> Option<&Arc<V>> {
        self.results.get(key).and_then(|r| r.as_ref().ok())
    }

    /// The error of `key`, if it was a root and failed.
    pub fn error(&self, key: &K) -> Option<&EvalError<K>> {
        self.results.get(key).and_then(|r| r.as_ref().err())
    }

    /// Returns true if any root failed.
    pub fn has_error(&self) -> bool {
        self.results.values().any(Result::is_err)
    }

    /// Iterate over the roots and their results in request order.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &Result<Arc<V>, EvalError<K>>)> + '_ {
        self.results.iter()
    }

    /// Successful roots.
    pub fn values(&self) -> impl Iterator<Item = (&K, &Arc<V>)> + '_ {
        self.results
            .iter()
            .filter_map(|(k, r)| r.as_ref().ok().map(|v| (k, v)))
    }

    /// Failed roots.
    pub fn errors(&self) -> impl Iterator<Item = (&K, &EvalError<K>)> + '_ {
        self.results
            .iter()
            .filter_map(|(k, r)| r.as_ref().err().map(|e| (k, e)))
    }

    /// Cycles reported by failed roots.
    pub fn cycles(&self) -> impl Iterator<Item = (&K, &crate::CycleInfo<K>)> + '_ {
        self.errors().filter_map(|(k, e)| e.cycle().map(|c| (k, c)))
    }

    /// Number of roots.
    pub fn len(&self) -> usize {
        self.results.len()
    }

    /// Returns true if no root was requested.
    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}
