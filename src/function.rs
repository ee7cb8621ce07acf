//! Functions and the registry that maps key kinds to them.

use std::sync::Arc;

use crate::{ComputeError, Environment, Key, Value};

/// Function computes the value of every key of one kind.
///
/// A function may run many times for the same key within one round: whenever it returns
/// [`ComputeError::Incomplete`] it is re-run from the beginning once the missing dependencies
/// are available. It must therefore be deterministic with respect to the values it obtains
/// from the [`Environment`], and must not mutate shared state before its dependencies are
/// complete.
///
/// Closures with the matching signature can be registered through
/// [`EvaluatorBuilder::function_fn`](crate::EvaluatorBuilder::function_fn).
pub trait Function<K: Key, V: Value>: Send + Sync + 'static {
    /// Compute the value of `key`.
    fn compute(&self, key: &K, env: &mut Environment<'_, K, V>) -> Result<V, ComputeError>;
}

/// Adapter turning a closure into a [`Function`].
pub(crate) struct FnFunction<F>(pub(crate) F);

impl<K, V, F> Function<K, V> for FnFunction<F>
where
    K: Key,
    V: Value,
    F: Fn(&K, &mut Environment<'_, K, V>) -> Result<V, ComputeError> + Send + Sync + 'static,
{
    fn compute(&self, key: &K, env: &mut Environment<'_, K, V>) -> Result<V, ComputeError> {
        (self.0)(key, env)
    }
}

/// FunctionRegistry holds one function per key kind.
pub(crate) struct FunctionRegistry<K: Key, V> {
    functions: ahash::HashMap<K::Kind, Arc<dyn Function<K, V>>>,
}

impl<K: Key, V: Value> Default for FunctionRegistry<K, V> {
    fn default() -> Self {
        Self {
            functions: ahash::HashMap::default(),
        }
    }
}

impl<K: Key, V: Value> FunctionRegistry<K, V> {
    /// Register `function` for `kind`, replacing any previous one.
    pub(crate) fn insert(&mut self, kind: K::Kind, function: Arc<dyn Function<K, V>>) {
        if self.functions.insert(kind, function).is_some() {
            tracing::debug!(?kind, "replacing registered function");
        }
    }

    pub(crate) fn get(&self, kind: K::Kind) -> Option<&Arc<dyn Function<K, V>>> {
        self.functions.get(&kind)
    }

    pub(crate) fn len(&self) -> usize {
        self.functions.len()
    }
}
