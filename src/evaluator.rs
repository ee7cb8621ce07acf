use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use indexmap::IndexSet;

use crate::function::{FnFunction, FunctionRegistry};
use crate::graph::GraphStore;
use crate::invalidation::{self, Invalidation, InvalidationReason};
use crate::round::Round;
use crate::{
    ComputeError, EngineError, Environment, EvalError, EvaluationResult, EvaluatorConfig,
    EventSink, Function, FunctionError, GroupedKeys, Key, NodeState, NoopEventSink, NoopTracer,
    Tracer, Value, Version,
};

/// Evaluator owns the graph and evaluates keys against it.
///
/// Every mutating operation takes `&mut self`, so invalidation, injection and pruning can
/// never run concurrently with an evaluation round. Parallelism happens inside
/// [`evaluate`](Self::evaluate).
///
/// # Example
///
/// ```
/// use evalgraph::{Evaluator, Key};
///
/// #[derive(Clone, Debug, Hash, PartialEq, Eq)]
/// enum Calc {
///     Input(u32),
///     Double(u32),
/// }
///
/// impl Key for Calc {
///     type Kind = &'static str;
///
///     fn kind(&self) -> &'static str {
///         match self {
///             Calc::Input(_) => "input",
///             Calc::Double(_) => "double",
///         }
///     }
/// }
///
/// let mut evaluator = Evaluator::<Calc, u64>::builder()
///     .function_fn("double", |key, env| {
///         let Calc::Double(n) = key else { unreachable!() };
///         let input = env.get_value(&Calc::Input(*n));
///         env.check_missing()?;
///         Ok(*input.unwrap() * 2)
///     })
///     .inject(Calc::Input(1), 21)
///     .build()
///     .unwrap();
///
/// let result = evaluator.evaluate([Calc::Double(1)]).unwrap();
/// assert_eq!(**result.value(&Calc::Double(1)).unwrap(), 42);
/// ```
pub struct Evaluator<K: Key, V: Value> {
    graph: GraphStore<K, V>,
    functions: FunctionRegistry<K, V>,
    pool: rayon::ThreadPool,
    config: EvaluatorConfig,
    tracer: Arc<dyn Tracer<K>>,
    events: Arc<dyn EventSink<K>>,
    interrupt: InterruptHandle,
    version: Version,
    /// Keys that failed transiently in the previous round.
    transient: Vec<K>,
}

impl<K: Key, V: Value> Evaluator<K, V> {
    /// Create a builder.
    pub fn builder() -> EvaluatorBuilder<K, V> {
        EvaluatorBuilder::new()
    }

    /// Evaluate `roots` and everything they transitively need.
    ///
    /// Returns one result per distinct root, in request order. Individual failures,
    /// including cycles, are reported per root; the call itself only fails when the round
    /// is interrupted, in which case every node left unfinished returns to its prior state.
    pub fn evaluate(
        &mut self,
        roots: impl IntoIterator<Item = K>,
    ) -> Result<EvaluationResult<K, V>, EngineError> {
        let roots: IndexSet<K, ahash::RandomState> = roots.into_iter().collect();
        let roots: Vec<K> = roots.into_iter().collect();

        if !self.transient.is_empty() {
            let retry = std::mem::take(&mut self.transient);
            self.invalidate_with(retry, InvalidationReason::TransientRetry);
        }

        self.tracer.on_round_start(&roots);
        tracing::debug!(roots = roots.len(), version = self.version.0, "evaluation round start");
        let round = Round::new(
            &self.graph,
            &self.functions,
            &*self.tracer,
            &*self.events,
            self.interrupt.flag(),
            self.version,
        );
        let outcome = round.run(&self.pool, &roots);
        self.transient.extend(round.into_transient());
        if let Err(err) = outcome {
            self.interrupt.clear();
            tracing::info!(%err, "evaluation round aborted");
            return Err(err);
        }

        let mut result = EvaluationResult::default();
        for root in roots {
            let outcome = match (self.graph.value(&root), self.graph.error(&root)) {
                (Some(value), _) => Ok(value),
                (None, Some(error)) => Err((*error).clone()),
                (None, None) => Err(EvalError::Infrastructure {
                    key: root.clone(),
                    error: FunctionError::infrastructure(anyhow::anyhow!(
                        "root finished the round without a result"
                    )),
                }),
            };
            result.insert(root, outcome);
        }
        Ok(result)
    }

    /// Mark `keys` changed and their transitive dependents dirty.
    ///
    /// Call this when the data behind a key changed outside the engine. Nothing is
    /// recomputed until the next [`evaluate`](Self::evaluate); dirty nodes whose
    /// dependencies turn out unchanged are re-validated without running their function.
    /// Injected keys are skipped; use [`inject`](Self::inject) to change them.
    pub fn invalidate(&mut self, keys: impl IntoIterator<Item = K>) -> Vec<Invalidation<K>> {
        self.invalidate_with(keys, InvalidationReason::Manual)
    }

    fn invalidate_with(
        &mut self,
        keys: impl IntoIterator<Item = K>,
        reason: InvalidationReason,
    ) -> Vec<Invalidation<K>> {
        self.version = self.version.next();
        let invalidations = invalidation::invalidate(&self.graph, keys, reason, &*self.tracer);
        tracing::debug!(
            ?reason,
            marked = invalidations.len(),
            version = self.version.0,
            "invalidated"
        );
        invalidations
    }

    /// Set the value of a precomputed input key.
    ///
    /// Injected keys have no function; they are how configuration and other process-wide
    /// inputs enter the graph. Injecting a value equal to the current one changes nothing;
    /// otherwise every transitive dependent is marked dirty. Returns the dirtied nodes.
    pub fn inject(&mut self, key: K, value: V) -> Vec<Invalidation<K>> {
        let entry = self.graph.get_or_create(&key);
        let old_deps = {
            let mut node = entry.lock();
            if node.state == NodeState::Done && node.value.as_deref() == Some(&value) {
                node.injected = true;
                return Vec::new();
            }
            self.version = self.version.next();
            node.value = Some(Arc::new(value));
            node.error = None;
            node.state = NodeState::Done;
            node.injected = true;
            node.last_changed = self.version;
            node.last_evaluated = self.version;
            node.building = None;
            std::mem::take(&mut node.direct_deps)
        };
        self.graph
            .update_reverse_deps(&key, &old_deps, &GroupedKeys::new());

        self.tracer.on_invalidated(&key, InvalidationReason::Injected);
        let mut invalidations = vec![Invalidation::new_source(
            key.clone(),
            InvalidationReason::Injected,
        )];
        invalidation::mark_dependents_dirty(&self.graph, &key, &*self.tracer, &mut invalidations);
        tracing::debug!(?key, marked = invalidations.len(), "injected value");
        invalidations
    }

    /// Remove every node not reachable from `keep` or from an injected key.
    ///
    /// Returns the number of removed nodes. Removed keys are recomputed from scratch if
    /// requested again.
    pub fn prune(&mut self, keep: impl IntoIterator<Item = K>) -> usize {
        let mut stack: Vec<K> = keep.into_iter().collect();
        for entry in self.graph.entries() {
            if entry.lock().injected {
                stack.push(entry.key().clone());
            }
        }

        let mut reachable: ahash::HashSet<K> = ahash::HashSet::default();
        while let Some(key) = stack.pop() {
            if reachable.contains(&key) {
                continue;
            }
            if let Some(deps) = self.graph.direct_deps(&key) {
                stack.extend(deps.iter().filter(|dep| !reachable.contains(dep)).cloned());
            }
            reachable.insert(key);
        }

        let mut removed = 0;
        for key in self.graph.keys() {
            if !reachable.contains(&key) && self.graph.remove(&key) {
                removed += 1;
            }
        }
        for key in &reachable {
            if let Some(entry) = self.graph.get(key) {
                entry
                    .lock()
                    .reverse_deps
                    .retain(|dependent| reachable.contains(dependent));
            }
        }
        self.transient.retain(|key| reachable.contains(key));
        tracing::debug!(removed, kept = reachable.len(), "pruned graph");
        removed
    }

    /// The committed value of `key`, if any.
    pub fn value(&self, key: &K) -> Option<Arc<V>> {
        self.graph.value(key)
    }

    /// The committed error of `key`, if any.
    pub fn error(&self, key: &K) -> Option<Arc<EvalError<K>>> {
        self.graph.error(key)
    }

    /// Current state of `key`'s node.
    pub fn state(&self, key: &K) -> Option<NodeState> {
        self.graph.state(key)
    }

    /// Read access to the graph.
    pub fn graph(&self) -> &GraphStore<K, V> {
        &self.graph
    }

    /// The current graph version.
    pub fn version(&self) -> Version {
        self.version
    }

    /// The configuration the evaluator was built with.
    pub fn config(&self) -> &EvaluatorConfig {
        &self.config
    }

    /// A handle that interrupts the running (or next) evaluation from another thread.
    pub fn interrupt_handle(&self) -> InterruptHandle {
        self.interrupt.clone()
    }
}

// ============================================================================
// Interruption
// ============================================================================

/// Cooperative cancellation of an evaluation round.
///
/// Workers stop taking up new steps once the flag is set; running functions finish. The
/// interrupted `evaluate` returns [`EngineError::Interrupted`] and clears the flag. An
/// interrupt requested while no round is running cancels the next one.
#[derive(Debug, Clone, Default)]
pub struct InterruptHandle {
    flag: Arc<AtomicBool>,
}

impl InterruptHandle {
    /// Request the interruption.
    pub fn interrupt(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    /// Returns true if an interruption is pending.
    pub fn is_interrupted(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }

    pub(crate) fn flag(&self) -> &AtomicBool {
        &self.flag
    }

    pub(crate) fn clear(&self) {
        self.flag.store(false, Ordering::Relaxed);
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Builder for [`Evaluator`].
pub struct EvaluatorBuilder<K: Key, V: Value> {
    config: EvaluatorConfig,
    functions: FunctionRegistry<K, V>,
    injected: Vec<(K, V)>,
    tracer: Arc<dyn Tracer<K>>,
    events: Arc<dyn EventSink<K>>,
}

impl<K: Key, V: Value> Default for EvaluatorBuilder<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Key, V: Value> EvaluatorBuilder<K, V> {
    /// Create a builder with the default configuration and no functions.
    pub fn new() -> Self {
        Self {
            config: EvaluatorConfig::default(),
            functions: FunctionRegistry::default(),
            injected: Vec::new(),
            tracer: Arc::new(NoopTracer),
            events: Arc::new(NoopEventSink),
        }
    }

    /// Replace the configuration.
    pub fn config(mut self, config: EvaluatorConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the worker count.
    pub fn parallelism(mut self, parallelism: usize) -> Self {
        self.config = self.config.with_parallelism(parallelism);
        self
    }

    /// Register the function computing keys of `kind`.
    pub fn function(mut self, kind: K::Kind, function: impl Function<K, V>) -> Self {
        self.functions.insert(kind, Arc::new(function));
        self
    }

    /// Register a closure computing keys of `kind`.
    pub fn function_fn<F>(self, kind: K::Kind, function: F) -> Self
    where
        F: Fn(&K, &mut Environment<'_, K, V>) -> Result<V, ComputeError> + Send + Sync + 'static,
    {
        self.function(kind, FnFunction(function))
    }

    /// Inject a precomputed input before the first evaluation.
    pub fn inject(mut self, key: K, value: V) -> Self {
        self.injected.push((key, value));
        self
    }

    /// Set the tracer. Pass an `Arc` to keep a handle to it.
    pub fn tracer(mut self, tracer: impl Tracer<K>) -> Self {
        self.tracer = Arc::new(tracer);
        self
    }

    /// Set the event sink. Pass an `Arc` to keep a handle to it.
    pub fn event_sink(mut self, sink: impl EventSink<K>) -> Self {
        self.events = Arc::new(sink);
        self
    }

    /// Start the worker pool and build the evaluator.
    pub fn build(self) -> Result<Evaluator<K, V>, EngineError> {
        let parallelism = self.config.parallelism.max(1);
        let prefix = self.config.thread_name.clone();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(parallelism)
            .thread_name(move |index| format!("{}-{}", prefix, index))
            .build()?;
        tracing::debug!(
            parallelism,
            functions = self.functions.len(),
            "evaluator ready"
        );

        let mut evaluator = Evaluator {
            graph: GraphStore::new(),
            functions: self.functions,
            pool,
            config: self.config,
            tracer: self.tracer,
            events: self.events,
            interrupt: InterruptHandle::default(),
            version: Version::ZERO,
            transient: Vec::new(),
        };
        for (key, value) in self.injected {
            evaluator.inject(key, value);
        }
        Ok(evaluator)
    }
}
