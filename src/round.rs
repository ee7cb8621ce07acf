//! One evaluation round: drives every node needed by the roots to a committed result.
//!
//! Nodes are stepped by rayon tasks. A step never blocks: a node that needs dependencies
//! registers itself as a waiter on each of them and returns. The last dependency to commit
//! makes the node ready again, and the committing task steps it next. When the pool runs
//! dry with nodes still evaluating, the remaining waits-for graph contains a cycle, which
//! is committed as errors before the pool is restarted.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::cycle;
use crate::env::Attempt;
use crate::function::FunctionRegistry;
use crate::graph::GraphStore;
use crate::node::{Building, Catcher, Node, NodeEntry, Phase};
use crate::{
    ComputeError, EngineError, Environment, EvalError, Event, EventSink, ExecutionResult,
    FunctionError, GroupedKeys, Key, NodeState, Tracer, Transience, Value, Version,
};

type Entry<K, V> = Arc<NodeEntry<K, V>>;

/// What a dependency looked like when a waiter registered on it.
enum Registration<K, V> {
    /// Already committed; nothing to wait for.
    Terminal,
    /// Being evaluated elsewhere; the waiter will be signalled on commit.
    Pending,
    /// Taken up for evaluation by this registration; the caller must schedule it.
    Started(Entry<K, V>),
}

/// What a node does on its next step, decided under its lock.
enum Plan<K> {
    Idle,
    AwaitGroup(Vec<K>),
    CompareGroup {
        group: usize,
        deps: Vec<K>,
        since: Version,
    },
    Revalidated,
    Compute {
        requested: GroupedKeys<K>,
        catchers: Vec<(K, Catcher<K>)>,
        attempt: usize,
    },
}

enum Committed<K, V> {
    Value(V),
    Error(EvalError<K>),
}

pub(crate) struct Round<'a, K: Key, V: Value> {
    graph: &'a GraphStore<K, V>,
    functions: &'a FunctionRegistry<K, V>,
    tracer: &'a dyn Tracer<K>,
    events: &'a dyn EventSink<K>,
    interrupted: &'a AtomicBool,
    version: Version,
    /// Every node taken up in this round, in the order it was started.
    started: Mutex<Vec<Entry<K, V>>>,
    /// Keys committed with transient errors.
    transient: Mutex<Vec<K>>,
}

impl<'a, K: Key, V: Value> Round<'a, K, V> {
    pub(crate) fn new(
        graph: &'a GraphStore<K, V>,
        functions: &'a FunctionRegistry<K, V>,
        tracer: &'a dyn Tracer<K>,
        events: &'a dyn EventSink<K>,
        interrupted: &'a AtomicBool,
        version: Version,
    ) -> Self {
        Self {
            graph,
            functions,
            tracer,
            events,
            interrupted,
            version,
            started: Mutex::new(Vec::new()),
            transient: Mutex::new(Vec::new()),
        }
    }

    /// Keys that failed transiently during the round.
    pub(crate) fn into_transient(self) -> Vec<K> {
        self.transient.into_inner()
    }

    /// Evaluate `roots` (distinct keys) until every one of them is committed.
    pub(crate) fn run(&self, pool: &rayon::ThreadPool, roots: &[K]) -> Result<(), EngineError> {
        let mut ready = Vec::new();
        for root in roots {
            let entry = self.graph.get_or_create(root);
            let started = self.begin(&entry, &mut entry.lock());
            if started {
                self.tracer.on_node_start(root);
                ready.push(entry);
            } else {
                self.tracer.on_node_end(root, ExecutionResult::CacheHit);
            }
        }

        while !ready.is_empty() {
            let batch = std::mem::take(&mut ready);
            pool.scope(|scope| {
                for entry in batch {
                    self.spawn(scope, entry);
                }
            });
            if self.is_interrupted() {
                self.roll_back();
                return Err(EngineError::Interrupted);
            }
            ready = self.break_cycles(roots);
        }
        Ok(())
    }

    fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Relaxed)
    }

    fn spawn<'s>(&'s self, scope: &rayon::Scope<'s>, entry: Entry<K, V>) {
        scope.spawn(move |scope| self.drive(scope, entry));
    }

    /// Step `entry`, then keep stepping whatever became ready, spawning all but one.
    fn drive<'s>(&'s self, scope: &rayon::Scope<'s>, entry: Entry<K, V>) {
        let mut next = Some(entry);
        while let Some(entry) = next.take() {
            if self.is_interrupted() {
                return;
            }
            let mut ready = self.step(&entry).into_iter();
            next = ready.next();
            for other in ready {
                self.spawn(scope, other);
            }
        }
    }

    /// Move a node that needs work into `Evaluating`. Returns true if the caller must
    /// schedule it.
    fn begin(&self, entry: &Entry<K, V>, node: &mut Node<K, V>) -> bool {
        let phase = match node.state {
            NodeState::New | NodeState::Changed => Phase::Computing,
            NodeState::Dirty => Phase::Checking {
                group: 0,
                awaiting: false,
            },
            NodeState::Evaluating | NodeState::Done | NodeState::Error => return false,
        };
        node.building = Some(Building::new(node.state, phase));
        node.state = NodeState::Evaluating;
        self.started.lock().push(entry.clone());
        true
    }

    fn register(&self, dep: &K, waiter: &K) -> Registration<K, V> {
        let entry = self.graph.get_or_create(dep);
        let started = {
            let mut node = entry.lock();
            let started = match node.state {
                NodeState::Done | NodeState::Error => return Registration::Terminal,
                NodeState::Evaluating => false,
                NodeState::New | NodeState::Dirty | NodeState::Changed => {
                    self.begin(&entry, &mut node)
                }
            };
            if let Some(building) = node.building.as_mut() {
                building.waiting.push(waiter.clone());
            }
            started
        };
        if started {
            self.tracer.on_node_start(dep);
            Registration::Started(entry)
        } else {
            Registration::Pending
        }
    }

    /// Count down one pending dependency. Returns true when the node became ready.
    fn release(&self, entry: &Entry<K, V>) -> bool {
        let mut node = entry.lock();
        match node.building.as_mut() {
            Some(building) if building.pending > 0 => {
                building.pending -= 1;
                building.pending == 0
            }
            _ => false,
        }
    }

    fn wake(&self, waiting: Vec<K>) -> Vec<Entry<K, V>> {
        waiting
            .into_iter()
            .filter_map(|key| self.graph.get(&key))
            .filter(|entry| self.release(entry))
            .collect()
    }

    /// Wait for `deps`, returning every node that is ready to be stepped.
    ///
    /// The pending count starts one above the number of dependencies so the node cannot
    /// become ready while registrations are still in flight.
    fn await_deps(&self, entry: &Entry<K, V>, deps: Vec<K>) -> Vec<Entry<K, V>> {
        if let Some(building) = entry.lock().building.as_mut() {
            building.pending = deps.len() + 1;
            building.batch = deps.clone();
        }
        let mut ready = Vec::new();
        for dep in &deps {
            match self.register(dep, entry.key()) {
                Registration::Terminal => {
                    self.release(entry);
                }
                Registration::Pending => {}
                Registration::Started(dep_entry) => ready.push(dep_entry),
            }
        }
        if self.release(entry) {
            ready.push(entry.clone());
        }
        ready
    }

    fn step(&self, entry: &Entry<K, V>) -> Vec<Entry<K, V>> {
        let key = entry.key();
        let plan = {
            let mut guard = entry.lock();
            let node = &mut *guard;
            let since = node.last_evaluated;
            match node.building.as_mut() {
                None => Plan::Idle,
                Some(building) if building.pending > 0 => Plan::Idle,
                Some(building) => match building.phase {
                    Phase::Checking { group, awaiting } => match node.direct_deps.group(group) {
                        None => Plan::Revalidated,
                        Some(deps) if awaiting => Plan::CompareGroup {
                            group,
                            deps: deps.iter().cloned().collect(),
                            since,
                        },
                        Some(deps) => {
                            building.phase = Phase::Checking {
                                group,
                                awaiting: true,
                            };
                            Plan::AwaitGroup(deps.iter().cloned().collect())
                        }
                    },
                    Phase::Computing => {
                        building.batch.clear();
                        Plan::Compute {
                            requested: std::mem::take(&mut building.requested),
                            catchers: std::mem::take(&mut building.catchers),
                            attempt: building.attempts,
                        }
                    }
                },
            }
        };

        match plan {
            Plan::Idle => Vec::new(),
            Plan::AwaitGroup(deps) => self.await_deps(entry, deps),
            Plan::CompareGroup { group, deps, since } => {
                let changed = deps.iter().any(|dep| self.changed_since(dep, since));
                if let Some(building) = entry.lock().building.as_mut() {
                    building.batch.clear();
                    building.phase = if changed {
                        Phase::Computing
                    } else {
                        Phase::Checking {
                            group: group + 1,
                            awaiting: false,
                        }
                    };
                }
                if changed {
                    self.tracer.on_dirty_check(key, true);
                }
                vec![entry.clone()]
            }
            Plan::Revalidated => self.commit_revalidated(entry),
            Plan::Compute {
                requested,
                catchers,
                attempt,
            } => self.compute(entry, requested, catchers, attempt),
        }
    }

    /// Whether `dep` changed after `since`.
    ///
    /// Values and errors are compared the same way, by `last_changed`, so a dependent that
    /// handled an error is re-validated when the error is re-validated.
    fn changed_since(&self, dep: &K, since: Version) -> bool {
        match self.graph.get(dep) {
            Some(entry) => {
                let node = entry.lock();
                !node.state.is_terminal() || node.last_changed > since
            }
            None => true,
        }
    }

    /// The first dependency of `requested`, in request order, that failed without a matching
    /// handler in `catchers`.
    fn first_unhandled_failure(
        &self,
        requested: &GroupedKeys<K>,
        catchers: &[(K, Catcher<K>)],
    ) -> Option<(K, Arc<EvalError<K>>)> {
        let mut handlers: ahash::HashMap<&K, Vec<Catcher<K>>> = ahash::HashMap::default();
        for (key, catcher) in catchers {
            handlers.entry(key).or_default().push(*catcher);
        }
        requested.iter().find_map(|dep| {
            let error = self.graph.error(dep)?;
            let caught = handlers
                .get(dep)
                .is_some_and(|catchers| catchers.iter().any(|catches| catches(&error)));
            (!caught).then(|| (dep.clone(), error))
        })
    }

    fn compute(
        &self,
        entry: &Entry<K, V>,
        requested: GroupedKeys<K>,
        catchers: Vec<(K, Catcher<K>)>,
        attempt: usize,
    ) -> Vec<Entry<K, V>> {
        let key = entry.key();

        // Everything the previous attempt requested is terminal now. A failure without a
        // matching handler fails this key without running the function again.
        if let Some((dependency, cause)) = self.first_unhandled_failure(&requested, &catchers) {
            let error = EvalError::Dependency {
                key: key.clone(),
                dependency,
                cause,
            };
            return self.commit(entry, Committed::Error(error), requested, Vec::new());
        }

        let Some(function) = self.functions.get(key.kind()) else {
            let error = FunctionError::infrastructure(anyhow::anyhow!(
                "no function registered for kind {:?}",
                key.kind()
            ))
            .with_transience(Transience::Persistent);
            let error = EvalError::Infrastructure {
                key: key.clone(),
                error,
            };
            return self.commit(entry, Committed::Error(error), GroupedKeys::new(), Vec::new());
        };

        self.tracer.on_compute(key, attempt);
        let mut env = Environment::new(key, self.graph);
        let result = panic::catch_unwind(AssertUnwindSafe(|| function.compute(key, &mut env)));
        let Attempt {
            requested,
            missing,
            unhandled,
            catchers,
            events,
        } = env.finish();

        let result = match result {
            Ok(result) => result,
            Err(payload) => {
                let message = panic_message(&*payload);
                tracing::error!(?key, %message, "function panicked");
                let error = EvalError::Infrastructure {
                    key: key.clone(),
                    error: FunctionError::infrastructure(anyhow::anyhow!(
                        "function panicked: {}",
                        message
                    )),
                };
                return self.commit(entry, Committed::Error(error), requested, Vec::new());
            }
        };

        // A failed dependency is blamed only once nothing requested is missing, so the blamed
        // key does not depend on which dependencies happened to finish first.
        let failed = match unhandled {
            Some(first) if missing.is_empty() => {
                Some(self.first_unhandled_failure(&requested, &catchers).unwrap_or(first))
            }
            _ => None,
        };
        if let Some((dependency, cause)) = failed {
            let error = EvalError::Dependency {
                key: key.clone(),
                dependency,
                cause,
            };
            return self.commit(entry, Committed::Error(error), requested, Vec::new());
        }

        match result {
            Ok(value) if missing.is_empty() => {
                self.commit(entry, Committed::Value(value), requested, events)
            }
            Ok(_) => {
                tracing::warn!(?key, "function returned a value with dependencies missing");
                self.restart(entry, requested, catchers, missing)
            }
            Err(ComputeError::Incomplete) if missing.is_empty() => {
                let error = EvalError::Infrastructure {
                    key: key.clone(),
                    error: FunctionError::infrastructure(anyhow::anyhow!(
                        "function returned Incomplete without a missing dependency"
                    ))
                    .with_transience(Transience::Persistent),
                };
                self.commit(entry, Committed::Error(error), requested, Vec::new())
            }
            Err(ComputeError::Incomplete) => self.restart(entry, requested, catchers, missing),
            Err(ComputeError::Failed(error)) if !missing.is_empty() => {
                tracing::debug!(?key, %error, "function failed with dependencies missing, restarting");
                self.restart(entry, requested, catchers, missing)
            }
            Err(ComputeError::Failed(error)) => {
                let error = if error.is_infrastructure() {
                    EvalError::Infrastructure {
                        key: key.clone(),
                        error,
                    }
                } else {
                    EvalError::Input {
                        key: key.clone(),
                        error,
                    }
                };
                self.commit(entry, Committed::Error(error), requested, events)
            }
        }
    }

    fn restart(
        &self,
        entry: &Entry<K, V>,
        requested: GroupedKeys<K>,
        catchers: Vec<(K, Catcher<K>)>,
        missing: Vec<K>,
    ) -> Vec<Entry<K, V>> {
        self.tracer.on_restart(entry.key(), &missing);
        if let Some(building) = entry.lock().building.as_mut() {
            building.requested = requested;
            building.catchers = catchers;
            building.attempts += 1;
        }
        self.await_deps(entry, missing)
    }

    fn commit(
        &self,
        entry: &Entry<K, V>,
        committed: Committed<K, V>,
        deps: GroupedKeys<K>,
        events: Vec<Event<K>>,
    ) -> Vec<Entry<K, V>> {
        let waiting = self.record(entry, committed, deps, events);
        self.wake(waiting)
    }

    /// Commit a result without signalling waiters. Returns the waiters.
    fn record(
        &self,
        entry: &Entry<K, V>,
        committed: Committed<K, V>,
        deps: GroupedKeys<K>,
        events: Vec<Event<K>>,
    ) -> Vec<K> {
        let key = entry.key();
        let (old_deps, waiting, result, output_changed) = {
            let mut guard = entry.lock();
            let node = &mut *guard;
            let waiting = node
                .building
                .take()
                .map(|building| building.waiting)
                .unwrap_or_default();
            let (result, output_changed) = match committed {
                Committed::Value(value) => {
                    let unchanged =
                        node.error.is_none() && node.value.as_deref() == Some(&value);
                    if !unchanged {
                        node.value = Some(Arc::new(value));
                        node.last_changed = self.version;
                    }
                    node.error = None;
                    node.state = NodeState::Done;
                    if unchanged {
                        (ExecutionResult::Unchanged, Some(false))
                    } else {
                        (ExecutionResult::Changed, Some(true))
                    }
                }
                Committed::Error(error) => {
                    let result = if error.is_cycle() {
                        ExecutionResult::CycleDetected
                    } else {
                        ExecutionResult::Error {
                            message: error.to_string(),
                        }
                    };
                    if error.transience() == Transience::Transient {
                        self.transient.lock().push(key.clone());
                    }
                    node.value = None;
                    node.error = Some(Arc::new(error));
                    node.state = NodeState::Error;
                    node.last_changed = self.version;
                    (result, None)
                }
            };
            node.last_evaluated = self.version;
            let old_deps = std::mem::replace(&mut node.direct_deps, deps.clone());
            (old_deps, waiting, result, output_changed)
        };

        self.graph.update_reverse_deps(key, &old_deps, &deps);
        if let Some(output_changed) = output_changed {
            self.tracer.on_early_cutoff_check(key, output_changed);
        }
        for event in events {
            self.events.handle(event);
        }
        self.tracer.on_node_end(key, result);
        waiting
    }

    fn commit_revalidated(&self, entry: &Entry<K, V>) -> Vec<Entry<K, V>> {
        let key = entry.key();
        let waiting = {
            let mut node = entry.lock();
            let waiting = node
                .building
                .take()
                .map(|building| building.waiting)
                .unwrap_or_default();
            node.state = if node.error.is_some() {
                NodeState::Error
            } else {
                NodeState::Done
            };
            node.last_evaluated = self.version;
            waiting
        };
        self.tracer.on_dirty_check(key, false);
        self.tracer.on_node_end(key, ExecutionResult::Revalidated);
        self.wake(waiting)
    }

    /// Dependencies to record for a node that is committed while still waiting.
    fn pending_deps(&self, entry: &Entry<K, V>) -> GroupedKeys<K> {
        let node = entry.lock();
        match node.building.as_ref() {
            Some(building) if building.phase == Phase::Computing => building.requested.clone(),
            _ => node.direct_deps.clone(),
        }
    }

    /// Commit cycle errors for every node stuck on a cycle. Returns the nodes made ready.
    ///
    /// Called when the pool is idle. Every node still evaluating then waits on another one,
    /// so the waits-for graph restricted to them contains a cycle.
    fn break_cycles(&self, roots: &[K]) -> Vec<Entry<K, V>> {
        let started = self.started.lock().clone();
        let mut position: ahash::HashMap<K, usize> = ahash::HashMap::default();
        let mut stuck: Vec<Entry<K, V>> = Vec::new();
        // Roots first, so the traversal order only depends on the roots.
        let candidates = roots
            .iter()
            .filter_map(|root| self.graph.get(root))
            .chain(started);
        for entry in candidates {
            if position.contains_key(entry.key()) {
                continue;
            }
            if entry.lock().state == NodeState::Evaluating {
                position.insert(entry.key().clone(), stuck.len());
                stuck.push(entry);
            }
        }
        if stuck.is_empty() {
            return Vec::new();
        }

        let edges: Vec<Vec<usize>> = stuck
            .iter()
            .map(|entry| {
                let batch = entry
                    .lock()
                    .building
                    .as_ref()
                    .map(|building| building.batch.clone())
                    .unwrap_or_default();
                batch
                    .iter()
                    .filter_map(|dep| position.get(dep).copied())
                    .collect()
            })
            .collect();
        let keys: Vec<K> = stuck.iter().map(|entry| entry.key().clone()).collect();
        let components = cycle::cyclic_components(&edges);

        let mut waiting = Vec::new();
        if components.is_empty() {
            tracing::error!(stuck = stuck.len(), "evaluation stalled without a cycle");
            for entry in &stuck {
                let error = EvalError::Infrastructure {
                    key: entry.key().clone(),
                    error: FunctionError::infrastructure(anyhow::anyhow!("evaluation stalled")),
                };
                let deps = self.pending_deps(entry);
                waiting.extend(self.record(entry, Committed::Error(error), deps, Vec::new()));
            }
        }
        for component in &components {
            let cycle_keys: Vec<K> = component.iter().map(|&i| keys[i].clone()).collect();
            tracing::debug!(cycle = ?cycle_keys, "breaking dependency cycle");
            self.tracer.on_cycle_detected(&cycle_keys);
            // Commit every member before waking anyone, so no member observes another
            // member's error as a plain dependency failure.
            let infos = cycle::describe_component(component, &edges, &keys);
            for (&member, info) in component.iter().zip(infos) {
                let error = EvalError::Cycle {
                    key: keys[member].clone(),
                    info,
                };
                let deps = self.pending_deps(&stuck[member]);
                waiting.extend(self.record(&stuck[member], Committed::Error(error), deps, Vec::new()));
            }
        }
        self.wake(waiting)
    }

    /// Return every node left evaluating to the state it had before the round.
    fn roll_back(&self) {
        let started = std::mem::take(&mut *self.started.lock());
        let mut rolled_back = 0;
        for entry in started {
            let mut node = entry.lock();
            if node.state != NodeState::Evaluating {
                continue;
            }
            if let Some(building) = node.building.take() {
                node.state = building.prior;
                rolled_back += 1;
            }
        }
        tracing::debug!(rolled_back, "round interrupted");
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
