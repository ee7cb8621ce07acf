//! Tracer trait for observing evaluation.
//!
//! This module defines the [`Tracer`] trait and related types for observing what the
//! evaluator does with each node. The default [`NoopTracer`] costs nothing; [`LogTracer`]
//! forwards every callback to the `tracing` crate.
//!
//! # Example
//!
//! ```ignore
//! use evalgraph::{ExecutionResult, Tracer};
//!
//! struct PrintTracer;
//!
//! impl<K: std::fmt::Debug> Tracer<K> for PrintTracer {
//!     fn on_node_end(&self, key: &K, result: ExecutionResult) {
//!         println!("{:?} -> {:?}", key, result);
//!     }
//! }
//!
//! let evaluator = Evaluator::<BuildKey, BuildValue>::builder()
//!     .tracer(PrintTracer)
//!     .build()?;
//! ```

use std::fmt::Debug;
use std::sync::Arc;

use crate::invalidation::InvalidationReason;

/// How a node left the current round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionResult {
    /// The function ran and produced a value different from the previous one.
    Changed,
    /// The function ran and produced a value equal to the previous one (early cutoff).
    Unchanged,
    /// The node was dirty, but every dependency re-validated unchanged; the function did not run.
    Revalidated,
    /// The node was already valid.
    CacheHit,
    /// The node is part of, or depends on, a dependency cycle.
    CycleDetected,
    /// The node failed.
    Error {
        /// Rendered error.
        message: String,
    },
}

/// Tracer trait for observing evaluation.
///
/// All methods have default empty implementations, so you only need to override the events
/// you're interested in.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync` as the tracer is called from every worker thread.
pub trait Tracer<K>: Send + Sync + 'static {
    /// Called when an evaluation round starts.
    #[inline]
    fn on_round_start(&self, _roots: &[K]) {}

    /// Called when a node is taken up for evaluation in the current round.
    #[inline]
    fn on_node_start(&self, _key: &K) {}

    /// Called right before a function is invoked. `attempt` counts from zero.
    #[inline]
    fn on_compute(&self, _key: &K, _attempt: usize) {}

    /// Called when a function returned `Incomplete` and will be restarted.
    #[inline]
    fn on_restart(&self, _key: &K, _missing: &[K]) {}

    /// Called when a dirty node finished re-validating its dependencies.
    #[inline]
    fn on_dirty_check(&self, _key: &K, _changed: bool) {}

    /// Called when early cutoff comparison is performed.
    #[inline]
    fn on_early_cutoff_check(&self, _key: &K, _output_changed: bool) {}

    /// Called when a node commits.
    #[inline]
    fn on_node_end(&self, _key: &K, _result: ExecutionResult) {}

    /// Called when a node is marked changed or dirty.
    #[inline]
    fn on_invalidated(&self, _key: &K, _reason: InvalidationReason) {}

    /// Called when a dependency cycle is detected.
    #[inline]
    fn on_cycle_detected(&self, _cycle: &[K]) {}
}

/// Zero-cost tracer that discards all events.
///
/// This is the default tracer for [`Evaluator`](crate::Evaluator).
pub struct NoopTracer;

impl<K> Tracer<K> for NoopTracer {}

impl<K, T: Tracer<K>> Tracer<K> for Arc<T> {
    fn on_round_start(&self, roots: &[K]) {
        (**self).on_round_start(roots)
    }

    fn on_node_start(&self, key: &K) {
        (**self).on_node_start(key)
    }

    fn on_compute(&self, key: &K, attempt: usize) {
        (**self).on_compute(key, attempt)
    }

    fn on_restart(&self, key: &K, missing: &[K]) {
        (**self).on_restart(key, missing)
    }

    fn on_dirty_check(&self, key: &K, changed: bool) {
        (**self).on_dirty_check(key, changed)
    }

    fn on_early_cutoff_check(&self, key: &K, output_changed: bool) {
        (**self).on_early_cutoff_check(key, output_changed)
    }

    fn on_node_end(&self, key: &K, result: ExecutionResult) {
        (**self).on_node_end(key, result)
    }

    fn on_invalidated(&self, key: &K, reason: InvalidationReason) {
        (**self).on_invalidated(key, reason)
    }

    fn on_cycle_detected(&self, cycle: &[K]) {
        (**self).on_cycle_detected(cycle)
    }
}

/// Tracer forwarding every callback to `tracing` at `trace`/`debug` level.
pub struct LogTracer;

impl<K: Debug> Tracer<K> for LogTracer {
    fn on_round_start(&self, roots: &[K]) {
        tracing::debug!(roots = roots.len(), "round start");
    }

    fn on_node_start(&self, key: &K) {
        tracing::trace!(?key, "node start");
    }

    fn on_compute(&self, key: &K, attempt: usize) {
        tracing::trace!(?key, attempt, "compute");
    }

    fn on_restart(&self, key: &K, missing: &[K]) {
        tracing::trace!(?key, missing = missing.len(), "restart scheduled");
    }

    fn on_dirty_check(&self, key: &K, changed: bool) {
        tracing::trace!(?key, changed, "dirty check");
    }

    fn on_early_cutoff_check(&self, key: &K, output_changed: bool) {
        tracing::trace!(?key, output_changed, "early cutoff check");
    }

    fn on_node_end(&self, key: &K, result: ExecutionResult) {
        tracing::debug!(?key, ?result, "node end");
    }

    fn on_invalidated(&self, key: &K, reason: InvalidationReason) {
        tracing::debug!(?key, ?reason, "invalidated");
    }

    fn on_cycle_detected(&self, cycle: &[K]) {
        tracing::warn!(?cycle, "dependency cycle detected");
    }
}
