//! Evalgraph: a restart-based, memoizing, incremental evaluation engine.
//!
//! Computations are identified by [`Key`]s. For each key kind a [`Function`] computes the
//! key's value, requesting other keys through an [`Environment`]. Requests never block: a
//! dependency that is not available yet makes the function return
//! [`ComputeError::Incomplete`], and the engine re-runs it from the beginning once the
//! missing dependencies are computed. The dependencies a function actually requested are
//! recorded in the graph.
//!
//! # Key Features
//!
//! - **Memoization**: every key is computed at most once per graph version
//! - **Incremental re-evaluation**: [`Evaluator::invalidate`] marks keys changed and their
//!   dependents dirty; dirty nodes re-check their dependencies group by group
//! - **Change pruning**: a recomputed value equal to the previous one does not invalidate
//!   dependents
//! - **Parallelism**: independent keys are evaluated on a bounded worker pool
//! - **Structured errors**: failures propagate as [`EvalError`]s; a function may handle a
//!   typed dependency failure through [`Environment::get_value_or_throw`]
//! - **Cycle detection**: every node on, or waiting for, a dependency cycle fails with a
//!   cycle error instead of deadlocking
//!
//! # Example
//!
//! ```
//! use evalgraph::{ComputeError, Environment, Evaluator, Key};
//!
//! #[derive(Clone, Debug, Hash, PartialEq, Eq)]
//! enum Calc {
//!     Input(&'static str),
//!     Sum(Vec<&'static str>),
//! }
//!
//! impl Key for Calc {
//!     type Kind = u8;
//!
//!     fn kind(&self) -> u8 {
//!         match self {
//!             Calc::Input(_) => 0,
//!             Calc::Sum(_) => 1,
//!         }
//!     }
//! }
//!
//! fn sum(key: &Calc, env: &mut Environment<'_, Calc, i64>) -> Result<i64, ComputeError> {
//!     let Calc::Sum(names) = key else { unreachable!() };
//!     // One group: all inputs are fetched in parallel, with a single restart.
//!     let values = env.get_values(names.iter().map(|&n| Calc::Input(n)));
//!     env.check_missing()?;
//!     Ok(values.into_iter().flatten().map(|v| *v).sum())
//! }
//!
//! let mut evaluator = Evaluator::<Calc, i64>::builder()
//!     .function_fn(1, sum)
//!     .inject(Calc::Input("a"), 1)
//!     .inject(Calc::Input("b"), 2)
//!     .build()
//!     .unwrap();
//!
//! let total = Calc::Sum(vec!["a", "b"]);
//! let result = evaluator.evaluate([total.clone()]).unwrap();
//! assert_eq!(**result.value(&total).unwrap(), 3);
//!
//! evaluator.inject(Calc::Input("b"), 5);
//! let result = evaluator.evaluate([total.clone()]).unwrap();
//! assert_eq!(**result.value(&total).unwrap(), 6);
//! ```

#![warn(missing_docs)]

mod config;
mod cycle;
mod env;
mod error;
mod evaluator;
mod events;
mod function;
mod graph;
mod invalidation;
mod key;
pub mod metadata;
mod node;
mod result;
mod round;
pub mod tracer;
mod version;

pub use config::EvaluatorConfig;
pub use env::Environment;
pub use error::{
    ComputeError, CycleInfo, EngineError, EvalError, FunctionError, Transience, TypedErr,
};
pub use evaluator::{Evaluator, EvaluatorBuilder, InterruptHandle};
pub use events::{Event, EventKind, EventSink, NoopEventSink, StoredEvents};
pub use function::Function;
pub use graph::{GraphStore, Inconsistency};
pub use invalidation::{Invalidation, InvalidationReason};
pub use key::{GroupedKeys, Key, Value};
pub use node::NodeState;
pub use result::EvaluationResult;
pub use tracer::{ExecutionResult, LogTracer, NoopTracer, Tracer};
pub use version::Version;
