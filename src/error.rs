//! Error types for function evaluation.

use std::fmt::{self, Debug};
use std::marker::PhantomData;
use std::ops::Deref;
use std::sync::Arc;

/// Whether a failure may be cached across evaluation rounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Transience {
    /// Caching the failure is safe; it only changes when a relevant input is invalidated.
    #[default]
    Persistent,
    /// The failure must be re-attempted on the next `evaluate`.
    Transient,
}

/// A failure raised by a function.
///
/// User errors are carried as `anyhow::Error`, so any error type converts with `?`:
///
/// ```ignore
/// fn compute(&self, key: &BuildKey, env: &mut Environment<'_, BuildKey, BuildValue>)
///     -> Result<BuildValue, ComputeError>
/// {
///     let n: u32 = text.parse()?; // ParseIntError -> persistent input failure
///     // ...
/// }
/// ```
#[derive(Debug, Clone)]
pub struct FunctionError {
    error: Arc<anyhow::Error>,
    transience: Transience,
    infrastructure: bool,
}

impl FunctionError {
    /// A persistent input failure.
    pub fn new(error: impl Into<anyhow::Error>) -> Self {
        Self {
            error: Arc::new(error.into()),
            transience: Transience::Persistent,
            infrastructure: false,
        }
    }

    /// A transient input failure, retried on the next round.
    pub fn transient(error: impl Into<anyhow::Error>) -> Self {
        Self::new(error).with_transience(Transience::Transient)
    }

    /// An engine-side failure. Transient unless overridden.
    pub fn infrastructure(error: impl Into<anyhow::Error>) -> Self {
        Self {
            error: Arc::new(error.into()),
            transience: Transience::Transient,
            infrastructure: true,
        }
    }

    pub(crate) fn from_shared(error: Arc<anyhow::Error>) -> Self {
        Self {
            error,
            transience: Transience::Persistent,
            infrastructure: false,
        }
    }

    /// Replace the transience classification.
    #[must_use]
    pub fn with_transience(mut self, transience: Transience) -> Self {
        self.transience = transience;
        self
    }

    /// The transience classification.
    pub fn transience(&self) -> Transience {
        self.transience
    }

    /// Returns true for engine-side failures.
    pub fn is_infrastructure(&self) -> bool {
        self.infrastructure
    }

    /// The underlying error.
    pub fn error(&self) -> &Arc<anyhow::Error> {
        &self.error
    }

    /// Attempts to downcast the underlying error to a specific type.
    pub fn downcast_ref<E: std::error::Error + Send + Sync + 'static>(&self) -> Option<&E> {
        self.error.downcast_ref::<E>()
    }

    /// Returns `true` if the underlying error is an `E`.
    pub fn is<E: std::error::Error + Send + Sync + 'static>(&self) -> bool {
        self.downcast_ref::<E>().is_some()
    }
}

impl fmt::Display for FunctionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)
    }
}

/// What a function returns instead of a value.
///
/// `Incomplete` asks the engine to re-run the function from the beginning once every missing
/// dependency is available. `Failed` ends the evaluation of the key with an error.
#[derive(Debug, Clone)]
pub enum ComputeError {
    /// One or more requested dependencies are not available yet.
    Incomplete,
    /// The function failed.
    Failed(FunctionError),
}

impl fmt::Display for ComputeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComputeError::Incomplete => write!(f, "dependencies missing, restart required"),
            ComputeError::Failed(e) => write!(f, "function failed: {}", e),
        }
    }
}

impl<T: Into<anyhow::Error>> From<T> for ComputeError {
    fn from(err: T) -> Self {
        ComputeError::Failed(FunctionError::new(err))
    }
}

impl From<FunctionError> for ComputeError {
    fn from(err: FunctionError) -> Self {
        ComputeError::Failed(err)
    }
}

impl<E> From<TypedErr<E>> for ComputeError {
    /// Rethrow a narrowed dependency failure as this function's own failure.
    fn from(err: TypedErr<E>) -> Self {
        ComputeError::Failed(FunctionError::from_shared(err.arc))
    }
}

/// A dependency cycle found among in-progress nodes.
///
/// Only members of the cycle report it. A node that merely depends on the cycle fails with a
/// dependency error, and [`EvalError::chain`] is its path to the cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleInfo<K> {
    /// The keys forming the cycle, in dependency order, starting at the reporting node.
    pub cycle: Vec<K>,
}

impl<K: Debug> fmt::Display for CycleInfo<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dependency cycle detected: ")?;
        for key in &self.cycle {
            write!(f, "{:?} -> ", key)?;
        }
        match self.cycle.first() {
            Some(first) => write!(f, "{:?}", first),
            None => write!(f, "?"),
        }
    }
}

/// Error recorded for a key.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EvalError<K> {
    /// The key's own function failed.
    #[error("{key:?}: {error}")]
    Input {
        /// The failing key.
        key: K,
        /// What the function reported.
        error: FunctionError,
    },

    /// A required dependency failed and the failure was not handled.
    #[error("{key:?}: dependency {dependency:?} failed")]
    Dependency {
        /// The failing key.
        key: K,
        /// The dependency whose failure propagated.
        dependency: K,
        /// The dependency's error.
        cause: Arc<EvalError<K>>,
    },

    /// The key takes part in, or depends on, a dependency cycle.
    #[error("{key:?}: {info}")]
    Cycle {
        /// The reporting key.
        key: K,
        /// Where the cycle is.
        info: CycleInfo<K>,
    },

    /// Engine-side failure while evaluating the key.
    #[error("{key:?}: infrastructure failure: {error}")]
    Infrastructure {
        /// The failing key.
        key: K,
        /// What went wrong.
        error: FunctionError,
    },
}

impl<K> EvalError<K> {
    /// The key this error is recorded for.
    pub fn key(&self) -> &K {
        match self {
            EvalError::Input { key, .. }
            | EvalError::Dependency { key, .. }
            | EvalError::Cycle { key, .. }
            | EvalError::Infrastructure { key, .. } => key,
        }
    }

    /// The deepest non-dependency error behind this one.
    pub fn root_cause(&self) -> &EvalError<K> {
        let mut current = self;
        while let EvalError::Dependency { cause, .. } = current {
            current = cause;
        }
        current
    }

    /// Keys from this error down to its root cause, both ends included.
    pub fn chain(&self) -> Vec<&K> {
        let mut keys = vec![self.key()];
        let mut current = self;
        while let EvalError::Dependency { cause, .. } = current {
            keys.push(cause.key());
            current = cause;
        }
        keys
    }

    /// Whether the error may be cached across rounds.
    pub fn transience(&self) -> Transience {
        match self.root_cause() {
            EvalError::Input { error, .. } | EvalError::Infrastructure { error, .. } => {
                error.transience()
            }
            EvalError::Cycle { .. } => Transience::Transient,
            EvalError::Dependency { .. } => unreachable!("root cause is never a dependency error"),
        }
    }

    /// The function error at the root of the chain, if the root is not a cycle.
    pub fn function_error(&self) -> Option<&FunctionError> {
        match self.root_cause() {
            EvalError::Input { error, .. } | EvalError::Infrastructure { error, .. } => Some(error),
            _ => None,
        }
    }

    /// The cycle at the root of the chain, if any.
    pub fn cycle(&self) -> Option<&CycleInfo<K>> {
        match self.root_cause() {
            EvalError::Cycle { info, .. } => Some(info),
            _ => None,
        }
    }

    /// Returns true if the root cause is a cycle.
    pub fn is_cycle(&self) -> bool {
        self.cycle().is_some()
    }

    /// Attempts to downcast the root user error to a specific type.
    pub fn downcast_ref<E: std::error::Error + Send + Sync + 'static>(&self) -> Option<&E> {
        self.function_error().and_then(|e| e.downcast_ref::<E>())
    }
}

/// Failures of a whole `evaluate` call.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The round was interrupted through an [`InterruptHandle`](crate::InterruptHandle).
    #[error("evaluation interrupted")]
    Interrupted,

    /// The worker pool could not be created.
    #[error("failed to start worker pool: {0}")]
    WorkerPool(#[from] rayon::ThreadPoolBuildError),
}

/// A typed wrapper around a dependency's user error that provides `Deref` access to it.
///
/// Returned by [`Environment::get_value_or_throw`](crate::Environment::get_value_or_throw) when
/// the dependency failed with an error of type `E`.
pub struct TypedErr<E> {
    arc: Arc<anyhow::Error>,
    _marker: PhantomData<fn() -> E>,
}

impl<E> Clone for TypedErr<E> {
    fn clone(&self) -> Self {
        Self {
            arc: self.arc.clone(),
            _marker: PhantomData,
        }
    }
}

impl<E: std::error::Error + Send + Sync + 'static> TypedErr<E> {
    pub(crate) fn new(arc: Arc<anyhow::Error>) -> Option<Self> {
        if arc.downcast_ref::<E>().is_some() {
            Some(Self {
                arc,
                _marker: PhantomData,
            })
        } else {
            None
        }
    }

    /// Returns a reference to the inner error.
    pub fn get(&self) -> &E {
        match self.arc.downcast_ref::<E>() {
            Some(e) => e,
            // `new` only accepts errors that downcast to `E`.
            None => unreachable!("TypedErr holds an error of another type"),
        }
    }
}

impl<E: std::error::Error + Send + Sync + 'static> Deref for TypedErr<E> {
    type Target = E;

    fn deref(&self) -> &E {
        self.get()
    }
}

impl<E: std::error::Error + Send + Sync + 'static> fmt::Debug for TypedErr<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.get(), f)
    }
}

impl<E: std::error::Error + Send + Sync + 'static> fmt::Display for TypedErr<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self.get(), f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct NotFound(String);

    impl fmt::Display for NotFound {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "not found: {}", self.0)
        }
    }

    impl std::error::Error for NotFound {}

    fn input(key: &'static str, error: FunctionError) -> EvalError<&'static str> {
        EvalError::Input { key, error }
    }

    #[test]
    fn question_mark_converts_user_errors() {
        fn parse(text: &str) -> Result<u32, ComputeError> {
            Ok(text.parse::<u32>()?)
        }

        match parse("nope") {
            Err(ComputeError::Failed(e)) => {
                assert_eq!(e.transience(), Transience::Persistent);
                assert!(!e.is_infrastructure());
                assert!(e.is::<std::num::ParseIntError>());
            }
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[test]
    fn root_cause_and_chain_walk_dependency_errors() {
        let root = input("file", FunctionError::new(NotFound("BUILD".into())));
        let mid = EvalError::Dependency {
            key: "pkg",
            dependency: "file",
            cause: Arc::new(root),
        };
        let top = EvalError::Dependency {
            key: "target",
            dependency: "pkg",
            cause: Arc::new(mid),
        };

        assert_eq!(*top.root_cause().key(), "file");
        assert_eq!(top.chain(), vec![&"target", &"pkg", &"file"]);
        assert_eq!(top.transience(), Transience::Persistent);
        assert_eq!(top.downcast_ref::<NotFound>(), Some(&NotFound("BUILD".into())));
        assert!(!top.is_cycle());
    }

    #[test]
    fn cycles_are_transient() {
        let err = EvalError::Cycle {
            key: "a",
            info: CycleInfo {
                cycle: vec!["a", "b"],
            },
        };
        assert_eq!(err.transience(), Transience::Transient);
        assert!(err.is_cycle());
        assert!(err.to_string().contains("\"a\" -> \"b\" -> \"a\""));
    }

    #[test]
    fn typed_err_only_wraps_matching_types() {
        let arc = Arc::new(anyhow::Error::from(NotFound("x".into())));
        let typed = TypedErr::<NotFound>::new(arc.clone()).expect("matching type");
        assert_eq!(typed.0, "x");
        assert!(TypedErr::<std::num::ParseIntError>::new(arc).is_none());
    }

    #[test]
    fn rethrown_typed_errors_keep_their_type() {
        let arc = Arc::new(anyhow::Error::from(NotFound("y".into())));
        let typed = TypedErr::<NotFound>::new(arc).expect("matching type");
        match ComputeError::from(typed) {
            ComputeError::Failed(e) => assert!(e.is::<NotFound>()),
            other => panic!("expected failure, got {:?}", other),
        }
    }
}
