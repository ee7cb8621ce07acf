//! Evaluator configuration.

/// Configuration of an [`Evaluator`](crate::Evaluator).
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct EvaluatorConfig {
    /// Maximum number of functions running at once. At least 1.
    pub parallelism: usize,

    /// Prefix of worker thread names; threads are named `{prefix}-{index}`.
    pub thread_name: String,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            parallelism: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            thread_name: "evalgraph-worker".to_string(),
        }
    }
}

impl EvaluatorConfig {
    /// Configuration running every function on a single worker.
    pub fn sequential() -> Self {
        Self::default().with_parallelism(1)
    }

    // === Builder methods ===

    /// Set the worker count. Zero is treated as one.
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    /// Set the worker thread name prefix.
    pub fn with_thread_name(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name = prefix.into();
        self
    }
}
