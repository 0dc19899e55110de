use thiserror::Error;

/// Errors surfaced by heterogeneous-agent blocks.
///
/// Configuration problems are caught when a block is built. Everything else is
/// raised by the operation that detected it and is never retried internally.
#[derive(Debug, Error)]
pub enum HetBlockError {
    /// Malformed backward function declaration or shock request.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A required key was absent from the supplied inputs.
    #[error("Missing input '{key}' for {context}")]
    MissingInput { key: String, context: String },

    /// Backward or forward iteration ran out of iterations.
    #[error(
        "No convergence of {solver} after {max_iterations} iterations (max abs diff = {residual:e})"
    )]
    Convergence {
        solver: &'static str,
        max_iterations: usize,
        residual: f64,
    },

    /// Grid or Markov input that breaks the discretization (non-monotonic grid, non-stochastic rows).
    #[error("Numerical degeneracy: {0}")]
    NumericalDegeneracy(String),

    /// A value had the wrong kind or shape for the operation.
    #[error("Shape mismatch: {0}")]
    Shape(String),

    #[error("Invalid settings: {0}")]
    InvalidSettings(String),

    /// The user backward function itself failed.
    #[error("Backward function '{function}' failed: {source}")]
    Backward {
        function: String,
        #[source]
        source: anyhow::Error,
    },
}

pub type Result<T> = std::result::Result<T, HetBlockError>;

impl HetBlockError {
    pub(crate) fn missing(key: impl Into<String>, context: impl Into<String>) -> Self {
        HetBlockError::MissingInput {
            key: key.into(),
            context: context.into(),
        }
    }

    /// Recovers a crate error that travelled through a backward function as `anyhow::Error`.
    pub(crate) fn from_backward(function: &str, err: anyhow::Error) -> Self {
        match err.downcast::<HetBlockError>() {
            Ok(inner) => inner,
            Err(source) => HetBlockError::Backward {
                function: function.to_string(),
                source,
            },
        }
    }
}
