//! Error types for trueno-xfold
//!
//! Toyota Way: Clear error messages with actionable guidance (Respect for People)
//!
//! Every variant here is fatal for the current run. Recoverable conditions
//! (an absent systematic variant, an output directory that already exists)
//! never reach this enum; they are logged and skipped at the call site.

use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// trueno-xfold error types
#[derive(Error, Debug)]
pub enum Error {
    /// A required input (source directory, sample or model artifact) is absent
    #[error("Missing required input: {0}")]
    MissingInput(String),

    /// A consistency check between counts failed (critical bug or corrupt input)
    #[error("Count mismatch in {context}: expected {expected}, got {actual}")]
    CountMismatch {
        /// Where the check was performed
        context: String,
        /// Expected count
        expected: usize,
        /// Observed count
        actual: usize,
    },

    /// Loss became NaN or infinite during training
    #[error("Numerical divergence at step {step}: loss = {loss}\nCheck input scaling, weights and learning rate; no retry is attempted.")]
    NumericalDivergence {
        /// Training step at which the loss was observed
        step: u64,
        /// The offending loss value
        loss: f32,
    },

    /// Selection expression could not be parsed or evaluated
    #[error("Expression error: {0}")]
    Expression(String),

    /// Invalid input (configuration, shapes, labels)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Storage error (Parquet/Arrow)
    #[error("Storage error: {0}")]
    StorageError(String),

    /// JSON (de)serialization of an artifact or config failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Arrow/Parquet error
    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    /// Generic error
    #[error("{0}")]
    Other(String),
}
