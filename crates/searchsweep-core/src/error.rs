//! Error types shared by every SearchSweep crate.

use thiserror::Error;

/// Errors that abort the current invocation.
///
/// Partial resolution (unknown task ids, missing content metadata) is not an
/// error: it is reported through run diagnostics instead.
#[derive(Debug, Error)]
pub enum SweepError {
    /// Missing endpoint, credential or malformed table reference.
    #[error("configuration error: {0}")]
    Config(String),

    /// A required parent entity could not be found.
    #[error("lookup error: {0}")]
    Lookup(String),

    /// A collaborator read or write failed.
    #[error("{op} failed: {message}")]
    External { op: String, message: String },

    /// Malformed input handed to the pipeline.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl SweepError {
    /// Shorthand for an [`SweepError::External`] failure.
    pub fn external(op: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::External {
            op: op.into(),
            message: message.to_string(),
        }
    }

    /// Whether this error stems from configuration (reported with exit code 2).
    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config(_))
    }
}

pub type Result<T> = std::result::Result<T, SweepError>;
