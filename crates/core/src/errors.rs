//! Error types shared across the Thicket crates

use thiserror::Error;

/// Result type for Thicket operations
pub type Result<T> = std::result::Result<T, GbmError>;

/// Failure kinds surfaced by training, prediction, and persistence
#[derive(Error, Debug)]
pub enum GbmError {
    /// A hyperparameter failed validation at fit start
    #[error("invalid parameter `{name}`: {constraint}, got {value}")]
    InvalidParameter {
        name: &'static str,
        constraint: &'static str,
        value: String,
    },

    /// Malformed training data (missing label, NaN/Inf, negative weight,
    /// feature dimension mismatch)
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// Model structure failed validation
    #[error("model validation failed: {0}")]
    InvalidModel(String),

    /// Checkpoint write or restore failure
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal invariant violation
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for GbmError {
    fn from(err: serde_json::Error) -> Self {
        GbmError::Serialization(err.to_string())
    }
}

impl GbmError {
    /// Shorthand for a parameter-validation failure.
    pub fn param(name: &'static str, constraint: &'static str, value: impl ToString) -> Self {
        GbmError::InvalidParameter {
            name,
            constraint,
            value: value.to_string(),
        }
    }
}
