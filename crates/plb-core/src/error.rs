//! Error types for the core model.

use thiserror::Error;

/// Result type alias for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors produced while parsing expressions or validating configuration.
#[derive(Debug, Error, PartialEq)]
pub enum CoreError {
    #[error("invalid placement expression at offset {offset}: {message}")]
    Expression { offset: usize, message: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
