//! Error types for the cluster state store.

use thiserror::Error;

/// Result type alias for state store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur while applying a mutation to the store.
///
/// None of these leave the store modified: a rejected mutation is a no-op.
#[derive(Debug, Error, PartialEq)]
pub enum StateError {
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid placement constraint for service {service}: {source}")]
    InvalidConstraint {
        service: String,
        #[source]
        source: plb_core::CoreError,
    },
}
