//! Search error types.

use thiserror::Error;

/// Result type alias for search operations.
pub type SearchResult<T> = Result<T, SearchError>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SearchError {
    /// A critical update arrived; the candidate solution was discarded.
    #[error("search interrupted after {iterations} iterations")]
    Interrupted { iterations: u64 },
}
