//! Scheduler error types.

use thiserror::Error;

/// Errors that can occur while driving a refresh.
///
/// The mutation API never surfaces these: rejected updates are logged and
/// dropped. They show up only where a caller drives the engine directly,
/// such as the async service or the simulator.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("state store error: {0}")]
    State(#[from] plb_state::StateError),

    #[error("search error: {0}")]
    Search(#[from] plb_placement::SearchError),

    #[error("configuration error: {0}")]
    Config(#[from] plb_core::CoreError),

    #[error("background search task failed: {0}")]
    Task(String),

    #[error("service stopped")]
    Stopped,
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
