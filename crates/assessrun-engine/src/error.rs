//! Engine-level errors surfaced by the scheduler API.

use thiserror::Error;

use assessrun_core::{CoreError, RunId, TaskType};

use crate::config::ConfigError;
use crate::session::SessionError;

/// Errors returned by scheduler operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Unknown task types: {}", join(.0))]
    UnknownTaskTypes(Vec<TaskType>),

    #[error("No runnable task types in request")]
    NoRunnableTasks,

    #[error("Run {0} is held by another orchestrator")]
    RunLeaseHeld(RunId),

    #[error("Run {0} is already scheduled")]
    AlreadyScheduled(RunId),

    #[error("Run {0} is not scheduled by this engine")]
    NotScheduled(RunId),
}

impl EngineError {
    /// Shorthand for `CoreError::RunNotFound`.
    pub fn not_found(run_id: &RunId) -> Self {
        Self::Core(CoreError::RunNotFound(run_id.clone()))
    }

    /// Returns true if the request itself was rejected, as opposed to an
    /// infrastructure failure.
    pub fn is_invalid_request(&self) -> bool {
        matches!(
            self,
            Self::Core(CoreError::InvalidInput(_))
                | Self::UnknownTaskTypes(_)
                | Self::NoRunnableTasks
        )
    }
}

fn join(types: &[TaskType]) -> String {
    types
        .iter()
        .map(TaskType::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}
