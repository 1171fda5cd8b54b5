//! Core domain errors.

use std::time::Duration;

use thiserror::Error;

use crate::{RunId, RunStatus};

/// Core domain errors for AssessRun.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    /// Run not found.
    #[error("Run not found: {0}")]
    RunNotFound(RunId),

    /// Run already reached a terminal state.
    #[error("Run {run_id} is already terminal ({status})")]
    RunAlreadyTerminal { run_id: RunId, status: RunStatus },

    /// No global dispatch slot is free; the item stays queued.
    #[error("Scheduler at capacity ({capacity} concurrent runs)")]
    SchedulerCapacity { capacity: usize },

    /// Invalid input.
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

/// Failure raised by a capability or by the deadline wrapped around it.
///
/// The `Display` output is what ends up in a run's `errors` map.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    /// Network or rate-limit class failure; eligible for retry.
    #[error("{0}")]
    Transient(String),

    /// Invalid or unsupported input; never retried.
    #[error("{0}")]
    Permanent(String),

    /// Deadline exceeded; never retried.
    #[error("timed out after {}", format_duration(*.0))]
    Timeout(Duration),
}

impl TaskError {
    /// Create a transient error.
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    /// Create a permanent error.
    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    /// Returns true if the executor may retry after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Render a duration compactly: whole seconds as `5s`, otherwise `1500ms`.
pub fn format_duration(d: Duration) -> String {
    if d.subsec_millis() == 0 && d.as_secs() > 0 {
        format!("{}s", d.as_secs())
    } else {
        format!("{}ms", d.as_millis())
    }
}
