//! Status enums for assessment runs and their tasks.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Status of a single task outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Capability returned a payload.
    Success,
    /// Permanent error, retries exhausted, or capability missing.
    Failed,
    /// Deadline elapsed before the attempt sequence finished.
    TimedOut,
}

impl TaskStatus {
    /// Lowercase label used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
        }
    }
}

/// Status of an assessment run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    /// Run created, no task launched yet.
    #[default]
    Pending,
    /// At least one task launched and some tasks are still outstanding.
    Running,
    /// Every requested task succeeded.
    Completed,
    /// Some but not all requested tasks succeeded.
    Partial,
    /// No requested task succeeded.
    Failed,
    /// Run was cancelled before resolving.
    Cancelled,
}

impl RunStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [RunStatus; 6] = [
        Self::Pending,
        Self::Running,
        Self::Completed,
        Self::Partial,
        Self::Failed,
        Self::Cancelled,
    ];

    /// Derive the aggregate status of a run from its outcome counts.
    ///
    /// This is a pure function: identical counts always yield the same
    /// status. A run with unresolved tasks is `Running`; once every task has
    /// resolved the success count alone decides between `Failed`, `Partial`
    /// and `Completed`.
    pub fn derive(completed: usize, failed: usize, requested: usize) -> Self {
        if completed + failed < requested {
            Self::Running
        } else if completed == 0 {
            Self::Failed
        } else if completed >= requested {
            Self::Completed
        } else {
            Self::Partial
        }
    }

    /// Returns true if the run is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Partial | Self::Failed | Self::Cancelled
        )
    }

    /// Returns true if the run is still active (not terminal).
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// Lowercase label used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Partial => "partial",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_outstanding_is_running() {
        assert_eq!(RunStatus::derive(0, 0, 3), RunStatus::Running);
        assert_eq!(RunStatus::derive(1, 1, 3), RunStatus::Running);
    }

    #[test]
    fn test_derive_no_success_is_failed() {
        assert_eq!(RunStatus::derive(0, 3, 3), RunStatus::Failed);
    }

    #[test]
    fn test_derive_some_success_is_partial() {
        assert_eq!(RunStatus::derive(2, 1, 3), RunStatus::Partial);
    }

    #[test]
    fn test_derive_all_success_is_completed() {
        assert_eq!(RunStatus::derive(3, 0, 3), RunStatus::Completed);
    }

    #[test]
    fn test_derive_empty_run_is_failed() {
        assert_eq!(RunStatus::derive(0, 0, 0), RunStatus::Failed);
    }

    #[test]
    fn test_derive_is_idempotent() {
        for requested in 0..5 {
            for completed in 0..=requested {
                for failed in 0..=(requested - completed) {
                    let first = RunStatus::derive(completed, failed, requested);
                    let second = RunStatus::derive(completed, failed, requested);
                    assert_eq!(first, second);
                }
            }
        }
    }

    #[test]
    fn test_terminal_states() {
        assert!(!RunStatus::Pending.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Partial.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
    }
}
