//! Scatter/gather join for task outcomes.

use tracing::debug;

use assessrun_core::{RunSnapshot, RunStatus, TaskOutcome};

/// Why an outcome was not merged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejected {
    /// Task type is not part of the run.
    NotRequested,
    /// Task type already has an outcome.
    Duplicate,
}

/// Folds task outcomes into a run snapshot, one at a time, in whatever order
/// they complete.
///
/// The aggregator is the only writer of `partial_results`, `errors` and
/// `total_cost`. It never decides `Pending` or `Cancelled`; those belong to
/// the run state machine.
#[derive(Debug, Clone)]
pub struct ResultAggregator {
    snapshot: RunSnapshot,
}

impl ResultAggregator {
    /// Start aggregating on top of an existing snapshot (fresh or resumed).
    pub fn new(snapshot: RunSnapshot) -> Self {
        Self { snapshot }
    }

    /// Merge one outcome and return the derived status.
    pub fn record(&mut self, outcome: TaskOutcome) -> Result<RunStatus, Rejected> {
        if !self.snapshot.requested.contains(&outcome.task_type) {
            debug!(task_type = %outcome.task_type, "Ignoring outcome for unrequested task");
            return Err(Rejected::NotRequested);
        }
        if self.snapshot.is_resolved(&outcome.task_type) {
            debug!(task_type = %outcome.task_type, "Ignoring duplicate outcome");
            return Err(Rejected::Duplicate);
        }

        if outcome.is_success() {
            self.snapshot.total_cost += outcome.cost;
            self.snapshot.partial_results.insert(
                outcome.task_type,
                outcome.payload.unwrap_or(serde_json::Value::Null),
            );
        } else {
            let message = outcome
                .error
                .unwrap_or_else(|| outcome.status.as_str().to_string());
            self.snapshot.errors.insert(outcome.task_type, message);
        }
        Ok(self.status())
    }

    /// Status derived from the current counts.
    pub fn status(&self) -> RunStatus {
        RunStatus::derive(
            self.snapshot.completed_count(),
            self.snapshot.failed_count(),
            self.snapshot.requested_count(),
        )
    }

    /// Returns true once every requested task has an outcome.
    pub fn is_resolved(&self) -> bool {
        self.snapshot.completed_count() + self.snapshot.failed_count()
            >= self.snapshot.requested_count()
    }

    /// Current aggregated state.
    pub fn snapshot(&self) -> &RunSnapshot {
        &self.snapshot
    }

    /// Mutable access for the run state machine (status and timestamps only).
    pub(crate) fn snapshot_mut(&mut self) -> &mut RunSnapshot {
        &mut self.snapshot
    }
}
