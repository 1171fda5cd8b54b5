//! Assessment run records and read views.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Cost, OrchestratorId, Payload, Priority, RunId, RunStatus, Target, TaskType};

/// Request to assess one target with a set of task types.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRequest {
    /// What to assess.
    pub target: Target,

    /// Task types to run against the target.
    pub task_types: Vec<TaskType>,

    /// Dispatch priority.
    #[serde(default)]
    pub priority: Priority,
}

impl RunRequest {
    /// Create a new run request.
    pub fn new(target: Target, task_types: Vec<TaskType>, priority: Priority) -> Self {
        Self {
            target,
            task_types,
            priority,
        }
    }
}

/// Full state of one assessment run, as persisted in the session store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSnapshot {
    /// Unique run identifier.
    pub run_id: RunId,

    /// What is being assessed.
    pub target: Target,

    /// Task types the run will resolve.
    pub requested: BTreeSet<TaskType>,

    /// Dispatch priority.
    pub priority: Priority,

    /// Current run status.
    pub status: RunStatus,

    /// When the run was submitted.
    pub created_at: DateTime<Utc>,

    /// When the first task launched.
    pub started_at: Option<DateTime<Utc>>,

    /// When the run reached a terminal state.
    pub completed_at: Option<DateTime<Utc>>,

    /// Payloads of successful tasks.
    pub partial_results: BTreeMap<TaskType, Payload>,

    /// Error messages of failed or timed out tasks.
    pub errors: BTreeMap<TaskType, String>,

    /// Sum of successful task costs.
    pub total_cost: Cost,

    /// Orchestrator currently driving the run, if any.
    #[serde(default)]
    pub owner: Option<OrchestratorId>,
}

impl RunSnapshot {
    /// Create a pending run.
    pub fn new(
        target: Target,
        requested: impl IntoIterator<Item = TaskType>,
        priority: Priority,
    ) -> Self {
        Self {
            run_id: RunId::generate(),
            target,
            requested: requested.into_iter().collect(),
            priority,
            status: RunStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            partial_results: BTreeMap::new(),
            errors: BTreeMap::new(),
            total_cost: Cost::ZERO,
            owner: None,
        }
    }

    /// Builder method to set a specific ID (useful for testing).
    pub fn with_id(mut self, run_id: RunId) -> Self {
        self.run_id = run_id;
        self
    }

    /// Number of successful tasks.
    pub fn completed_count(&self) -> usize {
        self.partial_results.len()
    }

    /// Number of failed or timed out tasks.
    pub fn failed_count(&self) -> usize {
        self.errors.len()
    }

    /// Number of requested tasks.
    pub fn requested_count(&self) -> usize {
        self.requested.len()
    }

    /// Returns true if the task type already has an outcome.
    pub fn is_resolved(&self, task_type: &TaskType) -> bool {
        self.partial_results.contains_key(task_type) || self.errors.contains_key(task_type)
    }

    /// Requested task types that have no outcome yet.
    pub fn outstanding(&self) -> Vec<TaskType> {
        self.requested
            .iter()
            .filter(|t| !self.is_resolved(t))
            .cloned()
            .collect()
    }

    /// Check if the run is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Build the caller-facing status view.
    pub fn view(&self) -> RunStatusView {
        RunStatusView {
            run_id: self.run_id.clone(),
            status: self.status,
            completed_count: self.completed_count(),
            failed_count: self.failed_count(),
            requested_count: self.requested_count(),
            partial_results: self.partial_results.clone(),
            errors: self.errors.clone(),
            total_cost: self.total_cost,
        }
    }
}

/// Consistent read-only view of a run returned by status queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStatusView {
    /// Run identifier.
    pub run_id: RunId,

    /// Current run status.
    pub status: RunStatus,

    /// Number of successful tasks.
    pub completed_count: usize,

    /// Number of failed or timed out tasks.
    pub failed_count: usize,

    /// Number of requested tasks.
    pub requested_count: usize,

    /// Payloads of successful tasks.
    pub partial_results: BTreeMap<TaskType, Payload>,

    /// Error messages of unsuccessful tasks.
    pub errors: BTreeMap<TaskType, String>,

    /// Sum of successful task costs.
    pub total_cost: Cost,
}
