//! Run lifecycle events for observers of the engine.

use crate::ids::{EventId, RunId};
use crate::{Priority, RunStatus, TaskOutcome, TaskStatus, TaskType};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A lifecycle event emitted while a run is queued or executing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEvent {
    /// Unique event identifier.
    pub id: EventId,
    /// Run this event belongs to.
    pub run_id: RunId,
    /// Task this event refers to, for task-level events.
    pub task_type: Option<TaskType>,
    /// Type of event.
    pub event_type: RunEventType,
    /// Unix timestamp (milliseconds) when event occurred.
    pub timestamp_ms: i64,
    /// Event-specific metadata (priority, error, cost, status, ...).
    pub metadata: HashMap<String, String>,
}

impl RunEvent {
    /// Create a new run event.
    pub fn new(
        run_id: RunId,
        task_type: Option<TaskType>,
        event_type: RunEventType,
        metadata: HashMap<String, String>,
    ) -> Self {
        Self {
            id: EventId::generate(),
            run_id,
            task_type,
            event_type,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            metadata,
        }
    }

    /// Create a RunQueued event.
    pub fn run_queued(run_id: RunId, priority: Priority) -> Self {
        let mut metadata = HashMap::new();
        metadata.insert("priority".to_string(), priority.to_string());
        Self::new(run_id, None, RunEventType::RunQueued, metadata)
    }

    /// Create a RunStarted event.
    pub fn run_started(run_id: RunId) -> Self {
        Self::new(run_id, None, RunEventType::RunStarted, HashMap::new())
    }

    /// Create the task-level event matching an outcome's status.
    pub fn task_finished(run_id: RunId, outcome: &TaskOutcome) -> Self {
        let mut metadata = HashMap::new();
        metadata.insert(
            "duration_ms".to_string(),
            outcome.duration.as_millis().to_string(),
        );
        metadata.insert("attempts".to_string(), outcome.attempts.to_string());
        let event_type = match outcome.status {
            TaskStatus::Success => {
                metadata.insert("cost".to_string(), outcome.cost.to_string());
                RunEventType::TaskSucceeded
            }
            TaskStatus::Failed => RunEventType::TaskFailed,
            TaskStatus::TimedOut => RunEventType::TaskTimedOut,
        };
        if let Some(e) = &outcome.error {
            metadata.insert("error".to_string(), e.clone());
        }
        Self::new(run_id, Some(outcome.task_type.clone()), event_type, metadata)
    }

    /// Create a RunFinished event.
    pub fn run_finished(run_id: RunId, status: RunStatus) -> Self {
        let mut metadata = HashMap::new();
        metadata.insert("status".to_string(), status.to_string());
        Self::new(run_id, None, RunEventType::RunFinished, metadata)
    }

    /// Create a RunCancelled event.
    pub fn run_cancelled(run_id: RunId, outstanding: usize) -> Self {
        let mut metadata = HashMap::new();
        metadata.insert("outstanding".to_string(), outstanding.to_string());
        Self::new(run_id, None, RunEventType::RunCancelled, metadata)
    }
}

/// Type of run lifecycle event.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunEventType {
    /// Run accepted and waiting for a dispatch slot.
    RunQueued,
    /// First task of the run launched.
    RunStarted,
    /// Task returned a payload.
    TaskSucceeded,
    /// Task failed permanently or exhausted retries.
    TaskFailed,
    /// Task exceeded its deadline.
    TaskTimedOut,
    /// Run resolved every task.
    RunFinished,
    /// Run was cancelled.
    RunCancelled,
}
