//! AssessRun Core Domain Types
//!
//! This crate contains pure domain types with no dependencies on:
//! - Async runtime
//! - Session storage
//! - Capability implementations
//!
//! All types here represent the assessment orchestration domain: runs,
//! task outcomes, costs and the statuses derived from them.

pub mod cost;
pub mod error;
pub mod event;
pub mod ids;
pub mod priority;
pub mod run;
pub mod status;
pub mod task;

// Re-export commonly used types
pub use cost::{Cost, CostCategory, CostEntry};
pub use error::{format_duration, CoreError, TaskError};
pub use event::{RunEvent, RunEventType};
pub use ids::{CostEntryId, EventId, OrchestratorId, RunId};
pub use priority::Priority;
pub use run::{RunRequest, RunSnapshot, RunStatusView};
pub use status::{RunStatus, TaskStatus};
pub use task::{Payload, Target, TaskOutcome, TaskType};
