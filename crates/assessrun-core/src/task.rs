//! Task types, targets and task outcomes.

use std::borrow::Cow;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Cost, CoreError, TaskError, TaskStatus};

/// Opaque result produced by a capability.
pub type Payload = serde_json::Value;

/// Identifier of an analysis task kind, used as the capability registry key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskType(Cow<'static, str>);

impl TaskType {
    /// Lighthouse-style performance scan.
    pub const PERFORMANCE_SCAN: TaskType = TaskType::from_static("performance_scan");
    /// Homepage content scrape.
    pub const CONTENT_SCRAPE: TaskType = TaskType::from_static("content_scrape");
    /// Third-party SEO metrics lookup.
    pub const SEO_LOOKUP: TaskType = TaskType::from_static("seo_lookup");
    /// Business listing lookup (maps, directories).
    pub const BUSINESS_LISTING: TaskType = TaskType::from_static("business_listing");
    /// Full-page screenshot capture.
    pub const SCREENSHOT: TaskType = TaskType::from_static("screenshot");
    /// Vision-model analysis of the screenshot.
    pub const VISION_ANALYSIS: TaskType = TaskType::from_static("vision_analysis");
    /// LLM heuristic audit of the site.
    pub const HEURISTIC_AUDIT: TaskType = TaskType::from_static("heuristic_audit");

    /// Built-in task types known to the lead-generation product.
    pub const BUILTIN: [TaskType; 7] = [
        Self::PERFORMANCE_SCAN,
        Self::CONTENT_SCRAPE,
        Self::SEO_LOOKUP,
        Self::BUSINESS_LISTING,
        Self::SCREENSHOT,
        Self::VISION_ANALYSIS,
        Self::HEURISTIC_AUDIT,
    ];

    /// Create a task type from a static name.
    pub const fn from_static(name: &'static str) -> Self {
        Self(Cow::Borrowed(name))
    }

    /// Create a task type from an owned name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(Cow::Owned(name.into()))
    }

    /// Get the task type name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskType {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for TaskType {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

/// The thing being assessed: a business website URL or business identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Target(String);

impl Target {
    /// Create a target, rejecting blank identifiers.
    pub fn parse(value: impl Into<String>) -> Result<Self, CoreError> {
        let value = value.into();
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(CoreError::InvalidInput("target must not be empty".into()));
        }
        Ok(Self(trimmed.to_string()))
    }

    /// Get the target string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true if the target looks like an http(s) URL.
    pub fn is_url(&self) -> bool {
        self.0.starts_with("http://") || self.0.starts_with("https://")
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Result of one task within a run. Produced exactly once per task per run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutcome {
    /// Which task produced this outcome.
    pub task_type: TaskType,

    /// Final task status.
    pub status: TaskStatus,

    /// Capability payload, present only on success.
    pub payload: Option<Payload>,

    /// Cost charged for this task (zero unless successful).
    pub cost: Cost,

    /// Wall-clock time spent across all attempts.
    #[serde(with = "duration_millis")]
    pub duration: Duration,

    /// Number of capability invocations made.
    pub attempts: u32,

    /// Error message for failed or timed out tasks.
    pub error: Option<String>,
}

impl TaskOutcome {
    /// Create a successful outcome.
    pub fn success(
        task_type: TaskType,
        payload: Payload,
        cost: Cost,
        duration: Duration,
        attempts: u32,
    ) -> Self {
        Self {
            task_type,
            status: TaskStatus::Success,
            payload: Some(payload),
            cost,
            duration,
            attempts,
            error: None,
        }
    }

    /// Create an unsuccessful outcome from the error that ended the task.
    pub fn from_error(
        task_type: TaskType,
        error: &TaskError,
        duration: Duration,
        attempts: u32,
    ) -> Self {
        let status = match error {
            TaskError::Timeout(_) => TaskStatus::TimedOut,
            TaskError::Transient(_) | TaskError::Permanent(_) => TaskStatus::Failed,
        };
        Self {
            task_type,
            status,
            payload: None,
            cost: Cost::ZERO,
            duration,
            attempts,
            error: Some(error.to_string()),
        }
    }

    /// Returns true if the task succeeded.
    pub fn is_success(&self) -> bool {
        self.status == TaskStatus::Success
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
