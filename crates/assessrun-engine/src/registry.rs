//! Capability contract and the static registry built at startup.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use assessrun_core::{Cost, Payload, Target, TaskError, TaskType};

/// An analysis task the engine can orchestrate.
///
/// Implementations wrap one external provider (PageSpeed, a scraper, an SEO
/// API, a vision model, ...). The engine only relies on this contract; it
/// never inspects how a capability does its work.
#[async_trait]
pub trait Capability: Send + Sync {
    /// Registry key for this capability.
    fn task_type(&self) -> TaskType;

    /// Run the analysis against a target.
    ///
    /// Return [`TaskError::Transient`] for failures worth retrying and
    /// [`TaskError::Permanent`] for input the provider will never accept.
    async fn execute(&self, target: &Target) -> Result<Payload, TaskError>;

    /// Price of one successful invocation.
    fn cost(&self) -> Cost;

    /// Deadline for the whole attempt sequence when no override is configured.
    fn default_deadline(&self) -> Duration;

    /// Whether the capability can run at all (credentials present, ...).
    fn is_available(&self) -> bool {
        true
    }
}

/// Task types split by whether a run may request them.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Partition {
    /// Registered and available.
    pub available: Vec<TaskType>,
    /// Registered but currently unavailable.
    pub unavailable: Vec<TaskType>,
    /// Not registered at all.
    pub unknown: Vec<TaskType>,
}

/// Maps task types to capabilities. Built once, then shared read-only.
#[derive(Default)]
pub struct CapabilityRegistry {
    table: HashMap<TaskType, Arc<dyn Capability>>,
}

impl CapabilityRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a capability under its own task type, replacing any previous entry.
    pub fn register(&mut self, capability: Arc<dyn Capability>) {
        let task_type = capability.task_type();
        info!(
            task_type = %task_type,
            available = capability.is_available(),
            "Registered capability"
        );
        if self.table.insert(task_type.clone(), capability).is_some() {
            warn!(task_type = %task_type, "Capability replaced an earlier registration");
        }
    }

    /// Builder method to register a capability.
    pub fn with(mut self, capability: Arc<dyn Capability>) -> Self {
        self.register(capability);
        self
    }

    /// Look up the capability for a task type.
    pub fn lookup(&self, task_type: &TaskType) -> Option<Arc<dyn Capability>> {
        self.table.get(task_type).cloned()
    }

    /// Split requested task types into available, unavailable and unknown.
    pub fn partition(&self, requested: &[TaskType]) -> Partition {
        let mut partition = Partition::default();
        for task_type in requested {
            match self.table.get(task_type) {
                Some(cap) if cap.is_available() => partition.available.push(task_type.clone()),
                Some(_) => partition.unavailable.push(task_type.clone()),
                None => partition.unknown.push(task_type.clone()),
            }
        }
        partition
    }

    /// Registered task types.
    pub fn task_types(&self) -> Vec<TaskType> {
        let mut types: Vec<TaskType> = self.table.keys().cloned().collect();
        types.sort();
        types
    }

    /// Number of registered capabilities.
    pub fn len(&self) -> usize {
        self.table.len()
    }

    /// Returns true if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}
