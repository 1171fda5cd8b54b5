//! Durable run snapshots and orchestrator leases.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};

use assessrun_core::{OrchestratorId, RunId, RunSnapshot};

/// Session store errors.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Session store unavailable: {0}")]
    Unavailable(String),

    #[error("Snapshot serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Persistence for run snapshots.
///
/// At most one orchestrator may drive a run id at a time. Orchestrators
/// claim a run before driving it and release it once it is terminal.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Persist the latest snapshot of a run, replacing the previous one.
    async fn save(&self, snapshot: &RunSnapshot) -> Result<(), SessionError>;

    /// Load the latest snapshot of a run.
    async fn load(&self, run_id: &RunId) -> Result<Option<RunSnapshot>, SessionError>;

    /// Claim the run for `owner`. Returns false if another orchestrator holds it.
    async fn claim(&self, run_id: &RunId, owner: &OrchestratorId) -> Result<bool, SessionError>;

    /// Release a claim held by `owner`. Releasing someone else's claim is a no-op.
    async fn release(&self, run_id: &RunId, owner: &OrchestratorId) -> Result<(), SessionError>;
}

/// Process-local session store keeping snapshots as serialized JSON.
#[derive(Default)]
pub struct InMemorySessionStore {
    snapshots: RwLock<HashMap<RunId, String>>,
    leases: Mutex<HashMap<RunId, OrchestratorId>>,
    reject_writes: AtomicBool,
}

impl InMemorySessionStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `save` fail, simulating a storage outage.
    pub fn set_reject_writes(&self, reject: bool) {
        self.reject_writes.store(reject, Ordering::SeqCst);
    }

    /// Current lease holder of a run.
    pub async fn lease_holder(&self, run_id: &RunId) -> Option<OrchestratorId> {
        self.leases.lock().await.get(run_id).cloned()
    }

    /// Number of stored snapshots.
    pub async fn len(&self) -> usize {
        self.snapshots.read().await.len()
    }

    /// Returns true if no snapshot is stored.
    pub async fn is_empty(&self) -> bool {
        self.snapshots.read().await.is_empty()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn save(&self, snapshot: &RunSnapshot) -> Result<(), SessionError> {
        if self.reject_writes.load(Ordering::SeqCst) {
            return Err(SessionError::Unavailable("writes rejected".into()));
        }
        let encoded = serde_json::to_string(snapshot)?;
        self.snapshots
            .write()
            .await
            .insert(snapshot.run_id.clone(), encoded);
        Ok(())
    }

    async fn load(&self, run_id: &RunId) -> Result<Option<RunSnapshot>, SessionError> {
        let snapshots = self.snapshots.read().await;
        match snapshots.get(run_id) {
            Some(encoded) => Ok(Some(serde_json::from_str(encoded)?)),
            None => Ok(None),
        }
    }

    async fn claim(&self, run_id: &RunId, owner: &OrchestratorId) -> Result<bool, SessionError> {
        let mut leases = self.leases.lock().await;
        match leases.get(run_id) {
            Some(holder) => Ok(holder == owner),
            None => {
                leases.insert(run_id.clone(), owner.clone());
                Ok(true)
            }
        }
    }

    async fn release(&self, run_id: &RunId, owner: &OrchestratorId) -> Result<(), SessionError> {
        let mut leases = self.leases.lock().await;
        if leases.get(run_id) == Some(owner) {
            leases.remove(run_id);
        }
        Ok(())
    }
}
