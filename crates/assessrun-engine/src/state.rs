//! Shared engine state.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use tokio::sync::{broadcast, Mutex, Notify, OwnedSemaphorePermit, RwLock, Semaphore};
use tracing::error;

use assessrun_core::{CoreError, OrchestratorId, Priority, RunEvent, RunId, RunStatus};

use crate::config::EngineConfig;
use crate::executor::TaskExecutor;
use crate::ledger::CostLedger;
use crate::registry::CapabilityRegistry;
use crate::run::{AssessmentRun, RunContext, RunHandle};
use crate::session::SessionStore;

/// A run waiting for a global slot.
pub struct ScheduledItem {
    pub priority: Priority,
    /// Submission order, used as FIFO tie-break within a priority level.
    pub seq: u64,
    pub run: AssessmentRun,
}

impl PartialEq for ScheduledItem {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ScheduledItem {}

impl PartialOrd for ScheduledItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledItem {
    // BinaryHeap pops the greatest item: more urgent wins, then earlier seq.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .rank()
            .cmp(&self.priority.rank())
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Shared engine state.
pub struct EngineState {
    /// Identity used for session leases.
    pub owner: OrchestratorId,

    /// Engine configuration.
    pub config: Arc<EngineConfig>,

    /// Collaborators handed to every run.
    pub ctx: RunContext,

    /// Cost ledger.
    pub ledger: Arc<CostLedger>,

    /// Handles of runs that are queued or still being driven.
    pub runs: RwLock<HashMap<RunId, RunHandle>>,

    /// Terminal runs whose handles were dropped, by final status.
    retired: RwLock<HashMap<RunStatus, u64>>,

    /// Runs waiting for a global slot.
    pub queue: Mutex<BinaryHeap<ScheduledItem>>,

    /// Global slots bounding concurrently running runs.
    slots: Arc<Semaphore>,

    /// Wakes the dispatch loop on enqueue and on run completion.
    pub wake: Notify,

    seq: AtomicU64,
}

impl EngineState {
    /// Create a new EngineState wrapped in Arc.
    pub fn new(
        registry: Arc<CapabilityRegistry>,
        ledger: Arc<CostLedger>,
        session: Arc<dyn SessionStore>,
        config: EngineConfig,
    ) -> Arc<Self> {
        let config = Arc::new(config);
        let (events, _) = broadcast::channel(config.event_buffer.max(1));
        let executor = TaskExecutor::new(registry, Arc::clone(&ledger));
        let ctx = RunContext::new(executor, session, events, Arc::clone(&config));

        Arc::new(Self {
            owner: OrchestratorId::generate(),
            slots: Arc::new(Semaphore::new(config.max_concurrent_runs.max(1))),
            config,
            ctx,
            ledger,
            runs: RwLock::new(HashMap::new()),
            retired: RwLock::new(HashMap::new()),
            queue: Mutex::new(BinaryHeap::new()),
            wake: Notify::new(),
            seq: AtomicU64::new(0),
        })
    }

    /// Next submission sequence number.
    pub fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, AtomicOrdering::SeqCst)
    }

    /// Reserve a global slot without waiting.
    pub fn try_reserve(&self) -> Result<OwnedSemaphorePermit, CoreError> {
        Arc::clone(&self.slots)
            .try_acquire_owned()
            .map_err(|_| CoreError::SchedulerCapacity {
                capacity: self.capacity(),
            })
    }

    /// Global slot count.
    pub fn capacity(&self) -> usize {
        self.config.max_concurrent_runs.max(1)
    }

    /// Number of runs currently holding a global slot.
    pub fn active_runs(&self) -> usize {
        self.capacity() - self.slots.available_permits()
    }

    /// Broadcast a lifecycle event.
    pub fn emit(&self, event: RunEvent) {
        let _ = self.ctx.events.send(event);
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.ctx.events.subscribe()
    }

    /// Handle of a tracked run.
    pub async fn handle(&self, run_id: &RunId) -> Option<RunHandle> {
        self.runs.read().await.get(run_id).cloned()
    }

    /// Release the session lease on a run, logging failures.
    pub async fn release_lease(&self, run_id: &RunId) {
        if let Err(e) = self.ctx.session.release(run_id, &self.owner).await {
            error!(run_id = %run_id, error = %e, "Failed to release run lease");
        }
    }

    /// Drop the handle of a terminal run. Status reads then go to the
    /// session store; the run still counts towards `run_counts`.
    pub async fn retire(&self, run_id: &RunId) {
        let mut runs = self.runs.write().await;
        if let Some(handle) = runs.remove(run_id) {
            *self.retired.write().await.entry(handle.status()).or_default() += 1;
        }
    }

    /// Number of runs holding a handle (queued or being driven).
    pub async fn tracked_runs(&self) -> usize {
        self.runs.read().await.len()
    }

    /// Runs per status, live and retired, in `RunStatus::ALL` order.
    pub async fn run_counts(&self) -> Vec<(RunStatus, usize)> {
        let runs = self.runs.read().await;
        let retired = self.retired.read().await;
        let mut counts: HashMap<RunStatus, usize> = HashMap::new();
        for handle in runs.values() {
            *counts.entry(handle.status()).or_default() += 1;
        }
        for (status, n) in retired.iter() {
            *counts.entry(*status).or_default() += *n as usize;
        }
        RunStatus::ALL
            .iter()
            .map(|status| (*status, counts.get(status).copied().unwrap_or(0)))
            .collect()
    }

    /// Number of queued runs.
    pub async fn queue_depth(&self) -> usize {
        self.queue.lock().await.len()
    }
}
