//! Priority scheduler - queues runs and dispatches them against a global budget.

use std::sync::Arc;

use tokio::sync::{broadcast, Mutex, OwnedSemaphorePermit};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use assessrun_core::{
    CoreError, Priority, RunEvent, RunId, RunRequest, RunSnapshot, RunStatus, RunStatusView,
    Target, TaskType,
};

use crate::config::{ConfigError, EngineConfig};
use crate::error::EngineError;
use crate::ledger::CostLedger;
use crate::registry::CapabilityRegistry;
use crate::run::{AssessmentRun, RunHandle};
use crate::session::SessionStore;
use crate::state::{EngineState, ScheduledItem};

/// Priority scheduler.
///
/// Owns the dispatch loop. Runs are queued by priority (FIFO within a level)
/// and dispatched whenever one of `max_concurrent_runs` slots is free.
pub struct Scheduler {
    state: Arc<EngineState>,
    shutdown: CancellationToken,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    /// Validate the config and start the dispatch loop.
    ///
    /// The ledger must record in the configured currency. Must be called from
    /// within a tokio runtime.
    pub fn start(
        registry: Arc<CapabilityRegistry>,
        ledger: Arc<CostLedger>,
        session: Arc<dyn SessionStore>,
        config: EngineConfig,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        if ledger.currency() != config.currency {
            return Err(ConfigError::CurrencyMismatch {
                config: config.currency.clone(),
                ledger: ledger.currency().to_string(),
            }
            .into());
        }
        let state = EngineState::new(registry, ledger, session, config);
        let shutdown = CancellationToken::new();

        info!(
            owner = %state.owner,
            max_concurrent_runs = state.capacity(),
            per_run_concurrency = state.config.per_run_concurrency,
            "Scheduler started"
        );

        let dispatcher = tokio::spawn(dispatch_loop(Arc::clone(&state), shutdown.clone()));
        Ok(Self {
            state,
            shutdown,
            dispatcher: Mutex::new(Some(dispatcher)),
        })
    }

    /// Submit one run. Returns as soon as the run is queued.
    pub async fn submit_run(
        &self,
        target: impl Into<String>,
        task_types: impl IntoIterator<Item = TaskType>,
        priority: Priority,
    ) -> Result<RunId, EngineError> {
        let target = Target::parse(target)?;
        let request = RunRequest::new(target, task_types.into_iter().collect(), priority);
        let mut ids = self.submit_batch(vec![request]).await?;
        ids.pop()
            .ok_or_else(|| EngineError::Core(CoreError::InvalidInput("empty batch".into())))
    }

    /// Submit several runs. Either every run is queued or none is.
    pub async fn submit_batch(&self, requests: Vec<RunRequest>) -> Result<Vec<RunId>, EngineError> {
        let mut prepared = Vec::with_capacity(requests.len());
        for request in requests {
            match self.prepare(request).await {
                Ok(run) => prepared.push(run),
                Err(e) => {
                    for (run, _) in &prepared {
                        self.state.release_lease(&run.id()).await;
                    }
                    return Err(e);
                }
            }
        }

        let ids = prepared.iter().map(|(run, _)| run.id()).collect();
        self.enqueue(prepared).await;
        Ok(ids)
    }

    /// Validate a request, claim its lease and persist the initial snapshot.
    async fn prepare(&self, request: RunRequest) -> Result<(AssessmentRun, RunHandle), EngineError> {
        let partition = self.state.ctx.executor.registry().partition(&request.task_types);
        if !partition.unknown.is_empty() {
            return Err(EngineError::UnknownTaskTypes(partition.unknown));
        }
        for task_type in &partition.unavailable {
            warn!(target = %request.target, task_type = %task_type, "Excluding unavailable capability");
        }
        if partition.available.is_empty() {
            return Err(EngineError::NoRunnableTasks);
        }

        let mut snapshot = RunSnapshot::new(request.target, partition.available, request.priority);
        snapshot.owner = Some(self.state.owner.clone());
        self.admit(snapshot).await
    }

    async fn admit(&self, snapshot: RunSnapshot) -> Result<(AssessmentRun, RunHandle), EngineError> {
        let session = &self.state.ctx.session;
        if !session.claim(&snapshot.run_id, &self.state.owner).await? {
            return Err(EngineError::RunLeaseHeld(snapshot.run_id));
        }
        if let Err(e) = session.save(&snapshot).await {
            self.state.release_lease(&snapshot.run_id).await;
            return Err(e.into());
        }
        Ok(AssessmentRun::new(snapshot, self.state.ctx.clone()))
    }

    async fn enqueue(&self, prepared: Vec<(AssessmentRun, RunHandle)>) {
        {
            let mut queue = self.state.queue.lock().await;
            let mut runs = self.state.runs.write().await;
            for (run, handle) in prepared {
                let snapshot = handle.snapshot();
                info!(
                    run_id = %snapshot.run_id,
                    target = %snapshot.target,
                    priority = %snapshot.priority,
                    tasks = snapshot.requested_count(),
                    "Run queued"
                );
                self.state
                    .emit(RunEvent::run_queued(snapshot.run_id.clone(), snapshot.priority));
                runs.insert(snapshot.run_id.clone(), handle);
                queue.push(ScheduledItem {
                    priority: snapshot.priority,
                    seq: self.state.next_seq(),
                    run,
                });
            }
        }
        self.state.wake.notify_one();
    }

    /// Current status of a run.
    ///
    /// Falls back to the session store for runs this scheduler never tracked.
    pub async fn get_run_status(&self, run_id: &RunId) -> Result<RunStatusView, EngineError> {
        if let Some(handle) = self.state.handle(run_id).await {
            return Ok(handle.snapshot().view());
        }
        match self.state.ctx.session.load(run_id).await? {
            Some(snapshot) => Ok(snapshot.view()),
            None => Err(EngineError::not_found(run_id)),
        }
    }

    /// Cancel a queued or running run.
    ///
    /// A run known only to the session store is cancelled in the store if
    /// no other orchestrator holds it.
    pub async fn cancel_run(&self, run_id: &RunId) -> Result<RunStatus, EngineError> {
        let Some(handle) = self.state.handle(run_id).await else {
            return self.cancel_stored(run_id).await;
        };

        let status = handle.status();
        if status.is_terminal() {
            return Err(CoreError::RunAlreadyTerminal {
                run_id: run_id.clone(),
                status,
            }
            .into());
        }

        let queued = {
            let mut queue = self.state.queue.lock().await;
            let (matched, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut *queue)
                .into_vec()
                .into_iter()
                .partition(|item| &item.run.id() == run_id);
            *queue = rest.into();
            matched.into_iter().next()
        };

        if let Some(item) = queued {
            let snapshot = item.run.withdraw().await;
            self.state.retire(run_id).await;
            self.state.release_lease(run_id).await;
            return Ok(snapshot.status);
        }

        let snapshot = handle.cancel().await?;
        Ok(snapshot.status)
    }

    async fn cancel_stored(&self, run_id: &RunId) -> Result<RunStatus, EngineError> {
        let session = &self.state.ctx.session;
        let mut snapshot = session
            .load(run_id)
            .await?
            .ok_or_else(|| EngineError::not_found(run_id))?;
        if snapshot.is_terminal() {
            return Err(CoreError::RunAlreadyTerminal {
                run_id: run_id.clone(),
                status: snapshot.status,
            }
            .into());
        }
        if !session.claim(run_id, &self.state.owner).await? {
            return Err(EngineError::RunLeaseHeld(run_id.clone()));
        }

        let outstanding = snapshot.outstanding().len();
        snapshot.status = RunStatus::Cancelled;
        snapshot.completed_at = Some(chrono::Utc::now());
        snapshot.owner = Some(self.state.owner.clone());
        let saved = session.save(&snapshot).await;
        self.state.release_lease(run_id).await;
        saved?;

        info!(run_id = %run_id, outstanding, "Stored run cancelled");
        self.state.emit(RunEvent::run_cancelled(run_id.clone(), outstanding));
        Ok(RunStatus::Cancelled)
    }

    /// Re-enqueue a non-terminal run from its stored snapshot.
    ///
    /// Results already recorded are kept; only unresolved task types run.
    pub async fn resume_run(&self, run_id: &RunId) -> Result<(), EngineError> {
        if let Some(handle) = self.state.handle(run_id).await {
            let status = handle.status();
            if status.is_terminal() {
                return Err(CoreError::RunAlreadyTerminal {
                    run_id: run_id.clone(),
                    status,
                }
                .into());
            }
            return Err(EngineError::AlreadyScheduled(run_id.clone()));
        }

        let mut snapshot = self
            .state
            .ctx
            .session
            .load(run_id)
            .await?
            .ok_or_else(|| EngineError::not_found(run_id))?;
        if snapshot.is_terminal() {
            return Err(CoreError::RunAlreadyTerminal {
                run_id: run_id.clone(),
                status: snapshot.status,
            }
            .into());
        }

        info!(
            run_id = %run_id,
            previous_owner = ?snapshot.owner,
            outstanding = snapshot.outstanding().len(),
            "Resuming run"
        );
        snapshot.owner = Some(self.state.owner.clone());
        let prepared = self.admit(snapshot).await?;
        self.enqueue(vec![prepared]).await;
        Ok(())
    }

    /// Wait until a run is terminal and return its final snapshot.
    ///
    /// Runs that already finished are read back from the session store.
    pub async fn wait_for_run(&self, run_id: &RunId) -> Result<RunSnapshot, EngineError> {
        if let Some(handle) = self.state.handle(run_id).await {
            return Ok(handle.wait().await);
        }
        match self.state.ctx.session.load(run_id).await? {
            Some(snapshot) if snapshot.is_terminal() => Ok(snapshot),
            Some(_) => Err(EngineError::NotScheduled(run_id.clone())),
            None => Err(EngineError::not_found(run_id)),
        }
    }

    /// Subscribe to run lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.state.subscribe()
    }

    /// Stop dispatching. Queued runs stay queued; running runs continue.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        if let Some(dispatcher) = self.dispatcher.lock().await.take() {
            let _ = dispatcher.await;
        }
        info!(queued = self.queue_depth().await, "Scheduler stopped");
    }

    /// Number of runs waiting for a slot.
    pub async fn queue_depth(&self) -> usize {
        self.state.queue_depth().await
    }

    /// Number of runs holding a slot.
    pub fn active_runs(&self) -> usize {
        self.state.active_runs()
    }

    /// Runs submitted to this scheduler per status, finished ones included.
    pub async fn run_counts_by_status(&self) -> Vec<(RunStatus, usize)> {
        self.state.run_counts().await
    }

    /// Number of runs still queued or being driven.
    pub async fn tracked_runs(&self) -> usize {
        self.state.tracked_runs().await
    }

    /// Cost ledger shared by all runs.
    pub fn ledger(&self) -> &Arc<CostLedger> {
        &self.state.ledger
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn dispatch_loop(state: Arc<EngineState>, shutdown: CancellationToken) {
    loop {
        dispatch_ready(&state).await;
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = state.wake.notified() => {}
        }
    }
    debug!("Dispatch loop exited");
}

/// Dispatch queued runs while slots are free.
async fn dispatch_ready(state: &Arc<EngineState>) {
    loop {
        let mut queue = state.queue.lock().await;
        if queue.is_empty() {
            return;
        }
        let permit = match state.try_reserve() {
            Ok(permit) => permit,
            Err(e) => {
                debug!(error = %e, queued = queue.len(), "Dispatch deferred");
                return;
            }
        };
        let Some(item) = queue.pop() else {
            return;
        };
        drop(queue);
        launch(state, item, permit);
    }
}

fn launch(state: &Arc<EngineState>, item: ScheduledItem, permit: OwnedSemaphorePermit) {
    let run_id = item.run.id();
    debug!(run_id = %run_id, priority = %item.priority, seq = item.seq, "Dispatching run");

    let state = Arc::clone(state);
    tokio::spawn(async move {
        let snapshot = item.run.drive().await;
        state.retire(&run_id).await;
        drop(permit);
        debug!(run_id = %run_id, status = %snapshot.status, "Run released its slot");
        state.release_lease(&run_id).await;
        state.wake.notify_one();
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::InMemorySessionStore;
    use crate::test_support::{ScriptedCapability, SlowSessionStore};
    use assessrun_core::{Cost, OrchestratorId, RunEventType};
    use std::time::Duration;
    use std::sync::Mutex as StdMutex;
    use tokio::sync::Semaphore;

    struct Harness {
        scheduler: Scheduler,
        session: Arc<InMemorySessionStore>,
    }

    fn harness(caps: Vec<ScriptedCapability>, max_concurrent_runs: usize) -> Harness {
        let registry = caps
            .into_iter()
            .fold(CapabilityRegistry::new(), |r, c| r.with(Arc::new(c)));
        let session = Arc::new(InMemorySessionStore::new());
        let config = EngineConfig {
            max_concurrent_runs,
            ..EngineConfig::default()
        };
        let scheduler = Scheduler::start(
            Arc::new(registry),
            Arc::new(CostLedger::new("USD")),
            session.clone(),
            config,
        )
        .unwrap();
        Harness { scheduler, session }
    }

    async fn wait_until_status(scheduler: &Scheduler, run_id: &RunId, status: RunStatus) {
        while scheduler.get_run_status(run_id).await.unwrap().status != status {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn higher_priority_dispatches_first() {
        let release = Arc::new(Semaphore::new(0));
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let h = harness(
            vec![
                ScriptedCapability::succeeding("block", Cost::ZERO).blocked_on(release.clone()),
                ScriptedCapability::succeeding("scan", Cost::ZERO).recording(seen.clone()),
            ],
            1,
        );
        let s = &h.scheduler;

        let blocker = s
            .submit_run("blocker.example", [TaskType::new("block")], Priority::Normal)
            .await
            .unwrap();
        wait_until_status(s, &blocker, RunStatus::Running).await;

        let low = s
            .submit_run("low.example", [TaskType::new("scan")], Priority::Low)
            .await
            .unwrap();
        let high = s
            .submit_run("high.example", [TaskType::new("scan")], Priority::High)
            .await
            .unwrap();
        assert_eq!(s.queue_depth().await, 2);
        assert_eq!(s.active_runs(), 1);

        release.add_permits(1);
        assert_eq!(s.wait_for_run(&low).await.unwrap().status, RunStatus::Completed);
        assert_eq!(s.wait_for_run(&high).await.unwrap().status, RunStatus::Completed);

        assert_eq!(
            *seen.lock().unwrap(),
            vec!["high.example".to_string(), "low.example".to_string()]
        );
    }

    #[tokio::test]
    async fn cancel_queued_run_never_runs() {
        let release = Arc::new(Semaphore::new(0));
        let scan = ScriptedCapability::succeeding("scan", Cost::from_cents(1));
        let scan_calls = scan.calls();
        let h = harness(
            vec![
                ScriptedCapability::succeeding("block", Cost::ZERO).blocked_on(release.clone()),
                scan,
            ],
            1,
        );
        let s = &h.scheduler;

        let blocker = s
            .submit_run("blocker.example", [TaskType::new("block")], Priority::Normal)
            .await
            .unwrap();
        wait_until_status(s, &blocker, RunStatus::Running).await;

        let queued = s
            .submit_run("queued.example", [TaskType::new("scan")], Priority::Critical)
            .await
            .unwrap();
        assert_eq!(s.cancel_run(&queued).await.unwrap(), RunStatus::Cancelled);
        assert_eq!(s.queue_depth().await, 0);

        release.add_permits(1);
        s.wait_for_run(&blocker).await.unwrap();
        assert_eq!(scan_calls.load(std::sync::atomic::Ordering::SeqCst), 0);

        let view = s.get_run_status(&queued).await.unwrap();
        assert_eq!(view.status, RunStatus::Cancelled);
        let stored = h.session.load(&queued).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Cancelled);
        assert!(h.session.lease_holder(&queued).await.is_none());
    }

    #[tokio::test]
    async fn submit_rejects_unknown_and_empty_requests() {
        let h = harness(
            vec![
                ScriptedCapability::succeeding("scan", Cost::ZERO),
                ScriptedCapability::succeeding("shot", Cost::ZERO).unavailable(),
            ],
            1,
        );
        let s = &h.scheduler;

        let err = s
            .submit_run("example.com", [TaskType::new("nope")], Priority::Normal)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::UnknownTaskTypes(ref t) if t == &[TaskType::new("nope")]));

        let err = s
            .submit_run("example.com", [TaskType::new("shot")], Priority::Normal)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NoRunnableTasks));

        let err = s
            .submit_run("   ", [TaskType::new("scan")], Priority::Normal)
            .await
            .unwrap_err();
        assert!(err.is_invalid_request());

        assert!(h.session.is_empty().await);
    }

    #[tokio::test]
    async fn unavailable_capabilities_are_excluded() {
        let h = harness(
            vec![
                ScriptedCapability::succeeding("scan", Cost::ZERO),
                ScriptedCapability::succeeding("shot", Cost::ZERO).unavailable(),
            ],
            1,
        );
        let s = &h.scheduler;
        let run_id = s
            .submit_run(
                "example.com",
                [TaskType::new("scan"), TaskType::new("shot")],
                Priority::Normal,
            )
            .await
            .unwrap();

        let snapshot = s.wait_for_run(&run_id).await.unwrap();
        assert_eq!(snapshot.status, RunStatus::Completed);
        assert_eq!(snapshot.requested_count(), 1);
    }

    #[tokio::test]
    async fn batch_is_all_or_nothing() {
        let h = harness(vec![ScriptedCapability::succeeding("scan", Cost::ZERO)], 2);
        let s = &h.scheduler;
        let target = Target::parse("example.com").unwrap();

        let err = s
            .submit_batch(vec![
                RunRequest::new(target.clone(), vec![TaskType::new("scan")], Priority::Normal),
                RunRequest::new(target.clone(), vec![TaskType::new("nope")], Priority::Normal),
            ])
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::UnknownTaskTypes(_)));
        assert_eq!(s.run_counts_by_status().await.iter().map(|(_, n)| n).sum::<usize>(), 0);

        let ids = s
            .submit_batch(vec![
                RunRequest::new(target.clone(), vec![TaskType::new("scan")], Priority::Low),
                RunRequest::new(target, vec![TaskType::new("scan")], Priority::High),
            ])
            .await
            .unwrap();
        assert_eq!(ids.len(), 2);
        for id in &ids {
            assert_eq!(s.wait_for_run(id).await.unwrap().status, RunStatus::Completed);
        }
    }

    #[tokio::test]
    async fn session_outage_rejects_submission() {
        let h = harness(vec![ScriptedCapability::succeeding("scan", Cost::ZERO)], 1);
        h.session.set_reject_writes(true);

        let err = h
            .scheduler
            .submit_run("example.com", [TaskType::new("scan")], Priority::Normal)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Session(_)));
        assert_eq!(h.scheduler.queue_depth().await, 0);
    }

    #[tokio::test]
    async fn cancel_unknown_and_terminal_runs() {
        let h = harness(vec![ScriptedCapability::succeeding("scan", Cost::ZERO)], 1);
        let s = &h.scheduler;

        let err = s.cancel_run(&RunId::new("missing")).await.unwrap_err();
        assert!(matches!(err, EngineError::Core(CoreError::RunNotFound(_))));

        let run_id = s
            .submit_run("example.com", [TaskType::new("scan")], Priority::Normal)
            .await
            .unwrap();
        s.wait_for_run(&run_id).await.unwrap();
        let err = s.cancel_run(&run_id).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::Core(CoreError::RunAlreadyTerminal {
                status: RunStatus::Completed,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn resume_runs_only_outstanding_tasks() {
        let done = ScriptedCapability::succeeding("done", Cost::from_cents(4));
        let done_calls = done.calls();
        let h = harness(
            vec![done, ScriptedCapability::succeeding("todo", Cost::from_cents(1))],
            1,
        );

        let mut snapshot = RunSnapshot::new(
            Target::parse("example.com").unwrap(),
            [TaskType::new("done"), TaskType::new("todo")],
            Priority::Normal,
        );
        snapshot.status = RunStatus::Running;
        snapshot
            .partial_results
            .insert(TaskType::new("done"), serde_json::json!({"ok": true}));
        snapshot.total_cost = Cost::from_cents(4);
        snapshot.owner = Some(OrchestratorId::new("crashed"));
        h.session.save(&snapshot).await.unwrap();

        let s = &h.scheduler;
        s.resume_run(&snapshot.run_id).await.unwrap();
        let finished = s.wait_for_run(&snapshot.run_id).await.unwrap();

        assert_eq!(finished.status, RunStatus::Completed);
        assert_eq!(finished.total_cost, Cost::from_cents(5));
        assert_eq!(done_calls.load(std::sync::atomic::Ordering::SeqCst), 0);
        assert!(matches!(
            s.resume_run(&snapshot.run_id).await.unwrap_err(),
            EngineError::Core(CoreError::RunAlreadyTerminal { .. })
        ));
    }

    #[tokio::test]
    async fn resume_respects_foreign_lease() {
        let h = harness(vec![ScriptedCapability::succeeding("scan", Cost::ZERO)], 1);
        let snapshot = RunSnapshot::new(
            Target::parse("example.com").unwrap(),
            [TaskType::new("scan")],
            Priority::Normal,
        );
        h.session.save(&snapshot).await.unwrap();
        h.session
            .claim(&snapshot.run_id, &OrchestratorId::new("other"))
            .await
            .unwrap();

        let err = h.scheduler.resume_run(&snapshot.run_id).await.unwrap_err();
        assert!(matches!(err, EngineError::RunLeaseHeld(_)));

        let err = h.scheduler.resume_run(&RunId::new("missing")).await.unwrap_err();
        assert!(matches!(err, EngineError::Core(CoreError::RunNotFound(_))));
    }

    #[tokio::test]
    async fn shutdown_leaves_queue_intact() {
        let h = harness(vec![ScriptedCapability::succeeding("scan", Cost::ZERO)], 1);
        let s = &h.scheduler;
        s.shutdown().await;

        let run_id = s
            .submit_run("example.com", [TaskType::new("scan")], Priority::Normal)
            .await
            .unwrap();
        tokio::task::yield_now().await;
        assert_eq!(s.queue_depth().await, 1);
        assert_eq!(
            s.get_run_status(&run_id).await.unwrap().status,
            RunStatus::Pending
        );
    }

    #[tokio::test]
    async fn finished_runs_are_released_from_memory() {
        let h = harness(vec![ScriptedCapability::succeeding("scan", Cost::ZERO)], 4);
        let s = &h.scheduler;

        let mut run_ids = Vec::new();
        for i in 0..50 {
            let target = format!("site{i}.example");
            run_ids.push(
                s.submit_run(&target, [TaskType::new("scan")], Priority::Normal)
                    .await
                    .unwrap(),
            );
        }
        for run_id in &run_ids {
            s.wait_for_run(run_id).await.unwrap();
        }

        tokio::time::timeout(Duration::from_secs(1), async {
            while s.tracked_runs().await > 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        assert!(s
            .run_counts_by_status()
            .await
            .contains(&(RunStatus::Completed, 50)));
        let first = &run_ids[0];
        assert_eq!(
            s.get_run_status(first).await.unwrap().status,
            RunStatus::Completed
        );
        assert_eq!(
            s.wait_for_run(first).await.unwrap().status,
            RunStatus::Completed
        );
        assert!(h.session.lease_holder(first).await.is_none());
    }

    #[tokio::test]
    async fn stored_runs_can_be_cancelled() {
        let h = harness(vec![ScriptedCapability::succeeding("scan", Cost::ZERO)], 1);
        let s = &h.scheduler;
        let mut events = s.subscribe();

        let mut snapshot = RunSnapshot::new(
            Target::parse("example.com").unwrap(),
            [TaskType::new("scan")],
            Priority::Normal,
        );
        snapshot.status = RunStatus::Running;
        h.session.save(&snapshot).await.unwrap();
        let run_id = snapshot.run_id.clone();

        let err = s.wait_for_run(&run_id).await.unwrap_err();
        assert!(matches!(err, EngineError::NotScheduled(_)));

        assert_eq!(s.cancel_run(&run_id).await.unwrap(), RunStatus::Cancelled);
        let stored = h.session.load(&run_id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Cancelled);
        assert!(stored.completed_at.is_some());
        assert!(h.session.lease_holder(&run_id).await.is_none());

        let event = events.recv().await.unwrap();
        assert_eq!(event.event_type, RunEventType::RunCancelled);
        assert_eq!(event.metadata["outstanding"], "1");

        let err = s.cancel_run(&run_id).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::Core(CoreError::RunAlreadyTerminal {
                status: RunStatus::Cancelled,
                ..
            })
        ));
        assert_eq!(
            s.wait_for_run(&run_id).await.unwrap().status,
            RunStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn stored_run_held_elsewhere_is_not_cancelled() {
        let h = harness(vec![ScriptedCapability::succeeding("scan", Cost::ZERO)], 1);
        let snapshot = RunSnapshot::new(
            Target::parse("example.com").unwrap(),
            [TaskType::new("scan")],
            Priority::Normal,
        );
        h.session.save(&snapshot).await.unwrap();
        let other = OrchestratorId::new("other");
        h.session.claim(&snapshot.run_id, &other).await.unwrap();

        let err = h.scheduler.cancel_run(&snapshot.run_id).await.unwrap_err();
        assert!(matches!(err, EngineError::RunLeaseHeld(_)));

        let stored = h.session.load(&snapshot.run_id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Pending);
        assert_eq!(h.session.lease_holder(&snapshot.run_id).await, Some(other));
    }

    #[tokio::test(start_paused = true)]
    async fn waiters_see_the_stored_terminal_snapshot() {
        let session = Arc::new(SlowSessionStore::new(Duration::from_millis(20)));
        let registry = CapabilityRegistry::new()
            .with(Arc::new(ScriptedCapability::succeeding("scan", Cost::ZERO)));
        let s = Scheduler::start(
            Arc::new(registry),
            Arc::new(CostLedger::new("USD")),
            session.clone(),
            EngineConfig::default(),
        )
        .unwrap();

        let run_id = s
            .submit_run("example.com", [TaskType::new("scan")], Priority::Normal)
            .await
            .unwrap();
        let done = s.wait_for_run(&run_id).await.unwrap();
        assert_eq!(done.status, RunStatus::Completed);

        let stored = session.load(&run_id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Completed);
        assert!(stored.completed_at.is_some());
        assert_eq!(stored.completed_at, done.completed_at);
    }

    #[tokio::test]
    async fn ledger_currency_must_match_config() {
        let config = EngineConfig {
            currency: "EUR".to_string(),
            ..EngineConfig::default()
        };
        let result = Scheduler::start(
            Arc::new(CapabilityRegistry::new()),
            Arc::new(CostLedger::new("USD")),
            Arc::new(InMemorySessionStore::new()),
            config.clone(),
        );
        match result {
            Err(EngineError::Config(ConfigError::CurrencyMismatch { config, ledger })) => {
                assert_eq!(config, "EUR");
                assert_eq!(ledger, "USD");
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("mismatched ledger was accepted"),
        }

        let registry = CapabilityRegistry::new()
            .with(Arc::new(ScriptedCapability::succeeding("scan", Cost::from_cents(3))));
        let s = Scheduler::start(
            Arc::new(registry),
            Arc::new(CostLedger::new("EUR")),
            Arc::new(InMemorySessionStore::new()),
            config,
        )
        .unwrap();
        let run_id = s
            .submit_run("example.com", [TaskType::new("scan")], Priority::Normal)
            .await
            .unwrap();
        s.wait_for_run(&run_id).await.unwrap();

        let entries = s.ledger().entries_for_run(&run_id).await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].currency, "EUR");
    }
}
