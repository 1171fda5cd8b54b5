//! Assessment run state machine.
//!
//! One orchestrating task per run fans out gated task executors and folds
//! their outcomes through a single channel, so the aggregator is only ever
//! touched by one task. Readers see published snapshots through a watch
//! channel; cancellation travels over a control channel handled by the same
//! loop.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use assessrun_core::{
    CoreError, RunEvent, RunId, RunSnapshot, RunStatus, TaskError, TaskOutcome, TaskType,
};

use crate::aggregator::ResultAggregator;
use crate::config::EngineConfig;
use crate::executor::{RetryPolicy, TaskExecutor};
use crate::gate::ConcurrencyGate;
use crate::session::SessionStore;

/// Deadline used when neither config nor capability provides one.
const FALLBACK_DEADLINE: Duration = Duration::from_secs(30);

/// Dependencies shared by every run of one engine.
#[derive(Clone)]
pub struct RunContext {
    pub(crate) executor: TaskExecutor,
    pub(crate) session: Arc<dyn SessionStore>,
    pub(crate) events: broadcast::Sender<RunEvent>,
    pub(crate) config: Arc<EngineConfig>,
    pub(crate) retry: RetryPolicy,
}

impl RunContext {
    /// Bundle the collaborators a run needs.
    pub fn new(
        executor: TaskExecutor,
        session: Arc<dyn SessionStore>,
        events: broadcast::Sender<RunEvent>,
        config: Arc<EngineConfig>,
    ) -> Self {
        let retry = config.retry.policy();
        Self {
            executor,
            session,
            events,
            config,
            retry,
        }
    }

    fn deadline_for(&self, task_type: &TaskType) -> Duration {
        self.config
            .deadline_override(task_type)
            .or_else(|| self.executor.default_deadline(task_type))
            .unwrap_or(FALLBACK_DEADLINE)
    }

    fn emit(&self, event: RunEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

enum RunControl {
    Cancel {
        reply: oneshot::Sender<Result<RunSnapshot, CoreError>>,
    },
}

enum TaskMessage {
    Started(TaskType),
    Finished(TaskOutcome),
}

/// Caller-side handle to a run: read snapshots, cancel, wait.
#[derive(Clone)]
pub struct RunHandle {
    run_id: RunId,
    snapshot: watch::Receiver<RunSnapshot>,
    control: mpsc::Sender<RunControl>,
}

impl RunHandle {
    /// Run identifier.
    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    /// Latest published snapshot.
    pub fn snapshot(&self) -> RunSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Latest published status.
    pub fn status(&self) -> RunStatus {
        self.snapshot.borrow().status
    }

    /// Request cancellation and return the cancelled snapshot.
    ///
    /// Returns as soon as the orchestrating loop has processed the request;
    /// it never waits on outstanding tasks.
    pub async fn cancel(&self) -> Result<RunSnapshot, CoreError> {
        let (reply, rx) = oneshot::channel();
        if self.control.send(RunControl::Cancel { reply }).await.is_err() {
            return Err(self.already_terminal());
        }
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(self.already_terminal()),
        }
    }

    /// Wait until the run reaches a terminal state.
    pub async fn wait(&self) -> RunSnapshot {
        let mut rx = self.snapshot.clone();
        loop {
            if rx.borrow_and_update().is_terminal() {
                return rx.borrow().clone();
            }
            if rx.changed().await.is_err() {
                return rx.borrow().clone();
            }
        }
    }

    fn already_terminal(&self) -> CoreError {
        CoreError::RunAlreadyTerminal {
            run_id: self.run_id.clone(),
            status: self.status(),
        }
    }
}

/// One assessment run, owned by its orchestrating task.
pub struct AssessmentRun {
    ctx: RunContext,
    aggregator: ResultAggregator,
    snapshot_tx: watch::Sender<RunSnapshot>,
    control_rx: mpsc::Receiver<RunControl>,
}

impl AssessmentRun {
    /// Create a run from a pending (or resumed) snapshot.
    pub fn new(snapshot: RunSnapshot, ctx: RunContext) -> (Self, RunHandle) {
        let run_id = snapshot.run_id.clone();
        let (snapshot_tx, snapshot_rx) = watch::channel(snapshot.clone());
        let (control_tx, control_rx) = mpsc::channel(8);

        let run = Self {
            ctx,
            aggregator: ResultAggregator::new(snapshot),
            snapshot_tx,
            control_rx,
        };
        let handle = RunHandle {
            run_id,
            snapshot: snapshot_rx,
            control: control_tx,
        };
        (run, handle)
    }

    /// Run identifier.
    pub fn id(&self) -> RunId {
        self.run_id()
    }

    /// Cancel a run that was never dispatched.
    pub async fn withdraw(mut self) -> RunSnapshot {
        let snapshot = self.cancelled().await;
        self.reject_pending_controls();
        snapshot
    }

    /// Drive the run to a terminal state and return the final snapshot.
    pub async fn drive(mut self) -> RunSnapshot {
        let snapshot = self.aggregator.snapshot().clone();
        let run_id = snapshot.run_id.clone();
        let outstanding = snapshot.outstanding();

        info!(
            run_id = %run_id,
            target = %snapshot.target,
            priority = %snapshot.priority,
            outstanding = outstanding.len(),
            requested = snapshot.requested_count(),
            "Run dispatched"
        );

        if outstanding.is_empty() {
            return self.finish().await;
        }

        let cancel = CancellationToken::new();
        let gate = ConcurrencyGate::new(self.ctx.config.per_run_concurrency);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut tasks = JoinSet::new();

        for task_type in outstanding {
            let deadline = self.ctx.deadline_for(&task_type);
            let executor = self.ctx.executor.clone();
            let policy = self.ctx.retry.clone();
            let gate = gate.clone();
            let cancel = cancel.clone();
            let tx = tx.clone();
            let run_id = run_id.clone();
            let target = snapshot.target.clone();

            tasks.spawn(async move {
                let Some(_permit) = gate.enter(&cancel).await else {
                    debug!(run_id = %run_id, task_type = %task_type, "Task skipped, run cancelled");
                    return;
                };
                let _ = tx.send(TaskMessage::Started(task_type.clone()));
                let outcome = executor
                    .execute(&run_id, &task_type, &target, deadline, &policy)
                    .await;
                // Fails only if the run stopped listening; the outcome is discarded.
                let _ = tx.send(TaskMessage::Finished(outcome));
            });
        }
        drop(tx);

        loop {
            tokio::select! {
                biased;
                Some(control) = self.control_rx.recv() => match control {
                    RunControl::Cancel { reply } => {
                        cancel.cancel();
                        let snapshot = self.cancelled().await;
                        let _ = reply.send(Ok(snapshot.clone()));
                        // In-flight capability calls are not interrupted; reap them
                        // in the background and drop whatever they report.
                        tokio::spawn(async move {
                            while tasks.join_next().await.is_some() {}
                        });
                        self.reject_pending_controls();
                        return snapshot;
                    }
                },
                message = rx.recv() => match message {
                    Some(TaskMessage::Started(task_type)) => self.task_started(&task_type).await,
                    Some(TaskMessage::Finished(outcome)) => {
                        self.task_finished(outcome).await;
                        if self.aggregator.is_resolved() {
                            break;
                        }
                    }
                    None => {
                        self.fail_unreported();
                        break;
                    }
                },
            }
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(run_id = %run_id, error = %e, "Task executor aborted");
            }
        }

        let snapshot = self.finish().await;
        self.reject_pending_controls();
        snapshot
    }

    async fn task_started(&mut self, task_type: &TaskType) {
        debug!(run_id = %self.run_id(), task_type = %task_type, "Task launched");
        if self.aggregator.snapshot().status != RunStatus::Pending {
            return;
        }
        let snap = self.aggregator.snapshot_mut();
        snap.status = RunStatus::Running;
        if snap.started_at.is_none() {
            snap.started_at = Some(Utc::now());
        }
        let run_id = snap.run_id.clone();
        info!(run_id = %run_id, "Run started");
        if self.ctx.config.checkpoint_each_outcome {
            self.checkpoint().await;
        }
        self.publish();
        self.ctx.emit(RunEvent::run_started(run_id));
    }

    async fn task_finished(&mut self, outcome: TaskOutcome) {
        self.ctx
            .emit(RunEvent::task_finished(self.run_id(), &outcome));
        match self.aggregator.record(outcome) {
            // The terminal transition is published by `finish` once persisted.
            Ok(status) if status.is_active() => {
                self.aggregator.snapshot_mut().status = status;
                if self.ctx.config.checkpoint_each_outcome {
                    self.checkpoint().await;
                }
                self.publish();
            }
            Ok(_) => {}
            Err(rejected) => {
                warn!(run_id = %self.run_id(), reason = ?rejected, "Outcome discarded");
            }
        }
    }

    /// Every sender is gone with tasks unresolved; record them as failures.
    fn fail_unreported(&mut self) {
        let run_id = self.run_id();
        let outstanding = self.aggregator.snapshot().outstanding();
        for task_type in outstanding {
            error!(run_id = %run_id, task_type = %task_type, "Task ended without an outcome");
            let outcome = TaskOutcome::from_error(
                task_type,
                &TaskError::permanent("task aborted before reporting an outcome"),
                Duration::ZERO,
                0,
            );
            let _ = self.aggregator.record(outcome);
        }
    }

    async fn cancelled(&mut self) -> RunSnapshot {
        let outstanding = self.aggregator.snapshot().outstanding().len();
        let snap = self.aggregator.snapshot_mut();
        snap.status = RunStatus::Cancelled;
        snap.completed_at = Some(Utc::now());
        let snapshot = snap.clone();

        info!(run_id = %snapshot.run_id, outstanding, "Run cancelled");
        self.checkpoint().await;
        self.publish();
        self.ctx
            .emit(RunEvent::run_cancelled(snapshot.run_id.clone(), outstanding));
        snapshot
    }

    async fn finish(&mut self) -> RunSnapshot {
        let status = self.aggregator.status();
        let snap = self.aggregator.snapshot_mut();
        snap.status = status;
        snap.completed_at = Some(Utc::now());
        let snapshot = snap.clone();

        info!(
            run_id = %snapshot.run_id,
            status = %status,
            completed = snapshot.completed_count(),
            failed = snapshot.failed_count(),
            total_cost = %snapshot.total_cost,
            "Run finished"
        );
        self.checkpoint().await;
        self.publish();
        self.ctx
            .emit(RunEvent::run_finished(snapshot.run_id.clone(), status));
        snapshot
    }

    /// Answer cancellations that raced with the terminal transition.
    fn reject_pending_controls(&mut self) {
        self.control_rx.close();
        let snapshot = self.aggregator.snapshot();
        while let Ok(control) = self.control_rx.try_recv() {
            match control {
                RunControl::Cancel { reply } => {
                    let _ = reply.send(Err(CoreError::RunAlreadyTerminal {
                        run_id: snapshot.run_id.clone(),
                        status: snapshot.status,
                    }));
                }
            }
        }
    }

    async fn checkpoint(&self) {
        let snapshot = self.aggregator.snapshot();
        if let Err(e) = self.ctx.session.save(snapshot).await {
            error!(run_id = %snapshot.run_id, error = %e, "Failed to save run snapshot");
        }
    }

    fn publish(&self) {
        self.snapshot_tx
            .send_replace(self.aggregator.snapshot().clone());
    }

    fn run_id(&self) -> RunId {
        self.aggregator.snapshot().run_id.clone()
    }
}
