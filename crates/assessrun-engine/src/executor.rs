//! Task execution under a deadline with bounded retries.
//!
//! The deadline wraps the whole attempt sequence, backoff sleeps included,
//! so the worst-case latency of a task is its deadline no matter how many
//! retries the policy allows.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use assessrun_core::{Payload, RunId, Target, TaskError, TaskOutcome, TaskType};

use crate::ledger::CostLedger;
use crate::registry::{Capability, CapabilityRegistry};

/// Retry behaviour for transient capability failures.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_backoff: Duration,
    /// Factor applied to the delay after each retry.
    pub multiplier: f64,
    /// Upper bound on a single delay.
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 1,
            initial_backoff: Duration::from_millis(500),
            multiplier: 2.0,
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Builder method to set the retry count.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Builder method to set the initial backoff.
    pub fn with_initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = backoff;
        self
    }

    /// Total invocations allowed, first attempt included.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay before retry number `retry` (0-based), capped at `max_backoff`.
    pub fn backoff_for(&self, retry: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(retry.min(i32::MAX as u32) as i32);
        let delay = self.initial_backoff.as_secs_f64() * factor;
        if !delay.is_finite() || delay >= self.max_backoff.as_secs_f64() {
            self.max_backoff
        } else {
            Duration::from_secs_f64(delay)
        }
    }
}

/// Runs one capability for one run and produces its [`TaskOutcome`].
#[derive(Clone)]
pub struct TaskExecutor {
    registry: Arc<CapabilityRegistry>,
    ledger: Arc<CostLedger>,
}

impl TaskExecutor {
    /// Create an executor over a registry, charging successes to the ledger.
    pub fn new(registry: Arc<CapabilityRegistry>, ledger: Arc<CostLedger>) -> Self {
        Self { registry, ledger }
    }

    /// Registry this executor looks capabilities up in.
    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    /// Deadline a task gets when no override is configured.
    pub fn default_deadline(&self, task_type: &TaskType) -> Option<Duration> {
        self.registry
            .lookup(task_type)
            .map(|cap| cap.default_deadline())
    }

    /// Execute a task. Never fails: every error becomes part of the outcome.
    pub async fn execute(
        &self,
        run_id: &RunId,
        task_type: &TaskType,
        target: &Target,
        deadline: Duration,
        policy: &RetryPolicy,
    ) -> TaskOutcome {
        let start = Instant::now();

        let Some(capability) = self.registry.lookup(task_type) else {
            let err = TaskError::permanent(format!("no capability registered for {}", task_type));
            warn!(run_id = %run_id, task_type = %task_type, "Task has no capability");
            return TaskOutcome::from_error(task_type.clone(), &err, Duration::ZERO, 0);
        };

        let mut attempts = 0u32;
        let result = match tokio::time::timeout(
            deadline,
            attempt_sequence(capability.as_ref(), target, policy, &mut attempts),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(TaskError::Timeout(deadline)),
        };
        let elapsed = start.elapsed();

        match result {
            Ok(payload) => {
                let cost = capability.cost();
                self.ledger
                    .record_task(run_id.clone(), task_type.clone(), cost)
                    .await;
                info!(
                    run_id = %run_id,
                    task_type = %task_type,
                    attempts,
                    duration_ms = elapsed.as_millis() as u64,
                    cost = %cost,
                    "Task succeeded"
                );
                TaskOutcome::success(task_type.clone(), payload, cost, elapsed, attempts)
            }
            Err(err) => {
                warn!(
                    run_id = %run_id,
                    task_type = %task_type,
                    attempts,
                    duration_ms = elapsed.as_millis() as u64,
                    error = %err,
                    "Task did not succeed"
                );
                TaskOutcome::from_error(task_type.clone(), &err, elapsed, attempts)
            }
        }
    }
}

/// Invoke the capability until success, a non-retryable error, or the retry
/// budget runs out. Cancelled from the outside when the deadline fires.
async fn attempt_sequence(
    capability: &dyn Capability,
    target: &Target,
    policy: &RetryPolicy,
    attempts: &mut u32,
) -> Result<Payload, TaskError> {
    loop {
        *attempts += 1;
        let result = AssertUnwindSafe(capability.execute(target))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(TaskError::permanent("capability panicked")));

        match result {
            Ok(payload) => return Ok(payload),
            Err(err) if err.is_retryable() && *attempts < policy.max_attempts() => {
                let delay = policy.backoff_for(*attempts - 1);
                debug!(
                    task_type = %capability.task_type(),
                    attempt = *attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}
