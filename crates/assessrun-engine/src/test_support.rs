//! Scripted capabilities and stores shared by the unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Semaphore;

use assessrun_core::{Cost, OrchestratorId, Payload, RunId, RunSnapshot, Target, TaskError, TaskType};

use crate::registry::Capability;
use crate::session::{InMemorySessionStore, SessionError, SessionStore};

type Step = (Duration, Result<Payload, TaskError>);

/// Capability that replays a fixed script of delays and results.
///
/// Steps are consumed in order; once the script is exhausted every call
/// repeats the fallback step.
pub(crate) struct ScriptedCapability {
    task_type: TaskType,
    cost: Cost,
    deadline: Duration,
    available: bool,
    steps: Mutex<VecDeque<Step>>,
    fallback: Step,
    calls: Arc<AtomicU32>,
    release: Option<Arc<Semaphore>>,
    seen: Option<Arc<Mutex<Vec<String>>>>,
}

impl ScriptedCapability {
    pub(crate) fn succeeding(name: &str, cost: Cost) -> Self {
        Self::with_fallback(name, cost, Ok(json!({ "task": name })))
    }

    pub(crate) fn failing(name: &str, error: TaskError) -> Self {
        Self::with_fallback(name, Cost::from_cents(1), Err(error))
    }

    fn with_fallback(name: &str, cost: Cost, result: Result<Payload, TaskError>) -> Self {
        Self {
            task_type: TaskType::new(name),
            cost,
            deadline: Duration::from_secs(5),
            available: true,
            steps: Mutex::new(VecDeque::new()),
            fallback: (Duration::ZERO, result),
            calls: Arc::new(AtomicU32::new(0)),
            release: None,
            seen: None,
        }
    }

    /// Queue a scripted step ahead of the fallback.
    pub(crate) fn then(self, delay: Duration, result: Result<Payload, TaskError>) -> Self {
        self.steps
            .lock()
            .unwrap()
            .push_back((delay, result));
        self
    }

    pub(crate) fn delayed(mut self, delay: Duration) -> Self {
        self.fallback.0 = delay;
        self
    }

    pub(crate) fn unavailable(mut self) -> Self {
        self.available = false;
        self
    }

    /// Block every call until the semaphore hands out a permit.
    pub(crate) fn blocked_on(mut self, release: Arc<Semaphore>) -> Self {
        self.release = Some(release);
        self
    }

    /// Append the target of every call to a shared log.
    pub(crate) fn recording(mut self, seen: Arc<Mutex<Vec<String>>>) -> Self {
        self.seen = Some(seen);
        self
    }

    pub(crate) fn calls(&self) -> Arc<AtomicU32> {
        Arc::clone(&self.calls)
    }
}

#[async_trait]
impl Capability for ScriptedCapability {
    fn task_type(&self) -> TaskType {
        self.task_type.clone()
    }

    async fn execute(&self, target: &Target) -> Result<Payload, TaskError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(seen) = &self.seen {
            seen.lock().unwrap().push(target.to_string());
        }
        if let Some(release) = &self.release {
            if let Ok(permit) = release.acquire().await {
                permit.forget();
            }
        }
        let (delay, result) = self
            .steps
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        result
    }

    fn cost(&self) -> Cost {
        self.cost
    }

    fn default_deadline(&self) -> Duration {
        self.deadline
    }

    fn is_available(&self) -> bool {
        self.available
    }
}

/// Session store whose writes take a while to land.
pub(crate) struct SlowSessionStore {
    inner: InMemorySessionStore,
    delay: Duration,
}

impl SlowSessionStore {
    pub(crate) fn new(delay: Duration) -> Self {
        Self {
            inner: InMemorySessionStore::new(),
            delay,
        }
    }
}

#[async_trait]
impl SessionStore for SlowSessionStore {
    async fn save(&self, snapshot: &RunSnapshot) -> Result<(), SessionError> {
        tokio::time::sleep(self.delay).await;
        self.inner.save(snapshot).await
    }

    async fn load(&self, run_id: &RunId) -> Result<Option<RunSnapshot>, SessionError> {
        self.inner.load(run_id).await
    }

    async fn claim(&self, run_id: &RunId, owner: &OrchestratorId) -> Result<bool, SessionError> {
        self.inner.claim(run_id, owner).await
    }

    async fn release(&self, run_id: &RunId, owner: &OrchestratorId) -> Result<(), SessionError> {
        self.inner.release(run_id, owner).await
    }
}
