//! AssessRun Engine
//!
//! Orchestrates assessment runs: capability registry, task execution with
//! deadlines and retries, per-run concurrency, result aggregation, session
//! snapshots, cost accounting and priority scheduling.

pub mod aggregator;
pub mod config;
pub mod error;
pub mod executor;
pub mod gate;
pub mod ledger;
pub mod metrics;
pub mod registry;
pub mod run;
pub mod scheduler;
pub mod session;
pub mod state;
pub mod telemetry;

#[cfg(test)]
pub(crate) mod test_support;

pub use aggregator::ResultAggregator;
pub use config::{ConfigError, EngineConfig, RetryConfig};
pub use error::EngineError;
pub use executor::{RetryPolicy, TaskExecutor};
pub use gate::ConcurrencyGate;
pub use ledger::{CostLedger, CostReport, CostSink, LedgerError};
pub use registry::{Capability, CapabilityRegistry, Partition};
pub use run::{AssessmentRun, RunHandle};
pub use scheduler::Scheduler;
pub use session::{InMemorySessionStore, SessionError, SessionStore};
