//! Engine configuration.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use assessrun_core::TaskType;

use crate::executor::RetryPolicy;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },

    #[error("{0} must be greater than zero")]
    ZeroCapacity(&'static str),

    #[error("backoff_multiplier must be >= 1.0, got {0}")]
    InvalidMultiplier(f64),

    #[error("Ledger records {ledger} but config currency is {config}")]
    CurrencyMismatch { config: String, ledger: String },
}

/// Retry settings applied to every task.
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first attempt on transient errors.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay before the first retry (milliseconds).
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    /// Factor applied to the delay after each retry.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// Upper bound on a single backoff delay (milliseconds).
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_max_retries() -> u32 { 1 }
fn default_initial_backoff_ms() -> u64 { 500 }
fn default_backoff_multiplier() -> f64 { 2.0 }
fn default_max_backoff_ms() -> u64 { 5_000 }

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl RetryConfig {
    /// Build the retry policy value handed to executors.
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            multiplier: self.backoff_multiplier,
            max_backoff: Duration::from_millis(self.max_backoff_ms),
        }
    }
}

/// Engine configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Global bound on concurrently running runs.
    #[serde(default = "default_max_concurrent_runs")]
    pub max_concurrent_runs: usize,

    /// Per-run bound on concurrently executing tasks.
    #[serde(default = "default_per_run_concurrency")]
    pub per_run_concurrency: usize,

    /// Retry settings.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Per task type deadline, overriding the capability default (seconds).
    #[serde(default)]
    pub deadline_overrides_secs: HashMap<TaskType, u64>,

    /// Save a snapshot to the session store after every task outcome.
    #[serde(default)]
    pub checkpoint_each_outcome: bool,

    /// Currency recorded on cost ledger entries.
    #[serde(default = "default_currency")]
    pub currency: String,

    /// Capacity of the run event broadcast channel.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

fn default_max_concurrent_runs() -> usize { 4 }
fn default_per_run_concurrency() -> usize { 3 }
fn default_currency() -> String { "USD".to_string() }
fn default_event_buffer() -> usize { 256 }

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_runs: default_max_concurrent_runs(),
            per_run_concurrency: default_per_run_concurrency(),
            retry: RetryConfig::default(),
            deadline_overrides_secs: HashMap::new(),
            checkpoint_each_outcome: false,
            currency: default_currency(),
            event_buffer: default_event_buffer(),
        }
    }
}

impl EngineConfig {
    /// Build a config from defaults overlaid with `ASSESSRUN_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup (environment, test map, ...).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = lookup("ASSESSRUN_MAX_CONCURRENT_RUNS") {
            config.max_concurrent_runs = parse("ASSESSRUN_MAX_CONCURRENT_RUNS", v)?;
        }
        if let Some(v) = lookup("ASSESSRUN_PER_RUN_CONCURRENCY") {
            config.per_run_concurrency = parse("ASSESSRUN_PER_RUN_CONCURRENCY", v)?;
        }
        if let Some(v) = lookup("ASSESSRUN_MAX_RETRIES") {
            config.retry.max_retries = parse("ASSESSRUN_MAX_RETRIES", v)?;
        }
        if let Some(v) = lookup("ASSESSRUN_INITIAL_BACKOFF_MS") {
            config.retry.initial_backoff_ms = parse("ASSESSRUN_INITIAL_BACKOFF_MS", v)?;
        }
        if let Some(v) = lookup("ASSESSRUN_BACKOFF_MULTIPLIER") {
            config.retry.backoff_multiplier = parse("ASSESSRUN_BACKOFF_MULTIPLIER", v)?;
        }
        if let Some(v) = lookup("ASSESSRUN_MAX_BACKOFF_MS") {
            config.retry.max_backoff_ms = parse("ASSESSRUN_MAX_BACKOFF_MS", v)?;
        }
        if let Some(v) = lookup("ASSESSRUN_CHECKPOINT_EACH_OUTCOME") {
            config.checkpoint_each_outcome = parse("ASSESSRUN_CHECKPOINT_EACH_OUTCOME", v)?;
        }
        if let Some(v) = lookup("ASSESSRUN_CURRENCY") {
            config.currency = v.trim().to_uppercase();
        }

        config.validate()?;
        Ok(config)
    }

    /// Check capacities and retry settings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_runs == 0 {
            return Err(ConfigError::ZeroCapacity("max_concurrent_runs"));
        }
        if self.per_run_concurrency == 0 {
            return Err(ConfigError::ZeroCapacity("per_run_concurrency"));
        }
        if self.event_buffer == 0 {
            return Err(ConfigError::ZeroCapacity("event_buffer"));
        }
        let multiplier = self.retry.backoff_multiplier;
        if multiplier.is_nan() || multiplier < 1.0 {
            return Err(ConfigError::InvalidMultiplier(self.retry.backoff_multiplier));
        }
        Ok(())
    }

    /// Deadline override for a task type, if configured.
    pub fn deadline_override(&self, task_type: &TaskType) -> Option<Duration> {
        self.deadline_overrides_secs
            .get(task_type)
            .map(|secs| Duration::from_secs(*secs))
    }
}

fn parse<T: std::str::FromStr>(key: &'static str, value: String) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidValue { key, value })
}
