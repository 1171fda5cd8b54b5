//! Append-only cost ledger.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use assessrun_core::{Cost, CostEntry, RunId, TaskType};

/// Errors reported by an external cost sink.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Cost sink rejected entry: {0}")]
    SinkRejected(String),
}

/// External billing/metrics system receiving a copy of every entry.
#[async_trait]
pub trait CostSink: Send + Sync {
    /// Append one entry. Entries arrive in ledger order.
    async fn append(&self, entry: &CostEntry) -> Result<(), LedgerError>;
}

/// Aggregated costs over a time window.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CostReport {
    /// Number of entries in the window.
    pub entry_count: usize,
    /// Total per currency.
    pub totals_by_currency: BTreeMap<String, Cost>,
    /// Total per category label (`task:<type>` / `infra:<label>`).
    pub by_category: BTreeMap<String, Cost>,
    /// Total per run.
    pub by_run: BTreeMap<RunId, Cost>,
}

/// Append-only log of cost entries.
///
/// Entries are never mutated or removed once written. The in-process log is
/// authoritative; the optional sink receives a best-effort copy.
pub struct CostLedger {
    entries: RwLock<Vec<CostEntry>>,
    sink: Option<Arc<dyn CostSink>>,
    currency: String,
}

impl CostLedger {
    /// Create a ledger recording amounts in the given currency.
    pub fn new(currency: impl Into<String>) -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            sink: None,
            currency: currency.into(),
        }
    }

    /// Builder method to mirror entries to an external sink.
    pub fn with_sink(mut self, sink: Arc<dyn CostSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Currency used for entries created by this ledger.
    pub fn currency(&self) -> &str {
        &self.currency
    }

    /// Append an entry.
    pub async fn append(&self, entry: CostEntry) {
        debug!(
            run_id = %entry.run_id,
            category = %entry.category,
            amount = %entry.amount,
            "Recording cost entry"
        );
        if let Some(sink) = &self.sink {
            if let Err(e) = sink.append(&entry).await {
                warn!(run_id = %entry.run_id, error = %e, "Cost sink append failed");
            }
        }
        self.entries.write().await.push(entry);
    }

    /// Record the cost of a successful task.
    pub async fn record_task(&self, run_id: RunId, task_type: TaskType, amount: Cost) {
        let entry = CostEntry::for_task(run_id, task_type, amount, self.currency.clone());
        self.append(entry).await;
    }

    /// Record infrastructure spend attributed to a run.
    pub async fn record_infra(&self, run_id: RunId, label: impl Into<String>, amount: Cost) {
        let entry = CostEntry::for_infra(run_id, label, amount, self.currency.clone());
        self.append(entry).await;
    }

    /// Sum of all entries for one run.
    pub async fn run_total(&self, run_id: &RunId) -> Cost {
        self.entries
            .read()
            .await
            .iter()
            .filter(|e| &e.run_id == run_id)
            .map(|e| e.amount)
            .sum()
    }

    /// Entries for one run, in recording order.
    pub async fn entries_for_run(&self, run_id: &RunId) -> Vec<CostEntry> {
        self.entries
            .read()
            .await
            .iter()
            .filter(|e| &e.run_id == run_id)
            .cloned()
            .collect()
    }

    /// Aggregate entries recorded in `[since, until)`.
    pub async fn report(&self, since: DateTime<Utc>, until: DateTime<Utc>) -> CostReport {
        let entries = self.entries.read().await;
        let mut report = CostReport::default();
        for entry in entries
            .iter()
            .filter(|e| e.recorded_at >= since && e.recorded_at < until)
        {
            report.entry_count += 1;
            *report
                .totals_by_currency
                .entry(entry.currency.clone())
                .or_default() += entry.amount;
            *report
                .by_category
                .entry(entry.category.to_string())
                .or_default() += entry.amount;
            *report.by_run.entry(entry.run_id.clone()).or_default() += entry.amount;
        }
        report
    }

    /// Totals per currency over the whole ledger.
    pub async fn totals_by_currency(&self) -> BTreeMap<String, Cost> {
        let mut totals = BTreeMap::new();
        for entry in self.entries.read().await.iter() {
            *totals.entry(entry.currency.clone()).or_default() += entry.amount;
        }
        totals
    }

    /// Number of entries written.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Returns true if nothing has been recorded.
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}
