//! Monetary cost amounts and ledger entries.

use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{CostEntryId, RunId, TaskType};

/// Monetary amount in millionths of the currency unit.
///
/// Provider calls are billed in fractions of a cent, so amounts are kept as
/// integer micro-units to keep sums exact.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Cost(u64);

impl Cost {
    /// Zero cost.
    pub const ZERO: Cost = Cost(0);

    /// Create a cost from micro-units.
    pub const fn from_micros(micros: u64) -> Self {
        Self(micros)
    }

    /// Create a cost from whole cents.
    pub const fn from_cents(cents: u64) -> Self {
        Self(cents * 10_000)
    }

    /// Amount in micro-units.
    pub fn as_micros(&self) -> u64 {
        self.0
    }

    /// Returns true if the amount is zero.
    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

impl Add for Cost {
    type Output = Cost;

    fn add(self, rhs: Cost) -> Cost {
        Cost(self.0.saturating_add(rhs.0))
    }
}

impl AddAssign for Cost {
    fn add_assign(&mut self, rhs: Cost) {
        self.0 = self.0.saturating_add(rhs.0);
    }
}

impl Sum for Cost {
    fn sum<I: Iterator<Item = Cost>>(iter: I) -> Cost {
        iter.fold(Cost::ZERO, Add::add)
    }
}

impl<'a> Sum<&'a Cost> for Cost {
    fn sum<I: Iterator<Item = &'a Cost>>(iter: I) -> Cost {
        iter.copied().sum()
    }
}

impl fmt::Display for Cost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:06}", self.0 / 1_000_000, self.0 % 1_000_000)
    }
}

/// What a ledger entry is charging for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "name", rename_all = "snake_case")]
pub enum CostCategory {
    /// A successful capability invocation.
    Task(TaskType),
    /// Infrastructure spend attributed to a run (proxies, storage, ...).
    Infra(String),
}

impl fmt::Display for CostCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Task(t) => write!(f, "task:{}", t),
            Self::Infra(label) => write!(f, "infra:{}", label),
        }
    }
}

/// An append-only cost ledger record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostEntry {
    /// Unique entry identifier.
    pub id: CostEntryId,

    /// Run the cost is attributed to.
    pub run_id: RunId,

    /// What was paid for.
    pub category: CostCategory,

    /// Amount charged.
    pub amount: Cost,

    /// ISO 4217 currency code.
    pub currency: String,

    /// When the entry was written.
    pub recorded_at: DateTime<Utc>,
}

impl CostEntry {
    /// Create an entry for a successful task.
    pub fn for_task(
        run_id: RunId,
        task_type: TaskType,
        amount: Cost,
        currency: impl Into<String>,
    ) -> Self {
        Self::new(run_id, CostCategory::Task(task_type), amount, currency)
    }

    /// Create an infrastructure entry.
    pub fn for_infra(
        run_id: RunId,
        label: impl Into<String>,
        amount: Cost,
        currency: impl Into<String>,
    ) -> Self {
        Self::new(run_id, CostCategory::Infra(label.into()), amount, currency)
    }

    fn new(run_id: RunId, category: CostCategory, amount: Cost, currency: impl Into<String>) -> Self {
        Self {
            id: CostEntryId::generate(),
            run_id,
            category,
            amount,
            currency: currency.into(),
            recorded_at: Utc::now(),
        }
    }

    /// Builder method to set the recording time (useful for testing).
    pub fn at(mut self, recorded_at: DateTime<Utc>) -> Self {
        self.recorded_at = recorded_at;
        self
    }
}
