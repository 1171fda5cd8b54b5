//! Dispatch priority for queued runs.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Run dispatch priority. Lower numeric value = more urgent.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    /// Paying customer waiting on the result.
    Critical = 0,
    /// Interactive request from the dashboard.
    High = 1,
    /// Regular lead enrichment.
    #[default]
    Normal = 2,
    /// Bulk backfill, tolerates delay.
    Low = 3,
}

impl Priority {
    /// All levels, most urgent first.
    pub const ALL: [Priority; 4] = [Self::Critical, Self::High, Self::Normal, Self::Low];

    /// Numeric rank; 0 is dispatched first.
    pub fn rank(&self) -> u8 {
        *self as u8
    }

    /// Returns true if `self` should be dispatched before `other`.
    pub fn is_more_urgent_than(&self, other: Priority) -> bool {
        self.rank() < other.rank()
    }

    /// Lowercase label used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_ordering() {
        assert!(Priority::Critical < Priority::High);
        assert!(Priority::High < Priority::Normal);
        assert!(Priority::Normal < Priority::Low);
    }

    #[test]
    fn more_urgent() {
        assert!(Priority::High.is_more_urgent_than(Priority::Low));
        assert!(!Priority::Low.is_more_urgent_than(Priority::High));
        assert!(!Priority::Normal.is_more_urgent_than(Priority::Normal));
    }

    #[test]
    fn serde_uses_screaming_case() {
        let json = serde_json::to_string(&Priority::High).unwrap();
        assert_eq!(json, "\"HIGH\"");
    }
}
