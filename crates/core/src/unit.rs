//! Work unit model - the atomic, independently assignable piece of work.

use serde::{Deserialize, Serialize};
use crate::{ParseStatusError, Time};

/// A work unit ("port") known to the coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkUnit {
    /// Caller-supplied identifier
    pub id: String,

    /// Execution wave this unit belongs to
    pub group_order: i64,

    /// Global status, independent of any pipeline
    pub status: UnitStatus,

    /// Creation timestamp
    pub created_at: Time,

    /// Last update timestamp
    pub updated_at: Time,
}

/// Status of a work unit, either globally or within one pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    /// Not started
    Pending,
    /// Claimed by a worker
    Running,
    /// Finished successfully
    Complete,
    /// Finished unsuccessfully
    Failed,
    /// Deliberately not executed
    Skipped,
    /// Withdrawn before completion
    Cancelled,
}

impl UnitStatus {
    /// Get string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            UnitStatus::Pending => "pending",
            UnitStatus::Running => "running",
            UnitStatus::Complete => "complete",
            UnitStatus::Failed => "failed",
            UnitStatus::Skipped => "skipped",
            UnitStatus::Cancelled => "cancelled",
        }
    }

    /// Whether no further transition is possible.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            UnitStatus::Complete | UnitStatus::Failed | UnitStatus::Skipped | UnitStatus::Cancelled
        )
    }

    /// Whether a member may move from this status to `next`.
    ///
    /// Only a claim enters `Running`. `Complete` and `Failed` require
    /// `Running`, while `Skipped` and `Cancelled` may withdraw pending work.
    pub fn can_transition_to(&self, next: UnitStatus) -> bool {
        matches!(
            (*self, next),
            (UnitStatus::Pending, UnitStatus::Running)
                | (UnitStatus::Pending, UnitStatus::Skipped)
                | (UnitStatus::Pending, UnitStatus::Cancelled)
                | (UnitStatus::Running, UnitStatus::Complete)
                | (UnitStatus::Running, UnitStatus::Failed)
                | (UnitStatus::Running, UnitStatus::Cancelled)
        )
    }

    /// Statuses from which `next` may be entered.
    pub fn predecessors(next: UnitStatus) -> Vec<UnitStatus> {
        ALL_UNIT_STATUSES
            .iter()
            .copied()
            .filter(|s| s.can_transition_to(next))
            .collect()
    }
}

const ALL_UNIT_STATUSES: [UnitStatus; 6] = [
    UnitStatus::Pending,
    UnitStatus::Running,
    UnitStatus::Complete,
    UnitStatus::Failed,
    UnitStatus::Skipped,
    UnitStatus::Cancelled,
];

impl std::fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for UnitStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ALL_UNIT_STATUSES
            .iter()
            .copied()
            .find(|status| status.as_str() == s.to_lowercase())
            .ok_or_else(|| ParseStatusError::new("unit status", s))
    }
}
