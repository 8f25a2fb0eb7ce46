//! Pipeline model - a dependency-aware grouping of units into waves.

use serde::{Deserialize, Serialize};
use crate::{ParseStatusError, Time, UnitStatus};

/// An execution plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pipeline {
    /// Caller-supplied identifier
    pub id: String,

    /// Human readable name
    pub name: String,

    /// Current status
    pub status: PipelineStatus,

    /// Creation timestamp
    pub created_at: Time,

    /// Last update timestamp
    pub updated_at: Time,
}

/// Status of a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    /// No member has started
    Pending,
    /// At least one member is running or finished
    Running,
    /// Every member finished without failure
    Complete,
    /// A member failed and nothing is left running
    Failed,
    /// Withdrawn by an operator
    Cancelled,
}

impl PipelineStatus {
    /// Get string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStatus::Pending => "pending",
            PipelineStatus::Running => "running",
            PipelineStatus::Complete => "complete",
            PipelineStatus::Failed => "failed",
            PipelineStatus::Cancelled => "cancelled",
        }
    }

    /// Whether the pipeline is finished.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PipelineStatus::Complete | PipelineStatus::Failed | PipelineStatus::Cancelled
        )
    }
}

impl std::fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PipelineStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(PipelineStatus::Pending),
            "running" => Ok(PipelineStatus::Running),
            "complete" => Ok(PipelineStatus::Complete),
            "failed" => Ok(PipelineStatus::Failed),
            "cancelled" => Ok(PipelineStatus::Cancelled),
            _ => Err(ParseStatusError::new("pipeline status", s)),
        }
    }
}

/// Membership of a unit in a pipeline, with the pipeline-scoped status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineMember {
    /// Owning pipeline
    pub pipeline_id: String,

    /// Member unit
    pub unit_id: String,

    /// Execution wave
    pub group_order: i64,

    /// Progress of this unit within this pipeline
    pub status: UnitStatus,

    /// When the unit joined the pipeline
    pub added_at: Time,

    /// Last status change
    pub updated_at: Time,
}

/// A directed dependency: `unit_id` may only run once `depends_on` is complete.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DependencyEdge {
    /// Dependent unit
    pub unit_id: String,

    /// Prerequisite unit
    pub depends_on: String,
}

impl DependencyEdge {
    /// Create a new edge.
    pub fn new(unit_id: impl Into<String>, depends_on: impl Into<String>) -> Self {
        Self {
            unit_id: unit_id.into(),
            depends_on: depends_on.into(),
        }
    }
}

/// Completion counts for a pipeline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineProgress {
    /// Pipeline these counts belong to
    pub pipeline_id: String,
    /// Total members
    pub total: usize,
    /// Members still pending
    pub pending: usize,
    /// Members currently running
    pub running: usize,
    /// Members complete
    pub completed: usize,
    /// Members failed
    pub failed: usize,
    /// Members skipped or cancelled
    pub skipped: usize,
}

impl PipelineProgress {
    /// Tally member statuses.
    pub fn from_members(pipeline_id: impl Into<String>, members: &[PipelineMember]) -> Self {
        let mut progress = PipelineProgress {
            pipeline_id: pipeline_id.into(),
            total: members.len(),
            ..Default::default()
        };
        for member in members {
            match member.status {
                UnitStatus::Pending => progress.pending += 1,
                UnitStatus::Running => progress.running += 1,
                UnitStatus::Complete => progress.completed += 1,
                UnitStatus::Failed => progress.failed += 1,
                UnitStatus::Skipped | UnitStatus::Cancelled => progress.skipped += 1,
            }
        }
        progress
    }

    /// Percentage of members in a terminal state.
    pub fn percentage(&self) -> f32 {
        if self.total == 0 {
            return 0.0;
        }
        let finished = self.completed + self.failed + self.skipped;
        finished as f32 / self.total as f32 * 100.0
    }

    /// Status the pipeline should hold given these counts, if it is derivable.
    ///
    /// Returns `None` while members are still pending and none have started.
    pub fn derived_status(&self) -> Option<PipelineStatus> {
        if self.total == 0 {
            return None;
        }
        let finished = self.completed + self.failed + self.skipped;
        if finished == self.total {
            if self.failed > 0 {
                Some(PipelineStatus::Failed)
            } else {
                Some(PipelineStatus::Complete)
            }
        } else if self.running > 0 || finished > 0 {
            Some(PipelineStatus::Running)
        } else {
            None
        }
    }
}
