//! Portline core data models.
//!
//! This crate defines the records shared by every coordination component:
//! work units, pipelines, dependency edges, resource locks, feedback loops
//! and escalations, plus the workspace configuration.

#![warn(missing_docs)]

// Core identities
mod id;

// Scheduling
mod unit;
mod pipeline;
mod lock;

// Verification and escalation
mod feedback;
mod escalation;

mod config;

// Re-exports
pub use id::*;

pub use unit::{WorkUnit, UnitStatus};
pub use pipeline::{Pipeline, PipelineStatus, PipelineMember, DependencyEdge, PipelineProgress};
pub use lock::ResourceLock;
pub use feedback::{
    FeedbackLoop, LoopStatus, NewFeedbackLoop, VerificationResult, FailingCheck,
    FeedbackRecord, FeedbackStats, RelayMessage,
};
pub use escalation::{
    Escalation, EscalationKind, EscalationStatus, NewEscalation, Severity, WorkerContext,
};
pub use config::{Config, ConfigError, TriggerThresholds, DEFAULT_MAX_RETRIES};

/// Timestamp type
pub type Time = chrono::DateTime<chrono::Utc>;

/// Error returned when a status or kind string is not recognized.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {kind} value: '{value}'")]
pub struct ParseStatusError {
    /// Which enum was being parsed
    pub kind: &'static str,
    /// The rejected input
    pub value: String,
}

impl ParseStatusError {
    pub(crate) fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

/// Error categories shared by every Portline component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Unknown plan, unit, lock, loop or escalation
    NotFound,
    /// Refused because of existing state
    Conflict,
    /// A feedback loop hit its retry bound
    ExhaustedRetries,
    /// Rejected input
    Validation,
    /// Store or relay failure
    Internal,
}

impl ErrorKind {
    /// Get string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::ExhaustedRetries => "exhausted_retries",
            ErrorKind::Validation => "validation",
            ErrorKind::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
