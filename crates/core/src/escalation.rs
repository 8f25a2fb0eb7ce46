//! Escalation model - human-actionable records raised by fired conditions.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use crate::id::EscalationId;
use crate::{ParseStatusError, Time};

/// Severity level, totally ordered from `Low` to `Critical`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Informational, no interruption needed
    #[default]
    Low,
    /// Should be looked at soon
    Medium,
    /// Needs a human now
    High,
    /// Work is stopped
    Critical,
}

impl Severity {
    /// Get string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Severity {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            _ => Err(ParseStatusError::new("severity", s)),
        }
    }
}

/// What kind of condition raised an escalation.
///
/// Rules registered at runtime use `Custom` with their own name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EscalationKind {
    /// Verification kept failing until the retry bound
    VerificationFailure,
    /// Budget is at or beyond the exhaustion threshold
    BudgetExhausted,
    /// Budget crossed the warning threshold
    BudgetWarning,
    /// Elapsed time passed the configured timeout
    Timeout,
    /// The build is broken
    BuildFailure,
    /// The worker reported itself blocked
    Blocked,
    /// Raised by an operator
    Manual,
    /// Anything else
    Custom(String),
}

impl EscalationKind {
    /// Get string representation.
    pub fn as_str(&self) -> &str {
        match self {
            EscalationKind::VerificationFailure => "verification_failure",
            EscalationKind::BudgetExhausted => "budget_exhausted",
            EscalationKind::BudgetWarning => "budget_warning",
            EscalationKind::Timeout => "timeout",
            EscalationKind::BuildFailure => "build_failure",
            EscalationKind::Blocked => "blocked",
            EscalationKind::Manual => "manual",
            EscalationKind::Custom(name) => name,
        }
    }
}

impl From<String> for EscalationKind {
    fn from(s: String) -> Self {
        match s.as_str() {
            "verification_failure" => EscalationKind::VerificationFailure,
            "budget_exhausted" => EscalationKind::BudgetExhausted,
            "budget_warning" => EscalationKind::BudgetWarning,
            "timeout" => EscalationKind::Timeout,
            "build_failure" => EscalationKind::BuildFailure,
            "blocked" => EscalationKind::Blocked,
            "manual" => EscalationKind::Manual,
            _ => EscalationKind::Custom(s),
        }
    }
}

impl From<EscalationKind> for String {
    fn from(kind: EscalationKind) -> Self {
        kind.as_str().to_string()
    }
}

impl std::fmt::Display for EscalationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of an escalation record. Closed records are never reopened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationStatus {
    /// Waiting for a human
    Open,
    /// Handled
    Resolved,
    /// Judged not actionable
    Dismissed,
}

impl EscalationStatus {
    /// Get string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            EscalationStatus::Open => "open",
            EscalationStatus::Resolved => "resolved",
            EscalationStatus::Dismissed => "dismissed",
        }
    }
}

impl std::fmt::Display for EscalationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EscalationStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "open" => Ok(EscalationStatus::Open),
            "resolved" => Ok(EscalationStatus::Resolved),
            "dismissed" => Ok(EscalationStatus::Dismissed),
            _ => Err(ParseStatusError::new("escalation status", s)),
        }
    }
}

/// An escalation that has not been persisted yet.
///
/// This is what a fired trigger produces and what an operator submits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewEscalation {
    /// Identity the condition was observed on
    pub origin: Option<String>,
    /// Related work unit
    pub unit_id: Option<String>,
    /// Condition kind
    pub kind: EscalationKind,
    /// How urgent it is
    pub severity: Severity,
    /// What went wrong
    pub issue: String,
    /// What a human could do about it
    pub suggestion: String,
    /// Whether the condition clears on its own
    #[serde(default)]
    pub auto_resolve: bool,
}

/// A persisted escalation record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Escalation {
    /// Unique identifier
    pub id: EscalationId,
    /// Identity the condition was observed on
    pub origin: Option<String>,
    /// Related work unit
    pub unit_id: Option<String>,
    /// Condition kind
    pub kind: EscalationKind,
    /// How urgent it is
    pub severity: Severity,
    /// What went wrong
    pub issue: String,
    /// What a human could do about it
    pub suggestion: String,
    /// Lifecycle status
    pub status: EscalationStatus,
    /// When raised
    pub created_at: Time,
    /// When resolved or dismissed
    pub resolved_at: Option<Time>,
}

impl Escalation {
    /// Build an open record from an unpersisted escalation.
    pub fn open(new: NewEscalation) -> Self {
        Self {
            id: EscalationId::new(),
            origin: new.origin,
            unit_id: new.unit_id,
            kind: new.kind,
            severity: new.severity,
            issue: new.issue,
            suggestion: new.suggestion,
            status: EscalationStatus::Open,
            created_at: chrono::Utc::now(),
            resolved_at: None,
        }
    }
}

/// Snapshot of a worker's execution context, evaluated by escalation triggers.
///
/// Elapsed time is supplied by the caller; nothing here measures time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerContext {
    /// Worker or session identity
    pub worker_id: Option<String>,
    /// Unit being worked on
    pub unit_id: Option<String>,
    /// Verification retries so far
    pub retries: u32,
    /// Retry bound (0 means unbounded)
    pub max_retries: u32,
    /// Budget consumed
    pub budget_used: f64,
    /// Budget available, if budgeted
    pub budget_limit: Option<f64>,
    /// Seconds spent so far
    pub elapsed_secs: u64,
    /// Seconds allowed, if limited
    pub timeout_secs: Option<u64>,
    /// The last build failed
    pub build_failed: bool,
    /// The worker cannot proceed
    pub blocked: bool,
    /// Why the worker is blocked
    pub blocked_reason: Option<String>,
    /// Last error the worker saw
    pub last_error: Option<String>,
}

impl WorkerContext {
    /// Create an empty snapshot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the worker identity.
    pub fn with_worker(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = Some(worker_id.into());
        self
    }

    /// Set the unit.
    pub fn with_unit(mut self, unit_id: impl Into<String>) -> Self {
        self.unit_id = Some(unit_id.into());
        self
    }

    /// Set retry counters.
    pub fn with_retries(mut self, retries: u32, max_retries: u32) -> Self {
        self.retries = retries;
        self.max_retries = max_retries;
        self
    }

    /// Set budget usage.
    pub fn with_budget(mut self, used: f64, limit: f64) -> Self {
        self.budget_used = used;
        self.budget_limit = Some(limit);
        self
    }

    /// Set elapsed time and timeout.
    pub fn with_elapsed(mut self, elapsed: Duration, timeout: Option<Duration>) -> Self {
        self.elapsed_secs = elapsed.as_secs();
        self.timeout_secs = timeout.map(|t| t.as_secs());
        self
    }

    /// Flag a build failure.
    pub fn with_build_failed(mut self, failed: bool) -> Self {
        self.build_failed = failed;
        self
    }

    /// Flag the worker as blocked.
    pub fn with_blocked(mut self, reason: impl Into<String>) -> Self {
        self.blocked = true;
        self.blocked_reason = Some(reason.into());
        self
    }

    /// Fraction of the budget consumed, when a positive budget is set.
    pub fn budget_ratio(&self) -> Option<f64> {
        match self.budget_limit {
            Some(limit) if limit > 0.0 => Some(self.budget_used / limit),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_order() {
        assert!(Severity::Low < Severity::Medium);
        assert!(Severity::Medium < Severity::High);
        assert!(Severity::High < Severity::Critical);
        assert_eq!(Severity::default(), Severity::Low);
    }

    #[test]
    fn test_kind_string_mapping() {
        let kind = EscalationKind::from("budget_warning".to_string());
        assert_eq!(kind, EscalationKind::BudgetWarning);

        let custom = EscalationKind::from("flaky_tests".to_string());
        assert_eq!(custom, EscalationKind::Custom("flaky_tests".to_string()));
        assert_eq!(custom.as_str(), "flaky_tests");

        let json = serde_json::to_string(&EscalationKind::BuildFailure).unwrap();
        assert_eq!(json, "\"build_failure\"");
    }

    #[test]
    fn test_budget_ratio() {
        let ctx = WorkerContext::new().with_budget(40.0, 50.0);
        assert_eq!(ctx.budget_ratio(), Some(0.8));

        let zero = WorkerContext::new().with_budget(10.0, 0.0);
        assert_eq!(zero.budget_ratio(), None);
        assert_eq!(WorkerContext::new().budget_ratio(), None);
    }

    #[test]
    fn test_context_deserializes_with_defaults() {
        let ctx: WorkerContext = serde_json::from_str(r#"{"build_failed": true}"#).unwrap();
        assert!(ctx.build_failed);
        assert_eq!(ctx.retries, 0);
        assert!(ctx.timeout_secs.is_none());
    }
}
