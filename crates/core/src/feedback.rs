//! Feedback loop model - a bounded implement, verify, fix iteration.

use serde::{Deserialize, Serialize};
use crate::id::LoopId;
use crate::{NewEscalation, ParseStatusError, Time, WorkerContext};

/// Lifecycle of a feedback loop. Only `Running` accepts verification results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopStatus {
    /// Iterating
    Running,
    /// Verification passed
    Success,
    /// Abandoned by an operator
    Failed,
    /// Retry bound reached, handed to a human
    Escalated,
}

impl LoopStatus {
    /// Get string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            LoopStatus::Running => "running",
            LoopStatus::Success => "success",
            LoopStatus::Failed => "failed",
            LoopStatus::Escalated => "escalated",
        }
    }

    /// Whether the loop is closed.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, LoopStatus::Running)
    }
}

impl std::fmt::Display for LoopStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LoopStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "running" => Ok(LoopStatus::Running),
            "success" => Ok(LoopStatus::Success),
            "failed" => Ok(LoopStatus::Failed),
            "escalated" => Ok(LoopStatus::Escalated),
            _ => Err(ParseStatusError::new("loop status", s)),
        }
    }
}

/// A feedback loop between an implementer and a verifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackLoop {
    /// Unique identifier
    pub id: LoopId,

    /// Channel the two identities talk on
    pub channel_id: String,

    /// Identity fixing the work
    pub implementer: String,

    /// Identity checking the work
    pub verifier: String,

    /// Unit being iterated on
    pub unit_id: Option<String>,

    /// Failed verifications allowed before escalation
    pub max_retries: u32,

    /// Failed verifications so far; never decreases
    pub current_retry: u32,

    /// Current status
    pub status: LoopStatus,

    /// Creation timestamp
    pub created_at: Time,

    /// Last failed verification
    pub last_feedback_at: Option<Time>,

    /// When the loop reached a terminal status
    pub completed_at: Option<Time>,
}

impl FeedbackLoop {
    /// Retries left before escalation.
    pub fn retries_remaining(&self) -> u32 {
        self.max_retries.saturating_sub(self.current_retry)
    }
}

/// Request to open a feedback loop.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewFeedbackLoop {
    /// Channel the two identities talk on
    pub channel_id: String,
    /// Identity fixing the work
    pub implementer: String,
    /// Identity checking the work
    pub verifier: String,
    /// Unit being iterated on
    pub unit_id: Option<String>,
    /// Retry bound; unset or non-positive uses the configured default
    pub max_retries: Option<i64>,
}

impl NewFeedbackLoop {
    /// Create a request with the default retry bound.
    pub fn new(
        channel_id: impl Into<String>,
        implementer: impl Into<String>,
        verifier: impl Into<String>,
    ) -> Self {
        Self {
            channel_id: channel_id.into(),
            implementer: implementer.into(),
            verifier: verifier.into(),
            unit_id: None,
            max_retries: None,
        }
    }

    /// Attach the loop to a unit.
    pub fn with_unit(mut self, unit_id: impl Into<String>) -> Self {
        self.unit_id = Some(unit_id.into());
        self
    }

    /// Set the retry bound.
    pub fn with_max_retries(mut self, max_retries: i64) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Retry bound after applying the default.
    pub fn effective_max_retries(&self, default: u32) -> u32 {
        match self.max_retries {
            Some(n) if n > 0 => u32::try_from(n).unwrap_or(u32::MAX),
            _ => default,
        }
    }
}

/// A check that failed during verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailingCheck {
    /// Check or test name
    pub name: String,
    /// Failure message
    #[serde(default)]
    pub message: String,
    /// File and line, when known
    #[serde(default)]
    pub location: Option<String>,
}

impl FailingCheck {
    /// Create a failing check.
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            location: None,
        }
    }
}

/// What a verifier reports for one iteration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerificationResult {
    /// Overall verdict
    pub success: bool,
    /// Checks passed
    pub passed: u32,
    /// Checks failed
    pub failed: u32,
    /// Coverage percentage, when measured
    pub coverage: Option<f64>,
    /// Details of failed checks
    pub failures: Vec<FailingCheck>,
    /// Hints for the implementer
    pub suggestions: Vec<String>,
    /// Worker snapshot to run escalation triggers against
    pub context: Option<WorkerContext>,
}

impl VerificationResult {
    /// A passing result.
    pub fn passed(passed: u32) -> Self {
        Self {
            success: true,
            passed,
            ..Default::default()
        }
    }

    /// A failing result with the given failures.
    pub fn failed(passed: u32, failures: Vec<FailingCheck>) -> Self {
        Self {
            success: false,
            passed,
            failed: failures.len() as u32,
            failures,
            ..Default::default()
        }
    }
}

/// The record produced for one processed verification result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackRecord {
    /// Loop the result belongs to
    pub loop_id: LoopId,
    /// 1-based iteration number
    pub iteration: u32,
    /// Overall verdict
    pub success: bool,
    /// Checks passed
    pub passed: u32,
    /// Checks failed
    pub failed: u32,
    /// Coverage percentage, when measured
    pub coverage: Option<f64>,
    /// Details of failed checks
    pub failures: Vec<FailingCheck>,
    /// Hints for the implementer
    pub suggestions: Vec<String>,
    /// Conditions fired by the attached worker snapshot
    #[serde(default)]
    pub escalations: Vec<NewEscalation>,
    /// When the result was processed
    pub recorded_at: Time,
}

impl FeedbackRecord {
    /// Build the record for the next iteration of `feedback_loop`.
    pub fn for_iteration(feedback_loop: &FeedbackLoop, result: &VerificationResult) -> Self {
        Self {
            loop_id: feedback_loop.id,
            iteration: feedback_loop.current_retry + 1,
            success: result.success,
            passed: result.passed,
            failed: result.failed,
            coverage: result.coverage,
            failures: result.failures.clone(),
            suggestions: result.suggestions.clone(),
            escalations: Vec::new(),
            recorded_at: chrono::Utc::now(),
        }
    }

    /// Names of the failed checks.
    pub fn failing_check_names(&self) -> Vec<String> {
        self.failures.iter().map(|f| f.name.clone()).collect()
    }
}

/// Aggregate statistics over feedback loops.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeedbackStats {
    /// All loops
    pub total: usize,
    /// Loops still iterating
    pub running: usize,
    /// Loops that passed
    pub success: usize,
    /// Loops abandoned
    pub failed: usize,
    /// Loops handed to a human
    pub escalated: usize,
    /// Successful share of finished loops, 0.0 to 1.0
    pub success_rate: f64,
    /// Mean `current_retry` across all loops
    pub average_retries: f64,
}

impl FeedbackStats {
    /// Compute statistics for a set of loops.
    pub fn from_loops(loops: &[FeedbackLoop]) -> Self {
        let mut stats = FeedbackStats {
            total: loops.len(),
            ..Default::default()
        };
        let mut retries = 0u64;
        for l in loops {
            retries += u64::from(l.current_retry);
            match l.status {
                LoopStatus::Running => stats.running += 1,
                LoopStatus::Success => stats.success += 1,
                LoopStatus::Failed => stats.failed += 1,
                LoopStatus::Escalated => stats.escalated += 1,
            }
        }

        let finished = stats.success + stats.failed + stats.escalated;
        if finished > 0 {
            stats.success_rate = stats.success as f64 / finished as f64;
        }
        if stats.total > 0 {
            stats.average_retries = retries as f64 / stats.total as f64;
        }
        stats
    }
}

/// A message handed from one identity to another over a channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayMessage {
    /// Channel
    pub channel_id: String,
    /// Sender
    pub from: String,
    /// Recipient
    pub to: String,
    /// Structured body
    pub payload: serde_json::Value,
    /// When sent
    pub sent_at: Time,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_loop(status: LoopStatus, current_retry: u32) -> FeedbackLoop {
        FeedbackLoop {
            id: LoopId::new(),
            channel_id: "ch".to_string(),
            implementer: "impl".to_string(),
            verifier: "verify".to_string(),
            unit_id: None,
            max_retries: 3,
            current_retry,
            status,
            created_at: chrono::Utc::now(),
            last_feedback_at: None,
            completed_at: None,
        }
    }

    #[test]
    fn test_effective_max_retries() {
        let req = NewFeedbackLoop::new("ch", "a", "b");
        assert_eq!(req.effective_max_retries(3), 3);
        assert_eq!(req.clone().with_max_retries(0).effective_max_retries(3), 3);
        assert_eq!(req.clone().with_max_retries(-2).effective_max_retries(3), 3);
        assert_eq!(req.with_max_retries(5).effective_max_retries(3), 5);
    }

    #[test]
    fn test_record_iteration_number() {
        let l = make_loop(LoopStatus::Running, 2);
        let result = VerificationResult::failed(4, vec![FailingCheck::new("test_a", "boom")]);
        let record = FeedbackRecord::for_iteration(&l, &result);
        assert_eq!(record.iteration, 3);
        assert_eq!(record.failed, 1);
        assert_eq!(record.failing_check_names(), vec!["test_a".to_string()]);
    }

    #[test]
    fn test_stats() {
        let loops = vec![
            make_loop(LoopStatus::Success, 1),
            make_loop(LoopStatus::Escalated, 3),
            make_loop(LoopStatus::Running, 2),
            make_loop(LoopStatus::Success, 0),
        ];
        let stats = FeedbackStats::from_loops(&loops);
        assert_eq!(stats.total, 4);
        assert_eq!(stats.running, 1);
        assert_eq!(stats.success, 2);
        assert_eq!(stats.escalated, 1);
        assert!((stats.success_rate - 2.0 / 3.0).abs() < 1e-9);
        assert!((stats.average_retries - 1.5).abs() < 1e-9);
    }

    #[test]
    fn test_stats_empty() {
        let stats = FeedbackStats::from_loops(&[]);
        assert_eq!(stats.success_rate, 0.0);
        assert_eq!(stats.average_retries, 0.0);
    }

    #[test]
    fn test_verification_result_from_partial_json() {
        let result: VerificationResult =
            serde_json::from_str(r#"{"success": false, "failures": [{"name": "lint"}]}"#).unwrap();
        assert!(!result.success);
        assert_eq!(result.failures[0].name, "lint");
        assert!(result.context.is_none());
    }
}
