//! Trigger rules and the engine that evaluates them.
//!
//! A trigger is plain data: a kind, a severity, a predicate over a
//! [`WorkerContext`] and two text builders. The engine holds an ordered list
//! of them and new rules are appended with [`TriggerEngine::register`].

use portline_core::{EscalationKind, NewEscalation, Severity, TriggerThresholds, WorkerContext};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

type Predicate = Arc<dyn Fn(&WorkerContext) -> bool + Send + Sync>;
type TextBuilder = Arc<dyn Fn(&WorkerContext) -> String + Send + Sync>;

/// One escalation rule.
#[derive(Clone)]
pub struct Trigger {
    /// Kind of escalation raised
    pub kind: EscalationKind,
    /// Severity of the raised escalation
    pub severity: Severity,
    /// Whether the condition clears on its own
    pub auto_resolve: bool,
    predicate: Predicate,
    issue: TextBuilder,
    suggestion: TextBuilder,
}

impl Trigger {
    /// Create a rule firing when `predicate` holds.
    pub fn new<F>(kind: EscalationKind, severity: Severity, predicate: F) -> Self
    where
        F: Fn(&WorkerContext) -> bool + Send + Sync + 'static,
    {
        let label = kind.to_string();
        Self {
            kind,
            severity,
            auto_resolve: false,
            predicate: Arc::new(predicate),
            issue: Arc::new(move |_: &WorkerContext| format!("{} condition detected", label)),
            suggestion: Arc::new(|_: &WorkerContext| {
                "Review the worker and decide how to proceed".to_string()
            }),
        }
    }

    /// Set the issue text builder.
    pub fn with_issue<F>(mut self, issue: F) -> Self
    where
        F: Fn(&WorkerContext) -> String + Send + Sync + 'static,
    {
        self.issue = Arc::new(issue);
        self
    }

    /// Set the suggestion text builder.
    pub fn with_suggestion<F>(mut self, suggestion: F) -> Self
    where
        F: Fn(&WorkerContext) -> String + Send + Sync + 'static,
    {
        self.suggestion = Arc::new(suggestion);
        self
    }

    /// Mark the condition as clearing on its own.
    pub fn auto_resolving(mut self) -> Self {
        self.auto_resolve = true;
        self
    }

    /// Whether the rule fires for `ctx`.
    pub fn fires(&self, ctx: &WorkerContext) -> bool {
        (self.predicate)(ctx)
    }

    /// Build the escalation this rule raises for `ctx`.
    pub fn escalation_for(&self, ctx: &WorkerContext) -> NewEscalation {
        NewEscalation {
            origin: ctx.worker_id.clone(),
            unit_id: ctx.unit_id.clone(),
            kind: self.kind.clone(),
            severity: self.severity,
            issue: (self.issue)(ctx),
            suggestion: (self.suggestion)(ctx),
            auto_resolve: self.auto_resolve,
        }
    }
}

impl fmt::Debug for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Trigger")
            .field("kind", &self.kind)
            .field("severity", &self.severity)
            .field("auto_resolve", &self.auto_resolve)
            .finish_non_exhaustive()
    }
}

/// Evaluates an ordered rule table against worker snapshots.
#[derive(Debug, Clone, Default)]
pub struct TriggerEngine {
    triggers: Vec<Trigger>,
}

impl TriggerEngine {
    /// An engine with no rules.
    pub fn new() -> Self {
        Self::default()
    }

    /// An engine with the built-in rules, using `thresholds` for the budget
    /// ratios.
    pub fn with_defaults(thresholds: &TriggerThresholds) -> Self {
        let mut engine = Self::new();
        for trigger in default_triggers(thresholds) {
            engine.register(trigger);
        }
        engine
    }

    /// Append a rule.
    pub fn register(&mut self, trigger: Trigger) {
        debug!("Registered {} trigger ({})", trigger.kind, trigger.severity);
        self.triggers.push(trigger);
    }

    /// Rules in evaluation order.
    pub fn triggers(&self) -> &[Trigger] {
        &self.triggers
    }

    /// One escalation per rule that fires, in rule order.
    pub fn check(&self, ctx: &WorkerContext) -> Vec<NewEscalation> {
        self.triggers
            .iter()
            .filter(|t| t.fires(ctx))
            .map(|t| t.escalation_for(ctx))
            .collect()
    }

    /// Highest severity among fired rules, `Low` when none fire.
    pub fn evaluate_severity(&self, ctx: &WorkerContext) -> Severity {
        self.triggers
            .iter()
            .filter(|t| t.fires(ctx))
            .map(|t| t.severity)
            .max()
            .unwrap_or_default()
    }
}

fn default_triggers(thresholds: &TriggerThresholds) -> Vec<Trigger> {
    let warning = thresholds.budget_warning_ratio;
    let exhausted = thresholds.budget_exhausted_ratio;

    vec![
        Trigger::new(EscalationKind::VerificationFailure, Severity::High, |ctx| {
            ctx.max_retries > 0 && ctx.retries >= ctx.max_retries
        })
        .with_issue(|ctx| {
            format!(
                "Verification failed {} times (limit {})",
                ctx.retries, ctx.max_retries
            )
        })
        .with_suggestion(|_| {
            "Review the failing checks by hand or split the unit into smaller pieces".to_string()
        }),
        Trigger::new(EscalationKind::BudgetExhausted, Severity::Medium, move |ctx| {
            ctx.budget_ratio().is_some_and(|r| r >= exhausted)
        })
        .with_issue(|ctx| {
            format!(
                "Budget nearly exhausted: {:.2} of {:.2} used",
                ctx.budget_used,
                ctx.budget_limit.unwrap_or_default()
            )
        })
        .with_suggestion(|_| "Raise the budget or stop the worker".to_string()),
        Trigger::new(EscalationKind::BudgetWarning, Severity::Low, move |ctx| {
            ctx.budget_ratio()
                .is_some_and(|r| r >= warning && r < exhausted)
        })
        .with_issue(|ctx| {
            format!(
                "Budget usage at {:.0}%",
                ctx.budget_ratio().unwrap_or_default() * 100.0
            )
        })
        .with_suggestion(|_| "Keep an eye on spend".to_string())
        .auto_resolving(),
        Trigger::new(EscalationKind::Timeout, Severity::High, |ctx| {
            ctx.timeout_secs.is_some_and(|t| ctx.elapsed_secs > t)
        })
        .with_issue(|ctx| {
            format!(
                "Worker ran {}s, past its {}s timeout",
                ctx.elapsed_secs,
                ctx.timeout_secs.unwrap_or_default()
            )
        })
        .with_suggestion(|_| "Check whether the worker is stuck and restart it".to_string()),
        Trigger::new(EscalationKind::BuildFailure, Severity::High, |ctx| ctx.build_failed)
            .with_issue(|ctx| match &ctx.last_error {
                Some(err) => format!("Build failed: {}", err),
                None => "Build failed".to_string(),
            })
            .with_suggestion(|_| "Fix the build before more work lands on it".to_string()),
        Trigger::new(EscalationKind::Blocked, Severity::Medium, |ctx| ctx.blocked)
            .with_issue(|ctx| match &ctx.blocked_reason {
                Some(reason) => format!("Worker blocked: {}", reason),
                None => "Worker blocked".to_string(),
            })
            .with_suggestion(|_| "Unblock the worker or reassign the unit".to_string()),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn engine() -> TriggerEngine {
        TriggerEngine::with_defaults(&TriggerThresholds::default())
    }

    fn kinds(fired: &[NewEscalation]) -> Vec<EscalationKind> {
        fired.iter().map(|e| e.kind.clone()).collect()
    }

    #[test]
    fn test_quiet_context_fires_nothing() {
        let engine = engine();
        let ctx = WorkerContext::new().with_retries(1, 3);
        assert!(engine.check(&ctx).is_empty());
        assert_eq!(engine.evaluate_severity(&ctx), Severity::Low);
    }

    #[test]
    fn test_retry_bound() {
        let engine = engine();
        let ctx = WorkerContext::new().with_worker("s1").with_unit("u1").with_retries(3, 3);
        let fired = engine.check(&ctx);
        assert_eq!(kinds(&fired), vec![EscalationKind::VerificationFailure]);
        assert_eq!(fired[0].origin.as_deref(), Some("s1"));
        assert_eq!(fired[0].unit_id.as_deref(), Some("u1"));
        assert!(fired[0].issue.contains("3 times"));

        // An unbounded loop never trips the rule
        let unbounded = WorkerContext::new().with_retries(10, 0);
        assert!(engine.check(&unbounded).is_empty());
    }

    #[test]
    fn test_budget_bands() {
        let engine = engine();

        let warning = engine.check(&WorkerContext::new().with_budget(80.0, 100.0));
        assert_eq!(kinds(&warning), vec![EscalationKind::BudgetWarning]);
        assert!(warning[0].auto_resolve);

        let exhausted = engine.check(&WorkerContext::new().with_budget(95.0, 100.0));
        assert_eq!(kinds(&exhausted), vec![EscalationKind::BudgetExhausted]);
        assert!(!exhausted[0].auto_resolve);

        assert!(engine.check(&WorkerContext::new().with_budget(79.0, 100.0)).is_empty());
        assert!(engine.check(&WorkerContext::new().with_budget(500.0, 0.0)).is_empty());
    }

    #[test]
    fn test_custom_thresholds() {
        let thresholds = TriggerThresholds {
            budget_warning_ratio: 0.5,
            budget_exhausted_ratio: 0.9,
        };
        let engine = TriggerEngine::with_defaults(&thresholds);
        let fired = engine.check(&WorkerContext::new().with_budget(6.0, 10.0));
        assert_eq!(kinds(&fired), vec![EscalationKind::BudgetWarning]);
    }

    #[test]
    fn test_timeout_requires_limit() {
        let engine = engine();
        let over = WorkerContext::new()
            .with_elapsed(Duration::from_secs(120), Some(Duration::from_secs(60)));
        assert_eq!(kinds(&engine.check(&over)), vec![EscalationKind::Timeout]);

        let at_limit = WorkerContext::new()
            .with_elapsed(Duration::from_secs(60), Some(Duration::from_secs(60)));
        assert!(engine.check(&at_limit).is_empty());

        let no_limit = WorkerContext::new().with_elapsed(Duration::from_secs(10_000), None);
        assert!(engine.check(&no_limit).is_empty());
    }

    #[test]
    fn test_several_rules_fire_and_severity_is_max() {
        let engine = engine();
        let ctx = WorkerContext::new()
            .with_blocked("waiting on credentials")
            .with_build_failed(true)
            .with_budget(85.0, 100.0);

        let fired = engine.check(&ctx);
        assert_eq!(
            kinds(&fired),
            vec![
                EscalationKind::BudgetWarning,
                EscalationKind::BuildFailure,
                EscalationKind::Blocked,
            ]
        );
        assert!(fired[2].issue.contains("waiting on credentials"));
        assert_eq!(engine.evaluate_severity(&ctx), Severity::High);

        let blocked_only = WorkerContext::new().with_blocked("x");
        assert_eq!(engine.evaluate_severity(&blocked_only), Severity::Medium);
    }

    #[test]
    fn test_register_custom_rule() {
        let mut engine = engine();
        engine.register(
            Trigger::new(
                EscalationKind::Custom("error_spam".to_string()),
                Severity::Critical,
                |ctx| ctx.last_error.is_some(),
            )
            .with_issue(|ctx| format!("Error: {}", ctx.last_error.clone().unwrap_or_default())),
        );
        assert_eq!(engine.triggers().len(), 7);

        let ctx = WorkerContext {
            last_error: Some("disk full".to_string()),
            ..Default::default()
        };
        let fired = engine.check(&ctx);
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].issue, "Error: disk full");
        assert_eq!(engine.evaluate_severity(&ctx), Severity::Critical);
    }
}
