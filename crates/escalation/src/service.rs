//! Escalation records - raising, listing and closing them.

use portline_core::{
    ErrorKind, Escalation, EscalationId, EscalationStatus, NewEscalation, WorkerContext,
};
use portline_storage::{Storage, StorageError};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

use crate::TriggerEngine;

/// Errors from escalation operations.
#[derive(Debug, thiserror::Error)]
pub enum EscalationError {
    /// Unknown escalation
    #[error("escalation not found: {0}")]
    NotFound(EscalationId),

    /// The record was already resolved or dismissed
    #[error("escalation {id} is already {status}")]
    Closed {
        /// Escalation
        id: EscalationId,
        /// Its status
        status: EscalationStatus,
    },

    /// Rejected input
    #[error("invalid escalation: {0}")]
    Validation(String),

    /// Storage failure
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl EscalationError {
    /// Category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            EscalationError::NotFound(_) => ErrorKind::NotFound,
            EscalationError::Closed { .. } => ErrorKind::Conflict,
            EscalationError::Validation(_) => ErrorKind::Validation,
            EscalationError::Storage(e) => e.kind(),
        }
    }
}

/// What a trigger evaluation produced.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Raised {
    /// Every fired rule, auto-resolving ones included
    pub fired: Vec<NewEscalation>,
    /// Records stored for the rules that need a human
    pub persisted: Vec<Escalation>,
}

/// Persists and manages escalations.
#[derive(Clone)]
pub struct EscalationService {
    storage: Arc<dyn Storage>,
    engine: TriggerEngine,
}

impl EscalationService {
    /// Create a service over a store and rule table.
    pub fn new(storage: Arc<dyn Storage>, engine: TriggerEngine) -> Self {
        Self { storage, engine }
    }

    /// The rule table.
    pub fn engine(&self) -> &TriggerEngine {
        &self.engine
    }

    /// Store an escalation submitted by an operator.
    pub async fn create(&self, new: NewEscalation) -> Result<Escalation, EscalationError> {
        if new.issue.trim().is_empty() {
            return Err(EscalationError::Validation("issue is empty".to_string()));
        }

        let escalation = Escalation::open(new);
        self.storage.insert_escalation(&escalation).await?;
        warn!(
            "Escalation {} raised: [{}] {} {}",
            escalation.id, escalation.severity, escalation.kind, escalation.issue
        );
        Ok(escalation)
    }

    /// Evaluate the rules against `ctx` and store what needs a human.
    pub async fn raise(&self, ctx: &WorkerContext) -> Result<Raised, EscalationError> {
        let fired = self.engine.check(ctx);
        let persisted = self.record(&fired).await?;
        Ok(Raised { fired, persisted })
    }

    /// Store the escalations in `fired` that do not clear on their own.
    pub async fn record(&self, fired: &[NewEscalation]) -> Result<Vec<Escalation>, EscalationError> {
        let mut persisted = Vec::new();
        for new in fired.iter().filter(|e| !e.auto_resolve) {
            persisted.push(self.create(new.clone()).await?);
        }
        Ok(persisted)
    }

    /// Escalations, newest first, optionally filtered by status.
    pub async fn list(
        &self,
        status: Option<EscalationStatus>,
    ) -> Result<Vec<Escalation>, EscalationError> {
        Ok(self.storage.list_escalations(status).await?)
    }

    /// Load one escalation.
    pub async fn show(&self, id: EscalationId) -> Result<Escalation, EscalationError> {
        self.storage
            .load_escalation(id)
            .await?
            .ok_or(EscalationError::NotFound(id))
    }

    /// Mark an open escalation resolved.
    pub async fn resolve(&self, id: EscalationId) -> Result<Escalation, EscalationError> {
        self.close(id, EscalationStatus::Resolved).await
    }

    /// Mark an open escalation dismissed.
    pub async fn dismiss(&self, id: EscalationId) -> Result<Escalation, EscalationError> {
        self.close(id, EscalationStatus::Dismissed).await
    }

    async fn close(
        &self,
        id: EscalationId,
        status: EscalationStatus,
    ) -> Result<Escalation, EscalationError> {
        let closed = self
            .storage
            .close_escalation(id, status, chrono::Utc::now())
            .await?;

        match closed {
            Some(escalation) => {
                info!("Escalation {} {}", id, status);
                Ok(escalation)
            }
            None => {
                let current = self.show(id).await?;
                Err(EscalationError::Closed {
                    id,
                    status: current.status,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use portline_core::{EscalationKind, Severity, TriggerThresholds};
    use portline_storage::SqliteStorage;

    async fn service() -> EscalationService {
        let storage = SqliteStorage::in_memory().await.unwrap();
        EscalationService::new(
            Arc::new(storage),
            TriggerEngine::with_defaults(&TriggerThresholds::default()),
        )
    }

    fn manual(issue: &str) -> NewEscalation {
        NewEscalation {
            origin: Some("operator".to_string()),
            unit_id: Some("u1".to_string()),
            kind: EscalationKind::Manual,
            severity: Severity::Medium,
            issue: issue.to_string(),
            suggestion: "look at it".to_string(),
            auto_resolve: false,
        }
    }

    #[tokio::test]
    async fn test_create_and_show() {
        let escalations = service().await;
        let created = escalations.create(manual("stuck on schema")).await.unwrap();
        assert_eq!(created.status, EscalationStatus::Open);

        let loaded = escalations.show(created.id).await.unwrap();
        assert_eq!(loaded.issue, "stuck on schema");
        assert_eq!(loaded.kind, EscalationKind::Manual);

        let err = escalations.create(manual("  ")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_resolve_is_final() {
        let escalations = service().await;
        let created = escalations.create(manual("a")).await.unwrap();

        let resolved = escalations.resolve(created.id).await.unwrap();
        assert_eq!(resolved.status, EscalationStatus::Resolved);
        assert!(resolved.resolved_at.is_some());

        let err = escalations.dismiss(created.id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert!(matches!(
            err,
            EscalationError::Closed { status: EscalationStatus::Resolved, .. }
        ));

        let err = escalations.resolve(EscalationId::new()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_raise_skips_auto_resolving() {
        let escalations = service().await;
        let ctx = WorkerContext::new()
            .with_worker("s1")
            .with_budget(85.0, 100.0)
            .with_build_failed(true);

        let raised = escalations.raise(&ctx).await.unwrap();
        assert_eq!(raised.fired.len(), 2);
        assert_eq!(raised.persisted.len(), 1);
        assert_eq!(raised.persisted[0].kind, EscalationKind::BuildFailure);
        assert_eq!(raised.persisted[0].origin.as_deref(), Some("s1"));

        let open = escalations.list(Some(EscalationStatus::Open)).await.unwrap();
        assert_eq!(open.len(), 1);
    }

    #[tokio::test]
    async fn test_list_filters_by_status() {
        let escalations = service().await;
        let first = escalations.create(manual("first")).await.unwrap();
        escalations.create(manual("second")).await.unwrap();
        escalations.dismiss(first.id).await.unwrap();

        assert_eq!(escalations.list(None).await.unwrap().len(), 2);
        let open = escalations.list(Some(EscalationStatus::Open)).await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].issue, "second");
        let dismissed = escalations
            .list(Some(EscalationStatus::Dismissed))
            .await
            .unwrap();
        assert_eq!(dismissed[0].id, first.id);
    }
}
