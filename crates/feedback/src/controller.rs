//! Feedback loop controller.
//!
//! ```text
//! running ──pass──> success
//!    │
//!    ├──fail (retries left)──> running   (failure relayed to implementer)
//!    ├──fail (bound reached)──> escalated (ExhaustedRetries)
//!    └──operator──> failed
//! ```
//!
//! The retry increment and the status change are one conditional store
//! update on a running row, so a closed loop never takes another result.

use portline_core::{
    ErrorKind, FeedbackLoop, FeedbackRecord, FeedbackStats, LoopId, LoopStatus, NewFeedbackLoop,
    VerificationResult, WorkerContext, DEFAULT_MAX_RETRIES,
};
use portline_escalation::TriggerEngine;
use portline_storage::{Storage, StorageError};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::{MessageRelay, RelayError};

/// Errors from feedback loop operations.
#[derive(Debug, thiserror::Error)]
pub enum FeedbackError {
    /// Unknown loop
    #[error("feedback loop not found: {0}")]
    NotFound(String),

    /// The loop no longer accepts results
    #[error("feedback loop {loop_id} is closed ({status})")]
    LoopClosed {
        /// Loop
        loop_id: LoopId,
        /// Its terminal status
        status: LoopStatus,
    },

    /// The retry bound was reached and the loop escalated
    #[error("feedback loop {loop_id} exhausted its retries ({current_retry}/{max_retries})")]
    ExhaustedRetries {
        /// Loop
        loop_id: LoopId,
        /// Failed verifications, equal to the bound
        current_retry: u32,
        /// The bound
        max_retries: u32,
        /// Record of the final failing iteration
        record: Box<FeedbackRecord>,
    },

    /// Rejected input
    #[error("invalid feedback loop: {0}")]
    Validation(String),

    /// Relay failure
    #[error(transparent)]
    Relay(#[from] RelayError),

    /// Storage failure
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl FeedbackError {
    /// Category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            FeedbackError::NotFound(_) => ErrorKind::NotFound,
            FeedbackError::LoopClosed { .. } => ErrorKind::Conflict,
            FeedbackError::ExhaustedRetries { .. } => ErrorKind::ExhaustedRetries,
            FeedbackError::Validation(_) => ErrorKind::Validation,
            FeedbackError::Relay(_) => ErrorKind::Internal,
            FeedbackError::Storage(e) => e.kind(),
        }
    }
}

/// Coordinates implement, verify, fix cycles.
pub struct FeedbackController {
    storage: Arc<dyn Storage>,
    relay: Arc<dyn MessageRelay>,
    triggers: Option<TriggerEngine>,
    default_max_retries: u32,
}

impl FeedbackController {
    /// Create a controller over a store and relay.
    pub fn new(storage: Arc<dyn Storage>, relay: Arc<dyn MessageRelay>) -> Self {
        Self {
            storage,
            relay,
            triggers: None,
            default_max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    /// Evaluate worker snapshots attached to results with `engine`.
    pub fn with_triggers(mut self, engine: TriggerEngine) -> Self {
        self.triggers = Some(engine);
        self
    }

    /// Retry bound for loops created without one.
    pub fn with_default_max_retries(mut self, max_retries: u32) -> Self {
        self.default_max_retries = max_retries.max(1);
        self
    }

    /// Open a loop.
    pub async fn create(&self, request: NewFeedbackLoop) -> Result<FeedbackLoop, FeedbackError> {
        for (field, value) in [
            ("channel id", &request.channel_id),
            ("implementer", &request.implementer),
            ("verifier", &request.verifier),
        ] {
            if value.trim().is_empty() {
                return Err(FeedbackError::Validation(format!("{} is empty", field)));
            }
        }

        let feedback_loop = FeedbackLoop {
            id: LoopId::new(),
            max_retries: request.effective_max_retries(self.default_max_retries),
            channel_id: request.channel_id,
            implementer: request.implementer,
            verifier: request.verifier,
            unit_id: request.unit_id,
            current_retry: 0,
            status: LoopStatus::Running,
            created_at: chrono::Utc::now(),
            last_feedback_at: None,
            completed_at: None,
        };

        self.storage.insert_feedback_loop(&feedback_loop).await?;
        info!(
            "Feedback loop {} opened on {} ({} -> {}, max {} retries)",
            feedback_loop.id,
            feedback_loop.channel_id,
            feedback_loop.verifier,
            feedback_loop.implementer,
            feedback_loop.max_retries
        );
        Ok(feedback_loop)
    }

    /// Load a loop.
    pub async fn get(&self, id: LoopId) -> Result<FeedbackLoop, FeedbackError> {
        self.storage
            .load_feedback_loop(id)
            .await?
            .ok_or_else(|| FeedbackError::NotFound(id.to_string()))
    }

    /// Most recent loop on a channel.
    pub async fn get_by_channel(&self, channel_id: &str) -> Result<FeedbackLoop, FeedbackError> {
        self.storage
            .load_loop_by_channel(channel_id)
            .await?
            .ok_or_else(|| FeedbackError::NotFound(format!("channel {}", channel_id)))
    }

    /// Running loop for a unit.
    pub async fn get_active_for_unit(&self, unit_id: &str) -> Result<FeedbackLoop, FeedbackError> {
        self.storage
            .load_active_loop_for_unit(unit_id)
            .await?
            .ok_or_else(|| FeedbackError::NotFound(format!("active loop for unit {}", unit_id)))
    }

    /// All running loops.
    pub async fn list_active(&self) -> Result<Vec<FeedbackLoop>, FeedbackError> {
        Ok(self
            .storage
            .list_feedback_loops(Some(LoopStatus::Running))
            .await?)
    }

    /// Aggregate statistics over every loop.
    pub async fn stats(&self) -> Result<FeedbackStats, FeedbackError> {
        let loops = self.storage.list_feedback_loops(None).await?;
        Ok(FeedbackStats::from_loops(&loops))
    }

    /// Abandon a running loop.
    pub async fn fail(&self, id: LoopId) -> Result<FeedbackLoop, FeedbackError> {
        let closed = self
            .storage
            .close_feedback_loop(id, LoopStatus::Failed, chrono::Utc::now())
            .await?;
        match closed {
            Some(feedback_loop) => {
                warn!("Feedback loop {} marked failed", id);
                Ok(feedback_loop)
            }
            None => Err(self.closed_error(id).await),
        }
    }

    /// Apply one verification result to a running loop.
    ///
    /// Returns the iteration record. When the failure reaches the retry bound
    /// the loop escalates and `ExhaustedRetries` carries the record instead.
    pub async fn process_verification_result(
        &self,
        id: LoopId,
        result: VerificationResult,
    ) -> Result<FeedbackRecord, FeedbackError> {
        let feedback_loop = self.get(id).await?;
        if feedback_loop.status.is_terminal() {
            return Err(FeedbackError::LoopClosed {
                loop_id: id,
                status: feedback_loop.status,
            });
        }

        let mut record = FeedbackRecord::for_iteration(&feedback_loop, &result);

        if result.success {
            let closed = self
                .storage
                .close_feedback_loop(id, LoopStatus::Success, record.recorded_at)
                .await?;
            let Some(closed) = closed else {
                return Err(self.closed_error(id).await);
            };
            self.attach_escalations(&mut record, &closed, result.context.as_ref());
            info!("Feedback loop {} passed on iteration {}", id, record.iteration);
            return Ok(record);
        }

        let updated = self
            .storage
            .record_loop_failure(id, record.recorded_at)
            .await?;
        let Some(updated) = updated else {
            return Err(self.closed_error(id).await);
        };

        record.iteration = updated.current_retry;
        self.attach_escalations(&mut record, &updated, result.context.as_ref());

        if updated.status == LoopStatus::Escalated {
            warn!(
                "Feedback loop {} escalated after {} failed verifications",
                id, updated.current_retry
            );
            return Err(FeedbackError::ExhaustedRetries {
                loop_id: id,
                current_retry: updated.current_retry,
                max_retries: updated.max_retries,
                record: Box::new(record),
            });
        }

        let payload = serde_json::to_value(&record).map_err(RelayError::from)?;
        self.relay
            .send(
                &updated.channel_id,
                &updated.verifier,
                &updated.implementer,
                payload,
            )
            .await?;
        debug!(
            "Feedback loop {} iteration {} failed, {} retries left",
            id,
            record.iteration,
            updated.retries_remaining()
        );

        Ok(record)
    }

    /// Run the trigger table over the result's snapshot, if both exist.
    fn attach_escalations(
        &self,
        record: &mut FeedbackRecord,
        feedback_loop: &FeedbackLoop,
        context: Option<&WorkerContext>,
    ) {
        let (Some(engine), Some(context)) = (&self.triggers, context) else {
            return;
        };

        let mut ctx = context.clone();
        ctx.retries = feedback_loop.current_retry;
        ctx.max_retries = feedback_loop.max_retries;
        if ctx.unit_id.is_none() {
            ctx.unit_id = feedback_loop.unit_id.clone();
        }
        if ctx.worker_id.is_none() {
            ctx.worker_id = Some(feedback_loop.implementer.clone());
        }

        record.escalations = engine.check(&ctx);
    }

    /// Explain why a conditional update on `id` matched nothing.
    async fn closed_error(&self, id: LoopId) -> FeedbackError {
        match self.get(id).await {
            Ok(current) => FeedbackError::LoopClosed {
                loop_id: id,
                status: current.status,
            },
            Err(e) => e,
        }
    }
}
