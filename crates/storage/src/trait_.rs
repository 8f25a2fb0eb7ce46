//! Storage trait abstraction.

use async_trait::async_trait;
use portline_core::{
    DependencyEdge, ErrorKind, Escalation, EscalationId, EscalationStatus, FeedbackLoop, LoopId,
    LoopStatus, Pipeline, PipelineMember, PipelineStatus, RelayMessage, ResourceLock, Time,
    UnitStatus, WorkUnit,
};

/// Error type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Database error
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A stored value could not be decoded
    #[error("corrupt row: {0}")]
    Corrupt(String),

    /// Item not found
    #[error("not found: {0}")]
    NotFound(String),

    /// Write refused because of existing state
    #[error("conflict: {0}")]
    Conflict(String),

    /// Write refused because the input is invalid
    #[error("validation failed: {0}")]
    Validation(String),
}

impl StorageError {
    /// Category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            StorageError::NotFound(_) => ErrorKind::NotFound,
            StorageError::Conflict(_) => ErrorKind::Conflict,
            StorageError::Validation(_) => ErrorKind::Validation,
            StorageError::Database(_) | StorageError::Json(_) | StorageError::Corrupt(_) => {
                ErrorKind::Internal
            }
        }
    }
}

/// Outcome of a conditional lock insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockAttempt {
    /// The row was inserted; the caller holds the lock
    Acquired(ResourceLock),
    /// Another holder already has it
    Held(ResourceLock),
    /// The insert lost, but the winning row was gone by the time it was read
    Contended,
}

/// Storage abstraction for Portline coordination state.
///
/// Handles are cheap to clone and shared between tasks, so every method
/// takes `&self`. Implementations must make `try_insert_lock`,
/// `delete_lock_held_by`, `transition_member`, `update_derived_status`,
/// `record_loop_failure`, `close_feedback_loop` and `close_escalation`
/// single atomic operations.
#[async_trait]
pub trait Storage: Send + Sync {
    // === Work unit operations ===

    /// Load a unit by ID.
    async fn load_unit(&self, id: &str) -> Result<Option<WorkUnit>>;

    /// List all units ordered by group order, then ID.
    async fn list_units(&self) -> Result<Vec<WorkUnit>>;

    /// Set a unit's global status.
    async fn set_unit_status(&self, id: &str, status: UnitStatus) -> Result<()>;

    // === Pipeline operations ===

    /// Create a pipeline. Fails with `Conflict` if the ID is taken.
    async fn create_pipeline(&self, pipeline: &Pipeline) -> Result<()>;

    /// Load a pipeline by ID.
    async fn load_pipeline(&self, id: &str) -> Result<Option<Pipeline>>;

    /// List all pipelines.
    async fn list_pipelines(&self) -> Result<Vec<Pipeline>>;

    /// Delete a pipeline and its memberships. Returns whether it existed.
    async fn delete_pipeline(&self, id: &str) -> Result<bool>;

    /// Set a pipeline's status.
    async fn set_pipeline_status(&self, id: &str, status: PipelineStatus) -> Result<()>;

    /// Set a status derived from member counts unless the pipeline is
    /// cancelled. Returns whether the stored status changed.
    async fn update_derived_status(&self, id: &str, status: PipelineStatus) -> Result<bool>;

    // === Membership operations ===

    /// Add a unit to a pipeline, creating the unit if needed.
    /// Fails with `Conflict` if it is already a member.
    async fn add_member(&self, member: &PipelineMember) -> Result<()>;

    /// Remove a unit from a pipeline. Returns whether it was a member.
    async fn remove_member(&self, pipeline_id: &str, unit_id: &str) -> Result<bool>;

    /// Load one membership.
    async fn load_member(&self, pipeline_id: &str, unit_id: &str)
        -> Result<Option<PipelineMember>>;

    /// List memberships ordered by group order, then unit ID.
    async fn list_members(&self, pipeline_id: &str) -> Result<Vec<PipelineMember>>;

    /// Move a member to `to` only if its current status is one of `from`.
    /// Returns the updated member, or `None` if no row matched.
    async fn transition_member(
        &self,
        pipeline_id: &str,
        unit_id: &str,
        from: &[UnitStatus],
        to: UnitStatus,
    ) -> Result<Option<PipelineMember>>;

    // === Dependency operations ===

    /// Add an edge. Duplicates are ignored; an edge closing a cycle fails
    /// with `Validation`.
    async fn add_dependency(&self, edge: &DependencyEdge) -> Result<()>;

    /// Remove an edge. Returns whether it existed.
    async fn remove_dependency(&self, edge: &DependencyEdge) -> Result<bool>;

    /// Prerequisites of a unit, in insertion order.
    async fn dependencies_of(&self, unit_id: &str) -> Result<Vec<String>>;

    // === Lock operations ===

    /// Insert a lock row unless one exists for the resource.
    async fn try_insert_lock(&self, lock: &ResourceLock) -> Result<LockAttempt>;

    /// Load the lock on a resource.
    async fn load_lock(&self, resource: &str) -> Result<Option<ResourceLock>>;

    /// Delete the lock on a resource. Returns whether one existed.
    async fn delete_lock(&self, resource: &str) -> Result<bool>;

    /// Delete the lock on a resource only while `holder` owns it.
    async fn delete_lock_held_by(
        &self,
        resource: &str,
        holder: &str,
    ) -> Result<Option<ResourceLock>>;

    /// All locks ordered by resource.
    async fn list_locks(&self) -> Result<Vec<ResourceLock>>;

    /// Delete every lock held by `holder`, returning them.
    async fn delete_locks_by_holder(&self, holder: &str) -> Result<Vec<ResourceLock>>;

    /// Delete every lock. Returns the number removed.
    async fn clear_locks(&self) -> Result<u64>;

    // === Feedback loop operations ===

    /// Insert a new loop.
    async fn insert_feedback_loop(&self, feedback_loop: &FeedbackLoop) -> Result<()>;

    /// Load a loop by ID.
    async fn load_feedback_loop(&self, id: LoopId) -> Result<Option<FeedbackLoop>>;

    /// Most recently created loop on a channel.
    async fn load_loop_by_channel(&self, channel_id: &str) -> Result<Option<FeedbackLoop>>;

    /// Running loop attached to a unit, most recent first.
    async fn load_active_loop_for_unit(&self, unit_id: &str) -> Result<Option<FeedbackLoop>>;

    /// List loops, optionally filtered by status.
    async fn list_feedback_loops(&self, status: Option<LoopStatus>) -> Result<Vec<FeedbackLoop>>;

    /// On a running loop, increment `current_retry`, stamp `last_feedback_at`
    /// and escalate when the bound is reached. Returns `None` if the loop is
    /// missing or not running.
    async fn record_loop_failure(&self, id: LoopId, at: Time) -> Result<Option<FeedbackLoop>>;

    /// Move a running loop to a terminal status. Returns `None` if the loop
    /// is missing or not running.
    async fn close_feedback_loop(
        &self,
        id: LoopId,
        status: LoopStatus,
        at: Time,
    ) -> Result<Option<FeedbackLoop>>;

    // === Escalation operations ===

    /// Insert an escalation record.
    async fn insert_escalation(&self, escalation: &Escalation) -> Result<()>;

    /// Load an escalation by ID.
    async fn load_escalation(&self, id: EscalationId) -> Result<Option<Escalation>>;

    /// List escalations, newest first, optionally filtered by status.
    async fn list_escalations(&self, status: Option<EscalationStatus>) -> Result<Vec<Escalation>>;

    /// Close an open escalation. Returns `None` if it is missing or closed.
    async fn close_escalation(
        &self,
        id: EscalationId,
        status: EscalationStatus,
        at: Time,
    ) -> Result<Option<Escalation>>;

    // === Message operations ===

    /// Append a relayed message.
    async fn append_message(&self, message: &RelayMessage) -> Result<()>;

    /// Messages on a channel, oldest first.
    async fn list_messages(&self, channel_id: &str) -> Result<Vec<RelayMessage>>;
}
