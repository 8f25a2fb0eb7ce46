//! Errors for pipeline and lock operations.

use portline_core::{ErrorKind, PipelineStatus, Time, UnitStatus};
use portline_storage::StorageError;

/// Errors from pipeline and dependency operations.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Unknown pipeline
    #[error("pipeline not found: {0}")]
    PipelineNotFound(String),

    /// Unknown unit
    #[error("unit not found: {0}")]
    UnitNotFound(String),

    /// The unit is not a member of the pipeline
    #[error("unit {unit_id} is not in pipeline {pipeline_id}")]
    MemberNotFound {
        /// Pipeline that was searched
        pipeline_id: String,
        /// Missing unit
        unit_id: String,
    },

    /// The requested status change would move backward or sideways
    #[error("unit {unit_id} cannot move from {from} to {to}")]
    InvalidTransition {
        /// Unit being reported
        unit_id: String,
        /// Status it holds
        from: UnitStatus,
        /// Status requested
        to: UnitStatus,
    },

    /// Dependencies are not complete yet
    #[error("unit {unit_id} is blocked by: {}", blocking.join(", "))]
    Blocked {
        /// Unit that was asked about
        unit_id: String,
        /// Incomplete prerequisites, in edge insertion order
        blocking: Vec<String>,
    },

    /// Another claimant got there first
    #[error("unit {unit_id} is already {status}")]
    AlreadyClaimed {
        /// Unit being claimed
        unit_id: String,
        /// Status it holds
        status: UnitStatus,
    },

    /// The pipeline no longer accepts work
    #[error("pipeline {pipeline_id} is {status}")]
    PipelineClosed {
        /// Pipeline
        pipeline_id: String,
        /// Its status
        status: PipelineStatus,
    },

    /// Rejected input
    #[error("invalid input: {0}")]
    Validation(String),

    /// Storage failure
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl PipelineError {
    /// Category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::PipelineNotFound(_)
            | PipelineError::UnitNotFound(_)
            | PipelineError::MemberNotFound { .. } => ErrorKind::NotFound,
            PipelineError::InvalidTransition { .. } | PipelineError::Validation(_) => {
                ErrorKind::Validation
            }
            PipelineError::Blocked { .. }
            | PipelineError::AlreadyClaimed { .. }
            | PipelineError::PipelineClosed { .. } => ErrorKind::Conflict,
            PipelineError::Storage(e) => e.kind(),
        }
    }
}

/// Errors from resource lock operations.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// Someone else holds the resource
    #[error("resource {resource} is locked by {holder} since {acquired_at}")]
    Held {
        /// Contested resource
        resource: String,
        /// Current holder
        holder: String,
        /// When the holder acquired it
        acquired_at: Time,
    },

    /// The insert lost a race but the winner released before it could be read
    #[error("resource {0} is contended, retry")]
    Contended(String),

    /// Rejected input
    #[error("invalid input: {0}")]
    Validation(String),

    /// Storage failure
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl LockError {
    /// Category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            LockError::Held { .. } | LockError::Contended(_) => ErrorKind::Conflict,
            LockError::Validation(_) => ErrorKind::Validation,
            LockError::Storage(e) => e.kind(),
        }
    }
}
