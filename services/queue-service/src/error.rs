//! Error types for queue operations.

use crate::model::{JobId, JobStatus};
use chrono::Duration;

/// Result alias for queue operations.
pub type QueueResult<T> = Result<T, QueueError>;

/// Failures returned to callers of the queue.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// No job with the requested id.
    #[error("job {0} not found")]
    NotFound(String),

    /// The requested move is not legal from the current status.
    #[error("cannot move job from {from} to {to}")]
    InvalidTransition {
        /// Status the job is in.
        from: JobStatus,
        /// Status that was requested.
        to: JobStatus,
    },

    /// Another claimant got there first.
    #[error("already claimed by another reviewer")]
    AlreadyClaimed,

    /// Completion attempted by someone other than the claimant.
    #[error("job is claimed by a different reviewer")]
    NotClaimedByActor,

    /// Actor lacks the role the operation requires.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Retry age gate not yet satisfied.
    #[error("retry available in {}", format_wait(*remaining))]
    RetryTooSoon {
        /// Time left until the job becomes eligible.
        remaining: Duration,
    },

    /// The job already has a direct successor.
    #[error("job was already retried as {successor}")]
    Superseded {
        /// Latest job derived from this one.
        successor: JobId,
    },

    /// Malformed request input.
    #[error("invalid request: {0}")]
    Validation(String),

    /// A stored record could not be decoded.
    #[error("corrupt job record: {0}")]
    Corrupt(String),

    /// Database failure.
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    /// JSON encoding failure.
    #[error("payload error: {0}")]
    Payload(#[from] serde_json::Error),
}

impl QueueError {
    /// Stable machine-readable code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::AlreadyClaimed => "already_claimed",
            Self::NotClaimedByActor => "not_claimed_by_actor",
            Self::PermissionDenied(_) => "permission_denied",
            Self::RetryTooSoon { .. } => "retry_too_soon",
            Self::Superseded { .. } => "superseded",
            Self::Validation(_) => "validation",
            Self::Corrupt(_) | Self::Storage(_) | Self::Payload(_) => "internal",
        }
    }

    /// Shorthand for [`QueueError::PermissionDenied`].
    pub fn denied(reason: impl Into<String>) -> Self {
        Self::PermissionDenied(reason.into())
    }
}

/// Render a wait as "Xh Ym", rounding seconds up to the next minute.
#[must_use]
pub fn format_wait(remaining: Duration) -> String {
    let minutes = (remaining.num_seconds().max(0) + 59) / 60;
    let (hours, minutes) = (minutes / 60, minutes % 60);
    if hours > 0 {
        format!("{hours}h {minutes}m")
    } else {
        format!("{minutes}m")
    }
}
