//! Pure transition rules for the job lifecycle.
//!
//! ```text
//! pending    -> processing  (claim / process; graders only)
//! pending    -> cancelled   (cancel; submitter or teacher)
//! processing -> completed   (complete; claimant only)
//! processing -> failed      (complete with failure; claimant only)
//! ```
//!
//! [`evaluate`] performs no I/O. It turns a snapshot of a job plus a requested
//! transition into a [`Mutation`] that the store applies as a single
//! compare-and-swap keyed on the expected status (and claimant).

use crate::access::{Actor, Authority};
use crate::error::{QueueError, QueueResult};
use crate::model::{ClaimStamp, Job, JobStatus, Outcome, Resolution};
use chrono::{DateTime, Utc};
use serde_json::json;

/// A requested lifecycle move.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Grader takes a pending job.
    Claim,
    /// Administrative force-progress; counts as a claim.
    Process,
    /// Withdraw a pending job.
    Cancel,
    /// Claimant finishes a job.
    Complete {
        /// Verdict reported by the claimant.
        outcome: Outcome,
        /// Free-form reviewer comment.
        comment: Option<String>,
    },
}

impl Transition {
    /// Status the transition leads to.
    #[must_use]
    pub const fn target(&self) -> JobStatus {
        match self {
            Self::Claim | Self::Process => JobStatus::Processing,
            Self::Cancel => JobStatus::Cancelled,
            Self::Complete { outcome, .. } => outcome.status(),
        }
    }

    /// Short name used in logs.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Claim => "claim",
            Self::Process => "process",
            Self::Cancel => "cancel",
            Self::Complete { .. } => "complete",
        }
    }
}

/// Accepted change, expressed as a conditional write.
#[derive(Debug, Clone, PartialEq)]
pub struct Mutation {
    /// Status the row must still have for the write to apply.
    pub expected: JobStatus,
    /// Claimant the row must still have, if any.
    pub expected_claimant: Option<String>,
    /// New status.
    pub status: JobStatus,
    /// Claim stamp to write; `None` keeps the existing one.
    pub claim: Option<ClaimStamp>,
    /// Terminal stamps to write.
    pub resolution: Option<Resolution>,
}

/// Validate `transition` on `job` for `actor` holding `authority`.
///
/// # Errors
///
/// - [`QueueError::PermissionDenied`] if the actor may not request this move
/// - [`QueueError::AlreadyClaimed`] if a claim targets a processing job
/// - [`QueueError::InvalidTransition`] if the move is illegal from the current status
/// - [`QueueError::NotClaimedByActor`] if someone other than the claimant
///   completes a job that was claimed
pub fn evaluate(
    job: &Job,
    transition: &Transition,
    actor: &Actor,
    authority: Authority,
    now: DateTime<Utc>,
) -> QueueResult<Mutation> {
    let target = transition.target();
    let illegal = || QueueError::InvalidTransition {
        from: job.status,
        to: target,
    };

    match transition {
        Transition::Claim | Transition::Process => {
            if !authority.can_grade() {
                return Err(QueueError::denied(
                    "only teachers and course assistants may claim jobs",
                ));
            }
            match job.status {
                JobStatus::Pending => Ok(Mutation {
                    expected: JobStatus::Pending,
                    expected_claimant: None,
                    status: JobStatus::Processing,
                    claim: Some(ClaimStamp {
                        by: actor.id.clone(),
                        at: now,
                    }),
                    resolution: None,
                }),
                JobStatus::Processing => Err(QueueError::AlreadyClaimed),
                _ => Err(illegal()),
            }
        }
        Transition::Cancel => {
            if actor.id != job.submitter_id && authority != Authority::Teacher {
                return Err(QueueError::denied(
                    "only the submitter or a teacher may cancel a job",
                ));
            }
            if job.status != JobStatus::Pending {
                return Err(illegal());
            }
            Ok(Mutation {
                expected: JobStatus::Pending,
                expected_claimant: None,
                status: JobStatus::Cancelled,
                claim: None,
                resolution: Some(Resolution {
                    processed_by: actor.id.clone(),
                    completed_at: now,
                    result: None,
                    error_message: None,
                }),
            })
        }
        Transition::Complete { outcome, comment } => {
            let Some(claimant) = job.claimant() else {
                return Err(illegal());
            };
            if claimant != actor.id {
                return Err(QueueError::NotClaimedByActor);
            }
            if job.status != JobStatus::Processing {
                return Err(illegal());
            }
            let (result, error_message) = match outcome {
                Outcome::Approved | Outcome::Rejected => (
                    Some(json!({ "verdict": outcome, "comment": comment })),
                    None,
                ),
                Outcome::Failed => (
                    None,
                    Some(comment.clone().unwrap_or_else(|| "failed".to_string())),
                ),
            };
            Ok(Mutation {
                expected: JobStatus::Processing,
                expected_claimant: Some(actor.id.clone()),
                status: target,
                claim: None,
                resolution: Some(Resolution {
                    processed_by: actor.id.clone(),
                    completed_at: now,
                    result,
                    error_message,
                }),
            })
        }
    }
}
