//! Age-gated retries that append to a job's lineage.
//!
//! A retry never touches the original record; it inserts a new pending job
//! pointing back at it. Only the latest job of a lineage can be retried.

use super::QueueService;
use crate::access::Actor;
use crate::error::{QueueError, QueueResult};
use crate::model::{Job, JobId};
use chrono::{DateTime, Utc};
use tracing::info;

impl QueueService {
    /// Create the pending successor of `id` on behalf of its submitter.
    ///
    /// # Errors
    ///
    /// - [`QueueError::NotFound`] if the job does not exist
    /// - [`QueueError::PermissionDenied`] unless the actor submitted the job
    /// - [`QueueError::Superseded`] if the job was already retried
    /// - [`QueueError::RetryTooSoon`] if the job is younger than the minimum age
    pub async fn retry(&self, id: &JobId, actor: &Actor) -> QueueResult<Job> {
        let job = self.load(id).await?;
        if job.submitter_id != actor.id {
            return Err(QueueError::denied("only the submitter may retry a job"));
        }
        if let Some(successor) = self.store.successor_of(id).await? {
            return Err(QueueError::Superseded { successor });
        }

        let now = self.clock.now();
        let age = now - retry_anchor(&job);
        if age < self.retry_min_age {
            return Err(QueueError::RetryTooSoon {
                remaining: self.retry_min_age - age,
            });
        }

        let successor = job.successor(now);
        if !self.store.insert_successor(&successor).await? {
            // Lost a race with a concurrent retry of the same job.
            return match self.store.successor_of(id).await? {
                Some(successor) => Err(QueueError::Superseded { successor }),
                None => Err(QueueError::Corrupt(format!(
                    "retry of {id} was rejected but no successor exists"
                ))),
            };
        }

        info!(
            job_id = %successor.id,
            retry_of = %id,
            actor = %actor.id,
            "Job retried"
        );
        drop(self.dispatch.announce(&successor));
        self.load(&successor.id).await
    }
}

/// Instant a job's age is measured from.
///
/// Terminal jobs derived from a submission age from the submission itself;
/// everything else from its own creation.
fn retry_anchor(job: &Job) -> DateTime<Utc> {
    match &job.submission {
        Some(submission) if job.status.is_terminal() => submission.submitted_at,
        _ => job.created_at,
    }
}
