//! Intake of new jobs from the submission pipeline.

use crate::access::{Actor, Role};
use crate::clock::Clock;
use crate::dispatch::DispatchBridge;
use crate::error::{QueueError, QueueResult};
use crate::model::{Job, JobType, NewJob};
use crate::store::JobStore;
use std::sync::Arc;
use tracing::info;

/// The only writer of brand-new jobs.
#[derive(Clone)]
pub struct JobProducer {
    store: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
    dispatch: DispatchBridge,
}

impl JobProducer {
    /// Create a producer announcing through `dispatch`.
    #[must_use]
    pub fn new(store: Arc<dyn JobStore>, clock: Arc<dyn Clock>, dispatch: DispatchBridge) -> Self {
        Self {
            store,
            clock,
            dispatch,
        }
    }

    /// Store a new pending job and announce it.
    ///
    /// The announcement runs in the background; a missing broker never fails
    /// the enqueue.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Validation`] for incomplete input, including a
    /// review job without a course scope, or a store error.
    pub async fn enqueue(&self, new: NewJob) -> QueueResult<Job> {
        if new.submitter_id.trim().is_empty() {
            return Err(QueueError::Validation("submitter_id is required".to_string()));
        }
        match &new.scope {
            Some(scope) if scope.course_id.trim().is_empty() => {
                return Err(QueueError::Validation("scope.course_id is required".to_string()));
            }
            None if new.payload.job_type() == JobType::Review => {
                return Err(QueueError::Validation(
                    "review jobs need a course scope".to_string(),
                ));
            }
            _ => {}
        }

        let job = Job::pending(new, self.clock.now());
        self.store.insert(&job).await?;
        info!(
            job_id = %job.id,
            job_type = %job.job_type(),
            submitter = %job.submitter_id,
            "Job enqueued"
        );
        drop(self.dispatch.announce(&job));

        self.store
            .fetch(&job.id)
            .await?
            .ok_or_else(|| QueueError::NotFound(job.id.to_string()))
    }

    /// [`JobProducer::enqueue`] on behalf of an authenticated caller.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::PermissionDenied`] unless the caller is the system.
    pub async fn submit(&self, actor: &Actor, new: NewJob) -> QueueResult<Job> {
        if actor.role != Role::System {
            return Err(QueueError::denied(
                "jobs are created by the submission pipeline",
            ));
        }
        self.enqueue(new).await
    }
}
