//! Claim coordination and the rest of the job lifecycle.

use crate::access::{self, Actor, Enrollments, Role};
use crate::clock::Clock;
use crate::collaborators::{GradingSink, TracingGradingSink};
use crate::config::RetryConfig;
use crate::dispatch::DispatchBridge;
use crate::error::{QueueError, QueueResult};
use crate::model::{Job, JobId, JobType, Outcome};
use crate::state_machine::{self, Transition};
use crate::store::{JobFilter, JobPage, JobStore, QueueStats, Visibility};
use std::sync::Arc;
use tracing::{debug, info};

/// Entry point for every operation on existing jobs.
///
/// Cheap to clone; clones share the store and collaborators.
#[derive(Clone)]
pub struct QueueService {
    pub(super) store: Arc<dyn JobStore>,
    pub(super) enrollments: Arc<dyn Enrollments>,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) dispatch: DispatchBridge,
    pub(super) grading: Arc<dyn GradingSink>,
    pub(super) retry_min_age: chrono::Duration,
}

impl QueueService {
    /// Create a service with dispatch disabled and verdicts logged.
    #[must_use]
    pub fn new(
        store: Arc<dyn JobStore>,
        enrollments: Arc<dyn Enrollments>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            enrollments,
            clock,
            dispatch: DispatchBridge::disabled(),
            grading: Arc::new(TracingGradingSink),
            retry_min_age: RetryConfig::default().min_age(),
        }
    }

    /// Announce retried jobs through `dispatch`.
    #[must_use]
    pub fn with_dispatch(mut self, dispatch: DispatchBridge) -> Self {
        self.dispatch = dispatch;
        self
    }

    /// Deliver review verdicts to `grading`.
    #[must_use]
    pub fn with_grading(mut self, grading: Arc<dyn GradingSink>) -> Self {
        self.grading = grading;
        self
    }

    /// Minimum job age before a retry is accepted.
    #[must_use]
    pub fn with_retry_min_age(mut self, min_age: chrono::Duration) -> Self {
        self.retry_min_age = min_age;
        self
    }

    /// Dispatch bridge in use.
    #[must_use]
    pub const fn dispatch(&self) -> &DispatchBridge {
        &self.dispatch
    }

    /// Job store in use.
    #[must_use]
    pub fn store(&self) -> &dyn JobStore {
        self.store.as_ref()
    }

    /// Take exclusive responsibility for a pending job.
    ///
    /// Exactly one of any number of concurrent callers succeeds; the others
    /// get [`QueueError::AlreadyClaimed`].
    ///
    /// # Errors
    ///
    /// - [`QueueError::NotFound`] if the job does not exist
    /// - [`QueueError::PermissionDenied`] unless the actor is a teacher, a TA
    ///   of the job's course, or the system
    /// - [`QueueError::AlreadyClaimed`] if someone else holds the job
    /// - [`QueueError::InvalidTransition`] if the job is already terminal
    pub async fn claim(&self, id: &JobId, actor: &Actor) -> QueueResult<Job> {
        self.transition(id, actor, Transition::Claim).await
    }

    /// Force a pending job into processing. The caller becomes its claimant.
    ///
    /// # Errors
    ///
    /// Same as [`QueueService::claim`].
    pub async fn process(&self, id: &JobId, actor: &Actor) -> QueueResult<Job> {
        self.transition(id, actor, Transition::Process).await
    }

    /// Finish a job the actor holds.
    ///
    /// # Errors
    ///
    /// - [`QueueError::NotFound`] if the job does not exist
    /// - [`QueueError::NotClaimedByActor`] if someone else holds the claim
    /// - [`QueueError::InvalidTransition`] if nobody holds a claim or the job
    ///   already finished
    pub async fn complete(
        &self,
        id: &JobId,
        actor: &Actor,
        outcome: Outcome,
        comment: Option<String>,
    ) -> QueueResult<Job> {
        let job = self
            .transition(
                id,
                actor,
                Transition::Complete {
                    outcome,
                    comment: comment.clone(),
                },
            )
            .await?;

        if job.job_type() == JobType::Review {
            if let Some(submission) = &job.submission {
                self.grading
                    .review_completed(&submission.id, outcome, comment.as_deref())
                    .await;
            }
        }
        Ok(job)
    }

    /// Withdraw a pending job.
    ///
    /// # Errors
    ///
    /// - [`QueueError::NotFound`] if the job does not exist
    /// - [`QueueError::PermissionDenied`] unless the actor is the submitter or a teacher
    /// - [`QueueError::InvalidTransition`] unless the job is pending
    pub async fn cancel(&self, id: &JobId, actor: &Actor) -> QueueResult<Job> {
        self.transition(id, actor, Transition::Cancel).await
    }

    /// Fetch one job the actor may see.
    ///
    /// # Errors
    ///
    /// - [`QueueError::NotFound`] if the job does not exist
    /// - [`QueueError::PermissionDenied`] unless the actor is a teacher, the
    ///   system, the submitter, or a TA of the job's course
    pub async fn get(&self, id: &JobId, actor: &Actor) -> QueueResult<Job> {
        let job = self.load(id).await?;
        if actor.role != Role::Student || job.submitter_id == actor.id {
            return Ok(job);
        }
        match access::authority(self.enrollments.as_ref(), actor, &job).await? {
            access::Authority::Assistant => Ok(job),
            _ => Err(QueueError::denied("job belongs to another student")),
        }
    }

    /// List jobs visible to the actor.
    ///
    /// Teachers and the system see everything; everyone else sees their own
    /// jobs plus jobs in courses they assist.
    ///
    /// # Errors
    ///
    /// Returns error if the store or enrollment lookup fails.
    pub async fn list(&self, actor: &Actor, mut filter: JobFilter) -> QueueResult<JobPage> {
        filter.visibility = match actor.role {
            Role::Teacher | Role::System => Visibility::All,
            Role::Student => {
                let courses = self.enrollments.assisted_courses(&actor.id).await?;
                if courses.is_empty() {
                    Visibility::Own(actor.id.clone())
                } else {
                    Visibility::OwnOrCourses {
                        user_id: actor.id.clone(),
                        courses,
                    }
                }
            }
        };
        self.store.list(&filter).await
    }

    /// Aggregate counts. Teachers only.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::PermissionDenied`] for other actors, or a store error.
    pub async fn stats(&self, actor: &Actor) -> QueueResult<QueueStats> {
        if !actor.is_teacher() {
            return Err(QueueError::denied("queue statistics are teacher-only"));
        }
        self.store.stats().await
    }

    pub(super) async fn load(&self, id: &JobId) -> QueueResult<Job> {
        self.store
            .fetch(id)
            .await?
            .ok_or_else(|| QueueError::NotFound(id.to_string()))
    }

    /// Validate and apply one transition as a conditional write.
    ///
    /// When the write matches no row the job changed underneath us, so it is
    /// re-read and re-evaluated to report what actually happened.
    async fn transition(
        &self,
        id: &JobId,
        actor: &Actor,
        transition: Transition,
    ) -> QueueResult<Job> {
        let job = self.load(id).await?;
        let authority = access::authority(self.enrollments.as_ref(), actor, &job).await?;
        let now = self.clock.now();
        let mutation = state_machine::evaluate(&job, &transition, actor, authority, now)?;

        if let Some(updated) = self.store.apply(id, &mutation, now).await? {
            info!(
                job_id = %id,
                actor = %actor.id,
                transition = transition.name(),
                status = %updated.status,
                "Job transitioned"
            );
            return Ok(updated);
        }

        let current = self.load(id).await?;
        debug!(
            job_id = %id,
            actor = %actor.id,
            transition = transition.name(),
            status = %current.status,
            "Conditional write lost"
        );
        match state_machine::evaluate(&current, &transition, actor, authority, now) {
            Err(e) => Err(e),
            Ok(_) => Err(QueueError::InvalidTransition {
                from: current.status,
                to: transition.target(),
            }),
        }
    }
}
