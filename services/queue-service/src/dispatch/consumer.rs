//! Background worker that runs code execution jobs announced on the broker.

use super::{Delivery, EventSource};
use crate::access::Actor;
use crate::collaborators::CodeRunner;
use crate::error::{QueueError, QueueResult};
use crate::model::{JobStatus, JobType, Outcome};
use crate::services::QueueService;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What the consumer did with one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// The job ran and reached this status.
    Executed(JobStatus),
    /// The delivery needed no work.
    Skipped(&'static str),
}

/// Consumes job-created events and drives code execution jobs through the
/// queue as the system actor.
///
/// Messages are hints: the job is always re-read and must still be pending,
/// so duplicates and stale deliveries are harmless.
pub struct JobConsumer {
    source: Arc<dyn EventSource>,
    queue: QueueService,
    runner: Option<Arc<dyn CodeRunner>>,
    error_backoff: Duration,
}

impl JobConsumer {
    /// Create a consumer. Without a runner every delivery is skipped and
    /// jobs wait for manual processing.
    #[must_use]
    pub fn new(
        source: Arc<dyn EventSource>,
        queue: QueueService,
        runner: Option<Arc<dyn CodeRunner>>,
    ) -> Self {
        Self {
            source,
            queue,
            runner,
            error_backoff: Duration::from_secs(1),
        }
    }

    /// Pause after a broker error before polling again.
    #[must_use]
    pub fn with_error_backoff(mut self, backoff: Duration) -> Self {
        self.error_backoff = backoff;
        self
    }

    /// Poll until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) {
        match self.source.recover().await {
            Ok(0) => {}
            Ok(requeued) => info!(requeued, "Re-queued in-flight deliveries"),
            Err(e) => warn!(error = %e, "Could not recover in-flight deliveries"),
        }
        info!(automated = self.runner.is_some(), "Job consumer started");

        loop {
            let next = tokio::select! {
                () = shutdown.cancelled() => break,
                next = self.source.next_delivery() => next,
            };

            match next {
                Ok(Some(delivery)) => self.settle(&delivery).await,
                Ok(None) => {}
                Err(e) => {
                    warn!(error = %e, "Broker poll failed");
                    tokio::select! {
                        () = shutdown.cancelled() => break,
                        () = tokio::time::sleep(self.error_backoff) => {}
                    }
                }
            }
        }

        info!("Job consumer stopped");
    }

    /// Handle a delivery and acknowledge it unless handling hit a storage error.
    async fn settle(&self, delivery: &Delivery) {
        match self.handle(delivery).await {
            Ok(disposition) => {
                debug!(?disposition, "Delivery handled");
                if let Err(e) = self.source.acknowledge(delivery).await {
                    warn!(error = %e, "Acknowledge failed; delivery may repeat");
                }
            }
            Err(e) => {
                warn!(error = %e, "Delivery left unacknowledged");
            }
        }
    }

    /// Process one delivery.
    ///
    /// # Errors
    ///
    /// Returns storage failures; every other condition is a [`Disposition`].
    pub async fn handle(&self, delivery: &Delivery) -> QueueResult<Disposition> {
        let event = match delivery.event() {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "Dropping malformed delivery");
                return Ok(Disposition::Skipped("malformed"));
            }
        };

        let system = Actor::system();
        let job = match self.queue.get(&event.job_id, &system).await {
            Ok(job) => job,
            Err(QueueError::NotFound(_)) => return Ok(Disposition::Skipped("missing")),
            Err(e) => return Err(e),
        };
        if job.status != JobStatus::Pending {
            return Ok(Disposition::Skipped("not pending"));
        }
        if job.job_type() != JobType::CodeExecution {
            return Ok(Disposition::Skipped("manual review"));
        }
        let Some(runner) = &self.runner else {
            return Ok(Disposition::Skipped("no runner"));
        };

        match self.queue.process(&job.id, &system).await {
            Ok(_) => {}
            Err(QueueError::AlreadyClaimed | QueueError::InvalidTransition { .. }) => {
                return Ok(Disposition::Skipped("claimed elsewhere"));
            }
            Err(e) => return Err(e),
        }

        let (outcome, comment) = match runner.run(&job).await {
            Ok(report) if report.success => (Outcome::Approved, report.output),
            Ok(report) => (Outcome::Rejected, report.output),
            Err(reason) => {
                warn!(job_id = %job.id, error = %reason, "Execution failed");
                (Outcome::Failed, reason)
            }
        };

        let done = self
            .queue
            .complete(&job.id, &system, outcome, Some(comment))
            .await?;
        info!(job_id = %done.id, status = %done.status, "Code execution job finished");
        Ok(Disposition::Executed(done.status))
    }
}
