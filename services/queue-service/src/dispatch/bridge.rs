//! Fire-and-forget publication with bounded exponential backoff.

use super::{JobCreated, NoopPublisher, Publisher};
use crate::config::BrokerConfig;
use crate::model::Job;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Retry schedule for a single publication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Total attempts, including the first.
    pub attempts: u32,
    /// Delay before the first retry.
    pub initial: Duration,
    /// Cap on any single delay.
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from_config(&BrokerConfig::default())
    }
}

impl BackoffPolicy {
    /// Schedule described by the broker configuration.
    #[must_use]
    pub fn from_config(config: &BrokerConfig) -> Self {
        Self {
            attempts: config.publish_attempts.max(1),
            initial: Duration::from_millis(config.publish_backoff_ms),
            max: Duration::from_millis(config.publish_max_backoff_ms),
        }
    }

    /// Delay after the given failed attempt (1-based).
    #[must_use]
    pub fn delay(&self, failed_attempt: u32) -> Duration {
        let factor = 2_u32.saturating_pow(failed_attempt.saturating_sub(1));
        self.initial.saturating_mul(factor).min(self.max)
    }
}

/// Whether events are currently reaching a broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BrokerMode {
    /// Broker reachable; code execution jobs are picked up automatically.
    Connected,
    /// Broker absent or unreachable; manual processing only.
    Degraded,
}

/// Announces stored jobs to the broker without blocking the caller.
#[derive(Clone)]
pub struct DispatchBridge {
    publisher: Arc<dyn Publisher>,
    backoff: BackoffPolicy,
}

impl std::fmt::Debug for DispatchBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchBridge")
            .field("backoff", &self.backoff)
            .field("connected", &self.publisher.is_connected())
            .finish()
    }
}

impl DispatchBridge {
    /// Bridge publishing through `publisher`.
    #[must_use]
    pub fn new(publisher: Arc<dyn Publisher>, backoff: BackoffPolicy) -> Self {
        Self { publisher, backoff }
    }

    /// Bridge for degraded mode: every announcement is dropped.
    #[must_use]
    pub fn disabled() -> Self {
        Self::new(
            Arc::new(NoopPublisher),
            BackoffPolicy {
                attempts: 1,
                initial: Duration::ZERO,
                max: Duration::ZERO,
            },
        )
    }

    /// Current broker mode.
    #[must_use]
    pub fn mode(&self) -> BrokerMode {
        if self.publisher.is_connected() {
            BrokerMode::Connected
        } else {
            BrokerMode::Degraded
        }
    }

    /// Publish a job-created event in the background.
    ///
    /// The handle resolves to whether the event was delivered; callers on the
    /// request path drop it.
    pub fn announce(&self, job: &Job) -> JoinHandle<bool> {
        let event = JobCreated::for_job(job);
        let publisher = Arc::clone(&self.publisher);
        let backoff = self.backoff;
        tokio::spawn(async move { publish_with_backoff(publisher.as_ref(), &event, backoff).await })
    }
}

/// Try to publish `event` up to `backoff.attempts` times.
///
/// Returns whether publication succeeded. Failures are logged and swallowed.
pub async fn publish_with_backoff(
    publisher: &dyn Publisher,
    event: &JobCreated,
    backoff: BackoffPolicy,
) -> bool {
    for attempt in 1..=backoff.attempts {
        match publisher.publish(event).await {
            Ok(()) => {
                debug!(job_id = %event.job_id, attempt, "Job event published");
                return true;
            }
            Err(e) if attempt < backoff.attempts => {
                let delay = backoff.delay(attempt);
                debug!(
                    job_id = %event.job_id,
                    attempt,
                    error = %e,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "Job event publish failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                warn!(
                    job_id = %event.job_id,
                    attempts = backoff.attempts,
                    error = %e,
                    "Broker unavailable, job left for manual processing"
                );
            }
        }
    }
    false
}
