//! Asynchronous dispatch of job-created events.
//!
//! The broker is an accelerator, never a dependency: publication happens off
//! the request path, failures are logged and swallowed, and with no broker
//! configured the service runs on a [`NoopPublisher`] and code execution jobs
//! simply wait for manual processing.

mod bridge;
mod consumer;
mod memory;
mod redis_broker;

pub use bridge::{publish_with_backoff, BackoffPolicy, BrokerMode, DispatchBridge};
pub use consumer::{Disposition, JobConsumer};
pub use memory::MemoryBroker;
pub use redis_broker::RedisBroker;

use crate::model::{Job, JobId, JobType, Scope};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Event announced after a job is stored.
///
/// Consumers re-read the job from the store; the event only says where to look.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCreated {
    /// Stored job.
    pub job_id: JobId,
    /// Its type, so consumers can ignore what they do not handle.
    #[serde(rename = "type")]
    pub job_type: JobType,
    /// Its scope, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<Scope>,
}

impl JobCreated {
    /// Event describing `job`.
    #[must_use]
    pub fn for_job(job: &Job) -> Self {
        Self {
            job_id: job.id.clone(),
            job_type: job.job_type(),
            scope: job.scope.clone(),
        }
    }
}

/// Broker failures. Never surfaced to callers of job creation.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// Broker cannot be reached.
    #[error("broker unavailable: {0}")]
    BrokerUnavailable(String),

    /// Redis command failed.
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Event could not be encoded or decoded.
    #[error("event encoding error: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Outbound side of the broker.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publish one event.
    async fn publish(&self, event: &JobCreated) -> Result<(), DispatchError>;

    /// Whether the last interaction with the broker succeeded.
    fn is_connected(&self) -> bool;
}

/// Raw message taken from the broker, kept verbatim for acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Message body as received.
    pub body: String,
}

impl Delivery {
    /// Encode an event as a delivery body.
    ///
    /// # Errors
    ///
    /// Returns error if the event cannot be serialized.
    pub fn encode(event: &JobCreated) -> Result<Self, DispatchError> {
        Ok(Self {
            body: serde_json::to_string(event)?,
        })
    }

    /// Decode the event carried by this delivery.
    ///
    /// # Errors
    ///
    /// Returns error if the body is not a valid event.
    pub fn event(&self) -> Result<JobCreated, DispatchError> {
        Ok(serde_json::from_str(&self.body)?)
    }
}

/// Inbound side of the broker.
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Take the next delivery, or `None` if nothing arrived within the poll
    /// interval. Taken deliveries stay in flight until acknowledged.
    async fn next_delivery(&self) -> Result<Option<Delivery>, DispatchError>;

    /// Drop a handled delivery from the in-flight set.
    async fn acknowledge(&self, delivery: &Delivery) -> Result<(), DispatchError>;

    /// Return deliveries left in flight by a previous run to the queue.
    async fn recover(&self) -> Result<u64, DispatchError>;
}

/// Publisher used when no broker is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopPublisher;

#[async_trait]
impl Publisher for NoopPublisher {
    async fn publish(&self, _event: &JobCreated) -> Result<(), DispatchError> {
        Err(DispatchError::BrokerUnavailable(
            "no broker configured".to_string(),
        ))
    }

    fn is_connected(&self) -> bool {
        false
    }
}
