//! Redis list broker.
//!
//! Producers `LPUSH` onto the queue list. The consumer moves each message
//! into a per-queue in-flight list with `LMOVE` and removes it from there
//! once handled, so a crash between the two leaves the message recoverable.

use super::{Delivery, DispatchError, EventSource, JobCreated, Publisher};
use crate::config::BrokerConfig;
use async_trait::async_trait;
use parking_lot::RwLock;
use redis::aio::ConnectionManager;
use redis::Client;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Broker backed by Redis lists.
pub struct RedisBroker {
    client: Client,
    conn: RwLock<Option<ConnectionManager>>,
    queue: String,
    inflight: String,
    poll: Duration,
    connected: AtomicBool,
}

impl RedisBroker {
    /// Connect to `url`, retrying as configured.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::BrokerUnavailable`] if every attempt fails,
    /// or a Redis error if the URL is invalid.
    pub async fn connect(url: &str, config: &BrokerConfig) -> Result<Self, DispatchError> {
        let client = Client::open(url)?;
        let broker = Self {
            client,
            conn: RwLock::new(None),
            queue: config.queue.clone(),
            inflight: format!("{}:inflight", config.queue),
            poll: config.poll_interval(),
            connected: AtomicBool::new(false),
        };

        let attempts = config.connect_attempts.max(1);
        let delay = Duration::from_millis(config.connect_retry_delay_ms);
        for attempt in 1..=attempts {
            match broker.connection().await {
                Ok(_) => {
                    info!(queue = %broker.queue, attempt, "Connected to Redis broker");
                    return Ok(broker);
                }
                Err(e) if attempt < attempts => {
                    warn!(attempt, attempts, error = %e, "Redis broker not reachable, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
        Err(DispatchError::BrokerUnavailable(
            "no connection attempts made".to_string(),
        ))
    }

    /// Shared connection, opened on first use and after a failed open.
    async fn connection(&self) -> Result<ConnectionManager, DispatchError> {
        let cached = self.conn.read().clone();
        if let Some(conn) = cached {
            return Ok(conn);
        }

        match self.client.get_connection_manager().await {
            Ok(conn) => {
                *self.conn.write() = Some(conn.clone());
                self.connected.store(true, Ordering::SeqCst);
                Ok(conn)
            }
            Err(e) => {
                self.connected.store(false, Ordering::SeqCst);
                Err(DispatchError::BrokerUnavailable(e.to_string()))
            }
        }
    }

    /// Record the outcome of a command for [`Publisher::is_connected`].
    fn observe<T>(&self, result: redis::RedisResult<T>) -> Result<T, DispatchError> {
        match result {
            Ok(value) => {
                self.connected.store(true, Ordering::SeqCst);
                Ok(value)
            }
            Err(e) => {
                if e.is_io_error() || e.is_connection_dropped() || e.is_timeout() {
                    self.connected.store(false, Ordering::SeqCst);
                }
                Err(e.into())
            }
        }
    }
}

#[async_trait]
impl Publisher for RedisBroker {
    async fn publish(&self, event: &JobCreated) -> Result<(), DispatchError> {
        let delivery = Delivery::encode(event)?;
        let mut conn = self.connection().await?;
        let result: redis::RedisResult<i64> = redis::cmd("LPUSH")
            .arg(&self.queue)
            .arg(&delivery.body)
            .query_async(&mut conn)
            .await;
        let depth = self.observe(result)?;
        debug!(job_id = %event.job_id, depth, "LPUSH");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EventSource for RedisBroker {
    async fn next_delivery(&self) -> Result<Option<Delivery>, DispatchError> {
        let mut conn = self.connection().await?;
        let result: redis::RedisResult<Option<String>> = redis::cmd("LMOVE")
            .arg(&self.queue)
            .arg(&self.inflight)
            .arg("RIGHT")
            .arg("LEFT")
            .query_async(&mut conn)
            .await;

        match self.observe(result)? {
            Some(body) => Ok(Some(Delivery { body })),
            None => {
                tokio::time::sleep(self.poll).await;
                Ok(None)
            }
        }
    }

    async fn acknowledge(&self, delivery: &Delivery) -> Result<(), DispatchError> {
        let mut conn = self.connection().await?;
        let result: redis::RedisResult<i64> = redis::cmd("LREM")
            .arg(&self.inflight)
            .arg(1)
            .arg(&delivery.body)
            .query_async(&mut conn)
            .await;
        self.observe(result)?;
        Ok(())
    }

    async fn recover(&self) -> Result<u64, DispatchError> {
        let mut conn = self.connection().await?;
        let mut moved = 0_u64;
        loop {
            let result: redis::RedisResult<Option<String>> = redis::cmd("LMOVE")
                .arg(&self.inflight)
                .arg(&self.queue)
                .arg("RIGHT")
                .arg("RIGHT")
                .query_async(&mut conn)
                .await;
            if self.observe(result)?.is_none() {
                break;
            }
            moved += 1;
        }
        Ok(moved)
    }
}
