//! In-process broker for single-node deployments and tests.

use super::{Delivery, DispatchError, EventSource, JobCreated, Publisher};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

/// Broker backed by an unbounded channel.
///
/// Taken deliveries sit in an in-flight list until acknowledged, and
/// [`EventSource::recover`] puts unacknowledged ones back on the channel, the
/// same contract as the Redis broker within one process. Clones share the
/// same channel.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

struct Inner {
    sender: mpsc::UnboundedSender<String>,
    receiver: Mutex<mpsc::UnboundedReceiver<String>>,
    inflight: parking_lot::Mutex<Vec<String>>,
    poll: Duration,
    online: AtomicBool,
    published: AtomicU64,
}

impl MemoryBroker {
    /// Create a broker whose consumer waits at most `poll` per delivery.
    #[must_use]
    pub fn new(poll: Duration) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                sender,
                receiver: Mutex::new(receiver),
                inflight: parking_lot::Mutex::new(Vec::new()),
                poll,
                online: AtomicBool::new(true),
                published: AtomicU64::new(0),
            }),
        }
    }

    /// Simulate the broker going away or coming back.
    pub fn set_online(&self, online: bool) {
        self.inner.online.store(online, Ordering::SeqCst);
    }

    /// Deliveries taken but not yet acknowledged.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.inner.inflight.lock().len()
    }

    /// Events accepted so far.
    #[must_use]
    pub fn published(&self) -> u64 {
        self.inner.published.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Publisher for MemoryBroker {
    async fn publish(&self, event: &JobCreated) -> Result<(), DispatchError> {
        if !self.is_connected() {
            return Err(DispatchError::BrokerUnavailable(
                "memory broker offline".to_string(),
            ));
        }
        let delivery = Delivery::encode(event)?;
        self.inner
            .sender
            .send(delivery.body)
            .map_err(|_| DispatchError::BrokerUnavailable("memory broker closed".to_string()))?;
        self.inner.published.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.inner.online.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EventSource for MemoryBroker {
    async fn next_delivery(&self) -> Result<Option<Delivery>, DispatchError> {
        let mut receiver = self.inner.receiver.lock().await;
        match tokio::time::timeout(self.inner.poll, receiver.recv()).await {
            Ok(Some(body)) => {
                self.inner.inflight.lock().push(body.clone());
                Ok(Some(Delivery { body }))
            }
            Ok(None) => Err(DispatchError::BrokerUnavailable(
                "memory broker closed".to_string(),
            )),
            Err(_) => Ok(None),
        }
    }

    async fn acknowledge(&self, delivery: &Delivery) -> Result<(), DispatchError> {
        let mut inflight = self.inner.inflight.lock();
        if let Some(at) = inflight.iter().position(|body| *body == delivery.body) {
            inflight.remove(at);
        }
        Ok(())
    }

    async fn recover(&self) -> Result<u64, DispatchError> {
        let stranded: Vec<String> = self.inner.inflight.lock().drain(..).collect();
        let mut requeued = 0_u64;
        for body in stranded {
            self.inner
                .sender
                .send(body)
                .map_err(|_| DispatchError::BrokerUnavailable("memory broker closed".to_string()))?;
            requeued += 1;
        }
        Ok(requeued)
    }
}
