//! Integration tests for the broker bridge and the background consumer.

mod common;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{review, scope_42, Harness};
use queue_service::collaborators::{CodeRunner, RunReport};
use queue_service::dispatch::{
    publish_with_backoff, BackoffPolicy, BrokerMode, Delivery, DispatchBridge, DispatchError,
    Disposition, EventSource, JobConsumer, JobCreated, Publisher,
};
use queue_service::model::{JobId, RankingKey};
use queue_service::state_machine::Mutation;
use queue_service::store::{JobPage, QueueStats};
use queue_service::{
    Actor, Job, JobFilter, JobProducer, JobStatus, JobStore, Outcome, QueueError, QueueResult,
    QueueService, SqliteEnrollments, SqliteJobStore,
};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Publisher that fails a fixed number of times before succeeding.
struct FlakyPublisher {
    failures: u32,
    calls: AtomicU32,
}

impl FlakyPublisher {
    fn new(failures: u32) -> Self {
        Self {
            failures,
            calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl Publisher for FlakyPublisher {
    async fn publish(&self, _event: &JobCreated) -> Result<(), DispatchError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.failures {
            Err(DispatchError::BrokerUnavailable("connection refused".to_string()))
        } else {
            Ok(())
        }
    }

    fn is_connected(&self) -> bool {
        false
    }
}

/// Runner returning a canned answer.
struct StubRunner {
    answer: Result<RunReport, String>,
    runs: AtomicU32,
}

impl StubRunner {
    fn new(answer: Result<RunReport, String>) -> Arc<Self> {
        Arc::new(Self {
            answer,
            runs: AtomicU32::new(0),
        })
    }
}

#[async_trait]
impl CodeRunner for StubRunner {
    async fn run(&self, _job: &Job) -> Result<RunReport, String> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        self.answer.clone()
    }
}

/// Store that reports an outage while `down` is set.
struct OutageStore {
    inner: Arc<SqliteJobStore>,
    down: AtomicBool,
}

impl OutageStore {
    fn check(&self) -> QueueResult<()> {
        if self.down.load(Ordering::SeqCst) {
            Err(QueueError::Storage(sqlx::Error::PoolTimedOut))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl JobStore for OutageStore {
    async fn insert(&self, job: &Job) -> QueueResult<()> {
        self.check()?;
        self.inner.insert(job).await
    }

    async fn insert_successor(&self, job: &Job) -> QueueResult<bool> {
        self.check()?;
        self.inner.insert_successor(job).await
    }

    async fn fetch(&self, id: &JobId) -> QueueResult<Option<Job>> {
        self.check()?;
        self.inner.fetch(id).await
    }

    async fn successor_of(&self, id: &JobId) -> QueueResult<Option<JobId>> {
        self.check()?;
        self.inner.successor_of(id).await
    }

    async fn list(&self, filter: &JobFilter) -> QueueResult<JobPage> {
        self.check()?;
        self.inner.list(filter).await
    }

    async fn apply(
        &self,
        id: &JobId,
        mutation: &Mutation,
        now: DateTime<Utc>,
    ) -> QueueResult<Option<Job>> {
        self.check()?;
        self.inner.apply(id, mutation, now).await
    }

    async fn pending_ahead(&self, id: &JobId, key: &RankingKey) -> QueueResult<u64> {
        self.check()?;
        self.inner.pending_ahead(id, key).await
    }

    async fn stats(&self) -> QueueResult<QueueStats> {
        self.check()?;
        self.inner.stats().await
    }

    async fn ping(&self) -> QueueResult<()> {
        self.check()?;
        self.inner.ping().await
    }
}

async fn wait_until(mut done: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if done() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    done()
}

fn fast_backoff(attempts: u32) -> BackoffPolicy {
    BackoffPolicy {
        attempts,
        initial: Duration::from_millis(1),
        max: Duration::from_millis(4),
    }
}

fn passing() -> Result<RunReport, String> {
    Ok(RunReport {
        success: true,
        output: "all tests passed".to_string(),
    })
}

/// Test that job creation succeeds while the broker is down
#[tokio::test(flavor = "multi_thread")]
async fn test_enqueue_succeeds_without_broker() {
    let harness = Harness::new().await;
    harness.broker.set_online(false);

    let job = harness.submit_review("student-1", scope_42()).await;
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(harness.dispatch.mode(), BrokerMode::Degraded);

    // Manual flow still works in degraded mode
    let teacher = Actor::teacher("t1");
    harness.queue.claim(&job.id, &teacher).await.expect("Should claim");
    harness
        .queue
        .complete(&job.id, &teacher, Outcome::Approved, None)
        .await
        .expect("Should complete");
}

/// Test that a disabled bridge never blocks enqueueing
#[tokio::test(flavor = "multi_thread")]
async fn test_disabled_bridge_enqueue() {
    let harness = Harness::new().await;
    let producer = JobProducer::new(
        harness.store.clone(),
        harness.clock.clone(),
        DispatchBridge::disabled(),
    );

    let job = producer
        .enqueue(review("student-1", Some(scope_42())))
        .await
        .expect("Should enqueue");
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(harness.broker.published(), 0);
}

/// Test that publication stops after the configured attempts
#[tokio::test(flavor = "multi_thread")]
async fn test_publish_retries_are_bounded() {
    let harness = Harness::new().await;
    let job = harness.submit_review("student-1", scope_42()).await;
    let publisher = Arc::new(FlakyPublisher::new(u32::MAX));

    let bridge = DispatchBridge::new(publisher.clone(), fast_backoff(3));
    let delivered = bridge.announce(&job).await.expect("Should join");

    assert!(!delivered);
    assert_eq!(publisher.calls.load(Ordering::SeqCst), 3);
}

/// Test that transient failures are retried until success
#[tokio::test(flavor = "multi_thread")]
async fn test_publish_recovers_after_transient_failures() {
    let harness = Harness::new().await;
    let job = harness.submit_review("student-1", scope_42()).await;
    let publisher = FlakyPublisher::new(2);

    let delivered =
        publish_with_backoff(&publisher, &JobCreated::for_job(&job), fast_backoff(5)).await;

    assert!(delivered);
    assert_eq!(publisher.calls.load(Ordering::SeqCst), 3);
}

/// Test that the consumer runs code jobs as the system actor
#[tokio::test(flavor = "multi_thread")]
async fn test_consumer_executes_code_job() {
    let harness = Harness::new().await;
    let runner = StubRunner::new(passing());
    let consumer = JobConsumer::new(
        Arc::new(harness.broker.clone()),
        harness.queue.clone(),
        Some(runner.clone()),
    );

    let job = harness.submit_code("student-1", scope_42()).await;
    let delivery = Delivery::encode(&JobCreated::for_job(&job)).expect("Should encode");

    let disposition = consumer.handle(&delivery).await.expect("Should handle");
    assert_eq!(disposition, Disposition::Executed(JobStatus::Completed));

    let stored = harness
        .queue
        .get(&job.id, &Actor::system())
        .await
        .expect("Should get");
    assert_eq!(stored.claimant(), Some("system"));
    let resolution = stored.resolution.expect("Should be resolved");
    assert_eq!(resolution.processed_by, "system");
    assert_eq!(
        resolution.result.expect("Should have result")["comment"],
        "all tests passed"
    );

    // Duplicate delivery is harmless
    let again = consumer.handle(&delivery).await.expect("Should handle");
    assert_eq!(again, Disposition::Skipped("not pending"));
    assert_eq!(runner.runs.load(Ordering::SeqCst), 1);
}

/// Test outcome mapping for failing and broken runs
#[tokio::test(flavor = "multi_thread")]
async fn test_consumer_maps_run_outcomes() {
    let harness = Harness::new().await;

    let failing = JobConsumer::new(
        Arc::new(harness.broker.clone()),
        harness.queue.clone(),
        Some(StubRunner::new(Ok(RunReport {
            success: false,
            output: "2 of 5 tests failed".to_string(),
        }))),
    );
    let job = harness.submit_code("student-1", scope_42()).await;
    let delivery = Delivery::encode(&JobCreated::for_job(&job)).expect("Should encode");
    assert_eq!(
        failing.handle(&delivery).await.expect("Should handle"),
        Disposition::Executed(JobStatus::Completed)
    );
    let stored = harness.queue.get(&job.id, &Actor::system()).await.expect("Should get");
    assert_eq!(
        stored.resolution.and_then(|r| r.result).expect("Should have result")["verdict"],
        "rejected"
    );

    let broken = JobConsumer::new(
        Arc::new(harness.broker.clone()),
        harness.queue.clone(),
        Some(StubRunner::new(Err("sandbox timeout".to_string()))),
    );
    let job = harness.submit_code("student-2", scope_42()).await;
    let delivery = Delivery::encode(&JobCreated::for_job(&job)).expect("Should encode");
    assert_eq!(
        broken.handle(&delivery).await.expect("Should handle"),
        Disposition::Executed(JobStatus::Failed)
    );
    let stored = harness.queue.get(&job.id, &Actor::system()).await.expect("Should get");
    assert_eq!(
        stored.resolution.and_then(|r| r.error_message).as_deref(),
        Some("sandbox timeout")
    );
}

/// Test the deliveries the consumer leaves alone
#[tokio::test(flavor = "multi_thread")]
async fn test_consumer_skips_what_it_should_not_run() {
    let harness = Harness::new().await;
    let runner = StubRunner::new(passing());
    let consumer = JobConsumer::new(
        Arc::new(harness.broker.clone()),
        harness.queue.clone(),
        Some(runner.clone()),
    );

    let review_job = harness.submit_review("student-1", scope_42()).await;
    let delivery = Delivery::encode(&JobCreated::for_job(&review_job)).expect("Should encode");
    assert_eq!(
        consumer.handle(&delivery).await.expect("Should handle"),
        Disposition::Skipped("manual review")
    );

    let malformed = Delivery {
        body: "not json".to_string(),
    };
    assert_eq!(
        consumer.handle(&malformed).await.expect("Should handle"),
        Disposition::Skipped("malformed")
    );

    let stale = harness.submit_code("student-1", scope_42()).await;
    harness
        .queue
        .cancel(&stale.id, &Actor::student("student-1"))
        .await
        .expect("Should cancel");
    let delivery = Delivery::encode(&JobCreated::for_job(&stale)).expect("Should encode");
    assert_eq!(
        consumer.handle(&delivery).await.expect("Should handle"),
        Disposition::Skipped("not pending")
    );

    assert_eq!(runner.runs.load(Ordering::SeqCst), 0);
}

/// Test that without a runner code jobs wait for manual processing
#[tokio::test(flavor = "multi_thread")]
async fn test_consumer_without_runner_leaves_job_pending() {
    let harness = Harness::new().await;
    let consumer = JobConsumer::new(Arc::new(harness.broker.clone()), harness.queue.clone(), None);

    let job = harness.submit_code("student-1", scope_42()).await;
    let delivery = Delivery::encode(&JobCreated::for_job(&job)).expect("Should encode");
    assert_eq!(
        consumer.handle(&delivery).await.expect("Should handle"),
        Disposition::Skipped("no runner")
    );

    let stored = harness.queue.get(&job.id, &Actor::system()).await.expect("Should get");
    assert_eq!(stored.status, JobStatus::Pending);
}

/// Test the full loop: publish on enqueue, consume, stop on shutdown
#[tokio::test(flavor = "multi_thread")]
async fn test_consumer_loop_processes_published_jobs() {
    let harness = Harness::new().await;
    let source: Arc<dyn EventSource> = Arc::new(harness.broker.clone());
    let consumer = JobConsumer::new(source, harness.queue.clone(), Some(StubRunner::new(passing())));

    let shutdown = CancellationToken::new();
    let worker = tokio::spawn(consumer.run(shutdown.clone()));

    let job = harness.submit_code("student-1", scope_42()).await;

    let mut status = JobStatus::Pending;
    for _ in 0..100 {
        status = harness
            .queue
            .get(&job.id, &Actor::system())
            .await
            .expect("Should get")
            .status;
        if status == JobStatus::Completed {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(status, JobStatus::Completed);
    assert_eq!(harness.broker.published(), 1);

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(5), worker)
        .await
        .expect("Consumer should stop")
        .expect("Consumer should not panic");
}

/// Test that a delivery hit by a storage error is redelivered after recovery
/// while handled deliveries are not
#[tokio::test(flavor = "multi_thread")]
async fn test_unacknowledged_delivery_is_recovered() {
    let harness = Harness::new().await;
    let store = Arc::new(OutageStore {
        inner: harness.store.clone(),
        down: AtomicBool::new(true),
    });
    let queue = QueueService::new(
        store.clone(),
        Arc::new(SqliteEnrollments::new(harness.store.pool().clone())),
        harness.clock.clone(),
    );

    // First run: the store is down, so the delivery stays in flight
    let shutdown = CancellationToken::new();
    let worker = tokio::spawn(
        JobConsumer::new(
            Arc::new(harness.broker.clone()),
            queue.clone(),
            Some(StubRunner::new(passing())),
        )
        .run(shutdown.clone()),
    );
    let job = harness.submit_code("student-1", scope_42()).await;
    let broker = harness.broker.clone();
    assert!(wait_until(|| broker.in_flight() == 1).await);
    shutdown.cancel();
    worker.await.expect("Consumer should not panic");

    let stored = harness.queue.get(&job.id, &Actor::system()).await.expect("Should get");
    assert_eq!(stored.status, JobStatus::Pending);

    // Second run: recovery puts it back and it is handled and acknowledged
    store.down.store(false, Ordering::SeqCst);
    let shutdown = CancellationToken::new();
    let worker = tokio::spawn(
        JobConsumer::new(
            Arc::new(harness.broker.clone()),
            queue.clone(),
            Some(StubRunner::new(passing())),
        )
        .run(shutdown.clone()),
    );

    let mut status = JobStatus::Pending;
    for _ in 0..100 {
        status = harness
            .queue
            .get(&job.id, &Actor::system())
            .await
            .expect("Should get")
            .status;
        if status == JobStatus::Completed {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(status, JobStatus::Completed);
    assert!(wait_until(|| broker.in_flight() == 0).await);
    shutdown.cancel();
    worker.await.expect("Consumer should not panic");

    // Nothing left to redeliver
    assert_eq!(harness.broker.recover().await.expect("Should recover"), 0);
}
