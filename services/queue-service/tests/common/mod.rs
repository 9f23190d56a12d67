//! Shared fixtures for queue integration tests.

#![allow(dead_code)]

use chrono::{DateTime, TimeZone, Utc};
use queue_service::config::DatabaseConfig;
use queue_service::dispatch::{BackoffPolicy, DispatchBridge, MemoryBroker};
use queue_service::model::{JobPayload, LocationHint, SubmissionRef};
use queue_service::{
    Actor, Job, JobProducer, ManualClock, NewJob, QueueService, Scope, SqliteEnrollments,
    SqliteJobStore,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Fixed starting instant for every test clock.
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0)
        .single()
        .expect("Should build start time")
}

/// File-backed queue wired to a manual clock and an in-process broker.
pub struct Harness {
    _dir: TempDir,
    pub store: Arc<SqliteJobStore>,
    pub clock: Arc<ManualClock>,
    pub broker: MemoryBroker,
    pub dispatch: DispatchBridge,
    pub queue: QueueService,
    pub producer: JobProducer,
}

impl Harness {
    pub async fn new() -> Self {
        let dir = TempDir::new().expect("Should create temp dir");
        let config = DatabaseConfig {
            url: format!("sqlite://{}", dir.path().join("queue.db").display()),
            ..DatabaseConfig::default()
        };
        let store = Arc::new(
            SqliteJobStore::connect(&config)
                .await
                .expect("Should open job store"),
        );
        let enrollments = Arc::new(SqliteEnrollments::new(store.pool().clone()));
        let clock = Arc::new(ManualClock::new(t0()));

        let broker = MemoryBroker::new(Duration::from_millis(20));
        let dispatch = DispatchBridge::new(
            Arc::new(broker.clone()),
            BackoffPolicy {
                attempts: 3,
                initial: Duration::from_millis(1),
                max: Duration::from_millis(5),
            },
        );

        let queue = QueueService::new(store.clone(), enrollments, clock.clone())
            .with_dispatch(dispatch.clone());
        let producer = JobProducer::new(store.clone(), clock.clone(), dispatch.clone());

        Self {
            _dir: dir,
            store,
            clock,
            broker,
            dispatch,
            queue,
            producer,
        }
    }

    /// Enroll `user_id` as a TA of `course_id`.
    pub async fn grant_assistant(&self, course_id: &str, user_id: &str) {
        sqlx::query("INSERT INTO course_enrollments (course_id, user_id, role) VALUES (?, ?, 'ta')")
            .bind(course_id)
            .bind(user_id)
            .execute(self.store.pool())
            .await
            .expect("Should insert enrollment");
    }

    /// Enqueue a review job for `submitter` in `scope`.
    pub async fn submit_review(&self, submitter: &str, scope: Scope) -> Job {
        self.producer
            .enqueue(review(submitter, Some(scope)))
            .await
            .expect("Should enqueue review job")
    }

    /// Enqueue a code execution job for `submitter` in `scope`.
    pub async fn submit_code(&self, submitter: &str, scope: Scope) -> Job {
        self.producer
            .enqueue(NewJob {
                submitter_id: submitter.to_string(),
                scope: Some(scope),
                submission: Some(SubmissionRef {
                    id: format!("sub-{submitter}"),
                    submitted_at: self.clock_now(),
                }),
                payload: JobPayload::CodeExecution {
                    file_name: Some("main.py".to_string()),
                    code: Some("print('hello')".to_string()),
                },
            })
            .await
            .expect("Should enqueue code job")
    }

    pub fn clock_now(&self) -> DateTime<Utc> {
        use queue_service::Clock;
        self.clock.now()
    }
}

/// Review job input with a lab location.
pub fn review(submitter: &str, scope: Option<Scope>) -> NewJob {
    NewJob {
        submitter_id: submitter.to_string(),
        scope,
        submission: None,
        payload: JobPayload::Review {
            notes: Some("please check task 2".to_string()),
            location: Some(LocationHint {
                lab_room: Some("Lab 3".to_string()),
                table_number: Some("12".to_string()),
            }),
        },
    }
}

pub fn scope_42() -> Scope {
    Scope::material("course-7", "material-42")
}

pub fn ta(id: &str) -> Actor {
    Actor::student(id)
}
