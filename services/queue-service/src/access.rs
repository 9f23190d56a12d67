//! Actors, roles and per-course grader authorization.
//!
//! Teacher is a global role. Teaching assistants are not a role at all: an
//! actor is an assistant only relative to a course they are enrolled in with
//! the `ta` role, which is why authority is resolved per job.

use crate::error::{QueueError, QueueResult};
use crate::model::Job;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};
use tracing::debug;

/// Identity of the system actor used for automated processing.
pub const SYSTEM_ACTOR_ID: &str = "system";

/// Global role carried by an authenticated actor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Regular course participant.
    Student,
    /// Staff with authority over every course.
    Teacher,
    /// Internal automation (submission pipeline, execution engine).
    System,
}

impl Role {
    /// Wire representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Student => "student",
            Self::Teacher => "teacher",
            Self::System => "system",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "student" => Ok(Self::Student),
            "teacher" => Ok(Self::Teacher),
            "system" => Ok(Self::System),
            other => Err(QueueError::Validation(format!("unknown role '{other}'"))),
        }
    }
}

/// Authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    /// Stable user identifier.
    pub id: String,
    /// Global role.
    pub role: Role,
}

impl Actor {
    /// Create an actor.
    pub fn new(id: impl Into<String>, role: Role) -> Self {
        Self {
            id: id.into(),
            role,
        }
    }

    /// Student actor.
    pub fn student(id: impl Into<String>) -> Self {
        Self::new(id, Role::Student)
    }

    /// Teacher actor.
    pub fn teacher(id: impl Into<String>) -> Self {
        Self::new(id, Role::Teacher)
    }

    /// The automated processing actor.
    #[must_use]
    pub fn system() -> Self {
        Self::new(SYSTEM_ACTOR_ID, Role::System)
    }

    /// Whether the actor holds the global teacher role.
    #[must_use]
    pub fn is_teacher(&self) -> bool {
        self.role == Role::Teacher
    }
}

/// What an actor may do with one specific job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Authority {
    /// Global teacher.
    Teacher,
    /// TA enrolled in the job's course.
    Assistant,
    /// Automated processing actor.
    System,
    /// Anyone else, including the submitter.
    Member,
}

impl Authority {
    /// Whether this authority may claim, process and grade jobs.
    #[must_use]
    pub const fn can_grade(self) -> bool {
        matches!(self, Self::Teacher | Self::Assistant | Self::System)
    }
}

/// Read model of course staff enrollments.
#[async_trait]
pub trait Enrollments: Send + Sync {
    /// Whether `user_id` is a TA in `course_id`.
    async fn is_assistant(&self, course_id: &str, user_id: &str) -> QueueResult<bool>;

    /// Courses in which `user_id` is a TA.
    async fn assisted_courses(&self, user_id: &str) -> QueueResult<Vec<String>>;
}

/// Resolve the authority `actor` holds over `job`.
///
/// # Errors
///
/// Returns error if the enrollment lookup fails.
pub async fn authority(
    enrollments: &dyn Enrollments,
    actor: &Actor,
    job: &Job,
) -> QueueResult<Authority> {
    match actor.role {
        Role::Teacher => Ok(Authority::Teacher),
        Role::System => Ok(Authority::System),
        Role::Student => {
            let Some(course) = job.course_id() else {
                return Ok(Authority::Member);
            };
            if enrollments.is_assistant(course, &actor.id).await? {
                Ok(Authority::Assistant)
            } else {
                Ok(Authority::Member)
            }
        }
    }
}

/// Enrollment lookups backed by the `course_enrollments` table.
#[derive(Debug, Clone)]
pub struct SqliteEnrollments {
    pool: SqlitePool,
}

impl SqliteEnrollments {
    /// Create a lookup over the given pool.
    #[must_use]
    pub const fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Enrollments for SqliteEnrollments {
    async fn is_assistant(&self, course_id: &str, user_id: &str) -> QueueResult<bool> {
        let found: Option<i64> = sqlx::query_scalar(
            "SELECT 1 FROM course_enrollments WHERE course_id = ? AND user_id = ? AND role = 'ta'",
        )
        .bind(course_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(found.is_some())
    }

    async fn assisted_courses(&self, user_id: &str) -> QueueResult<Vec<String>> {
        let courses = sqlx::query_scalar(
            "SELECT course_id FROM course_enrollments WHERE user_id = ? AND role = 'ta' ORDER BY course_id",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(courses)
    }
}

/// Short-lived cache in front of another [`Enrollments`].
///
/// Entries are advisory: they expire after the configured TTL and every
/// state change is still decided by the store.
pub struct CachedEnrollments<E> {
    inner: E,
    ttl: Duration,
    assistants: DashMap<(String, String), (bool, Instant)>,
    courses: DashMap<String, (Vec<String>, Instant)>,
}

impl<E: Enrollments> CachedEnrollments<E> {
    /// Wrap `inner` with a cache of the given TTL.
    pub fn new(inner: E, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            assistants: DashMap::new(),
            courses: DashMap::new(),
        }
    }

    fn fresh(&self, stored: Instant) -> bool {
        stored.elapsed() < self.ttl
    }

    /// Drop expired entries from both maps. Runs on every miss, so the cache
    /// only holds pairs looked up within the last TTL.
    fn evict_expired(&self) {
        self.assistants.retain(|_, (_, stored)| self.fresh(*stored));
        self.courses.retain(|_, (_, stored)| self.fresh(*stored));
    }
}

#[async_trait]
impl<E: Enrollments> Enrollments for CachedEnrollments<E> {
    async fn is_assistant(&self, course_id: &str, user_id: &str) -> QueueResult<bool> {
        let key = (course_id.to_string(), user_id.to_string());
        if let Some(entry) = self.assistants.get(&key) {
            let (hit, stored) = *entry;
            if self.fresh(stored) {
                return Ok(hit);
            }
        }

        let value = self.inner.is_assistant(course_id, user_id).await?;
        debug!(course_id, user_id, assistant = value, "enrollment cache refreshed");
        self.evict_expired();
        self.assistants.insert(key, (value, Instant::now()));
        Ok(value)
    }

    async fn assisted_courses(&self, user_id: &str) -> QueueResult<Vec<String>> {
        if let Some(entry) = self.courses.get(user_id) {
            if self.fresh(entry.1) {
                return Ok(entry.0.clone());
            }
        }

        let value = self.inner.assisted_courses(user_id).await?;
        self.evict_expired();
        self.courses
            .insert(user_id.to_string(), (value.clone(), Instant::now()));
        Ok(value)
    }
}
