//! Durable job storage.
//!
//! The store holds no business rules. It offers plain reads, inserts and one
//! conditional write ([`JobStore::apply`]) that every state change funnels
//! through, so competing callers are serialized by the database rather than
//! by application-level read-then-write.

mod sqlite;

pub use sqlite::SqliteJobStore;

use crate::error::QueueResult;
use crate::model::{Job, JobId, JobStatus, JobType, RankingKey};
use crate::state_machine::Mutation;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

/// Default page size for listings.
pub const DEFAULT_PAGE_SIZE: u32 = 20;

/// Largest page size a caller may request.
pub const MAX_PAGE_SIZE: u32 = 100;

/// Which rows a listing may return, independent of the caller's filters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Visibility {
    /// Every job.
    #[default]
    All,
    /// Jobs submitted by the user.
    Own(String),
    /// Jobs submitted by the user plus jobs in the listed courses.
    OwnOrCourses {
        /// Submitter identity.
        user_id: String,
        /// Courses the user assists in.
        courses: Vec<String>,
    },
}

/// Listing criteria.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFilter {
    /// Restrict to one job type.
    pub job_type: Option<JobType>,
    /// Restrict to one status.
    pub status: Option<JobStatus>,
    /// Restrict to one course.
    pub course_id: Option<String>,
    /// Restrict to one material.
    pub material_id: Option<String>,
    /// Restrict to one submitter.
    pub submitter_id: Option<String>,
    /// Created at or after.
    pub from: Option<DateTime<Utc>>,
    /// Created at or before.
    pub to: Option<DateTime<Utc>>,
    /// Row-level visibility of the caller.
    pub visibility: Visibility,
    /// 1-based page number.
    pub page: u32,
    /// Page size.
    pub limit: u32,
}

impl Default for JobFilter {
    fn default() -> Self {
        Self {
            job_type: None,
            status: None,
            course_id: None,
            material_id: None,
            submitter_id: None,
            from: None,
            to: None,
            visibility: Visibility::All,
            page: 1,
            limit: DEFAULT_PAGE_SIZE,
        }
    }
}

impl JobFilter {
    /// Clamp pagination: page below 1 becomes 1, a limit outside
    /// `1..=MAX_PAGE_SIZE` falls back to the default.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        self.page = self.page.max(1);
        if self.limit == 0 || self.limit > MAX_PAGE_SIZE {
            self.limit = DEFAULT_PAGE_SIZE;
        }
        self
    }

    /// Rows to skip before the current page.
    #[must_use]
    pub fn offset(&self) -> u64 {
        u64::from(self.page.saturating_sub(1)) * u64::from(self.limit)
    }
}

/// One page of listing results.
#[derive(Debug, Clone)]
pub struct JobPage {
    /// Jobs on this page, oldest first.
    pub jobs: Vec<Job>,
    /// Rows matching the filter across all pages.
    pub total: u64,
    /// 1-based page number.
    pub page: u32,
    /// Page size.
    pub limit: u32,
}

impl JobPage {
    /// Number of pages needed for `total` rows.
    #[must_use]
    pub fn total_pages(&self) -> u64 {
        if self.limit == 0 {
            return 0;
        }
        self.total.div_ceil(u64::from(self.limit))
    }
}

/// Aggregate job counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// Count per status; every status is present.
    pub by_status: BTreeMap<JobStatus, u64>,
    /// Count per job type; every type is present.
    pub by_type: BTreeMap<JobType, u64>,
    /// All jobs.
    pub total: u64,
}

/// Storage contract for job records.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a new job.
    async fn insert(&self, job: &Job) -> QueueResult<()>;

    /// Persist `job` as the successor of `job.retry_of`, unless that job
    /// already has one. Returns whether the row was written.
    async fn insert_successor(&self, job: &Job) -> QueueResult<bool>;

    /// Load a job by id.
    async fn fetch(&self, id: &JobId) -> QueueResult<Option<Job>>;

    /// Direct successor of a job, if it was retried.
    async fn successor_of(&self, id: &JobId) -> QueueResult<Option<JobId>>;

    /// Filtered, paginated listing ordered by creation.
    async fn list(&self, filter: &JobFilter) -> QueueResult<JobPage>;

    /// Apply `mutation` if the row still matches its expectations.
    ///
    /// Returns the updated job, or `None` when the row is missing or was
    /// changed by someone else first.
    async fn apply(
        &self,
        id: &JobId,
        mutation: &Mutation,
        now: DateTime<Utc>,
    ) -> QueueResult<Option<Job>>;

    /// Pending jobs with the same ranking key created before `id`.
    async fn pending_ahead(&self, id: &JobId, key: &RankingKey) -> QueueResult<u64>;

    /// Aggregate counts.
    async fn stats(&self) -> QueueResult<QueueStats>;

    /// Round-trip to the database.
    async fn ping(&self) -> QueueResult<()>;
}
