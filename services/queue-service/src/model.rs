//! Job records and the vocabulary shared by every queue component.
//!
//! A [`Job`] is a shared envelope (identity, status, scope, timestamps) around a
//! type-specific [`JobPayload`]. The state machine only ever looks at the
//! envelope, so adding a job type never touches transition logic.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Unique job identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    /// Generate a fresh random identifier.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Lifecycle status of a job.
///
/// `Pending` and `Processing` are the only non-terminal states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for a claimant.
    Pending,
    /// Claimed and in progress.
    Processing,
    /// Finished with a verdict.
    Completed,
    /// Finished without a usable result.
    Failed,
    /// Withdrawn before anyone claimed it.
    Cancelled,
}

impl JobStatus {
    /// Every status, in lifecycle order.
    pub const ALL: [Self; 5] = [
        Self::Pending,
        Self::Processing,
        Self::Completed,
        Self::Failed,
        Self::Cancelled,
    ];

    /// Storage and wire representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Whether no further transition can leave this status.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown job status '{s}'"))
    }
}

/// Kind of work a job represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    /// Automated run of submitted code in the sandbox.
    CodeExecution,
    /// Human review by a teacher or TA.
    Review,
}

impl JobType {
    /// Every job type.
    pub const ALL: [Self; 2] = [Self::CodeExecution, Self::Review];

    /// Storage and wire representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::CodeExecution => "code_execution",
            Self::Review => "review",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown job type '{s}'"))
    }
}

/// Course/material pair used for ranking and grader authorization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scope {
    /// Course the submission belongs to.
    pub course_id: String,
    /// Material (exercise) within the course, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub material_id: Option<String>,
}

impl Scope {
    /// Scope covering a whole course.
    #[must_use]
    pub fn course(course_id: impl Into<String>) -> Self {
        Self {
            course_id: course_id.into(),
            material_id: None,
        }
    }

    /// Scope narrowed to one material of a course.
    #[must_use]
    pub fn material(course_id: impl Into<String>, material_id: impl Into<String>) -> Self {
        Self {
            course_id: course_id.into(),
            material_id: Some(material_id.into()),
        }
    }

    /// Key that groups peers for queue ranking: material first, then course.
    #[must_use]
    pub fn ranking_key(&self) -> RankingKey {
        self.material_id.as_ref().map_or_else(
            || RankingKey::Course(self.course_id.clone()),
            |material| RankingKey::Material(material.clone()),
        )
    }
}

/// Peer group a pending job is ranked within.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RankingKey {
    /// Jobs for the same material.
    Material(String),
    /// Jobs for the same course.
    Course(String),
}

/// Where an in-person review takes place.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationHint {
    /// Lab room the student sits in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lab_room: Option<String>,
    /// Table number within the lab room.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table_number: Option<String>,
}

/// Reference to the submission a job was derived from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionRef {
    /// Submission identifier in the submission pipeline.
    pub id: String,
    /// When the student submitted.
    pub submitted_at: DateTime<Utc>,
}

/// Type-specific part of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobPayload {
    /// Run submitted code.
    CodeExecution {
        /// Entry file name inside the submission.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        file_name: Option<String>,
        /// Inline source, when the pipeline passes it along.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
    /// Review by a human grader.
    Review {
        /// Notes left by the student for the reviewer.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        notes: Option<String>,
        /// Physical location for in-person reviews.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        location: Option<LocationHint>,
    },
}

impl JobPayload {
    /// The job type this payload belongs to.
    #[must_use]
    pub const fn job_type(&self) -> JobType {
        match self {
            Self::CodeExecution { .. } => JobType::CodeExecution,
            Self::Review { .. } => JobType::Review,
        }
    }
}

/// Who claimed a job and when. Both halves are always set together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimStamp {
    /// Claimant identity.
    pub by: String,
    /// Claim time.
    pub at: DateTime<Utc>,
}

/// Stamps written when a job reaches a terminal state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    /// Actor that moved the job into its terminal state.
    pub processed_by: String,
    /// When the terminal transition happened.
    pub completed_at: DateTime<Utc>,
    /// Structured result for completed jobs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// Failure description for failed jobs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// One unit of queued work.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    /// Identifier.
    pub id: JobId,
    /// Current status.
    pub status: JobStatus,
    /// Owner of the underlying submission.
    pub submitter_id: String,
    /// Ranking and authorization scope.
    pub scope: Option<Scope>,
    /// Originating submission.
    pub submission: Option<SubmissionRef>,
    /// Type-specific data.
    pub payload: JobPayload,
    /// Claim history; retained after the job turns terminal.
    pub claim: Option<ClaimStamp>,
    /// Terminal stamps.
    pub resolution: Option<Resolution>,
    /// Job this one supersedes.
    pub retry_of: Option<JobId>,
    /// Creation time; never changes.
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Build a fresh pending job.
    #[must_use]
    pub fn pending(new: NewJob, now: DateTime<Utc>) -> Self {
        Self {
            id: JobId::new(),
            status: JobStatus::Pending,
            submitter_id: new.submitter_id,
            scope: new.scope,
            submission: new.submission,
            payload: new.payload,
            claim: None,
            resolution: None,
            retry_of: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Build the pending successor of this job, copying type, scope and payload.
    #[must_use]
    pub fn successor(&self, now: DateTime<Utc>) -> Self {
        Self {
            id: JobId::new(),
            status: JobStatus::Pending,
            submitter_id: self.submitter_id.clone(),
            scope: self.scope.clone(),
            submission: self.submission.clone(),
            payload: self.payload.clone(),
            claim: None,
            resolution: None,
            retry_of: Some(self.id.clone()),
            created_at: now,
            updated_at: now,
        }
    }

    /// Job type, derived from the payload.
    #[must_use]
    pub const fn job_type(&self) -> JobType {
        self.payload.job_type()
    }

    /// Current or historical claimant.
    #[must_use]
    pub fn claimant(&self) -> Option<&str> {
        self.claim.as_ref().map(|claim| claim.by.as_str())
    }

    /// Course this job is scoped to.
    #[must_use]
    pub fn course_id(&self) -> Option<&str> {
        self.scope.as_ref().map(|scope| scope.course_id.as_str())
    }

    /// Location hint of review jobs.
    #[must_use]
    pub fn location(&self) -> Option<&LocationHint> {
        match &self.payload {
            JobPayload::Review { location, .. } => location.as_ref(),
            JobPayload::CodeExecution { .. } => None,
        }
    }
}

/// Input to the job producer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewJob {
    /// Owner of the submission.
    pub submitter_id: String,
    /// Scope of the submission.
    #[serde(default)]
    pub scope: Option<Scope>,
    /// Originating submission.
    #[serde(default)]
    pub submission: Option<SubmissionRef>,
    /// Type-specific data.
    pub payload: JobPayload,
}

/// Result a claimant reports when finishing a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Work accepted.
    Approved,
    /// Work reviewed and sent back.
    Rejected,
    /// The job could not be carried out.
    Failed,
}

impl Outcome {
    /// Wire representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Failed => "failed",
        }
    }

    /// Terminal status this outcome leads to.
    #[must_use]
    pub const fn status(self) -> JobStatus {
        match self {
            Self::Approved | Self::Rejected => JobStatus::Completed,
            Self::Failed => JobStatus::Failed,
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
