//! Request handlers.

use super::AppState;
use crate::access::Actor;
use crate::dispatch::BrokerMode;
use crate::error::QueueError;
use crate::model::{Job, JobId, JobPayload, JobStatus, JobType, LocationHint, NewJob, Outcome};
use crate::store::{JobFilter, JobPage, QueueStats, DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE};
use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Instant;

/// Envelope for successful responses.
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    /// Always `true`; failures use the error body.
    pub success: bool,
    /// Human-readable summary.
    pub message: String,
    /// Payload.
    pub data: T,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(message: impl Into<String>, data: T) -> Json<Self> {
        Json(Self {
            success: true,
            message: message.into(),
            data,
        })
    }
}

/// JSON shape of a job.
#[derive(Debug, Serialize, Deserialize)]
pub struct JobView {
    /// Job id.
    pub id: String,
    /// Job type.
    #[serde(rename = "type")]
    pub job_type: JobType,
    /// Current status.
    pub status: JobStatus,
    /// Owner of the submission.
    pub submitter_id: String,
    /// Scoped course.
    pub course_id: Option<String>,
    /// Scoped material.
    pub material_id: Option<String>,
    /// Originating submission.
    pub submission_id: Option<String>,
    /// When the submission was made.
    pub submitted_at: Option<DateTime<Utc>>,
    /// Type-specific data.
    pub payload: JobPayload,
    /// Physical location for in-person reviews.
    pub location: Option<LocationHint>,
    /// Claimant.
    pub claimed_by: Option<String>,
    /// Claim time.
    pub claimed_at: Option<DateTime<Utc>>,
    /// Actor that finished the job.
    pub processed_by: Option<String>,
    /// When the job finished.
    pub completed_at: Option<DateTime<Utc>>,
    /// Result of completed jobs.
    pub result: Option<serde_json::Value>,
    /// Failure description.
    pub error_message: Option<String>,
    /// Predecessor in the lineage.
    pub retry_of: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last change.
    pub updated_at: DateTime<Utc>,
}

impl From<&Job> for JobView {
    fn from(job: &Job) -> Self {
        let resolution = job.resolution.as_ref();
        Self {
            id: job.id.to_string(),
            job_type: job.job_type(),
            status: job.status,
            submitter_id: job.submitter_id.clone(),
            course_id: job.scope.as_ref().map(|s| s.course_id.clone()),
            material_id: job.scope.as_ref().and_then(|s| s.material_id.clone()),
            submission_id: job.submission.as_ref().map(|s| s.id.clone()),
            submitted_at: job.submission.as_ref().map(|s| s.submitted_at),
            payload: job.payload.clone(),
            location: job.location().cloned(),
            claimed_by: job.claim.as_ref().map(|c| c.by.clone()),
            claimed_at: job.claim.as_ref().map(|c| c.at),
            processed_by: resolution.map(|r| r.processed_by.clone()),
            completed_at: resolution.map(|r| r.completed_at),
            result: resolution.and_then(|r| r.result.clone()),
            error_message: resolution.and_then(|r| r.error_message.clone()),
            retry_of: job.retry_of.as_ref().map(ToString::to_string),
            created_at: job.created_at,
            updated_at: job.updated_at,
        }
    }
}

/// Pagination block of list responses.
#[derive(Debug, Serialize, Deserialize)]
pub struct Pagination {
    /// 1-based page.
    pub page: u32,
    /// Page size.
    pub limit: u32,
    /// Matching rows.
    pub total: u64,
    /// Pages available.
    pub total_pages: u64,
}

#[derive(Debug, Serialize)]
struct JobList {
    jobs: Vec<JobView>,
    pagination: Pagination,
}

impl From<JobPage> for JobList {
    fn from(page: JobPage) -> Self {
        Self {
            pagination: Pagination {
                page: page.page,
                limit: page.limit,
                total: page.total,
                total_pages: page.total_pages(),
            },
            jobs: page.jobs.iter().map(JobView::from).collect(),
        }
    }
}

/// Query string of the list endpoint.
#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    #[serde(rename = "type")]
    job_type: Option<String>,
    status: Option<String>,
    course_id: Option<String>,
    material_id: Option<String>,
    submitter_id: Option<String>,
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
    page: Option<i64>,
    limit: Option<i64>,
}

impl ListQuery {
    fn into_filter(self) -> Result<JobFilter, QueueError> {
        let page = self
            .page
            .filter(|p| *p >= 1)
            .and_then(|p| u32::try_from(p).ok())
            .unwrap_or(1);
        let limit = self
            .limit
            .filter(|l| (1..=i64::from(MAX_PAGE_SIZE)).contains(l))
            .and_then(|l| u32::try_from(l).ok())
            .unwrap_or(DEFAULT_PAGE_SIZE);

        Ok(JobFilter {
            job_type: parse_enum(self.job_type)?,
            status: parse_enum(self.status)?,
            course_id: self.course_id.filter(|v| !v.is_empty()),
            material_id: self.material_id.filter(|v| !v.is_empty()),
            submitter_id: self.submitter_id.filter(|v| !v.is_empty()),
            from: self.from,
            to: self.to,
            page,
            limit,
            ..JobFilter::default()
        })
    }
}

fn parse_enum<T: FromStr<Err = String>>(raw: Option<String>) -> Result<Option<T>, QueueError> {
    raw.filter(|v| !v.is_empty())
        .map(|v| v.parse::<T>().map_err(QueueError::Validation))
        .transpose()
}

/// Body of the complete endpoint.
#[derive(Debug, Deserialize)]
pub struct CompleteRequest {
    status: Outcome,
    #[serde(default)]
    comment: Option<String>,
}

#[derive(Debug, Serialize)]
struct PositionView {
    job_id: String,
    position: Option<u64>,
}

#[derive(Debug, Serialize)]
struct HealthView {
    status: &'static str,
    database: DatabaseHealth,
    broker: BrokerMode,
}

#[derive(Debug, Serialize)]
struct DatabaseHealth {
    ok: bool,
    latency_ms: u64,
}

fn parse_job_id(raw: &str) -> Result<JobId, QueueError> {
    JobId::from_str(raw).map_err(|_| QueueError::NotFound(raw.to_string()))
}

fn job_response(message: &str, job: &Job) -> Response {
    ApiResponse::ok(message, JobView::from(job)).into_response()
}

/// Service health.
///
/// ```bash
/// GET /health
/// ```
///
/// Response:
/// ```json
/// { "status": "ok", "database": { "ok": true, "latency_ms": 1 }, "broker": "degraded" }
/// ```
pub async fn health(State(state): State<AppState>) -> Response {
    let started = Instant::now();
    let database_ok = match state.queue.store().ping().await {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(error = %e, "Database ping failed");
            false
        }
    };
    let view = HealthView {
        status: if database_ok { "ok" } else { "unavailable" },
        database: DatabaseHealth {
            ok: database_ok,
            latency_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        },
        broker: state.queue.dispatch().mode(),
    };
    let code = if database_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(view)).into_response()
}

/// List jobs visible to the caller.
///
/// ```bash
/// GET /queue/jobs?status=pending&course_id=course-7&page=1&limit=20
/// ```
pub async fn list_jobs(
    State(state): State<AppState>,
    actor: Actor,
    query: Result<Query<ListQuery>, QueryRejection>,
) -> Result<Response, QueueError> {
    let Query(query) = query.map_err(|e| QueueError::Validation(e.body_text()))?;
    let page = state.queue.list(&actor, query.into_filter()?).await?;
    Ok(ApiResponse::ok("Jobs retrieved successfully", JobList::from(page)).into_response())
}

/// Enqueue a job. Called by the submission pipeline as the system actor.
///
/// ```bash
/// POST /queue/jobs
/// { "submitter_id": "student-1", "scope": { "course_id": "course-7" },
///   "payload": { "type": "review", "notes": "table by the window" } }
/// ```
pub async fn create_job(
    State(state): State<AppState>,
    actor: Actor,
    body: Result<Json<NewJob>, JsonRejection>,
) -> Result<Response, QueueError> {
    let Json(new) = body.map_err(|e| QueueError::Validation(e.body_text()))?;
    let job = state.producer.submit(&actor, new).await?;
    Ok((
        StatusCode::CREATED,
        ApiResponse::ok("Job created", JobView::from(&job)),
    )
        .into_response())
}

/// Fetch one job.
pub async fn get_job(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<String>,
) -> Result<Response, QueueError> {
    let job = state.queue.get(&parse_job_id(&id)?, &actor).await?;
    Ok(job_response("Job retrieved successfully", &job))
}

/// Rank of a pending job among its peers; `null` when not ranked.
pub async fn job_position(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<String>,
) -> Result<Response, QueueError> {
    let job_id = parse_job_id(&id)?;
    let position = state.queue.position(&job_id, &actor).await?;
    Ok(ApiResponse::ok(
        "Queue position computed",
        PositionView {
            job_id: job_id.to_string(),
            position,
        },
    )
    .into_response())
}

/// Claim a pending job.
pub async fn claim_job(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<String>,
) -> Result<Response, QueueError> {
    let job = state.queue.claim(&parse_job_id(&id)?, &actor).await?;
    Ok(job_response("Job claimed", &job))
}

/// Force a pending job into processing.
pub async fn process_job(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<String>,
) -> Result<Response, QueueError> {
    let job = state.queue.process(&parse_job_id(&id)?, &actor).await?;
    Ok(job_response("Job is processing", &job))
}

/// Finish a claimed job.
///
/// ```bash
/// POST /queue/jobs/{id}/complete
/// { "status": "approved", "comment": "ok" }
/// ```
pub async fn complete_job(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<String>,
    body: Result<Json<CompleteRequest>, JsonRejection>,
) -> Result<Response, QueueError> {
    let job_id = parse_job_id(&id)?;
    let Json(request) = body.map_err(|e| QueueError::Validation(e.body_text()))?;
    let job = state
        .queue
        .complete(&job_id, &actor, request.status, request.comment)
        .await?;
    Ok(job_response("Job completed", &job))
}

/// Cancel a pending job.
pub async fn cancel_job(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<String>,
) -> Result<Response, QueueError> {
    let job = state.queue.cancel(&parse_job_id(&id)?, &actor).await?;
    Ok(job_response("Job cancelled", &job))
}

/// Retry a job once it is old enough.
pub async fn retry_job(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<String>,
) -> Result<Response, QueueError> {
    let job = state.queue.retry(&parse_job_id(&id)?, &actor).await?;
    Ok((
        StatusCode::CREATED,
        ApiResponse::ok("Retry job created", JobView::from(&job)),
    )
        .into_response())
}

/// Aggregate counts. Teacher only.
///
/// ```json
/// { "by_status": { "pending": 3, "processing": 1, ... }, "by_type": { "review": 4, ... }, "total": 4 }
/// ```
pub async fn queue_stats(
    State(state): State<AppState>,
    actor: Actor,
) -> Result<Response, QueueError> {
    let stats: QueueStats = state.queue.stats(&actor).await?;
    Ok(ApiResponse::ok("Statistics retrieved successfully", stats).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_query_resets_out_of_range_pagination() {
        let filter = ListQuery {
            page: Some(0),
            limit: Some(1000),
            ..ListQuery::default()
        }
        .into_filter()
        .unwrap();
        assert_eq!(filter.page, 1);
        assert_eq!(filter.limit, DEFAULT_PAGE_SIZE);
    }

    #[test]
    fn test_list_query_parses_enums() {
        let filter = ListQuery {
            job_type: Some("code_execution".to_string()),
            status: Some("pending".to_string()),
            ..ListQuery::default()
        }
        .into_filter()
        .unwrap();
        assert_eq!(filter.job_type, Some(JobType::CodeExecution));
        assert_eq!(filter.status, Some(JobStatus::Pending));

        let err = ListQuery {
            status: Some("queued".to_string()),
            ..ListQuery::default()
        }
        .into_filter()
        .unwrap_err();
        assert!(matches!(err, QueueError::Validation(_)));
    }
}
