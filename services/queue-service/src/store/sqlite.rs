//! SQLite implementation of [`JobStore`].

use super::{JobFilter, JobPage, JobStore, QueueStats, Visibility};
use crate::config::DatabaseConfig;
use crate::error::{QueueError, QueueResult};
use crate::model::{
    ClaimStamp, Job, JobId, JobPayload, JobStatus, JobType, RankingKey, Resolution, Scope,
    SubmissionRef,
};
use crate::state_machine::Mutation;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{QueryBuilder, Sqlite, SqliteConnection, SqlitePool, Transaction};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

const JOB_COLUMNS: &str = "id, job_type, status, submitter_id, course_id, material_id, \
     submission_id, submitted_at, payload, claimed_by, claimed_at, processed_by, completed_at, \
     result, error_message, retry_of, created_at, updated_at";

/// Job store backed by a SQLite database in WAL mode.
#[derive(Debug, Clone)]
pub struct SqliteJobStore {
    pool: SqlitePool,
}

impl SqliteJobStore {
    /// Open (creating if needed) the database and run pending migrations.
    ///
    /// # Errors
    ///
    /// Returns error if the URL is invalid, the database cannot be opened,
    /// or a migration fails.
    pub async fn connect(config: &DatabaseConfig) -> QueueResult<Self> {
        let options = SqliteConnectOptions::from_str(&config.url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(config.busy_timeout_seconds))
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_seconds))
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(sqlx::Error::from)?;

        info!(url = %config.url, "Job store ready");
        Ok(Self { pool })
    }

    /// Wrap an existing pool. Migrations are the caller's responsibility.
    #[must_use]
    pub const fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Underlying connection pool.
    #[must_use]
    pub const fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Open a transaction holding the database write lock.
    ///
    /// `BEGIN IMMEDIATE` takes the lock up front, so a concurrent writer waits
    /// on the busy timeout instead of failing when it upgrades a read lock.
    /// The transaction rolls back when dropped, including when the calling
    /// future is cancelled before it commits.
    async fn begin_immediate(&self) -> QueueResult<Transaction<'static, Sqlite>> {
        Ok(self.pool.begin_with("BEGIN IMMEDIATE").await?)
    }

    async fn fetch_with(conn: &mut SqliteConnection, id: &JobId) -> QueueResult<Option<Job>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM queue_jobs WHERE id = ?");
        let row: Option<JobRow> = sqlx::query_as(&sql)
            .bind(id.to_string())
            .fetch_optional(conn)
            .await?;
        row.map(Job::try_from).transpose()
    }

    async fn insert_with(conn: &mut SqliteConnection, job: &Job) -> QueueResult<()> {
        let row = InsertRow::from_job(job)?;
        sqlx::query(
            "INSERT INTO queue_jobs (id, job_type, status, submitter_id, course_id, material_id, \
             submission_id, submitted_at, payload, retry_of, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(row.id)
        .bind(row.job_type)
        .bind(row.status)
        .bind(row.submitter_id)
        .bind(row.course_id)
        .bind(row.material_id)
        .bind(row.submission_id)
        .bind(row.submitted_at)
        .bind(row.payload)
        .bind(row.retry_of)
        .bind(row.created_at)
        .bind(row.updated_at)
        .execute(conn)
        .await?;
        Ok(())
    }

    async fn apply_with(
        conn: &mut SqliteConnection,
        id: &JobId,
        mutation: &Mutation,
        now: DateTime<Utc>,
    ) -> QueueResult<Option<Job>> {
        let claim = mutation.claim.as_ref();
        let resolution = mutation.resolution.as_ref();
        let result = resolution
            .and_then(|r| r.result.as_ref())
            .map(serde_json::to_string)
            .transpose()?;

        let updated = sqlx::query(
            "UPDATE queue_jobs SET \
               status = ?, \
               claimed_by = COALESCE(?, claimed_by), \
               claimed_at = COALESCE(?, claimed_at), \
               processed_by = COALESCE(?, processed_by), \
               completed_at = COALESCE(?, completed_at), \
               result = COALESCE(?, result), \
               error_message = COALESCE(?, error_message), \
               updated_at = ? \
             WHERE id = ? AND status = ? AND (? IS NULL OR claimed_by = ?)",
        )
        .bind(mutation.status.as_str())
        .bind(claim.map(|c| c.by.clone()))
        .bind(claim.map(|c| encode_time(c.at)))
        .bind(resolution.map(|r| r.processed_by.clone()))
        .bind(resolution.map(|r| encode_time(r.completed_at)))
        .bind(result)
        .bind(resolution.and_then(|r| r.error_message.clone()))
        .bind(encode_time(now))
        .bind(id.to_string())
        .bind(mutation.expected.as_str())
        .bind(mutation.expected_claimant.clone())
        .bind(mutation.expected_claimant.clone())
        .execute(&mut *conn)
        .await?
        .rows_affected();

        if updated == 0 {
            return Ok(None);
        }
        Self::fetch_with(conn, id).await
    }
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn insert(&self, job: &Job) -> QueueResult<()> {
        let mut tx = self.begin_immediate().await?;
        Self::insert_with(&mut tx, job).await?;
        tx.commit().await?;
        debug!(job_id = %job.id, job_type = %job.job_type(), "Job inserted");
        Ok(())
    }

    async fn insert_successor(&self, job: &Job) -> QueueResult<bool> {
        let Some(parent) = job.retry_of.as_ref() else {
            return Err(QueueError::Validation(
                "successor job must reference its predecessor".to_string(),
            ));
        };
        let row = InsertRow::from_job(job)?;

        let mut tx = self.begin_immediate().await?;
        let inserted = sqlx::query(
            "INSERT INTO queue_jobs (id, job_type, status, submitter_id, course_id, material_id, \
             submission_id, submitted_at, payload, retry_of, created_at, updated_at) \
             SELECT ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ? \
             WHERE NOT EXISTS (SELECT 1 FROM queue_jobs WHERE retry_of = ?)",
        )
        .bind(row.id)
        .bind(row.job_type)
        .bind(row.status)
        .bind(row.submitter_id)
        .bind(row.course_id)
        .bind(row.material_id)
        .bind(row.submission_id)
        .bind(row.submitted_at)
        .bind(row.payload)
        .bind(row.retry_of)
        .bind(row.created_at)
        .bind(row.updated_at)
        .bind(parent.to_string())
        .execute(&mut *tx)
        .await?
        .rows_affected()
            == 1;
        tx.commit().await?;
        Ok(inserted)
    }

    async fn fetch(&self, id: &JobId) -> QueueResult<Option<Job>> {
        let mut conn = self.pool.acquire().await?;
        Self::fetch_with(&mut conn, id).await
    }

    async fn successor_of(&self, id: &JobId) -> QueueResult<Option<JobId>> {
        let successor: Option<String> = sqlx::query_scalar(
            "SELECT id FROM queue_jobs WHERE retry_of = ? ORDER BY seq LIMIT 1",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        successor.map(|raw| parse_id(&raw)).transpose()
    }

    async fn list(&self, filter: &JobFilter) -> QueueResult<JobPage> {
        let filter = filter.clone().normalized();

        let mut count = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM queue_jobs WHERE 1 = 1");
        push_filters(&mut count, &filter);
        let total: i64 = count.build_query_scalar().fetch_one(&self.pool).await?;

        let mut select =
            QueryBuilder::<Sqlite>::new(format!("SELECT {JOB_COLUMNS} FROM queue_jobs WHERE 1 = 1"));
        push_filters(&mut select, &filter);
        select
            .push(" ORDER BY created_at ASC, seq ASC LIMIT ")
            .push_bind(i64::from(filter.limit))
            .push(" OFFSET ")
            .push_bind(i64::try_from(filter.offset()).unwrap_or(i64::MAX));
        let rows: Vec<JobRow> = select.build_query_as().fetch_all(&self.pool).await?;

        let jobs = rows
            .into_iter()
            .map(Job::try_from)
            .collect::<QueueResult<Vec<_>>>()?;

        Ok(JobPage {
            jobs,
            total: u64::try_from(total).unwrap_or(0),
            page: filter.page,
            limit: filter.limit,
        })
    }

    async fn apply(
        &self,
        id: &JobId,
        mutation: &Mutation,
        now: DateTime<Utc>,
    ) -> QueueResult<Option<Job>> {
        let mut tx = self.begin_immediate().await?;
        let updated = Self::apply_with(&mut tx, id, mutation, now).await?;
        tx.commit().await?;
        Ok(updated)
    }

    async fn pending_ahead(&self, id: &JobId, key: &RankingKey) -> QueueResult<u64> {
        let (column, value) = match key {
            RankingKey::Material(material) => ("material_id", material),
            RankingKey::Course(course) => ("course_id", course),
        };
        let sql = format!(
            "SELECT COUNT(*) FROM queue_jobs AS peer \
             JOIN queue_jobs AS target ON target.id = ? \
             WHERE peer.status = 'pending' \
               AND peer.{column} = ? \
               AND (peer.created_at < target.created_at \
                    OR (peer.created_at = target.created_at AND peer.seq < target.seq))"
        );
        let ahead: i64 = sqlx::query_scalar(&sql)
            .bind(id.to_string())
            .bind(value)
            .fetch_one(&self.pool)
            .await?;
        Ok(u64::try_from(ahead).unwrap_or(0))
    }

    async fn stats(&self) -> QueueResult<QueueStats> {
        let mut stats = QueueStats {
            by_status: JobStatus::ALL.into_iter().map(|s| (s, 0)).collect(),
            by_type: JobType::ALL.into_iter().map(|t| (t, 0)).collect(),
            total: 0,
        };

        let by_status: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM queue_jobs GROUP BY status")
                .fetch_all(&self.pool)
                .await?;
        for (status, count) in by_status {
            let status = JobStatus::from_str(&status).map_err(QueueError::Corrupt)?;
            let count = u64::try_from(count).unwrap_or(0);
            stats.by_status.insert(status, count);
            stats.total += count;
        }

        let by_type: Vec<(String, i64)> =
            sqlx::query_as("SELECT job_type, COUNT(*) FROM queue_jobs GROUP BY job_type")
                .fetch_all(&self.pool)
                .await?;
        for (job_type, count) in by_type {
            let job_type = JobType::from_str(&job_type).map_err(QueueError::Corrupt)?;
            stats
                .by_type
                .insert(job_type, u64::try_from(count).unwrap_or(0));
        }

        Ok(stats)
    }

    async fn ping(&self) -> QueueResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

fn push_filters(builder: &mut QueryBuilder<'_, Sqlite>, filter: &JobFilter) {
    if let Some(job_type) = filter.job_type {
        builder.push(" AND job_type = ").push_bind(job_type.as_str());
    }
    if let Some(status) = filter.status {
        builder.push(" AND status = ").push_bind(status.as_str());
    }
    if let Some(course) = &filter.course_id {
        builder.push(" AND course_id = ").push_bind(course.clone());
    }
    if let Some(material) = &filter.material_id {
        builder.push(" AND material_id = ").push_bind(material.clone());
    }
    if let Some(submitter) = &filter.submitter_id {
        builder.push(" AND submitter_id = ").push_bind(submitter.clone());
    }
    if let Some(from) = filter.from {
        builder.push(" AND created_at >= ").push_bind(encode_time(from));
    }
    if let Some(to) = filter.to {
        builder.push(" AND created_at <= ").push_bind(encode_time(to));
    }

    match &filter.visibility {
        Visibility::All => {}
        Visibility::Own(user) => {
            builder.push(" AND submitter_id = ").push_bind(user.clone());
        }
        Visibility::OwnOrCourses { user_id, courses } => {
            builder.push(" AND (submitter_id = ").push_bind(user_id.clone());
            if !courses.is_empty() {
                builder.push(" OR course_id IN (");
                let mut list = builder.separated(", ");
                for course in courses {
                    list.push_bind(course.clone());
                }
                list.push_unseparated(")");
            }
            builder.push(")");
        }
    }
}

/// Fixed-width UTC timestamps so text comparison matches time order.
fn encode_time(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn decode_time(raw: &str) -> QueueResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|e| QueueError::Corrupt(format!("bad timestamp '{raw}': {e}")))
}

fn decode_optional_time(raw: Option<&str>) -> QueueResult<Option<DateTime<Utc>>> {
    raw.map(decode_time).transpose()
}

fn parse_id(raw: &str) -> QueueResult<JobId> {
    JobId::from_str(raw).map_err(|e| QueueError::Corrupt(format!("bad job id '{raw}': {e}")))
}

/// Column values of a new row.
struct InsertRow {
    id: String,
    job_type: &'static str,
    status: &'static str,
    submitter_id: String,
    course_id: Option<String>,
    material_id: Option<String>,
    submission_id: Option<String>,
    submitted_at: Option<String>,
    payload: String,
    retry_of: Option<String>,
    created_at: String,
    updated_at: String,
}

impl InsertRow {
    fn from_job(job: &Job) -> QueueResult<Self> {
        Ok(Self {
            id: job.id.to_string(),
            job_type: job.job_type().as_str(),
            status: job.status.as_str(),
            submitter_id: job.submitter_id.clone(),
            course_id: job.scope.as_ref().map(|s| s.course_id.clone()),
            material_id: job.scope.as_ref().and_then(|s| s.material_id.clone()),
            submission_id: job.submission.as_ref().map(|s| s.id.clone()),
            submitted_at: job.submission.as_ref().map(|s| encode_time(s.submitted_at)),
            payload: serde_json::to_string(&job.payload)?,
            retry_of: job.retry_of.as_ref().map(ToString::to_string),
            created_at: encode_time(job.created_at),
            updated_at: encode_time(job.updated_at),
        })
    }
}

/// Raw `queue_jobs` row.
#[derive(Debug, sqlx::FromRow)]
struct JobRow {
    id: String,
    job_type: String,
    status: String,
    submitter_id: String,
    course_id: Option<String>,
    material_id: Option<String>,
    submission_id: Option<String>,
    submitted_at: Option<String>,
    payload: String,
    claimed_by: Option<String>,
    claimed_at: Option<String>,
    processed_by: Option<String>,
    completed_at: Option<String>,
    result: Option<String>,
    error_message: Option<String>,
    retry_of: Option<String>,
    created_at: String,
    updated_at: String,
}

impl TryFrom<JobRow> for Job {
    type Error = QueueError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let status = JobStatus::from_str(&row.status).map_err(QueueError::Corrupt)?;
        let job_type = JobType::from_str(&row.job_type).map_err(QueueError::Corrupt)?;
        let payload: JobPayload = serde_json::from_str(&row.payload)?;
        if payload.job_type() != job_type {
            return Err(QueueError::Corrupt(format!(
                "job {} stored as {job_type} but payload is {}",
                row.id,
                payload.job_type()
            )));
        }

        let scope = row.course_id.map(|course_id| Scope {
            course_id,
            material_id: row.material_id,
        });

        let submission = match (row.submission_id, row.submitted_at.as_deref()) {
            (Some(id), Some(at)) => Some(SubmissionRef {
                id,
                submitted_at: decode_time(at)?,
            }),
            _ => None,
        };

        let claim = match (row.claimed_by, decode_optional_time(row.claimed_at.as_deref())?) {
            (Some(by), Some(at)) => Some(ClaimStamp { by, at }),
            _ => None,
        };

        let resolution = match (
            row.processed_by,
            decode_optional_time(row.completed_at.as_deref())?,
        ) {
            (Some(processed_by), Some(completed_at)) => Some(Resolution {
                processed_by,
                completed_at,
                result: row
                    .result
                    .as_deref()
                    .map(serde_json::from_str)
                    .transpose()?,
                error_message: row.error_message,
            }),
            _ => None,
        };

        Ok(Self {
            id: parse_id(&row.id)?,
            status,
            submitter_id: row.submitter_id,
            scope,
            submission,
            payload,
            claim,
            resolution,
            retry_of: row.retry_of.as_deref().map(parse_id).transpose()?,
            created_at: decode_time(&row.created_at)?,
            updated_at: decode_time(&row.updated_at)?,
        })
    }
}
