//! Boundaries to services outside the queue.
//!
//! Grading consumes review verdicts; the execution engine runs submitted
//! code. Both are black boxes reached through small traits so the queue can
//! run, and be tested, without them.

use crate::model::{Job, JobPayload, Outcome};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::info;

/// Receives the verdict of finished review jobs.
#[async_trait]
pub trait GradingSink: Send + Sync {
    /// A review of `submission_id` finished with `outcome`.
    async fn review_completed(&self, submission_id: &str, outcome: Outcome, comment: Option<&str>);
}

/// Grading sink that only records verdicts in the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingGradingSink;

#[async_trait]
impl GradingSink for TracingGradingSink {
    async fn review_completed(&self, submission_id: &str, outcome: Outcome, comment: Option<&str>) {
        info!(
            submission_id,
            outcome = %outcome,
            comment = comment.unwrap_or_default(),
            "Review verdict recorded"
        );
    }
}

/// What the execution engine reported for one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    /// Whether the submitted code ran and passed.
    pub success: bool,
    /// Captured output or diagnostics.
    #[serde(default)]
    pub output: String,
}

/// Runs code execution jobs.
#[async_trait]
pub trait CodeRunner: Send + Sync {
    /// Execute `job`. An `Err` means the engine could not run it at all.
    async fn run(&self, job: &Job) -> Result<RunReport, String>;
}

#[derive(Serialize)]
struct RunRequest<'a> {
    job_id: String,
    submission_id: Option<&'a str>,
    payload: &'a JobPayload,
}

/// Code runner that posts jobs to an HTTP execution endpoint.
#[derive(Debug, Clone)]
pub struct HttpCodeRunner {
    http: reqwest::Client,
    url: String,
}

impl HttpCodeRunner {
    /// Create a runner for `url` with a per-request timeout.
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be built.
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            url: url.into(),
        })
    }
}

#[async_trait]
impl CodeRunner for HttpCodeRunner {
    async fn run(&self, job: &Job) -> Result<RunReport, String> {
        let request = RunRequest {
            job_id: job.id.to_string(),
            submission_id: job.submission.as_ref().map(|s| s.id.as_str()),
            payload: &job.payload,
        };

        let res = self
            .http
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .map_err(|e| format!("execution request failed: {e}"))?;

        let status = res.status();
        if !status.is_success() {
            return Err(format!("execution engine returned {status}"));
        }

        res.json::<RunReport>()
            .await
            .map_err(|e| format!("invalid execution report: {e}"))
    }
}
