//! REST surface of the queue.
//!
//! ```text
//! GET  /health
//! GET  /queue/jobs                 list with filters and pagination
//! POST /queue/jobs                 enqueue (submission pipeline only)
//! GET  /queue/jobs/{id}            fetch one
//! GET  /queue/jobs/{id}/position   rank among pending peers
//! POST /queue/jobs/{id}/claim
//! POST /queue/jobs/{id}/process
//! POST /queue/jobs/{id}/complete   { "status": "approved" | "rejected" | "failed", "comment": "..." }
//! POST /queue/jobs/{id}/cancel
//! POST /queue/jobs/{id}/retry
//! GET  /queue/stats                teacher only
//! ```

mod error;
mod extract;
mod handlers;

pub use extract::{IdentityRejection, ACTOR_ID_HEADER, ACTOR_ROLE_HEADER};
pub use handlers::{ApiResponse, JobView, Pagination};

use crate::services::{JobProducer, QueueService};
use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    /// Operations on existing jobs.
    pub queue: QueueService,
    /// Intake of new jobs.
    pub producer: JobProducer,
}

impl AppState {
    /// Bundle the services handlers need.
    #[must_use]
    pub const fn new(queue: QueueService, producer: JobProducer) -> Self {
        Self { queue, producer }
    }
}

/// Build the service router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route(
            "/queue/jobs",
            get(handlers::list_jobs).post(handlers::create_job),
        )
        .route("/queue/jobs/{id}", get(handlers::get_job))
        .route("/queue/jobs/{id}/position", get(handlers::job_position))
        .route("/queue/jobs/{id}/claim", post(handlers::claim_job))
        .route("/queue/jobs/{id}/process", post(handlers::process_job))
        .route("/queue/jobs/{id}/complete", post(handlers::complete_job))
        .route("/queue/jobs/{id}/cancel", post(handlers::cancel_job))
        .route("/queue/jobs/{id}/retry", post(handlers::retry_job))
        .route("/queue/stats", get(handlers::queue_stats))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
