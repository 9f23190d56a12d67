//! HTTP mapping of queue errors.

use crate::error::QueueError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::error;

impl QueueError {
    /// Status code reported for this error.
    #[must_use]
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::InvalidTransition { .. }
            | Self::AlreadyClaimed
            | Self::NotClaimedByActor
            | Self::Superseded { .. } => StatusCode::CONFLICT,
            Self::PermissionDenied(_) => StatusCode::FORBIDDEN,
            Self::RetryTooSoon { .. } | Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Corrupt(_) | Self::Storage(_) | Self::Payload(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for QueueError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(error = %self, "Queue operation failed");
            "internal error".to_string()
        } else {
            self.to_string()
        };

        let mut body = json!({
            "success": false,
            "error": self.code(),
            "message": message,
        });
        match &self {
            Self::RetryTooSoon { remaining } => {
                body["retry_after_seconds"] = json!(remaining.num_seconds().max(0));
            }
            Self::Superseded { successor } => {
                body["successor_id"] = json!(successor.to_string());
            }
            _ => {}
        }

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::JobStatus;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            QueueError::NotFound("x".to_string()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            QueueError::InvalidTransition {
                from: JobStatus::Completed,
                to: JobStatus::Processing
            }
            .status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(QueueError::AlreadyClaimed.status_code(), StatusCode::CONFLICT);
        assert_eq!(QueueError::NotClaimedByActor.status_code(), StatusCode::CONFLICT);
        assert_eq!(
            QueueError::denied("no").status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            QueueError::RetryTooSoon {
                remaining: chrono::Duration::hours(1)
            }
            .status_code(),
            StatusCode::BAD_REQUEST
        );
    }
}
