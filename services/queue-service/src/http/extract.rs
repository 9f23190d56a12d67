//! Caller identity extraction.
//!
//! Authentication happens at the gateway, which forwards the verified
//! identity in two headers.

use crate::access::{Actor, Role};
use axum::{
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Header carrying the caller's user id.
pub const ACTOR_ID_HEADER: &str = "x-actor-id";

/// Header carrying the caller's global role.
pub const ACTOR_ROLE_HEADER: &str = "x-actor-role";

/// Why a request has no usable identity.
#[derive(Debug)]
pub enum IdentityRejection {
    /// A required header is absent or empty.
    Missing(&'static str),
    /// The role header names no known role.
    UnknownRole(String),
}

impl IntoResponse for IdentityRejection {
    fn into_response(self) -> Response {
        let message = match self {
            Self::Missing(header) => format!("missing {header} header"),
            Self::UnknownRole(role) => format!("unknown role '{role}'"),
        };
        (
            StatusCode::UNAUTHORIZED,
            Json(json!({
                "success": false,
                "error": "unauthenticated",
                "message": message,
            })),
        )
            .into_response()
    }
}

impl<S> FromRequestParts<S> for Actor
where
    S: Send + Sync,
{
    type Rejection = IdentityRejection;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = |name: &'static str| {
            parts
                .headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .ok_or(IdentityRejection::Missing(name))
        };

        let id = header(ACTOR_ID_HEADER)?.to_string();
        let role = header(ACTOR_ROLE_HEADER)?;
        let role = role
            .parse::<Role>()
            .map_err(|_| IdentityRejection::UnknownRole(role.to_string()))?;

        Ok(Self::new(id, role))
    }
}
