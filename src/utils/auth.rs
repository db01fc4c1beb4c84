use std::sync::Arc;

use axum::Json;
use axum::body::Body;
use axum::extract::{FromRequestParts, Request, State};
use axum::http::{self, StatusCode, request::Parts};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use sha2::{Digest, Sha256};

use crate::controller::BaseError;
use crate::service::app_state::AppState;

pub const ORGANIZATION_HEADER: &str = "x-organization-id";
pub const PROJECTS_HEADER: &str = "x-project-ids";

#[derive(Debug)]
pub enum AuthError {
    Empty,
    Invalid,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, error_code, error_message) = match self {
            AuthError::Empty => (
                StatusCode::UNAUTHORIZED,
                1003,
                "header Authorization is needed",
            ),
            AuthError::Invalid => (StatusCode::UNAUTHORIZED, 1003, "admin token invalid"),
        };
        let body = Json(json!({
            "code": error_code,
            "msg": error_message,
        }));
        (status, body).into_response()
    }
}

fn bearer_token(req: &Request) -> Option<&str> {
    let auth_header = req.headers().get(http::header::AUTHORIZATION)?.to_str().ok()?;
    let mut parts = auth_header.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some(scheme), Some(token)) if scheme.eq_ignore_ascii_case("bearer") => Some(token),
        _ => None,
    }
}

/// Compares digests so the check does not short-circuit on the first differing byte.
fn token_matches(presented: &str, expected: &str) -> bool {
    !expected.is_empty() && Sha256::digest(presented.as_bytes()) == Sha256::digest(expected.as_bytes())
}

/// Guards the provider administration routes with the configured admin bearer token.
pub async fn admin_access_middleware(
    State(app_state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Result<Response<Body>, AuthError> {
    let token = bearer_token(&req).ok_or(AuthError::Empty)?;
    if !token_matches(token, app_state.admin_token()) {
        return Err(AuthError::Invalid);
    }
    Ok(next.run(req).await)
}

/// Organization and projects of the caller, as asserted by the upstream authentication layer.
#[derive(Debug, Clone, PartialEq)]
pub struct CallerIdentity {
    pub organization_id: i64,
    pub project_ids: Vec<i64>,
}

impl CallerIdentity {
    fn from_parts(parts: &Parts, default_organization_id: i64) -> Result<Self, BaseError> {
        let header = |name: &str| {
            parts
                .headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
        };
        let organization_id = match header(ORGANIZATION_HEADER) {
            Some(raw) => raw
                .parse::<i64>()
                .map_err(|_| BaseError::ParamInvalid(Some(format!("invalid organization id '{}'", raw))))?,
            None => default_organization_id,
        };
        let project_ids = match header(PROJECTS_HEADER) {
            Some(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(|p| {
                    p.parse::<i64>()
                        .map_err(|_| BaseError::ParamInvalid(Some(format!("invalid project id '{}'", p))))
                })
                .collect::<Result<Vec<_>, _>>()?,
            None => Vec::new(),
        };
        Ok(CallerIdentity { organization_id, project_ids })
    }
}

impl FromRequestParts<Arc<AppState>> for CallerIdentity {
    type Rejection = BaseError;

    async fn from_request_parts(parts: &mut Parts, state: &Arc<AppState>) -> Result<Self, Self::Rejection> {
        CallerIdentity::from_parts(parts, state.default_organization_id())
    }
}
