use axum::{
    Json,
    response::{IntoResponse, Response},
};
use reqwest::StatusCode;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BaseError {
    #[error("invalid request: {}", .0.as_deref().unwrap_or("request params invalid"))]
    ParamInvalid(Option<String>),
    #[error("conflict: {}", .0.as_deref().unwrap_or("some unique keys have conflicted"))]
    Conflict(Option<String>),
    #[error("not found: {}", .0.as_deref().unwrap_or("data not found"))]
    NotFound(Option<String>),
    #[error("model not found: {}", .0.as_deref().unwrap_or("model not found"))]
    ModelNotFound(Option<String>),
    #[error("unauthorized: {}", .0.as_deref().unwrap_or("Unauthorized"))]
    Unauthorized(Option<String>),
    #[error("configuration error: {}", .0.as_deref().unwrap_or("platform configuration missing"))]
    Configuration(Option<String>),
    #[error("database error: {}", .0.as_deref().unwrap_or("database unknown error"))]
    DatabaseFatal(Option<String>),
    #[error("inference error (status {status:?}): {body}")]
    Inference { status: Option<u16>, body: String },
    #[error("internal error: {}", .0.as_deref().unwrap_or("internal server error"))]
    InternalServerError(Option<String>),
}

impl From<diesel::result::Error> for BaseError {
    fn from(err: diesel::result::Error) -> Self {
        BaseError::DatabaseFatal(Some(err.to_string()))
    }
}

impl BaseError {
    /// Stable code reported to clients alongside the message.
    pub fn code(&self) -> u32 {
        match self {
            BaseError::ParamInvalid(_) => 1001,
            BaseError::NotFound(_) => 1002,
            BaseError::Unauthorized(_) => 1003,
            BaseError::ModelNotFound(_) => 1004,
            BaseError::DatabaseFatal(_) => 1100,
            BaseError::Conflict(_) => 1101,
            BaseError::Configuration(_) => 1300,
            BaseError::Inference { .. } => 1400,
            BaseError::InternalServerError(_) => 1500,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            BaseError::ParamInvalid(_) => StatusCode::BAD_REQUEST,
            BaseError::Conflict(_) => StatusCode::CONFLICT,
            BaseError::NotFound(_) | BaseError::ModelNotFound(_) => StatusCode::NOT_FOUND,
            BaseError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            BaseError::Inference { status, .. } => status
                .and_then(|s| StatusCode::from_u16(s).ok())
                .filter(|s| s.is_client_error() || s.is_server_error())
                .unwrap_or(StatusCode::BAD_GATEWAY),
            BaseError::Configuration(_)
            | BaseError::DatabaseFatal(_)
            | BaseError::InternalServerError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn message(self) -> String {
        match self {
            BaseError::ParamInvalid(msg) => msg.unwrap_or("request params invalid".to_string()),
            BaseError::Conflict(msg) => msg.unwrap_or("some unique keys have conflicted".to_string()),
            BaseError::NotFound(msg) => msg.unwrap_or("data not found".to_string()),
            BaseError::ModelNotFound(msg) => msg.unwrap_or("model not found".to_string()),
            BaseError::Unauthorized(msg) => msg.unwrap_or("Unauthorized".to_string()),
            BaseError::Configuration(msg) => {
                msg.unwrap_or("platform configuration missing".to_string())
            }
            BaseError::DatabaseFatal(msg) => msg.unwrap_or("database unknown error".to_string()),
            BaseError::Inference { body, .. } => body,
            BaseError::InternalServerError(msg) => {
                msg.unwrap_or("internal server error".to_string())
            }
        }
    }
}

impl IntoResponse for BaseError {
    fn into_response(self) -> Response {
        let status = self.status();
        let error_code = self.code();
        let error_message = self.message();
        let body = Json(json!({
            "code": error_code,
            "msg": error_message,
        }));
        (status, body).into_response()
    }
}
