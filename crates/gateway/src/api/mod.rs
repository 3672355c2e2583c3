//! REST handlers, one module per resource, sharing the domain-error →
//! HTTP mapping below.

pub mod media;
pub mod meta;
pub mod preview;
pub mod sessions;
pub mod templates;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde_json::json;

use cf_domain::Error;

use crate::limits::rules::reject_429;

/// Wrapper so handlers can `?` domain errors straight into responses.
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match &self.0 {
            Error::Invalid(msg) => api_error(StatusCode::BAD_REQUEST, msg),
            Error::NotFound(msg) => api_error(StatusCode::NOT_FOUND, msg),
            Error::Forbidden(msg) => api_error(StatusCode::FORBIDDEN, msg),
            Error::Conflict(msg) => api_error(StatusCode::CONFLICT, msg),
            Error::RateLimited { retry_after } => reject_429(*retry_after),
            Error::Config(msg) => api_error(StatusCode::BAD_REQUEST, msg),
            other => {
                tracing::error!(error = %other, "internal error");
                api_error(StatusCode::INTERNAL_SERVER_ERROR, "internal server error")
            }
        }
    }
}

/// `{ "detail": "<message>" }` with the given status.
pub fn api_error(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "detail": message.into() }))).into_response()
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;
