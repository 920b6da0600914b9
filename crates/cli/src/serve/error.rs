//! Error responses.
//!
//! Every failure leaving the API goes through [`ApiError`]; this is the only
//! place error kinds are mapped to status codes.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use strata_core::DomainError;

#[derive(Debug)]
pub(crate) enum ApiError {
    Domain(DomainError),
    /// Body is not JSON or does not match the payload schema.
    InvalidBody(String),
    RouteNotFound,
}

impl From<DomainError> for ApiError {
    fn from(err: DomainError) -> Self {
        ApiError::Domain(err)
    }
}

impl ApiError {
    pub(crate) fn status(&self) -> StatusCode {
        match self {
            ApiError::Domain(err) if err.is_internal() => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Domain(DomainError::AuthenticationRequired) => StatusCode::UNAUTHORIZED,
            ApiError::Domain(DomainError::AuthorizationDenied { .. }) => StatusCode::FORBIDDEN,
            ApiError::Domain(DomainError::NotFound { .. }) => StatusCode::NOT_FOUND,
            ApiError::Domain(_) | ApiError::InvalidBody(_) => StatusCode::BAD_REQUEST,
            ApiError::RouteNotFound => StatusCode::NOT_FOUND,
        }
    }

    pub(crate) fn kind(&self) -> &'static str {
        match self {
            ApiError::Domain(err) => err.kind(),
            ApiError::InvalidBody(_) => "ValidationError",
            ApiError::RouteNotFound => "NotFound",
        }
    }

    fn message(&self) -> String {
        match self {
            ApiError::Domain(err) => err.to_string(),
            ApiError::InvalidBody(msg) => msg.clone(),
            ApiError::RouteNotFound => "no such endpoint".to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self.message(), "internal error");
        }
        let body = serde_json::json!({
            "code": status.as_u16(),
            "error": self.kind(),
            "message": self.message(),
        });
        (status, Json(body)).into_response()
    }
}
