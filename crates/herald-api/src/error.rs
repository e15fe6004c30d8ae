//! JSON error responses for the administrative API.
//!
//! Every failure is rendered as `{"title": ..., "detail": ...}` with a status
//! derived from the domain error.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use herald_core::CoreError;
use herald_delivery::DeliveryError;
use serde::Serialize;
use tracing::error;

/// Error body returned to API callers.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    /// Short, stable summary.
    pub title: &'static str,
    /// Human-readable explanation.
    pub detail: String,
}

/// Handler error carrying its HTTP status.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    title: &'static str,
    detail: String,
}

impl ApiError {
    /// Creates an error with an explicit status.
    pub fn new(status: StatusCode, title: &'static str, detail: impl Into<String>) -> Self {
        Self { status, title, detail: detail.into() }
    }

    /// 404 for a missing entity.
    pub fn not_found(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "Not Found", detail)
    }

    /// 422 for input that parsed but is not acceptable.
    pub fn unprocessable(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::UNPROCESSABLE_ENTITY, "Unprocessable Entity", detail)
    }

    /// Status code of the response.
    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::NotFound(_) => Self::not_found(err.to_string()),
            CoreError::AlreadyExists(_) => {
                Self::new(StatusCode::CONFLICT, "Conflict", err.to_string())
            },
            CoreError::InvalidWildcard(_)
            | CoreError::FormatNotSupported(_)
            | CoreError::InvalidInput(_) => Self::unprocessable(err.to_string()),
            CoreError::RetryNotDue { .. } | CoreError::Callback(_) | CoreError::Database(_) => {
                error!(error = %err, code = err.code(), "request failed");
                Self::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal Server Error",
                    "the request could not be completed",
                )
            },
        }
    }
}

impl From<DeliveryError> for ApiError {
    fn from(err: DeliveryError) -> Self {
        match err {
            DeliveryError::Storage(core) => core.into(),
            DeliveryError::Template { message } => Self::unprocessable(message),
            other => {
                error!(error = %other, "request failed");
                Self::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal Server Error",
                    "the request could not be completed",
                )
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ErrorBody { title: self.title, detail: self.detail })).into_response()
    }
}

#[cfg(test)]
mod tests {
    use herald_core::wildcard::WildcardError;

    use super::*;

    #[test]
    fn core_errors_map_to_statuses() {
        assert_eq!(ApiError::from(CoreError::not_found("x")).status(), StatusCode::NOT_FOUND);
        assert_eq!(ApiError::from(CoreError::already_exists("x")).status(), StatusCode::CONFLICT);
        assert_eq!(
            ApiError::from(CoreError::from(WildcardError::Missing)).status(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            ApiError::from(CoreError::FormatNotSupported("array".into())).status(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            ApiError::from(CoreError::Database("down".into())).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn delivery_errors_unwrap_storage() {
        let err = DeliveryError::Storage(CoreError::not_found("resource"));
        assert_eq!(ApiError::from(err).status(), StatusCode::NOT_FOUND);
        assert_eq!(
            ApiError::from(DeliveryError::queue("closed")).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
