//! Error taxonomy shared by the domain model and the repositories.
//!
//! Every variant carries a stable code so administrative callers and log
//! pipelines can tell failures apart without parsing messages.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::wildcard::WildcardError;

/// Result type alias using `CoreError`.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Boxed error returned by deliver callbacks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Core error type for domain and storage operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Resource, subscription or document absent.
    #[error("[E1001] not found: {0}")]
    NotFound(String),

    /// Create-time conflict on id or route.
    #[error("[E1002] already exists: {0}")]
    AlreadyExists(String),

    /// Malformed template rejected at create time.
    #[error("[E1003] invalid wildcard: {0}")]
    InvalidWildcard(#[from] WildcardError),

    /// Revision could not be derived from the change field.
    #[error("[E1004] format not supported: {0}")]
    FormatNotSupported(String),

    /// Any other rejected input.
    #[error("[E1005] invalid input: {0}")]
    InvalidInput(String),

    /// A previous delivery failed and its backoff window is still open.
    #[error("[E2001] retry not due until {until}")]
    RetryNotDue {
        /// Earliest time the next attempt may run
        until: DateTime<Utc>,
    },

    /// The deliver callback handed to the ledger failed.
    #[error("[E2002] deliver callback failed: {0}")]
    Callback(BoxError),

    /// Storage backend failure.
    #[error("[E3001] database error: {0}")]
    Database(String),
}

impl CoreError {
    /// Creates a not-found error for the given entity description.
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// Creates an already-exists error for the given entity description.
    pub fn already_exists(what: impl Into<String>) -> Self {
        Self::AlreadyExists(what.into())
    }

    /// Creates an invalid-input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    /// Returns the stable error code.
    pub const fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "E1001",
            Self::AlreadyExists(_) => "E1002",
            Self::InvalidWildcard(_) => "E1003",
            Self::FormatNotSupported(_) => "E1004",
            Self::InvalidInput(_) => "E1005",
            Self::RetryNotDue { .. } => "E2001",
            Self::Callback(_) => "E2002",
            Self::Database(_) => "E3001",
        }
    }

    /// Returns whether redelivering the triggering message may succeed.
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::RetryNotDue { .. } | Self::Callback(_) | Self::Database(_))
    }

    /// Returns true for `NotFound`.
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound("requested entity not found".to_string()),
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                Self::AlreadyExists(format!("unique constraint violation: {db_err}"))
            },
            sqlx::Error::Database(db_err) if db_err.is_foreign_key_violation() => {
                Self::NotFound(format!("referenced entity missing: {db_err}"))
            },
            _ => Self::Database(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidInput(format!("malformed JSON column: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_are_stable() {
        assert_eq!(CoreError::not_found("resource").code(), "E1001");
        assert_eq!(CoreError::already_exists("resource").code(), "E1002");
        assert_eq!(CoreError::from(WildcardError::Missing).code(), "E1003");
        assert_eq!(CoreError::FormatNotSupported("x".into()).code(), "E1004");
        assert_eq!(CoreError::Database("down".into()).code(), "E3001");
    }

    #[test]
    fn retryable_errors_identified() {
        assert!(CoreError::Database("connection reset".into()).is_retryable());
        assert!(CoreError::RetryNotDue { until: Utc::now() }.is_retryable());
        assert!(CoreError::Callback("boom".into()).is_retryable());

        assert!(!CoreError::not_found("subscription").is_retryable());
        assert!(!CoreError::already_exists("resource").is_retryable());
        assert!(!CoreError::FormatNotSupported("array".into()).is_retryable());
    }

    #[test]
    fn sqlx_row_not_found_maps_to_not_found() {
        let err = CoreError::from(sqlx::Error::RowNotFound);
        assert!(err.is_not_found());
    }
}
