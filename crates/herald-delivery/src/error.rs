//! Error types for pipeline stages and webhook delivery.
//!
//! Every error is classified as retryable or not. Queues redeliver messages
//! whose handler failed with a retryable error and drop the rest.

use std::time::Duration;

use chrono::{DateTime, Utc};
use herald_core::CoreError;
use thiserror::Error;

/// Result type alias for delivery operations.
pub type Result<T> = std::result::Result<T, DeliveryError>;

/// Failures raised while moving a change through the pipeline.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// Network-level connectivity failure.
    #[error("network connection failed: {message}")]
    Network {
        /// Error message describing the network failure
        message: String,
    },

    /// HTTP request timeout exceeded.
    #[error("request timeout after {timeout_seconds}s")]
    Timeout {
        /// Number of seconds before the request timed out
        timeout_seconds: u64,
    },

    /// Endpoint answered with a status that is neither success nor discard.
    #[error("unexpected status: HTTP {status_code}")]
    UnexpectedStatus {
        /// HTTP status code
        status_code: u16,
        /// Response body content (truncated)
        body: String,
    },

    /// URL or data templating failed.
    #[error("template error: {message}")]
    Template {
        /// What could not be rendered
        message: String,
    },

    /// Queue push or pull failed.
    #[error("queue error: {message}")]
    Queue {
        /// Queue error message
        message: String,
    },

    /// Envelope could not be encoded or decoded.
    #[error("serialization error: {message}")]
    Serialization {
        /// Serializer error message
        message: String,
    },

    /// A stage invocation ran past its deadline.
    #[error("{stage} stage exceeded its {timeout:?} deadline")]
    DeadlineExceeded {
        /// Stage name
        stage: &'static str,
        /// Deadline that was hit
        timeout: Duration,
    },

    /// The ledger holds the pair back until a backoff window closes.
    #[error("delivery deferred until {until}")]
    Deferred {
        /// Earliest time the next attempt may run
        until: DateTime<Utc>,
    },

    /// Repository failure.
    #[error("storage error: {0}")]
    Storage(CoreError),

    /// Invalid client or pipeline configuration.
    #[error("invalid configuration: {message}")]
    Configuration {
        /// Configuration error message
        message: String,
    },

    /// Workers did not stop within the shutdown timeout.
    #[error("shutdown timed out after {timeout:?}")]
    ShutdownTimeout {
        /// Timeout that elapsed
        timeout: Duration,
    },

    /// A worker or fan-out task panicked.
    #[error("worker {worker_id} panicked: {error}")]
    WorkerPanic {
        /// Worker or task index
        worker_id: usize,
        /// Panic message
        error: String,
    },
}

impl DeliveryError {
    /// Creates a network error from a message.
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network { message: message.into() }
    }

    /// Creates a timeout error.
    pub fn timeout(timeout_seconds: u64) -> Self {
        Self::Timeout { timeout_seconds }
    }

    /// Creates an unexpected status error from an HTTP response.
    pub fn unexpected_status(status_code: u16, body: impl Into<String>) -> Self {
        Self::UnexpectedStatus { status_code, body: body.into() }
    }

    /// Creates a template error.
    pub fn template(message: impl Into<String>) -> Self {
        Self::Template { message: message.into() }
    }

    /// Creates a queue error.
    pub fn queue(message: impl Into<String>) -> Self {
        Self::Queue { message: message.into() }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Creates a deadline error for a stage.
    pub fn deadline_exceeded(stage: &'static str, timeout: Duration) -> Self {
        Self::DeadlineExceeded { stage, timeout }
    }

    /// Determines if the failed message should be redelivered.
    ///
    /// Transport failures, unexpected statuses, deadlines and transient
    /// storage failures are retryable. Malformed messages, templates and
    /// configuration problems are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network { .. }
            | Self::Timeout { .. }
            | Self::UnexpectedStatus { .. }
            | Self::Queue { .. }
            | Self::DeadlineExceeded { .. }
            | Self::Deferred { .. } => true,

            Self::Storage(error) => error.is_retryable(),

            Self::Template { .. }
            | Self::Serialization { .. }
            | Self::Configuration { .. }
            | Self::ShutdownTimeout { .. }
            | Self::WorkerPanic { .. } => false,
        }
    }

    /// Time before which redelivery is pointless, if known.
    pub fn not_before(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Deferred { until } => Some(*until),
            _ => None,
        }
    }

    /// HTTP status the endpoint answered with, if any.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::UnexpectedStatus { status_code, .. } => Some(*status_code),
            _ => None,
        }
    }
}

impl From<CoreError> for DeliveryError {
    fn from(error: CoreError) -> Self {
        match error {
            CoreError::Callback(inner) => match inner.downcast::<DeliveryError>() {
                Ok(delivery) => *delivery,
                Err(other) => Self::network(other.to_string()),
            },
            CoreError::RetryNotDue { until } => Self::Deferred { until },
            CoreError::InvalidWildcard(e) => Self::template(e.to_string()),
            other => Self::Storage(other),
        }
    }
}

impl From<serde_json::Error> for DeliveryError {
    fn from(error: serde_json::Error) -> Self {
        Self::Serialization { message: error.to_string() }
    }
}

#[cfg(test)]
mod tests {
    use herald_core::error::BoxError;

    use super::*;

    #[test]
    fn retryable_errors_identified_correctly() {
        assert!(DeliveryError::network("connection refused").is_retryable());
        assert!(DeliveryError::timeout(30).is_retryable());
        assert!(DeliveryError::unexpected_status(503, "unavailable").is_retryable());
        assert!(DeliveryError::deadline_exceeded("spread", Duration::from_secs(1)).is_retryable());
        assert!(DeliveryError::Storage(CoreError::Database("gone".into())).is_retryable());

        assert!(!DeliveryError::template("unknown wildcard").is_retryable());
        assert!(!DeliveryError::configuration("bad method").is_retryable());
        assert!(!DeliveryError::Storage(CoreError::invalid_input("nope")).is_retryable());
    }

    #[test]
    fn callback_errors_unwrap_to_delivery_errors() {
        let boxed: BoxError = Box::new(DeliveryError::unexpected_status(500, "boom"));
        let error = DeliveryError::from(CoreError::Callback(boxed));

        assert_eq!(error.status_code(), Some(500));
    }

    #[test]
    fn retry_not_due_becomes_deferred() {
        let until = Utc::now();
        let error = DeliveryError::from(CoreError::RetryNotDue { until });

        assert_eq!(error.not_before(), Some(until));
        assert!(error.is_retryable());
    }

    #[test]
    fn error_display_format() {
        assert_eq!(DeliveryError::timeout(30).to_string(), "request timeout after 30s");
        assert_eq!(
            DeliveryError::unexpected_status(418, "").to_string(),
            "unexpected status: HTTP 418"
        );
    }
}
