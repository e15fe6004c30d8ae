//! Health check handler for service monitoring.

use std::time::Instant;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use herald_core::storage::Storage;
use serde::Serialize;
use tracing::{debug, error, instrument};

use crate::AppState;

/// Health check response structure.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Overall service health status
    pub status: HealthStatus,
    /// Timestamp when health check was performed
    pub timestamp: DateTime<Utc>,
    /// Individual component health checks
    pub checks: HealthChecks,
    /// Service version information
    pub version: String,
}

/// Overall health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// All systems operational
    Healthy,
    /// Critical systems failing
    Unhealthy,
}

/// Individual component health check results.
#[derive(Debug, Serialize)]
pub struct HealthChecks {
    /// Storage backend reachability
    pub storage: ComponentHealth,
}

/// Health status for individual components.
#[derive(Debug, Serialize)]
pub struct ComponentHealth {
    /// Component status
    pub status: ComponentStatus,
    /// Backend name
    pub backend: &'static str,
    /// Optional error message if unhealthy
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Response time in milliseconds
    pub response_time_ms: u64,
}

/// Component-level health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    /// Component is healthy
    Up,
    /// Component is experiencing issues
    Down,
}

/// Reports storage reachability. Returns 503 when the backend is down.
#[instrument(name = "health_check", skip(app_state))]
pub async fn health_check(State(app_state): State<AppState>) -> Response {
    let storage = check_storage(&app_state.storage).await;
    let status = match storage.status {
        ComponentStatus::Up => HealthStatus::Healthy,
        ComponentStatus::Down => HealthStatus::Unhealthy,
    };

    let response = HealthResponse {
        status,
        timestamp: app_state.clock.now(),
        checks: HealthChecks { storage },
        version: env!("CARGO_PKG_VERSION").to_string(),
    };

    let status_code = match response.status {
        HealthStatus::Healthy => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    debug!(
        status = ?response.status,
        storage_status = ?response.checks.storage.status,
        "Health check completed"
    );

    (status_code, Json(response)).into_response()
}

async fn check_storage(storage: &Storage) -> ComponentHealth {
    let started = Instant::now();
    let result = storage.health_check().await;
    let response_time_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

    match result {
        Ok(()) => ComponentHealth {
            status: ComponentStatus::Up,
            backend: storage.backend(),
            message: None,
            response_time_ms,
        },
        Err(e) => {
            error!("Storage health check failed: {}", e);
            ComponentHealth {
                status: ComponentStatus::Down,
                backend: storage.backend(),
                message: Some(format!("Storage unavailable: {e}")),
                response_time_ms,
            }
        },
    }
}
