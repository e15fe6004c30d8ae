//! HTTP client for webhook notifications with configurable timeouts.
//!
//! Handles request construction, response capture and transport error
//! categorization. Status classification happens in
//! [`notification`](crate::notification), since it depends on the
//! subscription's delivery policy.

use std::{collections::BTreeMap, time::Duration};

use bytes::Bytes;
use herald_core::{Action, DocumentId, SubscriptionId};
use reqwest::{Method, Response};
use serde::{Deserialize, Serialize};
use tracing::{info_span, Instrument};

use crate::error::{DeliveryError, Result};

/// Header carrying the delivered action.
pub const ACTION_HEADER: &str = "X-Herald-Action";

/// Header carrying the subscription id.
pub const SUBSCRIPTION_HEADER: &str = "X-Herald-Subscription-Id";

/// Header carrying the document revision.
pub const REVISION_HEADER: &str = "X-Herald-Revision";

const MAX_RESPONSE_BODY_SIZE: usize = 64 * 1024;
const MAX_AUDIT_SIZE: usize = 1024;

/// Configuration for the notification client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Timeout for one HTTP request.
    pub timeout: Duration,
    /// User agent string for requests.
    pub user_agent: String,
    /// Maximum number of redirects to follow.
    pub max_redirects: u32,
    /// Whether to verify TLS certificates.
    pub verify_tls: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(crate::DEFAULT_TIMEOUT_SECONDS),
            user_agent: "Herald-Notifier/1.0".to_string(),
            max_redirects: 3,
            verify_tls: true,
        }
    }
}

/// Fully rendered outbound notification.
#[derive(Debug, Clone)]
pub struct NotificationRequest {
    /// Subscription being notified.
    pub subscription_id: SubscriptionId,
    /// Document the change is about.
    pub document_id: DocumentId,
    /// Action after ledger resolution.
    pub action: Action,
    /// Revision carried by the notification.
    pub revision: i64,
    /// Final URL, wildcards replaced.
    pub url: String,
    /// HTTP method.
    pub method: String,
    /// Endpoint headers.
    pub headers: BTreeMap<String, String>,
    /// JSON body.
    pub body: Bytes,
}

/// Response captured from an endpoint.
#[derive(Debug, Clone)]
pub struct DeliveryResponse {
    /// HTTP status code.
    pub status_code: u16,
    /// Response body (limited size).
    pub body: String,
    /// Total duration of the request.
    pub duration: Duration,
}

/// HTTP client shared by all delivery workers.
///
/// Uses connection pooling so many subscriptions can be notified
/// concurrently over few connections.
#[derive(Debug, Clone)]
pub struct DeliveryClient {
    client: reqwest::Client,
    config: ClientConfig,
}

impl DeliveryClient {
    /// Creates a new client with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Configuration` if the HTTP client cannot be
    /// built with the provided settings.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects as usize))
            .danger_accept_invalid_certs(!config.verify_tls)
            .build()
            .map_err(|e| {
                DeliveryError::configuration(format!("failed to build HTTP client: {e}"))
            })?;

        Ok(Self { client, config })
    }

    /// Creates a new client with default configuration.
    pub fn with_defaults() -> Result<Self> {
        Self::new(ClientConfig::default())
    }

    /// Sends a notification and captures the response.
    ///
    /// Any response counts as `Ok`; the caller decides what the status
    /// means.
    ///
    /// # Errors
    ///
    /// - `Configuration` for a method reqwest rejects
    /// - `Timeout` when the request exceeds the client timeout
    /// - `Network` for every other transport failure
    pub async fn deliver(&self, request: &NotificationRequest) -> Result<DeliveryResponse> {
        let start_time = std::time::Instant::now();

        let span = info_span!(
            "notification",
            subscription_id = %request.subscription_id,
            document_id = %request.document_id,
            action = %request.action,
            revision = request.revision,
            url = %request.url,
        );

        async move {
            tracing::debug!("sending notification");

            let method = Method::from_bytes(request.method.as_bytes()).map_err(|e| {
                DeliveryError::configuration(format!("method `{}`: {e}", request.method))
            })?;

            let mut http_request = self
                .client
                .request(method, &request.url)
                .body(request.body.clone())
                .header("content-type", "application/json");

            for (key, value) in &request.headers {
                if !is_managed_header(key) {
                    http_request = http_request.header(key, value);
                }
            }

            http_request = http_request
                .header(ACTION_HEADER, request.action.as_str())
                .header(SUBSCRIPTION_HEADER, request.subscription_id.to_string())
                .header(REVISION_HEADER, request.revision.to_string());

            let response = match http_request.send().await {
                Ok(response) => response,
                Err(e) => {
                    let duration = start_time.elapsed();
                    tracing::warn!(duration_ms = duration.as_millis(), "request failed: {}", e);

                    if e.is_timeout() {
                        return Err(DeliveryError::timeout(self.config.timeout.as_secs()));
                    }
                    if e.is_connect() {
                        return Err(DeliveryError::network(format!("connection failed: {e}")));
                    }
                    return Err(DeliveryError::network(e.to_string()));
                },
            };

            let duration = start_time.elapsed();
            let response = read_response(response, duration).await;

            tracing::debug!(
                status = response.status_code,
                duration_ms = duration.as_millis(),
                "received response"
            );

            Ok(response)
        }
        .instrument(span)
        .await
    }
}

async fn read_response(response: Response, duration: Duration) -> DeliveryResponse {
    let status_code = response.status().as_u16();

    let body = match response.bytes().await {
        Ok(bytes) if bytes.len() > MAX_RESPONSE_BODY_SIZE => {
            let suffix = "... (truncated)";
            let truncated = String::from_utf8_lossy(&bytes[..MAX_AUDIT_SIZE - suffix.len()]);
            format!("{truncated}{suffix}")
        },
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(e) => {
            tracing::warn!("failed to read response body: {}", e);
            format!("[failed to read response body: {e}]")
        },
    };

    DeliveryResponse { status_code, body, duration }
}

/// Checks if a header is set by the client and must not come from the
/// endpoint configuration.
fn is_managed_header(header_name: &str) -> bool {
    let lowercase = header_name.to_lowercase();
    matches!(
        lowercase.as_str(),
        "content-length"
            | "content-type"
            | "host"
            | "user-agent"
            | "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
            | "x-herald-action"
            | "x-herald-subscription-id"
            | "x-herald-revision"
    )
}
