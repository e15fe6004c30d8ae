//! HTTP mocking for webhook callback endpoints.

use std::{collections::BTreeMap, time::Duration};

use serde_json::Value;
use wiremock::{
    matchers::{header, method, path},
    Mock, MockServer as WiremockServer, ResponseTemplate,
};

/// Mock callback server recording every notification it receives.
pub struct MockServer {
    server: WiremockServer,
}

impl MockServer {
    /// Starts a new mock server on a random port.
    pub async fn start() -> Self {
        Self { server: WiremockServer::start().await }
    }

    /// Base URL of the mock server.
    pub fn url(&self) -> String {
        self.server.uri()
    }

    /// Absolute URL for `path`, which may contain wildcards.
    pub fn endpoint_url(&self, path: &str) -> String {
        format!("{}{path}", self.server.uri())
    }

    /// Mounts an endpoint.
    pub async fn mock_endpoint(&self, endpoint: MockEndpoint) {
        let response = match endpoint.response {
            MockResponse::Status(status) => ResponseTemplate::new(status),
            MockResponse::Slow { status, delay } => {
                ResponseTemplate::new(status).set_delay(delay)
            },
        };

        let mut mock = Mock::given(method(endpoint.method.as_str())).and(path(endpoint.path));
        for (key, value) in &endpoint.expected_headers {
            mock = mock.and(header(key.as_str(), value.as_str()));
        }
        let mock = match endpoint.times {
            Some(n) => mock.respond_with(response).up_to_n_times(n),
            None => mock.respond_with(response),
        };

        mock.mount(&self.server).await;
    }

    /// Answers `path` with each status in turn, then `then` forever.
    pub async fn mock_sequence(&self, path: &str, statuses: &[u16], then: u16) {
        for &status in statuses {
            self.mock_endpoint(MockEndpoint::status(path, status).times(1)).await;
        }
        self.mock_endpoint(MockEndpoint::status(path, then)).await;
    }

    /// Answers every POST with `status`.
    pub async fn mock_any(&self, status: u16) {
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(status))
            .mount(&self.server)
            .await;
    }

    /// All requests received so far, oldest first.
    pub async fn received_requests(&self) -> Vec<RecordedRequest> {
        self.server
            .received_requests()
            .await
            .unwrap_or_default()
            .into_iter()
            .map(|request| RecordedRequest {
                method: request.method.to_string(),
                path: request.url.path().to_string(),
                query: request.url.query().map(str::to_string),
                headers: request
                    .headers
                    .iter()
                    .map(|(name, value)| {
                        (name.as_str().to_string(), value.to_str().unwrap_or_default().to_string())
                    })
                    .collect(),
                body: serde_json::from_slice(&request.body).unwrap_or(Value::Null),
            })
            .collect()
    }

    /// Requests received on `path`.
    pub async fn requests_to(&self, path: &str) -> Vec<RecordedRequest> {
        self.received_requests().await.into_iter().filter(|r| r.path == path).collect()
    }

    /// Asserts that exactly `expected` requests were received.
    pub async fn assert_request_count(&self, expected: usize) {
        let requests = self.received_requests().await;
        assert_eq!(
            requests.len(),
            expected,
            "expected {} requests, received {}: {:?}",
            expected,
            requests.len(),
            requests.iter().map(|r| format!("{} {}", r.method, r.path)).collect::<Vec<_>>()
        );
    }

    /// Forgets received requests and mounted mocks.
    pub async fn reset(&self) {
        self.server.reset().await;
    }
}

/// Configuration for a mock endpoint.
#[derive(Debug, Clone)]
pub struct MockEndpoint {
    /// HTTP method to match.
    pub method: String,
    /// Exact path to match.
    pub path: String,
    /// Headers the request must carry.
    pub expected_headers: BTreeMap<String, String>,
    /// Response to send.
    pub response: MockResponse,
    /// Respond at most this many times.
    pub times: Option<u64>,
}

impl MockEndpoint {
    /// POST endpoint answering 200.
    pub fn success(path: impl Into<String>) -> Self {
        Self::status(path, 200)
    }

    /// POST endpoint answering `status`.
    pub fn status(path: impl Into<String>, status: u16) -> Self {
        Self {
            method: "POST".to_string(),
            path: path.into(),
            expected_headers: BTreeMap::new(),
            response: MockResponse::Status(status),
            times: None,
        }
    }

    /// Matches another method.
    #[must_use]
    pub fn method(mut self, method: impl Into<String>) -> Self {
        self.method = method.into();
        self
    }

    /// Requires a header.
    #[must_use]
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.expected_headers.insert(key.into(), value.into());
        self
    }

    /// Delays the response.
    #[must_use]
    pub fn delayed(mut self, delay: Duration) -> Self {
        let status = match self.response {
            MockResponse::Status(status) | MockResponse::Slow { status, .. } => status,
        };
        self.response = MockResponse::Slow { status, delay };
        self
    }

    /// Limits how many requests this mock answers.
    #[must_use]
    pub fn times(mut self, n: u64) -> Self {
        self.times = Some(n);
        self
    }
}

/// Mock response behaviour.
#[derive(Debug, Clone)]
pub enum MockResponse {
    /// Respond immediately.
    Status(u16),
    /// Respond after a delay.
    Slow {
        /// Status code
        status: u16,
        /// Delay before responding
        delay: Duration,
    },
}

/// Request captured by the mock server.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    /// HTTP method.
    pub method: String,
    /// URL path.
    pub path: String,
    /// Raw query string.
    pub query: Option<String>,
    /// Headers with lower-case names.
    pub headers: BTreeMap<String, String>,
    /// JSON body, `Null` if the body was not JSON.
    pub body: Value,
}

impl RecordedRequest {
    /// Header value by lower-case name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}
