//! # Dispatch Abstraction Layer
//!
//! Trait and implementations for issuing task HTTP requests.
//!
//! ## Overview
//!
//! The executor never talks to `reqwest` directly; it goes through the
//! [`Dispatcher`] trait so the whole engine can run against a scripted
//! in-process backend:
//!
//! | Dispatcher | Use case |
//! |-----------|----------|
//! | `http` | Production dispatch via a shared `reqwest::Client` |
//! | `mock` | Tests and `workflow run --local`: scripted responses, request log |
//!
//! Use [`create_dispatcher`] to instantiate one by name.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, instrument};

// ============================================================================
// REQUEST / RESPONSE TYPES
// ============================================================================

/// One HTTP request as assembled by the task executor.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub method: String,
    pub url: String,
    /// JSON body for non-GET/HEAD methods.
    pub body: Option<Value>,
    /// Effective per-attempt timeout.
    pub timeout: Duration,
}

/// Raw response: status, content type, body bytes. Interpretation is the
/// response handlers' job.
#[derive(Debug, Clone)]
pub struct DispatchResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

impl DispatchResponse {
    pub fn json(status: u16, value: &Value) -> Self {
        Self {
            status,
            content_type: Some("application/json".into()),
            body: serde_json::to_vec(value).unwrap_or_default(),
        }
    }
}

/// Transport-level dispatch failure.
#[derive(Error, Debug, Clone)]
pub enum DispatchError {
    #[error("request timed out")]
    Timeout,
    #[error("transport error: {0}")]
    Transport(String),
}

// ============================================================================
// DISPATCHER TRAIT
// ============================================================================

/// Seam between the executor and the network.
///
/// Implementations must honor `request.timeout` and be safe to share
/// across concurrently executing steps.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Dispatcher name ("http", "mock").
    fn name(&self) -> &str;

    async fn dispatch(&self, request: DispatchRequest) -> Result<DispatchResponse, DispatchError>;
}

/// Create a dispatcher by name.
pub fn create_dispatcher(name: &str) -> Result<Arc<dyn Dispatcher>, crate::error::EngineError> {
    match name.to_lowercase().as_str() {
        "http" => Ok(Arc::new(HttpDispatcher::new())),
        "mock" => Ok(Arc::new(MockDispatcher::echo())),
        other => Err(crate::error::EngineError::other(format!(
            "unknown dispatcher '{other}'. Available: http, mock"
        ))),
    }
}

// ============================================================================
// HTTP DISPATCHER (reqwest)
// ============================================================================

/// Production dispatcher backed by a shared connection pool.
pub struct HttpDispatcher {
    client: reqwest::Client,
}

impl HttpDispatcher {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .redirect(reqwest::redirect::Policy::limited(5))
            .user_agent("strata/0.1")
            .build()
            .expect("Failed to build HTTP client");
        Self { client }
    }
}

impl Default for HttpDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Dispatcher for HttpDispatcher {
    fn name(&self) -> &str {
        "http"
    }

    #[instrument(skip(self, request), fields(method = %request.method, url = %request.url))]
    async fn dispatch(&self, request: DispatchRequest) -> Result<DispatchResponse, DispatchError> {
        // Reject malformed or non-HTTP URLs before they reach the pool.
        let parsed = url::Url::parse(&request.url)
            .map_err(|e| DispatchError::Transport(format!("invalid URL '{}': {e}", request.url)))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(DispatchError::Transport(format!(
                "unsupported URL scheme '{}'",
                parsed.scheme()
            )));
        }

        let method: reqwest::Method = request
            .method
            .to_uppercase()
            .parse()
            .map_err(|_| DispatchError::Transport(format!("invalid method '{}'", request.method)))?;

        let mut builder = self
            .client
            .request(method, &request.url)
            .timeout(request.timeout);
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                DispatchError::Timeout
            } else {
                DispatchError::Transport(e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        let body = response
            .bytes()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    DispatchError::Timeout
                } else {
                    DispatchError::Transport(e.to_string())
                }
            })?
            .to_vec();

        debug!(status, bytes = body.len(), "dispatch complete");
        Ok(DispatchResponse {
            status,
            content_type,
            body,
        })
    }
}

// ============================================================================
// MOCK DISPATCHER
// ============================================================================

/// Scripted response for one matched request.
#[derive(Debug, Clone)]
pub struct MockResponse {
    pub status: u16,
    pub content_type: String,
    pub body: Vec<u8>,
    /// Artificial latency before responding.
    pub delay: Duration,
    /// Simulate a transport failure instead of responding.
    pub transport_error: bool,
}

impl MockResponse {
    pub fn json(status: u16, value: Value) -> Self {
        Self {
            status,
            content_type: "application/json".into(),
            body: serde_json::to_vec(&value).unwrap_or_default(),
            delay: Duration::ZERO,
            transport_error: false,
        }
    }

    pub fn binary(content_type: &str, body: Vec<u8>) -> Self {
        Self {
            status: 200,
            content_type: content_type.into(),
            body,
            delay: Duration::ZERO,
            transport_error: false,
        }
    }

    pub fn transport_error() -> Self {
        Self {
            status: 0,
            content_type: String::new(),
            body: Vec::new(),
            delay: Duration::ZERO,
            transport_error: true,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// In-process dispatcher for tests and local runs.
///
/// Responses are scripted per `"METHOD url"` key and consumed in FIFO
/// order; once a queue drains (or for unscripted routes) the dispatcher
/// falls back to echoing the request body, which is what `run --local`
/// relies on. Every request is recorded.
pub struct MockDispatcher {
    routes: DashMap<String, VecDeque<MockResponse>>,
    log: Mutex<Vec<DispatchRequest>>,
    echo_fallback: bool,
}

impl MockDispatcher {
    /// Strict mock: unscripted requests get a 404.
    pub fn new() -> Self {
        Self {
            routes: DashMap::new(),
            log: Mutex::new(Vec::new()),
            echo_fallback: false,
        }
    }

    /// Mock that echoes the request body for unscripted routes.
    pub fn echo() -> Self {
        Self {
            echo_fallback: true,
            ..Self::new()
        }
    }

    fn key(method: &str, url: &str) -> String {
        format!("{} {}", method.to_uppercase(), url)
    }

    /// Queue a response for a method + URL pair.
    pub fn enqueue(&self, method: &str, url: &str, response: MockResponse) {
        self.routes
            .entry(Self::key(method, url))
            .or_default()
            .push_back(response);
    }

    /// All requests seen so far, in arrival order.
    pub fn requests(&self) -> Vec<DispatchRequest> {
        self.log.lock().map(|l| l.clone()).unwrap_or_default()
    }

    /// Number of requests issued to a given URL (any method).
    pub fn hits(&self, url: &str) -> usize {
        self.requests().iter().filter(|r| r.url == url).count()
    }
}

impl Default for MockDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Dispatcher for MockDispatcher {
    fn name(&self) -> &str {
        "mock"
    }

    async fn dispatch(&self, request: DispatchRequest) -> Result<DispatchResponse, DispatchError> {
        if let Ok(mut log) = self.log.lock() {
            log.push(request.clone());
        }

        let scripted = self
            .routes
            .get_mut(&Self::key(&request.method, &request.url))
            .and_then(|mut queue| queue.pop_front());

        let Some(response) = scripted else {
            if self.echo_fallback {
                let body = request.body.clone().unwrap_or(Value::Object(Default::default()));
                return Ok(DispatchResponse::json(200, &body));
            }
            return Ok(DispatchResponse {
                status: 404,
                content_type: Some("application/json".into()),
                body: br#"{"error": "no scripted response"}"#.to_vec(),
            });
        };

        if !response.delay.is_zero() {
            // Honors the per-attempt timeout the way a slow server would.
            if response.delay >= request.timeout {
                tokio::time::sleep(request.timeout).await;
                return Err(DispatchError::Timeout);
            }
            tokio::time::sleep(response.delay).await;
        }

        if response.transport_error {
            return Err(DispatchError::Transport("connection reset by mock".into()));
        }

        Ok(DispatchResponse {
            status: response.status,
            content_type: Some(response.content_type),
            body: response.body,
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================
