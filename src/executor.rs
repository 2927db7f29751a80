//! Task executor
//!
//! Issues one HTTP request per step: expands the task's URL template with
//! the resolved input, validates the input against the task's schema,
//! dispatches with the effective timeout, and hands the response to the
//! content-type handlers.
//!
//! Retry policy: up to N attempts for 408/429/5xx and transport errors,
//! exponential backoff with full jitter. `retry_count` is the number of
//! failed attempts before the final outcome. A cancellation signal aborts
//! in-flight requests and yields `TaskCancelled`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::config::EngineConfig;
use crate::dispatch::{DispatchError, DispatchRequest, Dispatcher};
use crate::error::StepError;
use crate::registry::RegisteredTask;
use crate::response::{ResponseHandler, ResponseStorage};
use crate::template;

// ============================================================================
// OUTCOME
// ============================================================================

/// Result of executing one step (or one forEach substep).
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub success: bool,
    pub output: Option<Value>,
    pub error: Option<StepError>,
    pub resolved_url: String,
    pub http_method: String,
    pub duration_ms: u64,
    pub retry_count: u32,
}

impl StepOutcome {
    fn failure(error: StepError, url: String, method: String, started: Instant, retries: u32) -> Self {
        Self {
            success: false,
            output: None,
            error: Some(error),
            resolved_url: url,
            http_method: method,
            duration_ms: started.elapsed().as_millis() as u64,
            retry_count: retries,
        }
    }
}

// ============================================================================
// EXECUTOR
// ============================================================================

/// Shared per-engine executor: one dispatcher, one config, process-wide
/// retry accounting.
#[derive(Clone)]
pub struct TaskExecutor {
    dispatcher: Arc<dyn Dispatcher>,
    config: Arc<EngineConfig>,
    /// Total failed attempts per task name, across executions.
    retry_counters: Arc<DashMap<String, u64>>,
}

impl TaskExecutor {
    pub fn new(dispatcher: Arc<dyn Dispatcher>, config: Arc<EngineConfig>) -> Self {
        Self {
            dispatcher,
            config,
            retry_counters: Arc::new(DashMap::new()),
        }
    }

    /// Accumulated failed attempts for a task name.
    pub fn retries_recorded(&self, task: &str) -> u64 {
        self.retry_counters.get(task).map(|c| *c).unwrap_or(0)
    }

    /// Effective timeout: step override, else task default, else engine
    /// default.
    pub fn effective_timeout(
        &self,
        step_override: Option<Duration>,
        task: &RegisteredTask,
    ) -> Duration {
        step_override
            .or_else(|| task.default_timeout())
            .unwrap_or(self.config.default_task_timeout)
    }

    /// Execute one step attempt loop against a registered task.
    #[instrument(skip_all, fields(step = %step_id, task = %task.name))]
    pub async fn execute(
        &self,
        step_id: &str,
        task: &RegisteredTask,
        input: &Map<String, Value>,
        timeout: Duration,
        cancel: &CancellationToken,
        storage: &ResponseStorage,
    ) -> StepOutcome {
        let started = Instant::now();
        let method = task.definition.http.method.to_uppercase();

        // URL template expansion from the resolved input.
        let url = match template::expand_with_map(&task.definition.http.url, input) {
            Ok(url) => url,
            Err(err) => return StepOutcome::failure(err, String::new(), method, started, 0),
        };

        // Schema gate before any network traffic.
        let input_value = Value::Object(input.clone());
        if let Err(err) = task.check_input(&input_value) {
            return StepOutcome::failure(err, url, method, started, 0);
        }

        let body = if matches!(method.as_str(), "GET" | "HEAD") {
            None
        } else {
            Some(input_value)
        };

        let policy = task
            .retry_override
            .clone()
            .unwrap_or_else(|| self.config.retry.clone());
        let max_attempts = policy.max_attempts.max(1);

        // retry_count is the number of failed attempts BEFORE the final
        // outcome: a run that exhausts 3 attempts reports 2.
        let mut failed_attempts = 0u32;

        for attempt in 0..max_attempts {
            if cancel.is_cancelled() {
                return StepOutcome::failure(
                    StepError::TaskCancelled,
                    url,
                    method,
                    started,
                    failed_attempts,
                );
            }

            let request = DispatchRequest {
                method: method.clone(),
                url: url.clone(),
                body: body.clone(),
                timeout,
            };

            let err = match self.attempt(request, timeout, cancel).await {
                Ok(response) if (200..300).contains(&response.status) => {
                    let handler =
                        ResponseHandler::for_content_type(response.content_type.as_deref());
                    return match handler.handle(
                        response.content_type.as_deref(),
                        &response.body,
                        storage,
                    ) {
                        Ok(map) => StepOutcome {
                            success: true,
                            output: Some(Value::Object(map)),
                            error: None,
                            resolved_url: url,
                            http_method: method,
                            duration_ms: started.elapsed().as_millis() as u64,
                            retry_count: failed_attempts,
                        },
                        Err(err) => {
                            StepOutcome::failure(err, url, method, started, failed_attempts)
                        }
                    };
                }
                Ok(response) => StepError::HttpStatus {
                    status: response.status,
                },
                Err(err) => err,
            };

            if matches!(err, StepError::TaskCancelled) || !err.is_retryable() {
                return StepOutcome::failure(err, url, method, started, failed_attempts);
            }

            self.note_failure(&task.name, &err, attempt);

            if attempt + 1 == max_attempts {
                // Attempts exhausted; this failure is the final outcome.
                return StepOutcome::failure(err, url, method, started, failed_attempts);
            }
            failed_attempts += 1;

            let delay = policy.delay_for(attempt);
            debug!(?delay, attempt, "backing off before retry");
            tokio::select! {
                _ = cancel.cancelled() => {
                    return StepOutcome::failure(
                        StepError::TaskCancelled,
                        url,
                        method,
                        started,
                        failed_attempts,
                    );
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }

        // max_attempts >= 1, so the loop always returns.
        StepOutcome::failure(
            StepError::HttpTransport("no attempt made".into()),
            url,
            method,
            started,
            failed_attempts,
        )
    }

    /// One dispatch attempt under timeout + cancellation.
    async fn attempt(
        &self,
        request: DispatchRequest,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<crate::dispatch::DispatchResponse, StepError> {
        tokio::select! {
            _ = cancel.cancelled() => Err(StepError::TaskCancelled),
            result = tokio::time::timeout(timeout, self.dispatcher.dispatch(request)) => {
                match result {
                    Err(_) => Err(StepError::HttpTimeout {
                        timeout_ms: timeout.as_millis() as u64,
                    }),
                    Ok(Err(DispatchError::Timeout)) => Err(StepError::HttpTimeout {
                        timeout_ms: timeout.as_millis() as u64,
                    }),
                    Ok(Err(DispatchError::Transport(detail))) => {
                        Err(StepError::HttpTransport(detail))
                    }
                    Ok(Ok(response)) => Ok(response),
                }
            }
        }
    }

    fn note_failure(&self, task: &str, err: &StepError, attempt: u32) {
        warn!(task, attempt, error = %err, "retryable attempt failure");
        *self.retry_counters.entry(task.to_string()).or_insert(0) += 1;
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{MockDispatcher, MockResponse};
    use crate::registry::TaskRegistry;
    use serde_json::json;

    fn executor_with(mock: Arc<MockDispatcher>) -> TaskExecutor {
        TaskExecutor::new(mock, Arc::new(EngineConfig::testing()))
    }

    fn storage() -> ResponseStorage {
        let dir = std::env::temp_dir().join(format!("strata-exec-test-{}", fastrand::u64(..)));
        ResponseStorage::new(dir, 1024).unwrap()
    }

    fn task(registry: &TaskRegistry, name: &str, url: &str, method: &str) -> Arc<RegisteredTask> {
        let def = serde_json::from_value(json!({
            "http": {"url": url, "method": method},
        }))
        .unwrap();
        registry.register(name, def).unwrap();
        registry.get(name).unwrap()
    }

    fn input(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[tokio::test]
    async fn success_with_url_expansion() {
        let mock = Arc::new(MockDispatcher::new());
        mock.enqueue(
            "GET",
            "http://t/users/u-1",
            MockResponse::json(200, json!({"name": "ada"})),
        );

        let registry = TaskRegistry::new();
        let task = task(&registry, "get-user", "http://t/users/{{ id }}", "GET");
        let exec = executor_with(Arc::clone(&mock));
        let st = storage();

        let outcome = exec
            .execute(
                "fetch",
                &task,
                &input(&[("id", json!("u-1"))]),
                Duration::from_secs(1),
                &CancellationToken::new(),
                &st,
            )
            .await;

        assert!(outcome.success);
        assert_eq!(outcome.resolved_url, "http://t/users/u-1");
        assert_eq!(outcome.http_method, "GET");
        assert_eq!(outcome.retry_count, 0);
        assert_eq!(outcome.output, Some(json!({"name": "ada"})));
        // GET carries no body
        assert!(mock.requests()[0].body.is_none());
    }

    #[tokio::test]
    async fn post_sends_resolved_input_as_body() {
        let mock = Arc::new(MockDispatcher::echo());
        let registry = TaskRegistry::new();
        let task = task(&registry, "charge", "http://t/charge", "POST");
        let exec = executor_with(Arc::clone(&mock));
        let st = storage();

        let outcome = exec
            .execute(
                "pay",
                &task,
                &input(&[("amount", json!(5))]),
                Duration::from_secs(1),
                &CancellationToken::new(),
                &st,
            )
            .await;

        assert!(outcome.success);
        assert_eq!(mock.requests()[0].body, Some(json!({"amount": 5})));
        assert_eq!(outcome.output, Some(json!({"amount": 5})));
    }

    #[tokio::test]
    async fn retries_on_5xx_then_succeeds() {
        let mock = Arc::new(MockDispatcher::new());
        mock.enqueue("GET", "http://t/x", MockResponse::json(503, json!({})));
        mock.enqueue("GET", "http://t/x", MockResponse::json(500, json!({})));
        mock.enqueue("GET", "http://t/x", MockResponse::json(200, json!({"ok": true})));

        let registry = TaskRegistry::new();
        let task = task(&registry, "flaky", "http://t/x", "GET");
        let exec = executor_with(Arc::clone(&mock));
        let st = storage();

        let outcome = exec
            .execute(
                "s",
                &task,
                &Map::new(),
                Duration::from_secs(1),
                &CancellationToken::new(),
                &st,
            )
            .await;

        assert!(outcome.success);
        assert_eq!(outcome.retry_count, 2);
        assert_eq!(mock.hits("http://t/x"), 3);
        assert_eq!(exec.retries_recorded("flaky"), 2);
    }

    #[tokio::test]
    async fn non_retryable_status_fails_immediately() {
        let mock = Arc::new(MockDispatcher::new());
        mock.enqueue("GET", "http://t/x", MockResponse::json(404, json!({})));

        let registry = TaskRegistry::new();
        let task = task(&registry, "missing", "http://t/x", "GET");
        let exec = executor_with(Arc::clone(&mock));
        let st = storage();

        let outcome = exec
            .execute(
                "s",
                &task,
                &Map::new(),
                Duration::from_secs(1),
                &CancellationToken::new(),
                &st,
            )
            .await;

        assert!(!outcome.success);
        assert_eq!(outcome.retry_count, 0);
        assert!(matches!(
            outcome.error,
            Some(StepError::HttpStatus { status: 404 })
        ));
        assert_eq!(mock.hits("http://t/x"), 1);
    }

    #[tokio::test]
    async fn transport_errors_are_retried_to_exhaustion() {
        let mock = Arc::new(MockDispatcher::new());
        for _ in 0..3 {
            mock.enqueue("GET", "http://t/x", MockResponse::transport_error());
        }

        let registry = TaskRegistry::new();
        let task = task(&registry, "down", "http://t/x", "GET");
        let exec = executor_with(Arc::clone(&mock));
        let st = storage();

        let outcome = exec
            .execute(
                "s",
                &task,
                &Map::new(),
                Duration::from_secs(1),
                &CancellationToken::new(),
                &st,
            )
            .await;

        assert!(!outcome.success);
        // 3 attempts, all failed; the last failure IS the final outcome, so
        // only the 2 preceding it count as retries.
        assert_eq!(outcome.retry_count, 2);
        assert!(matches!(outcome.error, Some(StepError::HttpTransport(_))));
        assert_eq!(mock.hits("http://t/x"), 3);
        assert_eq!(exec.retries_recorded("down"), 3);
    }

    #[tokio::test]
    async fn timeout_maps_to_http_timeout() {
        let mock = Arc::new(MockDispatcher::new());
        for _ in 0..3 {
            mock.enqueue(
                "GET",
                "http://t/slow",
                MockResponse::json(200, json!({})).with_delay(Duration::from_secs(30)),
            );
        }

        let registry = TaskRegistry::new();
        let task = task(&registry, "slow", "http://t/slow", "GET");
        let exec = executor_with(Arc::clone(&mock));
        let st = storage();

        let outcome = exec
            .execute(
                "s",
                &task,
                &Map::new(),
                Duration::from_millis(20),
                &CancellationToken::new(),
                &st,
            )
            .await;

        assert!(!outcome.success);
        assert!(matches!(outcome.error, Some(StepError::HttpTimeout { .. })));
    }

    #[tokio::test]
    async fn cancellation_aborts_in_flight_request() {
        let mock = Arc::new(MockDispatcher::new());
        mock.enqueue(
            "GET",
            "http://t/slow",
            MockResponse::json(200, json!({})).with_delay(Duration::from_secs(30)),
        );

        let registry = TaskRegistry::new();
        let task = task(&registry, "slow", "http://t/slow", "GET");
        let exec = executor_with(Arc::clone(&mock));
        let st = storage();

        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let outcome = exec
            .execute("s", &task, &Map::new(), Duration::from_secs(60), &cancel, &st)
            .await;

        assert!(!outcome.success);
        assert!(matches!(outcome.error, Some(StepError::TaskCancelled)));
    }

    #[tokio::test]
    async fn schema_violation_never_reaches_the_network() {
        let mock = Arc::new(MockDispatcher::echo());
        let registry = TaskRegistry::new();
        let def = serde_json::from_value(json!({
            "http": {"url": "http://t/x", "method": "POST"},
            "inputSchema": {
                "type": "object",
                "required": ["amount"],
            },
        }))
        .unwrap();
        registry.register("strict", def).unwrap();
        let task = registry.get("strict").unwrap();

        let exec = executor_with(Arc::clone(&mock));
        let st = storage();
        let outcome = exec
            .execute(
                "s",
                &task,
                &Map::new(),
                Duration::from_secs(1),
                &CancellationToken::new(),
                &st,
            )
            .await;

        assert!(!outcome.success);
        assert!(matches!(
            outcome.error,
            Some(StepError::InputSchemaViolation(_))
        ));
        assert_eq!(mock.requests().len(), 0);
    }

    #[tokio::test]
    async fn per_task_retry_override_wins() {
        let mock = Arc::new(MockDispatcher::new());
        for _ in 0..5 {
            mock.enqueue("GET", "http://t/x", MockResponse::json(500, json!({})));
        }

        let registry = TaskRegistry::new();
        let def = serde_json::from_value(json!({
            "http": {"url": "http://t/x", "method": "GET"},
            "retry": {"maxAttempts": 2, "baseDelayMs": 1},
        }))
        .unwrap();
        registry.register("limited", def).unwrap();
        let task = registry.get("limited").unwrap();

        let exec = executor_with(Arc::clone(&mock));
        let st = storage();
        let outcome = exec
            .execute(
                "s",
                &task,
                &Map::new(),
                Duration::from_secs(1),
                &CancellationToken::new(),
                &st,
            )
            .await;

        assert!(!outcome.success);
        assert_eq!(mock.hits("http://t/x"), 2);
    }
}
