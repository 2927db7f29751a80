//! Contract verification: provider states, record & replay
//!
//! A [`TaskTestScenario`] names a provider-state precondition, a request,
//! and an expected response (exact status plus a body predicate).
//! [`RecordedInteraction`]s are keyed by a request fingerprint (method +
//! URL template + canonicalized body) so recordings from different
//! environments can be compared and replayed.
//!
//! Verification issues the scenario's request through the normal dispatch
//! seam (after an optional provider-state setup call) and checks the
//! response: status must match exactly; bodies compare by predicate -
//! subset, exact, or regex, per scenario.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::dispatch::{DispatchRequest, Dispatcher};
use crate::error::EngineError;

// ============================================================================
// SCENARIOS
// ============================================================================

/// How an expected body is compared against the actual one.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "lowercase", tag = "kind", content = "value")]
pub enum BodyPredicate {
    /// Actual must equal expected exactly.
    Exact(Value),
    /// Every field of expected must appear (recursively) in actual.
    Subset(Value),
    /// The actual body text must match the pattern.
    Regex(String),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioRequest {
    pub method: String,
    /// URL template; joined onto the verifier's base URL when relative.
    pub url: String,
    #[serde(default)]
    pub body: Option<Value>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpectedResponse {
    pub status: u16,
    #[serde(default)]
    pub body: Option<BodyPredicate>,
}

/// Named precondition + request + expected response.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskTestScenario {
    pub name: String,
    #[serde(default)]
    pub provider_state: Option<String>,
    pub request: ScenarioRequest,
    pub expect: ExpectedResponse,
}

// ============================================================================
// RECORDINGS
// ============================================================================

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordedResponse {
    pub status: u16,
    pub body: Value,
}

/// One captured `{environment, request, response}` tuple.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordedInteraction {
    pub environment: String,
    pub request: ScenarioRequest,
    pub response: RecordedResponse,
}

/// Fingerprint: method + URL template + canonicalized body.
pub fn fingerprint(request: &ScenarioRequest) -> String {
    let body = request
        .request_body_canonical()
        .unwrap_or_else(|| "-".to_string());
    format!("{} {} {}", request.method.to_uppercase(), request.url, body)
}

impl ScenarioRequest {
    fn request_body_canonical(&self) -> Option<String> {
        self.body.as_ref().map(|b| canonicalize(b).to_string())
    }
}

/// Recursively sort object keys so equivalent bodies fingerprint equally.
fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut sorted: Vec<(&String, &Value)> = map.iter().collect();
            sorted.sort_by_key(|(k, _)| k.as_str());
            Value::Object(
                sorted
                    .into_iter()
                    .map(|(k, v)| (k.clone(), canonicalize(v)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Process-wide store of recorded interactions, keyed by fingerprint.
#[derive(Default)]
pub struct InteractionStore {
    interactions: DashMap<String, RecordedInteraction>,
}

impl InteractionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an interaction; the latest capture for a fingerprint wins.
    pub fn record(&self, interaction: RecordedInteraction) -> String {
        let key = fingerprint(&interaction.request);
        self.interactions.insert(key.clone(), interaction);
        key
    }

    pub fn get(&self, request: &ScenarioRequest) -> Option<RecordedInteraction> {
        self.interactions
            .get(&fingerprint(request))
            .map(|i| i.clone())
    }

    pub fn len(&self) -> usize {
        self.interactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interactions.is_empty()
    }
}

// ============================================================================
// VERIFICATION
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct VerificationOutcome {
    pub passed: bool,
    /// Human-readable first mismatch, when not passed.
    pub diff: Option<String>,
}

/// Replays scenarios against a live provider through the dispatch seam.
pub struct ContractVerifier {
    dispatcher: Arc<dyn Dispatcher>,
    base_url: String,
    /// Relative path POSTed with `{state}` before each stateful scenario.
    state_setup_path: Option<String>,
    timeout: Duration,
}

impl ContractVerifier {
    pub fn new(dispatcher: Arc<dyn Dispatcher>, base_url: impl Into<String>) -> Self {
        Self {
            dispatcher,
            base_url: base_url.into(),
            state_setup_path: None,
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_state_setup(mut self, path: impl Into<String>) -> Self {
        self.state_setup_path = Some(path.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn absolute(&self, url: &str) -> String {
        if url.starts_with("http://") || url.starts_with("https://") {
            url.to_string()
        } else {
            format!(
                "{}/{}",
                self.base_url.trim_end_matches('/'),
                url.trim_start_matches('/')
            )
        }
    }

    /// Put the provider into the scenario's state, issue the request, and
    /// compare the response against the expectation.
    pub async fn verify(
        &self,
        scenario: &TaskTestScenario,
    ) -> Result<VerificationOutcome, EngineError> {
        if let (Some(state), Some(path)) = (&scenario.provider_state, &self.state_setup_path) {
            let setup = DispatchRequest {
                method: "POST".into(),
                url: self.absolute(path),
                body: Some(json!({ "state": state })),
                timeout: self.timeout,
            };
            self.dispatcher.dispatch(setup).await.map_err(|e| {
                EngineError::ContractVerification(format!(
                    "provider state '{state}' setup failed: {e}"
                ))
            })?;
        }

        let request = DispatchRequest {
            method: scenario.request.method.clone(),
            url: self.absolute(&scenario.request.url),
            body: scenario.request.body.clone(),
            timeout: self.timeout,
        };
        let response = self
            .dispatcher
            .dispatch(request)
            .await
            .map_err(|e| EngineError::ContractVerification(e.to_string()))?;

        // Status must match exactly.
        if response.status != scenario.expect.status {
            return Ok(VerificationOutcome {
                passed: false,
                diff: Some(format!(
                    "status: expected {}, got {}",
                    scenario.expect.status, response.status
                )),
            });
        }

        let Some(predicate) = &scenario.expect.body else {
            return Ok(VerificationOutcome {
                passed: true,
                diff: None,
            });
        };

        let diff = check_body(predicate, &response.body)?;
        Ok(VerificationOutcome {
            passed: diff.is_none(),
            diff,
        })
    }

    /// Verify a recording: the replayed response must still satisfy the
    /// scenario built from it (exact status, subset body).
    pub async fn verify_recording(
        &self,
        interaction: &RecordedInteraction,
    ) -> Result<VerificationOutcome, EngineError> {
        let scenario = TaskTestScenario {
            name: format!("recorded:{}", fingerprint(&interaction.request)),
            provider_state: None,
            request: interaction.request.clone(),
            expect: ExpectedResponse {
                status: interaction.response.status,
                body: Some(BodyPredicate::Subset(interaction.response.body.clone())),
            },
        };
        self.verify(&scenario).await
    }
}

fn check_body(predicate: &BodyPredicate, body: &[u8]) -> Result<Option<String>, EngineError> {
    match predicate {
        BodyPredicate::Regex(pattern) => {
            let re = Regex::new(pattern).map_err(|e| {
                EngineError::ContractVerification(format!("bad body pattern: {e}"))
            })?;
            let text = String::from_utf8_lossy(body);
            if re.is_match(&text) {
                Ok(None)
            } else {
                Ok(Some(format!("body does not match /{pattern}/")))
            }
        }
        BodyPredicate::Exact(expected) => {
            let actual: Value = serde_json::from_slice(body)
                .map_err(|e| EngineError::ContractVerification(format!("non-JSON body: {e}")))?;
            if &actual == expected {
                Ok(None)
            } else {
                Ok(Some(format!("body: expected {expected}, got {actual}")))
            }
        }
        BodyPredicate::Subset(expected) => {
            let actual: Value = serde_json::from_slice(body)
                .map_err(|e| EngineError::ContractVerification(format!("non-JSON body: {e}")))?;
            Ok(subset_diff(expected, &actual, "$"))
        }
    }
}

/// First path where `expected` is not a subset of `actual`, if any.
fn subset_diff(expected: &Value, actual: &Value, path: &str) -> Option<String> {
    match (expected, actual) {
        (Value::Object(exp), Value::Object(act)) => {
            for (key, exp_value) in exp {
                match act.get(key) {
                    None => return Some(format!("{path}.{key}: missing")),
                    Some(act_value) => {
                        if let Some(diff) =
                            subset_diff(exp_value, act_value, &format!("{path}.{key}"))
                        {
                            return Some(diff);
                        }
                    }
                }
            }
            None
        }
        (Value::Array(exp), Value::Array(act)) => {
            if exp.len() != act.len() {
                return Some(format!(
                    "{path}: array length {} != {}",
                    exp.len(),
                    act.len()
                ));
            }
            for (i, (e, a)) in exp.iter().zip(act.iter()).enumerate() {
                if let Some(diff) = subset_diff(e, a, &format!("{path}[{i}]")) {
                    return Some(diff);
                }
            }
            None
        }
        (exp, act) => {
            if exp == act {
                None
            } else {
                Some(format!("{path}: expected {exp}, got {act}"))
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{MockDispatcher, MockResponse};

    fn scenario(status: u16, body: Option<BodyPredicate>) -> TaskTestScenario {
        TaskTestScenario {
            name: "user exists".into(),
            provider_state: Some("user u-1 exists".into()),
            request: ScenarioRequest {
                method: "GET".into(),
                url: "/users/u-1".into(),
                body: None,
            },
            expect: ExpectedResponse { status, body },
        }
    }

    #[tokio::test]
    async fn passing_scenario_with_subset_body() {
        let mock = Arc::new(MockDispatcher::new());
        mock.enqueue("POST", "http://p/_state", MockResponse::json(200, json!({})));
        mock.enqueue(
            "GET",
            "http://p/users/u-1",
            MockResponse::json(200, json!({"id": "u-1", "name": "ada", "extra": 1})),
        );

        let verifier = ContractVerifier::new(Arc::clone(&mock) as Arc<dyn Dispatcher>, "http://p")
            .with_state_setup("/_state");
        let outcome = verifier
            .verify(&scenario(
                200,
                Some(BodyPredicate::Subset(json!({"id": "u-1", "name": "ada"}))),
            ))
            .await
            .unwrap();

        assert!(outcome.passed, "diff: {:?}", outcome.diff);
        // The state setup call went out first.
        let requests = mock.requests();
        assert_eq!(requests[0].url, "http://p/_state");
        assert_eq!(requests[0].body, Some(json!({"state": "user u-1 exists"})));
    }

    #[tokio::test]
    async fn status_mismatch_fails_with_diff() {
        let mock = Arc::new(MockDispatcher::new());
        mock.enqueue("GET", "http://p/users/u-1", MockResponse::json(404, json!({})));

        let verifier = ContractVerifier::new(Arc::clone(&mock) as Arc<dyn Dispatcher>, "http://p");
        let mut sc = scenario(200, None);
        sc.provider_state = None;
        let outcome = verifier.verify(&sc).await.unwrap();

        assert!(!outcome.passed);
        assert!(outcome.diff.unwrap().contains("expected 200, got 404"));
    }

    #[tokio::test]
    async fn subset_mismatch_names_the_path() {
        let mock = Arc::new(MockDispatcher::new());
        mock.enqueue(
            "GET",
            "http://p/users/u-1",
            MockResponse::json(200, json!({"id": "u-1", "name": "bob"})),
        );

        let verifier = ContractVerifier::new(Arc::clone(&mock) as Arc<dyn Dispatcher>, "http://p");
        let mut sc = scenario(200, Some(BodyPredicate::Subset(json!({"name": "ada"}))));
        sc.provider_state = None;
        let outcome = verifier.verify(&sc).await.unwrap();

        assert!(!outcome.passed);
        assert!(outcome.diff.unwrap().contains("$.name"));
    }

    #[tokio::test]
    async fn exact_and_regex_predicates() {
        let mock = Arc::new(MockDispatcher::new());
        mock.enqueue("GET", "http://p/v", MockResponse::json(200, json!({"v": 1})));
        mock.enqueue("GET", "http://p/v", MockResponse::json(200, json!({"v": "1.2.3"})));

        let verifier = ContractVerifier::new(Arc::clone(&mock) as Arc<dyn Dispatcher>, "http://p");

        let mut sc = scenario(200, Some(BodyPredicate::Exact(json!({"v": 1}))));
        sc.request.url = "/v".into();
        sc.provider_state = None;
        assert!(verifier.verify(&sc).await.unwrap().passed);

        sc.expect.body = Some(BodyPredicate::Regex(r#""v"\s*:\s*"\d+\.\d+\.\d+""#.into()));
        assert!(verifier.verify(&sc).await.unwrap().passed);
    }

    #[test]
    fn fingerprint_canonicalizes_bodies() {
        let a = ScenarioRequest {
            method: "post".into(),
            url: "/charge".into(),
            body: Some(json!({"b": 2, "a": 1})),
        };
        let b = ScenarioRequest {
            method: "POST".into(),
            url: "/charge".into(),
            body: Some(json!({"a": 1, "b": 2})),
        };
        assert_eq!(fingerprint(&a), fingerprint(&b));

        let c = ScenarioRequest {
            body: Some(json!({"a": 2, "b": 2})),
            ..a.clone()
        };
        assert_ne!(fingerprint(&a), fingerprint(&c));
    }

    #[test]
    fn store_replays_by_fingerprint() {
        let store = InteractionStore::new();
        let interaction = RecordedInteraction {
            environment: "staging".into(),
            request: ScenarioRequest {
                method: "GET".into(),
                url: "/users/u-1".into(),
                body: None,
            },
            response: RecordedResponse {
                status: 200,
                body: json!({"id": "u-1"}),
            },
        };
        store.record(interaction.clone());

        let found = store.get(&interaction.request).unwrap();
        assert_eq!(found.environment, "staging");
        assert_eq!(store.len(), 1);

        // Re-recording the same fingerprint replaces the capture.
        let mut newer = interaction.clone();
        newer.environment = "prod".into();
        store.record(newer);
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(&interaction.request).unwrap().environment, "prod");
    }

    #[tokio::test]
    async fn recorded_interaction_replays() {
        let mock = Arc::new(MockDispatcher::new());
        mock.enqueue(
            "GET",
            "http://p/users/u-1",
            MockResponse::json(200, json!({"id": "u-1", "name": "ada"})),
        );

        let verifier = ContractVerifier::new(Arc::clone(&mock) as Arc<dyn Dispatcher>, "http://p");
        let interaction = RecordedInteraction {
            environment: "dev".into(),
            request: ScenarioRequest {
                method: "GET".into(),
                url: "/users/u-1".into(),
                body: None,
            },
            response: RecordedResponse {
                status: 200,
                body: json!({"id": "u-1"}),
            },
        };

        let outcome = verifier.verify_recording(&interaction).await.unwrap();
        assert!(outcome.passed, "diff: {:?}", outcome.diff);
    }
}
