//! Task registry and lifecycle engine
//!
//! Process-wide store of registered [`TaskDefinition`]s. Each entry carries
//! its lifecycle state (`Active -> Superseded -> Deprecated`, monotonic),
//! an optional deprecation date, and schemas compiled once at registration.
//!
//! The registry is the point where the permissive wire model becomes hard
//! invariants: uncompilable schemas are rejected here, and the validator
//! refuses workflows referencing tasks past their deprecation date.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use jsonschema::Validator;
use serde::Serialize;
use serde_json::Value;

use crate::config::RetryPolicy;
use crate::error::{EngineError, StepError};
use crate::spec::{TaskDefinition, TaskManifest};

// ============================================================================
// LIFECYCLE
// ============================================================================

/// Lifecycle states of a task definition. Transitions are monotonic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum LifecycleState {
    Active,
    Superseded,
    Deprecated,
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LifecycleState::Active => "Active",
            LifecycleState::Superseded => "Superseded",
            LifecycleState::Deprecated => "Deprecated",
        };
        write!(f, "{s}")
    }
}

// ============================================================================
// REGISTERED TASK
// ============================================================================

/// A task definition plus everything derived from it at registration time.
#[derive(Clone)]
pub struct RegisteredTask {
    pub name: String,
    pub definition: TaskDefinition,
    pub state: LifecycleState,
    pub deprecated_on: Option<DateTime<Utc>>,
    /// Compiled input schema, when the definition declares one.
    input_schema: Option<Arc<Validator>>,
    /// Top-level property names of the declared output schema.
    output_fields: Option<BTreeSet<String>>,
    /// Per-task retry override derived from the wire-level spec.
    pub retry_override: Option<RetryPolicy>,
}

impl RegisteredTask {
    fn build(name: String, definition: TaskDefinition) -> Result<Self, EngineError> {
        let input_schema = match &definition.input_schema {
            Some(schema) => Some(Arc::new(jsonschema::validator_for(schema).map_err(
                |e| EngineError::InvalidSchema {
                    task: name.clone(),
                    detail: e.to_string(),
                },
            )?)),
            None => None,
        };

        let output_fields = definition
            .output_schema
            .as_ref()
            .and_then(schema_properties);

        let retry_override = definition.retry.as_ref().map(|spec| RetryPolicy {
            max_attempts: spec.max_attempts.max(1),
            base_delay: spec
                .base_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(RetryPolicy::default().base_delay),
            max_delay: RetryPolicy::default().max_delay,
        });

        Ok(Self {
            name,
            definition,
            state: LifecycleState::Active,
            deprecated_on: None,
            input_schema,
            output_fields,
            retry_override,
        })
    }

    /// Validate a resolved step input against the declared input schema.
    pub fn check_input(&self, input: &Value) -> Result<(), StepError> {
        let Some(schema) = &self.input_schema else {
            return Ok(());
        };
        let errors: Vec<String> = schema.iter_errors(input).map(|e| e.to_string()).collect();
        if !errors.is_empty() {
            return Err(StepError::InputSchemaViolation(errors.join("; ")));
        }
        Ok(())
    }

    /// Top-level output field names, if the schema declares properties.
    pub fn output_fields(&self) -> Option<&BTreeSet<String>> {
        self.output_fields.as_ref()
    }

    /// Top-level input field names, if the schema declares properties.
    pub fn input_fields(&self) -> Option<BTreeSet<String>> {
        self.definition
            .input_schema
            .as_ref()
            .and_then(schema_properties)
    }

    pub fn default_timeout(&self) -> Option<Duration> {
        self.definition.default_timeout()
    }

    /// Whether the task is deprecated and its deprecation date has passed.
    pub fn is_past_deprecation(&self, now: DateTime<Utc>) -> bool {
        self.state == LifecycleState::Deprecated
            && self.deprecated_on.map(|on| on <= now).unwrap_or(true)
    }
}

/// Top-level `properties` names of an object schema.
fn schema_properties(schema: &Value) -> Option<BTreeSet<String>> {
    schema
        .get("properties")
        .and_then(|p| p.as_object())
        .map(|props| props.keys().cloned().collect())
}

// ============================================================================
// REGISTRY
// ============================================================================

/// Concurrent map of registered tasks, keyed by name.
#[derive(Default)]
pub struct TaskRegistry {
    tasks: DashMap<String, Arc<RegisteredTask>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or re-register) a task definition. Schemas are compiled
    /// here; a fresh registration resets the lifecycle to `Active`.
    pub fn register(&self, name: &str, definition: TaskDefinition) -> Result<(), EngineError> {
        let task = RegisteredTask::build(name.to_string(), definition)?;
        self.tasks.insert(name.to_string(), Arc::new(task));
        Ok(())
    }

    pub fn register_manifest(&self, manifest: TaskManifest) -> Result<(), EngineError> {
        let name = manifest.metadata.name.clone();
        self.register(&name, manifest.spec)
    }

    pub fn get(&self, name: &str) -> Option<Arc<RegisteredTask>> {
        self.tasks.get(name).map(|t| Arc::clone(&t))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tasks.contains_key(name)
    }

    /// Registered task names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tasks.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn lifecycle(&self, name: &str) -> Option<LifecycleState> {
        self.get(name).map(|t| t.state)
    }

    /// `Active -> Superseded`. Any other starting state is rejected.
    pub fn supersede(&self, name: &str) -> Result<(), EngineError> {
        self.transition(name, LifecycleState::Superseded)
    }

    /// `Active | Superseded -> Deprecated`, effective on the given date.
    pub fn deprecate(&self, name: &str, on: DateTime<Utc>) -> Result<(), EngineError> {
        let mut entry = self
            .tasks
            .get_mut(name)
            .ok_or_else(|| EngineError::UnknownTask(name.to_string()))?;
        let current = entry.value().state;
        if current >= LifecycleState::Deprecated {
            return Err(EngineError::Lifecycle(format!(
                "task '{name}' is already {current}"
            )));
        }
        let mut updated = entry.value().as_ref().clone();
        updated.state = LifecycleState::Deprecated;
        updated.deprecated_on = Some(on);
        *entry.value_mut() = Arc::new(updated);
        Ok(())
    }

    fn transition(&self, name: &str, target: LifecycleState) -> Result<(), EngineError> {
        let mut entry = self
            .tasks
            .get_mut(name)
            .ok_or_else(|| EngineError::UnknownTask(name.to_string()))?;
        let current = entry.value().state;
        if current >= target {
            return Err(EngineError::Lifecycle(format!(
                "task '{name}' cannot move from {current} to {target}"
            )));
        }
        let mut updated = entry.value().as_ref().clone();
        updated.state = target;
        *entry.value_mut() = Arc::new(updated);
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn definition(input_schema: Option<Value>, output_schema: Option<Value>) -> TaskDefinition {
        serde_json::from_value(json!({
            "http": {"url": "http://t/{{ id }}", "method": "GET"},
            "inputSchema": input_schema,
            "outputSchema": output_schema,
        }))
        .unwrap()
    }

    #[test]
    fn register_and_lookup() {
        let registry = TaskRegistry::new();
        registry.register("get-user", definition(None, None)).unwrap();

        assert!(registry.contains("get-user"));
        assert_eq!(registry.lifecycle("get-user"), Some(LifecycleState::Active));
        assert_eq!(registry.names(), vec!["get-user"]);
    }

    #[test]
    fn input_schema_is_enforced() {
        let registry = TaskRegistry::new();
        registry
            .register(
                "charge",
                definition(
                    Some(json!({
                        "type": "object",
                        "properties": {"amount": {"type": "number"}},
                        "required": ["amount"],
                    })),
                    None,
                ),
            )
            .unwrap();

        let task = registry.get("charge").unwrap();
        assert!(task.check_input(&json!({"amount": 5})).is_ok());
        assert!(matches!(
            task.check_input(&json!({})).unwrap_err(),
            StepError::InputSchemaViolation(_)
        ));
    }

    #[test]
    fn uncompilable_schema_is_rejected() {
        let registry = TaskRegistry::new();
        let result = registry.register(
            "broken",
            definition(Some(json!({"type": "not-a-type"})), None),
        );
        assert!(matches!(result, Err(EngineError::InvalidSchema { .. })));
    }

    #[test]
    fn output_fields_come_from_schema_properties() {
        let registry = TaskRegistry::new();
        registry
            .register(
                "get-user",
                definition(
                    None,
                    Some(json!({
                        "type": "object",
                        "properties": {"name": {}, "email": {}},
                    })),
                ),
            )
            .unwrap();

        let task = registry.get("get-user").unwrap();
        let fields = task.output_fields().unwrap();
        assert!(fields.contains("name"));
        assert!(fields.contains("email"));
        assert_eq!(fields.len(), 2);
    }

    #[test]
    fn lifecycle_is_monotonic() {
        let registry = TaskRegistry::new();
        registry.register("t", definition(None, None)).unwrap();

        registry.supersede("t").unwrap();
        assert_eq!(registry.lifecycle("t"), Some(LifecycleState::Superseded));

        // Cannot supersede twice
        assert!(matches!(
            registry.supersede("t"),
            Err(EngineError::Lifecycle(_))
        ));

        registry.deprecate("t", Utc::now()).unwrap();
        assert_eq!(registry.lifecycle("t"), Some(LifecycleState::Deprecated));

        // Deprecated is terminal
        assert!(registry.deprecate("t", Utc::now()).is_err());
        assert!(registry.supersede("t").is_err());
    }

    #[test]
    fn deprecation_date_gates_expiry() {
        let registry = TaskRegistry::new();
        registry.register("t", definition(None, None)).unwrap();

        let future = Utc::now() + chrono::Duration::days(30);
        registry.deprecate("t", future).unwrap();

        let task = registry.get("t").unwrap();
        assert!(!task.is_past_deprecation(Utc::now()));
        assert!(task.is_past_deprecation(future + chrono::Duration::days(1)));
    }

    #[test]
    fn reregistration_resets_lifecycle() {
        let registry = TaskRegistry::new();
        registry.register("t", definition(None, None)).unwrap();
        registry.supersede("t").unwrap();

        registry.register("t", definition(None, None)).unwrap();
        assert_eq!(registry.lifecycle("t"), Some(LifecycleState::Active));
    }

    #[test]
    fn retry_override_is_derived() {
        let registry = TaskRegistry::new();
        let def: TaskDefinition = serde_json::from_value(json!({
            "http": {"url": "http://t", "method": "GET"},
            "retry": {"maxAttempts": 5, "baseDelayMs": 50},
        }))
        .unwrap();
        registry.register("flaky", def).unwrap();

        let policy = registry.get("flaky").unwrap().retry_override.clone().unwrap();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.base_delay, Duration::from_millis(50));
    }
}
