//! # Workflow and Task Manifests
//!
//! Core types for the YAML workflow definition format.
//!
//! ## Overview
//!
//! Two manifest kinds exist, both wrapped in the same envelope:
//!
//! - `kind: Workflow` - a named, namespaced [`WorkflowSpec`]: input
//!   parameters, an ordered sequence of [`TaskStep`]s, and optional
//!   templated outputs.
//! - `kind: WorkflowTask` - a [`TaskDefinition`]: the reusable HTTP-backed
//!   task a step references via `taskRef`.
//!
//! ## Example
//!
//! ```yaml
//! apiVersion: strata.io/v1
//! kind: Workflow
//! metadata:
//!   name: user-report
//!   namespace: billing
//! spec:
//!   input:
//!     userId: { type: string, required: true }
//!   tasks:
//!     - id: fetch
//!       taskRef: get-user
//!       input:
//!         id: "{{ input.userId }}"
//!     - id: render
//!       taskRef: render-report
//!       dependsOn: [fetch]
//!       input:
//!         name: "{{ tasks.fetch.output.name }}"
//!   output:
//!     report: "{{ tasks.render.output.url }}"
//! ```
//!
//! The wire model is deliberately permissive (most fields optional with
//! defaults); the validator is where optional wire shapes become hard
//! invariants. Optionality is not propagated past that boundary.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::EngineError;

/// Accepted apiVersion for both manifest kinds.
pub const API_VERSION: &str = "strata.io/v1";

pub const KIND_WORKFLOW: &str = "Workflow";
pub const KIND_TASK: &str = "WorkflowTask";

// ============================================================================
// MANIFEST ENVELOPE
// ============================================================================

/// Generic manifest envelope shared by both kinds.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest<T> {
    pub api_version: String,
    pub kind: String,
    pub metadata: Metadata,
    pub spec: T,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Metadata {
    pub name: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
}

fn default_namespace() -> String {
    "default".to_string()
}

pub type WorkflowManifest = Manifest<WorkflowSpec>;
pub type TaskManifest = Manifest<TaskDefinition>;

impl WorkflowManifest {
    /// Parse a `kind: Workflow` manifest, rejecting mismatched envelopes.
    pub fn from_yaml(yaml: &str) -> Result<Self, EngineError> {
        let manifest: WorkflowManifest = serde_yaml::from_str(yaml)?;
        manifest.check_envelope(KIND_WORKFLOW)?;
        Ok(manifest)
    }
}

impl TaskManifest {
    /// Parse a `kind: WorkflowTask` manifest, rejecting mismatched envelopes.
    pub fn from_yaml(yaml: &str) -> Result<Self, EngineError> {
        let manifest: TaskManifest = serde_yaml::from_str(yaml)?;
        manifest.check_envelope(KIND_TASK)?;
        Ok(manifest)
    }
}

impl<T> Manifest<T> {
    fn check_envelope(&self, expected_kind: &str) -> Result<(), EngineError> {
        if self.api_version != API_VERSION {
            return Err(EngineError::other(format!(
                "unsupported apiVersion '{}' (expected '{}')",
                self.api_version, API_VERSION
            )));
        }
        if self.kind != expected_kind {
            return Err(EngineError::other(format!(
                "unexpected kind '{}' (expected '{}')",
                self.kind, expected_kind
            )));
        }
        Ok(())
    }
}

/// Peek at the `kind` field without committing to a spec shape.
///
/// Used by directory loaders that mix Workflow and WorkflowTask files.
pub fn manifest_kind(yaml: &str) -> Option<String> {
    #[derive(Deserialize)]
    struct KindOnly {
        kind: String,
    }
    serde_yaml::from_str::<KindOnly>(yaml).ok().map(|k| k.kind)
}

// ============================================================================
// WORKFLOW SPEC
// ============================================================================

/// A named workflow definition: input parameters, steps, outputs.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowSpec {
    /// Declared input parameters, keyed by name.
    #[serde(default)]
    pub input: BTreeMap<String, InputParam>,

    /// Ordered task steps (definition order breaks level ties).
    #[serde(default)]
    pub tasks: Vec<TaskStep>,

    /// Declared outputs, each a template string.
    #[serde(default)]
    pub output: BTreeMap<String, String>,
}

impl WorkflowSpec {
    pub fn step(&self, id: &str) -> Option<&TaskStep> {
        self.tasks.iter().find(|t| t.id == id)
    }

    pub fn step_ids(&self) -> impl Iterator<Item = &str> {
        self.tasks.iter().map(|t| t.id.as_str())
    }
}

/// One declared workflow input parameter.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InputParam {
    #[serde(rename = "type")]
    pub param_type: ParamType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub default: Option<Value>,
}

/// Parameter types for workflow input declarations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    String,
    Number,
    Integer,
    Boolean,
    Object,
    Array,
}

impl ParamType {
    /// Whether a JSON value conforms to this parameter type.
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            ParamType::String => value.is_string(),
            ParamType::Number => value.is_number(),
            ParamType::Integer => value.is_i64() || value.is_u64(),
            ParamType::Boolean => value.is_boolean(),
            ParamType::Object => value.is_object(),
            ParamType::Array => value.is_array(),
        }
    }
}

impl std::fmt::Display for ParamType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ParamType::String => "string",
            ParamType::Number => "number",
            ParamType::Integer => "integer",
            ParamType::Boolean => "boolean",
            ParamType::Object => "object",
            ParamType::Array => "array",
        };
        write!(f, "{name}")
    }
}

// ============================================================================
// TASK STEP
// ============================================================================

/// A node in the workflow DAG.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStep {
    /// Unique id within the workflow.
    pub id: String,

    /// Name of the registered task definition this step invokes.
    pub task_ref: String,

    /// Task input bindings: field name -> template string.
    #[serde(default)]
    pub input: BTreeMap<String, String>,

    /// Predecessor step ids.
    #[serde(default)]
    pub depends_on: Vec<String>,

    /// Optional gate: `Skip` when the expression is false.
    #[serde(default)]
    pub condition: Option<Condition>,

    /// Optional taskRef dispatch on a templated value.
    #[serde(default)]
    pub switch: Option<Switch>,

    /// Optional bounded parallel iteration over a sequence.
    #[serde(default)]
    pub for_each: Option<ForEach>,

    /// Duration literal overriding the task's default timeout
    /// (e.g. "500ms", "30s", "5m").
    #[serde(default)]
    pub timeout: Option<String>,
}

impl TaskStep {
    /// Effective step timeout override, if one parses.
    pub fn timeout_override(&self) -> Option<Duration> {
        self.timeout.as_deref().and_then(parse_duration)
    }
}

/// `condition: { if: <expr> }`
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Condition {
    #[serde(rename = "if")]
    pub expr: String,
}

/// `switch: { value, cases, default? }`
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Switch {
    /// Template whose resolved value selects a case.
    pub value: String,
    #[serde(default)]
    pub cases: Vec<SwitchCase>,
    #[serde(default)]
    pub default: Option<SwitchDefault>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SwitchCase {
    #[serde(rename = "match")]
    pub match_value: String,
    pub task_ref: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SwitchDefault {
    pub task_ref: String,
}

/// `forEach: { items, itemVar, maxParallel }`
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ForEach {
    /// Template resolving to the sequence to iterate.
    pub items: String,
    /// Identifier bound to the current element inside each iteration.
    pub item_var: String,
    /// Per-step concurrency bound; 0 means unbounded.
    #[serde(default)]
    pub max_parallel: u32,
}

// ============================================================================
// TASK DEFINITION
// ============================================================================

/// The reusable HTTP-backed task a `taskRef` points at.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDefinition {
    pub http: HttpSpec,

    /// JSON Schema the resolved step input must satisfy.
    #[serde(default)]
    pub input_schema: Option<Value>,

    /// JSON Schema describing the task's output map.
    #[serde(default)]
    pub output_schema: Option<Value>,

    /// Default timeout (duration literal), overridable per step.
    #[serde(default)]
    pub timeout: Option<String>,

    /// Per-task retry override.
    #[serde(default)]
    pub retry: Option<RetrySpec>,
}

impl TaskDefinition {
    pub fn default_timeout(&self) -> Option<Duration> {
        self.timeout.as_deref().and_then(parse_duration)
    }
}

/// HTTP target for a task: templated URL plus method.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HttpSpec {
    pub url: String,
    pub method: String,
}

/// Wire-level retry configuration on a task definition.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrySpec {
    pub max_attempts: u32,
    #[serde(default)]
    pub base_delay_ms: Option<u64>,
}

// ============================================================================
// DURATION LITERALS
// ============================================================================

/// Parse a duration literal like "500ms", "30s", "5m", "1h".
///
/// A bare number is taken as seconds.
pub fn parse_duration(raw: &str) -> Option<Duration> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }

    if let Some(ms) = s.strip_suffix("ms") {
        return ms.parse::<u64>().ok().map(Duration::from_millis);
    }
    if let Some(secs) = s.strip_suffix('s') {
        return secs.parse::<u64>().ok().map(Duration::from_secs);
    }
    if let Some(mins) = s.strip_suffix('m') {
        return mins.parse::<u64>().ok().map(|m| Duration::from_secs(m * 60));
    }
    if let Some(hours) = s.strip_suffix('h') {
        return hours
            .parse::<u64>()
            .ok()
            .map(|h| Duration::from_secs(h * 3600));
    }

    s.parse::<u64>().ok().map(Duration::from_secs)
}

// ============================================================================
// TESTS
// ============================================================================
