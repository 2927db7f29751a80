//! # Strata Error Module
//!
//! Two error layers, mirroring how the engine propagates failures:
//!
//! - [`StepError`] - per-step execution failures. These are recorded on the
//!   step's state and (under fail-fast) surface as the execution-level error.
//! - [`EngineError`] - top-level failures for the public API and CLI,
//!   wrapping module-specific errors.
//!
//! Deployment and contract outcomes are carried in structured responses and
//! never cross the public API as errors; the variants here exist for the
//! CLI and for internal plumbing.

use thiserror::Error;

// ============================================================================
// STEP ERRORS
// ============================================================================

/// Failure of a single task step during execution.
#[derive(Error, Debug, Clone)]
pub enum StepError {
    /// A template path did not resolve against the execution context.
    #[error("template path '{path}' did not resolve")]
    TemplateUnresolved { path: String },

    /// A condition expression failed to parse.
    #[error("condition invalid: {reason}")]
    ConditionInvalid { reason: String },

    /// A condition referenced a value that is absent from the context.
    #[error("condition unresolved: {reason}")]
    ConditionUnresolved { reason: String },

    /// `forEach.items` resolved to something that is not a sequence.
    #[error("forEach items is not iterable: {detail}")]
    ForEachNotIterable { detail: String },

    /// The HTTP round trip exceeded the effective timeout.
    #[error("HTTP request timed out after {timeout_ms}ms")]
    HttpTimeout { timeout_ms: u64 },

    /// Connection-level failure (DNS, refused, reset, ...).
    #[error("HTTP transport error: {0}")]
    HttpTransport(String),

    /// Terminal non-success status code.
    #[error("HTTP status {status}")]
    HttpStatus { status: u16 },

    /// The step was cancelled, either externally or by a derived timeout.
    #[error("task cancelled")]
    TaskCancelled,

    /// The response body could not be turned into an output map.
    #[error("response handling failed: {0}")]
    ResponseInvalid(String),

    /// The resolved input violated the task's declared input schema.
    #[error("input schema violation: {0}")]
    InputSchemaViolation(String),

    /// The step referenced a task that is not registered.
    #[error("unknown task reference '{0}'")]
    UnknownTaskRef(String),
}

impl StepError {
    /// Stable kind name, persisted on task records.
    pub fn kind(&self) -> &'static str {
        match self {
            StepError::TemplateUnresolved { .. } => "TemplateUnresolved",
            StepError::ConditionInvalid { .. } => "ConditionInvalid",
            StepError::ConditionUnresolved { .. } => "ConditionUnresolved",
            StepError::ForEachNotIterable { .. } => "ForEachNotIterable",
            StepError::HttpTimeout { .. } => "HttpTimeout",
            StepError::HttpTransport(_) => "HttpTransport",
            StepError::HttpStatus { .. } => "HttpStatus",
            StepError::TaskCancelled => "TaskCancelled",
            StepError::ResponseInvalid(_) => "ResponseInvalid",
            StepError::InputSchemaViolation(_) => "InputSchemaViolation",
            StepError::UnknownTaskRef(_) => "UnknownTaskRef",
        }
    }

    /// Whether the retry policy may loop on this error.
    ///
    /// Template and condition errors are never retried; only transport
    /// failures, timeouts and 408/429/5xx statuses are.
    pub fn is_retryable(&self) -> bool {
        match self {
            StepError::HttpTimeout { .. } | StepError::HttpTransport(_) => true,
            StepError::HttpStatus { status } => {
                matches!(status, 408 | 429) || (500..600).contains(status)
            }
            _ => false,
        }
    }
}

// ============================================================================
// ENGINE ERROR (Top-level)
// ============================================================================

/// Top-level error type for the engine facade and the CLI.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Static validation rejected the workflow at registration.
    #[error("workflow validation failed with {errors} error(s)")]
    ValidationFailed { errors: usize },

    /// Graph construction failed (cycles, unknown dependencies).
    #[error("{0}")]
    Dag(#[from] crate::dag::DagError),

    /// Step-level failure bubbled to the API boundary.
    #[error("{0}")]
    Step(#[from] StepError),

    /// The named workflow is not registered.
    #[error("unknown workflow '{0}'")]
    UnknownWorkflow(String),

    /// The named task is not registered.
    #[error("unknown task '{0}'")]
    UnknownTask(String),

    /// No execution with this id has been recorded.
    #[error("unknown execution '{0}'")]
    UnknownExecution(String),

    /// Workflow input failed parameter validation.
    #[error("invalid workflow input: {0}")]
    InputInvalid(String),

    /// A declared workflow output referenced a skipped or failed step.
    #[error("workflow output could not be materialized: {0}")]
    OutputUnresolved(String),

    /// A lifecycle transition was rejected (transitions are monotonic).
    #[error("lifecycle transition rejected: {0}")]
    Lifecycle(String),

    /// A task definition carried an uncompilable schema.
    #[error("invalid schema for task '{task}': {detail}")]
    InvalidSchema { task: String, detail: String },

    /// Promotion-chain mutation referenced an unknown environment.
    #[error("unknown environment '{0}'")]
    UnknownEnvironment(String),

    /// Contract verification could not be carried out.
    #[error("contract verification failed: {0}")]
    ContractVerification(String),

    /// A record with this id already exists (repositories are append-only).
    #[error("duplicate execution record '{0}'")]
    DuplicateRecord(String),

    /// Manifest parse error.
    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error with message.
    #[error("{0}")]
    Other(String),
}

impl EngineError {
    pub fn other(msg: impl Into<String>) -> Self {
        EngineError::Other(msg.into())
    }
}

// ============================================================================
// FIX SUGGESTIONS
// ============================================================================

/// Trait for errors that can point the user at a fix.
pub trait FixSuggestion {
    fn fix_suggestion(&self) -> Option<&str>;
}

impl FixSuggestion for EngineError {
    fn fix_suggestion(&self) -> Option<&str> {
        match self {
            EngineError::ValidationFailed { .. } => {
                Some("Run `workflow validate <file>` to list the individual errors")
            }
            EngineError::Dag(_) => {
                Some("Check dependsOn entries: every id must exist and the graph must be acyclic")
            }
            EngineError::UnknownWorkflow(_) => {
                Some("Register the workflow first, or check the name for typos")
            }
            EngineError::UnknownTask(_) => {
                Some("Register a WorkflowTask manifest with this name (see `workflow tasks list`)")
            }
            EngineError::InputInvalid(_) => {
                Some("Compare the provided input against the workflow's declared input parameters")
            }
            EngineError::OutputUnresolved(_) => {
                Some("Workflow outputs may only reference steps that succeeded")
            }
            EngineError::Lifecycle(_) => {
                Some("Lifecycle moves one way: Active -> Superseded -> Deprecated")
            }
            EngineError::Yaml(_) => Some("Check YAML syntax: indentation and quoting"),
            EngineError::Io(_) => Some("Check that the file path exists and is readable"),
            _ => None,
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
