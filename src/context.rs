//! Execution context built incrementally during one run
//!
//! Holds the validated workflow input plus one [`TaskState`] per settled
//! step. Within a level the context is read-only; step results are written
//! back at the level barrier, which is what lets templates of later levels
//! observe earlier outputs without locking.
//!
//! `forEach` iterations get an ephemeral [`ForEachScope`] layered on top via
//! [`ResolutionScope`]; the scope lives only for its iteration and never
//! leaks into sibling iterations or downstream steps.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

// ============================================================================
// TASK STATUS
// ============================================================================

/// Terminal and transient states of a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TaskStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, TaskStatus::Pending | TaskStatus::Running)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Pending => "Pending",
            TaskStatus::Running => "Running",
            TaskStatus::Succeeded => "Succeeded",
            TaskStatus::Failed => "Failed",
            TaskStatus::Skipped => "Skipped",
            TaskStatus::Cancelled => "Cancelled",
        };
        write!(f, "{s}")
    }
}

// ============================================================================
// TASK STATE
// ============================================================================

/// Everything the context tracks for one settled step.
#[derive(Debug, Clone, Serialize)]
pub struct TaskState {
    pub status: TaskStatus,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub error_kind: Option<String>,
    pub skip_reason: Option<String>,
    pub retry_count: u32,
    pub duration_ms: u64,
    pub resolved_url: Option<String>,
    pub http_method: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TaskState {
    pub fn skipped(reason: impl Into<String>) -> Self {
        Self {
            status: TaskStatus::Skipped,
            skip_reason: Some(reason.into()),
            ..Self::empty(TaskStatus::Skipped)
        }
    }

    pub fn empty(status: TaskStatus) -> Self {
        Self {
            status,
            output: None,
            error: None,
            error_kind: None,
            skip_reason: None,
            retry_count: 0,
            duration_ms: 0,
            resolved_url: None,
            http_method: None,
            started_at: None,
            completed_at: None,
        }
    }
}

// ============================================================================
// EXECUTION CONTEXT
// ============================================================================

/// Per-run context: validated input plus per-step states.
#[derive(Debug, Default, Clone)]
pub struct ExecutionContext {
    input: Map<String, Value>,
    tasks: HashMap<String, TaskState>,
}

impl ExecutionContext {
    pub fn new(input: Map<String, Value>) -> Self {
        Self {
            input,
            tasks: HashMap::new(),
        }
    }

    pub fn input(&self) -> &Map<String, Value> {
        &self.input
    }

    /// Record a settled step. Later writes for the same id replace earlier
    /// ones (a switch-expanded step settles exactly once).
    pub fn record(&mut self, step_id: impl Into<String>, state: TaskState) {
        self.tasks.insert(step_id.into(), state);
    }

    pub fn task(&self, step_id: &str) -> Option<&TaskState> {
        self.tasks.get(step_id)
    }

    /// Output of a step, present only when it succeeded.
    pub fn output_of(&self, step_id: &str) -> Option<&Value> {
        self.tasks
            .get(step_id)
            .filter(|s| s.status == TaskStatus::Succeeded)
            .and_then(|s| s.output.as_ref())
    }

    pub fn task_states(&self) -> impl Iterator<Item = (&str, &TaskState)> {
        self.tasks.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn settled_count(&self) -> usize {
        self.tasks.len()
    }
}

// ============================================================================
// FOR-EACH SCOPE
// ============================================================================

/// Ephemeral frame for one `forEach` iteration.
#[derive(Debug, Clone)]
pub struct ForEachScope {
    /// The declared itemVar identifier.
    pub var: String,
    /// Current element.
    pub item: Value,
    /// Zero-based iteration index.
    pub index: usize,
    /// Whether this is the final element.
    pub is_last: bool,
}

// ============================================================================
// RESOLUTION SCOPE
// ============================================================================

/// Read-only view templates and conditions resolve against: the run
/// context, optionally stacked with a `forEach` frame.
#[derive(Debug, Clone, Copy)]
pub struct ResolutionScope<'a> {
    ctx: &'a ExecutionContext,
    for_each: Option<&'a ForEachScope>,
}

impl<'a> ResolutionScope<'a> {
    pub fn new(ctx: &'a ExecutionContext) -> Self {
        Self {
            ctx,
            for_each: None,
        }
    }

    pub fn with_for_each(ctx: &'a ExecutionContext, frame: &'a ForEachScope) -> Self {
        Self {
            ctx,
            for_each: Some(frame),
        }
    }

    pub fn input_root(&self) -> &'a Map<String, Value> {
        self.ctx.input()
    }

    /// Output of a succeeded step, if any.
    pub fn task_output(&self, step_id: &str) -> Option<&'a Value> {
        self.ctx.output_of(step_id)
    }

    /// Whether the step has settled at all (any terminal status).
    pub fn task_settled(&self, step_id: &str) -> bool {
        self.ctx
            .task(step_id)
            .map(|s| s.status.is_terminal())
            .unwrap_or(false)
    }

    /// Resolve a scoped variable: the itemVar itself, or the implicit
    /// `index` / `isLast` bindings of the active iteration.
    pub fn scoped(&self, var: &str) -> Option<Value> {
        let frame = self.for_each?;
        if var == frame.var {
            Some(frame.item.clone())
        } else if var == "index" {
            Some(Value::from(frame.index as u64))
        } else if var == "isLast" {
            Some(Value::Bool(frame.is_last))
        } else {
            None
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
