//! # Workflow Orchestrator
//!
//! Drives one execution of a compiled workflow: iterates DAG levels,
//! applies control flow, executes steps concurrently, and produces the
//! trace and the materialized output.
//!
//! ## Execution Flow
//!
//! 1. Compile the plan (levels from `dependsOn`, cycle detection).
//! 2. Per level, decide each step in definition order:
//!    - `condition` - `Skip` marks the step Skipped with a reason;
//!      a condition failure fails the step.
//!    - `switch` - the resolved value picks a case (case-insensitive,
//!      same normalization as `==`) or the default; no match and no
//!      default skips the step with `NoCaseMatched` (non-fatal).
//!    - `forEach` - the resolved sequence becomes one substep per
//!      element, bounded by a per-step semaphore of `max(1, maxParallel)`
//!      (unbounded when 0).
//! 3. Execute the level's surviving steps concurrently under the global
//!    parallelism bound; the level is a strict barrier.
//! 4. Fail-fast: once any step terminates in error, running steps finish
//!    but later levels never start.
//! 5. After all reachable steps settle, resolve the declared outputs; a
//!    reference to a skipped or failed step fails the run with
//!    `OutputUnresolved`.
//!
//! Skip propagation is deliberately non-cascading: a successor of a
//! skipped step runs normally, and a template reading the skipped step's
//! output fails that successor with `TemplateUnresolved`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::condition::{self, ConditionOutcome};
use crate::config::EngineConfig;
use crate::context::{ExecutionContext, ForEachScope, ResolutionScope, TaskState, TaskStatus};
use crate::dag;
use crate::error::{EngineError, StepError};
use crate::executor::{StepOutcome, TaskExecutor};
use crate::registry::{RegisteredTask, TaskRegistry};
use crate::response::ResponseStorage;
use crate::spec::{TaskStep, WorkflowSpec};
use crate::trace::{self, StepInterval, StepTiming, Trace};

/// Skip reason recorded when no switch case matches and no default exists.
pub const SKIP_REASON_NO_CASE: &str = "NoCaseMatched";

// ============================================================================
// RESULT TYPES
// ============================================================================

/// The state machine per execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ExecutionStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExecutionStatus::Pending => "Pending",
            ExecutionStatus::Running => "Running",
            ExecutionStatus::Succeeded => "Succeeded",
            ExecutionStatus::Failed => "Failed",
            ExecutionStatus::Cancelled => "Cancelled",
        };
        write!(f, "{s}")
    }
}

/// One row per step (and per forEach substep) for the API and repository.
#[derive(Debug, Clone, Serialize)]
pub struct TaskExecutionDetail {
    pub step_id: String,
    pub task_ref: String,
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
    pub wait_time_ms: u64,
}

/// Everything one run produces.
#[derive(Debug)]
pub struct RunOutcome {
    pub execution_id: String,
    pub workflow: String,
    pub status: ExecutionStatus,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub error_kind: Option<String>,
    pub details: Vec<TaskExecutionDetail>,
    pub trace: Trace,
    pub context: ExecutionContext,
    pub execution_time_ms: u64,
}

impl RunOutcome {
    pub fn success(&self) -> bool {
        self.status == ExecutionStatus::Succeeded
    }
}

// ============================================================================
// INTERNALS
// ============================================================================

/// Pre-pass decision for one step of a level.
enum Decision<'a> {
    /// Step settled without executing (skip or pre-pass failure).
    Settled {
        step_id: &'a str,
        task_ref: String,
        state: TaskState,
    },
    /// Step will execute (possibly as forEach substeps).
    Execute(ExecUnit<'a>),
}

struct ExecUnit<'a> {
    step: &'a TaskStep,
    /// taskRef after switch expansion.
    task_ref: String,
    task: Arc<RegisteredTask>,
    /// forEach frames, one per element; `None` for a plain step.
    frames: Option<Vec<ForEachScope>>,
    max_parallel: u32,
}

/// Owned result of one executed unit.
struct UnitResult {
    step_id: String,
    task_ref: String,
    state: TaskState,
    /// Substep detail rows (forEach only).
    sub_details: Vec<TaskExecutionDetail>,
    start_ms: u64,
    end_ms: u64,
}

// ============================================================================
// ORCHESTRATOR
// ============================================================================

/// Runs compiled workflows level by level.
#[derive(Clone)]
pub struct Orchestrator {
    executor: TaskExecutor,
    config: Arc<EngineConfig>,
}

impl Orchestrator {
    pub fn new(executor: TaskExecutor, config: Arc<EngineConfig>) -> Self {
        Self { executor, config }
    }

    /// Execute a workflow with the given (already validated) input.
    #[instrument(skip_all, fields(workflow = %workflow_name))]
    pub async fn run(
        &self,
        workflow_name: &str,
        spec: &WorkflowSpec,
        input: Map<String, Value>,
        registry: &TaskRegistry,
        cancel: CancellationToken,
    ) -> Result<RunOutcome, EngineError> {
        let plan = dag::build_plan(spec)?;
        let execution_id = Uuid::new_v4().to_string();
        let started_at = Utc::now();
        let run_start = Instant::now();

        let storage = ResponseStorage::new(
            self.config.scratch_dir.join(&execution_id),
            self.config.inline_binary_limit,
        )?;
        let semaphore = Arc::new(Semaphore::new(self.config.global_parallelism.max(1)));

        let mut ctx = ExecutionContext::new(input);
        let mut details: Vec<TaskExecutionDetail> = Vec::new();
        let mut intervals: Vec<StepInterval> = Vec::new();
        let mut completion_ms: HashMap<String, u64> = HashMap::new();
        // First terminal step error; the run surfaces it while every step
        // that ran still gets its outcome recorded.
        let mut first_error: Option<(String, Option<String>)> = None;

        info!(%execution_id, levels = plan.levels.len(), "execution started");

        'levels: for level in &plan.levels {
            if cancel.is_cancelled() || first_error.is_some() {
                break 'levels;
            }

            // Decide every step of the level against the frozen context.
            let mut units = Vec::new();
            for step_id in level {
                let step = spec
                    .step(step_id)
                    .ok_or_else(|| EngineError::other(format!("plan references unknown step '{step_id}'")))?;
                match self.decide(step, &ctx, registry) {
                    Decision::Settled {
                        step_id,
                        task_ref,
                        state,
                    } => {
                        if state.status == TaskStatus::Failed && first_error.is_none() {
                            debug!(step = step_id, "step failed in pre-pass");
                            first_error = Some((
                                format!(
                                    "step '{}': {}",
                                    step_id,
                                    state.error.clone().unwrap_or_default()
                                ),
                                state.error_kind.clone(),
                            ));
                        }
                        details.push(detail_from_state(step_id, &task_ref, &state, 0));
                        ctx.record(step_id, state);
                    }
                    Decision::Execute(unit) => units.push(unit),
                }
            }

            // Wait time baseline: completion of the last predecessor.
            let waits: Vec<u64> = units
                .iter()
                .map(|u| {
                    plan.predecessors(&u.step.id)
                        .iter()
                        .filter_map(|p| completion_ms.get(p))
                        .copied()
                        .max()
                        .unwrap_or(0)
                })
                .collect();

            // Execute the level concurrently; the join is the barrier.
            let futures = units.into_iter().map(|unit| {
                self.run_unit(unit, &ctx, &semaphore, &cancel, &storage, run_start)
            });
            let results: Vec<UnitResult> = join_all(futures).await;

            for (result, enabled_ms) in results.into_iter().zip(waits) {
                let wait_time_ms = result.start_ms.saturating_sub(enabled_ms);
                completion_ms.insert(result.step_id.clone(), result.end_ms);
                intervals.push(StepInterval {
                    step_id: result.step_id.clone(),
                    start_ms: result.start_ms,
                    end_ms: result.end_ms,
                });

                if result.state.status == TaskStatus::Failed && first_error.is_none() {
                    first_error = Some((
                        format!(
                            "step '{}': {}",
                            result.step_id,
                            result.state.error.clone().unwrap_or_default()
                        ),
                        result.state.error_kind.clone(),
                    ));
                }

                details.push(detail_from_state(
                    &result.step_id,
                    &result.task_ref,
                    &result.state,
                    wait_time_ms,
                ));
                details.extend(result.sub_details);
                ctx.record(result.step_id, result.state);
            }
        }

        // Run-level status.
        let mut status = if cancel.is_cancelled() {
            ExecutionStatus::Cancelled
        } else if first_error.is_some() {
            ExecutionStatus::Failed
        } else {
            ExecutionStatus::Succeeded
        };

        let mut error: Option<String> = None;
        let mut error_kind: Option<String> = None;
        if let Some((message, kind)) = first_error {
            error = Some(message);
            error_kind = kind;
        }

        // Output materialization.
        let mut output = None;
        if status == ExecutionStatus::Succeeded && !spec.output.is_empty() {
            let scope = ResolutionScope::new(&ctx);
            let mut materialized = Map::new();
            for (name, raw) in &spec.output {
                match crate::template::resolve_str(raw, &scope) {
                    Ok(value) => {
                        materialized.insert(name.clone(), value);
                    }
                    Err(err) => {
                        status = ExecutionStatus::Failed;
                        error = Some(format!("output '{name}': {err}"));
                        error_kind = Some("OutputUnresolved".into());
                        break;
                    }
                }
            }
            if status == ExecutionStatus::Succeeded {
                output = Some(Value::Object(materialized));
            }
        } else if status == ExecutionStatus::Succeeded {
            output = Some(Value::Object(Map::new()));
        }

        // Temp files never outlive the run, on any termination path.
        let removed = storage.cleanup();
        if removed > 0 {
            debug!(removed, "cleaned spilled response files");
        }

        let completed_at = Utc::now();
        let steps = details
            .iter()
            .map(|d| StepTiming {
                step_id: d.step_id.clone(),
                status: d.status,
                started_at: d.started_at,
                completed_at: d.completed_at,
                duration_ms: d.duration_ms,
                wait_time_ms: d.wait_time_ms,
            })
            .collect();

        let trace = Trace {
            execution_id: execution_id.clone(),
            workflow: workflow_name.to_string(),
            started_at,
            completed_at,
            steps,
            planned_groups: plan.levels.clone(),
            actual_groups: trace::actual_groups(&intervals),
        };

        info!(%execution_id, %status, "execution settled");

        Ok(RunOutcome {
            execution_id,
            workflow: workflow_name.to_string(),
            status,
            output,
            error,
            error_kind,
            details,
            trace,
            context: ctx,
            execution_time_ms: run_start.elapsed().as_millis() as u64,
        })
    }

    /// Pre-pass: condition, switch expansion, forEach expansion.
    fn decide<'a>(
        &self,
        step: &'a TaskStep,
        ctx: &ExecutionContext,
        registry: &TaskRegistry,
    ) -> Decision<'a> {
        let scope = ResolutionScope::new(ctx);

        if let Some(cond) = &step.condition {
            match condition::evaluate(&cond.expr, &scope) {
                ConditionOutcome::Execute => {}
                ConditionOutcome::Skip(reason) => {
                    debug!(step = %step.id, "condition skipped step");
                    return Decision::Settled {
                        step_id: &step.id,
                        task_ref: step.task_ref.clone(),
                        state: TaskState::skipped(reason),
                    };
                }
                ConditionOutcome::Failure(err) => {
                    return Decision::Settled {
                        step_id: &step.id,
                        task_ref: step.task_ref.clone(),
                        state: failed_state(&err),
                    };
                }
            }
        }

        // Switch expansion: the chosen case's taskRef replaces the step's.
        let mut task_ref = step.task_ref.clone();
        if let Some(switch) = &step.switch {
            match crate::template::resolve_str(&switch.value, &scope) {
                Err(err) => {
                    return Decision::Settled {
                        step_id: &step.id,
                        task_ref,
                        state: failed_state(&err),
                    }
                }
                Ok(value) => {
                    let chosen = switch.cases.iter().find(|case| {
                        condition::values_match(&value, &Value::String(case.match_value.clone()))
                    });
                    match (chosen, &switch.default) {
                        (Some(case), _) => task_ref = case.task_ref.clone(),
                        (None, Some(default)) => task_ref = default.task_ref.clone(),
                        (None, None) => {
                            return Decision::Settled {
                                step_id: &step.id,
                                task_ref,
                                state: TaskState::skipped(SKIP_REASON_NO_CASE),
                            }
                        }
                    }
                }
            }
        }

        let Some(task) = registry.get(&task_ref) else {
            return Decision::Settled {
                step_id: &step.id,
                task_ref: task_ref.clone(),
                state: failed_state(&StepError::UnknownTaskRef(task_ref)),
            };
        };

        // forEach expansion: one frame per element.
        let mut frames = None;
        let mut max_parallel = 0;
        if let Some(for_each) = &step.for_each {
            match crate::template::resolve_str(&for_each.items, &scope) {
                Err(err) => {
                    return Decision::Settled {
                        step_id: &step.id,
                        task_ref,
                        state: failed_state(&err),
                    }
                }
                Ok(Value::Array(items)) => {
                    let len = items.len();
                    frames = Some(
                        items
                            .into_iter()
                            .enumerate()
                            .map(|(index, item)| ForEachScope {
                                var: for_each.item_var.clone(),
                                item,
                                index,
                                is_last: index + 1 == len,
                            })
                            .collect(),
                    );
                    max_parallel = for_each.max_parallel;
                }
                Ok(other) => {
                    let err = StepError::ForEachNotIterable {
                        detail: format!("resolved to {}", type_name(&other)),
                    };
                    return Decision::Settled {
                        step_id: &step.id,
                        task_ref,
                        state: failed_state(&err),
                    };
                }
            }
        }

        Decision::Execute(ExecUnit {
            step,
            task_ref,
            task,
            frames,
            max_parallel,
        })
    }

    /// Execute one unit: a plain step or a fan of forEach substeps.
    async fn run_unit(
        &self,
        unit: ExecUnit<'_>,
        ctx: &ExecutionContext,
        semaphore: &Arc<Semaphore>,
        cancel: &CancellationToken,
        storage: &ResponseStorage,
        run_start: Instant,
    ) -> UnitResult {
        let step = unit.step;
        let timeout = self.executor.effective_timeout(step.timeout_override(), &unit.task);
        let start_ms = run_start.elapsed().as_millis() as u64;
        let unit_started_at = Utc::now();

        let result = match unit.frames {
            None => {
                let (state, actual_start, actual_end) = self
                    .run_single(
                        step, &unit.task, None, timeout, ctx, semaphore, cancel, storage,
                        run_start,
                    )
                    .await;
                UnitResult {
                    step_id: step.id.clone(),
                    task_ref: unit.task_ref,
                    state,
                    sub_details: Vec::new(),
                    start_ms: actual_start,
                    end_ms: actual_end,
                }
            }
            Some(frames) => {
                // Per-step bound: max(1, maxParallel); 0 means unbounded.
                let local = match unit.max_parallel {
                    0 => None,
                    n => Some(Arc::new(Semaphore::new(n.max(1) as usize))),
                };

                let substeps = frames.into_iter().map(|frame| {
                    let local = local.clone();
                    let task = Arc::clone(&unit.task);
                    async move {
                        let _local_permit = match &local {
                            Some(sem) => sem.acquire().await.ok(),
                            None => None,
                        };
                        let index = frame.index;
                        let (state, sub_start, sub_end) = self
                            .run_single(
                                step,
                                &task,
                                Some(&frame),
                                timeout,
                                ctx,
                                semaphore,
                                cancel,
                                storage,
                                run_start,
                            )
                            .await;
                        (index, state, sub_start, sub_end)
                    }
                });

                let settled = join_all(substeps).await;
                let mut sub_details = Vec::with_capacity(settled.len());
                let mut outputs = Vec::with_capacity(settled.len());
                let mut element_errors = Vec::new();
                let mut retry_total = 0u32;
                let mut any_cancelled = false;
                let mut first_kind = None;
                let mut window_start = start_ms;
                let mut window_end = start_ms;

                for (index, state, sub_start, sub_end) in &settled {
                    window_start = window_start.min(*sub_start);
                    window_end = window_end.max(*sub_end);
                    retry_total += state.retry_count;
                    match state.status {
                        TaskStatus::Succeeded => {
                            outputs.push(state.output.clone().unwrap_or(Value::Null));
                        }
                        TaskStatus::Cancelled => any_cancelled = true,
                        _ => {
                            if first_kind.is_none() {
                                first_kind = state.error_kind.clone();
                            }
                            element_errors.push(format!(
                                "index {index}: {}",
                                state.error.clone().unwrap_or_default()
                            ));
                        }
                    }
                    sub_details.push(detail_from_state(
                        &format!("{}[{}]", step.id, index),
                        &unit.task_ref,
                        state,
                        0,
                    ));
                }

                let all_ok = element_errors.is_empty() && !any_cancelled;
                let mut state = TaskState::empty(if all_ok {
                    TaskStatus::Succeeded
                } else if !element_errors.is_empty() {
                    TaskStatus::Failed
                } else {
                    TaskStatus::Cancelled
                });
                state.retry_count = retry_total;
                state.started_at = Some(unit_started_at);
                state.completed_at = Some(Utc::now());
                if all_ok {
                    state.output = Some(Value::Array(outputs));
                } else if !element_errors.is_empty() {
                    state.error = Some(element_errors.join("; "));
                    state.error_kind = first_kind;
                } else {
                    state.error = Some(StepError::TaskCancelled.to_string());
                    state.error_kind = Some(StepError::TaskCancelled.kind().into());
                }
                state.duration_ms = window_end.saturating_sub(window_start);

                UnitResult {
                    step_id: step.id.clone(),
                    task_ref: unit.task_ref,
                    state,
                    sub_details,
                    start_ms: window_start,
                    end_ms: window_end,
                }
            }
        };

        result
    }

    /// Resolve input and execute one step (or substep) under the global
    /// parallelism bound. Returns the state plus the observed
    /// `[start, end]` window in ms offsets from run start.
    #[allow(clippy::too_many_arguments)]
    async fn run_single(
        &self,
        step: &TaskStep,
        task: &RegisteredTask,
        frame: Option<&ForEachScope>,
        timeout: std::time::Duration,
        ctx: &ExecutionContext,
        semaphore: &Arc<Semaphore>,
        cancel: &CancellationToken,
        storage: &ResponseStorage,
        run_start: Instant,
    ) -> (TaskState, u64, u64) {
        let Ok(_permit) = semaphore.acquire().await else {
            let now = run_start.elapsed().as_millis() as u64;
            return (failed_state(&StepError::TaskCancelled), now, now);
        };

        let start_ms = run_start.elapsed().as_millis() as u64;
        let started_at = Utc::now();
        let scope = match frame {
            Some(frame) => ResolutionScope::with_for_each(ctx, frame),
            None => ResolutionScope::new(ctx),
        };

        // Template resolution; a failure here produces no HTTP request.
        let input = match crate::template::resolve_map(&step.input, &scope) {
            Ok(input) => input,
            Err(err) => {
                let mut state = failed_state(&err);
                state.started_at = Some(started_at);
                state.completed_at = Some(Utc::now());
                let end_ms = run_start.elapsed().as_millis() as u64;
                return (state, start_ms, end_ms);
            }
        };

        let outcome = self
            .executor
            .execute(&step.id, task, &input, timeout, cancel, storage)
            .await;

        let end_ms = run_start.elapsed().as_millis() as u64;
        (state_from_outcome(outcome, started_at), start_ms, end_ms)
    }
}

// ============================================================================
// STATE HELPERS
// ============================================================================

fn failed_state(err: &StepError) -> TaskState {
    let status = if matches!(err, StepError::TaskCancelled) {
        TaskStatus::Cancelled
    } else {
        TaskStatus::Failed
    };
    let mut state = TaskState::empty(status);
    state.error = Some(err.to_string());
    state.error_kind = Some(err.kind().into());
    state
}

fn state_from_outcome(outcome: StepOutcome, started_at: DateTime<Utc>) -> TaskState {
    let status = if outcome.success {
        TaskStatus::Succeeded
    } else if matches!(outcome.error, Some(StepError::TaskCancelled)) {
        TaskStatus::Cancelled
    } else {
        TaskStatus::Failed
    };

    TaskState {
        status,
        output: outcome.output,
        error: outcome.error.as_ref().map(|e| e.to_string()),
        error_kind: outcome.error.as_ref().map(|e| e.kind().to_string()),
        skip_reason: None,
        retry_count: outcome.retry_count,
        duration_ms: outcome.duration_ms,
        resolved_url: Some(outcome.resolved_url).filter(|u| !u.is_empty()),
        http_method: Some(outcome.http_method),
        started_at: Some(started_at),
        completed_at: Some(Utc::now()),
    }
}

fn detail_from_state(
    step_id: &str,
    task_ref: &str,
    state: &TaskState,
    wait_time_ms: u64,
) -> TaskExecutionDetail {
    TaskExecutionDetail {
        step_id: step_id.to_string(),
        task_ref: task_ref.to_string(),
        status: state.status,
        output: state.output.clone(),
        error: state.error.clone(),
        error_kind: state.error_kind.clone(),
        skip_reason: state.skip_reason.clone(),
        retry_count: state.retry_count,
        duration_ms: state.duration_ms,
        resolved_url: state.resolved_url.clone(),
        http_method: state.http_method.clone(),
        started_at: state.started_at,
        completed_at: state.completed_at,
        wait_time_ms,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{MockDispatcher, MockResponse};
    use crate::spec::WorkflowManifest;
    use serde_json::json;

    fn harness(mock: Arc<MockDispatcher>) -> (Orchestrator, TaskRegistry) {
        let config = Arc::new(EngineConfig::testing());
        let executor = TaskExecutor::new(mock, Arc::clone(&config));
        (Orchestrator::new(executor, config), TaskRegistry::new())
    }

    fn register_echo(registry: &TaskRegistry, name: &str, url: &str) {
        let def = serde_json::from_value(json!({
            "http": {"url": url, "method": "POST"},
        }))
        .unwrap();
        registry.register(name, def).unwrap();
    }

    fn workflow(yaml: &str) -> WorkflowSpec {
        WorkflowManifest::from_yaml(yaml).unwrap().spec
    }

    fn input(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    async fn run(
        orch: &Orchestrator,
        registry: &TaskRegistry,
        spec: &WorkflowSpec,
        input: Map<String, Value>,
    ) -> RunOutcome {
        orch.run("test", spec, input, registry, CancellationToken::new())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn linear_chain_passes_outputs_forward() {
        let mock = Arc::new(MockDispatcher::echo());
        let (orch, registry) = harness(Arc::clone(&mock));
        register_echo(&registry, "echo", "http://t/echo");

        let spec = workflow(
            r#"
apiVersion: strata.io/v1
kind: Workflow
metadata: { name: linear }
spec:
  tasks:
    - id: a
      taskRef: echo
      input: { value: "{{ input.x }}" }
    - id: b
      taskRef: echo
      dependsOn: [a]
      input: { value: "{{ tasks.a.output.value }}" }
    - id: c
      taskRef: echo
      dependsOn: [b]
      input: { value: "{{ tasks.b.output.value }}" }
  output:
    result: "{{ tasks.c.output.value }}"
"#,
        );

        let outcome = run(&orch, &registry, &spec, input(&[("x", json!(1))])).await;

        assert_eq!(outcome.status, ExecutionStatus::Succeeded);
        assert_eq!(outcome.details.len(), 3);
        // Type preservation end to end: the integer survives.
        assert_eq!(outcome.output, Some(json!({"result": 1})));
        assert_eq!(
            outcome.trace.planned_groups,
            vec![vec!["a"], vec!["b"], vec!["c"]]
        );
    }

    #[tokio::test]
    async fn condition_false_skips_without_http() {
        let mock = Arc::new(MockDispatcher::echo());
        let (orch, registry) = harness(Arc::clone(&mock));
        register_echo(&registry, "echo", "http://t/echo");

        let spec = workflow(
            r#"
apiVersion: strata.io/v1
kind: Workflow
metadata: { name: cond }
spec:
  tasks:
    - id: pay
      taskRef: echo
      condition:
        if: '{{ input.kind }} == "free"'
      input: { amount: "1" }
"#,
        );

        let outcome = run(&orch, &registry, &spec, input(&[("kind", json!("paid"))])).await;

        assert_eq!(outcome.status, ExecutionStatus::Succeeded);
        let pay = outcome.context.task("pay").unwrap();
        assert_eq!(pay.status, TaskStatus::Skipped);
        assert_eq!(
            pay.skip_reason.as_deref(),
            Some("condition evaluated to false")
        );
        // Skip purity: no HTTP issued.
        assert_eq!(mock.requests().len(), 0);
    }

    #[tokio::test]
    async fn downstream_of_skipped_step_fails_with_template_unresolved() {
        let mock = Arc::new(MockDispatcher::echo());
        let (orch, registry) = harness(Arc::clone(&mock));
        register_echo(&registry, "echo", "http://t/echo");

        let spec = workflow(
            r#"
apiVersion: strata.io/v1
kind: Workflow
metadata: { name: skip-chain }
spec:
  tasks:
    - id: pay
      taskRef: echo
      condition:
        if: '{{ input.kind }} == "free"'
      input: { amount: "1" }
    - id: receipt
      taskRef: echo
      dependsOn: [pay]
      input: { ref: "{{ tasks.pay.output.amount }}" }
"#,
        );

        let outcome = run(&orch, &registry, &spec, input(&[("kind", json!("paid"))])).await;

        assert_eq!(outcome.status, ExecutionStatus::Failed);
        let receipt = outcome.context.task("receipt").unwrap();
        assert_eq!(receipt.status, TaskStatus::Failed);
        assert_eq!(receipt.error_kind.as_deref(), Some("TemplateUnresolved"));
        // The skipped step itself stays Skipped (no cascade).
        assert_eq!(
            outcome.context.task("pay").unwrap().status,
            TaskStatus::Skipped
        );
    }

    #[tokio::test]
    async fn switch_picks_case_and_default() {
        let mock = Arc::new(MockDispatcher::new());
        mock.enqueue("POST", "http://t/gold", MockResponse::json(200, json!({"tier": "gold"})));
        mock.enqueue("POST", "http://t/base", MockResponse::json(200, json!({"tier": "base"})));

        let (orch, registry) = harness(Arc::clone(&mock));
        register_echo(&registry, "route", "http://t/base");
        register_echo(&registry, "gold-route", "http://t/gold");

        let spec = workflow(
            r#"
apiVersion: strata.io/v1
kind: Workflow
metadata: { name: switch }
spec:
  tasks:
    - id: route
      taskRef: route
      switch:
        value: "{{ input.tier }}"
        cases:
          - { match: GOLD, taskRef: gold-route }
        default: { taskRef: route }
"#,
        );

        // Case-insensitive match picks the gold route.
        let outcome = run(&orch, &registry, &spec, input(&[("tier", json!("gold"))])).await;
        assert_eq!(outcome.status, ExecutionStatus::Succeeded);
        assert_eq!(
            outcome.context.task("route").unwrap().output,
            Some(json!({"tier": "gold"}))
        );

        // Unmatched value takes the default.
        let outcome = run(&orch, &registry, &spec, input(&[("tier", json!("iron"))])).await;
        assert_eq!(
            outcome.context.task("route").unwrap().output,
            Some(json!({"tier": "base"}))
        );
    }

    #[tokio::test]
    async fn switch_without_match_or_default_skips_non_fatally() {
        let mock = Arc::new(MockDispatcher::echo());
        let (orch, registry) = harness(Arc::clone(&mock));
        register_echo(&registry, "echo", "http://t/echo");

        let spec = workflow(
            r#"
apiVersion: strata.io/v1
kind: Workflow
metadata: { name: switch-skip }
spec:
  tasks:
    - id: route
      taskRef: echo
      switch:
        value: "{{ input.tier }}"
        cases:
          - { match: gold, taskRef: echo }
          - { match: silver, taskRef: echo }
    - id: after
      taskRef: echo
      input: { ok: "yes" }
"#,
        );

        let outcome = run(&orch, &registry, &spec, input(&[("tier", json!("bronze"))])).await;

        // Execution continues.
        assert_eq!(outcome.status, ExecutionStatus::Succeeded);
        let route = outcome.context.task("route").unwrap();
        assert_eq!(route.status, TaskStatus::Skipped);
        assert_eq!(route.skip_reason.as_deref(), Some(SKIP_REASON_NO_CASE));
        assert_eq!(
            outcome.context.task("after").unwrap().status,
            TaskStatus::Succeeded
        );
    }

    #[tokio::test]
    async fn for_each_fans_out_and_aggregates() {
        let mock = Arc::new(MockDispatcher::echo());
        let (orch, registry) = harness(Arc::clone(&mock));
        register_echo(&registry, "notify", "http://t/notify");

        let spec = workflow(
            r#"
apiVersion: strata.io/v1
kind: Workflow
metadata: { name: fan }
spec:
  tasks:
    - id: fan
      taskRef: notify
      forEach:
        items: "{{ input.ids }}"
        itemVar: id
        maxParallel: 2
      input:
        target: "{{ id }}"
        position: "{{ index }}"
        last: "{{ isLast }}"
"#,
        );

        let outcome = run(
            &orch,
            &registry,
            &spec,
            input(&[("ids", json!(["a", "b", "c", "d"]))]),
        )
        .await;

        assert_eq!(outcome.status, ExecutionStatus::Succeeded);

        // One aggregate row plus four substep rows.
        let subs: Vec<_> = outcome
            .details
            .iter()
            .filter(|d| d.step_id.starts_with("fan["))
            .collect();
        assert_eq!(subs.len(), 4);

        let state = outcome.context.task("fan").unwrap();
        let outputs = state.output.as_ref().unwrap().as_array().unwrap();
        assert_eq!(outputs.len(), 4);
        assert_eq!(outputs[0], json!({"target": "a", "position": 0, "last": false}));
        assert_eq!(outputs[3], json!({"target": "d", "position": 3, "last": true}));
        assert_eq!(mock.requests().len(), 4);
    }

    #[tokio::test]
    async fn for_each_on_non_array_fails() {
        let mock = Arc::new(MockDispatcher::echo());
        let (orch, registry) = harness(Arc::clone(&mock));
        register_echo(&registry, "echo", "http://t/echo");

        let spec = workflow(
            r#"
apiVersion: strata.io/v1
kind: Workflow
metadata: { name: fan-bad }
spec:
  tasks:
    - id: fan
      taskRef: echo
      forEach:
        items: "{{ input.ids }}"
        itemVar: id
      input: { target: "{{ id }}" }
"#,
        );

        let outcome = run(&orch, &registry, &spec, input(&[("ids", json!("oops"))])).await;

        assert_eq!(outcome.status, ExecutionStatus::Failed);
        let fan = outcome.context.task("fan").unwrap();
        assert_eq!(fan.error_kind.as_deref(), Some("ForEachNotIterable"));
        assert_eq!(mock.requests().len(), 0);
    }

    #[tokio::test]
    async fn for_each_partial_failure_collects_element_errors() {
        let mock = Arc::new(MockDispatcher::new());
        // Strict mock: scripted 200 for two targets, 404 for the third.
        mock.enqueue("POST", "http://t/n", MockResponse::json(200, json!({"ok": 1})));
        mock.enqueue("POST", "http://t/n", MockResponse::json(404, json!({})));
        mock.enqueue("POST", "http://t/n", MockResponse::json(200, json!({"ok": 2})));

        let (orch, registry) = harness(Arc::clone(&mock));
        register_echo(&registry, "notify", "http://t/n");

        let spec = workflow(
            r#"
apiVersion: strata.io/v1
kind: Workflow
metadata: { name: fan-partial }
spec:
  tasks:
    - id: fan
      taskRef: notify
      forEach:
        items: "{{ input.ids }}"
        itemVar: id
        maxParallel: 1
      input: { target: "{{ id }}" }
"#,
        );

        let outcome = run(&orch, &registry, &spec, input(&[("ids", json!([1, 2, 3]))])).await;

        assert_eq!(outcome.status, ExecutionStatus::Failed);
        let fan = outcome.context.task("fan").unwrap();
        assert_eq!(fan.status, TaskStatus::Failed);
        assert!(fan.error.as_ref().unwrap().contains("index 1"));
    }

    #[tokio::test]
    async fn fail_fast_stops_later_levels() {
        let mock = Arc::new(MockDispatcher::new());
        mock.enqueue("POST", "http://t/a", MockResponse::json(400, json!({})));

        let (orch, registry) = harness(Arc::clone(&mock));
        register_echo(&registry, "first", "http://t/a");
        register_echo(&registry, "second", "http://t/b");

        let spec = workflow(
            r#"
apiVersion: strata.io/v1
kind: Workflow
metadata: { name: failfast }
spec:
  tasks:
    - id: a
      taskRef: first
      input: { v: "1" }
    - id: b
      taskRef: second
      dependsOn: [a]
      input: { v: "2" }
"#,
        );

        let outcome = run(&orch, &registry, &spec, Map::new()).await;

        assert_eq!(outcome.status, ExecutionStatus::Failed);
        assert!(outcome.error.is_some());
        // Level 1 never started.
        assert!(outcome.context.task("b").is_none());
        assert_eq!(mock.hits("http://t/b"), 0);
    }

    #[tokio::test]
    async fn causality_and_level_barrier_hold() {
        let mock = Arc::new(MockDispatcher::echo());
        let (orch, registry) = harness(Arc::clone(&mock));
        register_echo(&registry, "echo", "http://t/echo");

        let spec = workflow(
            r#"
apiVersion: strata.io/v1
kind: Workflow
metadata: { name: diamond }
spec:
  tasks:
    - id: a
      taskRef: echo
      input: { v: "1" }
    - id: b
      taskRef: echo
      dependsOn: [a]
      input: { v: "{{ tasks.a.output.v }}" }
    - id: c
      taskRef: echo
      dependsOn: [a]
      input: { v: "{{ tasks.a.output.v }}" }
    - id: d
      taskRef: echo
      dependsOn: [b, c]
      input: { v: "{{ tasks.b.output.v }}" }
"#,
        );

        let outcome = run(&orch, &registry, &spec, Map::new()).await;
        assert_eq!(outcome.status, ExecutionStatus::Succeeded);

        let at = |id: &str| outcome.context.task(id).unwrap();
        // Causality: predecessor completion <= successor start.
        assert!(at("a").completed_at.unwrap() <= at("b").started_at.unwrap());
        assert!(at("a").completed_at.unwrap() <= at("c").started_at.unwrap());
        // Barrier: d starts after both b and c complete.
        assert!(at("b").completed_at.unwrap() <= at("d").started_at.unwrap());
        assert!(at("c").completed_at.unwrap() <= at("d").started_at.unwrap());
    }

    #[tokio::test]
    async fn external_cancellation_marks_run_cancelled() {
        let mock = Arc::new(MockDispatcher::new());
        mock.enqueue(
            "POST",
            "http://t/slow",
            MockResponse::json(200, json!({})).with_delay(std::time::Duration::from_secs(30)),
        );

        let (orch, registry) = harness(Arc::clone(&mock));
        register_echo(&registry, "slow", "http://t/slow");

        let spec = workflow(
            r#"
apiVersion: strata.io/v1
kind: Workflow
metadata: { name: cancel }
spec:
  tasks:
    - id: s
      taskRef: slow
      timeout: 60s
      input: { v: "1" }
"#,
        );

        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(30)).await;
            canceller.cancel();
        });

        let outcome = orch
            .run("cancel", &spec, Map::new(), &registry, cancel)
            .await
            .unwrap();

        assert_eq!(outcome.status, ExecutionStatus::Cancelled);
        assert_eq!(
            outcome.context.task("s").unwrap().status,
            TaskStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn output_referencing_failed_step_is_output_unresolved() {
        let mock = Arc::new(MockDispatcher::echo());
        let (orch, registry) = harness(Arc::clone(&mock));
        register_echo(&registry, "echo", "http://t/echo");

        let spec = workflow(
            r#"
apiVersion: strata.io/v1
kind: Workflow
metadata: { name: out-skip }
spec:
  tasks:
    - id: maybe
      taskRef: echo
      condition:
        if: "false"
      input: { v: "1" }
  output:
    value: "{{ tasks.maybe.output.v }}"
"#,
        );

        let outcome = run(&orch, &registry, &spec, Map::new()).await;

        assert_eq!(outcome.status, ExecutionStatus::Failed);
        assert_eq!(outcome.error_kind.as_deref(), Some("OutputUnresolved"));
        assert!(outcome.output.is_none());
    }

    #[tokio::test]
    async fn unknown_task_ref_fails_the_step() {
        let mock = Arc::new(MockDispatcher::echo());
        let (orch, registry) = harness(Arc::clone(&mock));

        let spec = workflow(
            r#"
apiVersion: strata.io/v1
kind: Workflow
metadata: { name: ghost }
spec:
  tasks:
    - id: a
      taskRef: ghost
      input: { v: "1" }
"#,
        );

        let outcome = run(&orch, &registry, &spec, Map::new()).await;
        assert_eq!(outcome.status, ExecutionStatus::Failed);
        assert_eq!(
            outcome.context.task("a").unwrap().error_kind.as_deref(),
            Some("UnknownTaskRef")
        );
    }
}
