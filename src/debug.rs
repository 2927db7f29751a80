//! Interactive workflow stepper
//!
//! Backs `workflow debug <file>`: executes one DAG level at a time so the
//! context can be inspected between levels. Supports breakpoints (run
//! halts before a level containing one) and mock output injection (a step
//! with an injected output is marked Succeeded without dispatching).
//!
//! The stepper executes steps serially; it trades the orchestrator's
//! concurrency for determinism, which is what a debugger wants.

use std::collections::{HashMap, HashSet};

use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::condition::{self, ConditionOutcome};
use crate::context::{ExecutionContext, ForEachScope, ResolutionScope, TaskState, TaskStatus};
use crate::dag::{self, ExecutionPlan};
use crate::error::{EngineError, StepError};
use crate::executor::TaskExecutor;
use crate::registry::TaskRegistry;
use crate::response::ResponseStorage;
use crate::runner::SKIP_REASON_NO_CASE;
use crate::spec::WorkflowSpec;
use crate::template;

// ============================================================================
// COMMANDS
// ============================================================================

/// One line of debugger input.
#[derive(Debug, Clone, PartialEq)]
pub enum DebugCommand {
    /// `plan` - print levels and edges.
    Plan,
    /// `break <step>` - toggle a breakpoint.
    Break(String),
    /// `inject <step> <json>` - mock a step's output.
    Inject(String, Value),
    /// `step` - execute the next level.
    Step,
    /// `run` - execute until a breakpoint or the end.
    Run,
    /// `ctx [step]` - inspect the context.
    Context(Option<String>),
    Help,
    Quit,
}

/// Parse a debugger command line.
pub fn parse_command(line: &str) -> Result<DebugCommand, String> {
    let mut parts = line.trim().splitn(3, ' ');
    let head = parts.next().unwrap_or_default();
    match head {
        "plan" | "p" => Ok(DebugCommand::Plan),
        "step" | "s" => Ok(DebugCommand::Step),
        "run" | "r" => Ok(DebugCommand::Run),
        "help" | "h" | "?" => Ok(DebugCommand::Help),
        "quit" | "q" | "exit" => Ok(DebugCommand::Quit),
        "ctx" | "c" => Ok(DebugCommand::Context(
            parts.next().map(|s| s.to_string()),
        )),
        "break" | "b" => {
            let step = parts
                .next()
                .ok_or_else(|| "usage: break <step>".to_string())?;
            Ok(DebugCommand::Break(step.to_string()))
        }
        "inject" | "i" => {
            let step = parts
                .next()
                .ok_or_else(|| "usage: inject <step> <json>".to_string())?;
            let raw = parts
                .next()
                .ok_or_else(|| "usage: inject <step> <json>".to_string())?;
            let value: Value =
                serde_json::from_str(raw).map_err(|e| format!("bad JSON: {e}"))?;
            Ok(DebugCommand::Inject(step.to_string(), value))
        }
        "" => Err("empty command (try 'help')".to_string()),
        other => Err(format!("unknown command '{other}' (try 'help')")),
    }
}

pub const HELP_TEXT: &str = "\
commands:
  plan              print levels and edges
  step              execute the next level
  run               execute until a breakpoint or the end
  break <step>      toggle a breakpoint on a step
  inject <step> <json>  mock a step's output (skips dispatch)
  ctx [step]        inspect the execution context
  quit              leave the debugger";

// ============================================================================
// SESSION
// ============================================================================

/// A paused execution, advanced one level at a time.
pub struct DebugSession {
    spec: WorkflowSpec,
    plan: ExecutionPlan,
    registry: std::sync::Arc<TaskRegistry>,
    executor: TaskExecutor,
    storage: ResponseStorage,
    ctx: ExecutionContext,
    breakpoints: HashSet<String>,
    injected: HashMap<String, Value>,
    next_level: usize,
}

impl DebugSession {
    pub fn new(
        spec: WorkflowSpec,
        input: Map<String, Value>,
        registry: std::sync::Arc<TaskRegistry>,
        executor: TaskExecutor,
        scratch_dir: std::path::PathBuf,
    ) -> Result<Self, EngineError> {
        let plan = dag::build_plan(&spec)?;
        let storage = ResponseStorage::new(scratch_dir, crate::config::INLINE_BINARY_LIMIT)?;
        Ok(Self {
            spec,
            plan,
            registry,
            executor,
            storage,
            ctx: ExecutionContext::new(input),
            breakpoints: HashSet::new(),
            injected: HashMap::new(),
            next_level: 0,
        })
    }

    pub fn plan(&self) -> &ExecutionPlan {
        &self.plan
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.ctx
    }

    pub fn done(&self) -> bool {
        self.next_level >= self.plan.levels.len()
    }

    pub fn next_level_index(&self) -> usize {
        self.next_level
    }

    /// Toggle a breakpoint; returns whether it is now set.
    pub fn toggle_breakpoint(&mut self, step: &str) -> bool {
        if self.breakpoints.remove(step) {
            false
        } else {
            self.breakpoints.insert(step.to_string());
            true
        }
    }

    pub fn inject(&mut self, step: &str, output: Value) {
        self.injected.insert(step.to_string(), output);
    }

    /// Whether the upcoming level contains a breakpoint.
    pub fn at_breakpoint(&self) -> bool {
        self.plan
            .levels
            .get(self.next_level)
            .map(|level| level.iter().any(|id| self.breakpoints.contains(id)))
            .unwrap_or(false)
    }

    /// Execute the next level serially; returns `(step, status)` pairs.
    pub async fn step_level(&mut self) -> Result<Vec<(String, TaskStatus)>, EngineError> {
        let Some(level) = self.plan.levels.get(self.next_level).cloned() else {
            return Ok(Vec::new());
        };
        self.next_level += 1;

        let mut settled = Vec::with_capacity(level.len());
        for step_id in &level {
            let state = self.execute_step(step_id).await?;
            settled.push((step_id.clone(), state.status));
            self.ctx.record(step_id.clone(), state);
        }
        Ok(settled)
    }

    /// Run until a level with a breakpoint is next, or the end. Invoked
    /// while already halted at a breakpoint, it steps over it.
    pub async fn run_to_breakpoint(
        &mut self,
    ) -> Result<Vec<(String, TaskStatus)>, EngineError> {
        let mut all = Vec::new();
        while !self.done() {
            if self.at_breakpoint() && !all.is_empty() {
                break;
            }
            all.extend(self.step_level().await?);
        }
        Ok(all)
    }

    async fn execute_step(&self, step_id: &str) -> Result<TaskState, EngineError> {
        let step = self
            .spec
            .step(step_id)
            .ok_or_else(|| EngineError::other(format!("unknown step '{step_id}'")))?;

        // Injected outputs short-circuit everything else.
        if let Some(output) = self.injected.get(step_id) {
            let mut state = TaskState::empty(TaskStatus::Succeeded);
            state.output = Some(output.clone());
            return Ok(state);
        }

        let scope = ResolutionScope::new(&self.ctx);

        if let Some(cond) = &step.condition {
            match condition::evaluate(&cond.expr, &scope) {
                ConditionOutcome::Execute => {}
                ConditionOutcome::Skip(reason) => return Ok(TaskState::skipped(reason)),
                ConditionOutcome::Failure(err) => return Ok(failed(&err)),
            }
        }

        let mut task_ref = step.task_ref.clone();
        if let Some(switch) = &step.switch {
            match template::resolve_str(&switch.value, &scope) {
                Err(err) => return Ok(failed(&err)),
                Ok(value) => {
                    let chosen = switch.cases.iter().find(|case| {
                        condition::values_match(&value, &Value::String(case.match_value.clone()))
                    });
                    match (chosen, &switch.default) {
                        (Some(case), _) => task_ref = case.task_ref.clone(),
                        (None, Some(default)) => task_ref = default.task_ref.clone(),
                        (None, None) => return Ok(TaskState::skipped(SKIP_REASON_NO_CASE)),
                    }
                }
            }
        }

        let Some(task) = self.registry.get(&task_ref) else {
            return Ok(failed(&StepError::UnknownTaskRef(task_ref)));
        };
        let timeout = self
            .executor
            .effective_timeout(step.timeout_override(), &task);

        // forEach runs its elements one by one here.
        if let Some(for_each) = &step.for_each {
            let items = match template::resolve_str(&for_each.items, &scope) {
                Ok(Value::Array(items)) => items,
                Ok(_) => {
                    return Ok(failed(&StepError::ForEachNotIterable {
                        detail: "items did not resolve to an array".into(),
                    }))
                }
                Err(err) => return Ok(failed(&err)),
            };

            let len = items.len();
            let mut outputs = Vec::with_capacity(len);
            for (index, item) in items.into_iter().enumerate() {
                let frame = ForEachScope {
                    var: for_each.item_var.clone(),
                    item,
                    index,
                    is_last: index + 1 == len,
                };
                let scoped = ResolutionScope::with_for_each(&self.ctx, &frame);
                let input = match template::resolve_map(&step.input, &scoped) {
                    Ok(input) => input,
                    Err(err) => return Ok(failed(&err)),
                };
                let outcome = self
                    .executor
                    .execute(
                        step_id,
                        &task,
                        &input,
                        timeout,
                        &CancellationToken::new(),
                        &self.storage,
                    )
                    .await;
                if !outcome.success {
                    let err = outcome
                        .error
                        .unwrap_or(StepError::HttpTransport("unknown".into()));
                    return Ok(failed(&err));
                }
                outputs.push(outcome.output.unwrap_or(Value::Null));
            }
            let mut state = TaskState::empty(TaskStatus::Succeeded);
            state.output = Some(Value::Array(outputs));
            return Ok(state);
        }

        let input = match template::resolve_map(&step.input, &scope) {
            Ok(input) => input,
            Err(err) => return Ok(failed(&err)),
        };
        let outcome = self
            .executor
            .execute(
                step_id,
                &task,
                &input,
                timeout,
                &CancellationToken::new(),
                &self.storage,
            )
            .await;

        let mut state = TaskState::empty(if outcome.success {
            TaskStatus::Succeeded
        } else {
            TaskStatus::Failed
        });
        state.output = outcome.output;
        state.error = outcome.error.as_ref().map(|e| e.to_string());
        state.error_kind = outcome.error.as_ref().map(|e| e.kind().to_string());
        state.retry_count = outcome.retry_count;
        state.duration_ms = outcome.duration_ms;
        state.resolved_url = Some(outcome.resolved_url).filter(|u| !u.is_empty());
        state.http_method = Some(outcome.http_method);
        Ok(state)
    }
}

fn failed(err: &StepError) -> TaskState {
    let mut state = TaskState::empty(TaskStatus::Failed);
    state.error = Some(err.to_string());
    state.error_kind = Some(err.kind().into());
    state
}

// ============================================================================
// TESTS
// ============================================================================
