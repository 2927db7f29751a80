//! # Engine Facade
//!
//! The entry point embedders (and the CLI) talk to: workflow/task
//! registration, execution, dry runs, traces, validation, and the
//! contract/lifecycle surface. The HTTP facade and the Kubernetes
//! controller are external collaborators of this type; nothing here
//! assumes a transport.

use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use crate::config::EngineConfig;
use crate::context::ResolutionScope;
use crate::contract::{ContractVerifier, InteractionStore, RecordedInteraction};
use crate::dag;
use crate::deploy::{DeployCheck, DeploymentMatrix};
use crate::dispatch::Dispatcher;
use crate::error::EngineError;
use crate::executor::TaskExecutor;
use crate::impact::{self, ImpactReport, ProposedChange};
use crate::registry::{LifecycleState, TaskRegistry};
use crate::repository::{ExecutionRecord, ExecutionRepository, TaskExecutionRecord};
use crate::runner::{Orchestrator, TaskExecutionDetail};
use crate::spec::{TaskManifest, WorkflowManifest, WorkflowSpec};
use crate::template;
use crate::trace::Trace;
use crate::usage::ContractIndex;
use crate::validator::{ValidationResult, Validator};

// ============================================================================
// API SHAPES
// ============================================================================

/// Result of `Execute`.
#[derive(Debug, Serialize)]
pub struct ExecutionReport {
    pub execution_id: String,
    pub success: bool,
    pub output: Option<Value>,
    pub task_details: Vec<TaskExecutionDetail>,
    pub execution_time_ms: u64,
    pub error: Option<String>,
}

/// One step of a dry-run execution plan.
#[derive(Debug, Clone, Serialize)]
pub struct PlannedTask {
    pub id: String,
    pub task_ref: String,
    pub resolved_input: Value,
    pub dependencies: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct ExecutionPlanView {
    pub tasks: Vec<PlannedTask>,
    pub parallel_groups: Vec<Vec<String>>,
}

/// Result of `DryRun`: validation plus the plan, no HTTP issued.
#[derive(Debug, Serialize)]
pub struct DryRunReport {
    pub valid: bool,
    pub execution_plan: Option<ExecutionPlanView>,
    pub errors: Vec<String>,
}

/// A registered workflow under its fully qualified name.
#[derive(Debug, Clone)]
pub struct RegisteredWorkflow {
    pub name: String,
    pub namespace: String,
    pub spec: WorkflowSpec,
}

// ============================================================================
// ENGINE
// ============================================================================

/// Declarative workflow orchestration engine.
pub struct WorkflowEngine {
    registry: Arc<TaskRegistry>,
    workflows: DashMap<String, Arc<RegisteredWorkflow>>,
    repository: Arc<dyn ExecutionRepository>,
    dispatcher: Arc<dyn Dispatcher>,
    contracts: Arc<ContractIndex>,
    matrix: Arc<DeploymentMatrix>,
    interactions: Arc<InteractionStore>,
    traces: DashMap<String, Trace>,
    orchestrator: Orchestrator,
    config: Arc<EngineConfig>,
}

impl WorkflowEngine {
    pub fn new(
        dispatcher: Arc<dyn Dispatcher>,
        repository: Arc<dyn ExecutionRepository>,
        config: EngineConfig,
    ) -> Self {
        let config = Arc::new(config);
        let executor = TaskExecutor::new(Arc::clone(&dispatcher), Arc::clone(&config));
        Self {
            registry: Arc::new(TaskRegistry::new()),
            workflows: DashMap::new(),
            repository,
            dispatcher: Arc::clone(&dispatcher),
            contracts: Arc::new(ContractIndex::new()),
            matrix: Arc::new(DeploymentMatrix::standard()),
            interactions: Arc::new(InteractionStore::new()),
            traces: DashMap::new(),
            orchestrator: Orchestrator::new(executor, Arc::clone(&config)),
            config,
        }
    }

    /// Engine wired for local runs and tests: mock dispatch, in-memory
    /// repository.
    pub fn local() -> Self {
        Self::new(
            Arc::new(crate::dispatch::MockDispatcher::echo()),
            Arc::new(crate::repository::InMemoryRepository::new()),
            EngineConfig::default(),
        )
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    pub fn contracts(&self) -> &ContractIndex {
        &self.contracts
    }

    pub fn matrix(&self) -> &DeploymentMatrix {
        &self.matrix
    }

    pub fn interactions(&self) -> &InteractionStore {
        &self.interactions
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ========== Registration ==========

    pub fn register_task_yaml(&self, yaml: &str) -> Result<String, EngineError> {
        let manifest = TaskManifest::from_yaml(yaml)?;
        let name = manifest.metadata.name.clone();
        self.registry.register_manifest(manifest)?;
        info!(task = %name, "task registered");
        Ok(name)
    }

    /// Validate and register a workflow; consumer contracts are
    /// regenerated on success. The returned result carries warnings even
    /// for valid workflows.
    pub fn register_workflow_yaml(&self, yaml: &str) -> Result<ValidationResult, EngineError> {
        let manifest = WorkflowManifest::from_yaml(yaml)?;
        self.register_workflow(
            &manifest.metadata.name.clone(),
            &manifest.metadata.namespace.clone(),
            manifest.spec,
        )
    }

    pub fn register_workflow(
        &self,
        name: &str,
        namespace: &str,
        spec: WorkflowSpec,
    ) -> Result<ValidationResult, EngineError> {
        let result = Validator::new(&self.registry).validate(name, &spec);
        if !result.is_valid() {
            return Ok(result);
        }

        self.contracts.reindex(name, &spec);
        self.workflows.insert(
            name.to_string(),
            Arc::new(RegisteredWorkflow {
                name: name.to_string(),
                namespace: namespace.to_string(),
                spec,
            }),
        );
        info!(workflow = %name, "workflow registered");
        Ok(result)
    }

    /// Pure validation of a workflow document against the current
    /// registry snapshot.
    pub fn validate_yaml(&self, yaml: &str) -> Result<ValidationResult, EngineError> {
        let manifest = WorkflowManifest::from_yaml(yaml)?;
        Ok(Validator::new(&self.registry).validate(&manifest.metadata.name, &manifest.spec))
    }

    pub fn workflow(&self, name: &str) -> Option<Arc<RegisteredWorkflow>> {
        self.workflows.get(name).map(|w| Arc::clone(&w))
    }

    pub fn workflow_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.workflows.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    // ========== Execution ==========

    pub async fn execute(&self, workflow: &str, input: Value) -> Result<ExecutionReport, EngineError> {
        self.execute_with_cancel(workflow, input, CancellationToken::new())
            .await
    }

    #[instrument(skip_all, fields(workflow = %workflow))]
    pub async fn execute_with_cancel(
        &self,
        workflow: &str,
        input: Value,
        cancel: CancellationToken,
    ) -> Result<ExecutionReport, EngineError> {
        let registered = self
            .workflow(workflow)
            .ok_or_else(|| EngineError::UnknownWorkflow(workflow.to_string()))?;

        let input = validate_input(&registered.spec, input)?;
        let outcome = self
            .orchestrator
            .run(workflow, &registered.spec, input, &self.registry, cancel)
            .await?;

        // Persist the append-only records and keep the trace queryable.
        let execution = ExecutionRecord::from_outcome(&outcome);
        let tasks = outcome
            .details
            .iter()
            .map(|d| TaskExecutionRecord::from_detail(&outcome.execution_id, d))
            .collect();
        self.repository.append(execution, tasks).await?;
        self.traces
            .insert(outcome.execution_id.clone(), outcome.trace.clone());

        let success = outcome.success();
        Ok(ExecutionReport {
            execution_id: outcome.execution_id,
            success,
            output: outcome.output,
            task_details: outcome.details,
            execution_time_ms: outcome.execution_time_ms,
            error: outcome.error,
        })
    }

    pub fn trace(&self, execution_id: &str) -> Result<Trace, EngineError> {
        self.traces
            .get(execution_id)
            .map(|t| t.clone())
            .ok_or_else(|| EngineError::UnknownExecution(execution_id.to_string()))
    }

    pub fn repository(&self) -> &Arc<dyn ExecutionRepository> {
        &self.repository
    }

    // ========== Dry run ==========

    /// Template resolution and DAG building without any HTTP.
    pub fn dry_run_yaml(&self, yaml: &str, sample_input: Value) -> Result<DryRunReport, EngineError> {
        let manifest = WorkflowManifest::from_yaml(yaml)?;
        self.dry_run_spec(&manifest.metadata.name, &manifest.spec, sample_input)
    }

    pub fn dry_run(&self, workflow: &str, sample_input: Value) -> Result<DryRunReport, EngineError> {
        let registered = self
            .workflow(workflow)
            .ok_or_else(|| EngineError::UnknownWorkflow(workflow.to_string()))?;
        self.dry_run_spec(workflow, &registered.spec, sample_input)
    }

    fn dry_run_spec(
        &self,
        name: &str,
        spec: &WorkflowSpec,
        sample_input: Value,
    ) -> Result<DryRunReport, EngineError> {
        let result = Validator::new(&self.registry).validate(name, spec);
        if !result.is_valid() {
            return Ok(DryRunReport {
                valid: false,
                execution_plan: None,
                errors: result.errors.iter().map(|e| e.to_string()).collect(),
            });
        }

        let plan = dag::build_plan(spec)?;
        let input = match sample_input {
            Value::Null => Map::new(),
            Value::Object(map) => map,
            other => {
                return Err(EngineError::InputInvalid(format!(
                    "sample input must be an object, got {other}"
                )))
            }
        };
        let ctx = crate::context::ExecutionContext::new(input);
        let scope = ResolutionScope::new(&ctx);

        let tasks = plan
            .topological_order()
            .filter_map(|id| spec.step(id))
            .map(|step| {
                // Switch expansion when the sample input resolves the value.
                let mut task_ref = step.task_ref.clone();
                if let Some(switch) = &step.switch {
                    if let Ok(value) = template::resolve_str(&switch.value, &scope) {
                        let chosen = switch.cases.iter().find(|case| {
                            crate::condition::values_match(
                                &value,
                                &Value::String(case.match_value.clone()),
                            )
                        });
                        match (chosen, &switch.default) {
                            (Some(case), _) => task_ref = case.task_ref.clone(),
                            (None, Some(default)) => task_ref = default.task_ref.clone(),
                            (None, None) => {}
                        }
                    }
                }

                PlannedTask {
                    id: step.id.clone(),
                    task_ref,
                    resolved_input: Value::Object(template::resolve_map_partial(
                        &step.input,
                        &scope,
                    )),
                    dependencies: step.depends_on.clone(),
                }
            })
            .collect();

        Ok(DryRunReport {
            valid: true,
            execution_plan: Some(ExecutionPlanView {
                tasks,
                parallel_groups: plan.levels.clone(),
            }),
            errors: Vec::new(),
        })
    }

    // ========== Contract / lifecycle surface ==========

    pub fn impact(&self, task: &str, change: &ProposedChange) -> ImpactReport {
        impact::assess(task, change, &self.contracts)
    }

    pub fn lifecycle(&self, task: &str) -> Result<LifecycleState, EngineError> {
        self.registry
            .lifecycle(task)
            .ok_or_else(|| EngineError::UnknownTask(task.to_string()))
    }

    pub fn supersede(&self, task: &str) -> Result<(), EngineError> {
        self.registry.supersede(task)
    }

    pub fn deprecate(&self, task: &str, on: chrono::DateTime<chrono::Utc>) -> Result<(), EngineError> {
        self.registry.deprecate(task, on)
    }

    pub fn can_deploy(&self, task: &str, version: &str, env: &str) -> DeployCheck {
        self.matrix.can_deploy(task, version, env)
    }

    pub fn record_deployment(&self, task: &str, env: &str, version: &str) -> Result<(), EngineError> {
        self.matrix.record(task, env, version)
    }

    pub fn record_interaction(&self, interaction: RecordedInteraction) -> String {
        self.interactions.record(interaction)
    }

    /// Verifier bound to this engine's dispatcher.
    pub fn verifier(&self, base_url: &str) -> ContractVerifier {
        ContractVerifier::new(Arc::clone(&self.dispatcher), base_url)
    }
}

// ============================================================================
// INPUT VALIDATION
// ============================================================================

/// Turn the permissive wire input into the validated input map: defaults
/// applied, required parameters present, types matching.
fn validate_input(spec: &WorkflowSpec, input: Value) -> Result<Map<String, Value>, EngineError> {
    let mut map = match input {
        Value::Null => Map::new(),
        Value::Object(map) => map,
        other => {
            return Err(EngineError::InputInvalid(format!(
                "workflow input must be an object, got {other}"
            )))
        }
    };

    for (name, param) in &spec.input {
        match map.get(name) {
            None => {
                if let Some(default) = &param.default {
                    map.insert(name.clone(), default.clone());
                } else if param.required {
                    return Err(EngineError::InputInvalid(format!(
                        "missing required parameter '{name}'"
                    )));
                }
            }
            Some(value) => {
                if !param.param_type.matches(value) {
                    return Err(EngineError::InputInvalid(format!(
                        "parameter '{name}' must be of type {}",
                        param.param_type
                    )));
                }
            }
        }
    }

    Ok(map)
}

// ============================================================================
// TESTS
// ============================================================================
