//! # Workflow Validator
//!
//! Static checks run at registration, in three layers:
//!
//! 1. **Graph** - unique ids, resolvable `dependsOn`, acyclic.
//! 2. **Task references** - every `taskRef` (including switch cases) is
//!    registered and not past its deprecation date.
//! 3. **Templates & control flow** - every `{{ expr }}` parses and
//!    resolves statically; conditions parse; switch and forEach blocks are
//!    well formed.
//!
//! ## Error Codes
//!
//! | Code | Layer | Description |
//! |------|-------|-------------|
//! | STRATA-001 | Graph | Workflow has no tasks |
//! | STRATA-002 | Graph | Duplicate step id |
//! | STRATA-003 | Graph | Invalid step id format |
//! | STRATA-004 | Graph | Unknown dependency |
//! | STRATA-005 | Graph | Cycle detected |
//! | STRATA-010 | Tasks | Unknown taskRef |
//! | STRATA-011 | Tasks | taskRef past deprecation date |
//! | STRATA-012 | Tasks | Input binding not in task schema (warning) |
//! | STRATA-020 | Templates | Template syntax error |
//! | STRATA-021 | Templates | Unknown field |
//! | STRATA-022 | Templates | Backward / unknown step reference |
//! | STRATA-023 | Templates | Scoped variable outside forEach |
//! | STRATA-030 | Control flow | Condition empty or invalid |
//! | STRATA-031 | Control flow | Switch value empty |
//! | STRATA-032 | Control flow | Switch has no cases |
//! | STRATA-033 | Control flow | Duplicate case match |
//! | STRATA-034 | Control flow | Switch without default (warning) |
//! | STRATA-035 | Control flow | forEach items empty or invalid |
//! | STRATA-036 | Control flow | forEach itemVar not an identifier |
//! | STRATA-037 | Control flow | switch and forEach on the same step |

use std::collections::{HashMap, HashSet};

use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

use crate::condition;
use crate::dag::{self, DagError};
use crate::registry::TaskRegistry;
use crate::spec::{TaskStep, WorkflowSpec};
use crate::template::{Template, TemplateExpr};

static IDENT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("identifier regex"));

// ============================================================================
// ISSUES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationIssue {
    // Layer 1: Graph
    #[error("[STRATA-001] Workflow has no tasks")]
    EmptyWorkflow,

    #[error("[STRATA-002] Duplicate step id '{step}'")]
    DuplicateStepId { step: String },

    #[error("[STRATA-003] Step '{step}': invalid id (use alphanumeric, dash, underscore)")]
    InvalidStepId { step: String },

    #[error("[STRATA-004] Step '{step}' depends on unknown step '{dep}'")]
    UnknownDependency { step: String, dep: String },

    #[error("[STRATA-005] Cycle detected among steps: {}", ids.join(", "))]
    CycleDetected { ids: Vec<String> },

    // Layer 2: Task references
    #[error("[STRATA-010] Step '{step}': unknown taskRef '{task_ref}'")]
    UnknownTaskRef { step: String, task_ref: String },

    #[error("[STRATA-011] Step '{step}': task '{task_ref}' is past its deprecation date")]
    DeprecatedTaskRef { step: String, task_ref: String },

    #[error("[STRATA-012] Step '{step}': input '{field}' is not declared by task '{task_ref}'")]
    UnknownInputBinding {
        step: String,
        task_ref: String,
        field: String,
    },

    // Layer 3: Templates
    #[error("[STRATA-020] {location}: template syntax error: {detail}")]
    TemplateSyntax { location: String, detail: String },

    #[error("[STRATA-021] {location}: unknown field '{path}'")]
    TemplateUnknownField { location: String, path: String },

    #[error("[STRATA-022] {location}: reference '{path}' does not point at an earlier step")]
    TemplateBackwardReference { location: String, path: String },

    #[error("[STRATA-023] {location}: '{var}' is only available inside a forEach")]
    TemplateUnknownScope { location: String, var: String },

    // Layer 3: Control flow
    #[error("[STRATA-030] Step '{step}': condition invalid: {detail}")]
    ConditionInvalid { step: String, detail: String },

    #[error("[STRATA-031] Step '{step}': switch value is empty")]
    SwitchValueEmpty { step: String },

    #[error("[STRATA-032] Step '{step}': switch has no cases")]
    SwitchCasesEmpty { step: String },

    #[error("[STRATA-033] Step '{step}': duplicate switch case '{value}'")]
    SwitchDuplicateCase { step: String, value: String },

    #[error("[STRATA-034] Step '{step}': switch has no default case")]
    SwitchNoDefault { step: String },

    #[error("[STRATA-035] Step '{step}': forEach items invalid: {detail}")]
    ForEachItemsInvalid { step: String, detail: String },

    #[error("[STRATA-036] Step '{step}': forEach itemVar '{var}' is not a valid identifier")]
    ForEachBadItemVar { step: String, var: String },

    #[error("[STRATA-037] Step '{step}': switch and forEach cannot be combined")]
    SwitchAndForEach { step: String },
}

impl ValidationIssue {
    /// Warnings never fail validation.
    pub fn is_warning(&self) -> bool {
        matches!(
            self,
            ValidationIssue::SwitchNoDefault { .. } | ValidationIssue::UnknownInputBinding { .. }
        )
    }
}

// ============================================================================
// RESULT
// ============================================================================

#[derive(Debug, Default)]
pub struct ValidationResult {
    pub workflow: String,
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<ValidationIssue>,
    pub step_count: usize,
}

impl ValidationResult {
    fn new(workflow: &str, step_count: usize) -> Self {
        Self {
            workflow: workflow.to_string(),
            step_count,
            ..Default::default()
        }
    }

    fn push(&mut self, issue: ValidationIssue) {
        if issue.is_warning() {
            self.warnings.push(issue);
        } else {
            self.errors.push(issue);
        }
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

// ============================================================================
// VALIDATOR
// ============================================================================

/// Validation is a pure function of the spec and the registry snapshot.
pub struct Validator<'a> {
    registry: &'a TaskRegistry,
}

impl<'a> Validator<'a> {
    pub fn new(registry: &'a TaskRegistry) -> Self {
        Self { registry }
    }

    pub fn validate(&self, workflow: &str, spec: &WorkflowSpec) -> ValidationResult {
        let mut result = ValidationResult::new(workflow, spec.tasks.len());

        self.validate_graph(spec, &mut result);
        self.validate_task_refs(spec, &mut result);
        self.validate_templates_and_control_flow(spec, &mut result);

        result
    }

    // ========== Layer 1: Graph ==========

    fn validate_graph(&self, spec: &WorkflowSpec, result: &mut ValidationResult) {
        if spec.tasks.is_empty() {
            result.push(ValidationIssue::EmptyWorkflow);
            return;
        }

        let mut seen: HashSet<&str> = HashSet::new();
        for step in &spec.tasks {
            if !seen.insert(&step.id) {
                result.push(ValidationIssue::DuplicateStepId {
                    step: step.id.clone(),
                });
            }
            if !is_valid_id(&step.id) {
                result.push(ValidationIssue::InvalidStepId {
                    step: step.id.clone(),
                });
            }
        }

        match dag::build_plan(spec) {
            Ok(_) => {}
            Err(DagError::UnknownDependency { step, dep }) => {
                result.push(ValidationIssue::UnknownDependency { step, dep });
            }
            Err(DagError::CycleDetected { ids }) => {
                result.push(ValidationIssue::CycleDetected { ids });
            }
        }
    }

    // ========== Layer 2: Task references ==========

    fn validate_task_refs(&self, spec: &WorkflowSpec, result: &mut ValidationResult) {
        let now = Utc::now();

        for step in &spec.tasks {
            let mut refs = vec![step.task_ref.clone()];
            if let Some(switch) = &step.switch {
                refs.extend(switch.cases.iter().map(|c| c.task_ref.clone()));
                if let Some(default) = &switch.default {
                    refs.push(default.task_ref.clone());
                }
            }

            for task_ref in refs {
                match self.registry.get(&task_ref) {
                    None => result.push(ValidationIssue::UnknownTaskRef {
                        step: step.id.clone(),
                        task_ref,
                    }),
                    Some(task) => {
                        if task.is_past_deprecation(now) {
                            result.push(ValidationIssue::DeprecatedTaskRef {
                                step: step.id.clone(),
                                task_ref,
                            });
                        }
                    }
                }
            }

            // Bindings the task's input schema does not declare are almost
            // always typos; surfaced as warnings.
            if let Some(task) = self.registry.get(&step.task_ref) {
                if let Some(declared) = task.input_fields() {
                    for field in step.input.keys() {
                        if !declared.contains(field) {
                            result.push(ValidationIssue::UnknownInputBinding {
                                step: step.id.clone(),
                                task_ref: step.task_ref.clone(),
                                field: field.clone(),
                            });
                        }
                    }
                }
            }
        }
    }

    // ========== Layer 3: Templates & control flow ==========

    fn validate_templates_and_control_flow(
        &self,
        spec: &WorkflowSpec,
        result: &mut ValidationResult,
    ) {
        // Level index per step, for backward-reference checks. Unavailable
        // when the graph is broken; existence checks still run.
        let levels: Option<HashMap<String, usize>> = dag::build_plan(spec).ok().map(|plan| {
            spec.step_ids()
                .filter_map(|id| plan.level_of(id).map(|l| (id.to_string(), l)))
                .collect()
        });
        let step_exists: HashSet<&str> = spec.step_ids().collect();

        for step in &spec.tasks {
            let scoped_vars = scoped_vars_of(step);

            for (field, raw) in &step.input {
                let location = format!("step '{}' input '{}'", step.id, field);
                self.check_template(
                    raw,
                    &location,
                    spec,
                    &step_exists,
                    levels.as_ref(),
                    Some(&step.id),
                    &scoped_vars,
                    result,
                );
            }

            if let Some(cond) = &step.condition {
                let location = format!("step '{}' condition", step.id);
                match condition::parse(&cond.expr) {
                    Err(err) => result.push(ValidationIssue::ConditionInvalid {
                        step: step.id.clone(),
                        detail: err.to_string(),
                    }),
                    Ok(ast) => {
                        for expr in ast.template_exprs() {
                            self.check_expr(
                                expr,
                                &location,
                                spec,
                                &step_exists,
                                levels.as_ref(),
                                Some(&step.id),
                                &HashSet::new(),
                                result,
                            );
                        }
                    }
                }
            }

            if step.switch.is_some() && step.for_each.is_some() {
                result.push(ValidationIssue::SwitchAndForEach {
                    step: step.id.clone(),
                });
            }

            if let Some(switch) = &step.switch {
                self.validate_switch(step, switch, spec, &step_exists, levels.as_ref(), result);
            }

            if let Some(for_each) = &step.for_each {
                if for_each.items.trim().is_empty() {
                    result.push(ValidationIssue::ForEachItemsInvalid {
                        step: step.id.clone(),
                        detail: "items is empty".into(),
                    });
                } else {
                    let location = format!("step '{}' forEach items", step.id);
                    self.check_template(
                        &for_each.items,
                        &location,
                        spec,
                        &step_exists,
                        levels.as_ref(),
                        Some(&step.id),
                        &HashSet::new(),
                        result,
                    );
                }
                if !IDENT_RE.is_match(&for_each.item_var) {
                    result.push(ValidationIssue::ForEachBadItemVar {
                        step: step.id.clone(),
                        var: for_each.item_var.clone(),
                    });
                }
            }
        }

        // Declared outputs may reference any step.
        for (name, raw) in &spec.output {
            let location = format!("output '{name}'");
            self.check_template(
                raw,
                &location,
                spec,
                &step_exists,
                None,
                None,
                &HashSet::new(),
                result,
            );
        }
    }

    fn validate_switch(
        &self,
        step: &TaskStep,
        switch: &crate::spec::Switch,
        spec: &WorkflowSpec,
        step_exists: &HashSet<&str>,
        levels: Option<&HashMap<String, usize>>,
        result: &mut ValidationResult,
    ) {
        if switch.value.trim().is_empty() {
            result.push(ValidationIssue::SwitchValueEmpty {
                step: step.id.clone(),
            });
        } else {
            let location = format!("step '{}' switch value", step.id);
            self.check_template(
                &switch.value,
                &location,
                spec,
                step_exists,
                levels,
                Some(&step.id),
                &HashSet::new(),
                result,
            );
        }

        if switch.cases.is_empty() {
            result.push(ValidationIssue::SwitchCasesEmpty {
                step: step.id.clone(),
            });
        }

        // Uniqueness is case-insensitive, matching the runtime rule.
        let mut seen: HashSet<String> = HashSet::new();
        for case in &switch.cases {
            if !seen.insert(case.match_value.to_lowercase()) {
                result.push(ValidationIssue::SwitchDuplicateCase {
                    step: step.id.clone(),
                    value: case.match_value.clone(),
                });
            }
        }

        if switch.default.is_none() {
            result.push(ValidationIssue::SwitchNoDefault {
                step: step.id.clone(),
            });
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn check_template(
        &self,
        raw: &str,
        location: &str,
        spec: &WorkflowSpec,
        step_exists: &HashSet<&str>,
        levels: Option<&HashMap<String, usize>>,
        current_step: Option<&str>,
        scoped_vars: &HashSet<String>,
        result: &mut ValidationResult,
    ) {
        let template = match Template::parse(raw) {
            Ok(t) => t,
            Err(err) => {
                result.push(ValidationIssue::TemplateSyntax {
                    location: location.to_string(),
                    detail: err.to_string(),
                });
                return;
            }
        };
        for expr in template.exprs() {
            self.check_expr(
                expr,
                location,
                spec,
                step_exists,
                levels,
                current_step,
                scoped_vars,
                result,
            );
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn check_expr(
        &self,
        expr: &TemplateExpr,
        location: &str,
        spec: &WorkflowSpec,
        step_exists: &HashSet<&str>,
        levels: Option<&HashMap<String, usize>>,
        current_step: Option<&str>,
        scoped_vars: &HashSet<String>,
        result: &mut ValidationResult,
    ) {
        match expr {
            TemplateExpr::Literal(_) => {}
            TemplateExpr::Input(path) => {
                if !spec.input.contains_key(&path[0]) {
                    result.push(ValidationIssue::TemplateUnknownField {
                        location: location.to_string(),
                        path: expr.display_path(),
                    });
                }
            }
            TemplateExpr::Scoped { var, .. } => {
                if !scoped_vars.contains(var) {
                    result.push(ValidationIssue::TemplateUnknownScope {
                        location: location.to_string(),
                        var: var.clone(),
                    });
                }
            }
            TemplateExpr::TaskOutput { step, path } => {
                if !step_exists.contains(step.as_str()) {
                    result.push(ValidationIssue::TemplateBackwardReference {
                        location: location.to_string(),
                        path: expr.display_path(),
                    });
                    return;
                }

                // Inside a step, only strictly earlier levels are visible.
                if let (Some(levels), Some(current)) = (levels, current_step) {
                    let ref_level = levels.get(step.as_str());
                    let cur_level = levels.get(current);
                    if let (Some(&r), Some(&c)) = (ref_level, cur_level) {
                        if r >= c {
                            result.push(ValidationIssue::TemplateBackwardReference {
                                location: location.to_string(),
                                path: expr.display_path(),
                            });
                            return;
                        }
                    }
                }

                self.check_output_field(step, path, location, spec, result);
            }
        }
    }

    /// Check the first path segment against the referenced step's declared
    /// output fields. Steps with switch (shape depends on the chosen case)
    /// or forEach (output is an array) are exempt.
    fn check_output_field(
        &self,
        step_id: &str,
        path: &[String],
        location: &str,
        spec: &WorkflowSpec,
        result: &mut ValidationResult,
    ) {
        let Some(step) = spec.step(step_id) else {
            return;
        };
        if step.switch.is_some() || step.for_each.is_some() || path.is_empty() {
            return;
        }
        let Some(task) = self.registry.get(&step.task_ref) else {
            return;
        };
        let Some(fields) = task.output_fields() else {
            return;
        };
        if !fields.contains(&path[0]) {
            result.push(ValidationIssue::TemplateUnknownField {
                location: location.to_string(),
                path: format!("tasks.{}.output.{}", step_id, path.join(".")),
            });
        }
    }
}

fn scoped_vars_of(step: &TaskStep) -> HashSet<String> {
    match &step.for_each {
        Some(for_each) => [
            for_each.item_var.clone(),
            "index".to_string(),
            "isLast".to_string(),
        ]
        .into_iter()
        .collect(),
        None => HashSet::new(),
    }
}

fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_alphanumeric() || c == '-' || c == '_')
        && !id.starts_with('-')
        && !id.starts_with('_')
}

// ============================================================================
// TESTS
// ============================================================================
