//! Consumer field-usage extraction
//!
//! Walks the templates of a workflow and derives one [`ConsumerContract`]
//! per `(workflow, task)` pair: which task input fields the workflow
//! binds, and which output fields it reads via
//! `tasks.<id>.output.<path>` references. Contracts are regenerated
//! whenever a workflow is (re)registered and indexed for the impact
//! analysis and deployment gating built on top.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use dashmap::DashMap;
use serde::Serialize;

use crate::condition;
use crate::spec::WorkflowSpec;
use crate::template::{Template, TemplateExpr};

// ============================================================================
// CONSUMER CONTRACT
// ============================================================================

/// The fields one workflow actually uses of one task.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConsumerContract {
    pub workflow: String,
    pub task: String,
    /// Task input fields the workflow binds.
    pub required_input_fields: BTreeSet<String>,
    /// Dotted output paths the workflow reads.
    pub consumed_output_fields: BTreeSet<String>,
}

impl ConsumerContract {
    /// Whether a top-level field is consumed, either exactly or as the
    /// head of a deeper path.
    pub fn consumes_output_field(&self, field: &str) -> bool {
        self.consumed_output_fields
            .iter()
            .any(|path| path == field || path.starts_with(&format!("{field}.")))
    }

    pub fn requires_input_field(&self, field: &str) -> bool {
        self.required_input_fields.contains(field)
    }
}

// ============================================================================
// ANALYSIS
// ============================================================================

/// Derive the consumer contracts of one workflow.
pub fn analyze(workflow: &str, spec: &WorkflowSpec) -> Vec<ConsumerContract> {
    // step id -> taskRef, for attributing output reads.
    let task_of_step: HashMap<&str, &str> = spec
        .tasks
        .iter()
        .map(|s| (s.id.as_str(), s.task_ref.as_str()))
        .collect();

    // (task -> contract under construction)
    let mut inputs: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    let mut outputs: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();

    let mut note_output = |expr: &TemplateExpr| {
        if let TemplateExpr::TaskOutput { step, path } = expr {
            if let Some(task) = task_of_step.get(step.as_str()) {
                let field = if path.is_empty() {
                    "*".to_string()
                } else {
                    path.join(".")
                };
                outputs.entry(task.to_string()).or_default().insert(field);
            }
        }
    };

    for step in &spec.tasks {
        // Input bindings count for the step's own taskRef and for every
        // switch target, since any of them may receive this input.
        let mut bound_tasks = vec![step.task_ref.clone()];
        if let Some(switch) = &step.switch {
            bound_tasks.extend(switch.cases.iter().map(|c| c.task_ref.clone()));
            if let Some(default) = &switch.default {
                bound_tasks.push(default.task_ref.clone());
            }
        }
        for task in &bound_tasks {
            inputs
                .entry(task.clone())
                .or_default()
                .extend(step.input.keys().cloned());
        }

        // Output reads from every template the step carries.
        for raw in step.input.values() {
            if let Ok(template) = Template::parse(raw) {
                template.exprs().for_each(&mut note_output);
            }
        }
        if let Some(cond) = &step.condition {
            if let Ok(ast) = condition::parse(&cond.expr) {
                ast.template_exprs().into_iter().for_each(&mut note_output);
            }
        }
        if let Some(switch) = &step.switch {
            if let Ok(template) = Template::parse(&switch.value) {
                template.exprs().for_each(&mut note_output);
            }
        }
        if let Some(for_each) = &step.for_each {
            if let Ok(template) = Template::parse(&for_each.items) {
                template.exprs().for_each(&mut note_output);
            }
        }
    }

    for raw in spec.output.values() {
        if let Ok(template) = Template::parse(raw) {
            template.exprs().for_each(&mut note_output);
        }
    }

    // Merge into contracts, one per task that appears at all.
    let mut tasks: BTreeSet<String> = inputs.keys().cloned().collect();
    tasks.extend(outputs.keys().cloned());

    tasks
        .into_iter()
        .map(|task| ConsumerContract {
            workflow: workflow.to_string(),
            required_input_fields: inputs.remove(&task).unwrap_or_default(),
            consumed_output_fields: outputs.remove(&task).unwrap_or_default(),
            task,
        })
        .collect()
}

// ============================================================================
// CONTRACT INDEX
// ============================================================================

/// Process-wide contract store, reindexed per workflow registration.
#[derive(Default)]
pub struct ContractIndex {
    by_workflow: DashMap<String, Vec<ConsumerContract>>,
}

impl ContractIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the contracts of one workflow.
    pub fn reindex(&self, workflow: &str, spec: &WorkflowSpec) {
        self.by_workflow
            .insert(workflow.to_string(), analyze(workflow, spec));
    }

    pub fn remove(&self, workflow: &str) {
        self.by_workflow.remove(workflow);
    }

    /// All contracts naming a task, across workflows.
    pub fn contracts_for_task(&self, task: &str) -> Vec<ConsumerContract> {
        let mut out: Vec<ConsumerContract> = self
            .by_workflow
            .iter()
            .flat_map(|entry| {
                entry
                    .value()
                    .iter()
                    .filter(|c| c.task == task)
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect();
        out.sort_by(|a, b| a.workflow.cmp(&b.workflow));
        out
    }

    pub fn contracts_for_workflow(&self, workflow: &str) -> Vec<ConsumerContract> {
        self.by_workflow
            .get(workflow)
            .map(|c| c.clone())
            .unwrap_or_default()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::WorkflowManifest;

    fn spec(yaml: &str) -> WorkflowSpec {
        WorkflowManifest::from_yaml(yaml).unwrap().spec
    }

    const REPORT: &str = r#"
apiVersion: strata.io/v1
kind: Workflow
metadata: { name: report }
spec:
  input:
    userId: { type: string }
  tasks:
    - id: fetch
      taskRef: get-user
      input: { id: "{{ input.userId }}" }
    - id: render
      taskRef: render-report
      dependsOn: [fetch]
      input:
        name: "{{ tasks.fetch.output.name }}"
        email: "{{ tasks.fetch.output.contact.email }}"
  output:
    url: "{{ tasks.render.output.url }}"
"#;

    #[test]
    fn contracts_capture_inputs_and_outputs() {
        let contracts = analyze("report", &spec(REPORT));
        assert_eq!(contracts.len(), 2);

        let get_user = contracts.iter().find(|c| c.task == "get-user").unwrap();
        assert!(get_user.requires_input_field("id"));
        assert!(get_user.consumes_output_field("name"));
        assert!(get_user.consumes_output_field("contact"));
        assert!(get_user
            .consumed_output_fields
            .contains("contact.email"));
        assert!(!get_user.consumes_output_field("phone"));

        let render = contracts.iter().find(|c| c.task == "render-report").unwrap();
        assert!(render.requires_input_field("name"));
        assert!(render.consumes_output_field("url"));
    }

    #[test]
    fn condition_and_for_each_references_count() {
        let contracts = analyze(
            "wf",
            &spec(
                r#"
apiVersion: strata.io/v1
kind: Workflow
metadata: { name: wf }
spec:
  tasks:
    - id: list
      taskRef: list-users
      input: {}
    - id: fan
      taskRef: notify
      dependsOn: [list]
      condition: { if: "{{ tasks.list.output.count }} > 0" }
      forEach:
        items: "{{ tasks.list.output.users }}"
        itemVar: user
      input: { target: "{{ user }}" }
"#,
            ),
        );

        let list = contracts.iter().find(|c| c.task == "list-users").unwrap();
        assert!(list.consumes_output_field("count"));
        assert!(list.consumes_output_field("users"));
    }

    #[test]
    fn switch_targets_share_input_bindings() {
        let contracts = analyze(
            "wf",
            &spec(
                r#"
apiVersion: strata.io/v1
kind: Workflow
metadata: { name: wf }
spec:
  input:
    tier: { type: string }
  tasks:
    - id: route
      taskRef: charge
      switch:
        value: "{{ input.tier }}"
        cases:
          - { match: gold, taskRef: charge-gold }
        default: { taskRef: charge }
      input: { amount: "10" }
"#,
            ),
        );

        for task in ["charge", "charge-gold"] {
            let contract = contracts.iter().find(|c| c.task == task).unwrap();
            assert!(
                contract.requires_input_field("amount"),
                "missing amount for {task}"
            );
        }
    }

    #[test]
    fn index_reindex_replaces_old_contracts() {
        let index = ContractIndex::new();
        index.reindex("report", &spec(REPORT));
        assert_eq!(index.contracts_for_task("get-user").len(), 1);

        // Re-register with the fetch step removed.
        index.reindex(
            "report",
            &spec(
                r#"
apiVersion: strata.io/v1
kind: Workflow
metadata: { name: report }
spec:
  tasks:
    - id: only
      taskRef: render-report
      input: { name: "static" }
"#,
            ),
        );
        assert!(index.contracts_for_task("get-user").is_empty());
        assert_eq!(index.contracts_for_task("render-report").len(), 1);
    }

    #[test]
    fn contracts_for_task_spans_workflows() {
        let index = ContractIndex::new();
        index.reindex("a", &spec(REPORT));
        let mut other = spec(REPORT);
        other.output.clear();
        index.reindex("b", &other);

        let contracts = index.contracts_for_task("get-user");
        assert_eq!(contracts.len(), 2);
        assert_eq!(contracts[0].workflow, "a");
        assert_eq!(contracts[1].workflow, "b");
    }
}
