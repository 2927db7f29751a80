//! Project scaffolding for `workflow init`

use std::path::{Path, PathBuf};

use crate::error::EngineError;

/// Files created by [`init_project`].
#[derive(Debug)]
pub struct InitResult {
    pub created: Vec<PathBuf>,
}

const SAMPLE_WORKFLOW: &str = r#"apiVersion: strata.io/v1
kind: Workflow
metadata:
  name: hello
  namespace: default
spec:
  input:
    name:
      type: string
      required: true
  tasks:
    - id: greet
      taskRef: echo
      input:
        message: "hello {{ input.name }}"
  output:
    greeting: "{{ tasks.greet.output.message }}"
"#;

const SAMPLE_TASK: &str = r#"apiVersion: strata.io/v1
kind: WorkflowTask
metadata:
  name: echo
spec:
  http:
    url: "https://postman-echo.com/post"
    method: POST
  inputSchema:
    type: object
    properties:
      message:
        type: string
    required: [message]
  outputSchema:
    type: object
    properties:
      message:
        type: string
"#;

/// Scaffold a workflow project: one sample workflow plus a task manifest
/// under `tasks/`. Existing files are never overwritten.
pub fn init_project(dir: &Path) -> Result<InitResult, EngineError> {
    let workflow_path = dir.join("workflow.yaml");
    let tasks_dir = dir.join("tasks");
    let task_path = tasks_dir.join("echo.yaml");

    for path in [&workflow_path, &task_path] {
        if path.exists() {
            return Err(EngineError::other(format!(
                "refusing to overwrite existing file {}",
                path.display()
            )));
        }
    }

    std::fs::create_dir_all(&tasks_dir)?;
    std::fs::write(&workflow_path, SAMPLE_WORKFLOW)?;
    std::fs::write(&task_path, SAMPLE_TASK)?;

    Ok(InitResult {
        created: vec![workflow_path, task_path],
    })
}
