//! # Strata
//!
//! Declarative workflow orchestration engine for HTTP-backed task graphs.
//!
//! ## Overview
//!
//! Users submit a workflow definition - a DAG of HTTP-backed task steps
//! with input/output templating, conditions, switches, and bounded
//! parallel iteration. The engine plans, executes, traces, and gates
//! deployments of task contracts:
//!
//! | Module | Responsibility |
//! |--------|----------------|
//! | [`template`] | Parse and resolve `{{ ... }}` against the context |
//! | [`condition`] | Boolean gates producing skip/execute/failure |
//! | [`dag`] | Topological leveling, cycle detection, parallel groups |
//! | [`response`] | Content-type-directed parsing, hybrid binary storage |
//! | [`executor`] | HTTP dispatch with retry accounting and timeouts |
//! | [`runner`] | Level-driven orchestration, control flow, traces |
//! | [`validator`] | Static checks with STRATA-### error codes |
//! | [`usage`] | Consumer field-usage extraction from templates |
//! | [`impact`] | Change classification and blast radius |
//! | [`deploy`] | Per-environment version matrix, can-deploy gating |
//! | [`contract`] | Provider states, record & replay verification |
//! | [`engine`] | The facade embedders and the CLI talk to |
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use strata::engine::WorkflowEngine;
//! use serde_json::json;
//!
//! let engine = WorkflowEngine::local();
//! engine.register_task_yaml(&std::fs::read_to_string("tasks/echo.yaml")?)?;
//! let result = engine.register_workflow_yaml(&std::fs::read_to_string("workflow.yaml")?)?;
//! assert!(result.is_valid());
//!
//! let report = engine.execute("hello", json!({"name": "ada"})).await?;
//! println!("{:?}", report.output);
//! # Ok::<(), strata::EngineError>(())
//! ```

pub mod condition;
pub mod config;
pub mod context;
pub mod contract;
pub mod dag;
pub mod debug;
pub mod deploy;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod executor;
pub mod impact;
pub mod init;
pub mod registry;
pub mod repository;
pub mod response;
pub mod runner;
pub mod spec;
pub mod template;
pub mod trace;
pub mod usage;
pub mod validator;

pub use config::{EngineConfig, RetryPolicy};
pub use context::{ExecutionContext, TaskState, TaskStatus};
pub use engine::{DryRunReport, ExecutionReport, WorkflowEngine};
pub use error::{EngineError, FixSuggestion, StepError};
pub use runner::{ExecutionStatus, RunOutcome, TaskExecutionDetail};
pub use spec::{TaskDefinition, TaskManifest, TaskStep, WorkflowManifest, WorkflowSpec};
pub use trace::Trace;
pub use validator::{ValidationIssue, ValidationResult, Validator};
