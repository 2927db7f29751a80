//! Execution persistence port
//!
//! Append-only storage of per-execution and per-task records. The core
//! only assumes the [`ExecutionRepository`] trait; the in-memory
//! implementation backs tests, the CLI, and any embedder that does not
//! bring its own store.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;

use crate::context::TaskStatus;
use crate::error::EngineError;
use crate::runner::{ExecutionStatus, RunOutcome, TaskExecutionDetail};

/// Default and maximum page size for listing queries.
pub const MAX_PAGE_SIZE: usize = 20;

// ============================================================================
// RECORDS
// ============================================================================

/// One row per execution.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionRecord {
    pub execution_id: String,
    pub workflow: String,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub execution_time_ms: u64,
    pub output: Option<Value>,
    pub error: Option<String>,
}

/// One row per step per execution; outlives the execution context it was
/// derived from.
#[derive(Debug, Clone, Serialize)]
pub struct TaskExecutionRecord {
    pub execution_id: String,
    pub step_id: String,
    pub task_ref: String,
    pub status: TaskStatus,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub error_kind: Option<String>,
    pub retry_count: u32,
    pub duration_ms: u64,
    pub wait_time_ms: u64,
    pub resolved_url: Option<String>,
    pub http_method: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ExecutionRecord {
    pub fn from_outcome(outcome: &RunOutcome) -> Self {
        Self {
            execution_id: outcome.execution_id.clone(),
            workflow: outcome.workflow.clone(),
            status: outcome.status,
            started_at: outcome.trace.started_at,
            completed_at: outcome.trace.completed_at,
            execution_time_ms: outcome.execution_time_ms,
            output: outcome.output.clone(),
            error: outcome.error.clone(),
        }
    }
}

impl TaskExecutionRecord {
    pub fn from_detail(execution_id: &str, detail: &TaskExecutionDetail) -> Self {
        Self {
            execution_id: execution_id.to_string(),
            step_id: detail.step_id.clone(),
            task_ref: detail.task_ref.clone(),
            status: detail.status,
            output: detail.output.clone(),
            error: detail.error.clone(),
            error_kind: detail.error_kind.clone(),
            retry_count: detail.retry_count,
            duration_ms: detail.duration_ms,
            wait_time_ms: detail.wait_time_ms,
            resolved_url: detail.resolved_url.clone(),
            http_method: detail.http_method.clone(),
            started_at: detail.started_at,
            completed_at: detail.completed_at,
        }
    }
}

// ============================================================================
// PORT
// ============================================================================

/// Append-only persistence port for executions.
#[async_trait]
pub trait ExecutionRepository: Send + Sync {
    /// Persist an execution with its task rows. Fails on duplicate ids.
    async fn append(
        &self,
        execution: ExecutionRecord,
        tasks: Vec<TaskExecutionRecord>,
    ) -> Result<(), EngineError>;

    async fn get(&self, execution_id: &str) -> Option<ExecutionRecord>;

    async fn tasks_for(&self, execution_id: &str) -> Vec<TaskExecutionRecord>;

    /// Executions of one workflow, newest first, paged. `take` is clamped
    /// to [`MAX_PAGE_SIZE`].
    async fn list_by_workflow(
        &self,
        workflow: &str,
        skip: usize,
        take: usize,
    ) -> Vec<ExecutionRecord>;

    async fn list_by_status(&self, status: ExecutionStatus) -> Vec<ExecutionRecord>;
}

// ============================================================================
// IN-MEMORY IMPLEMENTATION
// ============================================================================

/// DashMap-backed repository; insertion order is kept for stable listing.
#[derive(Default)]
pub struct InMemoryRepository {
    executions: DashMap<String, ExecutionRecord>,
    tasks: DashMap<String, Vec<TaskExecutionRecord>>,
    order: Mutex<Vec<String>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExecutionRepository for InMemoryRepository {
    async fn append(
        &self,
        execution: ExecutionRecord,
        tasks: Vec<TaskExecutionRecord>,
    ) -> Result<(), EngineError> {
        let id = execution.execution_id.clone();
        if self.executions.contains_key(&id) {
            return Err(EngineError::DuplicateRecord(id));
        }
        self.executions.insert(id.clone(), execution);
        self.tasks.insert(id.clone(), tasks);
        if let Ok(mut order) = self.order.lock() {
            order.push(id);
        }
        Ok(())
    }

    async fn get(&self, execution_id: &str) -> Option<ExecutionRecord> {
        self.executions.get(execution_id).map(|r| r.clone())
    }

    async fn tasks_for(&self, execution_id: &str) -> Vec<TaskExecutionRecord> {
        self.tasks
            .get(execution_id)
            .map(|t| t.clone())
            .unwrap_or_default()
    }

    async fn list_by_workflow(
        &self,
        workflow: &str,
        skip: usize,
        take: usize,
    ) -> Vec<ExecutionRecord> {
        let take = take.clamp(1, MAX_PAGE_SIZE);
        let order = self
            .order
            .lock()
            .map(|o| o.clone())
            .unwrap_or_default();

        order
            .iter()
            .rev()
            .filter_map(|id| self.executions.get(id).map(|r| r.clone()))
            .filter(|r| r.workflow == workflow)
            .skip(skip)
            .take(take)
            .collect()
    }

    async fn list_by_status(&self, status: ExecutionStatus) -> Vec<ExecutionRecord> {
        let order = self
            .order
            .lock()
            .map(|o| o.clone())
            .unwrap_or_default();

        order
            .iter()
            .filter_map(|id| self.executions.get(id).map(|r| r.clone()))
            .filter(|r| r.status == status)
            .collect()
    }
}

// ============================================================================
// TESTS
// ============================================================================
