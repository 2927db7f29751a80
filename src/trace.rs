//! Execution traces
//!
//! Per execution the orchestrator records step timings (`startedAt`,
//! `completedAt`, `durationMs`, `waitTimeMs`), the planned parallel groups
//! from the DAG, and the actual parallel groups derived from observed
//! overlap of `[startedAt, completedAt]` windows. Planned and actual are
//! allowed to differ; comparing them is exactly what the trace is for.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::context::TaskStatus;

// ============================================================================
// TYPES
// ============================================================================

/// Timing record for one step.
#[derive(Debug, Clone, Serialize)]
pub struct StepTiming {
    pub step_id: String,
    pub status: TaskStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
    /// `startedAt` minus the completion of the last predecessor, or minus
    /// the execution start for roots.
    pub wait_time_ms: u64,
}

/// One actual parallel group: steps whose execution windows overlapped.
#[derive(Debug, Clone, Serialize)]
pub struct ParallelGroup {
    pub steps: Vec<String>,
    /// Length of the window shared by every member of the group.
    pub overlap_ms: u64,
}

/// Full trace of one execution.
#[derive(Debug, Clone, Serialize)]
pub struct Trace {
    pub execution_id: String,
    pub workflow: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub steps: Vec<StepTiming>,
    /// Levels as planned by the DAG builder.
    pub planned_groups: Vec<Vec<String>>,
    /// Groups observed from timestamp overlap.
    pub actual_groups: Vec<ParallelGroup>,
}

// ============================================================================
// ACTUAL GROUP DERIVATION
// ============================================================================

/// Observed execution window of one step, in ms offsets from run start.
#[derive(Debug, Clone)]
pub struct StepInterval {
    pub step_id: String,
    pub start_ms: u64,
    pub end_ms: u64,
}

/// Greedy merge of overlapping intervals into actual parallel groups.
///
/// Intervals are sorted by start; an interval joins the current group when
/// it starts before the group's furthest end. `overlap_ms` is the window
/// common to all members (zero when a chain of pairwise overlaps has no
/// shared instant).
pub fn actual_groups(intervals: &[StepInterval]) -> Vec<ParallelGroup> {
    let mut sorted: Vec<&StepInterval> = intervals.iter().collect();
    sorted.sort_by_key(|iv| (iv.start_ms, iv.end_ms));

    let mut groups = Vec::new();
    let mut current: Vec<&StepInterval> = Vec::new();
    let mut group_end = 0u64;

    for interval in sorted {
        if current.is_empty() || interval.start_ms < group_end {
            group_end = group_end.max(interval.end_ms);
            current.push(interval);
        } else {
            groups.push(finish_group(&current));
            group_end = interval.end_ms;
            current = vec![interval];
        }
    }
    if !current.is_empty() {
        groups.push(finish_group(&current));
    }
    groups
}

fn finish_group(members: &[&StepInterval]) -> ParallelGroup {
    let max_start = members.iter().map(|iv| iv.start_ms).max().unwrap_or(0);
    let min_end = members.iter().map(|iv| iv.end_ms).min().unwrap_or(0);
    ParallelGroup {
        steps: members.iter().map(|iv| iv.step_id.clone()).collect(),
        overlap_ms: min_end.saturating_sub(max_start),
    }
}

// ============================================================================
// TESTS
// ============================================================================
