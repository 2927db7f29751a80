//! DAG builder: topological leveling and cycle detection
//!
//! Compiles a workflow's `dependsOn` edges into an [`ExecutionPlan`]:
//! steps grouped into levels where `level(n) = 1 + max(level(preds))`
//! (0 for roots). Levels are the planned parallel groups; ties within a
//! level keep definition order, which is the ordering rule trace
//! reproducibility relies on.

use std::collections::{HashMap, VecDeque};

use serde::Serialize;
use thiserror::Error;

use crate::spec::WorkflowSpec;

// ============================================================================
// ERRORS
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DagError {
    #[error("cycle detected among steps: {}", ids.join(", "))]
    CycleDetected { ids: Vec<String> },

    #[error("step '{step}' depends on unknown step '{dep}'")]
    UnknownDependency { step: String, dep: String },
}

// ============================================================================
// EXECUTION PLAN
// ============================================================================

/// Leveled plan produced from a workflow's dependency edges.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionPlan {
    /// Step ids grouped by level, ascending; definition order within each.
    pub levels: Vec<Vec<String>>,
    /// All `(predecessor, successor)` edges.
    pub edges: Vec<(String, String)>,
    /// Width of the widest level.
    pub estimated_parallelism: usize,
    #[serde(skip)]
    predecessors: HashMap<String, Vec<String>>,
    #[serde(skip)]
    level_of: HashMap<String, usize>,
}

impl ExecutionPlan {
    pub fn predecessors(&self, step_id: &str) -> &[String] {
        static EMPTY: Vec<String> = Vec::new();
        self.predecessors.get(step_id).unwrap_or(&EMPTY)
    }

    pub fn level_of(&self, step_id: &str) -> Option<usize> {
        self.level_of.get(step_id).copied()
    }

    /// Step ids in topological order (levels flattened).
    pub fn topological_order(&self) -> impl Iterator<Item = &str> {
        self.levels.iter().flatten().map(|s| s.as_str())
    }
}

// ============================================================================
// BUILD
// ============================================================================

/// Compile the plan for a workflow spec.
pub fn build_plan(spec: &WorkflowSpec) -> Result<ExecutionPlan, DagError> {
    let task_count = spec.tasks.len();

    // Definition order index, used for stable tie-breaking.
    let mut position: HashMap<&str, usize> = HashMap::with_capacity(task_count);
    for (idx, step) in spec.tasks.iter().enumerate() {
        position.insert(step.id.as_str(), idx);
    }

    let mut in_degree: HashMap<&str, usize> = HashMap::with_capacity(task_count);
    let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::with_capacity(task_count);
    let mut predecessors: HashMap<String, Vec<String>> = HashMap::with_capacity(task_count);
    let mut edges = Vec::new();

    for step in &spec.tasks {
        in_degree.insert(&step.id, 0);
        adjacency.insert(&step.id, Vec::new());
        predecessors.insert(step.id.clone(), Vec::new());
    }

    for step in &spec.tasks {
        for dep in &step.depends_on {
            if !position.contains_key(dep.as_str()) {
                return Err(DagError::UnknownDependency {
                    step: step.id.clone(),
                    dep: dep.clone(),
                });
            }
            if let Some(succs) = adjacency.get_mut(dep.as_str()) {
                succs.push(step.id.as_str());
            }
            if let Some(deg) = in_degree.get_mut(step.id.as_str()) {
                *deg += 1;
            }
            if let Some(preds) = predecessors.get_mut(step.id.as_str()) {
                preds.push(dep.clone());
            }
            edges.push((dep.clone(), step.id.clone()));
        }
    }

    // Kahn iteration, assigning level(n) = 1 + max(level(preds)).
    let mut level_of: HashMap<String, usize> = HashMap::with_capacity(task_count);
    let mut queue: VecDeque<&str> = spec
        .tasks
        .iter()
        .filter(|t| in_degree.get(t.id.as_str()) == Some(&0))
        .map(|t| t.id.as_str())
        .collect();
    for root in &queue {
        level_of.insert(root.to_string(), 0);
    }

    let mut processed = 0usize;
    while let Some(node) = queue.pop_front() {
        processed += 1;
        let node_level = level_of[node];
        if let Some(successors) = adjacency.get(node) {
            for &succ in successors {
                let entry = level_of.entry(succ.to_string()).or_insert(0);
                *entry = (*entry).max(node_level + 1);
                if let Some(deg) = in_degree.get_mut(succ) {
                    *deg -= 1;
                    if *deg == 0 {
                        queue.push_back(succ);
                    }
                }
            }
        }
    }

    if processed != task_count {
        // Residual in-degree marks the cycle participants.
        let mut ids: Vec<String> = in_degree
            .iter()
            .filter(|(_, &deg)| deg > 0)
            .map(|(&id, _)| id.to_string())
            .collect();
        ids.sort_by_key(|id| position[id.as_str()]);
        return Err(DagError::CycleDetected { ids });
    }

    // Group by level, definition order within each.
    let max_level = level_of.values().copied().max().map_or(0, |m| m + 1);
    let mut levels: Vec<Vec<String>> = vec![Vec::new(); max_level];
    for step in &spec.tasks {
        levels[level_of[&step.id]].push(step.id.clone());
    }

    let estimated_parallelism = levels.iter().map(|l| l.len()).max().unwrap_or(0);

    Ok(ExecutionPlan {
        levels,
        edges,
        estimated_parallelism,
        predecessors,
        level_of,
    })
}

// ============================================================================
// TESTS
// ============================================================================
