//! Dependency impact analysis
//!
//! Classifies a proposed task change against the consumer contracts: which
//! workflows are affected, how severe the change is, and whether it is
//! blocked outright. The suggested actions walk the lifecycle: publish a
//! new Active version, supersede the old one, schedule deprecation.

use serde::Serialize;

use crate::usage::ContractIndex;

// ============================================================================
// TYPES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum ImpactLevel {
    None,
    Low,
    Medium,
    High,
}

impl std::fmt::Display for ImpactLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ImpactLevel::None => "None",
            ImpactLevel::Low => "Low",
            ImpactLevel::Medium => "Medium",
            ImpactLevel::High => "High",
        };
        write!(f, "{s}")
    }
}

/// A proposed change to a task's contract surface.
#[derive(Debug, Clone, PartialEq)]
pub enum ProposedChange {
    /// Remove a field (input or output).
    RemoveField(String),
    /// Rename a field.
    RenameField { from: String, to: String },
    /// Keep the field, change its type.
    ChangeFieldType(String),
    /// Add a new optional field.
    AddOptionalField(String),
    /// Add a required input field.
    AddRequiredInput { field: String, has_default: bool },
}

#[derive(Debug, Clone, Serialize)]
pub struct ImpactReport {
    pub task: String,
    pub level: ImpactLevel,
    pub affected_workflows: Vec<String>,
    pub blocked: bool,
    pub suggested_actions: Vec<String>,
}

// ============================================================================
// CLASSIFIER
// ============================================================================

/// Assess the blast radius of a proposed change.
pub fn assess(task: &str, change: &ProposedChange, index: &ContractIndex) -> ImpactReport {
    let contracts = index.contracts_for_task(task);

    let consumers_of = |field: &str| -> Vec<String> {
        contracts
            .iter()
            .filter(|c| c.consumes_output_field(field) || c.requires_input_field(field))
            .map(|c| c.workflow.clone())
            .collect()
    };

    let all_consumers: Vec<String> = contracts.iter().map(|c| c.workflow.clone()).collect();

    let (level, affected, blocked) = match change {
        ProposedChange::RemoveField(field) | ProposedChange::RenameField { from: field, .. } => {
            let affected = consumers_of(field);
            if affected.is_empty() {
                // Still a shape change for consumers the index cannot see.
                (ImpactLevel::Low, affected, false)
            } else {
                (ImpactLevel::High, affected, true)
            }
        }
        ProposedChange::ChangeFieldType(field) => {
            let affected = consumers_of(field);
            if affected.is_empty() {
                (ImpactLevel::Low, affected, false)
            } else {
                (ImpactLevel::Medium, affected, false)
            }
        }
        ProposedChange::AddOptionalField(_) => (ImpactLevel::None, Vec::new(), false),
        ProposedChange::AddRequiredInput { has_default, .. } => {
            if *has_default {
                (ImpactLevel::None, Vec::new(), false)
            } else {
                // Every current consumer breaks until it passes the field.
                (ImpactLevel::High, all_consumers, false)
            }
        }
    };

    let mut affected = affected;
    affected.sort();
    affected.dedup();

    let suggested_actions = if level >= ImpactLevel::Medium {
        vec![
            format!("Introduce a new version of '{task}' as Active"),
            format!("Mark the current '{task}' as Superseded"),
            "Schedule Deprecated after the grace period".to_string(),
        ]
    } else {
        Vec::new()
    };

    ImpactReport {
        task: task.to_string(),
        level,
        affected_workflows: affected,
        blocked,
        suggested_actions,
    }
}

// ============================================================================
// TESTS
// ============================================================================
