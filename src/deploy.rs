//! Task deployment matrix
//!
//! Tracks `task -> environment -> {version, timestamp}` against an ordered
//! promotion chain (e.g. dev -> staging -> prod). `can_deploy` enforces
//! the prior-environment rule: a version may enter an environment only
//! when it is currently recorded in the chain's immediately preceding
//! environment. All mutations are per-key atomic.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

use crate::error::EngineError;

// ============================================================================
// TYPES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeploymentRecord {
    pub version: String,
    pub timestamp: DateTime<Utc>,
}

/// Answer to a can-deploy query.
#[derive(Debug, Clone, Serialize)]
pub struct DeployCheck {
    pub can_deploy: bool,
    pub reason: Option<String>,
}

impl DeployCheck {
    fn ok() -> Self {
        Self {
            can_deploy: true,
            reason: None,
        }
    }

    fn blocked(reason: String) -> Self {
        Self {
            can_deploy: false,
            reason: Some(reason),
        }
    }
}

// ============================================================================
// MATRIX
// ============================================================================

/// Thread-safe deployment matrix over a fixed promotion chain.
pub struct DeploymentMatrix {
    chain: Vec<String>,
    deployments: DashMap<String, BTreeMap<String, DeploymentRecord>>,
}

impl DeploymentMatrix {
    /// Standard three-stage chain.
    pub fn standard() -> Self {
        Self::new(vec!["dev".into(), "staging".into(), "prod".into()])
    }

    pub fn new(chain: Vec<String>) -> Self {
        Self {
            chain,
            deployments: DashMap::new(),
        }
    }

    pub fn chain(&self) -> &[String] {
        &self.chain
    }

    /// Record a deployment of `version` to `env`.
    pub fn record(&self, task: &str, env: &str, version: &str) -> Result<(), EngineError> {
        if !self.chain.iter().any(|e| e == env) {
            return Err(EngineError::UnknownEnvironment(env.to_string()));
        }
        self.deployments.entry(task.to_string()).or_default().insert(
            env.to_string(),
            DeploymentRecord {
                version: version.to_string(),
                timestamp: Utc::now(),
            },
        );
        Ok(())
    }

    /// The prior-environment rule: deployable iff the version is currently
    /// recorded in the environment immediately before `env` in the chain
    /// (the first environment has no predecessor and always accepts).
    pub fn can_deploy(&self, task: &str, version: &str, env: &str) -> DeployCheck {
        let Some(position) = self.chain.iter().position(|e| e == env) else {
            return DeployCheck::blocked(format!("unknown environment '{env}'"));
        };
        if position == 0 {
            return DeployCheck::ok();
        }

        let predecessor = &self.chain[position - 1];
        let current = self
            .deployments
            .get(task)
            .and_then(|envs| envs.get(predecessor).cloned());

        match current {
            Some(record) if record.version == version => DeployCheck::ok(),
            Some(record) => DeployCheck::blocked(format!(
                "version '{version}' is not deployed to '{predecessor}' (found '{}'); deploy there before '{env}'",
                record.version
            )),
            None => DeployCheck::blocked(format!(
                "version '{version}' is not deployed to '{predecessor}'; deploy there before '{env}'"
            )),
        }
    }

    /// Per-environment snapshot for one task. Consistent per key; no
    /// cross-key transaction.
    pub fn deployments(&self, task: &str) -> BTreeMap<String, DeploymentRecord> {
        self.deployments
            .get(task)
            .map(|envs| envs.clone())
            .unwrap_or_default()
    }
}

// ============================================================================
// TESTS
// ============================================================================
