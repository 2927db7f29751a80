//! Engine configuration and retry policy
//!
//! Provides tunable knobs for workflow execution:
//! - Global parallelism and per-step timeouts
//! - Retry policy (attempts, backoff, jitter)
//! - Binary response storage thresholds and scratch directory

use std::path::PathBuf;
use std::time::Duration;

/// Threshold below which binary responses are inlined as base64.
pub const INLINE_BINARY_LIMIT: usize = 500 * 1024; // 500 KiB

/// Retry policy for HTTP-backed task steps.
///
/// Retries apply only to retryable outcomes (408/429/5xx and transport
/// errors). Delays follow `base * 2^k` with full jitter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first (1 = no retries).
    pub max_attempts: u32,
    /// Base delay before the first retry.
    pub base_delay: Duration,
    /// Cap applied after exponential growth.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Jittered delay before retry number `retry` (0-based).
    ///
    /// Full jitter: a uniform draw from `[0, base * 2^retry]`, capped at
    /// `max_delay`.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(retry))
            .min(self.max_delay);
        let ceiling = exp.as_millis() as u64;
        Duration::from_millis(fastrand::u64(0..=ceiling))
    }
}

/// Global engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Upper bound on concurrently executing steps per run.
    pub global_parallelism: usize,

    /// Timeout applied when neither the step nor the task declares one.
    pub default_task_timeout: Duration,

    /// Default retry policy; a task definition may override it.
    pub retry: RetryPolicy,

    /// Binary responses at or above this size spill to a temp file.
    pub inline_binary_limit: usize,

    /// Directory for spilled binary response bodies.
    pub scratch_dir: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            global_parallelism: 8,
            default_task_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            inline_binary_limit: INLINE_BINARY_LIMIT,
            scratch_dir: std::env::temp_dir().join("strata"),
        }
    }
}

impl EngineConfig {
    /// Restrictive profile for tests: tight timeouts, no retry delays worth
    /// waiting on, and a tiny inline limit so spill paths are exercised.
    pub fn testing() -> Self {
        Self {
            global_parallelism: 4,
            default_task_timeout: Duration::from_secs(5),
            retry: RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(10),
            },
            inline_binary_limit: 1024,
            scratch_dir: std::env::temp_dir().join("strata-test"),
        }
    }
}
