//! Runtime configuration for an orchestrator instance.
//!
//! All fields have serde defaults so a partial TOML document (or an empty
//! one) yields a usable configuration. Validation happens once, at
//! orchestrator construction, the only place a configuration problem is
//! allowed to surface as a synchronous error.

use crate::{OverseerError, OverseerResult};
use serde::{Deserialize, Serialize};

/// How the dispatch loop orders the task queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SchedulingAlgorithm {
    /// Highest-priority bucket first, FIFO within a bucket.
    #[default]
    Priority,
    /// Pure arrival order, priorities ignored.
    Fifo,
    /// Cycle across requestor groups to avoid starving low-priority requestors.
    RoundRobin,
}

/// How the resource allocator picks a worker for a subtask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AllocationStrategy {
    /// Lowest `current_load / weight` ratio wins, ties broken by worker id.
    #[default]
    Balanced,
    /// High-priority tasks prefer top-weight workers; otherwise balanced.
    Priority,
    /// Probabilistic selection proportional to weight (seedable).
    Weighted,
}

/// Runtime configuration for an orchestrator instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Number of priority levels; submitted priorities are clamped to `[1, priority_levels]`.
    #[serde(default = "default_priority_levels")]
    pub priority_levels: u8,
    /// Queue ordering algorithm.
    #[serde(default)]
    pub scheduling_algorithm: SchedulingAlgorithm,
    /// Worker selection strategy.
    #[serde(default)]
    pub resource_allocation: AllocationStrategy,
    /// When false, recoverable failures are terminal (no retries).
    #[serde(default = "default_true")]
    pub fault_tolerance: bool,
    /// Maximum number of queued tasks before `submit` fails.
    #[serde(default = "default_task_queue_limit")]
    pub task_queue_limit: usize,
    /// Maximum automatic retries per task.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Whether a rule-produced subtask may itself be decomposed.
    #[serde(default)]
    pub allow_nested_decomposition: bool,
    /// Depth bound on nested decomposition, to limit fan-out.
    #[serde(default = "default_max_decomposition_depth")]
    pub max_decomposition_depth: u32,
    /// Per-invocation worker timeout in seconds.
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    /// Global cap on concurrently running worker invocations.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    /// Per-worker concurrent load ceiling.
    #[serde(default = "default_max_worker_load")]
    pub max_worker_load: usize,
    /// Delay before a retried task is re-enqueued, in milliseconds.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// When true, retried payloads get their numeric `scope` field halved.
    #[serde(default)]
    pub simplify_on_retry: bool,
    /// Seed for the weighted allocation RNG; set for reproducible selection.
    #[serde(default)]
    pub allocation_seed: Option<u64>,
}

fn default_priority_levels() -> u8 {
    10
}

fn default_true() -> bool {
    true
}

fn default_task_queue_limit() -> usize {
    1000
}

fn default_max_retries() -> u32 {
    3
}

fn default_max_decomposition_depth() -> u32 {
    3
}

fn default_timeout_seconds() -> u64 {
    30
}

fn default_max_in_flight() -> usize {
    16
}

fn default_max_worker_load() -> usize {
    4
}

fn default_retry_backoff_ms() -> u64 {
    100
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            priority_levels: default_priority_levels(),
            scheduling_algorithm: SchedulingAlgorithm::default(),
            resource_allocation: AllocationStrategy::default(),
            fault_tolerance: true,
            task_queue_limit: default_task_queue_limit(),
            max_retries: default_max_retries(),
            allow_nested_decomposition: false,
            max_decomposition_depth: default_max_decomposition_depth(),
            timeout_seconds: default_timeout_seconds(),
            max_in_flight: default_max_in_flight(),
            max_worker_load: default_max_worker_load(),
            retry_backoff_ms: default_retry_backoff_ms(),
            simplify_on_retry: false,
            allocation_seed: None,
        }
    }
}

impl OrchestratorConfig {
    /// Parse a configuration from a TOML document.
    pub fn from_toml_str(input: &str) -> OverseerResult<Self> {
        let config: Self = toml::from_str(input)
            .map_err(|e| OverseerError::Config(format!("invalid TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Check invariants that serde alone cannot express.
    pub fn validate(&self) -> OverseerResult<()> {
        if self.priority_levels == 0 {
            return Err(OverseerError::Config(
                "priority_levels must be at least 1".into(),
            ));
        }
        if self.task_queue_limit == 0 {
            return Err(OverseerError::Config(
                "task_queue_limit must be at least 1".into(),
            ));
        }
        if self.max_in_flight == 0 {
            return Err(OverseerError::Config(
                "max_in_flight must be at least 1".into(),
            ));
        }
        if self.max_worker_load == 0 {
            return Err(OverseerError::Config(
                "max_worker_load must be at least 1".into(),
            ));
        }
        if self.timeout_seconds == 0 {
            return Err(OverseerError::Config(
                "timeout_seconds must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Clamp a submitted priority into the configured `[1, priority_levels]` range.
    pub fn clamp_priority(&self, priority: u8) -> u8 {
        priority.clamp(1, self.priority_levels)
    }

    /// The cutoff above which a priority counts as "high" (top third of the range).
    pub fn high_priority_cutoff(&self) -> u8 {
        self.priority_levels - self.priority_levels / 3
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = OrchestratorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.priority_levels, 10);
        assert_eq!(config.scheduling_algorithm, SchedulingAlgorithm::Priority);
        assert_eq!(config.resource_allocation, AllocationStrategy::Balanced);
        assert!(config.fault_tolerance);
        assert!(!config.allow_nested_decomposition);
    }

    #[test]
    fn test_empty_toml_yields_defaults() {
        let config = OrchestratorConfig::from_toml_str("").unwrap();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.task_queue_limit, 1000);
    }

    #[test]
    fn test_partial_toml() {
        let config = OrchestratorConfig::from_toml_str(
            r#"
            scheduling_algorithm = "round_robin"
            resource_allocation = "weighted"
            max_retries = 5
            allocation_seed = 42
            "#,
        )
        .unwrap();
        assert_eq!(config.scheduling_algorithm, SchedulingAlgorithm::RoundRobin);
        assert_eq!(config.resource_allocation, AllocationStrategy::Weighted);
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.allocation_seed, Some(42));
    }

    #[test]
    fn test_invalid_algorithm_name_rejected() {
        let result = OrchestratorConfig::from_toml_str(r#"scheduling_algorithm = "lifo""#);
        assert!(result.is_err());
    }

    #[test]
    fn test_zero_priority_levels_rejected() {
        let result = OrchestratorConfig::from_toml_str("priority_levels = 0");
        assert!(matches!(result, Err(OverseerError::Config(_))));
    }

    #[test]
    fn test_zero_queue_limit_rejected() {
        let config = OrchestratorConfig {
            task_queue_limit: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_clamp_priority() {
        let config = OrchestratorConfig {
            priority_levels: 5,
            ..Default::default()
        };
        assert_eq!(config.clamp_priority(0), 1);
        assert_eq!(config.clamp_priority(3), 3);
        assert_eq!(config.clamp_priority(9), 5);
    }

    #[test]
    fn test_high_priority_cutoff() {
        let ten = OrchestratorConfig::default();
        // Top third of 1..=10 is 8, 9, 10.
        assert_eq!(ten.high_priority_cutoff(), 7);

        let five = OrchestratorConfig {
            priority_levels: 5,
            ..Default::default()
        };
        assert_eq!(five.high_priority_cutoff(), 4);
    }

    #[test]
    fn test_config_round_trips_through_toml() {
        let config = OrchestratorConfig {
            max_retries: 7,
            allocation_seed: Some(7),
            ..Default::default()
        };
        let serialized = toml::to_string(&config).unwrap();
        let parsed = OrchestratorConfig::from_toml_str(&serialized).unwrap();
        assert_eq!(parsed.max_retries, 7);
        assert_eq!(parsed.allocation_seed, Some(7));
    }
}
