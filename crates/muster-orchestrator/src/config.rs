use muster_core::{MusterError, MusterResult, ResourceAllocation};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How the scheduler picks among eligible agents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CoordinationStrategy {
    /// Least loaded, then largest resource surplus, then registration order.
    #[default]
    CapabilityMatch,
    /// First eligible agent in registration order.
    FirstFit,
}

impl std::fmt::Display for CoordinationStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CoordinationStrategy::CapabilityMatch => write!(f, "capability-match"),
            CoordinationStrategy::FirstFit => write!(f, "first-fit"),
        }
    }
}

/// Concurrency and retry knobs. Serialized in camelCase, as in snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionConfig {
    /// Most tasks in progress at once across the pool.
    #[serde(default = "default_max_concurrent", alias = "max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,
    /// Resubmit failed tasks automatically.
    #[serde(default, alias = "enable_auto_retry")]
    pub enable_auto_retry: bool,
    /// Retries allowed per original task.
    #[serde(default = "default_max_retry", alias = "max_retry_attempts")]
    pub max_retry_attempts: u32,
}

fn default_max_concurrent() -> usize {
    5
}

fn default_max_retry() -> u32 {
    3
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: default_max_concurrent(),
            enable_auto_retry: false,
            max_retry_attempts: default_max_retry(),
        }
    }
}

/// Engine configuration, typically the `[engine]` table of `muster.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Stable id written into snapshots.
    #[serde(default = "default_coordinator_id")]
    pub coordinator_id: String,
    /// Human-readable name.
    #[serde(default = "default_coordinator_name")]
    pub coordinator_name: String,
    /// How ready tasks are placed on agents.
    #[serde(default)]
    pub coordination_strategy: CoordinationStrategy,
    /// Concurrency and retry settings.
    #[serde(default)]
    pub execution: ExecutionConfig,
    /// Pause between scheduling cycles.
    #[serde(default = "default_cycle_interval_ms")]
    pub cycle_interval_ms: u64,
    /// Per-execution timeout; unset means executions may run indefinitely.
    #[serde(default)]
    pub execution_timeout_ms: Option<u64>,
    /// Idle agents silent for longer than this are marked offline.
    #[serde(default)]
    pub heartbeat_timeout_ms: Option<u64>,
    /// Resource requirements for tasks that do not declare any.
    #[serde(default = "default_resources")]
    pub default_resources: ResourceAllocation,
    /// Store key the snapshot is written under.
    #[serde(default = "default_snapshot_key")]
    pub snapshot_key: String,
    /// Refuse to start without a snapshot store.
    #[serde(default)]
    pub strict: bool,
    /// Buffered events per subscriber before it lags.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_coordinator_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn default_coordinator_name() -> String {
    "muster".to_string()
}

fn default_cycle_interval_ms() -> u64 {
    5000
}

fn default_resources() -> ResourceAllocation {
    ResourceAllocation::new(1.0, 128.0, 0.0)
}

fn default_snapshot_key() -> String {
    "muster-state".to_string()
}

fn default_event_capacity() -> usize {
    256
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            coordinator_id: default_coordinator_id(),
            coordinator_name: default_coordinator_name(),
            coordination_strategy: CoordinationStrategy::default(),
            execution: ExecutionConfig::default(),
            cycle_interval_ms: default_cycle_interval_ms(),
            execution_timeout_ms: None,
            heartbeat_timeout_ms: None,
            default_resources: default_resources(),
            snapshot_key: default_snapshot_key(),
            strict: false,
            event_capacity: default_event_capacity(),
        }
    }
}

impl EngineConfig {
    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> MusterResult<()> {
        if self.cycle_interval_ms == 0 {
            return Err(MusterError::Config(
                "cycle_interval_ms must be positive".to_string(),
            ));
        }
        if self.event_capacity == 0 {
            return Err(MusterError::Config(
                "event_capacity must be positive".to_string(),
            ));
        }
        if self.snapshot_key.trim().is_empty() {
            return Err(MusterError::Config(
                "snapshot_key must not be empty".to_string(),
            ));
        }
        if self.execution_timeout_ms == Some(0) || self.heartbeat_timeout_ms == Some(0) {
            return Err(MusterError::Config(
                "timeouts must be positive when set".to_string(),
            ));
        }
        self.default_resources
            .validate("default_resources")
            .map_err(|e| MusterError::Config(e.to_string()))
    }

    /// `cycle_interval_ms` as a [`Duration`].
    pub fn cycle_interval(&self) -> Duration {
        Duration::from_millis(self.cycle_interval_ms)
    }

    /// `execution_timeout_ms` as a [`Duration`].
    pub fn execution_timeout(&self) -> Option<Duration> {
        self.execution_timeout_ms.map(Duration::from_millis)
    }

    /// `heartbeat_timeout_ms` as a [`Duration`].
    pub fn heartbeat_timeout(&self) -> Option<Duration> {
        self.heartbeat_timeout_ms.map(Duration::from_millis)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.execution.max_concurrent_tasks, 5);
        assert!(!config.execution.enable_auto_retry);
        assert_eq!(config.execution.max_retry_attempts, 3);
        assert_eq!(config.cycle_interval(), Duration::from_secs(5));
        assert_eq!(config.default_resources, ResourceAllocation::new(1.0, 128.0, 0.0));
        assert_eq!(config.snapshot_key, "muster-state");
        assert!(uuid::Uuid::parse_str(&config.coordinator_id).is_ok());
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_toml() {
        let config: EngineConfig = toml::from_str(
            r#"
            coordinator_name = "render-farm"
            coordination_strategy = "first-fit"
            cycle_interval_ms = 250

            [execution]
            max_concurrent_tasks = 2
            enable_auto_retry = true
            "#,
        )
        .unwrap();
        assert_eq!(config.coordinator_name, "render-farm");
        assert_eq!(config.coordination_strategy, CoordinationStrategy::FirstFit);
        assert_eq!(config.execution.max_concurrent_tasks, 2);
        assert!(config.execution.enable_auto_retry);
        assert_eq!(config.execution.max_retry_attempts, 3);
        assert_eq!(config.snapshot_key, "muster-state");
    }

    #[test]
    fn test_execution_config_camel_case() {
        let json = serde_json::to_value(ExecutionConfig::default()).unwrap();
        assert_eq!(json["maxConcurrentTasks"], 5);
        assert_eq!(json["enableAutoRetry"], false);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let config = EngineConfig {
            cycle_interval_ms: 0,
            ..EngineConfig::default()
        };
        assert!(matches!(config.validate(), Err(MusterError::Config(_))));
        let config = EngineConfig {
            default_resources: ResourceAllocation::new(-1.0, 0.0, 0.0),
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
