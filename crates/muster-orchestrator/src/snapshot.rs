use crate::config::{CoordinationStrategy, ExecutionConfig};
use crate::types::{Agent, Task};
use chrono::{DateTime, Utc};
use muster_core::{MusterError, MusterResult};
use serde::{Deserialize, Serialize};

/// Current snapshot format version.
pub const SNAPSHOT_VERSION: u32 = 1;

fn default_version() -> u32 {
    SNAPSHOT_VERSION
}

/// Serialized engine state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineSnapshot {
    /// Format version, see [`SNAPSHOT_VERSION`].
    #[serde(default = "default_version")]
    pub version: u32,
    /// Id of the coordinator that wrote the snapshot.
    pub coordinator_id: String,
    /// Human-readable coordinator name.
    pub coordinator_name: String,
    /// Placement strategy in force when saved.
    #[serde(default)]
    pub coordination_strategy: CoordinationStrategy,
    /// Concurrency and retry settings.
    #[serde(default)]
    pub execution_config: ExecutionConfig,
    /// Shared key-value state.
    #[serde(default)]
    pub shared_state: serde_json::Map<String, serde_json::Value>,
    /// Every task record.
    #[serde(default)]
    pub tasks: Vec<Task>,
    /// Every agent record.
    #[serde(default)]
    pub agents: Vec<Agent>,
    /// Whether a cycle had run.
    #[serde(default)]
    pub initialized: bool,
    /// Whether the scheduler loop was active.
    #[serde(default)]
    pub is_running: bool,
    /// When the snapshot was taken.
    pub saved_at: DateTime<Utc>,
}

impl EngineSnapshot {
    /// Serialize as camelCase JSON.
    pub fn to_bytes(&self) -> MusterResult<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    /// Parse a snapshot, rejecting formats newer than this build understands.
    pub fn from_bytes(bytes: &[u8]) -> MusterResult<Self> {
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Err(MusterError::Persistence("snapshot is empty".to_string()));
        }
        let snapshot: EngineSnapshot = serde_json::from_slice(bytes)?;
        if snapshot.version > SNAPSHOT_VERSION {
            return Err(MusterError::Persistence(format!(
                "snapshot version {} is newer than supported version {SNAPSHOT_VERSION}",
                snapshot.version
            )));
        }
        Ok(snapshot)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn minimal() -> serde_json::Value {
        json!({
            "coordinatorId": "c1",
            "coordinatorName": "muster",
            "savedAt": "2026-01-01T00:00:00Z"
        })
    }

    #[test]
    fn test_minimal_snapshot_fills_defaults() {
        let bytes = serde_json::to_vec(&minimal()).unwrap();
        let snap = EngineSnapshot::from_bytes(&bytes).unwrap();
        assert_eq!(snap.version, SNAPSHOT_VERSION);
        assert!(snap.tasks.is_empty());
        assert_eq!(snap.execution_config.max_concurrent_tasks, 5);
        assert!(!snap.is_running);
    }

    #[test]
    fn test_rejects_empty_malformed_and_future() {
        assert!(EngineSnapshot::from_bytes(b"").is_err());
        assert!(EngineSnapshot::from_bytes(b"  \n").is_err());
        assert!(EngineSnapshot::from_bytes(b"{\"tasks\": [").is_err());
        let mut future = minimal();
        future["version"] = json!(SNAPSHOT_VERSION + 1);
        let bytes = serde_json::to_vec(&future).unwrap();
        assert!(matches!(
            EngineSnapshot::from_bytes(&bytes),
            Err(MusterError::Persistence(_))
        ));
    }

    #[test]
    fn test_wire_keys_are_camel_case() {
        let snap = EngineSnapshot::from_bytes(&serde_json::to_vec(&minimal()).unwrap()).unwrap();
        let value: serde_json::Value =
            serde_json::from_slice(&snap.to_bytes().unwrap()).unwrap();
        for key in [
            "version",
            "coordinatorId",
            "coordinatorName",
            "coordinationStrategy",
            "executionConfig",
            "sharedState",
            "tasks",
            "agents",
            "initialized",
            "isRunning",
            "savedAt",
        ] {
            assert!(value.get(key).is_some(), "missing {key}");
        }
        assert_eq!(value["executionConfig"]["maxRetryAttempts"], 3);
    }
}
