use muster_core::{AgentId, TaskId};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Execution counters for one agent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentMetrics {
    /// Executions that succeeded.
    pub tasks_completed: u64,
    /// Executions that failed or timed out.
    pub tasks_failed: u64,
    /// Executions whose result was dropped because the task was cancelled or requeued.
    pub tasks_discarded: u64,
    /// Total execution time across all outcomes.
    pub duration_ms: u64,
    /// Most recent task this agent executed.
    pub last_task: Option<TaskId>,
}

/// Tracks per-agent execution metrics.
///
/// Kept outside the engine lock so observers can read it without contending
/// with scheduling.
pub struct AgentMonitor {
    metrics: Arc<RwLock<HashMap<AgentId, AgentMetrics>>>,
}

impl AgentMonitor {
    /// Create an empty monitor.
    pub fn new() -> Self {
        Self {
            metrics: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Count a successful execution.
    pub async fn record_success(&self, agent_id: &str, task_id: &str, duration_ms: u64) {
        let mut metrics = self.metrics.write().await;
        let entry = metrics.entry(agent_id.to_string()).or_default();
        entry.tasks_completed += 1;
        entry.duration_ms += duration_ms;
        entry.last_task = Some(task_id.to_string());
    }

    /// Count a failed execution.
    pub async fn record_failure(&self, agent_id: &str, task_id: &str, duration_ms: u64) {
        let mut metrics = self.metrics.write().await;
        let entry = metrics.entry(agent_id.to_string()).or_default();
        entry.tasks_failed += 1;
        entry.duration_ms += duration_ms;
        entry.last_task = Some(task_id.to_string());
    }

    /// Count an execution whose result was discarded.
    pub async fn record_discard(&self, agent_id: &str, task_id: &str, duration_ms: u64) {
        let mut metrics = self.metrics.write().await;
        let entry = metrics.entry(agent_id.to_string()).or_default();
        entry.tasks_discarded += 1;
        entry.duration_ms += duration_ms;
        entry.last_task = Some(task_id.to_string());
    }

    /// Metrics for one agent.
    pub async fn get(&self, agent_id: &str) -> Option<AgentMetrics> {
        self.metrics.read().await.get(agent_id).cloned()
    }

    /// All per-agent metrics, sorted by agent id.
    pub async fn snapshot(&self) -> Vec<(AgentId, AgentMetrics)> {
        let metrics = self.metrics.read().await;
        let mut all: Vec<_> = metrics
            .iter()
            .map(|(id, m)| (id.clone(), m.clone()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    /// Totals across every agent.
    pub async fn aggregate(&self) -> AgentMetrics {
        let metrics = self.metrics.read().await;
        let mut total = AgentMetrics::default();
        for m in metrics.values() {
            total.tasks_completed += m.tasks_completed;
            total.tasks_failed += m.tasks_failed;
            total.tasks_discarded += m.tasks_discarded;
            total.duration_ms += m.duration_ms;
        }
        total
    }

    /// All metrics as a JSON object keyed by agent id.
    pub async fn to_json(&self) -> serde_json::Value {
        let agents: serde_json::Map<String, serde_json::Value> = self
            .snapshot()
            .await
            .into_iter()
            .map(|(id, m)| (id, serde_json::to_value(m).unwrap_or_default()))
            .collect();
        serde_json::json!({
            "agents": agents,
            "aggregate": self.aggregate().await,
        })
    }
}

impl Default for AgentMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unknown_agent_has_no_metrics() {
        let monitor = AgentMonitor::new();
        assert!(monitor.get("a1").await.is_none());
        assert!(monitor.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn test_record_outcomes() {
        let monitor = AgentMonitor::new();
        monitor.record_success("a1", "t1", 120).await;
        monitor.record_failure("a1", "t2", 30).await;
        monitor.record_discard("a1", "t3", 10).await;

        let m = monitor.get("a1").await.unwrap();
        assert_eq!(m.tasks_completed, 1);
        assert_eq!(m.tasks_failed, 1);
        assert_eq!(m.tasks_discarded, 1);
        assert_eq!(m.duration_ms, 160);
        assert_eq!(m.last_task.as_deref(), Some("t3"));
    }

    #[tokio::test]
    async fn test_aggregate_and_json() {
        let monitor = AgentMonitor::new();
        monitor.record_success("a1", "t1", 5).await;
        monitor.record_success("a2", "t2", 7).await;
        let agg = monitor.aggregate().await;
        assert_eq!(agg.tasks_completed, 2);
        assert_eq!(agg.duration_ms, 12);

        let json = monitor.to_json().await;
        assert_eq!(json["agents"]["a2"]["tasksCompleted"], 1);
        assert!(json["aggregate"].is_object());
    }
}
