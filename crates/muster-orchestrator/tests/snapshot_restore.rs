#![allow(clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use muster_core::{MusterError, MusterResult};
use muster_orchestrator::*;
use muster_store::{FileSnapshotStore, MemorySnapshotStore, SnapshotStore};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::Semaphore;

struct Gate(Semaphore);

/// A store whose reads always fail.
struct UnreadableStore;

#[async_trait]
impl SnapshotStore for UnreadableStore {
    async fn get(&self, _name: &str) -> MusterResult<Option<Vec<u8>>> {
        Err(MusterError::Persistence("disk unplugged".into()))
    }

    async fn put(&self, _name: &str, _blob: &[u8]) -> MusterResult<()> {
        Ok(())
    }

    async fn exists(&self, _name: &str) -> MusterResult<bool> {
        Ok(false)
    }

    async fn delete(&self, _name: &str) -> MusterResult<()> {
        Ok(())
    }
}

#[async_trait]
impl TaskExecutor for Gate {
    async fn execute(&self, _task: &Task, _agent: &Agent) -> MusterResult<ExecutionOutcome> {
        let permit = self
            .0
            .acquire()
            .await
            .map_err(|e| MusterError::Execution(e.to_string()))?;
        permit.forget();
        Ok(ExecutionOutcome::success(json!("done")))
    }
}

fn config() -> EngineConfig {
    EngineConfig {
        coordinator_name: "render-farm".into(),
        cycle_interval_ms: 20,
        ..EngineConfig::default()
    }
}

fn agent(id: &str) -> AgentDescriptor {
    AgentDescriptor::new(id)
        .with_capability("compute", 1)
        .with_resources(4.0, 2048.0, 100.0)
}

#[tokio::test]
async fn completed_run_roundtrips_through_memory_store() {
    let store: Arc<dyn SnapshotStore> = Arc::new(MemorySnapshotStore::new());
    let coord = Coordinator::new(config(), Arc::new(NoopExecutor))
        .unwrap()
        .with_store(store.clone());
    coord.register_agent(agent("a1")).await.unwrap();
    coord.create_task(TaskDescriptor::new("t1")).await.unwrap();
    coord
        .create_task(TaskDescriptor::new("t2").depends_on(["t1"]))
        .await
        .unwrap();
    coord.set_shared("build", json!({"id": 42})).await;
    coord.run_until_idle().await;
    assert!(coord.persist().await);
    let before = coord.snapshot().await;

    let fresh = Coordinator::new(EngineConfig::default(), Arc::new(NoopExecutor))
        .unwrap()
        .with_store(store);
    assert!(fresh.restore_from_store().await);
    let after = fresh.snapshot().await;

    assert_eq!(after.coordinator_id, before.coordinator_id);
    assert_eq!(after.coordinator_name, "render-farm");
    assert_eq!(after.tasks.len(), 2);
    assert_eq!(after.agents.len(), 1);
    assert!(after.initialized);
    assert_eq!(fresh.shared("build").await, Some(json!({"id": 42})));
    let t2 = fresh.get_task("t2").await.unwrap();
    assert_eq!(t2.status, TaskStatus::Completed);
    assert_eq!(fresh.counts().await, coord.counts().await);
}

#[tokio::test]
async fn in_flight_tasks_are_requeued_on_restore() {
    let tmp = tempfile::tempdir().unwrap();
    let store: Arc<dyn SnapshotStore> =
        Arc::new(FileSnapshotStore::new(tmp.path().join("state")).await.unwrap());

    let gate = Arc::new(Gate(Semaphore::new(0)));
    let coord = Coordinator::new(config(), gate.clone())
        .unwrap()
        .with_store(store.clone());
    coord.register_agent(agent("a1")).await.unwrap();
    coord.create_task(TaskDescriptor::new("t1")).await.unwrap();
    coord.run_cycle().await;
    assert_eq!(coord.get_task("t1").await.unwrap().status, TaskStatus::InProgress);
    assert!(coord.persist().await);

    let revived = Coordinator::new(config(), Arc::new(NoopExecutor))
        .unwrap()
        .with_store(store);
    assert!(revived.restore_from_store().await);
    let t1 = revived.get_task("t1").await.unwrap();
    assert_eq!(t1.status, TaskStatus::Pending);
    assert!(t1.assigned_to.is_none());
    let a1 = revived.get_agent("a1").await.unwrap();
    assert!(a1.is_available());
    assert_eq!(a1.resources.available, a1.resources.total);

    revived.run_until_idle().await;
    assert_eq!(revived.get_task("t1").await.unwrap().status, TaskStatus::Completed);
    gate.0.add_permits(1);
}

#[tokio::test]
async fn malformed_snapshot_resets_to_empty_state() {
    let coord = Coordinator::new(config(), Arc::new(NoopExecutor)).unwrap();
    coord.register_agent(agent("a1")).await.unwrap();
    coord.create_task(TaskDescriptor::new("t1")).await.unwrap();

    assert!(!coord.restore(b"{ this is not json").await);
    assert!(coord.list_agents().await.is_empty());
    assert_eq!(coord.counts().await.total, 0);
    // Configuration survives the reset.
    assert_eq!(coord.config().await.coordinator_name, "render-farm");

    assert!(!coord.restore(b"").await);
}

#[tokio::test]
async fn restore_without_store_keeps_state() {
    let coord = Coordinator::new(config(), Arc::new(NoopExecutor)).unwrap();
    coord.register_agent(agent("a1")).await.unwrap();
    assert!(!coord.restore_from_store().await);
    assert!(!coord.persist().await);
    assert_eq!(coord.list_agents().await.len(), 1);
}

#[tokio::test]
async fn missing_snapshot_starts_fresh() {
    let coord = Coordinator::new(config(), Arc::new(NoopExecutor))
        .unwrap()
        .with_store(Arc::new(MemorySnapshotStore::new()));
    coord.register_agent(agent("a1")).await.unwrap();
    coord.create_task(TaskDescriptor::new("t1")).await.unwrap();

    assert!(!coord.restore_from_store().await);
    assert!(coord.list_agents().await.is_empty());
    assert_eq!(coord.counts().await.total, 0);
    assert_eq!(coord.config().await.coordinator_name, "render-farm");
}

#[tokio::test]
async fn unreadable_store_starts_fresh() {
    let coord = Coordinator::new(config(), Arc::new(NoopExecutor))
        .unwrap()
        .with_store(Arc::new(UnreadableStore));
    coord.register_agent(agent("a1")).await.unwrap();
    coord.create_task(TaskDescriptor::new("t1")).await.unwrap();

    assert!(!coord.restore_from_store().await);
    assert!(coord.list_agents().await.is_empty());
    assert_eq!(coord.counts().await.total, 0);
    assert!(!coord.snapshot().await.initialized);
}

#[tokio::test]
async fn concurrent_persists_all_succeed() {
    let tmp = tempfile::tempdir().unwrap();
    let store: Arc<dyn SnapshotStore> =
        Arc::new(FileSnapshotStore::new(tmp.path().to_path_buf()).await.unwrap());
    let coord = Coordinator::new(config(), Arc::new(NoopExecutor))
        .unwrap()
        .with_store(store.clone());
    for i in 0..200 {
        coord.create_task(TaskDescriptor::new(format!("t{i}"))).await.unwrap();
    }

    let mut handles = Vec::new();
    for _ in 0..32 {
        let coord = coord.clone();
        handles.push(tokio::spawn(async move { coord.persist().await }));
    }
    for handle in handles {
        assert!(handle.await.unwrap());
    }

    let bytes = store.get(&config().snapshot_key).await.unwrap().unwrap();
    let snapshot = EngineSnapshot::from_bytes(&bytes).unwrap();
    assert_eq!(snapshot.tasks.len(), 200);
}

#[tokio::test]
async fn snapshot_bytes_use_camel_case_keys() {
    let coord = Coordinator::new(config(), Arc::new(NoopExecutor)).unwrap();
    coord.register_agent(agent("a1")).await.unwrap();
    coord
        .create_task(TaskDescriptor::new("t1").requires("compute", 1))
        .await
        .unwrap();
    let bytes = coord.snapshot_bytes().await.unwrap();
    let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();

    assert_eq!(value["version"], SNAPSHOT_VERSION);
    assert_eq!(value["coordinatorName"], "render-farm");
    assert_eq!(value["coordinationStrategy"], "capability-match");
    assert_eq!(value["executionConfig"]["maxConcurrentTasks"], 5);
    assert_eq!(value["isRunning"], false);
    assert_eq!(value["tasks"][0]["requiredCapabilities"][0]["kind"], "compute");
    assert_eq!(value["tasks"][0]["status"], "pending");
    assert_eq!(value["agents"][0]["resources"]["available"]["cpu"], 4.0);
}
