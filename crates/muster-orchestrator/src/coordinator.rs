use crate::config::EngineConfig;
use crate::events::{EngineEvent, EventBus, KeyedReceiver};
use crate::executor::{ExecutionOutcome, TaskExecutor};
use crate::monitor::AgentMonitor;
use crate::snapshot::EngineSnapshot;
use crate::state::{CycleReport, EngineState, Launch, Settlement};
use crate::swarm::{assemble, AssemblyContext, Swarm, SwarmTemplate};
use crate::task_store::{StatusChange, TaskCounts, TaskFilter};
use crate::types::{Agent, AgentDescriptor, Task, TaskDescriptor, TaskOutcome, TaskStatus};
use chrono::Utc;
use muster_core::{AgentId, MusterError, MusterResult, TaskId};
use muster_store::SnapshotStore;
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, Mutex, Notify, RwLock};
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info, warn};

fn flatten_join(
    joined: Result<MusterResult<ExecutionOutcome>, JoinError>,
    task_id: &str,
) -> MusterResult<ExecutionOutcome> {
    joined.unwrap_or_else(|e| {
        Err(MusterError::Execution(format!(
            "executor for task '{task_id}' aborted: {e}"
        )))
    })
}

/// Totals after [`Coordinator::run_until_idle`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    /// Scheduling cycles run.
    pub cycles: usize,
    /// Task totals by status at the end of the run.
    pub counts: TaskCounts,
    /// Pending tasks stuck behind a failed dependency, with that dependency.
    pub blocked: Vec<(TaskId, TaskId)>,
}

/// The scheduling authority.
///
/// Cheap to clone; clones share the same engine. Scheduling decisions are
/// made under one write lock, and executions run on spawned tasks that
/// re-validate engine state when they settle.
#[derive(Clone)]
pub struct Coordinator {
    state: Arc<RwLock<EngineState>>,
    executor: Arc<dyn TaskExecutor>,
    store: Option<Arc<dyn SnapshotStore>>,
    events: EventBus,
    monitor: Arc<AgentMonitor>,
    wake: Arc<Notify>,
    shutdown: Arc<Notify>,
    running: Arc<AtomicBool>,
    in_flight: Arc<AtomicUsize>,
    warned_no_store: Arc<AtomicBool>,
    /// Held from snapshot to store write so persists land in order.
    persist_lock: Arc<Mutex<()>>,
}

impl Coordinator {
    /// Build a coordinator after validating `config`.
    pub fn new(config: EngineConfig, executor: Arc<dyn TaskExecutor>) -> MusterResult<Self> {
        config.validate()?;
        let events = EventBus::new(config.event_capacity);
        Ok(Self {
            state: Arc::new(RwLock::new(EngineState::new(config, events.clone()))),
            executor,
            store: None,
            events,
            monitor: Arc::new(AgentMonitor::new()),
            wake: Arc::new(Notify::new()),
            shutdown: Arc::new(Notify::new()),
            running: Arc::new(AtomicBool::new(false)),
            in_flight: Arc::new(AtomicUsize::new(0)),
            warned_no_store: Arc::new(AtomicBool::new(false)),
            persist_lock: Arc::new(Mutex::new(())),
        })
    }

    /// Attach a snapshot store. Without one, persistence is a logged no-op.
    pub fn with_store(mut self, store: Arc<dyn SnapshotStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Per-agent execution metrics.
    pub fn monitor(&self) -> &Arc<AgentMonitor> {
        &self.monitor
    }

    /// The engine's event bus.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Receive every engine event from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Events about one task or agent.
    pub fn watch(&self, key: impl Into<String>) -> KeyedReceiver {
        self.events.watch(key)
    }

    /// Whether the scheduler loop is active.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Executions started and not yet settled.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Wake the scheduler loop out of band.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    /// A copy of the engine configuration.
    pub async fn config(&self) -> EngineConfig {
        self.state.read().await.config().clone()
    }

    // --- agents -----------------------------------------------------------

    /// Add an agent to the pool.
    pub async fn register_agent(&self, desc: AgentDescriptor) -> MusterResult<AgentId> {
        let id = self.state.write().await.register_agent(desc)?;
        self.wake();
        Ok(id)
    }

    /// Remove an agent; its bound tasks go back to `pending`.
    pub async fn unregister_agent(&self, agent_id: &str) -> MusterResult<bool> {
        self.state.write().await.unregister_agent(agent_id)?;
        self.wake();
        Ok(true)
    }

    /// Apply a partial update to an agent.
    pub async fn update_agent(&self, agent_id: &str, fields: &Map<String, Value>) -> MusterResult<bool> {
        self.state.write().await.update_agent(agent_id, fields)?;
        self.wake();
        Ok(true)
    }

    /// Record a heartbeat, bringing an offline agent back.
    pub async fn heartbeat(&self, agent_id: &str) -> MusterResult<()> {
        self.state.write().await.heartbeat(agent_id)
    }

    /// Look up one agent.
    pub async fn get_agent(&self, agent_id: &str) -> Option<Agent> {
        self.state.read().await.registry().get(agent_id).cloned()
    }

    /// Every registered agent.
    pub async fn list_agents(&self) -> Vec<Agent> {
        let state = self.state.read().await;
        state.registry().all_agents().into_iter().cloned().collect()
    }

    /// Agents that can take work right now.
    pub async fn list_available(&self) -> Vec<Agent> {
        let state = self.state.read().await;
        state.registry().list_available().into_iter().cloned().collect()
    }

    /// Agents offering a capability kind, at any level.
    pub async fn find_by_capability(&self, kind: &str) -> Vec<Agent> {
        let state = self.state.read().await;
        state
            .registry()
            .find_by_capability(kind)
            .into_iter()
            .cloned()
            .collect()
    }

    /// Pick a group of agents for a template.
    pub async fn assemble_swarm(
        &self,
        template: &SwarmTemplate,
        ctx: &AssemblyContext,
    ) -> MusterResult<Swarm> {
        let state = self.state.read().await;
        assemble(state.registry(), template, ctx)
    }

    // --- tasks ------------------------------------------------------------

    /// Submit a task.
    pub async fn create_task(&self, desc: TaskDescriptor) -> MusterResult<TaskId> {
        let id = self.state.write().await.create_task(desc)?;
        self.wake();
        Ok(id)
    }

    /// Look up one task.
    pub async fn get_task(&self, task_id: &str) -> MusterResult<Task> {
        self.state.read().await.tasks().get(task_id).cloned()
    }

    /// Tasks matching a filter.
    pub async fn list_tasks(&self, filter: &TaskFilter) -> Vec<Task> {
        let state = self.state.read().await;
        state.tasks().list(filter).into_iter().cloned().collect()
    }

    /// Move a task to a new status, checking the transition.
    pub async fn update_task_status(
        &self,
        task_id: &str,
        to: TaskStatus,
        outcome: Option<TaskOutcome>,
    ) -> MusterResult<StatusChange> {
        let change = self
            .state
            .write()
            .await
            .update_task_status(task_id, to, outcome)?;
        self.wake();
        Ok(change)
    }

    /// Cancel a task. A running execution is left to finish and discarded.
    pub async fn cancel_task(&self, task_id: &str) -> MusterResult<StatusChange> {
        let change = self.state.write().await.cancel_task(task_id)?;
        self.wake();
        Ok(change)
    }

    /// Create a pending copy of a failed task.
    pub async fn resubmit_task(&self, task_id: &str) -> MusterResult<TaskId> {
        let id = self.state.write().await.resubmit_task(task_id)?;
        self.wake();
        Ok(id)
    }

    /// Whether every dependency of a task has completed.
    pub async fn dependencies_satisfied(&self, task_id: &str) -> MusterResult<bool> {
        self.state.read().await.tasks().dependencies_satisfied(task_id)
    }

    /// Whether the dependency graph contains a cycle.
    pub async fn has_cycle(&self) -> bool {
        self.state.read().await.tasks().has_cycle()
    }

    /// Task totals by status.
    pub async fn counts(&self) -> TaskCounts {
        self.state.read().await.tasks().counts()
    }

    /// Pending tasks stuck behind a failed dependency.
    pub async fn blocked_by_failure(&self) -> Vec<(TaskId, TaskId)> {
        self.state.read().await.tasks().blocked_by_failure()
    }

    // --- shared state -----------------------------------------------------

    /// Set a shared-state entry, returning the previous value.
    pub async fn set_shared(&self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.state.write().await.set_shared(key, value)
    }

    /// Read a shared-state entry.
    pub async fn shared(&self, key: &str) -> Option<Value> {
        self.state.read().await.shared(key).cloned()
    }

    // --- scheduling -------------------------------------------------------

    /// Run one scheduling cycle and launch its executions without awaiting them.
    pub async fn run_cycle(&self) -> CycleReport {
        let (report, launches) = {
            let mut state = self.state.write().await;
            state.mark_initialized();
            state.plan_cycle(Utc::now())
        };
        debug!(
            ready = report.ready,
            assigned = report.assigned.len(),
            unmatched = report.unmatched.len(),
            "Cycle planned"
        );
        let changed = !report.assigned.is_empty()
            || !report.split.is_empty()
            || !report.stale_agents.is_empty();
        for launch in launches {
            self.launch(launch);
        }
        if changed {
            self.persist().await;
        }
        report
    }

    fn launch(&self, launch: Launch) {
        let this = self.clone();
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            let started = Instant::now();
            let Launch { task, agent } = launch;
            let task_id = task.id.clone();
            let agent_id = agent.id.clone();
            let timeout = this.state.read().await.config().execution_timeout();

            // Run on its own task so a panicking executor surfaces as a JoinError.
            let executor = this.executor.clone();
            let handle = tokio::spawn(async move { executor.execute(&task, &agent).await });
            let abort = handle.abort_handle();
            let result = match timeout {
                Some(limit) => match tokio::time::timeout(limit, handle).await {
                    Ok(joined) => flatten_join(joined, &task_id),
                    Err(_) => {
                        abort.abort();
                        Err(MusterError::Timeout(format!(
                            "task '{task_id}' exceeded {}ms",
                            limit.as_millis()
                        )))
                    }
                },
                None => flatten_join(handle.await, &task_id),
            };
            let duration_ms = started.elapsed().as_millis() as u64;

            let settlement = this
                .state
                .write()
                .await
                .record_execution(&task_id, &agent_id, result);
            match &settlement {
                Settlement::Completed => {
                    this.monitor.record_success(&agent_id, &task_id, duration_ms).await;
                }
                Settlement::Failed { .. } => {
                    this.monitor.record_failure(&agent_id, &task_id, duration_ms).await;
                }
                Settlement::Discarded { reason } => {
                    debug!(task_id = %task_id, reason = %reason, "Execution discarded");
                    this.monitor.record_discard(&agent_id, &task_id, duration_ms).await;
                }
            }
            this.persist().await;
            this.in_flight.fetch_sub(1, Ordering::SeqCst);
            this.wake();
        });
    }

    /// Spawn the scheduler loop.
    ///
    /// Each iteration runs a cycle, then waits for the cycle interval, an
    /// out-of-band wake, or shutdown.
    pub async fn start(&self) -> MusterResult<JoinHandle<()>> {
        let (strict, interval) = {
            let state = self.state.read().await;
            (state.config().strict, state.config().cycle_interval())
        };
        if strict && self.store.is_none() {
            return Err(MusterError::Config(
                "strict mode requires a snapshot store".to_string(),
            ));
        }
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(MusterError::Config(
                "coordinator is already running".to_string(),
            ));
        }

        let this = self.clone();
        Ok(tokio::spawn(async move {
            info!(interval_ms = interval.as_millis() as u64, "Scheduler loop started");
            loop {
                this.run_cycle().await;
                tokio::select! {
                    _ = this.shutdown.notified() => break,
                    _ = this.wake.notified() => {}
                    _ = tokio::time::sleep(interval) => {}
                }
            }
            this.running.store(false, Ordering::SeqCst);
            this.persist().await;
            info!("Scheduler loop stopped");
        }))
    }

    /// Ask the scheduler loop to exit after its current cycle.
    pub fn stop(&self) {
        self.shutdown.notify_one();
    }

    /// Drive cycles until nothing is in flight and no ready task can be placed.
    ///
    /// Meant for batch use without [`Self::start`]; both wait on the same wake signal.
    pub async fn run_until_idle(&self) -> RunSummary {
        let interval = self.state.read().await.config().cycle_interval();
        let mut cycles = 0;
        loop {
            let report = self.run_cycle().await;
            cycles += 1;
            if report.assigned.is_empty() && self.in_flight() == 0 {
                break;
            }
            if self.in_flight() > 0 {
                tokio::select! {
                    _ = self.wake.notified() => {}
                    _ = tokio::time::sleep(interval) => {}
                }
            }
        }
        let state = self.state.read().await;
        RunSummary {
            cycles,
            counts: state.tasks().counts(),
            blocked: state.tasks().blocked_by_failure(),
        }
    }

    // --- persistence ------------------------------------------------------

    /// Capture the engine state.
    pub async fn snapshot(&self) -> EngineSnapshot {
        self.state.read().await.snapshot(self.is_running())
    }

    /// Capture the engine state as JSON bytes.
    pub async fn snapshot_bytes(&self) -> MusterResult<Vec<u8>> {
        self.snapshot().await.to_bytes()
    }

    /// Replace engine state from snapshot bytes.
    ///
    /// On malformed input the engine is reset to a fresh, empty state and
    /// `false` is returned.
    pub async fn restore(&self, bytes: &[u8]) -> bool {
        let mut state = self.state.write().await;
        match EngineSnapshot::from_bytes(bytes) {
            Ok(snapshot) => {
                let requeued = state.restore(snapshot);
                info!(
                    tasks = state.tasks().len(),
                    agents = state.registry().len(),
                    requeued = requeued.len(),
                    "Engine state restored"
                );
                drop(state);
                self.wake();
                true
            }
            Err(e) => {
                warn!(error = %e, "Snapshot unreadable, starting from empty state");
                self.reset(&mut state);
                false
            }
        }
    }

    fn reset(&self, state: &mut EngineState) {
        let config = state.config().clone();
        *state = EngineState::new(config, self.events.clone());
    }

    /// Write the current snapshot to the store. Returns whether it was written.
    pub async fn persist(&self) -> bool {
        let Some(store) = &self.store else {
            if !self.warned_no_store.swap(true, Ordering::SeqCst) {
                warn!("No snapshot store configured, engine state will not be persisted");
            }
            return false;
        };
        let _guard = self.persist_lock.lock().await;
        let (key, bytes) = {
            let state = self.state.read().await;
            (
                state.config().snapshot_key.clone(),
                state.snapshot(self.is_running()).to_bytes(),
            )
        };
        let bytes = match bytes {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(error = %e, "Failed to serialize snapshot");
                return false;
            }
        };
        match store.put(&key, &bytes).await {
            Ok(()) => true,
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to persist snapshot");
                false
            }
        }
    }

    /// Load the stored snapshot. Returns whether state was restored.
    ///
    /// A missing, unreadable or malformed snapshot leaves the engine in a
    /// fresh, empty state. Without a store the current state is kept.
    pub async fn restore_from_store(&self) -> bool {
        let Some(store) = &self.store else {
            warn!("No snapshot store configured, nothing to restore");
            return false;
        };
        let key = self.state.read().await.config().snapshot_key.clone();
        match store.get(&key).await {
            Ok(Some(bytes)) => self.restore(&bytes).await,
            Ok(None) => {
                info!(key = %key, "No stored snapshot, starting fresh");
                self.reset(&mut *self.state.write().await);
                false
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to read snapshot, starting fresh");
                self.reset(&mut *self.state.write().await);
                false
            }
        }
    }
}
