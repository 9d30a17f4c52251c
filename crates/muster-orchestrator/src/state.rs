use crate::config::{CoordinationStrategy, EngineConfig};
use crate::events::{EngineEvent, EventBus};
use crate::executor::ExecutionOutcome;
use crate::registry::AgentRegistry;
use crate::snapshot::{EngineSnapshot, SNAPSHOT_VERSION};
use crate::splitter::split;
use crate::task_store::{StatusChange, TaskStore};
use crate::types::{
    Agent, AgentDescriptor, AgentState, Task, TaskDescriptor, TaskOutcome, TaskStatus,
};
use chrono::{DateTime, Utc};
use muster_core::{satisfies_all, AgentId, MusterError, MusterResult, TaskId};
use serde::Serialize;
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::collections::{HashSet, VecDeque};
use tracing::{debug, error, info, warn};

/// One task placed on one agent during a cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Assignment {
    /// Task that was placed.
    pub task_id: TaskId,
    /// Agent it was bound to.
    pub agent_id: AgentId,
}

/// What one scheduling cycle did.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleReport {
    /// Size of the ready set at the start of the cycle.
    pub ready: usize,
    /// Execution slots left under `max_concurrent_tasks`.
    pub free_slots: usize,
    /// Tasks bound and started this cycle, in placement order.
    pub assigned: Vec<Assignment>,
    /// Ready tasks with no eligible agent this cycle.
    pub unmatched: Vec<TaskId>,
    /// Divisible tasks split this cycle.
    pub split: Vec<TaskId>,
    /// Agents marked offline for missing heartbeats.
    pub stale_agents: Vec<AgentId>,
}

/// An execution the coordinator has to start.
#[derive(Debug, Clone)]
pub struct Launch {
    /// Task record as of the start, already `in-progress`.
    pub task: Task,
    /// Agent record as of the start.
    pub agent: Agent,
}

/// How a finished execution was recorded.
#[derive(Debug, Clone, PartialEq)]
pub enum Settlement {
    /// The task is now `completed`.
    Completed,
    /// The task is now `failed`.
    Failed {
        /// Recorded error text.
        error: String,
        /// Id of the automatic retry, when one was created.
        retry: Option<TaskId>,
    },
    /// The task was cancelled, requeued or rebound while the execution ran.
    Discarded {
        /// Why the result was not recorded.
        reason: String,
    },
}

struct Candidate {
    id: AgentId,
    seq: u64,
    load: usize,
    score: u8,
    ratio: f64,
}

/// All engine state guarded by the coordinator's lock.
///
/// Every method runs to completion without suspending, so callers holding the
/// write lock observe registry and task store change together.
pub struct EngineState {
    config: EngineConfig,
    registry: AgentRegistry,
    tasks: TaskStore,
    shared: Map<String, Value>,
    initialized: bool,
    events: EventBus,
    warned_blocked: HashSet<TaskId>,
}

impl EngineState {
    /// Empty state publishing to `events`.
    pub fn new(config: EngineConfig, events: EventBus) -> Self {
        let tasks = TaskStore::new(config.default_resources);
        Self {
            config,
            registry: AgentRegistry::new(),
            tasks,
            shared: Map::new(),
            initialized: false,
            events,
            warned_blocked: HashSet::new(),
        }
    }

    /// Active configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Read access to the agent registry.
    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    /// Read access to the task store.
    pub fn tasks(&self) -> &TaskStore {
        &self.tasks
    }

    /// Whether a cycle has run since creation or restore.
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Flag the engine as having run a cycle.
    pub fn mark_initialized(&mut self) {
        self.initialized = true;
    }

    // --- agents -----------------------------------------------------------

    /// Register an agent and publish [`EngineEvent::AgentRegistered`].
    pub fn register_agent(&mut self, desc: AgentDescriptor) -> MusterResult<AgentId> {
        let id = self.registry.register(desc)?;
        self.events.publish(EngineEvent::AgentRegistered {
            agent_id: id.clone(),
        });
        Ok(id)
    }

    /// Remove an agent, returning the ids of tasks put back to `pending`.
    pub fn unregister_agent(&mut self, agent_id: &str) -> MusterResult<Vec<TaskId>> {
        if !self.registry.contains(agent_id) {
            return Err(MusterError::NotFound(format!("agent '{agent_id}'")));
        }
        let requeued = self.requeue_agent_tasks(agent_id);
        for (task_id, bound) in self.tasks.cancelled_in_flight() {
            if bound == agent_id {
                self.tasks.unbind(&task_id);
            }
        }
        self.registry.remove(agent_id)?;
        info!(agent_id = %agent_id, requeued = requeued.len(), "Agent unregistered");
        self.events.publish(EngineEvent::AgentUnregistered {
            agent_id: agent_id.to_string(),
            requeued: requeued.clone(),
        });
        Ok(requeued)
    }

    /// Merge a partial update, publishing a status event if the state changed.
    pub fn update_agent(&mut self, agent_id: &str, fields: &Map<String, Value>) -> MusterResult<()> {
        let before = self
            .registry
            .get(agent_id)
            .map(Agent::state)
            .ok_or_else(|| MusterError::NotFound(format!("agent '{agent_id}'")))?;
        self.registry.update(agent_id, fields)?;
        let after = self.registry.get(agent_id).map(Agent::state).unwrap_or(before);
        if before != after {
            self.events.publish(EngineEvent::AgentStatusChanged {
                agent_id: agent_id.to_string(),
                from: before,
                to: after,
            });
        }
        Ok(())
    }

    /// Refresh an agent's heartbeat; an offline agent comes back.
    pub fn heartbeat(&mut self, agent_id: &str) -> MusterResult<()> {
        let before = self
            .registry
            .get(agent_id)
            .map(Agent::state)
            .ok_or_else(|| MusterError::NotFound(format!("agent '{agent_id}'")))?;
        self.registry.heartbeat(agent_id)?;
        if before == AgentState::Offline {
            self.events.publish(EngineEvent::AgentStatusChanged {
                agent_id: agent_id.to_string(),
                from: before,
                to: AgentState::Available,
            });
        }
        Ok(())
    }

    fn set_agent_state(&mut self, agent_id: &str, state: AgentState) {
        match self.registry.set_state(agent_id, state) {
            Ok(previous) if previous != state => {
                debug!(agent_id = %agent_id, from = %previous, to = %state, "Agent state changed");
                self.events.publish(EngineEvent::AgentStatusChanged {
                    agent_id: agent_id.to_string(),
                    from: previous,
                    to: state,
                });
            }
            _ => {}
        }
    }

    /// Return a busy agent to `available` once nothing holds it.
    fn settle_agent(&mut self, agent_id: &str) {
        let busy = self
            .registry
            .get(agent_id)
            .is_some_and(|a| a.state() == AgentState::Busy);
        if busy && !self.tasks.occupies(agent_id) {
            self.set_agent_state(agent_id, AgentState::Available);
        }
    }

    /// Put every task bound to `agent_id` back to `pending` and drop its reservations.
    pub fn requeue_agent_tasks(&mut self, agent_id: &str) -> Vec<TaskId> {
        let mut requeued = Vec::new();
        for task_id in self.tasks.bound_to(agent_id) {
            match self.tasks.update_status(&task_id, TaskStatus::Pending, None) {
                Ok(change) => {
                    warn!(task_id = %task_id, agent_id = %agent_id, "Task requeued");
                    self.finish_change(&change, Some(agent_id.to_string()));
                    requeued.push(task_id);
                }
                Err(e) => error!(task_id = %task_id, error = %e, "Failed to requeue task"),
            }
        }
        requeued
    }

    /// Mark idle agents with stale heartbeats offline.
    ///
    /// An agent holding an assigned, running or cancelled-but-running task is
    /// never swept; its execution settles or times out instead.
    pub fn sweep_stale_agents(&mut self, now: DateTime<Utc>) -> Vec<AgentId> {
        let Some(timeout) = self.config.heartbeat_timeout() else {
            return Vec::new();
        };
        let max_age =
            chrono::Duration::from_std(timeout).unwrap_or_else(|_| chrono::Duration::weeks(5200));
        let stale: Vec<AgentId> = self
            .registry
            .stale_agents(max_age, now)
            .into_iter()
            .filter(|id| !self.tasks.occupies(id))
            .collect();
        for agent_id in &stale {
            warn!(agent_id = %agent_id, "Agent missed heartbeat, marking offline");
            self.set_agent_state(agent_id, AgentState::Offline);
        }
        stale
    }

    // --- tasks ------------------------------------------------------------

    /// Create a `pending` task.
    pub fn create_task(&mut self, desc: TaskDescriptor) -> MusterResult<TaskId> {
        let id = self.tasks.create(desc)?;
        debug!(task_id = %id, "Task created");
        Ok(id)
    }

    /// Externally requested transition. Assignment goes through [`Self::assign_task`].
    pub fn update_task_status(
        &mut self,
        task_id: &str,
        to: TaskStatus,
        outcome: Option<TaskOutcome>,
    ) -> MusterResult<StatusChange> {
        if to == TaskStatus::Assigned {
            return Err(MusterError::Validation(format!(
                "task '{task_id}' must be assigned through assign_task"
            )));
        }
        if to == TaskStatus::Cancelled {
            return self.cancel_task(task_id);
        }
        let agent = self.tasks.get(task_id)?.assigned_to.clone();
        let change = self.tasks.update_status(task_id, to, outcome)?;
        self.finish_change(&change, agent);
        Ok(change)
    }

    /// Bind a pending task to an available agent, reserving its resources.
    pub fn assign_task(&mut self, task_id: &str, agent_id: &str) -> MusterResult<()> {
        let task = self.tasks.get(task_id)?;
        let agent = self
            .registry
            .get(agent_id)
            .ok_or_else(|| MusterError::NotFound(format!("agent '{agent_id}'")))?;
        if !agent.is_available() {
            return Err(MusterError::Validation(format!(
                "agent '{agent_id}' is {}",
                agent.state()
            )));
        }
        if !satisfies_all(&agent.capabilities, &task.required_capabilities) {
            return Err(MusterError::Validation(format!(
                "agent '{agent_id}' lacks capabilities for task '{task_id}'"
            )));
        }
        if task.is_split_parent() {
            return Err(MusterError::Validation(format!(
                "task '{task_id}' was split and runs through its sub-tasks"
            )));
        }
        let req = task.resource_requirements;

        self.registry.reserve(agent_id, &req)?;
        let change = match self.tasks.assign(task_id, agent_id) {
            Ok(change) => change,
            Err(e) => {
                self.registry.release(agent_id, &req);
                return Err(e);
            }
        };
        self.registry.touch(agent_id, Utc::now());
        info!(task_id = %task_id, agent_id = %agent_id, "Task assigned");
        self.publish_change(&change, Some(agent_id.to_string()));
        self.set_agent_state(agent_id, AgentState::Busy);
        Ok(())
    }

    /// `assigned -> in-progress`.
    pub fn start_task(&mut self, task_id: &str) -> MusterResult<()> {
        let agent = self.tasks.get(task_id)?.assigned_to.clone();
        let change = self.tasks.update_status(task_id, TaskStatus::InProgress, None)?;
        self.publish_change(&change, agent);
        Ok(())
    }

    /// Cancel a task. A split parent takes its open sub-tasks with it.
    ///
    /// An in-progress execution keeps running; its agent is released when it settles.
    pub fn cancel_task(&mut self, task_id: &str) -> MusterResult<StatusChange> {
        let agent = self.tasks.get(task_id)?.assigned_to.clone();
        let change = self.tasks.cancel(task_id)?;
        info!(task_id = %task_id, from = %change.from, "Task cancelled");
        self.finish_change(&change, agent);

        let subtasks = self.tasks.get(task_id)?.subtasks.clone();
        for sub_id in subtasks {
            let open = self
                .tasks
                .resolve(&sub_id)
                .filter(|t| !t.status.is_terminal())
                .map(|t| t.id.clone());
            if let Some(open_id) = open {
                let sub_agent = self.tasks.get(&open_id)?.assigned_to.clone();
                let sub_change = self.tasks.cancel(&open_id)?;
                self.finish_change(&sub_change, sub_agent);
            }
        }
        Ok(change)
    }

    /// Create a fresh attempt of a failed or cancelled task.
    pub fn resubmit_task(&mut self, task_id: &str) -> MusterResult<TaskId> {
        let retry_id = self.tasks.resubmit(task_id)?;
        let attempt = self.tasks.get(&retry_id)?.attempt;
        info!(task_id = %task_id, retry_id = %retry_id, attempt, "Task resubmitted");
        self.warned_blocked.clear();
        self.events.publish(EngineEvent::TaskRetried {
            task_id: task_id.to_string(),
            retry_id: retry_id.clone(),
            attempt,
        });
        Ok(retry_id)
    }

    fn publish_change(&self, change: &StatusChange, agent_id: Option<AgentId>) {
        self.events.publish(EngineEvent::TaskStatusChanged {
            task_id: change.task_id.clone(),
            from: change.from,
            to: change.to,
            agent_id,
        });
    }

    /// Release what a transition unbound, publish it, and run terminal follow-ups.
    fn finish_change(&mut self, change: &StatusChange, agent_id: Option<AgentId>) {
        if let Some(released) = &change.released_agent {
            self.registry.release(released, &change.resources);
            self.settle_agent(released);
        }
        self.publish_change(change, agent_id);
        if change.to.is_terminal() {
            self.after_terminal(&change.task_id);
        }
    }

    /// Auto-retry a failed task and finalize its split parent when possible.
    fn after_terminal(&mut self, task_id: &str) {
        let Ok(task) = self.tasks.get(task_id) else {
            return;
        };
        let parent_id = task.parent_id.clone();
        let retry_allowed = task.status == TaskStatus::Failed
            && !task.is_split_parent()
            && self.config.execution.enable_auto_retry
            && task.attempt < self.config.execution.max_retry_attempts;

        if retry_allowed {
            if let Err(e) = self.resubmit_task(task_id) {
                warn!(task_id = %task_id, error = %e, "Automatic retry failed");
            }
        }
        if let Some(parent_id) = parent_id {
            match self.tasks.finalize_split_parent(&parent_id) {
                Ok(Some(change)) => {
                    info!(task_id = %parent_id, status = %change.to, "Split task finalized");
                    self.publish_change(&change, None);
                    self.after_terminal(&parent_id);
                }
                Ok(None) => {}
                Err(e) => error!(task_id = %parent_id, error = %e, "Failed to finalize split task"),
            }
        }
    }

    /// Log pending tasks stuck behind a failed dependency, once per task.
    pub fn warn_blocked(&mut self) -> Vec<(TaskId, TaskId)> {
        let blocked = self.tasks.blocked_by_failure();
        for (task_id, dep) in &blocked {
            if self.warned_blocked.insert(task_id.clone()) {
                warn!(
                    task_id = %task_id,
                    dependency = %dep,
                    "Task blocked by failed dependency; cancel or resubmit the dependency"
                );
            }
        }
        blocked
    }

    // --- shared state -----------------------------------------------------

    /// Store a value in the shared map, returning the previous one.
    pub fn set_shared(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.shared.insert(key.into(), value)
    }

    /// Read a value from the shared map.
    pub fn shared(&self, key: &str) -> Option<&Value> {
        self.shared.get(key)
    }

    // --- scheduling -------------------------------------------------------

    fn eligible_agents(&self, task: &Task) -> Vec<Candidate> {
        self.registry
            .list_available()
            .into_iter()
            .filter(|a| satisfies_all(&a.capabilities, &task.required_capabilities))
            .filter(|a| task.resource_requirements.fits_within(&a.resources.available))
            .map(|a| Candidate {
                id: a.id.clone(),
                seq: a.seq,
                load: self.tasks.active_load(&a.id),
                score: a.resources.available.surplus_score(&task.resource_requirements),
                ratio: a
                    .resources
                    .available
                    .surplus_ratio(&task.resource_requirements, &a.resources.total),
            })
            .collect()
    }

    fn pick(&self, candidates: &[Candidate]) -> Option<AgentId> {
        let best = match self.config.coordination_strategy {
            CoordinationStrategy::FirstFit => candidates.iter().min_by_key(|c| c.seq),
            CoordinationStrategy::CapabilityMatch => candidates.iter().min_by(|x, y| {
                x.load
                    .cmp(&y.load)
                    .then_with(|| y.score.cmp(&x.score))
                    .then_with(|| y.ratio.partial_cmp(&x.ratio).unwrap_or(Ordering::Equal))
                    .then_with(|| x.seq.cmp(&y.seq))
            }),
        };
        best.map(|c| c.id.clone())
    }

    /// Decide one cycle: split, rank, and bind ready tasks to agents.
    ///
    /// Returns the report and the executions to start. Nothing here awaits,
    /// so a caller holding the write lock makes the whole decision atomically.
    pub fn plan_cycle(&mut self, now: DateTime<Utc>) -> (CycleReport, Vec<Launch>) {
        let mut report = CycleReport {
            stale_agents: self.sweep_stale_agents(now),
            ..CycleReport::default()
        };
        self.warn_blocked();

        let mut ready: Vec<(u8, TaskId)> = self
            .tasks
            .ready_set()
            .into_iter()
            .map(|t| (t.priority.weight(), t.id.clone()))
            .collect();
        report.ready = ready.len();
        ready.sort_by(|a, b| b.0.cmp(&a.0));
        let mut queue: VecDeque<TaskId> = ready.into_iter().map(|(_, id)| id).collect();

        let free_slots = self
            .config
            .execution
            .max_concurrent_tasks
            .saturating_sub(self.tasks.in_progress_count());
        report.free_slots = free_slots;
        if free_slots == 0 || queue.is_empty() {
            debug!(ready = report.ready, free_slots, "Nothing to assign this cycle");
            return (report, Vec::new());
        }

        let mut launches = Vec::new();
        while let Some(task_id) = queue.pop_front() {
            if launches.len() >= free_slots {
                break;
            }
            let Ok(task) = self.tasks.get(&task_id) else {
                continue;
            };
            let candidates = self.eligible_agents(task);

            if task.is_splittable() && candidates.len() > 1 {
                let parts = split(task, candidates.len());
                if parts.len() > 1 {
                    match self.tasks.record_subtasks(&task_id, parts) {
                        Ok(ids) => {
                            info!(task_id = %task_id, parts = ids.len(), "Task split");
                            self.events.publish(EngineEvent::TaskSplit {
                                task_id: task_id.clone(),
                                subtasks: ids.clone(),
                            });
                            report.split.push(task_id);
                            for id in ids.into_iter().rev() {
                                queue.push_front(id);
                            }
                        }
                        Err(e) => {
                            error!(task_id = %task_id, error = %e, "Failed to split task");
                        }
                    }
                    continue;
                }
            }

            let Some(agent_id) = self.pick(&candidates) else {
                debug!(task_id = %task_id, "No eligible agent");
                report.unmatched.push(task_id);
                continue;
            };
            if let Err(e) = self
                .assign_task(&task_id, &agent_id)
                .and_then(|()| self.start_task(&task_id))
            {
                error!(task_id = %task_id, agent_id = %agent_id, error = %e, "Assignment failed");
                continue;
            }
            match (self.tasks.get(&task_id), self.registry.get(&agent_id)) {
                (Ok(task), Some(agent)) => launches.push(Launch {
                    task: task.clone(),
                    agent: agent.clone(),
                }),
                _ => continue,
            }
            report.assigned.push(Assignment { task_id, agent_id });
        }
        (report, launches)
    }

    /// Record the result of an execution started by [`Self::plan_cycle`].
    ///
    /// The task must still be `in-progress` on the same agent; otherwise the
    /// result is discarded.
    pub fn record_execution(
        &mut self,
        task_id: &str,
        agent_id: &str,
        result: MusterResult<ExecutionOutcome>,
    ) -> Settlement {
        let Ok(task) = self.tasks.get(task_id) else {
            return Settlement::Discarded {
                reason: format!("task '{task_id}' no longer exists"),
            };
        };
        let bound_here = task.assigned_to.as_deref() == Some(agent_id);
        self.registry.touch(agent_id, Utc::now());

        if task.status == TaskStatus::Cancelled && bound_here {
            let req = task.resource_requirements;
            self.tasks.unbind(task_id);
            self.registry.release(agent_id, &req);
            self.settle_agent(agent_id);
            warn!(task_id = %task_id, agent_id = %agent_id, "Discarding result of cancelled task");
            return Settlement::Discarded {
                reason: "task was cancelled".to_string(),
            };
        }
        if task.status != TaskStatus::InProgress || !bound_here {
            warn!(
                task_id = %task_id,
                agent_id = %agent_id,
                status = %task.status,
                "Discarding result of task that is no longer running here"
            );
            return Settlement::Discarded {
                reason: format!("task is {} on another binding", task.status),
            };
        }

        let (to, outcome) = match result {
            Ok(outcome) if outcome.success => (
                TaskStatus::Completed,
                TaskOutcome {
                    result: outcome.data,
                    error: None,
                },
            ),
            Ok(outcome) => (
                TaskStatus::Failed,
                TaskOutcome {
                    result: outcome.data,
                    error: Some(
                        outcome
                            .error
                            .unwrap_or_else(|| "execution reported failure".to_string()),
                    ),
                },
            ),
            Err(e) => (TaskStatus::Failed, TaskOutcome::failure(e.to_string())),
        };
        let error_text = outcome.error.clone();

        let change = match self.tasks.update_status(task_id, to, Some(outcome)) {
            Ok(change) => change,
            Err(e) => {
                return Settlement::Discarded {
                    reason: e.to_string(),
                }
            }
        };
        self.finish_change(&change, Some(agent_id.to_string()));

        if to == TaskStatus::Completed {
            info!(task_id = %task_id, agent_id = %agent_id, "Task completed");
            Settlement::Completed
        } else {
            let error = error_text.unwrap_or_default();
            error!(task_id = %task_id, agent_id = %agent_id, error = %error, "Task failed");
            let retry = self
                .tasks
                .get(task_id)
                .ok()
                .and_then(|t| t.superseded_by.clone());
            Settlement::Failed { error, retry }
        }
    }

    // --- snapshot ---------------------------------------------------------

    /// Serializable copy of the whole state.
    pub fn snapshot(&self, is_running: bool) -> EngineSnapshot {
        EngineSnapshot {
            version: SNAPSHOT_VERSION,
            coordinator_id: self.config.coordinator_id.clone(),
            coordinator_name: self.config.coordinator_name.clone(),
            coordination_strategy: self.config.coordination_strategy,
            execution_config: self.config.execution.clone(),
            shared_state: self.shared.clone(),
            tasks: self.tasks.all_tasks().into_iter().cloned().collect(),
            agents: self.registry.all_agents().into_iter().cloned().collect(),
            initialized: self.initialized,
            is_running,
            saved_at: Utc::now(),
        }
    }

    /// Replace all state from a snapshot.
    ///
    /// No execution survives a restore, so in-flight tasks go back to
    /// `pending` and every reservation is dropped.
    pub fn restore(&mut self, snapshot: EngineSnapshot) -> Vec<TaskId> {
        self.config.coordinator_id = snapshot.coordinator_id;
        self.config.coordinator_name = snapshot.coordinator_name;
        self.config.coordination_strategy = snapshot.coordination_strategy;
        self.config.execution = snapshot.execution_config;
        self.shared = snapshot.shared_state;
        self.initialized = snapshot.initialized;
        self.warned_blocked.clear();
        self.tasks.replace_all(snapshot.tasks);
        self.registry.replace_all(snapshot.agents);

        let mut requeued = Vec::new();
        let in_flight: Vec<TaskId> = self
            .tasks
            .all_tasks()
            .into_iter()
            .filter(|t| matches!(t.status, TaskStatus::Assigned | TaskStatus::InProgress))
            .map(|t| t.id.clone())
            .collect();
        for task_id in in_flight {
            if self
                .tasks
                .update_status(&task_id, TaskStatus::Pending, None)
                .is_ok()
            {
                requeued.push(task_id);
            }
        }
        for (task_id, _) in self.tasks.cancelled_in_flight() {
            self.tasks.unbind(&task_id);
        }
        let agent_ids: Vec<AgentId> = self
            .registry
            .all_agents()
            .iter()
            .map(|a| a.id.clone())
            .collect();
        let now = Utc::now();
        for agent_id in agent_ids {
            if let Some(agent) = self.registry.get_mut(&agent_id) {
                // Downtime before the restore is not the agent's silence.
                agent.status.last_heartbeat = now;
                agent.resources.clear_reservations();
                if agent.status.state == AgentState::Busy {
                    agent.status.state = AgentState::Available;
                }
            }
        }
        if !requeued.is_empty() {
            warn!(count = requeued.len(), "Requeued in-flight tasks from snapshot");
        }
        requeued
    }
}
