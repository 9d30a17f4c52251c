use chrono::{DateTime, Utc};
use muster_core::{
    AgentId, Capability, MusterError, MusterResult, Priority, ResourceAllocation, TaskId,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;

/// Lifecycle state of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentState {
    /// Registered, not yet ready.
    Initializing,
    /// Idle and able to take work.
    Available,
    /// Executing a task.
    Busy,
    /// Unreachable, usually after missed heartbeats.
    Offline,
    /// Reported a fault.
    Error,
}

impl std::fmt::Display for AgentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentState::Initializing => write!(f, "initializing"),
            AgentState::Available => write!(f, "available"),
            AgentState::Busy => write!(f, "busy"),
            AgentState::Offline => write!(f, "offline"),
            AgentState::Error => write!(f, "error"),
        }
    }
}

/// Maps the bare status strings found in agent descriptors.
impl FromStr for AgentState {
    type Err = MusterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "initializing" => Ok(AgentState::Initializing),
            "available" | "idle" => Ok(AgentState::Available),
            "busy" | "working" => Ok(AgentState::Busy),
            "offline" => Ok(AgentState::Offline),
            "error" => Ok(AgentState::Error),
            other => Err(MusterError::Validation(format!(
                "unknown agent status '{other}'"
            ))),
        }
    }
}

/// Canonical agent status: lifecycle state plus health.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentStatus {
    /// Lifecycle state.
    pub state: AgentState,
    /// False while offline or errored.
    pub healthy: bool,
    /// Last sign of life.
    pub last_heartbeat: DateTime<Utc>,
}

impl AgentStatus {
    /// Status in `state`, healthy unless offline or errored.
    pub fn new(state: AgentState) -> Self {
        Self {
            state,
            healthy: !matches!(state, AgentState::Error | AgentState::Offline),
            last_heartbeat: Utc::now(),
        }
    }
}

/// Resource bookkeeping for one agent.
///
/// `available == total - reserved` holds after every mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentResources {
    /// Capacity.
    pub total: ResourceAllocation,
    /// Not reserved by running tasks.
    pub available: ResourceAllocation,
    /// Held by running tasks.
    pub reserved: ResourceAllocation,
}

impl AgentResources {
    /// Start with `reserved` held; fails if it exceeds `total`.
    pub fn new(total: ResourceAllocation, reserved: ResourceAllocation) -> MusterResult<Self> {
        total.validate("resources.total")?;
        reserved.validate("resources.reserved")?;
        if !reserved.fits_within(&total) {
            return Err(MusterError::Validation(format!(
                "reserved resources ({reserved}) exceed total ({total})"
            )));
        }
        Ok(Self {
            total,
            available: total.saturating_sub(&reserved),
            reserved,
        })
    }

    fn recompute(&mut self) {
        self.available = self.total.saturating_sub(&self.reserved);
    }

    /// Reserve `amount`; fails without mutating if it does not fit `available`.
    pub fn reserve(&mut self, amount: &ResourceAllocation) -> MusterResult<()> {
        if !amount.fits_within(&self.available) {
            return Err(MusterError::Validation(format!(
                "cannot reserve {amount}: only {} available",
                self.available
            )));
        }
        self.reserved = self.reserved.add(amount);
        self.recompute();
        Ok(())
    }

    /// Return resources, never exceeding `total`.
    pub fn release(&mut self, amount: &ResourceAllocation) {
        self.reserved = self.reserved.saturating_sub(amount);
        self.recompute();
    }

    /// Drop every reservation.
    pub fn clear_reservations(&mut self) {
        self.reserved = ResourceAllocation::zero();
        self.recompute();
    }

    /// Change capacity, keeping current reservations.
    pub fn set_total(&mut self, total: ResourceAllocation) -> MusterResult<()> {
        total.validate("resources.total")?;
        if !self.reserved.fits_within(&total) {
            return Err(MusterError::Validation(format!(
                "new total ({total}) is below reserved ({})",
                self.reserved
            )));
        }
        self.total = total;
        self.recompute();
        Ok(())
    }

    /// Re-derive `available` from `total - reserved`, e.g. after deserialization.
    pub fn normalize(&mut self) {
        self.reserved = ResourceAllocation {
            cpu: self.reserved.cpu.min(self.total.cpu),
            memory: self.reserved.memory.min(self.total.memory),
            storage: self.reserved.storage.min(self.total.storage),
        };
        self.recompute();
    }
}

/// A registered worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Agent {
    /// Unique id.
    pub id: AgentId,
    /// Free-form agent kind.
    #[serde(rename = "type")]
    pub agent_type: String,
    /// Lifecycle state and health.
    pub status: AgentStatus,
    /// What the agent can do.
    pub capabilities: Vec<Capability>,
    /// Capacity and reservations.
    pub resources: AgentResources,
    /// Opaque producer data.
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    /// When the agent registered.
    pub registered_at: DateTime<Utc>,
    /// Registration order, used for stable tie-breaking.
    #[serde(default)]
    pub seq: u64,
}

impl Agent {
    /// Lifecycle state.
    pub fn state(&self) -> AgentState {
        self.status.state
    }

    /// Whether it can take work now.
    pub fn is_available(&self) -> bool {
        self.status.state == AgentState::Available
    }

    /// Whether any capability has this kind.
    pub fn has_capability_kind(&self, kind: &str) -> bool {
        self.capabilities.iter().any(|c| c.kind == kind)
    }
}

/// What a producer submits to register an agent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentDescriptor {
    /// Generated when absent.
    #[serde(default)]
    pub id: Option<String>,
    /// Defaults to `generic`.
    #[serde(default, rename = "type")]
    pub agent_type: Option<String>,
    /// Legacy bare status string, e.g. `"available"`.
    #[serde(default)]
    pub status: Option<String>,
    /// Required; an empty list is allowed.
    #[serde(default)]
    pub capabilities: Option<Vec<Capability>>,
    /// Total capacity.
    #[serde(default)]
    pub resources: Option<ResourceAllocation>,
    /// Resources already held at registration.
    #[serde(default)]
    pub reserved: Option<ResourceAllocation>,
    /// Opaque producer data.
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl AgentDescriptor {
    /// Descriptor with an id and nothing else.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            capabilities: Some(Vec::new()),
            ..Self::default()
        }
    }

    /// Set the agent kind.
    pub fn with_type(mut self, agent_type: impl Into<String>) -> Self {
        self.agent_type = Some(agent_type.into());
        self
    }

    /// Add a capability.
    pub fn with_capability(mut self, kind: impl Into<String>, level: u32) -> Self {
        self.capabilities
            .get_or_insert_with(Vec::new)
            .push(Capability::new(kind, level));
        self
    }

    /// Set total capacity.
    pub fn with_resources(mut self, cpu: f64, memory: f64, storage: f64) -> Self {
        self.resources = Some(ResourceAllocation::new(cpu, memory, storage));
        self
    }

    /// Set the initial status.
    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }
}

/// Status of a task record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    /// Waiting for placement.
    Pending,
    /// Bound to an agent, not yet started.
    Assigned,
    /// Executing.
    InProgress,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
    /// Cancelled before finishing.
    Cancelled,
}

impl TaskStatus {
    /// Completed, failed or cancelled.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Edges of the task state machine. Terminal states have no outgoing edges.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Assigned)
                | (Assigned, InProgress)
                | (InProgress, Completed)
                | (InProgress, Failed)
                | (Assigned, Pending)
                | (InProgress, Pending)
                | (Pending, Cancelled)
                | (Assigned, Cancelled)
                | (InProgress, Cancelled)
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Assigned => write!(f, "assigned"),
            TaskStatus::InProgress => write!(f, "in-progress"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Half-open `[start, end)` slice of a divisible task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    /// First unit, inclusive.
    pub start: u64,
    /// Last unit, exclusive.
    pub end: u64,
}

impl Chunk {
    /// Units in the chunk.
    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    /// Whether the chunk covers nothing.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Result or error recorded when a task reaches a terminal status.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskOutcome {
    /// Result data on success.
    pub result: Option<serde_json::Value>,
    /// Error message on failure.
    pub error: Option<String>,
}

impl TaskOutcome {
    /// A successful outcome.
    pub fn success(result: serde_json::Value) -> Self {
        Self {
            result: Some(result),
            error: None,
        }
    }

    /// A failed outcome.
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            result: None,
            error: Some(error.into()),
        }
    }
}

/// A unit of work owned by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Unique id.
    pub id: TaskId,
    /// Free-form task kind.
    #[serde(rename = "type")]
    pub task_type: String,
    /// Placement order.
    pub priority: Priority,
    /// Lifecycle status.
    pub status: TaskStatus,
    /// An agent must satisfy all of these.
    pub required_capabilities: Vec<Capability>,
    /// Reserved on the agent while bound.
    pub resource_requirements: ResourceAllocation,
    /// Tasks that must complete first.
    #[serde(default)]
    pub depends_on: Vec<TaskId>,
    /// Agent the task is bound to.
    #[serde(default)]
    pub assigned_to: Option<AgentId>,
    /// Whether the task may be split.
    #[serde(default)]
    pub divisible: bool,
    /// Smallest chunk a split may produce.
    #[serde(default = "default_one")]
    pub min_chunk_size: u64,
    /// Units of work, for splitting.
    #[serde(default = "default_one")]
    pub size: u64,
    /// Opaque data handed to the executor.
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Result data once completed.
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    /// Error message once failed.
    #[serde(default)]
    pub error: Option<String>,
    /// Set on sub-tasks produced by the splitter.
    #[serde(default)]
    pub parent_id: Option<TaskId>,
    /// Slice of the parent, on sub-tasks.
    #[serde(default)]
    pub chunk: Option<Chunk>,
    /// Set on a split parent.
    #[serde(default)]
    pub subtasks: Vec<TaskId>,
    /// 0 for the original submission, n for the n-th retry.
    #[serde(default)]
    pub attempt: u32,
    /// Task this one retries.
    #[serde(default)]
    pub retry_of: Option<TaskId>,
    /// Retry that replaced this failed task.
    #[serde(default)]
    pub superseded_by: Option<TaskId>,
    /// When the task was created.
    pub created_at: DateTime<Utc>,
    /// Last status change.
    pub updated_at: DateTime<Utc>,
    /// When the task reached a terminal status.
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// Insertion order, used for stable ordering.
    #[serde(default)]
    pub seq: u64,
}

fn default_one() -> u64 {
    1
}

impl Task {
    /// Whether the task was split into sub-tasks.
    pub fn is_split_parent(&self) -> bool {
        !self.subtasks.is_empty()
    }

    /// True for a divisible task that has not been split and is not itself a chunk.
    pub fn is_splittable(&self) -> bool {
        self.divisible && self.parent_id.is_none() && self.subtasks.is_empty()
    }
}

/// What a producer submits to create a task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDescriptor {
    /// Generated when absent.
    #[serde(default)]
    pub id: Option<String>,
    /// Defaults to `generic`.
    #[serde(default, rename = "type")]
    pub task_type: Option<String>,
    /// Defaults to medium.
    #[serde(default)]
    pub priority: Option<Priority>,
    /// Capabilities an agent must offer.
    #[serde(default)]
    pub required_capabilities: Vec<Capability>,
    /// Defaults to the engine's `default_resources`.
    #[serde(default)]
    pub resource_requirements: Option<ResourceAllocation>,
    /// Tasks that must complete first.
    #[serde(default)]
    pub depends_on: Vec<TaskId>,
    /// Allow splitting.
    #[serde(default)]
    pub divisible: Option<bool>,
    /// Smallest chunk a split may produce.
    #[serde(default)]
    pub min_chunk_size: Option<u64>,
    /// Units of work.
    #[serde(default)]
    pub size: Option<u64>,
    /// Opaque data handed to the executor.
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl TaskDescriptor {
    /// Descriptor with an id and nothing else.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            ..Self::default()
        }
    }

    /// Set the task kind.
    pub fn with_type(mut self, task_type: impl Into<String>) -> Self {
        self.task_type = Some(task_type.into());
        self
    }

    /// Set the priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Require a capability.
    pub fn requires(mut self, kind: impl Into<String>, level: u32) -> Self {
        self.required_capabilities.push(Capability::new(kind, level));
        self
    }

    /// Set resource requirements.
    pub fn with_resources(mut self, cpu: f64, memory: f64, storage: f64) -> Self {
        self.resource_requirements = Some(ResourceAllocation::new(cpu, memory, storage));
        self
    }

    /// Add dependencies.
    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(deps.into_iter().map(Into::into));
        self
    }

    /// Mark divisible with a size and smallest chunk.
    pub fn divisible(mut self, size: u64, min_chunk_size: u64) -> Self {
        self.divisible = Some(true);
        self.size = Some(size);
        self.min_chunk_size = Some(min_chunk_size);
        self
    }

    /// Set the executor payload.
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_legacy_status_strings() {
        assert_eq!("available".parse::<AgentState>().unwrap(), AgentState::Available);
        assert_eq!("BUSY".parse::<AgentState>().unwrap(), AgentState::Busy);
        assert_eq!("idle".parse::<AgentState>().unwrap(), AgentState::Available);
        assert!("sleepy".parse::<AgentState>().is_err());
        assert_eq!(AgentState::Offline.to_string(), "offline");
    }

    #[test]
    fn test_status_health_follows_state() {
        assert!(AgentStatus::new(AgentState::Available).healthy);
        assert!(!AgentStatus::new(AgentState::Error).healthy);
        assert!(!AgentStatus::new(AgentState::Offline).healthy);
    }

    #[test]
    fn test_resources_reserve_and_release_keep_invariant() {
        let mut res = AgentResources::new(
            ResourceAllocation::new(8.0, 16384.0, 1024.0),
            ResourceAllocation::zero(),
        )
        .unwrap();
        let req = ResourceAllocation::new(1.0, 512.0, 64.0);
        res.reserve(&req).unwrap();
        assert_eq!(res.available, ResourceAllocation::new(7.0, 15872.0, 960.0));
        assert_eq!(res.reserved, req);
        res.release(&req);
        assert_eq!(res.available, res.total);
        assert_eq!(res.reserved, ResourceAllocation::zero());
    }

    #[test]
    fn test_reserve_too_much_fails_without_mutation() {
        let mut res =
            AgentResources::new(ResourceAllocation::new(1.0, 1.0, 1.0), ResourceAllocation::zero())
                .unwrap();
        let before = res.clone();
        assert!(res.reserve(&ResourceAllocation::new(2.0, 0.0, 0.0)).is_err());
        assert_eq!(res, before);
    }

    #[test]
    fn test_reserved_above_total_rejected() {
        let result = AgentResources::new(
            ResourceAllocation::new(1.0, 1.0, 1.0),
            ResourceAllocation::new(2.0, 0.0, 0.0),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_state_machine_edges() {
        use TaskStatus::*;
        assert!(Pending.can_transition_to(Assigned));
        assert!(Assigned.can_transition_to(InProgress));
        assert!(InProgress.can_transition_to(Completed));
        assert!(InProgress.can_transition_to(Failed));
        assert!(Assigned.can_transition_to(Pending));
        assert!(!Pending.can_transition_to(InProgress));
        assert!(!Pending.can_transition_to(Completed));
        for terminal in [Completed, Failed, Cancelled] {
            for next in [Pending, Assigned, InProgress, Completed, Failed, Cancelled] {
                assert!(!terminal.can_transition_to(next), "{terminal} -> {next}");
            }
        }
    }

    #[test]
    fn test_task_status_serialization() {
        let json = serde_json::to_string(&TaskStatus::InProgress).unwrap();
        assert_eq!(json, "\"in-progress\"");
        let parsed: TaskStatus = serde_json::from_str("\"cancelled\"").unwrap();
        assert_eq!(parsed, TaskStatus::Cancelled);
    }

    #[test]
    fn test_descriptor_from_json() {
        let desc: TaskDescriptor = serde_json::from_value(serde_json::json!({
            "id": "t1",
            "type": "render",
            "priority": "high",
            "requiredCapabilities": [{"kind": "compute", "level": 2}],
            "dependsOn": ["t0"]
        }))
        .unwrap();
        assert_eq!(desc.id.as_deref(), Some("t1"));
        assert_eq!(desc.priority, Some(Priority::High));
        assert_eq!(desc.required_capabilities.len(), 1);
        assert_eq!(desc.depends_on, vec!["t0".to_string()]);
        assert!(desc.resource_requirements.is_none());
    }
}
