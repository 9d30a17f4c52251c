use crate::types::{AgentState, TaskStatus};
use muster_core::{AgentId, TaskId};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::warn;

/// Engine state changes published to observers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum EngineEvent {
    /// A task moved between statuses.
    #[serde(rename_all = "camelCase")]
    TaskStatusChanged {
        task_id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
        agent_id: Option<AgentId>,
    },
    /// An agent's lifecycle state changed.
    #[serde(rename_all = "camelCase")]
    AgentStatusChanged {
        agent_id: AgentId,
        from: AgentState,
        to: AgentState,
    },
    /// An agent joined the pool.
    #[serde(rename_all = "camelCase")]
    AgentRegistered { agent_id: AgentId },
    /// An agent left the pool; its bound tasks went back to pending.
    #[serde(rename_all = "camelCase")]
    AgentUnregistered {
        agent_id: AgentId,
        requeued: Vec<TaskId>,
    },
    /// A divisible task was split into sub-tasks.
    #[serde(rename_all = "camelCase")]
    TaskSplit {
        task_id: TaskId,
        subtasks: Vec<TaskId>,
    },
    /// A failed task was resubmitted.
    #[serde(rename_all = "camelCase")]
    TaskRetried {
        task_id: TaskId,
        retry_id: TaskId,
        attempt: u32,
    },
}

impl EngineEvent {
    /// Id of the task or agent the event is about.
    pub fn subject(&self) -> &str {
        match self {
            EngineEvent::TaskStatusChanged { task_id, .. }
            | EngineEvent::TaskSplit { task_id, .. }
            | EngineEvent::TaskRetried { task_id, .. } => task_id,
            EngineEvent::AgentStatusChanged { agent_id, .. }
            | EngineEvent::AgentRegistered { agent_id }
            | EngineEvent::AgentUnregistered { agent_id, .. } => agent_id,
        }
    }

    fn concerns(&self, key: &str) -> bool {
        if self.subject() == key {
            return true;
        }
        match self {
            EngineEvent::TaskStatusChanged { agent_id, .. } => agent_id.as_deref() == Some(key),
            EngineEvent::TaskRetried { retry_id, .. } => retry_id == key,
            _ => false,
        }
    }
}

/// Fan-out of [`EngineEvent`]s. Publishing never blocks and never fails.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    /// Create a bus holding up to `capacity` undelivered events per receiver.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Receive every event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    /// Receive only events about `key` (a task or agent id).
    pub fn watch(&self, key: impl Into<String>) -> KeyedReceiver {
        KeyedReceiver {
            key: key.into(),
            rx: self.tx.subscribe(),
        }
    }

    /// Send an event. Having no subscribers is fine.
    pub fn publish(&self, event: EngineEvent) {
        // No subscribers is the normal case.
        let _ = self.tx.send(event);
    }

    /// Live receivers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// Receiver filtered to one task or agent id.
pub struct KeyedReceiver {
    key: String,
    rx: broadcast::Receiver<EngineEvent>,
}

impl KeyedReceiver {
    /// Next matching event, or `None` once the bus is dropped.
    ///
    /// If the receiver lagged, skipped events are lost and a warning is logged.
    pub async fn recv(&mut self) -> Option<EngineEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if event.concerns(&self.key) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(key = %self.key, skipped, "Event watcher lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// The task or agent id being watched.
    pub fn key(&self) -> &str {
        &self.key
    }
}
