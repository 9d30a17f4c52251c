use crate::types::{Agent, AgentDescriptor, AgentResources, AgentState, AgentStatus};
use chrono::{DateTime, Duration, Utc};
use muster_core::{AgentId, Capability, MusterError, MusterResult, ResourceAllocation};
use serde_json::{Map, Value};
use std::collections::HashMap;
use tracing::{info, warn};

/// Authoritative set of known agents.
pub struct AgentRegistry {
    agents: HashMap<AgentId, Agent>,
    next_seq: u64,
}

impl AgentRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            agents: HashMap::new(),
            next_seq: 0,
        }
    }

    /// Validate a descriptor and add the agent.
    ///
    /// Nothing is mutated when validation fails.
    pub fn register(&mut self, desc: AgentDescriptor) -> MusterResult<AgentId> {
        let id = match desc.id {
            Some(id) if !id.trim().is_empty() => id,
            _ => {
                return Err(MusterError::Validation(
                    "agent id is required".to_string(),
                ))
            }
        };
        if self.agents.contains_key(&id) {
            return Err(MusterError::Duplicate(id));
        }
        let capabilities = desc.capabilities.ok_or_else(|| {
            MusterError::Validation(format!("agent '{id}' has no capability list"))
        })?;
        for cap in &capabilities {
            cap.validate()?;
        }
        let resources = AgentResources::new(
            desc.resources.unwrap_or_default(),
            desc.reserved.unwrap_or_default(),
        )?;
        let state = match desc.status.as_deref() {
            Some(s) => s.parse::<AgentState>()?,
            None => AgentState::Available,
        };

        let now = Utc::now();
        let agent = Agent {
            id: id.clone(),
            agent_type: desc.agent_type.unwrap_or_else(|| "generic".to_string()),
            status: AgentStatus {
                state,
                healthy: !matches!(state, AgentState::Error | AgentState::Offline),
                last_heartbeat: now,
            },
            capabilities,
            resources,
            metadata: desc.metadata,
            registered_at: now,
            seq: self.next_seq,
        };
        self.next_seq += 1;
        info!(agent_id = %id, agent_type = %agent.agent_type, "Agent registered");
        self.agents.insert(id.clone(), agent);
        Ok(id)
    }

    /// Remove an agent. Task requeueing is handled by the caller, which sees the task store.
    pub fn remove(&mut self, id: &str) -> MusterResult<Agent> {
        self.agents
            .remove(id)
            .ok_or_else(|| MusterError::NotFound(format!("agent '{id}'")))
    }

    /// Merge a partial update into an agent.
    ///
    /// Known keys: `type`, `capabilities`, `resources`, `status`, `metadata`.
    /// Unknown keys are logged and skipped. All known keys are validated
    /// before any of them is applied.
    pub fn update(&mut self, id: &str, fields: &Map<String, Value>) -> MusterResult<()> {
        let agent = self
            .agents
            .get(id)
            .ok_or_else(|| MusterError::NotFound(format!("agent '{id}'")))?;

        let mut agent_type = None;
        let mut capabilities = None;
        let mut total = None;
        let mut state = None;
        let mut metadata = None;

        for (key, value) in fields {
            match key.as_str() {
                "type" => {
                    let s = value.as_str().ok_or_else(|| {
                        MusterError::Validation("field 'type' must be a string".to_string())
                    })?;
                    agent_type = Some(s.to_string());
                }
                "capabilities" => {
                    let caps: Vec<Capability> = serde_json::from_value(value.clone())
                        .map_err(|e| {
                            MusterError::Validation(format!("field 'capabilities': {e}"))
                        })?;
                    for cap in &caps {
                        cap.validate()?;
                    }
                    capabilities = Some(caps);
                }
                "resources" => {
                    let res: ResourceAllocation = serde_json::from_value(value.clone())
                        .map_err(|e| MusterError::Validation(format!("field 'resources': {e}")))?;
                    res.validate("resources")?;
                    if !agent.resources.reserved.fits_within(&res) {
                        return Err(MusterError::Validation(format!(
                            "new total ({res}) is below reserved ({})",
                            agent.resources.reserved
                        )));
                    }
                    total = Some(res);
                }
                "status" => {
                    let s = value.as_str().ok_or_else(|| {
                        MusterError::Validation("field 'status' must be a string".to_string())
                    })?;
                    state = Some(s.parse::<AgentState>()?);
                }
                "metadata" => {
                    let m: HashMap<String, Value> = serde_json::from_value(value.clone())
                        .map_err(|e| MusterError::Validation(format!("field 'metadata': {e}")))?;
                    metadata = Some(m);
                }
                other => {
                    warn!(agent_id = %id, field = %other, "Ignoring unknown agent field");
                }
            }
        }

        let agent = self
            .agents
            .get_mut(id)
            .ok_or_else(|| MusterError::NotFound(format!("agent '{id}'")))?;
        if let Some(t) = agent_type {
            agent.agent_type = t;
        }
        if let Some(caps) = capabilities {
            agent.capabilities = caps;
        }
        if let Some(res) = total {
            agent.resources.set_total(res)?;
        }
        if let Some(s) = state {
            agent.status = AgentStatus {
                last_heartbeat: agent.status.last_heartbeat,
                ..AgentStatus::new(s)
            };
        }
        if let Some(m) = metadata {
            agent.metadata.extend(m);
        }
        Ok(())
    }

    /// Look up an agent by id.
    pub fn get(&self, id: &str) -> Option<&Agent> {
        self.agents.get(id)
    }

    /// Mutable access for callers that keep the resource invariant themselves.
    pub fn get_mut(&mut self, id: &str) -> Option<&mut Agent> {
        self.agents.get_mut(id)
    }

    /// Whether an agent with this id is registered.
    pub fn contains(&self, id: &str) -> bool {
        self.agents.contains_key(id)
    }

    /// All agents in registration order.
    pub fn all_agents(&self) -> Vec<&Agent> {
        let mut agents: Vec<&Agent> = self.agents.values().collect();
        agents.sort_by_key(|a| a.seq);
        agents
    }

    /// Agents with a capability of the given kind, in any state.
    pub fn find_by_capability(&self, kind: &str) -> Vec<&Agent> {
        self.all_agents()
            .into_iter()
            .filter(|a| a.has_capability_kind(kind))
            .collect()
    }

    /// Agents in the `available` state, in registration order.
    pub fn list_available(&self) -> Vec<&Agent> {
        self.all_agents()
            .into_iter()
            .filter(|a| a.is_available())
            .collect()
    }

    /// Set the lifecycle state, returning the previous one.
    pub fn set_state(&mut self, id: &str, state: AgentState) -> MusterResult<AgentState> {
        let agent = self
            .agents
            .get_mut(id)
            .ok_or_else(|| MusterError::NotFound(format!("agent '{id}'")))?;
        let previous = agent.status.state;
        agent.status.state = state;
        agent.status.healthy = !matches!(state, AgentState::Error | AgentState::Offline);
        Ok(previous)
    }

    /// Move `amount` from available to reserved. Fails if it does not fit.
    pub fn reserve(&mut self, id: &str, amount: &ResourceAllocation) -> MusterResult<()> {
        let agent = self
            .agents
            .get_mut(id)
            .ok_or_else(|| MusterError::NotFound(format!("agent '{id}'")))?;
        agent.resources.reserve(amount)
    }

    /// Release a reservation. Unknown agents are ignored: they may have been removed mid-flight.
    pub fn release(&mut self, id: &str, amount: &ResourceAllocation) {
        if let Some(agent) = self.agents.get_mut(id) {
            agent.resources.release(amount);
        }
    }

    /// Refresh an agent's heartbeat and mark it healthy.
    ///
    /// An offline agent comes back as available.
    pub fn heartbeat(&mut self, id: &str) -> MusterResult<()> {
        let agent = self
            .agents
            .get_mut(id)
            .ok_or_else(|| MusterError::NotFound(format!("agent '{id}'")))?;
        agent.status.last_heartbeat = Utc::now();
        agent.status.healthy = true;
        if agent.status.state == AgentState::Offline {
            agent.status.state = AgentState::Available;
        }
        Ok(())
    }

    /// Record activity from an agent without touching its state.
    ///
    /// Assignment and settlement count as liveness, so a long execution does
    /// not make its agent look silent. Unknown agents are ignored.
    pub fn touch(&mut self, id: &str, now: DateTime<Utc>) {
        if let Some(agent) = self.agents.get_mut(id) {
            if agent.status.last_heartbeat < now {
                agent.status.last_heartbeat = now;
            }
        }
    }

    /// Online agents whose last heartbeat is older than `max_age` at `now`.
    pub fn stale_agents(&self, max_age: Duration, now: DateTime<Utc>) -> Vec<AgentId> {
        self.all_agents()
            .into_iter()
            .filter(|a| a.status.state != AgentState::Offline)
            .filter(|a| now - a.status.last_heartbeat > max_age)
            .map(|a| a.id.clone())
            .collect()
    }

    /// Number of registered agents.
    pub fn len(&self) -> usize {
        self.agents.len()
    }

    /// True when no agent is registered.
    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// Replace every record, e.g. when restoring a snapshot.
    pub fn replace_all(&mut self, agents: Vec<Agent>) {
        self.agents.clear();
        self.next_seq = 0;
        for mut agent in agents {
            agent.resources.normalize();
            self.next_seq = self.next_seq.max(agent.seq + 1);
            self.agents.insert(agent.id.clone(), agent);
        }
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}
