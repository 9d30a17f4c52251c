use crate::registry::AgentRegistry;
use crate::types::AgentState;
use chrono::{DateTime, Utc};
use muster_core::{satisfies_all, AgentId, Capability, MusterError, MusterResult, ResourceAllocation};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::debug;
use uuid::Uuid;

/// What a swarm must provide.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwarmTemplate {
    /// Name given to the assembled swarm.
    pub name: String,
    /// Fewest members the swarm may have.
    pub min_agents: usize,
    /// Every member must satisfy all of these.
    #[serde(default)]
    pub required_capabilities: Vec<Capability>,
    /// Aggregate available resources the members must reach together.
    #[serde(default)]
    pub resource_floor: ResourceAllocation,
}

/// Restricts which agents assembly may consider.
///
/// Offline and errored agents are never considered.
#[derive(Debug, Clone, Default)]
pub struct AssemblyContext {
    /// Only consider agents that can take work right now.
    pub available_only: bool,
    /// Agents to leave out.
    pub exclude: HashSet<AgentId>,
}

/// A transient, named grouping of agents. Not persisted.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Swarm {
    /// Fresh id per assembly.
    pub id: Uuid,
    /// Copied from the template.
    pub name: String,
    /// Members in selection order.
    pub agents: Vec<AgentId>,
    /// Sum of the members' available resources.
    pub aggregate: ResourceAllocation,
    /// When the swarm was assembled.
    pub created_at: DateTime<Utc>,
}

/// Select agents for a template.
///
/// Candidates are ranked by how many resource dimensions meet a per-member
/// share of the floor, best first, registration order among equals, and
/// taken until both `min_agents` and the aggregate floor are reached.
pub fn assemble(
    registry: &AgentRegistry,
    template: &SwarmTemplate,
    ctx: &AssemblyContext,
) -> MusterResult<Swarm> {
    let share = template.resource_floor.divided_by(template.min_agents.max(1));
    let mut candidates: Vec<_> = registry
        .all_agents()
        .into_iter()
        .filter(|a| !matches!(a.state(), AgentState::Offline | AgentState::Error))
        .filter(|a| !ctx.available_only || a.is_available())
        .filter(|a| !ctx.exclude.contains(&a.id))
        .filter(|a| satisfies_all(&a.capabilities, &template.required_capabilities))
        .collect();
    candidates.sort_by_key(|a| std::cmp::Reverse(a.resources.available.satisfied_dims(&share)));

    let mut members = Vec::new();
    let mut aggregate = ResourceAllocation::zero();
    for agent in &candidates {
        if members.len() >= template.min_agents && template.resource_floor.fits_within(&aggregate) {
            break;
        }
        members.push(agent.id.clone());
        aggregate = aggregate.add(&agent.resources.available);
    }

    if members.len() < template.min_agents || !template.resource_floor.fits_within(&aggregate) {
        return Err(MusterError::InsufficientAgents {
            required: template.min_agents,
            available: candidates.len(),
        });
    }

    debug!(swarm = %template.name, members = members.len(), "Swarm assembled");
    Ok(Swarm {
        id: Uuid::new_v4(),
        name: template.name.clone(),
        agents: members,
        aggregate,
        created_at: Utc::now(),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::types::{AgentDescriptor, AgentState};

    fn registry() -> AgentRegistry {
        let mut reg = AgentRegistry::new();
        reg.register(
            AgentDescriptor::new("small")
                .with_capability("compute", 2)
                .with_resources(1.0, 256.0, 0.0),
        )
        .unwrap();
        reg.register(
            AgentDescriptor::new("large")
                .with_capability("compute", 3)
                .with_resources(8.0, 8192.0, 512.0),
        )
        .unwrap();
        reg.register(
            AgentDescriptor::new("storage")
                .with_capability("storage", 1)
                .with_resources(2.0, 1024.0, 4096.0),
        )
        .unwrap();
        reg
    }

    fn template(min_agents: usize, floor: ResourceAllocation) -> SwarmTemplate {
        SwarmTemplate {
            name: "render".into(),
            min_agents,
            required_capabilities: vec![Capability::new("compute", 2)],
            resource_floor: floor,
        }
    }

    #[test]
    fn test_assembles_best_ranked_first() {
        let reg = registry();
        let swarm = assemble(
            &reg,
            &template(1, ResourceAllocation::new(4.0, 1024.0, 0.0)),
            &AssemblyContext::default(),
        )
        .unwrap();
        assert_eq!(swarm.agents, vec!["large"]);
        assert_eq!(swarm.aggregate.cpu, 8.0);
    }

    #[test]
    fn test_takes_more_agents_until_floor_met() {
        let reg = registry();
        let swarm = assemble(
            &reg,
            &template(1, ResourceAllocation::new(8.5, 0.0, 0.0)),
            &AssemblyContext::default(),
        )
        .unwrap();
        // Both meet two of three dimensions, so registration order decides.
        assert_eq!(swarm.agents, vec!["small", "large"]);
        assert_eq!(swarm.aggregate.cpu, 9.0);
    }

    #[test]
    fn test_insufficient_agents() {
        let mut reg = registry();
        let err = assemble(
            &reg,
            &template(3, ResourceAllocation::zero()),
            &AssemblyContext::default(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            MusterError::InsufficientAgents { required: 3, available: 2 }
        ));

        reg.set_state("large", AgentState::Busy).unwrap();
        let ctx = AssemblyContext {
            available_only: true,
            ..AssemblyContext::default()
        };
        assert!(assemble(&reg, &template(2, ResourceAllocation::zero()), &ctx).is_err());
    }

    #[test]
    fn test_never_picks_offline_or_errored_agents() {
        let mut reg = AgentRegistry::new();
        for (id, status) in [("gone", "offline"), ("broken", "error")] {
            reg.register(
                AgentDescriptor::new(id)
                    .with_capability("compute", 3)
                    .with_resources(8.0, 8192.0, 512.0)
                    .with_status(status),
            )
            .unwrap();
        }
        let err = assemble(
            &reg,
            &template(2, ResourceAllocation::zero()),
            &AssemblyContext::default(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            MusterError::InsufficientAgents { required: 2, available: 0 }
        ));

        let mut reg = registry();
        reg.set_state("large", AgentState::Offline).unwrap();
        let swarm = assemble(
            &reg,
            &template(1, ResourceAllocation::zero()),
            &AssemblyContext::default(),
        )
        .unwrap();
        assert_eq!(swarm.agents, vec!["small"]);
    }

    #[test]
    fn test_exclusion() {
        let reg = registry();
        let ctx = AssemblyContext {
            exclude: ["large".to_string()].into_iter().collect(),
            ..AssemblyContext::default()
        };
        let swarm = assemble(&reg, &template(1, ResourceAllocation::zero()), &ctx).unwrap();
        assert_eq!(swarm.agents, vec!["small"]);
    }
}
