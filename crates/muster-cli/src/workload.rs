use muster_orchestrator::{AgentDescriptor, Coordinator, TaskDescriptor};
use serde::Deserialize;
use std::path::Path;

/// Agents and tasks to load into an engine, read from TOML or JSON.
#[derive(Debug, Default, Deserialize)]
pub struct Workload {
    #[serde(default)]
    pub agents: Vec<AgentDescriptor>,
    #[serde(default)]
    pub tasks: Vec<TaskDescriptor>,
}

impl Workload {
    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            anyhow::anyhow!("Failed to read workload file {}: {}", path.display(), e)
        })?;
        Self::parse(&content, is_json(path))
    }

    pub fn parse(content: &str, json: bool) -> anyhow::Result<Self> {
        if json {
            Ok(serde_json::from_str(content)?)
        } else {
            Ok(toml::from_str(content)?)
        }
    }

    /// Register every agent and create every task, in file order.
    ///
    /// Keeps going past rejected entries and returns one message per
    /// rejection. With `skip_existing`, entries whose id is already known are
    /// left alone instead of being reported as duplicates.
    pub async fn apply(&self, coord: &Coordinator, skip_existing: bool) -> Vec<String> {
        let mut problems = Vec::new();

        for (i, desc) in self.agents.iter().enumerate() {
            let label = entry_label("agent", i, desc.id.as_deref());
            if skip_existing {
                if let Some(id) = desc.id.as_deref() {
                    if coord.get_agent(id).await.is_some() {
                        continue;
                    }
                }
            }
            if let Err(e) = coord.register_agent(desc.clone()).await {
                problems.push(format!("{label}: {e}"));
            }
        }

        for (i, desc) in self.tasks.iter().enumerate() {
            let label = entry_label("task", i, desc.id.as_deref());
            if skip_existing {
                if let Some(id) = desc.id.as_deref() {
                    if coord.get_task(id).await.is_ok() {
                        continue;
                    }
                }
            }
            if let Err(e) = coord.create_task(desc.clone()).await {
                problems.push(format!("{label}: {e}"));
            }
        }

        problems
    }

    /// Dependency ids that name no task in this workload.
    pub fn unknown_dependencies(&self) -> Vec<(String, String)> {
        let known: std::collections::HashSet<&str> =
            self.tasks.iter().filter_map(|t| t.id.as_deref()).collect();
        self.tasks
            .iter()
            .flat_map(|t| {
                let owner = t.id.clone().unwrap_or_default();
                t.depends_on
                    .iter()
                    .filter(|dep| !known.contains(dep.as_str()))
                    .map(move |dep| (owner.clone(), dep.clone()))
            })
            .collect()
    }
}

fn is_json(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"))
}

fn entry_label(kind: &str, index: usize, id: Option<&str>) -> String {
    match id {
        Some(id) => format!("{kind} '{id}'"),
        None => format!("{kind} #{}", index + 1),
    }
}
