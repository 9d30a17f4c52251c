use crate::types::{Task, TaskDescriptor, TaskOutcome, TaskStatus};
use chrono::Utc;
use muster_core::{AgentId, MusterError, MusterResult, ResourceAllocation, TaskId};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

/// Filter for [`TaskStore::list`]. Empty fields match everything.
#[derive(Default)]
pub struct TaskFilter {
    /// Match any of these statuses.
    pub statuses: Option<Vec<TaskStatus>>,
    /// Match tasks bound to this agent.
    pub assigned_to: Option<AgentId>,
    /// Extra condition applied last.
    pub predicate: Option<Box<dyn Fn(&Task) -> bool + Send + Sync>>,
}

impl TaskFilter {
    /// Tasks in one status.
    pub fn status(status: TaskStatus) -> Self {
        Self {
            statuses: Some(vec![status]),
            ..Self::default()
        }
    }

    /// Tasks bound to one agent.
    pub fn assigned_to(agent_id: impl Into<AgentId>) -> Self {
        Self {
            assigned_to: Some(agent_id.into()),
            ..Self::default()
        }
    }

    /// Add a custom condition.
    pub fn with_predicate(mut self, f: impl Fn(&Task) -> bool + Send + Sync + 'static) -> Self {
        self.predicate = Some(Box::new(f));
        self
    }

    fn matches(&self, task: &Task) -> bool {
        if let Some(statuses) = &self.statuses {
            if !statuses.contains(&task.status) {
                return false;
            }
        }
        if let Some(agent) = &self.assigned_to {
            if task.assigned_to.as_ref() != Some(agent) {
                return false;
            }
        }
        self.predicate.as_ref().map_or(true, |p| p(task))
    }
}

/// Result of a status transition.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusChange {
    /// Task that moved.
    pub task_id: TaskId,
    /// Status before the transition.
    pub from: TaskStatus,
    /// Status after the transition.
    pub to: TaskStatus,
    /// Agent the task was bound to before the transition, if the binding ended.
    pub released_agent: Option<AgentId>,
    /// Resources to give back to `released_agent`.
    pub resources: ResourceAllocation,
}

/// Per-status task counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskCounts {
    /// Waiting for placement.
    pub pending: usize,
    /// Bound to an agent, not yet started.
    pub assigned: usize,
    /// Executing.
    pub in_progress: usize,
    /// Finished successfully.
    pub completed: usize,
    /// Finished with an error.
    pub failed: usize,
    /// Cancelled before finishing.
    pub cancelled: usize,
    /// All tasks.
    pub total: usize,
}

/// Task records with dependency resolution.
pub struct TaskStore {
    tasks: HashMap<TaskId, Task>,
    next_seq: u64,
    default_resources: ResourceAllocation,
}

impl TaskStore {
    /// Create an empty store.
    pub fn new(default_resources: ResourceAllocation) -> Self {
        Self {
            tasks: HashMap::new(),
            next_seq: 0,
            default_resources,
        }
    }

    /// Create a `pending` task from a descriptor, filling defaults.
    pub fn create(&mut self, desc: TaskDescriptor) -> MusterResult<TaskId> {
        let id = match desc.id {
            Some(id) if id.trim().is_empty() => {
                return Err(MusterError::Validation(
                    "task id must not be blank".to_string(),
                ))
            }
            Some(id) => id,
            None => Uuid::new_v4().to_string(),
        };
        if self.tasks.contains_key(&id) {
            return Err(MusterError::Duplicate(id));
        }
        for cap in &desc.required_capabilities {
            cap.validate()?;
        }
        let resources = desc.resource_requirements.unwrap_or(self.default_resources);
        resources.validate("resourceRequirements")?;
        if desc.depends_on.iter().any(|d| *d == id) {
            return Err(MusterError::Validation(format!(
                "task '{id}' depends on itself"
            )));
        }
        let divisible = desc.divisible.unwrap_or(false);
        let size = desc.size.unwrap_or(1);
        let min_chunk_size = desc.min_chunk_size.unwrap_or(1);
        if min_chunk_size == 0 {
            return Err(MusterError::Validation(format!(
                "task '{id}' minChunkSize must be at least 1"
            )));
        }
        if divisible && size == 0 {
            return Err(MusterError::Validation(format!(
                "divisible task '{id}' must have a positive size"
            )));
        }

        let now = Utc::now();
        let task = Task {
            id: id.clone(),
            task_type: desc.task_type.unwrap_or_else(|| "generic".to_string()),
            priority: desc.priority.unwrap_or_default(),
            status: TaskStatus::Pending,
            required_capabilities: desc.required_capabilities,
            resource_requirements: resources,
            depends_on: desc.depends_on,
            assigned_to: None,
            divisible,
            min_chunk_size,
            size,
            payload: desc.payload,
            result: None,
            error: None,
            parent_id: None,
            chunk: None,
            subtasks: Vec::new(),
            attempt: 0,
            retry_of: None,
            superseded_by: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
            seq: 0,
        };
        self.insert(task)
    }

    /// Insert a fully formed record (sub-tasks, retries). Assigns the next sequence number.
    pub fn insert(&mut self, mut task: Task) -> MusterResult<TaskId> {
        if self.tasks.contains_key(&task.id) {
            return Err(MusterError::Duplicate(task.id));
        }
        task.seq = self.next_seq;
        self.next_seq += 1;
        let id = task.id.clone();
        self.tasks.insert(id.clone(), task);
        Ok(id)
    }

    /// Look up a task.
    pub fn get(&self, id: &str) -> MusterResult<&Task> {
        self.tasks
            .get(id)
            .ok_or_else(|| MusterError::NotFound(format!("task '{id}'")))
    }

    fn get_mut(&mut self, id: &str) -> MusterResult<&mut Task> {
        self.tasks
            .get_mut(id)
            .ok_or_else(|| MusterError::NotFound(format!("task '{id}'")))
    }

    /// Whether a task with this id exists.
    pub fn contains(&self, id: &str) -> bool {
        self.tasks.contains_key(id)
    }

    /// Follow the `superseded_by` chain to the newest attempt of a task.
    pub fn resolve(&self, id: &str) -> Option<&Task> {
        let mut current = self.tasks.get(id)?;
        let mut seen = HashSet::new();
        while let Some(next) = current.superseded_by.as_deref() {
            if !seen.insert(next) {
                break;
            }
            match self.tasks.get(next) {
                Some(t) => current = t,
                None => break,
            }
        }
        Some(current)
    }

    /// Apply a state machine transition.
    ///
    /// Re-entry to `pending` clears `assigned_to`. Terminal states record the
    /// outcome. A task cancelled while in progress keeps its binding, so the
    /// running execution can be settled against it later.
    pub fn update_status(
        &mut self,
        id: &str,
        to: TaskStatus,
        outcome: Option<TaskOutcome>,
    ) -> MusterResult<StatusChange> {
        let task = self.get_mut(id)?;
        let from = task.status;
        if !from.can_transition_to(to) {
            return Err(MusterError::invalid_transition(id, from, to));
        }
        if to == TaskStatus::Assigned && task.assigned_to.is_none() {
            return Err(MusterError::Validation(format!(
                "task '{id}' cannot be assigned without an agent; use assign()"
            )));
        }

        let bound = matches!(from, TaskStatus::Assigned | TaskStatus::InProgress);
        let mut released_agent = None;
        let now = Utc::now();
        task.status = to;
        task.updated_at = now;
        match to {
            TaskStatus::Pending => {
                released_agent = task.assigned_to.take();
            }
            TaskStatus::Completed | TaskStatus::Failed => {
                if bound {
                    released_agent = task.assigned_to.clone();
                }
                task.completed_at = Some(now);
            }
            TaskStatus::Cancelled => {
                // An assigned task has no execution yet, so its binding ends now.
                if from == TaskStatus::Assigned {
                    released_agent = task.assigned_to.take();
                }
                task.completed_at = Some(now);
            }
            TaskStatus::Assigned | TaskStatus::InProgress => {}
        }
        if let Some(outcome) = outcome {
            task.result = outcome.result;
            task.error = outcome.error;
        }
        Ok(StatusChange {
            task_id: id.to_string(),
            from,
            to,
            released_agent,
            resources: task.resource_requirements,
        })
    }

    /// `pending -> assigned` with the agent binding.
    pub fn assign(&mut self, id: &str, agent_id: &str) -> MusterResult<StatusChange> {
        let task = self.get_mut(id)?;
        if !task.status.can_transition_to(TaskStatus::Assigned) {
            return Err(MusterError::invalid_transition(
                id,
                task.status,
                TaskStatus::Assigned,
            ));
        }
        task.assigned_to = Some(agent_id.to_string());
        self.update_status(id, TaskStatus::Assigned, None)
    }

    /// Cancel a task. A running execution keeps its agent until it settles.
    pub fn cancel(&mut self, id: &str) -> MusterResult<StatusChange> {
        self.update_status(id, TaskStatus::Cancelled, None)
    }

    /// List tasks matching a filter, in insertion order.
    pub fn list(&self, filter: &TaskFilter) -> Vec<&Task> {
        let mut tasks: Vec<&Task> = self.tasks.values().filter(|t| filter.matches(t)).collect();
        tasks.sort_by_key(|t| t.seq);
        tasks
    }

    /// All tasks in insertion order.
    pub fn all_tasks(&self) -> Vec<&Task> {
        self.list(&TaskFilter::default())
    }

    /// True iff every dependency, followed through retries, is `completed`.
    pub fn dependencies_satisfied(&self, id: &str) -> MusterResult<bool> {
        let task = self.get(id)?;
        Ok(task.depends_on.iter().all(|dep| {
            self.resolve(dep)
                .is_some_and(|t| t.status == TaskStatus::Completed)
        }))
    }

    /// Pending tasks whose dependencies are satisfied, excluding split parents.
    pub fn ready_set(&self) -> Vec<&Task> {
        self.list(&TaskFilter::status(TaskStatus::Pending))
            .into_iter()
            .filter(|t| !t.is_split_parent())
            .filter(|t| self.dependencies_satisfied(&t.id).unwrap_or(false))
            .collect()
    }

    /// Pending tasks with a dependency that ended `failed` or `cancelled`,
    /// paired with that dependency's id.
    pub fn blocked_by_failure(&self) -> Vec<(TaskId, TaskId)> {
        let mut blocked = Vec::new();
        for task in self.list(&TaskFilter::status(TaskStatus::Pending)) {
            for dep in &task.depends_on {
                if let Some(resolved) = self.resolve(dep) {
                    if matches!(resolved.status, TaskStatus::Failed | TaskStatus::Cancelled) {
                        blocked.push((task.id.clone(), resolved.id.clone()));
                        break;
                    }
                }
            }
        }
        blocked
    }

    /// Create a fresh `pending` attempt of a failed or cancelled task.
    ///
    /// The new record is named `"{root}-retry-{n}"`, where `root` is the
    /// original submission. The old record points at it via `superseded_by`.
    pub fn resubmit(&mut self, id: &str) -> MusterResult<TaskId> {
        let source = self.get(id)?;
        if !matches!(source.status, TaskStatus::Failed | TaskStatus::Cancelled) {
            return Err(MusterError::Validation(format!(
                "task '{id}' is {} and cannot be resubmitted",
                source.status
            )));
        }
        if let Some(next) = &source.superseded_by {
            return Err(MusterError::Validation(format!(
                "task '{id}' was already resubmitted as '{next}'"
            )));
        }

        let mut root = source;
        while let Some(prev) = root.retry_of.as_deref().and_then(|p| self.tasks.get(p)) {
            root = prev;
        }
        let attempt = source.attempt + 1;
        let mut new_id = format!("{}-retry-{attempt}", root.id);
        let mut suffix = 1;
        while self.tasks.contains_key(&new_id) {
            suffix += 1;
            new_id = format!("{}-retry-{attempt}-{suffix}", root.id);
        }

        let now = Utc::now();
        let mut fresh = source.clone();
        fresh.id = new_id.clone();
        fresh.status = TaskStatus::Pending;
        fresh.assigned_to = None;
        fresh.result = None;
        fresh.error = None;
        fresh.subtasks = Vec::new();
        fresh.attempt = attempt;
        fresh.retry_of = Some(id.to_string());
        fresh.superseded_by = None;
        fresh.created_at = now;
        fresh.updated_at = now;
        fresh.completed_at = None;

        self.insert(fresh)?;
        self.get_mut(id)?.superseded_by = Some(new_id.clone());
        Ok(new_id)
    }

    /// Insert the sub-tasks of a split and mark `parent_id` as a split parent.
    pub fn record_subtasks(&mut self, parent_id: &str, subtasks: Vec<Task>) -> MusterResult<Vec<TaskId>> {
        let parent = self.get(parent_id)?;
        if parent.status != TaskStatus::Pending || parent.is_split_parent() {
            return Err(MusterError::Validation(format!(
                "task '{parent_id}' cannot be split again"
            )));
        }
        if let Some(clash) = subtasks.iter().find(|t| self.tasks.contains_key(&t.id)) {
            return Err(MusterError::Duplicate(clash.id.clone()));
        }
        let mut ids = Vec::with_capacity(subtasks.len());
        for task in subtasks {
            ids.push(self.insert(task)?);
        }
        let parent = self.get_mut(parent_id)?;
        parent.subtasks = ids.clone();
        parent.updated_at = Utc::now();
        Ok(ids)
    }

    /// Finalize a split parent once every sub-task (through retries) is terminal.
    ///
    /// Completed parents carry the sub-results as an array ordered by chunk
    /// start. Returns `None` while any sub-task is still open.
    pub fn finalize_split_parent(&mut self, parent_id: &str) -> MusterResult<Option<StatusChange>> {
        let parent = self.get(parent_id)?;
        if parent.status != TaskStatus::Pending || !parent.is_split_parent() {
            return Ok(None);
        }
        let mut settled = Vec::with_capacity(parent.subtasks.len());
        for sub_id in &parent.subtasks {
            let sub = self
                .resolve(sub_id)
                .ok_or_else(|| MusterError::NotFound(format!("sub-task '{sub_id}'")))?;
            if !sub.status.is_terminal() {
                return Ok(None);
            }
            settled.push(sub);
        }
        settled.sort_by_key(|t| t.chunk.map(|c| c.start).unwrap_or(0));

        let failed: Vec<&str> = settled
            .iter()
            .filter(|t| t.status != TaskStatus::Completed)
            .map(|t| t.id.as_str())
            .collect();
        let (to, outcome) = if failed.is_empty() {
            let results: Vec<serde_json::Value> = settled
                .iter()
                .map(|t| t.result.clone().unwrap_or(serde_json::Value::Null))
                .collect();
            (
                TaskStatus::Completed,
                TaskOutcome::success(serde_json::Value::Array(results)),
            )
        } else {
            (
                TaskStatus::Failed,
                TaskOutcome::failure(format!("sub-tasks failed: {}", failed.join(", "))),
            )
        };

        let now = Utc::now();
        let parent = self.get_mut(parent_id)?;
        let from = parent.status;
        parent.status = to;
        parent.result = outcome.result;
        parent.error = outcome.error;
        parent.updated_at = now;
        parent.completed_at = Some(now);
        Ok(Some(StatusChange {
            task_id: parent_id.to_string(),
            from,
            to,
            released_agent: None,
            resources: parent.resource_requirements,
        }))
    }

    /// Assigned or in-progress tasks bound to an agent.
    pub fn bound_to(&self, agent_id: &str) -> Vec<TaskId> {
        self.tasks
            .values()
            .filter(|t| matches!(t.status, TaskStatus::Assigned | TaskStatus::InProgress))
            .filter(|t| t.assigned_to.as_deref() == Some(agent_id))
            .map(|t| (t.seq, t.id.clone()))
            .collect::<std::collections::BTreeMap<_, _>>()
            .into_values()
            .collect()
    }

    /// Drop the binding of a cancelled task whose execution has finished.
    pub fn unbind(&mut self, id: &str) -> Option<AgentId> {
        let task = self.tasks.get_mut(id)?;
        if task.status != TaskStatus::Cancelled {
            return None;
        }
        task.updated_at = Utc::now();
        task.assigned_to.take()
    }

    /// Cancelled tasks still bound to an agent, i.e. cancelled mid-execution.
    pub fn cancelled_in_flight(&self) -> Vec<(TaskId, AgentId)> {
        self.list(&TaskFilter::status(TaskStatus::Cancelled))
            .into_iter()
            .filter_map(|t| t.assigned_to.clone().map(|a| (t.id.clone(), a)))
            .collect()
    }

    /// True while the agent has an assigned, in-progress, or cancelled-but-running task.
    pub fn occupies(&self, agent_id: &str) -> bool {
        self.tasks.values().any(|t| {
            t.assigned_to.as_deref() == Some(agent_id)
                && matches!(
                    t.status,
                    TaskStatus::Assigned | TaskStatus::InProgress | TaskStatus::Cancelled
                )
        })
    }

    /// Number of assigned or in-progress tasks bound to an agent.
    pub fn active_load(&self, agent_id: &str) -> usize {
        self.tasks
            .values()
            .filter(|t| matches!(t.status, TaskStatus::Assigned | TaskStatus::InProgress))
            .filter(|t| t.assigned_to.as_deref() == Some(agent_id))
            .count()
    }

    /// Tasks currently executing.
    pub fn in_progress_count(&self) -> usize {
        self.tasks
            .values()
            .filter(|t| t.status == TaskStatus::InProgress)
            .count()
    }

    /// Totals by status.
    pub fn counts(&self) -> TaskCounts {
        let mut counts = TaskCounts {
            total: self.tasks.len(),
            ..TaskCounts::default()
        };
        for task in self.tasks.values() {
            match task.status {
                TaskStatus::Pending => counts.pending += 1,
                TaskStatus::Assigned => counts.assigned += 1,
                TaskStatus::InProgress => counts.in_progress += 1,
                TaskStatus::Completed => counts.completed += 1,
                TaskStatus::Failed => counts.failed += 1,
                TaskStatus::Cancelled => counts.cancelled += 1,
            }
        }
        counts
    }

    /// True when every task is terminal.
    pub fn is_done(&self) -> bool {
        self.tasks.values().all(|t| t.status.is_terminal())
    }

    /// Number of tasks.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether the store holds no tasks.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Check for cycles in the dependency graph.
    pub fn has_cycle(&self) -> bool {
        let mut visited = HashMap::new();
        let mut ids: Vec<&TaskId> = self.tasks.keys().collect();
        ids.sort();
        ids.into_iter()
            .any(|id| self.dfs_cycle(id, &mut visited))
    }

    fn dfs_cycle<'a>(&'a self, id: &'a str, visited: &mut HashMap<&'a str, u8>) -> bool {
        match visited.get(id) {
            Some(1) => return true,
            Some(2) => return false,
            _ => {}
        }
        visited.insert(id, 1);
        if let Some(task) = self.tasks.get(id) {
            for dep in &task.depends_on {
                if self.dfs_cycle(dep, visited) {
                    return true;
                }
            }
        }
        visited.insert(id, 2);
        false
    }

    /// Replace every record, e.g. when restoring a snapshot.
    pub fn replace_all(&mut self, tasks: Vec<Task>) {
        self.tasks.clear();
        self.next_seq = 0;
        for task in tasks {
            self.next_seq = self.next_seq.max(task.seq + 1);
            self.tasks.insert(task.id.clone(), task);
        }
    }

    /// Requirements applied to tasks that declare none.
    pub fn set_default_resources(&mut self, resources: ResourceAllocation) {
        self.default_resources = resources;
    }
}

impl Default for TaskStore {
    fn default() -> Self {
        Self::new(ResourceAllocation::new(1.0, 128.0, 0.0))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use muster_core::Priority;
    use serde_json::json;

    fn store() -> TaskStore {
        TaskStore::default()
    }

    fn run_to(store: &mut TaskStore, id: &str, to: TaskStatus) {
        store.assign(id, "agent-1").unwrap();
        store.update_status(id, TaskStatus::InProgress, None).unwrap();
        let outcome = match to {
            TaskStatus::Completed => TaskOutcome::success(json!({"ok": true})),
            _ => TaskOutcome::failure("boom"),
        };
        store.update_status(id, to, Some(outcome)).unwrap();
    }

    #[test]
    fn test_create_applies_defaults() {
        let mut store = store();
        let id = store.create(TaskDescriptor::default()).unwrap();
        assert!(Uuid::parse_str(&id).is_ok());
        let task = store.get(&id).unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.priority, Priority::Medium);
        assert_eq!(task.resource_requirements, ResourceAllocation::new(1.0, 128.0, 0.0));
        assert!(!task.divisible);
        assert_eq!(task.size, 1);
        assert_eq!(task.min_chunk_size, 1);
    }

    #[test]
    fn test_create_rejects_bad_input() {
        let mut store = store();
        store.create(TaskDescriptor::new("t1")).unwrap();
        assert!(matches!(
            store.create(TaskDescriptor::new("t1")),
            Err(MusterError::Duplicate(_))
        ));
        assert!(store.create(TaskDescriptor::new("t2").requires("", 1)).is_err());
        assert!(store
            .create(TaskDescriptor::new("t3").with_resources(-1.0, 0.0, 0.0))
            .is_err());
        assert!(store.create(TaskDescriptor::new("t4").depends_on(["t4"])).is_err());
        assert!(store.create(TaskDescriptor::new("t5").divisible(0, 1)).is_err());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_illegal_transitions_are_rejected() {
        let mut store = store();
        store.create(TaskDescriptor::new("t1")).unwrap();
        let err = store
            .update_status("t1", TaskStatus::Completed, None)
            .unwrap_err();
        assert!(matches!(err, MusterError::InvalidTransition { .. }));
        run_to(&mut store, "t1", TaskStatus::Completed);
        assert!(store.update_status("t1", TaskStatus::InProgress, None).is_err());
        assert!(store.cancel("t1").is_err());
    }

    #[test]
    fn test_requeue_clears_binding() {
        let mut store = store();
        store.create(TaskDescriptor::new("t1")).unwrap();
        store.assign("t1", "agent-1").unwrap();
        store.update_status("t1", TaskStatus::InProgress, None).unwrap();
        let change = store.update_status("t1", TaskStatus::Pending, None).unwrap();
        assert_eq!(change.released_agent.as_deref(), Some("agent-1"));
        assert!(store.get("t1").unwrap().assigned_to.is_none());
    }

    #[test]
    fn test_cancel_mid_execution_keeps_binding_until_unbound() {
        let mut store = store();
        store.create(TaskDescriptor::new("t1")).unwrap();
        store.create(TaskDescriptor::new("t2")).unwrap();
        store.assign("t1", "agent-1").unwrap();
        store.update_status("t1", TaskStatus::InProgress, None).unwrap();
        store.assign("t2", "agent-2").unwrap();

        let change = store.cancel("t1").unwrap();
        assert!(change.released_agent.is_none());
        assert!(store.occupies("agent-1"));
        assert_eq!(
            store.cancelled_in_flight(),
            vec![("t1".to_string(), "agent-1".to_string())]
        );

        let change = store.cancel("t2").unwrap();
        assert_eq!(change.released_agent.as_deref(), Some("agent-2"));
        assert!(!store.occupies("agent-2"));

        assert_eq!(store.unbind("t1").as_deref(), Some("agent-1"));
        assert!(!store.occupies("agent-1"));
    }

    #[test]
    fn test_dependency_gating() {
        let mut store = store();
        store.create(TaskDescriptor::new("a")).unwrap();
        store.create(TaskDescriptor::new("b").depends_on(["a"])).unwrap();
        store.create(TaskDescriptor::new("c").depends_on(["missing"])).unwrap();

        let ready: Vec<_> = store.ready_set().iter().map(|t| t.id.clone()).collect();
        assert_eq!(ready, vec!["a"]);
        assert!(!store.dependencies_satisfied("b").unwrap());

        run_to(&mut store, "a", TaskStatus::Completed);
        let ready: Vec<_> = store.ready_set().iter().map(|t| t.id.clone()).collect();
        assert_eq!(ready, vec!["b"]);
    }

    #[test]
    fn test_failed_dependency_blocks_until_retry_succeeds() {
        let mut store = store();
        store.create(TaskDescriptor::new("a")).unwrap();
        store.create(TaskDescriptor::new("b").depends_on(["a"])).unwrap();
        run_to(&mut store, "a", TaskStatus::Failed);

        assert_eq!(store.blocked_by_failure(), vec![("b".to_string(), "a".to_string())]);
        assert!(store.ready_set().is_empty());

        let retry = store.resubmit("a").unwrap();
        assert_eq!(retry, "a-retry-1");
        assert!(store.blocked_by_failure().is_empty());
        assert_eq!(store.get(&retry).unwrap().attempt, 1);
        assert!(store.resubmit("a").is_err());

        run_to(&mut store, &retry, TaskStatus::Failed);
        let second = store.resubmit(&retry).unwrap();
        assert_eq!(second, "a-retry-2");
        run_to(&mut store, &second, TaskStatus::Completed);
        assert!(store.dependencies_satisfied("b").unwrap());
    }

    #[test]
    fn test_resubmit_rejects_open_tasks() {
        let mut store = store();
        store.create(TaskDescriptor::new("a")).unwrap();
        assert!(store.resubmit("a").is_err());
    }

    #[test]
    fn test_list_filters() {
        let mut store = store();
        store.create(TaskDescriptor::new("a").with_priority(Priority::High)).unwrap();
        store.create(TaskDescriptor::new("b")).unwrap();
        store.assign("b", "agent-9").unwrap();

        let assigned = store.list(&TaskFilter::assigned_to("agent-9"));
        assert_eq!(assigned.len(), 1);
        let high = store.list(
            &TaskFilter::default().with_predicate(|t| t.priority == Priority::High),
        );
        assert_eq!(high[0].id, "a");
        assert_eq!(store.active_load("agent-9"), 1);
        assert_eq!(store.bound_to("agent-9"), vec!["b"]);
    }

    #[test]
    fn test_cycle_detection() {
        let mut store = store();
        store.create(TaskDescriptor::new("a").depends_on(["c"])).unwrap();
        store.create(TaskDescriptor::new("b").depends_on(["a"])).unwrap();
        assert!(!store.has_cycle());
        store.create(TaskDescriptor::new("c").depends_on(["b"])).unwrap();
        assert!(store.has_cycle());
    }

    #[test]
    fn test_counts_and_is_done() {
        let mut store = store();
        assert!(store.is_done());
        store.create(TaskDescriptor::new("a")).unwrap();
        store.create(TaskDescriptor::new("b")).unwrap();
        run_to(&mut store, "a", TaskStatus::Completed);
        store.cancel("b").unwrap();
        let counts = store.counts();
        assert_eq!(counts.completed, 1);
        assert_eq!(counts.cancelled, 1);
        assert_eq!(counts.total, 2);
        assert!(store.is_done());
    }
}
