use crate::types::{Chunk, Task, TaskStatus};
use chrono::Utc;

/// Split a divisible task into contiguous chunks across `agent_count` agents.
///
/// A non-divisible task, or a count of one or less, comes back unchanged as a
/// single-element vector. Otherwise the chunk size is
/// `max(min_chunk_size, ceil(size / agent_count))` and sub-task `i` covers
/// `[i * chunk, min((i + 1) * chunk, size))`. Sub-tasks are fresh `pending`
/// records named `"{parent}-{i}"`; the caller assigns sequence numbers on insert.
pub fn split(task: &Task, agent_count: usize) -> Vec<Task> {
    if !task.divisible || agent_count <= 1 || task.size == 0 {
        return vec![task.clone()];
    }

    let count = agent_count as u64;
    let chunk_size = task.min_chunk_size.max(1).max(task.size.div_ceil(count));
    let now = Utc::now();

    let mut subtasks = Vec::new();
    let mut start = 0;
    let mut index = 0;
    while start < task.size {
        let end = (start + chunk_size).min(task.size);
        subtasks.push(Task {
            id: format!("{}-{index}", task.id),
            status: TaskStatus::Pending,
            assigned_to: None,
            divisible: false,
            size: end - start,
            result: None,
            error: None,
            parent_id: Some(task.id.clone()),
            chunk: Some(Chunk { start, end }),
            subtasks: Vec::new(),
            attempt: 0,
            retry_of: None,
            superseded_by: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
            ..task.clone()
        });
        start = end;
        index += 1;
    }
    subtasks
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::task_store::TaskStore;
    use crate::types::TaskDescriptor;
    use proptest::prelude::*;

    fn divisible(size: u64, min_chunk: u64) -> Task {
        let mut store = TaskStore::default();
        let id = store
            .create(
                TaskDescriptor::new("job")
                    .requires("compute", 1)
                    .depends_on(["setup"])
                    .divisible(size, min_chunk),
            )
            .unwrap();
        store.get(&id).unwrap().clone()
    }

    #[test]
    fn test_ten_across_three() {
        let parts = split(&divisible(10, 1), 3);
        let sizes: Vec<u64> = parts.iter().map(|t| t.size).collect();
        assert_eq!(sizes, vec![4, 4, 2]);
        let ids: Vec<&str> = parts.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["job-0", "job-1", "job-2"]);
        assert_eq!(parts[1].chunk, Some(Chunk { start: 4, end: 8 }));
        for part in &parts {
            assert_eq!(part.parent_id.as_deref(), Some("job"));
            assert_eq!(part.required_capabilities, parts[0].required_capabilities);
            assert_eq!(part.depends_on, vec!["setup".to_string()]);
            assert!(!part.is_splittable());
        }
    }

    #[test]
    fn test_min_chunk_size_wins() {
        let parts = split(&divisible(10, 6), 4);
        let sizes: Vec<u64> = parts.iter().map(|t| t.size).collect();
        assert_eq!(sizes, vec![6, 4]);
    }

    #[test]
    fn test_unchanged_when_not_splittable() {
        let task = divisible(10, 1);
        assert_eq!(split(&task, 1).len(), 1);
        assert_eq!(split(&task, 0)[0].id, "job");

        let mut plain = task.clone();
        plain.divisible = false;
        assert_eq!(split(&plain, 5)[0].id, "job");
    }

    proptest! {
        #[test]
        fn prop_chunks_cover_parent(size in 1u64..10_000, min_chunk in 1u64..500, agents in 2usize..32) {
            let parts = split(&divisible(size, min_chunk), agents);
            prop_assert_eq!(parts.iter().map(|t| t.size).sum::<u64>(), size);
            let mut expected_start = 0;
            for part in &parts {
                let chunk = part.chunk.unwrap();
                prop_assert_eq!(chunk.start, expected_start);
                prop_assert!(!chunk.is_empty());
                expected_start = chunk.end;
            }
            prop_assert_eq!(expected_start, size);
            prop_assert!(parts.len() <= agents.max(1));
        }
    }
}
