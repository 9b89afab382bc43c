//! Hot cache for task and step rows.
//!
//! Replicates the primary store's task/step/checkpoint state for per-cycle
//! decisions; the orchestrator and the observe endpoint read from here, the
//! step-execution path writes through. The primary store stays
//! authoritative. Keys follow the persisted layout: tasks by id, checkpoint
//! records by `checkpoint:<task>:<step>`.

use std::collections::HashMap;

use tokio::sync::RwLock;
use uuid::Uuid;

use tentackl_db::models::{Checkpoint, Step, Task, TaskStatus};

/// In-process cache store.
#[derive(Default)]
pub struct TaskCache {
    tasks: RwLock<HashMap<Uuid, Task>>,
    checkpoints: RwLock<HashMap<String, Checkpoint>>,
}

fn checkpoint_key(task_id: Uuid, step_id: &str) -> String {
    format!("checkpoint:{task_id}:{step_id}")
}

impl TaskCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the cached task (steps included).
    pub async fn put_task(&self, task: Task) {
        self.tasks.write().await.insert(task.id, task);
    }

    /// Fetch a cached task with its steps.
    pub async fn get_task(&self, task_id: Uuid) -> Option<Task> {
        self.tasks.read().await.get(&task_id).cloned()
    }

    /// Drop a task (terminal cleanup).
    pub async fn remove_task(&self, task_id: Uuid) {
        self.tasks.write().await.remove(&task_id);
        let prefix = format!("checkpoint:{task_id}:");
        self.checkpoints
            .write()
            .await
            .retain(|k, _| !k.starts_with(&prefix));
    }

    /// Update the cached task status. Missing entries are ignored; the next
    /// write-through repopulates them.
    pub async fn set_task_status(&self, task_id: Uuid, status: TaskStatus) {
        if let Some(task) = self.tasks.write().await.get_mut(&task_id) {
            task.status = status;
            task.updated_at = chrono::Utc::now();
        }
    }

    /// Merge metadata keys into the cached task.
    pub async fn merge_metadata(&self, task_id: Uuid, metadata: &serde_json::Value) {
        if let Some(task) = self.tasks.write().await.get_mut(&task_id) {
            if let (Some(target), Some(source)) =
                (task.metadata.as_object_mut(), metadata.as_object())
            {
                for (k, v) in source {
                    target.insert(k.clone(), v.clone());
                }
            }
        }
    }

    /// Apply an in-place update to one cached step.
    pub async fn update_step<F>(&self, task_id: Uuid, step_id: &str, f: F)
    where
        F: FnOnce(&mut Step),
    {
        if let Some(task) = self.tasks.write().await.get_mut(&task_id) {
            if let Some(step) = task.steps.iter_mut().find(|s| s.id == step_id) {
                f(step);
            }
        }
    }

    /// Store a checkpoint record.
    pub async fn put_checkpoint(&self, checkpoint: Checkpoint) {
        let key = checkpoint_key(checkpoint.task_id, &checkpoint.step_id);
        self.checkpoints.write().await.insert(key, checkpoint);
    }

    /// Fetch a checkpoint record.
    pub async fn get_checkpoint(&self, task_id: Uuid, step_id: &str) -> Option<Checkpoint> {
        self.checkpoints
            .read()
            .await
            .get(&checkpoint_key(task_id, step_id))
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use tentackl_db::models::{
        CheckpointDecision, CheckpointKind, FailurePolicy, StepStatus,
    };

    fn sample_task() -> Task {
        let id = Uuid::new_v4();
        Task {
            id,
            goal: "g".into(),
            user_id: "u".into(),
            organization_id: None,
            status: TaskStatus::Ready,
            constraints: json!({}),
            success_criteria: json!({}),
            max_parallel_steps: 5,
            metadata: json!({"a": 1}),
            tree_id: None,
            parent_task_id: None,
            superseded_by: None,
            version: 1,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            completed_at: None,
            steps: vec![Step {
                task_id: id,
                id: "step_1".into(),
                name: "s".into(),
                description: String::new(),
                agent_type: "compose".into(),
                domain: None,
                inputs: json!({}),
                outputs: json!({}),
                dependencies: vec![],
                status: StepStatus::Pending,
                parallel_group: None,
                failure_policy: FailurePolicy::AllOrNothing,
                checkpoint_required: false,
                checkpoint_config: None,
                fallback_config: None,
                is_critical: true,
                retry_count: 0,
                max_retries: 3,
                error_message: None,
                started_at: None,
                completed_at: None,
                execution_time_ms: None,
                position: 0,
            }],
        }
    }

    #[tokio::test]
    async fn task_roundtrip_and_step_update() {
        let cache = TaskCache::new();
        let task = sample_task();
        let id = task.id;
        cache.put_task(task).await;

        cache
            .update_step(id, "step_1", |s| s.status = StepStatus::Done)
            .await;
        cache.set_task_status(id, TaskStatus::Executing).await;
        cache.merge_metadata(id, &json!({"b": 2})).await;

        let cached = cache.get_task(id).await.unwrap();
        assert_eq!(cached.status, TaskStatus::Executing);
        assert_eq!(cached.steps[0].status, StepStatus::Done);
        assert_eq!(cached.metadata["a"], json!(1));
        assert_eq!(cached.metadata["b"], json!(2));
    }

    #[tokio::test]
    async fn checkpoint_records_keyed_per_step() {
        let cache = TaskCache::new();
        let task_id = Uuid::new_v4();
        cache
            .put_checkpoint(Checkpoint {
                id: Uuid::new_v4(),
                task_id,
                step_id: "step_3".into(),
                name: "Approve send".into(),
                description: String::new(),
                kind: CheckpointKind::Approval,
                decision: CheckpointDecision::Pending,
                preview: None,
                questions: None,
                alternatives: None,
                feedback: None,
                resolved_by: None,
                preference_key: None,
                created_at: Utc::now(),
                expires_at: None,
                resolved_at: None,
            })
            .await;

        assert!(cache.get_checkpoint(task_id, "step_3").await.is_some());
        assert!(cache.get_checkpoint(task_id, "step_1").await.is_none());

        cache.remove_task(task_id).await;
        assert!(cache.get_checkpoint(task_id, "step_3").await.is_none());
    }
}
