//! Step-execution lifecycle tests: store sync order effects, transient
//! retries, checkpoint parking, and failure finalization.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::mpsc;

use tentackl_core::cache::TaskCache;
use tentackl_core::checkpoint::{CheckpointManager, PreferenceService};
use tentackl_core::events::EventBus;
use tentackl_core::inbox::InboxService;
use tentackl_core::ports::{ExecutionContext, ExecutionOutcome, PluginExecutor};
use tentackl_core::scheduler::Scheduler;
use tentackl_core::stepexec::{StepDispatch, StepExecStatus, StepExecutor};
use tentackl_core::tree::TreeStore;
use tentackl_db::models::{
    CheckpointDecision, FailurePolicy, Step, StepStatus, TaskStatus,
};
use tentackl_db::queries::{steps as step_db, tasks as task_db};
use tentackl_test_utils::{create_test_db, drop_test_db};

struct FixedPlugin {
    outcome: std::result::Result<Value, String>,
}

#[async_trait]
impl PluginExecutor for FixedPlugin {
    async fn execute(
        &self,
        _step: &Step,
        _model: &str,
        _context: &ExecutionContext,
    ) -> Result<ExecutionOutcome> {
        match &self.outcome {
            Ok(outputs) => Ok(ExecutionOutcome::ok(outputs.clone(), 7)),
            Err(error) => Ok(ExecutionOutcome::err(error.clone())),
        }
    }
}

struct Harness {
    pool: sqlx::PgPool,
    db_name: String,
    cache: Arc<TaskCache>,
    tree: Arc<TreeStore>,
    events: Arc<EventBus>,
}

impl Harness {
    async fn new() -> Self {
        let (pool, db_name) = create_test_db().await;
        Self {
            pool,
            db_name,
            cache: Arc::new(TaskCache::new()),
            tree: Arc::new(TreeStore::new()),
            events: Arc::new(EventBus::new()),
        }
    }

    fn executor(&self, plugin: FixedPlugin) -> StepExecutor {
        let preferences = Arc::new(PreferenceService::new(self.pool.clone()));
        let checkpoints = Arc::new(CheckpointManager::new(
            self.pool.clone(),
            Arc::clone(&self.cache),
            Arc::clone(&self.tree),
            preferences,
        ));
        let (queue_tx, _queue_rx) = mpsc::unbounded_channel();
        let scheduler = Arc::new(Scheduler::new(
            self.pool.clone(),
            Arc::clone(&self.cache),
            Arc::clone(&self.tree),
            queue_tx,
        ));
        StepExecutor::new(
            self.pool.clone(),
            Arc::clone(&self.cache),
            Arc::clone(&self.tree),
            Arc::clone(&self.events),
            Arc::new(InboxService::new(self.pool.clone())),
            checkpoints,
            scheduler,
            Arc::new(plugin),
        )
    }

    async fn seed_single_step_task(&self, step: Step) -> (uuid::Uuid, Step) {
        let task = task_db::insert_task(
            &self.pool,
            &task_db::NewTask::planning("goal", "user_1", Some("org_1")),
        )
        .await
        .unwrap();

        let mut row = step;
        row.task_id = task.id;
        let mut tx = self.pool.begin().await.unwrap();
        step_db::insert_step_tx(&mut tx, &row).await.unwrap();
        tx.commit().await.unwrap();

        task_db::transition_task_status(&self.pool, task.id, TaskStatus::Planning, TaskStatus::Ready)
            .await
            .unwrap();
        task_db::transition_task_status(&self.pool, task.id, TaskStatus::Ready, TaskStatus::Executing)
            .await
            .unwrap();

        let full = task_db::get_task_with_steps(&self.pool, task.id)
            .await
            .unwrap()
            .unwrap();
        self.tree.create_tree(&full).await;
        self.cache.put_task(full.clone()).await;
        (task.id, full.steps[0].clone())
    }

    async fn teardown(self) {
        self.pool.close().await;
        drop_test_db(&self.db_name).await;
    }
}

fn pending_step(id: &str, agent_type: &str) -> Step {
    Step {
        task_id: uuid::Uuid::nil(),
        id: id.to_string(),
        name: id.to_string(),
        description: "does a thing".to_string(),
        agent_type: agent_type.to_string(),
        domain: None,
        inputs: json!({"key": "value"}),
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
    }
}

#[tokio::test]
async fn success_syncs_tree_store_and_cache() {
    let harness = Harness::new().await;
    let (task_id, step) = harness.seed_single_step_task(pending_step("step_1", "compose")).await;
    let executor = harness.executor(FixedPlugin {
        outcome: Ok(json!({"content": "written"})),
    });
    let mut events = harness.events.subscribe(task_id).await;

    let result = executor
        .execute(StepDispatch {
            task_id,
            step,
            user_id: "user_1".to_string(),
            model: None,
        })
        .await
        .unwrap();
    assert_eq!(result.status, StepExecStatus::Success);

    // All three stores agree on the terminal step status.
    let row = step_db::get_step(&harness.pool, task_id, "step_1").await.unwrap().unwrap();
    assert_eq!(row.status, StepStatus::Done);
    assert_eq!(row.outputs, json!({"content": "written"}));
    assert_eq!(row.execution_time_ms, Some(7));

    let cached = harness.cache.get_task(task_id).await.unwrap();
    assert_eq!(cached.step("step_1").unwrap().status, StepStatus::Done);

    let (complete, _) = harness.tree.is_task_complete(task_id).await.unwrap();
    assert!(complete);

    // Single-step task finalizes as completed.
    let task = task_db::get_task(&harness.pool, task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Completed);

    // Event order: step_completed before task_completed.
    let first = events.recv().await.unwrap();
    assert_eq!(first.event_type, "task.step_completed");
    let second = events.recv().await.unwrap();
    assert_eq!(second.event_type, "task.task_completed");

    harness.teardown().await;
}

#[tokio::test]
async fn transient_error_recycles_as_retry() {
    let harness = Harness::new().await;
    let (task_id, step) = harness
        .seed_single_step_task(pending_step("step_1", "http_fetch"))
        .await;
    let executor = harness.executor(FixedPlugin {
        outcome: Err("upstream 503, try again".to_string()),
    });

    let result = executor
        .execute(StepDispatch {
            task_id,
            step,
            user_id: "user_1".to_string(),
            model: None,
        })
        .await
        .unwrap();

    assert_eq!(result.status, StepExecStatus::Retrying);
    let retry = result.retry_dispatch.expect("retry payload");
    assert_eq!(retry.step.retry_count, 1);

    let row = step_db::get_step(&harness.pool, task_id, "step_1").await.unwrap().unwrap();
    assert_eq!(row.status, StepStatus::Pending);
    assert_eq!(row.retry_count, 1);
    assert!(row.error_message.unwrap().starts_with("Retry 1/3:"));

    // The task is still executing; nothing finalized.
    let task = task_db::get_task(&harness.pool, task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Executing);

    harness.teardown().await;
}

#[tokio::test]
async fn non_transient_error_fails_step_and_task() {
    let harness = Harness::new().await;
    let (task_id, step) = harness
        .seed_single_step_task(pending_step("step_1", "compose"))
        .await;
    let executor = harness.executor(FixedPlugin {
        outcome: Err("invalid credentials".to_string()),
    });

    let result = executor
        .execute(StepDispatch {
            task_id,
            step,
            user_id: "user_1".to_string(),
            model: None,
        })
        .await
        .unwrap();
    assert_eq!(result.status, StepExecStatus::Error);

    let row = step_db::get_step(&harness.pool, task_id, "step_1").await.unwrap().unwrap();
    assert_eq!(row.status, StepStatus::Failed);

    // Whole tree failed -> task finalized as failed.
    let task = task_db::get_task(&harness.pool, task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Failed);

    harness.teardown().await;
}

#[tokio::test]
async fn retry_budget_exhaustion_stops_recycling() {
    let harness = Harness::new().await;
    let mut step = pending_step("step_1", "http_fetch");
    step.retry_count = 3; // budget already spent
    let (task_id, step) = harness.seed_single_step_task(step).await;
    let executor = harness.executor(FixedPlugin {
        outcome: Err("timeout".to_string()),
    });

    let result = executor
        .execute(StepDispatch {
            task_id,
            step,
            user_id: "user_1".to_string(),
            model: None,
        })
        .await
        .unwrap();

    // Transient text, but no budget left: permanent failure.
    assert_eq!(result.status, StepExecStatus::Error);

    harness.teardown().await;
}

#[tokio::test]
async fn checkpoint_gate_parks_step_before_plugin_runs() {
    let harness = Harness::new().await;
    let mut gated = pending_step("step_1", "notify");
    gated.checkpoint_required = true;
    let (task_id, step) = harness.seed_single_step_task(gated).await;

    // A plugin error would surface if execution reached it.
    let executor = harness.executor(FixedPlugin {
        outcome: Err("must never run".to_string()),
    });

    let result = executor
        .execute(StepDispatch {
            task_id,
            step,
            user_id: "user_1".to_string(),
            model: None,
        })
        .await
        .unwrap();
    assert_eq!(result.status, StepExecStatus::Checkpoint);

    let row = step_db::get_step(&harness.pool, task_id, "step_1").await.unwrap().unwrap();
    assert_eq!(row.status, StepStatus::Checkpoint);

    let task = task_db::get_task(&harness.pool, task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Checkpoint);

    let checkpoint = tentackl_db::queries::checkpoints::get_checkpoint(
        &harness.pool,
        task_id,
        "step_1",
    )
    .await
    .unwrap()
    .expect("checkpoint record should exist");
    assert_eq!(checkpoint.decision, CheckpointDecision::Pending);

    harness.teardown().await;
}
