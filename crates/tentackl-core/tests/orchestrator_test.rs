//! Orchestrator cycle tests: linear advancement, parallel groups with
//! failure policies, observer recovery, and replan supersession.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Value, json};

use tentackl_core::cache::TaskCache;
use tentackl_core::events::EventBus;
use tentackl_core::observer::Observer;
use tentackl_core::orchestrator::{CycleResult, Orchestrator};
use tentackl_core::ports::{
    ExecutionContext, ExecutionOutcome, PluginExecutor, ReplanContext, ReplanPlan, StepDraft,
    TaskPlanner,
};
use tentackl_core::tree::TreeStore;
use tentackl_db::models::{
    FailurePolicy, Step, StepStatus, Task, TaskStatus,
};
use tentackl_db::queries::{steps as step_db, tasks as task_db};
use tentackl_test_utils::{create_test_db, drop_test_db};

// ===========================================================================
// Mock ports
// ===========================================================================

/// Plugin that answers per step id: success with outputs, or an error.
struct ScriptedPlugin {
    outcomes: HashMap<String, std::result::Result<Value, String>>,
}

impl ScriptedPlugin {
    fn new() -> Self {
        Self {
            outcomes: HashMap::new(),
        }
    }

    fn ok(mut self, step_id: &str, outputs: Value) -> Self {
        self.outcomes.insert(step_id.to_string(), Ok(outputs));
        self
    }

    fn fail(mut self, step_id: &str, error: &str) -> Self {
        self.outcomes
            .insert(step_id.to_string(), Err(error.to_string()));
        self
    }
}

#[async_trait]
impl PluginExecutor for ScriptedPlugin {
    async fn execute(
        &self,
        step: &Step,
        _model: &str,
        _context: &ExecutionContext,
    ) -> Result<ExecutionOutcome> {
        match self.outcomes.get(&step.id) {
            Some(Ok(outputs)) => Ok(ExecutionOutcome::ok(outputs.clone(), 5)),
            Some(Err(error)) => Ok(ExecutionOutcome::err(error.clone())),
            None => Ok(ExecutionOutcome::err(format!(
                "Unknown subagent type: {}",
                step.agent_type
            ))),
        }
    }
}

/// Planner whose replan entry emits a fixed corrected plan.
struct ReplanPlanner {
    steps: Vec<StepDraft>,
}

#[async_trait]
impl TaskPlanner for ReplanPlanner {
    async fn generate_delegation_steps(
        &self,
        _goal: &str,
        _constraints: &Value,
        _skip_validation: bool,
    ) -> Result<Vec<StepDraft>> {
        anyhow::bail!("not used")
    }

    async fn replan(
        &self,
        _task: &Task,
        _failed_step: &Step,
        _context: &ReplanContext,
    ) -> Result<ReplanPlan> {
        Ok(ReplanPlan {
            goal: None,
            steps: self.steps.clone(),
        })
    }
}

// ===========================================================================
// Test harness
// ===========================================================================

struct Harness {
    pool: sqlx::PgPool,
    db_name: String,
    cache: Arc<TaskCache>,
    tree: Arc<TreeStore>,
}

impl Harness {
    async fn new() -> Self {
        let (pool, db_name) = create_test_db().await;
        Self {
            pool,
            db_name,
            cache: Arc::new(TaskCache::new()),
            tree: Arc::new(TreeStore::new()),
        }
    }

    fn orchestrator(&self, plugin: ScriptedPlugin, replan_steps: Vec<StepDraft>) -> Orchestrator {
        Orchestrator::new(
            self.pool.clone(),
            Arc::clone(&self.cache),
            Arc::clone(&self.tree),
            Arc::new(EventBus::new()),
            Arc::new(Observer::new(None)),
            Arc::new(ReplanPlanner {
                steps: replan_steps,
            }),
            Arc::new(plugin),
            None,
        )
    }

    /// Insert a READY task with steps and build its tree.
    async fn seed_task(&self, steps: Vec<Step>) -> uuid::Uuid {
        let task = task_db::insert_task(
            &self.pool,
            &task_db::NewTask::planning("test goal", "user_1", Some("org_1")),
        )
        .await
        .unwrap();

        let mut tx = self.pool.begin().await.unwrap();
        for (i, mut step) in steps.into_iter().enumerate() {
            step.task_id = task.id;
            step.position = i as i32;
            step_db::insert_step_tx(&mut tx, &step).await.unwrap();
        }
        tx.commit().await.unwrap();

        task_db::transition_task_status(&self.pool, task.id, TaskStatus::Planning, TaskStatus::Ready)
            .await
            .unwrap();

        let full = task_db::get_task_with_steps(&self.pool, task.id)
            .await
            .unwrap()
            .unwrap();
        let tree_id = self.tree.create_tree(&full).await;
        task_db::set_tree_id(&self.pool, task.id, tree_id).await.unwrap();
        self.cache.put_task(full).await;
        task.id
    }

    async fn teardown(self) {
        self.pool.close().await;
        drop_test_db(&self.db_name).await;
    }
}

fn step(id: &str, agent_type: &str, deps: &[&str]) -> Step {
    Step {
        task_id: uuid::Uuid::nil(),
        id: id.to_string(),
        name: id.to_string(),
        description: String::new(),
        agent_type: agent_type.to_string(),
        domain: None,
        inputs: json!({}),
        outputs: json!({}),
        dependencies: deps.iter().map(|d| d.to_string()).collect(),
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

// ===========================================================================
// Tests
// ===========================================================================

#[tokio::test]
async fn linear_plan_advances_one_step_per_cycle() {
    let harness = Harness::new().await;
    let task_id = harness
        .seed_task(vec![
            step("step_1", "http_fetch", &[]),
            step("step_2", "summarize", &["step_1"]),
        ])
        .await;

    let plugin = ScriptedPlugin::new()
        .ok("step_1", json!({"body": "page content"}))
        .ok("step_2", json!({"summary": "short"}));
    let orchestrator = harness.orchestrator(plugin, vec![]);

    let first = orchestrator.execute_cycle(task_id).await.unwrap();
    match first {
        CycleResult::StepCompleted { step_id, .. } => assert_eq!(step_id, "step_1"),
        other => panic!("expected step_completed, got {}", other.tag()),
    }

    // Single-advance: step_2 only runs in the next cycle.
    let cached = harness.cache.get_task(task_id).await.unwrap();
    assert_eq!(cached.step("step_2").unwrap().status, StepStatus::Pending);

    let second = orchestrator.execute_cycle(task_id).await.unwrap();
    assert_eq!(second.tag(), "step_completed");

    let third = orchestrator.execute_cycle(task_id).await.unwrap();
    assert_eq!(third.tag(), "completed");

    let final_task = task_db::get_task(&harness.pool, task_id).await.unwrap().unwrap();
    assert_eq!(final_task.status, TaskStatus::Completed);

    harness.teardown().await;
}

#[tokio::test]
async fn template_resolution_feeds_dependent_steps() {
    let harness = Harness::new().await;
    let mut consumer = step("step_2", "summarize", &["step_1"]);
    consumer.inputs = json!({"text": "{{step_1.outputs.body}}"});
    let task_id = harness
        .seed_task(vec![step("step_1", "http_fetch", &[]), consumer])
        .await;

    let plugin = ScriptedPlugin::new()
        .ok("step_1", json!({"body": "the page"}))
        .ok("step_2", json!({"summary": "ok"}));
    let orchestrator = harness.orchestrator(plugin, vec![]);

    orchestrator.execute_cycle(task_id).await.unwrap();
    let result = orchestrator.execute_cycle(task_id).await.unwrap();
    assert_eq!(result.tag(), "step_completed");

    // The resolved value landed in the dependant's execution; stored inputs
    // keep the template for audit.
    let stored = step_db::get_step(&harness.pool, task_id, "step_2")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, StepStatus::Done);
    assert_eq!(stored.inputs["text"], json!("{{step_1.outputs.body}}"));

    harness.teardown().await;
}

#[tokio::test]
async fn best_effort_group_reports_partial_failure() {
    let harness = Harness::new().await;
    let mut a = step("a", "web_research", &[]);
    a.parallel_group = Some("fetch".to_string());
    a.failure_policy = FailurePolicy::BestEffort;
    let mut b = step("b", "web_research", &[]);
    b.parallel_group = Some("fetch".to_string());
    b.failure_policy = FailurePolicy::BestEffort;
    let mut c = step("c", "web_research", &[]);
    c.parallel_group = Some("fetch".to_string());
    c.failure_policy = FailurePolicy::BestEffort;

    let task_id = harness.seed_task(vec![a, b, c]).await;

    let plugin = ScriptedPlugin::new()
        .ok("a", json!({"findings": "A"}))
        .fail("b", "fetch timeout")
        .ok("c", json!({"findings": "C"}));
    let orchestrator = harness.orchestrator(plugin, vec![]);

    let result = orchestrator.execute_cycle(task_id).await.unwrap();
    match result {
        CycleResult::GroupCompleted {
            outputs,
            partial_failure,
            ..
        } => {
            assert!(partial_failure);
            assert_eq!(outputs["a"], json!({"findings": "A"}));
            assert_eq!(outputs["c"], json!({"findings": "C"}));
        }
        other => panic!("expected group_completed, got {}", other.tag()),
    }

    // Member statuses persisted individually.
    let b_row = step_db::get_step(&harness.pool, task_id, "b").await.unwrap().unwrap();
    assert_eq!(b_row.status, StepStatus::Failed);
    assert!(b_row.error_message.unwrap().contains("fetch timeout"));

    harness.teardown().await;
}

#[tokio::test]
async fn all_or_nothing_group_fails_on_any_member() {
    let harness = Harness::new().await;
    let mut a = step("a", "web_research", &[]);
    a.parallel_group = Some("g".to_string());
    let mut b = step("b", "web_research", &[]);
    b.parallel_group = Some("g".to_string());
    let task_id = harness.seed_task(vec![a, b]).await;

    let plugin = ScriptedPlugin::new()
        .ok("a", json!({"findings": "A"}))
        .fail("b", "upstream 500");
    let orchestrator = harness.orchestrator(plugin, vec![]);

    let result = orchestrator.execute_cycle(task_id).await.unwrap();
    match result {
        CycleResult::GroupFailed {
            failed_step_ids,
            failure_policy,
            ..
        } => {
            assert_eq!(failed_step_ids, vec!["b".to_string()]);
            assert_eq!(failure_policy, FailurePolicy::AllOrNothing);
        }
        other => panic!("expected group_failed, got {}", other.tag()),
    }

    harness.teardown().await;
}

#[tokio::test]
async fn template_syntax_error_triggers_observer_modify() {
    let harness = Harness::new().await;
    let mut research = step("step_1", "web_research", &[]);
    research.status = StepStatus::Done;
    research.outputs = json!({"findings": "facts"});
    let mut summary = step("step_2", "summarize", &["step_1"]);
    summary.inputs = json!({"summary": "{{step_1.output}}"});

    let task_id = harness.seed_task(vec![research, summary]).await;

    let plugin = ScriptedPlugin::new().ok("step_2", json!({"summary": "ok"}));
    let orchestrator = harness.orchestrator(plugin, vec![]);

    // Cycle 1: the pre-resolution validator rejects the inputs before any
    // plugin call; the observer fixes them deterministically.
    let result = orchestrator.execute_cycle(task_id).await.unwrap();
    match result {
        CycleResult::StepModified { step_id } => assert_eq!(step_id, "step_2"),
        other => panic!("expected step_modified, got {}", other.tag()),
    }

    let fixed = step_db::get_step(&harness.pool, task_id, "step_2")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(fixed.status, StepStatus::Pending);
    assert_eq!(fixed.inputs["summary"], json!("{{step_1.outputs.findings}}"));

    // Cycle 2: the fixed step executes cleanly.
    let result = orchestrator.execute_cycle(task_id).await.unwrap();
    assert_eq!(result.tag(), "step_completed");

    harness.teardown().await;
}

#[tokio::test]
async fn skip_non_critical_failed_step() {
    let harness = Harness::new().await;
    let mut optional = step("step_1", "notify", &[]);
    optional.is_critical = false;
    optional.max_retries = 0;
    let task_id = harness.seed_task(vec![optional]).await;

    let plugin = ScriptedPlugin::new().fail("step_1", "SMTP permanently unavailable");
    let orchestrator = harness.orchestrator(plugin, vec![]);

    let result = orchestrator.execute_cycle(task_id).await.unwrap();
    assert_eq!(result.tag(), "step_skipped");

    // Skipped steps count as terminal success for completion.
    let result = orchestrator.execute_cycle(task_id).await.unwrap();
    assert_eq!(result.tag(), "completed");

    harness.teardown().await;
}

#[tokio::test]
async fn invalid_agent_type_replans_and_supersedes() {
    let harness = Harness::new().await;
    let bad = step("step_1", "marketing_strategist", &[]);
    let task_id = harness.seed_task(vec![bad]).await;

    let mut corrected = StepDraft::new("step_1", "write strategy", "compose");
    corrected.inputs = json!({"topic": "strategy"});
    let plugin = ScriptedPlugin::new(); // unknown agent -> error outcome
    let orchestrator = harness.orchestrator(plugin, vec![corrected]);

    // Cycle 1: failure -> observer proposes REPLAN -> replan checkpoint.
    let result = orchestrator.execute_cycle(task_id).await.unwrap();
    match &result {
        CycleResult::ReplanCheckpoint(info) => {
            assert_eq!(info.step_id, "step_1");
            assert_eq!(info.name, "replan_approval");
            assert!(
                info.preview["diagnosis"]
                    .as_str()
                    .unwrap()
                    .contains("compose")
            );
        }
        other => panic!("expected replan_checkpoint, got {}", other.tag()),
    }

    let parked = step_db::get_step(&harness.pool, task_id, "step_1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(parked.status, StepStatus::Checkpoint);
    assert!(parked.inputs.get("_replan_context").is_some());

    // Approval path: execute the replan.
    let result = orchestrator.execute_replan(task_id, "step_1").await.unwrap();
    let new_task_id = match result {
        CycleResult::ReplanComplete {
            new_task_id,
            new_version,
        } => {
            assert_eq!(new_version, 2);
            new_task_id
        }
        other => panic!("expected replan_complete, got {}", other.tag()),
    };

    // Original superseded and linked; successor ready with a fresh tree.
    let original = task_db::get_task(&harness.pool, task_id).await.unwrap().unwrap();
    assert_eq!(original.status, TaskStatus::Superseded);
    assert_eq!(original.superseded_by, Some(new_task_id));

    let successor = task_db::get_task_with_steps(&harness.pool, new_task_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(successor.status, TaskStatus::Ready);
    assert_eq!(successor.version, 2);
    assert!(successor.tree_id.is_some());
    assert_eq!(successor.steps[0].agent_type, "compose");

    harness.teardown().await;
}

#[tokio::test]
async fn terminal_task_cycles_are_no_ops() {
    let harness = Harness::new().await;
    let task_id = harness.seed_task(vec![step("step_1", "compose", &[])]).await;
    task_db::set_task_status(&harness.pool, task_id, TaskStatus::Cancelled)
        .await
        .unwrap();
    harness.cache.set_task_status(task_id, TaskStatus::Cancelled).await;

    let orchestrator = harness.orchestrator(ScriptedPlugin::new(), vec![]);
    let result = orchestrator.execute_cycle(task_id).await.unwrap();
    match result {
        CycleResult::AlreadyTerminal(status) => assert_eq!(status, TaskStatus::Cancelled),
        other => panic!("expected already_terminal, got {}", other.tag()),
    }

    harness.teardown().await;
}
