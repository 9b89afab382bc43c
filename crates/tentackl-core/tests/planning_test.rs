//! Planning pipeline tests: fast path, LLM decomposition with retries,
//! risk injection, cancellation, and failure recording.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use tentackl_core::cache::TaskCache;
use tentackl_core::error::CoreError;
use tentackl_core::events::EventBus;
use tentackl_core::planner::intent::PlanningIntent;
use tentackl_core::planner::{PlanRequest, PlanningPipeline};
use tentackl_core::ports::{
    FastPathPlan, FastPathPlanner, IntentDetector, ReplanContext, ReplanPlan, StepDraft,
    TaskPlanner,
};
use tentackl_core::tree::TreeStore;
use tentackl_db::models::{StepStatus, Task, TaskStatus};
use tentackl_db::queries::{automations, tasks as task_db};
use tentackl_test_utils::{create_test_db, drop_test_db};

// ===========================================================================
// Mock ports
// ===========================================================================

struct MockIntent {
    intent: Option<PlanningIntent>,
}

#[async_trait]
impl IntentDetector for MockIntent {
    async fn extract_intent(&self, _goal: &str) -> Result<Option<PlanningIntent>> {
        Ok(self.intent.clone())
    }
}

struct MockFastPath {
    plan: Option<FastPathPlan>,
}

#[async_trait]
impl FastPathPlanner for MockFastPath {
    async fn try_fast_path(
        &self,
        _user_id: &str,
        _organization_id: Option<&str>,
        _goal: &str,
        _intent: Option<&PlanningIntent>,
    ) -> Result<Option<FastPathPlan>> {
        Ok(self.plan.clone())
    }
}

struct MockPlanner {
    /// Steps returned on the nth successful call; earlier calls fail.
    fail_attempts: usize,
    steps: Vec<StepDraft>,
    calls: AtomicUsize,
}

impl MockPlanner {
    fn succeeding_with(steps: Vec<StepDraft>) -> Self {
        Self {
            fail_attempts: 0,
            steps,
            calls: AtomicUsize::new(0),
        }
    }

    fn always_failing() -> Self {
        Self {
            fail_attempts: usize::MAX,
            steps: Vec::new(),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl TaskPlanner for MockPlanner {
    async fn generate_delegation_steps(
        &self,
        _goal: &str,
        _constraints: &Value,
        _skip_validation: bool,
    ) -> Result<Vec<StepDraft>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.fail_attempts {
            anyhow::bail!("planner transient failure");
        }
        Ok(self.steps.clone())
    }

    async fn replan(
        &self,
        _task: &Task,
        _failed_step: &tentackl_db::models::Step,
        _context: &ReplanContext,
    ) -> Result<ReplanPlan> {
        anyhow::bail!("replan not used in planning tests")
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

    fn pipeline(
        &self,
        intent: Option<PlanningIntent>,
        fast_path: Option<FastPathPlan>,
        planner: MockPlanner,
    ) -> (PlanningPipeline, Arc<MockPlanner>) {
        let planner = Arc::new(planner);
        let pipeline = PlanningPipeline::new(
            self.pool.clone(),
            Arc::clone(&self.cache),
            Arc::clone(&self.tree),
            Arc::clone(&self.events),
            Arc::new(MockIntent { intent }),
            Arc::new(MockFastPath { plan: fast_path }),
            Arc::clone(&planner) as Arc<dyn TaskPlanner>,
        );
        (pipeline, planner)
    }

    async fn create_planning_task(&self, goal: &str) -> uuid::Uuid {
        task_db::insert_task(
            &self.pool,
            &task_db::NewTask::planning(goal, "user_1", Some("org_1")),
        )
        .await
        .unwrap()
        .id
    }

    fn request(&self, task_id: uuid::Uuid, goal: &str) -> PlanRequest {
        PlanRequest {
            task_id,
            user_id: "user_1".to_string(),
            organization_id: Some("org_1".to_string()),
            goal: goal.to_string(),
            constraints: json!({}),
            metadata: json!({}),
            skip_validation: false,
        }
    }

    async fn teardown(self) {
        self.pool.close().await;
        drop_test_db(&self.db_name).await;
    }
}

fn three_step_plan() -> Vec<StepDraft> {
    let mut fetch = StepDraft::new("step_1", "fetch_page", "http_fetch");
    fetch.inputs = json!({"url": "https://example.com"});
    let mut summarize = StepDraft::new("step_2", "summarize_page", "summarize");
    summarize.dependencies = vec!["step_1".to_string()];
    summarize.inputs = json!({"text": "{{step_1.outputs.body}}"});
    let mut email = StepDraft::new("step_3", "email result", "notify");
    email.dependencies = vec!["step_2".to_string()];
    email.inputs = json!({"to": "me@example.com", "body": "{{step_2.outputs.summary}}"});
    vec![fetch, summarize, email]
}

// ===========================================================================
// Tests
// ===========================================================================

#[tokio::test]
async fn llm_plan_commits_with_risk_checkpoint() {
    let harness = Harness::new().await;
    let task_id = harness.create_planning_task("fetch, summarize, email").await;
    let (pipeline, _) = harness.pipeline(
        None,
        None,
        MockPlanner::succeeding_with(three_step_plan()),
    );

    let status = pipeline
        .plan_task(
            harness.request(task_id, "fetch, summarize, email"),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(status, TaskStatus::Ready);

    let task = task_db::get_task_with_steps(&harness.pool, task_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(task.status, TaskStatus::Ready);
    assert!(task.tree_id.is_some());
    assert_eq!(task.steps.len(), 3);

    // The email step was flagged by the risk detector.
    let email = task.step("step_3").unwrap();
    assert!(email.checkpoint_required);
    let config = email.checkpoint_config.as_ref().unwrap();
    assert_eq!(config.0.name, "Approve email result");

    // The tree exposes only the entry step.
    let ready = harness.tree.ready_nodes(task_id).await.unwrap();
    assert_eq!(ready, vec!["step_1".to_string()]);

    harness.teardown().await;
}

#[tokio::test]
async fn fast_path_completes_without_llm() {
    let harness = Harness::new().await;
    let task_id = harness.create_planning_task("list my open workflows").await;

    let mut step = StepDraft::new("step_1", "list_workflows", "document_db");
    step.outputs = json!({"workflows": [{"id": "wf_1"}]});
    let fast = FastPathPlan {
        steps: vec![step],
        metadata: json!({"fast_path": true, "data_query": {"type": "list_workflows"}}),
    };
    let (pipeline, planner) = harness.pipeline(None, Some(fast), MockPlanner::always_failing());

    let status = pipeline
        .plan_task(
            harness.request(task_id, "list my open workflows"),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(status, TaskStatus::Completed);

    // No LLM call was made.
    assert_eq!(planner.calls.load(Ordering::SeqCst), 0);

    let task = task_db::get_task_with_steps(&harness.pool, task_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.metadata["fast_path"], json!(true));
    assert!(!task.steps.is_empty());
    assert_eq!(task.steps[0].status, StepStatus::Done);

    harness.teardown().await;
}

#[tokio::test]
async fn exhausted_retries_fail_the_task_with_planning_error() {
    let harness = Harness::new().await;
    let task_id = harness.create_planning_task("impossible goal").await;
    let (pipeline, planner) = harness.pipeline(None, None, MockPlanner::always_failing());

    let status = pipeline
        .plan_task(
            harness.request(task_id, "impossible goal"),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(status, TaskStatus::Failed);
    assert_eq!(planner.calls.load(Ordering::SeqCst), 3);

    let task = task_db::get_task(&harness.pool, task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(
        task.metadata["planning_error"]
            .as_str()
            .unwrap()
            .contains("failed to generate plan steps")
    );

    harness.teardown().await;
}

#[tokio::test]
async fn cancellation_stops_before_any_commit() {
    let harness = Harness::new().await;
    let task_id = harness.create_planning_task("goal").await;
    let (pipeline, planner) = harness.pipeline(
        None,
        None,
        MockPlanner::succeeding_with(three_step_plan()),
    );

    let cancel = CancellationToken::new();
    cancel.cancel();

    let result = pipeline
        .plan_task(harness.request(task_id, "goal"), &cancel)
        .await;
    assert!(matches!(result, Err(CoreError::Cancelled(_))));

    // Nothing was committed after the cancellation was observed.
    assert_eq!(planner.calls.load(Ordering::SeqCst), 0);
    let task = task_db::get_task_with_steps(&harness.pool, task_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(task.status, TaskStatus::Planning);
    assert!(task.steps.is_empty());
    assert!(task.tree_id.is_none());

    harness.teardown().await;
}

#[tokio::test]
async fn schedule_intent_registers_automation() {
    let harness = Harness::new().await;
    let goal = "every monday at 9, send the weekly report to the team";
    let task_id = harness.create_planning_task(goal).await;

    let intent = PlanningIntent {
        has_schedule: true,
        schedule: Some(tentackl_core::planner::intent::ScheduleSpec {
            cron: Some("0 9 * * 1".to_string()),
            execute_at: None,
            execute_at_raw: None,
            timezone: "UTC".to_string(),
        }),
        one_shot_goal: Some("send the weekly report to the team".to_string()),
        fast_path: false,
        data_query: None,
    };

    let mut report = StepDraft::new("step_1", "compose report", "compose");
    report.inputs = json!({"topic": "weekly report"});
    let (pipeline, _) = harness.pipeline(
        Some(intent),
        None,
        MockPlanner::succeeding_with(vec![report]),
    );

    let status = pipeline
        .plan_task(harness.request(task_id, goal), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(status, TaskStatus::Ready);

    let automation = automations::get_automation_for_task(&harness.pool, task_id)
        .await
        .unwrap()
        .expect("automation should be registered");
    assert_eq!(automation.cron.as_deref(), Some("0 9 * * 1"));
    // The one-shot goal replaced the scheduled phrasing.
    assert_eq!(automation.goal, "send the weekly report to the team");

    harness.teardown().await;
}
