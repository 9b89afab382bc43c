//! Trigger registration, webhook idempotency, and template cloning.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Value, json};

use tentackl_core::planner::intent::PlanningIntent;
use tentackl_core::ports::{
    ExecutionContext, ExecutionOutcome, FastPathPlan, FastPathPlanner, IntentDetector,
    PluginExecutor, ReplanContext, ReplanPlan, StepDraft, TaskPlanner,
};
use tentackl_core::trigger::{DeliveryOutcome, EventGateway, WEBHOOK_PREFIX};
use tentackl_core::{RuntimeConfig, RuntimePorts, TaskRuntime};
use tentackl_db::models::{SourceAuthType, Step, StepStatus, Task, TaskStatus};
use tentackl_test_utils::{create_test_db, drop_test_db};

// ===========================================================================
// Mock ports
// ===========================================================================

struct NoIntent;

#[async_trait]
impl IntentDetector for NoIntent {
    async fn extract_intent(&self, _goal: &str) -> Result<Option<PlanningIntent>> {
        Ok(None)
    }
}

struct NoFastPath;

#[async_trait]
impl FastPathPlanner for NoFastPath {
    async fn try_fast_path(
        &self,
        _user_id: &str,
        _organization_id: Option<&str>,
        _goal: &str,
        _intent: Option<&PlanningIntent>,
    ) -> Result<Option<FastPathPlan>> {
        Ok(None)
    }
}

struct NoPlanner;

#[async_trait]
impl TaskPlanner for NoPlanner {
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
        anyhow::bail!("not used")
    }
}

struct EchoPlugin;

#[async_trait]
impl PluginExecutor for EchoPlugin {
    async fn execute(
        &self,
        step: &Step,
        _model: &str,
        _context: &ExecutionContext,
    ) -> Result<ExecutionOutcome> {
        Ok(ExecutionOutcome::ok(json!({"echo": step.inputs}), 1))
    }
}

// ===========================================================================
// Test harness
// ===========================================================================

struct Harness {
    pool: sqlx::PgPool,
    db_name: String,
    runtime: Arc<TaskRuntime>,
}

impl Harness {
    async fn new() -> Self {
        let (pool, db_name) = create_test_db().await;
        let ports = RuntimePorts {
            intent_detector: Arc::new(NoIntent),
            fast_path: Arc::new(NoFastPath),
            planner: Arc::new(NoPlanner),
            plugin: Arc::new(EchoPlugin),
            advisor: None,
            memory: None,
        };
        let runtime = TaskRuntime::new(
            pool.clone(),
            ports,
            RuntimeConfig {
                max_workers: 2,
                auto_start: false,
            },
        );
        Self {
            pool,
            db_name,
            runtime,
        }
    }

    /// Template task with a trigger metadata block and an event-templated
    /// step input.
    async fn seed_template(&self) -> Task {
        let mut ack = StepDraft::new("step_1", "acknowledge", "transform");
        ack.inputs = json!({"message": "new issue: ${trigger_event.payload.title}"});

        self.runtime
            .create_task_with_steps(
                "user_1",
                Some("org_1"),
                "acknowledge new issues",
                vec![ack],
                None,
                Some(json!({
                    "trigger": {
                        "event_pattern": "external.webhook.issue.*",
                        "source_filter": "tracker",
                        "scope": "org",
                    }
                })),
            )
            .await
            .unwrap()
    }

    async fn teardown(self) {
        self.runtime.shutdown().await;
        self.pool.close().await;
        drop_test_db(&self.db_name).await;
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[tokio::test]
async fn trigger_registered_from_metadata_and_unregistered_on_cancel() {
    let harness = Harness::new().await;
    let template = harness.seed_template().await;

    let trigger = harness
        .runtime
        .triggers()
        .get(template.id)
        .await
        .unwrap()
        .expect("trigger should be registered");
    assert_eq!(trigger.event_pattern, "external.webhook.issue.*");
    assert_eq!(trigger.source_filter.as_deref(), Some("tracker"));

    harness
        .runtime
        .cancel_task(template.id, "user_1")
        .await
        .unwrap();
    assert!(
        harness
            .runtime
            .triggers()
            .get(template.id)
            .await
            .unwrap()
            .is_none()
    );

    harness.teardown().await;
}

#[tokio::test]
async fn clone_substitutes_event_data_and_strips_trigger() {
    let harness = Harness::new().await;
    let template = harness.seed_template().await;

    let event = json!({
        "type": "external.webhook.issue.created",
        "payload": {"title": "pipeline is red"},
    });
    let clone = harness
        .runtime
        .clone_task_for_trigger(template.id, &event)
        .await
        .unwrap();

    assert_ne!(clone.id, template.id);
    assert_eq!(clone.status, TaskStatus::Ready);
    assert!(clone.tree_id.is_some());
    assert!(clone.metadata.get("trigger").is_none());
    assert_eq!(
        clone.metadata["template_task_id"],
        json!(template.id.to_string())
    );
    assert_eq!(clone.metadata["source"], json!("trigger"));

    let step = clone.step("step_1").unwrap();
    assert_eq!(step.status, StepStatus::Pending);
    assert_eq!(
        step.inputs["message"],
        json!("new issue: pipeline is red")
    );

    harness.teardown().await;
}

#[tokio::test]
async fn matching_event_produces_exactly_one_clone() {
    let harness = Harness::new().await;
    let template = harness.seed_template().await;

    let gateway = EventGateway::new(harness.pool.clone());
    let source = gateway
        .register_source("org_1", "tracker", SourceAuthType::ApiKey, "s3cret")
        .await
        .unwrap();

    let body = br#"{"type":"issue.created","data":{"payload":{"title":"t"}}}"#;
    let authenticated = gateway
        .authenticate_source(source.id, Some("s3cret"), None, body)
        .await
        .unwrap();

    let (outcome, event) = gateway
        .validate_event(
            &authenticated,
            "issue.created",
            body,
            json!({"payload": {"title": "t"}}),
            None,
        )
        .await
        .unwrap();
    assert_eq!(outcome, DeliveryOutcome::Accepted);
    assert_eq!(event.event_type, format!("{WEBHOOK_PREFIX}issue.created"));

    let cloned = harness
        .runtime
        .process_external_event(&event, "tracker")
        .await
        .unwrap();
    assert_eq!(cloned.len(), 1);
    assert_ne!(cloned[0], template.id);

    // Redelivery of the same body inside the TTL is a duplicate.
    let (outcome, _) = gateway
        .validate_event(
            &authenticated,
            "issue.created",
            body,
            json!({"payload": {"title": "t"}}),
            None,
        )
        .await
        .unwrap();
    assert_eq!(outcome, DeliveryOutcome::Duplicate);

    harness.teardown().await;
}

#[tokio::test]
async fn wrong_credentials_are_rejected() {
    let harness = Harness::new().await;
    let gateway = EventGateway::new(harness.pool.clone());
    let source = gateway
        .register_source("org_1", "tracker", SourceAuthType::Bearer, "token-1")
        .await
        .unwrap();

    let err = gateway
        .authenticate_source(source.id, Some("token-2"), None, b"{}")
        .await;
    assert!(matches!(err, Err(tentackl_core::CoreError::Forbidden(_))));

    let err = gateway.authenticate_source(source.id, None, None, b"{}").await;
    assert!(err.is_err());

    harness.teardown().await;
}

#[tokio::test]
async fn non_matching_events_clone_nothing() {
    let harness = Harness::new().await;
    harness.seed_template().await;

    let gateway = EventGateway::new(harness.pool.clone());
    let source = gateway
        .register_source("org_1", "tracker", SourceAuthType::ApiKey, "s3cret")
        .await
        .unwrap();
    let authenticated = gateway
        .authenticate_source(source.id, Some("s3cret"), None, b"{}")
        .await
        .unwrap();

    // Pattern matches issue.* only.
    let (_, event) = gateway
        .validate_event(&authenticated, "deploy.finished", b"{}", json!({}), None)
        .await
        .unwrap();
    let cloned = harness
        .runtime
        .process_external_event(&event, "tracker")
        .await
        .unwrap();
    assert!(cloned.is_empty());

    // Matching pattern but wrong source filter.
    let (_, event) = gateway
        .validate_event(&authenticated, "issue.created", b"{2}", json!({}), None)
        .await
        .unwrap();
    let cloned = harness
        .runtime
        .process_external_event(&event, "other-source")
        .await
        .unwrap();
    assert!(cloned.is_empty());

    harness.teardown().await;
}
