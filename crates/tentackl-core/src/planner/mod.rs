//! Planning pipeline.
//!
//! Intent detection, fast-path shortcut, LLM decomposition with retries,
//! risk-based checkpoint injection, parallel grouping, durable commit, and
//! schedule registration. Every phase boundary re-checks the cancellation
//! token; once cancellation is observed no further writes happen beyond
//! idempotent status clean-up.

pub mod grouping;
pub mod intent;
pub mod risk;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use tentackl_db::models::{StepStatus, TaskStatus};
use tentackl_db::queries::{automations, steps as step_db, tasks as task_db};

use crate::cache::TaskCache;
use crate::error::{CoreError, CoreResult};
use crate::events::EventBus;
use crate::ports::{FastPathPlanner, IntentDetector, StepDraft, TaskPlanner};
use crate::state::TaskStateMachine;
use crate::tree::TreeStore;

use self::intent::normalize_schedule;
use self::risk::RiskDetector;

/// Planner retry budget and backoff base.
const MAX_PLAN_RETRIES: u32 = 3;
const RETRY_DELAY: Duration = Duration::from_secs(2);

/// Inputs to the planning pipeline.
#[derive(Debug, Clone)]
pub struct PlanRequest {
    pub task_id: Uuid,
    pub user_id: String,
    pub organization_id: Option<String>,
    pub goal: String,
    pub constraints: serde_json::Value,
    pub metadata: serde_json::Value,
    pub skip_validation: bool,
}

/// The planning pipeline, composed from ports at wiring time.
pub struct PlanningPipeline {
    pool: PgPool,
    cache: Arc<TaskCache>,
    tree: Arc<TreeStore>,
    events: Arc<EventBus>,
    intent_detector: Arc<dyn IntentDetector>,
    fast_path: Arc<dyn FastPathPlanner>,
    planner: Arc<dyn TaskPlanner>,
    risk_detector: RiskDetector,
}

impl PlanningPipeline {
    pub fn new(
        pool: PgPool,
        cache: Arc<TaskCache>,
        tree: Arc<TreeStore>,
        events: Arc<EventBus>,
        intent_detector: Arc<dyn IntentDetector>,
        fast_path: Arc<dyn FastPathPlanner>,
        planner: Arc<dyn TaskPlanner>,
    ) -> Self {
        Self {
            pool,
            cache,
            tree,
            events,
            intent_detector,
            fast_path,
            planner,
            risk_detector: RiskDetector::new(),
        }
    }

    /// Run the full pipeline for a task already persisted in `planning`.
    ///
    /// Returns the task's resulting status. Failures inside the pipeline
    /// record `planning_error` metadata and move the task to `failed`;
    /// cancellation leaves partial writes in place and surfaces
    /// [`CoreError::Cancelled`].
    pub async fn plan_task(
        &self,
        request: PlanRequest,
        cancel: &CancellationToken,
    ) -> CoreResult<TaskStatus> {
        let task_id = request.task_id;

        match self.run_pipeline(&request, cancel).await {
            Ok(status) => Ok(status),
            Err(CoreError::Cancelled(reason)) => {
                tracing::info!(task_id = %task_id, "planning cancelled");
                Err(CoreError::Cancelled(reason))
            }
            Err(err) => {
                tracing::error!(task_id = %task_id, error = %err, "planning failed");
                let error_text = err.to_string();
                let metadata = serde_json::json!({"planning_error": error_text.clone()});
                if let Err(inner) = task_db::merge_metadata(&self.pool, task_id, &metadata).await
                {
                    tracing::error!(
                        task_id = %task_id,
                        error = %inner,
                        "failed to record planning error"
                    );
                }
                let _ = TaskStateMachine::transition_to(
                    &self.pool,
                    &self.cache,
                    task_id,
                    TaskStatus::Failed,
                )
                .await;
                self.events.planning_failed(task_id, &error_text).await;
                Ok(TaskStatus::Failed)
            }
        }
    }

    async fn run_pipeline(
        &self,
        request: &PlanRequest,
        cancel: &CancellationToken,
    ) -> CoreResult<TaskStatus> {
        let task_id = request.task_id;
        let mut goal = request.goal.clone();

        self.events.planning_started(task_id, &goal).await;
        self.check_cancelled(task_id, cancel)?;

        // 1. Intent detection and schedule normalization.
        let mut detected = self
            .intent_detector
            .extract_intent(&goal)
            .await
            .map_err(CoreError::Internal)?;

        let schedule = detected.as_mut().and_then(normalize_schedule);
        if let Some(schedule) = &schedule {
            self.events
                .planning_intent_detected(task_id, "schedule", &schedule.label())
                .await;

            if let Some(one_shot) = detected.as_ref().and_then(|i| i.one_shot_goal.clone()) {
                if one_shot.len() >= 10 {
                    goal = one_shot;
                }
            }
        }

        self.check_cancelled(task_id, cancel)?;

        // 2. Fast path: a single data-retrieval query satisfies the goal.
        let fast = self
            .fast_path
            .try_fast_path(
                &request.user_id,
                request.organization_id.as_deref(),
                &goal,
                detected.as_ref(),
            )
            .await
            .map_err(CoreError::Internal)?;

        if let Some(plan) = fast {
            return self.commit_fast_path(request, plan).await;
        }

        self.check_cancelled(task_id, cancel)?;

        // 3. LLM decomposition with retries; empty results retry too.
        self.events.planning_llm_started(task_id).await;
        let mut steps: Vec<StepDraft> = Vec::new();

        for attempt in 0..MAX_PLAN_RETRIES {
            self.check_cancelled(task_id, cancel)?;

            match self
                .planner
                .generate_delegation_steps(&goal, &request.constraints, request.skip_validation)
                .await
            {
                Ok(generated) if !generated.is_empty() => {
                    steps = generated;
                    break;
                }
                Ok(_) => {
                    tracing::warn!(
                        task_id = %task_id,
                        attempt = attempt + 1,
                        "empty steps returned, retrying"
                    );
                    if attempt < MAX_PLAN_RETRIES - 1 {
                        self.events
                            .planning_llm_retry(
                                task_id,
                                attempt + 1,
                                MAX_PLAN_RETRIES,
                                "Empty steps returned",
                            )
                            .await;
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        task_id = %task_id,
                        attempt = attempt + 1,
                        error = %e,
                        "step generation failed, retrying"
                    );
                    if attempt < MAX_PLAN_RETRIES - 1 {
                        self.events
                            .planning_llm_retry(
                                task_id,
                                attempt + 1,
                                MAX_PLAN_RETRIES,
                                &e.to_string(),
                            )
                            .await;
                    }
                }
            }

            if attempt < MAX_PLAN_RETRIES - 1 {
                tokio::time::sleep(RETRY_DELAY * (attempt + 1)).await;
            }
        }

        if steps.is_empty() {
            return Err(CoreError::PlanningFailed(
                "failed to generate plan steps after all retries".to_string(),
            ));
        }

        let step_names: Vec<String> = steps.iter().map(|s| s.name.clone()).collect();
        self.events
            .planning_steps_generated(task_id, steps.len(), &step_names)
            .await;

        self.check_cancelled(task_id, cancel)?;

        // 4. Risk injection: flag steps that must not run unapproved.
        let mut checkpoints_added = 0usize;
        let assessments = self.risk_detector.assess_plan(&steps);
        for assessment in assessments {
            if let Some(step) = steps.iter_mut().find(|s| s.id == assessment.step_id) {
                if !step.checkpoint_required && assessment.requires_checkpoint {
                    step.checkpoint_required = true;
                    step.checkpoint_config = assessment.checkpoint_config;
                    checkpoints_added += 1;
                }
            }
        }
        self.events
            .planning_risk_detection(task_id, checkpoints_added)
            .await;

        // 5. Parallel grouping.
        resolve_name_dependencies(&mut steps);
        grouping::assign_parallel_groups(&mut steps);

        self.check_cancelled(task_id, cancel)?;

        // 6. Commit: steps, metadata, execution tree, READY.
        let step_count = steps.len();
        self.commit_plan(request, steps, StepStatus::Pending).await?;
        TaskStateMachine::transition(
            &self.pool,
            &self.cache,
            task_id,
            TaskStatus::Planning,
            TaskStatus::Ready,
        )
        .await?;
        self.events
            .planning_completed(task_id, step_count, "llm")
            .await;

        tracing::info!(
            task_id = %task_id,
            user_id = %request.user_id,
            step_count = step_count,
            "plan created"
        );

        // 7. Schedule registration for detected schedules.
        if let Some(schedule) = schedule {
            let automation = automations::NewAutomation {
                task_id,
                user_id: request.user_id.clone(),
                organization_id: request.organization_id.clone(),
                goal: goal.clone(),
                cron: schedule.cron.clone(),
                execute_at: schedule.execute_at,
                timezone: schedule.timezone.clone(),
            };
            if let Err(e) = automations::upsert_automation(&self.pool, &automation).await {
                tracing::error!(
                    task_id = %task_id,
                    error = %e,
                    "failed to create automation from scheduling intent"
                );
            }
        }

        Ok(TaskStatus::Ready)
    }

    /// Persist a pre-computed fast-path plan and complete the task.
    async fn commit_fast_path(
        &self,
        request: &PlanRequest,
        plan: crate::ports::FastPathPlan,
    ) -> CoreResult<TaskStatus> {
        let task_id = request.task_id;
        self.events
            .planning_fast_path(task_id, "Direct data retrieval")
            .await;

        let step_count = plan.steps.len();
        self.commit_plan(request, plan.steps, StepStatus::Done).await?;

        let mut metadata = plan.metadata;
        if let Some(obj) = metadata.as_object_mut() {
            obj.entry("fast_path").or_insert(serde_json::json!(true));
        }
        task_db::merge_metadata(&self.pool, task_id, &metadata).await?;
        self.cache.merge_metadata(task_id, &metadata).await;

        TaskStateMachine::transition(
            &self.pool,
            &self.cache,
            task_id,
            TaskStatus::Planning,
            TaskStatus::Completed,
        )
        .await?;
        self.events
            .planning_completed(task_id, step_count, "fast_path")
            .await;

        Ok(TaskStatus::Completed)
    }

    /// Write steps and metadata, build the execution tree, and record its
    /// id. Step rows are written in one transaction.
    async fn commit_plan(
        &self,
        request: &PlanRequest,
        steps: Vec<StepDraft>,
        status: StepStatus,
    ) -> CoreResult<()> {
        let task_id = request.task_id;

        let rows: Vec<_> = steps
            .into_iter()
            .enumerate()
            .map(|(i, draft)| draft.into_step(task_id, i as i32, status))
            .collect();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| CoreError::DependencyUnavailable(e.to_string()))?;
        for step in &rows {
            step_db::insert_step_tx(&mut tx, step).await?;
        }
        tx.commit()
            .await
            .map_err(|e| CoreError::DependencyUnavailable(e.to_string()))?;

        if !request.metadata.is_null() {
            task_db::merge_metadata(&self.pool, task_id, &request.metadata).await?;
        }
        if !request.constraints.is_null() {
            task_db::set_constraints(&self.pool, task_id, &request.constraints).await?;
        }

        let mut task = task_db::get_task_with_steps(&self.pool, task_id)
            .await?
            .ok_or_else(|| {
                CoreError::NotFound(format!("task missing during tree creation: {task_id}"))
            })?;

        TreeStore::validate_dependencies(&task)
            .map_err(|e| CoreError::Validation(e.to_string()))?;

        let tree_id = self.tree.create_tree(&task).await;
        task_db::set_tree_id(&self.pool, task_id, tree_id).await?;
        task.tree_id = Some(tree_id);
        self.cache.put_task(task).await;

        tracing::info!(task_id = %task_id, tree_id = %tree_id, "created execution tree for task");
        Ok(())
    }

    fn check_cancelled(&self, task_id: Uuid, cancel: &CancellationToken) -> CoreResult<()> {
        if cancel.is_cancelled() {
            Err(CoreError::Cancelled(format!(
                "planning cancelled for task {task_id}"
            )))
        } else {
            Ok(())
        }
    }
}

/// Resolve dependencies written as step *names* into step ids. Unknown
/// references pass through for the commit-time validator to reject.
pub fn resolve_name_dependencies(steps: &mut [StepDraft]) {
    let name_to_id: HashMap<String, String> = steps
        .iter()
        .map(|s| (s.name.clone(), s.id.clone()))
        .collect();
    let ids: std::collections::HashSet<String> = steps.iter().map(|s| s.id.clone()).collect();

    for step in steps.iter_mut() {
        for dep in step.dependencies.iter_mut() {
            if !ids.contains(dep) {
                if let Some(id) = name_to_id.get(dep) {
                    *dep = id.clone();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_dependencies_resolve_to_ids() {
        let mut steps = vec![
            StepDraft::new("step_1", "fetch_data", "http_fetch"),
            StepDraft::new("step_2", "summarize", "summarize"),
        ];
        steps[1].dependencies = vec!["fetch_data".to_string()];

        resolve_name_dependencies(&mut steps);
        assert_eq!(steps[1].dependencies, vec!["step_1".to_string()]);
    }

    #[test]
    fn id_dependencies_untouched() {
        let mut steps = vec![
            StepDraft::new("step_1", "fetch", "http_fetch"),
            StepDraft::new("step_2", "step_1", "summarize"),
            StepDraft::new("step_3", "report", "compose"),
        ];
        // "step_1" is both an id and another step's name; ids win.
        steps[2].dependencies = vec!["step_1".to_string()];

        resolve_name_dependencies(&mut steps);
        assert_eq!(steps[2].dependencies, vec!["step_1".to_string()]);
    }
}
