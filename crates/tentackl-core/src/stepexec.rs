//! Single-step execution lifecycle.
//!
//! For one dispatched step the sequence is strict: reconstruct from the
//! tree, mark running, handle checkpoints, select a model, build a trusted
//! context, execute the plugin, then sync results in the fixed order
//! tree -> primary store -> cache -> event stream -> inbox.

use std::sync::Arc;

use sqlx::PgPool;
use uuid::Uuid;

use tentackl_db::models::{CheckpointDecision, Step, StepStatus, TaskStatus};
use tentackl_db::queries::{findings, steps as step_db, tasks as task_db};

use crate::cache::TaskCache;
use crate::checkpoint::CheckpointManager;
use crate::error::{CoreError, CoreResult};
use crate::events::EventBus;
use crate::inbox::InboxService;
use crate::ports::{ExecutionContext, PluginExecutor};
use crate::scheduler::Scheduler;
use crate::state::TaskStateMachine;
use crate::transient::is_transient_error;
use crate::tree::{TreeOutcome, TreeStore};

/// Default model per agent type; an explicit step override wins.
const DEFAULT_MODEL: &str = "anthropic/claude-sonnet-4";
const AGENT_MODEL_DEFAULTS: &[(&str, &str)] = &[
    ("web_research", "perplexity/sonar"),
    ("generate_image", "openai/gpt-image-1"),
    ("analyze", "anthropic/claude-sonnet-4"),
    ("compose", "anthropic/claude-sonnet-4"),
];

/// Select the model for a step: explicit override first, then the per-agent
/// default table.
pub fn select_model(agent_type: &str, explicit: Option<&str>) -> String {
    if let Some(model) = explicit {
        if !model.is_empty() {
            return model.to_owned();
        }
    }
    AGENT_MODEL_DEFAULTS
        .iter()
        .find(|(agent, _)| *agent == agent_type)
        .map(|(_, model)| (*model).to_owned())
        .unwrap_or_else(|| DEFAULT_MODEL.to_owned())
}

/// A work item handed to the step-execution path.
///
/// `step.inputs` carry the template-resolved values from dispatch time.
#[derive(Debug, Clone)]
pub struct StepDispatch {
    pub task_id: Uuid,
    pub step: Step,
    pub user_id: String,
    pub model: Option<String>,
}

/// Outcome tag of one step execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepExecStatus {
    Success,
    Error,
    Retrying,
    Checkpoint,
}

/// Value object returned by [`StepExecutor::execute`].
#[derive(Debug, Clone)]
pub struct StepExecutionResult {
    pub status: StepExecStatus,
    pub task_id: Uuid,
    pub step_id: String,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    /// Populated on `Retrying`: the payload to re-dispatch.
    pub retry_dispatch: Option<StepDispatch>,
}

/// Executes dispatched steps through the plugin port.
pub struct StepExecutor {
    pool: PgPool,
    cache: Arc<TaskCache>,
    tree: Arc<TreeStore>,
    events: Arc<EventBus>,
    inbox: Arc<InboxService>,
    checkpoints: Arc<CheckpointManager>,
    scheduler: Arc<Scheduler>,
    plugin: Arc<dyn PluginExecutor>,
}

impl StepExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: PgPool,
        cache: Arc<TaskCache>,
        tree: Arc<TreeStore>,
        events: Arc<EventBus>,
        inbox: Arc<InboxService>,
        checkpoints: Arc<CheckpointManager>,
        scheduler: Arc<Scheduler>,
        plugin: Arc<dyn PluginExecutor>,
    ) -> Self {
        Self {
            pool,
            cache,
            tree,
            events,
            inbox,
            checkpoints,
            scheduler,
            plugin,
        }
    }

    /// Execute a single dispatched step.
    pub async fn execute(&self, dispatch: StepDispatch) -> CoreResult<StepExecutionResult> {
        let task_id = dispatch.task_id;
        let step_id = dispatch.step.id.clone();

        tracing::info!(
            task_id = %task_id,
            step_id = %step_id,
            agent_type = %dispatch.step.agent_type,
            "executing task step"
        );

        // 1. Reconstruct from the tree, falling back to the dispatched
        //    payload, and apply the resolved inputs from dispatch time.
        let mut step = match self.tree.get_step_from_tree(task_id, &step_id).await? {
            Some(mut tree_step) => {
                tree_step.inputs = dispatch.step.inputs.clone();
                tree_step.retry_count = dispatch.step.retry_count;
                tree_step
            }
            None => {
                tracing::warn!(
                    task_id = %task_id,
                    step_id = %step_id,
                    "step not found in tree, reconstructing from dispatch payload"
                );
                dispatch.step.clone()
            }
        };

        // 2. Mark running in the execution tree.
        self.tree.start_step(task_id, &step_id).await?;
        step_db::mark_step_running(&self.pool, task_id, &step_id).await?;
        self.cache
            .update_step(task_id, &step_id, |s| {
                s.status = StepStatus::Running;
                s.started_at = Some(chrono::Utc::now());
            })
            .await;

        // 3. Checkpoint gate: park until approved.
        if step.checkpoint_required {
            if self
                .checkpoints
                .is_already_approved(task_id, &step_id)
                .await?
            {
                tracing::info!(
                    task_id = %task_id,
                    step_id = %step_id,
                    "checkpoint already approved, proceeding"
                );
                step.checkpoint_required = false;
            } else if let Some(result) = self.park_at_checkpoint(&dispatch, &step).await? {
                return Ok(result);
            }
        }

        // 4. Model selection.
        let model = select_model(&step.agent_type, dispatch.model.as_deref());

        // 5. Execution context from the trusted primary store.
        let mut context = ExecutionContext {
            task_id,
            user_id: dispatch.user_id.clone(),
            ..Default::default()
        };
        if let Ok(Some(task)) = task_db::get_task(&self.pool, task_id).await {
            context.organization_id = task.organization_id.clone();
            context.file_references = task
                .constraints
                .get("file_references")
                .cloned()
                .filter(|v| !v.is_null());
        }

        // 6. Plugin execution.
        let outcome = self
            .plugin
            .execute(&step, &model, &context)
            .await
            .unwrap_or_else(|e| crate::ports::ExecutionOutcome::err(e.to_string()));

        // 7. Result handling.
        if outcome.success {
            self.handle_success(&dispatch, &step, outcome).await
        } else {
            self.handle_failure(dispatch, step, outcome).await
        }
    }

    /// Pause the step for approval. Returns `None` when the checkpoint was
    /// auto-approved and execution should continue.
    async fn park_at_checkpoint(
        &self,
        dispatch: &StepDispatch,
        step: &Step,
    ) -> CoreResult<Option<StepExecutionResult>> {
        let task_id = dispatch.task_id;
        let step_id = &step.id;

        // Pause in the execution tree first.
        self.tree.pause_step(task_id, step_id).await?;

        // Sync CHECKPOINT to primary store and cache, step and task.
        step_db::update_step_status(&self.pool, task_id, step_id, StepStatus::Checkpoint).await?;
        self.cache
            .update_step(task_id, step_id, |s| s.status = StepStatus::Checkpoint)
            .await;
        TaskStateMachine::transition_to(&self.pool, &self.cache, task_id, TaskStatus::Checkpoint)
            .await?;

        let checkpoint = self
            .checkpoints
            .create_checkpoint(task_id, step, &dispatch.user_id)
            .await?;

        if checkpoint.decision == CheckpointDecision::AutoApproved {
            tracing::info!(
                task_id = %task_id,
                step_id = %step_id,
                "checkpoint auto-approved by learned preference, continuing"
            );
            self.tree.start_step(task_id, step_id).await?;
            step_db::update_step_status(&self.pool, task_id, step_id, StepStatus::Running).await?;
            self.cache
                .update_step(task_id, step_id, |s| s.status = StepStatus::Running)
                .await;
            TaskStateMachine::transition_to(
                &self.pool,
                &self.cache,
                task_id,
                TaskStatus::Executing,
            )
            .await?;
            return Ok(None);
        }

        tracing::info!(
            task_id = %task_id,
            step_id = %step_id,
            "step requires checkpoint, pausing for approval"
        );

        self.events
            .checkpoint_created(
                task_id,
                step_id,
                &checkpoint.name,
                &serde_json::json!({"description": step.description}),
            )
            .await;
        self.inbox
            .add_checkpoint_message(task_id, step_id, &step.name, &step.description)
            .await;

        Ok(Some(StepExecutionResult {
            status: StepExecStatus::Checkpoint,
            task_id,
            step_id: step_id.clone(),
            output: None,
            error: None,
            retry_dispatch: None,
        }))
    }

    async fn handle_success(
        &self,
        dispatch: &StepDispatch,
        step: &Step,
        outcome: crate::ports::ExecutionOutcome,
    ) -> CoreResult<StepExecutionResult> {
        let task_id = dispatch.task_id;
        let step_id = &step.id;
        let outputs = outcome.outputs;

        // tree -> primary -> cache -> events -> inbox, in that order.
        self.tree
            .complete_step(task_id, step_id, outputs.clone())
            .await?;
        step_db::complete_step(
            &self.pool,
            task_id,
            step_id,
            &outputs,
            Some(outcome.execution_time_ms),
        )
        .await?;
        self.cache
            .update_step(task_id, step_id, |s| {
                s.status = StepStatus::Done;
                s.outputs = outputs.clone();
                s.completed_at = Some(chrono::Utc::now());
                s.execution_time_ms = Some(outcome.execution_time_ms);
            })
            .await;

        self.events
            .step_completed(task_id, step_id, &step.name, &outputs)
            .await;

        if let Some(metadata) = &outcome.metadata {
            let finding = findings::NewFinding {
                task_id,
                step_id: step_id.clone(),
                finding_type: step.agent_type.clone(),
                content: metadata.clone(),
            };
            if let Err(e) = findings::append_finding(&self.pool, &finding).await {
                tracing::warn!(task_id = %task_id, error = %e, "failed to append finding");
            }
        }

        self.inbox
            .add_step_message(
                task_id,
                &step.name,
                "completed",
                &format!("{} — done.", step.name),
                serde_json::json!({"step_id": step_id, "outputs": outputs}),
            )
            .await;

        tracing::info!(
            task_id = %task_id,
            step_id = %step_id,
            execution_time_ms = outcome.execution_time_ms,
            "task step completed"
        );

        // Newly satisfied dependants go straight onto the queue.
        match self.scheduler.schedule_ready_nodes(task_id).await {
            Ok(scheduled) => {
                tracing::info!(
                    task_id = %task_id,
                    completed_step = %step_id,
                    scheduled_count = scheduled,
                    "scheduled dependent steps"
                );
            }
            Err(e) => {
                tracing::warn!(
                    task_id = %task_id,
                    step_id = %step_id,
                    error = %e,
                    "failed to schedule dependent steps"
                );
            }
        }

        self.check_task_finalization(task_id).await?;

        Ok(StepExecutionResult {
            status: StepExecStatus::Success,
            task_id,
            step_id: step_id.clone(),
            output: Some(outputs),
            error: None,
            retry_dispatch: None,
        })
    }

    async fn handle_failure(
        &self,
        dispatch: StepDispatch,
        step: Step,
        outcome: crate::ports::ExecutionOutcome,
    ) -> CoreResult<StepExecutionResult> {
        let task_id = dispatch.task_id;
        let step_id = step.id.clone();
        let error_msg = outcome
            .error
            .unwrap_or_else(|| "Step execution failed".to_string());

        // Transient errors recycle as retries while the budget lasts.
        if step.retry_count < step.max_retries && is_transient_error(&error_msg) {
            return self.handle_retry(dispatch, step, &error_msg).await;
        }

        self.tree.fail_step(task_id, &step_id, &error_msg).await?;
        step_db::fail_step(
            &self.pool,
            task_id,
            &step_id,
            &error_msg,
            Some(outcome.execution_time_ms),
        )
        .await?;
        self.cache
            .update_step(task_id, &step_id, |s| {
                s.status = StepStatus::Failed;
                s.error_message = Some(error_msg.clone());
                s.completed_at = Some(chrono::Utc::now());
            })
            .await;

        self.events
            .step_failed(task_id, &step_id, &step.name, &error_msg)
            .await;
        self.inbox
            .add_step_message(
                task_id,
                &step.name,
                "failed",
                &format!("{} — failed: {}", step.name, error_msg),
                serde_json::json!({"step_id": step_id, "error": error_msg}),
            )
            .await;

        tracing::error!(
            task_id = %task_id,
            step_id = %step_id,
            error = %error_msg,
            "task step failed"
        );

        // If the whole tree is now terminally failed, finalize the task.
        let (complete, outcome_status) = self.tree.is_task_complete(task_id).await?;
        if complete && outcome_status == TreeOutcome::Failed {
            self.finalize_task(task_id, TaskStatus::Failed, Some(&error_msg))
                .await?;
        }

        Ok(StepExecutionResult {
            status: StepExecStatus::Error,
            task_id,
            step_id,
            output: None,
            error: Some(error_msg),
            retry_dispatch: None,
        })
    }

    async fn handle_retry(
        &self,
        dispatch: StepDispatch,
        step: Step,
        error_msg: &str,
    ) -> CoreResult<StepExecutionResult> {
        let task_id = dispatch.task_id;
        let step_id = step.id.clone();
        let new_retry_count = step.retry_count + 1;
        let annotated = format!("Retry {}/{}: {}", new_retry_count, step.max_retries, error_msg);

        self.tree.reset_step(task_id, &step_id).await?;
        step_db::reset_step_for_retry(&self.pool, task_id, &step_id, new_retry_count, &annotated)
            .await?;
        self.cache
            .update_step(task_id, &step_id, |s| {
                s.status = StepStatus::Pending;
                s.retry_count = new_retry_count;
                s.error_message = Some(annotated.clone());
            })
            .await;

        self.events
            .step_started(task_id, &step_id, &step.name)
            .await;

        tracing::info!(
            task_id = %task_id,
            step_id = %step_id,
            retry = format!("{new_retry_count}/{}", step.max_retries),
            error = %error_msg,
            "step retrying after transient error"
        );

        let mut retry_step = dispatch.step.clone();
        retry_step.retry_count = new_retry_count;

        Ok(StepExecutionResult {
            status: StepExecStatus::Retrying,
            task_id,
            step_id,
            output: None,
            error: Some(error_msg.to_string()),
            retry_dispatch: Some(StepDispatch {
                task_id,
                step: retry_step,
                user_id: dispatch.user_id,
                model: dispatch.model,
            }),
        })
    }

    /// Finalize the task when the tree reached a terminal state.
    async fn check_task_finalization(&self, task_id: Uuid) -> CoreResult<()> {
        let (complete, outcome) = self.tree.is_task_complete(task_id).await?;
        if complete {
            let status = match outcome {
                TreeOutcome::Completed => TaskStatus::Completed,
                _ => TaskStatus::Failed,
            };
            self.finalize_task(task_id, status, None).await?;
        }
        Ok(())
    }

    /// Mark the task terminal in both stores, emit the terminal event, and
    /// post the completion inbox message with step counts.
    pub async fn finalize_task(
        &self,
        task_id: Uuid,
        status: TaskStatus,
        error: Option<&str>,
    ) -> CoreResult<()> {
        if let Err(e) =
            TaskStateMachine::transition_to(&self.pool, &self.cache, task_id, status).await
        {
            match e {
                CoreError::InvalidTransition { current, .. } if current.is_terminal() => {
                    return Ok(());
                }
                other => return Err(other),
            }
        }

        let metrics = self.tree.get_tree_metrics(task_id).await?;
        // The synthetic root is always completed; exclude it from counts.
        let steps_completed = metrics.completed.saturating_sub(1);
        let total_steps = metrics.total_nodes.saturating_sub(1);

        match status {
            TaskStatus::Completed => {
                self.events.task_completed(task_id, steps_completed).await;
            }
            _ => {
                self.events
                    .task_failed(task_id, error.unwrap_or("task failed"))
                    .await;
            }
        }

        self.inbox
            .add_completion_message(
                task_id,
                &status.to_string(),
                steps_completed,
                total_steps,
                error,
            )
            .await;

        tracing::info!(task_id = %task_id, final_status = %status, "task finalized");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_model_wins() {
        assert_eq!(select_model("compose", Some("my-model")), "my-model");
        assert_eq!(select_model("compose", Some("")), "anthropic/claude-sonnet-4");
    }

    #[test]
    fn agent_defaults_apply() {
        assert_eq!(select_model("web_research", None), "perplexity/sonar");
        assert_eq!(select_model("generate_image", None), "openai/gpt-image-1");
        assert_eq!(select_model("unknown_agent", None), DEFAULT_MODEL);
    }
}
