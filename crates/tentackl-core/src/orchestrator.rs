//! Per-cycle orchestration engine.
//!
//! The orchestrator is stateless across cycles: each invocation reloads the
//! task from the cache, advances at most one ready step-group, and returns a
//! result tag. Failures flow through the observer; recovery proposals are
//! applied here and never raised as errors.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use sqlx::PgPool;
use sqlx::types::Json;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use uuid::Uuid;

use tentackl_db::models::{
    CheckpointConfig, CheckpointKind, FailurePolicy, Step, StepStatus, Task, TaskStatus,
};
use tentackl_db::queries::{findings, steps as step_db, tasks as task_db};

use crate::cache::TaskCache;
use crate::checkpoint::{REPLAN_PREFERENCE_KEY, build_checkpoint_preview};
use crate::error::{CoreError, CoreResult};
use crate::events::EventBus;
use crate::observer::{Observer, ObserverProposal, ProposalType};
use crate::ports::{
    ExecutionContext, MemoryOperations, PluginExecutor, ReplanContext, TaskPlanner,
};
use crate::state::TaskStateMachine;
use crate::stepexec::select_model;
use crate::template::{resolve_templates, validate_template_syntax};
use crate::tree::TreeStore;

/// Checkpoint details surfaced with a `checkpoint` cycle result.
#[derive(Debug, Clone)]
pub struct CheckpointInfo {
    pub step_id: String,
    pub name: String,
    pub description: String,
    pub preference_key: Option<String>,
    pub preview: Value,
}

/// Result of one orchestrator cycle.
#[derive(Debug, Clone)]
pub enum CycleResult {
    /// The task was already terminal when the cycle started.
    AlreadyTerminal(TaskStatus),
    /// All steps completed (or were skipped); the task is now completed.
    Completed,
    /// The task failed with the accumulated step errors.
    Failed { errors: Vec<String> },
    /// A step-group is blocked on an unresolved approval.
    Checkpoint(CheckpointInfo),
    /// No ready steps and no recovery path resolved this cycle.
    Blocked { message: String },
    StepCompleted {
        step_id: String,
        output: Value,
    },
    GroupCompleted {
        step_ids: Vec<String>,
        outputs: HashMap<String, Value>,
        partial_failure: bool,
    },
    GroupFailed {
        step_ids: Vec<String>,
        failed_step_ids: Vec<String>,
        error: String,
        failure_policy: FailurePolicy,
    },
    StepRetry {
        step_id: String,
        retry_count: i32,
        error: String,
    },
    StepFallback {
        step_id: String,
        fallback_target: Option<String>,
        error: String,
    },
    StepSkipped {
        step_id: String,
        error: String,
    },
    StepModified {
        step_id: String,
    },
    PlanAborted {
        step_id: String,
        reason: String,
    },
    ReplanCheckpoint(CheckpointInfo),
    ReplanComplete {
        new_task_id: Uuid,
        new_version: i32,
    },
    /// An unexpected infrastructure error aborted the cycle; the task is
    /// marked failed.
    CycleError { message: String },
}

impl CycleResult {
    /// Stable tag for logs and HTTP payloads.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::AlreadyTerminal(_) => "already_terminal",
            Self::Completed => "completed",
            Self::Failed { .. } => "failed",
            Self::Checkpoint(_) => "checkpoint",
            Self::Blocked { .. } => "blocked",
            Self::StepCompleted { .. } => "step_completed",
            Self::GroupCompleted { .. } => "group_completed",
            Self::GroupFailed { .. } => "group_failed",
            Self::StepRetry { .. } => "step_retry",
            Self::StepFallback { .. } => "step_fallback",
            Self::StepSkipped { .. } => "step_skipped",
            Self::StepModified { .. } => "step_modified",
            Self::PlanAborted { .. } => "plan_aborted",
            Self::ReplanCheckpoint(_) => "replan_checkpoint",
            Self::ReplanComplete { .. } => "replan_complete",
            Self::CycleError { .. } => "error",
        }
    }
}

/// Outcome of executing one step in-process.
#[derive(Debug, Clone)]
struct StepOutcome {
    success: bool,
    output: Value,
    error: Option<String>,
    execution_time_ms: i64,
    findings: Vec<Value>,
}

/// The per-cycle engine.
pub struct Orchestrator {
    pool: PgPool,
    cache: Arc<TaskCache>,
    tree: Arc<TreeStore>,
    events: Arc<EventBus>,
    observer: Arc<Observer>,
    planner: Arc<dyn TaskPlanner>,
    plugin: Arc<dyn PluginExecutor>,
    memory: Option<Arc<dyn MemoryOperations>>,
}

impl Orchestrator {
    pub fn new(
        pool: PgPool,
        cache: Arc<TaskCache>,
        tree: Arc<TreeStore>,
        events: Arc<EventBus>,
        observer: Arc<Observer>,
        planner: Arc<dyn TaskPlanner>,
        plugin: Arc<dyn PluginExecutor>,
        memory: Option<Arc<dyn MemoryOperations>>,
    ) -> Self {
        Self {
            pool,
            cache,
            tree,
            events,
            observer,
            planner,
            plugin,
            memory,
        }
    }

    /// Execute one cycle for a task: load fresh, advance at most one ready
    /// step-group, persist, and return the result tag.
    pub async fn execute_cycle(&self, task_id: Uuid) -> CoreResult<CycleResult> {
        tracing::info!(task_id = %task_id, "starting orchestrator cycle");

        let task = self.load_task(task_id).await?;

        if task.status.is_terminal() {
            tracing::info!(task_id = %task_id, status = %task.status, "task already terminal");
            return Ok(CycleResult::AlreadyTerminal(task.status));
        }

        // Find the next ready step-group (one group per cycle).
        let groups = task.ready_step_groups();
        if groups.is_empty() {
            return self.handle_no_ready_steps(&task).await;
        }

        let group: Vec<Step> = groups[0].iter().map(|s| (*s).clone()).collect();
        let is_parallel = group.len() > 1;

        tracing::info!(
            task_id = %task_id,
            group_size = group.len(),
            step_ids = ?group.iter().map(|s| &s.id).collect::<Vec<_>>(),
            parallel = is_parallel,
            "found next step group"
        );

        // Unresolved checkpoints park the whole group.
        for step in &group {
            if step.checkpoint_required {
                return self.park_group_at_checkpoint(&task, step).await;
            }
        }

        // Mark the group running before dispatch.
        for step in &group {
            self.tree.start_step(task_id, &step.id).await?;
            step_db::mark_step_running(&self.pool, task_id, &step.id).await?;
            self.cache
                .update_step(task_id, &step.id, |s| {
                    s.status = StepStatus::Running;
                    s.started_at = Some(chrono::Utc::now());
                })
                .await;
        }
        TaskStateMachine::transition_to(&self.pool, &self.cache, task_id, TaskStatus::Executing)
            .await?;

        let result = if is_parallel {
            self.execute_step_group(&task, &group).await
        } else {
            let step = group.into_iter().next().expect("non-empty group");
            self.execute_single(&task, step).await
        };

        match result {
            Ok(cycle_result) => Ok(cycle_result),
            Err(e) => {
                // Fatal tree/store error: abort the cycle and mark the task
                // failed.
                tracing::error!(task_id = %task_id, error = %e, "step execution error");
                let message = e.to_string();
                let _ = TaskStateMachine::transition_to(
                    &self.pool,
                    &self.cache,
                    task_id,
                    TaskStatus::Failed,
                )
                .await;
                Ok(CycleResult::CycleError { message })
            }
        }
    }

    async fn load_task(&self, task_id: Uuid) -> CoreResult<Task> {
        if let Some(task) = self.cache.get_task(task_id).await {
            return Ok(task);
        }
        let task = task_db::get_task_with_steps(&self.pool, task_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("task {task_id}")))?;
        self.cache.put_task(task.clone()).await;
        if !self.tree.has_tree(task_id).await {
            self.tree.create_tree(&task).await;
        }
        Ok(task)
    }

    // -----------------------------------------------------------------------
    // No-ready-steps branch
    // -----------------------------------------------------------------------

    async fn handle_no_ready_steps(&self, task: &Task) -> CoreResult<CycleResult> {
        let task_id = task.id;

        // All steps in terminal success: the task is complete.
        if task.all_steps_done() {
            TaskStateMachine::transition_to(
                &self.pool,
                &self.cache,
                task_id,
                TaskStatus::Completed,
            )
            .await?;
            return Ok(CycleResult::Completed);
        }

        // Steps parked at a checkpoint surface the first one.
        if let Some(step) = task
            .steps
            .iter()
            .find(|s| s.status == StepStatus::Checkpoint)
        {
            if task.status != TaskStatus::Checkpoint {
                TaskStateMachine::transition_to(
                    &self.pool,
                    &self.cache,
                    task_id,
                    TaskStatus::Checkpoint,
                )
                .await?;
            }
            let config = step
                .checkpoint_config
                .as_ref()
                .map(|c| c.0.clone())
                .unwrap_or_else(|| CheckpointConfig::default_for(step));
            return Ok(CycleResult::Checkpoint(CheckpointInfo {
                step_id: step.id.clone(),
                name: config.name.clone(),
                description: config.description.clone(),
                preference_key: config.preference_key.clone(),
                preview: build_checkpoint_preview(step, &config),
            }));
        }

        // Failed steps blocking pending dependants: consult the observer.
        let failed: Vec<&Step> = task
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Failed)
            .collect();
        let failed_ids: std::collections::HashSet<&str> =
            failed.iter().map(|s| s.id.as_str()).collect();
        let blocked: Vec<&Step> = task
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Pending)
            .filter(|s| s.dependencies.iter().any(|d| failed_ids.contains(d.as_str())))
            .collect();

        if !failed.is_empty() && !blocked.is_empty() {
            tracing::info!(
                task_id = %task_id,
                failed_count = failed.len(),
                blocked_count = blocked.len(),
                "consulting observer for blocked dependencies"
            );

            let proposal = self
                .observer
                .analyze_blocked_dependencies(task, &blocked, &failed)
                .await;

            if let Some(proposal) = proposal {
                if proposal.proposal_type == ProposalType::Replan {
                    let finding = findings::NewFinding {
                        task_id,
                        step_id: blocked[0].id.clone(),
                        finding_type: "observer_blocked_proposal".to_string(),
                        content: serde_json::json!({
                            "proposal_type": proposal.proposal_type.as_str(),
                            "reason": proposal.reason,
                            "confidence": proposal.confidence,
                            "failed_steps": failed.iter().map(|s| &s.id).collect::<Vec<_>>(),
                            "blocked_steps": blocked.iter().map(|s| &s.id).collect::<Vec<_>>(),
                        }),
                    };
                    let _ = findings::append_finding(&self.pool, &finding).await;

                    let trigger = failed[0].clone();
                    return self.apply_replan(task, &trigger, proposal).await;
                }
            }

            // No recovery path: the task fails with the accumulated errors.
            tracing::error!(
                task_id = %task_id,
                failed_steps = ?failed.iter().map(|s| &s.id).collect::<Vec<_>>(),
                "no recovery path found, marking task failed"
            );
            let errors: Vec<String> = failed
                .iter()
                .filter_map(|s| s.error_message.clone())
                .collect();
            let finding = findings::NewFinding {
                task_id,
                step_id: failed[0].id.clone(),
                finding_type: "unrecoverable_failure".to_string(),
                content: serde_json::json!({
                    "reason": "Observer determined no recovery path exists",
                    "failed_steps": failed.iter().map(|s| &s.id).collect::<Vec<_>>(),
                    "blocked_steps": blocked.iter().map(|s| &s.id).collect::<Vec<_>>(),
                    "failed_errors": errors,
                }),
            };
            let _ = findings::append_finding(&self.pool, &finding).await;

            TaskStateMachine::transition_to(&self.pool, &self.cache, task_id, TaskStatus::Failed)
                .await?;
            return Ok(CycleResult::Failed { errors });
        }

        tracing::warn!(task_id = %task_id, "no ready steps but task not complete");
        Ok(CycleResult::Blocked {
            message: "No steps ready to execute".to_string(),
        })
    }

    async fn park_group_at_checkpoint(
        &self,
        task: &Task,
        step: &Step,
    ) -> CoreResult<CycleResult> {
        let task_id = task.id;
        let config = step
            .checkpoint_config
            .as_ref()
            .map(|c| c.0.clone())
            .unwrap_or_else(|| CheckpointConfig::default_for(step));

        tracing::info!(
            task_id = %task_id,
            step_id = %step.id,
            checkpoint = %config.name,
            "checkpoint required"
        );

        step_db::park_step_at_checkpoint(&self.pool, task_id, &step.id, &config).await?;
        self.cache
            .update_step(task_id, &step.id, |s| {
                s.status = StepStatus::Checkpoint;
                s.checkpoint_config = Some(Json(config.clone()));
            })
            .await;
        self.tree.pause_step(task_id, &step.id).await?;
        TaskStateMachine::transition_to(&self.pool, &self.cache, task_id, TaskStatus::Checkpoint)
            .await?;

        Ok(CycleResult::Checkpoint(CheckpointInfo {
            step_id: step.id.clone(),
            name: config.name.clone(),
            description: config.description.clone(),
            preference_key: config.preference_key.clone(),
            preview: build_checkpoint_preview(step, &config),
        }))
    }

    // -----------------------------------------------------------------------
    // Step execution (in-process mode)
    // -----------------------------------------------------------------------

    /// Execute one step: validate templates, resolve references, inject
    /// system context, and dispatch to the plugin port. Validation errors
    /// surface as failed outcomes before any plugin is called.
    async fn run_step(&self, task: &Task, step: &Step) -> StepOutcome {
        if let Err(errors) = validate_template_syntax(&step.inputs) {
            let message = format!(
                "Step {:?} ({}) has invalid template syntax: {}. Use \
                 {{{{step_X.outputs.field_name}}}} instead of {{{{step_X.output}}}}.",
                step.id,
                step.name,
                errors.join("; ")
            );
            tracing::error!(step_id = %step.id, errors = ?errors, "invalid template syntax");
            return StepOutcome {
                success: false,
                output: Value::Null,
                error: Some(message),
                execution_time_ms: 0,
                findings: Vec::new(),
            };
        }

        let mut resolved = step.clone();
        resolved.inputs = resolve_templates(task, &step.inputs);
        let resolved = inject_system_context(task, resolved);

        tracing::info!(
            step_id = %resolved.id,
            agent_type = %resolved.agent_type,
            "dispatching step to subagent"
        );

        let model = select_model(&resolved.agent_type, None);
        let context = ExecutionContext {
            task_id: task.id,
            user_id: task.user_id.clone(),
            organization_id: task.organization_id.clone(),
            file_references: task
                .constraints
                .get("file_references")
                .cloned()
                .filter(|v| !v.is_null()),
            memory_context: self.inject_memories(task, &resolved).await,
        };

        match self.plugin.execute(&resolved, &model, &context).await {
            Ok(outcome) => {
                let findings = match (&outcome.metadata, outcome.success) {
                    (Some(metadata), true) => {
                        let mut finding = serde_json::json!({"type": resolved.agent_type});
                        if let (Some(target), Some(source)) =
                            (finding.as_object_mut(), metadata.as_object())
                        {
                            for (k, v) in source {
                                target.insert(k.clone(), v.clone());
                            }
                        }
                        vec![finding]
                    }
                    _ => Vec::new(),
                };
                StepOutcome {
                    success: outcome.success,
                    output: outcome.outputs,
                    error: outcome.error,
                    execution_time_ms: outcome.execution_time_ms,
                    findings,
                }
            }
            Err(e) => {
                tracing::error!(step_id = %resolved.id, error = %e, "subagent execution error");
                StepOutcome {
                    success: false,
                    output: Value::Null,
                    error: Some(format!("Subagent error: {e}")),
                    execution_time_ms: 0,
                    findings: Vec::new(),
                }
            }
        }
    }

    /// Fetch memories relevant to the goal and current step, best-effort.
    async fn inject_memories(&self, task: &Task, step: &Step) -> Option<String> {
        let memory = self.memory.as_ref()?;
        let query = format!("{} {}", task.goal, step.description);
        match memory.format_for_injection(&query, 1000).await {
            Ok(formatted) if !formatted.is_empty() => Some(formatted),
            Ok(_) => None,
            Err(e) => {
                tracing::warn!(step_id = %step.id, error = %e, "memory injection failed");
                None
            }
        }
    }

    async fn execute_single(&self, task: &Task, step: Step) -> CoreResult<CycleResult> {
        let task_id = task.id;
        let outcome = self.run_step(task, &step).await;

        if outcome.success {
            self.persist_step_success(task_id, &step, &outcome).await?;
            return Ok(CycleResult::StepCompleted {
                step_id: step.id,
                output: outcome.output,
            });
        }

        // Failure: consult the observer for a recovery action.
        let mut failed_step = step;
        failed_step.error_message = outcome.error.clone();
        failed_step.retry_count += 1;
        self.handle_step_failure(task, failed_step).await
    }

    async fn execute_step_group(&self, task: &Task, steps: &[Step]) -> CoreResult<CycleResult> {
        let task_id = task.id;
        let failure_policy = steps[0].failure_policy;
        let max_concurrent = task.max_parallel_steps.max(1) as usize;

        tracing::info!(
            task_id = %task_id,
            step_ids = ?steps.iter().map(|s| &s.id).collect::<Vec<_>>(),
            failure_policy = %failure_policy,
            max_concurrent = max_concurrent,
            "executing parallel step group"
        );

        let semaphore = Arc::new(Semaphore::new(max_concurrent));
        let mut join_set: JoinSet<(String, StepOutcome)> = JoinSet::new();

        for step in steps {
            let semaphore = Arc::clone(&semaphore);
            let step = step.clone();
            let task = task.clone();
            // Group members run concurrently under the semaphore, each with
            // its own handle on the plugin port.
            let this = self.clone_refs();
            join_set.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let outcome = this.run_step_owned(&task, &step).await;
                (step.id.clone(), outcome)
            });
        }

        let mut results: HashMap<String, StepOutcome> = HashMap::new();
        let mut first_error: Option<String> = None;

        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((step_id, outcome)) => {
                    let failed = !outcome.success;
                    if failed && first_error.is_none() {
                        first_error = Some(
                            outcome
                                .error
                                .clone()
                                .unwrap_or_else(|| "Step failed".to_string()),
                        );
                        if failure_policy == FailurePolicy::FailFast {
                            // Cancel unfinished siblings on first failure.
                            results.insert(step_id, outcome);
                            join_set.abort_all();
                            while let Some(res) = join_set.join_next().await {
                                if let Ok((id, outcome)) = res {
                                    results.insert(id, outcome);
                                }
                            }
                            break;
                        }
                    }
                    results.insert(step_id, outcome);
                }
                Err(e) if e.is_cancelled() => {}
                Err(e) => {
                    tracing::error!(task_id = %task_id, error = %e, "group member panicked");
                    if first_error.is_none() {
                        first_error = Some(e.to_string());
                    }
                }
            }
        }

        // Persist all member results before evaluating the policy.
        self.persist_group_results(task_id, steps, &results).await?;

        let failed_ids: Vec<String> = steps
            .iter()
            .filter(|s| !results.get(&s.id).map(|o| o.success).unwrap_or(false))
            .map(|s| s.id.clone())
            .collect();
        let outputs: HashMap<String, Value> = results
            .iter()
            .map(|(id, o)| (id.clone(), o.output.clone()))
            .collect();
        let step_ids: Vec<String> = steps.iter().map(|s| s.id.clone()).collect();

        if failed_ids.is_empty() {
            return Ok(CycleResult::GroupCompleted {
                step_ids,
                outputs,
                partial_failure: false,
            });
        }

        match failure_policy {
            FailurePolicy::BestEffort if failed_ids.len() < steps.len() => {
                tracing::warn!(
                    task_id = %task_id,
                    failed_steps = ?failed_ids,
                    "parallel group partial failure (best effort)"
                );
                Ok(CycleResult::GroupCompleted {
                    step_ids,
                    outputs,
                    partial_failure: true,
                })
            }
            policy => Ok(CycleResult::GroupFailed {
                step_ids,
                failed_step_ids: failed_ids,
                error: first_error.unwrap_or_else(|| "Step failed".to_string()),
                failure_policy: policy,
            }),
        }
    }

    /// Persist one successful step across tree, primary store, cache, and
    /// findings.
    async fn persist_step_success(
        &self,
        task_id: Uuid,
        step: &Step,
        outcome: &StepOutcome,
    ) -> CoreResult<()> {
        self.tree
            .complete_step(task_id, &step.id, outcome.output.clone())
            .await?;
        step_db::complete_step(
            &self.pool,
            task_id,
            &step.id,
            &outcome.output,
            Some(outcome.execution_time_ms),
        )
        .await?;
        self.cache
            .update_step(task_id, &step.id, |s| {
                s.status = StepStatus::Done;
                s.outputs = outcome.output.clone();
                s.completed_at = Some(chrono::Utc::now());
                s.execution_time_ms = Some(outcome.execution_time_ms);
            })
            .await;
        self.events
            .step_completed(task_id, &step.id, &step.name, &outcome.output)
            .await;

        for content in &outcome.findings {
            let finding = findings::NewFinding {
                task_id,
                step_id: step.id.clone(),
                finding_type: step.agent_type.clone(),
                content: content.clone(),
            };
            if let Err(e) = findings::append_finding(&self.pool, &finding).await {
                tracing::warn!(task_id = %task_id, error = %e, "failed to append finding");
            }
        }
        Ok(())
    }

    async fn persist_group_results(
        &self,
        task_id: Uuid,
        steps: &[Step],
        results: &HashMap<String, StepOutcome>,
    ) -> CoreResult<()> {
        for step in steps {
            match results.get(&step.id) {
                Some(outcome) if outcome.success => {
                    self.persist_step_success(task_id, step, outcome).await?;
                }
                Some(outcome) => {
                    let error = outcome
                        .error
                        .clone()
                        .unwrap_or_else(|| "Unknown error".to_string());
                    self.tree.fail_step(task_id, &step.id, &error).await?;
                    step_db::fail_step(
                        &self.pool,
                        task_id,
                        &step.id,
                        &error,
                        Some(outcome.execution_time_ms),
                    )
                    .await?;
                    self.cache
                        .update_step(task_id, &step.id, |s| {
                            s.status = StepStatus::Failed;
                            s.error_message = Some(error.clone());
                        })
                        .await;
                    self.events
                        .step_failed(task_id, &step.id, &step.name, &error)
                        .await;
                }
                None => {
                    // Cancelled before producing a result (fail-fast).
                    let error = "Execution cancelled".to_string();
                    self.tree.fail_step(task_id, &step.id, &error).await?;
                    step_db::fail_step(&self.pool, task_id, &step.id, &error, None).await?;
                    self.cache
                        .update_step(task_id, &step.id, |s| {
                            s.status = StepStatus::Failed;
                            s.error_message = Some(error.clone());
                        })
                        .await;
                }
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Observer-driven recovery
    // -----------------------------------------------------------------------

    async fn handle_step_failure(
        &self,
        task: &Task,
        failed_step: Step,
    ) -> CoreResult<CycleResult> {
        let task_id = task.id;
        tracing::info!(
            task_id = %task_id,
            step_id = %failed_step.id,
            error = ?failed_step.error_message,
            retry_count = failed_step.retry_count,
            "consulting observer for failure recovery"
        );

        let proposal = self.observer.analyze_failure(task, &failed_step).await;

        tracing::info!(
            step_id = %failed_step.id,
            proposal_type = proposal.proposal_type.as_str(),
            fallback_target = ?proposal.fallback_target,
            confidence = proposal.confidence,
            "observer proposal received"
        );

        let finding = findings::NewFinding {
            task_id,
            step_id: failed_step.id.clone(),
            finding_type: "observer_proposal".to_string(),
            content: serde_json::json!({
                "proposal_type": proposal.proposal_type.as_str(),
                "reason": proposal.reason,
                "confidence": proposal.confidence,
                "fallback_target": proposal.fallback_target,
                "error": failed_step.error_message,
            }),
        };
        let _ = findings::append_finding(&self.pool, &finding).await;

        match proposal.proposal_type {
            ProposalType::Retry => self.apply_retry(task_id, &failed_step).await,
            ProposalType::Modify => self.apply_modify(task_id, &failed_step, proposal).await,
            ProposalType::Fallback => self.apply_fallback(task_id, failed_step, proposal).await,
            ProposalType::Skip => self.apply_skip(task_id, &failed_step).await,
            ProposalType::Replan => self.apply_replan(task, &failed_step, proposal).await,
            ProposalType::Abort => self.apply_abort(task_id, &failed_step, &proposal.reason).await,
        }
    }

    async fn apply_retry(&self, task_id: Uuid, step: &Step) -> CoreResult<CycleResult> {
        let error = step.error_message.clone().unwrap_or_default();
        step_db::reset_step_for_retry(&self.pool, task_id, &step.id, step.retry_count, &error)
            .await?;
        self.cache
            .update_step(task_id, &step.id, |s| {
                s.status = StepStatus::Pending;
                s.retry_count = step.retry_count;
                s.error_message = Some(error.clone());
            })
            .await;
        self.tree.reset_step(task_id, &step.id).await?;

        Ok(CycleResult::StepRetry {
            step_id: step.id.clone(),
            retry_count: step.retry_count,
            error,
        })
    }

    async fn apply_modify(
        &self,
        task_id: Uuid,
        step: &Step,
        proposal: ObserverProposal,
    ) -> CoreResult<CycleResult> {
        let Some(modified_inputs) = proposal.modified_inputs else {
            tracing::warn!(step_id = %step.id, "modify proposal without modified inputs");
            return self
                .apply_abort(task_id, step, "MODIFY proposal without modified inputs")
                .await;
        };

        let annotated = format!(
            "[MODIFIED] Previous error: {}",
            step.error_message.as_deref().unwrap_or("")
        );
        step_db::update_step_inputs(&self.pool, task_id, &step.id, &modified_inputs).await?;
        step_db::reset_step_for_retry(&self.pool, task_id, &step.id, step.retry_count, &annotated)
            .await?;
        self.cache
            .update_step(task_id, &step.id, |s| {
                s.status = StepStatus::Pending;
                s.inputs = modified_inputs.clone();
                s.retry_count = step.retry_count;
                s.error_message = Some(annotated.clone());
            })
            .await;
        self.tree.reset_step(task_id, &step.id).await?;

        Ok(CycleResult::StepModified {
            step_id: step.id.clone(),
        })
    }

    async fn apply_fallback(
        &self,
        task_id: Uuid,
        mut step: Step,
        proposal: ObserverProposal,
    ) -> CoreResult<CycleResult> {
        let error = step.error_message.clone().unwrap_or_default();
        let target = proposal.fallback_target.clone();

        let mut inputs = step.inputs.clone();
        if let Some(target_value) = &target {
            if let Some(obj) = inputs.as_object_mut() {
                if target_value.starts_with("http") {
                    obj.insert("fallback_api".to_string(), Value::String(target_value.clone()));
                } else {
                    obj.insert(
                        "fallback_model".to_string(),
                        Value::String(target_value.clone()),
                    );
                }
            }
            // The consumed target narrows the remaining options.
            if let Some(cfg) = step.fallback_config.as_mut() {
                cfg.0.remove_target(target_value);
            }
        }

        step_db::update_step_inputs(&self.pool, task_id, &step.id, &inputs).await?;
        step_db::update_fallback_config(
            &self.pool,
            task_id,
            &step.id,
            step.fallback_config.as_ref().map(|c| &c.0),
        )
        .await?;
        step_db::reset_step_for_retry(&self.pool, task_id, &step.id, step.retry_count, &error)
            .await?;
        let fallback_config = step.fallback_config.clone();
        self.cache
            .update_step(task_id, &step.id, |s| {
                s.status = StepStatus::Pending;
                s.inputs = inputs.clone();
                s.fallback_config = fallback_config.clone();
                s.error_message = Some(error.clone());
            })
            .await;
        self.tree.reset_step(task_id, &step.id).await?;

        Ok(CycleResult::StepFallback {
            step_id: step.id.clone(),
            fallback_target: target,
            error,
        })
    }

    async fn apply_skip(&self, task_id: Uuid, step: &Step) -> CoreResult<CycleResult> {
        let error = step.error_message.clone().unwrap_or_default();
        step_db::skip_step(&self.pool, task_id, &step.id, step.error_message.as_deref()).await?;
        self.cache
            .update_step(task_id, &step.id, |s| s.status = StepStatus::Skipped)
            .await;
        self.tree.skip_step(task_id, &step.id).await?;

        Ok(CycleResult::StepSkipped {
            step_id: step.id.clone(),
            error,
        })
    }

    async fn apply_abort(
        &self,
        task_id: Uuid,
        step: &Step,
        reason: &str,
    ) -> CoreResult<CycleResult> {
        let error = step.error_message.clone().unwrap_or_default();
        step_db::fail_step(&self.pool, task_id, &step.id, &error, None).await?;
        self.cache
            .update_step(task_id, &step.id, |s| {
                s.status = StepStatus::Failed;
                s.error_message = Some(error.clone());
            })
            .await;
        self.tree.fail_step(task_id, &step.id, &error).await?;
        TaskStateMachine::transition_to(&self.pool, &self.cache, task_id, TaskStatus::Failed)
            .await?;

        Ok(CycleResult::PlanAborted {
            step_id: step.id.clone(),
            reason: reason.to_string(),
        })
    }

    /// Park the failed step behind a strategic REPLAN checkpoint. The replan
    /// context rides in the step's inputs until approval.
    async fn apply_replan(
        &self,
        task: &Task,
        failed_step: &Step,
        proposal: ObserverProposal,
    ) -> CoreResult<CycleResult> {
        let task_id = task.id;
        let Some(context) = proposal.replan_context else {
            tracing::error!(step_id = %failed_step.id, "replan proposal without context");
            return self
                .apply_abort(task_id, failed_step, "REPLAN failed: no context provided")
                .await;
        };

        let diagnosis_preview: String = context.diagnosis.chars().take(100).collect();
        tracing::info!(
            task_id = %task_id,
            step_id = %failed_step.id,
            diagnosis = %diagnosis_preview,
            "applying replan proposal"
        );

        let config = CheckpointConfig {
            name: "replan_approval".to_string(),
            description: format!("Strategic replan required: {diagnosis_preview}"),
            kind: CheckpointKind::Replan,
            preference_key: Some(REPLAN_PREFERENCE_KEY.to_string()),
            preview_fields: vec![
                "diagnosis".to_string(),
                "affected_steps".to_string(),
                "suggested_approach".to_string(),
            ],
        };

        let mut inputs = failed_step.inputs.clone();
        if let Some(obj) = inputs.as_object_mut() {
            obj.insert(
                "_replan_context".to_string(),
                serde_json::to_value(&context).unwrap_or(Value::Null),
            );
        }

        step_db::update_step_inputs(&self.pool, task_id, &failed_step.id, &inputs).await?;
        step_db::park_step_at_checkpoint(&self.pool, task_id, &failed_step.id, &config).await?;
        self.cache
            .update_step(task_id, &failed_step.id, |s| {
                s.status = StepStatus::Checkpoint;
                s.checkpoint_required = true;
                s.checkpoint_config = Some(Json(config.clone()));
                s.inputs = inputs.clone();
            })
            .await;
        self.tree.pause_step(task_id, &failed_step.id).await?;
        TaskStateMachine::transition_to(&self.pool, &self.cache, task_id, TaskStatus::Checkpoint)
            .await?;

        Ok(CycleResult::ReplanCheckpoint(CheckpointInfo {
            step_id: failed_step.id.clone(),
            name: config.name.clone(),
            description: config.description.clone(),
            preference_key: config.preference_key.clone(),
            preview: serde_json::json!({
                "diagnosis": context.diagnosis,
                "affected_steps": context.affected_steps,
                "suggested_approach": context.suggested_approach,
                "constraints": context.constraints,
                "original_error": failed_step.error_message,
            }),
        }))
    }

    /// Execute the strategic replan after approval: build the new task
    /// version, mark the original superseded, and link the two atomically.
    pub async fn execute_replan(&self, task_id: Uuid, step_id: &str) -> CoreResult<CycleResult> {
        let task = self.load_task(task_id).await?;
        let step = task
            .step(step_id)
            .ok_or_else(|| CoreError::NotFound(format!("step {step_id} of task {task_id}")))?;

        let context_value = step
            .inputs
            .get("_replan_context")
            .cloned()
            .ok_or_else(|| CoreError::Validation("replan context not found".to_string()))?;
        let context: ReplanContext = serde_json::from_value(context_value)
            .map_err(|e| CoreError::Validation(format!("malformed replan context: {e}")))?;

        let diagnosis_preview: String = context.diagnosis.chars().take(100).collect();
        tracing::info!(
            task_id = %task_id,
            step_id = %step_id,
            diagnosis = %diagnosis_preview,
            "executing strategic replan"
        );

        let plan = self
            .planner
            .replan(&task, step, &context)
            .await
            .map_err(|e| CoreError::PlanningFailed(format!("replan failed: {e}")))?;

        if plan.steps.is_empty() {
            return Err(CoreError::PlanningFailed(
                "replan produced an empty plan".to_string(),
            ));
        }

        // New sibling version of the task.
        let new_version = task.version + 1;
        let new_task_row = task_db::NewTask {
            goal: plan.goal.clone().unwrap_or_else(|| task.goal.clone()),
            user_id: task.user_id.clone(),
            organization_id: task.organization_id.clone(),
            status: TaskStatus::Planning,
            constraints: task.constraints.clone(),
            success_criteria: task.success_criteria.clone(),
            max_parallel_steps: task.max_parallel_steps,
            metadata: serde_json::json!({
                "replanned_from": task_id,
                "replan_diagnosis": context.diagnosis,
            }),
            parent_task_id: task.parent_task_id,
            version: new_version,
        };
        let new_task = task_db::insert_task(&self.pool, &new_task_row).await?;

        let mut drafts = plan.steps;
        crate::planner::resolve_name_dependencies(&mut drafts);
        crate::planner::grouping::assign_parallel_groups(&mut drafts);

        let rows: Vec<Step> = drafts
            .into_iter()
            .enumerate()
            .map(|(i, draft)| draft.into_step(new_task.id, i as i32, StepStatus::Pending))
            .collect();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| CoreError::DependencyUnavailable(e.to_string()))?;
        for row in &rows {
            step_db::insert_step_tx(&mut tx, row).await?;
        }
        tx.commit()
            .await
            .map_err(|e| CoreError::DependencyUnavailable(e.to_string()))?;

        let new_task_full = task_db::get_task_with_steps(&self.pool, new_task.id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("task {}", new_task.id)))?;
        TreeStore::validate_dependencies(&new_task_full)
            .map_err(|e| CoreError::Validation(e.to_string()))?;
        let tree_id = self.tree.create_tree(&new_task_full).await;
        task_db::set_tree_id(&self.pool, new_task.id, tree_id).await?;
        TaskStateMachine::transition(
            &self.pool,
            &self.cache,
            new_task.id,
            TaskStatus::Planning,
            TaskStatus::Ready,
        )
        .await?;

        let mut cached = new_task_full;
        cached.status = TaskStatus::Ready;
        cached.tree_id = Some(tree_id);
        self.cache.put_task(cached).await;

        // Supersession is a single-writer update: status and link together.
        let rows = task_db::set_superseded_by(&self.pool, task_id, new_task.id).await?;
        if rows == 0 {
            tracing::warn!(task_id = %task_id, "task already terminal during supersession");
        }
        self.cache.set_task_status(task_id, TaskStatus::Superseded).await;

        tracing::info!(
            original_task_id = %task_id,
            new_task_id = %new_task.id,
            new_version = new_version,
            "strategic replan complete"
        );

        Ok(CycleResult::ReplanComplete {
            new_task_id: new_task.id,
            new_version,
        })
    }

    // Cheap clone of the Arc'd ports for group workers.
    fn clone_refs(&self) -> OrchestratorRefs {
        OrchestratorRefs {
            plugin: Arc::clone(&self.plugin),
        }
    }
}

/// The subset of orchestrator state a group worker needs.
struct OrchestratorRefs {
    plugin: Arc<dyn PluginExecutor>,
}

impl OrchestratorRefs {
    async fn run_step_owned(&self, task: &Task, step: &Step) -> StepOutcome {
        if let Err(errors) = validate_template_syntax(&step.inputs) {
            return StepOutcome {
                success: false,
                output: Value::Null,
                error: Some(format!(
                    "Step {:?} ({}) has invalid template syntax: {}",
                    step.id,
                    step.name,
                    errors.join("; ")
                )),
                execution_time_ms: 0,
                findings: Vec::new(),
            };
        }

        let mut resolved = step.clone();
        resolved.inputs = resolve_templates(task, &step.inputs);
        let resolved = inject_system_context(task, resolved);

        let model = select_model(&resolved.agent_type, None);
        let context = ExecutionContext {
            task_id: task.id,
            user_id: task.user_id.clone(),
            organization_id: task.organization_id.clone(),
            ..Default::default()
        };

        match self.plugin.execute(&resolved, &model, &context).await {
            Ok(outcome) => StepOutcome {
                success: outcome.success,
                output: outcome.outputs,
                error: outcome.error,
                execution_time_ms: outcome.execution_time_ms,
                findings: Vec::new(),
            },
            Err(e) => StepOutcome {
                success: false,
                output: Value::Null,
                error: Some(format!("Subagent error: {e}")),
                execution_time_ms: 0,
                findings: Vec::new(),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// System context injection
// ---------------------------------------------------------------------------

/// Inject task-level context into steps whose agent types need it.
///
/// File-storage operations receive organization/workflow/agent identifiers
/// and a content type inferred from the filename; image generation
/// additionally receives a sanitised folder path derived from the goal and a
/// public-visibility default.
pub fn inject_system_context(task: &Task, step: Step) -> Step {
    match step.agent_type.as_str() {
        "file_storage" => inject_file_storage_context(task, step),
        "generate_image" => inject_image_generation_context(task, step),
        _ => step,
    }
}

fn inject_file_storage_context(task: &Task, mut step: Step) -> Step {
    let Some(inputs) = step.inputs.as_object_mut() else {
        return step;
    };

    if !inputs.contains_key("org_id") {
        if let Some(org) = &task.organization_id {
            inputs.insert("org_id".to_string(), Value::String(org.clone()));
        }
    }
    if !inputs.contains_key("workflow_id") {
        inputs.insert("workflow_id".to_string(), Value::String(task.id.to_string()));
    }
    if !inputs.contains_key("agent_id") {
        inputs.insert("agent_id".to_string(), Value::String(step.id.clone()));
    }

    // The upload handler expects `content`.
    if inputs.contains_key("file_data") && !inputs.contains_key("content") {
        let data = inputs["file_data"].clone();
        inputs.insert("content".to_string(), data);
    }

    let is_upload = inputs
        .get("operation")
        .and_then(Value::as_str)
        .is_some_and(|op| op == "upload");
    if is_upload && !inputs.contains_key("content_type") {
        let filename = inputs
            .get("filename")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let content_type = match filename.rsplit('.').next() {
            Some("png") => Some("image/png"),
            Some("jpg") | Some("jpeg") => Some("image/jpeg"),
            Some("webp") => Some("image/webp"),
            Some("gif") => Some("image/gif"),
            Some("json") => Some("application/json"),
            _ => None,
        };
        if let Some(content_type) = content_type {
            inputs.insert(
                "content_type".to_string(),
                Value::String(content_type.to_string()),
            );
        }
    }

    step
}

fn inject_image_generation_context(task: &Task, mut step: Step) -> Step {
    let Some(inputs) = step.inputs.as_object_mut() else {
        return step;
    };

    if !inputs.contains_key("org_id") {
        if let Some(org) = &task.organization_id {
            inputs.insert("org_id".to_string(), Value::String(org.clone()));
        }
    }
    if !inputs.contains_key("workflow_id") {
        inputs.insert("workflow_id".to_string(), Value::String(task.id.to_string()));
    }
    if !inputs.contains_key("agent_id") {
        inputs.insert("agent_id".to_string(), Value::String(step.id.clone()));
    }

    if !inputs.contains_key("folder_path") {
        let slug = goal_slug(&task.goal);
        inputs.insert(
            "folder_path".to_string(),
            Value::String(format!("/generated-images/{slug}")),
        );
    }
    if !inputs.contains_key("is_public") {
        inputs.insert("is_public".to_string(), Value::Bool(true));
    }

    step
}

/// Sanitised slug from the first 30 characters of a goal.
fn goal_slug(goal: &str) -> String {
    let cleaned: String = goal
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || c.is_whitespace() || *c == '-')
        .take(30)
        .collect();
    let slug = cleaned
        .trim()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("-")
        .to_lowercase();
    if slug.is_empty() { "images".to_string() } else { slug }
}
