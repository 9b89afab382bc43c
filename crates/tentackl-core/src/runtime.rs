//! Task runtime: the composition root.
//!
//! Wires the primary store, cache, execution tree, event bus, inbox,
//! planner, orchestrator, observer, scheduler, checkpoint manager,
//! preference service, trigger registry, and event gateway into the
//! application use-cases. Holds the in-flight planning and execution
//! handles per task so a cancel request can cooperatively stop them.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::Stream;
use serde_json::Value;
use sqlx::PgPool;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use tentackl_db::models::{
    Checkpoint, CheckpointDecision, Finding, Step, StepStatus, Task, TaskStatus, TriggerScope,
};
use tentackl_db::queries::{findings, steps as step_db, tasks as task_db, triggers as trigger_db};

use crate::cache::TaskCache;
use crate::checkpoint::{CheckpointManager, PreferenceService};
use crate::error::{CoreError, CoreResult};
use crate::events::EventBus;
use crate::inbox::InboxService;
use crate::observer::Observer;
use crate::orchestrator::{CycleResult, Orchestrator};
use crate::planner::{PlanRequest, PlanningPipeline, grouping, resolve_name_dependencies};
use crate::ports::{
    FastPathPlanner, IntentDetector, LlmAdvisor, MemoryOperations, PluginExecutor, StepDraft,
    TaskPlanner,
};
use crate::scheduler::{Scheduler, spawn_workers};
use crate::state::TaskStateMachine;
use crate::stepexec::StepExecutor;
use crate::template::substitute_event_refs;
use crate::tree::TreeStore;
use crate::trigger::{EventGateway, ExternalEvent, TriggerRegistry};

/// Delay before the stuck-planning sweep runs after startup.
const RECOVERY_SWEEP_DELAY: Duration = Duration::from_secs(10);

/// Tasks stuck in planning longer than this are failed by the sweep.
const STUCK_PLANNING_MINUTES: i64 = 5;

/// Heartbeat interval on observe streams.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Ports injected at wiring time.
pub struct RuntimePorts {
    pub intent_detector: Arc<dyn IntentDetector>,
    pub fast_path: Arc<dyn FastPathPlanner>,
    pub planner: Arc<dyn TaskPlanner>,
    pub plugin: Arc<dyn PluginExecutor>,
    pub advisor: Option<Arc<dyn LlmAdvisor>>,
    pub memory: Option<Arc<dyn MemoryOperations>>,
}

/// Runtime tuning knobs.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Worker pool size for the step dispatch queue.
    pub max_workers: usize,
    /// Start tasks automatically once planning lands in READY.
    pub auto_start: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            auto_start: true,
        }
    }
}

/// Summary returned by [`TaskRuntime::execute_task`].
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub task_id: Uuid,
    pub status: String,
    pub steps_completed: usize,
    pub steps_total: usize,
    pub findings: Vec<Finding>,
    pub checkpoint: Option<Value>,
    pub error: Option<String>,
}

struct ActiveJob {
    handle: JoinHandle<()>,
    cancel: CancellationToken,
}

/// The application runtime.
pub struct TaskRuntime {
    pool: PgPool,
    config: RuntimeConfig,
    cache: Arc<TaskCache>,
    tree: Arc<TreeStore>,
    events: Arc<EventBus>,
    inbox: Arc<InboxService>,
    preferences: Arc<PreferenceService>,
    checkpoints: Arc<CheckpointManager>,
    orchestrator: Arc<Orchestrator>,
    scheduler: Arc<Scheduler>,
    pipeline: Arc<PlanningPipeline>,
    triggers: Arc<TriggerRegistry>,
    gateway: Arc<EventGateway>,
    shutdown: CancellationToken,
    active_planning: Mutex<HashMap<Uuid, ActiveJob>>,
    active_executions: Mutex<HashMap<Uuid, ActiveJob>>,
}

impl TaskRuntime {
    /// Compose the runtime, spawn the worker pool, and schedule the
    /// stuck-planning recovery sweep.
    pub fn new(pool: PgPool, ports: RuntimePorts, config: RuntimeConfig) -> Arc<Self> {
        let cache = Arc::new(TaskCache::new());
        let tree = Arc::new(TreeStore::new());
        let events = Arc::new(EventBus::new());
        let inbox = Arc::new(InboxService::new(pool.clone()));
        let preferences = Arc::new(PreferenceService::new(pool.clone()));
        let checkpoints = Arc::new(CheckpointManager::new(
            pool.clone(),
            Arc::clone(&cache),
            Arc::clone(&tree),
            Arc::clone(&preferences),
        ));
        let observer = Arc::new(Observer::new(ports.advisor.clone()));
        let orchestrator = Arc::new(Orchestrator::new(
            pool.clone(),
            Arc::clone(&cache),
            Arc::clone(&tree),
            Arc::clone(&events),
            Arc::clone(&observer),
            Arc::clone(&ports.planner),
            Arc::clone(&ports.plugin),
            ports.memory.clone(),
        ));

        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let scheduler = Arc::new(Scheduler::new(
            pool.clone(),
            Arc::clone(&cache),
            Arc::clone(&tree),
            queue_tx.clone(),
        ));
        let executor = Arc::new(StepExecutor::new(
            pool.clone(),
            Arc::clone(&cache),
            Arc::clone(&tree),
            Arc::clone(&events),
            Arc::clone(&inbox),
            Arc::clone(&checkpoints),
            Arc::clone(&scheduler),
            Arc::clone(&ports.plugin),
        ));

        let shutdown = CancellationToken::new();
        spawn_workers(
            executor,
            queue_rx,
            queue_tx,
            config.max_workers,
            shutdown.clone(),
        );

        let pipeline = Arc::new(PlanningPipeline::new(
            pool.clone(),
            Arc::clone(&cache),
            Arc::clone(&tree),
            Arc::clone(&events),
            ports.intent_detector,
            ports.fast_path,
            Arc::clone(&ports.planner),
        ));

        let runtime = Arc::new(Self {
            triggers: Arc::new(TriggerRegistry::new(pool.clone())),
            gateway: Arc::new(EventGateway::new(pool.clone())),
            pool,
            config,
            cache,
            tree,
            events,
            inbox,
            preferences,
            checkpoints,
            orchestrator,
            scheduler,
            pipeline,
            shutdown,
            active_planning: Mutex::new(HashMap::new()),
            active_executions: Mutex::new(HashMap::new()),
        });

        runtime.spawn_recovery_sweep();
        runtime
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn inbox(&self) -> &Arc<InboxService> {
        &self.inbox
    }

    pub fn gateway(&self) -> &Arc<EventGateway> {
        &self.gateway
    }

    pub fn triggers(&self) -> &Arc<TriggerRegistry> {
        &self.triggers
    }

    /// Stop the worker pool and abort in-flight jobs.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        for (_, job) in self.active_planning.lock().await.drain() {
            job.cancel.cancel();
            job.handle.abort();
        }
        for (_, job) in self.active_executions.lock().await.drain() {
            job.cancel.cancel();
            job.handle.abort();
        }
    }

    // -----------------------------------------------------------------------
    // Creation
    // -----------------------------------------------------------------------

    /// Create a task in PLANNING and run the planning pipeline in the
    /// background. Returns the persisted row immediately.
    pub async fn create_task(
        self: &Arc<Self>,
        user_id: &str,
        organization_id: Option<&str>,
        goal: &str,
        constraints: Option<Value>,
        metadata: Option<Value>,
        skip_validation: bool,
    ) -> CoreResult<Task> {
        if goal.trim().is_empty() {
            return Err(CoreError::Validation("goal must not be empty".to_string()));
        }

        let mut new = task_db::NewTask::planning(goal, user_id, organization_id);
        if let Some(constraints) = &constraints {
            new.constraints = constraints.clone();
        }
        if let Some(metadata) = &metadata {
            new.metadata = metadata.clone();
        }
        let task = task_db::insert_task(&self.pool, &new).await?;

        self.register_trigger_from_metadata(&task).await;

        let request = PlanRequest {
            task_id: task.id,
            user_id: user_id.to_owned(),
            organization_id: organization_id.map(str::to_owned),
            goal: goal.to_owned(),
            constraints: constraints.unwrap_or_else(|| serde_json::json!({})),
            metadata: metadata.unwrap_or_else(|| serde_json::json!({})),
            skip_validation,
        };

        let cancel = CancellationToken::new();
        let runtime = Arc::clone(self);
        let task_id = task.id;
        let owner = user_id.to_owned();
        let token = cancel.clone();
        let auto_start = self.config.auto_start;

        let handle = tokio::spawn(async move {
            let status = runtime.pipeline.plan_task(request, &token).await;
            runtime.active_planning.lock().await.remove(&task_id);

            match status {
                Ok(TaskStatus::Ready) if auto_start => {
                    if let Err(e) = runtime.start_task(task_id, &owner).await {
                        tracing::warn!(task_id = %task_id, error = %e, "auto-start failed");
                    } else {
                        tracing::info!(task_id = %task_id, "task auto-started");
                    }
                }
                Ok(_) => {}
                Err(CoreError::Cancelled(_)) => {
                    let _ = TaskStateMachine::transition_to(
                        &runtime.pool,
                        &runtime.cache,
                        task_id,
                        TaskStatus::Cancelled,
                    )
                    .await;
                }
                Err(e) => {
                    tracing::error!(task_id = %task_id, error = %e, "planning task failed");
                }
            }
        });

        self.active_planning
            .lock()
            .await
            .insert(task.id, ActiveJob { handle, cancel });

        Ok(task)
    }

    /// Create a task with pre-defined steps: risk injection, grouping,
    /// durable tree, READY.
    pub async fn create_task_with_steps(
        self: &Arc<Self>,
        user_id: &str,
        organization_id: Option<&str>,
        goal: &str,
        steps: Vec<StepDraft>,
        constraints: Option<Value>,
        metadata: Option<Value>,
    ) -> CoreResult<Task> {
        if steps.is_empty() {
            return Err(CoreError::Validation(
                "at least one step is required".to_string(),
            ));
        }

        tracing::info!(
            user_id = %user_id,
            step_count = steps.len(),
            "creating task with steps"
        );

        let mut drafts = steps;
        resolve_name_dependencies(&mut drafts);

        let detector = crate::planner::risk::RiskDetector::new();
        for assessment in detector.assess_plan(&drafts) {
            if let Some(draft) = drafts.iter_mut().find(|d| d.id == assessment.step_id) {
                if !draft.checkpoint_required && assessment.requires_checkpoint {
                    draft.checkpoint_required = true;
                    draft.checkpoint_config = assessment.checkpoint_config;
                }
            }
        }
        grouping::assign_parallel_groups(&mut drafts);

        let mut new = task_db::NewTask::planning(goal, user_id, organization_id);
        if let Some(constraints) = constraints {
            new.constraints = constraints;
        }
        if let Some(metadata) = metadata {
            new.metadata = metadata;
        }
        let task = task_db::insert_task(&self.pool, &new).await?;

        let rows: Vec<Step> = drafts
            .into_iter()
            .enumerate()
            .map(|(i, d)| d.into_step(task.id, i as i32, StepStatus::Pending))
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

        let full = task_db::get_task_with_steps(&self.pool, task.id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("task {}", task.id)))?;
        TreeStore::validate_dependencies(&full)
            .map_err(|e| CoreError::Validation(e.to_string()))?;
        let tree_id = self.tree.create_tree(&full).await;
        task_db::set_tree_id(&self.pool, task.id, tree_id).await?;

        TaskStateMachine::transition(
            &self.pool,
            &self.cache,
            task.id,
            TaskStatus::Planning,
            TaskStatus::Ready,
        )
        .await?;

        let mut cached = full;
        cached.tree_id = Some(tree_id);
        cached.status = TaskStatus::Ready;
        self.cache.put_task(cached.clone()).await;

        self.register_trigger_from_metadata(&cached).await;

        tracing::info!(
            task_id = %cached.id,
            checkpoints = cached.steps.iter().filter(|s| s.checkpoint_required).count(),
            "task with steps created"
        );
        Ok(cached)
    }

    /// Register a trigger when the task's metadata carries a `trigger`
    /// block. Missing organizations are logged and skipped.
    async fn register_trigger_from_metadata(&self, task: &Task) {
        let Some(spec) = task.metadata.get("trigger") else {
            return;
        };
        let Some(organization_id) = task.organization_id.clone() else {
            tracing::warn!(task_id = %task.id, "trigger metadata without organization, skipping");
            return;
        };
        let Some(event_pattern) = spec
            .get("event_pattern")
            .or_else(|| spec.get("event_type"))
            .and_then(Value::as_str)
        else {
            tracing::warn!(task_id = %task.id, "trigger metadata without event pattern, skipping");
            return;
        };

        let scope = spec
            .get("scope")
            .and_then(Value::as_str)
            .and_then(|s| s.parse::<TriggerScope>().ok())
            .unwrap_or(TriggerScope::Org);

        let new = trigger_db::NewTrigger {
            task_id: task.id,
            organization_id,
            user_id: task.user_id.clone(),
            event_pattern: event_pattern.to_owned(),
            source_filter: spec
                .get("source_filter")
                .and_then(Value::as_str)
                .map(str::to_owned),
            condition: spec.get("condition").cloned().filter(|v| !v.is_null()),
            scope,
        };
        if let Err(e) = self.triggers.register(&new).await {
            tracing::error!(task_id = %task.id, error = %e, "failed to register trigger");
        }
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub async fn get_task(&self, task_id: Uuid) -> CoreResult<Task> {
        if let Some(task) = self.cache.get_task(task_id).await {
            return Ok(task);
        }
        task_db::get_task_with_steps(&self.pool, task_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("task {task_id}")))
    }

    pub async fn list_tasks(
        &self,
        user_id: &str,
        status: Option<TaskStatus>,
        limit: i64,
    ) -> CoreResult<Vec<Task>> {
        Ok(task_db::list_tasks_for_user(&self.pool, user_id, status, limit).await?)
    }

    pub async fn list_findings(&self, task_id: Uuid) -> CoreResult<Vec<Finding>> {
        Ok(findings::list_findings_for_task(&self.pool, task_id).await?)
    }

    async fn owned_task(&self, task_id: Uuid, user_id: &str) -> CoreResult<Task> {
        let task = self.get_task(task_id).await?;
        if task.user_id != user_id && user_id != "system" {
            return Err(CoreError::Forbidden(format!(
                "user {user_id} does not own task {task_id}"
            )));
        }
        Ok(task)
    }

    // -----------------------------------------------------------------------
    // Execution
    // -----------------------------------------------------------------------

    /// Run the orchestrator cycle loop until completion, failure, or a
    /// checkpoint. With `run_to_completion` checkpoints (including replans)
    /// auto-approve without learning preferences.
    pub async fn execute_task(
        self: &Arc<Self>,
        task_id: Uuid,
        user_id: &str,
        run_to_completion: bool,
    ) -> CoreResult<ExecutionResult> {
        let task = self.owned_task(task_id, user_id).await?;
        tracing::info!(
            task_id = %task_id,
            user_id = %user_id,
            run_to_completion = run_to_completion,
            "starting task execution"
        );

        match TaskStateMachine::transition(
            &self.pool,
            &self.cache,
            task_id,
            TaskStatus::Ready,
            TaskStatus::Executing,
        )
        .await
        {
            Ok(()) => {}
            Err(CoreError::InvalidTransition { current, .. })
                if current == TaskStatus::Executing || current == TaskStatus::Checkpoint => {}
            Err(e) => return Err(e),
        }

        let max_cycles = (task.steps.len().max(1)) * 3 + 10;
        let mut current_task_id = task_id;
        let mut cycles = 0usize;

        while cycles < max_cycles {
            cycles += 1;
            let result = self.orchestrator.execute_cycle(current_task_id).await?;
            tracing::debug!(
                task_id = %current_task_id,
                cycle = cycles,
                status = result.tag(),
                "cycle completed"
            );

            match result {
                CycleResult::Completed | CycleResult::AlreadyTerminal(TaskStatus::Completed) => {
                    return self.build_execution_result(current_task_id, "completed", None, None)
                        .await;
                }
                CycleResult::Failed { errors } => {
                    return self
                        .build_execution_result(
                            current_task_id,
                            "failed",
                            None,
                            Some(errors.join("; ")),
                        )
                        .await;
                }
                CycleResult::AlreadyTerminal(status) => {
                    return self
                        .build_execution_result(current_task_id, &status.to_string(), None, None)
                        .await;
                }
                CycleResult::CycleError { message } => {
                    return self
                        .build_execution_result(current_task_id, "failed", None, Some(message))
                        .await;
                }
                CycleResult::Checkpoint(info) => {
                    let decision = self
                        .materialize_checkpoint(current_task_id, &info.step_id, user_id)
                        .await?;
                    if decision == CheckpointDecision::AutoApproved {
                        self.after_auto_approval(current_task_id, &info.step_id).await?;
                        continue;
                    }
                    if run_to_completion {
                        self.approve_checkpoint(
                            current_task_id,
                            &info.step_id,
                            user_id,
                            Some("Auto-approved (run_to_completion)"),
                            false,
                        )
                        .await?;
                        continue;
                    }
                    let preview = serde_json::json!({
                        "step_id": info.step_id,
                        "name": info.name,
                        "description": info.description,
                        "preference_key": info.preference_key,
                        "preview": info.preview,
                    });
                    return self
                        .build_execution_result(
                            current_task_id,
                            "checkpoint",
                            Some(preview),
                            None,
                        )
                        .await;
                }
                CycleResult::ReplanCheckpoint(info) => {
                    self.materialize_checkpoint(current_task_id, &info.step_id, user_id)
                        .await?;
                    if run_to_completion {
                        match self
                            .approve_replan(current_task_id, &info.step_id, user_id, None)
                            .await?
                        {
                            CycleResult::ReplanComplete { new_task_id, .. } => {
                                current_task_id = new_task_id;
                                continue;
                            }
                            other => {
                                return self
                                    .build_execution_result(
                                        current_task_id,
                                        other.tag(),
                                        None,
                                        None,
                                    )
                                    .await;
                            }
                        }
                    }
                    let preview = serde_json::json!({
                        "step_id": info.step_id,
                        "name": info.name,
                        "description": info.description,
                        "preview": info.preview,
                    });
                    return self
                        .build_execution_result(
                            current_task_id,
                            "replan_checkpoint",
                            Some(preview),
                            None,
                        )
                        .await;
                }
                CycleResult::ReplanComplete { new_task_id, .. } => {
                    current_task_id = new_task_id;
                }
                CycleResult::Blocked { message } => {
                    return self
                        .build_execution_result(current_task_id, "blocked", None, Some(message))
                        .await;
                }
                CycleResult::PlanAborted { reason, .. } => {
                    return self
                        .build_execution_result(current_task_id, "aborted", None, Some(reason))
                        .await;
                }
                CycleResult::StepCompleted { .. }
                | CycleResult::GroupCompleted { .. }
                | CycleResult::GroupFailed { .. }
                | CycleResult::StepRetry { .. }
                | CycleResult::StepFallback { .. }
                | CycleResult::StepSkipped { .. }
                | CycleResult::StepModified { .. } => {}
            }
        }

        self.build_execution_result(
            current_task_id,
            "max_cycles_reached",
            None,
            Some(format!("Exceeded {max_cycles} cycles")),
        )
        .await
    }

    /// Create the checkpoint record for a parked step; returns its decision.
    async fn materialize_checkpoint(
        &self,
        task_id: Uuid,
        step_id: &str,
        user_id: &str,
    ) -> CoreResult<CheckpointDecision> {
        let task = self.get_task(task_id).await?;
        let step = task
            .step(step_id)
            .ok_or_else(|| CoreError::NotFound(format!("step {step_id} of task {task_id}")))?;
        let checkpoint = self
            .checkpoints
            .create_checkpoint(task_id, step, user_id)
            .await?;
        self.events
            .checkpoint_created(
                task_id,
                step_id,
                &checkpoint.name,
                checkpoint.preview.as_ref().unwrap_or(&Value::Null),
            )
            .await;
        self.inbox
            .add_checkpoint_message(task_id, step_id, &step.name, &step.description)
            .await;
        Ok(checkpoint.decision)
    }

    /// Unpark a step whose checkpoint auto-approved during materialisation.
    async fn after_auto_approval(&self, task_id: Uuid, step_id: &str) -> CoreResult<()> {
        step_db::clear_step_checkpoint(&self.pool, task_id, step_id).await?;
        self.cache
            .update_step(task_id, step_id, |s| {
                s.checkpoint_required = false;
                s.status = StepStatus::Pending;
            })
            .await;
        self.tree.reset_step(task_id, step_id).await?;
        TaskStateMachine::transition_to(&self.pool, &self.cache, task_id, TaskStatus::Executing)
            .await?;
        Ok(())
    }

    async fn build_execution_result(
        &self,
        task_id: Uuid,
        status: &str,
        checkpoint: Option<Value>,
        error: Option<String>,
    ) -> CoreResult<ExecutionResult> {
        let task = self.get_task(task_id).await.ok();
        let (steps_completed, steps_total) = task
            .as_ref()
            .map(|t| {
                (
                    t.steps
                        .iter()
                        .filter(|s| s.status == StepStatus::Done)
                        .count(),
                    t.steps.len(),
                )
            })
            .unwrap_or((0, 0));
        let findings = self.list_findings(task_id).await.unwrap_or_default();

        Ok(ExecutionResult {
            task_id,
            status: status.to_string(),
            steps_completed,
            steps_total,
            findings,
            checkpoint,
            error,
        })
    }

    /// Start a task asynchronously: transition to EXECUTING and schedule the
    /// initial ready node-set onto the worker queue.
    pub async fn start_task(self: &Arc<Self>, task_id: Uuid, user_id: &str) -> CoreResult<usize> {
        let task = self.owned_task(task_id, user_id).await?;

        match TaskStateMachine::transition(
            &self.pool,
            &self.cache,
            task_id,
            TaskStatus::Ready,
            TaskStatus::Executing,
        )
        .await
        {
            Ok(()) => {}
            Err(CoreError::InvalidTransition { current, .. })
                if current == TaskStatus::Executing =>
            {
                // Already executing: schedule any pending ready steps.
                tracing::info!(task_id = %task_id, "task already executing, scheduling pending steps");
            }
            Err(e) => return Err(e),
        }

        if task.tree_id.is_none() && !self.tree.has_tree(task_id).await {
            let _ = TaskStateMachine::transition_to(
                &self.pool,
                &self.cache,
                task_id,
                TaskStatus::Failed,
            )
            .await;
            return Err(CoreError::Validation(
                "task is missing execution tree metadata".to_string(),
            ));
        }

        self.events
            .task_started(task_id, &task.goal, task.steps.len())
            .await;

        match self.scheduler.schedule_ready_nodes(task_id).await {
            Ok(scheduled) => {
                tracing::info!(
                    task_id = %task_id,
                    scheduled_count = scheduled,
                    "scheduled ready steps via execution tree"
                );
                Ok(scheduled)
            }
            Err(e) => {
                tracing::error!(task_id = %task_id, error = %e, "failed to schedule via execution tree");
                let _ = TaskStateMachine::transition_to(
                    &self.pool,
                    &self.cache,
                    task_id,
                    TaskStatus::Failed,
                )
                .await;
                Err(e)
            }
        }
    }

    /// Pause an executing task; in-flight dispatch completes, nothing new is
    /// scheduled.
    pub async fn pause_task(self: &Arc<Self>, task_id: Uuid, user_id: &str) -> CoreResult<Task> {
        self.owned_task(task_id, user_id).await?;
        TaskStateMachine::transition(
            &self.pool,
            &self.cache,
            task_id,
            TaskStatus::Executing,
            TaskStatus::Paused,
        )
        .await?;

        if let Some(job) = self.active_executions.lock().await.remove(&task_id) {
            job.cancel.cancel();
            job.handle.abort();
        }
        self.get_task(task_id).await
    }

    /// Cancel a task: set the flag, stop in-flight planning and execution,
    /// and unregister any trigger.
    pub async fn cancel_task(self: &Arc<Self>, task_id: Uuid, user_id: &str) -> CoreResult<Task> {
        let task = self.owned_task(task_id, user_id).await?;
        if task.status.is_terminal() {
            return Err(CoreError::InvalidTransition {
                current: task.status,
                requested: TaskStatus::Cancelled,
            });
        }

        let was_planning = task.status == TaskStatus::Planning;

        TaskStateMachine::transition_to(&self.pool, &self.cache, task_id, TaskStatus::Cancelled)
            .await?;

        if was_planning {
            if let Some(job) = self.active_planning.lock().await.remove(&task_id) {
                job.cancel.cancel();
                job.handle.abort();
            }
        }
        if let Some(job) = self.active_executions.lock().await.remove(&task_id) {
            job.cancel.cancel();
            job.handle.abort();
        }

        let _ = self.triggers.unregister(task_id).await;
        self.events.task_cancelled(task_id).await;

        tracing::info!(task_id = %task_id, "task cancelled");
        self.get_task(task_id).await
    }

    // -----------------------------------------------------------------------
    // Checkpoints
    // -----------------------------------------------------------------------

    /// Approve a checkpoint and continue execution: replan checkpoints run
    /// the replan, others return the task to READY and schedule ready nodes,
    /// falling back to a single orchestrator cycle if scheduling fails.
    pub async fn approve_checkpoint(
        self: &Arc<Self>,
        task_id: Uuid,
        step_id: &str,
        user_id: &str,
        feedback: Option<&str>,
        learn_preference: bool,
    ) -> CoreResult<Checkpoint> {
        let task = self.owned_task(task_id, user_id).await?;
        let is_replan = task.step(step_id).is_some_and(Step::has_replan_context);

        if is_replan {
            // Resolve the checkpoint record without unparking the step; the
            // replan supersedes this task entirely.
            let checkpoint = self
                .checkpoints
                .approve_replan_record(task_id, step_id, user_id, feedback)
                .await?;
            self.inbox
                .add_checkpoint_resolution_message(task_id, true, None)
                .await;
            self.approve_replan(task_id, step_id, user_id, feedback).await?;
            return Ok(checkpoint);
        }

        let checkpoint = self
            .checkpoints
            .approve_checkpoint(task_id, step_id, user_id, feedback, learn_preference)
            .await?;

        tracing::info!(
            task_id = %task_id,
            step_id = %step_id,
            user_id = %user_id,
            "checkpoint approved"
        );

        self.inbox
            .add_checkpoint_resolution_message(task_id, true, None)
            .await;

        // Back to READY only when no other steps remain parked.
        let task = self.get_task(task_id).await?;
        let others_parked = task
            .steps
            .iter()
            .any(|s| s.id != step_id && s.status == StepStatus::Checkpoint);
        if !others_parked {
            let _ = TaskStateMachine::transition(
                &self.pool,
                &self.cache,
                task_id,
                TaskStatus::Checkpoint,
                TaskStatus::Ready,
            )
            .await;
            match TaskStateMachine::transition(
                &self.pool,
                &self.cache,
                task_id,
                TaskStatus::Ready,
                TaskStatus::Executing,
            )
            .await
            {
                Ok(()) => {}
                Err(CoreError::InvalidTransition { current, .. })
                    if current == TaskStatus::Executing => {}
                Err(e) => return Err(e),
            }

            match self.scheduler.schedule_ready_nodes(task_id).await {
                Ok(scheduled) => {
                    tracing::info!(
                        task_id = %task_id,
                        step_id = %step_id,
                        scheduled_count = scheduled,
                        "scheduled ready steps after checkpoint approval"
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        task_id = %task_id,
                        error = %e,
                        "failed to schedule after approval, falling back to orchestrator"
                    );
                    let _ = self.orchestrator.execute_cycle(task_id).await?;
                }
            }
        } else {
            tracing::info!(
                task_id = %task_id,
                "other steps still need checkpoint approval"
            );
        }

        Ok(checkpoint)
    }

    /// Reject a checkpoint. No further work is scheduled; the task fails
    /// once it can no longer make progress.
    pub async fn reject_checkpoint(
        self: &Arc<Self>,
        task_id: Uuid,
        step_id: &str,
        user_id: &str,
        reason: &str,
        learn_preference: bool,
    ) -> CoreResult<Checkpoint> {
        self.owned_task(task_id, user_id).await?;
        let checkpoint = self
            .checkpoints
            .reject_checkpoint(task_id, step_id, user_id, reason, learn_preference)
            .await?;

        tracing::info!(
            task_id = %task_id,
            step_id = %step_id,
            reason = %reason,
            "checkpoint rejected"
        );
        self.inbox
            .add_checkpoint_resolution_message(task_id, false, Some(reason))
            .await;
        Ok(checkpoint)
    }

    /// Resolve a checkpoint with an explicit decision.
    pub async fn resolve_checkpoint(
        self: &Arc<Self>,
        task_id: Uuid,
        step_id: &str,
        user_id: &str,
        approve: bool,
        feedback: Option<&str>,
        learn_preference: bool,
    ) -> CoreResult<Checkpoint> {
        if approve {
            self.approve_checkpoint(task_id, step_id, user_id, feedback, learn_preference)
                .await
        } else {
            self.reject_checkpoint(
                task_id,
                step_id,
                user_id,
                feedback.unwrap_or("Rejected by user"),
                learn_preference,
            )
            .await
        }
    }

    /// Approve a strategic replan: supersede the task with the new version
    /// and start executing it.
    pub async fn approve_replan(
        self: &Arc<Self>,
        task_id: Uuid,
        step_id: &str,
        user_id: &str,
        feedback: Option<&str>,
    ) -> CoreResult<CycleResult> {
        let task = self.owned_task(task_id, user_id).await?;

        let result = self.orchestrator.execute_replan(task_id, step_id).await?;

        if let CycleResult::ReplanComplete {
            new_task_id,
            new_version,
        } = &result
        {
            // Resolve the checkpoint record when one was materialised.
            let _ = self
                .checkpoints
                .approve_replan_record(task_id, step_id, user_id, feedback)
                .await;

            let finding = findings::NewFinding {
                task_id,
                step_id: step_id.to_owned(),
                finding_type: "replan_approved".to_string(),
                content: serde_json::json!({
                    "user_id": user_id,
                    "feedback": feedback,
                    "new_task_id": new_task_id,
                    "new_task_version": new_version,
                }),
            };
            let _ = findings::append_finding(&self.pool, &finding).await;

            let diagnosis = task
                .step(step_id)
                .and_then(|s| s.inputs.get("_replan_context"))
                .and_then(|c| c.get("diagnosis"))
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_owned();
            let _ = self
                .preferences
                .learn_from_replan(user_id, task_id, &diagnosis, true)
                .await;

            tracing::info!(
                task_id = %task_id,
                new_task_id = %new_task_id,
                "replan approved and executed"
            );

            // Begin executing the new version.
            if let Err(e) = self.start_task(*new_task_id, user_id).await {
                tracing::warn!(
                    new_task_id = %new_task_id,
                    error = %e,
                    "failed to start replanned task"
                );
            }
        }

        Ok(result)
    }

    /// Reject a strategic replan: the step fails and the task fails with it.
    pub async fn reject_replan(
        self: &Arc<Self>,
        task_id: Uuid,
        step_id: &str,
        user_id: &str,
        reason: &str,
    ) -> CoreResult<()> {
        self.owned_task(task_id, user_id).await?;

        let error = format!("Replan rejected: {reason}");
        step_db::fail_step(&self.pool, task_id, step_id, &error, None).await?;
        self.cache
            .update_step(task_id, step_id, |s| {
                s.status = StepStatus::Failed;
                s.error_message = Some(error.clone());
            })
            .await;
        let _ = self.tree.fail_step(task_id, step_id, &error).await;
        let _ = TaskStateMachine::transition_to(
            &self.pool,
            &self.cache,
            task_id,
            TaskStatus::Failed,
        )
        .await;

        let finding = findings::NewFinding {
            task_id,
            step_id: step_id.to_owned(),
            finding_type: "replan_rejected".to_string(),
            content: serde_json::json!({"user_id": user_id, "reason": reason}),
        };
        let _ = findings::append_finding(&self.pool, &finding).await;

        let _ = self
            .preferences
            .learn_from_replan(user_id, task_id, "", false)
            .await;

        tracing::info!(task_id = %task_id, step_id = %step_id, "replan rejected");
        Ok(())
    }

    pub async fn list_pending_checkpoints(&self, user_id: &str) -> CoreResult<Vec<Checkpoint>> {
        self.checkpoints.list_pending_for_user(user_id).await
    }

    pub async fn list_pending_checkpoints_for_task(
        &self,
        task_id: Uuid,
    ) -> CoreResult<Vec<Checkpoint>> {
        self.checkpoints.list_pending_for_task(task_id).await
    }

    pub async fn get_checkpoint(
        &self,
        task_id: Uuid,
        step_id: &str,
    ) -> CoreResult<Option<Checkpoint>> {
        self.checkpoints.get_checkpoint(task_id, step_id).await
    }

    // -----------------------------------------------------------------------
    // Preferences
    // -----------------------------------------------------------------------

    pub fn preferences(&self) -> &Arc<PreferenceService> {
        &self.preferences
    }

    // -----------------------------------------------------------------------
    // Observation
    // -----------------------------------------------------------------------

    /// Stream execution events for a task: a connected snapshot, replay of
    /// recent events, then live events with heartbeats every 30 seconds.
    /// The stream ends after a terminal event.
    pub async fn observe_execution(
        self: &Arc<Self>,
        task_id: Uuid,
        user_id: &str,
    ) -> CoreResult<impl Stream<Item = Value> + use<>> {
        let task = self.owned_task(task_id, user_id).await?;
        let runtime = Arc::clone(self);

        Ok(async_stream::stream! {
            yield serde_json::json!({
                "type": "connected",
                "task_id": task_id,
                "status": task.status.to_string(),
                "steps_total": task.steps.len(),
                "steps_completed": task
                    .steps
                    .iter()
                    .filter(|s| s.status == StepStatus::Done)
                    .count(),
            });

            for event in runtime.events.get_recent(task_id, 100).await {
                yield serde_json::to_value(&event).unwrap_or(Value::Null);
            }

            if task.status.is_terminal() {
                yield serde_json::json!({
                    "type": "already_terminal",
                    "task_id": task_id,
                    "status": task.status.to_string(),
                });
                return;
            }

            let mut subscription = runtime.events.subscribe(task_id).await;
            let mut last_heartbeat = tokio::time::Instant::now();

            loop {
                match tokio::time::timeout(Duration::from_secs(1), subscription.recv()).await {
                    Ok(Ok(event)) => {
                        let terminal = event.is_terminal();
                        yield serde_json::to_value(&event).unwrap_or(Value::Null);
                        if terminal {
                            return;
                        }
                    }
                    Ok(Err(tokio::sync::broadcast::error::RecvError::Closed)) => return,
                    Ok(Err(tokio::sync::broadcast::error::RecvError::Lagged(_))) => continue,
                    Err(_) => {
                        if last_heartbeat.elapsed() >= HEARTBEAT_INTERVAL {
                            yield serde_json::json!({
                                "type": "heartbeat",
                                "timestamp": Utc::now().to_rfc3339(),
                            });
                            last_heartbeat = tokio::time::Instant::now();
                        }

                        // A terminal status without a bus event still ends
                        // the stream.
                        if let Ok(current) = runtime.get_task(task_id).await {
                            if current.status.is_terminal() {
                                yield serde_json::json!({
                                    "type": "task_status_update",
                                    "task_id": task_id,
                                    "status": current.status.to_string(),
                                });
                                return;
                            }
                        }
                    }
                }
            }
        })
    }

    // -----------------------------------------------------------------------
    // Triggers and cloning
    // -----------------------------------------------------------------------

    /// Clone a template task for a matching trigger event: deep-copy steps,
    /// substitute `${trigger_event.*}` tokens, strip the trigger metadata,
    /// build a fresh tree, and start asynchronously.
    pub async fn clone_task_for_trigger(
        self: &Arc<Self>,
        template_task_id: Uuid,
        trigger_event: &Value,
    ) -> CoreResult<Task> {
        let template = task_db::get_task_with_steps(&self.pool, template_task_id)
            .await?
            .ok_or_else(|| {
                CoreError::NotFound(format!("template task {template_task_id}"))
            })?;

        tracing::info!(
            template_task_id = %template_task_id,
            event_type = trigger_event.get("type").and_then(serde_json::Value::as_str).unwrap_or(""),
            "cloning task for trigger"
        );

        let mut metadata = template.metadata.clone();
        if let Some(obj) = metadata.as_object_mut() {
            obj.remove("trigger");
            obj.insert(
                "template_task_id".to_string(),
                Value::String(template_task_id.to_string()),
            );
            obj.insert("trigger_event".to_string(), trigger_event.clone());
            obj.insert(
                "triggered_at".to_string(),
                Value::String(Utc::now().to_rfc3339()),
            );
            obj.insert("source".to_string(), Value::String("trigger".to_string()));
        }

        let new = task_db::NewTask {
            goal: template.goal.clone(),
            user_id: template.user_id.clone(),
            organization_id: template.organization_id.clone(),
            status: TaskStatus::Planning,
            constraints: template.constraints.clone(),
            success_criteria: template.success_criteria.clone(),
            max_parallel_steps: template.max_parallel_steps,
            metadata,
            parent_task_id: None,
            version: 1,
        };
        let cloned = task_db::insert_task(&self.pool, &new).await?;

        let rows: Vec<Step> = template
            .steps
            .iter()
            .map(|step| {
                let mut clone = step.clone();
                clone.task_id = cloned.id;
                clone.inputs = substitute_event_refs(&step.inputs, trigger_event);
                clone.outputs = serde_json::json!({});
                clone.status = StepStatus::Pending;
                clone.retry_count = 0;
                clone.error_message = None;
                clone.started_at = None;
                clone.completed_at = None;
                clone.execution_time_ms = None;
                clone
            })
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

        let full = task_db::get_task_with_steps(&self.pool, cloned.id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("task {}", cloned.id)))?;
        let tree_id = self.tree.create_tree(&full).await;
        task_db::set_tree_id(&self.pool, cloned.id, tree_id).await?;
        TaskStateMachine::transition(
            &self.pool,
            &self.cache,
            cloned.id,
            TaskStatus::Planning,
            TaskStatus::Ready,
        )
        .await?;

        let mut cached = full;
        cached.tree_id = Some(tree_id);
        cached.status = TaskStatus::Ready;
        self.cache.put_task(cached.clone()).await;

        tracing::info!(
            template_task_id = %template_task_id,
            cloned_task_id = %cached.id,
            step_count = cached.steps.len(),
            "task cloned for trigger execution"
        );

        // Start asynchronously; the webhook response does not wait.
        let runtime = Arc::clone(self);
        let owner = cached.user_id.clone();
        let cloned_id = cached.id;
        tokio::spawn(async move {
            if let Err(e) = runtime.start_task(cloned_id, &owner).await {
                tracing::error!(task_id = %cloned_id, error = %e, "failed to start cloned task");
            }
        });

        Ok(cached)
    }

    /// Route a validated external event to matching triggers. Returns the
    /// ids of cloned tasks.
    pub async fn process_external_event(
        self: &Arc<Self>,
        event: &ExternalEvent,
        source_name: &str,
    ) -> CoreResult<Vec<Uuid>> {
        let matches = self
            .triggers
            .match_event(
                &event.organization_id,
                &event.event_type,
                Some(source_name),
                &event.payload,
            )
            .await?;

        let mut cloned = Vec::new();
        for trigger in matches {
            let payload = serde_json::json!({
                "type": event.event_type,
                "source_id": event.source_id,
                "payload": event.payload,
            });
            match self.clone_task_for_trigger(trigger.task_id, &payload).await {
                Ok(task) => cloned.push(task.id),
                Err(e) => {
                    tracing::error!(
                        template_task_id = %trigger.task_id,
                        error = %e,
                        "failed to clone task for trigger"
                    );
                }
            }
        }
        Ok(cloned)
    }

    /// Clone a template and execute it on behalf of a schedule automation.
    pub async fn clone_and_execute_from_automation(
        self: &Arc<Self>,
        automation_id: Uuid,
        template_task_id: Uuid,
        user_id: &str,
        organization_id: Option<&str>,
    ) -> CoreResult<Task> {
        let template = self.get_task(template_task_id).await?;
        if template.steps.is_empty() {
            return Err(CoreError::Validation(format!(
                "template task {template_task_id} has no steps"
            )));
        }

        let drafts: Vec<StepDraft> = template
            .steps
            .iter()
            .map(|step| {
                let mut draft = StepDraft::new(&step.id, &step.name, &step.agent_type);
                draft.description = step.description.clone();
                draft.domain = step.domain.clone();
                draft.inputs = step.inputs.clone();
                draft.dependencies = step.dependencies.clone();
                draft.checkpoint_required = step.checkpoint_required;
                draft.checkpoint_config = step.checkpoint_config.as_ref().map(|c| c.0.clone());
                draft.fallback_config = step.fallback_config.as_ref().map(|c| c.0.clone());
                draft.failure_policy = step.failure_policy;
                draft.is_critical = step.is_critical;
                draft.max_retries = step.max_retries;
                draft
            })
            .collect();

        let org = organization_id
            .map(str::to_owned)
            .or_else(|| template.organization_id.clone());
        let new_task = self
            .create_task_with_steps(
                user_id,
                org.as_deref(),
                &template.goal,
                drafts,
                Some(template.constraints.clone()),
                Some(serde_json::json!({
                    "automation_id": automation_id,
                    "template_task_id": template_task_id,
                    "source": "schedule",
                })),
            )
            .await?;

        self.start_task(new_task.id, user_id).await?;
        self.get_task(new_task.id).await
    }

    // -----------------------------------------------------------------------
    // Metadata and linking
    // -----------------------------------------------------------------------

    pub async fn set_parent_task(&self, task_id: Uuid, parent_task_id: Uuid) -> CoreResult<()> {
        task_db::set_parent_task(&self.pool, task_id, parent_task_id).await?;
        Ok(())
    }

    pub async fn link_conversation(&self, task_id: Uuid, conversation_id: &str) -> CoreResult<()> {
        let metadata = serde_json::json!({"conversation_id": conversation_id});
        task_db::merge_metadata(&self.pool, task_id, &metadata).await?;
        self.cache.merge_metadata(task_id, &metadata).await;
        Ok(())
    }

    pub async fn update_task_metadata(&self, task_id: Uuid, metadata: &Value) -> CoreResult<()> {
        task_db::merge_metadata(&self.pool, task_id, metadata).await?;
        self.cache.merge_metadata(task_id, metadata).await;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Recovery
    // -----------------------------------------------------------------------

    /// Background sweep: shortly after startup, fail tasks stuck in
    /// PLANNING past the timeout with a user-safe message.
    fn spawn_recovery_sweep(self: &Arc<Self>) {
        let runtime = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(RECOVERY_SWEEP_DELAY).await;
            if runtime.shutdown.is_cancelled() {
                return;
            }
            match task_db::get_stuck_planning_tasks(&runtime.pool, STUCK_PLANNING_MINUTES).await {
                Ok(stuck) => {
                    if !stuck.is_empty() {
                        tracing::info!(count = stuck.len(), "found stuck planning tasks to recover");
                    }
                    for task in stuck {
                        let result = TaskStateMachine::transition_to(
                            &runtime.pool,
                            &runtime.cache,
                            task.id,
                            TaskStatus::Failed,
                        )
                        .await;
                        match result {
                            Ok(()) => {
                                runtime
                                    .events
                                    .planning_failed(
                                        task.id,
                                        "Planning was interrupted. Please try again.",
                                    )
                                    .await;
                            }
                            Err(e) => {
                                tracing::warn!(
                                    task_id = %task.id,
                                    error = %e,
                                    "failed to recover stuck task"
                                );
                            }
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to check for stuck planning tasks");
                }
            }
        });
    }
}
