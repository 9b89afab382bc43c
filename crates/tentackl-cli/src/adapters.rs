//! Local port adapters for single-binary deployments.
//!
//! Concrete LLM, data-retrieval, and tool plugins live outside this
//! repository; these adapters cover what a bare deployment can do on its
//! own. Tasks created with explicit steps and local agent types run end to
//! end; goals that need LLM decomposition fail planning with a clear
//! message until a planner adapter is wired in.

use std::time::Instant;

use anyhow::{Result, bail};
use async_trait::async_trait;
use serde_json::Value;

use tentackl_db::models::{Step, Task};
use tentackl_core::planner::intent::PlanningIntent;
use tentackl_core::ports::{
    ExecutionContext, ExecutionOutcome, FastPathPlan, FastPathPlanner, IntentDetector,
    PluginExecutor, ReplanContext, ReplanPlan, StepDraft, TaskPlanner,
};

/// Intent detector that never claims a schedule or fast path.
#[derive(Debug, Default)]
pub struct PassiveIntentDetector;

#[async_trait]
impl IntentDetector for PassiveIntentDetector {
    async fn extract_intent(&self, _goal: &str) -> Result<Option<PlanningIntent>> {
        Ok(None)
    }
}

/// Fast-path planner that always declines.
#[derive(Debug, Default)]
pub struct DisabledFastPath;

#[async_trait]
impl FastPathPlanner for DisabledFastPath {
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

/// Planner stand-in used when no LLM adapter is configured.
#[derive(Debug, Default)]
pub struct UnconfiguredPlanner;

#[async_trait]
impl TaskPlanner for UnconfiguredPlanner {
    async fn generate_delegation_steps(
        &self,
        _goal: &str,
        _constraints: &Value,
        _skip_validation: bool,
    ) -> Result<Vec<StepDraft>> {
        bail!("no planner adapter configured; create tasks with explicit steps")
    }

    async fn replan(
        &self,
        _task: &Task,
        _failed_step: &Step,
        _context: &ReplanContext,
    ) -> Result<ReplanPlan> {
        bail!("no planner adapter configured; replanning is unavailable")
    }
}

/// Executes the local agent types that need no external service.
///
/// - `transform`: passes its resolved inputs through as outputs;
/// - `aggregate`: collects its resolved inputs under `aggregated_content`.
///
/// Anything else reports the unknown-subagent error that routes the task
/// into observer-driven replanning.
#[derive(Debug, Default)]
pub struct LocalPluginExecutor;

#[async_trait]
impl PluginExecutor for LocalPluginExecutor {
    async fn execute(
        &self,
        step: &Step,
        _model: &str,
        _context: &ExecutionContext,
    ) -> Result<ExecutionOutcome> {
        let started = Instant::now();
        let outcome = match step.agent_type.as_str() {
            "transform" => ExecutionOutcome::ok(
                serde_json::json!({"result": step.inputs}),
                started.elapsed().as_millis() as i64,
            ),
            "aggregate" => ExecutionOutcome::ok(
                serde_json::json!({"aggregated_content": step.inputs}),
                started.elapsed().as_millis() as i64,
            ),
            other => ExecutionOutcome::err(format!(
                "Unknown subagent type: {other}. No plugin adapter is configured for it."
            )),
        };
        Ok(outcome)
    }
}
