//! Ports consumed by the core.
//!
//! Each port is an object-safe `async_trait` so concrete adapters (LLM
//! clients, plugin runtimes, data-retrieval backends) can be injected at
//! wiring time. Defining them in one module keeps the orchestrator,
//! observer, and planner free of cyclic dependencies on each other's
//! implementations.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use uuid::Uuid;

use tentackl_db::models::{
    CheckpointConfig, FailurePolicy, FallbackConfig, Step, StepStatus, Task,
};

use crate::planner::intent::PlanningIntent;

// ---------------------------------------------------------------------------
// Planner output
// ---------------------------------------------------------------------------

/// A step as produced by a planner, before it is bound to a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDraft {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub agent_type: String,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default = "StepDraft::empty_object")]
    pub inputs: serde_json::Value,
    #[serde(default = "StepDraft::empty_object")]
    pub outputs: serde_json::Value,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub parallel_group: Option<String>,
    #[serde(default = "StepDraft::default_policy")]
    pub failure_policy: FailurePolicy,
    #[serde(default)]
    pub checkpoint_required: bool,
    #[serde(default)]
    pub checkpoint_config: Option<CheckpointConfig>,
    #[serde(default)]
    pub fallback_config: Option<FallbackConfig>,
    #[serde(default = "StepDraft::default_critical")]
    pub is_critical: bool,
    #[serde(default = "StepDraft::default_max_retries")]
    pub max_retries: i32,
}

impl StepDraft {
    fn empty_object() -> serde_json::Value {
        serde_json::json!({})
    }

    fn default_policy() -> FailurePolicy {
        FailurePolicy::AllOrNothing
    }

    fn default_critical() -> bool {
        true
    }

    fn default_max_retries() -> i32 {
        3
    }

    /// Minimal draft for tests and hand-written plans.
    pub fn new(id: &str, name: &str, agent_type: &str) -> Self {
        Self {
            id: id.to_owned(),
            name: name.to_owned(),
            description: String::new(),
            agent_type: agent_type.to_owned(),
            domain: None,
            inputs: Self::empty_object(),
            outputs: Self::empty_object(),
            dependencies: Vec::new(),
            parallel_group: None,
            failure_policy: Self::default_policy(),
            checkpoint_required: false,
            checkpoint_config: None,
            fallback_config: None,
            is_critical: Self::default_critical(),
            max_retries: Self::default_max_retries(),
        }
    }

    /// Bind the draft to a task, producing a persistable step row.
    pub fn into_step(self, task_id: Uuid, position: i32, status: StepStatus) -> Step {
        Step {
            task_id,
            id: self.id,
            name: self.name,
            description: self.description,
            agent_type: self.agent_type,
            domain: self.domain,
            inputs: self.inputs,
            outputs: self.outputs,
            dependencies: self.dependencies,
            status,
            parallel_group: self.parallel_group,
            failure_policy: self.failure_policy,
            checkpoint_required: self.checkpoint_required,
            checkpoint_config: self.checkpoint_config.map(Json),
            fallback_config: self.fallback_config.map(Json),
            is_critical: self.is_critical,
            retry_count: 0,
            max_retries: self.max_retries,
            error_message: None,
            started_at: None,
            completed_at: None,
            execution_time_ms: None,
            position,
        }
    }
}

/// Context handed to the planner's replan entry: the observer's diagnosis
/// plus everything salvageable from the failed run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplanContext {
    pub diagnosis: String,
    #[serde(default)]
    pub affected_steps: Vec<String>,
    #[serde(default)]
    pub completed_outputs: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub constraints: Vec<String>,
    #[serde(default)]
    pub suggested_approach: Option<String>,
}

/// A revised plan returned by [`TaskPlanner::replan`].
#[derive(Debug, Clone)]
pub struct ReplanPlan {
    /// Replacement goal, when the planner narrowed it; `None` keeps the
    /// original.
    pub goal: Option<String>,
    pub steps: Vec<StepDraft>,
}

/// LLM-backed plan decomposition.
#[async_trait]
pub trait TaskPlanner: Send + Sync {
    /// Decompose a goal into typed steps.
    ///
    /// An empty result counts as a failure at the pipeline level and is
    /// retried.
    async fn generate_delegation_steps(
        &self,
        goal: &str,
        constraints: &serde_json::Value,
        skip_validation: bool,
    ) -> Result<Vec<StepDraft>>;

    /// Produce a revised plan for a task whose tactical recovery options are
    /// exhausted.
    async fn replan(
        &self,
        task: &Task,
        failed_step: &Step,
        context: &ReplanContext,
    ) -> Result<ReplanPlan>;
}

/// Classifies a goal: scheduling intent, one-shot rewrite, fast-path hints.
#[async_trait]
pub trait IntentDetector: Send + Sync {
    async fn extract_intent(&self, goal: &str) -> Result<Option<PlanningIntent>>;
}

/// A pre-computed plan satisfied by a single data-retrieval query.
#[derive(Debug, Clone)]
pub struct FastPathPlan {
    /// Steps with outputs already populated; persisted as done.
    pub steps: Vec<StepDraft>,
    /// Metadata merged into the task (`fast_path`, query details, ...).
    pub metadata: serde_json::Value,
}

/// Shortcut planner that answers data-retrieval goals without the LLM.
#[async_trait]
pub trait FastPathPlanner: Send + Sync {
    async fn try_fast_path(
        &self,
        user_id: &str,
        organization_id: Option<&str>,
        goal: &str,
        intent: Option<&PlanningIntent>,
    ) -> Result<Option<FastPathPlan>>;
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

/// Trusted context assembled from the primary store for plugin execution.
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    pub task_id: Uuid,
    pub user_id: String,
    pub organization_id: Option<String>,
    pub file_references: Option<serde_json::Value>,
    /// Relevant memories formatted for prompt injection, when a memory
    /// port is wired.
    pub memory_context: Option<String>,
}

/// Result of executing one step through a plugin.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub success: bool,
    pub outputs: serde_json::Value,
    pub error: Option<String>,
    pub execution_time_ms: i64,
    pub metadata: Option<serde_json::Value>,
}

impl ExecutionOutcome {
    pub fn ok(outputs: serde_json::Value, execution_time_ms: i64) -> Self {
        Self {
            success: true,
            outputs,
            error: None,
            execution_time_ms,
            metadata: None,
        }
    }

    pub fn err(error: impl Into<String>) -> Self {
        Self {
            success: false,
            outputs: serde_json::json!({}),
            error: Some(error.into()),
            execution_time_ms: 0,
            metadata: None,
        }
    }
}

/// Executes one step against a concrete capability (LLM subagent, HTTP
/// tool, ...). Plugin failures are reported in the outcome, not as `Err`;
/// `Err` is reserved for infrastructure faults.
#[async_trait]
pub trait PluginExecutor: Send + Sync {
    async fn execute(
        &self,
        step: &Step,
        model: &str,
        context: &ExecutionContext,
    ) -> Result<ExecutionOutcome>;
}

/// Minimal completion seam for the observer's LLM-assisted analysis.
#[async_trait]
pub trait LlmAdvisor: Send + Sync {
    async fn complete(&self, prompt: &str, max_tokens: u32, temperature: f32) -> Result<String>;
}

/// Retrieval of stored memories, formatted for prompt injection. The
/// orchestrator threads the result into the execution context so LLM-backed
/// plugins can ground their prompts.
#[async_trait]
pub trait MemoryOperations: Send + Sync {
    async fn format_for_injection(&self, query: &str, max_tokens: u32) -> Result<String>;
}

// Compile-time assertions: ports must be object-safe.
const _: () = {
    fn _assert_object_safe(
        _: &dyn TaskPlanner,
        _: &dyn IntentDetector,
        _: &dyn FastPathPlanner,
        _: &dyn PluginExecutor,
        _: &dyn LlmAdvisor,
        _: &dyn MemoryOperations,
    ) {
    }
};
