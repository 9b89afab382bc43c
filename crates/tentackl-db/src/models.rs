use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use sqlx::types::Json;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Status of a task through its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Planning,
    Ready,
    Executing,
    Checkpoint,
    Paused,
    Completed,
    Failed,
    Cancelled,
    Superseded,
}

impl TaskStatus {
    /// Terminal statuses admit no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Superseded
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Planning => "planning",
            Self::Ready => "ready",
            Self::Executing => "executing",
            Self::Checkpoint => "checkpoint",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Superseded => "superseded",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = TaskStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "planning" => Ok(Self::Planning),
            "ready" => Ok(Self::Ready),
            "executing" => Ok(Self::Executing),
            "checkpoint" => Ok(Self::Checkpoint),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            "superseded" => Ok(Self::Superseded),
            other => Err(TaskStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskStatus`] string.
#[derive(Debug, Clone)]
pub struct TaskStatusParseError(pub String);

impl fmt::Display for TaskStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task status: {:?}", self.0)
    }
}

impl std::error::Error for TaskStatusParseError {}

// ---------------------------------------------------------------------------

/// Status of a single step within a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Checkpoint,
    Done,
    Failed,
    Skipped,
}

impl StepStatus {
    /// Done and skipped both satisfy downstream dependencies.
    pub fn is_terminal_success(self) -> bool {
        matches!(self, Self::Done | Self::Skipped)
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Checkpoint => "checkpoint",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

impl FromStr for StepStatus {
    type Err = StepStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "checkpoint" => Ok(Self::Checkpoint),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            other => Err(StepStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`StepStatus`] string.
#[derive(Debug, Clone)]
pub struct StepStatusParseError(pub String);

impl fmt::Display for StepStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid step status: {:?}", self.0)
    }
}

impl std::error::Error for StepStatusParseError {}

// ---------------------------------------------------------------------------

/// How failures inside a parallel step group are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    AllOrNothing,
    BestEffort,
    FailFast,
}

impl fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::AllOrNothing => "all_or_nothing",
            Self::BestEffort => "best_effort",
            Self::FailFast => "fail_fast",
        };
        f.write_str(s)
    }
}

impl FromStr for FailurePolicy {
    type Err = FailurePolicyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "all_or_nothing" => Ok(Self::AllOrNothing),
            "best_effort" => Ok(Self::BestEffort),
            "fail_fast" => Ok(Self::FailFast),
            other => Err(FailurePolicyParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`FailurePolicy`] string.
#[derive(Debug, Clone)]
pub struct FailurePolicyParseError(pub String);

impl fmt::Display for FailurePolicyParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid failure policy: {:?}", self.0)
    }
}

impl std::error::Error for FailurePolicyParseError {}

// ---------------------------------------------------------------------------

/// Kind of a checkpoint gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum CheckpointKind {
    Approval,
    Qa,
    Replan,
}

impl fmt::Display for CheckpointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Approval => "approval",
            Self::Qa => "qa",
            Self::Replan => "replan",
        };
        f.write_str(s)
    }
}

impl FromStr for CheckpointKind {
    type Err = CheckpointKindParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "approval" => Ok(Self::Approval),
            "qa" => Ok(Self::Qa),
            "replan" => Ok(Self::Replan),
            other => Err(CheckpointKindParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`CheckpointKind`] string.
#[derive(Debug, Clone)]
pub struct CheckpointKindParseError(pub String);

impl fmt::Display for CheckpointKindParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid checkpoint kind: {:?}", self.0)
    }
}

impl std::error::Error for CheckpointKindParseError {}

// ---------------------------------------------------------------------------

/// Resolution state of a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum CheckpointDecision {
    Pending,
    Approved,
    Rejected,
    AutoApproved,
}

impl CheckpointDecision {
    pub fn is_approved(self) -> bool {
        matches!(self, Self::Approved | Self::AutoApproved)
    }
}

impl fmt::Display for CheckpointDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::AutoApproved => "auto_approved",
        };
        f.write_str(s)
    }
}

impl FromStr for CheckpointDecision {
    type Err = CheckpointDecisionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            "auto_approved" => Ok(Self::AutoApproved),
            other => Err(CheckpointDecisionParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`CheckpointDecision`] string.
#[derive(Debug, Clone)]
pub struct CheckpointDecisionParseError(pub String);

impl fmt::Display for CheckpointDecisionParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid checkpoint decision: {:?}", self.0)
    }
}

impl std::error::Error for CheckpointDecisionParseError {}

// ---------------------------------------------------------------------------

/// Scope of a trigger registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TriggerScope {
    Org,
    User,
}

impl fmt::Display for TriggerScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Org => "org",
            Self::User => "user",
        };
        f.write_str(s)
    }
}

impl FromStr for TriggerScope {
    type Err = TriggerScopeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "org" => Ok(Self::Org),
            "user" => Ok(Self::User),
            other => Err(TriggerScopeParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TriggerScope`] string.
#[derive(Debug, Clone)]
pub struct TriggerScopeParseError(pub String);

impl fmt::Display for TriggerScopeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid trigger scope: {:?}", self.0)
    }
}

impl std::error::Error for TriggerScopeParseError {}

// ---------------------------------------------------------------------------

/// Authentication scheme for an external event source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SourceAuthType {
    ApiKey,
    Bearer,
    Hmac,
}

impl fmt::Display for SourceAuthType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::ApiKey => "api_key",
            Self::Bearer => "bearer",
            Self::Hmac => "hmac",
        };
        f.write_str(s)
    }
}

impl FromStr for SourceAuthType {
    type Err = SourceAuthTypeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "api_key" => Ok(Self::ApiKey),
            "bearer" => Ok(Self::Bearer),
            "hmac" => Ok(Self::Hmac),
            other => Err(SourceAuthTypeParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`SourceAuthType`] string.
#[derive(Debug, Clone)]
pub struct SourceAuthTypeParseError(pub String);

impl fmt::Display for SourceAuthTypeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid source auth type: {:?}", self.0)
    }
}

impl std::error::Error for SourceAuthTypeParseError {}

// ---------------------------------------------------------------------------

/// Kind of a user-facing inbox message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum InboxKind {
    Step,
    Checkpoint,
    Resolution,
    Completion,
}

impl fmt::Display for InboxKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Step => "step",
            Self::Checkpoint => "checkpoint",
            Self::Resolution => "resolution",
            Self::Completion => "completion",
        };
        f.write_str(s)
    }
}

impl FromStr for InboxKind {
    type Err = InboxKindParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "step" => Ok(Self::Step),
            "checkpoint" => Ok(Self::Checkpoint),
            "resolution" => Ok(Self::Resolution),
            "completion" => Ok(Self::Completion),
            other => Err(InboxKindParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`InboxKind`] string.
#[derive(Debug, Clone)]
pub struct InboxKindParseError(pub String);

impl fmt::Display for InboxKindParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid inbox message kind: {:?}", self.0)
    }
}

impl std::error::Error for InboxKindParseError {}

// ---------------------------------------------------------------------------
// Embedded configs (stored as JSONB on steps)
// ---------------------------------------------------------------------------

/// User-approval gate configuration attached to a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointConfig {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "CheckpointConfig::default_kind")]
    pub kind: CheckpointKind,
    #[serde(default)]
    pub preference_key: Option<String>,
    #[serde(default)]
    pub preview_fields: Vec<String>,
}

impl CheckpointConfig {
    fn default_kind() -> CheckpointKind {
        CheckpointKind::Approval
    }

    /// Default config for a step that requires approval but carries none.
    pub fn default_for(step: &Step) -> Self {
        Self {
            name: format!("Approve {}", step.name),
            description: if step.description.is_empty() {
                format!("Step {} requires approval before execution", step.id)
            } else {
                step.description.clone()
            },
            kind: CheckpointKind::Approval,
            preference_key: Some(format!("checkpoint:{}:{}", step.agent_type, step.name)),
            preview_fields: Vec::new(),
        }
    }
}

/// Fallback options for a step: alternative models first, then APIs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FallbackConfig {
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default)]
    pub apis: Vec<String>,
}

impl FallbackConfig {
    pub fn has_options(&self) -> bool {
        !self.models.is_empty() || !self.apis.is_empty()
    }

    pub fn first_model(&self) -> Option<&str> {
        self.models.first().map(String::as_str)
    }

    pub fn first_api(&self) -> Option<&str> {
        self.apis.first().map(String::as_str)
    }

    /// Drop a consumed fallback target so the list narrows monotonically.
    pub fn remove_target(&mut self, target: &str) {
        self.models.retain(|m| m != target);
        self.apis.retain(|a| a != target);
    }
}

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

/// A task -- a user goal expressed as a DAG of steps.
///
/// `steps` is not a column; callers populate it from the `steps` table via
/// [`crate::queries::tasks::get_task_with_steps`].
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Task {
    pub id: Uuid,
    pub goal: String,
    pub user_id: String,
    pub organization_id: Option<String>,
    pub status: TaskStatus,
    pub constraints: serde_json::Value,
    pub success_criteria: serde_json::Value,
    pub max_parallel_steps: i32,
    pub metadata: serde_json::Value,
    pub tree_id: Option<Uuid>,
    pub parent_task_id: Option<Uuid>,
    pub superseded_by: Option<Uuid>,
    pub version: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    #[sqlx(skip)]
    #[serde(default)]
    pub steps: Vec<Step>,
}

impl Task {
    pub fn step(&self, step_id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    pub fn step_mut(&mut self, step_id: &str) -> Option<&mut Step> {
        self.steps.iter_mut().find(|s| s.id == step_id)
    }

    /// Whether every step reached a terminal-success status.
    pub fn all_steps_done(&self) -> bool {
        self.steps.iter().all(|s| s.status.is_terminal_success())
    }

    /// A step is ready when it is pending and every dependency reached a
    /// terminal-success status.
    pub fn is_step_ready(&self, step: &Step) -> bool {
        step.status == StepStatus::Pending
            && step.dependencies.iter().all(|dep| {
                self.step(dep)
                    .map(|d| d.status.is_terminal_success())
                    .unwrap_or(false)
            })
    }

    /// Ready steps grouped for dispatch: steps sharing a `parallel_group`
    /// tag form one group, ungrouped ready steps are singletons. Groups are
    /// ordered by the position of their first member.
    pub fn ready_step_groups(&self) -> Vec<Vec<&Step>> {
        let mut groups: Vec<(String, Vec<&Step>)> = Vec::new();
        let mut singles: Vec<&Step> = Vec::new();

        for step in &self.steps {
            if !self.is_step_ready(step) {
                continue;
            }
            match &step.parallel_group {
                Some(tag) => {
                    if let Some((_, members)) = groups.iter_mut().find(|(t, _)| t == tag) {
                        members.push(step);
                    } else {
                        groups.push((tag.clone(), vec![step]));
                    }
                }
                None => singles.push(step),
            }
        }

        let mut out: Vec<(i32, Vec<&Step>)> = groups
            .into_iter()
            .map(|(_, members)| (members[0].position, members))
            .chain(singles.into_iter().map(|s| (s.position, vec![s])))
            .collect();
        out.sort_by_key(|(pos, _)| *pos);
        out.into_iter().map(|(_, members)| members).collect()
    }
}

/// A step -- one unit of work bound to a capability.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Step {
    pub task_id: Uuid,
    pub id: String,
    pub name: String,
    pub description: String,
    pub agent_type: String,
    pub domain: Option<String>,
    pub inputs: serde_json::Value,
    pub outputs: serde_json::Value,
    pub dependencies: Vec<String>,
    pub status: StepStatus,
    pub parallel_group: Option<String>,
    pub failure_policy: FailurePolicy,
    pub checkpoint_required: bool,
    pub checkpoint_config: Option<Json<CheckpointConfig>>,
    pub fallback_config: Option<Json<FallbackConfig>>,
    pub is_critical: bool,
    pub retry_count: i32,
    pub max_retries: i32,
    pub error_message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub execution_time_ms: Option<i64>,
    pub position: i32,
}

impl Step {
    /// Whether the step carries a strategic-replan marker in its inputs.
    pub fn has_replan_context(&self) -> bool {
        self.inputs.get("_replan_context").is_some()
    }
}

/// An immutable finding appended by a step execution.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Finding {
    pub id: i64,
    pub task_id: Uuid,
    pub step_id: String,
    pub finding_type: String,
    pub content: serde_json::Value,
    pub recorded_at: DateTime<Utc>,
}

/// A checkpoint record: one per (task, step) requiring approval.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Checkpoint {
    pub id: Uuid,
    pub task_id: Uuid,
    pub step_id: String,
    pub name: String,
    pub description: String,
    pub kind: CheckpointKind,
    pub decision: CheckpointDecision,
    pub preview: Option<serde_json::Value>,
    pub questions: Option<serde_json::Value>,
    pub alternatives: Option<serde_json::Value>,
    pub feedback: Option<String>,
    pub resolved_by: Option<String>,
    pub preference_key: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Learned approval preference per (user, preference key).
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Preference {
    pub id: Uuid,
    pub user_id: String,
    pub preference_key: String,
    pub approvals: i32,
    pub rejections: i32,
    pub last_decision: Option<CheckpointDecision>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Trigger registration: clones a template task when a matching external
/// event arrives.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Trigger {
    pub task_id: Uuid,
    pub organization_id: String,
    pub user_id: String,
    pub event_pattern: String,
    pub source_filter: Option<String>,
    pub condition: Option<serde_json::Value>,
    pub enabled: bool,
    pub scope: TriggerScope,
    pub created_at: DateTime<Utc>,
}

/// Schedule registration created from a planning-time scheduling intent.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Automation {
    pub id: Uuid,
    pub task_id: Uuid,
    pub user_id: String,
    pub organization_id: Option<String>,
    pub goal: String,
    pub cron: Option<String>,
    pub execute_at: Option<DateTime<Utc>>,
    pub timezone: String,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

/// A registered external event source for the webhook gateway.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct EventSource {
    pub id: Uuid,
    pub organization_id: String,
    pub name: String,
    pub auth_type: SourceAuthType,
    pub secret_hash: String,
    pub created_at: DateTime<Utc>,
}

/// A user-facing inbox message recorded during execution.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct InboxMessage {
    pub id: i64,
    pub task_id: Uuid,
    pub kind: InboxKind,
    pub title: String,
    pub body: String,
    pub data: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_status_display_roundtrip() {
        let variants = [
            TaskStatus::Planning,
            TaskStatus::Ready,
            TaskStatus::Executing,
            TaskStatus::Checkpoint,
            TaskStatus::Paused,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Cancelled,
            TaskStatus::Superseded,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: TaskStatus = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn task_status_invalid() {
        assert!("bogus".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn terminal_statuses() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Superseded.is_terminal());
        assert!(!TaskStatus::Checkpoint.is_terminal());
        assert!(!TaskStatus::Paused.is_terminal());
    }

    #[test]
    fn step_status_display_roundtrip() {
        let variants = [
            StepStatus::Pending,
            StepStatus::Running,
            StepStatus::Checkpoint,
            StepStatus::Done,
            StepStatus::Failed,
            StepStatus::Skipped,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: StepStatus = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn step_status_terminal_success() {
        assert!(StepStatus::Done.is_terminal_success());
        assert!(StepStatus::Skipped.is_terminal_success());
        assert!(!StepStatus::Failed.is_terminal_success());
        assert!(!StepStatus::Checkpoint.is_terminal_success());
    }

    #[test]
    fn failure_policy_display_roundtrip() {
        let variants = [
            FailurePolicy::AllOrNothing,
            FailurePolicy::BestEffort,
            FailurePolicy::FailFast,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: FailurePolicy = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn checkpoint_enums_roundtrip() {
        for v in [
            CheckpointKind::Approval,
            CheckpointKind::Qa,
            CheckpointKind::Replan,
        ] {
            assert_eq!(v, v.to_string().parse().unwrap());
        }
        for v in [
            CheckpointDecision::Pending,
            CheckpointDecision::Approved,
            CheckpointDecision::Rejected,
            CheckpointDecision::AutoApproved,
        ] {
            assert_eq!(v, v.to_string().parse().unwrap());
        }
        assert!(CheckpointDecision::AutoApproved.is_approved());
        assert!(!CheckpointDecision::Pending.is_approved());
    }

    #[test]
    fn trigger_scope_and_auth_roundtrip() {
        for v in [TriggerScope::Org, TriggerScope::User] {
            assert_eq!(v, v.to_string().parse().unwrap());
        }
        for v in [
            SourceAuthType::ApiKey,
            SourceAuthType::Bearer,
            SourceAuthType::Hmac,
        ] {
            assert_eq!(v, v.to_string().parse().unwrap());
        }
        assert!("password".parse::<SourceAuthType>().is_err());
    }

    #[test]
    fn inbox_kind_roundtrip() {
        for v in [
            InboxKind::Step,
            InboxKind::Checkpoint,
            InboxKind::Resolution,
            InboxKind::Completion,
        ] {
            assert_eq!(v, v.to_string().parse().unwrap());
        }
    }

    #[test]
    fn fallback_config_narrows() {
        let mut cfg = FallbackConfig {
            models: vec!["model-a".into(), "model-b".into()],
            apis: vec!["https://api.example.com".into()],
        };
        assert!(cfg.has_options());
        assert_eq!(cfg.first_model(), Some("model-a"));

        cfg.remove_target("model-a");
        assert_eq!(cfg.first_model(), Some("model-b"));

        cfg.remove_target("model-b");
        cfg.remove_target("https://api.example.com");
        assert!(!cfg.has_options());
        assert_eq!(cfg.first_api(), None);
    }

    fn step(id: &str, deps: &[&str], status: StepStatus, group: Option<&str>) -> Step {
        Step {
            task_id: Uuid::nil(),
            id: id.to_string(),
            name: id.to_string(),
            description: String::new(),
            agent_type: "compose".to_string(),
            domain: None,
            inputs: serde_json::json!({}),
            outputs: serde_json::json!({}),
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
            status,
            parallel_group: group.map(String::from),
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

    fn task_with(steps: Vec<Step>) -> Task {
        let mut steps = steps;
        for (i, s) in steps.iter_mut().enumerate() {
            s.position = i as i32;
        }
        Task {
            id: Uuid::nil(),
            goal: "test".into(),
            user_id: "u1".into(),
            organization_id: None,
            status: TaskStatus::Executing,
            constraints: serde_json::json!({}),
            success_criteria: serde_json::json!({}),
            max_parallel_steps: 5,
            metadata: serde_json::json!({}),
            tree_id: None,
            parent_task_id: None,
            superseded_by: None,
            version: 1,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            completed_at: None,
            steps,
        }
    }

    #[test]
    fn ready_groups_respect_dependencies() {
        let task = task_with(vec![
            step("step_1", &[], StepStatus::Done, None),
            step("step_2", &["step_1"], StepStatus::Pending, None),
            step("step_3", &["step_2"], StepStatus::Pending, None),
        ]);

        let groups = task.ready_step_groups();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0][0].id, "step_2");
    }

    #[test]
    fn skipped_dependency_counts_as_satisfied() {
        let task = task_with(vec![
            step("step_1", &[], StepStatus::Skipped, None),
            step("step_2", &["step_1"], StepStatus::Pending, None),
        ]);
        assert_eq!(task.ready_step_groups().len(), 1);
    }

    #[test]
    fn parallel_group_members_share_one_group() {
        let task = task_with(vec![
            step("a", &[], StepStatus::Pending, Some("fetch")),
            step("b", &[], StepStatus::Pending, Some("fetch")),
            step("c", &[], StepStatus::Pending, None),
        ]);

        let groups = task.ready_step_groups();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].len(), 2);
        assert_eq!(groups[1][0].id, "c");
    }

    #[test]
    fn failed_dependency_blocks_step() {
        let task = task_with(vec![
            step("step_1", &[], StepStatus::Failed, None),
            step("step_2", &["step_1"], StepStatus::Pending, None),
        ]);
        assert!(task.ready_step_groups().is_empty());
    }
}
