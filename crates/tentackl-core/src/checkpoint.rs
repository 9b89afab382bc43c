//! Checkpoint manager and preference learning.
//!
//! Every required checkpoint is materialised in both the primary store and
//! the cache. Resolution flows through here; learned preferences can
//! auto-approve future checkpoints that share a preference key.

use std::sync::Arc;

use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use tentackl_db::models::{Checkpoint, CheckpointConfig, CheckpointDecision, Step, StepStatus};
use tentackl_db::queries::{checkpoints as checkpoint_db, preferences as preference_db, steps as step_db};

use crate::cache::TaskCache;
use crate::error::{CoreError, CoreResult};
use crate::tree::TreeStore;

/// Consecutive approvals required before a preference auto-approves.
const AUTO_APPROVE_THRESHOLD: i32 = 3;

/// Preference key used when learning from replan approvals.
pub const REPLAN_PREFERENCE_KEY: &str = "delegation.replan";

// ---------------------------------------------------------------------------
// Preference learning
// ---------------------------------------------------------------------------

/// Records approval outcomes and answers auto-approval queries.
pub struct PreferenceService {
    pool: PgPool,
}

impl PreferenceService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Record an approve/reject outcome under a preference key.
    pub async fn record_outcome(
        &self,
        user_id: &str,
        preference_key: &str,
        approved: bool,
    ) -> CoreResult<()> {
        preference_db::record_outcome(&self.pool, user_id, preference_key, approved).await?;
        Ok(())
    }

    /// Whether future checkpoints with this key should auto-approve: a
    /// consistent approval history with no rejections.
    pub async fn auto_approve_decision(
        &self,
        user_id: &str,
        preference_key: &str,
    ) -> CoreResult<bool> {
        let preference =
            preference_db::get_preference(&self.pool, user_id, preference_key).await?;
        Ok(preference
            .map(|p| p.rejections == 0 && p.approvals >= AUTO_APPROVE_THRESHOLD)
            .unwrap_or(false))
    }

    /// Aggregate stats for a user's learned preferences.
    pub async fn get_preference_stats(&self, user_id: &str) -> CoreResult<Value> {
        let preferences = preference_db::list_preferences_for_user(&self.pool, user_id).await?;
        let approvals: i32 = preferences.iter().map(|p| p.approvals).sum();
        let rejections: i32 = preferences.iter().map(|p| p.rejections).sum();
        Ok(serde_json::json!({
            "preference_count": preferences.len(),
            "total_approvals": approvals,
            "total_rejections": rejections,
        }))
    }

    /// Record the outcome of a replan approval under the shared replan key.
    pub async fn learn_from_replan(
        &self,
        user_id: &str,
        task_id: Uuid,
        diagnosis: &str,
        approved: bool,
    ) -> CoreResult<()> {
        tracing::debug!(
            task_id = %task_id,
            approved = approved,
            diagnosis = %diagnosis,
            "learning from replan outcome"
        );
        self.record_outcome(user_id, REPLAN_PREFERENCE_KEY, approved)
            .await
    }

    pub async fn list_preferences(
        &self,
        user_id: &str,
    ) -> CoreResult<Vec<tentackl_db::models::Preference>> {
        Ok(preference_db::list_preferences_for_user(&self.pool, user_id).await?)
    }

    pub async fn get_preference(
        &self,
        id: Uuid,
    ) -> CoreResult<Option<tentackl_db::models::Preference>> {
        Ok(preference_db::get_preference_by_id(&self.pool, id).await?)
    }

    pub async fn delete_preference(&self, id: Uuid) -> CoreResult<()> {
        preference_db::delete_preference(&self.pool, id).await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Checkpoint manager
// ---------------------------------------------------------------------------

/// Approval state machine for (task, step) checkpoints.
pub struct CheckpointManager {
    pool: PgPool,
    cache: Arc<TaskCache>,
    tree: Arc<TreeStore>,
    preferences: Arc<PreferenceService>,
}

impl CheckpointManager {
    pub fn new(
        pool: PgPool,
        cache: Arc<TaskCache>,
        tree: Arc<TreeStore>,
        preferences: Arc<PreferenceService>,
    ) -> Self {
        Self {
            pool,
            cache,
            tree,
            preferences,
        }
    }

    /// Materialise the checkpoint for a step, consulting learned
    /// preferences for auto-approval.
    pub async fn create_checkpoint(
        &self,
        task_id: Uuid,
        step: &Step,
        user_id: &str,
    ) -> CoreResult<Checkpoint> {
        let config = step
            .checkpoint_config
            .as_ref()
            .map(|c| c.0.clone())
            .unwrap_or_else(|| CheckpointConfig::default_for(step));

        let mut decision = CheckpointDecision::Pending;
        if let Some(key) = &config.preference_key {
            if self.preferences.auto_approve_decision(user_id, key).await? {
                decision = CheckpointDecision::AutoApproved;
                tracing::info!(
                    task_id = %task_id,
                    step_id = %step.id,
                    preference_key = %key,
                    "checkpoint auto-approved from learned preference"
                );
            }
        }

        let new = checkpoint_db::NewCheckpoint {
            task_id,
            step_id: step.id.clone(),
            name: config.name.clone(),
            description: config.description.clone(),
            kind: config.kind,
            decision,
            preview: Some(build_checkpoint_preview(step, &config)),
            questions: None,
            alternatives: None,
            preference_key: config.preference_key.clone(),
            expires_at: None,
        };
        let checkpoint = checkpoint_db::upsert_checkpoint(&self.pool, &new).await?;
        self.cache.put_checkpoint(checkpoint.clone()).await;
        Ok(checkpoint)
    }

    /// Whether the step's checkpoint is already approved or auto-approved.
    pub async fn is_already_approved(&self, task_id: Uuid, step_id: &str) -> CoreResult<bool> {
        if let Some(checkpoint) = self.cache.get_checkpoint(task_id, step_id).await {
            return Ok(checkpoint.decision.is_approved());
        }
        let checkpoint = checkpoint_db::get_checkpoint(&self.pool, task_id, step_id).await?;
        Ok(checkpoint.map(|c| c.decision.is_approved()).unwrap_or(false))
    }

    /// Fetch one checkpoint record, cache first.
    pub async fn get_checkpoint(
        &self,
        task_id: Uuid,
        step_id: &str,
    ) -> CoreResult<Option<Checkpoint>> {
        if let Some(checkpoint) = self.cache.get_checkpoint(task_id, step_id).await {
            return Ok(Some(checkpoint));
        }
        Ok(checkpoint_db::get_checkpoint(&self.pool, task_id, step_id).await?)
    }

    /// Approve a pending checkpoint, optionally learning the preference,
    /// and return the step to pending in tree, primary store, and cache.
    pub async fn approve_checkpoint(
        &self,
        task_id: Uuid,
        step_id: &str,
        user_id: &str,
        feedback: Option<&str>,
        learn_preference: bool,
    ) -> CoreResult<Checkpoint> {
        let checkpoint = self
            .resolve(
                task_id,
                step_id,
                user_id,
                CheckpointDecision::Approved,
                feedback,
                learn_preference,
            )
            .await?;

        // Clear the gate so the scheduler can dispatch the step again.
        step_db::clear_step_checkpoint(&self.pool, task_id, step_id).await?;
        self.cache
            .update_step(task_id, step_id, |s| {
                s.checkpoint_required = false;
                s.status = StepStatus::Pending;
            })
            .await;
        self.tree.reset_step(task_id, step_id).await?;

        Ok(checkpoint)
    }

    /// Approve a replan checkpoint record without unparking the step; the
    /// replan supersedes the task, so the step never runs again.
    pub async fn approve_replan_record(
        &self,
        task_id: Uuid,
        step_id: &str,
        user_id: &str,
        feedback: Option<&str>,
    ) -> CoreResult<Checkpoint> {
        self.resolve(
            task_id,
            step_id,
            user_id,
            CheckpointDecision::Approved,
            feedback,
            false,
        )
        .await
    }

    /// Reject a pending checkpoint. The step stays parked; the task fails
    /// once it can no longer make progress.
    pub async fn reject_checkpoint(
        &self,
        task_id: Uuid,
        step_id: &str,
        user_id: &str,
        reason: &str,
        learn_preference: bool,
    ) -> CoreResult<Checkpoint> {
        self.resolve(
            task_id,
            step_id,
            user_id,
            CheckpointDecision::Rejected,
            Some(reason),
            learn_preference,
        )
        .await
    }

    async fn resolve(
        &self,
        task_id: Uuid,
        step_id: &str,
        user_id: &str,
        decision: CheckpointDecision,
        feedback: Option<&str>,
        learn_preference: bool,
    ) -> CoreResult<Checkpoint> {
        let resolved = checkpoint_db::resolve_checkpoint(
            &self.pool, task_id, step_id, decision, user_id, feedback,
        )
        .await?;

        let checkpoint = match resolved {
            Some(checkpoint) => checkpoint,
            None => {
                // Either missing or already resolved; disambiguate.
                return match checkpoint_db::get_checkpoint(&self.pool, task_id, step_id).await? {
                    None => Err(CoreError::NotFound(format!(
                        "checkpoint for step {step_id} of task {task_id}"
                    ))),
                    Some(existing) => Err(CoreError::Validation(format!(
                        "checkpoint for step {step_id} already resolved: {}",
                        existing.decision
                    ))),
                };
            }
        };

        self.cache.put_checkpoint(checkpoint.clone()).await;

        if learn_preference {
            if let Some(key) = &checkpoint.preference_key {
                self.preferences
                    .record_outcome(user_id, key, decision == CheckpointDecision::Approved)
                    .await?;
            }
        }

        tracing::info!(
            task_id = %task_id,
            step_id = %step_id,
            decision = %decision,
            resolver = %user_id,
            "checkpoint resolved"
        );
        Ok(checkpoint)
    }

    /// Pending checkpoints across all of a user's tasks.
    pub async fn list_pending_for_user(&self, user_id: &str) -> CoreResult<Vec<Checkpoint>> {
        Ok(checkpoint_db::list_pending_for_user(&self.pool, user_id).await?)
    }

    /// Pending checkpoints for one task.
    pub async fn list_pending_for_task(&self, task_id: Uuid) -> CoreResult<Vec<Checkpoint>> {
        Ok(checkpoint_db::list_pending_for_task(&self.pool, task_id).await?)
    }
}

/// Preview data shown to the approver.
///
/// Honours `preview_fields` from the config; otherwise defaults by agent
/// type, falling back to the raw inputs.
pub fn build_checkpoint_preview(step: &Step, config: &CheckpointConfig) -> Value {
    if !config.preview_fields.is_empty() {
        let mut preview = serde_json::Map::new();
        for field in &config.preview_fields {
            if let Some(value) = step.inputs.get(field) {
                preview.insert(field.clone(), value.clone());
            }
        }
        if !preview.is_empty() {
            return Value::Object(preview);
        }
    }

    match step.agent_type.as_str() {
        "notify" => {
            let body = step
                .inputs
                .get("body")
                .map(|v| match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .unwrap_or_default();
            let body_preview: String = body.chars().take(200).collect();
            serde_json::json!({
                "to": step.inputs.get("to"),
                "subject": step.inputs.get("subject"),
                "body_preview": body_preview,
            })
        }
        "http_fetch" => serde_json::json!({
            "url": step.inputs.get("url"),
            "method": step.inputs.get("method").cloned().unwrap_or_else(|| "GET".into()),
        }),
        _ => serde_json::json!({"inputs": step.inputs}),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tentackl_db::models::FailurePolicy;

    fn step_with(agent_type: &str, inputs: Value) -> Step {
        Step {
            task_id: Uuid::nil(),
            id: "step_1".into(),
            name: "send".into(),
            description: "send the report".into(),
            agent_type: agent_type.to_string(),
            domain: None,
            inputs,
            outputs: json!({}),
            dependencies: vec![],
            status: StepStatus::Pending,
            parallel_group: None,
            failure_policy: FailurePolicy::AllOrNothing,
            checkpoint_required: true,
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

    #[test]
    fn notify_preview_truncates_body() {
        let step = step_with(
            "notify",
            json!({"to": "a@b.c", "subject": "Report", "body": "x".repeat(500)}),
        );
        let config = CheckpointConfig::default_for(&step);
        let preview = build_checkpoint_preview(&step, &config);

        assert_eq!(preview["to"], json!("a@b.c"));
        assert_eq!(preview["body_preview"].as_str().unwrap().len(), 200);
    }

    #[test]
    fn http_fetch_preview_defaults_method() {
        let step = step_with("http_fetch", json!({"url": "https://example.com"}));
        let config = CheckpointConfig::default_for(&step);
        let preview = build_checkpoint_preview(&step, &config);
        assert_eq!(preview["method"], json!("GET"));
    }

    #[test]
    fn preview_fields_override_defaults() {
        let step = step_with("compose", json!({"topic": "ai", "tone": "formal"}));
        let mut config = CheckpointConfig::default_for(&step);
        config.preview_fields = vec!["topic".to_string()];
        let preview = build_checkpoint_preview(&step, &config);
        assert_eq!(preview, json!({"topic": "ai"}));
    }

    #[test]
    fn default_config_carries_preference_key() {
        let step = step_with("notify", json!({}));
        let config = CheckpointConfig::default_for(&step);
        assert_eq!(config.name, "Approve send");
        assert_eq!(
            config.preference_key.as_deref(),
            Some("checkpoint:notify:send")
        );
    }
}
