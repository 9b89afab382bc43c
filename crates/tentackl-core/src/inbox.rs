//! User-facing inbox messaging.
//!
//! Execution posts short messages describing step progress, checkpoint
//! requests and terminal outcomes. Messages are best-effort: a failed write
//! is logged and never interrupts the step lifecycle.

use sqlx::PgPool;
use uuid::Uuid;

use tentackl_db::models::InboxKind;
use tentackl_db::queries::inbox;

/// Posts inbox messages for a task.
pub struct InboxService {
    pool: PgPool,
}

impl InboxService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn post(
        &self,
        task_id: Uuid,
        kind: InboxKind,
        title: &str,
        body: &str,
        data: serde_json::Value,
    ) {
        if let Err(e) = inbox::append_message(&self.pool, task_id, kind, title, body, &data).await
        {
            tracing::warn!(
                task_id = %task_id,
                error = %e,
                "failed to post inbox message (best-effort)"
            );
        }
    }

    /// Progress message for a step event (`completed`, `failed`, ...).
    pub async fn add_step_message(
        &self,
        task_id: Uuid,
        step_name: &str,
        event_type: &str,
        text: &str,
        data: serde_json::Value,
    ) {
        self.post(
            task_id,
            InboxKind::Step,
            &format!("{step_name} — {event_type}"),
            text,
            data,
        )
        .await;
    }

    /// A step is parked awaiting approval.
    pub async fn add_checkpoint_message(
        &self,
        task_id: Uuid,
        step_id: &str,
        step_name: &str,
        description: &str,
    ) {
        self.post(
            task_id,
            InboxKind::Checkpoint,
            &format!("Approval required: {step_name}"),
            description,
            serde_json::json!({"step_id": step_id}),
        )
        .await;
    }

    /// Resolution outcome for a checkpoint.
    pub async fn add_checkpoint_resolution_message(
        &self,
        task_id: Uuid,
        approved: bool,
        reason: Option<&str>,
    ) {
        let (title, body) = if approved {
            ("Checkpoint approved".to_string(), String::new())
        } else {
            (
                "Checkpoint rejected".to_string(),
                reason.unwrap_or("Rejected by user").to_string(),
            )
        };
        self.post(
            task_id,
            InboxKind::Resolution,
            &title,
            &body,
            serde_json::json!({"approved": approved}),
        )
        .await;
    }

    /// Terminal summary with step counts.
    pub async fn add_completion_message(
        &self,
        task_id: Uuid,
        status: &str,
        steps_completed: usize,
        total_steps: usize,
        error: Option<&str>,
    ) {
        let body = match error {
            Some(err) => format!(
                "Task {status}: {steps_completed}/{total_steps} steps completed. {err}"
            ),
            None => format!("Task {status}: {steps_completed}/{total_steps} steps completed."),
        };
        self.post(
            task_id,
            InboxKind::Completion,
            &format!("Task {status}"),
            &body,
            serde_json::json!({
                "status": status,
                "steps_completed": steps_completed,
                "total_steps": total_steps,
            }),
        )
        .await;
    }

    /// Paged inbox listing with a true total count.
    pub async fn list_inbox(
        &self,
        task_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> anyhow::Result<inbox::InboxPage> {
        inbox::list_for_task(&self.pool, task_id, limit, offset).await
    }
}
