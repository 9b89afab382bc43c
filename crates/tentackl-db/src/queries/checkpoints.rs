//! Database query functions for the `checkpoints` table.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{Checkpoint, CheckpointDecision, CheckpointKind};

/// Parameters for materialising a checkpoint.
#[derive(Debug, Clone)]
pub struct NewCheckpoint {
    pub task_id: Uuid,
    pub step_id: String,
    pub name: String,
    pub description: String,
    pub kind: CheckpointKind,
    pub decision: CheckpointDecision,
    pub preview: Option<serde_json::Value>,
    pub questions: Option<serde_json::Value>,
    pub alternatives: Option<serde_json::Value>,
    pub preference_key: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Insert (or refresh) the checkpoint for a (task, step).
///
/// A step keeps at most one checkpoint row; re-creation (e.g. a retried
/// replan) overwrites the previous record.
pub async fn upsert_checkpoint(pool: &PgPool, new: &NewCheckpoint) -> Result<Checkpoint> {
    let checkpoint = sqlx::query_as::<_, Checkpoint>(
        "INSERT INTO checkpoints (task_id, step_id, name, description, kind, decision, \
                                  preview, questions, alternatives, preference_key, expires_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11) \
         ON CONFLICT (task_id, step_id) DO UPDATE \
         SET name = EXCLUDED.name, \
             description = EXCLUDED.description, \
             kind = EXCLUDED.kind, \
             decision = EXCLUDED.decision, \
             preview = EXCLUDED.preview, \
             questions = EXCLUDED.questions, \
             alternatives = EXCLUDED.alternatives, \
             preference_key = EXCLUDED.preference_key, \
             expires_at = EXCLUDED.expires_at, \
             feedback = NULL, \
             resolved_by = NULL, \
             resolved_at = NULL \
         RETURNING *",
    )
    .bind(new.task_id)
    .bind(&new.step_id)
    .bind(&new.name)
    .bind(&new.description)
    .bind(new.kind)
    .bind(new.decision)
    .bind(&new.preview)
    .bind(&new.questions)
    .bind(&new.alternatives)
    .bind(&new.preference_key)
    .bind(new.expires_at)
    .fetch_one(pool)
    .await
    .context("failed to upsert checkpoint")?;

    Ok(checkpoint)
}

/// Fetch the checkpoint for a (task, step).
pub async fn get_checkpoint(
    pool: &PgPool,
    task_id: Uuid,
    step_id: &str,
) -> Result<Option<Checkpoint>> {
    let checkpoint = sqlx::query_as::<_, Checkpoint>(
        "SELECT * FROM checkpoints WHERE task_id = $1 AND step_id = $2",
    )
    .bind(task_id)
    .bind(step_id)
    .fetch_optional(pool)
    .await
    .context("failed to fetch checkpoint")?;

    Ok(checkpoint)
}

/// Resolve a checkpoint with optimistic locking on the pending decision.
///
/// Returns the updated row, or `None` when the checkpoint was already
/// resolved (or does not exist).
pub async fn resolve_checkpoint(
    pool: &PgPool,
    task_id: Uuid,
    step_id: &str,
    decision: CheckpointDecision,
    resolved_by: &str,
    feedback: Option<&str>,
) -> Result<Option<Checkpoint>> {
    let checkpoint = sqlx::query_as::<_, Checkpoint>(
        "UPDATE checkpoints \
         SET decision = $1, resolved_by = $2, feedback = $3, resolved_at = NOW() \
         WHERE task_id = $4 AND step_id = $5 AND decision = 'pending' \
         RETURNING *",
    )
    .bind(decision)
    .bind(resolved_by)
    .bind(feedback)
    .bind(task_id)
    .bind(step_id)
    .fetch_optional(pool)
    .await
    .context("failed to resolve checkpoint")?;

    Ok(checkpoint)
}

/// Pending checkpoints across all of a user's tasks, oldest first.
pub async fn list_pending_for_user(pool: &PgPool, user_id: &str) -> Result<Vec<Checkpoint>> {
    let checkpoints = sqlx::query_as::<_, Checkpoint>(
        "SELECT c.* FROM checkpoints c \
         JOIN tasks t ON t.id = c.task_id \
         WHERE t.user_id = $1 AND c.decision = 'pending' \
         ORDER BY c.created_at ASC",
    )
    .bind(user_id)
    .fetch_all(pool)
    .await
    .context("failed to list pending checkpoints for user")?;

    Ok(checkpoints)
}

/// Pending checkpoints for one task, oldest first.
pub async fn list_pending_for_task(pool: &PgPool, task_id: Uuid) -> Result<Vec<Checkpoint>> {
    let checkpoints = sqlx::query_as::<_, Checkpoint>(
        "SELECT * FROM checkpoints \
         WHERE task_id = $1 AND decision = 'pending' \
         ORDER BY created_at ASC",
    )
    .bind(task_id)
    .fetch_all(pool)
    .await
    .context("failed to list pending checkpoints for task")?;

    Ok(checkpoints)
}
