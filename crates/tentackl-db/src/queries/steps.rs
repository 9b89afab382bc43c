//! Database query functions for the `steps` table.

use anyhow::{Context, Result};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::models::{CheckpointConfig, FallbackConfig, Step, StepStatus};

/// Insert a step row inside an open transaction.
///
/// Used by the planning commit and by task cloning, which write all steps of
/// a task atomically.
pub async fn insert_step_tx(tx: &mut Transaction<'_, Postgres>, step: &Step) -> Result<()> {
    sqlx::query(
        "INSERT INTO steps (task_id, id, name, description, agent_type, domain, \
                            inputs, outputs, dependencies, status, parallel_group, \
                            failure_policy, checkpoint_required, checkpoint_config, \
                            fallback_config, is_critical, retry_count, max_retries, \
                            error_message, position) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, \
                 $15, $16, $17, $18, $19, $20)",
    )
    .bind(step.task_id)
    .bind(&step.id)
    .bind(&step.name)
    .bind(&step.description)
    .bind(&step.agent_type)
    .bind(&step.domain)
    .bind(&step.inputs)
    .bind(&step.outputs)
    .bind(&step.dependencies)
    .bind(step.status)
    .bind(&step.parallel_group)
    .bind(step.failure_policy)
    .bind(step.checkpoint_required)
    .bind(&step.checkpoint_config)
    .bind(&step.fallback_config)
    .bind(step.is_critical)
    .bind(step.retry_count)
    .bind(step.max_retries)
    .bind(&step.error_message)
    .bind(step.position)
    .execute(&mut **tx)
    .await
    .with_context(|| format!("failed to insert step {:?}", step.id))?;

    Ok(())
}

/// Fetch a single step.
pub async fn get_step(pool: &PgPool, task_id: Uuid, step_id: &str) -> Result<Option<Step>> {
    let step =
        sqlx::query_as::<_, Step>("SELECT * FROM steps WHERE task_id = $1 AND id = $2")
            .bind(task_id)
            .bind(step_id)
            .fetch_optional(pool)
            .await
            .context("failed to fetch step")?;

    Ok(step)
}

/// List all steps of a task in plan order.
pub async fn list_steps_for_task(pool: &PgPool, task_id: Uuid) -> Result<Vec<Step>> {
    let steps = sqlx::query_as::<_, Step>(
        "SELECT * FROM steps WHERE task_id = $1 ORDER BY position ASC",
    )
    .bind(task_id)
    .fetch_all(pool)
    .await
    .context("failed to list steps for task")?;

    Ok(steps)
}

/// Update a step's status.
pub async fn update_step_status(
    pool: &PgPool,
    task_id: Uuid,
    step_id: &str,
    status: StepStatus,
) -> Result<()> {
    let result = sqlx::query("UPDATE steps SET status = $1 WHERE task_id = $2 AND id = $3")
        .bind(status)
        .bind(task_id)
        .bind(step_id)
        .execute(pool)
        .await
        .context("failed to update step status")?;

    if result.rows_affected() == 0 {
        anyhow::bail!("step {step_id} of task {task_id} not found");
    }
    Ok(())
}

/// Mark a step running and stamp `started_at`.
pub async fn mark_step_running(pool: &PgPool, task_id: Uuid, step_id: &str) -> Result<()> {
    sqlx::query(
        "UPDATE steps SET status = 'running', started_at = NOW() \
         WHERE task_id = $1 AND id = $2",
    )
    .bind(task_id)
    .bind(step_id)
    .execute(pool)
    .await
    .context("failed to mark step running")?;
    Ok(())
}

/// Complete a step with its outputs and timing.
pub async fn complete_step(
    pool: &PgPool,
    task_id: Uuid,
    step_id: &str,
    outputs: &serde_json::Value,
    execution_time_ms: Option<i64>,
) -> Result<()> {
    sqlx::query(
        "UPDATE steps \
         SET status = 'done', outputs = $1, completed_at = NOW(), \
             execution_time_ms = $2, error_message = NULL \
         WHERE task_id = $3 AND id = $4",
    )
    .bind(outputs)
    .bind(execution_time_ms)
    .bind(task_id)
    .bind(step_id)
    .execute(pool)
    .await
    .context("failed to complete step")?;
    Ok(())
}

/// Fail a step with an error message.
pub async fn fail_step(
    pool: &PgPool,
    task_id: Uuid,
    step_id: &str,
    error_message: &str,
    execution_time_ms: Option<i64>,
) -> Result<()> {
    sqlx::query(
        "UPDATE steps \
         SET status = 'failed', error_message = $1, completed_at = NOW(), \
             execution_time_ms = $2 \
         WHERE task_id = $3 AND id = $4",
    )
    .bind(error_message)
    .bind(execution_time_ms)
    .bind(task_id)
    .bind(step_id)
    .execute(pool)
    .await
    .context("failed to fail step")?;
    Ok(())
}

/// Mark a step skipped, keeping its error message for the audit trail.
pub async fn skip_step(
    pool: &PgPool,
    task_id: Uuid,
    step_id: &str,
    error_message: Option<&str>,
) -> Result<()> {
    sqlx::query(
        "UPDATE steps \
         SET status = 'skipped', error_message = COALESCE($1, error_message), \
             completed_at = NOW() \
         WHERE task_id = $2 AND id = $3",
    )
    .bind(error_message)
    .bind(task_id)
    .bind(step_id)
    .execute(pool)
    .await
    .context("failed to skip step")?;
    Ok(())
}

/// Reset a failed or running step back to pending for a retry, recording the
/// new retry count and the annotated error.
pub async fn reset_step_for_retry(
    pool: &PgPool,
    task_id: Uuid,
    step_id: &str,
    retry_count: i32,
    error_message: &str,
) -> Result<()> {
    sqlx::query(
        "UPDATE steps \
         SET status = 'pending', retry_count = $1, error_message = $2, \
             started_at = NULL, completed_at = NULL \
         WHERE task_id = $3 AND id = $4",
    )
    .bind(retry_count)
    .bind(error_message)
    .bind(task_id)
    .bind(step_id)
    .execute(pool)
    .await
    .context("failed to reset step for retry")?;
    Ok(())
}

/// Replace a step's inputs (observer MODIFY, fallback injection).
pub async fn update_step_inputs(
    pool: &PgPool,
    task_id: Uuid,
    step_id: &str,
    inputs: &serde_json::Value,
) -> Result<()> {
    sqlx::query("UPDATE steps SET inputs = $1 WHERE task_id = $2 AND id = $3")
        .bind(inputs)
        .bind(task_id)
        .bind(step_id)
        .execute(pool)
        .await
        .context("failed to update step inputs")?;
    Ok(())
}

/// Replace a step's fallback configuration after a target was consumed.
pub async fn update_fallback_config(
    pool: &PgPool,
    task_id: Uuid,
    step_id: &str,
    fallback_config: Option<&FallbackConfig>,
) -> Result<()> {
    sqlx::query("UPDATE steps SET fallback_config = $1 WHERE task_id = $2 AND id = $3")
        .bind(fallback_config.map(|c| Json(c.clone())))
        .bind(task_id)
        .bind(step_id)
        .execute(pool)
        .await
        .context("failed to update step fallback config")?;
    Ok(())
}

/// Park a step at a checkpoint, attaching the checkpoint config.
pub async fn park_step_at_checkpoint(
    pool: &PgPool,
    task_id: Uuid,
    step_id: &str,
    config: &CheckpointConfig,
) -> Result<()> {
    sqlx::query(
        "UPDATE steps \
         SET status = 'checkpoint', checkpoint_required = TRUE, checkpoint_config = $1 \
         WHERE task_id = $2 AND id = $3",
    )
    .bind(Json(config.clone()))
    .bind(task_id)
    .bind(step_id)
    .execute(pool)
    .await
    .context("failed to park step at checkpoint")?;
    Ok(())
}

/// Clear a step's checkpoint requirement after approval and return it to
/// pending so the scheduler can pick it up.
pub async fn clear_step_checkpoint(pool: &PgPool, task_id: Uuid, step_id: &str) -> Result<()> {
    sqlx::query(
        "UPDATE steps \
         SET checkpoint_required = FALSE, status = 'pending' \
         WHERE task_id = $1 AND id = $2",
    )
    .bind(task_id)
    .bind(step_id)
    .execute(pool)
    .await
    .context("failed to clear step checkpoint")?;
    Ok(())
}

/// Counts of steps per status for a task.
#[derive(Debug, Clone, Default)]
pub struct StepProgress {
    pub pending: i64,
    pub running: i64,
    pub checkpoint: i64,
    pub done: i64,
    pub failed: i64,
    pub skipped: i64,
    pub total: i64,
}

/// Get a summary of step counts by status for a task.
pub async fn get_step_progress(pool: &PgPool, task_id: Uuid) -> Result<StepProgress> {
    let rows: Vec<(String, i64)> = sqlx::query_as(
        "SELECT status::text, COUNT(*) as cnt FROM steps WHERE task_id = $1 GROUP BY status",
    )
    .bind(task_id)
    .fetch_all(pool)
    .await
    .context("failed to get step progress")?;

    let mut progress = StepProgress::default();
    for (status, count) in &rows {
        match status.as_str() {
            "pending" => progress.pending = *count,
            "running" => progress.running = *count,
            "checkpoint" => progress.checkpoint = *count,
            "done" => progress.done = *count,
            "failed" => progress.failed = *count,
            "skipped" => progress.skipped = *count,
            _ => {}
        }
        progress.total += count;
    }
    Ok(progress)
}
