//! Database query functions for the `triggers` table.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{Trigger, TriggerScope};

/// Parameters for registering a trigger on a template task.
#[derive(Debug, Clone)]
pub struct NewTrigger {
    pub task_id: Uuid,
    pub organization_id: String,
    pub user_id: String,
    pub event_pattern: String,
    pub source_filter: Option<String>,
    pub condition: Option<serde_json::Value>,
    pub scope: TriggerScope,
}

/// Register (or refresh) the trigger for a template task.
pub async fn upsert_trigger(pool: &PgPool, new: &NewTrigger) -> Result<Trigger> {
    let trigger = sqlx::query_as::<_, Trigger>(
        "INSERT INTO triggers (task_id, organization_id, user_id, event_pattern, \
                               source_filter, condition, scope) \
         VALUES ($1, $2, $3, $4, $5, $6, $7) \
         ON CONFLICT (task_id) DO UPDATE \
         SET event_pattern = EXCLUDED.event_pattern, \
             source_filter = EXCLUDED.source_filter, \
             condition = EXCLUDED.condition, \
             scope = EXCLUDED.scope, \
             enabled = TRUE \
         RETURNING *",
    )
    .bind(new.task_id)
    .bind(&new.organization_id)
    .bind(&new.user_id)
    .bind(&new.event_pattern)
    .bind(&new.source_filter)
    .bind(&new.condition)
    .bind(new.scope)
    .fetch_one(pool)
    .await
    .context("failed to upsert trigger")?;

    Ok(trigger)
}

/// Fetch the trigger registered on a task.
pub async fn get_trigger(pool: &PgPool, task_id: Uuid) -> Result<Option<Trigger>> {
    let trigger = sqlx::query_as::<_, Trigger>("SELECT * FROM triggers WHERE task_id = $1")
        .bind(task_id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch trigger")?;

    Ok(trigger)
}

/// Remove the trigger registered on a task (idempotent).
pub async fn delete_trigger(pool: &PgPool, task_id: Uuid) -> Result<bool> {
    let result = sqlx::query("DELETE FROM triggers WHERE task_id = $1")
        .bind(task_id)
        .execute(pool)
        .await
        .context("failed to delete trigger")?;

    Ok(result.rows_affected() > 0)
}

/// Enable or disable a trigger.
pub async fn set_trigger_enabled(pool: &PgPool, task_id: Uuid, enabled: bool) -> Result<()> {
    let result = sqlx::query("UPDATE triggers SET enabled = $1 WHERE task_id = $2")
        .bind(enabled)
        .bind(task_id)
        .execute(pool)
        .await
        .context("failed to set trigger enabled")?;

    if result.rows_affected() == 0 {
        anyhow::bail!("trigger for task {task_id} not found");
    }
    Ok(())
}

/// All enabled triggers for an organization.
pub async fn list_enabled_for_org(pool: &PgPool, organization_id: &str) -> Result<Vec<Trigger>> {
    let triggers = sqlx::query_as::<_, Trigger>(
        "SELECT * FROM triggers \
         WHERE organization_id = $1 AND enabled \
         ORDER BY created_at ASC",
    )
    .bind(organization_id)
    .fetch_all(pool)
    .await
    .context("failed to list triggers for org")?;

    Ok(triggers)
}

/// All triggers owned by a user.
pub async fn list_for_user(pool: &PgPool, user_id: &str) -> Result<Vec<Trigger>> {
    let triggers = sqlx::query_as::<_, Trigger>(
        "SELECT * FROM triggers WHERE user_id = $1 ORDER BY created_at ASC",
    )
    .bind(user_id)
    .fetch_all(pool)
    .await
    .context("failed to list triggers for user")?;

    Ok(triggers)
}
