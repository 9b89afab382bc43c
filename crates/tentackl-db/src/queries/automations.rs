//! Database query functions for the `automations` table.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::Automation;

/// Parameters for registering a schedule on a task.
#[derive(Debug, Clone)]
pub struct NewAutomation {
    pub task_id: Uuid,
    pub user_id: String,
    pub organization_id: Option<String>,
    pub goal: String,
    pub cron: Option<String>,
    pub execute_at: Option<DateTime<Utc>>,
    pub timezone: String,
}

/// Create or update the automation record for a task.
///
/// The scheduler collaborator later clones the task at the scheduled times.
pub async fn upsert_automation(pool: &PgPool, new: &NewAutomation) -> Result<Automation> {
    let automation = sqlx::query_as::<_, Automation>(
        "INSERT INTO automations (task_id, user_id, organization_id, goal, cron, \
                                  execute_at, timezone) \
         VALUES ($1, $2, $3, $4, $5, $6, $7) \
         ON CONFLICT (task_id) DO UPDATE \
         SET cron = EXCLUDED.cron, \
             execute_at = EXCLUDED.execute_at, \
             timezone = EXCLUDED.timezone, \
             enabled = TRUE \
         RETURNING *",
    )
    .bind(new.task_id)
    .bind(&new.user_id)
    .bind(&new.organization_id)
    .bind(&new.goal)
    .bind(&new.cron)
    .bind(new.execute_at)
    .bind(&new.timezone)
    .fetch_one(pool)
    .await
    .context("failed to upsert automation")?;

    Ok(automation)
}

/// Fetch the automation registered for a task.
pub async fn get_automation_for_task(pool: &PgPool, task_id: Uuid) -> Result<Option<Automation>> {
    let automation =
        sqlx::query_as::<_, Automation>("SELECT * FROM automations WHERE task_id = $1")
            .bind(task_id)
            .fetch_optional(pool)
            .await
            .context("failed to fetch automation")?;

    Ok(automation)
}

/// Disable the automation for a task (idempotent).
pub async fn disable_automation(pool: &PgPool, task_id: Uuid) -> Result<()> {
    sqlx::query("UPDATE automations SET enabled = FALSE WHERE task_id = $1")
        .bind(task_id)
        .execute(pool)
        .await
        .context("failed to disable automation")?;
    Ok(())
}
