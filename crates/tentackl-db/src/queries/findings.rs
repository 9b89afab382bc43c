//! Database query functions for the append-only `findings` table.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::Finding;

/// A finding to append.
#[derive(Debug, Clone)]
pub struct NewFinding {
    pub task_id: Uuid,
    pub step_id: String,
    pub finding_type: String,
    pub content: serde_json::Value,
}

/// Append a finding. Findings are never updated or deleted.
pub async fn append_finding(pool: &PgPool, new: &NewFinding) -> Result<Finding> {
    let finding = sqlx::query_as::<_, Finding>(
        "INSERT INTO findings (task_id, step_id, finding_type, content) \
         VALUES ($1, $2, $3, $4) \
         RETURNING *",
    )
    .bind(new.task_id)
    .bind(&new.step_id)
    .bind(&new.finding_type)
    .bind(&new.content)
    .fetch_one(pool)
    .await
    .context("failed to append finding")?;

    Ok(finding)
}

/// List all findings for a task in insertion order.
pub async fn list_findings_for_task(pool: &PgPool, task_id: Uuid) -> Result<Vec<Finding>> {
    let findings = sqlx::query_as::<_, Finding>(
        "SELECT * FROM findings WHERE task_id = $1 ORDER BY id ASC",
    )
    .bind(task_id)
    .fetch_all(pool)
    .await
    .context("failed to list findings")?;

    Ok(findings)
}

/// The most recent `limit` findings for a task, oldest first.
pub async fn recent_findings(pool: &PgPool, task_id: Uuid, limit: i64) -> Result<Vec<Finding>> {
    let mut findings = sqlx::query_as::<_, Finding>(
        "SELECT * FROM findings WHERE task_id = $1 ORDER BY id DESC LIMIT $2",
    )
    .bind(task_id)
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("failed to fetch recent findings")?;

    findings.reverse();
    Ok(findings)
}
