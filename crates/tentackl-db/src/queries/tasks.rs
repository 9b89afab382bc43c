//! Database query functions for the `tasks` table.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{Task, TaskStatus};
use crate::queries::steps;

/// Parameters for inserting a new task row.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub goal: String,
    pub user_id: String,
    pub organization_id: Option<String>,
    pub status: TaskStatus,
    pub constraints: serde_json::Value,
    pub success_criteria: serde_json::Value,
    pub max_parallel_steps: i32,
    pub metadata: serde_json::Value,
    pub parent_task_id: Option<Uuid>,
    pub version: i32,
}

impl NewTask {
    /// A task entering the planning pipeline.
    pub fn planning(goal: &str, user_id: &str, organization_id: Option<&str>) -> Self {
        Self {
            goal: goal.to_owned(),
            user_id: user_id.to_owned(),
            organization_id: organization_id.map(str::to_owned),
            status: TaskStatus::Planning,
            constraints: serde_json::json!({}),
            success_criteria: serde_json::json!({}),
            max_parallel_steps: 5,
            metadata: serde_json::json!({}),
            parent_task_id: None,
            version: 1,
        }
    }
}

/// Insert a new task row. Returns the inserted task with server-generated
/// defaults (id, timestamps).
pub async fn insert_task(pool: &PgPool, new: &NewTask) -> Result<Task> {
    let task = sqlx::query_as::<_, Task>(
        "INSERT INTO tasks (goal, user_id, organization_id, status, constraints, \
                            success_criteria, max_parallel_steps, metadata, \
                            parent_task_id, version) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
         RETURNING *",
    )
    .bind(&new.goal)
    .bind(&new.user_id)
    .bind(&new.organization_id)
    .bind(new.status)
    .bind(&new.constraints)
    .bind(&new.success_criteria)
    .bind(new.max_parallel_steps)
    .bind(&new.metadata)
    .bind(new.parent_task_id)
    .bind(new.version)
    .fetch_one(pool)
    .await
    .context("failed to insert task")?;

    Ok(task)
}

/// Fetch a single task row by ID (without steps).
pub async fn get_task(pool: &PgPool, id: Uuid) -> Result<Option<Task>> {
    let task = sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch task")?;

    Ok(task)
}

/// Fetch a task with its steps populated, ordered by step position.
pub async fn get_task_with_steps(pool: &PgPool, id: Uuid) -> Result<Option<Task>> {
    let Some(mut task) = get_task(pool, id).await? else {
        return Ok(None);
    };
    task.steps = steps::list_steps_for_task(pool, id).await?;
    Ok(Some(task))
}

/// List tasks owned by a user, newest first, optionally filtered by status.
pub async fn list_tasks_for_user(
    pool: &PgPool,
    user_id: &str,
    status: Option<TaskStatus>,
    limit: i64,
) -> Result<Vec<Task>> {
    let tasks = match status {
        Some(status) => {
            sqlx::query_as::<_, Task>(
                "SELECT * FROM tasks WHERE user_id = $1 AND status = $2 \
                 ORDER BY created_at DESC LIMIT $3",
            )
            .bind(user_id)
            .bind(status)
            .bind(limit)
            .fetch_all(pool)
            .await
        }
        None => {
            sqlx::query_as::<_, Task>(
                "SELECT * FROM tasks WHERE user_id = $1 \
                 ORDER BY created_at DESC LIMIT $2",
            )
            .bind(user_id)
            .bind(limit)
            .fetch_all(pool)
            .await
        }
    }
    .context("failed to list tasks for user")?;

    Ok(tasks)
}

/// Atomically transition a task from one status to another.
///
/// Uses optimistic locking: the UPDATE's WHERE clause includes
/// `status = $from`, so the row is only updated if the current status
/// matches. Sets `completed_at` when entering a terminal status. Returns the
/// number of rows affected (0 means the status did not match).
pub async fn transition_task_status(
    pool: &PgPool,
    task_id: Uuid,
    from: TaskStatus,
    to: TaskStatus,
) -> Result<u64> {
    let completed_at: Option<DateTime<Utc>> = if to.is_terminal() {
        Some(Utc::now())
    } else {
        None
    };

    let result = sqlx::query(
        "UPDATE tasks \
         SET status = $1, \
             updated_at = NOW(), \
             completed_at = COALESCE($2, completed_at) \
         WHERE id = $3 AND status = $4",
    )
    .bind(to)
    .bind(completed_at)
    .bind(task_id)
    .bind(from)
    .execute(pool)
    .await
    .context("failed to transition task status")?;

    Ok(result.rows_affected())
}

/// Force a task status without an optimistic lock (recovery paths only).
pub async fn set_task_status(pool: &PgPool, task_id: Uuid, status: TaskStatus) -> Result<()> {
    let completed_at: Option<DateTime<Utc>> = if status.is_terminal() {
        Some(Utc::now())
    } else {
        None
    };
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = $1, updated_at = NOW(), \
             completed_at = COALESCE($2, completed_at) \
         WHERE id = $3",
    )
    .bind(status)
    .bind(completed_at)
    .bind(task_id)
    .execute(pool)
    .await
    .context("failed to set task status")?;

    if result.rows_affected() == 0 {
        anyhow::bail!("task {task_id} not found");
    }
    Ok(())
}

/// Record the execution tree id on a task.
pub async fn set_tree_id(pool: &PgPool, task_id: Uuid, tree_id: Uuid) -> Result<()> {
    sqlx::query("UPDATE tasks SET tree_id = $1, updated_at = NOW() WHERE id = $2")
        .bind(tree_id)
        .bind(task_id)
        .execute(pool)
        .await
        .context("failed to set tree id")?;
    Ok(())
}

/// Record a parent task link.
pub async fn set_parent_task(pool: &PgPool, task_id: Uuid, parent_task_id: Uuid) -> Result<()> {
    sqlx::query("UPDATE tasks SET parent_task_id = $1, updated_at = NOW() WHERE id = $2")
        .bind(parent_task_id)
        .bind(task_id)
        .execute(pool)
        .await
        .context("failed to set parent task")?;
    Ok(())
}

/// Mark a task superseded by a replan successor.
///
/// Both fields change in a single UPDATE so the supersession is atomic.
pub async fn set_superseded_by(pool: &PgPool, task_id: Uuid, new_task_id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = 'superseded', superseded_by = $1, \
             updated_at = NOW(), completed_at = NOW() \
         WHERE id = $2 AND status NOT IN ('completed', 'failed', 'cancelled', 'superseded')",
    )
    .bind(new_task_id)
    .bind(task_id)
    .execute(pool)
    .await
    .context("failed to mark task superseded")?;

    Ok(result.rows_affected())
}

/// Merge keys into a task's metadata (existing keys are overwritten).
pub async fn merge_metadata(
    pool: &PgPool,
    task_id: Uuid,
    metadata: &serde_json::Value,
) -> Result<()> {
    sqlx::query("UPDATE tasks SET metadata = metadata || $1, updated_at = NOW() WHERE id = $2")
        .bind(metadata)
        .bind(task_id)
        .execute(pool)
        .await
        .context("failed to merge task metadata")?;
    Ok(())
}

/// Replace a task's constraints map.
pub async fn set_constraints(
    pool: &PgPool,
    task_id: Uuid,
    constraints: &serde_json::Value,
) -> Result<()> {
    sqlx::query("UPDATE tasks SET constraints = $1, updated_at = NOW() WHERE id = $2")
        .bind(constraints)
        .bind(task_id)
        .execute(pool)
        .await
        .context("failed to set task constraints")?;
    Ok(())
}

/// Tasks stuck in `planning` for longer than the timeout.
///
/// Used by the recovery sweep: if the planning coroutine died (process
/// restart, crash) the task would otherwise sit in `planning` forever.
pub async fn get_stuck_planning_tasks(
    pool: &PgPool,
    timeout_minutes: i64,
) -> Result<Vec<Task>> {
    let cutoff = Utc::now() - Duration::minutes(timeout_minutes);
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks WHERE status = 'planning' AND created_at < $1",
    )
    .bind(cutoff)
    .fetch_all(pool)
    .await
    .context("failed to query stuck planning tasks")?;

    Ok(tasks)
}
