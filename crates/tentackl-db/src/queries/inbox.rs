//! Database query functions for the `inbox_messages` table.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{InboxKind, InboxMessage};

/// Append a user-facing inbox message for a task.
pub async fn append_message(
    pool: &PgPool,
    task_id: Uuid,
    kind: InboxKind,
    title: &str,
    body: &str,
    data: &serde_json::Value,
) -> Result<InboxMessage> {
    let message = sqlx::query_as::<_, InboxMessage>(
        "INSERT INTO inbox_messages (task_id, kind, title, body, data) \
         VALUES ($1, $2, $3, $4, $5) \
         RETURNING *",
    )
    .bind(task_id)
    .bind(kind)
    .bind(title)
    .bind(body)
    .bind(data)
    .fetch_one(pool)
    .await
    .context("failed to append inbox message")?;

    Ok(message)
}

/// A page of inbox messages plus the real total count.
#[derive(Debug, Clone)]
pub struct InboxPage {
    pub messages: Vec<InboxMessage>,
    pub total: i64,
}

/// List inbox messages for a task, newest first, with a true total count.
pub async fn list_for_task(
    pool: &PgPool,
    task_id: Uuid,
    limit: i64,
    offset: i64,
) -> Result<InboxPage> {
    let messages = sqlx::query_as::<_, InboxMessage>(
        "SELECT * FROM inbox_messages WHERE task_id = $1 \
         ORDER BY created_at DESC LIMIT $2 OFFSET $3",
    )
    .bind(task_id)
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await
    .context("failed to list inbox messages")?;

    let total: (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM inbox_messages WHERE task_id = $1")
            .bind(task_id)
            .fetch_one(pool)
            .await
            .context("failed to count inbox messages")?;

    Ok(InboxPage {
        messages,
        total: total.0,
    })
}
