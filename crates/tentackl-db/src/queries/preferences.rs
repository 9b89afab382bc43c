//! Database query functions for the `preferences` table.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{CheckpointDecision, Preference};

/// Record an approval/rejection outcome for a (user, preference key),
/// creating the row on first sight.
pub async fn record_outcome(
    pool: &PgPool,
    user_id: &str,
    preference_key: &str,
    approved: bool,
) -> Result<Preference> {
    let decision = if approved {
        CheckpointDecision::Approved
    } else {
        CheckpointDecision::Rejected
    };
    let (approvals, rejections) = if approved { (1, 0) } else { (0, 1) };

    let preference = sqlx::query_as::<_, Preference>(
        "INSERT INTO preferences (user_id, preference_key, approvals, rejections, last_decision) \
         VALUES ($1, $2, $3, $4, $5) \
         ON CONFLICT (user_id, preference_key) DO UPDATE \
         SET approvals = preferences.approvals + EXCLUDED.approvals, \
             rejections = preferences.rejections + EXCLUDED.rejections, \
             last_decision = EXCLUDED.last_decision, \
             updated_at = NOW() \
         RETURNING *",
    )
    .bind(user_id)
    .bind(preference_key)
    .bind(approvals)
    .bind(rejections)
    .bind(decision)
    .fetch_one(pool)
    .await
    .context("failed to record preference outcome")?;

    Ok(preference)
}

/// Fetch the preference for a (user, preference key).
pub async fn get_preference(
    pool: &PgPool,
    user_id: &str,
    preference_key: &str,
) -> Result<Option<Preference>> {
    let preference = sqlx::query_as::<_, Preference>(
        "SELECT * FROM preferences WHERE user_id = $1 AND preference_key = $2",
    )
    .bind(user_id)
    .bind(preference_key)
    .fetch_optional(pool)
    .await
    .context("failed to fetch preference")?;

    Ok(preference)
}

/// Fetch a preference by its id.
pub async fn get_preference_by_id(pool: &PgPool, id: Uuid) -> Result<Option<Preference>> {
    let preference =
        sqlx::query_as::<_, Preference>("SELECT * FROM preferences WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await
            .context("failed to fetch preference by id")?;

    Ok(preference)
}

/// All learned preferences for a user, most recently updated first.
pub async fn list_preferences_for_user(pool: &PgPool, user_id: &str) -> Result<Vec<Preference>> {
    let preferences = sqlx::query_as::<_, Preference>(
        "SELECT * FROM preferences WHERE user_id = $1 ORDER BY updated_at DESC",
    )
    .bind(user_id)
    .fetch_all(pool)
    .await
    .context("failed to list preferences")?;

    Ok(preferences)
}

/// Delete one learned preference.
pub async fn delete_preference(pool: &PgPool, id: Uuid) -> Result<()> {
    sqlx::query("DELETE FROM preferences WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await
        .context("failed to delete preference")?;
    Ok(())
}
