//! Database query functions for the `event_sources` table.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{EventSource, SourceAuthType};

/// Register an external event source. `secret_hash` holds the SHA-256 hex
/// digest of the credential for api_key/bearer sources, or the shared
/// secret itself for hmac sources (signature verification needs it).
pub async fn insert_event_source(
    pool: &PgPool,
    organization_id: &str,
    name: &str,
    auth_type: SourceAuthType,
    secret_hash: &str,
) -> Result<EventSource> {
    let source = sqlx::query_as::<_, EventSource>(
        "INSERT INTO event_sources (organization_id, name, auth_type, secret_hash) \
         VALUES ($1, $2, $3, $4) \
         RETURNING *",
    )
    .bind(organization_id)
    .bind(name)
    .bind(auth_type)
    .bind(secret_hash)
    .fetch_one(pool)
    .await
    .context("failed to insert event source")?;

    Ok(source)
}

/// Fetch an event source by id.
pub async fn get_event_source(pool: &PgPool, id: Uuid) -> Result<Option<EventSource>> {
    let source = sqlx::query_as::<_, EventSource>("SELECT * FROM event_sources WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch event source")?;

    Ok(source)
}

/// List event sources for an organization.
pub async fn list_event_sources(pool: &PgPool, organization_id: &str) -> Result<Vec<EventSource>> {
    let sources = sqlx::query_as::<_, EventSource>(
        "SELECT * FROM event_sources WHERE organization_id = $1 ORDER BY created_at ASC",
    )
    .bind(organization_id)
    .fetch_all(pool)
    .await
    .context("failed to list event sources")?;

    Ok(sources)
}
