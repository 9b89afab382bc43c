//! Trigger registry and external event gateway.
//!
//! Tasks created with a `trigger` metadata block register a pattern here.
//! External events enter through the gateway, which authenticates the
//! source, applies an idempotency filter, prefixes the event type with
//! `external.webhook.`, and matches registered triggers. Matches clone the
//! template task.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use sqlx::PgPool;
use tokio::sync::Mutex;
use uuid::Uuid;

use tentackl_db::models::{EventSource, SourceAuthType, Trigger};
use tentackl_db::queries::{event_sources, triggers as trigger_db};

use crate::error::{CoreError, CoreResult};

type HmacSha256 = Hmac<Sha256>;

/// How long a delivery key suppresses duplicates.
pub const IDEMPOTENCY_TTL: Duration = Duration::from_secs(300);

/// Event-type prefix applied to all webhook deliveries.
pub const WEBHOOK_PREFIX: &str = "external.webhook.";

// ---------------------------------------------------------------------------
// Trigger registry
// ---------------------------------------------------------------------------

/// Registry of task triggers, backed by the primary store.
pub struct TriggerRegistry {
    pool: PgPool,
}

impl TriggerRegistry {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Register (or refresh) a trigger parsed from a task's metadata.
    pub async fn register(&self, new: &trigger_db::NewTrigger) -> CoreResult<Trigger> {
        let trigger = trigger_db::upsert_trigger(&self.pool, new).await?;
        tracing::info!(
            task_id = %trigger.task_id,
            event_pattern = %trigger.event_pattern,
            scope = %trigger.scope,
            "trigger registered"
        );
        Ok(trigger)
    }

    /// Unregister the trigger for a task (idempotent).
    pub async fn unregister(&self, task_id: Uuid) -> CoreResult<bool> {
        let removed = trigger_db::delete_trigger(&self.pool, task_id).await?;
        if removed {
            tracing::info!(task_id = %task_id, "trigger unregistered");
        }
        Ok(removed)
    }

    pub async fn get(&self, task_id: Uuid) -> CoreResult<Option<Trigger>> {
        Ok(trigger_db::get_trigger(&self.pool, task_id).await?)
    }

    pub async fn list_for_user(&self, user_id: &str) -> CoreResult<Vec<Trigger>> {
        Ok(trigger_db::list_for_user(&self.pool, user_id).await?)
    }

    pub async fn set_enabled(&self, task_id: Uuid, enabled: bool) -> CoreResult<()> {
        trigger_db::set_trigger_enabled(&self.pool, task_id, enabled).await?;
        Ok(())
    }

    /// All enabled triggers in an organization matching an event.
    pub async fn match_event(
        &self,
        organization_id: &str,
        event_type: &str,
        source_id: Option<&str>,
        payload: &serde_json::Value,
    ) -> CoreResult<Vec<Trigger>> {
        let triggers = trigger_db::list_enabled_for_org(&self.pool, organization_id).await?;
        Ok(triggers
            .into_iter()
            .filter(|t| trigger_matches(t, event_type, source_id, payload))
            .collect())
    }
}

/// Whether one trigger matches an incoming event.
fn trigger_matches(
    trigger: &Trigger,
    event_type: &str,
    source_id: Option<&str>,
    payload: &serde_json::Value,
) -> bool {
    if !glob_match(&trigger.event_pattern, event_type) {
        return false;
    }
    if let Some(filter) = &trigger.source_filter {
        if source_id != Some(filter.as_str()) {
            return false;
        }
    }
    if let Some(condition) = &trigger.condition {
        if !condition_matches(condition, payload) {
            return false;
        }
    }
    true
}

/// Glob match over event types: `*` matches any run of characters.
fn glob_match(pattern: &str, value: &str) -> bool {
    fn inner(pattern: &[u8], value: &[u8]) -> bool {
        match (pattern.first(), value.first()) {
            (None, None) => true,
            (Some(b'*'), _) => {
                inner(&pattern[1..], value)
                    || (!value.is_empty() && inner(pattern, &value[1..]))
            }
            (Some(p), Some(v)) if p == v => inner(&pattern[1..], &value[1..]),
            _ => false,
        }
    }
    inner(pattern.as_bytes(), value.as_bytes())
}

/// A condition matches when every (possibly dotted) key equals the event's
/// value at that path.
fn condition_matches(condition: &serde_json::Value, payload: &serde_json::Value) -> bool {
    let Some(conditions) = condition.as_object() else {
        return true;
    };
    conditions.iter().all(|(path, expected)| {
        let mut current = payload;
        for key in path.split('.') {
            match current.get(key) {
                Some(next) => current = next,
                None => return false,
            }
        }
        current == expected
    })
}

// ---------------------------------------------------------------------------
// External event gateway
// ---------------------------------------------------------------------------

/// A validated external event ready for bus publication.
#[derive(Debug, Clone)]
pub struct ExternalEvent {
    pub source_id: Uuid,
    pub organization_id: String,
    /// Event type with the `external.webhook.` prefix applied.
    pub event_type: String,
    pub payload: serde_json::Value,
}

/// Outcome of a webhook delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// First delivery: the event was accepted.
    Accepted,
    /// Repeat delivery inside the idempotency window.
    Duplicate,
}

/// Authenticates sources, deduplicates deliveries, and normalises events.
pub struct EventGateway {
    pool: PgPool,
    seen: Arc<Mutex<HashMap<String, Instant>>>,
}

impl EventGateway {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            seen: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Register an event source.
    ///
    /// For `api_key` and `bearer` sources only the secret's SHA-256 digest
    /// persists; `hmac` sources keep the shared secret itself, since
    /// signature verification needs it.
    pub async fn register_source(
        &self,
        organization_id: &str,
        name: &str,
        auth_type: SourceAuthType,
        secret: &str,
    ) -> CoreResult<EventSource> {
        let stored = match auth_type {
            SourceAuthType::ApiKey | SourceAuthType::Bearer => sha256_hex(secret.as_bytes()),
            SourceAuthType::Hmac => secret.to_owned(),
        };
        Ok(event_sources::insert_event_source(
            &self.pool,
            organization_id,
            name,
            auth_type,
            &stored,
        )
        .await?)
    }

    /// Authenticate a delivery against its registered source.
    ///
    /// - `api_key` / `bearer`: the presented credential's SHA-256 digest
    ///   must equal the stored hash;
    /// - `hmac`: `signature` must be the hex HMAC-SHA256 of the raw body
    ///   under the stored shared secret.
    pub async fn authenticate_source(
        &self,
        source_id: Uuid,
        credential: Option<&str>,
        signature: Option<&str>,
        body: &[u8],
    ) -> CoreResult<EventSource> {
        let source = event_sources::get_event_source(&self.pool, source_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("event source {source_id}")))?;

        let authenticated = match source.auth_type {
            SourceAuthType::ApiKey | SourceAuthType::Bearer => credential
                .map(|c| sha256_hex(c.as_bytes()) == source.secret_hash)
                .unwrap_or(false),
            SourceAuthType::Hmac => signature
                .map(|s| verify_hmac(source.secret_hash.as_bytes(), body, s))
                .unwrap_or(false),
        };

        if !authenticated {
            return Err(CoreError::Forbidden(format!(
                "authentication failed for event source {source_id}"
            )));
        }
        Ok(source)
    }

    /// Validate and normalise a delivery. Applies the idempotency filter:
    /// the key is the explicit `Idempotency-Key` header when present, else
    /// `sha256(source_id || body)`, with a 5-minute TTL.
    pub async fn validate_event(
        &self,
        source: &EventSource,
        event_type: &str,
        body: &[u8],
        payload: serde_json::Value,
        idempotency_key: Option<&str>,
    ) -> CoreResult<(DeliveryOutcome, ExternalEvent)> {
        if event_type.is_empty() {
            return Err(CoreError::Validation("event type is required".to_string()));
        }

        let key = match idempotency_key {
            Some(key) => format!("{}:{}", source.id, key),
            None => {
                let mut hasher = Sha256::new();
                hasher.update(source.id.as_bytes());
                hasher.update(body);
                format!("{}:{}", source.id, hex::encode(hasher.finalize()))
            }
        };

        let outcome = {
            let mut seen = self.seen.lock().await;
            let now = Instant::now();
            seen.retain(|_, at| now.duration_since(*at) < IDEMPOTENCY_TTL);
            if seen.contains_key(&key) {
                DeliveryOutcome::Duplicate
            } else {
                seen.insert(key, now);
                DeliveryOutcome::Accepted
            }
        };

        let prefixed = if event_type.starts_with(WEBHOOK_PREFIX) {
            event_type.to_string()
        } else {
            format!("{WEBHOOK_PREFIX}{event_type}")
        };

        Ok((
            outcome,
            ExternalEvent {
                source_id: source.id,
                organization_id: source.organization_id.clone(),
                event_type: prefixed,
                payload,
            },
        ))
    }
}

fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

fn verify_hmac(secret: &[u8], body: &[u8], signature_hex: &str) -> bool {
    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
        return false;
    };
    mac.update(body);
    let Ok(expected) = hex::decode(signature_hex.trim()) else {
        return false;
    };
    mac.verify_slice(&expected).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    #[test]
    fn glob_patterns() {
        assert!(glob_match("external.webhook.*", "external.webhook.push"));
        assert!(glob_match("*", "anything"));
        assert!(glob_match("external.*.push", "external.webhook.push"));
        assert!(!glob_match("external.webhook.*", "internal.push"));
        assert!(glob_match("exact.match", "exact.match"));
        assert!(!glob_match("exact.match", "exact.matchx"));
    }

    #[test]
    fn condition_subset_matching() {
        let payload = json!({"repo": {"name": "tentackl"}, "action": "opened"});
        assert!(condition_matches(&json!({"action": "opened"}), &payload));
        assert!(condition_matches(&json!({"repo.name": "tentackl"}), &payload));
        assert!(!condition_matches(&json!({"action": "closed"}), &payload));
        assert!(!condition_matches(&json!({"missing.path": 1}), &payload));
    }

    fn trigger(pattern: &str, source_filter: Option<&str>) -> Trigger {
        use tentackl_db::models::TriggerScope;
        Trigger {
            task_id: Uuid::new_v4(),
            organization_id: "org_1".into(),
            user_id: "u".into(),
            event_pattern: pattern.to_string(),
            source_filter: source_filter.map(String::from),
            condition: None,
            enabled: true,
            scope: TriggerScope::Org,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn trigger_matching_respects_source_filter() {
        let t = trigger("external.webhook.*", Some("github"));
        assert!(trigger_matches(
            &t,
            "external.webhook.push",
            Some("github"),
            &json!({})
        ));
        assert!(!trigger_matches(
            &t,
            "external.webhook.push",
            Some("gitlab"),
            &json!({})
        ));
        assert!(!trigger_matches(&t, "external.webhook.push", None, &json!({})));
    }

    #[test]
    fn hmac_verification_roundtrip() {
        let secret = b"shared-secret";
        let body = br#"{"hello":"world"}"#;
        let mut mac = HmacSha256::new_from_slice(secret).unwrap();
        mac.update(body);
        let signature = hex::encode(mac.finalize().into_bytes());

        assert!(verify_hmac(secret, body, &signature));
        assert!(!verify_hmac(secret, b"tampered", &signature));
        assert!(!verify_hmac(secret, body, "deadbeef"));
    }
}
