//! Planning intent and schedule normalization.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Result of classifying a goal before decomposition.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlanningIntent {
    /// Whether a schedule was detected in the goal.
    #[serde(default)]
    pub has_schedule: bool,
    #[serde(default)]
    pub schedule: Option<ScheduleSpec>,
    /// For scheduled goals: the single execution the clone should perform
    /// (e.g. "send the weekly report" out of "every Monday, send the weekly
    /// report"). Applied only when at least 10 characters long.
    #[serde(default)]
    pub one_shot_goal: Option<String>,
    /// Hint that a single data-retrieval query can satisfy the goal.
    #[serde(default)]
    pub fast_path: bool,
    /// Structured query details for the fast path.
    #[serde(default)]
    pub data_query: Option<serde_json::Value>,
}

/// A normalized schedule: a cron expression or an absolute instant.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScheduleSpec {
    #[serde(default)]
    pub cron: Option<String>,
    #[serde(default)]
    pub execute_at: Option<DateTime<Utc>>,
    /// Raw relative form as detected (`+15m`, `+2h`, `30`), normalized by
    /// [`normalize_schedule`].
    #[serde(default)]
    pub execute_at_raw: Option<String>,
    #[serde(default = "ScheduleSpec::default_timezone")]
    pub timezone: String,
}

impl ScheduleSpec {
    fn default_timezone() -> String {
        "UTC".to_string()
    }

    /// Human-readable label for events.
    pub fn label(&self) -> String {
        if let Some(cron) = &self.cron {
            return cron.clone();
        }
        if let Some(at) = &self.execute_at {
            return at.to_rfc3339();
        }
        "unknown".to_string()
    }
}

/// Convert a relative `execute_at_raw` offset into an absolute instant.
///
/// Accepted forms: `+15m`, `+2h`, `+30s`, or a bare integer (minutes). An
/// unparseable raw value is left as-is and the schedule keeps no absolute
/// instant.
pub fn normalize_schedule(intent: &mut PlanningIntent) -> Option<ScheduleSpec> {
    if !intent.has_schedule {
        return None;
    }
    let schedule = intent.schedule.as_mut()?;

    if schedule.execute_at.is_none() {
        if let Some(raw) = schedule.execute_at_raw.clone() {
            if let Some(delta) = parse_offset(&raw) {
                schedule.execute_at = Some(Utc::now() + delta);
            } else {
                tracing::warn!(raw = %raw, "could not parse execute_at offset");
            }
        }
    }

    Some(schedule.clone())
}

fn parse_offset(raw: &str) -> Option<Duration> {
    let trimmed = raw.strip_prefix('+').unwrap_or(raw);
    if let Some(minutes) = trimmed.strip_suffix('m') {
        return minutes.parse::<i64>().ok().map(Duration::minutes);
    }
    if let Some(hours) = trimmed.strip_suffix('h') {
        return hours.parse::<i64>().ok().map(Duration::hours);
    }
    if let Some(seconds) = trimmed.strip_suffix('s') {
        return seconds.parse::<i64>().ok().map(Duration::seconds);
    }
    // Bare integers are minutes.
    trimmed.parse::<i64>().ok().map(Duration::minutes)
}
