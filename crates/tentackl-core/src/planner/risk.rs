//! Risk-based checkpoint injection.
//!
//! Deterministic assessment of planned steps. A step flagged here gets
//! `checkpoint_required` and a checkpoint config before the plan commits, so
//! risky operations never run without an approval gate.

use tentackl_db::models::{CheckpointConfig, CheckpointKind};

use crate::ports::StepDraft;

/// Outcome of assessing one step.
#[derive(Debug, Clone)]
pub struct RiskAssessment {
    pub step_id: String,
    pub requires_checkpoint: bool,
    pub risk: Option<&'static str>,
    pub checkpoint_config: Option<CheckpointConfig>,
}

/// Agent types that reach outside the platform and always need approval.
const OUTBOUND_AGENT_TYPES: &[&str] = &["notify", "email", "slack", "webhook_post"];

/// Input keywords that indicate destructive or irreversible operations.
const DESTRUCTIVE_KEYWORDS: &[&str] = &["delete", "remove", "drop", "purge", "overwrite"];

/// Input keywords that indicate spending money.
const SPEND_KEYWORDS: &[&str] = &["purchase", "payment", "charge", "invoice"];

/// Deterministic risk detector.
#[derive(Debug, Clone, Copy, Default)]
pub struct RiskDetector;

impl RiskDetector {
    pub fn new() -> Self {
        Self
    }

    /// Assess every step of a plan. Only flagged steps appear in the result.
    pub fn assess_plan(&self, steps: &[StepDraft]) -> Vec<RiskAssessment> {
        steps.iter().filter_map(|s| self.assess_step(s)).collect()
    }

    fn assess_step(&self, step: &StepDraft) -> Option<RiskAssessment> {
        let risk = self.detect_risk(step)?;

        let config = CheckpointConfig {
            name: format!("Approve {}", step.name),
            description: format!("{} ({} risk)", step.description, risk),
            kind: CheckpointKind::Approval,
            preference_key: Some(format!("checkpoint:{}:{}", step.agent_type, step.name)),
            preview_fields: Vec::new(),
        };

        Some(RiskAssessment {
            step_id: step.id.clone(),
            requires_checkpoint: true,
            risk: Some(risk),
            checkpoint_config: Some(config),
        })
    }

    fn detect_risk(&self, step: &StepDraft) -> Option<&'static str> {
        if OUTBOUND_AGENT_TYPES.contains(&step.agent_type.as_str()) {
            return Some("outbound_communication");
        }

        let haystack = format!(
            "{} {} {}",
            step.description.to_lowercase(),
            step.agent_type.to_lowercase(),
            step.inputs.to_string().to_lowercase(),
        );

        if step.agent_type == "file_storage"
            && DESTRUCTIVE_KEYWORDS.iter().any(|k| haystack.contains(k))
        {
            return Some("destructive_operation");
        }
        if SPEND_KEYWORDS.iter().any(|k| haystack.contains(k)) {
            return Some("financial_operation");
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn notify_steps_require_checkpoint() {
        let detector = RiskDetector::new();
        let mut step = StepDraft::new("step_3", "email result", "notify");
        step.inputs = json!({"to": "user@example.com"});

        let assessments = detector.assess_plan(&[step]);
        assert_eq!(assessments.len(), 1);
        assert_eq!(assessments[0].risk, Some("outbound_communication"));
        let config = assessments[0].checkpoint_config.as_ref().unwrap();
        assert_eq!(config.name, "Approve email result");
        assert_eq!(
            config.preference_key.as_deref(),
            Some("checkpoint:notify:email result")
        );
    }

    #[test]
    fn destructive_file_operations_flagged() {
        let detector = RiskDetector::new();
        let mut step = StepDraft::new("step_2", "clean up", "file_storage");
        step.inputs = json!({"operation": "delete", "path": "/reports"});

        let assessments = detector.assess_plan(&[step]);
        assert_eq!(assessments[0].risk, Some("destructive_operation"));
    }

    #[test]
    fn research_steps_pass_unflagged() {
        let detector = RiskDetector::new();
        let step = StepDraft::new("step_1", "research topic", "web_research");
        assert!(detector.assess_plan(&[step]).is_empty());
    }
}
