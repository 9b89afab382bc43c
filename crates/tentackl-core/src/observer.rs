//! Failure diagnosis.
//!
//! The observer is a stateless analyzer invoked per failed step. Decision
//! order: deterministic template-syntax fixes, invalid-agent-type replans,
//! content-filter input rewrites, then LLM-assisted tactical analysis with a
//! pure rule tree as the fallback. Proposals are surfaced as data, never as
//! errors.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use tentackl_db::models::{Step, StepStatus, Task};

use crate::ports::{LlmAdvisor, ReplanContext};
use crate::transient::is_transient_error;

// ---------------------------------------------------------------------------
// Proposals
// ---------------------------------------------------------------------------

/// Recovery action proposed for a failed step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalType {
    Retry,
    Fallback,
    Skip,
    Modify,
    Replan,
    Abort,
}

impl ProposalType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Retry => "retry",
            Self::Fallback => "fallback",
            Self::Skip => "skip",
            Self::Modify => "modify",
            Self::Replan => "replan",
            Self::Abort => "abort",
        }
    }
}

/// The observer's full answer for one failure.
#[derive(Debug, Clone)]
pub struct ObserverProposal {
    pub proposal_type: ProposalType,
    pub step_id: String,
    pub reason: String,
    pub confidence: f32,
    pub fallback_target: Option<String>,
    pub modified_inputs: Option<Value>,
    pub replan_context: Option<ReplanContext>,
}

impl ObserverProposal {
    fn new(proposal_type: ProposalType, step_id: &str, reason: impl Into<String>) -> Self {
        Self {
            proposal_type,
            step_id: step_id.to_owned(),
            reason: reason.into(),
            confidence: 0.5,
            fallback_target: None,
            modified_inputs: None,
            replan_context: None,
        }
    }

    fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = confidence;
        self
    }
}

// ---------------------------------------------------------------------------
// Classification tables
// ---------------------------------------------------------------------------

/// Error substrings emitted by content filters and moderation systems.
const CONTENT_FILTER_INDICATORS: &[&str] = &[
    "derivative works filter",
    "content moderated",
    "request moderated",
    "content_policy",
    "content policy",
    "copyright",
    "trademark",
    "nsfw",
    "safety filter",
    "moderation",
    "blocked content",
    "violates",
    "not allowed",
];

/// Agent types whose inputs can be meaningfully rewritten.
const MODIFIABLE_AGENT_TYPES: &[&str] = &["generate_image", "compose", "llm", "api_caller"];

/// Errors that usually trace back to templates resolving to empty values.
const TEMPLATE_RELATED_INDICATORS: &[&str] = &[
    "no sources provided",
    "no data provided",
    "missing required",
    "empty input",
    "null input",
    "undefined",
    "cannot read property",
    "expected string",
    "expected array",
    "expected object",
    "invalid input",
    "input validation",
];

/// Known-bad agent types and their corrections.
const AGENT_TYPE_CORRECTIONS: &[(&str, &str)] = &[
    // Strategy/marketing agents -> compose
    ("marketing_strategist", "compose"),
    ("strategy_agent", "compose"),
    ("strategist", "compose"),
    ("marketing_agent", "compose"),
    ("content_strategist", "compose"),
    ("copywriter", "compose"),
    ("writer", "compose"),
    // PDF/document agents -> html_to_pdf
    ("pdf_composer", "html_to_pdf"),
    ("pdf_generator", "html_to_pdf"),
    ("pdf_creator", "html_to_pdf"),
    ("document_generator", "html_to_pdf"),
    ("report_generator", "compose"),
    // Research agents -> web_research
    ("researcher", "web_research"),
    ("research_agent", "web_research"),
    ("web_scraper", "http_fetch"),
    // Analysis agents -> analyze
    ("data_analyst", "analyze"),
    ("analyzer", "analyze"),
    ("insight_generator", "analyze"),
    // Common misspellings/variations
    ("summarizer", "summarize"),
    ("aggregator", "aggregate"),
    ("image_generator", "generate_image"),
    ("image_gen", "generate_image"),
    ("notification", "notify"),
    ("notifier", "notify"),
    ("email", "notify"),
    ("storage", "file_storage"),
];

/// Agent types the planner may legally emit.
const AVAILABLE_AGENT_TYPES: &[&str] = &[
    "http_fetch",
    "summarize",
    "compose",
    "notify",
    "analyze",
    "transform",
    "file_storage",
    "generate_image",
    "html_to_pdf",
    "schedule_job",
    "document_db",
    "agent_storage",
    "web_research",
    "aggregate",
];

/// Default output field per agent type, for template fixes.
const DEFAULT_OUTPUT_FIELDS: &[(&str, &str)] = &[
    ("web_research", "findings"),
    ("research", "findings"),
    ("summarize", "summary"),
    ("compose", "content"),
    ("analyze", "analysis"),
    ("aggregate", "aggregated_content"),
    ("generate_image", "image_url"),
    ("file_storage", "file_url"),
];

fn is_content_filter_error(error: &str) -> bool {
    let lower = error.to_lowercase();
    CONTENT_FILTER_INDICATORS.iter().any(|i| lower.contains(i))
}

fn is_template_related_error(error: &str) -> bool {
    let lower = error.to_lowercase();
    TEMPLATE_RELATED_INDICATORS.iter().any(|i| lower.contains(i))
}

fn is_invalid_agent_type_error(error: &str) -> bool {
    let lower = error.to_lowercase();
    lower.contains("unknown subagent type") || lower.contains("unknown agent type")
}

fn is_modifiable_step(step: &Step) -> bool {
    MODIFIABLE_AGENT_TYPES.contains(&step.agent_type.as_str())
}

fn extract_invalid_agent_type(error: &str) -> Option<String> {
    static RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"(?i)unknown (?:sub)?agent type:\s*([^\s.,]+)").expect("agent type regex")
    });
    RE.captures(error).map(|c| c[1].to_string())
}

fn suggest_agent_type(invalid: &str) -> Option<&'static str> {
    let lower = invalid.to_lowercase();
    if let Some((_, correct)) = AGENT_TYPE_CORRECTIONS.iter().find(|(k, _)| *k == lower) {
        return Some(correct);
    }
    // Keyword fallback for unmapped names.
    if lower.contains("strategy") || lower.contains("marketing") {
        return Some("compose");
    }
    if lower.contains("pdf") || lower.contains("document") {
        return Some("html_to_pdf");
    }
    if lower.contains("research") || lower.contains("search") {
        return Some("web_research");
    }
    if lower.contains("analy") {
        return Some("analyze");
    }
    if lower.contains("summar") {
        return Some("summarize");
    }
    if lower.contains("image") || lower.contains("picture") {
        return Some("generate_image");
    }
    if lower.contains("notify") || lower.contains("email") {
        return Some("notify");
    }
    if lower.contains("storage") || lower.contains("file") {
        return Some("file_storage");
    }
    if lower.contains("aggregate") || lower.contains("combine") {
        return Some("aggregate");
    }
    None
}

// ---------------------------------------------------------------------------
// Template syntax fixes
// ---------------------------------------------------------------------------

/// Default output field for a referenced step: its actual first output key,
/// else the per-agent table, else `result`.
fn default_field_for(task: &Task, step_ref: &str) -> String {
    let referenced = task
        .steps
        .iter()
        .find(|s| s.id == step_ref || s.name == step_ref);

    if let Some(step) = referenced {
        if let Some(obj) = step.outputs.as_object() {
            if let Some((first, _)) = obj.iter().next() {
                return first.clone();
            }
        }
        if let Some((_, field)) = DEFAULT_OUTPUT_FIELDS
            .iter()
            .find(|(agent, _)| *agent == step.agent_type)
        {
            return (*field).to_string();
        }
    }
    "result".to_string()
}

/// Rewrite malformed template accessors (`.output`, fieldless `.outputs`,
/// `.result`, `.data`) to `.outputs.<field>` throughout a value.
fn fix_template_value(task: &Task, value: &Value) -> Value {
    static FIX_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"\{\{(\w+)\.(output|outputs|result|data)\}\}").expect("template fix regex")
    });

    match value {
        Value::String(s) => {
            let fixed = FIX_RE.replace_all(s, |caps: &Captures| {
                let step_ref = &caps[1];
                let field = default_field_for(task, step_ref);
                format!("{{{{{step_ref}.outputs.{field}}}}}")
            });
            Value::String(fixed.into_owned())
        }
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), fix_template_value(task, v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(
            items.iter().map(|v| fix_template_value(task, v)).collect(),
        ),
        other => other.clone(),
    }
}

// ---------------------------------------------------------------------------
// Observer
// ---------------------------------------------------------------------------

/// Stateless failure analyzer.
///
/// An advisor is optional; without one, every path that would consult the
/// LLM falls through to the deterministic rules.
pub struct Observer {
    advisor: Option<Arc<dyn LlmAdvisor>>,
}

impl Observer {
    pub fn new(advisor: Option<Arc<dyn LlmAdvisor>>) -> Self {
        Self { advisor }
    }

    /// Analyze a step failure and propose a recovery action.
    pub async fn analyze_failure(&self, task: &Task, failed_step: &Step) -> ObserverProposal {
        let error = failed_step.error_message.as_deref().unwrap_or("");
        tracing::info!(
            task_id = %task.id,
            step_id = %failed_step.id,
            error = %error,
            "observer analyzing failure"
        );

        // Template syntax errors are deterministic fixes; they often surface
        // downstream as "no data provided".
        let has_template_errors =
            crate::template::validate_template_syntax(&failed_step.inputs).is_err();
        if has_template_errors && failed_step.retry_count < 2 {
            return self.template_fix_proposal(task, failed_step);
        }
        if is_template_related_error(error) && failed_step.retry_count < 2 {
            // The inputs themselves are well-formed; a dependency's template
            // may have resolved empty. Nothing fixable here, fall through.
            tracing::debug!(
                step_id = %failed_step.id,
                "template-related error with well-formed inputs"
            );
        }

        // agent_type cannot be fixed in place; a plan revision is required.
        if is_invalid_agent_type_error(error) {
            return self.agent_type_replan_proposal(task, failed_step);
        }

        // Content-filter failures on modifiable steps get one rewrite pass.
        if is_content_filter_error(error)
            && is_modifiable_step(failed_step)
            && failed_step.retry_count < 2
        {
            return self.modify_proposal(task, failed_step).await;
        }

        // Tactical choice: LLM first, deterministic rule tree on failure.
        match self.llm_failure_analysis(task, failed_step).await {
            Some(proposal) => proposal,
            None => rule_based_proposal(failed_step),
        }
    }

    /// Whether strategic replanning is warranted once tactical recovery is
    /// exhausted. Returns `None` when the failure does not look structural.
    pub async fn analyze_for_replan(
        &self,
        task: &Task,
        failed_step: &Step,
    ) -> Option<ObserverProposal> {
        let advisor = self.advisor.as_ref()?;
        let completed_outputs = completed_outputs(task);

        let pending: Vec<_> = task
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Pending)
            .map(|s| serde_json::json!({"id": s.id, "name": s.name, "depends_on": s.dependencies}))
            .collect();

        let prompt = format!(
            "<context>\nYou are analyzing whether a failed workflow step requires strategic \
             replanning. Tactical recovery (retry, fallback, skip) has been exhausted or is \
             not applicable.\n</context>\n\n<plan>\nGoal: {goal}\nCompleted steps: \
             {done}\nTotal steps: {total}\n</plan>\n\n<failed_step>\nID: {id}\nName: {name}\n\
             Agent Type: {agent}\nError: {error}\nIs Critical: {critical}\nRetry Count: \
             {retries}/{max_retries}\n</failed_step>\n\n<remaining_steps>\n{pending}\n\
             </remaining_steps>\n\n<task>\nREPLAN is appropriate when the error indicates a \
             structural problem (API shape changed, endpoint deprecated), multiple downstream \
             steps would fail, or a clear alternative approach exists. It is NOT appropriate \
             when the failure is truly unrecoverable.\n\nRespond in this format:\n\
             NEEDS_REPLAN: [true|false]\nDIAGNOSIS: [what went wrong]\nAFFECTED_STEPS: \
             [comma-separated step ids]\nCONSTRAINTS: [comma-separated]\nSUGGESTED_APPROACH: \
             [how to modify the plan]\nCONFIDENCE: [0.0-1.0]\n</task>",
            goal = task.goal,
            done = task
                .steps
                .iter()
                .filter(|s| s.status == StepStatus::Done)
                .count(),
            total = task.steps.len(),
            id = failed_step.id,
            name = failed_step.name,
            agent = failed_step.agent_type,
            error = failed_step.error_message.as_deref().unwrap_or(""),
            critical = failed_step.is_critical,
            retries = failed_step.retry_count,
            max_retries = failed_step.max_retries,
            pending = serde_json::to_string(&pending).unwrap_or_default(),
        );

        match advisor.complete(&prompt, 400, 0.0).await {
            Ok(response) => {
                parse_replan_analysis(&response, failed_step, completed_outputs)
            }
            Err(e) => {
                tracing::error!(
                    task_id = %task.id,
                    error = %e,
                    "replan analysis failed"
                );
                None
            }
        }
    }

    /// Called when ready steps are absent but pending steps have failed
    /// dependencies. Proposes REPLAN with partial-data context, or `None`.
    pub async fn analyze_blocked_dependencies(
        &self,
        task: &Task,
        blocked_steps: &[&Step],
        failed_steps: &[&Step],
    ) -> Option<ObserverProposal> {
        tracing::info!(
            task_id = %task.id,
            blocked_count = blocked_steps.len(),
            failed_count = failed_steps.len(),
            "analyzing blocked dependencies"
        );

        let outputs = completed_outputs(task);

        if let Some(advisor) = &self.advisor {
            let failures: Vec<_> = failed_steps
                .iter()
                .map(|s| {
                    serde_json::json!({
                        "id": s.id,
                        "name": s.name,
                        "error": s.error_message,
                        "retry_count": s.retry_count,
                    })
                })
                .collect();
            let blocked: Vec<_> = blocked_steps
                .iter()
                .map(|s| serde_json::json!({"id": s.id, "name": s.name, "dependencies": s.dependencies}))
                .collect();

            let prompt = format!(
                "<context>\nA workflow is blocked because some steps failed, preventing \
                 downstream steps from executing. Partial results exist from successful \
                 steps.\n</context>\n\n<plan>\nGoal: {goal}\n</plan>\n\n<failed_steps>\n\
                 {failures}\n</failed_steps>\n\n<blocked_steps>\n{blocked}\n</blocked_steps>\n\n\
                 <completed_outputs>\n{outputs}\n</completed_outputs>\n\n<task>\nDetermine if \
                 we should replan to use partial data from successful steps.\n\nRespond in \
                 this format:\nNEEDS_REPLAN: [true|false]\nDIAGNOSIS: [why we're blocked]\n\
                 PARTIAL_DATA_VALUE: [what useful data exists]\nSUGGESTED_APPROACH: [how to \
                 modify the plan]\nCONFIDENCE: [0.0-1.0]\n</task>",
                goal = task.goal,
                failures = serde_json::to_string(&failures).unwrap_or_default(),
                blocked = serde_json::to_string(&blocked).unwrap_or_default(),
                outputs = serde_json::to_string(&outputs.keys().collect::<Vec<_>>())
                    .unwrap_or_default(),
            );

            match advisor.complete(&prompt, 400, 0.0).await {
                Ok(response) => {
                    return parse_blocked_analysis(
                        &response,
                        blocked_steps,
                        failed_steps,
                        outputs,
                    );
                }
                Err(e) => {
                    tracing::error!(task_id = %task.id, error = %e, "blocked analysis failed");
                }
            }
        }

        // Conservative deterministic fallback: replan only when at least
        // half the remaining work is blocked and at least two completed
        // outputs exist to salvage.
        let outputs = completed_outputs(task);
        let total_remaining = blocked_steps.len() + failed_steps.len();
        let blocked_ratio = blocked_steps.len() as f32 / total_remaining.max(1) as f32;

        if !outputs.is_empty() && blocked_ratio >= 0.5 && outputs.len() >= 2 {
            let step_id = blocked_steps
                .first()
                .map(|s| s.id.clone())
                .or_else(|| failed_steps.first().map(|s| s.id.clone()))?;
            let context = ReplanContext {
                diagnosis: format!(
                    "Workflow blocked: {} steps failed, blocking {} downstream steps",
                    failed_steps.len(),
                    blocked_steps.len()
                ),
                affected_steps: blocked_steps
                    .iter()
                    .chain(failed_steps.iter())
                    .map(|s| s.id.clone())
                    .collect(),
                completed_outputs: outputs.clone(),
                constraints: failed_steps
                    .iter()
                    .map(|s| format!("Cannot access: {}", s.name))
                    .collect(),
                suggested_approach: Some(
                    "Replan to synthesize results from available data only".to_string(),
                ),
            };
            let mut proposal = ObserverProposal::new(
                ProposalType::Replan,
                &step_id,
                format!(
                    "Blocked due to {} failed dependencies, but have {} completed step outputs to use",
                    failed_steps.len(),
                    outputs.len()
                ),
            )
            .with_confidence(0.7);
            proposal.replan_context = Some(context);
            return Some(proposal);
        }

        None
    }

    // -- deterministic proposals --------------------------------------------

    fn template_fix_proposal(&self, task: &Task, failed_step: &Step) -> ObserverProposal {
        let errors = crate::template::validate_template_syntax(&failed_step.inputs)
            .err()
            .unwrap_or_default();
        let fixed = fix_template_value(task, &failed_step.inputs);

        tracing::info!(
            step_id = %failed_step.id,
            errors = ?errors,
            "template syntax fix generated"
        );

        let mut proposal = ObserverProposal::new(
            ProposalType::Modify,
            &failed_step.id,
            format!(
                "Template syntax error detected: {}. Fixed to use outputs.<field> syntax.",
                errors.join("; ")
            ),
        )
        .with_confidence(0.95);
        proposal.modified_inputs = Some(fixed);
        proposal
    }

    fn agent_type_replan_proposal(&self, task: &Task, failed_step: &Step) -> ObserverProposal {
        let error = failed_step.error_message.as_deref().unwrap_or("");
        let invalid = extract_invalid_agent_type(error);
        let suggested = invalid.as_deref().and_then(suggest_agent_type);

        let mut diagnosis = format!(
            "Step {:?} uses invalid agent type {:?}.",
            failed_step.name,
            invalid.as_deref().unwrap_or(&failed_step.agent_type),
        );
        if let Some(suggested) = suggested {
            diagnosis.push_str(&format!(" Suggested replacement: {suggested:?}."));
        }
        diagnosis.push_str(&format!(
            " Valid types: {}",
            AVAILABLE_AGENT_TYPES.join(", ")
        ));

        let mut constraints = vec![format!(
            "Must use valid agent types from: {}",
            AVAILABLE_AGENT_TYPES.join(", ")
        )];
        if let (Some(invalid), Some(suggested)) = (&invalid, suggested) {
            constraints.push(format!(
                "The step {:?} should use {:?} instead of {:?}",
                failed_step.name, suggested, invalid
            ));
        }

        let suggested_approach = suggested.map(|s| {
            format!(
                "Replace {:?} with {:?}",
                invalid.as_deref().unwrap_or(&failed_step.agent_type),
                s
            )
        });

        // Summaries only: full outputs go into the blocked-path context.
        let completed: HashMap<String, Value> = task
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Done && has_outputs(&s.outputs))
            .map(|s| {
                let keys: Vec<&String> = s
                    .outputs
                    .as_object()
                    .map(|o| o.keys().collect())
                    .unwrap_or_default();
                (
                    s.id.clone(),
                    serde_json::json!({
                        "name": s.name,
                        "agent_type": s.agent_type,
                        "output_keys": keys,
                    }),
                )
            })
            .collect();

        tracing::info!(
            task_id = %task.id,
            step_id = %failed_step.id,
            invalid_type = ?invalid,
            suggested_type = ?suggested,
            "proposing replan for invalid agent type"
        );

        let mut proposal =
            ObserverProposal::new(ProposalType::Replan, &failed_step.id, diagnosis.clone())
                .with_confidence(0.9);
        proposal.replan_context = Some(ReplanContext {
            diagnosis,
            affected_steps: vec![failed_step.id.clone()],
            completed_outputs: completed,
            constraints,
            suggested_approach,
        });
        proposal
    }

    /// Rewrite content-filtered inputs via the LLM; degrade to ABORT when no
    /// advisor is wired or the rewrite fails.
    async fn modify_proposal(&self, task: &Task, failed_step: &Step) -> ObserverProposal {
        let error = failed_step.error_message.as_deref().unwrap_or("");

        if let Some(advisor) = &self.advisor {
            let prompt = format!(
                "<context>\nA workflow step failed due to a content filter. Modify the inputs \
                 to avoid the filter while preserving the original intent.\n</context>\n\n\
                 <plan_goal>\n{goal}\n</plan_goal>\n\n<failed_step>\nName: {name}\nType: \
                 {agent}\nError: {error}\n</failed_step>\n\n<current_inputs>\n{inputs}\n\
                 </current_inputs>\n\n<task>\nRewrite the inputs to avoid content filters \
                 (copyright, trademark, derivative works). Replace brand names with generic \
                 descriptions and keep the same intent. If a \"prompt\" field exists, rewrite \
                 it; preserve all other fields unchanged.\nReturn ONLY a JSON object with the \
                 modified inputs.\n</task>",
                goal = task.goal,
                name = failed_step.name,
                agent = failed_step.agent_type,
                error = error,
                inputs = serde_json::to_string_pretty(&failed_step.inputs).unwrap_or_default(),
            );

            match advisor.complete(&prompt, 500, 0.3).await {
                Ok(response) => {
                    if let Some(modified) = parse_json_from_response(&response) {
                        // Merge over the originals; rewritten values win.
                        let mut merged = failed_step.inputs.clone();
                        if let (Some(target), Some(source)) =
                            (merged.as_object_mut(), modified.as_object())
                        {
                            for (k, v) in source {
                                target.insert(k.clone(), v.clone());
                            }
                        }
                        let mut proposal = ObserverProposal::new(
                            ProposalType::Modify,
                            &failed_step.id,
                            "Content filter detected. Rewrote inputs to avoid \
                             copyright/trademark terms while preserving intent.",
                        )
                        .with_confidence(0.85);
                        proposal.modified_inputs = Some(merged);
                        return proposal;
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        step_id = %failed_step.id,
                        error = %e,
                        "failed to generate modified inputs"
                    );
                }
            }
        }

        ObserverProposal::new(
            ProposalType::Abort,
            &failed_step.id,
            format!("Content filter error and input modification failed: {error}"),
        )
        .with_confidence(0.6)
    }

    async fn llm_failure_analysis(
        &self,
        task: &Task,
        failed_step: &Step,
    ) -> Option<ObserverProposal> {
        let advisor = self.advisor.as_ref()?;

        let fallback_info = match failed_step.fallback_config.as_ref() {
            Some(cfg) if cfg.has_options() => {
                let mut parts = Vec::new();
                if !cfg.models.is_empty() {
                    parts.push(format!("Models: {}", cfg.models.join(", ")));
                }
                if !cfg.apis.is_empty() {
                    parts.push(format!("APIs: {}", cfg.apis.join(", ")));
                }
                parts.join("; ")
            }
            _ => "No fallbacks available".to_string(),
        };

        let prompt = format!(
            "<context>\nYou are monitoring a workflow execution. A step has failed.\n\
             </context>\n\n<plan>\nGoal: {goal}\n</plan>\n\n<failed_step>\nID: {id}\nName: \
             {name}\nAgent Type: {agent}\nError: {error}\nIs Critical: {critical}\nRetry \
             Count: {retries}/{max_retries}\nFallback Options: {fallbacks}\n</failed_step>\n\n\
             <decision_rules>\nChoose ONE action:\n- RETRY: failure is transient (timeout, \
             rate limit) and retries remain\n- FALLBACK: failure appears permanent but a \
             fallback exists\n- SKIP: step is non-critical and the plan can continue\n- ABORT: \
             step is critical, no fallback, retries exhausted\n</decision_rules>\n\n<task>\n\
             Format:\nACTION: [RETRY|FALLBACK|SKIP|ABORT]\nFALLBACK_TARGET: [target if \
             FALLBACK, otherwise omit]\nREASON: [brief explanation]\n</task>",
            goal = task.goal,
            id = failed_step.id,
            name = failed_step.name,
            agent = failed_step.agent_type,
            error = failed_step.error_message.as_deref().unwrap_or(""),
            critical = failed_step.is_critical,
            retries = failed_step.retry_count,
            max_retries = failed_step.max_retries,
            fallbacks = fallback_info,
        );

        match advisor.complete(&prompt, 200, 0.0).await {
            Ok(response) => Some(parse_failure_analysis(&response, failed_step)),
            Err(e) => {
                tracing::error!(
                    step_id = %failed_step.id,
                    error = %e,
                    "observer analysis failed, using rule-based fallback"
                );
                None
            }
        }
    }
}

/// Deterministic rule tree used when the LLM is unavailable.
///
/// 1. Retries remain and the error looks transient -> RETRY.
/// 2. Fallback options exist -> FALLBACK to the first model, else first API.
/// 3. Step is non-critical -> SKIP.
/// 4. Otherwise -> ABORT.
pub fn rule_based_proposal(step: &Step) -> ObserverProposal {
    let error = step.error_message.as_deref().unwrap_or("");

    if step.retry_count < step.max_retries && is_transient_error(error) {
        return ObserverProposal::new(
            ProposalType::Retry,
            &step.id,
            "Error appears transient, retrying",
        )
        .with_confidence(0.6);
    }

    if let Some(cfg) = step.fallback_config.as_ref() {
        if cfg.has_options() {
            let target = cfg
                .first_model()
                .or_else(|| cfg.first_api())
                .map(str::to_owned);
            let mut proposal =
                ObserverProposal::new(ProposalType::Fallback, &step.id, "Using fallback option")
                    .with_confidence(0.7);
            proposal.fallback_target = target;
            return proposal;
        }
    }

    if !step.is_critical {
        return ObserverProposal::new(
            ProposalType::Skip,
            &step.id,
            "Non-critical step, skipping",
        )
        .with_confidence(0.8);
    }

    ObserverProposal::new(
        ProposalType::Abort,
        &step.id,
        "Critical step failed with no recovery options",
    )
    .with_confidence(0.9)
}

// ---------------------------------------------------------------------------
// Response parsing
// ---------------------------------------------------------------------------

fn has_outputs(outputs: &Value) -> bool {
    match outputs {
        Value::Null => false,
        Value::Object(map) => !map.is_empty(),
        _ => true,
    }
}

fn completed_outputs(task: &Task) -> HashMap<String, Value> {
    task.steps
        .iter()
        .filter(|s| s.status == StepStatus::Done && has_outputs(&s.outputs))
        .map(|s| (s.id.clone(), s.outputs.clone()))
        .collect()
}

fn parse_failure_analysis(response: &str, step: &Step) -> ObserverProposal {
    let mut action = ProposalType::Abort;
    let mut fallback_target: Option<String> = None;
    let mut reason = response.trim().to_string();

    for line in response.lines() {
        let line = line.trim();
        let upper = line.to_uppercase();
        if let Some(rest) = upper.strip_prefix("ACTION:") {
            action = match rest.trim().split_whitespace().next() {
                Some("RETRY") => ProposalType::Retry,
                Some("FALLBACK") => ProposalType::Fallback,
                Some("SKIP") => ProposalType::Skip,
                _ => ProposalType::Abort,
            };
        } else if upper.starts_with("FALLBACK_TARGET:") {
            let value = line.splitn(2, ':').nth(1).unwrap_or("").trim();
            if !value.is_empty() {
                fallback_target = Some(value.to_string());
            }
        } else if upper.starts_with("REASON:") {
            reason = line.splitn(2, ':').nth(1).unwrap_or("").trim().to_string();
        }
    }

    // FALLBACK without a target uses the first available option.
    if action == ProposalType::Fallback && fallback_target.is_none() {
        if let Some(cfg) = step.fallback_config.as_ref() {
            fallback_target = cfg
                .first_model()
                .or_else(|| cfg.first_api())
                .map(str::to_owned);
        }
    }

    let confidence = if action == ProposalType::Abort { 0.7 } else { 0.9 };
    let mut proposal =
        ObserverProposal::new(action, &step.id, reason).with_confidence(confidence);
    proposal.fallback_target = fallback_target;
    proposal
}

fn parse_replan_analysis(
    response: &str,
    step: &Step,
    completed_outputs: HashMap<String, Value>,
) -> Option<ObserverProposal> {
    let fields = parse_kv_lines(response);
    let needs_replan = fields
        .get("NEEDS_REPLAN")
        .is_some_and(|v| v.eq_ignore_ascii_case("true"));
    if !needs_replan {
        return None;
    }

    let diagnosis = fields
        .get("DIAGNOSIS")
        .cloned()
        .unwrap_or_else(|| "structural failure".to_string());
    let affected: Vec<String> = fields
        .get("AFFECTED_STEPS")
        .map(|v| {
            v.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_else(|| vec![step.id.clone()]);
    let constraints: Vec<String> = fields
        .get("CONSTRAINTS")
        .map(|v| {
            v.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default();
    let confidence = fields
        .get("CONFIDENCE")
        .and_then(|v| v.parse::<f32>().ok())
        .unwrap_or(0.7);

    let mut proposal = ObserverProposal::new(
        ProposalType::Replan,
        &step.id,
        format!("Strategic replan: {diagnosis}"),
    )
    .with_confidence(confidence);
    proposal.replan_context = Some(ReplanContext {
        diagnosis,
        affected_steps: affected,
        completed_outputs,
        constraints,
        suggested_approach: fields.get("SUGGESTED_APPROACH").cloned(),
    });
    Some(proposal)
}

fn parse_blocked_analysis(
    response: &str,
    blocked_steps: &[&Step],
    failed_steps: &[&Step],
    completed_outputs: HashMap<String, Value>,
) -> Option<ObserverProposal> {
    let fields = parse_kv_lines(response);
    let needs_replan = fields
        .get("NEEDS_REPLAN")
        .is_some_and(|v| v.eq_ignore_ascii_case("true"));
    if !needs_replan {
        return None;
    }

    let diagnosis = fields.get("DIAGNOSIS").cloned().unwrap_or_else(|| {
        format!("Blocked due to {} failed dependencies", failed_steps.len())
    });
    let suggested = fields
        .get("SUGGESTED_APPROACH")
        .cloned()
        .or_else(|| {
            fields
                .get("PARTIAL_DATA_VALUE")
                .map(|v| format!("Use partial data: {v}"))
        });
    let confidence = fields
        .get("CONFIDENCE")
        .and_then(|v| v.parse::<f32>().ok())
        .unwrap_or(0.7);

    let step_id = blocked_steps
        .first()
        .map(|s| s.id.clone())
        .or_else(|| failed_steps.first().map(|s| s.id.clone()))?;

    let mut proposal = ObserverProposal::new(
        ProposalType::Replan,
        &step_id,
        format!("Strategic replan with partial data: {diagnosis}"),
    )
    .with_confidence(confidence);
    proposal.replan_context = Some(ReplanContext {
        diagnosis,
        affected_steps: blocked_steps
            .iter()
            .chain(failed_steps.iter())
            .map(|s| s.id.clone())
            .collect(),
        completed_outputs,
        constraints: failed_steps
            .iter()
            .map(|s| {
                format!(
                    "Cannot access: {} ({})",
                    s.name,
                    s.error_message.as_deref().unwrap_or("failed")
                )
            })
            .collect(),
        suggested_approach: suggested,
    });
    Some(proposal)
}

/// Parse `KEY: value` lines into a map, keys uppercased.
fn parse_kv_lines(response: &str) -> HashMap<String, String> {
    let mut fields = HashMap::new();
    for line in response.lines() {
        let line = line.trim();
        if let Some((key, value)) = line.split_once(':') {
            let key = key.trim().to_uppercase();
            if key
                .chars()
                .all(|c| c.is_ascii_uppercase() || c == '_' || c.is_ascii_digit())
            {
                fields.insert(key, value.trim().to_string());
            }
        }
    }
    fields
}

/// Extract the first JSON object from an LLM response.
fn parse_json_from_response(response: &str) -> Option<Value> {
    let trimmed = response.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        if value.is_object() {
            return Some(value);
        }
    }
    // Fall back to the outermost brace span.
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str::<Value>(&trimmed[start..=end])
        .ok()
        .filter(Value::is_object)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use sqlx::types::Json;
    use tentackl_db::models::{FailurePolicy, FallbackConfig, TaskStatus};
    use uuid::Uuid;

    fn step(id: &str, agent_type: &str) -> Step {
        Step {
            task_id: Uuid::nil(),
            id: id.to_string(),
            name: id.to_string(),
            description: String::new(),
            agent_type: agent_type.to_string(),
            domain: None,
            inputs: json!({}),
            outputs: json!({}),
            dependencies: vec![],
            status: StepStatus::Failed,
            parallel_group: None,
            failure_policy: FailurePolicy::AllOrNothing,
            checkpoint_required: false,
            checkpoint_config: None,
            fallback_config: None,
            is_critical: true,
            retry_count: 0,
            max_retries: 3,
            error_message: None,
            started_at: None,
            completed_at: None,
            execution_time_ms: None,
            position: 0,
        }
    }

    fn task(steps: Vec<Step>) -> Task {
        Task {
            id: Uuid::new_v4(),
            goal: "test goal".into(),
            user_id: "u".into(),
            organization_id: None,
            status: TaskStatus::Executing,
            constraints: json!({}),
            success_criteria: json!({}),
            max_parallel_steps: 5,
            metadata: json!({}),
            tree_id: None,
            parent_task_id: None,
            superseded_by: None,
            version: 1,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            completed_at: None,
            steps,
        }
    }

    #[tokio::test]
    async fn template_syntax_error_yields_deterministic_modify() {
        let mut research = step("step_1", "web_research");
        research.status = StepStatus::Done;
        let mut failed = step("step_2", "summarize");
        failed.inputs = json!({"summary": "{{step_1.output}}"});
        failed.error_message = Some("no data provided".to_string());
        let t = task(vec![research, failed.clone()]);

        let observer = Observer::new(None);
        let proposal = observer.analyze_failure(&t, &failed).await;

        assert_eq!(proposal.proposal_type, ProposalType::Modify);
        let modified = proposal.modified_inputs.unwrap();
        assert_eq!(modified["summary"], json!("{{step_1.outputs.findings}}"));
    }

    #[tokio::test]
    async fn template_fix_prefers_actual_output_keys() {
        let mut research = step("step_1", "web_research");
        research.status = StepStatus::Done;
        research.outputs = json!({"articles": ["a"]});
        let mut failed = step("step_2", "compose");
        failed.inputs = json!({"body": "{{step_1.outputs}}"});
        let t = task(vec![research, failed.clone()]);

        let observer = Observer::new(None);
        let proposal = observer.analyze_failure(&t, &failed).await;
        let modified = proposal.modified_inputs.unwrap();
        assert_eq!(modified["body"], json!("{{step_1.outputs.articles}}"));
    }

    #[tokio::test]
    async fn unknown_agent_type_yields_replan_with_suggestion() {
        let mut failed = step("step_2", "marketing_strategist");
        failed.error_message =
            Some("Unknown subagent type: marketing_strategist. Available: [...]".to_string());
        let t = task(vec![failed.clone()]);

        let observer = Observer::new(None);
        let proposal = observer.analyze_failure(&t, &failed).await;

        assert_eq!(proposal.proposal_type, ProposalType::Replan);
        let context = proposal.replan_context.unwrap();
        assert!(context.diagnosis.contains("\"compose\""));
        assert_eq!(context.affected_steps, vec!["step_2".to_string()]);
    }

    #[tokio::test]
    async fn content_filter_without_advisor_degrades_to_abort() {
        let mut failed = step("step_1", "generate_image");
        failed.inputs = json!({"prompt": "A Polytopia map"});
        failed.error_message = Some("Derivative Works Filter".to_string());
        let t = task(vec![failed.clone()]);

        let observer = Observer::new(None);
        let proposal = observer.analyze_failure(&t, &failed).await;
        assert_eq!(proposal.proposal_type, ProposalType::Abort);
    }

    #[test]
    fn rule_tree_retry_on_transient() {
        let mut s = step("step_1", "http_fetch");
        s.error_message = Some("fetch timeout".to_string());
        s.retry_count = 1;
        let proposal = rule_based_proposal(&s);
        assert_eq!(proposal.proposal_type, ProposalType::Retry);
    }

    #[test]
    fn rule_tree_fallback_prefers_models() {
        let mut s = step("step_1", "llm");
        s.error_message = Some("model deprecated".to_string());
        s.retry_count = 3;
        s.fallback_config = Some(Json(FallbackConfig {
            models: vec!["backup-model".into()],
            apis: vec!["https://api.example.com".into()],
        }));
        let proposal = rule_based_proposal(&s);
        assert_eq!(proposal.proposal_type, ProposalType::Fallback);
        assert_eq!(proposal.fallback_target.as_deref(), Some("backup-model"));
    }

    #[test]
    fn rule_tree_skip_non_critical_then_abort() {
        let mut s = step("step_1", "notify");
        s.error_message = Some("permanent failure".to_string());
        s.retry_count = 3;
        s.is_critical = false;
        assert_eq!(rule_based_proposal(&s).proposal_type, ProposalType::Skip);

        s.is_critical = true;
        assert_eq!(rule_based_proposal(&s).proposal_type, ProposalType::Abort);
    }

    #[tokio::test]
    async fn blocked_fallback_requires_half_blocked_and_two_outputs() {
        let mut a = step("a", "web_research");
        a.status = StepStatus::Done;
        a.outputs = json!({"findings": "x"});
        let mut b = step("b", "web_research");
        b.status = StepStatus::Done;
        b.outputs = json!({"findings": "y"});
        let mut failed = step("c", "http_fetch");
        failed.error_message = Some("site blocked".to_string());
        let mut blocked = step("d", "compose");
        blocked.status = StepStatus::Pending;
        blocked.dependencies = vec!["c".to_string()];

        let t = task(vec![a, b, failed.clone(), blocked.clone()]);
        let observer = Observer::new(None);

        let proposal = observer
            .analyze_blocked_dependencies(&t, &[&blocked], &[&failed])
            .await
            .expect("should propose replan");
        assert_eq!(proposal.proposal_type, ProposalType::Replan);
        let context = proposal.replan_context.unwrap();
        assert_eq!(context.completed_outputs.len(), 2);
    }

    #[tokio::test]
    async fn blocked_fallback_declines_with_one_output() {
        let mut a = step("a", "web_research");
        a.status = StepStatus::Done;
        a.outputs = json!({"findings": "x"});
        let mut failed = step("c", "http_fetch");
        failed.error_message = Some("site blocked".to_string());
        let mut blocked = step("d", "compose");
        blocked.status = StepStatus::Pending;
        blocked.dependencies = vec!["c".to_string()];

        let t = task(vec![a, failed.clone(), blocked.clone()]);
        let observer = Observer::new(None);

        assert!(
            observer
                .analyze_blocked_dependencies(&t, &[&blocked], &[&failed])
                .await
                .is_none()
        );
    }

    #[test]
    fn failure_analysis_parsing() {
        let s = step("step_1", "llm");
        let proposal = parse_failure_analysis(
            "ACTION: RETRY\nREASON: transient rate limit",
            &s,
        );
        assert_eq!(proposal.proposal_type, ProposalType::Retry);
        assert_eq!(proposal.reason, "transient rate limit");

        let mut with_fallback = step("step_2", "llm");
        with_fallback.fallback_config = Some(Json(FallbackConfig {
            models: vec!["m1".into()],
            apis: vec![],
        }));
        let proposal = parse_failure_analysis("ACTION: FALLBACK", &with_fallback);
        assert_eq!(proposal.fallback_target.as_deref(), Some("m1"));
    }

    #[test]
    fn json_extraction_from_noisy_response() {
        let response = "Here are the modified inputs:\n{\"prompt\": \"A colorful map\"}\nDone.";
        let value = parse_json_from_response(response).unwrap();
        assert_eq!(value["prompt"], json!("A colorful map"));

        assert!(parse_json_from_response("no json here").is_none());
    }

    #[test]
    fn invalid_agent_type_extraction() {
        assert_eq!(
            extract_invalid_agent_type("Unknown subagent type: marketing_strategist. More."),
            Some("marketing_strategist".to_string())
        );
        assert_eq!(suggest_agent_type("pdf_composer"), Some("html_to_pdf"));
        assert_eq!(suggest_agent_type("researcher"), Some("web_research"));
        assert_eq!(suggest_agent_type("some_design_bot"), None);
    }
}
