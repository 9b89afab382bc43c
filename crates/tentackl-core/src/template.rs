//! Template references in step inputs.
//!
//! Two syntaxes flow data between steps:
//!
//! - `{{step_ref.outputs.field}}` / `{{step_ref.outputs.field[n]}}`, where
//!   `step_ref` is the referenced step's id or name;
//! - `${node.step_ref.field}`.
//!
//! When a string input is *exactly* one reference, resolution preserves the
//! referent's native JSON type. Embedded references are stringified: objects
//! as JSON, strings truncated past [`TRUNCATION_LIMIT`] with an explicit
//! marker.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde_json::Value;

use tentackl_db::models::Task;

/// Maximum length of a string substituted into a larger string.
pub const TRUNCATION_LIMIT: usize = 50_000;

/// Marker appended to truncated substitutions.
pub const TRUNCATION_MARKER: &str = "\n... [content truncated]";

static CURLY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{([a-zA-Z][a-zA-Z0-9_]*)\.(output|outputs)(?:\.(\w+))?(?:\[(\d+)\])?\}\}")
        .expect("curly template regex")
});

static DOLLAR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{node\.([a-zA-Z][a-zA-Z0-9_]*)\.(\w+)\}").expect("dollar template regex")
});

// Any {{ref.accessor}} shape, used by the validator to spot malformed
// accessors the resolver would silently skip.
static ANY_CURLY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{([a-zA-Z][a-zA-Z0-9_]*)\.([a-zA-Z0-9_.\[\]]+)\}\}")
        .expect("generic template regex")
});

static VALID_ACCESSOR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^outputs\.\w+(\[\d+\])?$").expect("accessor regex")
});

/// Validate template syntax in step inputs before resolution.
///
/// Rejects malformed shapes such as `{{step_1.output}}` (fieldless),
/// `{{step_1.outputs}}`, `{{step_1.result}}`, or `{{step_1.data}}` -- all of
/// which must be written `{{step_1.outputs.<field>}}`. Returns the list of
/// offending references.
pub fn validate_template_syntax(inputs: &Value) -> Result<(), Vec<String>> {
    let rendered = inputs.to_string();
    let mut errors = Vec::new();

    for caps in ANY_CURLY_RE.captures_iter(&rendered) {
        let accessor = &caps[2];
        if !VALID_ACCESSOR_RE.is_match(accessor) {
            errors.push(format!(
                "invalid template reference {:?}: use {{{{{}.outputs.<field>}}}}",
                caps.get(0).map(|m| m.as_str()).unwrap_or_default(),
                &caps[1],
            ));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Map of resolvable outputs keyed by step id *and* step name, for every
/// step in a terminal-success status.
fn output_map(task: &Task) -> HashMap<String, &Value> {
    let mut outputs: HashMap<String, &Value> = HashMap::new();
    for step in &task.steps {
        if step.status.is_terminal_success() {
            outputs.insert(step.id.clone(), &step.outputs);
            if !step.name.is_empty() && step.name != step.id {
                outputs.insert(step.name.clone(), &step.outputs);
            }
        }
    }
    outputs
}

/// Extract a value from an output with optional field and array-index
/// accessors. Out-of-bounds indexes resolve to an empty string.
fn extract_value<'a>(output: &'a Value, field: Option<&str>, index: Option<usize>) -> &'a Value {
    static EMPTY: Value = Value::Null;
    let mut current = output;
    if let Some(field) = field {
        match current.get(field) {
            Some(v) => current = v,
            None => return &EMPTY,
        }
    }
    if let Some(idx) = index {
        match current.get(idx) {
            Some(v) => current = v,
            None => return &EMPTY,
        }
    }
    current
}

/// Stringify a resolved value for embedding inside a larger string.
fn embed(value: &Value) -> String {
    match value {
        Value::String(s) => {
            if s.len() > TRUNCATION_LIMIT {
                let mut cut = TRUNCATION_LIMIT;
                while !s.is_char_boundary(cut) {
                    cut -= 1;
                }
                format!("{}{}", &s[..cut], TRUNCATION_MARKER)
            } else {
                s.clone()
            }
        }
        Value::Object(_) | Value::Array(_) => value.to_string(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Resolve template references in a step's inputs against the task's
/// completed outputs. References to unknown steps are left untouched.
pub fn resolve_templates(task: &Task, inputs: &Value) -> Value {
    let outputs = output_map(task);
    resolve_value(inputs, &outputs)
}

fn resolve_value(value: &Value, outputs: &HashMap<String, &Value>) -> Value {
    match value {
        Value::String(s) => resolve_string(s, outputs),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve_value(v, outputs)))
                .collect(),
        ),
        Value::Array(items) => {
            Value::Array(items.iter().map(|v| resolve_value(v, outputs)).collect())
        }
        other => other.clone(),
    }
}

fn resolve_string(s: &str, outputs: &HashMap<String, &Value>) -> Value {
    // Full-match references preserve the referent's native type.
    if let Some(caps) = CURLY_RE.captures(s) {
        if caps.get(0).map(|m| m.as_str()) == Some(s) {
            let step_ref = &caps[1];
            if let Some(output) = outputs.get(step_ref) {
                let field = caps.get(3).map(|m| m.as_str());
                let index = caps.get(4).and_then(|m| m.as_str().parse::<usize>().ok());
                return extract_value(output, field, index).clone();
            }
            return Value::String(s.to_owned());
        }
    }
    if let Some(caps) = DOLLAR_RE.captures(s) {
        if caps.get(0).map(|m| m.as_str()) == Some(s) {
            let step_ref = &caps[1];
            if let Some(output) = outputs.get(step_ref) {
                let field = caps.get(2).map(|m| m.as_str());
                return extract_value(output, field, None).clone();
            }
            return Value::String(s.to_owned());
        }
    }

    // Embedded references stringify in place.
    let replaced = CURLY_RE.replace_all(s, |caps: &Captures| {
        let step_ref = &caps[1];
        match outputs.get(step_ref) {
            Some(output) => {
                let field = caps.get(3).map(|m| m.as_str());
                let index = caps.get(4).and_then(|m| m.as_str().parse::<usize>().ok());
                embed(extract_value(output, field, index))
            }
            None => caps[0].to_string(),
        }
    });
    let replaced = DOLLAR_RE.replace_all(&replaced, |caps: &Captures| {
        let step_ref = &caps[1];
        match outputs.get(step_ref) {
            Some(output) => embed(extract_value(output, caps.get(2).map(|m| m.as_str()), None)),
            None => caps[0].to_string(),
        }
    });

    Value::String(replaced.into_owned())
}

/// Substitute `${trigger_event.<path>}` tokens recursively through strings,
/// objects and arrays. Unknown paths are left untouched.
pub fn substitute_event_refs(value: &Value, event: &Value) -> Value {
    static EVENT_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"\$\{trigger_event\.([^}]+)\}").expect("trigger event regex")
    });

    match value {
        Value::String(s) => {
            if !s.contains("${trigger_event.") {
                return value.clone();
            }
            let replaced = EVENT_RE.replace_all(s, |caps: &Captures| {
                match lookup_path(event, &caps[1]) {
                    Some(v) => match v {
                        Value::String(inner) => inner.clone(),
                        other => other.to_string(),
                    },
                    None => caps[0].to_string(),
                }
            });
            Value::String(replaced.into_owned())
        }
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), substitute_event_refs(v, event)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|v| substitute_event_refs(v, event))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn lookup_path<'a>(event: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = event;
    for key in path.split('.') {
        current = current.get(key)?;
    }
    Some(current)
}
