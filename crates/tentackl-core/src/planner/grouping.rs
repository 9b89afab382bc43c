//! Parallel-group assignment.
//!
//! Walks the dependency DAG in topological levels and tags each level of
//! mutually independent steps with a shared `parallel_group`. Levels with a
//! single step stay untagged. Planner-supplied groups are respected.

use std::collections::{HashMap, HashSet};

use crate::ports::StepDraft;

/// Assign `parallel_group` tags to a plan's steps in place.
pub fn assign_parallel_groups(steps: &mut [StepDraft]) {
    let ids: HashSet<String> = steps.iter().map(|s| s.id.clone()).collect();

    // Topological level of each step: 0 for entry steps, otherwise one past
    // the deepest dependency. Unknown dependencies are ignored here; the
    // commit-time validator rejects them.
    let mut levels: HashMap<String, usize> = HashMap::new();
    let mut remaining: Vec<&StepDraft> = steps.iter().collect();

    while !remaining.is_empty() {
        let before = remaining.len();
        remaining.retain(|step| {
            let deps: Vec<&String> = step
                .dependencies
                .iter()
                .filter(|d| ids.contains(*d))
                .collect();
            if deps.iter().all(|d| levels.contains_key(*d)) {
                let level = deps
                    .iter()
                    .map(|d| levels[*d] + 1)
                    .max()
                    .unwrap_or(0);
                levels.insert(step.id.clone(), level);
                false
            } else {
                true
            }
        });
        if remaining.len() == before {
            // Dependency cycle; leave the remaining steps untagged.
            tracing::warn!(
                steps = ?remaining.iter().map(|s| &s.id).collect::<Vec<_>>(),
                "dependency cycle detected while grouping, leaving steps ungrouped"
            );
            break;
        }
    }

    // Count untagged steps per level.
    let mut level_counts: HashMap<usize, usize> = HashMap::new();
    for step in steps.iter() {
        if step.parallel_group.is_none() {
            if let Some(level) = levels.get(&step.id) {
                *level_counts.entry(*level).or_insert(0) += 1;
            }
        }
    }

    for step in steps.iter_mut() {
        if step.parallel_group.is_some() {
            continue;
        }
        if let Some(level) = levels.get(&step.id) {
            if level_counts.get(level).copied().unwrap_or(0) > 1 {
                step.parallel_group = Some(format!("level_{level}"));
            }
        }
    }
}
