//! Durable execution tree.
//!
//! Per-task DAG whose nodes mirror steps plus a synthetic root. The tree is
//! the single source of truth for *readiness*: a step is ready iff every
//! dependency's node is in a terminal success state (completed or skipped).
//! All mutation goes through [`TreeStore`].

use std::collections::HashMap;

use anyhow::{Context, Result, bail};
use serde_json::Value;
use tokio::sync::RwLock;
use uuid::Uuid;

use tentackl_db::models::{Step, Task};

/// Synthetic root node id; always completed.
pub const ROOT_NODE: &str = "root";

/// Status of a tree node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Skipped,
}

impl NodeStatus {
    pub fn is_terminal_success(self) -> bool {
        matches!(self, Self::Completed | Self::Skipped)
    }
}

/// A node in the execution tree, mirroring one step.
#[derive(Debug, Clone)]
pub struct TreeNode {
    pub step_id: String,
    pub status: NodeStatus,
    pub dependencies: Vec<String>,
    /// Cached outputs from completion; used when reconstructing steps.
    pub outputs: Value,
    pub error: Option<String>,
    /// Snapshot of the step at tree creation, used to rebuild dispatch
    /// payloads when the cache is cold.
    pub step: Option<Step>,
}

/// The execution tree for one task.
#[derive(Debug, Clone)]
pub struct ExecutionTree {
    pub id: Uuid,
    pub task_id: Uuid,
    nodes: HashMap<String, TreeNode>,
}

impl ExecutionTree {
    fn from_task(task: &Task) -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(
            ROOT_NODE.to_string(),
            TreeNode {
                step_id: ROOT_NODE.to_string(),
                status: NodeStatus::Completed,
                dependencies: Vec::new(),
                outputs: Value::Null,
                error: None,
                step: None,
            },
        );

        for step in &task.steps {
            // Steps with no dependencies hang off the synthetic root.
            let dependencies = if step.dependencies.is_empty() {
                vec![ROOT_NODE.to_string()]
            } else {
                step.dependencies.clone()
            };
            nodes.insert(
                step.id.clone(),
                TreeNode {
                    step_id: step.id.clone(),
                    status: match step.status {
                        tentackl_db::models::StepStatus::Done => NodeStatus::Completed,
                        tentackl_db::models::StepStatus::Skipped => NodeStatus::Skipped,
                        tentackl_db::models::StepStatus::Failed => NodeStatus::Failed,
                        tentackl_db::models::StepStatus::Running => NodeStatus::Running,
                        tentackl_db::models::StepStatus::Checkpoint => NodeStatus::Paused,
                        tentackl_db::models::StepStatus::Pending => NodeStatus::Pending,
                    },
                    dependencies,
                    outputs: step.outputs.clone(),
                    error: step.error_message.clone(),
                    step: Some(step.clone()),
                },
            );
        }

        Self {
            id: Uuid::new_v4(),
            task_id: task.id,
            nodes,
        }
    }

    fn node(&self, step_id: &str) -> Option<&TreeNode> {
        self.nodes.get(step_id)
    }

    /// Node ids whose dependencies are all in a terminal success state and
    /// whose own status is pending, in stable (plan) order.
    fn ready_nodes(&self) -> Vec<String> {
        let mut ready: Vec<&TreeNode> = self
            .nodes
            .values()
            .filter(|n| n.step_id != ROOT_NODE && n.status == NodeStatus::Pending)
            .filter(|n| {
                n.dependencies.iter().all(|dep| {
                    self.nodes
                        .get(dep)
                        .map(|d| d.status.is_terminal_success())
                        .unwrap_or(false)
                })
            })
            .collect();
        ready.sort_by_key(|n| n.step.as_ref().map(|s| s.position).unwrap_or(i32::MAX));
        ready.into_iter().map(|n| n.step_id.clone()).collect()
    }

    /// Whether every non-root node reached a terminal state, and the final
    /// status: failed if any node failed, completed otherwise.
    fn completion(&self) -> (bool, TreeOutcome) {
        let mut any_failed = false;
        for node in self.nodes.values() {
            if node.step_id == ROOT_NODE {
                continue;
            }
            match node.status {
                NodeStatus::Completed | NodeStatus::Skipped => {}
                NodeStatus::Failed => any_failed = true,
                NodeStatus::Pending | NodeStatus::Running | NodeStatus::Paused => {
                    // A pending node blocked behind a failed dependency can
                    // never run; it does not keep the tree alive.
                    if node.status == NodeStatus::Pending && self.is_blocked(node) {
                        any_failed = true;
                        continue;
                    }
                    return (false, TreeOutcome::InProgress);
                }
            }
        }
        if any_failed {
            (true, TreeOutcome::Failed)
        } else {
            (true, TreeOutcome::Completed)
        }
    }

    /// A pending node is blocked when some dependency chain ends in failure.
    fn is_blocked(&self, node: &TreeNode) -> bool {
        node.dependencies.iter().any(|dep| {
            self.nodes.get(dep).is_some_and(|d| {
                d.status == NodeStatus::Failed
                    || (d.status == NodeStatus::Pending && self.is_blocked(d))
            })
        })
    }
}

/// Final outcome reported by [`TreeStore::is_task_complete`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeOutcome {
    InProgress,
    Completed,
    Failed,
}

/// Aggregate node counts for a tree.
#[derive(Debug, Clone, Default)]
pub struct TreeMetrics {
    pub total_nodes: usize,
    pub pending: usize,
    pub running: usize,
    pub paused: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// In-process store of execution trees, keyed by task id.
#[derive(Default)]
pub struct TreeStore {
    trees: RwLock<HashMap<Uuid, ExecutionTree>>,
}

impl TreeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create (or rebuild) the tree for a task from its current steps.
    /// Returns the tree id to record on the task.
    pub async fn create_tree(&self, task: &Task) -> Uuid {
        let tree = ExecutionTree::from_task(task);
        let tree_id = tree.id;
        self.trees.write().await.insert(task.id, tree);
        tree_id
    }

    /// Drop the tree for a task.
    pub async fn remove_tree(&self, task_id: Uuid) {
        self.trees.write().await.remove(&task_id);
    }

    pub async fn has_tree(&self, task_id: Uuid) -> bool {
        self.trees.read().await.contains_key(&task_id)
    }

    async fn with_node_mut<T>(
        &self,
        task_id: Uuid,
        step_id: &str,
        f: impl FnOnce(&mut TreeNode) -> T,
    ) -> Result<T> {
        let mut trees = self.trees.write().await;
        let tree = trees
            .get_mut(&task_id)
            .with_context(|| format!("no execution tree for task {task_id}"))?;
        let node = tree
            .nodes
            .get_mut(step_id)
            .with_context(|| format!("no tree node {step_id} for task {task_id}"))?;
        Ok(f(node))
    }

    /// Mark a node running.
    pub async fn start_step(&self, task_id: Uuid, step_id: &str) -> Result<()> {
        self.with_node_mut(task_id, step_id, |node| {
            node.status = NodeStatus::Running;
            node.error = None;
        })
        .await
    }

    /// Pause a node at a checkpoint.
    pub async fn pause_step(&self, task_id: Uuid, step_id: &str) -> Result<()> {
        self.with_node_mut(task_id, step_id, |node| {
            node.status = NodeStatus::Paused;
        })
        .await
    }

    /// Complete a node, caching its outputs.
    pub async fn complete_step(&self, task_id: Uuid, step_id: &str, outputs: Value) -> Result<()> {
        self.with_node_mut(task_id, step_id, |node| {
            node.status = NodeStatus::Completed;
            node.outputs = outputs.clone();
            if let Some(step) = node.step.as_mut() {
                step.outputs = outputs;
                step.status = tentackl_db::models::StepStatus::Done;
            }
        })
        .await
    }

    /// Fail a node with an error message.
    pub async fn fail_step(&self, task_id: Uuid, step_id: &str, error: &str) -> Result<()> {
        self.with_node_mut(task_id, step_id, |node| {
            node.status = NodeStatus::Failed;
            node.error = Some(error.to_owned());
        })
        .await
    }

    /// Skip a node; counts as terminal success for dependants.
    pub async fn skip_step(&self, task_id: Uuid, step_id: &str) -> Result<()> {
        self.with_node_mut(task_id, step_id, |node| {
            node.status = NodeStatus::Skipped;
        })
        .await
    }

    /// Reset a node to pending for a retry.
    pub async fn reset_step(&self, task_id: Uuid, step_id: &str) -> Result<()> {
        self.with_node_mut(task_id, step_id, |node| {
            node.status = NodeStatus::Pending;
            node.outputs = Value::Null;
        })
        .await
    }

    /// Fetch the step snapshot stored on a node, refreshed with the node's
    /// cached outputs and status.
    pub async fn get_step_from_tree(&self, task_id: Uuid, step_id: &str) -> Result<Option<Step>> {
        let trees = self.trees.read().await;
        let Some(tree) = trees.get(&task_id) else {
            return Ok(None);
        };
        Ok(tree.node(step_id).and_then(|n| n.step.clone()))
    }

    /// Node ids ready for dispatch.
    pub async fn ready_nodes(&self, task_id: Uuid) -> Result<Vec<String>> {
        let trees = self.trees.read().await;
        let tree = trees
            .get(&task_id)
            .with_context(|| format!("no execution tree for task {task_id}"))?;
        Ok(tree.ready_nodes())
    }

    /// Whether the tree reached a terminal state, and which one.
    pub async fn is_task_complete(&self, task_id: Uuid) -> Result<(bool, TreeOutcome)> {
        let trees = self.trees.read().await;
        let tree = trees
            .get(&task_id)
            .with_context(|| format!("no execution tree for task {task_id}"))?;
        Ok(tree.completion())
    }

    /// Aggregate metrics over the tree's nodes (root included).
    pub async fn get_tree_metrics(&self, task_id: Uuid) -> Result<TreeMetrics> {
        let trees = self.trees.read().await;
        let tree = trees
            .get(&task_id)
            .with_context(|| format!("no execution tree for task {task_id}"))?;

        let mut metrics = TreeMetrics {
            total_nodes: tree.nodes.len(),
            ..Default::default()
        };
        for node in tree.nodes.values() {
            match node.status {
                NodeStatus::Pending => metrics.pending += 1,
                NodeStatus::Running => metrics.running += 1,
                NodeStatus::Paused => metrics.paused += 1,
                NodeStatus::Completed => metrics.completed += 1,
                NodeStatus::Failed => metrics.failed += 1,
                NodeStatus::Skipped => metrics.skipped += 1,
            }
        }
        Ok(metrics)
    }

    /// The tree id for a task, if a tree exists.
    pub async fn tree_id(&self, task_id: Uuid) -> Option<Uuid> {
        self.trees.read().await.get(&task_id).map(|t| t.id)
    }

    /// Validate that the task's dependency references form a DAG over known
    /// step ids. Returns an error naming the offending step.
    pub fn validate_dependencies(task: &Task) -> Result<()> {
        let ids: std::collections::HashSet<&str> =
            task.steps.iter().map(|s| s.id.as_str()).collect();
        for step in &task.steps {
            for dep in &step.dependencies {
                if !ids.contains(dep.as_str()) {
                    bail!(
                        "step {:?} depends on unknown step {:?}",
                        step.id,
                        dep
                    );
                }
            }
        }
        Ok(())
    }
}
