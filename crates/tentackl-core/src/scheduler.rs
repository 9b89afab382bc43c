//! Scheduler: drives the execution tree and dispatches ready steps.
//!
//! `schedule_ready_nodes` queries the tree for pending nodes whose
//! dependencies reached terminal success, resolves template references into
//! the dispatch payload, and hands work items to the queue runtime. Workers
//! consume the queue and run the step-execution lifecycle; transient
//! retries re-enter the same queue.

use std::sync::Arc;

use sqlx::PgPool;
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use tentackl_db::queries::tasks as task_db;

use crate::cache::TaskCache;
use crate::error::{CoreError, CoreResult};
use crate::orchestrator::inject_system_context;
use crate::stepexec::{StepDispatch, StepExecStatus, StepExecutor};
use crate::template::resolve_templates;
use crate::tree::TreeStore;

/// Dispatches ready tree nodes onto the work queue.
pub struct Scheduler {
    pool: PgPool,
    cache: Arc<TaskCache>,
    tree: Arc<TreeStore>,
    queue: mpsc::UnboundedSender<StepDispatch>,
}

impl Scheduler {
    pub fn new(
        pool: PgPool,
        cache: Arc<TaskCache>,
        tree: Arc<TreeStore>,
        queue: mpsc::UnboundedSender<StepDispatch>,
    ) -> Self {
        Self {
            pool,
            cache,
            tree,
            queue,
        }
    }

    /// Enqueue every ready node of a task. Returns the number scheduled.
    pub async fn schedule_ready_nodes(&self, task_id: Uuid) -> CoreResult<usize> {
        let task = match self.cache.get_task(task_id).await {
            Some(task) => task,
            None => {
                let task = task_db::get_task_with_steps(&self.pool, task_id)
                    .await?
                    .ok_or_else(|| CoreError::NotFound(format!("task {task_id}")))?;
                self.cache.put_task(task.clone()).await;
                task
            }
        };

        // Rebuild the tree from the primary store after a restart.
        if !self.tree.has_tree(task_id).await {
            self.tree.create_tree(&task).await;
        }

        let ready = self.tree.ready_nodes(task_id).await?;
        let mut scheduled = 0usize;

        for step_id in ready {
            let Some(step) = task.step(&step_id) else {
                tracing::warn!(
                    task_id = %task_id,
                    step_id = %step_id,
                    "ready tree node has no matching step"
                );
                continue;
            };

            // Template resolution happens before dispatch.
            let mut resolved = step.clone();
            resolved.inputs = resolve_templates(&task, &step.inputs);
            let resolved = inject_system_context(&task, resolved);

            let dispatch = StepDispatch {
                task_id,
                step: resolved,
                user_id: task.user_id.clone(),
                model: None,
            };
            self.queue.send(dispatch).map_err(|_| {
                CoreError::DependencyUnavailable("step dispatch queue closed".to_string())
            })?;
            scheduled += 1;
        }

        tracing::debug!(task_id = %task_id, scheduled = scheduled, "scheduled ready nodes");
        Ok(scheduled)
    }
}

/// Spawn the queue consumer: a worker pool bounded by `max_workers` that
/// runs dispatched steps and re-enqueues transient retries.
pub fn spawn_workers(
    executor: Arc<StepExecutor>,
    mut receiver: mpsc::UnboundedReceiver<StepDispatch>,
    retry_queue: mpsc::UnboundedSender<StepDispatch>,
    max_workers: usize,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let semaphore = Arc::new(Semaphore::new(max_workers.max(1)));
        loop {
            let dispatch = tokio::select! {
                item = receiver.recv() => match item {
                    Some(dispatch) => dispatch,
                    None => break,
                },
                _ = cancel.cancelled() => break,
            };

            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                break;
            };
            let executor = Arc::clone(&executor);
            let retry_queue = retry_queue.clone();

            tokio::spawn(async move {
                let task_id = dispatch.task_id;
                let step_id = dispatch.step.id.clone();
                match executor.execute(dispatch).await {
                    Ok(result) => {
                        if result.status == StepExecStatus::Retrying {
                            if let Some(retry) = result.retry_dispatch {
                                let _ = retry_queue.send(retry);
                            }
                        }
                    }
                    Err(e) => {
                        tracing::error!(
                            task_id = %task_id,
                            step_id = %step_id,
                            error = %e,
                            "step execution worker failed"
                        );
                    }
                }
                drop(permit);
            });
        }
        tracing::info!("step dispatch worker pool stopped");
    })
}
