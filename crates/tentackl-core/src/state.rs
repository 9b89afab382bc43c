//! Task status state machine.
//!
//! Validates and executes status transitions with optimistic locking in the
//! primary store, then writes through to the cache.

use sqlx::PgPool;
use uuid::Uuid;

use tentackl_db::models::TaskStatus;
use tentackl_db::queries::tasks as task_db;

use crate::cache::TaskCache;
use crate::error::{CoreError, CoreResult};

/// The task state machine.
///
/// Enforces the valid transition graph:
///
/// ```text
/// planning   -> ready | completed (fast path) | failed | cancelled
/// ready      -> executing | failed | cancelled
/// executing  -> checkpoint | paused | completed | failed | cancelled
/// checkpoint -> executing | ready | failed | cancelled | superseded
/// paused     -> executing | cancelled
/// ```
///
/// `completed`, `failed`, `cancelled` and `superseded` are terminal.
pub struct TaskStateMachine;

impl TaskStateMachine {
    /// Check whether a transition from `from` to `to` is a valid edge in the
    /// state graph.
    pub fn is_valid_transition(from: TaskStatus, to: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (from, to),
            (Planning, Ready)
                | (Planning, Completed)
                | (Planning, Failed)
                | (Planning, Cancelled)
                | (Ready, Executing)
                | (Ready, Failed)
                | (Ready, Cancelled)
                | (Executing, Checkpoint)
                | (Executing, Paused)
                | (Executing, Completed)
                | (Executing, Failed)
                | (Executing, Cancelled)
                | (Checkpoint, Executing)
                | (Checkpoint, Ready)
                | (Checkpoint, Failed)
                | (Checkpoint, Cancelled)
                | (Checkpoint, Superseded)
                | (Paused, Executing)
                | (Paused, Cancelled)
        )
    }

    /// Execute a status transition against the primary store and write
    /// through to the cache.
    ///
    /// The caller supplies the expected current status; the UPDATE's WHERE
    /// clause enforces it, so a concurrent writer loses cleanly.
    pub async fn transition(
        pool: &PgPool,
        cache: &TaskCache,
        task_id: Uuid,
        from: TaskStatus,
        to: TaskStatus,
    ) -> CoreResult<()> {
        if !Self::is_valid_transition(from, to) {
            return Err(CoreError::InvalidTransition {
                current: from,
                requested: to,
            });
        }

        let rows = task_db::transition_task_status(pool, task_id, from, to).await?;
        if rows == 0 {
            // Either the task does not exist or the status did not match.
            let task = task_db::get_task(pool, task_id).await?;
            return match task {
                None => Err(CoreError::NotFound(format!("task {task_id}"))),
                Some(t) => Err(CoreError::InvalidTransition {
                    current: t.status,
                    requested: to,
                }),
            };
        }

        cache.set_task_status(task_id, to).await;
        tracing::debug!(task_id = %task_id, from = %from, to = %to, "task transitioned");
        Ok(())
    }

    /// Transition from the task's current status, whatever it is, as long as
    /// the edge is legal. Loads the row first; races retry once.
    pub async fn transition_to(
        pool: &PgPool,
        cache: &TaskCache,
        task_id: Uuid,
        to: TaskStatus,
    ) -> CoreResult<()> {
        for _ in 0..2 {
            let task = task_db::get_task(pool, task_id)
                .await?
                .ok_or_else(|| CoreError::NotFound(format!("task {task_id}")))?;

            if task.status == to {
                cache.set_task_status(task_id, to).await;
                return Ok(());
            }
            if !Self::is_valid_transition(task.status, to) {
                return Err(CoreError::InvalidTransition {
                    current: task.status,
                    requested: to,
                });
            }
            let rows = task_db::transition_task_status(pool, task_id, task.status, to).await?;
            if rows > 0 {
                cache.set_task_status(task_id, to).await;
                return Ok(());
            }
            // Lost the race; reload and retry once.
        }
        Err(CoreError::DependencyUnavailable(format!(
            "could not transition task {task_id} to {to}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use TaskStatus::*;

    #[test]
    fn planning_edges() {
        assert!(TaskStateMachine::is_valid_transition(Planning, Ready));
        assert!(TaskStateMachine::is_valid_transition(Planning, Completed));
        assert!(TaskStateMachine::is_valid_transition(Planning, Failed));
        assert!(TaskStateMachine::is_valid_transition(Planning, Cancelled));
        assert!(!TaskStateMachine::is_valid_transition(Planning, Executing));
    }

    #[test]
    fn checkpoint_edges() {
        assert!(TaskStateMachine::is_valid_transition(Checkpoint, Executing));
        assert!(TaskStateMachine::is_valid_transition(Checkpoint, Ready));
        assert!(TaskStateMachine::is_valid_transition(Checkpoint, Superseded));
        assert!(!TaskStateMachine::is_valid_transition(Checkpoint, Completed));
    }

    #[test]
    fn terminal_states_have_no_exits() {
        for terminal in [Completed, Failed, Cancelled, Superseded] {
            for to in [
                Planning, Ready, Executing, Checkpoint, Paused, Completed, Failed, Cancelled,
                Superseded,
            ] {
                assert!(
                    !TaskStateMachine::is_valid_transition(terminal, to),
                    "{terminal} -> {to} should be invalid"
                );
            }
        }
    }

    #[test]
    fn paused_returns_to_executing() {
        assert!(TaskStateMachine::is_valid_transition(Executing, Paused));
        assert!(TaskStateMachine::is_valid_transition(Paused, Executing));
        assert!(!TaskStateMachine::is_valid_transition(Paused, Completed));
    }
}
