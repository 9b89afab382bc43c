//! Typed error surface of the core use-cases.

use tentackl_db::models::TaskStatus;
use thiserror::Error;

/// Errors surfaced from the core to its callers.
///
/// Observer decisions are never errors; they surface as cycle result tags.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Malformed goal, malformed step spec, or bad template syntax.
    #[error("validation error: {0}")]
    Validation(String),

    /// Missing task or step.
    #[error("not found: {0}")]
    NotFound(String),

    /// Ownership mismatch: the task's user is not the caller.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// The status machine rejected a transition.
    #[error("invalid transition from {current} to {requested}")]
    InvalidTransition {
        current: TaskStatus,
        requested: TaskStatus,
    },

    /// Planning or execution observed a cancellation flag.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// All planner retries were exhausted.
    #[error("planning failed: {0}")]
    PlanningFailed(String),

    /// A step group is blocked on an unresolved approval.
    #[error("checkpoint required for step {step_id} of task {task_id}")]
    CheckpointRequired { task_id: uuid::Uuid, step_id: String },

    /// Blocked state with no Observer recovery path.
    #[error("unrecoverable failure: {0}")]
    UnrecoverableFailure(String),

    /// A backing resource (store, scheduler queue) is unreachable.
    #[error("dependency unavailable: {0}")]
    DependencyUnavailable(String),

    /// Infrastructure failure with context attached.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type CoreResult<T> = Result<T, CoreError>;
