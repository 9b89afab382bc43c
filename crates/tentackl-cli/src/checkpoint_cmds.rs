//! Checkpoint approval commands.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Subcommand;
use uuid::Uuid;

use tentackl_core::TaskRuntime;

#[derive(Subcommand)]
pub enum CheckpointCommands {
    /// List pending checkpoints for a user (or one task)
    List {
        #[arg(long, default_value = "cli")]
        user: String,
        /// Restrict to one task
        #[arg(long)]
        task: Option<String>,
    },
    /// Approve a pending checkpoint
    Approve {
        task_id: String,
        step_id: String,
        #[arg(long, default_value = "cli")]
        user: String,
        #[arg(long)]
        feedback: Option<String>,
        /// Skip preference learning for this resolution
        #[arg(long)]
        no_learn: bool,
    },
    /// Reject a pending checkpoint
    Reject {
        task_id: String,
        step_id: String,
        #[arg(long, default_value = "cli")]
        user: String,
        #[arg(long)]
        reason: String,
        /// Skip preference learning for this resolution
        #[arg(long)]
        no_learn: bool,
    },
}

fn parse_task_id(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).with_context(|| format!("invalid task ID: {raw}"))
}

pub async fn run_checkpoint_command(
    command: CheckpointCommands,
    runtime: &Arc<TaskRuntime>,
) -> Result<()> {
    match command {
        CheckpointCommands::List { user, task } => {
            let checkpoints = match task {
                Some(task_id) => {
                    let id = parse_task_id(&task_id)?;
                    runtime.list_pending_checkpoints_for_task(id).await?
                }
                None => runtime.list_pending_checkpoints(&user).await?,
            };
            if checkpoints.is_empty() {
                println!("No pending checkpoints.");
                return Ok(());
            }
            for checkpoint in checkpoints {
                println!(
                    "{}  {}  [{}] {}",
                    checkpoint.task_id, checkpoint.step_id, checkpoint.kind, checkpoint.name
                );
                if !checkpoint.description.is_empty() {
                    println!("    {}", checkpoint.description);
                }
            }
            Ok(())
        }

        CheckpointCommands::Approve {
            task_id,
            step_id,
            user,
            feedback,
            no_learn,
        } => {
            let id = parse_task_id(&task_id)?;
            let checkpoint = runtime
                .approve_checkpoint(id, &step_id, &user, feedback.as_deref(), !no_learn)
                .await?;
            println!(
                "Checkpoint {} for step {} approved ({}).",
                checkpoint.name, step_id, checkpoint.decision
            );
            Ok(())
        }

        CheckpointCommands::Reject {
            task_id,
            step_id,
            user,
            reason,
            no_learn,
        } => {
            let id = parse_task_id(&task_id)?;
            runtime
                .reject_checkpoint(id, &step_id, &user, &reason, !no_learn)
                .await?;
            println!("Checkpoint for step {step_id} rejected.");
            Ok(())
        }
    }
}
