//! Task management commands.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Subcommand;
use uuid::Uuid;

use tentackl_core::TaskRuntime;
use tentackl_core::ports::StepDraft;
use tentackl_db::models::{Task, TaskStatus};

#[derive(Subcommand)]
pub enum TaskCommands {
    /// Create a task from a goal (background planning) or a steps file
    Create {
        /// The natural-language goal
        goal: String,
        /// Owning user id
        #[arg(long, default_value = "cli")]
        user: String,
        /// Owning organization id
        #[arg(long)]
        org: Option<String>,
        /// Path to a JSON file with explicit steps (skips LLM planning)
        #[arg(long)]
        steps_file: Option<String>,
        /// Constraints JSON
        #[arg(long)]
        constraints: Option<String>,
        /// Metadata JSON
        #[arg(long)]
        metadata: Option<String>,
    },
    /// List tasks for a user
    List {
        #[arg(long, default_value = "cli")]
        user: String,
        /// Filter by status (planning, ready, executing, ...)
        #[arg(long)]
        status: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: i64,
    },
    /// Show a task with its steps and findings
    Show {
        task_id: String,
    },
    /// Start a task asynchronously
    Start {
        task_id: String,
        #[arg(long, default_value = "cli")]
        user: String,
    },
    /// Execute a task to checkpoint or completion
    Execute {
        task_id: String,
        #[arg(long, default_value = "cli")]
        user: String,
        /// Auto-approve checkpoints along the way
        #[arg(long)]
        run_to_completion: bool,
    },
    /// Pause an executing task
    Pause {
        task_id: String,
        #[arg(long, default_value = "cli")]
        user: String,
    },
    /// Cancel a task
    Cancel {
        task_id: String,
        #[arg(long, default_value = "cli")]
        user: String,
    },
}

fn parse_task_id(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).with_context(|| format!("invalid task ID: {raw}"))
}

fn parse_json_arg(raw: Option<&str>, what: &str) -> Result<Option<serde_json::Value>> {
    raw.map(|s| serde_json::from_str(s).with_context(|| format!("invalid {what} JSON")))
        .transpose()
}

pub async fn run_task_command(command: TaskCommands, runtime: &Arc<TaskRuntime>) -> Result<()> {
    match command {
        TaskCommands::Create {
            goal,
            user,
            org,
            steps_file,
            constraints,
            metadata,
        } => {
            let constraints = parse_json_arg(constraints.as_deref(), "constraints")?;
            let metadata = parse_json_arg(metadata.as_deref(), "metadata")?;

            let task = match steps_file {
                Some(path) => {
                    let contents = std::fs::read_to_string(&path)
                        .with_context(|| format!("failed to read steps file {path}"))?;
                    let steps: Vec<StepDraft> = serde_json::from_str(&contents)
                        .with_context(|| format!("invalid steps JSON in {path}"))?;
                    runtime
                        .create_task_with_steps(
                            &user,
                            org.as_deref(),
                            &goal,
                            steps,
                            constraints,
                            metadata,
                        )
                        .await?
                }
                None => {
                    runtime
                        .create_task(&user, org.as_deref(), &goal, constraints, metadata, false)
                        .await?
                }
            };

            println!("Task created: {}", task.id);
            println!("  status: {}", task.status);
            println!("  goal:   {}", task.goal);
            Ok(())
        }

        TaskCommands::List {
            user,
            status,
            limit,
        } => {
            let status = status
                .as_deref()
                .map(str::parse::<TaskStatus>)
                .transpose()
                .map_err(|e| anyhow::anyhow!("{e}"))?;
            let tasks = runtime.list_tasks(&user, status, limit).await?;
            if tasks.is_empty() {
                println!("No tasks.");
                return Ok(());
            }
            for task in tasks {
                println!("{}  {:<11}  v{}  {}", task.id, task.status, task.version, task.goal);
            }
            Ok(())
        }

        TaskCommands::Show { task_id } => {
            let id = parse_task_id(&task_id)?;
            let task = runtime.get_task(id).await?;
            print_task(&task);

            let findings = runtime.list_findings(id).await?;
            if !findings.is_empty() {
                println!("Findings:");
                for finding in findings {
                    println!("  [{}] {} {}", finding.step_id, finding.finding_type, finding.content);
                }
            }
            Ok(())
        }

        TaskCommands::Start { task_id, user } => {
            let id = parse_task_id(&task_id)?;
            let scheduled = runtime.start_task(id, &user).await?;
            println!("Task {task_id} started; {scheduled} step(s) scheduled.");
            Ok(())
        }

        TaskCommands::Execute {
            task_id,
            user,
            run_to_completion,
        } => {
            let id = parse_task_id(&task_id)?;
            let result = runtime.execute_task(id, &user, run_to_completion).await?;
            println!(
                "Task {}: {} ({}/{} steps completed)",
                result.task_id, result.status, result.steps_completed, result.steps_total
            );
            if let Some(checkpoint) = result.checkpoint {
                println!("  awaiting approval: {checkpoint}");
            }
            if let Some(error) = result.error {
                println!("  error: {error}");
            }
            Ok(())
        }

        TaskCommands::Pause { task_id, user } => {
            let id = parse_task_id(&task_id)?;
            let task = runtime.pause_task(id, &user).await?;
            println!("Task {} paused.", task.id);
            Ok(())
        }

        TaskCommands::Cancel { task_id, user } => {
            let id = parse_task_id(&task_id)?;
            let task = runtime.cancel_task(id, &user).await?;
            println!("Task {} cancelled.", task.id);
            Ok(())
        }
    }
}

fn print_task(task: &Task) {
    println!("Task {}", task.id);
    println!("  goal:    {}", task.goal);
    println!("  status:  {}", task.status);
    println!("  user:    {}", task.user_id);
    if let Some(org) = &task.organization_id {
        println!("  org:     {org}");
    }
    println!("  version: {}", task.version);
    if let Some(superseded_by) = task.superseded_by {
        println!("  superseded by: {superseded_by}");
    }
    if !task.steps.is_empty() {
        println!("Steps:");
        for step in &task.steps {
            let deps = if step.dependencies.is_empty() {
                String::new()
            } else {
                format!("  deps: {}", step.dependencies.join(", "))
            };
            let gate = if step.checkpoint_required {
                "  [checkpoint]"
            } else {
                ""
            };
            println!(
                "  {:<10} {:<11} {:<16} {}{}{}",
                step.id, step.status, step.agent_type, step.name, deps, gate
            );
        }
    }
}
