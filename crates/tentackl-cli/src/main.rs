mod adapters;
mod checkpoint_cmds;
mod config;
mod serve_cmd;
mod task_cmds;

use std::sync::Arc;

use clap::{Parser, Subcommand};

use tentackl_core::{RuntimeConfig, RuntimePorts, TaskRuntime};
use tentackl_db::pool;

use config::TentacklConfig;

#[derive(Parser)]
#[command(name = "tentackl", about = "Multi-tenant task orchestration service")]
struct Cli {
    /// Database URL (overrides TENTACKL_DATABASE_URL env var)
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Write a tentackl config file (no database required)
    Init {
        /// PostgreSQL connection URL
        #[arg(long, default_value = "postgresql://localhost:5432/tentackl")]
        db_url: String,
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Initialize the tentackl database (create + migrate)
    DbInit,
    /// Task management
    Task {
        #[command(subcommand)]
        command: task_cmds::TaskCommands,
    },
    /// Checkpoint approvals
    Checkpoint {
        #[command(subcommand)]
        command: checkpoint_cmds::CheckpointCommands,
    },
    /// Run the HTTP server
    Serve {
        /// Bind address (overrides config file)
        #[arg(long)]
        bind: Option<String>,
        /// Worker pool size for the step dispatch queue
        #[arg(long)]
        max_workers: Option<usize>,
    },
}

/// Execute the `tentackl init` command: write the config file.
fn cmd_init(db_url: &str, force: bool) -> anyhow::Result<()> {
    let path = config::config_path();

    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }

    let cfg = config::ConfigFile {
        database: config::DatabaseSection {
            url: db_url.to_string(),
        },
        server: config::ServerSection::default(),
    };
    config::save_config(&cfg)?;

    println!("Config written to {}", path.display());
    println!("  database.url = {db_url}");
    println!();
    println!("Next: run `tentackl db-init` to create and migrate the database.");
    Ok(())
}

/// Execute the `tentackl db-init` command: create database and run
/// migrations.
async fn cmd_db_init(cli_db_url: Option<&str>) -> anyhow::Result<()> {
    let resolved = TentacklConfig::resolve(cli_db_url)?;

    println!("Initializing tentackl database...");

    pool::ensure_database_exists(&resolved.db_config).await?;
    let db_pool = pool::create_pool(&resolved.db_config).await?;
    pool::run_migrations(&db_pool).await?;

    let counts = pool::table_counts(&db_pool).await?;
    println!("Database ready. Tables:");
    for (table, count) in &counts {
        println!("  {table}: {count} rows");
    }

    db_pool.close().await;
    println!("tentackl db-init complete.");
    Ok(())
}

/// Build a runtime wired with the local port adapters.
async fn build_runtime(
    cli_db_url: Option<&str>,
    max_workers: Option<usize>,
) -> anyhow::Result<(Arc<TaskRuntime>, sqlx::PgPool)> {
    let resolved = TentacklConfig::resolve(cli_db_url)?;
    let db_pool = pool::create_pool(&resolved.db_config).await?;

    let ports = RuntimePorts {
        intent_detector: Arc::new(adapters::PassiveIntentDetector),
        fast_path: Arc::new(adapters::DisabledFastPath),
        planner: Arc::new(adapters::UnconfiguredPlanner),
        plugin: Arc::new(adapters::LocalPluginExecutor),
        advisor: None,
        memory: None,
    };
    let runtime_config = RuntimeConfig {
        max_workers: max_workers.unwrap_or(resolved.server.max_workers),
        auto_start: true,
    };

    let runtime = TaskRuntime::new(db_pool.clone(), ports, runtime_config);
    Ok((runtime, db_pool))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init { db_url, force } => {
            cmd_init(&db_url, force)?;
        }
        Commands::DbInit => {
            cmd_db_init(cli.database_url.as_deref()).await?;
        }
        Commands::Task { command } => {
            let (runtime, db_pool) = build_runtime(cli.database_url.as_deref(), None).await?;
            let result = task_cmds::run_task_command(command, &runtime).await;
            runtime.shutdown().await;
            db_pool.close().await;
            result?;
        }
        Commands::Checkpoint { command } => {
            let (runtime, db_pool) = build_runtime(cli.database_url.as_deref(), None).await?;
            let result = checkpoint_cmds::run_checkpoint_command(command, &runtime).await;
            runtime.shutdown().await;
            db_pool.close().await;
            result?;
        }
        Commands::Serve { bind, max_workers } => {
            let resolved = TentacklConfig::resolve(cli.database_url.as_deref())?;
            let bind = bind.unwrap_or(resolved.server.bind.clone());
            let (runtime, db_pool) =
                build_runtime(cli.database_url.as_deref(), max_workers).await?;
            let result = serve_cmd::run_serve(runtime.clone(), &bind).await;
            runtime.shutdown().await;
            db_pool.close().await;
            result?;
        }
    }

    Ok(())
}
