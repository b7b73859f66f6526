mod config;
mod db_cmds;
mod dlq_cmds;
mod task_cmds;
mod workflow_cmds;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use config::WardenConfig;

#[derive(Parser)]
#[command(name = "warden", about = "Compliance agent-orchestration operator console")]
struct Cli {
    /// Database URL (overrides WARDEN_DATABASE_URL env var)
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Write a warden config file (no database required)
    Init {
        /// PostgreSQL connection URL
        #[arg(long, default_value = "postgresql://localhost:5432/warden")]
        db_url: String,
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Initialize the warden database (creates it and applies migrations)
    DbInit,
    /// Submit a task from a TOML file
    Submit {
        /// Path to the task file
        file: String,
    },
    /// Expand and submit a workflow from a TOML file
    SubmitWorkflow {
        /// Path to the workflow file
        file: String,
    },
    /// Show a task's latest snapshot (omit task_id for queue totals)
    Status {
        /// Task ID
        task_id: Option<String>,
    },
    /// Cancel a task
    Cancel {
        /// Task ID
        task_id: String,
    },
    /// List queue entries due within a horizon
    Upcoming {
        /// Horizon in hours
        #[arg(long, default_value_t = 24)]
        hours: u64,
    },
    /// Dead-letter queue management
    Dlq {
        #[command(subcommand)]
        command: DlqCommands,
    },
    /// Prune terminal tasks and expired dead letters
    Prune,
}

#[derive(Subcommand)]
pub enum DlqCommands {
    /// List dead-lettered tasks
    List,
    /// Re-admit recent dead-lettered tasks with reset retry counters
    Requeue {
        /// Only requeue tasks created within this many hours
        #[arg(long, default_value_t = 24)]
        max_age_hours: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init { db_url, force } => db_cmds::init(&db_url, force),
        Commands::DbInit => {
            let config = WardenConfig::resolve(cli.database_url.as_deref())?;
            db_cmds::db_init(&config).await
        }
        Commands::Submit { file } => {
            let config = WardenConfig::resolve(cli.database_url.as_deref())?;
            task_cmds::submit(&config, &file).await
        }
        Commands::SubmitWorkflow { file } => {
            let config = WardenConfig::resolve(cli.database_url.as_deref())?;
            workflow_cmds::submit(&config, &file).await
        }
        Commands::Status { task_id } => {
            let config = WardenConfig::resolve(cli.database_url.as_deref())?;
            task_cmds::status(&config, task_id.as_deref()).await
        }
        Commands::Cancel { task_id } => {
            let config = WardenConfig::resolve(cli.database_url.as_deref())?;
            task_cmds::cancel(&config, &task_id).await
        }
        Commands::Upcoming { hours } => {
            let config = WardenConfig::resolve(cli.database_url.as_deref())?;
            task_cmds::upcoming(&config, hours).await
        }
        Commands::Dlq { command } => {
            let config = WardenConfig::resolve(cli.database_url.as_deref())?;
            match command {
                DlqCommands::List => dlq_cmds::list(&config).await,
                DlqCommands::Requeue { max_age_hours } => {
                    dlq_cmds::requeue(&config, max_age_hours).await
                }
            }
        }
        Commands::Prune => {
            let config = WardenConfig::resolve(cli.database_url.as_deref())?;
            dlq_cmds::prune(&config).await
        }
    }
}
