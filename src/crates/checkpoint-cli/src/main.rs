//! # ckpt
//!
//! Inspect and maintain a SQLite checkpoint store.

use anyhow::{Context, Result};
use checkpoint_cli::commands;
use checkpoint_cli::settings::{self, Overrides};
use checkpoint_store::{CheckpointEngine, CheckpointId, SqliteStore, ThreadId, ThreadStatus};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "ckpt")]
#[command(about = "Inspect and maintain checkpoint stores", long_about = None)]
#[command(version)]
struct Cli {
    /// TOML settings file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Database URL, e.g. sqlite://checkpoints.db
    #[arg(long, global = true)]
    database_url: Option<String>,

    /// Do not apply pending schema migrations on connect
    #[arg(long, global = true)]
    no_auto_migrate: bool,

    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply the built-in schema migrations
    Migrate,

    /// Show the schema version, migration history and thread counts
    Status,

    /// List threads
    Threads {
        /// Only threads with this status: active, completed, failed
        #[arg(short, long)]
        status: Option<String>,
    },

    /// Show one checkpoint and the blobs it references
    Show {
        /// Checkpoint ID
        checkpoint: String,
    },

    /// Canonical checkpoint chain of a thread, root first
    Chain {
        /// Thread ID
        thread: String,
    },

    /// Pending writes of checkpoints that were never committed
    Pending {
        /// Thread ID
        thread: String,
    },

    /// Channel values at the latest checkpoint of a thread
    State {
        /// Thread ID
        thread: String,
    },

    /// Complete commits interrupted before their writes were purged
    Recover,

    /// Delete a thread with its checkpoints, blobs and pending writes
    DeleteThread {
        /// Thread ID
        thread: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let config = settings::resolve(
        cli.config.as_deref(),
        Overrides {
            database_url: cli.database_url,
            no_auto_migrate: cli.no_auto_migrate,
        },
    )?;
    tracing::debug!(url = %config.database_url, "Settings resolved");

    let store = SqliteStore::connect(&config)
        .await
        .with_context(|| format!("Failed to open {}", config.database_url))?;
    let engine = CheckpointEngine::with_config(store, &config);

    let output = match cli.command {
        Commands::Migrate => commands::migrate(&engine).await,
        Commands::Status => commands::status(&engine).await,
        Commands::Threads { status } => {
            let status = status
                .map(|s| s.parse::<ThreadStatus>())
                .transpose()
                .context("Unknown thread status")?;
            commands::threads(&engine, status).await
        }
        Commands::Show { checkpoint } => {
            let checkpoint_id: CheckpointId = checkpoint
                .parse()
                .with_context(|| format!("Malformed checkpoint ID {checkpoint}"))?;
            commands::show(&engine, &checkpoint_id).await
        }
        Commands::Chain { thread } => commands::chain(&engine, &ThreadId::from(thread)).await,
        Commands::Pending { thread } => commands::pending(&engine, &ThreadId::from(thread)).await,
        Commands::State { thread } => commands::state(&engine, &ThreadId::from(thread)).await,
        Commands::Recover => commands::recover(&engine).await,
        Commands::DeleteThread { thread } => {
            commands::delete_thread(&engine, &ThreadId::from(thread)).await
        }
    };

    let rendered = output.and_then(|value| Ok(serde_json::to_string_pretty(&value)?));
    engine.store().close().await;
    println!("{}", rendered?);
    Ok(())
}
