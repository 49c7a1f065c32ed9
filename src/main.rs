//! # Shelf CLI (`shelf`)
//!
//! The `shelf` binary runs the chat HTTP service, drives the reindex
//! pipeline, and exposes the same admin operations the internal endpoints
//! do.
//!
//! ## Usage
//!
//! ```bash
//! shelf --config ./config/shelf.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `shelf init` | Create the SQLite database and apply the schema |
//! | `shelf serve` | Start the HTTP service |
//! | `shelf reindex create` | Queue a reindex job |
//! | `shelf reindex run` | Run the next queued job to completion |
//! | `shelf reindex worker` | Poll for jobs until Ctrl-C |
//! | `shelf reindex status [id]` | Show one job, or the most recent ones |
//! | `shelf reindex pause\|resume\|retry <id>` | Admin transitions |
//! | `shelf retention [--dry-run]` | Purge expired sessions, events and audits |
//! | `shelf ask "<message>"` | Run one chat turn and print the response JSON |
//!
//! Logging goes to stderr and is filtered by `RUST_LOG` (default `info`).

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use shelf_core::metrics::Metrics;
use shelf_core::models::ChatRequest;
use shelf_core::reindex::{AdminAction, ReindexParams};
use shelf::{chat, config, migrate, reindex, server};
use tracing_subscriber::EnvFilter;

/// Shelf: bibliographic search and chat service.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/shelf.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "shelf",
    about = "Shelf: canonical catalog reindexing and grounded book-store chat",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/shelf.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Idempotent.
    Init,

    /// Start the HTTP service on `[server].bind`.
    Serve,

    /// Reindex job management.
    Reindex {
        #[command(subcommand)]
        action: ReindexAction,
    },

    /// Purge rows past their retention window.
    Retention {
        /// Count what would be deleted without deleting it.
        #[arg(long)]
        dry_run: bool,
    },

    /// Run a single chat turn and print the response.
    Ask {
        message: String,

        #[arg(long)]
        session: Option<String>,

        #[arg(long)]
        user: Option<String>,
    },
}

#[derive(Subcommand)]
enum ReindexAction {
    /// Queue a new job for a logical index.
    Create {
        #[arg(long)]
        logical_name: Option<String>,

        #[arg(long)]
        batch_size: Option<usize>,

        /// Delete older physical indices of the same prefix after the swap.
        #[arg(long)]
        delete_existing: bool,
    },

    /// Claim and run the next queued job.
    Run,

    /// Poll for jobs until interrupted.
    Worker,

    Status {
        job_id: Option<String>,
    },

    Pause {
        job_id: String,
    },

    Resume {
        job_id: String,
    },

    Retry {
        job_id: String,
    },
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run_reindex(cfg: &config::Config, action: ReindexAction) -> anyhow::Result<()> {
    let runner = reindex::runner_from_config(cfg, Arc::new(Metrics::new())).await?;
    let jobs = runner.jobs();
    match action {
        ReindexAction::Create {
            logical_name,
            batch_size,
            delete_existing,
        } => {
            let logical = logical_name.unwrap_or_else(|| cfg.reindex.logical_name.clone());
            let params = ReindexParams {
                logical_name: Some(logical.clone()),
                batch_size,
                delete_existing: delete_existing.then_some(true),
                ..ReindexParams::default()
            };
            let job = jobs.create(&logical, params).await?;
            print_json(&job)?;
        }
        ReindexAction::Run => match runner.run_next().await? {
            Some(job) => print_json(&job)?,
            None => println!("No queued reindex jobs."),
        },
        ReindexAction::Worker => {
            runner
                .run_worker(async {
                    let _ = tokio::signal::ctrl_c().await;
                })
                .await?;
        }
        ReindexAction::Status { job_id: Some(id) } => match jobs.get(&id).await? {
            Some(job) => print_json(&job)?,
            None => anyhow::bail!("reindex job {} not found", id),
        },
        ReindexAction::Status { job_id: None } => {
            print_json(&jobs.list(20).await?)?;
        }
        ReindexAction::Pause { job_id } => print_json(&jobs.admin(&job_id, AdminAction::Pause).await?)?,
        ReindexAction::Resume { job_id } => print_json(&jobs.admin(&job_id, AdminAction::Resume).await?)?,
        ReindexAction::Retry { job_id } => print_json(&jobs.admin(&job_id, AdminAction::Retry).await?)?,
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
        Commands::Reindex { action } => {
            run_reindex(&cfg, action).await?;
        }
        Commands::Retention { dry_run } => {
            let state = server::AppState::build(&cfg).await?;
            print_json(&state.chat().run_retention(dry_run).await?)?;
        }
        Commands::Ask {
            message,
            session,
            user,
        } => {
            let state = server::AppState::build(&cfg).await?;
            let mut request = ChatRequest::new(message);
            request.session_id = session;
            request.client.user_id = user;
            let ids = chat::TurnIds::new(None, None);
            print_json(&state.chat().handle_turn(request, &ids).await)?;
        }
    }

    Ok(())
}
