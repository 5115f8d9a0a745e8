//! mail-digest: personal IMAP mail archiver and summarizer
//!
//! Pulls messages from a remote IMAP mailbox, preserves each one as a
//! self-contained on-disk artifact, derives a structured summary through a
//! pluggable LLM backend, and publishes cross-linked Markdown notes into a
//! plain-text vault.
//!
//! # Architecture
//!
//! - [`main`]: CLI entry point (`serve`, `sync`, hidden `sync-worker`)
//! - [`db`] / [`mail_repo`] / [`job_repo`] / [`settings`]: SQLite index
//! - [`imap`]: TLS IMAP session with timeout-bounded operations
//! - [`mime`] / [`html`] / [`net`] / [`archive`]: per-message archival
//! - [`runner`] / [`worker_probe`]: single-consumer job queue with
//!   subprocess-isolated sync and cancellation
//! - [`tasks_sync`] / [`tasks_resummarize`] / [`tasks_refresh`]: job bodies
//! - [`provider`] / [`summarize`] / [`jsonish`]: LLM orchestration
//! - [`export`]: Markdown vault notes
//! - [`server`]: HTTP job API with SSE progress streaming

mod archive;
mod atomic_io;
mod creds;
mod db;
mod errors;
mod export;
mod html;
mod imap;
mod job_repo;
mod jsonish;
mod mail_repo;
mod mime;
mod models;
mod net;
mod paths;
mod provider;
mod runner;
mod server;
mod settings;
mod summarize;
mod tasks_refresh;
mod tasks_resummarize;
mod tasks_sync;
mod worker_probe;

use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing_subscriber::EnvFilter;

use crate::errors::AppResult;
use crate::job_repo::{EventLevel, JobStatus};
use crate::runner::JobRunner;
use crate::server::{AppState, ServeOptions};

#[derive(Parser)]
#[command(name = "mail-digest", version, about = "IMAP mail archiver and summarizer")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the local HTTP server
    Serve {
        /// Port to listen on; 0 picks a free port
        #[arg(long, default_value_t = 0)]
        port: u16,
        /// Do not open the browser after binding
        #[arg(long)]
        no_browser: bool,
    },
    /// Enqueue a sync job and print its id
    Sync,
    /// Subprocess entry point for the sync job (spawned by the runner)
    #[command(hide = true)]
    SyncWorker {
        #[arg(long)]
        job_id: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Command::Serve { port, no_browser } => run_serve(port, !no_browser).await,
        Command::Sync => run_sync_once().await,
        Command::SyncWorker { job_id } => run_sync_worker(&job_id).await,
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "fatal");
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run_serve(port: u16, open_browser: bool) -> AppResult<ExitCode> {
    let data_root = paths::app_data_dir()?;
    let db_path = paths::db_path(&data_root);
    db::init(&db_path)?;
    {
        // Background jobs are never resumed across restarts.
        let conn = db::open(&db_path)?;
        db::recover_stale_jobs(&conn)?;
    }

    let runner = JobRunner::start(db_path.clone());
    let state = Arc::new(AppState { db_path, runner });
    server::serve(state, ServeOptions { port, open_browser }).await?;
    Ok(ExitCode::SUCCESS)
}

/// `mail-digest sync`: create the job row, hand it to a detached worker
///
/// The command returns immediately; the worker process owns the run and
/// records its terminal state in the index.
async fn run_sync_once() -> AppResult<ExitCode> {
    let data_root = paths::app_data_dir()?;
    let db_path = paths::db_path(&data_root);
    db::init(&db_path)?;

    let job_id = uuid::Uuid::new_v4().simple().to_string();
    {
        let conn = db::open(&db_path)?;
        job_repo::create_job(&conn, &job_id, "sync")?;
    }

    let exe = std::env::current_exe()
        .map_err(|e| errors::AppError::Internal(format!("cannot locate own binary: {e}")))?;
    tokio::process::Command::new(exe)
        .arg("sync-worker")
        .arg("--job-id")
        .arg(&job_id)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn()
        .map_err(|e| errors::AppError::Internal(format!("failed to spawn sync worker: {e}")))?;

    println!("{job_id}");
    Ok(ExitCode::SUCCESS)
}

/// Subprocess body for the sync kind
///
/// Cancellation is terminative: the parent kills this process outright, so
/// the token here never fires. Terminal states are only written when the
/// row has not already been finalized as cancelled.
async fn run_sync_worker(job_id: &str) -> AppResult<ExitCode> {
    let data_root = paths::app_data_dir()?;
    let db_path = paths::db_path(&data_root);
    db::init(&db_path)?;

    {
        let conn = db::open(&db_path)?;
        job_repo::set_job_status(&conn, job_id, JobStatus::Running, "")?;
        job_repo::add_event(&conn, job_id, EventLevel::Info, "sync worker started")?;
    }

    let cancel = CancellationToken::new();
    match tasks_sync::run(&data_root, job_id, &cancel).await {
        Ok(()) => {
            let conn = db::open(&db_path)?;
            if let Some(job) = job_repo::get_job(&conn, job_id)?
                && job.status != JobStatus::Cancelled
            {
                job_repo::set_job_status(&conn, job_id, JobStatus::Succeeded, "")?;
            }
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            let conn = db::open(&db_path)?;
            job_repo::add_event(&conn, job_id, EventLevel::Error, &e.to_string())?;
            if let Some(job) = job_repo::get_job(&conn, job_id)?
                && job.status != JobStatus::Cancelled
            {
                job_repo::set_job_status(&conn, job_id, JobStatus::Failed, &e.to_string())?;
            }
            Ok(ExitCode::FAILURE)
        }
    }
}
