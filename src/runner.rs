//! Single-consumer job runner
//!
//! One job runs at a time process-wide; additional work queues behind it.
//! Sync jobs are subprocess-isolated so an immediate cancel can terminate
//! them even when stuck in network I/O; other kinds run in-task and honor
//! the cooperative cancel token at checkpoint boundaries.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::db;
use crate::errors::{AppError, AppResult};
use crate::job_repo::{self, EventLevel, JobStatus};
use crate::tasks_refresh;
use crate::tasks_resummarize;
use crate::worker_probe;

/// Work item descriptions the runner knows how to dispatch
#[derive(Debug, Clone)]
pub enum JobSpec {
    /// Full mailbox sync, run as a separate process
    Sync,
    /// Re-run summarization for a day or explicit message ids
    ResummarizeDay {
        date_key: String,
        only_failed: bool,
        message_ids: Option<Vec<i64>>,
    },
    /// Regenerate daily overviews, gated by freshness unless forced
    RefreshOverviews {
        days: Option<Vec<String>>,
        force: bool,
    },
}

impl JobSpec {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Sync => "sync",
            Self::ResummarizeDay { .. } => "resummarize-day",
            Self::RefreshOverviews { .. } => "refresh-overviews",
        }
    }
}

#[derive(Default)]
struct RunnerState {
    active: HashMap<String, CancellationToken>,
    active_pids: HashMap<String, u32>,
    cancelled_queued: HashSet<String>,
    cancelled_procs: HashSet<String>,
}

/// FIFO runner with per-job cancel tokens and subprocess tracking
pub struct JobRunner {
    db_path: PathBuf,
    tx: mpsc::UnboundedSender<(String, JobSpec)>,
    state: Arc<Mutex<RunnerState>>,
}

impl JobRunner {
    /// Start the background consumer and return the shared handle
    pub fn start(db_path: PathBuf) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let state = Arc::new(Mutex::new(RunnerState::default()));
        let runner = Arc::new(Self {
            db_path: db_path.clone(),
            tx,
            state: state.clone(),
        });
        tokio::spawn(consume(db_path, state, rx));
        runner
    }

    /// Create the job row and queue the work item
    pub fn enqueue(&self, spec: JobSpec) -> AppResult<String> {
        let job_id = Uuid::new_v4().simple().to_string();
        let conn = db::open(&self.db_path)?;
        job_repo::create_job(&conn, &job_id, spec.kind())?;
        drop(conn);
        self.tx
            .send((job_id.clone(), spec))
            .map_err(|_| AppError::Internal("job runner is not running".to_owned()))?;
        Ok(job_id)
    }

    /// Signal cancellation for a job in whatever state it is in
    ///
    /// Running subprocesses are terminated; in-task jobs get their token
    /// cancelled; queued jobs are remembered and skipped when dequeued.
    /// The DB transition is the API layer's responsibility.
    pub fn cancel(&self, job_id: &str) -> bool {
        {
            let mut state = self.state.lock().expect("runner state poisoned");
            if let Some(&pid) = state.active_pids.get(job_id) {
                state.cancelled_procs.insert(job_id.to_owned());
                if let Some(token) = state.active.get(job_id) {
                    token.cancel();
                }
                worker_probe::kill_pid(pid);
                return true;
            }
            if let Some(token) = state.active.get(job_id) {
                token.cancel();
                return true;
            }
            state.cancelled_queued.insert(job_id.to_owned());
        }
        // Fallback: the runner may have lost track of the subprocess.
        worker_probe::kill_worker(job_id);
        true
    }
}

async fn consume(
    db_path: PathBuf,
    state: Arc<Mutex<RunnerState>>,
    mut rx: mpsc::UnboundedReceiver<(String, JobSpec)>,
) {
    while let Some((job_id, spec)) = rx.recv().await {
        let token = CancellationToken::new();

        let skip = {
            let mut s = state.lock().expect("runner state poisoned");
            if s.cancelled_queued.remove(&job_id) {
                true
            } else {
                s.active.insert(job_id.clone(), token.clone());
                false
            }
        };
        if skip {
            if let Err(e) = with_conn(&db_path, |conn| {
                job_repo::set_job_status(conn, &job_id, JobStatus::Cancelled, "")?;
                job_repo::add_event(conn, &job_id, EventLevel::Info, "cancelled before start")
            }) {
                error!(job_id = %job_id, error = %e, "failed to finalize pre-cancelled job");
            }
            continue;
        }

        if let Err(e) = with_conn(&db_path, |conn| {
            job_repo::set_job_status(conn, &job_id, JobStatus::Running, "")?;
            job_repo::add_event(
                conn,
                &job_id,
                EventLevel::Info,
                &format!("start {}", spec.kind()),
            )
        }) {
            error!(job_id = %job_id, error = %e, "failed to mark job running");
        }

        info!(job_id = %job_id, kind = spec.kind(), "job dispatched");
        let kind = spec.kind();
        let result = match spec {
            JobSpec::Sync => run_sync_worker(&db_path, &job_id, &state).await,
            JobSpec::ResummarizeDay {
                date_key,
                only_failed,
                message_ids,
            } => {
                tasks_resummarize::run(
                    &db_path,
                    &job_id,
                    &token,
                    &date_key,
                    only_failed,
                    message_ids,
                )
                .await
            }
            JobSpec::RefreshOverviews { days, force } => {
                tasks_refresh::run(&db_path, &job_id, &token, days, force).await
            }
        };

        let cancelled_proc = {
            let s = state.lock().expect("runner state poisoned");
            s.cancelled_procs.contains(&job_id)
        };

        let finalize = with_conn(&db_path, |conn| {
            match &result {
                Err(e) => {
                    job_repo::add_event(conn, &job_id, EventLevel::Error, &e.to_string())?;
                    let row = job_repo::get_job(conn, &job_id)?;
                    let already_cancelled = token.is_cancelled()
                        || cancelled_proc
                        || row.is_some_and(|r| r.status == JobStatus::Cancelled);
                    if already_cancelled {
                        // Termination looks like an error; keep the cancel.
                        job_repo::finalize_cancelled(conn, &job_id)?;
                    } else {
                        job_repo::set_job_status(conn, &job_id, JobStatus::Failed, &e.to_string())?;
                    }
                }
                Ok(()) => {
                    if token.is_cancelled() || cancelled_proc {
                        job_repo::finalize_cancelled(conn, &job_id)?;
                        let row = job_repo::get_job(conn, &job_id)?;
                        if row.is_some_and(|r| r.status == JobStatus::Running) {
                            job_repo::set_job_status(conn, &job_id, JobStatus::Cancelled, "")?;
                        }
                    } else if kind != "sync" {
                        // The sync worker sets its own terminal state.
                        job_repo::set_job_status(conn, &job_id, JobStatus::Succeeded, "")?;
                    }
                }
            }
            Ok(())
        });
        if let Err(e) = finalize {
            error!(job_id = %job_id, error = %e, "failed to finalize job");
        }

        let mut s = state.lock().expect("runner state poisoned");
        s.active.remove(&job_id);
        s.active_pids.remove(&job_id);
        s.cancelled_procs.remove(&job_id);
    }
}

/// Run the sync kind as `mail-digest sync-worker --job-id <id>`
///
/// The child owns the whole sync; the parent only records the pid for
/// cancellation and waits for exit.
async fn run_sync_worker(
    db_path: &Path,
    job_id: &str,
    state: &Arc<Mutex<RunnerState>>,
) -> AppResult<()> {
    let exe = std::env::current_exe()
        .map_err(|e| AppError::Internal(format!("cannot locate own binary: {e}")))?;
    let mut child = Command::new(exe)
        .arg("sync-worker")
        .arg("--job-id")
        .arg(job_id)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| AppError::Internal(format!("failed to spawn sync worker: {e}")))?;

    if let Some(pid) = child.id() {
        let mut s = state.lock().expect("runner state poisoned");
        s.active_pids.insert(job_id.to_owned(), pid);
    }

    let status = child
        .wait()
        .await
        .map_err(|e| AppError::Internal(format!("sync worker wait failed: {e}")))?;

    let cancelled = {
        let s = state.lock().expect("runner state poisoned");
        s.cancelled_procs.contains(job_id)
    };
    if cancelled {
        // Finalize only after the worker has actually stopped.
        with_conn(db_path, |conn| {
            job_repo::finalize_cancelled(conn, job_id)?;
            Ok(())
        })?;
        return Ok(());
    }
    if !status.success() {
        warn!(job_id = %job_id, status = %status, "sync worker exited abnormally");
        return Err(AppError::Internal(format!("sync worker failed: {status}")));
    }
    Ok(())
}

fn with_conn<T>(
    db_path: &Path,
    f: impl FnOnce(&rusqlite::Connection) -> AppResult<T>,
) -> AppResult<T> {
    let conn = db::open(db_path)?;
    f(&conn)
}

#[cfg(test)]
mod tests {
    use super::JobSpec;

    #[test]
    fn kinds_match_the_job_table_vocabulary() {
        assert_eq!(JobSpec::Sync.kind(), "sync");
        assert_eq!(
            JobSpec::ResummarizeDay {
                date_key: "2025-01-10".to_owned(),
                only_failed: true,
                message_ids: None,
            }
            .kind(),
            "resummarize-day"
        );
        assert_eq!(
            JobSpec::RefreshOverviews {
                days: None,
                force: false,
            }
            .kind(),
            "refresh-overviews"
        );
    }
}
