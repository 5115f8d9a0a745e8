//! Jobs and job-event repository
//!
//! Jobs drive the single-consumer runner; events are append-only and tailed
//! by id watermark from the SSE endpoint.

use chrono::{SecondsFormat, Utc};
use rusqlite::Connection;

use crate::errors::{AppError, AppResult};

/// Job lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Queued,
    Running,
    CancelRequested,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::CancelRequested => "cancel_requested",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> AppResult<Self> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "cancel_requested" => Ok(Self::CancelRequested),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(AppError::Internal(format!("unknown job status: {other}"))),
        }
    }

    /// Terminal states close the event stream and make cancel a no-op
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

/// Structured event severity / kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventLevel {
    Info,
    Warn,
    Error,
    Detail,
    MessageUpdated,
}

impl EventLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
            Self::Detail => "detail",
            Self::MessageUpdated => "message_updated",
        }
    }
}

/// One row of the `jobs` table
#[derive(Debug, Clone)]
pub struct JobRow {
    pub id: String,
    pub kind: String,
    pub status: JobStatus,
    pub progress_current: f64,
    pub progress_total: f64,
    pub message: String,
    pub created_at: String,
    pub updated_at: String,
}

/// One row of the `job_events` table
#[derive(Debug, Clone)]
pub struct JobEventRow {
    pub id: i64,
    pub ts: String,
    pub level: String,
    pub text: String,
}

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Create a new job in `queued` state
pub fn create_job(conn: &Connection, job_id: &str, kind: &str) -> AppResult<()> {
    let ts = now();
    conn.execute(
        "INSERT INTO jobs(id, kind, status, progress_current, progress_total, message, created_at, updated_at) \
         VALUES (?1, ?2, 'queued', 0, 0, '', ?3, ?3)",
        [job_id, kind, ts.as_str()],
    )?;
    Ok(())
}

/// Newest non-terminal job of a given kind, if any
pub fn find_active_job(conn: &Connection, kind: &str) -> AppResult<Option<JobRow>> {
    let row = conn
        .query_row(
            "SELECT id, kind, status, progress_current, progress_total, message, created_at, updated_at \
             FROM jobs WHERE kind = ?1 AND status IN ('queued','running','cancel_requested') \
             ORDER BY updated_at DESC LIMIT 1",
            [kind],
            map_job_row,
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(other),
        })?;
    row.map(finish_job_row).transpose()
}

/// Set job status and terminal message
pub fn set_job_status(
    conn: &Connection,
    job_id: &str,
    status: JobStatus,
    message: &str,
) -> AppResult<()> {
    conn.execute(
        "UPDATE jobs SET status = ?1, message = ?2, updated_at = ?3 WHERE id = ?4",
        [status.as_str(), message, now().as_str(), job_id],
    )?;
    Ok(())
}

/// Update progress counters and the user-visible progress line
pub fn update_progress(
    conn: &Connection,
    job_id: &str,
    current: f64,
    total: f64,
    message: &str,
) -> AppResult<()> {
    conn.execute(
        "UPDATE jobs SET progress_current = ?1, progress_total = ?2, message = ?3, updated_at = ?4 \
         WHERE id = ?5",
        rusqlite::params![current, total, message, now(), job_id],
    )?;
    Ok(())
}

/// Append an event to the job's stream
pub fn add_event(conn: &Connection, job_id: &str, level: EventLevel, text: &str) -> AppResult<()> {
    conn.execute(
        "INSERT INTO job_events(job_id, ts, level, text) VALUES (?1, ?2, ?3, ?4)",
        [job_id, now().as_str(), level.as_str(), text],
    )?;
    Ok(())
}

/// Fetch a job by id
pub fn get_job(conn: &Connection, job_id: &str) -> AppResult<Option<JobRow>> {
    let row = conn
        .query_row(
            "SELECT id, kind, status, progress_current, progress_total, message, created_at, updated_at \
             FROM jobs WHERE id = ?1",
            [job_id],
            map_job_row,
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(other),
        })?;
    row.map(finish_job_row).transpose()
}

/// Events after a watermark, ordered by autoincrement id
pub fn events_since(conn: &Connection, job_id: &str, last_id: i64) -> AppResult<Vec<JobEventRow>> {
    let mut stmt = conn.prepare(
        "SELECT id, ts, level, text FROM job_events WHERE job_id = ?1 AND id > ?2 ORDER BY id ASC",
    )?;
    let rows = stmt.query_map(rusqlite::params![job_id, last_id], |r| {
        Ok(JobEventRow {
            id: r.get(0)?,
            ts: r.get(1)?,
            level: r.get(2)?,
            text: r.get(3)?,
        })
    })?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

/// Apply a cancel request to the job row
///
/// Two-phase: `queued` drops straight to `cancelled` (the job never ran),
/// `running` records intent as `cancel_requested` until the worker stops.
/// Terminal rows are left untouched. Returns the resulting status.
pub fn request_cancel(conn: &Connection, job_id: &str) -> AppResult<Option<JobStatus>> {
    let Some(job) = get_job(conn, job_id)? else {
        return Ok(None);
    };
    add_event(conn, job_id, EventLevel::Info, "cancel requested")?;
    let next = match job.status {
        JobStatus::Queued => {
            set_job_status(conn, job_id, JobStatus::Cancelled, "")?;
            JobStatus::Cancelled
        }
        JobStatus::Running => {
            set_job_status(conn, job_id, JobStatus::CancelRequested, "")?;
            JobStatus::CancelRequested
        }
        other => other,
    };
    Ok(Some(next))
}

/// Finalize a `cancel_requested` row once the worker is known to be gone
pub fn finalize_cancelled(conn: &Connection, job_id: &str) -> AppResult<bool> {
    let Some(job) = get_job(conn, job_id)? else {
        return Ok(false);
    };
    if job.status != JobStatus::CancelRequested {
        return Ok(false);
    }
    add_event(conn, job_id, EventLevel::Info, "cancelled")?;
    set_job_status(conn, job_id, JobStatus::Cancelled, "")?;
    Ok(true)
}

struct RawJobRow {
    id: String,
    kind: String,
    status: String,
    progress_current: f64,
    progress_total: f64,
    message: String,
    created_at: String,
    updated_at: String,
}

fn map_job_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<RawJobRow> {
    Ok(RawJobRow {
        id: r.get(0)?,
        kind: r.get(1)?,
        status: r.get(2)?,
        progress_current: r.get(3)?,
        progress_total: r.get(4)?,
        message: r.get(5)?,
        created_at: r.get(6)?,
        updated_at: r.get(7)?,
    })
}

fn finish_job_row(raw: RawJobRow) -> AppResult<JobRow> {
    Ok(JobRow {
        status: JobStatus::parse(&raw.status)?,
        id: raw.id,
        kind: raw.kind,
        progress_current: raw.progress_current,
        progress_total: raw.progress_total,
        message: raw.message,
        created_at: raw.created_at,
        updated_at: raw.updated_at,
    })
}
