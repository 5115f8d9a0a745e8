//! HTTP job API
//!
//! The boundary the UI collaborator consumes: start jobs, poll or stream
//! their progress, and cancel them. Events stream over SSE with id
//! watermarking so consumers can resume; the stream closes once the job
//! reaches a terminal state.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::Json;
use axum::Router;
use axum::extract::{Path as UrlPath, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use chrono::{DateTime, Utc};
use futures::Stream;
use futures::StreamExt;
use tracing::info;

use crate::db;
use crate::errors::{AppError, AppResult};
use crate::job_repo::{self, JobStatus};
use crate::models::{
    ErrorBody, JobView, LogEventPayload, ProgressPayload, RefreshOverviewsRequest,
    ResummarizeDayRequest, StartJobResponse,
};
use crate::runner::{JobRunner, JobSpec};
use crate::worker_probe;

/// Active jobs untouched for this long are reclaimable as stale
const STALE_JOB_SECS: i64 = 30 * 60;
/// SSE poll interval
const EVENT_POLL: Duration = Duration::from_millis(500);

/// Shared server state
pub struct AppState {
    pub db_path: PathBuf,
    pub runner: Arc<JobRunner>,
}

/// Serve options from the CLI
#[derive(Debug, Clone)]
pub struct ServeOptions {
    /// Port to bind; 0 picks a free port
    pub port: u16,
    pub open_browser: bool,
}

/// Bind and run the HTTP listener
pub async fn serve(state: Arc<AppState>, opts: ServeOptions) -> AppResult<()> {
    let addr = SocketAddr::from(([127, 0, 0, 1], opts.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| AppError::Internal(format!("cannot bind {addr}: {e}")))?;
    let local = listener
        .local_addr()
        .map_err(|e| AppError::Internal(format!("cannot read local addr: {e}")))?;
    let url = format!("http://{local}/");
    info!(url = %url, "http listener ready");
    if opts.open_browser {
        let _ = open::that(&url);
    }
    axum::serve(listener, router(state))
        .await
        .map_err(|e| AppError::Internal(format!("http server failed: {e}")))
}

/// Build the API router
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/jobs/sync", post(start_sync))
        .route("/api/jobs/resummarize-day", post(start_resummarize_day))
        .route("/api/jobs/refresh-overviews", post(start_refresh_overviews))
        .route("/api/jobs/{id}/cancel", post(cancel_job))
        .route("/api/jobs/{id}", get(get_job))
        .route("/api/jobs/{id}/events", get(stream_events))
        .with_state(state)
}

/// HTTP-facing error wrapper
struct ApiError(AppError);

impl From<AppError> for ApiError {
    fn from(e: AppError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = if self.0.is_db_locked() {
            StatusCode::SERVICE_UNAVAILABLE
        } else {
            match &self.0 {
                AppError::InvalidInput(_) => StatusCode::BAD_REQUEST,
                AppError::NotFound(_) => StatusCode::NOT_FOUND,
                AppError::Conflict(_) => StatusCode::CONFLICT,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            }
        };
        let message = if status == StatusCode::SERVICE_UNAVAILABLE {
            "database is busy (locked). Try again in a moment.".to_owned()
        } else {
            self.0.to_string()
        };
        (status, Json(ErrorBody { error: message })).into_response()
    }
}

async fn start_sync(
    State(state): State<Arc<AppState>>,
) -> Result<Json<StartJobResponse>, ApiError> {
    {
        let conn = db::open(&state.db_path)?;
        if let Some(active) = job_repo::find_active_job(&conn, "sync")? {
            // A long-silent active job is reclaimed so users can recover.
            if age_seconds(&active.updated_at) <= STALE_JOB_SECS {
                return Ok(Json(StartJobResponse {
                    job_id: active.id,
                    already_running: Some(true),
                }));
            }
            job_repo::set_job_status(
                &conn,
                &active.id,
                JobStatus::Failed,
                "stale job (no updates for 30m)",
            )?;
        }
    }
    let job_id = state.runner.enqueue(JobSpec::Sync)?;
    Ok(Json(StartJobResponse {
        job_id,
        already_running: None,
    }))
}

async fn start_resummarize_day(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ResummarizeDayRequest>,
) -> Result<Json<StartJobResponse>, ApiError> {
    let date_key = body
        .date_key
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| AppError::invalid("date_key required"))?
        .to_owned();

    let message_ids = match body.message_ids {
        Some(values) if !values.is_empty() => Some(parse_message_ids(&values)?),
        _ => None,
    };

    {
        let conn = db::open(&state.db_path)?;
        if let Some(active) = job_repo::find_active_job(&conn, "resummarize-day")? {
            return Ok(Json(StartJobResponse {
                job_id: active.id,
                already_running: Some(true),
            }));
        }
    }

    let job_id = state.runner.enqueue(JobSpec::ResummarizeDay {
        date_key,
        only_failed: body.only_failed.unwrap_or(true),
        message_ids,
    })?;
    Ok(Json(StartJobResponse {
        job_id,
        already_running: None,
    }))
}

async fn start_refresh_overviews(
    State(state): State<Arc<AppState>>,
    Json(body): Json<RefreshOverviewsRequest>,
) -> Result<Json<StartJobResponse>, ApiError> {
    {
        let conn = db::open(&state.db_path)?;
        if let Some(active) = job_repo::find_active_job(&conn, "refresh-overviews")? {
            return Ok(Json(StartJobResponse {
                job_id: active.id,
                already_running: Some(true),
            }));
        }
    }
    let job_id = state.runner.enqueue(JobSpec::RefreshOverviews {
        days: body.date_keys,
        force: body.force.unwrap_or(false),
    })?;
    Ok(Json(StartJobResponse {
        job_id,
        already_running: None,
    }))
}

async fn cancel_job(
    State(state): State<Arc<AppState>>,
    UrlPath(job_id): UrlPath<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.runner.cancel(&job_id);

    let conn = db::open(&state.db_path)?;
    let Some(_) = job_repo::request_cancel(&conn, &job_id)? else {
        return Err(AppError::NotFound("job not found".to_owned()).into());
    };

    // Best-effort: finalize a sync worker that is already gone. The probe
    // sleeps between terminate and kill, so it runs off the async runtime.
    if let Some(job) = job_repo::get_job(&conn, &job_id)?
        && job.kind == "sync"
    {
        let probe_id = job_id.clone();
        let gone = tokio::task::spawn_blocking(move || {
            worker_probe::kill_worker(&probe_id);
            !worker_probe::is_worker_running(&probe_id)
        })
        .await
        .unwrap_or(false);
        if gone {
            job_repo::finalize_cancelled(&conn, &job_id)?;
        }
    }

    Ok(Json(serde_json::json!({"ok": true})))
}

async fn get_job(
    State(state): State<Arc<AppState>>,
    UrlPath(job_id): UrlPath<String>,
) -> Result<Json<JobView>, ApiError> {
    let conn = db::open(&state.db_path)?;
    let job = job_repo::get_job(&conn, &job_id)?
        .ok_or_else(|| AppError::NotFound("job not found".to_owned()))?;
    Ok(Json(job.into()))
}

struct EventCursor {
    db_path: PathBuf,
    job_id: String,
    last_id: i64,
    first: bool,
    done: bool,
}

async fn stream_events(
    State(state): State<Arc<AppState>>,
    UrlPath(job_id): UrlPath<String>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let cursor = EventCursor {
        db_path: state.db_path.clone(),
        job_id,
        last_id: 0,
        first: true,
        done: false,
    };

    let stream = futures::stream::unfold(cursor, |mut cursor| async move {
        if cursor.done {
            return None;
        }
        if !cursor.first {
            tokio::time::sleep(EVENT_POLL).await;
        }
        cursor.first = false;
        let batch = poll_events(&mut cursor);
        Some((batch, cursor))
    })
    .flat_map(futures::stream::iter);

    Sse::new(stream).keep_alive(KeepAlive::default())
}

/// One poll tick: drain new events, then emit a progress snapshot
///
/// Events are never coalesced server-side; consumers throttle themselves.
fn poll_events(cursor: &mut EventCursor) -> Vec<Result<Event, Infallible>> {
    let mut out = Vec::new();

    let result = (|| -> AppResult<()> {
        let conn = db::open(&cursor.db_path)?;
        let Some(job) = job_repo::get_job(&conn, &cursor.job_id)? else {
            out.push(Ok(Event::default().event("error").data("not_found")));
            cursor.done = true;
            return Ok(());
        };

        for ev in job_repo::events_since(&conn, &cursor.job_id, cursor.last_id)? {
            cursor.last_id = ev.id;
            match ev.level.as_str() {
                // Text is already a JSON object string for these kinds.
                "message_updated" => {
                    out.push(Ok(Event::default().event("message_updated").data(ev.text)));
                }
                "detail" => {
                    out.push(Ok(Event::default().event("detail").data(ev.text)));
                }
                _ => {
                    let payload = LogEventPayload {
                        id: ev.id,
                        ts: ev.ts,
                        level: ev.level.clone(),
                        text: ev.text,
                    };
                    let data = serde_json::to_string(&payload)
                        .unwrap_or_else(|_| "{}".to_owned());
                    out.push(Ok(Event::default().event("log").data(data)));
                }
            }
        }

        let progress = ProgressPayload {
            status: job.status.as_str().to_owned(),
            current: job.progress_current,
            total: job.progress_total,
            message: job.message.clone(),
            date_key: extract_date_key(&job.message),
        };
        let data = serde_json::to_string(&progress).unwrap_or_else(|_| "{}".to_owned());
        out.push(Ok(Event::default().event("progress").data(data)));

        // A cancel whose worker already vanished is finalized here so the
        // stream can terminate instead of watching a zombie forever.
        if job.kind == "sync"
            && job.status == JobStatus::CancelRequested
            && !worker_probe::is_worker_running(&cursor.job_id)
        {
            job_repo::finalize_cancelled(&conn, &cursor.job_id)?;
        }

        if job.status.is_terminal() {
            cursor.done = true;
        }
        Ok(())
    })();

    if result.is_err() {
        cursor.done = true;
    }
    out
}

/// Pull a `YYYY-MM-DD` key out of a `[date] ...` progress line
fn extract_date_key(message: &str) -> String {
    let Some(rest) = message.strip_prefix('[') else {
        return String::new();
    };
    let candidate: String = rest.chars().take(10).collect();
    let bytes: Vec<char> = candidate.chars().collect();
    let well_formed = bytes.len() == 10
        && bytes[4] == '-'
        && bytes[7] == '-'
        && bytes
            .iter()
            .enumerate()
            .all(|(i, c)| matches!(i, 4 | 7) || c.is_ascii_digit());
    if well_formed { candidate } else { String::new() }
}

fn parse_message_ids(values: &[serde_json::Value]) -> AppResult<Vec<i64>> {
    let mut out = Vec::with_capacity(values.len());
    for v in values {
        let id = match v {
            serde_json::Value::Number(n) => n.as_i64(),
            serde_json::Value::String(s) => s.trim().parse::<i64>().ok(),
            _ => None,
        };
        match id {
            Some(id) => out.push(id),
            None => return Err(AppError::invalid("message_ids must be ints")),
        }
    }
    Ok(out)
}

fn age_seconds(updated_at: &str) -> i64 {
    match DateTime::parse_from_rfc3339(updated_at) {
        Ok(ts) => (Utc::now() - ts.with_timezone(&Utc)).num_seconds(),
        Err(_) => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::{age_seconds, extract_date_key, parse_message_ids};

    #[test]
    fn date_key_extraction_requires_bracketed_iso_prefix() {
        assert_eq!(extract_date_key("[2025-01-10] 요약 중: x (1/3)"), "2025-01-10");
        assert_eq!(extract_date_key("no brackets"), "");
        assert_eq!(extract_date_key("[not-a-date] x"), "");
        assert_eq!(extract_date_key("[2025-1-10] short"), "");
    }

    #[test]
    fn message_ids_accept_numbers_and_numeric_strings() {
        let values = vec![
            serde_json::json!(3),
            serde_json::json!("17"),
        ];
        assert_eq!(parse_message_ids(&values).expect("ids"), vec![3, 17]);

        let bad = vec![serde_json::json!("x")];
        assert!(parse_message_ids(&bad).is_err());
    }

    #[test]
    fn unparseable_timestamps_count_as_fresh() {
        assert_eq!(age_seconds("garbage"), 0);
        assert!(age_seconds("2000-01-01T00:00:00+00:00") > 0);
    }
}
