//! HTTP API request/response types
//!
//! Shapes consumed by the UI collaborator over the job API and the SSE
//! event stream.

use serde::{Deserialize, Serialize};

use crate::job_repo::JobRow;

/// Response for `GET /api/jobs/{id}` and the job-start endpoints' lookups
#[derive(Debug, Clone, Serialize)]
pub struct JobView {
    pub id: String,
    pub kind: String,
    pub status: String,
    pub progress_current: f64,
    pub progress_total: f64,
    pub message: String,
    pub created_at: String,
    pub updated_at: String,
}

impl From<JobRow> for JobView {
    fn from(row: JobRow) -> Self {
        Self {
            id: row.id,
            kind: row.kind,
            status: row.status.as_str().to_owned(),
            progress_current: row.progress_current,
            progress_total: row.progress_total,
            message: row.message,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

/// Response for job-start endpoints
#[derive(Debug, Clone, Serialize)]
pub struct StartJobResponse {
    pub job_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub already_running: Option<bool>,
}

/// Body of `POST /api/jobs/resummarize-day`
///
/// `message_ids` stays loosely typed so malformed entries produce a 400
/// with a useful message instead of a generic deserialization error.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ResummarizeDayRequest {
    #[serde(default)]
    pub date_key: Option<String>,
    #[serde(default)]
    pub only_failed: Option<bool>,
    #[serde(default)]
    pub message_ids: Option<Vec<serde_json::Value>>,
}

/// Body of `POST /api/jobs/refresh-overviews`
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RefreshOverviewsRequest {
    #[serde(default)]
    pub date_keys: Option<Vec<String>>,
    #[serde(default)]
    pub force: Option<bool>,
}

/// `log` SSE event payload
#[derive(Debug, Clone, Serialize)]
pub struct LogEventPayload {
    pub id: i64,
    pub ts: String,
    pub level: String,
    pub text: String,
}

/// `progress` SSE event payload
#[derive(Debug, Clone, Serialize)]
pub struct ProgressPayload {
    pub status: String,
    pub current: f64,
    pub total: f64,
    pub message: String,
    pub date_key: String,
}

/// Error body shared by all failing endpoints
#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub error: String,
}
