//! Application error model
//!
//! Defines a typed error hierarchy using `thiserror` for internal error
//! handling. The HTTP layer maps each variant to a status code; job tasks
//! record the display string into the `job_events` table.

use thiserror::Error;

/// Application error type
///
/// Covers all error cases the pipeline may encounter, from configuration
/// problems through IMAP transport failures to LLM readiness checks.
#[derive(Debug, Error)]
pub enum AppError {
    /// Invalid user input (validation failed, malformed request)
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// Resource not found (job, message, folder)
    #[error("not found: {0}")]
    NotFound(String),
    /// Required setting or credential absent
    #[error("not configured: {0}")]
    ConfigMissing(String),
    /// LLM provider prerequisites unsatisfied (engine/model missing, key not stored)
    #[error("llm not ready: {0}")]
    LlmNotReady(String),
    /// Authentication failure (bad credentials, account disabled)
    #[error("authentication failed: {0}")]
    AuthFailed(String),
    /// Operation timeout (TCP connect, TLS handshake, IMAP response)
    #[error("operation timed out: {0}")]
    Timeout(String),
    /// SQLite failure (including busy/locked)
    #[error("database error: {0}")]
    Database(String),
    /// Conflict (duplicate active job, state inconsistent)
    #[error("conflict: {0}")]
    Conflict(String),
    /// Internal error (unexpected failure, external crate error)
    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Convenience constructor for `InvalidInput`
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Whether this error is SQLite reporting a busy/locked database
    ///
    /// The HTTP layer turns this into a 503 so clients can retry.
    pub fn is_db_locked(&self) -> bool {
        match self {
            Self::Database(msg) => {
                let lower = msg.to_ascii_lowercase();
                lower.contains("locked") || lower.contains("busy")
            }
            _ => false,
        }
    }
}

impl From<rusqlite::Error> for AppError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Database(e.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(e: std::io::Error) -> Self {
        Self::Internal(format!("io error: {e}"))
    }
}

/// Type alias for fallible return values
///
/// Use this for all internal functions that can fail. Provides a consistent
/// error type throughout the codebase.
pub type AppResult<T> = Result<T, AppError>;
