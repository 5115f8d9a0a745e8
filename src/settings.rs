//! Typed settings over the string KV table
//!
//! Settings are stored as strings in SQLite; this module parses them into a
//! typed struct with forgiving parsers. Unknown or malformed values fall
//! back to documented defaults, never crash a task at startup.

use rusqlite::Connection;

use crate::errors::AppResult;

/// Runtime settings loaded at task start
#[derive(Debug, Clone)]
pub struct Settings {
    /// IMAP server hostname (empty until the wizard saves)
    pub imap_host: String,
    /// IMAP server port (993 default)
    pub imap_port: u16,
    /// IMAP login user
    pub imap_user: String,
    /// Folder to sync
    pub imap_folder: String,
    /// Only messages from this sender are synced (empty = all senders)
    pub sender_filter: String,
    /// Vault root for exported notes (empty = platform default)
    pub vault_root: String,
    /// LLM backend selector: `local` or `cloud`
    pub llm_backend: String,
    /// Cloud provider name (`openai`, `google`, `upstage`, `anthropic`, `openrouter`)
    pub cloud_provider: String,
    /// Model id used by the cloud backend
    pub cloud_model: String,
    /// Path to the local inference binary (llama.cpp style CLI)
    pub local_engine_path: String,
    /// Path to the local GGUF model file
    pub local_model_path: String,
    /// Per-message byte budget for external asset downloads
    pub external_max_bytes: u64,
    /// Undo `\Seen` flags at the end of a sync run (smoke-test aid)
    pub revert_seen_after_sync: bool,
    /// User roles for prompt tailoring
    pub user_roles: Vec<String>,
    /// Free-form user interests for prompt tailoring
    pub user_interests: String,
}

/// Read one setting value
pub fn get_setting(conn: &Connection, key: &str) -> AppResult<Option<String>> {
    let value = conn
        .query_row("SELECT value FROM settings WHERE key = ?1", [key], |r| {
            r.get::<_, String>(0)
        })
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(other),
        })?;
    Ok(value)
}

/// Write one setting value (upsert)
pub fn set_setting(conn: &Connection, key: &str, value: &str) -> AppResult<()> {
    conn.execute(
        "INSERT INTO settings(key, value) VALUES (?1, ?2) \
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        [key, value],
    )?;
    Ok(())
}

/// Load all settings with defaults applied
pub fn load(conn: &Connection) -> AppResult<Settings> {
    let get = |key: &str| -> AppResult<Option<String>> { get_setting(conn, key) };

    Ok(Settings {
        imap_host: get("imap_host")?.unwrap_or_default(),
        imap_port: parse_u16(get("imap_port")?, 993),
        imap_user: get("imap_user")?.unwrap_or_default(),
        imap_folder: get("imap_folder")?.unwrap_or_else(|| "INBOX".to_owned()),
        sender_filter: get("sender_filter")?.unwrap_or_default(),
        vault_root: get("vault_root")?.unwrap_or_default(),
        llm_backend: normalize_backend(get("llm_backend")?),
        cloud_provider: get("cloud_provider")?
            .map(|v| v.trim().to_ascii_lowercase())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| "openai".to_owned()),
        cloud_model: get("cloud_model")?.unwrap_or_default(),
        local_engine_path: get("local_engine_path")?.unwrap_or_default(),
        local_model_path: get("local_model_path")?.unwrap_or_default(),
        external_max_bytes: parse_u64(get("external_max_bytes")?, 1 << 30),
        revert_seen_after_sync: parse_bool(get("revert_seen_after_sync")?, false),
        user_roles: parse_string_list(get("user_roles")?),
        user_interests: get("user_interests")?.unwrap_or_default(),
    })
}

fn normalize_backend(value: Option<String>) -> String {
    let v = value
        .map(|s| s.trim().to_ascii_lowercase())
        .unwrap_or_default();
    match v.as_str() {
        "cloud" | "openrouter" => "cloud".to_owned(),
        _ => "local".to_owned(),
    }
}

/// Parse a boolean setting: `1/true/yes/on` are truthy (case-insensitive)
fn parse_bool(value: Option<String>, default: bool) -> bool {
    match value {
        Some(v) => matches!(
            v.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        None => default,
    }
}

fn parse_u16(value: Option<String>, default: u16) -> u16 {
    value
        .and_then(|v| v.trim().parse::<u16>().ok())
        .unwrap_or(default)
}

fn parse_u64(value: Option<String>, default: u64) -> u64 {
    value
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

/// Parse a JSON string list; anything malformed yields an empty list
fn parse_string_list(value: Option<String>) -> Vec<String> {
    let Some(raw) = value else {
        return Vec::new();
    };
    match serde_json::from_str::<Vec<String>>(&raw) {
        Ok(items) => items
            .into_iter()
            .map(|s| s.trim().to_owned())
            .filter(|s| !s.is_empty())
            .collect(),
        Err(_) => Vec::new(),
    }
}
