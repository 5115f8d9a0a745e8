//! SQLite index: connection setup, schema migrations, startup recovery
//!
//! A single database file under app-data, opened with WAL and a 30s busy
//! timeout so background jobs and API requests can overlap. Migrations are
//! monotonic and linear, gated by the `schema_version` table.

use std::path::Path;

use rusqlite::Connection;

use crate::errors::{AppError, AppResult};

/// Schema version this build writes and expects
const TARGET_VERSION: i64 = 4;

/// Open a connection with the standard pragmas applied
///
/// Every short operation opens a fresh connection; WAL plus the busy
/// timeout keeps writers from starving each other.
pub fn open(db_path: &Path) -> AppResult<Connection> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let conn = Connection::open(db_path)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.pragma_update(None, "busy_timeout", 30_000)?;
    Ok(conn)
}

/// Initialize the database, running any pending migrations
///
/// Errors if the on-disk schema is newer than this build understands.
pub fn init(db_path: &Path) -> AppResult<()> {
    let conn = open(db_path)?;
    migrate(&conn)
}

/// Run migrations on an open connection up to [`TARGET_VERSION`]
pub fn migrate(conn: &Connection) -> AppResult<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)",
        [],
    )?;
    let existing: Option<i64> = conn
        .query_row("SELECT version FROM schema_version", [], |r| r.get(0))
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(other),
        })?;

    let mut version = match existing {
        Some(v) => v,
        None => {
            conn.execute("INSERT INTO schema_version(version) VALUES (0)", [])?;
            0
        }
    };

    if version > TARGET_VERSION {
        return Err(AppError::Conflict(format!(
            "database schema too new: {version} > {TARGET_VERSION}"
        )));
    }

    if version < 1 {
        migrate_0_to_1(conn)?;
        conn.execute("UPDATE schema_version SET version = 1", [])?;
        version = 1;
    }
    if version < 2 {
        migrate_1_to_2(conn)?;
        conn.execute("UPDATE schema_version SET version = 2", [])?;
        version = 2;
    }
    if version < 3 {
        migrate_2_to_3(conn)?;
        conn.execute("UPDATE schema_version SET version = 3", [])?;
        version = 3;
    }
    if version < 4 {
        migrate_3_to_4(conn)?;
        conn.execute("UPDATE schema_version SET version = 4", [])?;
    }
    Ok(())
}

/// Force-fail jobs left over from a previous process
///
/// Jobs are never silently resumed: `queued|running` become `failed` and a
/// pending `cancel_requested` finalizes as `cancelled`.
pub fn recover_stale_jobs(conn: &Connection) -> AppResult<()> {
    conn.execute(
        "UPDATE jobs SET status='failed', message='recovered on startup', updated_at=datetime('now') \
         WHERE status IN ('queued','running')",
        [],
    )?;
    conn.execute(
        "UPDATE jobs SET status='cancelled', message='recovered as cancelled', updated_at=datetime('now') \
         WHERE status = 'cancel_requested'",
        [],
    )?;
    Ok(())
}

fn migrate_0_to_1(conn: &Connection) -> AppResult<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS settings (
          key TEXT PRIMARY KEY,
          value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS jobs (
          id TEXT PRIMARY KEY,
          kind TEXT NOT NULL,
          status TEXT NOT NULL,
          progress_current REAL NOT NULL DEFAULT 0,
          progress_total REAL NOT NULL DEFAULT 0,
          message TEXT NOT NULL DEFAULT '',
          created_at TEXT NOT NULL,
          updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS job_events (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          job_id TEXT NOT NULL,
          ts TEXT NOT NULL,
          level TEXT NOT NULL,
          text TEXT NOT NULL,
          FOREIGN KEY(job_id) REFERENCES jobs(id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS messages (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          account_id TEXT NOT NULL,
          mailbox TEXT NOT NULL,
          uidvalidity INTEGER NOT NULL,
          uid INTEGER NOT NULL,
          message_id TEXT,
          internal_date TEXT,
          from_addr TEXT,
          to_addr TEXT,
          subject TEXT,
          raw_eml_path TEXT NOT NULL,
          body_html_path TEXT,
          body_text_path TEXT,
          rendered_html_path TEXT,
          summary TEXT,
          tags_json TEXT,
          backlinks_json TEXT,
          topics_json TEXT,
          personal INTEGER NOT NULL DEFAULT 0,
          archived_at TEXT,
          indexed_at TEXT,
          exported_at TEXT,
          seen_marked_at TEXT,
          created_at TEXT NOT NULL,
          updated_at TEXT NOT NULL,
          UNIQUE(account_id, mailbox, uidvalidity, uid)
        );

        CREATE TABLE IF NOT EXISTS attachments (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          message_fk INTEGER NOT NULL,
          filename TEXT NOT NULL,
          mime_type TEXT,
          size_bytes INTEGER NOT NULL,
          rel_path TEXT NOT NULL,
          content_id TEXT,
          is_inline INTEGER NOT NULL DEFAULT 0,
          created_at TEXT NOT NULL,
          FOREIGN KEY(message_fk) REFERENCES messages(id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS external_assets (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          message_fk INTEGER NOT NULL,
          original_url TEXT NOT NULL,
          rel_path TEXT,
          mime_type TEXT,
          size_bytes INTEGER,
          status TEXT NOT NULL,
          created_at TEXT NOT NULL,
          FOREIGN KEY(message_fk) REFERENCES messages(id) ON DELETE CASCADE
        );
        ",
    )?;
    Ok(())
}

fn migrate_1_to_2(conn: &Connection) -> AppResult<()> {
    // Summarization timing metrics were added after the base schema shipped.
    let mut cols = Vec::new();
    let mut stmt = conn.prepare("PRAGMA table_info(messages)")?;
    let names = stmt.query_map([], |r| r.get::<_, String>(1))?;
    for name in names {
        cols.push(name?);
    }
    if !cols.iter().any(|c| c == "summarized_at") {
        conn.execute("ALTER TABLE messages ADD COLUMN summarized_at TEXT", [])?;
    }
    if !cols.iter().any(|c| c == "summarize_ms") {
        conn.execute("ALTER TABLE messages ADD COLUMN summarize_ms INTEGER", [])?;
    }
    Ok(())
}

fn migrate_2_to_3(conn: &Connection) -> AppResult<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS daily_overviews (
          day TEXT PRIMARY KEY,
          overview TEXT NOT NULL,
          updated_at TEXT NOT NULL
        )",
        [],
    )?;
    Ok(())
}

fn migrate_3_to_4(conn: &Connection) -> AppResult<()> {
    conn.execute_batch(
        "
        CREATE INDEX IF NOT EXISTS idx_messages_internal_date ON messages(internal_date);
        CREATE INDEX IF NOT EXISTS idx_messages_day_prefix ON messages(substr(internal_date, 1, 10));
        CREATE INDEX IF NOT EXISTS idx_messages_pending_summary ON messages(id) WHERE summarized_at IS NULL;
        CREATE INDEX IF NOT EXISTS idx_messages_sync_resume ON messages(account_id, mailbox, uidvalidity, uid) WHERE seen_marked_at IS NOT NULL;
        ",
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{init, migrate, open, recover_stale_jobs};
    use crate::job_repo::{self, JobStatus};

    #[test]
    fn init_is_idempotent_and_reaches_target_version() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let db = tmp.path().join("db.sqlite3");
        init(&db).expect("first init");
        init(&db).expect("second init");

        let conn = open(&db).expect("open");
        let version: i64 = conn
            .query_row("SELECT version FROM schema_version", [], |r| r.get(0))
            .expect("version row");
        assert_eq!(version, 4);
    }

    #[test]
    fn migrations_create_all_tables() {
        let conn = rusqlite::Connection::open_in_memory().expect("memory db");
        migrate(&conn).expect("migrate");
        for table in [
            "settings",
            "jobs",
            "job_events",
            "messages",
            "attachments",
            "external_assets",
            "daily_overviews",
        ] {
            let n: i64 = conn
                .query_row(
                    "SELECT count(*) FROM sqlite_master WHERE type='table' AND name=?1",
                    [table],
                    |r| r.get(0),
                )
                .expect("query");
            assert_eq!(n, 1, "missing table {table}");
        }
    }

    #[test]
    fn startup_recovery_finalizes_stale_jobs() {
        let conn = rusqlite::Connection::open_in_memory().expect("memory db");
        migrate(&conn).expect("migrate");

        job_repo::create_job(&conn, "j1", "sync").expect("create");
        job_repo::set_job_status(&conn, "j1", JobStatus::Running, "").expect("status");
        job_repo::create_job(&conn, "j2", "resummarize-day").expect("create");
        job_repo::create_job(&conn, "j3", "sync").expect("create");
        job_repo::set_job_status(&conn, "j3", JobStatus::CancelRequested, "").expect("status");

        recover_stale_jobs(&conn).expect("recover");

        let j1 = job_repo::get_job(&conn, "j1").expect("get").expect("row");
        assert_eq!(j1.status, JobStatus::Failed);
        assert_eq!(j1.message, "recovered on startup");
        let j2 = job_repo::get_job(&conn, "j2").expect("get").expect("row");
        assert_eq!(j2.status, JobStatus::Failed);
        let j3 = job_repo::get_job(&conn, "j3").expect("get").expect("row");
        assert_eq!(j3.status, JobStatus::Cancelled);
    }
}
