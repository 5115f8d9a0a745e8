//! Message, attachment, and external-asset repository
//!
//! Messages are keyed by `(account_id, mailbox, uidvalidity, uid)`; upserts
//! keep `archived_at` sticky so re-archival never loses the original
//! timestamp. Attachments and external assets are replaced wholesale on
//! re-archive, which keeps re-runs idempotent.

use chrono::{SecondsFormat, Utc};
use rusqlite::Connection;

use crate::errors::AppResult;

/// Value-type identity of a message and its archive directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageKey {
    pub account_id: String,
    pub mailbox: String,
    pub uidvalidity: u32,
    pub uid: u32,
}

impl MessageKey {
    /// Stable string form used for vault asset folders and raw.eml names
    pub fn export_key(&self) -> String {
        format!("{}-{}-{}", self.account_id, self.uidvalidity, self.uid)
    }
}

/// Fields written by the index stage of the pipeline
#[derive(Debug, Clone)]
pub struct NewMessage<'a> {
    pub key: &'a MessageKey,
    pub message_id: Option<&'a str>,
    pub internal_date: Option<&'a str>,
    pub from_addr: Option<&'a str>,
    pub to_addr: Option<&'a str>,
    pub subject: Option<&'a str>,
    pub raw_eml_path: &'a str,
    pub body_html_path: Option<&'a str>,
    pub body_text_path: Option<&'a str>,
    pub rendered_html_path: Option<&'a str>,
}

/// One attachment row, as extracted by the archive pipeline
#[derive(Debug, Clone)]
pub struct AttachmentRecord {
    pub filename: String,
    pub mime_type: Option<String>,
    pub size_bytes: u64,
    pub rel_path: String,
    pub content_id: Option<String>,
    pub is_inline: bool,
}

/// One external asset row with its terminal status string
#[derive(Debug, Clone)]
pub struct ExternalAssetRecord {
    pub original_url: String,
    pub rel_path: Option<String>,
    pub mime_type: Option<String>,
    pub size_bytes: Option<u64>,
    pub status: String,
}

/// Row shape used by the resummarize task
#[derive(Debug, Clone)]
pub struct ResummarizeRow {
    pub id: i64,
    pub key: MessageKey,
    pub subject: String,
    pub from_addr: String,
    pub internal_date: String,
    pub summary: String,
    pub raw_eml_path: String,
    pub body_text_path: Option<String>,
    pub body_html_path: Option<String>,
}

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Insert or update a message by its unique key, returning the row id
///
/// `archived_at` is sticky via `COALESCE`: the first successful archive
/// wins, later re-archives only refresh the cached paths and headers.
pub fn upsert_message(conn: &Connection, msg: &NewMessage<'_>) -> AppResult<i64> {
    let ts = now();
    conn.execute(
        "INSERT INTO messages(
           account_id, mailbox, uidvalidity, uid, message_id, internal_date,
           from_addr, to_addr, subject, raw_eml_path, body_html_path,
           body_text_path, rendered_html_path, created_at, updated_at, archived_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?14, ?14)
         ON CONFLICT(account_id, mailbox, uidvalidity, uid) DO UPDATE SET
           message_id = excluded.message_id,
           internal_date = excluded.internal_date,
           from_addr = excluded.from_addr,
           to_addr = excluded.to_addr,
           subject = excluded.subject,
           raw_eml_path = excluded.raw_eml_path,
           body_html_path = excluded.body_html_path,
           body_text_path = excluded.body_text_path,
           rendered_html_path = excluded.rendered_html_path,
           updated_at = excluded.updated_at,
           archived_at = COALESCE(messages.archived_at, excluded.archived_at)",
        rusqlite::params![
            msg.key.account_id,
            msg.key.mailbox,
            msg.key.uidvalidity,
            msg.key.uid,
            msg.message_id,
            msg.internal_date,
            msg.from_addr,
            msg.to_addr,
            msg.subject,
            msg.raw_eml_path,
            msg.body_html_path,
            msg.body_text_path,
            msg.rendered_html_path,
            ts,
        ],
    )?;
    let id: i64 = conn.query_row(
        "SELECT id FROM messages WHERE account_id=?1 AND mailbox=?2 AND uidvalidity=?3 AND uid=?4",
        rusqlite::params![
            msg.key.account_id,
            msg.key.mailbox,
            msg.key.uidvalidity,
            msg.key.uid
        ],
        |r| r.get(0),
    )?;
    Ok(id)
}

/// Replace all attachment rows for a message
pub fn replace_attachments(
    conn: &Connection,
    message_fk: i64,
    items: &[AttachmentRecord],
) -> AppResult<()> {
    let ts = now();
    conn.execute(
        "DELETE FROM attachments WHERE message_fk = ?1",
        [message_fk],
    )?;
    for it in items {
        conn.execute(
            "INSERT INTO attachments(message_fk, filename, mime_type, size_bytes, rel_path, content_id, is_inline, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            rusqlite::params![
                message_fk,
                it.filename,
                it.mime_type,
                it.size_bytes,
                it.rel_path,
                it.content_id,
                it.is_inline as i64,
                ts,
            ],
        )?;
    }
    Ok(())
}

/// Replace all external-asset rows for a message
pub fn replace_external_assets(
    conn: &Connection,
    message_fk: i64,
    items: &[ExternalAssetRecord],
) -> AppResult<()> {
    let ts = now();
    conn.execute(
        "DELETE FROM external_assets WHERE message_fk = ?1",
        [message_fk],
    )?;
    for it in items {
        conn.execute(
            "INSERT INTO external_assets(message_fk, original_url, rel_path, mime_type, size_bytes, status, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                message_fk,
                it.original_url,
                it.rel_path,
                it.mime_type,
                it.size_bytes,
                it.status,
                ts,
            ],
        )?;
    }
    Ok(())
}

/// Store summarization output and timing for a message
pub fn set_analysis(
    conn: &Connection,
    message_fk: i64,
    summary: &str,
    tags: &[String],
    topics: &[String],
    personal: bool,
    summarize_ms: Option<i64>,
) -> AppResult<()> {
    let ts = now();
    conn.execute(
        "UPDATE messages SET summary=?1, tags_json=?2, topics_json=?3, personal=?4, \
         indexed_at=?5, summarized_at=?5, summarize_ms=?6, updated_at=?5 WHERE id=?7",
        rusqlite::params![
            summary,
            serde_json::to_string(tags).unwrap_or_else(|_| "[]".to_owned()),
            serde_json::to_string(topics).unwrap_or_else(|_| "[]".to_owned()),
            personal as i64,
            ts,
            summarize_ms,
            message_fk,
        ],
    )?;
    Ok(())
}

/// Mark the vault note as written
pub fn set_exported(conn: &Connection, message_fk: i64) -> AppResult<()> {
    let ts = now();
    conn.execute(
        "UPDATE messages SET exported_at=?1, updated_at=?1 WHERE id=?2",
        rusqlite::params![ts, message_fk],
    )?;
    Ok(())
}

/// Mark the server-side `\Seen` mutation as done
pub fn set_seen_marked(conn: &Connection, message_fk: i64) -> AppResult<()> {
    let ts = now();
    conn.execute(
        "UPDATE messages SET seen_marked_at=?1, updated_at=?1 WHERE id=?2",
        rusqlite::params![ts, message_fk],
    )?;
    Ok(())
}

/// Sync watermark: highest fully processed UID for this folder generation
///
/// Only rows whose `seen_marked_at` is set count; a message that was
/// archived but never marked seen must be picked up again.
pub fn max_seen_uid(
    conn: &Connection,
    account_id: &str,
    mailbox: &str,
    uidvalidity: u32,
) -> AppResult<Option<u32>> {
    let max: Option<u32> = conn.query_row(
        "SELECT MAX(uid) FROM messages \
         WHERE account_id=?1 AND mailbox=?2 AND uidvalidity=?3 AND seen_marked_at IS NOT NULL",
        rusqlite::params![account_id, mailbox, uidvalidity],
        |r| r.get(0),
    )?;
    Ok(max)
}

/// Non-empty summaries for one day, oldest first
pub fn summaries_for_day(conn: &Connection, day: &str) -> AppResult<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT summary FROM messages \
         WHERE internal_date LIKE ?1 AND summary IS NOT NULL AND trim(summary) <> '' \
         ORDER BY internal_date ASC",
    )?;
    let rows = stmt.query_map([format!("{day}%")], |r| r.get::<_, String>(0))?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

/// Latest `summarized_at` among a day's messages (freshness gate input)
pub fn latest_summarized_at(conn: &Connection, day: &str) -> AppResult<Option<String>> {
    let ts: Option<String> = conn.query_row(
        "SELECT MAX(summarized_at) FROM messages \
         WHERE internal_date LIKE ?1 AND summarized_at IS NOT NULL",
        [format!("{day}%")],
        |r| r.get(0),
    )?;
    Ok(ts)
}

/// Distinct days with indexed messages, newest first
pub fn distinct_days(conn: &Connection, limit: u32) -> AppResult<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT DISTINCT substr(internal_date, 1, 10) AS day FROM messages \
         WHERE internal_date IS NOT NULL ORDER BY day DESC LIMIT ?1",
    )?;
    let rows = stmt.query_map([limit], |r| r.get::<_, String>(0))?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

/// Resummarize candidates for one calendar day
pub fn resummarize_rows_for_day(conn: &Connection, day: &str) -> AppResult<Vec<ResummarizeRow>> {
    let mut stmt = conn.prepare(
        "SELECT id, account_id, mailbox, uidvalidity, uid, subject, from_addr, internal_date, \
                summary, raw_eml_path, body_text_path, body_html_path \
         FROM messages WHERE internal_date LIKE ?1 ORDER BY internal_date ASC",
    )?;
    let rows = stmt.query_map([format!("{day}%")], map_resummarize_row)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

/// Resummarize candidates by explicit row ids
pub fn resummarize_rows_by_ids(
    conn: &Connection,
    message_ids: &[i64],
) -> AppResult<Vec<ResummarizeRow>> {
    if message_ids.is_empty() {
        return Ok(Vec::new());
    }
    let placeholders = vec!["?"; message_ids.len()].join(",");
    let sql = format!(
        "SELECT id, account_id, mailbox, uidvalidity, uid, subject, from_addr, internal_date, \
                summary, raw_eml_path, body_text_path, body_html_path \
         FROM messages WHERE id IN ({placeholders}) ORDER BY internal_date ASC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(rusqlite::params_from_iter(message_ids), map_resummarize_row)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

/// Read one day's overview text
pub fn get_daily_overview(conn: &Connection, day: &str) -> AppResult<Option<String>> {
    let overview = conn
        .query_row(
            "SELECT overview FROM daily_overviews WHERE day = ?1",
            [day],
            |r| r.get::<_, String>(0),
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(other),
        })?;
    Ok(overview)
}

/// Timestamp of the last overview write for a day
pub fn daily_overview_updated_at(conn: &Connection, day: &str) -> AppResult<Option<String>> {
    let ts = conn
        .query_row(
            "SELECT updated_at FROM daily_overviews WHERE day = ?1",
            [day],
            |r| r.get::<_, String>(0),
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(other),
        })?;
    Ok(ts)
}

/// Upsert one day's overview
pub fn set_daily_overview(conn: &Connection, day: &str, overview: &str) -> AppResult<()> {
    conn.execute(
        "INSERT INTO daily_overviews(day, overview, updated_at) VALUES (?1, ?2, ?3) \
         ON CONFLICT(day) DO UPDATE SET overview=excluded.overview, updated_at=excluded.updated_at",
        [day, overview, now().as_str()],
    )?;
    Ok(())
}

fn map_resummarize_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<ResummarizeRow> {
    Ok(ResummarizeRow {
        id: r.get(0)?,
        key: MessageKey {
            account_id: r.get(1)?,
            mailbox: r.get(2)?,
            uidvalidity: r.get(3)?,
            uid: r.get(4)?,
        },
        subject: r.get::<_, Option<String>>(5)?.unwrap_or_default(),
        from_addr: r.get::<_, Option<String>>(6)?.unwrap_or_default(),
        internal_date: r.get::<_, Option<String>>(7)?.unwrap_or_default(),
        summary: r.get::<_, Option<String>>(8)?.unwrap_or_default(),
        raw_eml_path: r.get(9)?,
        body_text_path: r.get(10)?,
        body_html_path: r.get(11)?,
    })
}

#[cfg(test)]
mod tests {
    use super::{
        AttachmentRecord, ExternalAssetRecord, MessageKey, NewMessage, distinct_days,
        get_daily_overview, max_seen_uid, replace_attachments, replace_external_assets,
        resummarize_rows_by_ids, resummarize_rows_for_day, set_analysis, set_daily_overview,
        set_exported, set_seen_marked, summaries_for_day, upsert_message,
    };
    use crate::db;

    fn test_conn() -> rusqlite::Connection {
        let conn = rusqlite::Connection::open_in_memory().expect("memory db");
        db::migrate(&conn).expect("migrate");
        conn
    }

    fn key(uid: u32) -> MessageKey {
        MessageKey {
            account_id: "user@example.com".to_owned(),
            mailbox: "INBOX".to_owned(),
            uidvalidity: 7,
            uid,
        }
    }

    fn insert(conn: &rusqlite::Connection, k: &MessageKey, date: &str) -> i64 {
        upsert_message(
            conn,
            &NewMessage {
                key: k,
                message_id: Some("<m@example>"),
                internal_date: Some(date),
                from_addr: Some("alice@example.com"),
                to_addr: Some("user@example.com"),
                subject: Some("hello"),
                raw_eml_path: "/tmp/raw.eml",
                body_html_path: None,
                body_text_path: Some("/tmp/body.txt"),
                rendered_html_path: None,
            },
        )
        .expect("upsert")
    }

    #[test]
    fn upsert_is_idempotent_and_archived_at_is_sticky() {
        let conn = test_conn();
        let k = key(42);
        let id1 = insert(&conn, &k, "2025-01-10T09:30:00+09:00");
        let first_archived: String = conn
            .query_row("SELECT archived_at FROM messages WHERE id=?1", [id1], |r| {
                r.get(0)
            })
            .expect("archived_at");

        let id2 = insert(&conn, &k, "2025-01-10T09:30:00+09:00");
        assert_eq!(id1, id2);

        let count: i64 = conn
            .query_row("SELECT count(*) FROM messages", [], |r| r.get(0))
            .expect("count");
        assert_eq!(count, 1);

        let second_archived: String = conn
            .query_row("SELECT archived_at FROM messages WHERE id=?1", [id1], |r| {
                r.get(0)
            })
            .expect("archived_at");
        assert_eq!(first_archived, second_archived);
    }

    #[test]
    fn attachments_and_assets_are_replaced_wholesale() {
        let conn = test_conn();
        let id = insert(&conn, &key(1), "2025-01-10T09:00:00+09:00");

        let att = AttachmentRecord {
            filename: "img1.png".to_owned(),
            mime_type: Some("image/png".to_owned()),
            size_bytes: 10,
            rel_path: "attachments/img1.png".to_owned(),
            content_id: Some("img1".to_owned()),
            is_inline: true,
        };
        replace_attachments(&conn, id, &[att.clone(), att.clone()]).expect("replace");
        replace_attachments(&conn, id, &[att]).expect("replace again");

        let n: i64 = conn
            .query_row(
                "SELECT count(*) FROM attachments WHERE message_fk=?1",
                [id],
                |r| r.get(0),
            )
            .expect("count");
        assert_eq!(n, 1);

        let asset = ExternalAssetRecord {
            original_url: "http://127.0.0.1:8080/x.png".to_owned(),
            rel_path: None,
            mime_type: None,
            size_bytes: None,
            status: "blocked:private ip blocked".to_owned(),
        };
        replace_external_assets(&conn, id, &[asset]).expect("replace");
        replace_external_assets(&conn, id, &[]).expect("clear");
        let n: i64 = conn
            .query_row(
                "SELECT count(*) FROM external_assets WHERE message_fk=?1",
                [id],
                |r| r.get(0),
            )
            .expect("count");
        assert_eq!(n, 0);
    }

    #[test]
    fn watermark_counts_only_seen_marked_rows() {
        let conn = test_conn();
        let id1 = insert(&conn, &key(10), "2025-01-10T09:00:00+09:00");
        let _id2 = insert(&conn, &key(20), "2025-01-10T10:00:00+09:00");

        assert_eq!(
            max_seen_uid(&conn, "user@example.com", "INBOX", 7).expect("max"),
            None
        );

        set_exported(&conn, id1).expect("export");
        set_seen_marked(&conn, id1).expect("seen");
        assert_eq!(
            max_seen_uid(&conn, "user@example.com", "INBOX", 7).expect("max"),
            Some(10)
        );

        // A different folder generation starts over.
        assert_eq!(
            max_seen_uid(&conn, "user@example.com", "INBOX", 8).expect("max"),
            None
        );
    }

    #[test]
    fn day_queries_group_by_date_prefix() {
        let conn = test_conn();
        let id1 = insert(&conn, &key(1), "2025-01-10T09:00:00+09:00");
        let id2 = insert(&conn, &key(2), "2025-01-10T17:00:00+09:00");
        let _id3 = insert(&conn, &key(3), "2025-01-11T08:00:00+09:00");

        set_analysis(&conn, id1, "- point one", &[], &[], false, Some(120)).expect("analysis");
        set_analysis(&conn, id2, "- point two", &[], &[], false, Some(90)).expect("analysis");

        let sums = summaries_for_day(&conn, "2025-01-10").expect("sums");
        assert_eq!(sums, vec!["- point one", "- point two"]);

        let days = distinct_days(&conn, 90).expect("days");
        assert_eq!(days, vec!["2025-01-11", "2025-01-10"]);

        let rows = resummarize_rows_for_day(&conn, "2025-01-10").expect("rows");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].key.uid, 1);

        let by_ids = resummarize_rows_by_ids(&conn, &[id2]).expect("rows");
        assert_eq!(by_ids.len(), 1);
        assert_eq!(by_ids[0].id, id2);
    }

    #[test]
    fn daily_overview_upserts() {
        let conn = test_conn();
        set_daily_overview(&conn, "2025-01-10", "- quiet day").expect("set");
        set_daily_overview(&conn, "2025-01-10", "- busy day").expect("overwrite");
        assert_eq!(
            get_daily_overview(&conn, "2025-01-10").expect("get"),
            Some("- busy day".to_owned())
        );
    }
}
