//! Mailbox sync task
//!
//! The end-to-end per-message state machine: archive → index → summarize →
//! export → mark-seen, strictly in ascending UID order. Durable index
//! updates always precede the server-visible `\Seen` mutation, so a crash
//! never marks a message read that is not also archived and exported. A
//! failure in one message aborts that message only; LLM readiness is the
//! one check that fails the whole task up front.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{Local, NaiveDate};
use secrecy::SecretString;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::archive::archive_message;
use crate::creds;
use crate::db;
use crate::errors::{AppError, AppResult};
use crate::export::{MessageExport, export_daily_note, export_email_note, export_topic_note};
use crate::html::html_to_text;
use crate::imap::{FetchedMessage, MailSession, SearchSpec};
use crate::job_repo::{self, EventLevel};
use crate::mail_repo::{self, MessageKey, NewMessage};
use crate::mime;
use crate::paths::{self, MessagePaths};
use crate::provider::{self, LlmProvider, Summarize, Tier, sanitize_text_for_llm};
use crate::settings::{self, Settings};
use crate::summarize::{UserProfile, summarize_long, synthesize_daily_overview};

/// Sync looks back this many days; the UID watermark bounds re-reads
const LOOKBACK_DAYS: i64 = 60;
/// Archive stages slower than this raise a warn event
const SLOW_ARCHIVE: Duration = Duration::from_secs(15);
/// Summarize stages slower than this raise a warn event
const SLOW_SUMMARIZE: Duration = Duration::from_secs(60);
/// Pre-call delay for cloud providers (free-tier smoothing)
const CLOUD_PACING: Duration = Duration::from_secs(2);

/// Run one full sync pass for the configured account
pub async fn run(data_root: &Path, job_id: &str, cancel: &CancellationToken) -> AppResult<()> {
    let db_path = paths::db_path(data_root);

    let settings = {
        let conn = db::open(&db_path)?;
        settings::load(&conn)?
    };
    if settings.imap_host.is_empty() || settings.imap_user.is_empty() {
        return Err(AppError::ConfigMissing("IMAP account not configured".to_owned()));
    }
    let account_id = format!("{}@{}", settings.imap_user, settings.imap_host);

    let password = creds::lookup(&creds::service_id(&settings.imap_host), &settings.imap_user)?
        .ok_or_else(|| AppError::ConfigMissing("IMAP password not stored".to_owned()))?;
    let password = SecretString::new(password.into());

    // LLM readiness fails the whole task before any side effect.
    let provider = provider::get_provider(&settings)?;

    let vault_root = if settings.vault_root.trim().is_empty() {
        paths::default_vault_root()?
    } else {
        PathBuf::from(settings.vault_root.trim())
    };
    std::fs::create_dir_all(&vault_root)?;

    let mut session = MailSession::connect(
        &settings.imap_host,
        settings.imap_port,
        &settings.imap_user,
        &password,
    )
    .await?;
    let uidvalidity = session.select(&settings.imap_folder, false).await?;

    let last_uid = {
        let conn = db::open(&db_path)?;
        mail_repo::max_seen_uid(&conn, &account_id, &settings.imap_folder, uidvalidity)?
    };

    let since = Local::now().date_naive() - chrono::Duration::days(LOOKBACK_DAYS);
    let uids = session
        .search(&SearchSpec {
            sender: Some(settings.sender_filter.clone()).filter(|s| !s.trim().is_empty()),
            since: Some(since),
            unseen_only: false,
            min_uid_exclusive: last_uid,
        })
        .await?;

    set_progress(&db_path, job_id, 0.0, uids.len().max(1) as f64, "동기화 준비 중")?;

    let messages = session.fetch_full(&uids).await?;
    let total = messages.len().max(1);

    let ctx = SyncCtx {
        data_root,
        db_path: &db_path,
        job_id,
        settings: &settings,
        account_id: &account_id,
        uidvalidity,
        vault_root: &vault_root,
        provider: &provider,
        total,
    };

    let mut revert_uids: Vec<u32> = Vec::new();
    let mut processed: Vec<(String, PathBuf, Vec<String>)> = Vec::new();

    for (idx, message) in messages.iter().enumerate() {
        if cancel.is_cancelled() {
            break;
        }
        let i = idx + 1;
        match process_message(&ctx, &mut session, &password, message, i, &mut revert_uids).await {
            Ok(note) => processed.push(note),
            Err(e) => {
                add_event(
                    &db_path,
                    job_id,
                    EventLevel::Error,
                    &format!("uid {} 처리 실패: {e}", message.uid),
                )?;
            }
        }
    }

    if !cancel.is_cancelled() {
        publish_day_notes(&ctx, &processed).await?;
    }

    if settings.revert_seen_after_sync && !revert_uids.is_empty() {
        // Best-effort revert for smoke tests; partial failure is tolerated.
        for uid in revert_uids {
            if let Err(e) = clear_seen_with_retry(&mut session, &settings, &password, uid).await {
                add_event(
                    &db_path,
                    job_id,
                    EventLevel::Warn,
                    &format!("안읽음 원복 실패 (uid {uid}): {e}"),
                )?;
            }
        }
    }

    session.logout().await;
    Ok(())
}

struct SyncCtx<'a> {
    data_root: &'a Path,
    db_path: &'a Path,
    job_id: &'a str,
    settings: &'a Settings,
    account_id: &'a str,
    uidvalidity: u32,
    vault_root: &'a Path,
    provider: &'a LlmProvider,
    total: usize,
}

/// One message through the five-stage machine
///
/// Returns `(day, note_path, topics)` for the post-loop daily/topic pass.
async fn process_message(
    ctx: &SyncCtx<'_>,
    session: &mut MailSession,
    password: &SecretString,
    message: &FetchedMessage,
    i: usize,
    revert_uids: &mut Vec<u32>,
) -> AppResult<(String, PathBuf, Vec<String>)> {
    let headers = mime::parse_headers(&message.raw)?;
    let internal_date = message
        .internal_date
        .map(|d| d.to_rfc3339())
        .unwrap_or_else(|| Local::now().to_rfc3339());
    let subject = headers
        .subject
        .clone()
        .unwrap_or_else(|| "(no subject)".to_owned());
    let display_date: String = internal_date.chars().take(10).collect();
    let display_sub = truncate_subject(&subject, 30);

    let stage = |label: &str| -> AppResult<()> {
        set_progress(
            ctx.db_path,
            ctx.job_id,
            (i as f64) - 0.99,
            ctx.total as f64,
            &format!("[{display_date}] {label}: {display_sub} ({i}/{})", ctx.total),
        )
    };

    // archive
    stage("백업 중")?;
    add_event(ctx.db_path, ctx.job_id, EventLevel::Info, "아카이브 시작")?;
    let archive_started = Instant::now();
    let msg_paths = paths::message_paths(
        ctx.data_root,
        ctx.account_id,
        &ctx.settings.imap_folder,
        ctx.uidvalidity,
        message.uid,
    )?;
    let archived = archive_message(&message.raw, &msg_paths, ctx.settings.external_max_bytes).await?;
    let archive_elapsed = archive_started.elapsed();
    if archive_elapsed > SLOW_ARCHIVE {
        add_event(
            ctx.db_path,
            ctx.job_id,
            EventLevel::Warn,
            &format!("아카이브가 느립니다 ({:.1}초)", archive_elapsed.as_secs_f64()),
        )?;
    }

    // index
    stage("저장 중")?;
    let key = MessageKey {
        account_id: ctx.account_id.to_owned(),
        mailbox: ctx.settings.imap_folder.clone(),
        uidvalidity: ctx.uidvalidity,
        uid: message.uid,
    };
    let message_fk = {
        let mut conn = db::open(ctx.db_path)?;
        let tx = conn
            .transaction()
            .map_err(|e| AppError::Database(e.to_string()))?;
        let fk = mail_repo::upsert_message(
            &tx,
            &NewMessage {
                key: &key,
                message_id: headers.message_id.as_deref(),
                internal_date: Some(&internal_date),
                from_addr: headers.from.as_deref(),
                to_addr: headers.to.as_deref(),
                subject: Some(&subject),
                raw_eml_path: &archived.raw_eml_path.to_string_lossy(),
                body_html_path: archived
                    .body_html_path
                    .as_ref()
                    .map(|p| p.to_string_lossy().into_owned())
                    .as_deref(),
                body_text_path: archived
                    .body_text_path
                    .as_ref()
                    .map(|p| p.to_string_lossy().into_owned())
                    .as_deref(),
                rendered_html_path: archived
                    .rendered_html_path
                    .as_ref()
                    .map(|p| p.to_string_lossy().into_owned())
                    .as_deref(),
            },
        )?;
        mail_repo::replace_attachments(&tx, fk, &archived.attachments)?;
        mail_repo::replace_external_assets(&tx, fk, &archived.external_assets)?;
        tx.commit().map_err(|e| AppError::Database(e.to_string()))?;
        fk
    };

    // summarize
    stage("요약 중")?;
    add_event(ctx.db_path, ctx.job_id, EventLevel::Info, "요약 시작")?;
    let body_text = read_body_text(&msg_paths);

    if ctx.provider.tier() == Tier::Cloud {
        tokio::time::sleep(CLOUD_PACING).await;
    }

    let profile = UserProfile {
        roles: ctx.settings.user_roles.clone(),
        interests: ctx.settings.user_interests.clone(),
    };
    let db_path = ctx.db_path.to_path_buf();
    let job_id = ctx.job_id.to_owned();
    let total = ctx.total;
    let progress_msg = format!("[{display_date}] 요약 중: {display_sub} ({i}/{total})");
    let mut on_progress = move |fraction: f64| {
        let current = (i as f64) - 1.0 + fraction;
        if let Err(e) = set_progress(&db_path, &job_id, current, total as f64, &progress_msg) {
            warn!(error = %e, "sub-progress update failed");
        }
    };

    let summarize_started = Instant::now();
    let outcome = summarize_long(
        ctx.provider,
        &sanitize_text_for_llm(&subject),
        &sanitize_text_for_llm(&body_text),
        &profile,
        Some(&mut on_progress),
        None,
    )
    .await?;
    let summarize_elapsed = summarize_started.elapsed();
    if summarize_elapsed > SLOW_SUMMARIZE {
        add_event(
            ctx.db_path,
            ctx.job_id,
            EventLevel::Warn,
            &format!("요약이 느립니다 ({:.1}초)", summarize_elapsed.as_secs_f64()),
        )?;
    }

    let topics = outcome.backlinks.clone();
    {
        let conn = db::open(ctx.db_path)?;
        mail_repo::set_analysis(
            &conn,
            message_fk,
            &outcome.summary,
            &outcome.tags,
            &topics,
            outcome.personal,
            Some(summarize_elapsed.as_millis() as i64),
        )?;
    }

    // export
    stage("노트 내보내기 중")?;
    let note_date = parse_day(&display_date).unwrap_or_else(|| Local::now().date_naive());
    let note_path = export_email_note(
        ctx.vault_root,
        &MessageExport {
            message_key: key.export_key(),
            date: note_date,
            sender: headers
                .from
                .clone()
                .unwrap_or_else(|| ctx.settings.sender_filter.clone()),
            subject: subject.clone(),
            summary: outcome.summary.clone(),
            tags: outcome.tags.clone(),
            topics: topics.clone(),
            archive_dir: msg_paths.base_dir.clone(),
        },
    )?;
    {
        let conn = db::open(ctx.db_path)?;
        mail_repo::set_exported(&conn, message_fk)?;
    }

    // mark-seen, only after durable export
    stage("읽음 처리 중")?;
    match mark_seen_with_retry(session, ctx.settings, password, message.uid).await {
        Ok(()) => {
            if ctx.settings.revert_seen_after_sync && !message.seen {
                revert_uids.push(message.uid);
            }
            let conn = db::open(ctx.db_path)?;
            mail_repo::set_seen_marked(&conn, message_fk)?;
        }
        Err(e) => {
            add_event(
                ctx.db_path,
                ctx.job_id,
                EventLevel::Warn,
                &format!("읽음 처리 실패: {e}"),
            )?;
        }
    }

    Ok((display_date, note_path, topics))
}

/// Daily digests, topic hubs, and overview synthesis after the loop
async fn publish_day_notes(
    ctx: &SyncCtx<'_>,
    processed: &[(String, PathBuf, Vec<String>)],
) -> AppResult<()> {
    let mut by_date: BTreeMap<String, Vec<PathBuf>> = BTreeMap::new();
    let mut by_topic: BTreeMap<String, Vec<PathBuf>> = BTreeMap::new();
    for (day, note, topics) in processed {
        by_date.entry(day.clone()).or_default().push(note.clone());
        for topic in topics {
            by_topic.entry(topic.clone()).or_default().push(note.clone());
        }
    }

    for (day, notes) in &by_date {
        let digest = notes
            .iter()
            .map(|p| {
                format!(
                    "- {}",
                    p.file_stem().map(|s| s.to_string_lossy()).unwrap_or_default()
                )
            })
            .collect::<Vec<_>>()
            .join("\n");
        if let Some(date) = parse_day(day) {
            export_daily_note(ctx.vault_root, date, notes, &digest)?;
        }
    }

    for (topic, notes) in &by_topic {
        export_topic_note(ctx.vault_root, topic, notes)?;
    }

    // Overview synthesis failures are logged and never fail the sync.
    let profile = UserProfile {
        roles: ctx.settings.user_roles.clone(),
        interests: ctx.settings.user_interests.clone(),
    };
    for day in by_date.keys() {
        let summaries = {
            let conn = db::open(ctx.db_path)?;
            mail_repo::summaries_for_day(&conn, day)?
        };
        if summaries.is_empty() {
            continue;
        }
        match synthesize_daily_overview(ctx.provider, day, &summaries, &profile).await {
            Ok(overview) if !overview.is_empty() => {
                let conn = db::open(ctx.db_path)?;
                mail_repo::set_daily_overview(&conn, day, &overview)?;
            }
            Ok(_) => {}
            Err(e) => {
                add_event(
                    ctx.db_path,
                    ctx.job_id,
                    EventLevel::Warn,
                    &format!("[{day}] 개요 생성 실패: {e}"),
                )?;
            }
        }
    }
    Ok(())
}

/// Mark seen with one fresh-session retry on transient errors
///
/// A reconnect replaces the caller's session so later messages use the
/// healthy connection.
async fn mark_seen_with_retry(
    session: &mut MailSession,
    settings: &Settings,
    password: &SecretString,
    uid: u32,
) -> AppResult<()> {
    if session.mark_seen(uid).await.is_ok() {
        return Ok(());
    }
    let mut fresh = MailSession::connect(
        &settings.imap_host,
        settings.imap_port,
        &settings.imap_user,
        password,
    )
    .await?;
    fresh.select(&settings.imap_folder, false).await?;
    fresh.mark_seen(uid).await?;
    *session = fresh;
    Ok(())
}

async fn clear_seen_with_retry(
    session: &mut MailSession,
    settings: &Settings,
    password: &SecretString,
    uid: u32,
) -> AppResult<()> {
    if session.clear_seen(uid).await.is_ok() {
        return Ok(());
    }
    let mut fresh = MailSession::connect(
        &settings.imap_host,
        settings.imap_port,
        &settings.imap_user,
        password,
    )
    .await?;
    fresh.select(&settings.imap_folder, false).await?;
    fresh.clear_seen(uid).await?;
    *session = fresh;
    Ok(())
}

/// Body text for summarization: `body.txt` preferred, HTML fallback
pub fn read_body_text(msg_paths: &MessagePaths) -> String {
    let text_path = msg_paths.body_text();
    if text_path.is_file()
        && let Ok(text) = std::fs::read_to_string(&text_path)
    {
        return text;
    }
    let html_path = msg_paths.body_html();
    if html_path.is_file()
        && let Ok(html) = std::fs::read_to_string(&html_path)
    {
        return html_to_text(&html);
    }
    String::new()
}

fn truncate_subject(subject: &str, max_chars: usize) -> String {
    if subject.chars().count() <= max_chars {
        return subject.to_owned();
    }
    let clipped: String = subject.chars().take(max_chars).collect();
    format!("{clipped}...")
}

fn parse_day(day: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(day, "%Y-%m-%d").ok()
}

fn add_event(db_path: &Path, job_id: &str, level: EventLevel, text: &str) -> AppResult<()> {
    let conn = db::open(db_path)?;
    job_repo::add_event(&conn, job_id, level, text)
}

fn set_progress(
    db_path: &Path,
    job_id: &str,
    current: f64,
    total: f64,
    message: &str,
) -> AppResult<()> {
    let conn = db::open(db_path)?;
    job_repo::update_progress(&conn, job_id, current, total, message)
}

#[cfg(test)]
mod tests {
    use super::{parse_day, read_body_text, truncate_subject};
    use crate::paths::message_paths;

    #[test]
    fn subject_truncation_is_char_aware() {
        assert_eq!(truncate_subject("short", 30), "short");
        let long = "가".repeat(40);
        let out = truncate_subject(&long, 30);
        assert!(out.ends_with("..."));
        assert_eq!(out.chars().count(), 33);
    }

    #[test]
    fn day_parsing_accepts_date_prefixes_only() {
        assert!(parse_day("2025-01-10").is_some());
        assert!(parse_day("2025-1-10").is_none());
        assert!(parse_day("not-a-date").is_none());
    }

    #[test]
    fn body_text_prefers_plain_text_over_html() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let paths = message_paths(tmp.path(), "u@h", "INBOX", 1, 1).expect("paths");

        std::fs::write(paths.body_html(), "<p>html body</p>").expect("write");
        let from_html = read_body_text(&paths);
        assert!(from_html.contains("html body"));

        std::fs::write(paths.body_text(), "plain body").expect("write");
        assert_eq!(read_body_text(&paths), "plain body");
    }

    #[test]
    fn body_text_is_empty_when_nothing_archived() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let paths = message_paths(tmp.path(), "u@h", "INBOX", 1, 2).expect("paths");
        assert_eq!(read_body_text(&paths), "");
    }
}
