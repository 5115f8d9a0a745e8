//! Targeted resummarization task
//!
//! Re-runs the summarization orchestrator for one calendar day, for rows
//! whose stored summary looks unusable, or for an explicit id list. Bodies
//! are re-read from the archive (text preferred, HTML fallback), notes are
//! re-exported, and the day's digest and overview are rebuilt afterwards.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::NaiveDate;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::db;
use crate::errors::{AppError, AppResult};
use crate::export::{MessageExport, export_daily_note, export_email_note};
use crate::html::html_to_text;
use crate::job_repo::{self, EventLevel};
use crate::mail_repo::{self, ResummarizeRow};
use crate::paths;
use crate::provider::{self, Summarize, Tier, sanitize_text_for_llm};
use crate::settings::{self, Settings};
use crate::summarize::{UserProfile, summarize_long, synthesize_daily_overview};

/// Pre-call delay for cloud providers (free-tier smoothing)
const CLOUD_PACING: Duration = Duration::from_secs(2);
/// LLM calls slower than this raise a warn event
const SLOW_LLM: Duration = Duration::from_secs(60);

/// Run a resummarize pass
pub async fn run(
    db_path: &Path,
    job_id: &str,
    cancel: &CancellationToken,
    date_key: &str,
    only_failed: bool,
    message_ids: Option<Vec<i64>>,
) -> AppResult<()> {
    let day = NaiveDate::parse_from_str(date_key.trim(), "%Y-%m-%d")
        .map_err(|_| AppError::invalid("invalid date_key"))?;
    let day_key = day.format("%Y-%m-%d").to_string();

    let settings = {
        let conn = db::open(db_path)?;
        settings::load(&conn)?
    };
    let provider = provider::get_provider(&settings)?;
    add_event(
        db_path,
        job_id,
        EventLevel::Info,
        &format!("llm_tier={:?}", provider.tier()),
    )?;

    let vault_root = if settings.vault_root.trim().is_empty() {
        paths::default_vault_root()?
    } else {
        PathBuf::from(settings.vault_root.trim())
    };
    std::fs::create_dir_all(&vault_root)?;

    let rows = {
        let conn = db::open(db_path)?;
        match &message_ids {
            Some(ids) => mail_repo::resummarize_rows_by_ids(&conn, ids)?,
            None => mail_repo::resummarize_rows_for_day(&conn, &day_key)?,
        }
    };

    let targets: Vec<ResummarizeRow> = if message_ids.is_some() {
        // User-selected messages: always exactly those.
        rows
    } else if only_failed {
        rows.into_iter()
            .filter(|r| needs_resummarize(&r.summary))
            .collect()
    } else {
        rows
    };

    let total = targets.len().max(1);
    set_progress(
        db_path,
        job_id,
        0.0,
        total as f64,
        &format!("[{day_key}] 날짜별 다시 요약 준비 중"),
    )?;
    add_event(
        db_path,
        job_id,
        EventLevel::Info,
        &format!("resummarize day={day_key} targets={}", targets.len()),
    )?;

    if targets.is_empty() {
        set_progress(db_path, job_id, 1.0, 1.0, &format!("[{day_key}] 다시 요약할 항목 없음"))?;
        add_event(db_path, job_id, EventLevel::Info, "no targets")?;
        return Ok(());
    }

    let profile = UserProfile {
        roles: settings.user_roles.clone(),
        interests: settings.user_interests.clone(),
    };
    let mut processed_notes: Vec<PathBuf> = Vec::new();

    for (idx, row) in targets.iter().enumerate() {
        if cancel.is_cancelled() {
            break;
        }
        let i = idx + 1;
        match resummarize_one(
            db_path,
            job_id,
            &settings,
            &provider,
            &profile,
            &vault_root,
            row,
            i,
            targets.len(),
            day,
        )
        .await
        {
            Ok(Some(note)) => processed_notes.push(note),
            Ok(None) => {}
            Err(e) => {
                add_event(
                    db_path,
                    job_id,
                    EventLevel::Error,
                    &format!("message {} 다시 요약 실패: {e}", row.id),
                )?;
            }
        }
    }

    set_progress(
        db_path,
        job_id,
        targets.len() as f64,
        total as f64,
        &format!("[{day_key}] 다시 요약 완료"),
    )?;

    // Rebuild daily note and overview, best-effort.
    if !processed_notes.is_empty() {
        let digest = processed_notes
            .iter()
            .map(|p| {
                format!(
                    "- {}",
                    p.file_stem().map(|s| s.to_string_lossy()).unwrap_or_default()
                )
            })
            .collect::<Vec<_>>()
            .join("\n");
        if let Err(e) = export_daily_note(&vault_root, day, &processed_notes, &digest) {
            warn!(error = %e, "daily note rebuild failed");
        }
    }

    let summaries = {
        let conn = db::open(db_path)?;
        mail_repo::summaries_for_day(&conn, &day_key)?
    };
    if !summaries.is_empty() {
        match synthesize_daily_overview(&provider, &day_key, &summaries, &profile).await {
            Ok(overview) if !overview.is_empty() => {
                let conn = db::open(db_path)?;
                mail_repo::set_daily_overview(&conn, &day_key, &overview)?;
            }
            Ok(_) => {}
            Err(e) => {
                add_event(
                    db_path,
                    job_id,
                    EventLevel::Warn,
                    &format!("[{day_key}] 개요 생성 실패: {e}"),
                )?;
            }
        }
    }

    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn resummarize_one(
    db_path: &Path,
    job_id: &str,
    settings: &Settings,
    provider: &provider::LlmProvider,
    profile: &UserProfile,
    vault_root: &Path,
    row: &ResummarizeRow,
    i: usize,
    total: usize,
    day: NaiveDate,
) -> AppResult<Option<PathBuf>> {
    let subject = if row.subject.is_empty() {
        "(no subject)".to_owned()
    } else {
        row.subject.clone()
    };
    let display_date: String = row.internal_date.chars().take(10).collect();
    let display_sub = if subject.chars().count() > 30 {
        format!("{}...", subject.chars().take(30).collect::<String>())
    } else {
        subject.clone()
    };

    set_progress(
        db_path,
        job_id,
        (i as f64) - 0.99,
        total as f64,
        &format!("[{display_date}] 다시 요약 중: {display_sub} ({i}/{total})"),
    )?;
    add_event(
        db_path,
        job_id,
        EventLevel::Info,
        &format!("item {i}/{total}: {subject}"),
    )?;
    add_detail(
        db_path,
        job_id,
        &serde_json::json!({
            "type": "email",
            "message_id": row.id,
            "index": i,
            "total": total,
            "subject": subject,
        }),
    )?;
    add_detail(db_path, job_id, &serde_json::json!({"type": "stage", "stage": "read"}))?;

    let body_text = read_archived_body(row);

    set_progress(
        db_path,
        job_id,
        (i as f64) - 0.95,
        total as f64,
        &format!("[{display_date}] LLM 호출 중: {display_sub} ({i}/{total})"),
    )?;
    add_detail(db_path, job_id, &serde_json::json!({"type": "stage", "stage": "llm"}))?;

    if provider.tier() == Tier::Cloud {
        tokio::time::sleep(CLOUD_PACING).await;
    }

    let progress_db = db_path.to_path_buf();
    let progress_job = job_id.to_owned();
    let progress_msg = format!("[{display_date}] 다시 요약 중: {display_sub} ({i}/{total})");
    let mut on_progress = move |fraction: f64| {
        let current = (i as f64) - 1.0 + fraction;
        if let Err(e) = set_progress(&progress_db, &progress_job, current, total as f64, &progress_msg)
        {
            warn!(error = %e, "sub-progress update failed");
        }
    };
    let detail_db = db_path.to_path_buf();
    let detail_job = job_id.to_owned();
    let mut on_detail = move |d: &serde_json::Value| {
        if let Err(e) = add_detail(&detail_db, &detail_job, d) {
            warn!(error = %e, "detail event failed");
        }
    };

    let started = Instant::now();
    let outcome = summarize_long(
        provider,
        &sanitize_text_for_llm(&subject),
        &sanitize_text_for_llm(&body_text),
        profile,
        Some(&mut on_progress),
        Some(&mut on_detail),
    )
    .await?;
    let elapsed = started.elapsed();

    add_detail(db_path, job_id, &serde_json::json!({"type": "stage", "stage": "save"}))?;
    if elapsed > SLOW_LLM {
        add_event(
            db_path,
            job_id,
            EventLevel::Warn,
            &format!("LLM 느림: {:.1}s (item {i}/{total})", elapsed.as_secs_f64()),
        )?;
    } else {
        add_event(
            db_path,
            job_id,
            EventLevel::Info,
            &format!("LLM 완료: {:.1}s (item {i}/{total})", elapsed.as_secs_f64()),
        )?;
    }

    let topics = outcome.backlinks.clone();
    {
        let conn = db::open(db_path)?;
        mail_repo::set_analysis(
            &conn,
            row.id,
            &outcome.summary,
            &outcome.tags,
            &topics,
            outcome.personal,
            Some(elapsed.as_millis() as i64),
        )?;
    }
    add_event(
        db_path,
        job_id,
        EventLevel::MessageUpdated,
        &serde_json::json!({"message_id": row.id, "summary": outcome.summary.clone()}).to_string(),
    )?;

    add_detail(db_path, job_id, &serde_json::json!({"type": "stage", "stage": "export"}))?;
    let email_date = NaiveDate::parse_from_str(&display_date, "%Y-%m-%d").unwrap_or(day);
    let archive_dir = Path::new(&row.raw_eml_path)
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default();
    let export = MessageExport {
        message_key: row.key.export_key(),
        date: email_date,
        sender: if row.from_addr.is_empty() {
            settings.sender_filter.clone()
        } else {
            row.from_addr.clone()
        },
        subject,
        summary: outcome.summary,
        tags: outcome.tags,
        topics,
        archive_dir,
    };
    match export_email_note(vault_root, &export) {
        Ok(note) => Ok(Some(note)),
        // Export failures should not stop the resummarize loop.
        Err(e) => {
            warn!(error = %e, message_id = row.id, "note re-export failed");
            Ok(None)
        }
    }
}

/// Whether a stored summary warrants a re-run
///
/// Empty text, the unavailable marker, known engine noise, and raw
/// JSON/fenced output all count as bad.
pub fn needs_resummarize(summary: &str) -> bool {
    let s = summary.trim().to_lowercase();
    if s.is_empty() {
        return true;
    }
    if s.contains("llm unavailable") {
        return true;
    }
    if s.contains("failed to format input") || s.contains("invalid codepoint") {
        return true;
    }
    if s.contains("loading model") || s.contains("available commands") {
        return true;
    }
    s.starts_with('{') || s.starts_with("```json") || s.starts_with("```")
}

/// Archived body for re-summarization: text preferred, HTML fallback
fn read_archived_body(row: &ResummarizeRow) -> String {
    if let Some(text_path) = row.body_text_path.as_deref()
        && !text_path.is_empty()
        && let Ok(text) = std::fs::read_to_string(text_path)
    {
        return text;
    }
    if let Some(html_path) = row.body_html_path.as_deref()
        && !html_path.is_empty()
        && let Ok(html) = std::fs::read_to_string(html_path)
    {
        return html_to_text(&html);
    }
    String::new()
}

fn add_event(db_path: &Path, job_id: &str, level: EventLevel, text: &str) -> AppResult<()> {
    let conn = db::open(db_path)?;
    job_repo::add_event(&conn, job_id, level, text)
}

fn add_detail(db_path: &Path, job_id: &str, value: &serde_json::Value) -> AppResult<()> {
    add_event(db_path, job_id, EventLevel::Detail, &value.to_string())
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
    use super::needs_resummarize;

    #[test]
    fn bad_summaries_are_flagged() {
        assert!(needs_resummarize(""));
        assert!(needs_resummarize("   "));
        assert!(needs_resummarize("(LLM unavailable)"));
        assert!(needs_resummarize("Failed to format input near byte 12"));
        assert!(needs_resummarize("loading model weights"));
        assert!(needs_resummarize("{\"summary\": \"raw json\"}"));
        assert!(needs_resummarize("```json\n{}\n```"));
    }

    #[test]
    fn healthy_summaries_are_kept() {
        assert!(!needs_resummarize("### 핵심 요약\n- 정상 요약"));
        assert!(!needs_resummarize("- bullet one\n- bullet two"));
    }
}
