//! Daily-overview refresh task
//!
//! Regenerates overview rows for a set of days (explicit, or the most
//! recent 90 distinct days with messages). A day is skipped when its
//! overview is already newer than the day's latest summarization, unless
//! the caller forces a refresh. Failures are isolated per day.

use std::path::Path;
use std::sync::LazyLock;

use chrono::DateTime;
use regex::Regex;
use tokio_util::sync::CancellationToken;

use crate::db;
use crate::errors::AppResult;
use crate::job_repo::{self, EventLevel};
use crate::mail_repo;
use crate::provider;
use crate::settings;
use crate::summarize::{UserProfile, synthesize_daily_overview};

/// Days scanned when no explicit list is given
const DEFAULT_DAY_LIMIT: u32 = 90;

/// Run an overview refresh pass
pub async fn run(
    db_path: &Path,
    job_id: &str,
    cancel: &CancellationToken,
    date_keys: Option<Vec<String>>,
    force: bool,
) -> AppResult<()> {
    let settings = {
        let conn = db::open(db_path)?;
        settings::load(&conn)?
    };
    let provider = provider::get_provider(&settings)?;

    let explicit_days = normalize_days(date_keys.as_deref().unwrap_or(&[]));
    let days = if explicit_days.is_empty() {
        let conn = db::open(db_path)?;
        mail_repo::distinct_days(&conn, DEFAULT_DAY_LIMIT)?
    } else {
        explicit_days.clone()
    };

    let total = days.len();
    if total == 0 {
        set_progress(db_path, job_id, 0.0, 0.0, "대상 날짜가 없습니다")?;
        return Ok(());
    }

    let profile = UserProfile {
        roles: settings.user_roles.clone(),
        interests: settings.user_interests.clone(),
    };

    for (idx, day) in days.iter().enumerate() {
        if cancel.is_cancelled() {
            break;
        }
        let i = idx + 1;
        set_progress(
            db_path,
            job_id,
            (i as f64) - 0.5,
            total as f64,
            &format!("[{day}] 날짜별요약 생성 중 ({i}/{total})"),
        )?;

        if let Err(e) = refresh_day(db_path, job_id, &provider, &profile, day, force, &explicit_days)
            .await
        {
            add_event(
                db_path,
                job_id,
                EventLevel::Error,
                &format!("[{day}] 개요 생성 실패: {e}"),
            )?;
        }

        set_progress(
            db_path,
            job_id,
            i as f64,
            total as f64,
            &format!("[{day}] 날짜별요약 생성 완료"),
        )?;
    }

    Ok(())
}

async fn refresh_day(
    db_path: &Path,
    job_id: &str,
    provider: &provider::LlmProvider,
    profile: &UserProfile,
    day: &str,
    force: bool,
    explicit_days: &[String],
) -> AppResult<()> {
    let (latest_summary_ts, overview_ts, summaries) = {
        let conn = db::open(db_path)?;
        (
            mail_repo::latest_summarized_at(&conn, day)?,
            mail_repo::daily_overview_updated_at(&conn, day)?,
            mail_repo::summaries_for_day(&conn, day)?,
        )
    };

    let fresh = is_fresh(latest_summary_ts.as_deref(), overview_ts.as_deref());
    let explicitly_requested = explicit_days.iter().any(|d| d == day);
    if fresh && !force && !explicitly_requested {
        add_event(db_path, job_id, EventLevel::Info, &format!("[{day}] 최신 상태라 건너뜀"))?;
        return Ok(());
    }
    if fresh {
        add_event(db_path, job_id, EventLevel::Info, &format!("[{day}] 강제 갱신 실행"))?;
    }

    if summaries.is_empty() {
        add_event(
            db_path,
            job_id,
            EventLevel::Info,
            &format!("[{day}] 요약 데이터가 없어 건너뜀"),
        )?;
        return Ok(());
    }

    let overview = synthesize_daily_overview(provider, day, &summaries, profile).await?;
    if overview.is_empty() {
        add_event(
            db_path,
            job_id,
            EventLevel::Warn,
            &format!("[{day}] 날짜별요약 생성 결과가 비어 있어 건너뜀"),
        )?;
        return Ok(());
    }

    let conn = db::open(db_path)?;
    mail_repo::set_daily_overview(&conn, day, &overview)?;
    Ok(())
}

/// Freshness gate: the overview is current when it postdates the newest
/// per-message summarization for the day
fn is_fresh(latest_summary_ts: Option<&str>, overview_ts: Option<&str>) -> bool {
    let (Some(summary_ts), Some(overview_ts)) = (latest_summary_ts, overview_ts) else {
        return false;
    };
    let (Ok(summary), Ok(overview)) = (
        DateTime::parse_from_rfc3339(summary_ts),
        DateTime::parse_from_rfc3339(overview_ts),
    ) else {
        return false;
    };
    overview >= summary
}

/// Keep only well-formed `YYYY-MM-DD` keys, deduplicated in order
fn normalize_days(raw: &[String]) -> Vec<String> {
    static DAY_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"^\d{4}-\d{2}-\d{2}$").expect("day regex"));
    let mut out: Vec<String> = Vec::new();
    for d in raw {
        let day = d.trim();
        if !DAY_RE.is_match(day) {
            continue;
        }
        if out.iter().any(|x| x == day) {
            continue;
        }
        out.push(day.to_owned());
    }
    out
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
    use super::{is_fresh, normalize_days};

    #[test]
    fn day_normalization_filters_and_dedupes() {
        let raw = vec![
            "2025-01-10".to_owned(),
            " 2025-01-11 ".to_owned(),
            "2025-01-10".to_owned(),
            "not-a-day".to_owned(),
            "2025-1-1".to_owned(),
        ];
        assert_eq!(normalize_days(&raw), vec!["2025-01-10", "2025-01-11"]);
    }

    #[test]
    fn freshness_requires_overview_at_or_after_latest_summary() {
        assert!(is_fresh(
            Some("2025-01-10T09:00:00+09:00"),
            Some("2025-01-10T10:00:00+09:00"),
        ));
        assert!(!is_fresh(
            Some("2025-01-10T11:00:00+09:00"),
            Some("2025-01-10T10:00:00+09:00"),
        ));
        assert!(!is_fresh(None, Some("2025-01-10T10:00:00+09:00")));
        assert!(!is_fresh(Some("2025-01-10T09:00:00+09:00"), None));
        assert!(!is_fresh(Some("garbage"), Some("2025-01-10T10:00:00+09:00")));
    }
}
