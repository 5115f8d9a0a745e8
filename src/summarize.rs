//! Long-document summarization orchestrator
//!
//! Short bodies go to the provider in one call; long bodies are split into
//! paragraph-packed chunks, mapped individually, and reduced with a
//! tier-specialized synthesis prompt. The final summary always carries the
//! two report sections `### 핵심 요약` and `### 상세 요약`. Daily overviews
//! are synthesized here as well, from a day's per-message summaries.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use crate::errors::AppResult;
use crate::provider::{LlmOutcome, Summarize, Tier};

/// Section header for the headline bullets
pub const CORE_SECTION: &str = "### 핵심 요약";
/// Section header for the detail bullets
pub const DETAIL_SECTION: &str = "### 상세 요약";

/// Chunking and cap configuration
#[derive(Debug, Clone)]
pub struct LongSummarizeConfig {
    /// Bodies longer than this (chars) are chunked
    pub chunk_if_over: usize,
    /// Target chunk size in chars; paragraph boundaries are respected
    pub chunk_chars: usize,
    /// Optional hard cap on the number of chunks
    pub max_chunks: Option<usize>,
    /// Cap on merged bullets in the fallback summary
    pub max_bullets: usize,
    /// Bullets recorded per part for the synthesis digest
    pub part_bullets: usize,
    pub max_tags: usize,
    pub max_backlinks: usize,
}

impl Default for LongSummarizeConfig {
    fn default() -> Self {
        Self {
            chunk_if_over: 4500,
            chunk_chars: 2400,
            max_chunks: None,
            max_bullets: 15,
            part_bullets: 5,
            max_tags: 10,
            max_backlinks: 10,
        }
    }
}

impl LongSummarizeConfig {
    /// Tier-aware thresholds
    ///
    /// Larger-context backends take bigger chunks: fewer calls and better
    /// global context.
    pub fn for_tier(tier: Tier) -> Self {
        let base = Self::default();
        match tier {
            Tier::Fast => base,
            Tier::Standard => Self {
                chunk_if_over: 6000,
                chunk_chars: 5000,
                ..base
            },
            Tier::Cloud => Self {
                chunk_if_over: 12_000,
                chunk_chars: 10_000,
                ..base
            },
        }
    }
}

/// Prompt-tailoring hints about the user
#[derive(Debug, Clone, Default)]
pub struct UserProfile {
    pub roles: Vec<String>,
    pub interests: String,
}

impl UserProfile {
    fn prompt_block(&self) -> String {
        if self.roles.is_empty() && self.interests.trim().is_empty() {
            return String::new();
        }
        format!(
            "\n[User Profile]\n- Role: {}\n- Interests: {}\n",
            self.roles.join(", "),
            self.interests
        )
    }
}

/// Callback invoked with overall progress in `[0, 1]`
pub type ProgressFn<'a> = &'a mut (dyn FnMut(f64) + Send);
/// Callback invoked with structured stage details
pub type DetailFn<'a> = &'a mut (dyn FnMut(&Value) + Send);

/// Summarize a message body, chunking when it exceeds the tier threshold
pub async fn summarize_long<S: Summarize>(
    provider: &S,
    subject: &str,
    body: &str,
    profile: &UserProfile,
    mut on_progress: Option<ProgressFn<'_>>,
    mut on_detail: Option<DetailFn<'_>>,
) -> AppResult<LlmOutcome> {
    let cfg = LongSummarizeConfig::for_tier(provider.tier());
    let body_len = body.chars().count();

    if body_len <= cfg.chunk_if_over {
        let mut outcome = provider.summarize(subject, body).await?;
        outcome.summary = normalize_sections(&outcome.summary);
        outcome.tags = dedupe_keep_order(&outcome.tags, cfg.max_tags);
        outcome.backlinks = dedupe_keep_order(&outcome.backlinks, cfg.max_backlinks);
        if let Some(f) = on_progress.as_deref_mut() {
            f(1.0);
        }
        return Ok(outcome);
    }

    let chunks = chunk_text(body, cfg.chunk_chars, cfg.max_chunks);
    if chunks.is_empty() {
        let clipped: String = body.chars().take(cfg.chunk_chars).collect();
        let mut outcome = provider.summarize(subject, &clipped).await?;
        outcome.summary = normalize_sections(&outcome.summary);
        return Ok(outcome);
    }

    let total_units = chunks.len() + 1;
    let mut all_bullets: Vec<String> = Vec::new();
    let mut digests: Vec<String> = Vec::new();
    let mut tags: Vec<String> = Vec::new();
    let mut backlinks: Vec<String> = Vec::new();
    let mut personal = false;

    for (idx, chunk) in chunks.iter().enumerate() {
        let i = idx + 1;
        if let Some(f) = on_detail.as_deref_mut() {
            f(&serde_json::json!({"type": "chunk", "index": i, "total": chunks.len()}));
        }

        let part_body = format!("[Part {i}/{}]\n{chunk}", chunks.len());
        let res = provider.summarize(subject, &part_body).await?;
        let part_bullets = extract_bullets(&res.summary);
        all_bullets.extend(part_bullets.iter().cloned());
        tags.extend(res.tags);
        backlinks.extend(res.backlinks);
        personal = personal || res.personal;

        let short = dedupe_keep_order(&part_bullets, cfg.part_bullets.max(1));
        if !short.is_empty() {
            digests.push(
                short
                    .iter()
                    .map(|b| format!("- {b}"))
                    .collect::<Vec<_>>()
                    .join("\n"),
            );
        }

        if let Some(f) = on_progress.as_deref_mut() {
            f(i as f64 / total_units as f64);
        }
    }

    if let Some(f) = on_detail.as_deref_mut() {
        f(&serde_json::json!({"type": "stage", "stage": "synthesis"}));
    }

    let synth_body = digests.join("\n\n---\n\n");
    let prompt = synthesis_prompt(provider.tier(), profile, &synth_body);
    let mut final_summary = String::new();
    match provider.summarize(subject, &prompt).await {
        Ok(synth) => {
            let raw = synth.summary.trim().to_owned();
            final_summary = if is_structured(&raw) {
                raw
            } else {
                extract_bullets(&raw)
                    .iter()
                    .map(|b| format!("- {b}"))
                    .collect::<Vec<_>>()
                    .join("\n")
            };
            tags.extend(synth.tags);
            backlinks.extend(synth.backlinks);
            personal = personal || synth.personal;
        }
        Err(_) => {
            // Synthesis failure falls back to the merged part bullets below.
        }
    }

    if let Some(f) = on_progress.as_deref_mut() {
        f(1.0);
    }

    if final_summary.is_empty() {
        let merged = dedupe_keep_order(&all_bullets, cfg.max_bullets);
        final_summary = merged
            .iter()
            .map(|b| format!("- {b}"))
            .collect::<Vec<_>>()
            .join("\n");
    }
    if final_summary.is_empty() {
        final_summary = "(no summary)".to_owned();
    }

    Ok(LlmOutcome {
        summary: normalize_sections(&final_summary),
        tags: dedupe_keep_order(&tags, cfg.max_tags),
        backlinks: dedupe_keep_order(&backlinks, cfg.max_backlinks),
        personal,
    })
}

/// Synthesize a one-day briefing from per-message summaries
///
/// Inputs are whitespace-normalized, deduplicated case-insensitively, and
/// capped (220 chars per item, 24 items, 8000 chars total) so the prompt
/// stays responsive on busy days. Failures yield an empty string; the
/// caller logs and moves on.
pub async fn synthesize_daily_overview<S: Summarize>(
    provider: &S,
    day: &str,
    summaries: &[String],
    profile: &UserProfile,
) -> AppResult<String> {
    const MAX_ITEMS: usize = 24;
    const MAX_ITEM_CHARS: usize = 220;
    const MAX_TOTAL_CHARS: usize = 8000;

    static WS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("ws regex"));

    let mut compact: Vec<String> = Vec::new();
    let mut seen: Vec<String> = Vec::new();
    let mut total = 0usize;
    for raw in summaries {
        let s = WS_RE.replace_all(raw.trim(), " ").into_owned();
        if s.is_empty() {
            continue;
        }
        let key = s.to_lowercase();
        if seen.contains(&key) {
            continue;
        }
        seen.push(key);

        let clipped: String = s.chars().take(MAX_ITEM_CHARS).collect();
        let clipped_len = clipped.chars().count();
        if !compact.is_empty() && total + clipped_len > MAX_TOTAL_CHARS {
            break;
        }
        compact.push(clipped);
        total += clipped_len;
        if compact.len() >= MAX_ITEMS {
            break;
        }
    }

    if compact.is_empty() {
        return Ok(String::new());
    }

    let profile_block = profile.prompt_block();
    let tailor = if profile_block.is_empty() {
        String::new()
    } else {
        format!("\n중요: 아래 사용자 프로필에 맞춰 맞춤형 브리핑을 작성하세요.{profile_block}")
    };
    let body = format!(
        "아래는 {day} 하루 동안 수신된 이메일 요약본들입니다.\n\
         이 내용들을 종합하여 사용자가 관심 있어 할 만한 주요 내용을 불릿 포인트로 요약하세요.\n\
         반드시 한국어로 작성하고, 각 항목은 뉴스 헤드라인처럼 핵심만 간결하게 표현하세요.\
         {tailor}\n\n요약 목록:\n{}",
        compact
            .iter()
            .map(|s| format!("- {s}"))
            .collect::<Vec<_>>()
            .join("\n")
    );

    let subject = format!("{day} Daily Overview");
    match provider.summarize(&subject, &body).await {
        Ok(res) => {
            let bullets = extract_bullets(&res.summary);
            Ok(bullets
                .iter()
                .map(|b| format!("- {b}"))
                .collect::<Vec<_>>()
                .join("\n")
                .trim()
                .to_owned())
        }
        Err(_) => Ok(String::new()),
    }
}

/// Tier-specialized Korean synthesis prompt for the reduce step
fn synthesis_prompt(tier: Tier, profile: &UserProfile, synth_body: &str) -> String {
    let profile_block = profile.prompt_block();
    let tailor = if profile_block.is_empty() {
        String::new()
    } else {
        format!(
            "\n중요: 아래 사용자 프로필에 맞춰 사용자가 특히 관심있어 할 내용을 강조하여 요약하세요.{profile_block}"
        )
    };

    let (system_role, guidelines) = match tier {
        Tier::Fast => (
            "뉴스레터를 요약하는 어시스턴트",
            "1. 핵심 요약: 가장 중요한 내용 3~5개를 불릿 포인트로 작성하세요.\n\
             2. 단순 구조: [주요 소식]과 같은 간단한 주제별로 그룹화하세요.\n\
             3. 노이즈 제거: 주소, 저작권, 구독 취소 안내 등은 무시하세요.\n\
             4. 반드시 한국어로만 작성하고 문장을 마침표로 끝내세요.",
        ),
        Tier::Cloud => (
            "전문적인 전략 분석가 및 수석 에디터",
            "1. BLUF (핵심 결론 우선): 최상단에 전체를 관통하는 인사이트를 [핵심 전략 결론]으로 작성하세요.\n\
             2. 심층 구조화: ### [주제별 분석] 머리말을 사용하여 논리적으로 섹션을 나누세요.\n\
             3. 데이터 밀도: 수치, 인물, 결정 사항을 포함하여 전문 리포트 수준의 풍부한 정보를 담으세요.\n\
             4. Smart Brevity: 각 섹션마다 'Why it matters'를 포함하여 가치가 높은 리포트를 작성하세요.\n\
             5. 반드시 한국어로만 격식 있는 문체로 작성하세요.",
        ),
        Tier::Standard => (
            "뉴스레터를 요약하는 전문 에디터",
            "1. BLUF (핵심 결론 우선): 최상단에 가장 중요한 결론을 [핵심 결론] 머리말과 함께 작성하세요.\n\
             2. 구조화: 관련 소식을 2~3개의 주제로 묶고 ### [주제명] 머리말을 사용하세요.\n\
             3. Smart Brevity: 주제 아래에 핵심 요지를 적고 상세 내용을 불릿으로 설명하세요.\n\
             4. 노이즈 제거: 주소, 저작권, 구독 취소 안내 등은 포함하지 마세요.\n\
             5. 반드시 한국어로 작성하고 모든 문장은 마침표(.)로 끝맺으세요.",
        ),
    };

    format!(
        "[System Role: {system_role}]\n아래 초안들을 바탕으로 최종 리포트를 작성하세요.\n\n\
         작성 지침:\n{guidelines}{tailor}\n\n요약 초안 목록:\n{synth_body}"
    )
}

/// Split text into paragraphs on blank lines, normalizing newlines
fn split_paragraphs(text: &str) -> Vec<String> {
    let s = text.replace("\r\n", "\n").replace('\r', "\n");
    let mut paras = Vec::new();
    let mut cur: Vec<&str> = Vec::new();
    for line in s.split('\n') {
        if line.trim().is_empty() {
            if !cur.is_empty() {
                paras.push(cur.join("\n").trim().to_owned());
                cur.clear();
            }
            continue;
        }
        cur.push(line);
    }
    if !cur.is_empty() {
        paras.push(cur.join("\n").trim().to_owned());
    }
    paras.retain(|p| !p.is_empty());
    paras
}

/// Greedily pack paragraphs into chunks of at most `chunk_chars` chars
///
/// A single paragraph longer than `2 * chunk_chars` is split hard at char
/// boundaries.
pub fn chunk_text(text: &str, chunk_chars: usize, max_chunks: Option<usize>) -> Vec<String> {
    let s = text.trim();
    if s.is_empty() {
        return Vec::new();
    }
    let at_cap = |chunks: &Vec<String>| max_chunks.is_some_and(|cap| chunks.len() >= cap);

    let paras = split_paragraphs(s);
    if paras.is_empty() {
        return vec![s.chars().take(chunk_chars).collect()];
    }

    let mut chunks: Vec<String> = Vec::new();
    let mut cur: Vec<String> = Vec::new();
    let mut cur_len = 0usize;

    'outer: for p in paras {
        let plen = p.chars().count();

        if plen > chunk_chars * 2 {
            if !cur.is_empty() {
                chunks.push(cur.join("\n\n"));
                cur.clear();
                cur_len = 0;
                if at_cap(&chunks) {
                    break 'outer;
                }
            }
            let cs: Vec<char> = p.chars().collect();
            for piece in cs.chunks(chunk_chars) {
                chunks.push(piece.iter().collect::<String>().trim().to_owned());
                if at_cap(&chunks) {
                    break 'outer;
                }
            }
            continue;
        }

        let sep = if cur.is_empty() { 0 } else { 2 };
        if cur_len + plen + sep > chunk_chars && !cur.is_empty() {
            chunks.push(cur.join("\n\n"));
            cur.clear();
            cur_len = 0;
            if at_cap(&chunks) {
                break 'outer;
            }
        }

        cur_len += plen + if cur.is_empty() { 0 } else { 2 };
        cur.push(p);
    }

    if !cur.is_empty() && !at_cap(&chunks) {
        chunks.push(cur.join("\n\n"));
    }
    chunks.retain(|c| !c.is_empty());
    chunks
}

/// Pull bullet lines out of provider prose
///
/// Handles leaked JSON lists, `**` emphasis markers, `·`/`•` bullets, and
/// clumped inline bullets. Falls back to `; `-separated phrases.
pub fn extract_bullets(summary: &str) -> Vec<String> {
    static INLINE_BULLET_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"\s+-\s+([A-Za-z가-힣0-9\[])").expect("inline regex"));
    static HEADER_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"^#{1,6}\s*").expect("header regex"));
    static LEAD_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"^[\s\-\*#]+").expect("lead regex"));
    static TAIL_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r#"["'\],]+$"#).expect("tail regex"));

    let s = summary.trim();
    if s.is_empty() {
        return Vec::new();
    }

    // Leaked JSON list output.
    if s.starts_with('[')
        && s.ends_with(']')
        && let Ok(items) = serde_json::from_str::<Vec<Value>>(s)
    {
        let out: Vec<String> = items
            .iter()
            .filter_map(Value::as_str)
            .map(str::trim)
            .filter(|x| !x.is_empty())
            .map(str::to_owned)
            .collect();
        if !out.is_empty() {
            return out;
        }
    }

    let s = s.replace("**", "");
    let s = s.replace('·', "-").replace('•', "-");
    let s = INLINE_BULLET_RE.replace_all(&s, "\n- $1").into_owned();

    let mut out = Vec::new();
    for raw_line in s.lines() {
        let line = raw_line.trim();
        if line.is_empty() {
            continue;
        }
        if line.starts_with("###") {
            let header = HEADER_RE.replace(line, "").trim().to_owned();
            if !header.is_empty() {
                out.push(header);
            }
            continue;
        }
        let clean = LEAD_RE.replace(line, "");
        let clean = TAIL_RE.replace(&clean, "").trim().to_owned();
        if clean.chars().count() > 1 {
            out.push(clean);
        }
    }

    if !out.is_empty() {
        return out;
    }
    if s.contains("; ") {
        return s
            .split("; ")
            .map(str::trim)
            .filter(|x| !x.is_empty())
            .map(str::to_owned)
            .collect();
    }
    Vec::new()
}

/// Order-preserving case-insensitive dedup, capped at `max`
pub fn dedupe_keep_order(items: &[String], max: usize) -> Vec<String> {
    let mut seen: Vec<String> = Vec::new();
    let mut out = Vec::new();
    for item in items {
        let k = item.trim();
        if k.is_empty() {
            continue;
        }
        let lk = k.to_lowercase();
        if seen.contains(&lk) {
            continue;
        }
        seen.push(lk);
        out.push(k.to_owned());
        if out.len() >= max {
            break;
        }
    }
    out
}

/// Whether provider output already carries report structure
fn is_structured(text: &str) -> bool {
    let s = text.trim();
    s.contains("###") || s.matches("\n\n").count() >= 2
}

/// Coerce a summary into the two-section report shape
///
/// Output already carrying both section headers passes through untouched,
/// which makes the normalization idempotent. Otherwise the first bullets
/// become the headline section (at most 5) and the remainder the detail
/// section (at most 7).
pub fn normalize_sections(summary: &str) -> String {
    let s = summary.trim();
    if s.contains(CORE_SECTION) && s.contains(DETAIL_SECTION) {
        // Already in report shape; bold markers still get scrubbed so the
        // UI never renders raw emphasis markup.
        return s.replace("**", "");
    }

    let mut bullets = extract_bullets(s);
    if bullets.is_empty() {
        bullets = vec![if s.is_empty() {
            "(no summary)".to_owned()
        } else {
            s.to_owned()
        }];
    }

    let core: Vec<&String> = bullets.iter().take(5).collect();
    let rest: Vec<&String> = bullets.iter().skip(5).take(7).collect();
    let detail = if rest.is_empty() { core.clone() } else { rest };

    let core_lines = core
        .iter()
        .map(|b| format!("- {b}"))
        .collect::<Vec<_>>()
        .join("\n");
    let detail_lines = detail
        .iter()
        .map(|b| format!("- {b}"))
        .collect::<Vec<_>>()
        .join("\n");

    format!("{CORE_SECTION}\n{core_lines}\n\n{DETAIL_SECTION}\n{detail_lines}")
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use crate::errors::AppResult;
    use crate::provider::{LlmOutcome, Summarize, Tier};

    use super::{
        CORE_SECTION, DETAIL_SECTION, LongSummarizeConfig, UserProfile, chunk_text,
        dedupe_keep_order, extract_bullets, normalize_sections, summarize_long,
        synthesize_daily_overview,
    };

    /// Scripted provider that records calls and returns canned bullets
    struct Scripted {
        tier: Tier,
        calls: Mutex<Vec<(String, String)>>,
        tags: Vec<String>,
    }

    impl Scripted {
        fn new(tier: Tier) -> Self {
            Self {
                tier,
                calls: Mutex::new(Vec::new()),
                tags: vec!["tag".to_owned()],
            }
        }

        fn call_count(&self) -> usize {
            self.calls.lock().expect("lock").len()
        }

        fn bodies(&self) -> Vec<String> {
            self.calls
                .lock()
                .expect("lock")
                .iter()
                .map(|(_, b)| b.clone())
                .collect()
        }
    }

    impl Summarize for Scripted {
        fn tier(&self) -> Tier {
            self.tier
        }

        async fn summarize(&self, subject: &str, body: &str) -> AppResult<LlmOutcome> {
            self.calls
                .lock()
                .expect("lock")
                .push((subject.to_owned(), body.to_owned()));
            Ok(LlmOutcome {
                summary: "- 첫 번째 요점\n- 두 번째 요점".to_owned(),
                tags: self.tags.clone(),
                backlinks: vec!["주제".to_owned()],
                personal: false,
            })
        }
    }

    fn long_body(total_chars: usize) -> String {
        let para = "가나다라마바사아자차카타파하 ".repeat(20); // ~300 chars
        let mut out = String::new();
        while out.chars().count() < total_chars {
            out.push_str(para.trim_end());
            out.push_str("\n\n");
        }
        out
    }

    #[tokio::test]
    async fn short_body_uses_a_single_call() {
        let provider = Scripted::new(Tier::Standard);
        let out = summarize_long(&provider, "S", "short body", &UserProfile::default(), None, None)
            .await
            .expect("summarize");
        assert_eq!(provider.call_count(), 1);
        assert!(out.summary.contains(CORE_SECTION));
        assert!(out.summary.contains(DETAIL_SECTION));
    }

    #[tokio::test]
    async fn long_body_maps_chunks_then_reduces() {
        let provider = Scripted::new(Tier::Standard);
        let body = long_body(15_000);
        let expected_chunks = chunk_text(&body, 5000, None).len();

        let mut fractions: Vec<f64> = Vec::new();
        let mut details: Vec<String> = Vec::new();
        let out = summarize_long(
            &provider,
            "S",
            &body,
            &UserProfile::default(),
            Some(&mut |f| fractions.push(f)),
            Some(&mut |d: &serde_json::Value| {
                details.push(d["type"].as_str().unwrap_or("").to_owned());
            }),
        )
        .await
        .expect("summarize");

        // One call per chunk plus the synthesis call.
        assert_eq!(provider.call_count(), expected_chunks + 1);
        assert_eq!(fractions.len(), expected_chunks + 1);
        assert!((fractions[0] - 1.0 / (expected_chunks as f64 + 1.0)).abs() < 1e-9);
        assert_eq!(*fractions.last().expect("last"), 1.0);
        assert_eq!(details.iter().filter(|d| *d == "chunk").count(), expected_chunks);
        assert!(details.iter().any(|d| d == "stage"));

        let bodies = provider.bodies();
        assert!(bodies[0].starts_with("[Part 1/"));
        assert!(bodies.last().expect("synth").contains("요약 초안 목록"));

        assert!(out.summary.contains(CORE_SECTION));
        assert!(!out.summary.contains("**"));
    }

    #[tokio::test]
    async fn tags_and_backlinks_are_deduped_and_capped() {
        struct ManyTags;
        impl Summarize for ManyTags {
            fn tier(&self) -> Tier {
                Tier::Fast
            }
            async fn summarize(&self, _s: &str, _b: &str) -> AppResult<LlmOutcome> {
                Ok(LlmOutcome {
                    summary: "- point".to_owned(),
                    tags: (0..20).map(|i| format!("tag{i}")).collect(),
                    backlinks: vec!["A".to_owned(), "a".to_owned(), "B".to_owned()],
                    personal: true,
                })
            }
        }
        let out = summarize_long(&ManyTags, "S", "x", &UserProfile::default(), None, None)
            .await
            .expect("summarize");
        assert_eq!(out.tags.len(), 10);
        assert_eq!(out.backlinks, vec!["A", "B"]);
        assert!(out.personal);
    }

    #[test]
    fn chunking_packs_paragraphs_within_budget() {
        let body = long_body(12_000);
        let chunks = chunk_text(&body, 2400, None);
        assert!(chunks.len() >= 5);
        for c in &chunks {
            assert!(c.chars().count() <= 2400, "chunk too large");
        }
    }

    #[test]
    fn oversized_paragraph_is_hard_split() {
        let huge = "가".repeat(6000);
        let chunks = chunk_text(&huge, 1000, None);
        assert_eq!(chunks.len(), 6);
        assert!(chunks.iter().all(|c| c.chars().count() <= 1000));
    }

    #[test]
    fn max_chunks_caps_the_split() {
        let body = long_body(20_000);
        let chunks = chunk_text(&body, 1000, Some(3));
        assert_eq!(chunks.len(), 3);
    }

    #[test]
    fn bullets_survive_markdown_noise() {
        let text = "### 핵심\n- **중요** 항목\n• 두 번째\n· 세 번째";
        let bullets = extract_bullets(text);
        assert_eq!(bullets, vec!["핵심", "중요 항목", "두 번째", "세 번째"]);
    }

    #[test]
    fn json_list_and_semicolon_fallbacks() {
        assert_eq!(
            extract_bullets(r#"["하나", "둘"]"#),
            vec!["하나", "둘"]
        );
        assert_eq!(
            extract_bullets("첫 항목; 둘째 항목; 셋째"),
            vec!["첫 항목; 둘째 항목; 셋째"]
        );
    }

    #[test]
    fn dedupe_is_case_insensitive_and_ordered() {
        let items = vec![
            "Rust".to_owned(),
            "rust".to_owned(),
            "AI".to_owned(),
            "".to_owned(),
        ];
        assert_eq!(dedupe_keep_order(&items, 10), vec!["Rust", "AI"]);
        assert_eq!(dedupe_keep_order(&items, 1), vec!["Rust"]);
    }

    #[test]
    fn normalized_output_is_stable_under_renormalization() {
        let raw = "- 첫째 항목\n- 둘째 항목\n- 셋째 항목\n- 넷째 항목\n- 다섯째 항목\n- 여섯째 항목\n- 일곱째 항목";
        let once = normalize_sections(raw);
        assert!(once.starts_with(CORE_SECTION));
        assert!(once.contains(DETAIL_SECTION));
        // Headline section takes the first five bullets, detail the rest.
        let detail_part = once.split(DETAIL_SECTION).nth(1).expect("detail section");
        assert!(detail_part.contains("여섯째 항목"));
        assert!(!detail_part.contains("첫째 항목"));
        let twice = normalize_sections(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn tier_table_matches_design() {
        assert_eq!(LongSummarizeConfig::for_tier(Tier::Fast).chunk_chars, 2400);
        assert_eq!(LongSummarizeConfig::for_tier(Tier::Standard).chunk_chars, 5000);
        assert_eq!(LongSummarizeConfig::for_tier(Tier::Cloud).chunk_if_over, 12_000);
    }

    #[tokio::test]
    async fn daily_overview_dedupes_and_caps_input() {
        let provider = Scripted::new(Tier::Standard);
        let mut summaries = vec!["  같은  내용 ".to_owned(), "같은 내용".to_owned()];
        for i in 0..40 {
            summaries.push(format!("항목 {i} ").repeat(40));
        }
        let overview = synthesize_daily_overview(
            &provider,
            "2025-01-10",
            &summaries,
            &UserProfile {
                roles: vec!["연구원".to_owned()],
                interests: "AI".to_owned(),
            },
        )
        .await
        .expect("overview");

        assert!(overview.starts_with("- "));
        let bodies = provider.bodies();
        assert_eq!(bodies.len(), 1);
        assert!(bodies[0].contains("2025-01-10"));
        assert!(bodies[0].contains("[User Profile]"));
        // Dedup collapsed the duplicate first item.
        assert_eq!(bodies[0].matches("같은 내용").count(), 1);
    }

    #[tokio::test]
    async fn daily_overview_with_no_input_is_empty() {
        let provider = Scripted::new(Tier::Standard);
        let overview = synthesize_daily_overview(
            &provider,
            "2025-01-10",
            &[],
            &UserProfile::default(),
        )
        .await
        .expect("overview");
        assert!(overview.is_empty());
        assert_eq!(provider.call_count(), 0);
    }
}
