//! Markdown vault exporter
//!
//! Projects archived messages into a plain-text knowledge vault: one note
//! per email under `Mail/<YYYY-MM>/`, a daily digest under `Daily/`, topic
//! hubs under `Topic/`, copied assets under `Assets/<key>/`, and the raw
//! envelope under `Raw/`. Notes are derived data; every write overwrites
//! atomically and can be regenerated from the archive at any time.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;

use crate::atomic_io::atomic_write_text;
use crate::errors::AppResult;

/// Input for one email note
#[derive(Debug, Clone)]
pub struct MessageExport {
    /// Stable key: `<account>-<uidvalidity>-<uid>`
    pub message_key: String,
    pub date: NaiveDate,
    pub sender: String,
    pub subject: String,
    pub summary: String,
    pub tags: Vec<String>,
    pub topics: Vec<String>,
    /// Archive directory whose assets are copied into the vault
    pub archive_dir: PathBuf,
}

/// Write one email note and copy its assets into the vault
pub fn export_email_note(vault_root: &Path, inp: &MessageExport) -> AppResult<PathBuf> {
    let mail_dir = vault_root.join("Mail").join(inp.date.format("%Y-%m").to_string());
    let assets_dir = vault_root.join("Assets").join(&inp.message_key);
    let raw_dir = vault_root.join("Raw");
    fs::create_dir_all(&mail_dir)?;
    fs::create_dir_all(&assets_dir)?;
    fs::create_dir_all(&raw_dir)?;

    for name in ["rendered.html", "body.html", "body.txt"] {
        let src = inp.archive_dir.join(name);
        if src.is_file() {
            fs::copy(&src, assets_dir.join(name))?;
        }
    }
    copy_tree(&inp.archive_dir.join("attachments"), &assets_dir.join("attachments"))?;
    copy_tree(&inp.archive_dir.join("external"), &assets_dir.join("external"))?;

    let raw_src = inp.archive_dir.join("raw.eml");
    if raw_src.is_file() {
        fs::copy(&raw_src, raw_dir.join(format!("{}.eml", inp.message_key)))?;
    }

    let tags: Vec<String> = inp
        .tags
        .iter()
        .map(|t| t.trim().trim_start_matches('#').to_owned())
        .filter(|t| !t.is_empty())
        .collect();
    let topics: Vec<String> = inp
        .topics
        .iter()
        .filter(|t| !t.trim().is_empty())
        .map(|t| safe_topic_name(t))
        .collect();

    let mut front = vec![
        "---".to_owned(),
        format!("title: {}", inp.subject),
        format!("date: {}", inp.date.format("%Y-%m-%d")),
        format!("sender: {}", inp.sender),
        format!("message_key: {}", inp.message_key),
        "tags:".to_owned(),
    ];
    for t in &tags {
        front.push(format!("  - {t}"));
    }
    front.push("topics:".to_owned());
    for t in &topics {
        front.push(format!("  - {t}"));
    }
    front.push("---".to_owned());

    let daily_link = format!("[[Daily/{}]]", inp.date.format("%Y-%m-%d"));
    let topic_links = topics
        .iter()
        .map(|t| format!("[[Topic/{t}]]"))
        .collect::<Vec<_>>()
        .join(" ");

    let mut body = front.join("\n");
    body.push_str("\n\n");
    body.push_str(&format!("{daily_link} {topic_links}\n\n"));
    body.push_str("## 핵심 요약 / 상세 요약\n\n");
    let summary = inp.summary.trim();
    body.push_str(if summary.is_empty() { "(no summary)" } else { summary });
    body.push_str("\n\n## Original\n\n");
    body.push_str(&format!(
        "- Rendered HTML: [[Assets/{}/rendered.html]]\n",
        inp.message_key
    ));
    body.push_str(&format!("- Raw EML: [[Raw/{}.eml]]\n", inp.message_key));

    // Inline image embeds, best-effort.
    let attach_dir = assets_dir.join("attachments");
    if attach_dir.is_dir() {
        let mut images: Vec<String> = fs::read_dir(&attach_dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|name| {
                let lower = name.to_lowercase();
                [".png", ".jpg", ".jpeg", ".gif", ".webp"]
                    .iter()
                    .any(|ext| lower.ends_with(ext))
            })
            .collect();
        images.sort();
        if !images.is_empty() {
            body.push_str("\n## Images\n\n");
            for name in images.iter().take(20) {
                body.push_str(&format!(
                    "![[Assets/{}/attachments/{name}]]\n",
                    inp.message_key
                ));
            }
        }
    }

    let filename = format!(
        "{} - {}.md",
        inp.date.format("%Y-%m-%d"),
        safe_filename(&inp.subject)
    );
    let out_path = mail_dir.join(filename);
    atomic_write_text(&out_path, &body)?;
    Ok(out_path)
}

/// Write the daily digest note linking to the day's message notes
pub fn export_daily_note(
    vault_root: &Path,
    date: NaiveDate,
    message_notes: &[PathBuf],
    daily_summary: &str,
) -> AppResult<PathBuf> {
    let daily_dir = vault_root.join("Daily");
    fs::create_dir_all(&daily_dir)?;
    let out_path = daily_dir.join(format!("{}.md", date.format("%Y-%m-%d")));

    let mut body = format!("---\ndate: {}\n---\n\n", date.format("%Y-%m-%d"));
    body.push_str("## Daily Digest\n\n");
    let digest = daily_summary.trim();
    body.push_str(if digest.is_empty() { "(no digest)" } else { digest });
    body.push_str("\n\n## Messages\n\n");
    for note in message_notes {
        body.push_str(&format!("- {}\n", wikilink_for(vault_root, note)));
    }
    atomic_write_text(&out_path, &body)?;
    Ok(out_path)
}

/// Write a topic hub note linking to its message notes
pub fn export_topic_note(
    vault_root: &Path,
    topic: &str,
    message_notes: &[PathBuf],
) -> AppResult<PathBuf> {
    let topic_dir = vault_root.join("Topic");
    fs::create_dir_all(&topic_dir)?;
    let name = safe_topic_name(topic);
    let out_path = topic_dir.join(format!("{name}.md"));

    let mut body = format!("---\ntopic: {name}\n---\n\n## Messages\n\n");
    for note in message_notes {
        body.push_str(&format!("- {}\n", wikilink_for(vault_root, note)));
    }
    atomic_write_text(&out_path, &body)?;
    Ok(out_path)
}

/// Vault-relative wikilink for a note path
fn wikilink_for(vault_root: &Path, note_path: &Path) -> String {
    let rel = note_path
        .strip_prefix(vault_root)
        .unwrap_or(note_path)
        .to_string_lossy()
        .replace('\\', "/");
    let trimmed = rel.strip_suffix(".md").unwrap_or(&rel);
    format!("[[{trimmed}]]")
}

fn copy_tree(src: &Path, dst: &Path) -> AppResult<()> {
    if !src.exists() {
        return Ok(());
    }
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_tree(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Note filename from a subject: reserved characters replaced, length capped
pub fn safe_filename(text: &str) -> String {
    let replaced: String = text
        .trim()
        .chars()
        .map(|c| match c {
            '\\' | '/' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '-',
            other => other,
        })
        .collect();
    let collapsed = replaced.split_whitespace().collect::<Vec<_>>().join(" ");
    let mut out = if collapsed.is_empty() {
        "(no subject)".to_owned()
    } else {
        collapsed
    };
    if out.chars().count() > 120 {
        out = out.chars().take(120).collect::<String>().trim_end().to_owned();
    }
    out
}

/// Topic note name: like filenames, plus surrounding brackets stripped
pub fn safe_topic_name(text: &str) -> String {
    let stripped = text.trim().trim_matches(['[', ']']);
    let replaced: String = stripped
        .chars()
        .map(|c| match c {
            '\\' | '/' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '-',
            other => other,
        })
        .collect();
    let collapsed = replaced.split_whitespace().collect::<Vec<_>>().join(" ");
    let mut out = if collapsed.is_empty() {
        "Topic".to_owned()
    } else {
        collapsed
    };
    if out.chars().count() > 80 {
        out = out.chars().take(80).collect::<String>().trim_end().to_owned();
    }
    out
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::{
        MessageExport, export_daily_note, export_email_note, export_topic_note, safe_filename,
        safe_topic_name,
    };

    fn sample_export(archive_dir: std::path::PathBuf) -> MessageExport {
        MessageExport {
            message_key: "user@example.com-7-42".to_owned(),
            date: NaiveDate::from_ymd_opt(2025, 1, 10).expect("date"),
            sender: "alice@example.com".to_owned(),
            subject: "주간 소식".to_owned(),
            summary: "### 핵심 요약\n- 요점".to_owned(),
            tags: vec!["#뉴스".to_owned(), "ai".to_owned()],
            topics: vec!["[연구]".to_owned()],
            archive_dir,
        }
    }

    #[test]
    fn email_note_copies_assets_and_links_everything() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let vault = tmp.path().join("vault");
        let archive = tmp.path().join("archive");
        std::fs::create_dir_all(archive.join("attachments")).expect("mkdir");
        std::fs::write(archive.join("raw.eml"), b"raw").expect("write");
        std::fs::write(archive.join("rendered.html"), b"<p>x</p>").expect("write");
        std::fs::write(archive.join("attachments").join("img1.png"), b"png").expect("write");

        let note = export_email_note(&vault, &sample_export(archive)).expect("export");
        assert!(note.ends_with("Mail/2025-01/2025-01-10 - 주간 소식.md"));

        let text = std::fs::read_to_string(&note).expect("read");
        assert!(text.contains("[[Daily/2025-01-10]]"));
        assert!(text.contains("[[Topic/연구]]"));
        assert!(text.contains("  - 뉴스"));
        assert!(text.contains("![[Assets/user@example.com-7-42/attachments/img1.png]]"));

        assert!(vault.join("Raw/user@example.com-7-42.eml").is_file());
        assert!(vault
            .join("Assets/user@example.com-7-42/attachments/img1.png")
            .is_file());
        assert!(vault.join("Assets/user@example.com-7-42/rendered.html").is_file());
    }

    #[test]
    fn reexport_overwrites_the_same_note() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let vault = tmp.path().join("vault");
        let archive = tmp.path().join("archive");
        std::fs::create_dir_all(&archive).expect("mkdir");

        let mut inp = sample_export(archive);
        let first = export_email_note(&vault, &inp).expect("export");
        inp.summary = "- 갱신된 요약".to_owned();
        let second = export_email_note(&vault, &inp).expect("export");
        assert_eq!(first, second);
        let text = std::fs::read_to_string(&second).expect("read");
        assert!(text.contains("갱신된 요약"));
    }

    #[test]
    fn daily_note_lists_wikilinks_without_md_suffix() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let vault = tmp.path().to_path_buf();
        let date = NaiveDate::from_ymd_opt(2025, 1, 10).expect("date");
        let notes = vec![vault.join("Mail/2025-01/2025-01-10 - note.md")];

        let daily = export_daily_note(&vault, date, &notes, "- digest line").expect("daily");
        let text = std::fs::read_to_string(&daily).expect("read");
        assert!(text.contains("- digest line"));
        assert!(text.contains("[[Mail/2025-01/2025-01-10 - note]]"));
    }

    #[test]
    fn topic_note_uses_sanitized_topic_name() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let vault = tmp.path().to_path_buf();
        let out = export_topic_note(&vault, "[AI/ML]", &[]).expect("topic");
        assert!(out.ends_with("Topic/AI-ML.md"));
    }

    #[test]
    fn filename_sanitization_handles_reserved_characters() {
        assert_eq!(safe_filename("re: what?"), "re- what-");
        assert_eq!(safe_filename("   "), "(no subject)");
        assert_eq!(safe_filename(&"긴".repeat(200)).chars().count(), 120);
        assert_eq!(safe_topic_name("[주제]"), "주제");
        assert_eq!(safe_topic_name(""), "Topic");
    }
}
