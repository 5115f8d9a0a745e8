//! Per-message archive pipeline
//!
//! Composes decomposition, attachment extraction, and HTML rewriting into a
//! self-contained artifact directory: `raw.eml`, optional `body.txt` /
//! `body.html`, the sanitized `rendered.html`, plus `attachments/` and
//! `external/`. Every write is atomic; a crash mid-step leaves the previous
//! version intact and the message re-runnable.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::atomic_io::{atomic_write_bytes, atomic_write_text};
use crate::errors::AppResult;
use crate::html::{AssetStore, rewrite_refs, sanitize_html};
use crate::mail_repo::{AttachmentRecord, ExternalAssetRecord};
use crate::mime::{self, MailHeaders};
use crate::paths::MessagePaths;

/// Everything the index stage needs after a successful archive
#[derive(Debug)]
pub struct ArchiveOutcome {
    pub headers: MailHeaders,
    pub raw_eml_path: PathBuf,
    pub body_text_path: Option<PathBuf>,
    pub body_html_path: Option<PathBuf>,
    pub rendered_html_path: Option<PathBuf>,
    pub attachments: Vec<AttachmentRecord>,
    pub external_assets: Vec<ExternalAssetRecord>,
}

/// Archive one raw RFC822 message into its directory
pub async fn archive_message(
    raw: &[u8],
    paths: &MessagePaths,
    external_max_bytes: u64,
) -> AppResult<ArchiveOutcome> {
    atomic_write_bytes(&paths.raw_eml(), raw)?;

    let mail = mime::decompose(raw)?;

    let (attachments, cid_map) = store_attachments(&mail.attachments, &paths.attachments_dir())?;

    let mut body_text_path = None;
    if let Some(text) = &mail.body_text {
        let p = paths.body_text();
        atomic_write_text(&p, text)?;
        body_text_path = Some(p);
    }

    let mut body_html_path = None;
    let mut rendered_html_path = None;
    let mut external_assets = Vec::new();
    if let Some(html) = &mail.body_html {
        let p = paths.body_html();
        atomic_write_text(&p, html)?;
        body_html_path = Some(p);

        let mut store = AssetStore::new(&paths.external_dir(), external_max_bytes);
        let rewritten = rewrite_refs(html, &cid_map, &mut store).await;
        external_assets = store.into_records();

        let sanitized = sanitize_html(&rewritten);
        let rendered = paths.rendered_html();
        atomic_write_text(&rendered, &sanitized)?;
        rendered_html_path = Some(rendered);
    }

    Ok(ArchiveOutcome {
        headers: mail.headers,
        raw_eml_path: paths.raw_eml(),
        body_text_path,
        body_html_path,
        rendered_html_path,
        attachments,
        external_assets,
    })
}

/// Write attachment payloads and build the cid → rel-path map
///
/// Filename collisions within one message get `_1`, `_2`, … suffixes.
fn store_attachments(
    parts: &[mime::AttachmentPart],
    out_dir: &Path,
) -> AppResult<(Vec<AttachmentRecord>, HashMap<String, String>)> {
    let mut records = Vec::new();
    let mut cid_map = HashMap::new();
    let mut used: Vec<String> = Vec::new();

    for part in parts {
        let name = unique_name(&part.filename, &used);
        used.push(name.clone());

        let path = out_dir.join(&name);
        atomic_write_bytes(&path, &part.data)?;
        let rel = format!("attachments/{name}");

        if let Some(cid) = &part.content_id {
            cid_map.insert(cid.clone(), rel.clone());
        }

        records.push(AttachmentRecord {
            filename: name,
            mime_type: Some(part.mime_type.clone()),
            size_bytes: part.data.len() as u64,
            rel_path: rel,
            content_id: part.content_id.clone(),
            is_inline: part.is_inline,
        });
    }

    Ok((records, cid_map))
}

fn unique_name(candidate: &str, used: &[String]) -> String {
    if !used.iter().any(|u| u == candidate) {
        return candidate.to_owned();
    }
    let (stem, suffix) = match candidate.rfind('.') {
        Some(dot) if dot > 0 => (&candidate[..dot], &candidate[dot..]),
        _ => (candidate, ""),
    };
    let mut i = 1;
    loop {
        let next = format!("{stem}_{i}{suffix}");
        if !used.iter().any(|u| u == &next) {
            return next;
        }
        i += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::{archive_message, unique_name};
    use crate::paths::message_paths;

    fn inline_image_message() -> Vec<u8> {
        let mut raw = String::new();
        raw.push_str("From: alice@example.com\r\n");
        raw.push_str("To: user@example.com\r\n");
        raw.push_str("Subject: Inline image\r\n");
        raw.push_str("Date: Fri, 10 Jan 2025 09:30:00 +0900\r\n");
        raw.push_str("MIME-Version: 1.0\r\n");
        raw.push_str("Content-Type: multipart/related; boundary=\"B\"\r\n\r\n");
        raw.push_str("--B\r\n");
        raw.push_str("Content-Type: text/html; charset=utf-8\r\n\r\n");
        raw.push_str("<html><body><img src=\"cid:img1\"></body></html>\r\n");
        raw.push_str("--B\r\n");
        raw.push_str("Content-Type: image/png; name=\"img1.png\"\r\n");
        raw.push_str("Content-ID: <img1>\r\n");
        raw.push_str("Content-Transfer-Encoding: base64\r\n");
        raw.push_str("Content-Disposition: inline; filename=\"img1.png\"\r\n\r\n");
        raw.push_str("iVBORw0KGgo=\r\n");
        raw.push_str("--B--\r\n");
        raw.into_bytes()
    }

    #[tokio::test]
    async fn inline_image_archive_produces_all_artifacts() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let paths = message_paths(tmp.path(), "user@example.com", "INBOX", 1, 42).expect("paths");

        let raw = inline_image_message();
        let outcome = archive_message(&raw, &paths, 1024).await.expect("archive");

        assert_eq!(std::fs::read(paths.raw_eml()).expect("raw"), raw);
        assert!(paths.body_html().is_file());
        assert!(paths.attachments_dir().join("img1.png").is_file());

        let rendered = std::fs::read_to_string(paths.rendered_html()).expect("rendered");
        assert!(rendered.contains(r#"src="attachments/img1.png""#));

        assert_eq!(outcome.attachments.len(), 1);
        assert_eq!(outcome.attachments[0].rel_path, "attachments/img1.png");
        assert!(outcome.attachments[0].is_inline);
        assert!(outcome.external_assets.is_empty());
        assert_eq!(outcome.headers.subject.as_deref(), Some("Inline image"));
    }

    #[tokio::test]
    async fn rearchiving_same_input_is_byte_identical_and_rendered_is_stable() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let paths = message_paths(tmp.path(), "user@example.com", "INBOX", 1, 42).expect("paths");
        let raw = inline_image_message();

        archive_message(&raw, &paths, 1024).await.expect("first");
        let raw_first = std::fs::read(paths.raw_eml()).expect("read");
        let rendered_first = std::fs::read(paths.rendered_html()).expect("read");

        archive_message(&raw, &paths, 1024).await.expect("second");
        assert_eq!(std::fs::read(paths.raw_eml()).expect("read"), raw_first);
        assert_eq!(
            std::fs::read(paths.rendered_html()).expect("read"),
            rendered_first
        );
    }

    #[tokio::test]
    async fn private_asset_reference_is_recorded_but_never_fetched() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let paths = message_paths(tmp.path(), "user@example.com", "INBOX", 1, 7).expect("paths");

        let raw = b"From: a@b.c\r\nSubject: S\r\nMIME-Version: 1.0\r\n\
Content-Type: text/html; charset=utf-8\r\n\r\n\
<img src=\"http://127.0.0.1:8080/x.png\">\r\n"
            .to_vec();

        let outcome = archive_message(&raw, &paths, 1024).await.expect("archive");
        assert_eq!(outcome.external_assets.len(), 1);
        assert!(outcome.external_assets[0].status.starts_with("blocked:"));

        let rendered = std::fs::read_to_string(paths.rendered_html()).expect("rendered");
        assert!(rendered.contains("http://127.0.0.1:8080/x.png"));

        let external_entries: Vec<_> = std::fs::read_dir(paths.external_dir())
            .expect("read_dir")
            .collect();
        assert!(external_entries.is_empty());
    }

    #[tokio::test]
    async fn text_only_message_skips_html_artifacts() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let paths = message_paths(tmp.path(), "u@h", "INBOX", 1, 3).expect("paths");
        let raw = b"From: a@b.c\r\nSubject: Plain\r\n\r\njust text".to_vec();

        let outcome = archive_message(&raw, &paths, 1024).await.expect("archive");
        assert!(outcome.body_text_path.is_some());
        assert!(outcome.body_html_path.is_none());
        assert!(outcome.rendered_html_path.is_none());
        assert_eq!(
            std::fs::read_to_string(paths.body_text()).expect("body"),
            "just text"
        );
    }

    #[test]
    fn name_collisions_get_numeric_suffixes() {
        let used = vec!["a.png".to_owned(), "a_1.png".to_owned()];
        assert_eq!(unique_name("a.png", &used), "a_2.png");
        assert_eq!(unique_name("b.png", &used), "b.png");
        assert_eq!(unique_name("noext", &["noext".to_owned()]), "noext_1");
    }
}
