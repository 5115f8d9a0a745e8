//! RFC822 decomposition
//!
//! Walks the MIME part tree with `mailparse`, picking the first `text/plain`
//! and first `text/html` leaves as body candidates and treating everything
//! else as an attachment. Charset decoding uses replacement, a broken part
//! never aborts the message.

use mailparse::{DispositionType, ParsedMail};

use crate::errors::{AppError, AppResult};

/// Headers the index cares about, decoded for display
#[derive(Debug, Clone, Default)]
pub struct MailHeaders {
    pub message_id: Option<String>,
    pub date: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub subject: Option<String>,
}

/// One non-body MIME part with its decoded payload
#[derive(Debug, Clone)]
pub struct AttachmentPart {
    /// Sanitized filename (collision suffixes are applied by the archiver)
    pub filename: String,
    pub mime_type: String,
    pub content_id: Option<String>,
    pub is_inline: bool,
    pub data: Vec<u8>,
}

/// Full decomposition of one raw message
#[derive(Debug, Clone)]
pub struct DecomposedMail {
    pub headers: MailHeaders,
    pub body_text: Option<String>,
    pub body_html: Option<String>,
    pub attachments: Vec<AttachmentPart>,
}

/// Parse and decompose a raw RFC822 message
pub fn decompose(raw: &[u8]) -> AppResult<DecomposedMail> {
    let parsed = mailparse::parse_mail(raw)
        .map_err(|e| AppError::Internal(format!("failed to parse RFC822 message: {e}")))?;

    let headers = read_headers(&parsed);
    let mut body_text = None;
    let mut body_html = None;
    let mut attachments = Vec::new();
    let mut part_counter = 1usize;

    walk(
        &parsed,
        &mut body_text,
        &mut body_html,
        &mut attachments,
        &mut part_counter,
    );

    Ok(DecomposedMail {
        headers,
        body_text,
        body_html,
        attachments,
    })
}

/// Decode just the headers of a raw message
///
/// Cheaper than [`decompose`] when only progress labels and index fields
/// are needed before the archive stage runs.
pub fn parse_headers(raw: &[u8]) -> AppResult<MailHeaders> {
    let parsed = mailparse::parse_mail(raw)
        .map_err(|e| AppError::Internal(format!("failed to parse message headers: {e}")))?;
    Ok(read_headers(&parsed))
}

fn read_headers(parsed: &ParsedMail<'_>) -> MailHeaders {
    let first = |name: &str| -> Option<String> {
        parsed
            .headers
            .iter()
            .find(|h| h.get_key_ref().eq_ignore_ascii_case(name))
            .map(|h| h.get_value())
            .filter(|v| !v.trim().is_empty())
    };
    MailHeaders {
        message_id: first("Message-ID"),
        date: first("Date"),
        from: first("From"),
        to: first("To"),
        subject: first("Subject"),
    }
}

/// Walk MIME parts in document order
///
/// Body candidates are `text/plain`/`text/html` leaves carrying no
/// Content-Disposition header and no filename; first of each wins.
fn walk(
    part: &ParsedMail<'_>,
    body_text: &mut Option<String>,
    body_html: &mut Option<String>,
    attachments: &mut Vec<AttachmentPart>,
    part_counter: &mut usize,
) {
    if !part.subparts.is_empty() {
        for sub in &part.subparts {
            walk(sub, body_text, body_html, attachments, part_counter);
        }
        return;
    }

    let ctype = part.ctype.mimetype.to_ascii_lowercase();
    if ctype.starts_with("multipart/") {
        return;
    }

    let disp = part.get_content_disposition();
    let disp_header = part
        .headers
        .iter()
        .find(|h| h.get_key_ref().eq_ignore_ascii_case("Content-Disposition"))
        .map(|h| h.get_value());
    let filename = disp
        .params
        .get("filename")
        .cloned()
        .or_else(|| part.ctype.params.get("name").cloned());
    let content_id = part
        .headers
        .iter()
        .find(|h| h.get_key_ref().eq_ignore_ascii_case("Content-ID"))
        .map(|h| h.get_value().trim().trim_matches(['<', '>']).to_owned())
        .filter(|v| !v.is_empty());

    let is_body_candidate = (ctype == "text/plain" || ctype == "text/html")
        && disp_header.is_none()
        && filename.is_none();

    if is_body_candidate {
        if ctype == "text/plain"
            && body_text.is_none()
            && let Ok(text) = part.get_body()
        {
            *body_text = Some(text);
        }
        if ctype == "text/html"
            && body_html.is_none()
            && let Ok(html) = part.get_body()
        {
            *body_html = Some(html);
        }
        return;
    }

    let is_inline = disp.disposition == DispositionType::Inline && disp_header.is_some()
        || content_id.is_some();

    let data = match part.get_body_raw() {
        Ok(bytes) => bytes,
        // Malformed transfer encoding: keep the raw text best-effort.
        Err(_) => part.get_body().unwrap_or_default().into_bytes(),
    };

    let name = match filename {
        Some(f) => sanitize_filename(&f),
        None => {
            let fallback = format!("part_{}.{}", part_counter, ext_for_mime(&ctype));
            *part_counter += 1;
            fallback
        }
    };

    attachments.push(AttachmentPart {
        filename: name,
        mime_type: ctype,
        content_id,
        is_inline,
        data,
    });
}

/// Sanitize an attachment filename for the archive directory
///
/// Strips NULs and any path components, replaces `<>:*?"/\|` with `-`, and
/// collapses whitespace. Empty results become `file.bin`.
pub fn sanitize_filename(name: &str) -> String {
    let no_nul: String = name.chars().filter(|&c| c != '\0').collect();
    let base = no_nul
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or("")
        .trim()
        .to_owned();
    let replaced: String = base
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '*' | '?' | '"' | '/' | '\\' | '|' => '-',
            other => other,
        })
        .collect();
    let collapsed = replaced.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        "file.bin".to_owned()
    } else {
        collapsed
    }
}

/// Extension guess for nameless parts, from the declared MIME type
fn ext_for_mime(mime: &str) -> &'static str {
    match mime {
        "image/png" => "png",
        "image/jpeg" => "jpg",
        "image/gif" => "gif",
        "image/webp" => "webp",
        "image/svg+xml" => "svg",
        "application/pdf" => "pdf",
        "text/calendar" => "ics",
        "text/plain" => "txt",
        "text/html" => "html",
        "message/rfc822" => "eml",
        _ => "bin",
    }
}

#[cfg(test)]
mod tests {
    use super::{decompose, sanitize_filename};

    fn sample_multipart() -> Vec<u8> {
        let mut raw = String::new();
        raw.push_str("From: alice@example.com\r\n");
        raw.push_str("To: user@example.com\r\n");
        raw.push_str("Subject: =?UTF-8?B?7ZWc6rWt7Ja0IOygnOuqqQ==?=\r\n");
        raw.push_str("Message-ID: <abc@example.com>\r\n");
        raw.push_str("Date: Fri, 10 Jan 2025 09:30:00 +0900\r\n");
        raw.push_str("MIME-Version: 1.0\r\n");
        raw.push_str("Content-Type: multipart/related; boundary=\"BOUND\"\r\n\r\n");
        raw.push_str("--BOUND\r\n");
        raw.push_str("Content-Type: text/plain; charset=utf-8\r\n\r\n");
        raw.push_str("plain body\r\n");
        raw.push_str("--BOUND\r\n");
        raw.push_str("Content-Type: text/html; charset=utf-8\r\n\r\n");
        raw.push_str("<p><img src=\"cid:img1\"></p>\r\n");
        raw.push_str("--BOUND\r\n");
        raw.push_str("Content-Type: image/png; name=\"img1.png\"\r\n");
        raw.push_str("Content-ID: <img1>\r\n");
        raw.push_str("Content-Transfer-Encoding: base64\r\n");
        raw.push_str("Content-Disposition: inline; filename=\"img1.png\"\r\n\r\n");
        raw.push_str("iVBORw0KGgo=\r\n");
        raw.push_str("--BOUND--\r\n");
        raw.into_bytes()
    }

    #[test]
    fn bodies_and_attachments_are_separated() {
        let mail = decompose(&sample_multipart()).expect("decompose");
        assert!(mail.body_text.as_deref().unwrap_or_default().contains("plain body"));
        assert!(mail.body_html.as_deref().unwrap().contains("cid:img1"));
        assert_eq!(mail.attachments.len(), 1);

        let att = &mail.attachments[0];
        assert_eq!(att.filename, "img1.png");
        assert_eq!(att.content_id.as_deref(), Some("img1"));
        assert!(att.is_inline);
        assert_eq!(att.data, b"\x89PNG\r\n\x1a\n");
    }

    #[test]
    fn encoded_word_subject_is_decoded() {
        let mail = decompose(&sample_multipart()).expect("decompose");
        assert_eq!(mail.headers.subject.as_deref(), Some("한국어 제목"));
        assert_eq!(mail.headers.from.as_deref(), Some("alice@example.com"));
    }

    #[test]
    fn nameless_parts_get_counter_fallback_names() {
        let raw = b"From: a@b.c\r\nMIME-Version: 1.0\r\n\
Content-Type: multipart/mixed; boundary=\"B\"\r\n\r\n\
--B\r\nContent-Type: application/pdf\r\nContent-Disposition: attachment\r\n\r\n%PDF\r\n\
--B\r\nContent-Type: application/octet-stream\r\nContent-Disposition: attachment\r\n\r\nxx\r\n\
--B--\r\n";
        let mail = decompose(raw).expect("decompose");
        let names: Vec<&str> = mail
            .attachments
            .iter()
            .map(|a| a.filename.as_str())
            .collect();
        assert_eq!(names, vec!["part_1.pdf", "part_2.bin"]);
    }

    #[test]
    fn sanitize_filename_strips_paths_and_reserved_characters() {
        assert_eq!(sanitize_filename("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_filename("re:\u{0}port*?.pdf"), "re-port--.pdf");
        assert_eq!(sanitize_filename("  spaced   name.txt "), "spaced name.txt");
        assert_eq!(sanitize_filename("///"), "file.bin");
    }

    #[test]
    fn single_part_plain_message_has_text_body_only() {
        let raw = b"From: a@b.c\r\nSubject: Hi\r\n\r\nHello there";
        let mail = decompose(raw).expect("decompose");
        assert_eq!(mail.body_text.as_deref(), Some("Hello there"));
        assert!(mail.body_html.is_none());
        assert!(mail.attachments.is_empty());
    }
}
