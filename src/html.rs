//! HTML reference rewriting and sanitization
//!
//! Two phases over the archived HTML body. The rewrite pass maps `cid:`
//! references to extracted attachments and downloads `http(s)` assets under
//! the SSRF guard into `external/`; the sanitize pass applies an `ammonia`
//! allowlist before the result is written as `rendered.html`. Running the
//! rewriter on its own output is a no-op: local relative paths match
//! neither scheme.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use regex::{Captures, Regex};
use sha2::{Digest, Sha256};
use tokio::time::Instant;
use url::Url;

use crate::atomic_io::atomic_write_bytes;
use crate::mail_repo::ExternalAssetRecord;
use crate::net::{DownloadError, FetchLimits, asset_client, stream_download};

/// Hard cap on assets fetched per message
const MAX_ASSETS: usize = 120;
/// Wall-clock budget for a message's whole external stage
const MAX_TOTAL_SECONDS: u64 = 90;
/// Total per-asset HTTP timeout
const ASSET_TIMEOUT_S: u64 = 20;

static ATTR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\b(src|href|poster)\s*=\s*("([^"]*)"|'([^']*)')"#).expect("attr regex")
});
static STYLE_ATTR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)\bstyle\s*=\s*("[^"]*"|'[^']*')"#).expect("style regex"));
static STYLE_BLOCK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<style[^>]*>(.*?)</style>").expect("style block regex"));
static CSS_URL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)url\(\s*['"]?([^'")\s]+)['"]?\s*\)"#).expect("css url regex")
});

/// Downloads and records external assets for one message
///
/// Holds the running byte counter, the asset count, and the wall-clock
/// deadline. Each distinct URL gets exactly one terminal status record.
pub struct AssetStore {
    external_dir: PathBuf,
    client: Option<reqwest::Client>,
    remaining_bytes: u64,
    deadline: Instant,
    records: Vec<ExternalAssetRecord>,
    resolved: HashMap<String, Option<String>>,
}

impl AssetStore {
    pub fn new(external_dir: &Path, max_total_bytes: u64) -> Self {
        Self {
            external_dir: external_dir.to_path_buf(),
            client: asset_client(ASSET_TIMEOUT_S).ok(),
            remaining_bytes: max_total_bytes,
            deadline: Instant::now() + Duration::from_secs(MAX_TOTAL_SECONDS),
            records: Vec::new(),
            resolved: HashMap::new(),
        }
    }

    /// Terminal status records, in first-seen order
    pub fn into_records(self) -> Vec<ExternalAssetRecord> {
        self.records
    }

    /// Fetch one URL, returning the archive-relative path when stored
    async fn fetch(&mut self, url: &str) -> Option<String> {
        if let Some(cached) = self.resolved.get(url) {
            return cached.clone();
        }
        let rel = self.fetch_uncached(url).await;
        self.resolved.insert(url.to_owned(), rel.clone());
        rel
    }

    async fn fetch_uncached(&mut self, url: &str) -> Option<String> {
        if self.records.len() >= MAX_ASSETS {
            self.record_skip(url, "skipped_assets_limit");
            return None;
        }
        if Instant::now() > self.deadline {
            self.record_skip(url, "skipped_time_budget");
            return None;
        }
        if self.remaining_bytes == 0 {
            self.record_skip(url, "skipped_limit");
            return None;
        }
        let Some(client) = self.client.as_ref() else {
            self.record_skip(url, "error:http client unavailable");
            return None;
        };

        let limits = FetchLimits {
            timeout_s: ASSET_TIMEOUT_S,
            max_bytes: self.remaining_bytes,
            deadline: self.deadline,
        };
        match stream_download(client, url, &limits).await {
            Ok(asset) => {
                let size = asset.bytes.len() as u64;
                self.remaining_bytes = self.remaining_bytes.saturating_sub(size);
                let ext = guess_ext(url, asset.content_type.as_deref());
                let name = format!("{}{ext}", hash_url(url));
                let path = self.external_dir.join(&name);
                if let Err(e) = atomic_write_bytes(&path, &asset.bytes) {
                    self.record_skip(url, &format!("error:{e}"));
                    return None;
                }
                let rel = format!("external/{name}");
                self.records.push(ExternalAssetRecord {
                    original_url: url.to_owned(),
                    rel_path: Some(rel.clone()),
                    mime_type: asset.content_type,
                    size_bytes: Some(size),
                    status: "downloaded".to_owned(),
                });
                Some(rel)
            }
            Err(DownloadError::Blocked(reason)) => {
                self.record_skip(url, &format!("blocked:{reason}"));
                None
            }
            Err(DownloadError::Failed(detail)) => {
                self.record_skip(url, &format!("error:{detail}"));
                None
            }
        }
    }

    fn record_skip(&mut self, url: &str, status: &str) {
        self.records.push(ExternalAssetRecord {
            original_url: url.to_owned(),
            rel_path: None,
            mime_type: None,
            size_bytes: None,
            status: status.to_owned(),
        });
    }
}

/// Rewrite `cid:` and `http(s):` references in archived HTML
///
/// Element attributes (`src`, `href`, `poster`), inline `style` attributes,
/// and `<style>` blocks are all covered. URLs that cannot be mapped keep
/// their original value.
pub async fn rewrite_refs(
    html: &str,
    cid_map: &HashMap<String, String>,
    store: &mut AssetStore,
) -> String {
    // Resolve every candidate up front; regex replacement is then pure.
    let mut mapping: HashMap<String, String> = HashMap::new();
    for raw in collect_urls(html) {
        if mapping.contains_key(&raw) {
            continue;
        }
        if let Some(cid) = raw.strip_prefix("cid:") {
            let key = cid.trim().trim_matches(['<', '>']);
            if let Some(rel) = cid_map.get(key) {
                mapping.insert(raw.clone(), rel.clone());
            }
        } else if raw.starts_with("http://") || raw.starts_with("https://") {
            if let Some(rel) = store.fetch(&raw).await {
                mapping.insert(raw.clone(), rel);
            }
        }
    }

    let rewritten = ATTR_RE.replace_all(html, |caps: &Captures<'_>| {
        let attr = &caps[1];
        let value = caps.get(3).or(caps.get(4)).map_or("", |m| m.as_str());
        match mapping.get(value) {
            Some(rel) => format!("{attr}=\"{rel}\""),
            None => caps[0].to_owned(),
        }
    });

    let rewritten = STYLE_ATTR_RE.replace_all(&rewritten, |caps: &Captures<'_>| {
        let quoted = &caps[1];
        let quote = &quoted[..1];
        let inner = &quoted[1..quoted.len() - 1];
        let replaced = rewrite_css(inner, &mapping);
        format!("style={quote}{replaced}{quote}")
    });

    let rewritten = STYLE_BLOCK_RE.replace_all(&rewritten, |caps: &Captures<'_>| {
        let whole = &caps[0];
        let inner = &caps[1];
        let replaced = rewrite_css(inner, &mapping);
        whole.replacen(inner, &replaced, 1)
    });

    rewritten.into_owned()
}

fn rewrite_css(css: &str, mapping: &HashMap<String, String>) -> String {
    CSS_URL_RE
        .replace_all(css, |caps: &Captures<'_>| {
            let value = &caps[1];
            match mapping.get(value) {
                Some(rel) => format!("url({rel})"),
                None => caps[0].to_owned(),
            }
        })
        .into_owned()
}

/// Every URL candidate the rewrite pass will consider
fn collect_urls(html: &str) -> Vec<String> {
    let mut out = Vec::new();
    for caps in ATTR_RE.captures_iter(html) {
        if let Some(v) = caps.get(3).or(caps.get(4)) {
            let v = v.as_str();
            if !v.is_empty() {
                out.push(v.to_owned());
            }
        }
    }
    for caps in STYLE_ATTR_RE.captures_iter(html) {
        let quoted = &caps[1];
        for css in CSS_URL_RE.captures_iter(&quoted[1..quoted.len() - 1]) {
            out.push(css[1].to_owned());
        }
    }
    for caps in STYLE_BLOCK_RE.captures_iter(html) {
        for css in CSS_URL_RE.captures_iter(&caps[1]) {
            out.push(css[1].to_owned());
        }
    }
    out
}

/// Sanitize HTML for safe local display
///
/// Ammonia's allowlist drops scripts, event handlers, and style blocks.
/// The `style` attribute stays for layout fidelity, and the `cid` scheme
/// stays so unmapped inline references remain visible in the markup.
pub fn sanitize_html(html: &str) -> String {
    ammonia::Builder::default()
        .add_generic_attributes(["style"])
        .add_url_schemes(["cid"])
        .clean(html)
        .to_string()
}

/// Plain-text rendering of an HTML body
///
/// Used when a message has no `text/plain` part and for resummarization
/// from archived HTML.
pub fn html_to_text(html: &str) -> String {
    match html2text::from_read(html.as_bytes(), 80) {
        Ok(text) => text,
        Err(_) => {
            // Last resort: drop tags wholesale.
            static TAG_RE: LazyLock<Regex> =
                LazyLock::new(|| Regex::new(r"<[^>]+>").expect("tag regex"));
            TAG_RE.replace_all(html, " ").trim().to_owned()
        }
    }
}

fn hash_url(url: &str) -> String {
    let digest = Sha256::digest(url.as_bytes());
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    hex[..16].to_owned()
}

/// Extension for a downloaded asset: URL suffix first, then content type
fn guess_ext(url: &str, content_type: Option<&str>) -> String {
    if let Ok(parsed) = Url::parse(url) {
        let name = parsed
            .path_segments()
            .and_then(|mut s| s.next_back())
            .unwrap_or("");
        if let Some(dot) = name.rfind('.') {
            let suffix = &name[dot..];
            if suffix.len() > 1 && suffix.len() <= 6 && suffix[1..].chars().all(|c| c.is_ascii_alphanumeric()) {
                return suffix.to_ascii_lowercase();
            }
        }
    }
    match content_type.unwrap_or("") {
        t if t.contains("png") => ".png".to_owned(),
        t if t.contains("jpeg") => ".jpg".to_owned(),
        t if t.contains("gif") => ".gif".to_owned(),
        t if t.contains("webp") => ".webp".to_owned(),
        t if t.contains("svg") => ".svg".to_owned(),
        t if t.contains("css") => ".css".to_owned(),
        t if t.contains("javascript") => ".js".to_owned(),
        t if t.contains("mp4") => ".mp4".to_owned(),
        _ => ".bin".to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::{AssetStore, guess_ext, hash_url, rewrite_refs, sanitize_html};

    fn cid_map() -> HashMap<String, String> {
        let mut m = HashMap::new();
        m.insert("img1".to_owned(), "attachments/img1.png".to_owned());
        m
    }

    #[tokio::test]
    async fn cid_references_map_to_attachment_paths() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mut store = AssetStore::new(tmp.path(), 1024);
        let html = r#"<p><img src="cid:img1"> and <img src="cid:missing"></p>"#;
        let out = rewrite_refs(html, &cid_map(), &mut store).await;
        assert!(out.contains(r#"src="attachments/img1.png""#));
        assert!(out.contains(r#"src="cid:missing""#));
        assert!(store.into_records().is_empty());
    }

    #[tokio::test]
    async fn private_host_download_is_blocked_and_attribute_kept() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mut store = AssetStore::new(tmp.path(), 1024);
        let html = r#"<img src="http://127.0.0.1:8080/x.png">"#;
        let out = rewrite_refs(html, &HashMap::new(), &mut store).await;
        assert!(out.contains(r#"src="http://127.0.0.1:8080/x.png""#));

        let records = store.into_records();
        assert_eq!(records.len(), 1);
        assert!(records[0].status.starts_with("blocked:"));
        assert!(records[0].rel_path.is_none());
    }

    #[tokio::test]
    async fn css_urls_in_style_attributes_are_rewritten() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mut store = AssetStore::new(tmp.path(), 1024);
        let html = r#"<div style="background: url('cid:img1'); color: red">x</div>"#;
        let out = rewrite_refs(html, &cid_map(), &mut store).await;
        assert!(out.contains("url(attachments/img1.png)"));
        assert!(out.contains("color: red"));
    }

    #[tokio::test]
    async fn rewriting_rewritten_output_is_a_no_op() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mut store = AssetStore::new(tmp.path(), 1024);
        let html = r#"<img src="cid:img1"><a href="mailto:a@b.c">m</a>"#;
        let once = rewrite_refs(html, &cid_map(), &mut store).await;
        let mut store2 = AssetStore::new(tmp.path(), 1024);
        let twice = rewrite_refs(&once, &cid_map(), &mut store2).await;
        assert_eq!(once, twice);
        assert!(store2.into_records().is_empty());
    }

    #[test]
    fn sanitize_strips_scripts_and_handlers() {
        let html = r#"<p onclick="evil()">ok</p><script>evil()</script><img src="attachments/a.png">"#;
        let out = sanitize_html(html);
        assert!(!out.contains("script"));
        assert!(!out.contains("onclick"));
        assert!(out.contains(r#"src="attachments/a.png""#));
    }

    #[test]
    fn sanitize_is_idempotent() {
        let html = r#"<div style="color:red"><img src="cid:unmapped"><b>t</b></div>"#;
        let once = sanitize_html(html);
        let twice = sanitize_html(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn asset_names_derive_from_url_hash_and_suffix() {
        assert_eq!(hash_url("http://example.com/a.png").len(), 16);
        assert_eq!(guess_ext("http://example.com/pic.PNG", None), ".png");
        assert_eq!(guess_ext("http://example.com/track?id=1", Some("image/jpeg")), ".jpg");
        assert_eq!(guess_ext("http://example.com/x", None), ".bin");
        assert_eq!(
            guess_ext("http://example.com/archive.verylongext", Some("text/css")),
            ".css"
        );
    }
}
