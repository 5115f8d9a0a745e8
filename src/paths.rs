//! On-disk layout under the per-OS app-data root
//!
//! The archive directory identity is `(account, mailbox, uidvalidity, uid)`:
//! a value type, reconstructed on demand. Path columns stored in the index
//! are caches of these derivations, never the source of truth.

use std::path::{Path, PathBuf};

use crate::errors::{AppError, AppResult};

/// Application folder name under the platform data root
const APP_DIR_NAME: &str = "MailDigest";

/// Resolve the app-data base directory
///
/// Windows uses `%LOCALAPPDATA%\MailDigest` (large local caches belong
/// there); everywhere else `$HOME/.mail-digest`. The directory is created
/// on first use.
pub fn app_data_dir() -> AppResult<PathBuf> {
    let base = if cfg!(windows) {
        dirs::data_local_dir()
            .map(|p| p.join(APP_DIR_NAME))
            .ok_or_else(|| AppError::Internal("cannot resolve %LOCALAPPDATA%".to_owned()))?
    } else {
        dirs::home_dir()
            .map(|p| p.join(".mail-digest"))
            .ok_or_else(|| AppError::Internal("cannot resolve home directory".to_owned()))?
    };
    std::fs::create_dir_all(&base)?;
    Ok(base)
}

/// Path of the SQLite index file
pub fn db_path(data_root: &Path) -> PathBuf {
    data_root.join("db.sqlite3")
}

/// Default vault root when the setting is unset
pub fn default_vault_root() -> AppResult<PathBuf> {
    dirs::home_dir()
        .map(|p| p.join("MailDigestVault"))
        .ok_or_else(|| AppError::Internal("cannot resolve home directory".to_owned()))
}

/// Sanitize one path segment to `[A-Za-z0-9._-]`
///
/// Runs of other characters collapse to a single `-`; empty input becomes
/// `default`. Segments are capped at 80 characters.
pub fn safe_segment(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last_dash = false;
    for ch in text.trim().chars() {
        if ch.is_ascii_alphanumeric() || ch == '.' || ch == '_' || ch == '-' {
            out.push(ch);
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    let trimmed = out.trim_matches('-');
    let mut seg = if trimmed.is_empty() {
        "default".to_owned()
    } else {
        trimmed.to_owned()
    };
    if seg.len() > 80 {
        seg.truncate(80);
    }
    seg
}

/// Per-message archive directory and its derived artifact paths
#[derive(Debug, Clone)]
pub struct MessagePaths {
    pub base_dir: PathBuf,
}

impl MessagePaths {
    pub fn raw_eml(&self) -> PathBuf {
        self.base_dir.join("raw.eml")
    }

    pub fn body_html(&self) -> PathBuf {
        self.base_dir.join("body.html")
    }

    pub fn body_text(&self) -> PathBuf {
        self.base_dir.join("body.txt")
    }

    pub fn rendered_html(&self) -> PathBuf {
        self.base_dir.join("rendered.html")
    }

    pub fn attachments_dir(&self) -> PathBuf {
        self.base_dir.join("attachments")
    }

    pub fn external_dir(&self) -> PathBuf {
        self.base_dir.join("external")
    }
}

/// Derive and create the archive directory for one message
///
/// Layout: `<data_root>/data/messages/<account>/<mailbox>/<uidvalidity>/<uid>/`
/// with `attachments/` and `external/` pre-created.
pub fn message_paths(
    data_root: &Path,
    account_id: &str,
    mailbox: &str,
    uidvalidity: u32,
    uid: u32,
) -> AppResult<MessagePaths> {
    let base = data_root
        .join("data")
        .join("messages")
        .join(safe_segment(account_id))
        .join(safe_segment(mailbox))
        .join(uidvalidity.to_string())
        .join(uid.to_string());
    std::fs::create_dir_all(base.join("attachments"))?;
    std::fs::create_dir_all(base.join("external"))?;
    Ok(MessagePaths { base_dir: base })
}

#[cfg(test)]
mod tests {
    use super::{message_paths, safe_segment};

    #[test]
    fn safe_segment_keeps_allowed_characters() {
        assert_eq!(safe_segment("user@example.com"), "user-example.com");
        assert_eq!(safe_segment("INBOX"), "INBOX");
        assert_eq!(safe_segment("a//b\\c"), "a-b-c");
    }

    #[test]
    fn safe_segment_collapses_and_trims_dashes() {
        assert_eq!(safe_segment("  ***  "), "default");
        assert_eq!(safe_segment("a   b"), "a-b");
        assert_eq!(safe_segment("-x-"), "x");
    }

    #[test]
    fn safe_segment_caps_length() {
        let long = "a".repeat(200);
        assert_eq!(safe_segment(&long).len(), 80);
    }

    #[test]
    fn message_paths_layout_is_partitioned_by_identity() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let paths = message_paths(tmp.path(), "user@example.com", "INBOX", 7, 42)
            .expect("paths must build");
        assert!(paths.attachments_dir().is_dir());
        assert!(paths.external_dir().is_dir());
        let s = paths.raw_eml().to_string_lossy().replace('\\', "/");
        assert!(s.ends_with("data/messages/user-example.com/INBOX/7/42/raw.eml"));
    }
}
