//! Atomic file writes for archive artifacts
//!
//! Every artifact write goes through write-to-tempfile + fsync + rename so a
//! crash mid-step leaves the previous version intact.

use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use uuid::Uuid;

use crate::errors::{AppError, AppResult};

/// Write bytes atomically
///
/// The temp file lives in the destination directory so the final rename
/// never crosses a filesystem boundary.
pub fn atomic_write_bytes(path: &Path, data: &[u8]) -> AppResult<()> {
    let parent = path
        .parent()
        .ok_or_else(|| AppError::Internal(format!("path has no parent: {}", path.display())))?;
    fs::create_dir_all(parent)?;

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("artifact");
    let tmp = parent.join(format!("{file_name}.{}.tmp", Uuid::new_v4().simple()));

    let result = (|| -> AppResult<()> {
        let mut f = File::create(&tmp)?;
        f.write_all(data)?;
        f.sync_all()?;
        drop(f);
        fs::rename(&tmp, path)?;
        Ok(())
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

/// Write UTF-8 text atomically
pub fn atomic_write_text(path: &Path, text: &str) -> AppResult<()> {
    atomic_write_bytes(path, text.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::{atomic_write_bytes, atomic_write_text};

    #[test]
    fn writes_and_replaces_in_place() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let target = tmp.path().join("nested").join("raw.eml");

        atomic_write_bytes(&target, b"first").expect("first write");
        assert_eq!(std::fs::read(&target).expect("read"), b"first");

        atomic_write_bytes(&target, b"second").expect("second write");
        assert_eq!(std::fs::read(&target).expect("read"), b"second");
    }

    #[test]
    fn leaves_no_temp_files_behind() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let target = tmp.path().join("note.md");
        atomic_write_text(&target, "hello").expect("write");

        let names: Vec<String> = std::fs::read_dir(tmp.path())
            .expect("read_dir")
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["note.md".to_owned()]);
    }
}
