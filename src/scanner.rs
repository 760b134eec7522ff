//! Local scanner: enumerate the files of a project root.

use crate::error::{SyncError, SyncResult};
use crate::paths::is_ignored;
use crate::sidecar::SIDECAR_DIR;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::warn;

/// One local file as seen by the scanner.
#[derive(Debug, Clone)]
pub struct LocalFile {
    /// Original-case relative key (forward slashes).
    pub rel_original: String,
    /// Filesystem modification time, UTC.
    pub last_modified: DateTime<Utc>,
}

/// Scan a project root into `{lowercased relKey → LocalFile}`.
///
/// Skips ignored basenames, the `.sync/` sidecar tree, and symlinks.
/// Unreadable entries are logged and skipped; only a missing root is an
/// error.
pub fn scan_project(root: &Path) -> SyncResult<BTreeMap<String, LocalFile>> {
    if !root.is_dir() {
        return Err(SyncError::io(
            root,
            std::io::Error::new(std::io::ErrorKind::NotFound, "project root missing"),
        ));
    }
    let mut files = BTreeMap::new();
    walk(root, root, &mut files);
    Ok(files)
}

fn walk(root: &Path, current: &Path, out: &mut BTreeMap<String, LocalFile>) {
    let entries = match fs::read_dir(current) {
        Ok(e) => e,
        Err(e) => {
            warn!("scan: cannot read {}: {}", current.display(), e);
            return;
        }
    };

    for entry in entries {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!("scan: bad entry under {}: {}", current.display(), e);
                continue;
            }
        };
        let file_type = match entry.file_type() {
            Ok(t) => t,
            Err(e) => {
                warn!("scan: cannot stat {}: {}", entry.path().display(), e);
                continue;
            }
        };
        let name = entry.file_name().to_string_lossy().into_owned();

        if file_type.is_symlink() {
            continue;
        }

        if file_type.is_dir() {
            if name == SIDECAR_DIR {
                continue;
            }
            walk(root, &entry.path(), out);
            continue;
        }

        if !file_type.is_file() || is_ignored(&name) {
            continue;
        }

        let path = entry.path();
        let modified = match fs::metadata(&path).and_then(|m| m.modified()) {
            Ok(t) => DateTime::<Utc>::from(t),
            Err(e) => {
                warn!("scan: no mtime for {}: {}", path.display(), e);
                continue;
            }
        };

        let rel = match path.strip_prefix(root) {
            Ok(r) => r.to_string_lossy().replace('\\', "/"),
            Err(_) => continue,
        };

        out.insert(
            rel.to_lowercase(),
            LocalFile {
                rel_original: rel,
                last_modified: modified,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_scan_skips_ignored_and_sidecars() {
        let dir = tempdir().unwrap();
        let root = dir.path();

        fs::create_dir_all(root.join("Discovery/Responses")).unwrap();
        fs::create_dir_all(root.join(".sync/Discovery")).unwrap();
        fs::write(root.join("Discovery/brief.pdf"), b"pdf").unwrap();
        fs::write(root.join("Discovery/Responses/ans.docx"), b"doc").unwrap();
        fs::write(root.join("Discovery/~$brief.pdf"), b"lock").unwrap();
        fs::write(root.join("notes.tmp"), b"scratch").unwrap();
        fs::write(root.join(".last_sync_state.json"), b"{}").unwrap();
        fs::write(root.join(".sync/Discovery/brief.pdf.json"), b"{}").unwrap();

        let files = scan_project(root).unwrap();
        let keys: Vec<&String> = files.keys().collect();
        assert_eq!(keys, vec!["discovery/brief.pdf", "discovery/responses/ans.docx"]);

        let rec = &files["discovery/brief.pdf"];
        assert_eq!(rec.rel_original, "Discovery/brief.pdf");
    }

    #[test]
    fn test_scan_missing_root_is_error() {
        let dir = tempdir().unwrap();
        assert!(scan_project(&dir.path().join("absent")).is_err());
    }

    #[test]
    fn test_scan_preserves_case_in_original() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("To Client")).unwrap();
        fs::write(root.join("To Client/Exhibit A.PDF"), b"x").unwrap();

        let files = scan_project(root).unwrap();
        let rec = &files["to client/exhibit a.pdf"];
        assert_eq!(rec.rel_original, "To Client/Exhibit A.PDF");
    }
}
