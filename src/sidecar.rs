//! Content fingerprints and per-file sidecar metadata.
//!
//! The sidecar records which side last wrote a file's bytes and the
//! fingerprint of those bytes. A local file whose current fingerprint
//! equals the recorded one is a pure inbound copy and must never be
//! re-uploaded (the echo shield).
//!
//! Records live in a `.sync/` shadow tree beside the data, keyed by
//! relative path. The shadow tree does not follow file moves; a moved
//! file simply misses its record and is re-fingerprinted on first
//! observation, which errs toward an extra upload rather than a missed one.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

/// Name of the shadow directory under each project root.
pub const SIDECAR_DIR: &str = ".sync";

/// Which side last wrote a file's byte sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileOrigin {
    /// Written by a local editor or application.
    Local,
    /// Written by a download from the origin/object-store side.
    Filevine,
}

/// Sidecar record for a single local file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SidecarRecord {
    pub origin: FileOrigin,
    /// `"{md5hex}|{size}"` of the file content at mark time.
    pub fingerprint: String,
    /// RFC 3339 UTC timestamp of the mark.
    pub marked_at: String,
}

/// Compute the `"{md5hex}|{size}"` fingerprint of a file.
///
/// Returns `None` on any read error (locked file, vanished file); the
/// caller treats that as "unknown" rather than failing the pass.
pub async fn fingerprint(path: &Path) -> Option<String> {
    let mut file = match tokio::fs::File::open(path).await {
        Ok(f) => f,
        Err(e) => {
            debug!("fingerprint: cannot open {}: {}", path.display(), e);
            return None;
        }
    };

    let mut ctx = md5::Context::new();
    let mut size: u64 = 0;
    let mut buffer = vec![0u8; 8192];
    loop {
        match file.read(&mut buffer).await {
            Ok(0) => break,
            Ok(n) => {
                ctx.consume(&buffer[..n]);
                size += n as u64;
            }
            Err(e) => {
                debug!("fingerprint: read failed for {}: {}", path.display(), e);
                return None;
            }
        }
    }

    Some(format!("{:x}|{}", ctx.compute(), size))
}

/// Fingerprint of an in-memory byte sequence.
pub fn fingerprint_bytes(bytes: &[u8]) -> String {
    format!("{:x}|{}", md5::compute(bytes), bytes.len())
}

/// Sidecar store for one project root.
#[derive(Debug, Clone)]
pub struct SidecarStore {
    root: PathBuf,
}

impl SidecarStore {
    pub fn new(project_root: &Path) -> Self {
        Self {
            root: project_root.join(SIDECAR_DIR),
        }
    }

    fn record_path(&self, rel_key: &str) -> PathBuf {
        let mut p = self.root.clone();
        for segment in rel_key.split('/').filter(|s| !s.is_empty()) {
            p.push(segment);
        }
        p.set_file_name(format!(
            "{}.json",
            p.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default()
        ));
        p
    }

    /// Fetch the record for a relative key, if one exists and parses.
    pub async fn get(&self, rel_key: &str) -> Option<SidecarRecord> {
        let path = self.record_path(rel_key);
        let content = tokio::fs::read_to_string(&path).await.ok()?;
        match serde_json::from_str(&content) {
            Ok(rec) => Some(rec),
            Err(e) => {
                warn!("sidecar: unparsable record {}: {}", path.display(), e);
                None
            }
        }
    }

    /// Write a record for a relative key, creating parent directories.
    pub async fn set(&self, rel_key: &str, record: &SidecarRecord) {
        let path = self.record_path(rel_key);
        if let Some(parent) = path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                warn!("sidecar: cannot create {}: {}", parent.display(), e);
                return;
            }
        }
        let json = match serde_json::to_string_pretty(record) {
            Ok(j) => j,
            Err(e) => {
                warn!("sidecar: serialize failed for {}: {}", rel_key, e);
                return;
            }
        };
        if let Err(e) = tokio::fs::write(&path, json).await {
            warn!("sidecar: write failed {}: {}", path.display(), e);
        }
    }

    /// Stamp a key with the given origin and fingerprint at the current time.
    pub async fn mark(&self, rel_key: &str, origin: FileOrigin, fingerprint: String) {
        self.set(
            rel_key,
            &SidecarRecord {
                origin,
                fingerprint,
                marked_at: Utc::now().to_rfc3339(),
            },
        )
        .await;
    }

    /// Drop the record for a key (used when the file is deleted).
    pub async fn remove(&self, rel_key: &str) {
        let path = self.record_path(rel_key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("sidecar: remove failed {}: {}", path.display(), e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_fingerprint_format() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("x.txt");
        tokio::fs::write(&path, b"hello world").await.unwrap();

        let fp = fingerprint(&path).await.unwrap();
        // md5("hello world") with the 11-byte length suffix.
        assert_eq!(fp, "5eb63bbbe01eeed093cb22bb8f5acdc3|11");
        assert_eq!(fp, fingerprint_bytes(b"hello world"));
    }

    #[tokio::test]
    async fn test_fingerprint_missing_file() {
        let dir = tempdir().unwrap();
        assert!(fingerprint(&dir.path().join("absent")).await.is_none());
    }

    #[tokio::test]
    async fn test_roundtrip_and_remove() {
        let dir = tempdir().unwrap();
        let store = SidecarStore::new(dir.path());

        store
            .mark("Discovery/brief.pdf", FileOrigin::Filevine, "abc|3".into())
            .await;

        let rec = store.get("Discovery/brief.pdf").await.unwrap();
        assert_eq!(rec.origin, FileOrigin::Filevine);
        assert_eq!(rec.fingerprint, "abc|3");

        store.remove("Discovery/brief.pdf").await;
        assert!(store.get("Discovery/brief.pdf").await.is_none());
    }

    #[tokio::test]
    async fn test_miss_after_move_is_none() {
        let dir = tempdir().unwrap();
        let store = SidecarStore::new(dir.path());
        store.mark("a.txt", FileOrigin::Local, "f|1".into()).await;
        // A record under the old key says nothing about the new one.
        assert!(store.get("moved/a.txt").await.is_none());
    }

    #[test]
    fn test_origin_serde_form() {
        let rec = SidecarRecord {
            origin: FileOrigin::Filevine,
            fingerprint: "aa|1".into(),
            marked_at: "2024-01-01T00:00:00Z".into(),
        };
        let json = serde_json::to_string(&rec).unwrap();
        assert!(json.contains("\"filevine\""));
    }
}
