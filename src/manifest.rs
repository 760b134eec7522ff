//! Per-project manifest: the last observed union of local and remote keys.
//!
//! The manifest exists solely to detect deletions: a key present in the
//! manifest but missing on one side was removed there since the previous
//! pass. It is keyed by lowercased relative key and written atomically
//! (temp file, then rename) so a crash never leaves a torn snapshot.

use crate::error::{SyncError, SyncResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::warn;

/// Manifest file name inside each project root.
pub const MANIFEST_FILENAME: &str = ".last_sync_state.json";

/// Which store a manifest record was observed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordSource {
    Local,
    S3,
}

/// Snapshot of a single key at the end of a pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestRecord {
    pub source: RecordSource,
    pub last_modified: DateTime<Utc>,
    /// Original-case relative key, kept for case-preserving writes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rel_original: Option<String>,
}

/// Lowercased relative key → record. BTreeMap keeps serialization
/// byte-stable across passes.
pub type Manifest = BTreeMap<String, ManifestRecord>;

/// Load a manifest. Missing or unparsable files yield an empty manifest
/// with a warning; a bad snapshot must never block a pass.
pub async fn load(path: &Path) -> Manifest {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => match serde_json::from_str(&content) {
            Ok(manifest) => manifest,
            Err(e) => {
                warn!("manifest: unparsable {}: {}; starting empty", path.display(), e);
                Manifest::new()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Manifest::new(),
        Err(e) => {
            warn!("manifest: cannot read {}: {}; starting empty", path.display(), e);
            Manifest::new()
        }
    }
}

/// Atomically replace the manifest: write to a temp sibling, then rename.
pub async fn save(path: &Path, manifest: &Manifest) -> SyncResult<()> {
    let json = serde_json::to_string_pretty(manifest)
        .map_err(|e| SyncError::Parse(e.to_string()))?;

    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, json)
        .await
        .map_err(|e| SyncError::io(&tmp, e))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| SyncError::io(path, e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn record(source: RecordSource, rfc3339: &str) -> ManifestRecord {
        ManifestRecord {
            source,
            last_modified: rfc3339.parse().unwrap(),
            rel_original: None,
        }
    }

    #[tokio::test]
    async fn test_load_missing_is_empty() {
        let dir = tempdir().unwrap();
        let manifest = load(&dir.path().join(MANIFEST_FILENAME)).await;
        assert!(manifest.is_empty());
    }

    #[tokio::test]
    async fn test_load_garbage_is_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(MANIFEST_FILENAME);
        tokio::fs::write(&path, "{not json").await.unwrap();
        assert!(load(&path).await.is_empty());
    }

    #[tokio::test]
    async fn test_save_and_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(MANIFEST_FILENAME);

        let mut manifest = Manifest::new();
        manifest.insert(
            "discovery/brief.pdf".into(),
            record(RecordSource::S3, "2024-01-01T10:00:00Z"),
        );
        manifest.insert(
            "notes.txt".into(),
            record(RecordSource::Local, "2024-02-02T09:30:00Z"),
        );

        save(&path, &manifest).await.unwrap();
        let reloaded = load(&path).await;
        assert_eq!(reloaded, manifest);

        // The temp sibling must not linger after a successful save.
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn test_save_is_byte_stable() {
        let dir = tempdir().unwrap();
        let path_a = dir.path().join("a.json");
        let path_b = dir.path().join("b.json");

        let mut manifest = Manifest::new();
        manifest.insert("z.txt".into(), record(RecordSource::Local, "2024-01-01T00:00:00Z"));
        manifest.insert("a.txt".into(), record(RecordSource::S3, "2024-01-01T00:00:00Z"));

        save(&path_a, &manifest).await.unwrap();
        save(&path_b, &manifest).await.unwrap();

        let a = tokio::fs::read(&path_a).await.unwrap();
        let b = tokio::fs::read(&path_b).await.unwrap();
        assert_eq!(a, b);
    }
}
