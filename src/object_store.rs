//! Object store adapter: listing, transfer, and deletion of bucket objects.
//!
//! The production implementation shells out to the `aws` CLI; a per-key
//! failure surfaces as a [`SyncError::Tool`] which the reconciler logs and
//! skips. An in-memory implementation backs the integration tests.

use crate::error::{SyncError, SyncResult};
use crate::paths::{is_placeholder_key, object_uri};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;
use tokio::process::Command;
use tracing::{debug, warn};

/// One object from a recursive listing, scoped under a project prefix.
#[derive(Debug, Clone)]
pub struct RemoteObject {
    /// Original-case key relative to the listing prefix.
    pub rel_original: String,
    /// Listing timestamp, UTC.
    pub last_modified: DateTime<Utc>,
    /// Full object key including the prefix.
    pub real_key: String,
}

/// Blocking object-store operations used by the reconciler and the
/// webhook router. Keys are bucket-relative; implementations own the
/// bucket name.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Recursively list everything under `prefix` (no trailing slash).
    async fn list_recursive(&self, prefix: &str) -> SyncResult<Vec<RemoteObject>>;

    /// List the immediate child "directory" names under `prefix`.
    async fn list_top_level(&self, prefix: &str) -> SyncResult<Vec<String>>;

    /// Upload a local file to `key`.
    async fn copy_up(&self, local: &Path, key: &str) -> SyncResult<()>;

    /// Download `key` to a local path, creating parent directories.
    async fn copy_down(&self, key: &str, local: &Path) -> SyncResult<()>;

    /// Delete `key`. Idempotent: a missing object is success.
    async fn remove(&self, key: &str) -> SyncResult<()>;

    /// Upload raw bytes with object metadata and tags (webhook path).
    async fn put_bytes(
        &self,
        key: &str,
        body: Vec<u8>,
        content_type: &str,
        metadata: &[(String, String)],
        tags: &[(String, String)],
    ) -> SyncResult<()>;

    /// Find object keys under `prefix` tagged or stamped with a document id.
    async fn find_keys_by_doc_id(&self, prefix: &str, doc_id: i64) -> SyncResult<Vec<String>>;
}

/// Parse one `aws s3 ls --recursive` line:
/// `yyyy-MM-dd HH:mm:ss <size> <key>` (timestamps are UTC).
pub fn parse_listing_line(line: &str) -> Option<(DateTime<Utc>, u64, String)> {
    let line = line.trim_end();
    let stamp = line.get(..19)?;
    let rest = line.get(19..)?;
    let naive = NaiveDateTime::parse_from_str(stamp, "%Y-%m-%d %H:%M:%S").ok()?;
    let mut rest = rest.trim_start().splitn(2, ' ');
    let size: u64 = rest.next()?.parse().ok()?;
    let key = rest.next()?.trim_start().to_string();
    if key.is_empty() {
        return None;
    }
    Some((naive.and_utc(), size, key))
}

/// Object store backed by the `aws` command-line tool.
pub struct AwsCliStore {
    bucket: String,
}

impl AwsCliStore {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
        }
    }

    fn uri(&self, key: &str) -> String {
        object_uri(&self.bucket, key)
    }

    async fn run(&self, args: &[&str]) -> SyncResult<String> {
        debug!("aws {}", args.join(" "));
        let output = Command::new("aws")
            .args(args)
            .output()
            .await
            .map_err(|e| SyncError::io("aws", e))?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(SyncError::Tool {
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            })
        }
    }
}

#[async_trait]
impl ObjectStore for AwsCliStore {
    async fn list_recursive(&self, prefix: &str) -> SyncResult<Vec<RemoteObject>> {
        let uri = format!("{}/", self.uri(prefix));
        let stdout = match self.run(&["s3", "ls", "--recursive", &uri]).await {
            Ok(out) => out,
            // An empty prefix lists as exit code 1 with no stderr.
            Err(SyncError::Tool { code: 1, ref stderr }) if stderr.trim().is_empty() => {
                return Ok(Vec::new())
            }
            Err(e) => return Err(e),
        };

        let strip = format!("{}/", prefix);
        let mut objects = Vec::new();
        for line in stdout.lines().filter(|l| !l.trim().is_empty()) {
            match parse_listing_line(line) {
                Some((last_modified, _size, key)) => {
                    let Some(rel) = key.strip_prefix(&strip) else {
                        continue;
                    };
                    objects.push(RemoteObject {
                        rel_original: rel.to_string(),
                        last_modified,
                        real_key: key,
                    });
                }
                None => {
                    // A listing we cannot fully parse is treated as an
                    // empty store for this pass.
                    warn!("listing: unparsable line, treating store as empty: {:?}", line);
                    return Ok(Vec::new());
                }
            }
        }
        Ok(objects)
    }

    async fn list_top_level(&self, prefix: &str) -> SyncResult<Vec<String>> {
        let uri = format!("{}/", self.uri(prefix));
        let stdout = match self.run(&["s3", "ls", &uri]).await {
            Ok(out) => out,
            Err(SyncError::Tool { code: 1, ref stderr }) if stderr.trim().is_empty() => {
                return Ok(Vec::new())
            }
            Err(e) => return Err(e),
        };

        let mut names = Vec::new();
        for line in stdout.lines() {
            let line = line.trim();
            if let Some(dir) = line.strip_prefix("PRE ") {
                let name = dir.trim().trim_end_matches('/');
                if !name.is_empty() {
                    names.push(name.to_string());
                }
            }
        }
        Ok(names)
    }

    async fn copy_up(&self, local: &Path, key: &str) -> SyncResult<()> {
        let local = crate::paths::long_path(local);
        let local_str = local.to_string_lossy().into_owned();
        let uri = self.uri(key);
        self.run(&["s3", "cp", &local_str, &uri, "--only-show-errors"])
            .await?;
        Ok(())
    }

    async fn copy_down(&self, key: &str, local: &Path) -> SyncResult<()> {
        if let Some(parent) = local.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| SyncError::io(parent, e))?;
        }
        let local = crate::paths::long_path(local);
        let local_str = local.to_string_lossy().into_owned();
        let uri = self.uri(key);
        self.run(&["s3", "cp", &uri, &local_str, "--only-show-errors"])
            .await?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> SyncResult<()> {
        let uri = self.uri(key);
        match self.run(&["s3", "rm", &uri]).await {
            Ok(_) => Ok(()),
            Err(SyncError::Tool { ref stderr, .. })
                if stderr.contains("NoSuchKey") || stderr.contains("(404)") =>
            {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn put_bytes(
        &self,
        key: &str,
        body: Vec<u8>,
        content_type: &str,
        metadata: &[(String, String)],
        tags: &[(String, String)],
    ) -> SyncResult<()> {
        // s3api put-object wants a file body; stage through a temp file.
        let staged = tempfile::NamedTempFile::new().map_err(|e| SyncError::io("tempfile", e))?;
        tokio::fs::write(staged.path(), &body)
            .await
            .map_err(|e| SyncError::io(staged.path(), e))?;
        let body_path = staged.path().to_string_lossy().into_owned();

        let mut args: Vec<String> = vec![
            "s3api".into(),
            "put-object".into(),
            "--bucket".into(),
            self.bucket.clone(),
            "--key".into(),
            key.to_string(),
            "--body".into(),
            body_path,
            "--content-type".into(),
            content_type.to_string(),
        ];
        if !metadata.is_empty() {
            let pairs: Vec<String> = metadata
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect();
            args.push("--metadata".into());
            args.push(pairs.join(","));
        }
        if !tags.is_empty() {
            let pairs: Vec<String> = tags.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
            args.push("--tagging".into());
            args.push(pairs.join("&"));
        }

        let arg_refs: Vec<&str> = args.iter().map(|s| s.as_str()).collect();
        self.run(&arg_refs).await?;
        Ok(())
    }

    async fn find_keys_by_doc_id(&self, prefix: &str, doc_id: i64) -> SyncResult<Vec<String>> {
        let listed = self
            .run(&[
                "s3api",
                "list-objects-v2",
                "--bucket",
                &self.bucket,
                "--prefix",
                &format!("{}/", prefix),
                "--output",
                "json",
            ])
            .await?;

        let parsed: serde_json::Value =
            serde_json::from_str(&listed).map_err(|e| SyncError::Parse(e.to_string()))?;
        let keys: Vec<String> = parsed["Contents"]
            .as_array()
            .map(|arr| {
                arr.iter()
                    .filter_map(|o| o["Key"].as_str().map(str::to_string))
                    .filter(|k| !is_placeholder_key(k))
                    .collect()
            })
            .unwrap_or_default();

        let target = doc_id.to_string();
        let mut matches = Vec::new();
        for key in keys {
            match self
                .run(&[
                    "s3api",
                    "get-object-tagging",
                    "--bucket",
                    &self.bucket,
                    "--key",
                    &key,
                    "--output",
                    "json",
                ])
                .await
            {
                Ok(out) => {
                    if let Ok(v) = serde_json::from_str::<serde_json::Value>(&out) {
                        let tagged = v["TagSet"].as_array().is_some_and(|set| {
                            set.iter().any(|t| {
                                t["Key"].as_str() == Some("fv_docid")
                                    && t["Value"].as_str() == Some(target.as_str())
                            })
                        });
                        if tagged {
                            matches.push(key);
                            continue;
                        }
                    }
                }
                Err(e) => warn!("get-object-tagging failed for {}: {}", key, e),
            }

            // Fall back to object metadata for untagged uploads.
            if let Ok(out) = self
                .run(&[
                    "s3api",
                    "head-object",
                    "--bucket",
                    &self.bucket,
                    "--key",
                    &key,
                    "--output",
                    "json",
                ])
                .await
            {
                if let Ok(v) = serde_json::from_str::<serde_json::Value>(&out) {
                    let by_meta = v["Metadata"].as_object().is_some_and(|m| {
                        m.iter().any(|(mk, mv)| {
                            mk.to_lowercase() == "documentid"
                                && mv.as_str() == Some(target.as_str())
                        })
                    });
                    if by_meta {
                        matches.push(key);
                    }
                }
            }
        }
        Ok(matches)
    }
}

/// In-memory object store used by the integration tests.
#[derive(Default)]
pub struct MemoryStore {
    objects: Mutex<BTreeMap<String, MemObject>>,
}

#[derive(Debug, Clone)]
struct MemObject {
    bytes: Vec<u8>,
    last_modified: DateTime<Utc>,
    metadata: Vec<(String, String)>,
    tags: Vec<(String, String)>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an object with an explicit timestamp.
    pub fn insert(&self, key: &str, bytes: &[u8], last_modified: DateTime<Utc>) {
        self.objects.lock().unwrap().insert(
            key.to_string(),
            MemObject {
                bytes: bytes.to_vec(),
                last_modified,
                metadata: Vec::new(),
                tags: Vec::new(),
            },
        );
    }

    /// Adjust an existing object's timestamp.
    pub fn set_time(&self, key: &str, last_modified: DateTime<Utc>) {
        if let Some(obj) = self.objects.lock().unwrap().get_mut(key) {
            obj.last_modified = last_modified;
        }
    }

    pub fn delete(&self, key: &str) {
        self.objects.lock().unwrap().remove(key);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects.lock().unwrap().contains_key(key)
    }

    pub fn get_bytes(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.lock().unwrap().get(key).map(|o| o.bytes.clone())
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects.lock().unwrap().keys().cloned().collect()
    }

    pub fn tags_for(&self, key: &str) -> Option<Vec<(String, String)>> {
        self.objects.lock().unwrap().get(key).map(|o| o.tags.clone())
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn list_recursive(&self, prefix: &str) -> SyncResult<Vec<RemoteObject>> {
        let strip = format!("{}/", prefix);
        Ok(self
            .objects
            .lock()
            .unwrap()
            .iter()
            .filter_map(|(key, obj)| {
                key.strip_prefix(&strip).map(|rel| RemoteObject {
                    rel_original: rel.to_string(),
                    last_modified: obj.last_modified,
                    real_key: key.clone(),
                })
            })
            .collect())
    }

    async fn list_top_level(&self, prefix: &str) -> SyncResult<Vec<String>> {
        let strip = format!("{}/", prefix);
        let mut names: Vec<String> = Vec::new();
        for key in self.objects.lock().unwrap().keys() {
            if let Some(rel) = key.strip_prefix(&strip) {
                if let Some((first, _)) = rel.split_once('/') {
                    if !names.iter().any(|n| n == first) {
                        names.push(first.to_string());
                    }
                }
            }
        }
        Ok(names)
    }

    async fn copy_up(&self, local: &Path, key: &str) -> SyncResult<()> {
        let bytes = tokio::fs::read(local)
            .await
            .map_err(|e| SyncError::io(local, e))?;
        self.insert(key, &bytes, Utc::now());
        Ok(())
    }

    async fn copy_down(&self, key: &str, local: &Path) -> SyncResult<()> {
        let bytes = self
            .get_bytes(key)
            .ok_or_else(|| SyncError::Tool {
                code: 1,
                stderr: format!("NoSuchKey: {}", key),
            })?;
        if let Some(parent) = local.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| SyncError::io(parent, e))?;
        }
        tokio::fs::write(local, bytes)
            .await
            .map_err(|e| SyncError::io(local, e))?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> SyncResult<()> {
        self.delete(key);
        Ok(())
    }

    async fn put_bytes(
        &self,
        key: &str,
        body: Vec<u8>,
        _content_type: &str,
        metadata: &[(String, String)],
        tags: &[(String, String)],
    ) -> SyncResult<()> {
        self.objects.lock().unwrap().insert(
            key.to_string(),
            MemObject {
                bytes: body,
                last_modified: Utc::now(),
                metadata: metadata.to_vec(),
                tags: tags.to_vec(),
            },
        );
        Ok(())
    }

    async fn find_keys_by_doc_id(&self, prefix: &str, doc_id: i64) -> SyncResult<Vec<String>> {
        let target = doc_id.to_string();
        let strip = format!("{}/", prefix);
        Ok(self
            .objects
            .lock()
            .unwrap()
            .iter()
            .filter(|(key, _)| key.starts_with(&strip) && !is_placeholder_key(key))
            .filter(|(_, obj)| {
                obj.tags
                    .iter()
                    .any(|(k, v)| k == "fv_docid" && *v == target)
                    || obj
                        .metadata
                        .iter()
                        .any(|(k, v)| k.eq_ignore_ascii_case("documentid") && *v == target)
            })
            .map(|(key, _)| key.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_listing_line() {
        let (ts, size, key) =
            parse_listing_line("2024-01-01 10:00:00       1234 mirror/A/Org/A/dir/x.txt").unwrap();
        assert_eq!(ts.to_rfc3339(), "2024-01-01T10:00:00+00:00");
        assert_eq!(size, 1234);
        assert_eq!(key, "mirror/A/Org/A/dir/x.txt");
    }

    #[test]
    fn test_parse_listing_line_key_with_spaces() {
        let (_, size, key) =
            parse_listing_line("2024-06-30 23:59:59          0 mirror/A/Org/A/To Client/.placeholder")
                .unwrap();
        assert_eq!(size, 0);
        assert_eq!(key, "mirror/A/Org/A/To Client/.placeholder");
    }

    #[test]
    fn test_parse_listing_line_rejects_garbage() {
        assert!(parse_listing_line("").is_none());
        assert!(parse_listing_line("PRE somedir/").is_none());
        assert!(parse_listing_line("2024-13-99 10:00:00 12 x").is_none());
        assert!(parse_listing_line("2024-01-01 10:00:00 notasize x").is_none());
    }

    #[tokio::test]
    async fn test_memory_store_listing_scoped_to_prefix() {
        let store = MemoryStore::new();
        let t = Utc::now();
        store.insert("root/A/Org/A/x.txt", b"x", t);
        store.insert("root/B/Org/B/y.txt", b"y", t);

        let listed = store.list_recursive("root/A/Org/A").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].rel_original, "x.txt");
        assert_eq!(listed[0].real_key, "root/A/Org/A/x.txt");

        let projects = store.list_top_level("root").await.unwrap();
        assert_eq!(projects, vec!["A".to_string(), "B".to_string()]);
    }

    #[tokio::test]
    async fn test_memory_store_find_by_doc_id() {
        let store = MemoryStore::new();
        store
            .put_bytes(
                "root/A/Org/A/brief.pdf",
                b"pdf".to_vec(),
                "application/pdf",
                &[("documentId".into(), "42".into())],
                &[("fv_docid".into(), "42".into())],
            )
            .await
            .unwrap();

        let keys = store.find_keys_by_doc_id("root/A/Org/A", 42).await.unwrap();
        assert_eq!(keys, vec!["root/A/Org/A/brief.pdf".to_string()]);
        assert!(store.find_keys_by_doc_id("root/A/Org/A", 7).await.unwrap().is_empty());
    }
}
