//! End-to-end reconciler tests against an in-memory object store.

use casebridge::config::Config;
use casebridge::manifest::{self, RecordSource, MANIFEST_FILENAME};
use casebridge::object_store::{MemoryStore, ObjectStore};
use casebridge::reconcile::{ProjectContext, ReconcileOptions, Reconciler};
use casebridge::sidecar::{FileOrigin, SidecarStore};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

struct Harness {
    _tmp: TempDir,
    store: Arc<MemoryStore>,
    reconciler: Reconciler,
    ctx: ProjectContext,
}

impl Harness {
    fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        let mirror = tmp.path().to_path_buf();
        let config = Arc::new(
            Config::build(mirror.clone(), "s3://test-bucket", &HashMap::new()).unwrap(),
        );
        let store = Arc::new(MemoryStore::new());

        let local_root = mirror.join("A");
        std::fs::create_dir_all(&local_root).unwrap();

        let ctx = ProjectContext {
            name: "A".to_string(),
            local_root,
            prefix: config.project_prefix("A"),
            project_id: None,
        };
        let reconciler = Reconciler::new(config, store.clone(), None);
        Self {
            _tmp: tmp,
            store,
            reconciler,
            ctx,
        }
    }

    async fn full_pass(&self) {
        self.reconciler
            .reconcile(&self.ctx, ReconcileOptions::default())
            .await
            .unwrap();
    }

    async fn hydrate(&self) {
        self.reconciler
            .reconcile(
                &self.ctx,
                ReconcileOptions {
                    changed_file: None,
                    hydrate_only: true,
                },
            )
            .await
            .unwrap();
    }

    async fn fast_path(&self, path: PathBuf) {
        self.reconciler
            .reconcile(
                &self.ctx,
                ReconcileOptions {
                    changed_file: Some(path),
                    hydrate_only: false,
                },
            )
            .await
            .unwrap();
    }

    fn key(&self, rel: &str) -> String {
        format!("{}/{}", self.ctx.prefix, rel)
    }

    async fn manifest(&self) -> manifest::Manifest {
        manifest::load(&self.ctx.local_root.join(MANIFEST_FILENAME)).await
    }

    fn sidecars(&self) -> SidecarStore {
        SidecarStore::new(&self.ctx.local_root)
    }

    fn seed_time(&self) -> DateTime<Utc> {
        "2024-01-01T10:00:00Z".parse().unwrap()
    }
}

/// Scenario: fresh project hydration. Remote placeholder + file, empty
/// local tree. Hydration materializes the folder, downloads the file,
/// stamps the sidecar, records both keys, and uploads nothing.
#[tokio::test]
async fn fresh_project_hydration() {
    let h = Harness::new();
    let t = h.seed_time();
    h.store.insert(&h.key("dir/.placeholder"), b"", t);
    h.store.insert(&h.key("dir/x.txt"), b"hello", t);

    h.hydrate().await;

    assert!(h.ctx.local_root.join("dir").is_dir());
    let content = std::fs::read_to_string(h.ctx.local_root.join("dir/x.txt")).unwrap();
    assert_eq!(content, "hello");

    let record = h.sidecars().get("dir/x.txt").await.unwrap();
    assert_eq!(record.origin, FileOrigin::Filevine);

    let manifest = h.manifest().await;
    assert_eq!(manifest["dir/x.txt"].source, RecordSource::S3);
    assert_eq!(manifest["dir/.placeholder"].source, RecordSource::S3);

    // No outbound writes: the store still holds exactly the seeded keys.
    assert_eq!(h.store.keys().len(), 2);
}

/// Invariant: echo idempotence. A download followed by any number of
/// passes with no other activity produces zero uploads and zero deletes.
#[tokio::test]
async fn echo_idempotence_after_hydration() {
    let h = Harness::new();
    let t = h.seed_time();
    h.store.insert(&h.key("dir/x.txt"), b"hello", t);

    h.hydrate().await;
    h.full_pass().await;
    h.full_pass().await;

    // The object was never re-uploaded (its timestamp is untouched) and
    // never deleted.
    let listed = h.store.list_recursive(&h.ctx.prefix).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].last_modified, t);
}

/// Round-trip: two consecutive passes with no external changes produce
/// byte-identical manifests.
#[tokio::test]
async fn pass_idempotence_manifest_bytes() {
    let h = Harness::new();
    let t = h.seed_time();
    h.store.insert(&h.key("dir/.placeholder"), b"", t);
    h.store.insert(&h.key("dir/x.txt"), b"hello", t);
    std::fs::write(h.ctx.local_root.join("local.txt"), b"mine").unwrap();

    // First pass converges the three stores (downloads flip their manifest
    // source from s3 to local on the following pass).
    h.full_pass().await;

    h.full_pass().await;
    let first = std::fs::read(h.ctx.local_root.join(MANIFEST_FILENAME)).unwrap();
    h.full_pass().await;
    let second = std::fs::read(h.ctx.local_root.join(MANIFEST_FILENAME)).unwrap();
    assert_eq!(first, second);
}

/// Scenario: local create via the watcher fast path.
#[tokio::test]
async fn fast_path_uploads_new_local_file() {
    let h = Harness::new();
    std::fs::create_dir_all(h.ctx.local_root.join("dir")).unwrap();
    let path = h.ctx.local_root.join("dir/new.pdf");
    std::fs::write(&path, b"%PDF").unwrap();

    h.fast_path(path).await;

    assert_eq!(h.store.get_bytes(&h.key("dir/new.pdf")).unwrap(), b"%PDF");
    let record = h.sidecars().get("dir/new.pdf").await.unwrap();
    assert_eq!(record.origin, FileOrigin::Local);
}

/// The fast path treats a vanished file as a local delete.
#[tokio::test]
async fn fast_path_mirrors_local_delete() {
    let h = Harness::new();
    let path = h.ctx.local_root.join("gone.txt");
    std::fs::write(&path, b"bytes").unwrap();
    h.fast_path(path.clone()).await;
    assert!(h.store.contains(&h.key("gone.txt")));

    std::fs::remove_file(&path).unwrap();
    h.fast_path(path).await;
    assert!(!h.store.contains(&h.key("gone.txt")));
}

/// The fast path suppresses its own download echo: after hydration the
/// sidecar fingerprint matches the bytes, so the event is a no-op.
#[tokio::test]
async fn fast_path_echo_shield() {
    let h = Harness::new();
    let t = h.seed_time();
    h.store.insert(&h.key("x.txt"), b"hello", t);
    h.hydrate().await;

    h.fast_path(h.ctx.local_root.join("x.txt")).await;

    let listed = h.store.list_recursive(&h.ctx.prefix).await.unwrap();
    assert_eq!(listed[0].last_modified, t, "echo must not re-upload");
}

/// Scenario: remote delete. The previous manifest recorded the key as
/// s3-sourced; the object is gone; the local copy follows.
#[tokio::test]
async fn remote_delete_removes_local_file() {
    let h = Harness::new();
    let t = h.seed_time();
    h.store.insert(&h.key("dir/x.txt"), b"hello", t);
    h.full_pass().await;
    assert!(h.ctx.local_root.join("dir/x.txt").is_file());

    h.store.delete(&h.key("dir/x.txt"));
    h.full_pass().await;

    assert!(!h.ctx.local_root.join("dir/x.txt").exists());
    assert!(!h.manifest().await.contains_key("dir/x.txt"));
}

/// Invariant: deletion causality. A local file the manifest attributes to
/// this side is re-uploaded when its object vanishes, never deleted.
#[tokio::test]
async fn local_sourced_file_reuploads_after_remote_loss() {
    let h = Harness::new();
    std::fs::write(h.ctx.local_root.join("mine.txt"), b"local bytes").unwrap();
    h.full_pass().await;
    assert!(h.store.contains(&h.key("mine.txt")));

    // Object lost upstream without a manifest record of remote ownership.
    h.store.delete(&h.key("mine.txt"));
    h.full_pass().await;

    assert!(h.ctx.local_root.join("mine.txt").is_file());
    assert!(h.store.contains(&h.key("mine.txt")));
}

/// Scenario: timestamp drift with identical bytes. The fingerprint
/// identity wins over any timestamp difference.
#[tokio::test]
async fn identical_bytes_never_transfer() {
    let h = Harness::new();
    let t = h.seed_time();
    h.store.insert(&h.key("x.txt"), b"hello", t);
    h.hydrate().await;

    let before = h.sidecars().get("x.txt").await.unwrap();

    // Pretend the object was touched far in the future.
    h.store
        .set_time(&h.key("x.txt"), Utc::now() + ChronoDuration::minutes(10));
    h.full_pass().await;

    // No download happened: the sidecar mark is untouched.
    let after = h.sidecars().get("x.txt").await.unwrap();
    assert_eq!(before, after);
}

/// Scenario: conflict with a newer local side uploads.
#[tokio::test]
async fn conflict_local_newer_uploads() {
    let h = Harness::new();
    let t = h.seed_time();
    h.store.insert(&h.key("x.txt"), b"old remote", t);
    h.hydrate().await;

    std::fs::write(h.ctx.local_root.join("x.txt"), b"new local").unwrap();
    h.store
        .set_time(&h.key("x.txt"), Utc::now() - ChronoDuration::minutes(10));
    h.full_pass().await;

    assert_eq!(h.store.get_bytes(&h.key("x.txt")).unwrap(), b"new local");
    let record = h.sidecars().get("x.txt").await.unwrap();
    assert_eq!(record.origin, FileOrigin::Local);
    assert_eq!(h.manifest().await["x.txt"].source, RecordSource::Local);
}

/// Conflict with a newer remote side downloads.
#[tokio::test]
async fn conflict_remote_newer_downloads() {
    let h = Harness::new();
    std::fs::write(h.ctx.local_root.join("x.txt"), b"stale local").unwrap();

    h.store.insert(
        &h.key("x.txt"),
        b"fresh remote",
        Utc::now() + ChronoDuration::minutes(10),
    );
    h.full_pass().await;

    let content = std::fs::read(h.ctx.local_root.join("x.txt")).unwrap();
    assert_eq!(content, b"fresh remote");
    let record = h.sidecars().get("x.txt").await.unwrap();
    assert_eq!(record.origin, FileOrigin::Filevine);
}

/// Invariant: skew guard. Differing bytes whose timestamps are within
/// two seconds do not transfer in either direction.
#[tokio::test]
async fn skew_guard_blocks_transfer() {
    let h = Harness::new();
    let path = h.ctx.local_root.join("x.txt");
    std::fs::write(&path, b"local variant").unwrap();
    let local_mtime: DateTime<Utc> =
        DateTime::from(std::fs::metadata(&path).unwrap().modified().unwrap());

    h.store.insert(
        &h.key("x.txt"),
        b"remote variant",
        local_mtime + ChronoDuration::milliseconds(1500),
    );
    h.full_pass().await;

    assert_eq!(std::fs::read(&path).unwrap(), b"local variant");
    assert_eq!(
        h.store.get_bytes(&h.key("x.txt")).unwrap(),
        b"remote variant"
    );
}

/// Round trip: create locally, propagate, delete locally, propagate.
/// The key ends up absent everywhere, including the manifest.
#[tokio::test]
async fn create_propagate_delete_round_trip() {
    let h = Harness::new();
    let path = h.ctx.local_root.join("p.txt");
    std::fs::write(&path, b"payload").unwrap();

    h.full_pass().await;
    assert!(h.store.contains(&h.key("p.txt")));
    assert_eq!(h.manifest().await["p.txt"].source, RecordSource::Local);

    std::fs::remove_file(&path).unwrap();
    h.full_pass().await;

    assert!(!h.store.contains(&h.key("p.txt")));
    assert!(!h.manifest().await.contains_key("p.txt"));
}

/// Invariant: ignore closure. Ignored basenames are never uploaded,
/// downloaded, or recorded.
#[tokio::test]
async fn ignored_files_never_sync() {
    let h = Harness::new();
    std::fs::write(h.ctx.local_root.join("scratch.tmp"), b"x").unwrap();
    std::fs::write(h.ctx.local_root.join("~$draft.docx"), b"y").unwrap();
    std::fs::write(h.ctx.local_root.join("real.txt"), b"z").unwrap();
    h.store.insert(&h.key("Thumbs.db"), b"junk", h.seed_time());

    h.full_pass().await;

    assert!(!h.store.contains(&h.key("scratch.tmp")));
    assert!(!h.store.contains(&h.key("~$draft.docx")));
    assert!(h.store.contains(&h.key("real.txt")));
    assert!(!h.ctx.local_root.join("Thumbs.db").exists());

    let manifest = h.manifest().await;
    assert!(!manifest.contains_key("scratch.tmp"));
    assert!(!manifest.contains_key("thumbs.db"));
    assert!(manifest.contains_key("real.txt"));
}

/// Hydration performs no outbound writes: local-only files stay
/// unuploaded while remote files land.
#[tokio::test]
async fn hydration_is_inbound_only() {
    let h = Harness::new();
    std::fs::write(h.ctx.local_root.join("mine.txt"), b"local").unwrap();
    h.store.insert(&h.key("theirs.txt"), b"remote", h.seed_time());

    h.hydrate().await;

    assert!(!h.store.contains(&h.key("mine.txt")));
    assert!(h.ctx.local_root.join("theirs.txt").is_file());

    let manifest = h.manifest().await;
    assert_eq!(manifest["mine.txt"].source, RecordSource::Local);
    assert_eq!(manifest["theirs.txt"].source, RecordSource::S3);

    // The local file uploads on the first real pass.
    h.full_pass().await;
    assert!(h.store.contains(&h.key("mine.txt")));
}

/// Invariant: case preservation. Downloads use the object's original
/// case; comparison is case-insensitive so no duplicate appears.
#[tokio::test]
async fn case_preserving_download_and_insensitive_compare() {
    let h = Harness::new();
    let t = h.seed_time();
    h.store
        .insert(&h.key("To Client/Exhibit A.PDF"), b"pdf", t);

    h.full_pass().await;
    assert!(h.ctx.local_root.join("To Client/Exhibit A.PDF").is_file());

    // A second pass sees local and remote as the same key.
    h.full_pass().await;
    let manifest = h.manifest().await;
    assert_eq!(manifest.len(), 1);
    assert!(manifest.contains_key("to client/exhibit a.pdf"));
    assert_eq!(h.store.keys().len(), 1);
}

/// Convergence: from a mixed starting state, a bounded number of passes
/// brings all three stores into agreement, and further passes change
/// nothing.
#[tokio::test]
async fn convergence_from_mixed_state() {
    let h = Harness::new();
    let t = h.seed_time();
    h.store.insert(&h.key("docs/.placeholder"), b"", t);
    h.store.insert(&h.key("docs/remote.txt"), b"remote", t);
    std::fs::create_dir_all(h.ctx.local_root.join("notes")).unwrap();
    std::fs::write(h.ctx.local_root.join("notes/local.txt"), b"local").unwrap();

    h.full_pass().await;
    h.full_pass().await;

    // Everything present everywhere.
    assert!(h.ctx.local_root.join("docs/remote.txt").is_file());
    assert!(h.store.contains(&h.key("notes/local.txt")));

    let manifest_before = std::fs::read(h.ctx.local_root.join(MANIFEST_FILENAME)).unwrap();
    h.full_pass().await;
    let manifest_after = std::fs::read(h.ctx.local_root.join(MANIFEST_FILENAME)).unwrap();
    assert_eq!(manifest_before, manifest_after);

    let listed = h.store.list_recursive(&h.ctx.prefix).await.unwrap();
    assert_eq!(listed.len(), 3);
}
