//! Three-way reconciliation between a project's local tree, its object
//! store prefix, and the previous manifest.
//!
//! The reconciler is the sole mutator of local files and objects during a
//! pass. Callers serialize passes per project; see the orchestrator.
//!
//! Every per-key action is best-effort: a failure is logged and the pass
//! moves on. The manifest written at the end reflects what was observed,
//! so a failed transfer is retried on the next pass.

use crate::config::{Config, SKEW_WINDOW};
use crate::error::SyncResult;
use crate::manifest::{self, Manifest, ManifestRecord, RecordSource, MANIFEST_FILENAME};
use crate::object_store::{ObjectStore, RemoteObject};
use crate::origin::{upload_file, OriginClient};
use crate::paths::{is_ignored, is_placeholder_key, key_depth};
use crate::scanner::{scan_project, LocalFile};
use crate::sidecar::{fingerprint, FileOrigin, SidecarStore, SIDECAR_DIR};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Everything the reconciler needs to know about one project.
#[derive(Debug, Clone)]
pub struct ProjectContext {
    pub name: String,
    pub local_root: PathBuf,
    /// Object-key prefix for this project, no trailing slash.
    pub prefix: String,
    pub project_id: Option<i64>,
}

/// Options for a single reconciliation call.
#[derive(Debug, Clone, Default)]
pub struct ReconcileOptions {
    /// Fast-path: reconcile just this file (watcher events).
    pub changed_file: Option<PathBuf>,
    /// Hydration: inbound writes only. No uploads, no deletes on either
    /// side, no origin uploads.
    pub hydrate_only: bool,
}

pub struct Reconciler {
    config: Arc<Config>,
    store: Arc<dyn ObjectStore>,
    origin: Option<Arc<OriginClient>>,
}

impl Reconciler {
    pub fn new(
        config: Arc<Config>,
        store: Arc<dyn ObjectStore>,
        origin: Option<Arc<OriginClient>>,
    ) -> Self {
        Self {
            config,
            store,
            origin,
        }
    }

    /// Reconcile a project: single-file fast path when `changed_file` is
    /// set, otherwise a full pass.
    pub async fn reconcile(
        &self,
        project: &ProjectContext,
        opts: ReconcileOptions,
    ) -> SyncResult<()> {
        match opts.changed_file {
            Some(path) => {
                if opts.hydrate_only {
                    return Ok(());
                }
                self.fast_path(project, &path).await;
                Ok(())
            }
            None => self.full_pass(project, opts.hydrate_only).await,
        }
    }

    // -----------------------------------------------------------------
    // Fast path
    // -----------------------------------------------------------------

    /// Mirror one local change outward: upload if the file exists, delete
    /// the object if it does not. The fingerprint echo shield keeps the
    /// watcher's own download echoes from re-uploading.
    async fn fast_path(&self, project: &ProjectContext, path: &Path) {
        if path.is_dir() {
            return;
        }
        let Some(name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
            return;
        };
        if is_ignored(&name) {
            return;
        }
        let Ok(rel) = path.strip_prefix(&project.local_root) else {
            return;
        };
        let rel = rel.to_string_lossy().replace('\\', "/");
        if rel.starts_with(&format!("{}/", SIDECAR_DIR)) {
            return;
        }

        let sidecars = SidecarStore::new(&project.local_root);
        let key = format!("{}/{}", project.prefix, rel);

        if path.is_file() {
            let Some(current) = fingerprint(path).await else {
                warn!("[{}] cannot fingerprint {}; skipping", project.name, rel);
                return;
            };
            if let Some(record) = sidecars.get(&rel).await {
                if record.fingerprint == current {
                    debug!("[{}] echo suppressed for {}", project.name, rel);
                    return;
                }
            }
            match self.store.copy_up(path, &key).await {
                Ok(()) => {
                    info!("[{}] uploaded {}", project.name, rel);
                    sidecars.mark(&rel, FileOrigin::Local, current).await;
                    self.origin_upload(project, path, &rel).await;
                }
                Err(e) => error!("[{}] upload failed for {}: {}", project.name, rel, e),
            }
        } else {
            match self.store.remove(&key).await {
                Ok(()) => info!("[{}] removed object for deleted {}", project.name, rel),
                Err(e) => error!("[{}] delete failed for {}: {}", project.name, rel, e),
            }
            sidecars.remove(&rel).await;
        }
    }

    /// Forward a local file to the origin when configured.
    async fn origin_upload(&self, project: &ProjectContext, path: &Path, rel: &str) {
        if !self.config.enable_origin_upload {
            return;
        }
        let Some(origin) = &self.origin else { return };
        let Some(project_id) = project.project_id.filter(|id| *id > 0) else {
            return;
        };

        let folder_subpath = match rel.rsplit_once('/') {
            Some((parent, _)) => parent.to_string(),
            None => String::new(),
        };
        if let Err(e) = upload_file(
            origin,
            project_id,
            path,
            &folder_subpath,
            self.config.root_folder_id,
            self.config.require_resolved,
        )
        .await
        {
            error!(
                "[{}] origin upload failed for {}: {}",
                project.name, rel, e
            );
        }
    }

    // -----------------------------------------------------------------
    // Full pass
    // -----------------------------------------------------------------

    async fn full_pass(&self, project: &ProjectContext, hydrate_only: bool) -> SyncResult<()> {
        if !hydrate_only {
            if let (Some(origin), Some(webhook), Some(pid)) = (
                self.origin.as_ref(),
                self.config.webhook_url.as_deref(),
                project.project_id,
            ) {
                origin.refresh_project(webhook, pid).await;
            }
        }

        let manifest_path = project.local_root.join(MANIFEST_FILENAME);
        let previous = manifest::load(&manifest_path).await;
        let local = scan_project(&project.local_root)?;

        let remote = match self.store.list_recursive(&project.prefix).await {
            Ok(objects) => objects,
            Err(e) => {
                // A failed listing must not masquerade as an empty store:
                // that would look like a remote mass-delete.
                error!("[{}] listing failed, pass skipped: {}", project.name, e);
                return Ok(());
            }
        };
        let mut s3: BTreeMap<String, RemoteObject> = BTreeMap::new();
        for obj in remote {
            let basename = obj.rel_original.rsplit('/').next().unwrap_or(&obj.rel_original);
            if !is_placeholder_key(&obj.rel_original) && is_ignored(basename) {
                continue;
            }
            s3.insert(obj.rel_original.to_lowercase(), obj);
        }

        let mut keys: BTreeSet<String> = BTreeSet::new();
        keys.extend(local.keys().cloned());
        keys.extend(s3.keys().cloned());
        keys.extend(previous.keys().cloned());
        let ordered = order_keys(keys);

        let sidecars = SidecarStore::new(&project.local_root);
        let mut next = Manifest::new();

        for key in &ordered {
            let state = KeyState {
                local: local.get(key),
                s3: s3.get(key),
                prev: previous.get(key),
            };
            self.reconcile_key(project, &sidecars, key, state, hydrate_only, &mut next)
                .await;
        }

        manifest::save(&manifest_path, &next).await?;
        info!(
            "[{}] pass complete: {} keys tracked{}",
            project.name,
            next.len(),
            if hydrate_only { " (hydrate)" } else { "" }
        );
        Ok(())
    }

    async fn reconcile_key(
        &self,
        project: &ProjectContext,
        sidecars: &SidecarStore,
        key: &str,
        state: KeyState<'_>,
        hydrate_only: bool,
        next: &mut Manifest,
    ) {
        // Placeholders materialize folders; they never move as content.
        if is_placeholder_key(key) {
            if let Some(obj) = state.s3 {
                if let Some((dir_rel, _)) = obj.rel_original.rsplit_once('/') {
                    let dir = project.local_root.join(dir_rel);
                    if let Err(e) = tokio::fs::create_dir_all(&dir).await {
                        error!("[{}] cannot create {}: {}", project.name, dir.display(), e);
                    }
                }
                next.insert(
                    key.to_string(),
                    ManifestRecord {
                        source: RecordSource::S3,
                        last_modified: obj.last_modified,
                        rel_original: Some(obj.rel_original.clone()),
                    },
                );
            } else if let Some(prev) = state.prev {
                // Placeholders never appear in the local scan, so a key
                // missing from the listing carries forward.
                next.insert(key.to_string(), prev.clone());
            }
            return;
        }

        match (state.local, state.s3) {
            (Some(local), Some(remote)) => {
                self.compare_both(project, sidecars, key, local, remote, hydrate_only, next)
                    .await;
            }
            (Some(local), None) => {
                let remotely_deleted =
                    matches!(state.prev, Some(prev) if prev.source == RecordSource::S3);
                if remotely_deleted {
                    if hydrate_only {
                        if let Some(prev) = state.prev {
                            next.insert(key.to_string(), prev.clone());
                        }
                        return;
                    }
                    let path = project.local_root.join(&local.rel_original);
                    match tokio::fs::remove_file(&path).await {
                        Ok(()) => info!(
                            "[{}] removed {} (deleted remotely)",
                            project.name, local.rel_original
                        ),
                        Err(e) => {
                            error!("[{}] cannot remove {}: {}", project.name, path.display(), e);
                            // Keep tracking it so the delete is retried.
                            next.insert(
                                key.to_string(),
                                state.prev.cloned().unwrap_or(ManifestRecord {
                                    source: RecordSource::S3,
                                    last_modified: local.last_modified,
                                    rel_original: Some(local.rel_original.clone()),
                                }),
                            );
                        }
                    }
                    sidecars.remove(&local.rel_original).await;
                } else {
                    self.upload_new_local(project, sidecars, key, local, hydrate_only, next)
                        .await;
                }
            }
            (None, Some(remote)) => {
                let locally_deleted =
                    matches!(state.prev, Some(prev) if prev.source == RecordSource::Local);
                if locally_deleted {
                    if hydrate_only {
                        if let Some(prev) = state.prev {
                            next.insert(key.to_string(), prev.clone());
                        }
                        return;
                    }
                    match self.store.remove(&remote.real_key).await {
                        Ok(()) => info!(
                            "[{}] removed object {} (deleted locally)",
                            project.name, remote.rel_original
                        ),
                        Err(e) => {
                            error!(
                                "[{}] cannot remove object {}: {}",
                                project.name, remote.real_key, e
                            );
                            if let Some(prev) = state.prev {
                                next.insert(key.to_string(), prev.clone());
                            }
                        }
                    }
                } else {
                    self.download_new_remote(project, sidecars, key, remote, next)
                        .await;
                }
            }
            (None, None) => {
                // Gone from both sides; the manifest entry simply drops.
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn compare_both(
        &self,
        project: &ProjectContext,
        sidecars: &SidecarStore,
        key: &str,
        local: &LocalFile,
        remote: &RemoteObject,
        hydrate_only: bool,
        next: &mut Manifest,
    ) {
        let record_local = |next: &mut Manifest| {
            next.insert(
                key.to_string(),
                ManifestRecord {
                    source: RecordSource::Local,
                    last_modified: local.last_modified,
                    rel_original: Some(local.rel_original.clone()),
                },
            );
        };

        let path = project.local_root.join(&local.rel_original);
        let current = fingerprint(&path).await;
        let stored = sidecars.get(&local.rel_original).await;

        // Unchanged bytes never transfer, regardless of timestamps.
        if let (Some(stored), Some(current)) = (&stored, &current) {
            if stored.fingerprint == *current {
                record_local(next);
                return;
            }
        }

        let delta = local.last_modified - remote.last_modified;
        if delta.num_milliseconds().unsigned_abs() < SKEW_WINDOW.as_millis() as u64 {
            debug!("[{}] skew guard holds {} back", project.name, key);
            record_local(next);
            return;
        }

        if local.last_modified > remote.last_modified {
            if hydrate_only {
                record_local(next);
                return;
            }
            let Some(current) = current else {
                warn!("[{}] cannot fingerprint {}; skipping", project.name, key);
                record_local(next);
                return;
            };
            match self.store.copy_up(&path, &remote.real_key).await {
                Ok(()) => {
                    info!("[{}] uploaded newer local {}", project.name, key);
                    sidecars
                        .mark(&local.rel_original, FileOrigin::Local, current)
                        .await;
                    self.origin_upload(project, &path, &local.rel_original).await;
                }
                Err(e) => error!("[{}] upload failed for {}: {}", project.name, key, e),
            }
            record_local(next);
        } else {
            match self.store.copy_down(&remote.real_key, &path).await {
                Ok(()) => {
                    info!("[{}] downloaded newer remote {}", project.name, key);
                    if let Some(fp) = fingerprint(&path).await {
                        sidecars
                            .mark(&local.rel_original, FileOrigin::Filevine, fp)
                            .await;
                    }
                }
                Err(e) => error!("[{}] download failed for {}: {}", project.name, key, e),
            }
            record_local(next);
        }
    }

    async fn upload_new_local(
        &self,
        project: &ProjectContext,
        sidecars: &SidecarStore,
        key: &str,
        local: &LocalFile,
        hydrate_only: bool,
        next: &mut Manifest,
    ) {
        let record = ManifestRecord {
            source: RecordSource::Local,
            last_modified: local.last_modified,
            rel_original: Some(local.rel_original.clone()),
        };

        if hydrate_only {
            next.insert(key.to_string(), record);
            return;
        }

        let path = project.local_root.join(&local.rel_original);
        let current = fingerprint(&path).await;

        // Echo shield: an inbound copy whose bytes have not changed is
        // never re-uploaded, even if its object has vanished upstream.
        if let (Some(stored), Some(current)) = (sidecars.get(&local.rel_original).await, &current) {
            if stored.origin == FileOrigin::Filevine && stored.fingerprint == *current {
                debug!("[{}] echo shield holds {} back", project.name, key);
                next.insert(key.to_string(), record);
                return;
            }
        }

        let Some(current) = current else {
            warn!("[{}] cannot fingerprint {}; skipping", project.name, key);
            next.insert(key.to_string(), record);
            return;
        };

        let object_key = format!("{}/{}", project.prefix, local.rel_original);
        match self.store.copy_up(&path, &object_key).await {
            Ok(()) => {
                info!("[{}] uploaded new local {}", project.name, key);
                sidecars
                    .mark(&local.rel_original, FileOrigin::Local, current)
                    .await;
                self.origin_upload(project, &path, &local.rel_original).await;
            }
            Err(e) => error!("[{}] upload failed for {}: {}", project.name, key, e),
        }
        next.insert(key.to_string(), record);
    }

    async fn download_new_remote(
        &self,
        project: &ProjectContext,
        sidecars: &SidecarStore,
        key: &str,
        remote: &RemoteObject,
        next: &mut Manifest,
    ) {
        // Case-preserving write: the local path takes the object's
        // original-case form.
        let path = project.local_root.join(&remote.rel_original);
        match self.store.copy_down(&remote.real_key, &path).await {
            Ok(()) => {
                info!("[{}] downloaded {}", project.name, key);
                if let Some(fp) = fingerprint(&path).await {
                    sidecars
                        .mark(&remote.rel_original, FileOrigin::Filevine, fp)
                        .await;
                }
            }
            Err(e) => error!("[{}] download failed for {}: {}", project.name, key, e),
        }
        next.insert(
            key.to_string(),
            ManifestRecord {
                source: RecordSource::S3,
                last_modified: remote.last_modified,
                rel_original: Some(remote.rel_original.clone()),
            },
        );
    }
}

struct KeyState<'a> {
    local: Option<&'a LocalFile>,
    s3: Option<&'a RemoteObject>,
    prev: Option<&'a ManifestRecord>,
}

/// Processing order: all placeholders first (folders before files), then
/// shallow before deep, then lexicographic.
pub fn order_keys(keys: BTreeSet<String>) -> Vec<String> {
    let mut ordered: Vec<String> = keys.into_iter().collect();
    ordered.sort_by(|a, b| {
        let rank = |k: &str| (!is_placeholder_key(k) as u8, key_depth(k));
        rank(a).cmp(&rank(b)).then_with(|| a.cmp(b))
    });
    ordered
}
