//! Orchestrator: project discovery, hydration, watchers, and the poll loop.
//!
//! Startup order matters: every discovered project is hydrated serially
//! before any watcher starts, so a watcher never interprets hydration
//! downloads as local creations. After that, each project gets a watcher
//! plus one full pass, and a background loop re-discovers projects every
//! five minutes.

use crate::config::{Config, POLL_INTERVAL};
use crate::error::{SyncError, SyncResult};
use crate::object_store::ObjectStore;
use crate::origin::OriginClient;
use crate::paths::sanitize;
use crate::reconcile::{ProjectContext, ReconcileOptions, Reconciler};
use crate::watcher::project_watcher_task;
use fs2::FileExt;
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{mpsc, Mutex};
use tracing::{error, info, warn};

/// Lock file name guarding a mirror root against concurrent orchestrators.
const SYNC_LOCK_FILENAME: &str = ".casebridge-sync.lock";

/// Acquire an exclusive lock on the mirror root. The returned handle
/// must stay alive for the life of the process.
pub fn acquire_sync_lock(root: &Path) -> SyncResult<File> {
    let lock_path = root.join(SYNC_LOCK_FILENAME);
    let lock_file = File::create(&lock_path).map_err(|e| SyncError::io(&lock_path, e))?;
    match lock_file.try_lock_exclusive() {
        Ok(()) => {
            info!("acquired sync lock for {}", root.display());
            Ok(lock_file)
        }
        Err(e) => Err(SyncError::Config(format!(
            "another sync is already running for {}: {}",
            root.display(),
            e
        ))),
    }
}

/// Persisted project-name → origin-id map.
#[derive(Debug)]
pub struct ProjectMap {
    path: PathBuf,
    ids: HashMap<String, i64>,
}

impl ProjectMap {
    pub fn load(path: PathBuf) -> Self {
        let ids = match std::fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(ids) => ids,
                Err(e) => {
                    warn!("project map: unparsable {}: {}; starting empty", path.display(), e);
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };
        Self { path, ids }
    }

    pub fn get(&self, name: &str) -> Option<i64> {
        self.ids.get(name).copied()
    }

    /// Record a resolution and persist atomically.
    pub fn insert(&mut self, name: &str, id: i64) {
        self.ids.insert(name.to_string(), id);
        let json = match serde_json::to_string_pretty(&self.ids) {
            Ok(j) => j,
            Err(e) => {
                error!("project map: serialize failed: {}", e);
                return;
            }
        };
        let tmp = self.path.with_extension("json.tmp");
        let result = std::fs::write(&tmp, json).and_then(|_| std::fs::rename(&tmp, &self.path));
        if let Err(e) = result {
            error!("project map: persist failed {}: {}", self.path.display(), e);
        }
    }
}

pub struct Orchestrator {
    config: Arc<Config>,
    store: Arc<dyn ObjectStore>,
    origin: Option<Arc<OriginClient>>,
    reconciler: Arc<Reconciler>,
    projects: Mutex<ProjectMap>,
    locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
    watched: StdMutex<HashSet<String>>,
}

impl Orchestrator {
    pub fn new(
        config: Arc<Config>,
        store: Arc<dyn ObjectStore>,
        origin: Option<Arc<OriginClient>>,
    ) -> Self {
        let reconciler = Arc::new(Reconciler::new(
            config.clone(),
            store.clone(),
            origin.clone(),
        ));
        let projects = Mutex::new(ProjectMap::load(config.project_map_path.clone()));
        Self {
            config,
            store,
            origin,
            reconciler,
            projects,
            locks: StdMutex::new(HashMap::new()),
            watched: StdMutex::new(HashSet::new()),
        }
    }

    /// Per-project mutex, created on first use. Serializes full passes
    /// and fast-path reconciliations for one project.
    fn project_lock(&self, name: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().expect("lock registry poisoned");
        locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn project_context(&self, name: &str) -> ProjectContext {
        let mut projects = self.projects.lock().await;
        let mut project_id = projects.get(name);
        if project_id.is_none() {
            if let Some(origin) = &self.origin {
                match origin.resolve_project_id(name).await {
                    Ok(Some(id)) => {
                        info!("resolved project '{}' -> {}", name, id);
                        projects.insert(name, id);
                        project_id = Some(id);
                    }
                    Ok(None) => warn!("project '{}' not found on origin", name),
                    Err(e) => warn!("project id lookup failed for '{}': {}", name, e),
                }
            }
        }
        ProjectContext {
            name: name.to_string(),
            local_root: self.config.mirror_root.join(name),
            prefix: self.config.project_prefix(name),
            project_id,
        }
    }

    /// Discover projects from both sides and make each side aware of the
    /// other: remote-only projects get a local directory (seeded with a
    /// `.placeholder` marker), local-only projects get a placeholder
    /// object so other mirrors can discover them.
    async fn discover_projects(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();

        match self.store.list_top_level(&self.config.root_prefix).await {
            Ok(remote) => {
                for name in remote {
                    let name = sanitize(&name);
                    if !names.contains(&name) {
                        names.push(name);
                    }
                }
            }
            Err(e) => error!("project discovery listing failed: {}", e),
        }

        match std::fs::read_dir(&self.config.mirror_root) {
            Ok(entries) => {
                for entry in entries.flatten() {
                    let Ok(file_type) = entry.file_type() else { continue };
                    if !file_type.is_dir() {
                        continue;
                    }
                    let name = entry.file_name().to_string_lossy().into_owned();
                    if name.starts_with('.') {
                        continue;
                    }
                    if !names.contains(&name) {
                        // Local-only: announce it in the object store.
                        let key = format!("{}/.placeholder", self.config.project_prefix(&name));
                        if let Err(e) = self
                            .store
                            .put_bytes(&key, Vec::new(), "application/octet-stream", &[], &[])
                            .await
                        {
                            warn!("cannot seed placeholder for '{}': {}", name, e);
                        }
                        names.push(name);
                    }
                }
            }
            Err(e) => error!("cannot read mirror root: {}", e),
        }

        for name in &names {
            let root = self.config.mirror_root.join(name);
            if !root.is_dir() {
                if let Err(e) = std::fs::create_dir_all(&root) {
                    error!("cannot create project dir {}: {}", root.display(), e);
                    continue;
                }
                // Marker so an empty project tree survives cleanup tools.
                let _ = std::fs::write(root.join(".placeholder"), b"");
                info!("created local project dir {}", root.display());
            }
        }

        names
    }

    async fn run_pass(&self, name: &str, hydrate_only: bool) {
        let lock = self.project_lock(name);
        let _guard = lock.lock().await;
        let ctx = self.project_context(name).await;
        let opts = ReconcileOptions {
            changed_file: None,
            hydrate_only,
        };
        if let Err(e) = self.reconciler.reconcile(&ctx, opts).await {
            error!("[{}] pass failed: {}", name, e);
        }
    }

    /// Start the watcher and its fast-path worker for one project.
    fn start_watcher(self: &Arc<Self>, name: &str) {
        {
            let mut watched = self.watched.lock().expect("watch registry poisoned");
            if !watched.insert(name.to_string()) {
                return;
            }
        }

        let root = self.config.mirror_root.join(name);
        let (tx, mut rx) = mpsc::channel::<PathBuf>(256);
        tokio::spawn(project_watcher_task(root, tx));

        let this = self.clone();
        let name = name.to_string();
        tokio::spawn(async move {
            while let Some(path) = rx.recv().await {
                let lock = this.project_lock(&name);
                let _guard = lock.lock().await;
                let ctx = this.project_context(&name).await;
                let opts = ReconcileOptions {
                    changed_file: Some(path),
                    hydrate_only: false,
                };
                if let Err(e) = this.reconciler.reconcile(&ctx, opts).await {
                    error!("[{}] fast-path reconcile failed: {}", name, e);
                }
            }
        });
    }

    /// Run forever: bootstrap, then poll. Callers race this against a
    /// shutdown signal.
    pub async fn run(self: Arc<Self>) -> SyncResult<()> {
        if !self.config.mirror_root.is_dir() {
            return Err(SyncError::Config(format!(
                "mirror root is not a directory: {}",
                self.config.mirror_root.display()
            )));
        }

        let names = self.discover_projects().await;
        info!("discovered {} projects", names.len());

        // Serial hydration before any watcher exists.
        for name in &names {
            self.run_pass(name, true).await;
        }
        for name in &names {
            self.start_watcher(name);
        }
        for name in &names {
            self.run_pass(name, false).await;
        }

        loop {
            tokio::time::sleep(POLL_INTERVAL).await;
            let names = self.discover_projects().await;
            for name in &names {
                let is_new = {
                    let watched = self.watched.lock().expect("watch registry poisoned");
                    !watched.contains(name)
                };
                if is_new {
                    info!("adopting late-added project '{}'", name);
                    self.run_pass(name, true).await;
                    self.start_watcher(name);
                }
                self.run_pass(name, false).await;
            }
        }
    }
}
