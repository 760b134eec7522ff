//! Per-project filesystem watcher.
//!
//! Watches a project root recursively and forwards affected paths to the
//! project's fast-path reconciliation queue. The watcher callback never
//! blocks: notify events are bridged into a tokio channel and debounced
//! before dispatch. Echo suppression by fingerprint in the reconciler
//! backstops anything that slips through the filters here.

use crate::manifest::MANIFEST_FILENAME;
use crate::paths::is_ignored;
use crate::sidecar::SIDECAR_DIR;
use notify::event::{CreateKind, ModifyKind, RemoveKind, RenameMode};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Debounce window for filesystem events (editors write in bursts).
pub const WATCH_DEBOUNCE_MS: u64 = 500;

/// Whether an event is about a directory rather than a file.
///
/// Directory events never enqueue. A removed directory cannot be stat'd
/// downstream, so the kind reported by the event source is the only
/// reliable signal.
pub fn is_directory_event(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(CreateKind::Folder) | EventKind::Remove(RemoveKind::Folder)
    )
}

/// Whether an event path should be dropped before enqueueing.
///
/// Drops the sidecar tree, the manifest, and ignored basenames. Paths to
/// still-existing directories are caught again by the reconciler's fast
/// path.
pub fn should_drop(project_root: &Path, path: &Path) -> bool {
    if let Some(name) = path.file_name() {
        let name = name.to_string_lossy();
        if name == MANIFEST_FILENAME || is_ignored(&name) {
            return true;
        }
    }
    if let Ok(rel) = path.strip_prefix(project_root) {
        let mut components = rel.components();
        if let Some(first) = components.next() {
            if first.as_os_str() == SIDECAR_DIR {
                return true;
            }
        }
    }
    false
}

/// Task that watches one project root and forwards changed paths.
///
/// Exits when the receiver side of `tx` is dropped or the underlying
/// watcher cannot be created.
pub async fn project_watcher_task(project_root: PathBuf, tx: mpsc::Sender<PathBuf>) {
    let (notify_tx, mut notify_rx) = mpsc::channel::<Result<Event, notify::Error>>(100);

    let mut watcher = match RecommendedWatcher::new(
        move |res| {
            let _ = notify_tx.blocking_send(res);
        },
        Config::default().with_poll_interval(Duration::from_millis(WATCH_DEBOUNCE_MS)),
    ) {
        Ok(w) => w,
        Err(e) => {
            error!("cannot create watcher for {}: {}", project_root.display(), e);
            return;
        }
    };

    if let Err(e) = watcher.watch(&project_root, RecursiveMode::Recursive) {
        error!("cannot watch {}: {}", project_root.display(), e);
        return;
    }
    info!("watching {}", project_root.display());

    let debounce = Duration::from_millis(WATCH_DEBOUNCE_MS);
    let mut pending: BTreeSet<PathBuf> = BTreeSet::new();
    let mut deadline: Option<tokio::time::Instant> = None;

    loop {
        tokio::select! {
            Some(res) = notify_rx.recv() => {
                match res {
                    Ok(event) => {
                        let relevant = matches!(
                            event.kind,
                            EventKind::Create(_) | EventKind::Remove(_)
                        ) || event.kind.is_modify();
                        if !relevant || is_directory_event(&event.kind) {
                            continue;
                        }
                        for path in event.paths {
                            if should_drop(&project_root, &path) {
                                continue;
                            }
                            // Renames arrive as From/To pairs; both sides
                            // get a fast-path look (delete + create).
                            if let EventKind::Modify(ModifyKind::Name(mode)) = event.kind {
                                debug!("rename event ({:?}): {}", mode, path.display());
                            }
                            pending.insert(path);
                        }
                        if !pending.is_empty() {
                            deadline = Some(tokio::time::Instant::now() + debounce);
                        }
                    }
                    Err(e) => warn!("watcher error on {}: {}", project_root.display(), e),
                }
            }
            _ = async {
                match deadline {
                    Some(when) => tokio::time::sleep_until(when).await,
                    None => std::future::pending().await,
                }
            } => {
                deadline = None;
                for path in std::mem::take(&mut pending) {
                    if tx.send(path).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_directory_events_are_dropped() {
        assert!(is_directory_event(&EventKind::Create(CreateKind::Folder)));
        assert!(is_directory_event(&EventKind::Remove(RemoveKind::Folder)));
        assert!(!is_directory_event(&EventKind::Create(CreateKind::File)));
        assert!(!is_directory_event(&EventKind::Remove(RemoveKind::File)));
        assert!(!is_directory_event(&EventKind::Modify(ModifyKind::Any)));
    }

    #[test]
    fn test_should_drop_filters() {
        let root = Path::new("/mirror/CaseA");
        assert!(should_drop(root, &root.join(".last_sync_state.json")));
        assert!(should_drop(root, &root.join(".sync/dir/x.txt.json")));
        assert!(should_drop(root, &root.join("dir/~$draft.docx")));
        assert!(should_drop(root, &root.join("dir/page.crdownload")));
        assert!(should_drop(root, &root.join("dir/.placeholder")));
        assert!(!should_drop(root, &root.join("dir/brief.pdf")));
        assert!(!should_drop(root, &root.join("brief.pdf")));
    }

    #[tokio::test]
    async fn test_watcher_reports_created_file() {
        let dir = tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let (tx, mut rx) = mpsc::channel::<PathBuf>(16);

        let handle = tokio::spawn(project_watcher_task(root.clone(), tx));
        tokio::time::sleep(Duration::from_millis(200)).await;

        fs::write(root.join("new.pdf"), b"content").unwrap();

        let received = tokio::time::timeout(Duration::from_secs(3), rx.recv()).await;
        handle.abort();

        let path = received.expect("timeout").expect("channel closed");
        assert_eq!(path.file_name().unwrap(), "new.pdf");
    }

    #[tokio::test]
    async fn test_watcher_drops_ignored_files() {
        let dir = tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let (tx, mut rx) = mpsc::channel::<PathBuf>(16);

        let handle = tokio::spawn(project_watcher_task(root.clone(), tx));
        tokio::time::sleep(Duration::from_millis(200)).await;

        fs::write(root.join("scratch.tmp"), b"x").unwrap();
        fs::write(root.join("real.txt"), b"y").unwrap();

        // Only the real file should come through.
        let received = tokio::time::timeout(Duration::from_secs(3), rx.recv()).await;
        handle.abort();

        let path = received.expect("timeout").expect("channel closed");
        assert_eq!(path.file_name().unwrap(), "real.txt");
    }
}
