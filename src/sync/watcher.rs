//! Recursive subtree watching over a single-directory primitive.
//!
//! The OS watch primitive covers one directory at a time
//! (`RecursiveMode::NonRecursive`); [`RecursiveWatcher`] extends it to a
//! whole subtree by arming every directory found in an initial walk and
//! re-arming as subdirectories appear and disappear at runtime.
//!
//! Known limitation: files written into a directory between its creation
//! and its watch being armed produce no events.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex;

use dashmap::DashSet;
use notify::event::{AccessKind, AccessMode, ModifyKind, RenameMode};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{broadcast, mpsc};
use walkdir::WalkDir;

use super::SyncError;

/// A raw filesystem event, annotated with the affected absolute path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsEvent {
    /// A file or directory appeared.
    Created(PathBuf),
    /// A file (or unwatched directory) disappeared.
    Deleted(PathBuf),
    /// File content changed.
    Modified(PathBuf),
    /// A file was opened for reading. Not all watch backends report
    /// opens; absence of this event must not be load-bearing.
    OpenedForRead(PathBuf),
    /// A file open for writing was closed.
    ClosedAfterWrite(PathBuf),
    /// A watched directory itself was deleted; its watch is torn down.
    SelfDeleted(PathBuf),
}

impl FsEvent {
    pub fn path(&self) -> &Path {
        match self {
            FsEvent::Created(p)
            | FsEvent::Deleted(p)
            | FsEvent::Modified(p)
            | FsEvent::OpenedForRead(p)
            | FsEvent::ClosedAfterWrite(p)
            | FsEvent::SelfDeleted(p) => p,
        }
    }
}

struct WatchInner {
    /// The OS watcher. `None` until the first `start_watching`, and
    /// again after `stop_watching`.
    backend: Mutex<Option<RecommendedWatcher>>,
    /// Directories with an armed watch.
    armed: DashSet<PathBuf>,
    event_tx: broadcast::Sender<FsEvent>,
}

impl WatchInner {
    /// Arm a single directory. Failures (permissions, watch limits) are
    /// logged and swallowed: that branch loses change notification, the
    /// rest of the subtree keeps working.
    fn arm(&self, dir: &Path) {
        let mut guard = match self.backend.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        let watcher = match guard.as_mut() {
            Some(w) => w,
            None => return,
        };
        // watch() on an already-armed path replaces the old watch.
        match watcher.watch(dir, RecursiveMode::NonRecursive) {
            Ok(()) => {
                self.armed.insert(dir.to_path_buf());
            }
            Err(e) => {
                tracing::warn!("failed to watch {}: {}", dir.display(), e);
            }
        }
    }

    fn disarm(&self, dir: &Path) {
        if self.armed.remove(dir).is_none() {
            return;
        }
        let mut guard = match self.backend.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(watcher) = guard.as_mut() {
            let _ = watcher.unwatch(dir);
        }
    }
}

/// Watches one or more directory subtrees and forwards classified events
/// to broadcast subscribers.
pub struct RecursiveWatcher {
    inner: Arc<WatchInner>,
    pump: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Default for RecursiveWatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl RecursiveWatcher {
    pub fn new() -> Self {
        let (event_tx, _) = broadcast::channel(1024);
        Self {
            inner: Arc::new(WatchInner {
                backend: Mutex::new(None),
                armed: DashSet::new(),
                event_tx,
            }),
            pump: Mutex::new(None),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FsEvent> {
        self.inner.event_tx.subscribe()
    }

    /// Arm a watch on `root` and every directory beneath it. Symlinked
    /// directories are not traversed. May be called for multiple roots;
    /// re-watching an armed root is a no-op walk that re-arms.
    ///
    /// Only a failure to watch the root itself is an error; denied
    /// subdirectories degrade to missing notifications.
    pub fn start_watching(&self, root: &Path) -> Result<(), SyncError> {
        self.ensure_backend()?;

        {
            let mut guard = match self.inner.backend.lock() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            let watcher = guard
                .as_mut()
                .ok_or_else(|| SyncError::Watch("watcher not running".to_string()))?;
            watcher
                .watch(root, RecursiveMode::NonRecursive)
                .map_err(|e| SyncError::Watch(e.to_string()))?;
        }
        self.inner.armed.insert(root.to_path_buf());

        for entry in WalkDir::new(root)
            .min_depth(1)
            .follow_links(false)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if entry.file_type().is_dir() && !entry.path_is_symlink() {
                self.inner.arm(entry.path());
            }
        }
        Ok(())
    }

    /// Tear down every armed watch. Idempotent.
    pub fn stop_watching(&self) {
        {
            let mut guard = match self.inner.backend.lock() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            // Dropping the OS watcher closes its event channel, which
            // ends the pump task.
            guard.take();
        }
        self.inner.armed.clear();
        let pump = match self.pump.lock() {
            Ok(mut g) => g.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = pump {
            handle.abort();
        }
    }

    /// Directories currently holding an armed watch.
    pub fn watched_dirs(&self) -> Vec<PathBuf> {
        self.inner.armed.iter().map(|p| p.clone()).collect()
    }

    pub fn is_watched(&self, dir: &Path) -> bool {
        self.inner.armed.contains(dir)
    }

    /// Lazily create the OS watcher and the pump task that classifies
    /// and forwards its events.
    fn ensure_backend(&self) -> Result<(), SyncError> {
        let mut guard = match self.inner.backend.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        if guard.is_some() {
            return Ok(());
        }

        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let watcher = RecommendedWatcher::new(
            move |res: Result<Event, notify::Error>| {
                // Only forward here; anything heavier could stall or
                // panic the OS dispatch thread.
                let _ = raw_tx.send(res);
            },
            Config::default(),
        )
        .map_err(|e| SyncError::Watch(e.to_string()))?;
        *guard = Some(watcher);
        drop(guard);

        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(pump_events(inner, raw_rx));
        match self.pump.lock() {
            Ok(mut g) => *g = Some(handle),
            Err(poisoned) => *poisoned.into_inner() = Some(handle),
        }
        Ok(())
    }
}

impl Drop for RecursiveWatcher {
    fn drop(&mut self) {
        self.stop_watching();
    }
}

async fn pump_events(
    inner: Arc<WatchInner>,
    mut raw_rx: mpsc::UnboundedReceiver<Result<Event, notify::Error>>,
) {
    while let Some(res) = raw_rx.recv().await {
        let event = match res {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!("watch backend error: {}", e);
                continue;
            }
        };
        for fs_event in classify(&inner, &event) {
            let _ = inner.event_tx.send(fs_event);
        }
    }
}

/// Map a raw backend event onto the closed event set, arming and
/// disarming directory watches as the tree changes shape.
fn classify(inner: &WatchInner, event: &Event) -> Vec<FsEvent> {
    let mut out = Vec::new();
    match &event.kind {
        EventKind::Create(_) => {
            for path in &event.paths {
                arm_if_directory(inner, path);
                out.push(FsEvent::Created(path.clone()));
            }
        }
        EventKind::Remove(_) => {
            for path in &event.paths {
                if inner.armed.contains(path) {
                    inner.disarm(path);
                    out.push(FsEvent::SelfDeleted(path.clone()));
                } else {
                    out.push(FsEvent::Deleted(path.clone()));
                }
            }
        }
        EventKind::Modify(ModifyKind::Name(mode)) => match mode {
            RenameMode::From => {
                for path in &event.paths {
                    if inner.armed.contains(path) {
                        inner.disarm(path);
                        out.push(FsEvent::SelfDeleted(path.clone()));
                    } else {
                        out.push(FsEvent::Deleted(path.clone()));
                    }
                }
            }
            RenameMode::To => {
                for path in &event.paths {
                    arm_if_directory(inner, path);
                    out.push(FsEvent::Created(path.clone()));
                }
            }
            RenameMode::Both => {
                if let [from, to] = event.paths.as_slice() {
                    if inner.armed.contains(from) {
                        inner.disarm(from);
                        out.push(FsEvent::SelfDeleted(from.clone()));
                    } else {
                        out.push(FsEvent::Deleted(from.clone()));
                    }
                    arm_if_directory(inner, to);
                    out.push(FsEvent::Created(to.clone()));
                }
            }
            _ => {
                for path in &event.paths {
                    out.push(FsEvent::Modified(path.clone()));
                }
            }
        },
        EventKind::Modify(ModifyKind::Metadata(_)) => {}
        EventKind::Modify(_) => {
            for path in &event.paths {
                out.push(FsEvent::Modified(path.clone()));
            }
        }
        EventKind::Access(AccessKind::Close(AccessMode::Write)) => {
            for path in &event.paths {
                out.push(FsEvent::ClosedAfterWrite(path.clone()));
            }
        }
        EventKind::Access(AccessKind::Open(_)) => {
            for path in &event.paths {
                out.push(FsEvent::OpenedForRead(path.clone()));
            }
        }
        EventKind::Access(_) | EventKind::Any | EventKind::Other => {}
    }
    out
}

fn arm_if_directory(inner: &WatchInner, path: &Path) {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => inner.arm(path),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    async fn wait_until(deadline: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if cond() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        cond()
    }

    #[tokio::test]
    async fn pre_existing_subtree_is_fully_watched() {
        let temp = tempfile::TempDir::new().unwrap();
        let root = temp.path().to_path_buf();
        std::fs::create_dir_all(root.join("a/b")).unwrap();
        std::fs::create_dir(root.join("x")).unwrap();

        let watcher = RecursiveWatcher::new();
        watcher.start_watching(&root).unwrap();

        assert!(watcher.is_watched(&root));
        assert!(watcher.is_watched(&root.join("a")));
        assert!(watcher.is_watched(&root.join("a/b")));
        assert!(watcher.is_watched(&root.join("x")));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn symlinked_directories_are_not_traversed() {
        let temp = tempfile::TempDir::new().unwrap();
        let root = temp.path().join("root");
        let outside = temp.path().join("outside");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::create_dir_all(&outside).unwrap();
        std::os::unix::fs::symlink(&outside, root.join("link")).unwrap();

        let watcher = RecursiveWatcher::new();
        watcher.start_watching(&root).unwrap();

        assert!(watcher.is_watched(&root));
        assert!(!watcher.is_watched(&root.join("link")));
        assert!(!watcher.is_watched(&outside));
    }

    #[tokio::test]
    async fn directories_created_at_runtime_become_watched() {
        let temp = tempfile::TempDir::new().unwrap();
        let root = temp.path().to_path_buf();
        std::fs::create_dir(root.join("a")).unwrap();

        let watcher = RecursiveWatcher::new();
        watcher.start_watching(&root).unwrap();

        std::fs::create_dir(root.join("a/c")).unwrap();
        let armed = wait_until(Duration::from_secs(3), || {
            watcher.is_watched(&root.join("a/c"))
        })
        .await;
        assert!(armed, "new subdirectory was not armed");
    }

    #[tokio::test]
    async fn file_creation_is_forwarded_with_absolute_path() {
        let temp = tempfile::TempDir::new().unwrap();
        let root = temp.path().to_path_buf();

        let watcher = RecursiveWatcher::new();
        watcher.start_watching(&root).unwrap();
        let mut rx = watcher.subscribe();

        let file = root.join("new.txt");
        std::fs::write(&file, "x").unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        let mut seen = false;
        while let Ok(Ok(event)) = tokio::time::timeout_at(deadline, rx.recv()).await {
            if event.path() == file {
                seen = true;
                break;
            }
        }
        assert!(seen, "no event observed for created file");
    }

    #[tokio::test]
    async fn stop_watching_is_idempotent() {
        let temp = tempfile::TempDir::new().unwrap();
        let watcher = RecursiveWatcher::new();
        watcher.start_watching(temp.path()).unwrap();

        watcher.stop_watching();
        assert!(watcher.watched_dirs().is_empty());
        watcher.stop_watching();

        // A stopped watcher can be re-armed.
        watcher.start_watching(temp.path()).unwrap();
        assert!(watcher.is_watched(temp.path()));
    }
}
