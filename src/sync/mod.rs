//! Local caching and synchronization for documents behind opaque
//! storage handles.

pub mod cache;
pub mod config;
pub mod persist;
pub mod watcher;


use std::path::Path;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::broadcast;

use crate::storage::{DocumentHandle, StorageBackend};

pub use cache::{CacheEntry, FlushOutcome, SyncCache};
pub use config::{ConsistencyMode, SyncConfig, MIN_CACHE_ENTRIES};
pub use watcher::{FsEvent, RecursiveWatcher};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("source unreadable: {0}")]
    SourceUnreadable(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("no cache entry for {path}")]
    NotTracked { path: String },
    #[error("watch error: {0}")]
    Watch(String),
}

/// Conflict/error callback surface the cache exposes to its caller.
/// The UI layer decides how to render these; the cache knows nothing
/// about presentation. All methods default to no-ops.
pub trait SyncObserver: Send + Sync {
    /// Remote content diverged from both the local copy and the
    /// last-known state; the write-back was withheld. Resolution is
    /// caller-driven: re-enter `flush` with `overwrite`, or abandon the
    /// local change.
    fn on_conflict(&self, _handle: &DocumentHandle, _local_path: &Path) {}

    /// The remote could not be read for a consistency check.
    fn on_remote_unreachable(&self, _handle: &DocumentHandle) {}

    /// The delayed post-write re-check found the remote does not match
    /// what was written.
    fn on_write_verification_failed(&self, _handle: &DocumentHandle, _local_path: &Path) {}

    /// Streaming local bytes back to the handle failed.
    fn on_writeback_failed(&self, _handle: &DocumentHandle, _local_path: &Path, _error: &str) {}

    /// The tracked local copy was deleted. The cache has dropped its
    /// entry; whether to delete the remote document is the caller's
    /// decision.
    fn on_remote_delete_requested(&self, _handle: &DocumentHandle, _local_path: &Path) {}
}

/// Observer that ignores everything.
pub struct NullObserver;

impl SyncObserver for NullObserver {}

/// Owns the cache, its watcher, and the event pump tying them together.
/// One instance per owning service lifetime; UI surfaces share it by
/// reference rather than through globals.
pub struct SyncService {
    config: Arc<SyncConfig>,
    watcher: Arc<RecursiveWatcher>,
    cache: Arc<SyncCache>,
    pump: tokio::task::JoinHandle<()>,
}

impl SyncService {
    /// Must be called from within a tokio runtime: the watch event pump
    /// is spawned here.
    pub fn new(
        config: SyncConfig,
        backend: Arc<dyn StorageBackend>,
        observer: Arc<dyn SyncObserver>,
    ) -> Self {
        if let Err(e) = std::fs::create_dir_all(&config.cache_root) {
            tracing::warn!(
                "failed to create cache root {}: {}",
                config.cache_root.display(),
                e
            );
        }

        let config = Arc::new(config);
        let watcher = Arc::new(RecursiveWatcher::new());
        let cache = Arc::new(SyncCache::new(
            config.clone(),
            backend,
            observer,
            watcher.clone(),
        ));
        let pump = spawn_event_pump(cache.clone(), watcher.subscribe());

        Self {
            config,
            watcher,
            cache,
            pump,
        }
    }

    /// Reload the persisted entry index from a previous run.
    pub async fn restore(&self) {
        self.cache.load_index().await;
    }

    pub fn config(&self) -> &SyncConfig {
        self.config.as_ref()
    }

    pub fn cache(&self) -> &Arc<SyncCache> {
        &self.cache
    }

    pub fn watcher(&self) -> &Arc<RecursiveWatcher> {
        &self.watcher
    }

    /// Stop watching and the event pump. Cached files stay on disk.
    pub fn shutdown(&self) {
        self.watcher.stop_watching();
        self.pump.abort();
    }
}

impl Drop for SyncService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Drive watcher events into the cache. Lagged receivers drop events
/// rather than stall the watch thread; a handler failure is logged and
/// never tears the pump down.
fn spawn_event_pump(
    cache: Arc<SyncCache>,
    mut rx: broadcast::Receiver<FsEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => cache.handle_event(event).await,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("event pump lagged, dropped {} events", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
