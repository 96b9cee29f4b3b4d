//! The cache and consistency engine.
//!
//! `SyncCache` makes a remotely-addressed document behave like a local
//! file: `load` copies it into the cache directory, watcher events flush
//! local edits back through the storage backend, and a read-before-write
//! hash protocol detects conflicting concurrent edits.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::storage::{DocumentHandle, StorageBackend};

use super::config::SyncConfig;
use super::persist;
use super::watcher::{FsEvent, RecursiveWatcher};
use super::{SyncError, SyncObserver};

const COPY_BUF_SIZE: usize = 8192;

/// One cached document: the handle it came from, where the local copy
/// lives, the content hash as of the last successful sync in either
/// direction, and the last-access stamp that drives eviction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub handle: DocumentHandle,
    pub local_path: PathBuf,
    /// `None` when hashing failed or a write did not stick; forces the
    /// next flush through the full conflict check.
    pub content_hash: Option<String>,
    pub last_touched: u64,
}

/// What a `flush` did. Conflict and unreachable outcomes are also
/// reported through the [`SyncObserver`]; resolution is caller-driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Local bytes were written back to the handle.
    Written,
    /// Remote content already matched the local copy; nothing written.
    InSync,
    /// Remote diverged from both the local and last-known content; the
    /// write-back was withheld.
    Conflict,
    /// The remote could not be read for the consistency check.
    RemoteUnreachable,
}

pub struct SyncCache {
    config: Arc<SyncConfig>,
    backend: Arc<dyn StorageBackend>,
    observer: Arc<dyn SyncObserver>,
    watcher: Arc<RecursiveWatcher>,
    entries: Arc<DashMap<PathBuf, CacheEntry>>,
    /// Set while a `load` is in flight; watch events are dropped to
    /// avoid self-triggered flushes during the copy.
    busy: AtomicBool,
    /// Monotonic last-touched clock. Seeded from the persisted index so
    /// stamps keep increasing across restarts.
    clock: AtomicU64,
    /// Pending post-write re-check tasks, keyed by local path. A
    /// subsequent flush of the same path cancels the stale check.
    rechecks: Arc<DashMap<PathBuf, tokio::task::AbortHandle>>,
}

impl SyncCache {
    pub fn new(
        config: Arc<SyncConfig>,
        backend: Arc<dyn StorageBackend>,
        observer: Arc<dyn SyncObserver>,
        watcher: Arc<RecursiveWatcher>,
    ) -> Self {
        Self {
            config,
            backend,
            observer,
            watcher,
            entries: Arc::new(DashMap::new()),
            busy: AtomicBool::new(false),
            clock: AtomicU64::new(0),
            rechecks: Arc::new(DashMap::new()),
        }
    }

    /// Copy the handle's content into `local_path`, replacing whatever
    /// was there, and start tracking the pair. Returns the effective
    /// local path: when the handle already resolves to a writable local
    /// file, that file is used in place and no copy is made.
    pub async fn load(
        &self,
        handle: &DocumentHandle,
        local_path: &Path,
    ) -> Result<PathBuf, SyncError> {
        let _busy = BusyGuard::hold(&self.busy);

        if let Some(resolved) = self.backend.resolve_local_path(handle) {
            tracing::debug!(
                "handle {} resolves to local file {}, skipping copy",
                handle,
                resolved.display()
            );
            let hash = hash_file(&resolved).await.ok();
            self.record_entry(handle.clone(), resolved.clone(), hash);
            self.ensure_watched(&resolved);
            self.save_index().await;
            return Ok(resolved);
        }

        let mut source = self
            .backend
            .open_for_read(handle)
            .await
            .map_err(|e| SyncError::SourceUnreadable(e.to_string()))?;

        // Delete-then-recreate; partial writes beyond this are not
        // rolled back.
        if local_path.is_dir() {
            tokio::fs::remove_dir_all(local_path).await?;
        } else if local_path.exists() {
            tokio::fs::remove_file(local_path).await?;
        }
        if let Some(parent) = local_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut dest = tokio::fs::File::create(local_path).await?;
        let mut ctx = md5::Context::new();
        let mut buf = [0u8; COPY_BUF_SIZE];
        loop {
            let n = source.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            ctx.consume(&buf[..n]);
            dest.write_all(&buf[..n]).await?;
        }
        dest.flush().await?;
        drop(dest);

        let hash = format!("{:x}", ctx.compute());
        self.record_entry(handle.clone(), local_path.to_path_buf(), Some(hash));
        self.ensure_watched(local_path);
        self.save_index().await;
        tracing::info!("cached {} at {}", handle, local_path.display());
        Ok(local_path.to_path_buf())
    }

    /// Write the local copy back to its handle.
    ///
    /// With consistency checking enabled and `overwrite` false, the
    /// remote hash is read first: equality with the local hash is a
    /// no-op, divergence from both the local and last-known hash is a
    /// conflict (write withheld, observer notified). `overwrite` is the
    /// caller's conflict resolution and bypasses the check.
    pub async fn flush(
        &self,
        handle: &DocumentHandle,
        local_path: &Path,
        overwrite: bool,
    ) -> Result<FlushOutcome, SyncError> {
        let entry = self
            .entries
            .get(local_path)
            .map(|e| e.clone())
            .ok_or_else(|| SyncError::NotTracked {
                path: local_path.display().to_string(),
            })?;

        let mode = self.config.mode_for(self.backend.classify(handle));
        if !mode.checks_before_write() || overwrite {
            return self.flush_exec(handle, local_path, mode).await;
        }

        let remote_hash = match self.remote_hash(handle).await {
            Ok(h) => h,
            Err(e) => {
                tracing::warn!("remote unreadable for {}: {}", handle, e);
                self.observer.on_remote_unreachable(handle);
                return Ok(FlushOutcome::RemoteUnreachable);
            }
        };

        let local_hash = hash_file(local_path).await?;
        if remote_hash == local_hash {
            return Ok(FlushOutcome::InSync);
        }
        if entry.content_hash.as_deref() != Some(remote_hash.as_str()) {
            // Remote moved away from both the local copy and what we
            // cached: a genuine concurrent edit.
            tracing::warn!("conflicting remote edit detected for {}", handle);
            self.observer.on_conflict(handle, local_path);
            return Ok(FlushOutcome::Conflict);
        }

        self.flush_exec(handle, local_path, mode).await
    }

    /// The unconditional write-back: stream local bytes to the handle,
    /// update the stored hash from the bytes actually written, and
    /// schedule the post-write re-check when the mode asks for one.
    async fn flush_exec(
        &self,
        handle: &DocumentHandle,
        local_path: &Path,
        mode: super::config::ConsistencyMode,
    ) -> Result<FlushOutcome, SyncError> {
        self.cancel_recheck(local_path);

        let written_hash = match self.copy_local_to_remote(handle, local_path).await {
            Ok(hash) => hash,
            Err(e) => {
                tracing::warn!("write-back failed for {}: {}", handle, e);
                self.observer
                    .on_writeback_failed(handle, local_path, &e.to_string());
                return Err(e);
            }
        };

        let stamp = self.next_stamp();
        if let Some(mut entry) = self.entries.get_mut(local_path) {
            entry.content_hash = Some(written_hash.clone());
            entry.last_touched = stamp;
        }
        self.save_index().await;

        if mode.verifies_after_write() {
            self.schedule_recheck(handle.clone(), local_path.to_path_buf(), written_hash);
        }
        tracing::debug!("flushed {} back to {}", local_path.display(), handle);
        Ok(FlushOutcome::Written)
    }

    async fn copy_local_to_remote(
        &self,
        handle: &DocumentHandle,
        local_path: &Path,
    ) -> Result<String, SyncError> {
        let mut source = tokio::fs::File::open(local_path).await?;
        let mut dest = self.backend.open_for_write(handle).await?;
        let mut ctx = md5::Context::new();
        let mut buf = [0u8; COPY_BUF_SIZE];
        loop {
            let n = source.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            ctx.consume(&buf[..n]);
            dest.write_all(&buf[..n]).await?;
        }
        dest.shutdown().await?;
        Ok(format!("{:x}", ctx.compute()))
    }

    /// Re-read the remote a fixed delay after a write to catch
    /// providers that apply writes asynchronously and silently revert
    /// them. Advisory only: a mismatch is reported and the stored hash
    /// rolled back to unknown, but nothing is retried.
    fn schedule_recheck(&self, handle: DocumentHandle, local_path: PathBuf, expected: String) {
        self.cancel_recheck(&local_path);

        let delay = self.config.write_recheck_delay;
        let backend = Arc::clone(&self.backend);
        let observer = Arc::clone(&self.observer);
        let entries_key = local_path.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let remote = match open_and_hash(backend.as_ref(), &handle).await {
                Ok(h) => h,
                Err(e) => {
                    tracing::debug!("post-write re-check unreadable for {}: {}", handle, e);
                    return None;
                }
            };
            if remote != expected {
                tracing::warn!("write did not stick for {}", handle);
                observer.on_write_verification_failed(&handle, &entries_key);
                return Some(entries_key);
            }
            None
        });

        self.rechecks.insert(local_path.clone(), task.abort_handle());

        // Completion side: clear the pending slot, and on a failed
        // verification forget the stored hash so the next flush runs
        // the full conflict check.
        let entries = Arc::clone(&self.entries);
        let rechecks = Arc::clone(&self.rechecks);
        let key = local_path;
        tokio::spawn(async move {
            let mismatch = matches!(task.await, Ok(Some(_)));
            rechecks.remove(&key);
            if mismatch {
                if let Some(mut entry) = entries.get_mut(&key) {
                    entry.content_hash = None;
                }
            }
        });
    }

    fn cancel_recheck(&self, local_path: &Path) {
        if let Some((_, abort)) = self.rechecks.remove(local_path) {
            abort.abort();
        }
    }

    /// Bump the last-touched stamp for a cached document that was
    /// re-opened without a fresh load.
    pub fn touch(&self, local_path: &Path) {
        let stamp = self.next_stamp();
        if let Some(mut entry) = self.entries.get_mut(local_path) {
            entry.last_touched = stamp;
        }
    }

    pub fn entry(&self, local_path: &Path) -> Option<CacheEntry> {
        self.entries.get(local_path).map(|e| e.clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All entries, most recently touched first.
    pub fn mru(&self) -> Vec<CacheEntry> {
        let mut all: Vec<CacheEntry> = self.entries.iter().map(|e| e.clone()).collect();
        all.sort_by(|a, b| b.last_touched.cmp(&a.last_touched));
        all
    }

    /// Evict the oldest quarter of entries once the count exceeds the
    /// configured maximum, deleting their local files and pruning
    /// directories left empty. A single pass; the count may still be
    /// above the maximum afterwards for very full caches.
    pub async fn clear_old_cache(&self) {
        let len = self.entries.len();
        let max = self.config.effective_max_entries();
        if len <= max {
            return;
        }
        let evict = (len + 3) / 4;
        tracing::info!("cache at {} entries (max {}), evicting {}", len, max, evict);

        let mut stamps: Vec<(PathBuf, u64)> = self
            .entries
            .iter()
            .map(|e| (e.key().clone(), e.last_touched))
            .collect();
        stamps.sort_by_key(|(_, touched)| *touched);

        for (path, _) in stamps.into_iter().take(evict) {
            self.cancel_recheck(&path);
            self.entries.remove(&path);
            if let Err(e) = tokio::fs::remove_file(&path).await {
                tracing::debug!("failed to remove evicted {}: {}", path.display(), e);
            }
            self.prune_empty_dirs(&path).await;
        }
        self.save_index().await;
    }

    /// Unconditionally empty the cache directory and the entry map, and
    /// stop all watches.
    pub async fn clear_cache(&self) {
        for item in self.rechecks.iter() {
            item.value().abort();
        }
        self.rechecks.clear();
        self.entries.clear();
        self.watcher.stop_watching();

        let mut dir = match tokio::fs::read_dir(&self.config.cache_root).await {
            Ok(dir) => dir,
            Err(_) => return,
        };
        while let Ok(Some(entry)) = dir.next_entry().await {
            let path = entry.path();
            let result = if path.is_dir() {
                tokio::fs::remove_dir_all(&path).await
            } else {
                tokio::fs::remove_file(&path).await
            };
            if let Err(e) = result {
                tracing::debug!("failed to clear {}: {}", path.display(), e);
            }
        }
        tracing::info!("cache cleared");
    }

    /// Remove empty directories between an evicted file and the cache
    /// root.
    async fn prune_empty_dirs(&self, evicted: &Path) {
        let root = &self.config.cache_root;
        let mut dir = evicted.parent();
        while let Some(current) = dir {
            if current == root || !current.starts_with(root) {
                break;
            }
            if tokio::fs::remove_dir(current).await.is_err() {
                break;
            }
            dir = current.parent();
        }
    }

    /// React to a watcher event. Events arriving while a load is in
    /// flight are self-triggered and dropped.
    pub(super) async fn handle_event(&self, event: FsEvent) {
        if self.busy.load(Ordering::SeqCst) {
            return;
        }
        match event {
            FsEvent::ClosedAfterWrite(path) => {
                let handle = match self.entries.get(&path) {
                    Some(entry) => entry.handle.clone(),
                    None => return,
                };
                if let Err(e) = self.flush(&handle, &path, false).await {
                    tracing::warn!("flush after close failed for {}: {}", path.display(), e);
                }
            }
            FsEvent::OpenedForRead(path) => {
                self.touch(&path);
            }
            FsEvent::Deleted(path) | FsEvent::SelfDeleted(path) => {
                if let Some((_, entry)) = self.entries.remove(&path) {
                    self.cancel_recheck(&path);
                    self.save_index().await;
                    // Deleting the remote document is the caller's call.
                    self.observer
                        .on_remote_delete_requested(&entry.handle, &path);
                }
            }
            FsEvent::Created(_) | FsEvent::Modified(_) => {}
        }
    }

    /// Load the persisted entry index. Records for files that no longer
    /// exist locally are dropped.
    pub async fn load_index(&self) {
        let index_path = persist::index_path(&self.config.cache_root);
        let records = persist::load_records(&index_path).await;
        let mut max_stamp = 0u64;
        for entry in records {
            if !entry.local_path.exists() {
                tracing::debug!(
                    "dropping stale index record for {}",
                    entry.local_path.display()
                );
                continue;
            }
            max_stamp = max_stamp.max(entry.last_touched);
            self.entries.insert(entry.local_path.clone(), entry);
        }
        self.clock.fetch_max(max_stamp, Ordering::SeqCst);
        tracing::debug!("restored {} cache entries", self.entries.len());
    }

    async fn save_index(&self) {
        let records = self.mru();
        let index_path = persist::index_path(&self.config.cache_root);
        if let Err(e) = persist::save_records(&index_path, &records).await {
            tracing::warn!("failed to persist cache index: {}", e);
        }
    }

    fn record_entry(&self, handle: DocumentHandle, local_path: PathBuf, hash: Option<String>) {
        let stamp = self.next_stamp();
        self.entries.insert(
            local_path.clone(),
            CacheEntry {
                handle,
                local_path,
                content_hash: hash,
                last_touched: stamp,
            },
        );
    }

    fn ensure_watched(&self, local_path: &Path) {
        let root = &self.config.cache_root;
        let target = if local_path.starts_with(root) {
            root.as_path()
        } else {
            local_path
        };
        if let Err(e) = self.watcher.start_watching(target) {
            tracing::warn!("failed to watch {}: {}", target.display(), e);
        }
    }

    async fn remote_hash(&self, handle: &DocumentHandle) -> Result<String, std::io::Error> {
        open_and_hash(self.backend.as_ref(), handle).await
    }

    /// Strictly increasing stamp, at least wall-clock millis.
    fn next_stamp(&self) -> u64 {
        let now = chrono::Utc::now().timestamp_millis().max(0) as u64;
        let mut prev = self.clock.load(Ordering::SeqCst);
        loop {
            let next = now.max(prev + 1);
            match self
                .clock
                .compare_exchange(prev, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return next,
                Err(actual) => prev = actual,
            }
        }
    }
}

/// RAII guard for the cache-wide busy flag.
struct BusyGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> BusyGuard<'a> {
    fn hold(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self { flag }
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

async fn open_and_hash(
    backend: &dyn StorageBackend,
    handle: &DocumentHandle,
) -> Result<String, std::io::Error> {
    let mut stream = backend.open_for_read(handle).await?;
    let mut ctx = md5::Context::new();
    let mut buf = [0u8; COPY_BUF_SIZE];
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        ctx.consume(&buf[..n]);
    }
    Ok(format!("{:x}", ctx.compute()))
}

/// Hash a local file's bytes.
pub async fn hash_file(path: &Path) -> Result<String, std::io::Error> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut ctx = md5::Context::new();
    let mut buf = [0u8; COPY_BUF_SIZE];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        ctx.consume(&buf[..n]);
    }
    Ok(format!("{:x}", ctx.compute()))
}
