//! Core engine for a terminal application that edits documents living
//! behind opaque storage handles.
//!
//! Two subsystems live here:
//!
//! - [`sync`] — a local caching and synchronization layer that copies
//!   remotely-addressed documents to local files, watches them for edits,
//!   and flushes changes back to their source with conflict detection.
//! - [`term`] — pty-backed shell sessions and the registry of open
//!   terminal windows.
//!
//! UI concerns (dialogs, menus, pickers) are out of scope; callers wire
//! in a [`storage::StorageBackend`] for document I/O and a
//! [`sync::SyncObserver`] for conflict/error reporting.

pub mod storage;
pub mod sync;
pub mod term;

pub use storage::{DocumentHandle, HandleClass, LocalFileBackend, StorageBackend};
pub use sync::{CacheEntry, FsEvent, SyncConfig, SyncError, SyncObserver, SyncService};
pub use term::{SessionRegistry, SessionState, TermConfig, TerminalSession};
