//! Opaque document handles and the storage backend seam.
//!
//! The cache never assumes where a document physically lives. A
//! [`DocumentHandle`] is a stable string reference (serializable across
//! process restarts); a [`StorageBackend`] turns it into byte streams.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};

/// Scheme prefixes that identify cloud-storage providers. Classification
/// is deliberately coarse: a prefix match, never an exact handle value.
const CLOUD_PREFIXES: &[&str] = &["cloud://", "gdrive://", "dropbox://", "onedrive://"];

/// Opaque reference to a document. The string form is the persisted
/// representation; nothing else about it is interpreted outside of
/// [`DocumentHandle::class`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentHandle(String);

impl DocumentHandle {
    pub fn new(uri: impl Into<String>) -> Self {
        Self(uri.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Coarse classification of the handle's backend category.
    pub fn class(&self) -> HandleClass {
        if self.0.starts_with('/') || self.0.starts_with("file://") {
            return HandleClass::Local;
        }
        if CLOUD_PREFIXES.iter().any(|p| self.0.starts_with(p)) {
            return HandleClass::Cloud;
        }
        HandleClass::Unknown
    }
}

impl std::fmt::Display for DocumentHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Backend category of a handle. Cloud handles typically get a weaker
/// consistency mode because their round-trip latency makes the full
/// read-verify-write protocol impractical.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleClass {
    Local,
    Cloud,
    Unknown,
}

/// Byte-stream access to documents behind opaque handles.
///
/// This is the only contract the sync layer depends on; how handles are
/// obtained (pickers, intents) is the caller's business.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Open the document for reading.
    async fn open_for_read(
        &self,
        handle: &DocumentHandle,
    ) -> io::Result<Box<dyn AsyncRead + Send + Unpin>>;

    /// Open the document for writing, truncating any existing content.
    async fn open_for_write(
        &self,
        handle: &DocumentHandle,
    ) -> io::Result<Box<dyn AsyncWrite + Send + Unpin>>;

    /// Classify the handle's backend category.
    fn classify(&self, handle: &DocumentHandle) -> HandleClass {
        handle.class()
    }

    /// Best-effort resolution of a real local filesystem path, so the
    /// cache can skip copying when the handle is already a writable
    /// local file. `None` means "copy through".
    fn resolve_local_path(&self, _handle: &DocumentHandle) -> Option<PathBuf> {
        None
    }
}

/// Plain-filesystem backend: handles are absolute paths or `file://`
/// URIs. Used for local/removable documents and as the test backend.
pub struct LocalFileBackend;

impl LocalFileBackend {
    pub fn path_of(handle: &DocumentHandle) -> io::Result<PathBuf> {
        let raw = handle.as_str();
        let path = raw.strip_prefix("file://").unwrap_or(raw);
        if !path.starts_with('/') {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("not a local handle: {}", raw),
            ));
        }
        Ok(PathBuf::from(path))
    }
}

#[async_trait]
impl StorageBackend for LocalFileBackend {
    async fn open_for_read(
        &self,
        handle: &DocumentHandle,
    ) -> io::Result<Box<dyn AsyncRead + Send + Unpin>> {
        let path = Self::path_of(handle)?;
        let file = tokio::fs::File::open(&path).await?;
        Ok(Box::new(file))
    }

    async fn open_for_write(
        &self,
        handle: &DocumentHandle,
    ) -> io::Result<Box<dyn AsyncWrite + Send + Unpin>> {
        let path = Self::path_of(handle)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = tokio::fs::File::create(&path).await?;
        Ok(Box::new(file))
    }

    fn resolve_local_path(&self, handle: &DocumentHandle) -> Option<PathBuf> {
        let path = Self::path_of(handle).ok()?;
        let meta = std::fs::metadata(&path).ok()?;
        if meta.is_file() && !meta.permissions().readonly() {
            Some(path)
        } else {
            None
        }
    }
}

/// Convenience: build a local handle from a filesystem path.
pub fn handle_for_path(path: &Path) -> DocumentHandle {
    DocumentHandle::new(path.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_local_and_cloud_handles() {
        assert_eq!(DocumentHandle::new("/tmp/a.txt").class(), HandleClass::Local);
        assert_eq!(
            DocumentHandle::new("file:///tmp/a.txt").class(),
            HandleClass::Local
        );
        assert_eq!(
            DocumentHandle::new("gdrive://abc/doc").class(),
            HandleClass::Cloud
        );
        assert_eq!(
            DocumentHandle::new("content://provider/doc").class(),
            HandleClass::Unknown
        );
    }

    #[test]
    fn path_of_rejects_non_local_handles() {
        let err = LocalFileBackend::path_of(&DocumentHandle::new("gdrive://abc")).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn local_backend_round_trip() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("doc.txt");
        let handle = handle_for_path(&path);

        let backend = LocalFileBackend;
        let mut w = backend.open_for_write(&handle).await.unwrap();
        w.write_all(b"hello").await.unwrap();
        w.shutdown().await.unwrap();

        let mut r = backend.open_for_read(&handle).await.unwrap();
        let mut out = String::new();
        r.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "hello");
    }

    #[test]
    fn resolve_local_path_requires_existing_writable_file() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("doc.txt");
        let handle = handle_for_path(&path);
        let backend = LocalFileBackend;

        assert!(backend.resolve_local_path(&handle).is_none());

        std::fs::write(&path, "x").unwrap();
        assert_eq!(backend.resolve_local_path(&handle), Some(path));
    }
}
