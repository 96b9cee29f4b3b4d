//! Cache index persistence.
//!
//! One JSON record per line (handle, hex hash, stringified timestamp,
//! local path). Line-oriented so an individually malformed record is
//! skipped without discarding the rest of the index.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::storage::DocumentHandle;

use super::cache::CacheEntry;

pub const INDEX_FILE: &str = "cache-index.jsonl";

/// Stable on-disk record shape. The timestamp is a string-encoded
/// integer; anything unparsable skips the record.
#[derive(Debug, Serialize, Deserialize)]
struct IndexRecord {
    handle: String,
    hash: Option<String>,
    touched: String,
    path: String,
}

pub fn index_path(cache_root: &Path) -> PathBuf {
    cache_root.join(INDEX_FILE)
}

/// Read the index, skipping malformed lines individually.
pub async fn load_records(path: &Path) -> Vec<CacheEntry> {
    let data = match tokio::fs::read_to_string(path).await {
        Ok(data) => data,
        Err(_) => return Vec::new(),
    };

    let mut entries = Vec::new();
    for (lineno, line) in data.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let record: IndexRecord = match serde_json::from_str(line) {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!("skipping malformed index record on line {}: {}", lineno + 1, e);
                continue;
            }
        };
        let touched: u64 = match record.touched.parse() {
            Ok(t) => t,
            Err(_) => {
                tracing::warn!("skipping index record with bad timestamp on line {}", lineno + 1);
                continue;
            }
        };
        entries.push(CacheEntry {
            handle: DocumentHandle::new(record.handle),
            local_path: PathBuf::from(record.path),
            content_hash: record.hash,
            last_touched: touched,
        });
    }
    entries
}

/// Rewrite the index atomically (temp file + rename).
pub async fn save_records(path: &Path, entries: &[CacheEntry]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let mut out = String::new();
    for entry in entries {
        let record = IndexRecord {
            handle: entry.handle.as_str().to_string(),
            hash: entry.content_hash.clone(),
            touched: entry.last_touched.to_string(),
            path: entry.local_path.display().to_string(),
        };
        match serde_json::to_string(&record) {
            Ok(line) => {
                out.push_str(&line);
                out.push('\n');
            }
            Err(e) => {
                tracing::warn!("failed to serialize index record: {}", e);
            }
        }
    }

    let temp = path.with_extension("jsonl.tmp");
    tokio::fs::write(&temp, out).await?;
    tokio::fs::rename(&temp, path).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(path: &str, touched: u64) -> CacheEntry {
        CacheEntry {
            handle: DocumentHandle::new(format!("file://{}", path)),
            local_path: PathBuf::from(path),
            content_hash: Some("d41d8cd98f00b204e9800998ecf8427e".to_string()),
            last_touched: touched,
        }
    }

    #[tokio::test]
    async fn round_trips_records() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = index_path(temp.path());

        let entries = vec![entry("/cache/a.txt", 1), entry("/cache/b.txt", 2)];
        save_records(&path, &entries).await.unwrap();

        let loaded = load_records(&path).await;
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].local_path, PathBuf::from("/cache/a.txt"));
        assert_eq!(loaded[1].last_touched, 2);
        assert_eq!(loaded[0].handle.as_str(), "file:///cache/a.txt");
    }

    #[tokio::test]
    async fn malformed_lines_are_skipped_individually() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = index_path(temp.path());

        save_records(&path, &[entry("/cache/a.txt", 1)]).await.unwrap();
        let mut data = tokio::fs::read_to_string(&path).await.unwrap();
        data.push_str("this is not json\n");
        data.push_str("{\"handle\":\"h\",\"hash\":null,\"touched\":\"NaN\",\"path\":\"/x\"}\n");
        let line = serde_json::to_string(&IndexRecord {
            handle: "file:///cache/b.txt".to_string(),
            hash: None,
            touched: "7".to_string(),
            path: "/cache/b.txt".to_string(),
        })
        .unwrap();
        data.push_str(&line);
        data.push('\n');
        tokio::fs::write(&path, data).await.unwrap();

        let loaded = load_records(&path).await;
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[1].last_touched, 7);
        assert_eq!(loaded[1].content_hash, None);
    }

    #[tokio::test]
    async fn missing_index_loads_empty() {
        let temp = tempfile::TempDir::new().unwrap();
        let loaded = load_records(&index_path(temp.path())).await;
        assert!(loaded.is_empty());
    }
}
