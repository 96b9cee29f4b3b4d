use std::path::PathBuf;
use std::time::Duration;

use crate::storage::HandleClass;

/// Hard floor on the configured entry limit.
pub const MIN_CACHE_ENTRIES: usize = 100;

/// How write-back verifies consistency against the remote document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsistencyMode {
    /// Copy local bytes straight to the handle, no checks.
    None,
    /// Read the remote hash before writing; conflicting remote edits
    /// withhold the write-back.
    ReadBefore,
    /// Re-read the remote hash a few seconds after writing to catch
    /// providers that silently revert writes.
    WriteVerify,
    /// Both checks.
    Full,
}

impl ConsistencyMode {
    pub fn checks_before_write(self) -> bool {
        matches!(self, ConsistencyMode::ReadBefore | ConsistencyMode::Full)
    }

    pub fn verifies_after_write(self) -> bool {
        matches!(self, ConsistencyMode::WriteVerify | ConsistencyMode::Full)
    }
}

/// Configuration for the sync layer.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Directory holding the locally cached copies and the entry index.
    pub cache_root: PathBuf,

    /// Maximum cached entries before eviction (floor: [`MIN_CACHE_ENTRIES`]).
    pub max_entries: usize,

    /// Consistency mode for local/removable handles.
    pub local_mode: ConsistencyMode,

    /// Consistency mode for cloud-category handles. Typically weaker:
    /// the full read-verify-write round trip is impractical over
    /// high-latency providers.
    pub cloud_mode: ConsistencyMode,

    /// Delay before the post-write re-check runs.
    pub write_recheck_delay: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        let cache_root = dirs_next::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("termsync");
        Self {
            cache_root,
            max_entries: 300,
            local_mode: ConsistencyMode::Full,
            cloud_mode: ConsistencyMode::None,
            write_recheck_delay: Duration::from_secs(3),
        }
    }
}

impl SyncConfig {
    /// Configured maximum, clamped to the floor.
    pub fn effective_max_entries(&self) -> usize {
        self.max_entries.max(MIN_CACHE_ENTRIES)
    }

    /// Consistency mode for a handle's backend category. Unknown
    /// backends get the local treatment.
    pub fn mode_for(&self, class: HandleClass) -> ConsistencyMode {
        match class {
            HandleClass::Cloud => self.cloud_mode,
            HandleClass::Local | HandleClass::Unknown => self.local_mode,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_entries_is_clamped_to_floor() {
        let config = SyncConfig {
            max_entries: 10,
            ..Default::default()
        };
        assert_eq!(config.effective_max_entries(), MIN_CACHE_ENTRIES);

        let config = SyncConfig {
            max_entries: 500,
            ..Default::default()
        };
        assert_eq!(config.effective_max_entries(), 500);
    }

    #[test]
    fn cloud_handles_get_their_own_mode() {
        let config = SyncConfig::default();
        assert_eq!(config.mode_for(HandleClass::Cloud), ConsistencyMode::None);
        assert_eq!(config.mode_for(HandleClass::Local), ConsistencyMode::Full);
        assert_eq!(config.mode_for(HandleClass::Unknown), ConsistencyMode::Full);
    }
}
