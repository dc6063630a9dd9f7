use std::path::PathBuf;

use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;

use crate::Error;
use crate::Result;

/// Snapshot coordinator configuration
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SnapshotConfig {
    /// Snapshot storage directory
    ///
    /// Default: `default_snapshots_dir()` (/tmp/snapshots)
    #[serde(default = "default_snapshots_dir")]
    pub snapshots_dir: PathBuf,

    /// Size (in bytes) of individual chunks when writing or transferring
    /// snapshots. Cancellation is polled at this granularity.
    ///
    /// Default: `default_chunk_size()` (typically 1MB)
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Compress chunk payloads with zlib before writing
    #[serde(default = "default_compression")]
    pub compression: bool,

    /// Number of historical snapshot files to retain during cleanup
    #[serde(default = "default_cleanup_retain_count")]
    pub cleanup_retain_count: u64,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            snapshots_dir: default_snapshots_dir(),
            chunk_size: default_chunk_size(),
            compression: default_compression(),
            cleanup_retain_count: default_cleanup_retain_count(),
        }
    }
}

impl SnapshotConfig {
    pub(super) fn validate(&self) -> Result<()> {
        if self.snapshots_dir.as_os_str().is_empty() {
            return Err(Error::Config(ConfigError::Message(
                "snapshots_dir must not be empty".into(),
            )));
        }

        // chunk_size should be > 0
        if self.chunk_size == 0 {
            return Err(Error::Config(ConfigError::Message(format!(
                "chunk_size must be at least 1 byte (got {})",
                self.chunk_size
            ))));
        }

        if self.cleanup_retain_count == 0 {
            return Err(Error::Config(ConfigError::Message(
                "cleanup_retain_count must be greater than 0".into(),
            )));
        }

        Ok(())
    }
}

fn default_snapshots_dir() -> PathBuf {
    PathBuf::from("/tmp/snapshots")
}
fn default_chunk_size() -> usize {
    1024 * 1024
}
fn default_compression() -> bool {
    false
}
fn default_cleanup_retain_count() -> u64 {
    2
}
