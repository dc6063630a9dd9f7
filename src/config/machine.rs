use std::path::PathBuf;

use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;

use crate::Error;
use crate::Result;

/// State machine instance configuration
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MachineConfig {
    /// Root directory for on-disk state machine storage. Each instance owns
    /// `<data_dir>/group-<group_id>/replica-<replica_id>` exclusively.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Sled page cache capacity in bytes for the on-disk kind
    #[serde(default = "default_sled_cache_capacity")]
    pub sled_cache_capacity: u64,

    /// Background flush interval for the on-disk kind. `None` leaves
    /// durability entirely to explicit `sync` calls.
    #[serde(default = "default_sled_flush_every_ms")]
    pub sled_flush_every_ms: Option<u64>,

    /// Snapshot policy for the on-disk kind: when true, a snapshot carries
    /// a full export of the store, usable to bootstrap a brand-new
    /// replica; when false it carries only the applied watermark and new
    /// replicas are bootstrapped through a streaming transfer.
    #[serde(default = "default_on_disk_full_export")]
    pub on_disk_full_export: bool,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            sled_cache_capacity: default_sled_cache_capacity(),
            sled_flush_every_ms: default_sled_flush_every_ms(),
            on_disk_full_export: default_on_disk_full_export(),
        }
    }
}

impl MachineConfig {
    pub(super) fn validate(&self) -> Result<()> {
        if self.data_dir.as_os_str().is_empty() {
            return Err(Error::Config(ConfigError::Message(
                "data_dir must not be empty".into(),
            )));
        }

        if self.sled_cache_capacity == 0 {
            return Err(Error::Config(ConfigError::Message(
                "sled_cache_capacity must be greater than 0".into(),
            )));
        }

        Ok(())
    }

    /// Storage directory owned by one (group, replica) instance.
    pub fn replica_dir(
        &self,
        group_id: u64,
        replica_id: u64,
    ) -> PathBuf {
        self.data_dir.join(format!("group-{group_id}")).join(format!("replica-{replica_id}"))
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/tmp/rsm")
}
fn default_sled_cache_capacity() -> u64 {
    10 * 1024 * 1024 //10MB
}
fn default_sled_flush_every_ms() -> Option<u64> {
    Some(3)
}
fn default_on_disk_full_export() -> bool {
    true
}
