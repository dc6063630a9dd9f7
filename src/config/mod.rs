//! Configuration for the state machine execution core.
//!
//! Provides hierarchical configuration loading with priority:
//! 1. Default values (hardcoded)
//! 2. Optional config file
//! 3. Environment variables (highest priority)

mod machine;
mod snapshot;

pub use machine::*;
pub use snapshot::*;

#[cfg(test)]
mod config_test;

//---
use config::Config;
use config::Environment;
use config::File;
use serde::Deserialize;
use serde::Serialize;

use crate::Result;

#[derive(Debug, Default, Serialize, Deserialize, Clone)]
pub struct Settings {
    /// Snapshot coordinator parameters
    #[serde(default)]
    pub snapshot: SnapshotConfig,
    /// State machine instance parameters
    #[serde(default)]
    pub machine: MachineConfig,
}

impl Settings {
    /// Load configuration from defaults, an optional file and environment
    /// variables, in that priority order.
    ///
    /// Environment overrides use the `RSM` prefix with `__` as the nesting
    /// separator, e.g. `RSM_SNAPSHOT__CHUNK_SIZE=65536`.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = config_path {
            builder = builder.add_source(File::with_name(path));
        }

        builder = builder.add_source(Environment::with_prefix("RSM").separator("__"));

        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        self.snapshot.validate()?;
        self.machine.validate()?;
        Ok(())
    }
}
