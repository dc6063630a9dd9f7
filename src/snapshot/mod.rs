//! This module provides the core abstractions for:
//! - Snapshot data streaming (chunked, checksummed, cancellable)
//! - Snapshot metadata handling
//! - Uniform save/load orchestration over the three state machine kinds

mod coordinator;
mod guard;
mod reader;
mod transfer;
mod writer;

#[cfg(test)]
mod coordinator_test;

use std::path::PathBuf;

pub use coordinator::*;
pub(crate) use guard::*;
pub use reader::*;
use serde::Deserialize;
use serde::Serialize;
pub use transfer::*;
pub use writer::*;

use crate::StateMachineKind;

/// Metadata captured atomically with the snapshot data.
///
/// # Invariants
/// - `last_included_index` must correspond to the last log entry whose
///   effects are contained in the snapshot
/// - `last_included_term` must match the term of that entry
/// - `kind` must match the state machine kind the snapshot was taken from;
///   loading into a different kind is rejected
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub group_id: u64,
    pub replica_id: u64,

    /// The index of the last log entry included in the snapshot
    pub last_included_index: u64,

    /// The term of the last log entry included in the snapshot
    pub last_included_term: u64,

    pub kind: StateMachineKind,
}

/// Reference to an auxiliary file shipped alongside the snapshot body.
///
/// The on-disk kind may point at external files (e.g. an exported SST)
/// instead of inlining all bytes through the chunk stream. Recorded in the
/// snapshot trailer and surfaced by [`SnapshotReader::files`] once the
/// chunk stream is exhausted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotFileRef {
    pub file_id: u64,
    pub path: PathBuf,
    pub metadata: Vec<u8>,
}

/// Lifecycle of one snapshot save/load operation.
///
/// `Preparing` only exists for the concurrent kind (the prepare phase).
/// Terminal states are `Completed`, `Cancelled` and `Failed`; none
/// transition further without a new operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum SnapshotPhase {
    Idle = 0,
    Preparing = 1,
    Streaming = 2,
    Completed = 3,
    Cancelled = 4,
    Failed = 5,
}

impl SnapshotPhase {
    pub(crate) fn from_u8(v: u8) -> SnapshotPhase {
        match v {
            1 => SnapshotPhase::Preparing,
            2 => SnapshotPhase::Streaming,
            3 => SnapshotPhase::Completed,
            4 => SnapshotPhase::Cancelled,
            5 => SnapshotPhase::Failed,
            _ => SnapshotPhase::Idle,
        }
    }
}
