//! State machine execution contracts.
//!
//! A replication group drives exactly one state machine instance: committed
//! log entries are applied through `update`, reads are served through
//! `lookup`, and the full state is checkpointed and restored through the
//! snapshot operations. Three contracts cover the three concurrency
//! disciplines:
//!
//! - [`StateMachine`]: strictly sequential; the host serializes every call.
//! - [`ConcurrentStateMachine`]: lookups may run concurrently with updates
//!   and must observe a consistent committed view; snapshotting is split
//!   into a fast `prepare` on the write path and a slow `save` off it.
//! - [`OnDiskStateMachine`]: the authoritative state lives in storage the
//!   machine owns; recovery resumes from a persisted applied-index
//!   watermark instead of replaying a snapshot blob.
//!
//! Whatever the kind, state after applying entries `[1..N]` must be a pure
//! deterministic function of those entries' payloads: no wall clock, no
//! unseeded randomness, no dependence on thread scheduling.

mod concurrent;
mod on_disk;
mod variant;

pub mod kv;


use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
pub use concurrent::*;
pub use kv::*;
#[cfg(test)]
use mockall::automock;
pub use on_disk::*;
use serde::Deserialize;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
pub use variant::*;

use crate::Result;
use crate::SnapshotReader;
use crate::SnapshotWriter;

/// Identifier of one independently replicated unit of state.
pub type GroupId = u64;
/// Identifier of a replica within its group.
pub type ReplicaId = u64;

/// One committed log entry, delivered in strictly increasing, gap-free
/// index order. Owned by the group runtime; the payload encoding is opaque
/// to this core.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub index: u64,
    pub term: u64,
    pub command: Vec<u8>,
}

/// Outcome of applying one entry. Opaque to this core, interpreted by the
/// caller of `update`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateResult {
    pub value: u64,
    pub data: Vec<u8>,
}

/// Content of a query response. Produced by `lookup`; never mutates state.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryResult {
    pub data: Vec<u8>,
}

/// Opaque handle to a consistent point-in-time view captured by
/// `prepare_snapshot`. Writes that happen after the prepare must not be
/// visible in the snapshot saved from this cookie.
#[derive(Clone)]
pub struct SnapshotCookie(Arc<dyn Any + Send + Sync>);

impl SnapshotCookie {
    pub fn new<T: Send + Sync + 'static>(view: T) -> Self {
        SnapshotCookie(Arc::new(view))
    }

    pub fn from_arc<T: Send + Sync + 'static>(view: Arc<T>) -> Self {
        SnapshotCookie(view)
    }

    pub fn downcast<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        Arc::clone(&self.0).downcast::<T>().ok()
    }
}

impl std::fmt::Debug for SnapshotCookie {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("SnapshotCookie").finish()
    }
}

/// The sequential state machine contract.
///
/// The host guarantees that no two calls on one instance run concurrently:
/// `update`, `lookup` and the snapshot operations are fully serialized.
/// `update` receives a batch and must apply entries in the given order,
/// producing one result per entry in the same order. A failure on any entry
/// is fatal to the whole batch; the owning handle latches the instance and
/// refuses further updates.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait StateMachine: Send + Sync + 'static {
    /// Apply a batch of committed entries in order.
    fn update(
        &self,
        entries: Vec<Entry>,
    ) -> Result<Vec<UpdateResult>>;

    /// Serve a read against the state as of the last completed `update`.
    fn lookup(
        &self,
        query: &[u8],
    ) -> Result<QueryResult>;

    /// Serialize the full state into the sink. Cancellation is polled at
    /// chunk granularity; a cancelled save leaves the machine untouched.
    async fn save_snapshot(
        &self,
        sink: &mut SnapshotWriter,
        cancel: &CancellationToken,
    ) -> Result<()>;

    /// Rebuild the full state from the source. Implementations must stage
    /// the new state completely before swapping it in, so a cancelled or
    /// failed recovery leaves the previous state intact.
    async fn recover_from_snapshot(
        &self,
        source: &mut SnapshotReader,
        cancel: &CancellationToken,
    ) -> Result<()>;

    /// Release owned resources. Idempotent.
    fn close(&self) -> Result<()>;
}
