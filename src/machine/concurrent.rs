use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tokio_util::sync::CancellationToken;

use crate::Entry;
use crate::QueryResult;
use crate::Result;
use crate::SnapshotCookie;
use crate::SnapshotReader;
use crate::SnapshotWriter;
use crate::UpdateResult;

/// The concurrent state machine contract.
///
/// `lookup` may execute concurrently with `update` and with other `lookup`
/// calls, but must observe a consistent committed view: the state as of
/// some completed update, never a torn mix of two. `update` calls
/// themselves are never concurrent with each other (single-writer).
/// Implementations should prefer copy-on-write or versioned state over
/// exclusive locks so readers never block the writer indefinitely.
///
/// Snapshotting is two-phase: `prepare_snapshot` freezes a consistent view
/// on the write path and must be fast; `save_snapshot` serializes that view
/// off the write path and may be slow. Writes that land after the prepare
/// must not appear in the snapshot saved from its cookie.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ConcurrentStateMachine: Send + Sync + 'static {
    /// Apply a batch of committed entries in order. Single-writer.
    fn update(
        &self,
        entries: Vec<Entry>,
    ) -> Result<Vec<UpdateResult>>;

    /// Serve a read against some committed state. May run concurrently
    /// with `update`.
    fn lookup(
        &self,
        query: &[u8],
    ) -> Result<QueryResult>;

    /// Capture a consistent point-in-time view without blocking subsequent
    /// writes.
    fn prepare_snapshot(&self) -> Result<SnapshotCookie>;

    /// Serialize the view identified by `cookie` into the sink.
    async fn save_snapshot(
        &self,
        cookie: SnapshotCookie,
        sink: &mut SnapshotWriter,
        cancel: &CancellationToken,
    ) -> Result<()>;

    /// Rebuild the full state from the source, swapping it in atomically
    /// only once fully staged.
    async fn recover_from_snapshot(
        &self,
        source: &mut SnapshotReader,
        cancel: &CancellationToken,
    ) -> Result<()>;

    /// Release owned resources. Idempotent.
    fn close(&self) -> Result<()>;
}
