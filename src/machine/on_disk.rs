use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tokio_util::sync::CancellationToken;

use crate::Entry;
use crate::QueryResult;
use crate::Result;
use crate::SnapshotReader;
use crate::SnapshotWriter;
use crate::UpdateResult;

/// The on-disk state machine contract.
///
/// The authoritative state lives in durable storage the machine itself
/// owns and manages; no other process or instance may open that storage
/// concurrently. Recovery after a restart is driven by the persisted
/// applied-index watermark returned from `open`, not by replaying a
/// snapshot blob.
///
/// # Invariants
/// - Every `update` batch must persist its data changes and the new
///   applied index atomically, in one storage transaction: both or
///   neither. Anything else breaks crash recovery.
/// - After a crash, `open` must return the exact index of the last entry
///   whose effects are durable; replay then resumes at that index + 1 and
///   the entry itself is never re-applied.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait OnDiskStateMachine: Send + Sync + 'static {
    /// Open the owned storage and read back the persisted applied index.
    /// Called exactly once, before any `update`.
    async fn open(
        &self,
        stop: &CancellationToken,
    ) -> Result<u64>;

    /// Apply a batch of committed entries in order, persisting the data
    /// and the new applied index in one transaction.
    fn update(
        &self,
        entries: Vec<Entry>,
    ) -> Result<Vec<UpdateResult>>;

    /// Serve a read. Read/write interleaving is delegated to the storage
    /// engine's own concurrency control.
    fn lookup(
        &self,
        query: &[u8],
    ) -> Result<QueryResult>;

    /// Force all previously applied updates durable before returning.
    fn sync(&self) -> Result<()>;

    /// Serialize checkpoint content into the sink. Depending on the
    /// configured policy this is either a full export of the store (used
    /// to bootstrap a brand-new replica) or only the applied watermark,
    /// since the dataset is already durable locally.
    async fn save_snapshot(
        &self,
        sink: &mut SnapshotWriter,
        cancel: &CancellationToken,
    ) -> Result<()>;

    /// Rebuild the store from the source. Implementations must stage into
    /// a clearly-marked incomplete location and swap atomically, so an
    /// interrupted load can safely be overwritten by a later one.
    async fn recover_from_snapshot(
        &self,
        source: &mut SnapshotReader,
        cancel: &CancellationToken,
    ) -> Result<()>;

    /// Release the owned storage. Idempotent.
    fn close(&self) -> Result<()>;
}
