//! Sequential in-memory key-value state machine.

use std::collections::BTreeMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::apply_to_map;
use super::KvCommand;
use crate::Entry;
use crate::GroupId;
use crate::QueryResult;
use crate::ReplicaId;
use crate::Result;
use crate::SnapshotReader;
use crate::SnapshotWriter;
use crate::StateMachine;
use crate::StorageError;
use crate::UpdateResult;

/// Plain map behind a lock. The host serializes every call on a sequential
/// instance, so the lock only exists to make the snapshot staging swap
/// explicit.
pub struct MemoryKvStateMachine {
    group_id: GroupId,
    replica_id: ReplicaId,
    state: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
    closed: AtomicBool,
}

impl MemoryKvStateMachine {
    pub fn new(
        group_id: GroupId,
        replica_id: ReplicaId,
    ) -> Self {
        MemoryKvStateMachine {
            group_id,
            replica_id,
            state: RwLock::new(BTreeMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// NOTE: This method may degrade system performance. Use with caution.
    pub fn len(&self) -> usize {
        self.state.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl StateMachine for MemoryKvStateMachine {
    fn update(
        &self,
        entries: Vec<Entry>,
    ) -> Result<Vec<UpdateResult>> {
        let mut map = self.state.write();
        let mut results = Vec::with_capacity(entries.len());
        for entry in entries {
            let command = KvCommand::decode(entry.index, &entry.command)?;
            results.push(apply_to_map(&mut map, entry.index, command)?);
        }
        Ok(results)
    }

    fn lookup(
        &self,
        query: &[u8],
    ) -> Result<QueryResult> {
        let map = self.state.read();
        Ok(QueryResult {
            data: map.get(query).cloned().unwrap_or_default(),
        })
    }

    async fn save_snapshot(
        &self,
        sink: &mut SnapshotWriter,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let blob = {
            let map = self.state.read();
            bincode::serialize(&*map).map_err(StorageError::BincodeError)?
        };
        sink.write_blob(&blob, cancel).await
    }

    async fn recover_from_snapshot(
        &self,
        source: &mut SnapshotReader,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let blob = source.read_blob(cancel).await?;
        let recovered: BTreeMap<Vec<u8>, Vec<u8>> =
            bincode::deserialize(&blob).map_err(|e| crate::SnapshotError::Corrupt {
                location: format!("key-value state decode: {e}"),
            })?;

        // Swap only after the whole state is staged; a cancelled or failed
        // recovery above leaves the previous state intact.
        *self.state.write() = recovered;
        Ok(())
    }

    fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!(group = self.group_id, replica = self.replica_id, "memory kv state machine closed");
        }
        Ok(())
    }
}
