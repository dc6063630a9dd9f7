//! On-disk key-value state machine backed by sled.
//!
//! The store is the authoritative copy of the state; nothing is rebuilt
//! from snapshot blobs on a normal restart. Two trees live in one sled
//! database: the data tree and a metadata tree holding the applied
//! watermark. Every `update` batch commits the data mutations and the new
//! watermark in a single sled transaction, which is the invariant crash
//! recovery depends on.
//!
//! Recovery from a full-export snapshot stages a complete replacement
//! store under `gen-<n+1>.part`, finalizes it with an atomic rename to
//! `gen-<n+1>`, and swaps the live handle. `open` always picks the highest
//! complete generation and sweeps `.part` leftovers, so an interrupted
//! recovery is invisible after restart.

use std::path::Path;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use sled::transaction::ConflictableTransactionError;
use sled::Transactional;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::KvCommand;
use crate::constants::META_KEY_LAST_APPLIED_INDEX;
use crate::constants::META_KEY_LAST_APPLIED_TERM;
use crate::constants::STATE_MACHINE_META_TREE;
use crate::constants::STATE_MACHINE_TREE;
use crate::constants::STORE_GENERATION_PREFIX;
use crate::convert::safe_kv;
use crate::convert::safe_vk;
use crate::ApplyError;
use crate::Entry;
use crate::GroupId;
use crate::MachineConfig;
use crate::OnDiskStateMachine;
use crate::QueryResult;
use crate::ReplicaId;
use crate::Result;
use crate::SnapshotError;
use crate::SnapshotReader;
use crate::SnapshotWriter;
use crate::StorageError;
use crate::UpdateResult;

pub struct SledKvStateMachine {
    group_id: GroupId,
    replica_id: ReplicaId,

    /// Directory exclusively owned by this instance; generations of the
    /// store live underneath it.
    root_dir: PathBuf,
    cache_capacity: u64,
    flush_every_ms: Option<u64>,
    full_export: bool,

    db: ArcSwapOption<sled::Db>,

    /// In-memory copy of the persisted watermark (atomic operation ensures
    /// lock-free reads); the durable copy lives in the metadata tree.
    last_applied_index: AtomicU64,
    last_applied_term: AtomicU64,

    closed: AtomicBool,
}

impl SledKvStateMachine {
    pub fn new(
        group_id: GroupId,
        replica_id: ReplicaId,
        config: &MachineConfig,
    ) -> Self {
        SledKvStateMachine {
            group_id,
            replica_id,
            root_dir: config.replica_dir(group_id, replica_id),
            cache_capacity: config.sled_cache_capacity,
            flush_every_ms: config.sled_flush_every_ms,
            full_export: config.on_disk_full_export,
            db: ArcSwapOption::const_empty(),
            last_applied_index: AtomicU64::new(0),
            last_applied_term: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// The persisted watermark as seen in memory:
    /// (last_applied_index, last_applied_term).
    pub fn last_applied(&self) -> (u64, u64) {
        (
            self.last_applied_index.load(Ordering::SeqCst),
            self.last_applied_term.load(Ordering::SeqCst),
        )
    }

    fn db(&self) -> Result<Arc<sled::Db>> {
        self.db.load_full().ok_or_else(|| StorageError::NotOpen.into())
    }

    fn data_tree(&self) -> Result<sled::Tree> {
        Ok(self.db()?.open_tree(STATE_MACHINE_TREE)?)
    }

    fn meta_tree(&self) -> Result<sled::Tree> {
        Ok(self.db()?.open_tree(STATE_MACHINE_META_TREE)?)
    }

    fn open_store(
        &self,
        path: &Path,
    ) -> Result<sled::Db> {
        sled::Config::default()
            .path(path)
            .cache_capacity(self.cache_capacity)
            .flush_every_ms(self.flush_every_ms)
            .use_compression(true)
            .compression_factor(1)
            .open()
            .map_err(|e| {
                warn!("Try to open DB at this location: {:?} and failed: {:?}", path, e);
                StorageError::DbError(e.to_string()).into()
            })
    }

    fn load_watermark(meta_tree: &sled::Tree) -> Result<(u64, u64)> {
        let index = meta_tree
            .get(META_KEY_LAST_APPLIED_INDEX)?
            .map(safe_vk)
            .unwrap_or(Ok(0))?;

        let term = meta_tree
            .get(META_KEY_LAST_APPLIED_TERM)?
            .map(safe_vk)
            .unwrap_or(Ok(0))?;

        Ok((index, term))
    }

    fn generation_dir(
        &self,
        generation: u64,
    ) -> PathBuf {
        self.root_dir.join(format!("{STORE_GENERATION_PREFIX}{generation}"))
    }

    /// Highest complete generation under the root, sweeping stale `.part`
    /// staging directories left by interrupted recoveries.
    fn scan_generations(&self) -> Result<Option<u64>> {
        let entries = match std::fs::read_dir(&self.root_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(StorageError::PathError {
                    path: self.root_dir.clone(),
                    source: e,
                }
                .into())
            }
        };

        let mut latest = None;
        for entry in entries {
            let entry = entry.map_err(StorageError::IoError)?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(rest) = name.strip_prefix(STORE_GENERATION_PREFIX) else {
                continue;
            };
            if rest.ends_with(".part") {
                debug!(?name, "sweeping incomplete store generation");
                let _ = std::fs::remove_dir_all(entry.path());
                continue;
            }
            let Ok(generation) = rest.parse::<u64>() else { continue };
            latest = latest.max(Some(generation));
        }
        Ok(latest)
    }

    /// Apply decoded commands and the new watermark in one transaction.
    fn apply_transaction(
        &self,
        commands: &[(u64, KvCommand)],
        last_index: u64,
        last_term: u64,
    ) -> Result<Vec<UpdateResult>> {
        let data_tree = self.data_tree()?;
        let meta_tree = self.meta_tree()?;

        let results = (&data_tree, &meta_tree).transaction(|(data, meta)| {
            let mut results = Vec::with_capacity(commands.len());
            for (index, command) in commands {
                match command {
                    KvCommand::Put { key, value } => {
                        data.insert(key.as_slice(), value.as_slice())?;
                        results.push(UpdateResult {
                            value: value.len() as u64,
                            data: Vec::new(),
                        });
                    }
                    KvCommand::Delete { key } => {
                        let previous = data.remove(key.as_slice())?;
                        results.push(UpdateResult {
                            value: previous.is_some() as u64,
                            data: Vec::new(),
                        });
                    }
                    KvCommand::Incr { key } => {
                        let current = match data.get(key.as_slice())? {
                            Some(v) if v.len() == 8 => {
                                let mut buf = [0u8; 8];
                                buf.copy_from_slice(&v);
                                u64::from_be_bytes(buf)
                            }
                            Some(v) => {
                                return Err(ConflictableTransactionError::Abort(
                                    ApplyError::Malformed {
                                        index: *index,
                                        reason: format!("counter value is {} bytes, expected 8", v.len()),
                                    }
                                    .into(),
                                ));
                            }
                            None => 0,
                        };
                        let next = current.wrapping_add(1);
                        data.insert(key.as_slice(), &safe_kv(next))?;
                        results.push(UpdateResult {
                            value: next,
                            data: safe_kv(next).to_vec(),
                        });
                    }
                    KvCommand::Noop => results.push(UpdateResult::default()),
                }
            }

            // The watermark rides in the same transaction as the data:
            // both-or-neither is what makes crash recovery exact.
            meta.insert(META_KEY_LAST_APPLIED_INDEX, &safe_kv(last_index))?;
            meta.insert(META_KEY_LAST_APPLIED_TERM, &safe_kv(last_term))?;
            Ok(results)
        })?;

        Ok(results)
    }
}

#[async_trait]
impl OnDiskStateMachine for SledKvStateMachine {
    async fn open(
        &self,
        stop: &CancellationToken,
    ) -> Result<u64> {
        if stop.is_cancelled() {
            return Err(SnapshotError::Cancelled.into());
        }

        let generation = match self.scan_generations()? {
            Some(generation) => generation,
            None => 0,
        };
        let path = self.generation_dir(generation);
        let db = self.open_store(&path)?;

        let meta_tree = db.open_tree(STATE_MACHINE_META_TREE)?;
        let (index, term) = Self::load_watermark(&meta_tree)?;

        self.last_applied_index.store(index, Ordering::SeqCst);
        self.last_applied_term.store(term, Ordering::SeqCst);
        self.db.store(Some(Arc::new(db)));

        info!(
            group = self.group_id,
            replica = self.replica_id,
            generation,
            applied_index = index,
            "opened on-disk key-value store"
        );
        Ok(index)
    }

    fn update(
        &self,
        entries: Vec<Entry>,
    ) -> Result<Vec<UpdateResult>> {
        if entries.is_empty() {
            return Ok(Vec::new());
        }

        // Decode every payload before touching storage, so a malformed
        // entry fails the batch with nothing written.
        let mut commands = Vec::with_capacity(entries.len());
        for entry in &entries {
            commands.push((entry.index, KvCommand::decode(entry.index, &entry.command)?));
        }
        // Entries arrive ordered and non-empty; the last one carries the
        // new watermark.
        let last_index = entries[entries.len() - 1].index;
        let last_term = entries[entries.len() - 1].term;

        let results = self.apply_transaction(&commands, last_index, last_term)?;

        self.last_applied_index.store(last_index, Ordering::SeqCst);
        self.last_applied_term.store(last_term, Ordering::SeqCst);
        Ok(results)
    }

    fn lookup(
        &self,
        query: &[u8],
    ) -> Result<QueryResult> {
        let data = match self.data_tree()?.get(query)? {
            Some(v) => v.to_vec(),
            None => Vec::new(),
        };
        Ok(QueryResult { data })
    }

    fn sync(&self) -> Result<()> {
        let db = self.db()?;
        let bytes = db.flush()?;
        debug!(group = self.group_id, bytes, "flushed on-disk key-value store");
        Ok(())
    }

    async fn save_snapshot(
        &self,
        sink: &mut SnapshotWriter,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if !self.full_export {
            // Watermark-only snapshot: the dataset is already durable in
            // the store this machine owns; there is nothing to transfer.
            return Ok(());
        }

        let data_tree = self.data_tree()?;
        let chunk_size = sink.chunk_size();

        let mut batch: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
        let mut batch_bytes = 0usize;
        let mut chunks_written = false;

        for item in data_tree.iter() {
            let (k, v) = item?;
            batch_bytes += k.len() + v.len();
            batch.push((k.to_vec(), v.to_vec()));

            if batch_bytes >= chunk_size {
                let payload = bincode::serialize(&batch).map_err(StorageError::BincodeError)?;
                sink.write_chunk(&payload, cancel).await?;
                chunks_written = true;
                batch.clear();
                batch_bytes = 0;
            }
        }

        // The tail batch is written even when empty so a full export is
        // never mistaken for a watermark-only snapshot on recovery.
        if !batch.is_empty() || !chunks_written {
            let payload = bincode::serialize(&batch).map_err(StorageError::BincodeError)?;
            sink.write_chunk(&payload, cancel).await?;
        }
        Ok(())
    }

    async fn recover_from_snapshot(
        &self,
        source: &mut SnapshotReader,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let meta = source.meta().clone();
        let first_chunk = source.next_chunk(cancel).await?;

        let Some(first_chunk) = first_chunk else {
            // Watermark-only snapshot: leave the dataset alone and persist
            // the recovered watermark into the live store.
            let meta_tree = self.meta_tree()?;
            meta_tree.insert(META_KEY_LAST_APPLIED_INDEX, &safe_kv(meta.last_included_index))?;
            meta_tree.insert(META_KEY_LAST_APPLIED_TERM, &safe_kv(meta.last_included_term))?;
            self.db()?.flush()?;
            self.last_applied_index.store(meta.last_included_index, Ordering::SeqCst);
            self.last_applied_term.store(meta.last_included_term, Ordering::SeqCst);
            return Ok(());
        };

        // Full export: stage a complete replacement store, then swap.
        let current_generation = self.scan_generations()?.unwrap_or(0);
        let next_generation = current_generation + 1;
        let final_dir = self.generation_dir(next_generation);
        let staging_dir = PathBuf::from(format!("{}.part", final_dir.display()));
        if staging_dir.exists() {
            std::fs::remove_dir_all(&staging_dir).map_err(StorageError::IoError)?;
        }

        {
            let staging_db = self.open_store(&staging_dir)?;
            let staging_data = staging_db.open_tree(STATE_MACHINE_TREE)?;
            let staging_meta = staging_db.open_tree(STATE_MACHINE_META_TREE)?;

            let mut chunk = Some(first_chunk);
            while let Some(payload) = chunk {
                let pairs: Vec<(Vec<u8>, Vec<u8>)> =
                    bincode::deserialize(&payload).map_err(|e| SnapshotError::Corrupt {
                        location: format!("exported key-value batch decode: {e}"),
                    })?;

                let mut batch = sled::Batch::default();
                for (k, v) in pairs {
                    batch.insert(k, v);
                }
                staging_data.apply_batch(batch)?;
                chunk = source.next_chunk(cancel).await?;
            }

            staging_meta.insert(META_KEY_LAST_APPLIED_INDEX, &safe_kv(meta.last_included_index))?;
            staging_meta.insert(META_KEY_LAST_APPLIED_TERM, &safe_kv(meta.last_included_term))?;
            staging_db.flush()?;
        }

        // Atomically mark the staged store complete, then swap the live
        // handle. The old generation stays on disk until the swap
        // succeeded.
        tokio::fs::rename(&staging_dir, &final_dir).await.map_err(|e| {
            crate::Error::Storage(StorageError::PathError {
                path: staging_dir.clone(),
                source: e,
            })
        })?;

        let new_db = self.open_store(&final_dir)?;
        let old_db = self.db.swap(Some(Arc::new(new_db)));
        self.last_applied_index.store(meta.last_included_index, Ordering::SeqCst);
        self.last_applied_term.store(meta.last_included_term, Ordering::SeqCst);

        drop(old_db);
        crate::file_io::remove_path_best_effort(&self.generation_dir(current_generation)).await;

        info!(
            group = self.group_id,
            replica = self.replica_id,
            generation = next_generation,
            applied_index = meta.last_included_index,
            "recovered on-disk key-value store from full export"
        );
        Ok(())
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(db) = self.db.swap(None) {
            if let Err(e) = db.flush() {
                warn!(group = self.group_id, "flush on close failed: {:?}", e);
            }
        }
        debug!(group = self.group_id, replica = self.replica_id, "sled kv state machine closed");
        Ok(())
    }
}
