//! The snapshot coordinator drives save/load against whichever state
//! machine kind is active through one uniform procedure, hiding the
//! kind-specific differences from the group runtime.
//!
//! Saves stream into `<snapshots_dir>/snapshot-<index>-<term>.part` and
//! finalize with an atomic rename to the unsuffixed name, so a crashed or
//! cancelled save can never be mistaken for a complete snapshot. Loads
//! validate the source before any machine state is touched; the machines
//! themselves stage recovered state fully before swapping it in.

use std::path::Path;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering;

use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::constants::SNAPSHOT_FILE_PREFIX;
use crate::constants::SNAPSHOT_TEMP_SUFFIX;
use crate::file_io::move_path;
use crate::file_io::remove_path_best_effort;
use crate::Error;
use crate::Result;
use crate::SnapshotConfig;
use crate::SnapshotError;
use crate::SnapshotGuard;
use crate::SnapshotMeta;
use crate::SnapshotPhase;
use crate::SnapshotReader;
use crate::SnapshotWriter;
use crate::StateMachineHandle;
use crate::StateMachineVariant;
use crate::SNAPSHOT_BYTES_METRIC;
use crate::SNAPSHOT_OPS_METRIC;

pub struct SnapshotCoordinator {
    config: SnapshotConfig,
    in_progress: AtomicBool,
    phase: AtomicU8,
}

impl SnapshotCoordinator {
    pub fn new(config: SnapshotConfig) -> Self {
        SnapshotCoordinator {
            config,
            in_progress: AtomicBool::new(false),
            phase: AtomicU8::new(SnapshotPhase::Idle as u8),
        }
    }

    /// Phase of the most recent save/load operation.
    pub fn phase(&self) -> SnapshotPhase {
        SnapshotPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    /// Capture a consistent point-in-time image of the machine behind
    /// `handle` at its current applied index.
    ///
    /// For the concurrent kind the consistent view is frozen first
    /// (`Preparing`), then serialized off the write path. Returns the path
    /// of the finalized snapshot file.
    pub async fn save(
        &self,
        handle: &StateMachineHandle,
        last_included_term: u64,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        let _guard = SnapshotGuard::new(&self.in_progress)?;

        let meta = SnapshotMeta {
            group_id: handle.group_id(),
            replica_id: handle.replica_id(),
            last_included_index: handle.last_applied(),
            last_included_term,
            kind: handle.kind(),
        };
        let final_path = self.snapshot_file_path(meta.last_included_index, meta.last_included_term);
        let temp_path = temp_path_of(&final_path);

        let result = self.save_inner(handle, &meta, &final_path, &temp_path, cancel).await;
        self.finish("save", handle.group_id(), &result);
        if result.is_err() {
            remove_path_best_effort(&temp_path).await;
        }
        result
    }

    async fn save_inner(
        &self,
        handle: &StateMachineHandle,
        meta: &SnapshotMeta,
        final_path: &Path,
        temp_path: &Path,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        // A stale .part from an interrupted run is safe to overwrite.
        remove_path_best_effort(temp_path).await;

        // Freeze a consistent view before any slow I/O; post-prepare
        // writes must not be visible in this snapshot.
        let cookie = match handle.variant() {
            StateMachineVariant::Concurrent(sm) => {
                self.set_phase(SnapshotPhase::Preparing);
                Some(sm.prepare_snapshot()?)
            }
            _ => None,
        };

        self.set_phase(SnapshotPhase::Streaming);
        let mut writer = SnapshotWriter::create(temp_path, meta, &self.config).await?;

        match handle.variant() {
            StateMachineVariant::Sequential(sm) => {
                sm.save_snapshot(&mut writer, cancel).await?;
            }
            StateMachineVariant::Concurrent(sm) => {
                let cookie = cookie.ok_or_else(|| Error::Fatal("prepare cookie missing".to_string()))?;
                sm.save_snapshot(cookie, &mut writer, cancel).await?;
            }
            StateMachineVariant::OnDisk(sm) => {
                sm.save_snapshot(&mut writer, cancel).await?;
            }
        }

        if cancel.is_cancelled() {
            return Err(SnapshotError::Cancelled.into());
        }
        let bytes = writer.finalize().await?;
        move_path(temp_path, final_path).await?;

        SNAPSHOT_BYTES_METRIC
            .with_label_values(&[&meta.group_id.to_string(), "save"])
            .observe(bytes as f64);
        info!(
            group = meta.group_id,
            index = meta.last_included_index,
            term = meta.last_included_term,
            bytes,
            "snapshot saved"
        );
        Ok(final_path.to_path_buf())
    }

    /// Restore the machine behind `handle` from the snapshot file at
    /// `path` and seed the handle's applied watermark from its metadata.
    pub async fn load(
        &self,
        handle: &StateMachineHandle,
        path: &Path,
        cancel: &CancellationToken,
    ) -> Result<SnapshotMeta> {
        let _guard = SnapshotGuard::new(&self.in_progress)?;
        let result = self.load_inner(handle, path, cancel).await;
        self.finish("load", handle.group_id(), &result);
        result
    }

    async fn load_inner(
        &self,
        handle: &StateMachineHandle,
        path: &Path,
        cancel: &CancellationToken,
    ) -> Result<SnapshotMeta> {
        self.set_phase(SnapshotPhase::Streaming);
        let mut reader = SnapshotReader::open(path).await?;
        let meta = reader.meta().clone();

        if meta.kind != handle.kind() {
            return Err(SnapshotError::FormatMismatch {
                details: format!(
                    "snapshot was taken from a {} state machine, target is {}",
                    meta.kind,
                    handle.kind()
                ),
            }
            .into());
        }
        if meta.group_id != handle.group_id() {
            return Err(SnapshotError::FormatMismatch {
                details: format!("snapshot belongs to group {}, target is group {}", meta.group_id, handle.group_id()),
            }
            .into());
        }

        match handle.variant() {
            StateMachineVariant::Sequential(sm) => {
                sm.recover_from_snapshot(&mut reader, cancel).await?;
            }
            StateMachineVariant::Concurrent(sm) => {
                sm.recover_from_snapshot(&mut reader, cancel).await?;
            }
            StateMachineVariant::OnDisk(sm) => {
                sm.recover_from_snapshot(&mut reader, cancel).await?;
            }
        }

        handle.set_applied(meta.last_included_index);
        info!(
            group = meta.group_id,
            index = meta.last_included_index,
            term = meta.last_included_term,
            "snapshot recovered"
        );
        Ok(meta)
    }

    /// Latest finalized snapshot file in the configured directory, by
    /// included index.
    pub async fn latest_snapshot(&self) -> Result<Option<PathBuf>> {
        Ok(self.list_snapshots().await?.into_iter().next_back().map(|(_, path)| path))
    }

    /// Remove old snapshot files, retaining the configured number of most
    /// recent ones.
    pub async fn cleanup(&self) -> Result<()> {
        let snapshots = self.list_snapshots().await?;
        let retain = self.config.cleanup_retain_count as usize;
        if snapshots.len() <= retain {
            return Ok(());
        }
        for (index, path) in &snapshots[..snapshots.len() - retain] {
            debug!(index, ?path, "removing obsolete snapshot");
            remove_path_best_effort(path).await;
        }
        Ok(())
    }

    pub fn snapshot_file_path(
        &self,
        last_included_index: u64,
        last_included_term: u64,
    ) -> PathBuf {
        self.config
            .snapshots_dir
            .join(format!("{SNAPSHOT_FILE_PREFIX}{last_included_index}-{last_included_term}"))
    }

    /// Finalized snapshot files sorted by included index, ascending.
    async fn list_snapshots(&self) -> Result<Vec<(u64, PathBuf)>> {
        let mut snapshots = Vec::new();
        let mut dir = match tokio::fs::read_dir(&self.config.snapshots_dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(snapshots),
            Err(e) => return Err(SnapshotError::IoError(e).into()),
        };
        while let Some(entry) = dir.next_entry().await.map_err(SnapshotError::IoError)? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(rest) = name.strip_prefix(SNAPSHOT_FILE_PREFIX) else {
                continue;
            };
            if rest.ends_with(SNAPSHOT_TEMP_SUFFIX) {
                continue;
            }
            let Some((index, _term)) = rest.split_once('-') else { continue };
            let Ok(index) = index.parse::<u64>() else { continue };
            snapshots.push((index, entry.path()));
        }
        snapshots.sort_by_key(|(index, _)| *index);
        Ok(snapshots)
    }

    fn set_phase(
        &self,
        phase: SnapshotPhase,
    ) {
        self.phase.store(phase as u8, Ordering::Release);
    }

    fn finish<T>(
        &self,
        op: &str,
        group_id: u64,
        result: &Result<T>,
    ) {
        let outcome = match result {
            Ok(_) => {
                self.set_phase(SnapshotPhase::Completed);
                "completed"
            }
            Err(e) if e.is_cancelled() => {
                warn!(group = group_id, op, "snapshot operation cancelled");
                self.set_phase(SnapshotPhase::Cancelled);
                "cancelled"
            }
            Err(e) => {
                warn!(group = group_id, op, error = %e, "snapshot operation failed");
                self.set_phase(SnapshotPhase::Failed);
                "failed"
            }
        };
        SNAPSHOT_OPS_METRIC
            .with_label_values(&[&group_id.to_string(), op, outcome])
            .inc();
    }
}

fn temp_path_of(final_path: &Path) -> PathBuf {
    let mut name = final_path.as_os_str().to_os_string();
    name.push(SNAPSHOT_TEMP_SUFFIX);
    PathBuf::from(name)
}
