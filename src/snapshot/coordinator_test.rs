use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::*;
use crate::convert::safe_kv;
use crate::convert::safe_vk;
use crate::test_utils;
use crate::MachineConfig;
use crate::MemoryKvStateMachine;
use crate::Result;
use crate::SledKvStateMachine;
use crate::SnapshotConfig;
use crate::StateMachine;
use crate::StateMachineHandle;
use crate::VersionedKvStateMachine;

fn snapshot_config(dir: &std::path::Path) -> SnapshotConfig {
    SnapshotConfig {
        snapshots_dir: dir.to_path_buf(),
        chunk_size: 64,
        ..Default::default()
    }
}

fn sequential_handle(replica_id: u64) -> StateMachineHandle {
    StateMachineHandle::new(
        1,
        replica_id,
        crate::StateMachineVariant::Sequential(Arc::new(MemoryKvStateMachine::new(1, replica_id))),
    )
}

fn concurrent_handle(replica_id: u64) -> StateMachineHandle {
    StateMachineHandle::new(
        1,
        replica_id,
        crate::StateMachineVariant::Concurrent(Arc::new(VersionedKvStateMachine::new(1, replica_id))),
    )
}

fn scenario_entries() -> Vec<crate::Entry> {
    vec![
        test_utils::put_entry(1, 1, b"x", &safe_kv(1)),
        test_utils::put_entry(2, 1, b"x", &safe_kv(2)),
        test_utils::incr_entry(3, 1, b"x"),
    ]
}

fn lookup_x(handle: &StateMachineHandle) -> u64 {
    safe_vk(handle.lookup(b"x").expect("should succeed").data).expect("should succeed")
}

/// Snapshot after entry 2, recover into a fresh instance, replay entry 3:
/// must equal applying all three entries directly.
#[tokio::test]
async fn test_sequential_snapshot_round_trip() {
    let dir = tempfile::tempdir().expect("should succeed");
    let coordinator = SnapshotCoordinator::new(snapshot_config(dir.path()));
    let cancel = CancellationToken::new();

    let mut entries = scenario_entries();
    let entry3 = entries.split_off(2);

    let source = sequential_handle(1);
    source.update(entries).expect("should succeed");
    let path = coordinator.save(&source, 1, &cancel).await.expect("should succeed");
    assert_eq!(coordinator.phase(), SnapshotPhase::Completed);

    let target = sequential_handle(2);
    let meta = coordinator.load(&target, &path, &cancel).await.expect("should succeed");
    assert_eq!(meta.last_included_index, 2);
    assert_eq!(target.last_applied(), 2);

    target.update(entry3).expect("should succeed");
    assert_eq!(lookup_x(&target), 3);

    // Direct application agrees.
    let direct = sequential_handle(3);
    direct.update(scenario_entries()).expect("should succeed");
    assert_eq!(lookup_x(&direct), 3);
}

/// Two fresh instances fed the same entries must produce byte-identical
/// snapshots.
#[tokio::test]
async fn test_determinism_via_snapshot_byte_equality() {
    let dir_a = tempfile::tempdir().expect("should succeed");
    let dir_b = tempfile::tempdir().expect("should succeed");
    let coordinator_a = SnapshotCoordinator::new(snapshot_config(dir_a.path()));
    let coordinator_b = SnapshotCoordinator::new(snapshot_config(dir_b.path()));
    let cancel = CancellationToken::new();

    let entries = test_utils::put_entries(1, 1, (1..=40).collect());
    let a = sequential_handle(1);
    let b = sequential_handle(1);
    a.update(entries.clone()).expect("should succeed");
    b.update(entries).expect("should succeed");

    let path_a = coordinator_a.save(&a, 1, &cancel).await.expect("should succeed");
    let path_b = coordinator_b.save(&b, 1, &cancel).await.expect("should succeed");

    let bytes_a = std::fs::read(path_a).expect("should succeed");
    let bytes_b = std::fs::read(path_b).expect("should succeed");
    assert_eq!(bytes_a, bytes_b);
}

#[tokio::test]
async fn test_concurrent_snapshot_round_trip() {
    let dir = tempfile::tempdir().expect("should succeed");
    let coordinator = SnapshotCoordinator::new(snapshot_config(dir.path()));
    let cancel = CancellationToken::new();

    let source = concurrent_handle(1);
    source.update(scenario_entries()).expect("should succeed");
    let path = coordinator.save(&source, 1, &cancel).await.expect("should succeed");

    let target = concurrent_handle(2);
    coordinator.load(&target, &path, &cancel).await.expect("should succeed");
    assert_eq!(target.last_applied(), 3);
    assert_eq!(lookup_x(&target), 3);
}

#[tokio::test]
async fn test_on_disk_snapshot_round_trip() {
    let snapshot_dir = tempfile::tempdir().expect("should succeed");
    let data_dir = tempfile::tempdir().expect("should succeed");
    let coordinator = SnapshotCoordinator::new(snapshot_config(snapshot_dir.path()));
    let cancel = CancellationToken::new();
    let stop = CancellationToken::new();
    let machine_config = MachineConfig {
        data_dir: data_dir.path().to_path_buf(),
        ..Default::default()
    };

    let source = StateMachineHandle::new(
        1,
        1,
        crate::StateMachineVariant::OnDisk(Arc::new(SledKvStateMachine::new(1, 1, &machine_config))),
    );
    source.open(&stop).await.expect("should succeed");
    source.update(scenario_entries()).expect("should succeed");
    source.sync().expect("should succeed");

    let path = coordinator.save(&source, 1, &cancel).await.expect("should succeed");

    let target = StateMachineHandle::new(
        1,
        2,
        crate::StateMachineVariant::OnDisk(Arc::new(SledKvStateMachine::new(1, 2, &machine_config))),
    );
    assert_eq!(target.open(&stop).await.expect("should succeed"), 0);
    coordinator.load(&target, &path, &cancel).await.expect("should succeed");
    assert_eq!(target.last_applied(), 3);
    assert_eq!(lookup_x(&target), 3);

    // Replay resumes after the recovered watermark.
    target
        .update(vec![test_utils::incr_entry(4, 1, b"x")])
        .expect("should succeed");
    assert_eq!(lookup_x(&target), 4);
}

#[tokio::test]
async fn test_pre_cancelled_save_leaves_no_artifacts() {
    let dir = tempfile::tempdir().expect("should succeed");
    let coordinator = SnapshotCoordinator::new(snapshot_config(dir.path()));
    let cancel = CancellationToken::new();
    cancel.cancel();

    let handle = sequential_handle(1);
    handle.update(scenario_entries()).expect("should succeed");

    let err = coordinator.save(&handle, 1, &cancel).await.expect_err("should fail");
    assert!(err.is_cancelled());
    assert_eq!(coordinator.phase(), SnapshotPhase::Cancelled);

    let mut dir_entries = std::fs::read_dir(dir.path()).expect("should succeed");
    assert!(dir_entries.next().is_none(), "snapshot dir should be empty");

    // The machine is still fully usable.
    handle
        .update(vec![test_utils::incr_entry(4, 1, b"x")])
        .expect("should succeed");
    assert_eq!(lookup_x(&handle), 4);

    let fresh_cancel = CancellationToken::new();
    coordinator.save(&handle, 1, &fresh_cancel).await.expect("should succeed");
    assert_eq!(coordinator.phase(), SnapshotPhase::Completed);
}

/// State machine that cancels its own token between chunks, exercising a
/// cancellation at an arbitrary chunk boundary.
struct SelfCancellingMachine;

#[async_trait::async_trait]
impl StateMachine for SelfCancellingMachine {
    fn update(
        &self,
        _entries: Vec<crate::Entry>,
    ) -> Result<Vec<crate::UpdateResult>> {
        Ok(Vec::new())
    }

    fn lookup(
        &self,
        _query: &[u8],
    ) -> Result<crate::QueryResult> {
        Ok(crate::QueryResult::default())
    }

    async fn save_snapshot(
        &self,
        sink: &mut crate::SnapshotWriter,
        cancel: &CancellationToken,
    ) -> Result<()> {
        for i in 0..8u8 {
            if i == 3 {
                cancel.cancel();
            }
            sink.write_chunk(&[i; 128], cancel).await?;
        }
        Ok(())
    }

    async fn recover_from_snapshot(
        &self,
        _source: &mut crate::SnapshotReader,
        _cancel: &CancellationToken,
    ) -> Result<()> {
        Ok(())
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn test_mid_save_cancellation_at_chunk_boundary() {
    let dir = tempfile::tempdir().expect("should succeed");
    let coordinator = SnapshotCoordinator::new(snapshot_config(dir.path()));
    let cancel = CancellationToken::new();

    let handle = StateMachineHandle::new(
        1,
        1,
        crate::StateMachineVariant::Sequential(Arc::new(SelfCancellingMachine)),
    );

    let err = coordinator.save(&handle, 1, &cancel).await.expect_err("should fail");
    assert!(err.is_cancelled());
    assert_eq!(coordinator.phase(), SnapshotPhase::Cancelled);

    // Neither a finalized snapshot nor a stale .part may remain.
    let mut dir_entries = std::fs::read_dir(dir.path()).expect("should succeed");
    assert!(dir_entries.next().is_none(), "snapshot dir should be empty");
}

#[tokio::test]
async fn test_corrupt_snapshot_is_rejected_and_state_untouched() {
    let dir = tempfile::tempdir().expect("should succeed");
    let coordinator = SnapshotCoordinator::new(snapshot_config(dir.path()));
    let cancel = CancellationToken::new();

    let source = sequential_handle(1);
    source.update(scenario_entries()).expect("should succeed");
    let path = coordinator.save(&source, 1, &cancel).await.expect("should succeed");

    // Flip the last byte (trailer checksum).
    let mut bytes = std::fs::read(&path).expect("should succeed");
    let last = bytes.len() - 1;
    bytes[last] ^= 0xFF;
    std::fs::write(&path, &bytes).expect("should succeed");

    let target = sequential_handle(2);
    let err = coordinator.load(&target, &path, &cancel).await.expect_err("should fail");
    assert!(err.is_corrupt());
    assert_eq!(coordinator.phase(), SnapshotPhase::Failed);

    // The target state machine was never touched.
    assert_eq!(target.last_applied(), 0);
    assert!(target.lookup(b"x").expect("should succeed").data.is_empty());
}

#[tokio::test]
async fn test_kind_mismatch_is_rejected() {
    let dir = tempfile::tempdir().expect("should succeed");
    let coordinator = SnapshotCoordinator::new(snapshot_config(dir.path()));
    let cancel = CancellationToken::new();

    let source = sequential_handle(1);
    source.update(scenario_entries()).expect("should succeed");
    let path = coordinator.save(&source, 1, &cancel).await.expect("should succeed");

    let target = concurrent_handle(2);
    let err = coordinator.load(&target, &path, &cancel).await.expect_err("should fail");
    assert!(err.is_corrupt());
}

#[tokio::test]
async fn test_latest_snapshot_and_cleanup() {
    let dir = tempfile::tempdir().expect("should succeed");
    let mut config = snapshot_config(dir.path());
    config.cleanup_retain_count = 2;
    let coordinator = SnapshotCoordinator::new(config);
    let cancel = CancellationToken::new();

    let handle = sequential_handle(1);
    let mut paths = Vec::new();
    for index in 1..=4u64 {
        handle
            .update(vec![test_utils::incr_entry(index, 1, b"x")])
            .expect("should succeed");
        paths.push(coordinator.save(&handle, 1, &cancel).await.expect("should succeed"));
    }

    let latest = coordinator.latest_snapshot().await.expect("should succeed");
    assert_eq!(latest.as_deref(), Some(paths[3].as_path()));

    coordinator.cleanup().await.expect("should succeed");
    assert!(!paths[0].exists());
    assert!(!paths[1].exists());
    assert!(paths[2].exists());
    assert!(paths[3].exists());
}
