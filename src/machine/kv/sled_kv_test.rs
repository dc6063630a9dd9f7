use tokio_util::sync::CancellationToken;

use super::*;
use crate::convert::safe_kv;
use crate::convert::safe_vk;
use crate::test_utils;
use crate::ApplyError;
use crate::Error;
use crate::MachineConfig;
use crate::OnDiskStateMachine;
use crate::SnapshotConfig;
use crate::SnapshotMeta;
use crate::SnapshotReader;
use crate::SnapshotWriter;
use crate::StateMachineKind;
use crate::StorageError;

fn machine_config(dir: &std::path::Path) -> MachineConfig {
    MachineConfig {
        data_dir: dir.to_path_buf(),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_open_fresh_store_returns_zero() {
    let dir = tempfile::tempdir().expect("should succeed");
    let sm = SledKvStateMachine::new(1, 1, &machine_config(dir.path()));
    let stop = CancellationToken::new();
    assert_eq!(sm.open(&stop).await.expect("should succeed"), 0);
    assert_eq!(sm.last_applied(), (0, 0));
}

#[tokio::test]
async fn test_update_before_open_is_refused() {
    let dir = tempfile::tempdir().expect("should succeed");
    let sm = SledKvStateMachine::new(1, 1, &machine_config(dir.path()));
    let err = sm
        .update(test_utils::put_entries(1, 1, vec![1]))
        .expect_err("should fail");
    assert!(matches!(err, Error::Storage(StorageError::NotOpen)));
}

#[tokio::test]
async fn test_restart_resumes_at_persisted_watermark() {
    crate::test_utils::enable_logger();

    let dir = tempfile::tempdir().expect("should succeed");
    let config = machine_config(dir.path());
    let stop = CancellationToken::new();

    {
        let sm = SledKvStateMachine::new(1, 1, &config);
        sm.open(&stop).await.expect("should succeed");
        sm.update(test_utils::put_entries(1, 2, vec![1, 2, 3])).expect("should succeed");
        sm.sync().expect("should succeed");
        // Dropped without close: simulates a crash after the batch was
        // acknowledged durable.
    }

    let sm = SledKvStateMachine::new(1, 1, &config);
    let applied = sm.open(&stop).await.expect("should succeed");
    assert_eq!(applied, 3);
    assert_eq!(sm.last_applied(), (3, 2));

    // Data survived alongside the watermark.
    let value = sm.lookup(&safe_kv(2)).expect("should succeed");
    assert_eq!(safe_vk(value.data).expect("should succeed"), 2);

    // Replay resumes after the watermark without re-applying entry 3.
    sm.update(test_utils::put_entries(4, 2, vec![4])).expect("should succeed");
    assert_eq!(sm.last_applied(), (4, 2));
}

#[tokio::test]
async fn test_failed_batch_leaves_data_and_watermark_untouched() {
    let dir = tempfile::tempdir().expect("should succeed");
    let sm = SledKvStateMachine::new(1, 1, &machine_config(dir.path()));
    let stop = CancellationToken::new();
    sm.open(&stop).await.expect("should succeed");

    sm.update(vec![test_utils::put_entry(1, 1, b"text", b"abc")]).expect("should succeed");
    assert_eq!(sm.last_applied(), (1, 1));

    // A batch whose second command fails must roll back the first one too.
    let err = sm
        .update(vec![
            test_utils::put_entry(2, 1, b"other", &safe_kv(7)),
            test_utils::incr_entry(3, 1, b"text"),
        ])
        .expect_err("should fail");
    assert!(matches!(err, Error::Apply(ApplyError::Malformed { index: 3, .. })));

    assert_eq!(sm.last_applied(), (1, 1));
    assert!(sm.lookup(b"other").expect("should succeed").data.is_empty());
}

#[tokio::test]
async fn test_set_set_incr_scenario() {
    let dir = tempfile::tempdir().expect("should succeed");
    let sm = SledKvStateMachine::new(1, 1, &machine_config(dir.path()));
    let stop = CancellationToken::new();
    sm.open(&stop).await.expect("should succeed");

    sm.update(vec![
        test_utils::put_entry(1, 1, b"x", &safe_kv(1)),
        test_utils::put_entry(2, 1, b"x", &safe_kv(2)),
        test_utils::incr_entry(3, 1, b"x"),
    ])
    .expect("should succeed");

    let looked_up = sm.lookup(b"x").expect("should succeed");
    assert_eq!(safe_vk(looked_up.data).expect("should succeed"), 3);
}

#[tokio::test]
async fn test_full_export_round_trip() {
    let dir = tempfile::tempdir().expect("should succeed");
    let snapshot_dir = tempfile::tempdir().expect("should succeed");
    let snapshot_config = SnapshotConfig {
        snapshots_dir: snapshot_dir.path().to_path_buf(),
        chunk_size: 64, // force multiple chunks
        ..Default::default()
    };
    let cancel = CancellationToken::new();
    let stop = CancellationToken::new();

    let source_sm = SledKvStateMachine::new(1, 1, &machine_config(dir.path()));
    source_sm.open(&stop).await.expect("should succeed");
    source_sm
        .update(test_utils::put_entries(1, 1, (1..=30).collect()))
        .expect("should succeed");

    let meta = SnapshotMeta {
        group_id: 1,
        replica_id: 1,
        last_included_index: 30,
        last_included_term: 1,
        kind: StateMachineKind::OnDisk,
    };
    let path = snapshot_dir.path().join("export");
    let mut writer = SnapshotWriter::create(&path, &meta, &snapshot_config).await.expect("should succeed");
    source_sm.save_snapshot(&mut writer, &cancel).await.expect("should succeed");
    writer.finalize().await.expect("should succeed");

    // Bootstrap a brand-new replica from the export.
    let target_dir = tempfile::tempdir().expect("should succeed");
    let target_sm = SledKvStateMachine::new(1, 2, &machine_config(target_dir.path()));
    target_sm.open(&stop).await.expect("should succeed");
    let mut reader = SnapshotReader::open(&path).await.expect("should succeed");
    target_sm
        .recover_from_snapshot(&mut reader, &cancel)
        .await
        .expect("should succeed");

    assert_eq!(target_sm.last_applied(), (30, 1));
    for id in 1..=30u64 {
        assert_eq!(
            target_sm.lookup(&safe_kv(id)).expect("should succeed").data,
            safe_kv(id).to_vec()
        );
    }

    // The recovered watermark survives a restart of the target.
    target_sm.close().expect("should succeed");
    let reopened = SledKvStateMachine::new(1, 2, &machine_config(target_dir.path()));
    assert_eq!(reopened.open(&stop).await.expect("should succeed"), 30);
}

#[tokio::test]
async fn test_watermark_only_snapshot_leaves_data_alone() {
    let dir = tempfile::tempdir().expect("should succeed");
    let snapshot_dir = tempfile::tempdir().expect("should succeed");
    let snapshot_config = SnapshotConfig {
        snapshots_dir: snapshot_dir.path().to_path_buf(),
        ..Default::default()
    };
    let mut config = machine_config(dir.path());
    config.on_disk_full_export = false;
    let cancel = CancellationToken::new();
    let stop = CancellationToken::new();

    let sm = SledKvStateMachine::new(1, 1, &config);
    sm.open(&stop).await.expect("should succeed");
    sm.update(test_utils::put_entries(1, 1, vec![1, 2])).expect("should succeed");

    let meta = SnapshotMeta {
        group_id: 1,
        replica_id: 1,
        last_included_index: 2,
        last_included_term: 1,
        kind: StateMachineKind::OnDisk,
    };
    let path = snapshot_dir.path().join("watermark-only");
    let mut writer = SnapshotWriter::create(&path, &meta, &snapshot_config).await.expect("should succeed");
    sm.save_snapshot(&mut writer, &cancel).await.expect("should succeed");
    writer.finalize().await.expect("should succeed");

    // Apply more entries, then recover the older watermark-only snapshot:
    // the dataset must be left alone, only the watermark moves.
    sm.update(test_utils::put_entries(3, 1, vec![3])).expect("should succeed");
    assert_eq!(sm.last_applied(), (3, 1));

    let mut reader = SnapshotReader::open(&path).await.expect("should succeed");
    sm.recover_from_snapshot(&mut reader, &cancel).await.expect("should succeed");
    assert_eq!(sm.last_applied(), (2, 1));
    assert_eq!(
        sm.lookup(&safe_kv(3)).expect("should succeed").data,
        safe_kv(3).to_vec()
    );
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let dir = tempfile::tempdir().expect("should succeed");
    let sm = SledKvStateMachine::new(1, 1, &machine_config(dir.path()));
    let stop = CancellationToken::new();
    sm.open(&stop).await.expect("should succeed");
    sm.close().expect("should succeed");
    sm.close().expect("should succeed");

    let err = sm
        .update(test_utils::put_entries(1, 1, vec![1]))
        .expect_err("should fail");
    assert!(matches!(err, Error::Storage(StorageError::NotOpen)));
}
