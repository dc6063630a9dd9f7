//! Streaming snapshot transfer support.
//!
//! Bootstrapping a brand-new replica that has no local storage moves a
//! finalized snapshot file across some host-owned channel. This module
//! supplies the two endpoints of that move while staying transport
//! agnostic: [`chunk_stream`] slices a finalized snapshot file into
//! checksummed chunks, and [`SnapshotAssembler`] rebuilds the file on the
//! receiving side, verifying order and integrity chunk by chunk before an
//! atomic rename marks it complete.

use std::path::Path;
use std::path::PathBuf;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;

use futures::stream::BoxStream;
use serde::Deserialize;
use serde::Serialize;
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::constants::SNAPSHOT_FILE_PREFIX;
use crate::file_io::move_path;
use crate::Result;
use crate::SnapshotError;

/// One piece of a snapshot file in flight. `crc` covers `data`; the final
/// piece carries `last = true` and no payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotChunk {
    pub seq: u32,
    pub crc: u32,
    pub last: bool,
    pub data: Vec<u8>,
}

/// Slice the finalized snapshot file at `path` into a stream of
/// checksummed chunks. Reading happens on a background task so slow
/// consumers exert backpressure through the channel instead of holding the
/// file open across await points of the caller.
pub fn chunk_stream(
    path: PathBuf,
    chunk_size: usize,
    cancel: &CancellationToken,
) -> BoxStream<'static, Result<SnapshotChunk>> {
    let (tx, rx) = mpsc::channel::<Result<SnapshotChunk>>(16);
    let cancel = cancel.clone();

    tokio::spawn(async move {
        let mut file = match File::open(&path).await {
            Ok(f) => f,
            Err(e) => {
                let _ = tx.send(Err(SnapshotError::IoError(e).into())).await;
                return;
            }
        };

        let mut seq = 0u32;
        loop {
            if cancel.is_cancelled() {
                let _ = tx.send(Err(SnapshotError::Cancelled.into())).await;
                return;
            }
            let mut buf = vec![0u8; chunk_size];
            let mut filled = 0usize;
            // Fill the chunk completely unless the file ends first.
            while filled < chunk_size {
                match file.read(&mut buf[filled..]).await {
                    Ok(0) => break,
                    Ok(n) => filled += n,
                    Err(e) => {
                        let _ = tx.send(Err(SnapshotError::IoError(e).into())).await;
                        return;
                    }
                }
            }
            if filled == 0 {
                let _ = tx
                    .send(Ok(SnapshotChunk {
                        seq,
                        crc: 0,
                        last: true,
                        data: Vec::new(),
                    }))
                    .await;
                return;
            }
            buf.truncate(filled);
            let chunk = SnapshotChunk {
                seq,
                crc: crc32fast::hash(&buf),
                last: false,
                data: buf,
            };
            if tx.send(Ok(chunk)).await.is_err() {
                // Receiver hung up; nothing left to do.
                return;
            }
            seq += 1;
        }
    });

    Box::pin(ReceiverStream::new(rx))
}

/// Receiving endpoint of a streaming transfer: appends verified chunks to
/// `incoming.part` and finalizes with an atomic rename once the last chunk
/// arrived.
pub struct SnapshotAssembler {
    temp_file: File,
    pub(crate) temp_path: PathBuf,
    expected_seq: u32,
    total_size: usize,
    received_chunks: AtomicU32,
    snapshots_dir: PathBuf,
}

impl SnapshotAssembler {
    pub async fn new(snapshots_dir: impl AsRef<Path>) -> Result<Self> {
        let snapshots_dir = snapshots_dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&snapshots_dir).await.map_err(SnapshotError::IoError)?;

        let temp_path = snapshots_dir.join("incoming.part");
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&temp_path)
            .await
            .map_err(SnapshotError::IoError)?;

        Ok(SnapshotAssembler {
            temp_file: file,
            temp_path,
            expected_seq: 0,
            total_size: 0,
            received_chunks: AtomicU32::new(0),
            snapshots_dir,
        })
    }

    /// Append one chunk. Chunks must arrive in sequence and intact; the
    /// final marker chunk returns `true` without writing.
    pub async fn write_chunk(
        &mut self,
        chunk: SnapshotChunk,
    ) -> Result<bool> {
        if chunk.seq != self.expected_seq {
            return Err(SnapshotError::OutOfOrderChunk {
                expected: self.expected_seq,
                got: chunk.seq,
            }
            .into());
        }
        if chunk.last {
            return Ok(true);
        }
        if crc32fast::hash(&chunk.data) != chunk.crc {
            return Err(SnapshotError::Corrupt {
                location: format!("transfer chunk {}", chunk.seq),
            }
            .into());
        }

        self.received_chunks.fetch_add(1, Ordering::SeqCst);
        self.temp_file.write_all(&chunk.data).await.map_err(SnapshotError::IoError)?;
        self.total_size += chunk.data.len();
        self.expected_seq += 1;

        Ok(false)
    }

    /// Flush, fsync and atomically rename the assembled file to its final
    /// snapshot name. Returns the final path, ready for
    /// `SnapshotCoordinator::load`.
    pub async fn finalize(
        mut self,
        last_included_index: u64,
        last_included_term: u64,
    ) -> Result<PathBuf> {
        self.temp_file.flush().await.map_err(SnapshotError::IoError)?;
        self.temp_file.sync_all().await.map_err(SnapshotError::IoError)?;

        let final_path = self
            .snapshots_dir
            .join(format!("{SNAPSHOT_FILE_PREFIX}{last_included_index}-{last_included_term}"));

        debug!(
            ?self.temp_path,
            ?final_path,
            size = self.total_size,
            "assembler: atomic rename to final snapshot file path"
        );
        move_path(&self.temp_path, &final_path).await?;
        Ok(final_path)
    }

    pub fn received_chunks(&self) -> u32 {
        self.received_chunks.load(Ordering::Acquire)
    }
}
