//! Chunked snapshot sink.
//!
//! File layout:
//!
//! ```text
//! magic (8) | version (u32) | flags (u8)
//! meta_len (u32) | meta (bincode) | meta_crc (u32)
//! repeated chunks: payload_len (u32) | payload_crc (u32) | payload
//! end marker: payload_len = 0 | rolling_crc (u32)
//! trailer: files_len (u32) | files (bincode) | files_crc (u32)
//! ```
//!
//! All integers are big-endian. `payload_crc` covers the payload bytes as
//! written (after compression); `rolling_crc` covers the concatenated
//! big-endian per-chunk crcs, so truncated or reordered chunk sequences
//! fail validation even when every individual chunk is intact.

use std::io::Write;
use std::path::Path;

use flate2::write::ZlibEncoder;
use flate2::Compression;
use tokio::fs::File;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::io::BufWriter;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::constants::SNAPSHOT_FLAG_COMPRESSED;
use crate::constants::SNAPSHOT_FORMAT_VERSION;
use crate::constants::SNAPSHOT_MAGIC;
use crate::file_io::create_parent_dir_if_not_exist;
use crate::Result;
use crate::SnapshotConfig;
use crate::SnapshotError;
use crate::SnapshotFileRef;
use crate::SnapshotMeta;

/// Byte-stream sink for serialized state machine state.
///
/// State machines write opaque payload chunks; the writer owns framing,
/// checksumming, optional compression and the auxiliary file trailer.
pub struct SnapshotWriter {
    file: BufWriter<File>,
    chunk_size: usize,
    compress: bool,
    chunks_written: u32,
    crc_of_crcs: crc32fast::Hasher,
    files: Vec<SnapshotFileRef>,
    bytes_written: u64,
}

impl SnapshotWriter {
    /// Create the sink at `path` and write the self-describing header.
    pub async fn create(
        path: &Path,
        meta: &SnapshotMeta,
        config: &SnapshotConfig,
    ) -> Result<Self> {
        create_parent_dir_if_not_exist(path)?;
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)
            .await
            .map_err(SnapshotError::IoError)?;

        let mut writer = SnapshotWriter {
            file: BufWriter::new(file),
            chunk_size: config.chunk_size,
            compress: config.compression,
            chunks_written: 0,
            crc_of_crcs: crc32fast::Hasher::new(),
            files: Vec::new(),
            bytes_written: 0,
        };

        let meta_bytes = bincode::serialize(meta).map_err(|e| SnapshotError::Failed(e.to_string()))?;
        let mut flags = 0u8;
        if writer.compress {
            flags |= SNAPSHOT_FLAG_COMPRESSED;
        }

        writer.write_all(&SNAPSHOT_MAGIC).await?;
        writer.write_all(&SNAPSHOT_FORMAT_VERSION.to_be_bytes()).await?;
        writer.write_all(&[flags]).await?;
        writer.write_all(&(meta_bytes.len() as u32).to_be_bytes()).await?;
        writer.write_all(&meta_bytes).await?;
        writer.write_all(&crc32fast::hash(&meta_bytes).to_be_bytes()).await?;

        Ok(writer)
    }

    /// Chunk granularity the owning coordinator was configured with.
    /// Implementations producing large blobs should slice at this size so
    /// cancellation stays responsive.
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Append one payload chunk. Cancellation is checked before any byte
    /// of the chunk is written. Empty payloads are not recorded: a zero
    /// payload length on disk is the end marker.
    pub async fn write_chunk(
        &mut self,
        payload: &[u8],
        cancel: &CancellationToken,
    ) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(SnapshotError::Cancelled.into());
        }
        if payload.is_empty() {
            return Ok(());
        }

        let payload = if self.compress {
            let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(payload).map_err(SnapshotError::IoError)?;
            encoder.finish().map_err(SnapshotError::IoError)?
        } else {
            payload.to_vec()
        };

        let crc = crc32fast::hash(&payload);
        self.crc_of_crcs.update(&crc.to_be_bytes());

        self.write_all(&(payload.len() as u32).to_be_bytes()).await?;
        self.write_all(&crc.to_be_bytes()).await?;
        self.write_all(&payload).await?;
        self.chunks_written += 1;
        Ok(())
    }

    /// Append a large blob as a sequence of `chunk_size` chunks.
    pub async fn write_blob(
        &mut self,
        blob: &[u8],
        cancel: &CancellationToken,
    ) -> Result<()> {
        for slice in blob.chunks(self.chunk_size) {
            self.write_chunk(slice, cancel).await?;
        }
        Ok(())
    }

    /// Record an auxiliary file reference to be shipped in the trailer.
    pub fn add_file(
        &mut self,
        file_ref: SnapshotFileRef,
    ) {
        self.files.push(file_ref);
    }

    /// Write the end marker and trailer, flush and fsync. Returns the total
    /// number of bytes written.
    pub async fn finalize(mut self) -> Result<u64> {
        self.write_all(&0u32.to_be_bytes()).await?;
        let rolling = std::mem::take(&mut self.crc_of_crcs).finalize();
        self.write_all(&rolling.to_be_bytes()).await?;

        let files_bytes = bincode::serialize(&self.files).map_err(|e| SnapshotError::Failed(e.to_string()))?;
        self.write_all(&(files_bytes.len() as u32).to_be_bytes()).await?;
        self.write_all(&files_bytes).await?;
        self.write_all(&crc32fast::hash(&files_bytes).to_be_bytes()).await?;

        self.file.flush().await.map_err(SnapshotError::IoError)?;
        self.file.get_ref().sync_all().await.map_err(SnapshotError::IoError)?;

        debug!(
            chunks = self.chunks_written,
            bytes = self.bytes_written,
            files = self.files.len(),
            "snapshot sink finalized"
        );
        Ok(self.bytes_written)
    }

    async fn write_all(
        &mut self,
        buf: &[u8],
    ) -> Result<()> {
        self.file.write_all(buf).await.map_err(SnapshotError::IoError)?;
        self.bytes_written += buf.len() as u64;
        Ok(())
    }
}
