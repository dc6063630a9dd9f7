//! Chunked snapshot source.
//!
//! Validates the self-describing header on open and every chunk checksum
//! on read; corrupt or mismatched input is rejected with `CorruptData`
//! rather than silently misapplied.

use std::io::Read;
use std::path::Path;

use flate2::read::ZlibDecoder;
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tokio::io::BufReader;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::constants::SNAPSHOT_FLAG_COMPRESSED;
use crate::constants::SNAPSHOT_FORMAT_VERSION;
use crate::constants::SNAPSHOT_MAGIC;
use crate::Result;
use crate::SnapshotError;
use crate::SnapshotFileRef;
use crate::SnapshotMeta;

/// Byte-stream source for snapshot recovery.
#[derive(Debug)]
pub struct SnapshotReader {
    file: BufReader<File>,
    meta: SnapshotMeta,
    compressed: bool,
    crc_of_crcs: crc32fast::Hasher,
    files: Vec<SnapshotFileRef>,
    finished: bool,
}

impl SnapshotReader {
    /// Open `path` and validate the header (magic, format version, meta
    /// checksum).
    pub async fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).await.map_err(SnapshotError::IoError)?;
        let mut file = BufReader::new(file);

        let mut magic = [0u8; 8];
        read_exact(&mut file, &mut magic, "magic").await?;
        if magic != SNAPSHOT_MAGIC {
            return Err(SnapshotError::FormatMismatch {
                details: format!("unrecognized magic {magic:02x?}"),
            }
            .into());
        }

        let version = read_u32(&mut file, "version").await?;
        if version != SNAPSHOT_FORMAT_VERSION {
            return Err(SnapshotError::FormatMismatch {
                details: format!("unsupported format version {version} (expected {SNAPSHOT_FORMAT_VERSION})"),
            }
            .into());
        }

        let mut flags = [0u8; 1];
        read_exact(&mut file, &mut flags, "flags").await?;

        let meta_len = read_u32(&mut file, "meta length").await? as usize;
        let mut meta_bytes = vec![0u8; meta_len];
        read_exact(&mut file, &mut meta_bytes, "meta").await?;
        let meta_crc = read_u32(&mut file, "meta crc").await?;
        if crc32fast::hash(&meta_bytes) != meta_crc {
            return Err(SnapshotError::Corrupt {
                location: "snapshot meta checksum".to_string(),
            }
            .into());
        }

        let meta: SnapshotMeta = bincode::deserialize(&meta_bytes).map_err(|e| SnapshotError::Corrupt {
            location: format!("snapshot meta decode: {e}"),
        })?;

        debug!(?meta, "snapshot source opened");
        Ok(SnapshotReader {
            file,
            meta,
            compressed: flags[0] & SNAPSHOT_FLAG_COMPRESSED != 0,
            crc_of_crcs: crc32fast::Hasher::new(),
            files: Vec::new(),
            finished: false,
        })
    }

    pub fn meta(&self) -> &SnapshotMeta {
        &self.meta
    }

    /// Auxiliary files recorded in the trailer. Populated only after the
    /// chunk stream has been fully drained (`next_chunk` returned `None`).
    pub fn files(&self) -> &[SnapshotFileRef] {
        &self.files
    }

    /// Read and validate the next payload chunk, decompressed if the
    /// source was written compressed. Returns `None` once the end marker
    /// and trailer have been consumed and verified.
    pub async fn next_chunk(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<Option<Vec<u8>>> {
        if self.finished {
            return Ok(None);
        }
        if cancel.is_cancelled() {
            return Err(SnapshotError::Cancelled.into());
        }

        let payload_len = read_u32(&mut self.file, "chunk length").await? as usize;
        if payload_len == 0 {
            self.read_end_marker().await?;
            self.finished = true;
            return Ok(None);
        }

        let payload_crc = read_u32(&mut self.file, "chunk crc").await?;
        let mut payload = vec![0u8; payload_len];
        read_exact(&mut self.file, &mut payload, "chunk payload").await?;

        if crc32fast::hash(&payload) != payload_crc {
            return Err(SnapshotError::Corrupt {
                location: "chunk checksum".to_string(),
            }
            .into());
        }
        self.crc_of_crcs.update(&payload_crc.to_be_bytes());

        if self.compressed {
            let mut decoder = ZlibDecoder::new(payload.as_slice());
            let mut decompressed = Vec::new();
            decoder.read_to_end(&mut decompressed).map_err(|e| SnapshotError::Corrupt {
                location: format!("chunk decompression: {e}"),
            })?;
            return Ok(Some(decompressed));
        }
        Ok(Some(payload))
    }

    /// Drain the whole chunk stream into one buffer. Convenience for
    /// machines that deserialize their full state in one piece.
    pub async fn read_blob(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>> {
        let mut blob = Vec::new();
        while let Some(chunk) = self.next_chunk(cancel).await? {
            blob.extend_from_slice(&chunk);
        }
        Ok(blob)
    }

    async fn read_end_marker(&mut self) -> Result<()> {
        let rolling = read_u32(&mut self.file, "rolling crc").await?;
        let computed = std::mem::take(&mut self.crc_of_crcs).finalize();
        if rolling != computed {
            return Err(SnapshotError::Corrupt {
                location: "chunk sequence checksum".to_string(),
            }
            .into());
        }

        let files_len = read_u32(&mut self.file, "trailer length").await? as usize;
        let mut files_bytes = vec![0u8; files_len];
        read_exact(&mut self.file, &mut files_bytes, "trailer").await?;
        let files_crc = read_u32(&mut self.file, "trailer crc").await?;
        if crc32fast::hash(&files_bytes) != files_crc {
            return Err(SnapshotError::Corrupt {
                location: "trailer checksum".to_string(),
            }
            .into());
        }

        self.files = bincode::deserialize(&files_bytes).map_err(|e| SnapshotError::Corrupt {
            location: format!("trailer decode: {e}"),
        })?;
        Ok(())
    }
}

async fn read_exact(
    file: &mut BufReader<File>,
    buf: &mut [u8],
    location: &str,
) -> Result<()> {
    file.read_exact(buf).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            SnapshotError::Corrupt {
                location: format!("truncated snapshot while reading {location}"),
            }
            .into()
        } else {
            crate::Error::Snapshot(SnapshotError::IoError(e))
        }
    })?;
    Ok(())
}

async fn read_u32(
    file: &mut BufReader<File>,
    location: &str,
) -> Result<u32> {
    let mut buf = [0u8; 4];
    read_exact(file, &mut buf, location).await?;
    Ok(u32::from_be_bytes(buf))
}
