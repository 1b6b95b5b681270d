//! File transfer payloads and the file-side state of a transfer.
//!
//! A transfer runs over sealed Transfer packets:
//!
//! ```text
//! sender                         receiver
//!   Request {id, size, name}  ->
//!                             <-  Accepted {id} | Refused {id}
//!   DataChunk {id, offset, ..} ->   (zero or more)
//!   Sent {id, digest}         ->
//!                             <-  Received {id} | Failed {id, reason}
//! ```
//!
//! The digest is BLAKE3 over the whole file; the receiver recomputes it
//! while writing and fails the transfer on mismatch.

use crate::error::{DtmError, Result};
use crate::session::events::FileReceived;
use crate::wire::{WireReader, WireWriter};
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Longest accepted file name, in bytes
const MAX_NAME_LEN: usize = 1024;

/// `Request` payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOffer {
    /// Identifier chosen by the sender
    pub transfer_id: u64,
    /// File size in bytes
    pub size: u64,
    /// File name (no directory components)
    pub name: String,
}

impl TransferOffer {
    /// Encode as a payload
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        WireWriter::new()
            .u64(self.transfer_id)
            .u64(self.size)
            .bytes(self.name.as_bytes())
            .finish()
    }

    /// Decode a payload
    ///
    /// # Errors
    ///
    /// Returns [`DtmError::TransferFailed`] on malformed input or an
    /// oversized or non-UTF-8 name.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut reader = WireReader::new(data);
        let transfer_id = reader.u64("transfer_id").map_err(malformed)?;
        let size = reader.u64("size").map_err(malformed)?;
        let name = reader.bytes("name").map_err(malformed)?;
        reader.finish().map_err(malformed)?;
        if name.len() > MAX_NAME_LEN {
            return Err(DtmError::TransferFailed("file name too long".into()));
        }
        let name = String::from_utf8(name.to_vec())
            .map_err(|_| DtmError::TransferFailed("file name is not UTF-8".into()))?;
        Ok(Self {
            transfer_id,
            size,
            name,
        })
    }
}

/// `DataChunk` payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferChunk {
    /// Transfer identifier
    pub transfer_id: u64,
    /// Offset of `data` in the file
    pub offset: u64,
    /// Chunk bytes
    pub data: Vec<u8>,
}

impl TransferChunk {
    /// Encode as a payload
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        WireWriter::new()
            .u64(self.transfer_id)
            .u64(self.offset)
            .bytes(&self.data)
            .finish()
    }

    /// Decode a payload
    ///
    /// # Errors
    ///
    /// Returns [`DtmError::TransferFailed`] on malformed input.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut reader = WireReader::new(data);
        let transfer_id = reader.u64("transfer_id").map_err(malformed)?;
        let offset = reader.u64("offset").map_err(malformed)?;
        let data = reader.bytes("data").map_err(malformed)?.to_vec();
        reader.finish().map_err(malformed)?;
        Ok(Self {
            transfer_id,
            offset,
            data,
        })
    }
}

/// `Accepted`, `Refused`, `Sent`, `Received` and `Failed` payload.
///
/// `detail` carries the digest for `Sent`, the reason for `Failed`, and is
/// empty otherwise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferNotice {
    /// Transfer identifier
    pub transfer_id: u64,
    /// Flag-specific detail
    pub detail: Vec<u8>,
}

impl TransferNotice {
    /// Notice without detail
    #[must_use]
    pub fn new(transfer_id: u64) -> Self {
        Self {
            transfer_id,
            detail: Vec::new(),
        }
    }

    /// Notice with detail
    #[must_use]
    pub fn with_detail(transfer_id: u64, detail: impl Into<Vec<u8>>) -> Self {
        Self {
            transfer_id,
            detail: detail.into(),
        }
    }

    /// Encode as a payload
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        WireWriter::new()
            .u64(self.transfer_id)
            .bytes(&self.detail)
            .finish()
    }

    /// Decode a payload
    ///
    /// # Errors
    ///
    /// Returns [`DtmError::TransferFailed`] on malformed input.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut reader = WireReader::new(data);
        let transfer_id = reader.u64("transfer_id").map_err(malformed)?;
        let detail = reader.bytes("detail").map_err(malformed)?.to_vec();
        reader.finish().map_err(malformed)?;
        Ok(Self {
            transfer_id,
            detail,
        })
    }
}

/// How an outgoing transfer ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    /// Receiver confirmed the file
    Completed {
        /// Transfer identifier
        transfer_id: u64,
        /// Bytes sent
        bytes: u64,
    },
    /// Receiver refused the offer; no data was sent
    Refused,
    /// Receiver reported a failure
    Failed(String),
}

/// Receiver's answer to an outgoing transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TransferReply {
    Accepted,
    Refused,
    Received,
    Failed(String),
}

fn malformed(err: crate::error::PacketError) -> DtmError {
    DtmError::TransferFailed(format!("malformed transfer payload: {err}"))
}

fn io_failed(err: std::io::Error) -> DtmError {
    DtmError::TransferFailed(err.to_string())
}

/// Default destination for an offered file: the announced name, stripped of
/// directory components, under the system temporary directory.
#[must_use]
pub fn default_destination(transfer_id: u64, name: &str) -> PathBuf {
    let file_name = Path::new(name)
        .file_name()
        .map_or_else(
            || format!("dtm-transfer-{transfer_id}"),
            |n| n.to_string_lossy().into_owned(),
        );
    std::env::temp_dir().join(file_name)
}

// ============================================================================
// Sending side
// ============================================================================

/// File being read for an outgoing transfer.
pub(crate) struct FileSource {
    file: File,
    name: String,
    size: u64,
    offset: u64,
    hasher: blake3::Hasher,
}

impl FileSource {
    pub(crate) async fn open(path: &Path) -> Result<Self> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| {
                DtmError::TransferFailed(format!("{} has no file name", path.display()))
            })?;
        let file = File::open(path).await.map_err(io_failed)?;
        let metadata = file.metadata().await.map_err(io_failed)?;
        if !metadata.is_file() {
            return Err(DtmError::TransferFailed(format!("{} is not a file", path.display())));
        }

        Ok(Self {
            file,
            name,
            size: metadata.len(),
            offset: 0,
            hasher: blake3::Hasher::new(),
        })
    }

    pub(crate) fn offer(&self, transfer_id: u64) -> TransferOffer {
        TransferOffer {
            transfer_id,
            size: self.size,
            name: self.name.clone(),
        }
    }

    pub(crate) fn size(&self) -> u64 {
        self.size
    }

    /// Read the next chunk of up to `chunk_size` bytes, `None` at EOF
    pub(crate) async fn next_chunk(
        &mut self,
        transfer_id: u64,
        chunk_size: usize,
    ) -> Result<Option<TransferChunk>> {
        let mut data = vec![0u8; chunk_size];
        let mut filled = 0;
        while filled < chunk_size {
            let n = self.file.read(&mut data[filled..]).await.map_err(io_failed)?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled == 0 {
            return Ok(None);
        }
        data.truncate(filled);
        self.hasher.update(&data);

        let chunk = TransferChunk {
            transfer_id,
            offset: self.offset,
            data,
        };
        self.offset += filled as u64;
        Ok(Some(chunk))
    }

    pub(crate) fn sent(&self) -> u64 {
        self.offset
    }

    pub(crate) fn digest(&self) -> [u8; 32] {
        *self.hasher.finalize().as_bytes()
    }
}

// ============================================================================
// Receiving side
// ============================================================================

/// File being written for an incoming transfer.
pub(crate) struct IncomingTransfer {
    file: File,
    path: PathBuf,
    size: u64,
    written: u64,
    hasher: blake3::Hasher,
}

impl IncomingTransfer {
    pub(crate) async fn create(path: PathBuf, size: u64) -> Result<Self> {
        let file = File::create(&path).await.map_err(io_failed)?;
        tracing::debug!("Receiving {} bytes into {}", size, path.display());
        Ok(Self {
            file,
            path,
            size,
            written: 0,
            hasher: blake3::Hasher::new(),
        })
    }

    pub(crate) async fn write_chunk(&mut self, chunk: &TransferChunk) -> Result<()> {
        if chunk.offset != self.written {
            return Err(DtmError::TransferFailed(format!(
                "chunk at offset {}, expected {}",
                chunk.offset, self.written
            )));
        }
        let end = self.written + chunk.data.len() as u64;
        if end > self.size {
            return Err(DtmError::TransferFailed(format!(
                "chunk ends at {end}, beyond announced size {}",
                self.size
            )));
        }

        self.file.write_all(&chunk.data).await.map_err(io_failed)?;
        self.hasher.update(&chunk.data);
        self.written = end;
        Ok(())
    }

    /// Flush and verify. On error the partial file is left for
    /// [`IncomingTransfer::discard`].
    pub(crate) async fn finish(&mut self, transfer_id: u64, digest: &[u8]) -> Result<FileReceived> {
        self.file.flush().await.map_err(io_failed)?;
        self.file.sync_all().await.map_err(io_failed)?;

        if self.written != self.size {
            return Err(DtmError::TransferFailed(format!(
                "received {} of {} bytes",
                self.written, self.size
            )));
        }
        if !dtm_crypto::constant_time::ct_eq(self.hasher.finalize().as_bytes(), digest) {
            return Err(DtmError::TransferFailed("digest mismatch".into()));
        }

        Ok(FileReceived {
            transfer_id,
            path: self.path.clone(),
            size: self.written,
        })
    }

    /// Remove the partial file
    pub(crate) async fn discard(self) {
        drop(self.file);
        if let Err(e) = tokio::fs::remove_file(&self.path).await {
            tracing::warn!("Failed to remove partial file {}: {}", self.path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offer_encoding() {
        let offer = TransferOffer {
            transfer_id: 42,
            size: 1 << 20,
            name: "archive.tar".into(),
        };
        assert_eq!(TransferOffer::decode(&offer.encode()).unwrap(), offer);

        let bad = WireWriter::new().u64(1).u64(2).bytes(&[0xFF, 0xFE]).finish();
        assert!(matches!(
            TransferOffer::decode(&bad),
            Err(DtmError::TransferFailed(_))
        ));
        assert!(TransferOffer::decode(&[1, 2, 3]).is_err());
    }

    #[test]
    fn test_notice_detail() {
        let notice = TransferNotice::with_detail(3, b"disk full".to_vec());
        let decoded = TransferNotice::decode(&notice.encode()).unwrap();
        assert_eq!(decoded.detail, b"disk full");
        assert!(TransferNotice::new(3).detail.is_empty());
    }

    #[test]
    fn test_default_destination_strips_directories() {
        let path = default_destination(9, "../../etc/shadow");
        assert_eq!(path, std::env::temp_dir().join("shadow"));
        let path = default_destination(9, "..");
        assert_eq!(path, std::env::temp_dir().join("dtm-transfer-9"));
    }

    #[tokio::test]
    async fn test_source_to_sink() {
        let dir = tempfile::tempdir().unwrap();
        let source_path = dir.path().join("source.bin");
        let content: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&source_path, &content).unwrap();

        let mut source = FileSource::open(&source_path).await.unwrap();
        assert_eq!(source.size(), content.len() as u64);
        assert_eq!(source.offer(1).name, "source.bin");

        let sink_path = dir.path().join("sink.bin");
        let mut sink = IncomingTransfer::create(sink_path.clone(), source.size())
            .await
            .unwrap();
        let mut chunks = 0;
        while let Some(chunk) = source.next_chunk(1, 4096).await.unwrap() {
            sink.write_chunk(&chunk).await.unwrap();
            chunks += 1;
        }
        assert_eq!(chunks, 3);
        assert_eq!(source.sent(), content.len() as u64);

        let received = sink.finish(1, &source.digest()).await.unwrap();
        assert_eq!(received.size, content.len() as u64);
        assert_eq!(std::fs::read(&sink_path).unwrap(), content);
    }

    #[tokio::test]
    async fn test_sink_rejects_gaps_and_bad_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sink.bin");
        let mut sink = IncomingTransfer::create(path.clone(), 8).await.unwrap();

        let gap = TransferChunk {
            transfer_id: 1,
            offset: 4,
            data: vec![0; 4],
        };
        assert!(sink.write_chunk(&gap).await.is_err());

        let overflow = TransferChunk {
            transfer_id: 1,
            offset: 0,
            data: vec![0; 9],
        };
        assert!(sink.write_chunk(&overflow).await.is_err());

        let chunk = TransferChunk {
            transfer_id: 1,
            offset: 0,
            data: vec![7; 8],
        };
        sink.write_chunk(&chunk).await.unwrap();
        assert!(matches!(
            sink.finish(1, &[0u8; 32]).await,
            Err(DtmError::TransferFailed(_))
        ));

        sink.discard().await;
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_source_rejects_directory() {
        let dir = tempfile::tempdir().unwrap();
        assert!(FileSource::open(dir.path()).await.is_err());
    }
}
