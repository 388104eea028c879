use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::{DEFAULT_CHUNK_SIZE, TransferError};

// ---------------------------------------------------------------------------
// Checksum helpers
// ---------------------------------------------------------------------------

/// Computes SHA-256 of `data` and returns the hex-encoded digest.
pub fn checksum_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

// ---------------------------------------------------------------------------
// Chunk plan
// ---------------------------------------------------------------------------

/// Transfer state of a single chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStatus {
    Pending,
    Uploading,
    Completed,
    Failed,
}

/// Half-open byte range `[start, end)` of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    /// Number of bytes covered by the range.
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }
}

/// One chunk of a planned upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkInfo {
    pub index: u32,
    pub range: ByteRange,
    pub status: ChunkStatus,
    pub retry_count: u32,
}

impl ChunkInfo {
    /// Size of this chunk in bytes.
    pub fn size(&self) -> u64 {
        self.range.len()
    }
}

/// Splits a file of `file_size` bytes into contiguous chunks.
///
/// Produces `ceil(file_size / chunk_size)` non-overlapping ranges covering
/// exactly `[0, file_size)`; an empty file yields no chunks. The result only
/// depends on the two inputs, so a resumed upload can recompute it instead of
/// persisting the ranges. If `chunk_size` is 0, [`DEFAULT_CHUNK_SIZE`] is used.
pub fn plan_chunks(file_size: u64, chunk_size: u64) -> Vec<ChunkInfo> {
    let chunk_size = if chunk_size == 0 {
        DEFAULT_CHUNK_SIZE
    } else {
        chunk_size
    };

    let count = file_size.div_ceil(chunk_size);
    (0..count)
        .map(|i| {
            let start = i * chunk_size;
            let end = (start + chunk_size).min(file_size);
            ChunkInfo {
                index: i as u32,
                range: ByteRange { start, end },
                status: ChunkStatus::Pending,
                retry_count: 0,
            }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Upload source
// ---------------------------------------------------------------------------

/// Where the bytes of an upload come from.
///
/// Chunk payloads are never persisted; they are re-sliced from the source
/// whenever a chunk is (re)sent.
#[derive(Debug, Clone)]
pub enum UploadSource {
    /// A file on local disk, read on demand.
    File(PathBuf),
    /// An in-memory blob.
    Memory(Arc<[u8]>),
}

impl UploadSource {
    /// Returns the source size in bytes.
    pub async fn size(&self) -> Result<u64, TransferError> {
        match self {
            Self::File(path) => Ok(tokio::fs::metadata(path).await?.len()),
            Self::Memory(data) => Ok(data.len() as u64),
        }
    }

    /// Returns the local path for file sources.
    pub fn path(&self) -> Option<&std::path::Path> {
        match self {
            Self::File(path) => Some(path),
            Self::Memory(_) => None,
        }
    }

    /// Reads the bytes of `range`.
    pub async fn read_range(&self, range: ByteRange) -> Result<Vec<u8>, TransferError> {
        match self {
            Self::File(path) => {
                let mut file = tokio::fs::File::open(path).await?;
                file.seek(SeekFrom::Start(range.start)).await?;
                let mut buf = vec![0u8; range.len() as usize];
                file.read_exact(&mut buf).await?;
                Ok(buf)
            }
            Self::Memory(data) => {
                let start = range.start as usize;
                let end = range.end as usize;
                data.get(start..end).map(<[u8]>::to_vec).ok_or_else(|| {
                    TransferError::RangeOutOfBounds {
                        start: range.start,
                        end: range.end,
                        size: data.len() as u64,
                    }
                })
            }
        }
    }

    /// Reads the whole source.
    pub async fn read_all(&self) -> Result<Vec<u8>, TransferError> {
        match self {
            Self::File(path) => Ok(tokio::fs::read(path).await?),
            Self::Memory(data) => Ok(data.to_vec()),
        }
    }
}

impl From<Vec<u8>> for UploadSource {
    fn from(data: Vec<u8>) -> Self {
        Self::Memory(data.into())
    }
}

impl From<PathBuf> for UploadSource {
    fn from(path: PathBuf) -> Self {
        Self::File(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn assert_covers(chunks: &[ChunkInfo], file_size: u64) {
        let mut expected_start = 0;
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.index as usize, i);
            assert_eq!(c.range.start, expected_start, "gap or overlap at chunk {i}");
            assert!(c.size() > 0);
            expected_start = c.range.end;
        }
        assert_eq!(expected_start, file_size);
        assert_eq!(chunks.iter().map(ChunkInfo::size).sum::<u64>(), file_size);
    }

    #[test]
    fn checksum_bytes_deterministic() {
        let c1 = checksum_bytes(b"hello world");
        let c2 = checksum_bytes(b"hello world");
        assert_eq!(c1, c2);
        assert_eq!(c1.len(), 64); // SHA-256 = 64 hex chars.
    }

    #[test]
    fn checksum_bytes_different_data() {
        assert_ne!(checksum_bytes(b"hello"), checksum_bytes(b"world"));
    }

    #[test]
    fn plan_covers_file_exactly() {
        for (file_size, chunk_size) in [(10, 4), (12, 4), (1, 4), (4, 4), (1_000_003, 65_536)] {
            let chunks = plan_chunks(file_size, chunk_size);
            assert_eq!(chunks.len() as u64, file_size.div_ceil(chunk_size));
            assert_covers(&chunks, file_size);
        }
    }

    #[test]
    fn plan_last_chunk_is_remainder() {
        let chunks = plan_chunks(10, 4);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[2].range, ByteRange { start: 8, end: 10 });
        assert!(chunks.iter().all(|c| c.status == ChunkStatus::Pending));
    }

    #[test]
    fn plan_empty_file() {
        assert!(plan_chunks(0, 4).is_empty());
    }

    #[test]
    fn plan_is_idempotent() {
        let a = plan_chunks(123_456_789, 5 * 1024 * 1024);
        let b = plan_chunks(123_456_789, 5 * 1024 * 1024);
        assert_eq!(a, b);
    }

    #[test]
    fn plan_zero_chunk_size_uses_default() {
        let chunks = plan_chunks(DEFAULT_CHUNK_SIZE * 2 + 1, 0);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].size(), DEFAULT_CHUNK_SIZE);
    }

    #[tokio::test]
    async fn file_source_reads_ranges() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("src.bin");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(b"0123456789")
            .unwrap();

        let source = UploadSource::File(path);
        assert_eq!(source.size().await.unwrap(), 10);
        let data = source
            .read_range(ByteRange { start: 6, end: 10 })
            .await
            .unwrap();
        assert_eq!(&data, b"6789");
    }

    #[tokio::test]
    async fn file_source_short_read_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.bin");
        std::fs::write(&path, b"abc").unwrap();

        let source = UploadSource::File(path);
        let result = source.read_range(ByteRange { start: 0, end: 8 }).await;
        assert!(matches!(result, Err(TransferError::Io(_))));
    }

    #[tokio::test]
    async fn memory_source_reads_ranges() {
        let source = UploadSource::from(b"AABBCCDDEE".to_vec());
        let mut out = Vec::new();
        for chunk in plan_chunks(source.size().await.unwrap(), 4) {
            out.extend(source.read_range(chunk.range).await.unwrap());
        }
        assert_eq!(&out, b"AABBCCDDEE");
    }

    #[tokio::test]
    async fn memory_source_out_of_bounds() {
        let source = UploadSource::from(b"abc".to_vec());
        let result = source.read_range(ByteRange { start: 2, end: 5 }).await;
        assert!(matches!(
            result,
            Err(TransferError::RangeOutOfBounds { size: 3, .. })
        ));
    }
}
