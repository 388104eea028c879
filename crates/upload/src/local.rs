//! Filesystem storage backend.
//!
//! Resumable sessions live in a staging directory under the root:
//!
//! ```text
//! <root>/.staging/<session_ref>/meta.json    object path, size, content type
//! <root>/.staging/<session_ref>/data         bytes written at exact offsets
//! <root>/.staging/<session_ref>/parts/<s>-<e> one marker per received range
//! ```
//!
//! Finalizing checks that the markers cover the whole object, then renames
//! `data` into place.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use chunkwise_transfer::{ByteRange, checksum_bytes, validate_upload_path};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info};

use crate::error::StorageError;
use crate::storage::{BoxFuture, InitiateRequest, ProgressFn, ResumableTarget, StorageAdapter};

const STAGING_DIR: &str = ".staging";

/// Progress is reported after every slice of this many bytes.
const WRITE_SLICE: usize = 64 * 1024;

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StagedObject {
    object_path: String,
    size: u64,
    content_type: String,
}

/// Stores objects as files below a root directory.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
    base_url: String,
}

impl LocalStorage {
    /// Creates a backend rooted at `root`; URLs are `file://` paths.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let base_url = format!("file://{}", root.display());
        Self { root, base_url }
    }

    /// Overrides the prefix of returned object URLs.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn staging_dir(&self, session_ref: &str) -> Result<PathBuf, StorageError> {
        validate_upload_path(session_ref)?;
        if session_ref.contains('/') || session_ref.contains('\\') {
            return Err(StorageError::NotFound(format!("session {session_ref}")));
        }
        Ok(self.root.join(STAGING_DIR).join(session_ref))
    }

    fn object_file(&self, object_path: &str) -> Result<PathBuf, StorageError> {
        validate_upload_path(object_path)?;
        Ok(self.root.join(object_path))
    }

    fn url_for(&self, object_path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), object_path)
    }

    async fn read_meta(&self, dir: &Path, session_ref: &str) -> Result<StagedObject, StorageError> {
        match tokio::fs::read(dir.join("meta.json")).await {
            Ok(raw) => Ok(serde_json::from_slice(&raw)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(format!("session {session_ref}")))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn initiate(&self, request: &InitiateRequest) -> Result<ResumableTarget, StorageError> {
        validate_upload_path(&request.object_path)?;
        let session_ref = uuid::Uuid::new_v4().simple().to_string();
        let dir = self.staging_dir(&session_ref)?;
        tokio::fs::create_dir_all(dir.join("parts")).await?;

        let meta = StagedObject {
            object_path: request.object_path.clone(),
            size: request.size,
            content_type: request.content_type.clone(),
        };
        tokio::fs::write(dir.join("meta.json"), serde_json::to_vec_pretty(&meta)?).await?;
        tokio::fs::File::create(dir.join("data")).await?;

        debug!(session_ref = %session_ref, object = %request.object_path, "staging session opened");
        Ok(ResumableTarget {
            session_ref,
            chunk_size_hint: None,
        })
    }

    async fn write_range(
        &self,
        session_ref: &str,
        range: ByteRange,
        data: Vec<u8>,
        checksum: &str,
        on_progress: ProgressFn,
    ) -> Result<(), StorageError> {
        let dir = self.staging_dir(session_ref)?;
        let meta = self.read_meta(&dir, session_ref).await?;

        if range.end > meta.size || range.len() != data.len() as u64 {
            return Err(StorageError::Client {
                status: 416,
                message: format!(
                    "range {}..{} ({} bytes sent) does not fit object of {} bytes",
                    range.start,
                    range.end,
                    data.len(),
                    meta.size
                ),
            });
        }
        if !checksum.is_empty() && checksum_bytes(&data) != checksum {
            return Err(StorageError::ChecksumMismatch {
                start: range.start,
                end: range.end,
            });
        }

        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .truncate(false)
            .open(dir.join("data"))
            .await?;
        file.seek(SeekFrom::Start(range.start)).await?;

        let mut written = 0u64;
        for slice in data.chunks(WRITE_SLICE) {
            file.write_all(slice).await?;
            written += slice.len() as u64;
            on_progress(written);
        }
        file.flush().await?;

        let marker = dir
            .join("parts")
            .join(format!("{:020}-{:020}", range.start, range.end));
        tokio::fs::write(marker, b"").await?;
        Ok(())
    }

    async fn assemble(&self, session_ref: &str) -> Result<String, StorageError> {
        let dir = self.staging_dir(session_ref)?;
        let meta = self.read_meta(&dir, session_ref).await?;

        let mut ranges = Vec::new();
        let mut entries = tokio::fs::read_dir(dir.join("parts")).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            if let Some(range) = name.to_str().and_then(parse_marker) {
                ranges.push(range);
            }
        }
        let covered = covered_prefix(ranges);
        if covered < meta.size {
            return Err(StorageError::Client {
                status: 409,
                message: format!("only {covered} of {} bytes received", meta.size),
            });
        }

        let dest = self.object_file(&meta.object_path)?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(dir.join("data"), &dest).await?;
        tokio::fs::remove_dir_all(&dir).await?;

        info!(object = %meta.object_path, bytes = meta.size, "object assembled");
        Ok(self.url_for(&meta.object_path))
    }

    async fn write_object(
        &self,
        request: &InitiateRequest,
        data: Vec<u8>,
        on_progress: ProgressFn,
    ) -> Result<String, StorageError> {
        let dest = self.object_file(&request.object_path)?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::File::create(&dest).await?;
        let mut written = 0u64;
        for slice in data.chunks(WRITE_SLICE) {
            file.write_all(slice).await?;
            written += slice.len() as u64;
            on_progress(written);
        }
        file.flush().await?;
        Ok(self.url_for(&request.object_path))
    }

    async fn discard(&self, session_ref: &str) -> Result<(), StorageError> {
        let dir = self.staging_dir(session_ref)?;
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {
                debug!(session_ref, "staging session discarded");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn parse_marker(name: &str) -> Option<ByteRange> {
    let (start, end) = name.split_once('-')?;
    Some(ByteRange {
        start: start.parse().ok()?,
        end: end.parse().ok()?,
    })
}

/// Length of the contiguous prefix `[0, n)` covered by `ranges`.
fn covered_prefix(mut ranges: Vec<ByteRange>) -> u64 {
    ranges.sort_by_key(|r| r.start);
    let mut covered = 0;
    for range in ranges {
        if range.start > covered {
            break;
        }
        covered = covered.max(range.end);
    }
    covered
}

impl StorageAdapter for LocalStorage {
    fn initiate_resumable<'a>(
        &'a self,
        request: &'a InitiateRequest,
    ) -> BoxFuture<'a, Result<ResumableTarget, StorageError>> {
        Box::pin(self.initiate(request))
    }

    fn put_chunk<'a>(
        &'a self,
        session_ref: &'a str,
        range: ByteRange,
        data: Vec<u8>,
        checksum: &'a str,
        on_progress: ProgressFn,
    ) -> BoxFuture<'a, Result<(), StorageError>> {
        Box::pin(self.write_range(session_ref, range, data, checksum, on_progress))
    }

    fn finalize<'a>(&'a self, session_ref: &'a str) -> BoxFuture<'a, Result<String, StorageError>> {
        Box::pin(self.assemble(session_ref))
    }

    fn exists<'a>(&'a self, object_path: &'a str) -> BoxFuture<'a, Result<bool, StorageError>> {
        Box::pin(async move {
            let path = self.object_file(object_path)?;
            match tokio::fs::metadata(&path).await {
                Ok(meta) => Ok(meta.is_file()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
                Err(e) => Err(e.into()),
            }
        })
    }

    fn put_object<'a>(
        &'a self,
        request: &'a InitiateRequest,
        data: Vec<u8>,
        on_progress: ProgressFn,
    ) -> BoxFuture<'a, Result<String, StorageError>> {
        Box::pin(self.write_object(request, data, on_progress))
    }

    fn abort<'a>(&'a self, session_ref: &'a str) -> BoxFuture<'a, Result<(), StorageError>> {
        Box::pin(self.discard(session_ref))
    }

    fn object_url(&self, object_path: &str) -> String {
        self.url_for(object_path)
    }
}
