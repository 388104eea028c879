//! Single-chunk transfer.

use std::sync::Arc;
use std::time::Duration;

use chunkwise_transfer::{ChunkInfo, Clock, UploadSession, UploadSource, checksum_bytes};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::UploadError;
use crate::storage::{ProgressFn, StorageAdapter};

/// A session shared by the chunk tasks of one upload.
///
/// Holding the lock while saving serializes store writes per session.
pub type SharedSession = Arc<Mutex<UploadSession>>;

/// Sends one chunk's byte range to the backend.
pub struct ChunkUploader {
    storage: Arc<dyn StorageAdapter>,
    clock: Arc<dyn Clock>,
    timeout: Duration,
    session_ttl: chrono::Duration,
}

impl ChunkUploader {
    pub fn new(
        storage: Arc<dyn StorageAdapter>,
        clock: Arc<dyn Clock>,
        timeout: Duration,
        session_ttl: chrono::Duration,
    ) -> Self {
        Self {
            storage,
            clock,
            timeout,
            session_ttl,
        }
    }

    /// Uploads `chunk` and records it in `session`.
    ///
    /// The payload is re-sliced from `source` on every call. The transfer is
    /// abandoned as soon as `cancel` fires, and fails with
    /// [`UploadError::Timeout`] if it outlives the per-chunk timeout.
    /// Persisting the session is left to the caller.
    pub async fn upload_chunk(
        &self,
        chunk: &ChunkInfo,
        source: &UploadSource,
        session: &SharedSession,
        on_progress: ProgressFn,
        cancel: &CancellationToken,
    ) -> Result<(), UploadError> {
        if cancel.is_cancelled() {
            return Err(UploadError::Cancelled);
        }

        let data = source.read_range(chunk.range).await?;
        let checksum = checksum_bytes(&data);
        let storage_ref = session.lock().await.storage_ref.clone();

        debug!(chunk = chunk.index, bytes = data.len(), "sending chunk");
        let transfer =
            self.storage
                .put_chunk(&storage_ref, chunk.range, data, &checksum, on_progress);

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(UploadError::Cancelled),
            outcome = tokio::time::timeout(self.timeout, transfer) => match outcome {
                Err(_) => return Err(UploadError::Timeout),
                Ok(result) => result?,
            },
        }

        let mut session = session.lock().await;
        session.mark_chunk_completed(chunk, self.clock.now(), self.session_ttl)?;
        Ok(())
    }
}
