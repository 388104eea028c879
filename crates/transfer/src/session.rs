use std::collections::BTreeSet;

use chrono::{DateTime, Duration, Utc};
use chunkwise_protocol::{FileIdentity, UploadContext};
use serde::{Deserialize, Serialize};

use crate::TransferError;
use crate::chunked::{ChunkInfo, ChunkStatus, plan_chunks};

/// Parameters for a brand-new resumable session.
#[derive(Debug, Clone)]
pub struct NewSession {
    pub session_id: String,
    pub upload_id: String,
    /// Backend session URL or upload token returned by `initiate_resumable`.
    pub storage_ref: String,
    /// Final object key on the backend.
    pub object_path: String,
    pub file: FileIdentity,
    pub context: UploadContext,
    /// Local path of the source, when it came from disk.
    pub source_path: Option<String>,
    pub chunk_size: u64,
}

/// Durable record of a chunked upload.
///
/// Holds no chunk payloads: only which chunk indices are done. Byte ranges
/// are recomputed with [`plan_chunks`] from `file.size` and `chunk_size`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadSession {
    pub session_id: String,
    pub upload_id: String,
    pub storage_ref: String,
    pub object_path: String,
    pub file: FileIdentity,
    pub context: UploadContext,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_path: Option<String>,
    pub total_chunks: u32,
    pub chunk_size: u64,
    pub completed_chunks: BTreeSet<u32>,
    pub uploaded_bytes: u64,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl UploadSession {
    /// Creates a session with no completed chunks.
    pub fn create(new: NewSession, now: DateTime<Utc>, ttl: Duration) -> Self {
        let total_chunks = plan_chunks(new.file.size, new.chunk_size).len() as u32;
        Self {
            session_id: new.session_id,
            upload_id: new.upload_id,
            storage_ref: new.storage_ref,
            object_path: new.object_path,
            file: new.file,
            context: new.context,
            source_path: new.source_path,
            total_chunks,
            chunk_size: new.chunk_size,
            completed_chunks: BTreeSet::new(),
            uploaded_bytes: 0,
            created_at: now,
            last_activity: now,
            expires_at: now + ttl,
        }
    }

    /// Records a finished chunk.
    ///
    /// Returns `false` if the chunk was already recorded; its bytes are not
    /// counted twice.
    pub fn mark_chunk_completed(
        &mut self,
        chunk: &ChunkInfo,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<bool, TransferError> {
        if chunk.index >= self.total_chunks {
            return Err(TransferError::ChunkOutOfRange {
                index: chunk.index,
                total: self.total_chunks,
            });
        }
        self.touch(now, ttl);
        if !self.completed_chunks.insert(chunk.index) {
            return Ok(false);
        }
        self.uploaded_bytes += chunk.size();
        Ok(true)
    }

    /// Refreshes activity and pushes expiry out to `now + ttl`.
    pub fn touch(&mut self, now: DateTime<Utc>, ttl: Duration) {
        self.last_activity = now;
        self.expires_at = now + ttl;
    }

    /// Returns `true` once `now` is past `expires_at`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// Returns `true` when every chunk is recorded.
    pub fn is_complete(&self) -> bool {
        self.completed_chunks.len() as u32 == self.total_chunks
    }

    /// Recomputes the full chunk plan, marking recorded chunks completed.
    pub fn plan(&self) -> Vec<ChunkInfo> {
        let mut chunks = plan_chunks(self.file.size, self.chunk_size);
        for chunk in &mut chunks {
            if self.completed_chunks.contains(&chunk.index) {
                chunk.status = ChunkStatus::Completed;
            }
        }
        chunks
    }

    /// Returns the chunks that still have to be sent.
    pub fn pending_chunks(&self) -> Vec<ChunkInfo> {
        self.plan()
            .into_iter()
            .filter(|c| c.status != ChunkStatus::Completed)
            .collect()
    }

    /// Checks a loaded record against its recomputed plan.
    pub fn verify(&self) -> Result<(), TransferError> {
        let plan = plan_chunks(self.file.size, self.chunk_size);
        if plan.len() as u32 != self.total_chunks {
            return Err(TransferError::SessionCorrupt(format!(
                "{}: expected {} chunks, record says {}",
                self.session_id,
                plan.len(),
                self.total_chunks
            )));
        }
        if let Some(&bad) = self
            .completed_chunks
            .iter()
            .find(|&&i| i >= self.total_chunks)
        {
            return Err(TransferError::SessionCorrupt(format!(
                "{}: completed chunk {bad} out of range",
                self.session_id
            )));
        }
        let expected: u64 = plan
            .iter()
            .filter(|c| self.completed_chunks.contains(&c.index))
            .map(ChunkInfo::size)
            .sum();
        if expected != self.uploaded_bytes {
            return Err(TransferError::SessionCorrupt(format!(
                "{}: uploaded bytes {} != {expected}",
                self.session_id, self.uploaded_bytes
            )));
        }
        Ok(())
    }

    /// Percentage of bytes recorded as uploaded.
    pub fn percentage(&self) -> f64 {
        if self.file.size == 0 {
            return 0.0;
        }
        self.uploaded_bytes as f64 / self.file.size as f64 * 100.0
    }
}
