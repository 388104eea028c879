//! Storage backend abstraction.
//!
//! The engine is agnostic to the concrete backend. An implementation only has
//! to open a resumable session, accept byte ranges for it, assemble the final
//! object and answer existence checks. Small files bypass the session and go
//! through [`StorageAdapter::put_object`].

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chunkwise_transfer::ByteRange;

use crate::error::StorageError;

/// Boxed future returned by the object-safe async traits of this crate.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Progress callback: bytes of the current transfer sent so far.
///
/// Calls may arrive out of order; consumers must ignore decreases.
pub type ProgressFn = Arc<dyn Fn(u64) + Send + Sync>;

/// What the engine asks the backend to prepare.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitiateRequest {
    /// Destination key of the final object.
    pub object_path: String,
    pub file_name: String,
    pub size: u64,
    pub content_type: String,
}

/// A backend resumable session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumableTarget {
    /// Session URL or upload token, passed back on every chunk.
    pub session_ref: String,
    /// Chunk size the backend prefers, if it has an opinion.
    pub chunk_size_hint: Option<u64>,
}

/// Contract every storage backend satisfies.
pub trait StorageAdapter: Send + Sync {
    /// Opens a resumable upload session.
    fn initiate_resumable<'a>(
        &'a self,
        request: &'a InitiateRequest,
    ) -> BoxFuture<'a, Result<ResumableTarget, StorageError>>;

    /// Writes one byte range of the session. `checksum` is the SHA-256 hex
    /// digest of `data`.
    fn put_chunk<'a>(
        &'a self,
        session_ref: &'a str,
        range: ByteRange,
        data: Vec<u8>,
        checksum: &'a str,
        on_progress: ProgressFn,
    ) -> BoxFuture<'a, Result<(), StorageError>>;

    /// Assembles the received ranges into the final object and returns its URL.
    fn finalize<'a>(&'a self, session_ref: &'a str) -> BoxFuture<'a, Result<String, StorageError>>;

    /// Reports whether an object exists at `object_path`.
    fn exists<'a>(&'a self, object_path: &'a str) -> BoxFuture<'a, Result<bool, StorageError>>;

    /// Uploads a whole object in one request and returns its URL.
    fn put_object<'a>(
        &'a self,
        request: &'a InitiateRequest,
        data: Vec<u8>,
        on_progress: ProgressFn,
    ) -> BoxFuture<'a, Result<String, StorageError>>;

    /// Discards a session and whatever partial data it holds.
    fn abort<'a>(&'a self, _session_ref: &'a str) -> BoxFuture<'a, Result<(), StorageError>> {
        Box::pin(async { Ok(()) })
    }

    /// `false` for backends where chunks land directly in the final object,
    /// so finalizing is only an existence check.
    fn assembles_chunks(&self) -> bool {
        true
    }

    /// Public URL of an object, for backends without an assemble step.
    fn object_url(&self, object_path: &str) -> String {
        object_path.to_string()
    }
}
