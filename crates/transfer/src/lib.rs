//! Chunk planning, resumable session records and progress tracking.
//!
//! Everything here is local: no network. The upload engine builds on these
//! pieces to drive transfers against a storage backend.

mod chunked;
pub mod clock;
mod progress;
mod session;
pub mod store;
pub mod sync;
mod validation;

pub use chunked::{ByteRange, ChunkInfo, ChunkStatus, UploadSource, checksum_bytes, plan_chunks};
pub use clock::{Clock, ManualClock, SystemClock};
pub use progress::{CompletionMetrics, ProgressSnapshot, ProgressTracker};
pub use session::{NewSession, UploadSession};
pub use store::{FileSessionStore, MemorySessionStore, SessionLookup, SessionStore};
pub use validation::{
    MAX_FILE_NAME_LEN, detect_content_type, file_extension, validate_file_name,
    validate_upload_path,
};

/// Default chunk size: 4 MiB.
pub const DEFAULT_CHUNK_SIZE: u64 = 4 * 1024 * 1024;

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("invalid file name: {0}")]
    InvalidFileName(String),

    #[error("byte range {start}..{end} outside source of {size} bytes")]
    RangeOutOfBounds { start: u64, end: u64, size: u64 },

    #[error("chunk {index} out of range (session has {total} chunks)")]
    ChunkOutOfRange { index: u32, total: u32 },

    #[error("corrupt session record: {0}")]
    SessionCorrupt(String),
}
