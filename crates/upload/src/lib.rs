//! Chunked, resumable upload engine.
//!
//! Large files are split into chunks and sent in bounded parallel batches
//! against a [`StorageAdapter`], with per-chunk retries and a persisted
//! session so an interrupted transfer can continue where it stopped. Small
//! files take a single request. Both paths share the same handle lifecycle
//! and emit the same [`UploadEvent`](chunkwise_protocol::UploadEvent)s.
//!
//! # Pipeline
//!
//! 1. **Admit**: reject immediately if the concurrency ceiling is reached
//! 2. **Validate**: size, extension, MIME type, file name, quota
//! 3. **Plan**: open a backend session and compute the chunk ranges, or load
//!    a persisted session and skip its completed chunks
//! 4. **Upload**: batches of `parallel_chunks`, session saved per chunk
//! 5. **Finalize**: assemble on the backend, then verify the object exists

pub mod config;
pub mod coordinator;
pub mod error;
pub mod finalizer;
pub mod handle;
pub mod local;
pub mod manager;
pub mod quota;
pub mod retry;
pub mod sink;
pub mod storage;
pub mod uploader;
pub mod validator;

#[cfg(test)]
mod testing;

pub use config::EngineConfig;
pub use coordinator::{
    CoordinatorOutcome, NoopObserver, SessionPlan, UploadCoordinator, UploadObserver,
};
pub use error::{ConfigError, QuotaError, StorageError, UploadError};
pub use handle::{UploadFile, UploadHandle, UploadOptions};
pub use local::LocalStorage;
pub use manager::{UploadManager, UploadManagerBuilder};
pub use quota::{FixedQuota, QuotaService, QuotaStatus};
pub use retry::RetryPolicy;
pub use sink::{ChannelSink, EventSink, NullSink};
pub use storage::{BoxFuture, InitiateRequest, ProgressFn, ResumableTarget, StorageAdapter};
pub use validator::{IssueKind, ValidationIssue, ValidationResult, ValidationRules, Validator};
