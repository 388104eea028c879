//! Engine error types.

use chunkwise_protocol::{ErrorCode, UploadStatus};
use chunkwise_transfer::TransferError;

use crate::validator::ValidationIssue;

/// Errors reported by a [`StorageAdapter`](crate::storage::StorageAdapter).
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("network error: {0}")]
    Network(String),

    #[error("storage request timed out")]
    Timeout,

    #[error("server error {status}: {message}")]
    Server { status: u16, message: String },

    #[error("request rejected {status}: {message}")]
    Client { status: u16, message: String },

    #[error("storage quota exceeded")]
    QuotaExceeded,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("checksum mismatch for bytes {start}..{end}")]
    ChecksumMismatch { start: u64, end: u64 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("transfer error: {0}")]
    Transfer(#[from] TransferError),
}

impl StorageError {
    /// Maps an HTTP-style status code onto the error taxonomy.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            408 => Self::Timeout,
            413 | 507 => Self::QuotaExceeded,
            500..=599 => Self::Server { status, message },
            _ => Self::Client { status, message },
        }
    }
}

/// Errors reported by a [`QuotaService`](crate::quota::QuotaService).
#[derive(Debug, thiserror::Error)]
pub enum QuotaError {
    #[error("quota service unavailable: {0}")]
    Unavailable(String),

    #[error("unknown owner: {0}")]
    UnknownOwner(String),
}

/// Errors loading or validating an [`EngineConfig`](crate::config::EngineConfig).
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Errors produced by the upload engine.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("validation failed: {}", join_issues(.0))]
    Validation(Vec<ValidationIssue>),

    #[error("network error: {0}")]
    Network(String),

    #[error("operation timed out")]
    Timeout,

    #[error("server error {status}: {message}")]
    Server { status: u16, message: String },

    #[error("request rejected {status}: {message}")]
    Client { status: u16, message: String },

    #[error("storage quota exceeded")]
    QuotaExceeded,

    #[error("too many concurrent uploads (limit {limit})")]
    ConcurrencyLimitExceeded { limit: usize },

    #[error("upload session expired: {0}")]
    SessionExpired(String),

    #[error("upload session not found: {0}")]
    SessionNotFound(String),

    #[error("upload session {0} is already being uploaded")]
    SessionBusy(String),

    #[error("session {0} has no local source path to resume from")]
    SourceUnavailable(String),

    #[error("finalize failed: {0}")]
    Finalize(String),

    #[error("upload cancelled")]
    Cancelled,

    #[error("upload not found: {0}")]
    UploadNotFound(String),

    #[error("cannot {action} upload {upload_id} while {status:?}")]
    InvalidState {
        upload_id: String,
        action: &'static str,
        status: UploadStatus,
    },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("transfer error: {0}")]
    Transfer(#[from] TransferError),
}

impl UploadError {
    /// Returns `true` for transient failures worth another attempt.
    ///
    /// Network errors, timeouts, 502/503/504 and finalize failures are
    /// retryable. Everything else is fatal.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network(_) | Self::Timeout | Self::Finalize(_) => true,
            Self::Server { status, .. } => matches!(status, 502..=504),
            _ => false,
        }
    }

    /// Machine-readable code carried by `UploadError` events.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Validation(_) | Self::SourceUnavailable(_) => ErrorCode::Validation,
            Self::Network(_) => ErrorCode::Network,
            Self::Timeout => ErrorCode::Timeout,
            Self::Server { .. } => ErrorCode::Server,
            Self::Client { .. } => ErrorCode::Client,
            Self::QuotaExceeded => ErrorCode::QuotaExceeded,
            Self::ConcurrencyLimitExceeded { .. } => ErrorCode::ConcurrencyLimitExceeded,
            Self::SessionExpired(_) => ErrorCode::SessionExpired,
            Self::SessionNotFound(_) | Self::SessionBusy(_) => ErrorCode::SessionNotFound,
            Self::Finalize(_) => ErrorCode::Finalize,
            Self::Cancelled => ErrorCode::Cancelled,
            Self::Storage(_) => ErrorCode::Storage,
            Self::UploadNotFound(_) | Self::InvalidState { .. } | Self::Transfer(_) => {
                ErrorCode::Internal
            }
        }
    }
}

impl From<StorageError> for UploadError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Network(msg) => Self::Network(msg),
            StorageError::Timeout => Self::Timeout,
            StorageError::Server { status, message } => Self::Server { status, message },
            StorageError::Client { status, message } => Self::Client { status, message },
            StorageError::QuotaExceeded => Self::QuotaExceeded,
            other => Self::Storage(other.to_string()),
        }
    }
}

impl From<std::io::Error> for UploadError {
    fn from(err: std::io::Error) -> Self {
        Self::Transfer(TransferError::Io(err))
    }
}

fn join_issues(issues: &[ValidationIssue]) -> String {
    issues
        .iter()
        .map(|i| i.message.as_str())
        .collect::<Vec<_>>()
        .join("; ")
}
