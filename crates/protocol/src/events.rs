use serde::{Deserialize, Serialize};

/// Machine-readable error code attached to `UploadError` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    Validation,
    Network,
    Timeout,
    Server,
    Client,
    QuotaExceeded,
    ConcurrencyLimitExceeded,
    SessionExpired,
    SessionNotFound,
    Finalize,
    Cancelled,
    Storage,
    Internal,
}

impl ErrorCode {
    /// Returns the wire representation, e.g. `QUOTA_EXCEEDED`.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "VALIDATION",
            Self::Network => "NETWORK",
            Self::Timeout => "TIMEOUT",
            Self::Server => "SERVER",
            Self::Client => "CLIENT",
            Self::QuotaExceeded => "QUOTA_EXCEEDED",
            Self::ConcurrencyLimitExceeded => "CONCURRENCY_LIMIT_EXCEEDED",
            Self::SessionExpired => "SESSION_EXPIRED",
            Self::SessionNotFound => "SESSION_NOT_FOUND",
            Self::Finalize => "FINALIZE",
            Self::Cancelled => "CANCELLED",
            Self::Storage => "STORAGE",
            Self::Internal => "INTERNAL",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle event emitted by the upload engine.
///
/// Every upload produces exactly one `UploadStarted` and exactly one terminal
/// event (`UploadSuccess`, `UploadError` or `UploadCancelled`); no
/// `UploadProgress` follows the terminal event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum UploadEvent {
    #[serde(rename_all = "camelCase")]
    UploadStarted { upload_id: String, file_name: String },
    #[serde(rename_all = "camelCase")]
    UploadProgress {
        upload_id: String,
        file_name: String,
        progress: f64,
    },
    #[serde(rename_all = "camelCase")]
    UploadSuccess {
        upload_id: String,
        file_name: String,
        url: String,
    },
    #[serde(rename_all = "camelCase")]
    UploadError {
        upload_id: String,
        file_name: String,
        code: ErrorCode,
        error: String,
    },
    #[serde(rename_all = "camelCase")]
    UploadCancelled { upload_id: String, file_name: String },
}

impl UploadEvent {
    /// Returns the upload id the event belongs to.
    pub fn upload_id(&self) -> &str {
        match self {
            Self::UploadStarted { upload_id, .. }
            | Self::UploadProgress { upload_id, .. }
            | Self::UploadSuccess { upload_id, .. }
            | Self::UploadError { upload_id, .. }
            | Self::UploadCancelled { upload_id, .. } => upload_id,
        }
    }

    /// Returns `true` for success, error and cancelled events.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::UploadSuccess { .. } | Self::UploadError { .. } | Self::UploadCancelled { .. }
        )
    }
}
