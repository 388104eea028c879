//! Per-upload tracking state.

use std::path::PathBuf;
use std::sync::{Mutex, RwLock};

use chrono::{DateTime, Utc};
use chunkwise_protocol::{ErrorCode, FileIdentity, UploadContext, UploadProgress, UploadStatus};
use chunkwise_transfer::sync::{lock, read, write};
use chunkwise_transfer::{TransferError, UploadSource, detect_content_type};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

const FALLBACK_CONTENT_TYPE: &str = "application/octet-stream";

/// A file handed to the manager for upload.
#[derive(Debug, Clone)]
pub struct UploadFile {
    pub name: String,
    /// Explicit MIME type; detected from the extension when absent.
    pub content_type: Option<String>,
    pub source: UploadSource,
}

impl UploadFile {
    /// A file on disk, named after its last path component.
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            name,
            content_type: None,
            source: UploadSource::File(path),
        }
    }

    /// An in-memory blob.
    pub fn from_bytes(name: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            content_type: None,
            source: UploadSource::from(data.into()),
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// MIME type to record: explicit, detected, or octet-stream.
    pub fn resolved_content_type(&self) -> String {
        self.content_type
            .clone()
            .or_else(|| detect_content_type(&self.name).map(String::from))
            .unwrap_or_else(|| FALLBACK_CONTENT_TYPE.to_string())
    }

    /// Name, size and type. Reads the size from disk for file sources.
    pub async fn identity(&self) -> Result<FileIdentity, TransferError> {
        Ok(FileIdentity {
            name: self.name.clone(),
            size: self.source.size().await?,
            content_type: self.resolved_content_type(),
        })
    }
}

/// Per-request overrides of the configured validation limits.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UploadOptions {
    /// Plan-specific size limit.
    pub max_file_size: Option<u64>,
    /// Destination-specific MIME allow-list.
    pub allowed_mime_types: Option<Vec<String>>,
}

#[derive(Debug)]
struct HandleState {
    status: UploadStatus,
    cancel: CancellationToken,
    /// Latest percentage, 0-100.
    progress: f64,
    /// Last whole percentage an event went out for.
    emitted_percent: Option<u32>,
    identity: Option<FileIdentity>,
    session_id: Option<String>,
    started_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
    retry_count: u32,
    last_error: Option<(ErrorCode, String)>,
}

/// One logical file upload, from `upload()` until its terminal event.
///
/// Status changes are published on a watch channel so callers can await the
/// outcome. Once terminal, the handle ignores further progress and status
/// updates until it is explicitly reset for a retry.
#[derive(Debug)]
pub struct UploadHandle {
    id: String,
    file: UploadFile,
    context: UploadContext,
    options: UploadOptions,
    state: RwLock<HandleState>,
    /// Held while an event is handed to the sink, never together with
    /// `state` held.
    emitting: Mutex<()>,
    status_tx: watch::Sender<UploadStatus>,
}

impl UploadHandle {
    pub(crate) fn new(
        id: String,
        file: UploadFile,
        context: UploadContext,
        options: UploadOptions,
        now: DateTime<Utc>,
    ) -> Self {
        let (status_tx, _) = watch::channel(UploadStatus::Pending);
        Self {
            id,
            file,
            context,
            options,
            state: RwLock::new(HandleState {
                status: UploadStatus::Pending,
                cancel: CancellationToken::new(),
                progress: 0.0,
                emitted_percent: None,
                identity: None,
                session_id: None,
                started_at: now,
                ended_at: None,
                retry_count: 0,
                last_error: None,
            }),
            emitting: Mutex::new(()),
            status_tx,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn file(&self) -> &UploadFile {
        &self.file
    }

    pub fn file_name(&self) -> &str {
        &self.file.name
    }

    pub fn context(&self) -> &UploadContext {
        &self.context
    }

    pub fn options(&self) -> &UploadOptions {
        &self.options
    }

    pub fn status(&self) -> UploadStatus {
        read(&self.state).status
    }

    pub fn progress(&self) -> f64 {
        read(&self.state).progress
    }

    pub fn identity(&self) -> Option<FileIdentity> {
        read(&self.state).identity.clone()
    }

    pub fn session_id(&self) -> Option<String> {
        read(&self.state).session_id.clone()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        read(&self.state).started_at
    }

    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        read(&self.state).ended_at
    }

    pub fn retry_count(&self) -> u32 {
        read(&self.state).retry_count
    }

    pub fn last_error(&self) -> Option<(ErrorCode, String)> {
        read(&self.state).last_error.clone()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        read(&self.state).cancel.clone()
    }

    /// Subscribes to status changes.
    pub fn subscribe(&self) -> watch::Receiver<UploadStatus> {
        self.status_tx.subscribe()
    }

    /// Requests cancellation. Returns `false` if the upload already ended.
    pub(crate) fn cancel(&self) -> bool {
        let state = read(&self.state);
        if state.status.is_terminal() {
            return false;
        }
        state.cancel.cancel();
        true
    }

    /// Moves to a non-terminal status. Ignored once terminal.
    pub(crate) fn set_status(&self, status: UploadStatus) {
        let mut state = write(&self.state);
        if state.status.is_terminal() || state.status == status {
            return;
        }
        state.status = status;
        self.status_tx.send_replace(status);
    }

    pub(crate) fn set_identity(&self, identity: FileIdentity) {
        write(&self.state).identity = Some(identity);
    }

    pub(crate) fn set_session_id(&self, session_id: &str) {
        write(&self.state).session_id = Some(session_id.to_string());
    }

    pub(crate) fn note_retry(&self) {
        write(&self.state).retry_count += 1;
    }

    /// Records a new percentage and calls `emit` when the whole-number
    /// percentage advanced. Nothing happens once terminal or if `percent`
    /// is lower than what is already recorded.
    ///
    /// `emit` runs after the state lock is released, so the sink may query
    /// the handle. The emission lock keeps it ordered before any terminal
    /// event.
    pub(crate) fn report_progress(&self, percent: f64, emit: impl FnOnce(f64)) {
        let _emitting = lock(&self.emitting);
        let progress = {
            let mut state = write(&self.state);
            if state.status.is_terminal() || percent < state.progress {
                return;
            }
            state.progress = percent.min(100.0);
            let whole = state.progress.floor() as u32;
            if state.emitted_percent.is_some_and(|last| whole <= last) {
                return;
            }
            state.emitted_percent = Some(whole);
            state.progress
        };
        emit(progress);
    }

    /// Enters a terminal status and calls `emit` exactly once.
    ///
    /// Returns `false` (without calling `emit`) if already terminal.
    pub(crate) fn finish(
        &self,
        status: UploadStatus,
        error: Option<(ErrorCode, String)>,
        now: DateTime<Utc>,
        emit: impl FnOnce(),
    ) -> bool {
        let _emitting = lock(&self.emitting);
        {
            let mut state = write(&self.state);
            if state.status.is_terminal() {
                return false;
            }
            state.status = status;
            state.ended_at = Some(now);
            if status == UploadStatus::Completed {
                state.progress = 100.0;
            }
            state.last_error = error;
        }
        emit();
        self.status_tx.send_replace(status);
        true
    }

    /// Re-arms a failed handle for another attempt.
    pub(crate) fn reset_for_retry(&self, now: DateTime<Utc>) -> bool {
        let mut state = write(&self.state);
        if state.status != UploadStatus::Failed {
            return false;
        }
        state.status = UploadStatus::Pending;
        state.cancel = CancellationToken::new();
        state.progress = 0.0;
        state.emitted_percent = None;
        state.started_at = now;
        state.ended_at = None;
        state.retry_count += 1;
        state.last_error = None;
        self.status_tx.send_replace(UploadStatus::Pending);
        true
    }

    /// Wire view of this handle.
    pub fn to_progress(&self) -> UploadProgress {
        let state = read(&self.state);
        let total_bytes = state.identity.as_ref().map_or(0, |f| f.size);
        UploadProgress {
            upload_id: self.id.clone(),
            status: state.status,
            total_bytes,
            transferred_bytes: (total_bytes as f64 * state.progress / 100.0).round() as u64,
            error: state.last_error.as_ref().map(|(_, msg)| msg.clone()),
        }
    }
}
